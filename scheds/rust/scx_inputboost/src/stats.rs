// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Boost counters, stats server and monitor
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use log::warn;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

use crate::state::BoostFlags;

/// Event counters. Updated with relaxed increments from any context.
#[derive(Debug, Default)]
pub struct BoostStats {
    pub input_kicks: AtomicU64,
    pub input_kicks_dropped: AtomicU64,
    pub max_kicks: AtomicU64,
    pub max_kicks_dropped: AtomicU64,
    pub wake_kicks: AtomicU64,
    pub input_unboosts: AtomicU64,
    pub max_unboosts: AtomicU64,
    pub policy_pushes: AtomicU64,
    pub domains_skipped: AtomicU64,
}

impl BoostStats {
    #[inline(always)]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        state: BoostFlags,
        battery_saver: bool,
        input_deadline: Option<u64>,
        max_deadline: Option<u64>,
    ) -> Metrics {
        let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Metrics {
            state: state.to_string(),
            battery_saver: battery_saver as u64,
            input_deadline: input_deadline.unwrap_or(0),
            max_deadline: max_deadline.unwrap_or(0),
            input_kicks: ld(&self.input_kicks),
            input_kicks_dropped: ld(&self.input_kicks_dropped),
            max_kicks: ld(&self.max_kicks),
            max_kicks_dropped: ld(&self.max_kicks_dropped),
            wake_kicks: ld(&self.wake_kicks),
            input_unboosts: ld(&self.input_unboosts),
            max_unboosts: ld(&self.max_unboosts),
            policy_pushes: ld(&self.policy_pushes),
            domains_skipped: ld(&self.domains_skipped),
        }
    }
}

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Boost bits at sample time")]
    pub state: String,
    #[stat(desc = "Battery saver active (0/1)")]
    pub battery_saver: u64,
    #[stat(desc = "Pending input unboost deadline in ticks (0 = idle)")]
    pub input_deadline: u64,
    #[stat(desc = "Pending max unboost deadline in ticks (0 = idle)")]
    pub max_deadline: u64,
    #[stat(desc = "Input kicks in interval")]
    pub input_kicks: u64,
    #[stat(desc = "Input kicks ignored in interval")]
    pub input_kicks_dropped: u64,
    #[stat(desc = "Max kicks in interval")]
    pub max_kicks: u64,
    #[stat(desc = "Max kicks ignored in interval")]
    pub max_kicks_dropped: u64,
    #[stat(desc = "Wake kicks in interval")]
    pub wake_kicks: u64,
    #[stat(desc = "Input unboosts in interval")]
    pub input_unboosts: u64,
    #[stat(desc = "Max unboosts in interval")]
    pub max_unboosts: u64,
    #[stat(desc = "Policy update passes in interval")]
    pub policy_pushes: u64,
    #[stat(desc = "Domains that failed to update in interval")]
    pub domains_skipped: u64,
}

impl Metrics {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::DRIVER_NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ state {:<28}  saver {}",
            self.state,
            if self.battery_saver != 0 { "on" } else { "off" }
        )?;
        writeln!(
            w,
            "│ input: kick {:>6}  drop {:>6}  unboost {:>6}  due {:>8}",
            self.input_kicks, self.input_kicks_dropped, self.input_unboosts, self.input_deadline
        )?;
        writeln!(
            w,
            "│ max:   kick {:>6}  drop {:>6}  unboost {:>6}  due {:>8}  wake {:>4}",
            self.max_kicks,
            self.max_kicks_dropped,
            self.max_unboosts,
            self.max_deadline,
            self.wake_kicks
        )?;
        writeln!(
            w,
            "│ policy: push {:>6}  skip {:>6}",
            self.policy_pushes, self.domains_skipped
        )?;
        writeln!(w, "└─")?;
        Ok(())
    }

    /// Counters become per-interval, state fields stay as sampled.
    pub fn delta(&self, prev: &Self) -> Self {
        Self {
            state: self.state.clone(),
            battery_saver: self.battery_saver,
            input_deadline: self.input_deadline,
            max_deadline: self.max_deadline,
            input_kicks: self.input_kicks.saturating_sub(prev.input_kicks),
            input_kicks_dropped: self.input_kicks_dropped.saturating_sub(prev.input_kicks_dropped),
            max_kicks: self.max_kicks.saturating_sub(prev.max_kicks),
            max_kicks_dropped: self.max_kicks_dropped.saturating_sub(prev.max_kicks_dropped),
            wake_kicks: self.wake_kicks.saturating_sub(prev.wake_kicks),
            input_unboosts: self.input_unboosts.saturating_sub(prev.input_unboosts),
            max_unboosts: self.max_unboosts.saturating_sub(prev.max_unboosts),
            policy_pushes: self.policy_pushes.saturating_sub(prev.policy_pushes),
            domains_skipped: self.domains_skipped.saturating_sub(prev.domains_skipped),
        }
    }
}

/// Each client gets its own baseline, so every reply covers the interval
/// since that client's previous request.
pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

fn sleep_unless(intv: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100).min(intv);
    let mut slept = Duration::ZERO;
    while slept < intv && !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(step);
        slept += step;
    }
}

/// Connects to the stats server at `path` (the default socket when `None`)
/// and prints one report per interval until `shutdown` is set. Reconnects
/// when the server goes away.
pub fn monitor(intv: Duration, path: Option<&str>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut retries = 0u32;

    while !shutdown.load(Ordering::Relaxed) {
        let mut client = StatsClient::new();
        if let Some(path) = path {
            client = client.set_path(path);
        }
        let mut client = match client.connect(None) {
            Ok(c) => {
                retries = 0;
                c
            }
            Err(e) => {
                if retries == 0 {
                    warn!("Stats server not reachable ({}), retrying", e);
                }
                retries += 1;
                sleep_unless(Duration::from_secs(1), &shutdown);
                continue;
            }
        };

        while !shutdown.load(Ordering::Relaxed) {
            let metrics = match client.request::<Metrics>("stats", vec![]) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Stats request failed ({}), reconnecting", e);
                    break;
                }
            };
            metrics.format(&mut std::io::stdout())?;
            sleep_unless(intv, &shutdown);
        }
    }

    Ok(())
}
