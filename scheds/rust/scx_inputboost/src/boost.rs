// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Boost coordinator
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! [`BoostDrv`] is the single owned instance every adapter holds a handle
//! to. Producers (input, display, explicit callers) mutate its atomics and
//! re-arm its timers; the policy worker is woken through a single-slot
//! channel and re-reads the state word, so intermediate states coalesce.

use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};
use log::trace;

use crate::battery::BatterySaver;
use crate::clock::Clock;
use crate::cpufreq::Policy;
use crate::policy;
use crate::state::{BoostFlags, BoostState, LastInput, MaxBoostExpiry};
use crate::stats::{BoostStats, Metrics};
use crate::timer::DelayedWork;
use crate::tunables::Tunables;

pub struct BoostDrv {
    clock: Arc<dyn Clock>,
    tunables: Arc<Tunables>,
    battery: Arc<dyn BatterySaver>,
    state: BoostState,
    max_boost_expires: MaxBoostExpiry,
    last_input: LastInput,
    pub(crate) input_unboost: DelayedWork,
    pub(crate) max_unboost: DelayedWork,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    stats: BoostStats,
}

impl BoostDrv {
    pub fn new(clock: Arc<dyn Clock>, tunables: Arc<Tunables>, battery: Arc<dyn BatterySaver>) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        let saver_tx = wake_tx.clone();
        battery.on_change(Box::new(move || {
            let _ = saver_tx.try_send(());
        }));
        Self {
            clock,
            tunables,
            battery,
            state: BoostState::new(),
            max_boost_expires: MaxBoostExpiry::new(),
            last_input: LastInput::new(),
            input_unboost: DelayedWork::new("input_unboost"),
            max_unboost: DelayedWork::new("max_unboost"),
            wake_tx,
            wake_rx,
            stats: BoostStats::default(),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    #[inline(always)]
    pub fn state(&self) -> BoostFlags {
        self.state.load()
    }

    pub fn max_boost_expires(&self) -> u64 {
        self.max_boost_expires.load()
    }

    pub fn battery_saver(&self) -> bool {
        self.battery.is_on()
    }

    pub fn stats(&self) -> &BoostStats {
        &self.stats
    }

    /// Nudges the policy worker. Never blocks: if a wakeup is already
    /// queued the worker will re-read the state anyway.
    #[inline(always)]
    pub fn wake_up(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    /// Input boost. Suppressed while the screen is off or when the input
    /// boost duration is zero.
    pub fn kick_input(&self) {
        let now = self.clock.now();
        self.last_input.record(now);

        if self.state.test(BoostFlags::SCREEN_OFF) {
            BoostStats::bump(&self.stats.input_kicks_dropped);
            return;
        }

        let duration = self.tunables.input_boost_duration_ms();
        if duration == 0 {
            BoostStats::bump(&self.stats.input_kicks_dropped);
            return;
        }

        self.state.set(BoostFlags::INPUT_BOOST);
        BoostStats::bump(&self.stats.input_kicks);
        // A refresh of a pending window doesn't change what the worker
        // would compute, only a fresh boost needs a push.
        if !self.input_unboost.modify(now + u64::from(duration)) {
            self.wake_up();
        }
    }

    /// Maximum-frequency boost for `duration_ms`. Never shortens a boost
    /// that is already in effect.
    pub fn kick_max(&self, duration_ms: u32) {
        if self.state.test(BoostFlags::SCREEN_OFF) {
            BoostStats::bump(&self.stats.max_kicks_dropped);
            return;
        }

        self.boost_max(duration_ms, BoostFlags::empty());
    }

    /// Max boost on display wake. Only meaningful while leaving the
    /// screen-off posture.
    pub fn kick_wake(&self) {
        if !self.state.test(BoostFlags::SCREEN_OFF) {
            return;
        }

        let duration = self.tunables.wake_boost_duration_ms();
        if duration == 0 {
            return;
        }

        BoostStats::bump(&self.stats.wake_kicks);
        self.boost_max(duration, BoostFlags::WAKE_BOOST);
    }

    fn boost_max(&self, duration_ms: u32, extra: BoostFlags) {
        let expires = self.clock.now() + u64::from(duration_ms);

        if !self.max_boost_expires.extend(expires) {
            // A longer boost is in effect. A wake still marks that window
            // as wake-triggered; MAX_BOOST is already set for it.
            if !extra.is_empty() {
                self.state.set(BoostFlags::MAX_BOOST | extra);
            }
            BoostStats::bump(&self.stats.max_kicks_dropped);
            trace!("max boost until {} skipped, {} in effect", expires, self.max_boost_expires.load());
            return;
        }

        self.state.set(BoostFlags::MAX_BOOST | extra);
        BoostStats::bump(&self.stats.max_kicks);
        // The expiry only grows, so the timer may only grow with it even if
        // a racing winner's re-arm lands before ours.
        if !self.max_unboost.extend(expires) {
            self.wake_up();
        }
    }

    pub(crate) fn input_unboosted(&self) {
        self.state.clear(BoostFlags::INPUT_BOOST);
        BoostStats::bump(&self.stats.input_unboosts);
        self.wake_up();
    }

    pub(crate) fn max_unboosted(&self) {
        self.state.clear(BoostFlags::MAX_BOOST | BoostFlags::WAKE_BOOST);
        BoostStats::bump(&self.stats.max_unboosts);
        self.wake_up();
    }

    /// Runs every unboost whose deadline has passed at `now`. Timer threads
    /// do this on their own; this entry point drives the timers by hand.
    pub fn expire(&self, now: u64) -> bool {
        let mut fired = false;
        if self.input_unboost.claim_expired(now) {
            self.input_unboosted();
            fired = true;
        }
        if self.max_unboost.claim_expired(now) {
            self.max_unboosted();
            fired = true;
        }
        fired
    }

    /// Cancels both timers and runs the unboost of any that were pending.
    pub fn flush_timers(&self) {
        if self.input_unboost.cancel() {
            self.input_unboosted();
        }
        if self.max_unboost.cancel() {
            self.max_unboosted();
        }
    }

    /// Display is turning on: wake boost first, then leave the idle posture.
    pub fn display_on(&self) {
        self.kick_wake();
        self.state.clear(BoostFlags::SCREEN_OFF);
        // Neither step is guaranteed to signal: the wake boost may land on a
        // pending max timer or be disabled.
        self.wake_up();
    }

    /// Display is turning off: the idle floor always needs a push.
    pub fn display_off(&self) {
        self.state.set(BoostFlags::SCREEN_OFF);
        self.wake_up();
    }

    /// True if the last input event happened less than `timeout_ms` ago.
    pub fn within_input(&self, timeout_ms: u64) -> bool {
        self.last_input.within(self.clock.now(), timeout_ms)
    }

    /// Floor for `policy` given the current state. Lock-free; safe to call
    /// from any context at any time.
    #[inline]
    pub fn min_freq(&self, policy: &Policy) -> u32 {
        policy::min_freq(self.state.load(), policy, self.battery.is_on(), &self.tunables)
    }

    pub fn metrics(&self) -> Metrics {
        self.stats.snapshot(
            self.state.load(),
            self.battery.is_on(),
            self.input_unboost.deadline(),
            self.max_unboost.deadline(),
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::battery::StaticSaver;
    use crate::clock::ManualClock;
    use crate::tunables::TunableValues;

    pub struct Rig {
        pub clock: Arc<ManualClock>,
        pub saver: Arc<StaticSaver>,
        pub drv: Arc<BoostDrv>,
    }

    pub fn rig(values: TunableValues) -> Rig {
        let clock = Arc::new(ManualClock::new(0));
        let saver = Arc::new(StaticSaver::new(false));
        let drv = Arc::new(BoostDrv::new(
            clock.clone(),
            Arc::new(Tunables::new(values)),
            saver.clone(),
        ));
        Rig { clock, saver, drv }
    }
}
