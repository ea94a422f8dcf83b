// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Input and display-wake driven CPU frequency floor booster
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Raises the minimum frequency of every cpufreq domain for a short window
//! after user input, to the domain maximum after the display wakes or on
//! explicit request, and drops to an idle floor while the display is off.

pub mod battery;
pub mod boost;
pub mod clock;
pub mod cpu_list;
pub mod cpufreq;
pub mod display;
pub mod driver;
pub mod input;
pub mod policy;
pub mod state;
pub mod stats;
pub mod timer;
pub mod tunables;
pub mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam::channel::RecvTimeoutError;
use log::{info, warn};
use scx_stats::prelude::StatsServer;

use crate::battery::{BatterySaver, PowerProfilesSaver, StaticSaver};
use crate::boost::BoostDrv;
use crate::clock::MonotonicClock;
use crate::cpu_list::parse_cpu_list;
use crate::cpufreq::{ClassOverrides, ClusterClass, CpufreqOps, SysfsCpufreq, CPUFREQ_SYSFS_ROOT};
use crate::display::{BacklightWatcher, DisplayOps, NoDisplay, BACKLIGHT_SYSFS_ROOT};
use crate::driver::{Driver, Subsystems};
use crate::input::{EvdevInput, INPUT_DEV_DIR};
use crate::tunables::{TunableValues, Tunables, TunablesUpdate, TunablesWatcher};
use crate::worker::WorkerConfig;

pub const DRIVER_NAME: &str = "scx_inputboost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BatterySaverSource {
    /// Never in battery saver.
    Off,
    /// Always in battery saver: floors stay at the hardware minimum.
    On,
    /// Follow power-profiles-daemon; the power-saver profile counts as on.
    PowerProfiles,
}

/// CPU frequency floor booster.
///
/// Boosts the minimum frequency of every cpufreq domain while the user is
/// interacting with the system and after the display wakes up.
/// Frequencies are in kHz, durations in milliseconds.
#[derive(Debug, Clone, Parser)]
#[command(name = "scx_inputboost", version, about)]
pub struct Args {
    /// Floor for the low-power cluster while input boost is active.
    #[clap(long, default_value = "1000000")]
    pub input_boost_freq_lp: u32,

    /// Floor for the performance cluster while input boost is active.
    #[clap(long, default_value = "1000000")]
    pub input_boost_freq_hp: u32,

    /// Floor for the low-power cluster during max and wake boosts.
    /// Clipped to the domain maximum.
    #[clap(long, default_value_t = u32::MAX)]
    pub max_boost_freq_lp: u32,

    /// Floor for the performance cluster during max and wake boosts.
    #[clap(long, default_value_t = u32::MAX)]
    pub max_boost_freq_hp: u32,

    /// Floor for the low-power cluster while the display is off.
    #[clap(long, default_value = "0")]
    pub idle_min_freq_lp: u32,

    /// Floor for the performance cluster while the display is off.
    #[clap(long, default_value = "0")]
    pub idle_min_freq_hp: u32,

    /// Floor for the low-power cluster when no boost is active. Also a
    /// lower bound for the input boost floor.
    #[clap(long, default_value = "0")]
    pub remove_input_boost_freq_lp: u32,

    /// Floor for the performance cluster when no boost is active.
    #[clap(long, default_value = "0")]
    pub remove_input_boost_freq_hp: u32,

    /// Input boost window. 0 disables input boost.
    #[clap(long, default_value = "100")]
    pub input_boost_duration_ms: u32,

    /// Max boost window after the display wakes up. 0 disables wake boost.
    #[clap(long, default_value = "1000")]
    pub wake_boost_duration_ms: u32,

    /// CPUs of the low-power cluster (e.g. 0-3). Domains containing any of
    /// them are low-power, all others performance.
    #[clap(long)]
    pub lp_cpus: Option<String>,

    /// CPUs of the performance cluster. Ignored when --lp-cpus is given.
    #[clap(long)]
    pub perf_cpus: Option<String>,

    /// Root of the cpufreq sysfs hierarchy.
    #[clap(long, default_value = CPUFREQ_SYSFS_ROOT)]
    pub cpufreq_root: PathBuf,

    /// Directory holding the evdev event nodes.
    #[clap(long, default_value = INPUT_DEV_DIR)]
    pub input_dir: PathBuf,

    /// Backlight device whose bl_power tracks the display. By default the
    /// first one found; without any backlight, wake and idle handling is
    /// disabled.
    #[clap(long)]
    pub backlight: Option<String>,

    /// Root of the backlight class directory.
    #[clap(long, default_value = BACKLIGHT_SYSFS_ROOT)]
    pub backlight_root: PathBuf,

    /// How often bl_power is sampled.
    #[clap(long, default_value = "100")]
    pub display_poll_ms: u64,

    /// Battery saver source.
    #[clap(long, value_enum, default_value_t = BatterySaverSource::Off)]
    pub battery_saver: BatterySaverSource,

    /// How often power-profiles-daemon is queried, in seconds.
    #[clap(long, default_value = "5")]
    pub battery_poll_secs: u64,

    /// JSON file with tunable overrides. Applied at start and whenever it
    /// changes.
    #[clap(long)]
    pub tunables: Option<PathBuf>,

    /// Print boost statistics every N seconds.
    #[clap(long)]
    pub stats: Option<f64>,

    /// Only monitor a running instance, printing its statistics every N
    /// seconds. The booster itself is not started.
    #[clap(long)]
    pub monitor: Option<f64>,

    /// Nice value of the policy worker thread.
    #[clap(long, default_value = "-3", allow_hyphen_values = true)]
    pub worker_nice: i32,

    /// Enable verbose output. Repeat for more.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn tunable_values(&self) -> TunableValues {
        TunableValues {
            input_boost_freq_lp: self.input_boost_freq_lp,
            input_boost_freq_hp: self.input_boost_freq_hp,
            max_boost_freq_lp: self.max_boost_freq_lp,
            max_boost_freq_hp: self.max_boost_freq_hp,
            idle_min_freq_lp: self.idle_min_freq_lp,
            idle_min_freq_hp: self.idle_min_freq_hp,
            remove_input_boost_freq_lp: self.remove_input_boost_freq_lp,
            remove_input_boost_freq_hp: self.remove_input_boost_freq_hp,
            input_boost_duration_ms: self.input_boost_duration_ms,
            wake_boost_duration_ms: self.wake_boost_duration_ms,
        }
    }

    pub fn class_overrides(&self) -> Result<ClassOverrides> {
        let parse = |opt: &Option<String>, what: &str| -> Result<Option<Vec<usize>>> {
            opt.as_deref()
                .map(|s| parse_cpu_list(s).map_err(|e| anyhow!("invalid {}: {}", what, e)))
                .transpose()
        };
        Ok(ClassOverrides {
            lp_cpus: parse(&self.lp_cpus, "--lp-cpus")?,
            perf_cpus: parse(&self.perf_cpus, "--perf-cpus")?,
        })
    }
}

fn battery_backend(args: &Args) -> Result<Arc<dyn BatterySaver>> {
    let saver: Arc<dyn BatterySaver> = match args.battery_saver {
        BatterySaverSource::Off => Arc::new(StaticSaver::new(false)),
        BatterySaverSource::On => Arc::new(StaticSaver::new(true)),
        BatterySaverSource::PowerProfiles => {
            let poll = Duration::from_secs(args.battery_poll_secs.max(1));
            Arc::new(PowerProfilesSaver::new(poll)?)
        }
    };
    Ok(saver)
}

fn display_backend(args: &Args) -> Result<Arc<dyn DisplayOps>> {
    let poll = Duration::from_millis(args.display_poll_ms.max(1));
    let ops: Arc<dyn DisplayOps> = match display::discover(&args.backlight_root, args.backlight.as_deref()) {
        Ok(path) => Arc::new(BacklightWatcher::new(path, poll)),
        Err(e) if args.backlight.is_some() => return Err(e),
        Err(e) => {
            warn!("{:#}, display wake and idle handling disabled", e);
            Arc::new(NoDisplay::default())
        }
    };
    Ok(ops)
}

pub fn run(args: Args) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Some(intv) = args.monitor {
        let _ = spawn_monitor(intv, shutdown).join();
        return Ok(());
    }

    let tunables = Arc::new(Tunables::new(args.tunable_values()));
    let _watcher = match &args.tunables {
        Some(path) => {
            if path.exists() {
                let changed = tunables.apply(&TunablesUpdate::load(path)?);
                info!("Applied {} ({} value(s) changed)", path.display(), changed);
            }
            Some(TunablesWatcher::spawn(path.clone(), Arc::clone(&tunables))?)
        }
        None => None,
    };

    let cpufreq = Arc::new(SysfsCpufreq::probe(&args.cpufreq_root, &args.class_overrides()?)?);
    let worker_cfg = WorkerConfig {
        nice: args.worker_nice,
        cpus: cpufreq.cpus_of(ClusterClass::Performance),
    };

    let drv = Arc::new(BoostDrv::new(
        Arc::new(MonotonicClock::new()),
        tunables,
        battery_backend(&args)?,
    ));
    let subsys = Subsystems {
        cpufreq,
        input: Arc::new(EvdevInput::new(args.input_dir.clone())),
        display: display_backend(&args)?,
    };

    let stats_server = StatsServer::new(stats::server_data())
        .launch()
        .context("Failed to launch stats server")?;
    let mut driver = Driver::start(Arc::clone(&drv), subsys, worker_cfg)?;

    let stats_thread = args.stats.map(|intv| spawn_monitor(intv, shutdown.clone()));

    let (res_tx, req_rx) = stats_server.channels();
    while !shutdown.load(Ordering::Relaxed) {
        match req_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => {
                if res_tx.send(drv.metrics()).is_err() {
                    warn!("Stats server dropped a response");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    info!("Shutting down");
    driver.stop();
    if let Some(handle) = stats_thread {
        let _ = handle.join();
    }
    Ok(())
}

fn spawn_monitor(intv: f64, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let intv = Duration::from_secs_f64(intv.max(0.1));
        if let Err(e) = stats::monitor(intv, None, shutdown) {
            warn!("stats monitor thread finished because of an error {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tunable_defaults() {
        let args = Args::parse_from([DRIVER_NAME]);
        assert_eq!(args.tunable_values(), TunableValues::default());
        assert_eq!(args.battery_saver, BatterySaverSource::Off);
        assert_eq!(args.worker_nice, -3);
        assert_eq!(args.stats, None);
        assert_eq!(args.monitor, None);
    }

    #[test]
    fn monitor_mode_interval() {
        let args = Args::parse_from([DRIVER_NAME, "--monitor", "2.5"]);
        assert_eq!(args.monitor, Some(2.5));
    }

    #[test]
    fn tunables_from_command_line() {
        let args = Args::parse_from([
            DRIVER_NAME,
            "--input-boost-freq-hp",
            "1400000",
            "--wake-boost-duration-ms",
            "0",
            "--worker-nice",
            "-10",
            "--battery-saver",
            "power-profiles",
            "-vv",
        ]);
        let v = args.tunable_values();
        assert_eq!(v.input_boost_freq_hp, 1_400_000);
        assert_eq!(v.wake_boost_duration_ms, 0);
        assert_eq!(args.worker_nice, -10);
        assert_eq!(args.battery_saver, BatterySaverSource::PowerProfiles);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn cluster_overrides_are_parsed() {
        let args = Args::parse_from([DRIVER_NAME, "--lp-cpus", "0-3"]);
        let o = args.class_overrides().unwrap();
        assert_eq!(o.lp_cpus, Some(vec![0, 1, 2, 3]));
        assert_eq!(o.perf_cpus, None);

        let args = Args::parse_from([DRIVER_NAME, "--perf-cpus", "4-x"]);
        assert!(args.class_overrides().is_err());
    }

    #[test]
    fn missing_backlight_falls_back_unless_named() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap();
        let args = Args::parse_from([DRIVER_NAME, "--backlight-root", root]);
        assert!(display_backend(&args).is_ok());

        let args = Args::parse_from([DRIVER_NAME, "--backlight-root", root, "--backlight", "panel0"]);
        assert!(display_backend(&args).is_err());
    }
}
