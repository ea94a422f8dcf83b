// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Policy re-evaluation worker
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dedicated `cpu_boostd` thread. Blocks until woken, then asks cpufreq to
//! re-evaluate every online domain while the state word or the battery
//! saver flag keeps changing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::boost::BoostDrv;
use crate::cpufreq::CpufreqOps;
use crate::cpu_list::format_cpu_list;
use crate::state::BoostFlags;
use crate::stats::BoostStats;

pub const WORKER_NAME: &str = "cpu_boostd";

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Nice value for the worker thread; 0 leaves it alone.
    pub nice: i32,
    /// CPUs the worker may run on; empty leaves affinity alone.
    pub cpus: Vec<usize>,
}

fn tune_current_thread(cfg: &WorkerConfig) {
    if cfg.nice != 0 {
        // SAFETY: plain syscalls on the calling thread's id.
        let ret = unsafe {
            let tid = libc::gettid() as libc::id_t;
            libc::setpriority(libc::PRIO_PROCESS, tid, cfg.nice)
        };
        if ret != 0 {
            warn!(
                "{}: failed to set nice {}: {}",
                WORKER_NAME,
                cfg.nice,
                std::io::Error::last_os_error()
            );
        }
    }

    if !cfg.cpus.is_empty() {
        let mut set = CpuSet::new();
        for &cpu in &cfg.cpus {
            if let Err(e) = set.set(cpu) {
                warn!("{}: failed to add CPU {} to affinity: {}", WORKER_NAME, cpu, e);
            }
        }
        match sched_setaffinity(Pid::from_raw(0), &set) {
            Ok(()) => debug!("{}: pinned to {}", WORKER_NAME, format_cpu_list(&cfg.cpus)),
            Err(e) => warn!("{}: failed to set affinity: {}", WORKER_NAME, e),
        }
    }
}

/// Re-evaluates every online domain once. Returns the number of domains
/// updated.
pub fn push_policies(drv: &BoostDrv, cpufreq: &dyn CpufreqOps) -> usize {
    let mut pushed = 0;
    for cpu in cpufreq.representative_cpus() {
        match cpufreq.update_policy(cpu) {
            Ok(()) => {
                BoostStats::bump(&drv.stats().policy_pushes);
                pushed += 1;
            }
            Err(e) => {
                BoostStats::bump(&drv.stats().domains_skipped);
                debug!("cpu{}: policy update skipped: {:#}", cpu, e);
            }
        }
    }
    pushed
}

fn worker_loop(drv: &BoostDrv, cpufreq: &dyn CpufreqOps, stop: &AtomicBool) {
    let rx = drv.wake_receiver();
    let mut old: Option<(BoostFlags, bool)> = None;

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let curr = (drv.state(), drv.battery_saver());
        if old != Some(curr) {
            old = Some(curr);
            push_policies(drv, cpufreq);
            continue;
        }

        if rx.recv().is_err() {
            break;
        }
    }
}

pub struct PolicyWorker {
    drv: Arc<BoostDrv>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PolicyWorker {
    /// The worker pushes once on start so the initial state is applied.
    pub fn spawn(drv: Arc<BoostDrv>, cpufreq: Arc<dyn CpufreqOps>, cfg: WorkerConfig) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let drv = Arc::clone(&drv);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(WORKER_NAME.into())
                .spawn(move || {
                    tune_current_thread(&cfg);
                    worker_loop(&drv, cpufreq.as_ref(), &stop);
                })
                .with_context(|| format!("failed to spawn {}", WORKER_NAME))?
        };
        info!("{} started", WORKER_NAME);

        Ok(Self {
            drv,
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        self.drv.wake_up();
        if handle.join().is_err() {
            warn!("{} panicked", WORKER_NAME);
        }
    }
}

impl Drop for PolicyWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
