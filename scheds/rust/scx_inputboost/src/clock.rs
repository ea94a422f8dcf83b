// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Monotonic tick source
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Millisecond tick source. All deadlines in the driver are expressed in
/// ticks of the clock the driver was built with.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Ticks are milliseconds elapsed since the clock was created.
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline(always)]
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to. Used to drive timers deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, ticks: u64) -> u64 {
        self.now.fetch_add(ticks, Ordering::AcqRel) + ticks
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
