// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Cancellable, reschedulable delayed work
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A delayed work item is a single atomic deadline plus the thread that
//! waits on it. Re-arming swaps the deadline and unparks the waiter, which
//! then re-reads the deadline before doing anything. Firing claims the
//! deadline with a compare-and-swap, so a re-arm that lands first makes the
//! stale fire lose, and a fire can only happen once per armed deadline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::clock::Clock;

// Deadlines are stored off by one so that tick 0 is a valid deadline.
const IDLE: u64 = 0;

#[inline(always)]
fn encode(deadline: u64) -> u64 {
    deadline.saturating_add(1)
}

#[derive(Debug)]
pub struct DelayedWork {
    name: &'static str,
    expires: AtomicU64,
    // Rebound by every timer thread that starts on this work.
    runner: Mutex<Option<Thread>>,
}

impl DelayedWork {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            expires: AtomicU64::new(IDLE),
            runner: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Arms the work for `deadline`, replacing any pending deadline.
    /// Returns true if the work was already pending (a refresh), false if
    /// it was idle and has now been queued.
    #[inline]
    pub fn modify(&self, deadline: u64) -> bool {
        let prev = self.expires.swap(encode(deadline), Ordering::AcqRel);
        self.wake();
        prev != IDLE
    }

    /// Like [`modify`](Self::modify), but a pending deadline only ever moves
    /// later. Concurrent callers end up armed for the latest deadline
    /// regardless of the order their updates land in.
    #[inline]
    pub fn extend(&self, deadline: u64) -> bool {
        let prev = self.expires.fetch_max(encode(deadline), Ordering::AcqRel);
        self.wake();
        prev != IDLE
    }

    /// Disarms the work. Returns true if it was pending.
    pub fn cancel(&self) -> bool {
        let prev = self.expires.swap(IDLE, Ordering::AcqRel);
        self.wake();
        prev != IDLE
    }

    pub fn is_pending(&self) -> bool {
        self.expires.load(Ordering::Acquire) != IDLE
    }

    pub fn deadline(&self) -> Option<u64> {
        match self.expires.load(Ordering::Acquire) {
            IDLE => None,
            raw => Some(raw - 1),
        }
    }

    /// Takes ownership of the pending deadline if it is due at `now`.
    /// Exactly one caller wins per armed deadline; a concurrent re-arm makes
    /// the claim fail and the new deadline stays pending.
    pub fn claim_expired(&self, now: u64) -> bool {
        let raw = self.expires.load(Ordering::Acquire);
        if raw == IDLE || now < raw - 1 {
            return false;
        }
        self.expires
            .compare_exchange(raw, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn bind_current(&self) {
        let Ok(mut runner) = self.runner.lock() else {
            warn!("{}: timer runner lock poisoned", self.name);
            return;
        };
        if runner.replace(thread::current()).is_some() {
            warn!("{}: timer was still bound to another thread", self.name);
        }
    }

    fn unbind_current(&self) {
        if let Ok(mut runner) = self.runner.lock() {
            if runner.as_ref().map(Thread::id) == Some(thread::current().id()) {
                *runner = None;
            }
        }
    }

    fn wake(&self) {
        if let Ok(runner) = self.runner.lock() {
            if let Some(runner) = runner.as_ref() {
                runner.unpark();
            }
        }
    }
}

/// Body of a timer thread: sleeps until the armed deadline, claims it and
/// runs `fire`. Returns once `stop` is observed.
pub fn run_timer(work: &DelayedWork, clock: &dyn Clock, stop: &AtomicBool, mut fire: impl FnMut()) {
    work.bind_current();
    while !stop.load(Ordering::Acquire) {
        let now = clock.now();
        match work.deadline() {
            // Unpark tokens are sticky, so a modify() between the load above
            // and the park below makes park return immediately.
            None => thread::park(),
            Some(at) if now < at => thread::park_timeout(Duration::from_millis(at - now)),
            Some(_) => {
                if work.claim_expired(now) {
                    fire();
                }
            }
        }
    }
    work.unbind_current();
    debug!("{}: timer thread exiting", work.name);
}

/// Owned timer thread for one [`DelayedWork`] embedded in `T`.
pub struct TimerThread {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimerThread {
    pub fn spawn<T, W, F>(owner: Arc<T>, clock: Arc<dyn Clock>, work: W, fire: F) -> Result<Self>
    where
        T: Send + Sync + 'static,
        W: Fn(&T) -> &DelayedWork + Send + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let name = work(&owner).name().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let owner = owner;
                run_timer(work(&owner), clock.as_ref(), &thread_stop, || fire(&owner));
            })
            .with_context(|| format!("failed to spawn {} timer thread", name))?;

        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("{} timer thread panicked", self.name);
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
