// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Lock-free boost state register
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Shared state touched by every producer context.
//!
//! Each field is a single atomic word and is updated independently of the
//! others. There is no lock spanning more than one field: producers run on
//! input-latency sensitive paths and must never wait on each other.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BoostFlags: u32 {
        /// Display is off. New input boosts are suppressed.
        const SCREEN_OFF  = 1 << 0;
        /// An input-triggered boost window is active.
        const INPUT_BOOST = 1 << 1;
        /// An explicit maximum-frequency boost window is active.
        const MAX_BOOST   = 1 << 2;
        /// The current max boost window was started by a display wake.
        /// Only ever set together with MAX_BOOST and cleared with it.
        const WAKE_BOOST  = 1 << 3;
    }
}

impl fmt::Display for BoostFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "idle");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// Atomic bitmask of [`BoostFlags`].
#[derive(Debug, Default)]
pub struct BoostState {
    bits: AtomicU32,
}

impl BoostState {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn set(&self, flags: BoostFlags) {
        self.bits.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn clear(&self, flags: BoostFlags) {
        self.bits.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// True if every bit in `flags` is set.
    #[inline(always)]
    pub fn test(&self, flags: BoostFlags) -> bool {
        self.load().contains(flags)
    }

    #[inline(always)]
    pub fn load(&self) -> BoostFlags {
        BoostFlags::from_bits_retain(self.bits.load(Ordering::Acquire))
    }
}

/// Tick at which the current max boost window ends.
///
/// Writers may only move the deadline forward; a shorter request loses the
/// compare-and-swap race by construction and is dropped.
#[derive(Debug, Default)]
pub struct MaxBoostExpiry {
    expires: AtomicU64,
}

impl MaxBoostExpiry {
    pub const fn new() -> Self {
        Self {
            expires: AtomicU64::new(0),
        }
    }

    pub fn load(&self) -> u64 {
        self.expires.load(Ordering::Acquire)
    }

    /// Stores `candidate` unless a later deadline is already in effect.
    /// Returns whether the store happened.
    pub fn extend(&self, candidate: u64) -> bool {
        let mut curr = self.expires.load(Ordering::Acquire);
        loop {
            if curr > candidate {
                return false;
            }
            match self.expires.compare_exchange_weak(
                curr,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => curr = actual,
            }
        }
    }
}

const NEVER: u64 = u64::MAX;

/// Tick of the most recent input event. Last write wins.
#[derive(Debug)]
pub struct LastInput {
    at: AtomicU64,
}

impl LastInput {
    pub const fn new() -> Self {
        Self {
            at: AtomicU64::new(NEVER),
        }
    }

    #[inline(always)]
    pub fn record(&self, now: u64) {
        self.at.store(now, Ordering::Relaxed);
    }

    pub fn get(&self) -> Option<u64> {
        match self.at.load(Ordering::Relaxed) {
            NEVER => None,
            at => Some(at),
        }
    }

    /// True if the last input happened less than `window` ticks before `now`.
    pub fn within(&self, now: u64, window: u64) -> bool {
        match self.get() {
            Some(at) => now < at.saturating_add(window),
            None => false,
        }
    }
}

impl Default for LastInput {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bits_are_independent() {
        let state = BoostState::new();
        state.set(BoostFlags::INPUT_BOOST);
        state.set(BoostFlags::SCREEN_OFF);
        state.clear(BoostFlags::INPUT_BOOST);
        assert!(state.test(BoostFlags::SCREEN_OFF));
        assert!(!state.test(BoostFlags::INPUT_BOOST));
        assert_eq!(state.load(), BoostFlags::SCREEN_OFF);
    }

    #[test]
    fn concurrent_bit_flips_do_not_lose_updates() {
        let state = Arc::new(BoostState::new());
        let handles: Vec<_> = [BoostFlags::INPUT_BOOST, BoostFlags::MAX_BOOST]
            .into_iter()
            .map(|flag| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        state.set(flag);
                        state.clear(flag);
                    }
                    state.set(flag);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            state.load(),
            BoostFlags::INPUT_BOOST | BoostFlags::MAX_BOOST
        );
    }

    #[test]
    fn expiry_only_moves_forward() {
        let expiry = MaxBoostExpiry::new();
        assert!(expiry.extend(200));
        assert!(!expiry.extend(150));
        assert_eq!(expiry.load(), 200);
        assert!(expiry.extend(200));
        assert!(expiry.extend(300));
        assert_eq!(expiry.load(), 300);
    }

    #[test]
    fn concurrent_extends_keep_the_latest_deadline() {
        let expiry = Arc::new(MaxBoostExpiry::new());
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let expiry = Arc::clone(&expiry);
                thread::spawn(move || {
                    for j in 0..1000u64 {
                        expiry.extend(j * 8 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(expiry.load(), 999 * 8 + 7);
    }

    #[test]
    fn last_input_window() {
        let last = LastInput::new();
        assert!(!last.within(0, 1000));
        last.record(100);
        assert!(last.within(150, 100));
        assert!(!last.within(200, 100));
    }

    #[test]
    fn flags_display() {
        assert_eq!(BoostFlags::empty().to_string(), "idle");
        assert_eq!(
            (BoostFlags::MAX_BOOST | BoostFlags::WAKE_BOOST).to_string(),
            "MAX_BOOST|WAKE_BOOST"
        );
    }
}
