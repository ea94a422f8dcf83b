// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Frequency floor decision
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Arc;

use crate::boost::BoostDrv;
use crate::cpufreq::{Policy, PolicyNotifier};
use crate::state::BoostFlags;
use crate::tunables::Tunables;

/// Input boost floor. The removed floor is a lower bound for it.
#[inline]
pub fn input_boost_freq(policy: &Policy, tun: &Tunables) -> u32 {
    let freq = tun
        .input_boost_freq
        .get(policy.class)
        .max(tun.remove_input_boost_freq.get(policy.class));
    freq.min(policy.max)
}

#[inline]
pub fn max_boost_freq(policy: &Policy, tun: &Tunables) -> u32 {
    tun.max_boost_freq.get(policy.class).min(policy.max)
}

/// Floor with no boost applied: the idle minimum with the screen off,
/// the removed floor otherwise.
#[inline]
pub fn unboosted_freq(policy: &Policy, screen_off: bool, tun: &Tunables) -> u32 {
    let freq = if screen_off {
        tun.idle_min_freq.get(policy.class)
    } else {
        tun.remove_input_boost_freq.get(policy.class)
    };
    freq.max(policy.cpuinfo_min_freq)
}

/// Floor for `policy`, highest priority rule first:
///
/// 1. battery saver: hardware minimum
/// 2. wake boost: max boost frequency
/// 3. screen off: idle minimum
/// 4. max boost: max boost frequency
/// 5. input boost: input boost frequency
/// 6. otherwise: removed floor
///
/// Clipping only ever uses `policy`'s own bounds.
#[inline]
pub fn min_freq(flags: BoostFlags, policy: &Policy, battery_saver: bool, tun: &Tunables) -> u32 {
    if battery_saver {
        return policy.cpuinfo_min_freq;
    }

    // Boost to max on wake regardless of screen state.
    if flags.contains(BoostFlags::WAKE_BOOST) {
        return max_boost_freq(policy, tun);
    }

    if flags.contains(BoostFlags::SCREEN_OFF) {
        return unboosted_freq(policy, true, tun);
    }

    if flags.contains(BoostFlags::MAX_BOOST) {
        return max_boost_freq(policy, tun);
    }

    if flags.contains(BoostFlags::INPUT_BOOST) {
        return input_boost_freq(policy, tun);
    }

    unboosted_freq(policy, false, tun)
}

/// cpufreq side of the booster: sets the floor of every policy the
/// frequency subsystem re-evaluates.
pub struct BoostPolicyNotifier {
    drv: Arc<BoostDrv>,
}

impl BoostPolicyNotifier {
    pub fn new(drv: Arc<BoostDrv>) -> Self {
        Self { drv }
    }
}

impl PolicyNotifier for BoostPolicyNotifier {
    fn adjust(&self, policy: &mut Policy) {
        if self.drv.battery_saver() {
            policy.min = policy.cpuinfo_min_freq;
            return;
        }

        policy.min = self.drv.min_freq(policy);
    }
}
