// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Runtime tunables
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Frequencies are in kHz, as exposed by cpufreq sysfs. Durations are in
//! milliseconds. Every value lives in its own atomic so a change is picked up
//! by the next decision or kick without coordinating with in-flight boosts.

use std::fs;
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use inotify::{Inotify, WatchMask};
use log::{debug, info, warn};
use nix::fcntl;
use serde::{Deserialize, Serialize};

use crate::cpufreq::ClusterClass;

/// One value per cluster class.
#[derive(Debug, Default)]
pub struct PerCluster {
    lp: AtomicU32,
    hp: AtomicU32,
}

impl PerCluster {
    pub const fn new(lp: u32, hp: u32) -> Self {
        Self {
            lp: AtomicU32::new(lp),
            hp: AtomicU32::new(hp),
        }
    }

    #[inline(always)]
    pub fn get(&self, class: ClusterClass) -> u32 {
        match class {
            ClusterClass::LowPower => self.lp.load(Ordering::Relaxed),
            ClusterClass::Performance => self.hp.load(Ordering::Relaxed),
        }
    }

    pub fn set(&self, class: ClusterClass, freq: u32) {
        match class {
            ClusterClass::LowPower => self.lp.store(freq, Ordering::Relaxed),
            ClusterClass::Performance => self.hp.store(freq, Ordering::Relaxed),
        }
    }
}

/// Plain copy of every tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunableValues {
    pub input_boost_freq_lp: u32,
    pub input_boost_freq_hp: u32,
    pub max_boost_freq_lp: u32,
    pub max_boost_freq_hp: u32,
    pub idle_min_freq_lp: u32,
    pub idle_min_freq_hp: u32,
    pub remove_input_boost_freq_lp: u32,
    pub remove_input_boost_freq_hp: u32,
    pub input_boost_duration_ms: u32,
    pub wake_boost_duration_ms: u32,
}

impl TunableValues {
    fn as_array(&self) -> [u32; 10] {
        [
            self.input_boost_freq_lp,
            self.input_boost_freq_hp,
            self.max_boost_freq_lp,
            self.max_boost_freq_hp,
            self.idle_min_freq_lp,
            self.idle_min_freq_hp,
            self.remove_input_boost_freq_lp,
            self.remove_input_boost_freq_hp,
            self.input_boost_duration_ms,
            self.wake_boost_duration_ms,
        ]
    }
}

impl Default for TunableValues {
    fn default() -> Self {
        Self {
            input_boost_freq_lp: 1_000_000,
            input_boost_freq_hp: 1_000_000,
            // Clipped to the policy max, so this means "as fast as allowed".
            max_boost_freq_lp: u32::MAX,
            max_boost_freq_hp: u32::MAX,
            idle_min_freq_lp: 0,
            idle_min_freq_hp: 0,
            remove_input_boost_freq_lp: 0,
            remove_input_boost_freq_hp: 0,
            input_boost_duration_ms: 100,
            wake_boost_duration_ms: 1000,
        }
    }
}

/// Partial update read from the tunables file. Absent keys are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunablesUpdate {
    pub input_boost_freq_lp: Option<u32>,
    pub input_boost_freq_hp: Option<u32>,
    pub max_boost_freq_lp: Option<u32>,
    pub max_boost_freq_hp: Option<u32>,
    pub idle_min_freq_lp: Option<u32>,
    pub idle_min_freq_hp: Option<u32>,
    pub remove_input_boost_freq_lp: Option<u32>,
    pub remove_input_boost_freq_hp: Option<u32>,
    pub input_boost_duration_ms: Option<u32>,
    pub wake_boost_duration_ms: Option<u32>,
}

impl TunablesUpdate {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid tunables JSON")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read tunables file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in {}", path.display()))
    }
}

#[derive(Debug)]
pub struct Tunables {
    pub input_boost_freq: PerCluster,
    pub max_boost_freq: PerCluster,
    pub idle_min_freq: PerCluster,
    pub remove_input_boost_freq: PerCluster,
    input_boost_duration_ms: AtomicU32,
    wake_boost_duration_ms: AtomicU32,
}

impl Tunables {
    pub fn new(v: TunableValues) -> Self {
        Self {
            input_boost_freq: PerCluster::new(v.input_boost_freq_lp, v.input_boost_freq_hp),
            max_boost_freq: PerCluster::new(v.max_boost_freq_lp, v.max_boost_freq_hp),
            idle_min_freq: PerCluster::new(v.idle_min_freq_lp, v.idle_min_freq_hp),
            remove_input_boost_freq: PerCluster::new(
                v.remove_input_boost_freq_lp,
                v.remove_input_boost_freq_hp,
            ),
            input_boost_duration_ms: AtomicU32::new(v.input_boost_duration_ms),
            wake_boost_duration_ms: AtomicU32::new(v.wake_boost_duration_ms),
        }
    }

    #[inline(always)]
    pub fn input_boost_duration_ms(&self) -> u32 {
        self.input_boost_duration_ms.load(Ordering::Relaxed)
    }

    pub fn set_input_boost_duration_ms(&self, ms: u32) {
        self.input_boost_duration_ms.store(ms, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn wake_boost_duration_ms(&self) -> u32 {
        self.wake_boost_duration_ms.load(Ordering::Relaxed)
    }

    pub fn set_wake_boost_duration_ms(&self, ms: u32) {
        self.wake_boost_duration_ms.store(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TunableValues {
        use ClusterClass::*;
        TunableValues {
            input_boost_freq_lp: self.input_boost_freq.get(LowPower),
            input_boost_freq_hp: self.input_boost_freq.get(Performance),
            max_boost_freq_lp: self.max_boost_freq.get(LowPower),
            max_boost_freq_hp: self.max_boost_freq.get(Performance),
            idle_min_freq_lp: self.idle_min_freq.get(LowPower),
            idle_min_freq_hp: self.idle_min_freq.get(Performance),
            remove_input_boost_freq_lp: self.remove_input_boost_freq.get(LowPower),
            remove_input_boost_freq_hp: self.remove_input_boost_freq.get(Performance),
            input_boost_duration_ms: self.input_boost_duration_ms(),
            wake_boost_duration_ms: self.wake_boost_duration_ms(),
        }
    }

    /// Applies every present field. Returns how many values changed.
    pub fn apply(&self, update: &TunablesUpdate) -> usize {
        use ClusterClass::*;
        let before = self.snapshot();
        let freqs = [
            (&self.input_boost_freq, LowPower, update.input_boost_freq_lp),
            (&self.input_boost_freq, Performance, update.input_boost_freq_hp),
            (&self.max_boost_freq, LowPower, update.max_boost_freq_lp),
            (&self.max_boost_freq, Performance, update.max_boost_freq_hp),
            (&self.idle_min_freq, LowPower, update.idle_min_freq_lp),
            (&self.idle_min_freq, Performance, update.idle_min_freq_hp),
            (&self.remove_input_boost_freq, LowPower, update.remove_input_boost_freq_lp),
            (&self.remove_input_boost_freq, Performance, update.remove_input_boost_freq_hp),
        ];
        for (field, class, value) in freqs {
            if let Some(freq) = value {
                field.set(class, freq);
            }
        }
        if let Some(ms) = update.input_boost_duration_ms {
            self.set_input_boost_duration_ms(ms);
        }
        if let Some(ms) = update.wake_boost_duration_ms {
            self.set_wake_boost_duration_ms(ms);
        }

        let after = self.snapshot();
        before
            .as_array()
            .iter()
            .zip(after.as_array())
            .filter(|(b, a)| *b != a)
            .count()
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new(TunableValues::default())
    }
}

/// Re-applies the tunables file whenever it is rewritten or replaced.
pub struct TunablesWatcher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TunablesWatcher {
    pub fn spawn(path: PathBuf, tunables: Arc<Tunables>) -> Result<Self> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let inotify = Inotify::init().context("failed to init inotify")?;
        // Polled from a loop that also watches the shutdown flag.
        let flags = fcntl::fcntl(inotify.as_raw_fd(), fcntl::FcntlArg::F_GETFL)
            .context("failed to get inotify fd flags")?;
        let flags = fcntl::OFlag::from_bits_truncate(flags) | fcntl::OFlag::O_NONBLOCK;
        fcntl::fcntl(inotify.as_raw_fd(), fcntl::FcntlArg::F_SETFL(flags))
            .context("failed to make inotify fd non-blocking")?;
        inotify
            .watches()
            .add(&dir, WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("tunables-watch".to_string())
            .spawn(move || watch_loop(inotify, path, tunables, thread_shutdown))
            .context("failed to spawn tunables watcher")?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for TunablesWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn watch_loop(mut inotify: Inotify, path: PathBuf, tunables: Arc<Tunables>, shutdown: Arc<AtomicBool>) {
    let file_name = path.file_name().map(|n| n.to_os_string());
    let mut buffer = [0u8; 4096];

    while !shutdown.load(Ordering::Relaxed) {
        let touched = match inotify.read_events(&mut buffer) {
            Ok(events) => events
                .filter(|e| e.name.map(|n| n.to_os_string()) == file_name)
                .count()
                > 0,
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(e) => {
                warn!("tunables watcher: inotify read failed: {}, stopping", e);
                return;
            }
        };

        if touched {
            match TunablesUpdate::load(&path) {
                Ok(update) => {
                    let changed = tunables.apply(&update);
                    info!("Reloaded {} ({} value(s) changed)", path.display(), changed);
                    debug!("tunables now {:?}", tunables.snapshot());
                }
                Err(e) => warn!("Ignoring tunables update: {:#}", e),
            }
        }

        thread::sleep(Duration::from_millis(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_update_only_touches_present_keys() {
        let tun = Tunables::default();
        let update = TunablesUpdate::from_json(
            r#"{ "input_boost_freq_hp": 1400000, "wake_boost_duration_ms": 0 }"#,
        )
        .unwrap();
        assert_eq!(tun.apply(&update), 2);

        let v = tun.snapshot();
        assert_eq!(v.input_boost_freq_hp, 1_400_000);
        assert_eq!(v.input_boost_freq_lp, TunableValues::default().input_boost_freq_lp);
        assert_eq!(v.wake_boost_duration_ms, 0);
        assert_eq!(tun.apply(&update), 0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(TunablesUpdate::from_json(r#"{ "input_boost_freq": 1 }"#).is_err());
    }

    #[test]
    fn per_cluster_values_are_independent() {
        let pc = PerCluster::new(1, 2);
        pc.set(ClusterClass::LowPower, 10);
        assert_eq!(pc.get(ClusterClass::LowPower), 10);
        assert_eq!(pc.get(ClusterClass::Performance), 2);
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn watcher_applies_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunables.json");
        let tun = Arc::new(Tunables::default());
        let _watcher = TunablesWatcher::spawn(path.clone(), Arc::clone(&tun)).unwrap();

        fs::write(&path, r#"{ "input_boost_freq_hp": 1500000 }"#).unwrap();
        assert!(wait_for(|| tun.snapshot().input_boost_freq_hp == 1_500_000));

        // Replaced by rename, the way editors save.
        let tmp = dir.path().join("tunables.json.tmp");
        fs::write(&tmp, r#"{ "input_boost_duration_ms": 250 }"#).unwrap();
        fs::rename(&tmp, &path).unwrap();
        assert!(wait_for(|| tun.snapshot().input_boost_duration_ms == 250));
        assert_eq!(tun.snapshot().input_boost_freq_hp, 1_500_000);
    }

    #[test]
    fn watcher_ignores_malformed_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunables.json");
        let tun = Arc::new(Tunables::default());
        let _watcher = TunablesWatcher::spawn(path.clone(), Arc::clone(&tun)).unwrap();

        fs::write(&path, r#"{ "wake_boost_duration_ms": 400 }"#).unwrap();
        assert!(wait_for(|| tun.snapshot().wake_boost_duration_ms == 400));
        let before = tun.snapshot();

        fs::write(&path, r#"{ "wake_boost_duration_ms": "#).unwrap();
        thread::sleep(Duration::from_millis(600));
        fs::write(&path, r#"{ "wake_boost_duration_ms": 7, "bogus": 1 }"#).unwrap();
        thread::sleep(Duration::from_millis(600));
        assert_eq!(tun.snapshot(), before);

        fs::write(&path, r#"{ "wake_boost_duration_ms": 500 }"#).unwrap();
        assert!(wait_for(|| tun.snapshot().wake_boost_duration_ms == 500));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunables.json");
        fs::write(&path, r#"{ "idle_min_freq_lp": 300000 }"#).unwrap();
        let update = TunablesUpdate::load(&path).unwrap();
        assert_eq!(update.idle_min_freq_lp, Some(300_000));
        assert_eq!(update.idle_min_freq_hp, None);
    }
}
