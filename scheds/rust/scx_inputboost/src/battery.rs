// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Battery saver flag sources
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use zbus::blocking::{Connection, ProxyBuilder};

const DBUS_DEST: &str = "net.hadess.PowerProfiles";
const PPD_PATH: &str = "/net/hadess/PowerProfiles";
const PPD_IFACE: &str = "net.hadess.PowerProfiles";
const POWER_SAVER_PROFILE: &str = "power-saver";

/// Run after every battery saver flip.
pub type ChangeFn = Box<dyn Fn() + Send + Sync>;

/// Read on the decision path, so implementations must answer from memory.
pub trait BatterySaver: Send + Sync {
    fn is_on(&self) -> bool;

    /// Installs the flip callback. Only the first call takes effect.
    fn on_change(&self, notify: ChangeFn);
}

/// Cached flag plus its flip callback.
#[derive(Default)]
struct SaverFlag {
    on: AtomicBool,
    notify: OnceLock<ChangeFn>,
}

impl SaverFlag {
    fn new(on: bool) -> Self {
        Self {
            on: AtomicBool::new(on),
            notify: OnceLock::new(),
        }
    }

    #[inline(always)]
    fn load(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }

    /// Returns true if the flag flipped.
    fn store(&self, on: bool) -> bool {
        if self.on.swap(on, Ordering::Relaxed) == on {
            return false;
        }
        if let Some(notify) = self.notify.get() {
            notify();
        }
        true
    }

    fn on_change(&self, notify: ChangeFn) {
        if self.notify.set(notify).is_err() {
            warn!("battery saver change callback already installed");
        }
    }
}

/// Flag set by hand (command line, tests).
#[derive(Default)]
pub struct StaticSaver {
    flag: SaverFlag,
}

impl StaticSaver {
    pub fn new(on: bool) -> Self {
        Self {
            flag: SaverFlag::new(on),
        }
    }

    pub fn set(&self, on: bool) {
        self.flag.store(on);
    }
}

impl BatterySaver for StaticSaver {
    #[inline(always)]
    fn is_on(&self) -> bool {
        self.flag.load()
    }

    fn on_change(&self, notify: ChangeFn) {
        self.flag.on_change(notify);
    }
}

/// Mirrors power-profiles-daemon: the "power-saver" profile means battery
/// saver is on. A background thread polls the system bus and caches the
/// answer.
pub struct PowerProfilesSaver {
    flag: Arc<SaverFlag>,
    shutdown: Arc<AtomicBool>,
    _thread: Option<JoinHandle<()>>,
}

impl PowerProfilesSaver {
    pub fn new(poll: Duration) -> Result<Self> {
        let flag = Arc::new(SaverFlag::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_flag = Arc::clone(&flag);
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("ppd-watch".to_string())
            .spawn(move || watcher_loop(thread_flag, thread_shutdown, poll))
            .context("failed to spawn power-profiles watcher")?;

        Ok(Self {
            flag,
            shutdown,
            _thread: Some(handle),
        })
    }
}

impl BatterySaver for PowerProfilesSaver {
    #[inline(always)]
    fn is_on(&self) -> bool {
        self.flag.load()
    }

    fn on_change(&self, notify: ChangeFn) {
        self.flag.on_change(notify);
    }
}

impl Drop for PowerProfilesSaver {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self._thread.take() {
            let _ = handle.join();
        }
    }
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        thread::sleep(step);
        slept += step;
    }
    !shutdown.load(Ordering::Relaxed)
}

fn watcher_loop(flag: Arc<SaverFlag>, shutdown: Arc<AtomicBool>, poll: Duration) {
    let mut backoff = Duration::from_millis(1000);
    let mut conn: Option<Connection> = None;
    let mut retry_count = 0;
    const MAX_RETRIES: u32 = 10;

    while !shutdown.load(Ordering::Relaxed) {
        if conn.is_none() {
            if retry_count >= MAX_RETRIES {
                warn!("power-profiles watcher: max retries ({}) exceeded, battery saver stays off", MAX_RETRIES);
                flag.store(false);
                return;
            }
            match Connection::system() {
                Ok(c) => {
                    conn = Some(c);
                    backoff = Duration::from_millis(1000);
                    retry_count = 0;
                }
                Err(err) => {
                    warn!("power-profiles connection error: {err:?}");
                    retry_count += 1;
                    if !sleep_unless_shutdown(backoff, &shutdown) {
                        return;
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                    continue;
                }
            }
        }

        if let Some(ref connection) = conn {
            match query_once(connection) {
                Ok(saver) => {
                    if flag.store(saver) {
                        info!("battery saver {}", if saver { "on" } else { "off" });
                    }
                }
                Err(err) => {
                    warn!("power-profiles watcher error: {err:?}");
                    conn = None;
                    retry_count += 1;
                    if !sleep_unless_shutdown(backoff, &shutdown) {
                        return;
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                    continue;
                }
            }
        }

        if !sleep_unless_shutdown(poll, &shutdown) {
            return;
        }
    }
}

fn query_once(conn: &Connection) -> Result<bool> {
    let proxy: zbus::blocking::Proxy<'_> = ProxyBuilder::new(conn)
        .destination(DBUS_DEST)?
        .path(PPD_PATH)?
        .interface(PPD_IFACE)?
        .cache_properties(zbus::CacheProperties::No)
        .build()?;

    let profile: String = proxy.get_property("ActiveProfile")?;
    Ok(profile == POWER_SAVER_PROFILE)
}
