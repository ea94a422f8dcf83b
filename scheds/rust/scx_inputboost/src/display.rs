// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Display power adapter
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};

use crate::boost::BoostDrv;

pub const BACKLIGHT_SYSFS_ROOT: &str = "/sys/class/backlight";

/// Blank notifications come in pairs: an early one before the panel
/// changes state and a regular one after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankAction {
    EarlyBlank,
    Blank,
}

/// Framebuffer blank levels as reported by `bl_power`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlankLevel {
    Unblank,
    Normal,
    VsyncSuspend,
    HsyncSuspend,
    Powerdown,
}

impl BlankLevel {
    pub fn from_raw(v: u32) -> Option<Self> {
        match v {
            0 => Some(BlankLevel::Unblank),
            1 => Some(BlankLevel::Normal),
            2 => Some(BlankLevel::VsyncSuspend),
            3 => Some(BlankLevel::HsyncSuspend),
            4 => Some(BlankLevel::Powerdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlankEvent {
    pub action: BlankAction,
    pub level: BlankLevel,
}

pub trait DisplayNotifier: Send + Sync {
    fn notify(&self, ev: &BlankEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

pub trait DisplayOps: Send + Sync {
    fn register_client(&self, client: Arc<dyn DisplayNotifier>) -> Result<ClientId>;
    fn unregister_client(&self, id: ClientId);
}

/// Wake boost on unblank, idle posture on anything else.
pub struct BoostDisplayNotifier {
    drv: Arc<BoostDrv>,
}

impl BoostDisplayNotifier {
    pub fn new(drv: Arc<BoostDrv>) -> Self {
        Self { drv }
    }
}

impl DisplayNotifier for BoostDisplayNotifier {
    fn notify(&self, ev: &BlankEvent) {
        // React as early as possible
        if ev.action != BlankAction::EarlyBlank {
            return;
        }

        if ev.level == BlankLevel::Unblank {
            self.drv.display_on();
        } else {
            self.drv.display_off();
        }
    }
}

/// Display backend for systems without a backlight. Never emits events.
#[derive(Debug, Default)]
pub struct NoDisplay {
    next_id: AtomicU64,
}

impl DisplayOps for NoDisplay {
    fn register_client(&self, _client: Arc<dyn DisplayNotifier>) -> Result<ClientId> {
        Ok(ClientId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn unregister_client(&self, _id: ClientId) {}
}

/// `bl_power` of the backlight called `name`, or of the first one found.
pub fn discover(root: &Path, name: Option<&str>) -> Result<PathBuf> {
    if let Some(name) = name {
        let path = root.join(name).join("bl_power");
        if !path.exists() {
            bail!("backlight {} has no {}", name, path.display());
        }
        return Ok(path);
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("failed to list {}", root.display()))?
        .flatten()
        .map(|e| e.path().join("bl_power"))
        .filter(|p| p.exists())
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no backlight with bl_power under {}", root.display()))
}

fn read_level(path: &Path) -> Result<BlankLevel> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let raw: u32 = text
        .trim()
        .parse()
        .with_context(|| format!("failed to parse {}", path.display()))?;
    BlankLevel::from_raw(raw).ok_or_else(|| anyhow!("{}: unknown blank level {}", path.display(), raw))
}

fn emit(client: &dyn DisplayNotifier, level: BlankLevel) {
    client.notify(&BlankEvent {
        action: BlankAction::EarlyBlank,
        level,
    });
    client.notify(&BlankEvent {
        action: BlankAction::Blank,
        level,
    });
}

fn poll_loop(path: &Path, poll: Duration, client: &dyn DisplayNotifier, mut last: BlankLevel, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        thread::park_timeout(poll);
        if stop.load(Ordering::Relaxed) {
            break;
        }

        match read_level(path) {
            Ok(level) if level != last => {
                debug!("display: {:?} -> {:?}", last, level);
                emit(client, level);
                last = level;
            }
            Ok(_) => {}
            Err(e) => debug!("display: {:#}", e),
        }
    }
}

struct ClientThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Emits blank events whenever a backlight's `bl_power` changes. The
/// current level is delivered once on registration.
pub struct BacklightWatcher {
    path: PathBuf,
    poll: Duration,
    next_id: AtomicU64,
    clients: Mutex<HashMap<ClientId, ClientThread>>,
}

impl BacklightWatcher {
    pub fn new(path: PathBuf, poll: Duration) -> Self {
        Self {
            path,
            poll,
            next_id: AtomicU64::new(0),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DisplayOps for BacklightWatcher {
    fn register_client(&self, client: Arc<dyn DisplayNotifier>) -> Result<ClientId> {
        let initial = read_level(&self.path)?;
        emit(client.as_ref(), initial);

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let path = self.path.clone();
            let poll = self.poll;
            thread::Builder::new()
                .name("display-watch".into())
                .spawn(move || poll_loop(&path, poll, client.as_ref(), initial, &stop))
                .context("failed to spawn display watcher")?
        };
        info!("display: watching {} ({:?})", self.path.display(), initial);

        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.clients
            .lock()
            .map_err(|_| anyhow!("display client table poisoned"))?
            .insert(id, ClientThread { stop, handle });
        Ok(id)
    }

    fn unregister_client(&self, id: ClientId) {
        let entry = match self.clients.lock() {
            Ok(mut clients) => clients.remove(&id),
            Err(_) => None,
        };
        if let Some(t) = entry {
            t.stop.store(true, Ordering::Relaxed);
            t.handle.thread().unpark();
            if t.handle.join().is_err() {
                warn!("display watcher panicked");
            }
        }
    }
}

impl Drop for BacklightWatcher {
    fn drop(&mut self) {
        let ids: Vec<ClientId> = match self.clients.lock() {
            Ok(clients) => clients.keys().copied().collect(),
            Err(_) => return,
        };
        for id in ids {
            self.unregister_client(id);
        }
    }
}
