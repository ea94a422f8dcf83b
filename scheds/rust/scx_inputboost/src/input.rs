// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Input device adapter
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Input handlers declare which devices they want through a table of
//! capability matches. [`EvdevInput`] opens every matching `/dev/input`
//! event node, follows hotplug, and feeds device events to the handler.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use inotify::{EventMask, Inotify, WatchMask};
use log::{debug, info, warn};
use nix::fcntl;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::boost::BoostDrv;

pub const INPUT_DEV_DIR: &str = "/dev/input";

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_ABS: u16 = 0x03;
pub const BTN_TOUCH: u16 = 0x14a;
pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_MT_POSITION_X: u16 = 0x35;
pub const ABS_MT_POSITION_Y: u16 = 0x36;

/// What a device can report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub name: String,
    pub evbits: Vec<u16>,
    pub keybits: Vec<u16>,
    pub absbits: Vec<u16>,
}

/// A device matches when it reports every listed bit.
#[derive(Debug, Clone, Copy)]
pub struct DeviceMatch {
    pub evbit: &'static [u16],
    pub keybit: &'static [u16],
    pub absbit: &'static [u16],
}

impl DeviceMatch {
    pub fn matches(&self, caps: &DeviceCaps) -> bool {
        let has_all = |want: &[u16], have: &[u16]| want.iter().all(|b| have.contains(b));
        has_all(self.evbit, &caps.evbits)
            && has_all(self.keybit, &caps.keybits)
            && has_all(self.absbit, &caps.absbits)
    }
}

/// Multi-touch touchscreens, touchpads and anything with keys.
pub const BOOST_DEVICE_IDS: &[DeviceMatch] = &[
    DeviceMatch {
        evbit: &[EV_ABS],
        keybit: &[],
        absbit: &[ABS_MT_POSITION_X, ABS_MT_POSITION_Y],
    },
    DeviceMatch {
        evbit: &[],
        keybit: &[BTN_TOUCH],
        absbit: &[ABS_X, ABS_Y],
    },
    DeviceMatch {
        evbit: &[EV_KEY],
        keybit: &[],
        absbit: &[],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub type_: u16,
    pub code: u16,
    pub value: i32,
}

pub trait InputHandler: Send + Sync {
    fn name(&self) -> &str;

    fn id_table(&self) -> &[DeviceMatch];

    fn matches(&self, caps: &DeviceCaps) -> bool {
        self.id_table().iter().any(|m| m.matches(caps))
    }

    /// Called once a matching device is open. Returning false declines it.
    fn connect(&self, _caps: &DeviceCaps) -> bool {
        true
    }

    fn disconnect(&self, _caps: &DeviceCaps) {}

    /// Called from the input thread for every event of a connected device.
    fn event(&self, ev: &InputEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

pub trait InputOps: Send + Sync {
    fn register_handler(&self, handler: Arc<dyn InputHandler>) -> Result<HandlerId>;
    fn unregister_handler(&self, id: HandlerId);
}

/// Kicks an input boost on every event.
pub struct BoostInputHandler {
    drv: Arc<BoostDrv>,
}

impl BoostInputHandler {
    pub fn new(drv: Arc<BoostDrv>) -> Self {
        Self { drv }
    }
}

impl InputHandler for BoostInputHandler {
    fn name(&self) -> &str {
        "cpu_input_boost_handler"
    }

    fn id_table(&self) -> &[DeviceMatch] {
        BOOST_DEVICE_IDS
    }

    fn connect(&self, caps: &DeviceCaps) -> bool {
        info!("input: boosting on {}", caps.name);
        true
    }

    fn disconnect(&self, caps: &DeviceCaps) {
        info!("input: {} disconnected", caps.name);
    }

    #[inline]
    fn event(&self, _ev: &InputEvent) {
        self.drv.kick_input();
    }
}

pub fn caps_of(dev: &evdev::Device) -> DeviceCaps {
    DeviceCaps {
        name: dev.name().unwrap_or("unknown").to_string(),
        evbits: dev.supported_events().iter().map(|t| t.0).collect(),
        keybits: dev
            .supported_keys()
            .map(|keys| keys.iter().map(|k| k.code()).collect())
            .unwrap_or_default(),
        absbits: dev
            .supported_absolute_axes()
            .map(|axes| axes.iter().map(|a| a.0).collect())
            .unwrap_or_default(),
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL).context("F_GETFL")?;
    let flags = fcntl::OFlag::from_bits_truncate(flags) | fcntl::OFlag::O_NONBLOCK;
    fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(flags)).context("F_SETFL")?;
    Ok(())
}

const HOTPLUG_TOKEN: u64 = u64::MAX;
const EPOLL_TIMEOUT_MS: u16 = 100;
const MAX_EVENTS_PER_FD: usize = 512;

struct Attached {
    path: PathBuf,
    dev: evdev::Device,
    caps: DeviceCaps,
}

/// Open devices of one handler plus the epoll set they are waited on.
struct Session {
    dir: PathBuf,
    handler: Arc<dyn InputHandler>,
    epoll: Epoll,
    hotplug: Option<Inotify>,
    devices: HashMap<u64, Attached>,
}

impl Session {
    fn new(dir: &Path, handler: Arc<dyn InputHandler>) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| anyhow!(e))?;

        let hotplug = match Inotify::init() {
            Ok(inotify) => {
                let added = set_nonblocking(inotify.as_raw_fd()).and_then(|_| {
                    inotify
                        .watches()
                        .add(dir, WatchMask::CREATE | WatchMask::ATTRIB | WatchMask::DELETE)
                        .map_err(|e| anyhow!(e))?;
                    // SAFETY: the inotify instance is owned by the session and
                    // outlives its epoll registration.
                    let bfd = unsafe { BorrowedFd::borrow_raw(inotify.as_raw_fd()) };
                    epoll
                        .add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, HOTPLUG_TOKEN))
                        .map_err(|e| anyhow!(e))
                });
                match added {
                    Ok(()) => Some(inotify),
                    Err(e) => {
                        warn!("input: hotplug disabled for {}: {:#}", dir.display(), e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("input: hotplug disabled, failed to init inotify: {}", e);
                None
            }
        };

        let mut session = Self {
            dir: dir.to_path_buf(),
            handler,
            epoll,
            hotplug,
            devices: HashMap::new(),
        };
        session.scan();
        Ok(session)
    }

    fn is_attached(&self, path: &Path) -> bool {
        self.devices.values().any(|a| a.path == path)
    }

    fn scan(&mut self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("input: failed to list {}: {}", self.dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_event_node = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("event"));
            if is_event_node && !self.is_attached(&path) {
                self.attach(path);
            }
        }
    }

    fn attach(&mut self, path: PathBuf) {
        let dev = match evdev::Device::open(&path) {
            Ok(dev) => dev,
            Err(e) => {
                debug!("input: cannot open {}: {}", path.display(), e);
                return;
            }
        };
        let caps = caps_of(&dev);
        if !self.handler.matches(&caps) {
            return;
        }

        let fd = dev.as_raw_fd();
        if let Err(e) = set_nonblocking(fd) {
            warn!("input: {}: {:#}", caps.name, e);
            return;
        }
        // SAFETY: the device stays in `devices` until it is deleted from
        // the epoll set.
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = self.epoll.add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64)) {
            warn!("input: failed to watch {}: {}", caps.name, e);
            return;
        }
        if !self.handler.connect(&caps) {
            let _ = self.epoll.delete(bfd);
            return;
        }
        debug!("input: {} attached as {}", caps.name, path.display());
        self.devices.insert(fd as u64, Attached { path, dev, caps });
    }

    fn detach(&mut self, token: u64) {
        if let Some(a) = self.devices.remove(&token) {
            // SAFETY: `a.dev` still owns the descriptor here.
            let bfd = unsafe { BorrowedFd::borrow_raw(a.dev.as_raw_fd()) };
            let _ = self.epoll.delete(bfd);
            self.handler.disconnect(&a.caps);
        }
    }

    fn detach_path(&mut self, path: &Path) {
        let token = self
            .devices
            .iter()
            .find(|(_, a)| a.path == path)
            .map(|(t, _)| *t);
        if let Some(token) = token {
            self.detach(token);
        }
    }

    fn handle_hotplug(&mut self) {
        let Some(inotify) = self.hotplug.as_mut() else {
            return;
        };
        let mut buffer = [0u8; 4096];
        let mut added = Vec::new();
        let mut removed = Vec::new();
        match inotify.read_events(&mut buffer) {
            Ok(events) => {
                for event in events {
                    let Some(name) = event.name.and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if !name.starts_with("event") {
                        continue;
                    }
                    let path = self.dir.join(name);
                    if event.mask.contains(EventMask::DELETE) {
                        removed.push(path);
                    } else {
                        // udev may fix permissions after CREATE, so retry on ATTRIB
                        added.push(path);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("input: hotplug read failed: {}", e),
        }

        for path in removed {
            self.detach_path(&path);
        }
        for path in added {
            if !self.is_attached(&path) {
                self.attach(path);
            }
        }
    }

    fn drain(&mut self, token: u64) {
        let Some(a) = self.devices.get_mut(&token) else {
            return;
        };
        let failed = match a.dev.fetch_events() {
            Ok(iter) => {
                for ev in iter.take(MAX_EVENTS_PER_FD) {
                    let ev = InputEvent {
                        type_: ev.event_type().0,
                        code: ev.code(),
                        value: ev.value(),
                    };
                    if ev.type_ != EV_SYN {
                        self.handler.event(&ev);
                    }
                }
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(e) => Some(e),
        };

        if let Some(e) = failed {
            debug!("input: read failed on fd {}: {}", token, e);
            self.detach(token);
        }
    }

    fn run(mut self, stop: &AtomicBool) {
        let mut events = [EpollEvent::empty(); 64];
        while !stop.load(Ordering::Relaxed) {
            let n = match self.epoll.wait(&mut events, Some(EPOLL_TIMEOUT_MS)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("input: epoll_wait failed: {}", e);
                    break;
                }
            };

            for ev in &events[..n] {
                let token = ev.data();
                let flags = ev.events();
                if token == HOTPLUG_TOKEN {
                    self.handle_hotplug();
                } else if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    self.detach(token);
                } else {
                    self.drain(token);
                }
            }
        }

        let tokens: Vec<u64> = self.devices.keys().copied().collect();
        for token in tokens {
            self.detach(token);
        }
    }
}

struct HandlerThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// evdev backed input subsystem. One thread per registered handler.
pub struct EvdevInput {
    dir: PathBuf,
    next_id: AtomicU64,
    handlers: Mutex<HashMap<HandlerId, HandlerThread>>,
}

impl EvdevInput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for EvdevInput {
    fn default() -> Self {
        Self::new(INPUT_DEV_DIR)
    }
}

impl InputOps for EvdevInput {
    fn register_handler(&self, handler: Arc<dyn InputHandler>) -> Result<HandlerId> {
        let name = handler.name().to_string();
        let session = Session::new(&self.dir, handler)
            .with_context(|| format!("failed to set up input handler {}", name))?;
        info!(
            "input: {} attached to {} device(s) under {}",
            name,
            session.devices.len(),
            self.dir.display()
        );

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("input-boost".into())
            .spawn(move || session.run(&thread_stop))
            .context("failed to spawn input thread")?;

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .map_err(|_| anyhow!("input handler table poisoned"))?
            .insert(id, HandlerThread { stop, handle });
        Ok(id)
    }

    fn unregister_handler(&self, id: HandlerId) {
        let entry = match self.handlers.lock() {
            Ok(mut handlers) => handlers.remove(&id),
            Err(_) => None,
        };
        if let Some(t) = entry {
            t.stop.store(true, Ordering::Relaxed);
            if t.handle.join().is_err() {
                warn!("input thread panicked");
            }
        }
    }
}

impl Drop for EvdevInput {
    fn drop(&mut self) {
        let ids: Vec<HandlerId> = match self.handlers.lock() {
            Ok(handlers) => handlers.keys().copied().collect(),
            Err(_) => return,
        };
        for id in ids {
            self.unregister_handler(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::testing::rig;
    use crate::state::BoostFlags;
    use crate::tunables::TunableValues;

    fn caps(evbits: &[u16], keybits: &[u16], absbits: &[u16]) -> DeviceCaps {
        DeviceCaps {
            name: "test".into(),
            evbits: evbits.to_vec(),
            keybits: keybits.to_vec(),
            absbits: absbits.to_vec(),
        }
    }

    fn handler() -> (crate::boost::testing::Rig, BoostInputHandler) {
        let r = rig(TunableValues::default());
        let h = BoostInputHandler::new(Arc::clone(&r.drv));
        (r, h)
    }

    #[test]
    fn multitouch_screen_matches() {
        let (_r, h) = handler();
        let ts = caps(
            &[EV_SYN, EV_ABS],
            &[],
            &[ABS_MT_POSITION_X, ABS_MT_POSITION_Y, 0x39],
        );
        assert!(h.matches(&ts));
    }

    #[test]
    fn single_axis_multitouch_does_not_match() {
        let (_r, h) = handler();
        assert!(!h.matches(&caps(&[EV_ABS], &[], &[ABS_MT_POSITION_X])));
    }

    #[test]
    fn touchpad_matches_without_key_evbit() {
        let (_r, h) = handler();
        // the touchpad entry only checks key and abs bits
        assert!(h.matches(&caps(&[EV_ABS], &[BTN_TOUCH], &[ABS_X, ABS_Y])));
        assert!(!h.matches(&caps(&[EV_ABS], &[], &[ABS_X, ABS_Y])));
    }

    #[test]
    fn anything_with_keys_matches() {
        let (_r, h) = handler();
        assert!(h.matches(&caps(&[EV_SYN, EV_KEY], &[0x1e], &[])));
    }

    #[test]
    fn relative_only_device_does_not_match() {
        let (_r, h) = handler();
        // accelerometer-like: relative axes only
        assert!(!h.matches(&caps(&[EV_SYN, 0x02], &[], &[])));
        assert!(!h.matches(&DeviceCaps::default()));
    }

    #[test]
    fn events_kick_input_boost() {
        let (r, h) = handler();
        h.event(&InputEvent {
            type_: EV_KEY,
            code: 0x1e,
            value: 1,
        });
        assert_eq!(r.drv.state(), BoostFlags::INPUT_BOOST);
        assert!(r.drv.within_input(1));
    }

    #[test]
    fn register_on_empty_dir_attaches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (_r, h) = handler();
        let input = EvdevInput::new(dir.path());
        let id = input.register_handler(Arc::new(h)).unwrap();
        input.unregister_handler(id);
        input.unregister_handler(id);
    }

    #[test]
    fn missing_dir_only_disables_hotplug() {
        let (_r, h) = handler();
        let input = EvdevInput::new("/nonexistent/input");
        let id = input.register_handler(Arc::new(h)).unwrap();
        input.unregister_handler(id);
    }
}
