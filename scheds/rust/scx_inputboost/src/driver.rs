// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: Driver bring-up and teardown
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info};

use crate::boost::BoostDrv;
use crate::cpufreq::{CpufreqOps, NotifierId};
use crate::display::{BoostDisplayNotifier, ClientId, DisplayOps};
use crate::input::{BoostInputHandler, HandlerId, InputOps};
use crate::policy::BoostPolicyNotifier;
use crate::timer::TimerThread;
use crate::worker::{PolicyWorker, WorkerConfig};

/// Subsystems the booster plugs into.
#[derive(Clone)]
pub struct Subsystems {
    pub cpufreq: Arc<dyn CpufreqOps>,
    pub input: Arc<dyn InputOps>,
    pub display: Arc<dyn DisplayOps>,
}

/// A running booster. Every registration is undone by [`Driver::stop`] or
/// on drop.
pub struct Driver {
    drv: Arc<BoostDrv>,
    subsys: Subsystems,
    notifier: Option<NotifierId>,
    input: Option<HandlerId>,
    display: Option<ClientId>,
    timers: Vec<TimerThread>,
    worker: Option<PolicyWorker>,
}

impl Driver {
    /// Registers with cpufreq, input and display in that order, then starts
    /// the timer threads and the worker. On failure everything registered
    /// so far is undone in reverse order.
    pub fn start(drv: Arc<BoostDrv>, subsys: Subsystems, worker_cfg: WorkerConfig) -> Result<Self> {
        let mut driver = Self {
            drv,
            subsys,
            notifier: None,
            input: None,
            display: None,
            timers: Vec::new(),
            worker: None,
        };

        if let Err(e) = driver.bring_up(worker_cfg) {
            error!("{:#}", e);
            driver.stop();
            return Err(e);
        }

        info!("cpu input boost started");
        Ok(driver)
    }

    fn bring_up(&mut self, worker_cfg: WorkerConfig) -> Result<()> {
        let notifier = Arc::new(BoostPolicyNotifier::new(Arc::clone(&self.drv)));
        self.notifier = Some(
            self.subsys
                .cpufreq
                .register_notifier(notifier)
                .context("Failed to register cpufreq notifier")?,
        );

        let handler = Arc::new(BoostInputHandler::new(Arc::clone(&self.drv)));
        self.input = Some(
            self.subsys
                .input
                .register_handler(handler)
                .context("Failed to register input handler")?,
        );

        let client = Arc::new(BoostDisplayNotifier::new(Arc::clone(&self.drv)));
        self.display = Some(
            self.subsys
                .display
                .register_client(client)
                .context("Failed to register display notifier")?,
        );

        let clock = self.drv.clock();
        self.timers.push(
            TimerThread::spawn(
                Arc::clone(&self.drv),
                Arc::clone(&clock),
                |d| &d.input_unboost,
                |d| d.input_unboosted(),
            )
            .context("Failed to start input unboost timer")?,
        );
        self.timers.push(
            TimerThread::spawn(
                Arc::clone(&self.drv),
                clock,
                |d| &d.max_unboost,
                |d| d.max_unboosted(),
            )
            .context("Failed to start max unboost timer")?,
        );

        self.worker = Some(
            PolicyWorker::spawn(Arc::clone(&self.drv), Arc::clone(&self.subsys.cpufreq), worker_cfg)
                .context("Failed to start boost worker")?,
        );
        Ok(())
    }

    pub fn boost(&self) -> &Arc<BoostDrv> {
        &self.drv
    }

    /// Event sources go first so nothing re-arms a timer after it is
    /// flushed. Pending unboosts run before the worker stops, and once the
    /// notifier is gone every domain is re-evaluated without it.
    pub fn stop(&mut self) {
        if let Some(id) = self.display.take() {
            self.subsys.display.unregister_client(id);
            debug!("display notifier unregistered");
        }
        if let Some(id) = self.input.take() {
            self.subsys.input.unregister_handler(id);
            debug!("input handler unregistered");
        }

        for mut timer in self.timers.drain(..) {
            timer.shutdown();
        }
        self.drv.flush_timers();

        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }

        if let Some(id) = self.notifier.take() {
            self.subsys.cpufreq.unregister_notifier(id);
            for cpu in self.subsys.cpufreq.representative_cpus() {
                if let Err(e) = self.subsys.cpufreq.update_policy(cpu) {
                    debug!("cpu{}: failed to restore policy: {:#}", cpu, e);
                }
            }
            info!("cpu input boost stopped");
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::bail;

    use super::*;
    use crate::boost::testing::rig;
    use crate::cpufreq::testing::FakeCpufreq;
    use crate::display::{BlankAction, BlankEvent, BlankLevel, DisplayNotifier};
    use crate::input::{InputEvent, InputHandler, EV_KEY};
    use crate::state::BoostFlags;
    use crate::tunables::TunableValues;

    #[derive(Default)]
    struct FakeInput {
        fail: bool,
        next: AtomicU64,
        handlers: Mutex<Vec<(HandlerId, Arc<dyn InputHandler>)>>,
    }

    impl FakeInput {
        fn registered(&self) -> usize {
            self.handlers.lock().unwrap().len()
        }

        fn key(&self) {
            for (_, h) in self.handlers.lock().unwrap().iter() {
                h.event(&InputEvent {
                    type_: EV_KEY,
                    code: 0x1e,
                    value: 1,
                });
            }
        }
    }

    impl InputOps for FakeInput {
        fn register_handler(&self, handler: Arc<dyn InputHandler>) -> Result<HandlerId> {
            if self.fail {
                bail!("no input core");
            }
            let id = HandlerId(self.next.fetch_add(1, Ordering::Relaxed));
            self.handlers.lock().unwrap().push((id, handler));
            Ok(id)
        }

        fn unregister_handler(&self, id: HandlerId) {
            self.handlers.lock().unwrap().retain(|(h, _)| *h != id);
        }
    }

    #[derive(Default)]
    struct FakeDisplay {
        fail: bool,
        next: AtomicU64,
        clients: Mutex<Vec<(ClientId, Arc<dyn DisplayNotifier>)>>,
    }

    impl FakeDisplay {
        fn registered(&self) -> usize {
            self.clients.lock().unwrap().len()
        }

        fn blank(&self, level: BlankLevel) {
            for (_, c) in self.clients.lock().unwrap().iter() {
                c.notify(&BlankEvent {
                    action: BlankAction::EarlyBlank,
                    level,
                });
            }
        }
    }

    impl DisplayOps for FakeDisplay {
        fn register_client(&self, client: Arc<dyn DisplayNotifier>) -> Result<ClientId> {
            if self.fail {
                bail!("no framebuffer");
            }
            let id = ClientId(self.next.fetch_add(1, Ordering::Relaxed));
            self.clients.lock().unwrap().push((id, client));
            Ok(id)
        }

        fn unregister_client(&self, id: ClientId) {
            self.clients.lock().unwrap().retain(|(c, _)| *c != id);
        }
    }

    struct Fakes {
        cpufreq: Arc<FakeCpufreq>,
        input: Arc<FakeInput>,
        display: Arc<FakeDisplay>,
    }

    impl Fakes {
        fn subsystems(&self) -> Subsystems {
            Subsystems {
                cpufreq: self.cpufreq.clone(),
                input: self.input.clone(),
                display: self.display.clone(),
            }
        }
    }

    fn fakes(cpufreq: FakeCpufreq, input: FakeInput, display: FakeDisplay) -> Fakes {
        Fakes {
            cpufreq: Arc::new(cpufreq),
            input: Arc::new(input),
            display: Arc::new(display),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn cpufreq_failure_leaves_nothing_registered() {
        let r = rig(TunableValues::default());
        let f = fakes(
            FakeCpufreq {
                fail_register: true,
                ..FakeCpufreq::two_cluster()
            },
            FakeInput::default(),
            FakeDisplay::default(),
        );
        assert!(Driver::start(r.drv.clone(), f.subsystems(), WorkerConfig::default()).is_err());
        assert_eq!(f.input.registered(), 0);
        assert_eq!(f.display.registered(), 0);
        assert!(f.cpufreq.commits().is_empty());
    }

    #[test]
    fn input_failure_unregisters_cpufreq() {
        let r = rig(TunableValues::default());
        let f = fakes(
            FakeCpufreq::two_cluster(),
            FakeInput {
                fail: true,
                ..Default::default()
            },
            FakeDisplay::default(),
        );
        assert!(Driver::start(r.drv.clone(), f.subsystems(), WorkerConfig::default()).is_err());
        assert!(f.cpufreq.chain.is_empty());
        assert_eq!(f.display.registered(), 0);
    }

    #[test]
    fn display_failure_unwinds_input_and_cpufreq() {
        let r = rig(TunableValues::default());
        let f = fakes(
            FakeCpufreq::two_cluster(),
            FakeInput::default(),
            FakeDisplay {
                fail: true,
                ..Default::default()
            },
        );
        let err = Driver::start(r.drv.clone(), f.subsystems(), WorkerConfig::default())
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("display"));
        assert_eq!(f.input.registered(), 0);
        assert!(f.cpufreq.chain.is_empty());
    }

    #[test]
    fn events_flow_to_policy_floors() {
        let r = rig(TunableValues {
            input_boost_freq_hp: 1_200_000,
            ..TunableValues::default()
        });
        let f = fakes(FakeCpufreq::two_cluster(), FakeInput::default(), FakeDisplay::default());
        let mut driver = Driver::start(r.drv.clone(), f.subsystems(), WorkerConfig::default()).unwrap();
        assert_eq!(f.cpufreq.chain.len(), 1);
        assert_eq!(f.input.registered(), 1);
        assert_eq!(f.display.registered(), 1);

        f.input.key();
        assert!(wait_for(|| f.cpufreq.last_floor(4) == Some(1_200_000)));

        f.display.blank(BlankLevel::Powerdown);
        assert!(wait_for(|| f.cpufreq.last_floor(4) == Some(400_000)));
        assert!(r.drv.state().contains(BoostFlags::SCREEN_OFF));

        f.display.blank(BlankLevel::Unblank);
        assert!(wait_for(|| f.cpufreq.last_floor(4) == Some(2_800_000)));

        driver.stop();
        assert_eq!(r.drv.state(), BoostFlags::empty());
        assert!(f.cpufreq.chain.is_empty());
        assert_eq!(f.input.registered(), 0);
        assert_eq!(f.display.registered(), 0);
        assert_eq!(f.cpufreq.last_floor(0), Some(300_000));
        assert_eq!(f.cpufreq.last_floor(4), Some(400_000));
    }

    #[test]
    fn stop_is_idempotent() {
        let r = rig(TunableValues::default());
        let f = fakes(FakeCpufreq::two_cluster(), FakeInput::default(), FakeDisplay::default());
        let mut driver = Driver::start(r.drv.clone(), f.subsystems(), WorkerConfig::default()).unwrap();
        driver.stop();
        let commits = f.cpufreq.commits().len();
        driver.stop();
        drop(driver);
        assert_eq!(f.cpufreq.commits().len(), commits);
    }
}
