// SPDX-License-Identifier: GPL-2.0
//
// scx_inputboost: cpufreq policy access
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The booster never owns frequency domains. It registers a
//! [`PolicyNotifier`] with a [`CpufreqOps`] implementation and asks it to
//! re-evaluate policies; the implementation runs the notifier chain and
//! commits whatever floor comes out of it.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use serde::Serialize;

use crate::cpu_list::{format_cpu_list, parse_cpu_list};

pub const CPUFREQ_SYSFS_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClusterClass {
    LowPower,
    Performance,
}

impl fmt::Display for ClusterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterClass::LowPower => write!(f, "lp"),
            ClusterClass::Performance => write!(f, "perf"),
        }
    }
}

/// A policy being re-evaluated. Notifiers may only move `min`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub cpu: usize,
    pub class: ClusterClass,
    /// Hardware lower bound.
    pub cpuinfo_min_freq: u32,
    /// Hardware upper bound.
    pub cpuinfo_max_freq: u32,
    /// Current policy ceiling.
    pub max: u32,
    /// Floor being negotiated.
    pub min: u32,
}

impl Policy {
    /// Keeps the negotiated floor within the hardware minimum and the
    /// policy ceiling.
    pub fn verify(&mut self) {
        self.min = self.min.max(self.cpuinfo_min_freq).min(self.max);
    }
}

pub trait PolicyNotifier: Send + Sync {
    fn adjust(&self, policy: &mut Policy);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(pub u64);

pub trait CpufreqOps: Send + Sync {
    fn register_notifier(&self, notifier: Arc<dyn PolicyNotifier>) -> Result<NotifierId>;
    fn unregister_notifier(&self, id: NotifierId);
    /// First online CPU of every frequency domain. Domains without an
    /// online CPU are left out.
    fn representative_cpus(&self) -> Vec<usize>;
    /// Re-evaluates the policy owning `cpu` and commits the result.
    fn update_policy(&self, cpu: usize) -> Result<()>;
    /// CPUs belonging to domains of `class`.
    fn cpus_of(&self, class: ClusterClass) -> Vec<usize>;
}

/// Registered notifiers, called in registration order.
#[derive(Default)]
pub struct NotifierChain {
    next_id: AtomicU64,
    entries: RwLock<Vec<(NotifierId, Arc<dyn PolicyNotifier>)>>,
}

impl NotifierChain {
    pub fn register(&self, notifier: Arc<dyn PolicyNotifier>) -> Result<NotifierId> {
        let id = NotifierId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .map_err(|_| anyhow!("notifier chain poisoned"))?
            .push((id, notifier));
        Ok(id)
    }

    pub fn unregister(&self, id: NotifierId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|(nid, _)| *nid != id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn call(&self, policy: &mut Policy) {
        if let Ok(entries) = self.entries.read() {
            for (_, notifier) in entries.iter() {
                notifier.adjust(policy);
            }
        }
    }
}

/// How to split domains into low-power and performance clusters.
#[derive(Debug, Clone, Default)]
pub struct ClassOverrides {
    pub lp_cpus: Option<Vec<usize>>,
    pub perf_cpus: Option<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    pub dir: PathBuf,
    pub cpus: Vec<usize>,
    pub class: ClusterClass,
    pub cpuinfo_min_freq: u32,
    pub cpuinfo_max_freq: u32,
}

fn read_u32(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    text.trim()
        .parse::<u32>()
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn read_cpus(path: &Path) -> Result<Vec<usize>> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_cpu_list(&text).map_err(|e| anyhow!("{}: {}", path.display(), e))
}

fn classify(domains: &mut [Domain], overrides: &ClassOverrides) {
    let intersects = |cpus: &[usize], set: &[usize]| cpus.iter().any(|c| set.contains(c));

    let lowest_max = domains.iter().map(|d| d.cpuinfo_max_freq).min().unwrap_or(0);
    let uniform = domains.iter().all(|d| d.cpuinfo_max_freq == lowest_max);

    for d in domains.iter_mut() {
        let lp = match (&overrides.lp_cpus, &overrides.perf_cpus) {
            (Some(lp), _) => intersects(&d.cpus, lp),
            (None, Some(perf)) => !intersects(&d.cpus, perf),
            (None, None) => !uniform && d.cpuinfo_max_freq == lowest_max,
        };
        d.class = if lp {
            ClusterClass::LowPower
        } else {
            ClusterClass::Performance
        };
    }
}

/// cpufreq backed by `/sys/devices/system/cpu/cpufreq/policy*`.
pub struct SysfsCpufreq {
    root: PathBuf,
    domains: Vec<Domain>,
    chain: NotifierChain,
}

impl SysfsCpufreq {
    pub fn probe(root: &Path, overrides: &ClassOverrides) -> Result<Self> {
        let cpufreq_dir = root.join("cpufreq");
        let mut domains = Vec::new();

        let entries = fs::read_dir(&cpufreq_dir)
            .with_context(|| format!("failed to list {}", cpufreq_dir.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("policy") {
                continue;
            }
            let dir = entry.path();
            let cpus = read_cpus(&dir.join("related_cpus"))
                .or_else(|_| read_cpus(&dir.join("affected_cpus")))?;
            if cpus.is_empty() {
                debug!("{}: no CPUs, skipping", name);
                continue;
            }
            domains.push(Domain {
                name,
                cpuinfo_min_freq: read_u32(&dir.join("cpuinfo_min_freq"))?,
                cpuinfo_max_freq: read_u32(&dir.join("cpuinfo_max_freq"))?,
                dir,
                cpus,
                class: ClusterClass::Performance,
            });
        }

        if domains.is_empty() {
            bail!("no cpufreq policies found under {}", cpufreq_dir.display());
        }
        domains.sort_by_key(|d| d.cpus.iter().min().copied().unwrap_or(usize::MAX));
        classify(&mut domains, overrides);

        for d in &domains {
            info!(
                "cpufreq {}: cpus {} class {} hw {}-{} kHz",
                d.name,
                format_cpu_list(&d.cpus),
                d.class,
                d.cpuinfo_min_freq,
                d.cpuinfo_max_freq
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            domains,
            chain: NotifierChain::default(),
        })
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    fn online_cpus(&self) -> Option<HashSet<usize>> {
        read_cpus(&self.root.join("online"))
            .ok()
            .map(|cpus| cpus.into_iter().collect())
    }

    fn domain_of(&self, cpu: usize) -> Option<&Domain> {
        self.domains.iter().find(|d| d.cpus.contains(&cpu))
    }

    /// Current limits of the domain owning `cpu`, before notifiers run.
    pub fn policy(&self, cpu: usize) -> Result<Policy> {
        let d = self
            .domain_of(cpu)
            .ok_or_else(|| anyhow!("cpu{} has no cpufreq policy", cpu))?;
        Ok(Policy {
            cpu,
            class: d.class,
            cpuinfo_min_freq: d.cpuinfo_min_freq,
            cpuinfo_max_freq: d.cpuinfo_max_freq,
            max: read_u32(&d.dir.join("scaling_max_freq"))?,
            min: d.cpuinfo_min_freq,
        })
    }
}

impl CpufreqOps for SysfsCpufreq {
    fn register_notifier(&self, notifier: Arc<dyn PolicyNotifier>) -> Result<NotifierId> {
        self.chain.register(notifier)
    }

    fn unregister_notifier(&self, id: NotifierId) {
        self.chain.unregister(id);
    }

    fn representative_cpus(&self) -> Vec<usize> {
        let online = self.online_cpus();
        self.domains
            .iter()
            .filter_map(|d| {
                d.cpus
                    .iter()
                    .copied()
                    .find(|cpu| online.as_ref().map_or(true, |o| o.contains(cpu)))
            })
            .collect()
    }

    fn update_policy(&self, cpu: usize) -> Result<()> {
        let mut policy = self.policy(cpu)?;
        self.chain.call(&mut policy);
        policy.verify();

        let d = self
            .domain_of(cpu)
            .ok_or_else(|| anyhow!("cpu{} has no cpufreq policy", cpu))?;
        let path = d.dir.join("scaling_min_freq");
        let current = read_u32(&path)?;
        if current != policy.min {
            fs::write(&path, policy.min.to_string())
                .with_context(|| format!("failed to write {}", path.display()))?;
            debug!("{}: scaling_min_freq {} -> {}", d.name, current, policy.min);
        }
        Ok(())
    }

    fn cpus_of(&self, class: ClusterClass) -> Vec<usize> {
        self.domains
            .iter()
            .filter(|d| d.class == class)
            .flat_map(|d| d.cpus.iter().copied())
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::fake_policy;
    use super::*;

    struct FixedFloor(u32);

    impl PolicyNotifier for FixedFloor {
        fn adjust(&self, policy: &mut Policy) {
            policy.min = self.0;
        }
    }

    fn two_cluster_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fake_policy(dir.path(), "policy0", "0 1 2 3", 300_000, 1_800_000);
        fake_policy(dir.path(), "policy4", "4 5 6 7", 400_000, 2_800_000);
        dir
    }

    #[test]
    fn probe_classifies_by_max_freq() {
        let dir = two_cluster_tree();
        let cf = SysfsCpufreq::probe(dir.path(), &ClassOverrides::default()).unwrap();
        assert_eq!(cf.domains().len(), 2);
        assert_eq!(cf.domains()[0].class, ClusterClass::LowPower);
        assert_eq!(cf.domains()[1].class, ClusterClass::Performance);
        assert_eq!(cf.cpus_of(ClusterClass::Performance), vec![4, 5, 6, 7]);
    }

    #[test]
    fn uniform_domains_are_all_performance() {
        let dir = tempfile::tempdir().unwrap();
        fake_policy(dir.path(), "policy0", "0 1", 300_000, 2_000_000);
        fake_policy(dir.path(), "policy2", "2 3", 300_000, 2_000_000);
        let cf = SysfsCpufreq::probe(dir.path(), &ClassOverrides::default()).unwrap();
        assert!(cf.domains().iter().all(|d| d.class == ClusterClass::Performance));
    }

    #[test]
    fn overrides_win_over_max_freq() {
        let dir = two_cluster_tree();
        let overrides = ClassOverrides {
            lp_cpus: Some(vec![4]),
            perf_cpus: None,
        };
        let cf = SysfsCpufreq::probe(dir.path(), &overrides).unwrap();
        assert_eq!(cf.domains()[0].class, ClusterClass::Performance);
        assert_eq!(cf.domains()[1].class, ClusterClass::LowPower);
    }

    #[test]
    fn representatives_skip_offline_cpus() {
        let dir = two_cluster_tree();
        fs::write(dir.path().join("online"), "1-3,6-7\n").unwrap();
        let cf = SysfsCpufreq::probe(dir.path(), &ClassOverrides::default()).unwrap();
        assert_eq!(cf.representative_cpus(), vec![1, 6]);

        fs::write(dir.path().join("online"), "0-3\n").unwrap();
        assert_eq!(cf.representative_cpus(), vec![0]);
    }

    #[test]
    fn update_policy_commits_verified_floor() {
        let dir = two_cluster_tree();
        let cf = SysfsCpufreq::probe(dir.path(), &ClassOverrides::default()).unwrap();
        let id = cf.register_notifier(Arc::new(FixedFloor(9_000_000))).unwrap();

        cf.update_policy(5).unwrap();
        let floor = fs::read_to_string(dir.path().join("cpufreq/policy4/scaling_min_freq")).unwrap();
        assert_eq!(floor.trim(), "2800000");

        cf.unregister_notifier(id);
        cf.update_policy(5).unwrap();
        let floor = fs::read_to_string(dir.path().join("cpufreq/policy4/scaling_min_freq")).unwrap();
        assert_eq!(floor.trim(), "400000");
    }

    #[test]
    fn update_policy_rejects_unknown_cpu() {
        let dir = two_cluster_tree();
        let cf = SysfsCpufreq::probe(dir.path(), &ClassOverrides::default()).unwrap();
        assert!(cf.update_policy(42).is_err());
    }

    #[test]
    fn probe_fails_without_policies() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("cpufreq")).unwrap();
        assert!(SysfsCpufreq::probe(dir.path(), &ClassOverrides::default()).is_err());
    }
}
