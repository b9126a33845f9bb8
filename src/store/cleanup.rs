// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! TTI/TTL and disk-pressure-driven eviction.
//!
//! The [`CleanupManager`] runs one job per registered store view. A job
//! deletes entries whose modification time exceeds the effective TTL or
//! whose last access exceeds the TTI, switching to a shorter TTL under disk
//! pressure. Persist-pinned entries are silently skipped; every other
//! failure is logged and the scan continues.

use std::cmp::Ordering;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use super::{metrics, Error};
use crate::utils::dir_size;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub disabled: bool,
    /// Scan cadence.
    pub interval: Duration,
    /// Time-to-idle since last access. 0 disables the idle check.
    pub tti: Duration,
    /// Time-to-live since last modification. 0 disables the TTL check.
    pub ttl: Duration,
    /// Disk utilisation percentage at which `aggressive_ttl` replaces
    /// `ttl`. 0 disables aggressive mode.
    pub aggressive_threshold: u8,
    pub aggressive_ttl: Duration,
    /// Priority-ordered deletion under pressure stops once utilisation
    /// drops below this percentage.
    pub aggressive_lower_threshold: u8,
    /// Capacity in bytes backing the default disk-usage probe. 0 disables
    /// utilisation tracking (and with it aggressive mode).
    pub disk_capacity: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval: Duration::from_secs(30 * 60),
            tti: Duration::from_secs(6 * 60 * 60),
            ttl: Duration::from_secs(0),
            aggressive_threshold: 0,
            aggressive_ttl: Duration::from_secs(60 * 60),
            aggressive_lower_threshold: 75,
            disk_capacity: 0,
        }
    }
}

/// Store view a cleanup job scans. The content-addressed store exposes its
/// cache state through this.
pub trait CleanupView: Send + Sync {
    fn name(&self) -> &str;
    fn list_names(&self) -> Result<Vec<String>, Error>;
    fn stat(&self, name: &str) -> Result<fs::Metadata, Error>;
    fn last_access_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, Error>;
    fn delete(&self, name: &str) -> Result<(), Error>;
}

/// Disk utilisation probe, injectable so tests can fake pressure.
pub trait DiskUsage: Send + Sync {
    fn percent_used(&self) -> anyhow::Result<u8>;
}

/// Default probe: bytes under `root` against a configured capacity.
pub struct CapacityDiskUsage {
    root: PathBuf,
    capacity_bytes: u64,
}

impl CapacityDiskUsage {
    pub fn new(root: PathBuf, capacity_bytes: u64) -> Self {
        Self {
            root,
            capacity_bytes,
        }
    }
}

impl DiskUsage for CapacityDiskUsage {
    fn percent_used(&self) -> anyhow::Result<u8> {
        if self.capacity_bytes == 0 {
            return Ok(0);
        }
        let used = dir_size(&self.root)?;
        Ok((used.saturating_mul(100) / self.capacity_bytes).min(100) as u8)
    }
}

/// Deletion candidate handed to the aggressive-mode comparator.
pub struct Candidate {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
    pub last_access: Option<DateTime<Utc>>,
}

/// Orders aggressive-mode candidates; earliest sorts first and is deleted
/// first.
pub type PriorityFn = Arc<dyn Fn(&Candidate, &Candidate) -> Ordering + Send + Sync>;

/// A single cleanup job over one view.
pub struct CleanupJob {
    config: CleanupConfig,
    view: Arc<dyn CleanupView>,
    disk: Arc<dyn DiskUsage>,
    priority: Option<PriorityFn>,
}

impl CleanupJob {
    pub fn new(
        config: CleanupConfig,
        view: Arc<dyn CleanupView>,
        disk: Arc<dyn DiskUsage>,
        priority: Option<PriorityFn>,
    ) -> Self {
        Self {
            config,
            view,
            disk,
            priority,
        }
    }

    /// One scan pass. Returns the total bytes seen.
    pub fn run_once(&self) -> u64 {
        let aggressive = self.under_pressure();
        let effective_ttl = if aggressive {
            self.config.aggressive_ttl
        } else {
            self.config.ttl
        };

        let names = match self.view.list_names() {
            Ok(names) => names,
            Err(err) => {
                warn!("cleanup {}: listing failed: {err}", self.view.name());
                return 0;
            }
        };

        let now = Utc::now();
        let mut total_bytes = 0u64;
        for name in names {
            let stat = match self.view.stat(&name) {
                Ok(stat) => stat,
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    warn!("cleanup {}: stat {name}: {err}", self.view.name());
                    continue;
                }
            };
            total_bytes += stat.len();

            if self.expired(&name, &stat, effective_ttl, now) {
                self.delete(&name);
            }
        }

        metrics::CLEANUP_SCAN_BYTES
            .with_label_values(&[self.view.name()])
            .set(total_bytes);

        if aggressive && self.priority.is_some() {
            self.run_aggressive();
        }
        total_bytes
    }

    fn under_pressure(&self) -> bool {
        if self.config.aggressive_threshold == 0 {
            return false;
        }
        match self.disk.percent_used() {
            Ok(percent) => percent >= self.config.aggressive_threshold,
            Err(err) => {
                warn!("cleanup {}: disk usage probe: {err}", self.view.name());
                false
            }
        }
    }

    fn expired(
        &self,
        name: &str,
        stat: &fs::Metadata,
        effective_ttl: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if !effective_ttl.is_zero() {
            let age = stat
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age > effective_ttl {
                return true;
            }
        }

        if self.config.tti.is_zero() {
            return false;
        }
        match self.view.last_access_time(name) {
            // Never accessed: keep, TTL alone governs it.
            Ok(None) => false,
            Ok(Some(last_access)) => {
                now.signed_duration_since(last_access).num_seconds()
                    > self.config.tti.as_secs() as i64
            }
            Err(err) => {
                warn!("cleanup {}: last access of {name}: {err}", self.view.name());
                false
            }
        }
    }

    /// Deletes candidates in priority order until utilisation falls below
    /// the lower threshold.
    fn run_aggressive(&self) {
        let Some(priority) = &self.priority else {
            return;
        };
        let names = match self.view.list_names() {
            Ok(names) => names,
            Err(err) => {
                warn!("cleanup {}: listing failed: {err}", self.view.name());
                return;
            }
        };

        let mut candidates = Vec::with_capacity(names.len());
        for name in names {
            let Ok(stat) = self.view.stat(&name) else {
                continue;
            };
            let last_access = self.view.last_access_time(&name).unwrap_or(None);
            candidates.push(Candidate {
                name,
                size: stat.len(),
                modified: stat.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                last_access,
            });
        }
        candidates.sort_by(|a, b| priority(a, b));

        for candidate in candidates {
            match self.disk.percent_used() {
                Ok(percent) if percent < self.config.aggressive_lower_threshold => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("cleanup {}: disk usage probe: {err}", self.view.name());
                    break;
                }
            }
            self.delete(&candidate.name);
        }
    }

    fn delete(&self, name: &str) {
        match self.view.delete(name) {
            Ok(()) => {
                debug!("cleanup {}: deleted {name}", self.view.name());
                metrics::CLEANUP_DELETED_TOTAL.inc();
            }
            Err(err) if err.is_persisted() => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!("cleanup {}: delete {name}: {err}", self.view.name()),
        }
    }
}

/// Owns the cleanup jobs and their tick loops.
pub struct CleanupManager {
    jobs: Mutex<Vec<(flume::Sender<()>, tokio::task::JoinHandle<()>)>>,
}

impl CleanupManager {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Registers a job and spawns its tick loop. Disabled configs register
    /// nothing.
    pub fn add_job(
        &self,
        config: CleanupConfig,
        view: Arc<dyn CleanupView>,
        disk: Arc<dyn DiskUsage>,
        priority: Option<PriorityFn>,
    ) {
        if config.disabled {
            info!("cleanup disabled for {}", view.name());
            return;
        }
        let interval = config.interval;
        let job = CleanupJob::new(config, view, disk, priority);
        let (stop_tx, stop_rx) = flume::bounded(1);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.recv_async() => break,
                    _ = ticker.tick() => {
                        job.run_once();
                    }
                }
            }
        });
        self.jobs.lock().push((stop_tx, handle));
    }

    /// Stops every job and waits for their loops to exit.
    pub async fn stop(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock());
        for (stop_tx, handle) in jobs {
            let _ = stop_tx.send(());
            if let Err(err) = handle.await {
                warn!("cleanup job failed to join: {err}");
            }
        }
    }
}

impl Default for CleanupManager {
    fn default() -> Self {
        Self::new()
    }
}
