// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Probe-driven health filtering.
//!
//! Each address carries a trend counter in `[-fails, +passes]`. Consecutive
//! probe results push the trend toward one end; health only flips once the
//! trend reaches an end, so a single flaky probe cannot flap an address in
//! or out of the healthy set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::metrics;
use super::{HealthFilter, HealthProbe};
use crate::hostlist::HostList;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActiveFilterConfig {
    /// Consecutive failed probes before an address turns unhealthy.
    pub fails: i64,
    /// Consecutive passed probes before an address turns healthy again.
    pub passes: i64,
    /// Per-probe deadline.
    pub timeout: Duration,
}

impl Default for ActiveFilterConfig {
    fn default() -> Self {
        Self {
            fails: 3,
            passes: 2,
            timeout: Duration::from_secs(3),
        }
    }
}

struct AddrHealth {
    trend: i64,
    healthy: bool,
}

impl AddrHealth {
    fn new() -> Self {
        // Unknown addresses start healthy so a fresh cluster can serve
        // before the first probe round completes.
        Self {
            trend: 0,
            healthy: true,
        }
    }

    fn record(&mut self, passed: bool, config: &ActiveFilterConfig) {
        if passed {
            self.trend = (self.trend + 1).max(1).min(config.passes);
            if self.trend >= config.passes {
                self.healthy = true;
            }
        } else {
            self.trend = (self.trend - 1).min(-1).max(-config.fails);
            if self.trend <= -config.fails {
                self.healthy = false;
            }
        }
    }
}

/// Probing health filter with consecutive-pass/fail hysteresis.
pub struct ActiveFilter {
    config: ActiveFilterConfig,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<HashMap<String, AddrHealth>>,
}

impl ActiveFilter {
    pub fn new(config: ActiveFilterConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            config,
            probe,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Probes `addrs` concurrently and returns the healthy subset.
    ///
    /// A lone address is returned unprobed: a single origin must keep
    /// serving itself no matter what its probe says.
    pub async fn run(&self, addrs: &BTreeSet<String>) -> BTreeSet<String> {
        if addrs.len() <= 1 {
            return addrs.clone();
        }

        {
            let mut state = self.state.lock();
            state.retain(|addr, _| addrs.contains(addr));
            for addr in addrs {
                state.entry(addr.clone()).or_insert_with(AddrHealth::new);
            }
        }

        let mut probes = JoinSet::new();
        for addr in addrs.iter().cloned() {
            let probe = Arc::clone(&self.probe);
            let deadline = self.config.timeout;
            probes.spawn(async move {
                let passed = match timeout(deadline, probe.check(&addr)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        debug!("probe failed for {addr}: {err}");
                        false
                    }
                    Err(_) => {
                        debug!("probe timed out for {addr}");
                        false
                    }
                };
                (addr, passed)
            });
        }

        let mut results = Vec::with_capacity(addrs.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!("probe task panicked: {err}"),
            }
        }

        let mut state = self.state.lock();
        for (addr, passed) in results {
            if !passed {
                metrics::PROBE_FAILURE_TOTAL.inc();
            }
            if let Some(health) = state.get_mut(&addr) {
                health.record(passed, &self.config);
            }
        }
        addrs
            .iter()
            .filter(|addr| state.get(*addr).map(|h| h.healthy).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HealthFilter for ActiveFilter {
    async fn run(&self, addrs: &BTreeSet<String>) -> BTreeSet<String> {
        ActiveFilter::run(self, addrs).await
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Periodically resolves the host list, runs the active filter over it and
/// publishes the healthy set for lock-free-ish readers.
pub struct Monitor {
    healthy: Arc<RwLock<BTreeSet<String>>>,
    stop_tx: flume::Sender<()>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        hostlist: Arc<HostList>,
        filter: Arc<ActiveFilter>,
    ) -> Self {
        let healthy = Arc::new(RwLock::new(BTreeSet::new()));
        let (stop_tx, stop_rx) = flume::bounded(1);

        let published = Arc::clone(&healthy);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.recv_async() => break,
                    _ = ticker.tick() => {
                        let addrs = hostlist.resolve().await;
                        let healthy_set = filter.run(&addrs).await;
                        metrics::HEALTHY_HOSTS.set(healthy_set.len() as u64);
                        *published.write() = healthy_set;
                    }
                }
            }
        });

        Self {
            healthy,
            stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Latest published healthy set.
    pub fn resolve(&self) -> BTreeSet<String> {
        self.healthy.read().clone()
    }

    /// Stops the monitor loop. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("health monitor task failed to join: {err}");
            }
        }
    }
}

#[async_trait]
impl HealthFilter for Monitor {
    async fn run(&self, addrs: &BTreeSet<String>) -> BTreeSet<String> {
        let published = self.healthy.read();
        addrs.intersection(&published).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostlist::HostListConfig;
    use parking_lot::Mutex as PlMutex;

    /// Probe whose verdict per address is scripted by the test.
    struct ScriptedProbe {
        up: PlMutex<BTreeSet<String>>,
    }

    impl ScriptedProbe {
        fn new(up: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                up: PlMutex::new(up.iter().map(|s| s.to_string()).collect()),
            })
        }

        fn set_up(&self, addr: &str, up: bool) {
            let mut set = self.up.lock();
            if up {
                set.insert(addr.to_string());
            } else {
                set.remove(addr);
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self, addr: &str) -> anyhow::Result<()> {
            if self.up.lock().contains(addr) {
                Ok(())
            } else {
                anyhow::bail!("scripted failure")
            }
        }
    }

    fn addrs(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn single_address_bypasses_probing() {
        let probe = ScriptedProbe::new(&[]);
        let filter = ActiveFilter::new(ActiveFilterConfig::default(), probe);
        let only = addrs(&["solo:80"]);
        assert_eq!(filter.run(&only).await, only);
    }

    #[tokio::test]
    async fn unhealthy_after_consecutive_failures() {
        let probe = ScriptedProbe::new(&["a:80"]);
        let config = ActiveFilterConfig {
            fails: 3,
            passes: 2,
            ..Default::default()
        };
        let filter = ActiveFilter::new(config, Arc::clone(&probe) as Arc<dyn HealthProbe>);
        let set = addrs(&["a:80", "b:80"]);

        // b fails twice: still healthy, trend has not hit -fails yet.
        assert_eq!(filter.run(&set).await, set);
        assert_eq!(filter.run(&set).await, set);
        // Third consecutive failure flips it.
        assert_eq!(filter.run(&set).await, addrs(&["a:80"]));

        // A single pass does not restore health...
        probe.set_up("b:80", true);
        assert_eq!(filter.run(&set).await, addrs(&["a:80"]));
        // ...but `passes` consecutive ones do.
        assert_eq!(filter.run(&set).await, set);
    }

    #[tokio::test]
    async fn single_failure_does_not_flip_healthy_address() {
        let probe = ScriptedProbe::new(&["a:80", "b:80"]);
        let filter = ActiveFilter::new(
            ActiveFilterConfig::default(),
            Arc::clone(&probe) as Arc<dyn HealthProbe>,
        );
        let set = addrs(&["a:80", "b:80"]);
        assert_eq!(filter.run(&set).await, set);

        probe.set_up("b:80", false);
        assert_eq!(filter.run(&set).await, set);
    }

    #[tokio::test]
    async fn removed_addresses_are_forgotten() {
        let probe = ScriptedProbe::new(&["a:80"]);
        let config = ActiveFilterConfig {
            fails: 1,
            passes: 1,
            ..Default::default()
        };
        let filter = ActiveFilter::new(config, Arc::clone(&probe) as Arc<dyn HealthProbe>);

        let set = addrs(&["a:80", "b:80"]);
        assert_eq!(filter.run(&set).await, addrs(&["a:80"]));

        // b leaves and rejoins the membership: its old unhealthy state must
        // not follow it back in.
        let without_b = addrs(&["a:80", "c:80"]);
        probe.set_up("c:80", true);
        filter.run(&without_b).await;

        probe.set_up("b:80", true);
        assert_eq!(filter.run(&set).await, set);
    }

    #[tokio::test]
    async fn monitor_publishes_and_stops() {
        let probe = ScriptedProbe::new(&["a:80", "b:80"]);
        let filter = Arc::new(ActiveFilter::new(
            ActiveFilterConfig::default(),
            probe as Arc<dyn HealthProbe>,
        ));
        let hostlist = Arc::new(
            HostList::new(HostListConfig::with_static(["a:80", "b:80"]))
                .await
                .unwrap(),
        );
        let monitor = Monitor::new(
            MonitorConfig {
                interval: Duration::from_millis(10),
            },
            hostlist,
            filter,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.resolve(), addrs(&["a:80", "b:80"]));

        monitor.stop().await;
        monitor.stop().await;
    }
}
