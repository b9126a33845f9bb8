// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use super::{metrics, RendezvousHash};
use crate::digest::Digest;
use crate::healthcheck::HealthFilter;
use crate::hostlist::HostList;

/// Weight given to every ring member. Origins are homogeneous; weighted
/// rendezvous still matters because it keeps reshuffling minimal when the
/// membership changes.
const DEFAULT_WEIGHT: u64 = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Maximum number of healthy replicas returned per digest.
    pub max_replica: usize,
    /// Cadence of snapshot refreshes when monitored.
    pub refresh_interval: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            max_replica: 3,
            refresh_interval: Duration::from_secs(10),
        }
    }
}

/// Notified with the full address set whenever ring membership changes.
pub trait RingWatcher: Send + Sync {
    fn membership_changed(&self, addrs: &BTreeSet<String>);
}

struct Snapshot {
    addrs: BTreeSet<String>,
    hash: RendezvousHash,
    healthy: BTreeSet<String>,
}

/// Health-aware rendezvous ring mapping digests to ordered replica sets.
///
/// The `(addrs, hasher, healthy)` triple is republished atomically by
/// [`Ring::refresh`]; readers always observe a consistent snapshot, so
/// [`Ring::locations`] is deterministic between refreshes.
pub struct Ring {
    config: RingConfig,
    hostlist: Arc<HostList>,
    filter: Arc<dyn HealthFilter>,
    watchers: Vec<Box<dyn RingWatcher>>,
    snapshot: RwLock<Snapshot>,
    stop_tx: Mutex<Option<flume::Sender<()>>>,
}

impl Ring {
    /// Builds the ring and performs the initial refresh.
    pub async fn new(
        config: RingConfig,
        hostlist: Arc<HostList>,
        filter: Arc<dyn HealthFilter>,
        watchers: Vec<Box<dyn RingWatcher>>,
    ) -> Arc<Self> {
        let ring = Arc::new(Self {
            config,
            hostlist,
            filter,
            watchers,
            snapshot: RwLock::new(Snapshot {
                addrs: BTreeSet::new(),
                hash: RendezvousHash::new(),
                healthy: BTreeSet::new(),
            }),
            stop_tx: Mutex::new(None),
        });
        ring.refresh().await;
        ring
    }

    /// Resolves membership, rebuilds the hasher if membership changed,
    /// recomputes the healthy subset and publishes the new snapshot.
    pub async fn refresh(&self) {
        let addrs = self.hostlist.resolve().await;
        let healthy = self.filter.run(&addrs).await;

        let membership_changed = {
            let snapshot = self.snapshot.read();
            snapshot.addrs != addrs
        };

        let hash = if membership_changed {
            let mut hash = RendezvousHash::new();
            for addr in &addrs {
                if let Err(err) = hash.add_node(addr.clone(), DEFAULT_WEIGHT) {
                    warn!("skipping ring node: {err}");
                }
            }
            info!("ring membership changed: {} addresses", addrs.len());
            Some(hash)
        } else {
            None
        };

        {
            let mut snapshot = self.snapshot.write();
            if let Some(hash) = hash {
                snapshot.hash = hash;
            }
            snapshot.addrs = addrs.clone();
            snapshot.healthy = healthy;
        }

        metrics::RING_REFRESH_TOTAL.inc();
        metrics::RING_MEMBERS.set(addrs.len() as u64);

        if membership_changed {
            for watcher in &self.watchers {
                watcher.membership_changed(&addrs);
            }
        }
    }

    /// Ordered replica set responsible for `digest`. Non-empty whenever the
    /// ring has members: with no healthy address the top-ranked one is
    /// returned alone, and with healthy addresses the scan extends past
    /// `max_replica` until at least one healthy member is included.
    pub fn locations(&self, digest: &Digest) -> Vec<String> {
        let snapshot = self.snapshot.read();
        let ordered = snapshot.hash.ordered_nodes(&digest.shard_id(), snapshot.hash.len());
        if ordered.is_empty() {
            return Vec::new();
        }

        if snapshot.healthy.is_empty() {
            return vec![ordered[0].label.clone()];
        }

        let mut replicas = Vec::with_capacity(self.config.max_replica);
        for node in ordered {
            if snapshot.healthy.contains(&node.label) {
                replicas.push(node.label.clone());
                if replicas.len() == self.config.max_replica {
                    break;
                }
            }
        }
        replicas
    }

    /// Membership query against the current snapshot; health is ignored.
    pub fn contains(&self, addr: &str) -> bool {
        self.snapshot.read().addrs.contains(addr)
    }

    /// All addresses in the current snapshot.
    pub fn addrs(&self) -> BTreeSet<String> {
        self.snapshot.read().addrs.clone()
    }

    /// Spawns the refresh loop. Stopped by [`Ring::stop_monitor`].
    pub fn monitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let (stop_tx, stop_rx) = flume::bounded(1);
        *self.stop_tx.lock() = Some(stop_tx);

        let ring = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ring.config.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.recv_async() => break,
                    _ = ticker.tick() => ring.refresh().await,
                }
            }
        })
    }

    pub fn stop_monitor(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::{IdentityFilter, PassiveFilter, PassiveFilterConfig};
    use crate::hostlist::HostListConfig;
    use rand::RngCore;
    use std::collections::HashMap;

    async fn static_ring(
        addrs: &[&str],
        max_replica: usize,
        filter: Arc<dyn HealthFilter>,
    ) -> Arc<Ring> {
        let hostlist = Arc::new(
            HostList::new(HostListConfig::with_static(addrs.to_vec()))
                .await
                .unwrap(),
        );
        Ring::new(
            RingConfig {
                max_replica,
                ..Default::default()
            },
            hostlist,
            filter,
            Vec::new(),
        )
        .await
    }

    fn random_digest(rng: &mut impl RngCore) -> Digest {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Digest::new(bytes)
    }

    #[tokio::test]
    async fn locations_bounded_and_non_empty() {
        let ring = static_ring(
            &["a:80", "b:80", "c:80", "d:80"],
            3,
            Arc::new(IdentityFilter),
        )
        .await;
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let locations = ring.locations(&random_digest(&mut rng));
            assert!(!locations.is_empty());
            assert!(locations.len() <= 3);
        }
    }

    #[tokio::test]
    async fn locations_deterministic_for_fixed_snapshot() {
        let ring = static_ring(&["a:80", "b:80", "c:80"], 2, Arc::new(IdentityFilter)).await;
        let d = Digest::from_bytes(b"stable");
        let first = ring.locations(&d);
        for _ in 0..20 {
            assert_eq!(ring.locations(&d), first);
        }
    }

    #[tokio::test]
    async fn replica_distribution_is_even() {
        // Six equal-weight nodes, three replicas: each node should carry
        // roughly half of all digests.
        let members = ["a:80", "b:80", "c:80", "d:80", "e:80", "f:80"];
        let ring = static_ring(&members, 3, Arc::new(IdentityFilter)).await;

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut rng = rand::thread_rng();
        let samples = 2000;
        for _ in 0..samples {
            for addr in ring.locations(&random_digest(&mut rng)) {
                *counts.entry(addr).or_default() += 1;
            }
        }

        for member in members {
            let share = counts[member] as f64 / samples as f64;
            assert!(
                (0.45..=0.55).contains(&share),
                "{member} share was {share}"
            );
        }
    }

    #[tokio::test]
    async fn contains_ignores_health() {
        let passive = Arc::new(PassiveFilter::new(PassiveFilterConfig {
            fails: 1,
            fail_timeout: Duration::from_secs(60),
        }));
        let ring = static_ring(
            &["x:80", "y:80"],
            3,
            Arc::clone(&passive) as Arc<dyn HealthFilter>,
        )
        .await;

        passive.failed("x:80");
        ring.refresh().await;
        assert!(ring.contains("x:80"));
        assert!(!ring.contains("z:80"));
    }

    #[tokio::test]
    async fn passive_eviction_and_recovery() {
        let passive = Arc::new(PassiveFilter::new(PassiveFilterConfig {
            fails: 3,
            fail_timeout: Duration::from_millis(100),
        }));
        let ring = static_ring(
            &["x:80", "y:80"],
            1,
            Arc::clone(&passive) as Arc<dyn HealthFilter>,
        )
        .await;

        // Find a digest whose top-ranked node is x.
        let mut rng = rand::thread_rng();
        let d = loop {
            let d = random_digest(&mut rng);
            if ring.locations(&d) == vec!["x:80".to_string()] {
                break d;
            }
        };

        for _ in 0..3 {
            passive.failed("x:80");
        }
        ring.refresh().await;
        assert_eq!(ring.locations(&d), vec!["y:80".to_string()]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        ring.refresh().await;
        assert_eq!(ring.locations(&d), vec!["x:80".to_string()]);
    }

    #[tokio::test]
    async fn all_unhealthy_falls_back_to_top_node() {
        // The passive filter itself never returns an empty set, so drive the
        // degenerate case with a filter that can.
        struct NoneHealthy;
        #[async_trait::async_trait]
        impl HealthFilter for NoneHealthy {
            async fn run(&self, _addrs: &BTreeSet<String>) -> BTreeSet<String> {
                BTreeSet::new()
            }
        }

        let ring = static_ring(&["a:80", "b:80", "c:80"], 3, Arc::new(NoneHealthy)).await;
        let d = Digest::from_bytes(b"orphan");
        let locations = ring.locations(&d);
        assert_eq!(locations.len(), 1);
        assert!(ring.contains(&locations[0]));
    }

    #[tokio::test]
    async fn watchers_see_membership_changes_once() {
        struct Recorder(Arc<parking_lot::Mutex<Vec<usize>>>);
        impl RingWatcher for Recorder {
            fn membership_changed(&self, addrs: &BTreeSet<String>) {
                self.0.lock().push(addrs.len());
            }
        }

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hostlist = Arc::new(
            HostList::new(HostListConfig::with_static(["a:80", "b:80"]))
                .await
                .unwrap(),
        );
        let ring = Ring::new(
            RingConfig::default(),
            hostlist,
            Arc::new(IdentityFilter),
            vec![Box::new(Recorder(Arc::clone(&seen)))],
        )
        .await;

        // The initial refresh is the only membership change; further
        // refreshes over a stable host list stay quiet.
        ring.refresh().await;
        ring.refresh().await;
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[tokio::test]
    async fn monitor_refreshes_until_stopped() {
        let ring = static_ring(&["a:80"], 1, Arc::new(IdentityFilter)).await;
        let handle = Arc::clone(&ring).monitor();
        tokio::time::sleep(Duration::from_millis(20)).await;
        ring.stop_monitor();
        handle.await.unwrap();
    }
}
