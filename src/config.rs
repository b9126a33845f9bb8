// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Aggregated origin configuration.
//!
//! Every subsystem owns its config struct; this ties them together so a
//! host binary can deserialize one document and wire the node up. All
//! fields default to the values the subsystems document.

use serde::Deserialize;

use crate::dedup::DedupConfig;
use crate::healthcheck::{ActiveFilterConfig, MonitorConfig, PassiveFilterConfig};
use crate::hashring::RingConfig;
use crate::hostlist::HostListConfig;
use crate::refresher::RefresherConfig;
use crate::store::CAStoreConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Cluster membership of the origin fleet.
    pub cluster: HostListConfig,
    pub ring: RingConfig,
    pub active_health: ActiveFilterConfig,
    pub health_monitor: MonitorConfig,
    pub passive_health: PassiveFilterConfig,
    pub store: CAStoreConfig,
    pub dedup: DedupConfig,
    pub refresher: RefresherConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_match_documented_values() {
        let config = OriginConfig::default();
        assert_eq!(config.ring.max_replica, 3);
        assert_eq!(config.ring.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.cluster.ttl, Duration::from_secs(5));
        assert_eq!(config.active_health.fails, 3);
        assert_eq!(config.passive_health.fails, 3);
        assert_eq!(
            config.passive_health.fail_timeout,
            Duration::from_secs(300)
        );
        assert_eq!(config.dedup.workers, 100);
        assert_eq!(config.store.memory.drain_workers, 10);
        assert_eq!(config.store.memory.drain_max_retries, 3);
        assert_eq!(config.store.memory.ttl, Duration::from_secs(300));
        assert_eq!(config.refresher.size_limit, 0);
    }

    #[test]
    fn deserializes_partial_documents() {
        let raw = serde_json::json!({
            "ring": { "max_replica": 5 },
            "refresher": { "size_limit": 1024 },
            "store": { "capacity": 100 }
        });
        let config: OriginConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.ring.max_replica, 5);
        assert_eq!(config.refresher.size_limit, 1024);
        assert_eq!(config.store.capacity, 100);
        // Untouched sections keep their defaults.
        assert_eq!(config.dedup.workers, 100);
    }
}
