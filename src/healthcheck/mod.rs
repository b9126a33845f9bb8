// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Host liveness tracking.
//!
//! Two filter flavors feed the hash ring: the active filter probes hosts
//! itself, the passive filter infers health from failures reported by
//! clients. Both only ever narrow an address set; neither invents members.
//!
//! Failure reporting is deliberately exclusive to [`PassiveFilter`]: the
//! active side has no `failed` entry point, so client-observed errors cannot
//! leak into probe-driven state.

use std::collections::BTreeSet;

use async_trait::async_trait;

pub mod active;
mod metrics;
pub mod passive;
mod probe;

pub use active::{ActiveFilter, ActiveFilterConfig, Monitor, MonitorConfig};
pub use passive::{PassiveFilter, PassiveFilterConfig};
pub use probe::{HealthProbe, HttpProbe};

/// Narrows an address set to its healthy subset.
#[async_trait]
pub trait HealthFilter: Send + Sync {
    async fn run(&self, addrs: &BTreeSet<String>) -> BTreeSet<String>;
}

/// Filter that treats every address as healthy. Used when a ring should
/// follow membership only.
pub struct IdentityFilter;

#[async_trait]
impl HealthFilter for IdentityFilter {
    async fn run(&self, addrs: &BTreeSet<String>) -> BTreeSet<String> {
        addrs.clone()
    }
}
