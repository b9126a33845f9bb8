// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Cluster membership, resolved from DNS or a static address list.
//!
//! DNS-backed lists cache the resolved set for a TTL. A stale snapshot is
//! refreshed by the first caller past the TTL while concurrent callers keep
//! serving the stale set, so lookups never stampede the resolver.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dns and static host lists are mutually exclusive")]
    BothSourcesConfigured,
    #[error("no host list source configured")]
    NoSourceConfigured,
    #[error("invalid address {0:?}: expected host:port")]
    InvalidAddress(String),
    #[error("empty dns record for {0:?}")]
    EmptyDnsRecord(String),
    #[error("resolver: {0}")]
    Resolver(#[from] hickory_resolver::error::ResolveError),
}

/// Host list configuration. Exactly one of `dns` and `static_addrs` must be
/// set; `dns` carries the port to attach to resolved names (`name:port`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostListConfig {
    pub dns: Option<String>,
    pub static_addrs: Vec<String>,
    pub ttl: Duration,
}

impl Default for HostListConfig {
    fn default() -> Self {
        Self {
            dns: None,
            static_addrs: Vec::new(),
            ttl: Duration::from_secs(5),
        }
    }
}

impl HostListConfig {
    pub fn with_static(addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            static_addrs: addrs.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_dns(name: impl Into<String>) -> Self {
        Self {
            dns: Some(name.into()),
            ..Default::default()
        }
    }
}

enum Source {
    Static(BTreeSet<String>),
    Dns {
        name: String,
        port: u16,
        resolver: TokioAsyncResolver,
    },
}

struct Snapshot {
    addrs: BTreeSet<String>,
    taken_at: Instant,
}

/// TTL-cached membership set.
pub struct HostList {
    source: Source,
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
    refreshing: AtomicBool,
}

impl std::fmt::Debug for HostList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostList")
            .field("ttl", &self.ttl)
            .field("refreshing", &self.refreshing.load(Ordering::Relaxed))
            .finish()
    }
}

impl HostList {
    /// Builds the list and performs the initial resolution. An unparseable
    /// static address or an empty DNS answer is fatal here; once running,
    /// resolution failures only log and keep the previous snapshot.
    pub async fn new(config: HostListConfig) -> Result<Self, Error> {
        let source = match (&config.dns, config.static_addrs.is_empty()) {
            (Some(_), false) => return Err(Error::BothSourcesConfigured),
            (None, true) => return Err(Error::NoSourceConfigured),
            (None, false) => {
                for addr in &config.static_addrs {
                    parse_addr(addr)?;
                }
                Source::Static(config.static_addrs.iter().cloned().collect())
            }
            (Some(dns), true) => {
                let (name, port) = parse_addr(dns)?;
                let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
                Source::Dns {
                    name: name.to_string(),
                    port,
                    resolver,
                }
            }
        };

        let addrs = lookup(&source).await?;
        Ok(Self {
            source,
            ttl: config.ttl,
            snapshot: RwLock::new(Snapshot {
                addrs,
                taken_at: Instant::now(),
            }),
            refreshing: AtomicBool::new(false),
        })
    }

    /// Current membership. Never fails after construction: a failed refresh
    /// serves the previous snapshot.
    pub async fn resolve(&self) -> BTreeSet<String> {
        if let Source::Static(addrs) = &self.source {
            return addrs.clone();
        }

        let stale = {
            let snapshot = self.snapshot.read();
            if snapshot.taken_at.elapsed() < self.ttl {
                return snapshot.addrs.clone();
            }
            snapshot.addrs.clone()
        };

        // At most one refresh in flight; losers serve the stale snapshot.
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return stale;
        }

        let result = lookup(&self.source).await;
        self.refreshing.store(false, Ordering::Release);

        match result {
            Ok(addrs) => {
                debug!("host list refreshed: {} addresses", addrs.len());
                let mut snapshot = self.snapshot.write();
                snapshot.addrs = addrs.clone();
                snapshot.taken_at = Instant::now();
                addrs
            }
            Err(err) => {
                warn!("host list refresh failed, serving stale snapshot: {err}");
                stale
            }
        }
    }
}

async fn lookup(source: &Source) -> Result<BTreeSet<String>, Error> {
    match source {
        Source::Static(addrs) => Ok(addrs.clone()),
        Source::Dns {
            name,
            port,
            resolver,
        } => {
            let records = resolver.lookup_ip(name.as_str()).await?;
            let addrs: BTreeSet<String> =
                records.iter().map(|ip| attach_port(&ip.to_string(), *port)).collect();
            if addrs.is_empty() {
                return Err(Error::EmptyDnsRecord(name.clone()));
            }
            Ok(addrs)
        }
    }
}

/// Normalizes `host` into the canonical `host:port` form used everywhere a
/// membership address is hashed or compared.
pub fn attach_port(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

fn parse_addr(addr: &str) -> Result<(&str, u16), Error> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(Error::InvalidAddress(addr.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAddress(addr.to_string()))?;
    Ok((host, port))
}
