// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Origin-node core for a peer-to-peer content-addressed blob distribution
//! fleet.
//!
//! An origin seeds blobs to peers: it pulls a blob from a remote storage
//! backend on demand, caches it on disk under its content address, and
//! coordinates which origins in the cluster are responsible for which blob
//! through a rendezvous-hashed ring filtered by host health.
//!
//! The main subsystems:
//!
//! - [`hashring`] — weighted rendezvous hashing and the replica-set ring.
//! - [`hostlist`] — DNS or static cluster membership with a TTL snapshot.
//! - [`healthcheck`] — active (probing) and passive (failure-reporting)
//!   liveness filters feeding the ring.
//! - [`store`] — the state-partitioned file store, content-addressed cache,
//!   in-memory write-through tier and cleanup jobs.
//! - [`dedup`] — single-flight request coalescing with bounded admission.
//! - [`refresher`] — the deduplicated backend fetch pipeline.
//! - [`metainfo`] — piece-level blob metainfo generation.
//!
//! HTTP serving, TLS, CLI and metrics export are host concerns; this crate
//! only registers its metrics on the default `prometheus` registry and logs
//! through the `log` facade.

pub mod backend;
pub mod config;
pub mod dedup;
pub mod digest;
pub mod hashring;
pub mod healthcheck;
pub mod hostlist;
pub mod metainfo;
pub mod refresher;
pub mod scheduler;
pub mod store;
pub mod utils;

pub use config::OriginConfig;
pub use digest::Digest;
