// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Blob responsibility assignment.
//!
//! [`RendezvousHash`] scores `(key, node)` pairs; [`Ring`] composes it with
//! the host list and a health filter into the ordered replica set each blob
//! digest maps to.

use thiserror::Error;

mod metrics;
mod rendezvous;
mod ring;

pub use rendezvous::{HashFn, Node, RendezvousHash};
pub use ring::{Ring, RingConfig, RingWatcher};

#[derive(Debug, Error)]
pub enum Error {
    #[error("duplicate node {label:?}")]
    DuplicateNode { label: String },
    #[error("invalid weight for node {label:?}: must be positive")]
    InvalidWeight { label: String },
}
