// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Blob storage.
//!
//! [`base`] is a state-partitioned file store with per-entry locking and
//! sidecar metadata; [`CAStore`] composes upload and cache views of it into
//! the content-addressed store origins serve from, with an optional
//! in-memory write-through tier and background cleanup.

use std::io;

use thiserror::Error;

pub mod base;
mod cas;
mod cleanup;
mod memory;
mod metrics;
mod volumes;

pub use base::{FileOp, FileState, FileStore, Layout, MetadataKind};
pub use cas::{
    consumed_first, source_fn, BlobReader, CAStore, CAStoreConfig, CacheFileSource, CacheStat,
    SourceFn,
};
pub use cleanup::{
    CapacityDiskUsage, Candidate, CleanupConfig, CleanupJob, CleanupManager, CleanupView,
    DiskUsage, PriorityFn,
};
pub use memory::{CacheEntry, MemoryCache, MemoryCacheConfig};
pub use volumes::VolumeConfig;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file {name:?} not found")]
    FileNotFound { name: String },
    #[error("file {name:?} already exists")]
    FileExists { name: String },
    #[error("file {name:?} in unexpected state {observed:?}")]
    WrongFileState { name: String, observed: String },
    #[error("file {name:?} is persisted")]
    FilePersisted { name: String },
    #[error("digest mismatch for {name:?}: content hashed to {computed}")]
    DigestMismatch { name: String, computed: String },
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("volume layout: {0}")]
    Volumes(String),
    #[error("metainfo: {0}")]
    Metainfo(String),
    #[error("metadata encoding: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::FileNotFound { .. } => true,
            Error::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_file_exists(&self) -> bool {
        matches!(self, Error::FileExists { .. })
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, Error::FilePersisted { .. })
    }
}
