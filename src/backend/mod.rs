// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Remote storage backends.
//!
//! A [`Backend`] serves blob stat and download against some object store
//! (S3, HDFS, a local archive — the origin does not care). The
//! [`BackendManager`] routes namespaces to backends by regex pattern,
//! first match wins.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

pub mod testing;

#[derive(Debug, Error)]
pub enum Error {
    /// The backend authoritatively does not have the blob.
    #[error("blob not found")]
    BlobNotFound,
    #[error("no backend configured for namespace {0:?}")]
    NamespaceNotFound(String),
    #[error("invalid namespace pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_blob_not_found(&self) -> bool {
        matches!(self, Error::BlobNotFound)
    }
}

/// Result of a stat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: u64,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Size of `name`, or [`Error::BlobNotFound`].
    async fn stat(&self, namespace: &str, name: &str) -> Result<BlobInfo, Error>;

    /// Streams the blob into `w`.
    async fn download(
        &self,
        namespace: &str,
        name: &str,
        w: &mut (dyn io::Write + Send),
    ) -> Result<(), Error>;
}

/// Ordered namespace-pattern → backend routing table.
#[derive(Default)]
pub struct BackendManager {
    backends: Vec<(Regex, Arc<dyn Backend>)>,
}

impl BackendManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `backend` for namespaces matching `pattern`. Patterns are
    /// consulted in registration order.
    pub fn register(&mut self, pattern: &str, backend: Arc<dyn Backend>) -> Result<(), Error> {
        let regex = Regex::new(pattern).map_err(|source| Error::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.backends.push((regex, backend));
        Ok(())
    }

    pub fn get(&self, namespace: &str) -> Result<Arc<dyn Backend>, Error> {
        for (pattern, backend) in &self.backends {
            if pattern.is_match(namespace) {
                return Ok(Arc::clone(backend));
            }
        }
        Err(Error::NamespaceNotFound(namespace.to_string()))
    }
}
