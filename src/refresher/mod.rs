// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deduplicated blob refresh.
//!
//! [`Refresher::refresh`] pulls a missing blob from its namespace's backend
//! into the cache at most once per `(namespace, digest)` fingerprint:
//! the upstream is stat'd first (a not-found answer short-circuits and is
//! negative-cached), oversize blobs are rejected before any download, and
//! the actual fetch runs on the dedup worker pool. Post-hooks observe the
//! committed cache entry and fire only on success.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::backend::{self, Backend, BackendManager};
use crate::dedup::{self, DedupConfig, RequestCache};
use crate::digest::Digest;
use crate::metainfo::Generator;
use crate::scheduler::BlobReadyHook;
use crate::store::{CAStore, CacheFileSource};

mod metrics;

#[derive(Debug, Error)]
pub enum Error {
    /// The backend does not have the blob.
    #[error("blob not found")]
    NotFound,
    /// Another refresh for the same fingerprint is in flight; retry later.
    #[error("refresh already in flight")]
    Pending,
    /// Refresh admission is exhausted; back off.
    #[error("refresh workers busy")]
    WorkersBusy,
    #[error("blob size {size} exceeds limit {limit}")]
    SizeExceeded { size: u64, limit: u64 },
    #[error("backend configuration: {0}")]
    Config(String),
    #[error("backend: {0:#}")]
    Backend(anyhow::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RefresherConfig {
    /// Reject blobs larger than this many bytes. 0 means unbounded.
    pub size_limit: u64,
}

/// Streams a backend download into the store.
struct DownloadSource {
    backend: Arc<dyn Backend>,
    namespace: String,
    name: String,
}

#[async_trait]
impl CacheFileSource for DownloadSource {
    async fn write_to(&mut self, w: &mut (dyn io::Write + Send)) -> anyhow::Result<()> {
        self.backend
            .download(&self.namespace, &self.name, w)
            .await
            .map_err(anyhow::Error::new)
    }
}

/// Fetches missing blobs from storage backends, exactly once per
/// fingerprint, and publishes them to the cache with their metainfo.
pub struct Refresher {
    config: RefresherConfig,
    backends: Arc<BackendManager>,
    cas: Arc<CAStore>,
    generator: Arc<Generator>,
    hooks: Vec<Arc<dyn BlobReadyHook>>,
    requests: Arc<RequestCache>,
}

impl Refresher {
    pub fn new(
        config: RefresherConfig,
        dedup_config: DedupConfig,
        backends: Arc<BackendManager>,
        cas: Arc<CAStore>,
        generator: Arc<Generator>,
        hooks: Vec<Arc<dyn BlobReadyHook>>,
    ) -> Self {
        let requests = RequestCache::with_not_found_predicate(
            dedup_config,
            Box::new(|err| {
                err.chain().any(|cause| {
                    matches!(
                        cause.downcast_ref::<backend::Error>(),
                        Some(backend::Error::BlobNotFound)
                    )
                })
            }),
        );
        Self {
            config,
            backends,
            cas,
            generator,
            hooks,
            requests,
        }
    }

    /// Ensures the blob is (or becomes) cached locally. Returns as soon as
    /// the refresh is dispatched; callers poll the cache or retry on
    /// [`Error::Pending`].
    pub async fn refresh(
        &self,
        namespace: &str,
        digest: &Digest,
        extra_hooks: Vec<Arc<dyn BlobReadyHook>>,
    ) -> Result<(), Error> {
        let fingerprint = format!("{namespace}:{}", digest.hex());

        // In-flight and negative-cached outcomes resolve without touching
        // the backend at all.
        if let Some(err) = self.requests.check(&fingerprint) {
            return Err(translate(err));
        }

        let client = self
            .backends
            .get(namespace)
            .map_err(|err| Error::Config(err.to_string()))?;

        let info = match client.stat(namespace, &digest.hex()).await {
            Ok(info) => info,
            Err(backend::Error::BlobNotFound) => {
                self.requests
                    .record_not_found(&fingerprint, backend::Error::BlobNotFound.to_string());
                return Err(Error::NotFound);
            }
            Err(err) => return Err(Error::Backend(anyhow::Error::new(err))),
        };

        if self.config.size_limit > 0 && info.size > self.config.size_limit {
            return Err(Error::SizeExceeded {
                size: info.size,
                limit: self.config.size_limit,
            });
        }

        let cas = Arc::clone(&self.cas);
        let generator = Arc::clone(&self.generator);
        let hooks: Vec<Arc<dyn BlobReadyHook>> =
            self.hooks.iter().chain(extra_hooks.iter()).cloned().collect();
        let digest = *digest;
        let namespace = namespace.to_string();

        let work = async move {
            let started = Instant::now();
            let mut source = DownloadSource {
                backend: client,
                namespace: namespace.clone(),
                name: digest.hex(),
            };

            let committed: anyhow::Result<()> = async {
                cas.write_cache_file(&digest.hex(), &mut source)
                    .await
                    .map_err(anyhow::Error::new)?;
                generator.generate(&digest).map_err(anyhow::Error::new)?;
                Ok(())
            }
            .await;

            match committed {
                Ok(()) => {
                    for hook in &hooks {
                        if let Err(err) = hook.on_blob_ready(&digest).await {
                            warn!("post-hook {} failed for {digest}: {err:#}", hook.name());
                        }
                    }
                    let took = started.elapsed();
                    metrics::REFRESH_DURATION_SECONDS.observe(took.as_secs_f64());
                    info!(
                        "refreshed {digest} from namespace {namespace} in {}ms",
                        took.as_millis()
                    );
                    Ok(())
                }
                Err(err) => {
                    metrics::REFRESH_FAILURE_TOTAL.inc();
                    Err(err)
                }
            }
        };

        self.requests
            .start(fingerprint, work)
            .map_err(translate)?;
        metrics::REFRESH_TOTAL.inc();
        Ok(())
    }

    /// Polls until the blob is cached, for callers that need the refresh
    /// result synchronously.
    pub async fn refresh_and_wait(
        &self,
        namespace: &str,
        digest: &Digest,
        timeout: Duration,
    ) -> Result<(), Error> {
        match self.refresh(namespace, digest, Vec::new()).await {
            Ok(()) | Err(Error::Pending) => {}
            Err(err) => return Err(err),
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.cas.get_cache_file_stat(&digest.hex()).is_ok() {
                return Ok(());
            }
            if let Some(err) = self
                .requests
                .check(&format!("{namespace}:{}", digest.hex()))
            {
                if let dedup::Error::NotFound(_) = err {
                    return Err(Error::NotFound);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Backend(anyhow::anyhow!(
                    "timed out waiting for {digest} to become cached"
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn translate(err: dedup::Error) -> Error {
    match err {
        dedup::Error::Pending => Error::Pending,
        dedup::Error::WorkersBusy => Error::WorkersBusy,
        dedup::Error::NotFound(_) => Error::NotFound,
    }
}
