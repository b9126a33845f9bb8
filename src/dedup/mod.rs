// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Single-flight request coalescing.
//!
//! [`RequestCache::start`] runs a fallible job at most once per id:
//! concurrent callers of a running id get [`Error::Pending`] immediately,
//! admission is bounded by a worker budget, and a job failing with a
//! not-found error leaves a short-lived negative entry so immediate
//! re-callers fail fast without re-dispatching.
//!
//! In-flight coalescing, the negative cache and bounded admission share one
//! mutex on purpose: splitting them invites check-then-act races between
//! the map and the admission counter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A job for this id is already running.
    #[error("request pending")]
    Pending,
    /// The worker budget is exhausted.
    #[error("all workers busy")]
    WorkersBusy,
    /// Negative-cached result from a recent run.
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum number of jobs running at once.
    pub workers: usize,
    /// How long a not-found result is served from the negative cache.
    pub not_found_ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            workers: 100,
            not_found_ttl: Duration::from_secs(30),
        }
    }
}

enum RequestState {
    Running,
    NotFound { error: String, expires: Instant },
}

/// Predicate deciding whether a job error should be negative-cached.
pub type NotFoundPredicate = Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

struct Shared {
    state: Mutex<HashMap<String, RequestState>>,
    is_not_found: NotFoundPredicate,
    not_found_ttl: Duration,
}

/// Deduplicating job cache with a bounded worker pool.
pub struct RequestCache {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

impl RequestCache {
    pub fn new(config: DedupConfig) -> Arc<Self> {
        Self::with_not_found_predicate(config, Box::new(|_| false))
    }

    pub fn with_not_found_predicate(
        config: DedupConfig,
        is_not_found: NotFoundPredicate,
    ) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.workers)),
            shared: Arc::new(Shared {
                state: Mutex::new(HashMap::new()),
                is_not_found,
                not_found_ttl: config.not_found_ttl,
            }),
        })
    }

    /// Returns the outcome a caller would get without dispatching: pending
    /// if a job is running, the cached not-found if one is fresh, `None`
    /// otherwise. Expired negative entries are dropped.
    pub fn check(&self, id: &str) -> Option<Error> {
        let mut state = self.shared.state.lock();
        match state.get(id) {
            Some(RequestState::Running) => Some(Error::Pending),
            Some(RequestState::NotFound { error, expires }) => {
                if *expires > Instant::now() {
                    Some(Error::NotFound(error.clone()))
                } else {
                    state.remove(id);
                    None
                }
            }
            None => None,
        }
    }

    /// Records a not-found outcome observed outside a job (e.g. an upstream
    /// stat), so immediate retries short-circuit.
    pub fn record_not_found(&self, id: &str, error: impl Into<String>) {
        self.shared.state.lock().insert(
            id.to_string(),
            RequestState::NotFound {
                error: error.into(),
                expires: Instant::now() + self.shared.not_found_ttl,
            },
        );
    }

    /// Dispatches `job` under `id` unless one is already running, the
    /// negative cache has a fresh entry, or no worker is available. Returns
    /// immediately; the job's result is observed through its side effects
    /// (and the negative cache).
    pub fn start<F>(&self, id: impl Into<String>, job: F) -> Result<(), Error>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.into();
        let permit = {
            let mut state = self.shared.state.lock();
            match state.get(&id) {
                Some(RequestState::Running) => return Err(Error::Pending),
                Some(RequestState::NotFound { error, expires }) => {
                    if *expires > Instant::now() {
                        return Err(Error::NotFound(error.clone()));
                    }
                    state.remove(&id);
                }
                None => {}
            }
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return Err(Error::WorkersBusy),
            };
            state.insert(id.clone(), RequestState::Running);
            permit
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = job.await;
            {
                let mut state = shared.state.lock();
                match &result {
                    Err(err) if (shared.is_not_found)(err) => {
                        state.insert(
                            id.clone(),
                            RequestState::NotFound {
                                error: err.to_string(),
                                expires: Instant::now() + shared.not_found_ttl,
                            },
                        );
                    }
                    _ => {
                        state.remove(&id);
                    }
                }
            }
            if let Err(err) = result {
                warn!("deduplicated request {id} failed: {err:#}");
            }
            drop(permit);
        });
        Ok(())
    }
}
