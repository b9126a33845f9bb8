// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory write-through cache tier.
//!
//! Hot blobs are buffered in memory and published immediately; drain
//! workers flush them to disk in the background and a TTL sweeper expires
//! them in batches. Size accounting is strict: live entry bytes plus
//! outstanding reservations never exceed `max_size`, and every reservation
//! ends in either an `add` or an explicit release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use super::{metrics, Error};
use crate::metainfo::MetaInfo;

/// Delay before a failed drain item is requeued.
const DRAIN_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    pub enabled: bool,
    /// Budget for live entries plus reservations, in bytes.
    pub max_size: u64,
    pub drain_workers: usize,
    /// How many times a failed drain is requeued before the entry is
    /// dropped from memory.
    pub drain_max_retries: usize,
    pub ttl: Duration,
    pub ttl_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: 1 << 30,
            drain_workers: 10,
            drain_max_retries: 3,
            ttl: Duration::from_secs(5 * 60),
            ttl_interval: Duration::from_secs(60),
        }
    }
}

/// A populated memory-tier entry.
#[derive(Clone)]
pub struct CacheEntry {
    pub name: String,
    pub data: Bytes,
    pub metainfo: MetaInfo,
    created_at: Instant,
}

impl CacheEntry {
    pub fn new(name: impl Into<String>, data: Bytes, metainfo: MetaInfo) -> Self {
        Self {
            name: name.into(),
            data,
            metainfo,
            created_at: Instant::now(),
        }
    }
}

/// Durable half the drain workers write to; implemented by the disk side of
/// the content-addressed store.
pub(crate) trait DrainSink: Send + Sync {
    fn persist(&self, entry: &CacheEntry) -> Result<(), Error>;
}

struct DrainItem {
    entry: CacheEntry,
    attempts: usize,
    // Every failure so far, carried with the item.
    errors: Vec<String>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    used: u64,
    reserved: u64,
}

impl Inner {
    fn publish_gauge(&self) {
        metrics::MEMORY_CACHE_USED_BYTES.set(self.used + self.reserved);
    }
}

pub struct MemoryCache {
    config: MemoryCacheConfig,
    inner: Mutex<Inner>,
    drain_tx: flume::Sender<DrainItem>,
    drain_rx: flume::Receiver<DrainItem>,
    workers: Mutex<Vec<(flume::Sender<()>, tokio::task::JoinHandle<()>)>>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Arc<Self> {
        let (drain_tx, drain_rx) = flume::unbounded();
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner::default()),
            drain_tx,
            drain_rx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Reserves `size` bytes of budget. The reservation must later be moved
    /// into an entry by [`MemoryCache::add`] or returned through
    /// [`MemoryCache::release_reservation`].
    pub fn try_reserve(&self, size: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.used + inner.reserved + size > self.config.max_size {
            return false;
        }
        inner.reserved += size;
        inner.publish_gauge();
        true
    }

    pub fn release_reservation(&self, size: u64) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(size);
        inner.publish_gauge();
    }

    /// Converts a reservation of the entry's size into a live entry.
    /// Returns false if the name is already present; the caller still owns
    /// its reservation then and must release it.
    pub fn add(&self, entry: CacheEntry) -> bool {
        let size = entry.data.len() as u64;
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&entry.name) {
            return false;
        }
        inner.reserved = inner.reserved.saturating_sub(size);
        inner.used += size;
        inner.entries.insert(entry.name.clone(), entry);
        inner.publish_gauge();
        true
    }

    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.get(name).cloned()
    }

    pub fn stat(&self, name: &str) -> Option<u64> {
        self.inner
            .lock()
            .entries
            .get(name)
            .map(|e| e.data.len() as u64)
    }

    pub fn metainfo(&self, name: &str) -> Option<MetaInfo> {
        self.inner.lock().entries.get(name).map(|e| e.metainfo.clone())
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(name) {
            Some(entry) => {
                inner.used = inner.used.saturating_sub(entry.data.len() as u64);
                inner.publish_gauge();
                true
            }
            None => false,
        }
    }

    /// Queues a drain of `entry` to disk.
    pub fn enqueue_drain(&self, entry: CacheEntry) {
        let _ = self.drain_tx.send(DrainItem {
            entry,
            attempts: 0,
            errors: Vec::new(),
        });
    }

    #[cfg(test)]
    fn drain_queue_len(&self) -> usize {
        self.drain_rx.len()
    }

    /// Removes every expired entry in one batch. Expiry is silent: nothing
    /// beyond an already-completed drain persists the data.
    fn sweep_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() > ttl)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            if let Some(entry) = inner.entries.remove(name) {
                inner.used = inner.used.saturating_sub(entry.data.len() as u64);
            }
        }
        inner.publish_gauge();
        expired.len()
    }

    /// Spawns the drain workers and the TTL sweeper.
    pub(crate) fn start(self: Arc<Self>, sink: Arc<dyn DrainSink>) {
        let mut workers = self.workers.lock();
        for _ in 0..self.config.drain_workers {
            let (stop_tx, stop_rx) = flume::bounded(1);
            let cache = Arc::clone(&self);
            let sink = Arc::clone(&sink);
            let handle = tokio::spawn(async move {
                cache.drain_loop(stop_rx, sink).await;
            });
            workers.push((stop_tx, handle));
        }

        let (stop_tx, stop_rx) = flume::bounded(1);
        let cache = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.ttl_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.recv_async() => break,
                    _ = ticker.tick() => {
                        let expired = cache.sweep_expired();
                        if expired > 0 {
                            debug!("memory cache expired {expired} entries");
                        }
                    }
                }
            }
        });
        workers.push((stop_tx, handle));
    }

    async fn drain_loop(&self, stop_rx: flume::Receiver<()>, sink: Arc<dyn DrainSink>) {
        loop {
            let mut item = tokio::select! {
                _ = stop_rx.recv_async() => break,
                item = self.drain_rx.recv_async() => match item {
                    Ok(item) => item,
                    Err(_) => break,
                },
            };

            match sink.persist(&item.entry) {
                Ok(()) => debug!("drained {} to disk", item.entry.name),
                Err(err) if err.is_file_exists() => {}
                Err(err) => {
                    item.attempts += 1;
                    item.errors.push(err.to_string());
                    if item.attempts > self.config.drain_max_retries {
                        error!(
                            "dropping {} after {} drain attempts: {}",
                            item.entry.name,
                            item.attempts,
                            item.errors.join("; ")
                        );
                        self.remove(&item.entry.name);
                        metrics::DRAIN_ERROR_TOTAL.inc();
                    } else {
                        tokio::time::sleep(DRAIN_RETRY_DELAY).await;
                        let _ = self.drain_tx.send(item);
                    }
                }
            }
        }
    }

    /// Stops workers and the sweeper, waiting for them to quiesce.
    pub async fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for (stop_tx, handle) in workers {
            let _ = stop_tx.send(());
            if let Err(err) = handle.await {
                warn!("memory cache worker failed to join: {err}");
            }
        }
    }
}
