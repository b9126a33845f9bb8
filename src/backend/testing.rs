// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory backend used by tests and local development.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{Backend, BlobInfo, Error};

/// Backend over an in-memory blob map, instrumented with call and
/// concurrency counters so tests can assert how the refresher drives it.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: Mutex<HashMap<(String, String), Bytes>>,
    stat_calls: AtomicUsize,
    download_calls: AtomicUsize,
    downloads_in_flight: AtomicUsize,
    max_concurrent_downloads: AtomicUsize,
    download_delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each download sleeps for `delay`, widening race windows for
    /// concurrency assertions.
    pub fn with_download_delay(delay: Duration) -> Self {
        Self {
            download_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn put(&self, namespace: &str, name: &str, data: Vec<u8>) {
        self.blobs
            .lock()
            .insert((namespace.to_string(), name.to_string()), Bytes::from(data));
    }

    pub fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    /// Highest number of downloads that ever ran concurrently.
    pub fn max_concurrent_downloads(&self) -> usize {
        self.max_concurrent_downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn stat(&self, namespace: &str, name: &str) -> Result<BlobInfo, Error> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock();
        let data = blobs
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or(Error::BlobNotFound)?;
        Ok(BlobInfo {
            size: data.len() as u64,
        })
    }

    async fn download(
        &self,
        namespace: &str,
        name: &str,
        w: &mut (dyn io::Write + Send),
    ) -> Result<(), Error> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.downloads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_downloads
            .fetch_max(in_flight, Ordering::SeqCst);

        let result = async {
            let data = {
                let blobs = self.blobs.lock();
                blobs
                    .get(&(namespace.to_string(), name.to_string()))
                    .cloned()
                    .ok_or(Error::BlobNotFound)?
            };
            if let Some(delay) = self.download_delay {
                tokio::time::sleep(delay).await;
            }
            w.write_all(&data).map_err(|err| Error::Other(err.into()))?;
            Ok(())
        }
        .await;

        self.downloads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
