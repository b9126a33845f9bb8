// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Content-addressed blob store.
//!
//! Composes an upload view (in-progress writes under temporary names) and a
//! sharded cache view (committed, immutable blobs named by their digest) of
//! one [`FileStore`], with an optional in-memory write-through tier in
//! front. Every commit into the cache verifies that the bytes hash to the
//! target name, so a cached blob's content always matches its address.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::io::{Read as _, Write as _};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::warn;
use serde::Deserialize;

use super::base::{
    decode_last_access, encode_last_access, FileOp, FileState, FileStore, Layout, MetadataKind,
};
use super::cleanup::{
    Candidate, CapacityDiskUsage, CleanupConfig, CleanupManager, CleanupView, PriorityFn,
};
use super::memory::{CacheEntry, DrainSink, MemoryCache, MemoryCacheConfig};
use super::volumes::{mount_shards, VolumeConfig};
use super::Error;
use crate::digest::Digest;
use crate::metainfo::MetaInfo;
use crate::utils::{random_hex, wipe_dir};

/// Length of generated temporary upload names.
const UPLOAD_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CAStoreConfig {
    pub upload_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Optional volume roots receiving cache shards via symlink.
    pub volumes: Vec<VolumeConfig>,
    /// LRU cap on the number of cache entries. 0 disables the cap.
    pub capacity: usize,
    pub skip_hash_verification: bool,
    pub memory: MemoryCacheConfig,
    pub cleanup: CleanupConfig,
}

/// Streams blob bytes into a writer supplied by the store. The refresher
/// implements it over a backend download; [`source_fn`] adapts plain
/// closures.
#[async_trait]
pub trait CacheFileSource: Send {
    async fn write_to(&mut self, w: &mut (dyn io::Write + Send)) -> anyhow::Result<()>;
}

/// [`CacheFileSource`] over a synchronous write closure.
pub struct SourceFn<F>(F);

/// Adapts a synchronous write closure into a [`CacheFileSource`].
pub fn source_fn<F>(f: F) -> SourceFn<F>
where
    F: FnMut(&mut (dyn io::Write + Send)) -> anyhow::Result<()> + Send,
{
    SourceFn(f)
}

#[async_trait]
impl<F> CacheFileSource for SourceFn<F>
where
    F: FnMut(&mut (dyn io::Write + Send)) -> anyhow::Result<()> + Send,
{
    async fn write_to(&mut self, w: &mut (dyn io::Write + Send)) -> anyhow::Result<()> {
        (self.0)(w)
    }
}

/// Size of a cached blob, wherever it currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStat {
    pub size: u64,
}

/// Reader over a cached blob, backed by memory or disk.
pub enum BlobReader {
    Memory(io::Cursor<Bytes>),
    Disk(fs::File),
}

impl io::Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlobReader::Memory(cursor) => cursor.read(buf),
            BlobReader::Disk(file) => file.read(buf),
        }
    }
}

/// Disk half of the store. Shared with the drain workers.
struct DiskStore {
    store: FileStore,
    upload: FileState,
    cache: FileState,
    skip_hash_verification: bool,
}

impl DiskStore {
    fn upload_op(&self) -> FileOp<'_> {
        self.store.in_states(std::slice::from_ref(&self.upload))
    }

    fn cache_op(&self) -> FileOp<'_> {
        self.store.in_states(std::slice::from_ref(&self.cache))
    }

    fn create_upload_file(&self, name: &str, len: u64) -> Result<(), Error> {
        self.upload_op().create_file(name, &self.upload, len)
    }

    fn upload_read_writer(&self, name: &str) -> Result<fs::File, Error> {
        self.upload_op().get_file_read_writer(name)
    }

    fn delete_upload_file(&self, name: &str) -> Result<(), Error> {
        self.upload_op().delete_file(name)
    }

    /// Verifies the upload's bytes hash to `cache_name`, then atomically
    /// renames it into the cache shard path. The upload entry is consumed
    /// on every outcome.
    fn move_upload_file_to_cache(&self, upload_name: &str, cache_name: &str) -> Result<(), Error> {
        if !self.skip_hash_verification {
            let expected = Digest::from_hex(cache_name)
                .map_err(|_| Error::InvalidName(cache_name.to_string()))?;
            let mut reader = self.upload_op().get_file_reader(upload_name)?;
            let computed = Digest::compute(&mut reader)?;
            if computed != expected {
                let _ = self.delete_upload_file(upload_name);
                return Err(Error::DigestMismatch {
                    name: cache_name.to_string(),
                    computed: computed.hex(),
                });
            }
        }

        // Capture movable metadata, then clear the upload sidecars while
        // the upload entry still exists.
        let mut carried = Vec::new();
        self.upload_op().range_file_metadata(upload_name, |kind, raw| {
            if kind.movable() {
                carried.push((kind, raw));
            }
            Ok(())
        })?;
        for kind in MetadataKind::ALL {
            self.upload_op().delete_file_metadata(upload_name, kind)?;
        }

        let source = self.upload.path_for(upload_name)?;
        match self
            .cache_op()
            .move_file_from(cache_name, &self.cache, &source)
        {
            Ok(()) => {
                for (kind, raw) in carried {
                    if let Err(err) = self.cache_op().set_file_metadata(cache_name, kind, &raw) {
                        warn!("carrying {kind:?} metadata onto {cache_name}: {err}");
                    }
                }
                Ok(())
            }
            Err(err) if err.is_file_exists() => {
                let _ = self.delete_upload_file(upload_name);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Synchronous write-then-commit. The temporary upload file is removed
    /// on every exit path.
    fn write_cache_file_sync(
        &self,
        name: &str,
        f: &mut dyn FnMut(&mut dyn io::Write) -> anyhow::Result<()>,
    ) -> Result<(), Error> {
        let tmp = random_hex(UPLOAD_NAME_LEN);
        self.create_upload_file(&tmp, 0)?;

        let written = (|| -> Result<(), Error> {
            let mut file = self.upload_read_writer(&tmp)?;
            f(&mut file).map_err(Error::Other)
        })();
        if let Err(err) = written {
            let _ = self.delete_upload_file(&tmp);
            return Err(err);
        }

        match self.move_upload_file_to_cache(&tmp, name) {
            Ok(()) => Ok(()),
            Err(err) if err.is_file_exists() => Ok(()),
            Err(err) => {
                let _ = self.delete_upload_file(&tmp);
                Err(err)
            }
        }
    }

    /// Opens a committed blob for reading and advances its last-access
    /// record.
    fn cache_reader(&self, name: &str) -> Result<fs::File, Error> {
        let file = self.cache_op().get_file_reader(name)?;
        if let Err(err) =
            self.cache_op()
                .set_file_metadata(name, MetadataKind::LastAccess, &encode_last_access(Utc::now()))
        {
            warn!("updating last access of {name}: {err}");
        }
        Ok(file)
    }
}

impl DrainSink for DiskStore {
    fn persist(&self, entry: &CacheEntry) -> Result<(), Error> {
        self.write_cache_file_sync(&entry.name, &mut |w| {
            w.write_all(&entry.data)?;
            Ok(())
        })?;
        let raw = entry
            .metainfo
            .serialize()
            .map_err(|err| Error::Metainfo(err.to_string()))?;
        self.cache_op()
            .get_or_set_file_metadata(&entry.name, MetadataKind::Torrent, &raw)?;
        Ok(())
    }
}

struct CacheCleanupView {
    disk: Arc<DiskStore>,
}

impl CleanupView for CacheCleanupView {
    fn name(&self) -> &str {
        "cache"
    }

    fn list_names(&self) -> Result<Vec<String>, Error> {
        self.disk.cache_op().list_names()
    }

    fn stat(&self, name: &str) -> Result<fs::Metadata, Error> {
        self.disk.cache_op().get_file_stat(name)
    }

    fn last_access_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, Error> {
        match self
            .disk
            .cache_op()
            .get_file_metadata(name, MetadataKind::LastAccess)?
        {
            Some(raw) => Ok(Some(decode_last_access(&raw)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, name: &str) -> Result<(), Error> {
        self.disk.cache_op().delete_file(name)
    }
}

/// Aggressive-cleanup ordering that deletes likely-consumed blobs first: a
/// large gap between download time (mtime) and last access suggests every
/// interested peer already fetched the blob.
pub fn consumed_first(a: &Candidate, b: &Candidate) -> Ordering {
    fn gap(c: &Candidate) -> i64 {
        let Some(last_access) = c.last_access else {
            return i64::MIN;
        };
        let downloaded = c
            .modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        last_access.timestamp() - downloaded
    }
    gap(b).cmp(&gap(a))
}

/// Content-addressed store serving origin reads and writes.
pub struct CAStore {
    disk: Arc<DiskStore>,
    memory: Option<Arc<MemoryCache>>,
    cleanup: CleanupManager,
}

impl CAStore {
    /// Builds the store: wipes the upload root, mounts volume shards,
    /// starts the memory tier workers and the cache cleanup job. Must be
    /// called within a tokio runtime.
    pub fn new(config: CAStoreConfig) -> Result<Self, Error> {
        wipe_dir(&config.upload_dir)?;
        fs::create_dir_all(&config.cache_dir)?;
        if !config.volumes.is_empty() {
            mount_shards(&config.cache_dir, &config.volumes)?;
        }

        let upload = FileState::new("upload", &config.upload_dir, Layout::Flat);
        let cache = FileState::new("cache", &config.cache_dir, Layout::Sharded);
        let states = vec![upload.clone(), cache.clone()];
        let store = match NonZeroUsize::new(config.capacity) {
            None => FileStore::new(states)?,
            Some(capacity) => FileStore::with_capacity(states, cache.clone(), capacity)?,
        };

        let disk = Arc::new(DiskStore {
            store,
            upload,
            cache,
            skip_hash_verification: config.skip_hash_verification,
        });

        let memory = if config.memory.enabled {
            let memory = MemoryCache::new(config.memory.clone());
            Arc::clone(&memory).start(Arc::clone(&disk) as Arc<dyn DrainSink>);
            Some(memory)
        } else {
            None
        };

        let cleanup = CleanupManager::new();
        let priority: Option<PriorityFn> = (config.cleanup.aggressive_threshold > 0)
            .then(|| Arc::new(consumed_first) as PriorityFn);
        cleanup.add_job(
            config.cleanup.clone(),
            Arc::new(CacheCleanupView {
                disk: Arc::clone(&disk),
            }),
            Arc::new(CapacityDiskUsage::new(
                config.cache_dir.clone(),
                config.cleanup.disk_capacity,
            )),
            priority,
        );

        Ok(Self {
            disk,
            memory,
            cleanup,
        })
    }

    pub fn create_upload_file(&self, name: &str, len: u64) -> Result<(), Error> {
        self.disk.create_upload_file(name, len)
    }

    pub fn get_upload_file_read_writer(&self, name: &str) -> Result<fs::File, Error> {
        self.disk.upload_read_writer(name)
    }

    pub fn delete_upload_file(&self, name: &str) -> Result<(), Error> {
        self.disk.delete_upload_file(name)
    }

    pub fn move_upload_file_to_cache(
        &self,
        upload_name: &str,
        cache_name: &str,
    ) -> Result<(), Error> {
        self.disk.move_upload_file_to_cache(upload_name, cache_name)
    }

    /// Streams `source` into a fresh upload file and commits it as `name`.
    /// The temporary file is removed on every exit path; committing onto an
    /// already-cached blob succeeds.
    pub async fn write_cache_file<S>(&self, name: &str, source: &mut S) -> Result<(), Error>
    where
        S: CacheFileSource + ?Sized,
    {
        let tmp = random_hex(UPLOAD_NAME_LEN);
        self.disk.create_upload_file(&tmp, 0)?;

        let mut file = match self.disk.upload_read_writer(&tmp) {
            Ok(file) => file,
            Err(err) => {
                let _ = self.disk.delete_upload_file(&tmp);
                return Err(err);
            }
        };
        let written = source.write_to(&mut file).await;
        drop(file);

        match written {
            Err(err) => {
                let _ = self.disk.delete_upload_file(&tmp);
                Err(Error::Other(err))
            }
            Ok(()) => match self.disk.move_upload_file_to_cache(&tmp, name) {
                Ok(()) => Ok(()),
                Err(err) if err.is_file_exists() => Ok(()),
                Err(err) => {
                    let _ = self.disk.delete_upload_file(&tmp);
                    Err(err)
                }
            },
        }
    }

    /// Stream-copy variant of [`CAStore::write_cache_file`].
    pub fn create_cache_file(&self, name: &str, reader: &mut dyn io::Read) -> Result<(), Error> {
        self.disk.write_cache_file_sync(name, &mut |w| {
            io::copy(reader, w)?;
            Ok(())
        })
    }

    /// Writes a blob and its metainfo in one operation.
    ///
    /// With the memory tier enabled and `size` bytes reservable, the blob
    /// is buffered, published to memory immediately and drained to disk in
    /// the background; otherwise it is written straight to disk. Either way
    /// the returned metainfo matches the torrent metadata sidecar.
    pub async fn write_blob_to_cache_with_metainfo<S>(
        &self,
        name: &str,
        size: u64,
        source: &mut S,
        piece_length: u64,
    ) -> Result<MetaInfo, Error>
    where
        S: CacheFileSource + ?Sized,
    {
        let digest =
            Digest::from_hex(name).map_err(|_| Error::InvalidName(name.to_string()))?;

        if let Some(memory) = &self.memory {
            if memory.try_reserve(size) {
                let mut buf: Vec<u8> = Vec::with_capacity(size as usize);
                if let Err(err) = source.write_to(&mut buf).await {
                    memory.release_reservation(size);
                    return Err(Error::Other(err));
                }

                if !self.disk.skip_hash_verification {
                    let computed = Digest::from_bytes(&buf);
                    if computed != digest {
                        memory.release_reservation(size);
                        return Err(Error::DigestMismatch {
                            name: name.to_string(),
                            computed: computed.hex(),
                        });
                    }
                }

                let metainfo = match MetaInfo::from_blob(digest, piece_length, &buf) {
                    Ok(metainfo) => metainfo,
                    Err(err) => {
                        memory.release_reservation(size);
                        return Err(Error::Metainfo(err.to_string()));
                    }
                };

                if buf.len() as u64 != size {
                    // The reservation no longer matches reality; fall back
                    // to a synchronous disk write of the buffered bytes.
                    warn!(
                        "blob {name} was {} bytes, {} reserved; writing through to disk",
                        buf.len(),
                        size
                    );
                    memory.release_reservation(size);
                    self.disk.write_cache_file_sync(name, &mut |w| {
                        w.write_all(&buf)?;
                        Ok(())
                    })?;
                    let stored = self.disk.cache_op().get_or_set_file_metadata(
                        name,
                        MetadataKind::Torrent,
                        &metainfo.serialize().map_err(|e| Error::Metainfo(e.to_string()))?,
                    )?;
                    return MetaInfo::deserialize(&stored)
                        .map_err(|e| Error::Metainfo(e.to_string()));
                }

                let entry = CacheEntry::new(name, Bytes::from(buf), metainfo.clone());
                if memory.add(entry.clone()) {
                    memory.enqueue_drain(entry);
                } else {
                    // Duplicate name: someone else published it first.
                    memory.release_reservation(size);
                }
                return Ok(metainfo);
            }
        }

        self.write_cache_file(name, source).await?;
        let mut reader = self.disk.cache_reader(name)?;
        let metainfo = MetaInfo::from_reader(digest, piece_length, &mut reader)
            .map_err(|err| Error::Metainfo(err.to_string()))?;
        let stored = self.disk.cache_op().get_or_set_file_metadata(
            name,
            MetadataKind::Torrent,
            &metainfo.serialize().map_err(|e| Error::Metainfo(e.to_string()))?,
        )?;
        MetaInfo::deserialize(&stored).map_err(|e| Error::Metainfo(e.to_string()))
    }

    /// Opens a cached blob, preferring the memory tier.
    pub fn get_cache_file_reader(&self, name: &str) -> Result<BlobReader, Error> {
        if let Some(memory) = &self.memory {
            if let Some(entry) = memory.get(name) {
                return Ok(BlobReader::Memory(io::Cursor::new(entry.data)));
            }
        }
        Ok(BlobReader::Disk(self.disk.cache_reader(name)?))
    }

    pub fn get_cache_file_stat(&self, name: &str) -> Result<CacheStat, Error> {
        if let Some(memory) = &self.memory {
            if let Some(size) = memory.stat(name) {
                return Ok(CacheStat { size });
            }
        }
        let stat = self.disk.cache_op().get_file_stat(name)?;
        Ok(CacheStat { size: stat.len() })
    }

    /// Reads a metadata record of a cached blob. For memory-resident blobs
    /// the torrent record is a fresh serialization of the stored metainfo,
    /// byte-for-byte identical to what the drain writes to disk.
    pub fn get_cache_file_metadata(
        &self,
        name: &str,
        kind: MetadataKind,
    ) -> Result<Option<Vec<u8>>, Error> {
        if let Some(memory) = &self.memory {
            if let Some(metainfo) = memory.metainfo(name) {
                if kind == MetadataKind::Torrent {
                    return metainfo
                        .serialize()
                        .map(Some)
                        .map_err(|err| Error::Metainfo(err.to_string()));
                }
                // Other kinds only exist as disk sidecars.
                return match self.disk.cache_op().get_file_metadata(name, kind) {
                    Ok(raw) => Ok(raw),
                    Err(err) if err.is_not_found() => Ok(None),
                    Err(err) => Err(err),
                };
            }
        }
        self.disk.cache_op().get_file_metadata(name, kind)
    }

    pub fn set_cache_file_metadata(
        &self,
        name: &str,
        kind: MetadataKind,
        data: &[u8],
    ) -> Result<bool, Error> {
        self.disk.cache_op().set_file_metadata(name, kind, data)
    }

    pub fn get_or_set_cache_file_metadata(
        &self,
        name: &str,
        kind: MetadataKind,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if kind == MetadataKind::Torrent {
            if let Some(memory) = &self.memory {
                if let Some(metainfo) = memory.metainfo(name) {
                    return metainfo
                        .serialize()
                        .map_err(|err| Error::Metainfo(err.to_string()));
                }
            }
        }
        self.disk
            .cache_op()
            .get_or_set_file_metadata(name, kind, data)
    }

    /// All cached blob names, memory tier included.
    pub fn list_cache_files(&self) -> Result<Vec<String>, Error> {
        let mut names: BTreeSet<String> = self.disk.cache_op().list_names()?.into_iter().collect();
        if let Some(memory) = &self.memory {
            names.extend(memory.list_names());
        }
        Ok(names.into_iter().collect())
    }

    /// Stops drain workers and the TTL sweeper, then the cleanup jobs.
    pub async fn close(&self) {
        if let Some(memory) = &self.memory {
            memory.stop().await;
        }
        self.cleanup.stop().await;
    }
}

#[cfg(test)]
mod tests;
