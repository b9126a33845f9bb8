// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::*;

use std::io::{self, Read, Write};
use std::time::Duration;

use tempfile::TempDir;

fn config(tmp: &TempDir) -> CAStoreConfig {
    CAStoreConfig {
        upload_dir: tmp.path().join("upload"),
        cache_dir: tmp.path().join("cache"),
        ..Default::default()
    }
}

fn memory_config(tmp: &TempDir, max_size: u64) -> CAStoreConfig {
    let mut config = config(tmp);
    config.memory = MemoryCacheConfig {
        enabled: true,
        max_size,
        ..Default::default()
    };
    config
}

fn upload_dir_entries(tmp: &TempDir) -> usize {
    std::fs::read_dir(tmp.path().join("upload")).unwrap().count()
}

fn read_all(mut reader: BlobReader) -> Vec<u8> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    out
}

/// Closure source over a byte slice.
fn source_of(data: Vec<u8>) -> impl CacheFileSource {
    source_fn(move |w: &mut (dyn io::Write + Send)| {
        w.write_all(&data)?;
        Ok(())
    })
}

#[tokio::test]
async fn write_cache_file_commits_verified_blob() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let data = b"the blob".to_vec();
    let name = Digest::from_bytes(&data).hex();

    cas.write_cache_file(&name, &mut source_of(data.clone()))
        .await
        .unwrap();

    assert_eq!(read_all(cas.get_cache_file_reader(&name).unwrap()), data);
    assert_eq!(cas.get_cache_file_stat(&name).unwrap().size, 8);
    assert_eq!(upload_dir_entries(&tmp), 0);
    cas.close().await;
}

#[tokio::test]
async fn digest_mismatch_leaves_no_trace() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let wrong_name = Digest::from_bytes(b"something else").hex();

    let err = cas
        .write_cache_file(&wrong_name, &mut source_of(b"the blob".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DigestMismatch { .. }));

    assert!(cas
        .get_cache_file_stat(&wrong_name)
        .unwrap_err()
        .is_not_found());
    assert_eq!(upload_dir_entries(&tmp), 0);
    cas.close().await;
}

#[tokio::test]
async fn failing_source_removes_upload_file() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let name = Digest::from_bytes(b"x").hex();

    let mut failing = source_fn(|w: &mut (dyn io::Write + Send)| {
        w.write_all(b"partial")?;
        anyhow::bail!("connection reset")
    });
    assert!(cas.write_cache_file(&name, &mut failing).await.is_err());
    assert_eq!(upload_dir_entries(&tmp), 0);
    cas.close().await;
}

#[tokio::test]
async fn duplicate_commit_succeeds() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let data = b"same bytes".to_vec();
    let name = Digest::from_bytes(&data).hex();

    cas.write_cache_file(&name, &mut source_of(data.clone()))
        .await
        .unwrap();
    cas.write_cache_file(&name, &mut source_of(data))
        .await
        .unwrap();
    assert_eq!(upload_dir_entries(&tmp), 0);
    cas.close().await;
}

#[tokio::test]
async fn manual_upload_flow() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let data = b"manual".to_vec();
    let cache_name = Digest::from_bytes(&data).hex();
    let upload_name = crate::utils::random_hex(32);

    cas.create_upload_file(&upload_name, 0).unwrap();
    cas.get_upload_file_read_writer(&upload_name)
        .unwrap()
        .write_all(&data)
        .unwrap();
    cas.move_upload_file_to_cache(&upload_name, &cache_name)
        .unwrap();

    assert_eq!(read_all(cas.get_cache_file_reader(&cache_name).unwrap()), data);
    assert_eq!(upload_dir_entries(&tmp), 0);
    cas.close().await;
}

#[tokio::test]
async fn delete_upload_file_discards_in_progress_write() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let upload_name = crate::utils::random_hex(32);

    cas.create_upload_file(&upload_name, 16).unwrap();
    cas.delete_upload_file(&upload_name).unwrap();
    assert_eq!(upload_dir_entries(&tmp), 0);
    cas.close().await;
}

#[tokio::test]
async fn skip_hash_verification_accepts_any_content() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = config(&tmp);
    cfg.skip_hash_verification = true;
    let cas = CAStore::new(cfg).unwrap();
    let unrelated_name = Digest::from_bytes(b"unrelated").hex();

    cas.write_cache_file(&unrelated_name, &mut source_of(b"whatever".to_vec()))
        .await
        .unwrap();
    assert_eq!(cas.get_cache_file_stat(&unrelated_name).unwrap().size, 8);
    cas.close().await;
}

#[tokio::test]
async fn upload_root_is_wiped_on_startup() {
    let tmp = TempDir::new().unwrap();
    let upload_dir = tmp.path().join("upload");
    std::fs::create_dir_all(&upload_dir).unwrap();
    std::fs::write(upload_dir.join("stale"), b"leftover").unwrap();

    let cas = CAStore::new(config(&tmp)).unwrap();
    assert_eq!(upload_dir_entries(&tmp), 0);
    cas.close().await;
}

#[tokio::test]
async fn create_cache_file_copies_reader() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let data = b"streamed in".to_vec();
    let name = Digest::from_bytes(&data).hex();

    cas.create_cache_file(&name, &mut data.as_slice()).unwrap();
    assert_eq!(read_all(cas.get_cache_file_reader(&name).unwrap()), data);
    cas.close().await;
}

#[tokio::test]
async fn reads_advance_last_access() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let data = b"tracked".to_vec();
    let name = Digest::from_bytes(&data).hex();
    cas.write_cache_file(&name, &mut source_of(data)).await.unwrap();

    assert_eq!(
        cas.get_cache_file_metadata(&name, MetadataKind::LastAccess)
            .unwrap(),
        None
    );
    let _ = cas.get_cache_file_reader(&name).unwrap();
    let raw = cas
        .get_cache_file_metadata(&name, MetadataKind::LastAccess)
        .unwrap()
        .expect("last access recorded");
    decode_last_access(&raw).unwrap();
    cas.close().await;
}

#[tokio::test]
async fn metainfo_disk_path_writes_sidecar() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(config(&tmp)).unwrap();
    let data = vec![9u8; 95];
    let name = Digest::from_bytes(&data).hex();

    let metainfo = cas
        .write_blob_to_cache_with_metainfo(&name, 95, &mut source_of(data), 10)
        .await
        .unwrap();
    assert_eq!(metainfo.num_pieces(), 10);
    assert_eq!(metainfo.total_size(), 95);

    let sidecar = cas
        .get_cache_file_metadata(&name, MetadataKind::Torrent)
        .unwrap()
        .expect("sidecar written");
    assert_eq!(sidecar, metainfo.serialize().unwrap());
    cas.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn metainfo_memory_path_publishes_then_drains() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(memory_config(&tmp, 1 << 20)).unwrap();
    let data = vec![7u8; 64];
    let name = Digest::from_bytes(&data).hex();

    let metainfo = cas
        .write_blob_to_cache_with_metainfo(&name, 64, &mut source_of(data.clone()), 16)
        .await
        .unwrap();

    // Served from memory immediately.
    assert_eq!(cas.get_cache_file_stat(&name).unwrap().size, 64);
    assert_eq!(read_all(cas.get_cache_file_reader(&name).unwrap()), data);
    assert_eq!(
        cas.get_cache_file_metadata(&name, MetadataKind::Torrent)
            .unwrap()
            .unwrap(),
        metainfo.serialize().unwrap()
    );
    assert_eq!(cas.list_cache_files().unwrap(), vec![name.clone()]);

    // And drained to disk shortly after.
    for _ in 0..100 {
        if cas.disk.cache_op().get_file_stat(&name).is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cas.disk.cache_op().get_file_stat(&name).unwrap().len(), 64);
    assert_eq!(
        cas.disk
            .cache_op()
            .get_file_metadata(&name, MetadataKind::Torrent)
            .unwrap()
            .unwrap(),
        metainfo.serialize().unwrap()
    );
    cas.close().await;
}

#[tokio::test]
async fn metainfo_falls_back_to_disk_when_reservation_fails() {
    let tmp = TempDir::new().unwrap();
    // Budget too small for the blob: reservation fails, disk path runs.
    let cas = CAStore::new(memory_config(&tmp, 16)).unwrap();
    let data = vec![5u8; 64];
    let name = Digest::from_bytes(&data).hex();

    cas.write_blob_to_cache_with_metainfo(&name, 64, &mut source_of(data.clone()), 16)
        .await
        .unwrap();

    assert!(cas.memory.as_ref().unwrap().get(&name).is_none());
    assert_eq!(cas.disk.cache_op().get_file_stat(&name).unwrap().len(), 64);
    cas.close().await;
}

#[tokio::test]
async fn memory_write_error_releases_reservation() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(memory_config(&tmp, 64)).unwrap();
    let name = Digest::from_bytes(b"whatever").hex();

    let mut failing =
        source_fn(|_w: &mut (dyn io::Write + Send)| anyhow::bail!("backend hiccup"));
    assert!(cas
        .write_blob_to_cache_with_metainfo(&name, 64, &mut failing, 16)
        .await
        .is_err());

    // The full budget must be available again.
    assert!(cas.memory.as_ref().unwrap().try_reserve(64));
    cas.close().await;
}

#[tokio::test]
async fn list_cache_files_merges_tiers() {
    let tmp = TempDir::new().unwrap();
    let cas = CAStore::new(memory_config(&tmp, 1 << 20)).unwrap();

    let on_disk = b"on disk".to_vec();
    let disk_name = Digest::from_bytes(&on_disk).hex();
    cas.write_cache_file(&disk_name, &mut source_of(on_disk))
        .await
        .unwrap();

    let in_memory = b"in memory".to_vec();
    let mem_name = Digest::from_bytes(&in_memory).hex();
    cas.write_blob_to_cache_with_metainfo(&mem_name, 9, &mut source_of(in_memory), 4)
        .await
        .unwrap();

    let mut expected = vec![disk_name, mem_name];
    expected.sort();
    assert_eq!(cas.list_cache_files().unwrap(), expected);
    cas.close().await;
}
