// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Multi-volume shard layout.
//!
//! Cache shards (the 256 two-hex-digit top-level directories) can be spread
//! over several volumes. Each shard is assigned its volume by rendezvous
//! hashing over the shard name, so changing the volume set only relocates
//! the shards whose owner changed, and the assignment is reapplied
//! idempotently on every startup.

use std::fs;
use std::io;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;

use super::Error;
use crate::hashring::RendezvousHash;

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    pub location: std::path::PathBuf,
    pub weight: u64,
}

/// Ensures every shard directory exists on its assigned volume and that
/// `cache_dir/<shard>` is a symlink to it.
pub(crate) fn mount_shards(cache_dir: &Path, volumes: &[VolumeConfig]) -> Result<(), Error> {
    let mut hash = RendezvousHash::new();
    for volume in volumes {
        hash.add_node(volume.location.display().to_string(), volume.weight)
            .map_err(|err| Error::Volumes(err.to_string()))?;
    }

    let basename = cache_dir
        .file_name()
        .ok_or_else(|| Error::Volumes(format!("cache dir {} has no basename", cache_dir.display())))?
        .to_os_string();

    let mut relinked = 0usize;
    for byte in 0..=0xffu16 {
        let shard = format!("{byte:02x}");
        let owner = hash
            .ordered_nodes(&shard, 1)
            .first()
            .map(|n| n.label.clone())
            .ok_or_else(|| Error::Volumes("no volumes configured".to_string()))?;

        let source = Path::new(&owner).join(&basename).join(&shard);
        fs::create_dir_all(&source)?;

        let link = cache_dir.join(&shard);
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if fs::read_link(&link)? != source {
                    fs::remove_file(&link)?;
                    symlink_dir(&source, &link)?;
                    relinked += 1;
                }
            }
            Ok(_) => {
                return Err(Error::Volumes(format!(
                    "shard path {} exists and is not a symlink",
                    link.display()
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                symlink_dir(&source, &link)?;
                debug!("mounted shard {shard} on {owner}");
            }
            Err(err) => return Err(err.into()),
        }
    }

    if relinked > 0 {
        info!("volume set changed: relinked {relinked} shards");
    }
    Ok(())
}

#[cfg(unix)]
fn symlink_dir(source: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(not(unix))]
fn symlink_dir(_source: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "volume shard symlinks require a unix platform",
    ))
}
