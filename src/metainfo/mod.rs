// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Piece-level blob metainfo.
//!
//! Peers transfer a blob piece by piece; the metainfo fixes the piece
//! length, the SHA-1 of every piece and the blob's overall digest so each
//! piece can be verified independently on arrival.

use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use thiserror::Error;

use crate::digest::Digest;
use crate::store::{CAStore, MetadataKind};

/// Piece length used when a caller does not pick one.
pub const DEFAULT_PIECE_LENGTH: u64 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid piece length {0}: must be positive")]
    InvalidPieceLength(u64),
    #[error("serialize metainfo: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("deserialize metainfo: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error(transparent)]
    Store(#[from] crate::store::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transfer metadata of a single blob.
///
/// Field order is fixed so that [`MetaInfo::serialize`] is byte-for-byte
/// reproducible for the same blob; the torrent metadata sidecar relies on
/// that for idempotent generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    digest: Digest,
    piece_length: u64,
    piece_hashes: Vec<String>,
    total_size: u64,
}

impl MetaInfo {
    /// Computes metainfo over an in-memory blob.
    pub fn from_blob(digest: Digest, piece_length: u64, data: &[u8]) -> Result<Self, Error> {
        Self::from_reader(digest, piece_length, &mut &data[..])
    }

    /// Computes metainfo by streaming `reader` through fixed-size pieces.
    pub fn from_reader<R: Read>(
        digest: Digest,
        piece_length: u64,
        reader: &mut R,
    ) -> Result<Self, Error> {
        if piece_length == 0 {
            return Err(Error::InvalidPieceLength(piece_length));
        }

        let mut piece_hashes = Vec::new();
        let mut total_size = 0u64;
        let mut piece = vec![0u8; piece_length as usize];
        loop {
            let mut filled = 0usize;
            while filled < piece.len() {
                let n = reader.read(&mut piece[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            piece_hashes.push(hex::encode(Sha1::digest(&piece[..filled])));
            total_size += filled as u64;
            if filled < piece.len() {
                break;
            }
        }

        Ok(Self {
            digest,
            piece_length,
            piece_hashes,
            total_size,
        })
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_hashes(&self) -> &[String] {
        &self.piece_hashes
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(Error::Serialize)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(Error::Deserialize)
    }
}

/// Generates metainfo for committed cache blobs and persists it as the
/// torrent metadata sidecar.
pub struct Generator {
    piece_length: u64,
    cas: Arc<CAStore>,
}

impl Generator {
    pub fn new(piece_length: u64, cas: Arc<CAStore>) -> Result<Self, Error> {
        if piece_length == 0 {
            return Err(Error::InvalidPieceLength(piece_length));
        }
        Ok(Self { piece_length, cas })
    }

    /// Reads the cached blob, computes its metainfo and writes the sidecar.
    /// Idempotent: if a sidecar already exists its contents win and are
    /// returned unchanged.
    pub fn generate(&self, digest: &Digest) -> Result<MetaInfo, Error> {
        let mut reader = self.cas.get_cache_file_reader(&digest.hex())?;
        let metainfo = MetaInfo::from_reader(*digest, self.piece_length, &mut reader)?;
        let stored = self.cas.get_or_set_cache_file_metadata(
            &digest.hex(),
            MetadataKind::Torrent,
            &metainfo.serialize()?,
        )?;
        MetaInfo::deserialize(&stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(data: &[u8]) -> Digest {
        Digest::from_bytes(data)
    }

    #[test]
    fn splits_into_expected_pieces() {
        let data = vec![1u8; 95];
        let mi = MetaInfo::from_blob(digest_of(&data), 10, &data).unwrap();
        assert_eq!(mi.num_pieces(), 10);
        assert_eq!(mi.total_size(), 95);
        assert_eq!(mi.piece_length(), 10);
        // Last piece is the 5-byte remainder; its hash differs from the
        // full pieces'.
        assert_ne!(mi.piece_hashes()[9], mi.piece_hashes()[0]);
        assert_eq!(mi.piece_hashes()[0], mi.piece_hashes()[8]);
    }

    #[test]
    fn exact_multiple_has_no_stub_piece() {
        let data = vec![2u8; 100];
        let mi = MetaInfo::from_blob(digest_of(&data), 10, &data).unwrap();
        assert_eq!(mi.num_pieces(), 10);
        assert_eq!(mi.total_size(), 100);
    }

    #[test]
    fn empty_blob_has_no_pieces() {
        let mi = MetaInfo::from_blob(digest_of(b""), 10, b"").unwrap();
        assert_eq!(mi.num_pieces(), 0);
        assert_eq!(mi.total_size(), 0);
    }

    #[test]
    fn rejects_zero_piece_length() {
        assert!(matches!(
            MetaInfo::from_blob(digest_of(b"x"), 0, b"x"),
            Err(Error::InvalidPieceLength(0))
        ));
    }

    #[test]
    fn serialization_is_stable() {
        let data = vec![3u8; 64];
        let mi = MetaInfo::from_blob(digest_of(&data), 16, &data).unwrap();
        let first = mi.serialize().unwrap();
        let second = MetaInfo::deserialize(&first).unwrap().serialize().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn piece_hashes_are_sha1() {
        let data = b"0123456789";
        let mi = MetaInfo::from_blob(digest_of(data), 10, data).unwrap();
        assert_eq!(mi.piece_hashes().len(), 1);
        assert_eq!(
            mi.piece_hashes()[0],
            hex::encode(Sha1::digest(data.as_slice()))
        );
    }
}
