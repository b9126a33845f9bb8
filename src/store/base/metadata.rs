// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Blob metadata sidecars.
//!
//! Each blob may carry one record per [`MetadataKind`], stored next to the
//! blob file as `<file><suffix>`. Movable kinds follow the blob when it
//! changes state; non-movable kinds are dropped by the move.

use chrono::{DateTime, TimeZone, Utc};

use crate::store::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// Serialized piece-level metainfo of the blob.
    Torrent,
    /// Wall-clock time of the last read, advanced on each read.
    LastAccess,
    /// Pin excluding the blob from TTI/TTL eviction.
    Persist,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 3] = [
        MetadataKind::Torrent,
        MetadataKind::LastAccess,
        MetadataKind::Persist,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            MetadataKind::Torrent => ".torrentmeta",
            MetadataKind::LastAccess => ".lastaccess",
            MetadataKind::Persist => ".persist",
        }
    }

    /// Whether the record travels with the blob across state transitions.
    /// A persist pin is scoped to the state it was set in.
    pub fn movable(&self) -> bool {
        match self {
            MetadataKind::Torrent | MetadataKind::LastAccess => true,
            MetadataKind::Persist => false,
        }
    }
}

pub fn encode_last_access(at: DateTime<Utc>) -> Vec<u8> {
    at.timestamp().to_string().into_bytes()
}

pub fn decode_last_access(raw: &[u8]) -> Result<DateTime<Utc>, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::Metainfo("last-access record is not utf-8".to_string()))?;
    let secs: i64 = text
        .trim()
        .parse()
        .map_err(|_| Error::Metainfo(format!("bad last-access record {text:?}")))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::Metainfo(format!("last-access timestamp {secs} out of range")))
}

pub fn encode_persist(persisted: bool) -> Vec<u8> {
    if persisted { b"1".to_vec() } else { b"0".to_vec() }
}

pub fn decode_persist(raw: &[u8]) -> bool {
    raw == b"1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_access_round_trip() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(decode_last_access(&encode_last_access(at)).unwrap(), at);
    }

    #[test]
    fn persist_round_trip() {
        assert!(decode_persist(&encode_persist(true)));
        assert!(!decode_persist(&encode_persist(false)));
        assert!(!decode_persist(b"junk"));
    }

    #[test]
    fn decode_last_access_rejects_garbage() {
        assert!(decode_last_access(b"not-a-number").is_err());
    }
}
