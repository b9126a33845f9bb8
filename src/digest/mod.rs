// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Content digests.
//!
//! A [`Digest`] is the canonical identifier of a blob: the SHA-256 of its
//! bytes. The lowercase hex form is used verbatim as the blob's file name,
//! and prefixes of it pick the shard directories and the ring key.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Number of raw bytes in a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

/// Algorithm prefix used in the string form, e.g. `sha256:ab12..`.
const ALGO_PREFIX: &str = "sha256:";

/// Number of leading hex digits used as the ring key of a digest.
const SHARD_ID_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid digest {0:?}: expected {} hex digits", DIGEST_LEN * 2)]
    InvalidHex(String),
    #[error("unsupported digest algorithm in {0:?}")]
    UnsupportedAlgorithm(String),
}

/// SHA-256 content address of a blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    bytes: [u8; DIGEST_LEN],
}

impl Digest {
    pub fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self { bytes }
    }

    /// Hashes `data` in one shot.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            bytes: Sha256::digest(data).into(),
        }
    }

    /// Hashes everything readable from `reader`.
    pub fn compute<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut digester = Digester::new();
        io::copy(reader, &mut digester)?;
        Ok(digester.finalize())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, Error> {
        let decoded =
            hex::decode(hex_str).map_err(|_| Error::InvalidHex(hex_str.to_string()))?;
        let bytes: [u8; DIGEST_LEN] = decoded
            .try_into()
            .map_err(|_| Error::InvalidHex(hex_str.to_string()))?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.bytes
    }

    /// Canonical lowercase hex form, used as the blob file name.
    pub fn hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Key a digest hashes to on the ring: the first [`SHARD_ID_LEN`] hex
    /// digits.
    pub fn shard_id(&self) -> String {
        self.hex()[..SHARD_ID_LEN].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGO_PREFIX}{}", self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = Error;

    /// Accepts both the bare hex form and the `sha256:`-prefixed form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None => Self::from_hex(s),
            Some(("sha256", hex_str)) => Self::from_hex(hex_str),
            Some(_) => Err(Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        Digest::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 hasher. Implements [`Write`] so blob writes can be
/// teed through it for verification.
#[derive(Default)]
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest {
            bytes: self.hasher.finalize().into(),
        }
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
