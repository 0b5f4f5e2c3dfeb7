//! Content hashing and the storage codec applied to part files.

use crate::storage::CONTENT_PREFIX;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lowercase hex SHA-256 of a file's uncompressed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Validate and wrap an existing hex digest.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(BackupError::Storage(format!("invalid content hash: {s}")));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage key for the object holding this content.
    pub fn storage_key(&self) -> String {
        format!("{}{}/{}", CONTENT_PREFIX, &self.0[..2], self.0)
    }

    /// Inverse of [`storage_key`](Self::storage_key); `None` for foreign keys.
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(CONTENT_PREFIX)?;
        let (shard, hash) = rest.split_once('/')?;
        let parsed = Self::parse(hash).ok()?;
        (shard == &hash[..2]).then_some(parsed)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encoding of stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Zstd { level: i32 },
}

impl Codec {
    pub fn from_config(name: &str, level: i32) -> Result<Self> {
        match name {
            "none" => Ok(Codec::None),
            "zstd" => Ok(Codec::Zstd { level }),
            other => Err(BackupError::Config(format!("unsupported compression: {other}"))),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Codec::Zstd { .. })
    }

    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data.to_vec()),
            Codec::Zstd { level } => zstd::encode_all(data, *level)
                .map_err(|e| BackupError::Compression(e.to_string())),
        }
    }
}

/// Decode a stored object according to its recorded `compressed` flag.
pub fn decode(data: &[u8], compressed: bool) -> Result<Vec<u8>> {
    if compressed {
        zstd::decode_all(data).map_err(|e| BackupError::Compression(e.to_string()))
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_of_known_input() {
        let hash = ContentHash::of(b"abc");
        assert_eq!(
            hash.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hash.storage_key(),
            "data/ba/ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn storage_key_parses_back() {
        let hash = ContentHash::of(b"part file");
        assert_eq!(ContentHash::from_storage_key(&hash.storage_key()), Some(hash));
        assert_eq!(ContentHash::from_storage_key("backups/x/manifest.json"), None);
        assert_eq!(ContentHash::from_storage_key("data/zz/nothex"), None);
    }

    #[test]
    fn parse_rejects_uppercase_and_short() {
        assert!(ContentHash::parse("ABC").is_err());
        assert!(ContentHash::parse(&"A".repeat(64)).is_err());
        assert!(ContentHash::parse(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn zstd_codec_shrinks_repetitive_data() {
        let data = vec![7u8; 64 * 1024];
        let codec = Codec::from_config("zstd", 3).unwrap();
        let encoded = codec.encode(&data).unwrap();
        assert!(encoded.len() < data.len());
        assert_eq!(decode(&encoded, true).unwrap(), data);
        assert_eq!(decode(&data, false).unwrap(), data);
    }
}
