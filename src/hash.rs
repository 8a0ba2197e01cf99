// src/hash.rs

//! Content hashing for filesystem snapshots
//!
//! Two algorithms are supported:
//! - **SHA-256**: the default, stable across releases and platforms
//! - **XXH128**: non-cryptographic, much faster for large installations
//!
//! Hashes are persisted in prefixed form (`sha256:...`), so trees hashed
//! with different algorithms never compare equal by accident.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use xxhash_rust::xxh3::Xxh3;

use crate::error::{Error, Result};

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Xxh128,
}

impl HashAlgorithm {
    /// Hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Xxh128 => 32,
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxhash" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Hash parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("invalid hash length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid hex in hash: {0}")]
    InvalidHex(String),
}

/// A content hash with its algorithm
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    algorithm: HashAlgorithm,
    value: String,
}

impl Hash {
    /// Create a validated hash value
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> std::result::Result<Self, HashError> {
        let value = value.into();
        let expected = algorithm.hex_len();
        if value.len() != expected {
            return Err(HashError::InvalidLength {
                expected,
                got: value.len(),
            });
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex(value));
        }
        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Parse `algorithm:hex`
    pub fn parse_prefixed(s: &str) -> std::result::Result<Self, HashError> {
        match s.split_once(':') {
            Some((algo, value)) => Self::new(algo.parse()?, value),
            None => Self::new(HashAlgorithm::Sha256, s),
        }
    }

    pub fn to_prefixed_string(&self) -> String {
        format!("{}:{}", self.algorithm.name(), self.value)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Incremental hasher over either algorithm
pub struct Hasher {
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Xxh128(Box<Xxh3>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Box::new(Xxh3::new())),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Xxh128(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> Hash {
        match self.state {
            HasherState::Sha256(hasher) => Hash {
                algorithm: HashAlgorithm::Sha256,
                value: format!("{:x}", hasher.finalize()),
            },
            HasherState::Xxh128(hasher) => Hash {
                algorithm: HashAlgorithm::Xxh128,
                value: format!("{:032x}", hasher.digest128()),
            },
        }
    }
}

/// Hash a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Hash {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Hash everything a reader yields
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<Hash> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// Hash a file on disk
///
/// Symlinks are not followed; a link hashes as its target path so that
/// retargeting a link registers as a modification.
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<Hash> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| Error::io(path, e))?;
    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(path).map_err(|e| Error::io(path, e))?;
        return Ok(hash_bytes(algorithm, target.to_string_lossy().as_bytes()));
    }
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    hash_reader(algorithm, &mut file).map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        let hash = hash_bytes(HashAlgorithm::Sha256, b"hello");
        assert_eq!(
            hash.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_xxh128_length() {
        let hash = hash_bytes(HashAlgorithm::Xxh128, b"hello");
        assert_eq!(hash.as_str().len(), 32);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Xxh128] {
            let mut hasher = Hasher::new(algorithm);
            hasher.update(b"hel");
            hasher.update(b"lo");
            assert_eq!(hasher.finalize(), hash_bytes(algorithm, b"hello"));
        }
    }

    #[test]
    fn test_prefixed_roundtrip() {
        let hash = hash_bytes(HashAlgorithm::Xxh128, b"content");
        let parsed = Hash::parse_prefixed(&hash.to_prefixed_string()).unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_invalid_hash_rejected() {
        assert!(matches!(
            Hash::new(HashAlgorithm::Sha256, "abc"),
            Err(HashError::InvalidLength { .. })
        ));
        assert!(matches!(
            Hash::parse_prefixed("md5:abc"),
            Err(HashError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, b"hello").unwrap();
        let hash = hash_file(HashAlgorithm::Sha256, &path).unwrap();
        assert_eq!(hash, hash_bytes(HashAlgorithm::Sha256, b"hello"));
    }
}
