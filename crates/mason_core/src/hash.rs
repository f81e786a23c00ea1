//! The 64-bit content fingerprint used to identify every file the engine
//! touches. Two files with equal hashes are treated as interchangeable.

use std::fmt;
use std::io::{self, Read};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use xxhash_rust::xxh64::Xxh64;

/// Stable serialised form: base64 of the eight little-endian digest bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(u64);

#[derive(Debug, thiserror::Error)]
#[error("invalid hash encoding: {0}")]
pub struct HashParseError(String);

impl Hash {
    pub const NULL: Hash = Hash(0);

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// An all-zero digest never comes from real data; cached entries that
    /// decode to it must be recomputed.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn to_base64(self) -> String {
        BASE64.encode(self.0.to_le_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self, HashParseError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| HashParseError(encoded.to_string()))?;
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| HashParseError(encoded.to_string()))?;
        Ok(Self(u64::from_le_bytes(bytes)))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_base64())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Hash::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Streaming hasher over the engine's fingerprint function.
pub struct Hasher(Xxh64);

impl Hasher {
    pub fn new() -> Self {
        Self(Xxh64::new(0))
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(&self) -> Hash {
        Hash(self.0.digest())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finish()
}

/// Hashes a reader to EOF with a fixed-size buffer.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<Hash> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}
