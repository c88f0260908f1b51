//! Chunk digests used to recognise retried chunk deliveries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 digest of one accepted chunk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDigest([u8; 32]);

impl ChunkDigest {
    /// Compute the digest of chunk bytes.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Parse from a 64 character hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidDigest(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            let pair =
                std::str::from_utf8(pair).map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Record of the most recently accepted chunk of a session.
///
/// A delivery is a replay when it targets the same offset with the same
/// length and bytes as this receipt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub offset: u64,
    pub size: u64,
    pub digest: ChunkDigest,
}

impl ChunkReceipt {
    /// Build the receipt for a chunk written at `offset`.
    pub fn for_chunk(offset: u64, data: &[u8]) -> Self {
        Self {
            offset,
            size: data.len() as u64,
            digest: ChunkDigest::compute(data),
        }
    }

    /// Whether `data` delivered at `offset` is byte-for-byte this chunk.
    pub fn matches(&self, offset: u64, data: &[u8]) -> bool {
        self.offset == offset
            && self.size == data.len() as u64
            && self.digest == ChunkDigest::compute(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_roundtrip() {
        let digest = ChunkDigest::compute(b"hello");
        assert_eq!(
            digest.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(ChunkDigest::from_hex(&digest.to_hex()).unwrap(), digest);
        assert!(ChunkDigest::from_hex("abc").is_err());
        assert!(ChunkDigest::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_receipt_matches_only_identical_delivery() {
        let receipt = ChunkReceipt::for_chunk(500, b"second half");
        assert!(receipt.matches(500, b"second half"));
        assert!(!receipt.matches(0, b"second half"));
        assert!(!receipt.matches(500, b"second hal"));
        assert!(!receipt.matches(500, b"SECOND HALF"));
    }
}
