//! Content hashes (SHA-256, base64 on the wire).

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Width of any base64 token on the wire (hashes and peer ids).
pub const TOKEN_LEN: usize = 44;

/// SHA-256 digest of some bytes. Used as a storage key and as a request token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Hash the given bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Wrap a raw digest without rehashing.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 44-byte wire token.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        super::decode_token(token).map(Self)
    }

    /// Parse the padded base64 form, as printed by [`Hash::to_base64`].
    pub fn from_base64(s: &str) -> Option<Self> {
        Self::from_token(s.as_bytes())
    }

    /// Standard padded base64, always [`TOKEN_LEN`] characters.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// The 44-byte wire token for this hash.
    pub fn to_token(&self) -> Vec<u8> {
        self.to_base64().into_bytes()
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
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base64())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Hash::from_base64(&s).ok_or_else(|| serde::de::Error::custom("invalid base64 hash"))
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Hash)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_44_ascii_bytes() {
        let h = Hash::of(b"some content");
        let token = h.to_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.is_ascii());
        assert_eq!(Hash::from_token(&token), Some(h));
    }

    #[test]
    fn test_known_digest() {
        // sha256("") in base64
        assert_eq!(
            Hash::of(b"").to_base64(),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn test_serde_json_uses_base64() {
        let h = Hash::of(b"abc");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_base64()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_postcard_uses_raw_bytes() {
        let h = Hash::of(b"abc");
        let bytes = postcard::to_allocvec(&h).unwrap();
        assert_eq!(bytes.len(), 32);
        let back: Hash = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, h);
    }
}
