//! Ed25519 keypair and peer identities.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Hash;
use crate::error::{SyncError, SyncResult};

/// Width of a base64-encoded Ed25519 signature.
pub const SIGNATURE_LEN: usize = 88;

/// The local signing identity. Never leaves the process except through
/// [`ContentStore::save_keypair`](crate::storage::ContentStore::save_keypair).
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> SyncResult<Self> {
        // getrandom directly, avoiding rand_core version conflicts with ed25519-dalek
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| SyncError::Identity(format!("no entropy available: {}", e)))?;
        Ok(Self::from_seed(&seed))
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Restore a keypair from its stored seed bytes
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        let seed: [u8; 32] = bytes.try_into().map_err(|_| {
            SyncError::Identity(format!("expected 32 seed bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_seed(&seed))
    }

    /// Seed bytes, suitable for persistence
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Public identity derived from this keypair
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.signing.verifying_key().to_bytes())
    }

    /// Sign arbitrary bytes
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Public identity of an author or peer: an Ed25519 verifying key.
///
/// Construction validates that the bytes are a usable curve point, so a
/// `PeerId` can always be asked to verify.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Accept raw key bytes. `None` if they are not a valid Ed25519 point.
    pub fn from_bytes(bytes: [u8; 32]) -> Option<Self> {
        VerifyingKey::from_bytes(&bytes).ok().map(|_| Self(bytes))
    }

    /// The raw 32-byte verifying key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 44-byte wire token.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        super::decode_token(token).and_then(Self::from_bytes)
    }

    /// Parse a peer id as printed by [`PeerId::to_base64`].
    pub fn from_base64(s: &str) -> Option<Self> {
        Self::from_token(s.as_bytes())
    }

    /// Standard padded base64. This is how peers are named in logs and
    /// in the command line.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// The 44-byte wire token for this identity.
    pub fn to_token(&self) -> Vec<u8> {
        self.to_base64().into_bytes()
    }

    /// This identity viewed as a request token.
    ///
    /// Asking a peer for a `PeerId` token asks for that author's latest
    /// envelope, and the queue deduplicates on it like any other hash.
    pub fn as_request(&self) -> Hash {
        Hash::from_bytes(self.0)
    }

    /// Interpret a request token as a peer identity, if it is a valid key.
    pub fn from_request(hash: &Hash) -> Option<Self> {
        Self::from_bytes(*hash.as_bytes())
    }

    /// Check `signature` over `message`. Any failure is `false`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        match VerifyingKey::from_bytes(&self.0) {
            Ok(key) => key.verify(message, signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 8 chars are enough to tell peers apart in logs
        write!(f, "PeerId({})", &self.to_base64()[..8])
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base64())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let peer = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            PeerId::from_base64(&s)
        } else {
            PeerId::from_bytes(<[u8; 32]>::deserialize(deserializer)?)
        };
        peer.ok_or_else(|| serde::de::Error::custom("invalid peer id"))
    }
}
