//! Fixed-width signed envelopes.
//!
//! Layout (all ASCII):
//!
//! ```text
//! | author (44) | signature (88) | timestamp (13) | content hash (44) |
//! ```
//!
//! The signature covers the last 57 bytes: the zero-padded decimal timestamp
//! followed by the content hash token.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{SyncError, SyncResult};
use crate::identity::{Hash, Keypair, PeerId, Signature, SIGNATURE_LEN, TOKEN_LEN};

pub const TIMESTAMP_LEN: usize = 13;
pub const ENVELOPE_LEN: usize = TOKEN_LEN + SIGNATURE_LEN + TIMESTAMP_LEN + TOKEN_LEN;

const SIGNATURE_START: usize = TOKEN_LEN;
const TIMESTAMP_START: usize = SIGNATURE_START + SIGNATURE_LEN;
const CONTENT_START: usize = TIMESTAMP_START + TIMESTAMP_LEN;
const MAX_TIMESTAMP: u64 = 9_999_999_999_999;

/// A parsed envelope. Parsing alone says nothing about authenticity; use
/// [`Envelope::verify`] for anything that will be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub author: PeerId,
    pub signature: Signature,
    pub timestamp: u64,
    pub content_hash: Hash,
}

/// An envelope whose signature has been checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedEnvelope {
    pub author: PeerId,
    pub timestamp: u64,
    pub content_hash: Hash,
    /// Hash of the envelope bytes themselves (its storage key)
    pub hash: Hash,
}

impl Envelope {
    /// Sign `timestamp ++ content_hash` with the given keypair.
    pub fn sign(keypair: &Keypair, timestamp: u64, content_hash: Hash) -> SyncResult<Self> {
        if timestamp > MAX_TIMESTAMP {
            return Err(SyncError::Serialization(format!(
                "timestamp {} does not fit in {} digits",
                timestamp, TIMESTAMP_LEN
            )));
        }
        let signature = keypair.sign(&signed_message(timestamp, &content_hash));
        Ok(Self {
            author: keypair.peer_id(),
            signature,
            timestamp,
            content_hash,
        })
    }

    /// The fixed-width wire form, [`ENVELOPE_LEN`] bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_LEN);
        out.extend_from_slice(self.author.to_base64().as_bytes());
        out.extend_from_slice(STANDARD.encode(self.signature.to_bytes()).as_bytes());
        out.extend_from_slice(&signed_message(self.timestamp, &self.content_hash));
        out
    }

    /// Structural parse: field widths, base64 and digits. No signature check.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ENVELOPE_LEN {
            return None;
        }
        let author = PeerId::from_token(&bytes[..SIGNATURE_START])?;

        let raw_sig = STANDARD
            .decode(&bytes[SIGNATURE_START..TIMESTAMP_START])
            .ok()?;
        let raw_sig: [u8; 64] = raw_sig.try_into().ok()?;
        let signature = Signature::from_bytes(&raw_sig);

        let timestamp = parse_timestamp(&bytes[TIMESTAMP_START..CONTENT_START])?;
        let content_hash = Hash::from_token(&bytes[CONTENT_START..])?;

        Some(Self {
            author,
            signature,
            timestamp,
            content_hash,
        })
    }

    /// Parse and check the signature. Any failure yields `None`.
    pub fn verify(bytes: &[u8]) -> Option<VerifiedEnvelope> {
        let envelope = Self::parse(bytes)?;
        // verify over the received bytes, not a re-encoding
        if !envelope
            .author
            .verify(&bytes[TIMESTAMP_START..], &envelope.signature)
        {
            return None;
        }
        Some(VerifiedEnvelope {
            author: envelope.author,
            timestamp: envelope.timestamp,
            content_hash: envelope.content_hash,
            hash: Hash::of(bytes),
        })
    }
}

fn signed_message(timestamp: u64, content_hash: &Hash) -> Vec<u8> {
    let mut message = format!("{:0width$}", timestamp, width = TIMESTAMP_LEN).into_bytes();
    message.extend_from_slice(&content_hash.to_token());
    message
}

fn parse_timestamp(digits: &[u8]) -> Option<u64> {
    digits.iter().try_fold(0u64, |acc, b| {
        b.is_ascii_digit()
            .then(|| acc * 10 + u64::from(b - b'0'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(ts: u64) -> (Keypair, Envelope) {
        let keypair = Keypair::from_seed(&[5u8; 32]);
        let env = Envelope::sign(&keypair, ts, Hash::of(b"content")).unwrap();
        (keypair, env)
    }

    #[test]
    fn test_envelope_is_189_bytes() {
        let (_, env) = signed(1_700_000_000_000);
        assert_eq!(ENVELOPE_LEN, 189);
        assert_eq!(env.to_bytes().len(), ENVELOPE_LEN);
    }

    #[test]
    fn test_verify_returns_fields() {
        let (keypair, env) = signed(1_700_000_000_123);
        let bytes = env.to_bytes();
        let verified = Envelope::verify(&bytes).expect("should verify");
        assert_eq!(verified.author, keypair.peer_id());
        assert_eq!(verified.timestamp, 1_700_000_000_123);
        assert_eq!(verified.content_hash, Hash::of(b"content"));
        assert_eq!(verified.hash, Hash::of(&bytes));
    }

    #[test]
    fn test_timestamp_is_zero_padded() {
        let (_, env) = signed(42);
        let bytes = env.to_bytes();
        assert_eq!(&bytes[TIMESTAMP_START..CONTENT_START], b"0000000000042");
        assert_eq!(Envelope::verify(&bytes).unwrap().timestamp, 42);
    }

    #[test]
    fn test_timestamp_too_wide_is_rejected() {
        let keypair = Keypair::from_seed(&[5u8; 32]);
        assert!(Envelope::sign(&keypair, MAX_TIMESTAMP + 1, Hash::of(b"x")).is_err());
    }

    #[test]
    fn test_tampered_timestamp_fails() {
        let (_, env) = signed(1_700_000_000_000);
        let mut bytes = env.to_bytes();
        bytes[TIMESTAMP_START + 12] = b'9';
        assert!(Envelope::parse(&bytes).is_some());
        assert!(Envelope::verify(&bytes).is_none());
    }

    #[test]
    fn test_non_digit_timestamp_fails_parse() {
        let (_, env) = signed(1_700_000_000_000);
        let mut bytes = env.to_bytes();
        bytes[TIMESTAMP_START] = b'x';
        assert!(Envelope::parse(&bytes).is_none());
    }

    #[test]
    fn test_other_author_signature_fails() {
        let (_, env) = signed(1_700_000_000_000);
        let mut bytes = env.to_bytes();
        let other = Keypair::from_seed(&[6u8; 32]).peer_id();
        bytes[..TOKEN_LEN].copy_from_slice(&other.to_token());
        assert!(Envelope::verify(&bytes).is_none());
    }

    #[test]
    fn test_wrong_length_is_not_an_envelope() {
        assert!(Envelope::verify(&[b'A'; ENVELOPE_LEN - 1]).is_none());
        assert!(Envelope::verify(b"").is_none());
    }
}
