//! Identity: the local signing keypair, peer identities and content hashes.
//!
//! Every identifier that travels on the wire is a 32-byte value rendered as
//! standard base64, which is always exactly [`TOKEN_LEN`] ASCII bytes. A
//! request token is therefore either a content hash or a peer identity, and
//! the two are indistinguishable by shape.

mod hash;
mod keypair;

pub use hash::{Hash, TOKEN_LEN};
pub use keypair::{Keypair, PeerId, SIGNATURE_LEN};

pub use ed25519_dalek::Signature;

/// Hash arbitrary bytes (SHA-256). Deterministic.
pub fn hash(bytes: &[u8]) -> Hash {
    Hash::of(bytes)
}

/// Decode a base64 token of exactly [`TOKEN_LEN`] bytes into its 32 raw bytes.
///
/// Only the canonical encoding is accepted, so a decoded token always
/// re-encodes to the same bytes.
pub(crate) fn decode_token(token: &[u8]) -> Option<[u8; 32]> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    if token.len() != TOKEN_LEN {
        return None;
    }
    let raw = STANDARD.decode(token).ok()?;
    raw.try_into().ok()
}
