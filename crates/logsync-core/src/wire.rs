//! Wire framing shared by every transport.
//!
//! Two encodings are supported:
//!
//! - [`WireFormat::Tagged`] (default): one tag byte, `0x01` for a request
//!   followed by a 44-byte token, `0x02` for a payload followed by its bytes.
//! - [`WireFormat::Legacy`]: bare bodies, told apart by length alone
//!   (see [`classify`]). A 44-byte payload is ambiguous in this mode.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::identity::{Hash, TOKEN_LEN};

const TAG_REQUEST: u8 = 0x01;
const TAG_PAYLOAD: u8 = 0x02;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Tagged,
    Legacy,
}

/// A unit of exchange: either a request for a token, or some bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Asks for the bytes stored under a hash, or an author's latest envelope
    Request(Hash),
    /// An envelope or a content blob
    Payload(Bytes),
}

impl Frame {
    pub fn is_request(&self) -> bool {
        matches!(self, Frame::Request(_))
    }

    /// Dedup key used by the network queue. Only requests collapse.
    pub fn dedup_key(&self) -> Option<Hash> {
        match self {
            Frame::Request(hash) => Some(*hash),
            Frame::Payload(_) => None,
        }
    }
}

/// Length-based disambiguation of a bare body.
///
/// Exactly token-width and a valid token is a request; anything else is a
/// payload.
pub fn classify(bytes: &[u8]) -> Frame {
    if bytes.len() == TOKEN_LEN {
        if let Some(hash) = Hash::from_token(bytes) {
            return Frame::Request(hash);
        }
    }
    Frame::Payload(Bytes::copy_from_slice(bytes))
}

/// Encode a frame for sending. Legacy requests are the bare hash token.
pub fn encode(frame: &Frame, format: WireFormat) -> Bytes {
    match (format, frame) {
        (WireFormat::Legacy, Frame::Request(hash)) => Bytes::from(hash.to_token()),
        (WireFormat::Legacy, Frame::Payload(bytes)) => bytes.clone(),
        (WireFormat::Tagged, Frame::Request(hash)) => {
            let mut buf = BytesMut::with_capacity(1 + TOKEN_LEN);
            buf.put_u8(TAG_REQUEST);
            buf.put_slice(&hash.to_token());
            buf.freeze()
        }
        (WireFormat::Tagged, Frame::Payload(bytes)) => {
            let mut buf = BytesMut::with_capacity(1 + bytes.len());
            buf.put_u8(TAG_PAYLOAD);
            buf.put_slice(bytes);
            buf.freeze()
        }
    }
}

/// Decode a received frame. Unknown tags and malformed requests yield `None`.
pub fn decode(bytes: &[u8], format: WireFormat) -> Option<Frame> {
    match format {
        WireFormat::Legacy if bytes.is_empty() => None,
        WireFormat::Legacy => Some(classify(bytes)),
        WireFormat::Tagged => {
            let (tag, body) = bytes.split_first()?;
            match *tag {
                TAG_REQUEST => Hash::from_token(body).map(Frame::Request),
                TAG_PAYLOAD => Some(Frame::Payload(Bytes::copy_from_slice(body))),
                _ => None,
            }
        }
    }
}

/// Whether an encoded frame is a request, without copying its body.
pub fn is_request_frame(bytes: &[u8], format: WireFormat) -> bool {
    match format {
        WireFormat::Tagged => bytes.first() == Some(&TAG_REQUEST),
        WireFormat::Legacy => bytes.len() == TOKEN_LEN,
    }
}
