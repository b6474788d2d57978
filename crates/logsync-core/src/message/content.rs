//! Content blobs composed by this node.
//!
//! Blobs received from peers are opaque bytes and are stored verbatim; this
//! type is only used to build our own blobs and to read the `previous` link
//! out of anyone's.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::identity::{Hash, PeerId, TOKEN_LEN};

/// JSON document carried as a content blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlob {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Content hash of the author's prior message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_author: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<Hash>,
}

/// Optional fields for [`Pipeline::compose`](crate::pipeline::Pipeline::compose).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeOptions {
    pub name: Option<String>,
    pub image: Option<String>,
    pub reply: Option<Hash>,
    pub reply_author: Option<PeerId>,
    pub edit: Option<Hash>,
}

impl ContentBlob {
    pub fn new(body: impl Into<String>, options: ComposeOptions, previous: Option<Hash>) -> Self {
        Self {
            body: body.into(),
            name: options.name,
            image: options.image,
            previous,
            reply: options.reply,
            reply_author: options.reply_author,
            edit: options.edit,
        }
    }

    /// Encode as JSON.
    ///
    /// A blob exactly one token wide gets a trailing newline so a bare
    /// length check can never mistake it for a request.
    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        let mut bytes =
            serde_json::to_vec(self).map_err(|e| SyncError::Serialization(e.to_string()))?;
        if bytes.len() == TOKEN_LEN {
            bytes.push(b'\n');
        }
        Ok(bytes)
    }

    /// Best-effort decode of a stored blob. Foreign blobs need not be ours.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_are_omitted() {
        let blob = ContentBlob::new("hello", ComposeOptions::default(), None);
        let json = String::from_utf8(blob.to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"body":"hello"}"#);
    }

    #[test]
    fn test_previous_is_encoded_as_base64() {
        let prev = Hash::of(b"earlier");
        let blob = ContentBlob::new("next", ComposeOptions::default(), Some(prev));
        let json = String::from_utf8(blob.to_bytes().unwrap()).unwrap();
        assert!(json.contains(&prev.to_base64()));
        assert_eq!(ContentBlob::parse(json.as_bytes()).unwrap().previous, Some(prev));
    }

    #[test]
    fn test_token_width_blob_is_padded() {
        // {"body":""} is 11 bytes; pad the body so the JSON is exactly 44
        let body = "x".repeat(TOKEN_LEN - 11);
        let blob = ContentBlob::new(body, ComposeOptions::default(), None);
        let bytes = blob.to_bytes().unwrap();
        assert_eq!(bytes.len(), TOKEN_LEN + 1);
        assert_eq!(ContentBlob::parse(&bytes), Some(blob));
    }

    #[test]
    fn test_parse_foreign_blob() {
        assert!(ContentBlob::parse(b"not json at all").is_none());
        let parsed = ContentBlob::parse(br#"{"body":"hi","extra":1}"#).unwrap();
        assert_eq!(parsed.body, "hi");
    }
}
