//! Message data model: signed envelopes, content blobs and per-author logs.
//!
//! An author publishes a content blob (addressed by its hash) and a fixed
//! width envelope that binds the author, a timestamp and that content hash
//! under one signature. Envelopes and blobs travel independently; either may
//! arrive first.

mod content;
mod envelope;
mod log;

pub use content::{ComposeOptions, ContentBlob};
pub use envelope::{Envelope, VerifiedEnvelope, ENVELOPE_LEN, TIMESTAMP_LEN};
pub use log::{AuthorLog, LogEntry};
