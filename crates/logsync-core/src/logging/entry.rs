//! One JSONL log record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Self-contained log line. Appending whole lines keeps files readable even
/// when a process dies mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 with milliseconds, UTC
    pub ts: String,
    pub level: String,
    pub node: String,
    /// Module path the event came from
    pub target: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, outermost first, joined with " > "
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogRecord {
    pub fn new(
        level: impl Into<String>,
        node: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            node: node.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization() {
        let record = LogRecord::new("info", "alice", "logsync_core::node", "Node started");
        let json = record.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("\"node\":\"alice\""));
        assert!(!json.contains("\"fields\""));

        let parsed = LogRecord::from_json_line(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_with_fields_and_span() {
        let record = LogRecord::new("debug", "bob", "logsync_core::queue", "Queue drained")
            .with_fields(serde_json::json!({ "sent": 3 }))
            .with_span("router > ingest");
        let json = record.to_json_line().unwrap();
        assert!(json.contains("\"sent\":3"));
        assert!(json.contains("\"span\":\"router > ingest\""));
    }
}
