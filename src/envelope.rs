//! The decoded change envelope produced by the server-side output plugin.
//!
//! The wire client treats payloads as opaque bytes; this is the one place
//! that looks inside, and only far enough to route a change: its scope and
//! its position (commit LSN plus index within the commit). Row images ride
//! along untouched.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sequence::Sequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One change as emitted by the output plugin, JSON-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub operation: ChangeOperation,
    pub table: String,
    /// The routing scope; empty means the default, unscoped stream.
    #[serde(default)]
    pub scope: String,
    /// LSN of the commit this change belongs to.
    #[serde(rename = "commitSequence")]
    pub commit_sequence: u64,
    /// Position of this change within its commit.
    #[serde(rename = "commitIndex")]
    pub commit_index: u32,
    #[serde(rename = "newRow", default, skip_serializing_if = "Option::is_none")]
    pub new_row: Option<serde_json::Value>,
    #[serde(rename = "oldRow", default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<serde_json::Value>,
    /// Commit time, seconds since the Unix epoch. Zero when the plugin did
    /// not record one.
    #[serde(default)]
    pub timestamp: i64,
}

impl ChangeEnvelope {
    pub fn decode(data: &[u8]) -> Result<ChangeEnvelope> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The unique position of this change in the stream.
    pub fn sequence(&self) -> Sequence {
        Sequence::new(self.commit_sequence, self.commit_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_minimal_envelope() {
        let json = br#"{
            "operation": "insert",
            "table": "public.users",
            "commitSequence": 1000,
            "commitIndex": 2,
            "newRow": {"id": 7, "name": "alice"}
        }"#;
        let env = ChangeEnvelope::decode(json).unwrap();
        assert_eq!(env.operation, ChangeOperation::Insert);
        assert_eq!(env.scope, "");
        assert_eq!(env.sequence(), Sequence::new(1000, 2));
        assert!(env.old_row.is_none());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let env = ChangeEnvelope {
            operation: ChangeOperation::Delete,
            table: "t".to_string(),
            scope: "tenant-1".to_string(),
            commit_sequence: 42,
            commit_index: 0,
            new_row: None,
            old_row: Some(serde_json::json!({"id": 1})),
            timestamp: 1_700_000_000,
        };
        let bytes = env.encode().unwrap();
        let back = ChangeEnvelope::decode(&bytes).unwrap();
        assert_eq!(back.scope, "tenant-1");
        assert_eq!(back.sequence(), env.sequence());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(ChangeEnvelope::decode(b"not json").is_err());
    }
}
