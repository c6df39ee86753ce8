//! The record model handed to the sink by the record conversion layer.

use serde_json::Value;
use snafu::{ResultExt, Snafu};

use crate::TopicPartition;

/// Errors when interpreting raw record bytes.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ContentError {
    #[snafu(display("record bytes are not valid JSON: {source}"))]
    InvalidJson { source: serde_json::Error },
}

/// How the upstream log stamped the record's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampType {
    /// Stamped by the producer when the record was created.
    CreateTime,
    /// Stamped by the broker when the record was appended.
    LogAppendTime,
    /// The topic carries no timestamps.
    NoTimestamp,
}

impl TimestampType {
    /// Field name used when the timestamp is serialized into record
    /// metadata.
    pub fn meta_field_name(&self) -> Option<&'static str> {
        match self {
            Self::CreateTime => Some("CreateTime"),
            Self::LogAppendTime => Some("LogAppendTime"),
            Self::NoTimestamp => None,
        }
    }
}

/// A key or value as produced by the record conversion layer.
///
/// `Native` payloads come from community converters and still need parsing;
/// `Content` payloads were already shaped by the first-party converter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    /// Already-converted content.
    Content(RecordContent),
    /// Raw bytes from a community converter.
    Native(Vec<u8>),
    /// A tombstone: the converter produced no value at all.
    Null,
}

impl RecordValue {
    /// Whether this is a converter-level null (tombstone).
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Parsed record content: either a structural form or a broken envelope
/// carrying the bytes that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordContent {
    /// Successfully parsed content as an ordered sequence of nodes.
    Structured {
        /// The parsed nodes.
        data: Vec<Value>,
    },
    /// Content that could not be parsed.
    Broken {
        /// The raw bytes as received.
        data: Vec<u8>,
    },
}

impl RecordContent {
    /// Parse raw bytes into structured content.
    pub fn parse(raw: &[u8]) -> Result<Self, ContentError> {
        let node: Value = serde_json::from_slice(raw).context(InvalidJsonSnafu)?;
        Ok(Self::Structured { data: vec![node] })
    }

    /// Wrap raw bytes in a broken envelope.
    pub fn broken(raw: Vec<u8>) -> Self {
        Self::Broken { data: raw }
    }

    /// Whether this content is a broken envelope.
    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Broken { .. })
    }

    /// Whether structured content is semantically empty: no nodes, or only
    /// null nodes. Broken content is never considered empty.
    pub fn is_value_null(&self) -> bool {
        match self {
            Self::Structured { data } => data.iter().all(Value::is_null),
            Self::Broken { .. } => false,
        }
    }

    /// The bytes staged for this content.
    ///
    /// Broken envelopes stage their raw bytes unchanged. Structured content
    /// stages the human-readable rendering of its node list; this matches
    /// the long-standing on-stage format rather than a canonical encoding.
    pub fn content_bytes(&self) -> Vec<u8> {
        match self {
            Self::Structured { data } => {
                let rendered: Vec<String> = data.iter().map(ToString::to_string).collect();
                format!("[{}]", rendered.join(", ")).into_bytes()
            }
            Self::Broken { data } => data.clone(),
        }
    }
}

/// One record delivered by the upstream log, opaque to the sink except for
/// the addressed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    /// Source topic and partition.
    pub topic_partition: TopicPartition,
    /// Offset within the partition.
    pub offset: i64,
    /// Record key, if any.
    pub key: Option<RecordValue>,
    /// Record value.
    pub value: RecordValue,
    /// Log timestamp in epoch milliseconds, if stamped.
    pub timestamp: Option<i64>,
    /// How [`Self::timestamp`] was produced.
    pub timestamp_type: TimestampType,
    /// Record headers as name/value pairs.
    pub headers: Vec<(String, String)>,
}

impl SinkRecord {
    /// A keyless, headerless record; the common case in tests.
    pub fn new(topic_partition: TopicPartition, offset: i64, value: RecordValue) -> Self {
        Self {
            topic_partition,
            offset,
            key: None,
            value,
            timestamp: None,
            timestamp_type: TimestampType::NoTimestamp,
            headers: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_accepts_json_and_flags_garbage() {
        let content = RecordContent::parse(br#"{"user": 1}"#).unwrap();
        assert!(!content.is_broken());
        assert!(matches!(
            content,
            RecordContent::Structured { ref data } if data == &vec![json!({"user": 1})]
        ));

        let err = RecordContent::parse(b"not json {{").unwrap_err();
        assert!(matches!(err, ContentError::InvalidJson { .. }));
    }

    #[test]
    fn broken_envelope_keeps_raw_bytes() {
        let content = RecordContent::broken(b"\x00\x01garbage".to_vec());
        assert!(content.is_broken());
        assert!(!content.is_value_null());
        assert_eq!(content.content_bytes(), b"\x00\x01garbage".to_vec());
    }

    #[test]
    fn structured_bytes_render_the_node_list() {
        let content = RecordContent::Structured {
            data: vec![json!({"a": 1}), json!(2)],
        };
        assert_eq!(content.content_bytes(), br#"[{"a":1}, 2]"#.to_vec());
    }

    #[test]
    fn value_null_detection() {
        assert!(RecordContent::Structured { data: vec![] }.is_value_null());
        assert!(RecordContent::Structured {
            data: vec![Value::Null]
        }
        .is_value_null());
        assert!(!RecordContent::Structured {
            data: vec![json!(1)]
        }
        .is_value_null());
        assert!(RecordValue::Null.is_null());
        assert!(!RecordValue::Native(vec![]).is_null());
    }
}
