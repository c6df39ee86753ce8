//! Shaping of one record into the staged JSON line
//! `{"content":…,"meta":{…}}`.

use crate::config::SinkMetadataConfig;
use data_types::{RecordContent, RecordValue, SinkRecord};
use serde_json::{json, Map, Value};

/// Resolve a converter-level value into content the sink can stage.
///
/// First-party content passes through; native bytes are parsed, degrading
/// to a broken envelope when they are not valid JSON; tombstones carry no
/// content at all.
pub(crate) fn to_content(value: &RecordValue) -> Option<RecordContent> {
    match value {
        RecordValue::Content(content) => Some(content.clone()),
        RecordValue::Native(raw) => Some(
            RecordContent::parse(raw).unwrap_or_else(|_| RecordContent::broken(raw.clone())),
        ),
        RecordValue::Null => None,
    }
}

/// Serialize one record into its staged line, without the trailing
/// newline.
pub(crate) fn serialize_record(
    record: &SinkRecord,
    key_content: Option<&RecordContent>,
    value_content: Option<&RecordContent>,
    metadata: &SinkMetadataConfig,
) -> Result<String, serde_json::Error> {
    let content = match value_content {
        Some(RecordContent::Structured { data }) => match data.as_slice() {
            [single] => single.clone(),
            nodes => Value::Array(nodes.to_vec()),
        },
        // broken content never reaches the serializer; tombstones stage
        // an explicit null
        _ => Value::Null,
    };

    let mut line = Map::new();
    line.insert("content".to_string(), content);

    if metadata.all {
        let mut meta = Map::new();
        if metadata.offset_and_partition {
            meta.insert("offset".to_string(), json!(record.offset));
            meta.insert(
                "partition".to_string(),
                json!(record.topic_partition.partition()),
            );
        }
        if metadata.topic {
            meta.insert("topic".to_string(), json!(record.topic_partition.topic()));
        }
        if metadata.create_time {
            if let (Some(timestamp), Some(field)) =
                (record.timestamp, record.timestamp_type.meta_field_name())
            {
                meta.insert(field.to_string(), json!(timestamp));
            }
        }
        if let Some(key) = key_content {
            meta.insert(
                "key".to_string(),
                json!(String::from_utf8_lossy(&key.content_bytes())),
            );
        }
        if !record.headers.is_empty() {
            let headers: Map<String, Value> = record
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), json!(value)))
                .collect();
            meta.insert("headers".to_string(), Value::Object(headers));
        }
        line.insert("meta".to_string(), Value::Object(meta));
    }

    serde_json::to_string(&Value::Object(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{TimestampType, TopicPartition};

    fn record_with_value(value: RecordValue) -> SinkRecord {
        SinkRecord {
            topic_partition: TopicPartition::new("orders", 3),
            offset: 42,
            key: None,
            value,
            timestamp: Some(1_650_000_000_000),
            timestamp_type: TimestampType::CreateTime,
            headers: vec![],
        }
    }

    #[test]
    fn native_bytes_parse_or_degrade() {
        assert!(matches!(
            to_content(&RecordValue::Native(br#"{"a":1}"#.to_vec())),
            Some(RecordContent::Structured { .. })
        ));
        assert!(matches!(
            to_content(&RecordValue::Native(b"\x00not json".to_vec())),
            Some(RecordContent::Broken { .. })
        ));
        assert_eq!(to_content(&RecordValue::Null), None);
    }

    #[test]
    fn line_carries_content_and_full_metadata() {
        let record = record_with_value(RecordValue::Native(br#"{"user":7}"#.to_vec()));
        let content = to_content(&record.value);

        let line = serialize_record(
            &record,
            None,
            content.as_ref(),
            &SinkMetadataConfig::default(),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed["content"], json!({"user": 7}));
        assert_eq!(parsed["meta"]["offset"], json!(42));
        assert_eq!(parsed["meta"]["partition"], json!(3));
        assert_eq!(parsed["meta"]["topic"], json!("orders"));
        assert_eq!(parsed["meta"]["CreateTime"], json!(1_650_000_000_000_i64));
    }

    #[test]
    fn metadata_master_switch_strips_everything() {
        let record = record_with_value(RecordValue::Native(b"1".to_vec()));
        let content = to_content(&record.value);

        let metadata = SinkMetadataConfig {
            all: false,
            ..Default::default()
        };
        let line = serialize_record(&record, None, content.as_ref(), &metadata).unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed["content"], json!(1));
        assert!(parsed.get("meta").is_none());
    }

    #[test]
    fn individual_metadata_flags_apply() {
        let record = record_with_value(RecordValue::Native(b"1".to_vec()));
        let content = to_content(&record.value);

        let metadata = SinkMetadataConfig {
            all: true,
            create_time: false,
            topic: false,
            offset_and_partition: true,
        };
        let line = serialize_record(&record, None, content.as_ref(), &metadata).unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed["meta"]["offset"], json!(42));
        assert!(parsed["meta"].get("topic").is_none());
        assert!(parsed["meta"].get("CreateTime").is_none());
    }

    #[test]
    fn tombstones_stage_a_null_content() {
        let record = record_with_value(RecordValue::Null);
        let line = serialize_record(&record, None, None, &SinkMetadataConfig::default()).unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["content"], Value::Null);
    }

    #[test]
    fn key_and_headers_land_in_metadata() {
        let mut record = record_with_value(RecordValue::Native(b"2".to_vec()));
        record.headers = vec![("source".to_string(), "edge".to_string())];
        let key = to_content(&RecordValue::Native(br#""k1""#.to_vec()));
        let value = to_content(&record.value);

        let line = serialize_record(
            &record,
            key.as_ref(),
            value.as_ref(),
            &SinkMetadataConfig::default(),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();

        assert_eq!(parsed["meta"]["key"], json!("[\"k1\"]"));
        assert_eq!(parsed["meta"]["headers"]["source"], json!("edge"));
    }
}
