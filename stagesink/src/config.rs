//! Sink configuration and the naming of warehouse objects derived from it.

use observability_deps::tracing::warn;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Smallest accepted buffer size threshold, in bytes.
pub const BUFFER_SIZE_BYTES_MIN: u64 = 1;

/// Default buffer size threshold, in bytes.
pub const BUFFER_SIZE_BYTES_DEFAULT: u64 = 5_000_000;

/// Smallest accepted time-based flush interval, in seconds.
pub const BUFFER_FLUSH_TIME_SEC_MIN: u64 = 10;

/// Default time-based flush interval, in seconds.
pub const BUFFER_FLUSH_TIME_SEC_DEFAULT: u64 = 120;

/// Default record count threshold.
pub const BUFFER_RECORD_COUNT_DEFAULT: i64 = 10_000;

/// What to do with records whose value is null or semantically empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnNullValues {
    /// Keep the record; it is staged with a null content field.
    Default,
    /// Drop the record without buffering it.
    Ignore,
}

impl Default for OnNullValues {
    fn default() -> Self {
        Self::Default
    }
}

/// Which metadata fields are attached to each staged record.
#[derive(Debug, Clone)]
pub struct SinkMetadataConfig {
    /// Master switch; when false no metadata is attached at all.
    pub all: bool,
    /// Attach the log timestamp under its timestamp-type field name.
    pub create_time: bool,
    /// Attach the source topic.
    pub topic: bool,
    /// Attach offset and partition.
    pub offset_and_partition: bool,
}

impl Default for SinkMetadataConfig {
    fn default() -> Self {
        Self {
            all: true,
            create_time: true,
            topic: true,
            offset_and_partition: true,
        }
    }
}

/// Configuration of one sink task.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Name of the connector instance; namespaces every warehouse object
    /// and staged file.
    pub connector_name: String,
    /// Flush the buffer once its accounted size reaches this many bytes.
    pub file_size_bytes: u64,
    /// Flush the buffer once it holds this many records; `0` disables the
    /// count trigger.
    pub record_count: i64,
    /// Flush the buffer once this much time passed since the last flush.
    pub flush_time_sec: u64,
    /// Null-value policy.
    pub on_null_values: OnNullValues,
    /// Explicit topic-to-table mapping; unmapped topics derive a name.
    pub topic_to_table: HashMap<String, String>,
    /// Metadata shaping forwarded to the record serializer.
    pub metadata: SinkMetadataConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            connector_name: "test-connector".to_string(),
            file_size_bytes: BUFFER_SIZE_BYTES_DEFAULT,
            record_count: BUFFER_RECORD_COUNT_DEFAULT,
            flush_time_sec: BUFFER_FLUSH_TIME_SEC_DEFAULT,
            on_null_values: OnNullValues::default(),
            topic_to_table: HashMap::new(),
            metadata: SinkMetadataConfig::default(),
        }
    }
}

impl SinkConfig {
    /// Clamp out-of-range values, warning about each adjustment.
    pub fn sanitized(mut self) -> Self {
        if self.file_size_bytes < BUFFER_SIZE_BYTES_MIN {
            warn!(
                file_size_bytes = self.file_size_bytes,
                default = BUFFER_SIZE_BYTES_DEFAULT,
                "buffer size threshold below minimum; resetting to default",
            );
            self.file_size_bytes = BUFFER_SIZE_BYTES_DEFAULT;
        }
        if self.record_count < 0 {
            warn!(
                record_count = self.record_count,
                "record count threshold negative; disabling the count trigger",
            );
            self.record_count = 0;
        }
        if self.flush_time_sec < BUFFER_FLUSH_TIME_SEC_MIN {
            warn!(
                flush_time_sec = self.flush_time_sec,
                minimum = BUFFER_FLUSH_TIME_SEC_MIN,
                "flush interval below minimum; clamping up",
            );
            self.flush_time_sec = BUFFER_FLUSH_TIME_SEC_MIN;
        }
        self
    }

    /// The time-based flush interval.
    pub fn flush_time(&self) -> Duration {
        Duration::from_secs(self.flush_time_sec)
    }

    /// The destination table for `topic`: the mapped name if configured,
    /// otherwise a valid identifier derived from the topic name.
    pub fn table_name_for_topic(&self, topic: &str) -> String {
        if let Some(table) = self.topic_to_table.get(topic) {
            return table.clone();
        }
        derive_table_name(topic)
    }

    /// Name of the internal stage backing `table`.
    pub fn stage_name_for_table(&self, table: &str) -> String {
        format!("{}_stage_{}", self.connector_name, table)
    }

    /// Name of the pipe ingesting `partition`'s files into `table`.
    pub fn pipe_name_for(&self, table: &str, partition: i32) -> String {
        format!("{}_pipe_{}_{}", self.connector_name, table, partition)
    }
}

/// Turn an arbitrary topic name into a valid warehouse identifier.
///
/// Invalid characters become underscores; a leading digit gets an
/// underscore prefix; any modified name gets a hash suffix so distinct
/// topics cannot collapse onto the same table.
fn derive_table_name(topic: &str) -> String {
    let mut name: String = topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut modified = name != topic;

    if name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        name.insert(0, '_');
        modified = true;
    }

    if modified {
        let mut hasher = DefaultHasher::new();
        topic.hash(&mut hasher);
        name.push('_');
        name.push_str(&hasher.finish().to_string());
    }

    name
}
