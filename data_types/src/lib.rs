//! Shared data types used by the staged-file sink pipeline.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::fmt::Display;
use std::sync::Arc;

pub mod file_name;
pub mod record;

pub use file_name::StagedFileName;
pub use record::{RecordContent, RecordValue, SinkRecord, TimestampType};

/// Address of one partition of one topic in the upstream log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    topic: Arc<str>,
    partition: i32,
}

impl TopicPartition {
    /// Create a new topic-partition address.
    pub fn new(topic: impl Into<Arc<str>>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// The topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The partition id within the topic.
    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_partition_display() {
        let tp = TopicPartition::new("orders", 3);
        assert_eq!(tp.to_string(), "orders-3");
        assert_eq!(tp.topic(), "orders");
        assert_eq!(tp.partition(), 3);
    }

    #[test]
    fn topic_partition_is_a_map_key() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(TopicPartition::new("orders", 0), 1);
        map.insert(TopicPartition::new("orders", 1), 2);
        assert_eq!(map.get(&TopicPartition::new("orders", 1)), Some(&2));
    }
}
