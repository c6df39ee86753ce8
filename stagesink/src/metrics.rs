//! Per-partition telemetry recorders.

use data_types::TopicPartition;
use metric::{Attributes, Registry, U64Counter, U64Gauge};
use observability_deps::tracing::info;
use std::sync::Arc;

const GAUGES: &[(&str, &str)] = &[
    (
        "stagesink_file_count_on_stage",
        "files currently on the internal stage awaiting a terminal status",
    ),
    (
        "stagesink_file_count_on_ingestion",
        "files handed to the ingestion service and not yet reconciled",
    ),
    (
        "stagesink_memory_usage",
        "accounted bytes currently buffered in memory",
    ),
    (
        "stagesink_processed_offset",
        "highest offset observed by insert",
    ),
    (
        "stagesink_flushed_offset",
        "one past the highest offset written to a stage file",
    ),
    (
        "stagesink_committed_offset",
        "highest offset durably handed off to the warehouse",
    ),
    (
        "stagesink_purged_offset",
        "highest end offset among purged files",
    ),
    (
        "stagesink_commit_lag_millis",
        "time between staging a file and committing its offsets",
    ),
    (
        "stagesink_ingestion_lag_millis",
        "time between staging a file and observing it loaded",
    ),
    (
        "stagesink_reused_table",
        "whether bootstrap found a compatible pre-existing table",
    ),
    (
        "stagesink_reused_stage",
        "whether bootstrap found a compatible pre-existing stage",
    ),
    (
        "stagesink_reused_pipe",
        "whether bootstrap found a compatible pre-existing pipe",
    ),
];

const COUNTERS: &[(&str, &str)] = &[
    (
        "stagesink_file_count_purged",
        "files deleted from the stage after a confirmed load",
    ),
    (
        "stagesink_file_count_table_stage_ingest_fail",
        "files quarantined on the table stage after a failed load",
    ),
    (
        "stagesink_file_count_table_stage_broken_record",
        "broken-record files written to the table stage",
    ),
    (
        "stagesink_cleaner_restart_count",
        "reconciliation cycles that failed and forced a stage re-list",
    ),
];

/// All recorders of one partition sink, labeled by topic and partition.
#[derive(Debug)]
pub(crate) struct SinkMetrics {
    registry: Arc<Registry>,
    attributes: Attributes,

    pub(crate) files_on_stage: U64Gauge,
    pub(crate) files_on_ingestion: U64Gauge,
    pub(crate) memory_usage: U64Gauge,
    pub(crate) processed_offset: U64Gauge,
    pub(crate) flushed_offset: U64Gauge,
    pub(crate) committed_offset: U64Gauge,
    pub(crate) purged_offset: U64Gauge,
    pub(crate) commit_lag_millis: U64Gauge,
    pub(crate) ingestion_lag_millis: U64Gauge,
    pub(crate) reused_table: U64Gauge,
    pub(crate) reused_stage: U64Gauge,
    pub(crate) reused_pipe: U64Gauge,

    pub(crate) files_purged: U64Counter,
    pub(crate) files_table_stage_ingest_fail: U64Counter,
    pub(crate) files_table_stage_broken_record: U64Counter,
    pub(crate) cleaner_restarts: U64Counter,
}

impl SinkMetrics {
    pub(crate) fn new(registry: Arc<Registry>, topic_partition: &TopicPartition) -> Self {
        let attributes = Attributes::from(vec![
            ("topic", topic_partition.topic().to_string()),
            ("partition", topic_partition.partition().to_string()),
        ]);

        let gauge = |i: usize| {
            registry
                .register_metric::<U64Gauge>(GAUGES[i].0, GAUGES[i].1)
                .recorder(attributes.clone())
        };
        let counter = |i: usize| {
            registry
                .register_metric::<U64Counter>(COUNTERS[i].0, COUNTERS[i].1)
                .recorder(attributes.clone())
        };

        Self {
            files_on_stage: gauge(0),
            files_on_ingestion: gauge(1),
            memory_usage: gauge(2),
            processed_offset: gauge(3),
            flushed_offset: gauge(4),
            committed_offset: gauge(5),
            purged_offset: gauge(6),
            commit_lag_millis: gauge(7),
            ingestion_lag_millis: gauge(8),
            reused_table: gauge(9),
            reused_stage: gauge(10),
            reused_pipe: gauge(11),
            files_purged: counter(0),
            files_table_stage_ingest_fail: counter(1),
            files_table_stage_broken_record: counter(2),
            cleaner_restarts: counter(3),
            registry,
            attributes,
        }
    }

    /// Log the current values; the cleaner emits this once per cycle and
    /// close emits it one final time.
    pub(crate) fn emit_snapshot(&self, topic_partition: &TopicPartition) {
        info!(
            topic_partition = %topic_partition,
            files_on_stage = self.files_on_stage.fetch(),
            files_on_ingestion = self.files_on_ingestion.fetch(),
            files_purged = self.files_purged.fetch(),
            files_table_stage_ingest_fail = self.files_table_stage_ingest_fail.fetch(),
            files_table_stage_broken_record = self.files_table_stage_broken_record.fetch(),
            memory_usage = self.memory_usage.fetch(),
            processed_offset = self.processed_offset.fetch(),
            flushed_offset = self.flushed_offset.fetch(),
            committed_offset = self.committed_offset.fetch(),
            cleaner_restarts = self.cleaner_restarts.fetch(),
            "partition sink telemetry",
        );
    }

    /// Drop this partition's observers from the registry.
    pub(crate) fn unregister(&self) {
        for (name, _) in GAUGES {
            if let Some(metric) = self.registry.get_instrument::<U64Gauge>(name) {
                metric.remove(&self.attributes);
            }
        }
        for (name, _) in COUNTERS {
            if let Some(metric) = self.registry.get_instrument::<U64Counter>(name) {
                metric.remove(&self.attributes);
            }
        }
    }
}
