//! The sink task surface: a registry mapping assigned partitions to their
//! [`PartitionSink`]s, driven by the hosting framework's put, commit and
//! rebalance callbacks.

use crate::{
    config::SinkConfig,
    error::{NoConnectionSnafu, Result, UnknownPartitionSnafu},
    partition::PartitionSink,
};
use data_types::{SinkRecord, TopicPartition};
use futures::future::join_all;
use metric::Registry;
use observability_deps::tracing::info;
use parking_lot::Mutex;
use snafu::{ensure, OptionExt};
use stage_time::TimeProvider;
use std::collections::HashMap;
use std::sync::Arc;
use warehouse::ConnectionService;

/// Owns one [`PartitionSink`] per assigned topic partition.
#[derive(Debug)]
pub struct SinkService {
    conn: Arc<dyn ConnectionService>,
    config: Arc<SinkConfig>,
    time_provider: Arc<dyn TimeProvider>,
    metric_registry: Arc<Registry>,
    sinks: Mutex<HashMap<TopicPartition, Arc<PartitionSink>>>,
}

impl SinkService {
    /// Create the service. The configuration is sanitized here; a closed
    /// or absent connection aborts startup.
    pub fn new(
        conn: Arc<dyn ConnectionService>,
        config: SinkConfig,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: Arc<Registry>,
    ) -> Result<Self> {
        ensure!(!conn.is_closed(), NoConnectionSnafu);
        Ok(Self {
            conn,
            config: Arc::new(config.sanitized()),
            time_provider,
            metric_registry,
            sinks: Default::default(),
        })
    }

    /// Register sinks for newly assigned partitions. Creating a sink is
    /// cheap; the remote bootstrap runs lazily on its first record.
    pub fn open_partitions(&self, partitions: &[TopicPartition]) {
        for topic_partition in partitions {
            self.sink_for(topic_partition);
        }
    }

    /// Currently registered partitions.
    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.sinks.lock().keys().cloned().collect()
    }

    /// Ingest one record into its partition's sink, registering the sink
    /// on first contact.
    pub async fn insert(&self, sink_record: SinkRecord) -> Result<()> {
        let sink = self.sink_for(&sink_record.topic_partition);
        sink.insert(sink_record).await
    }

    /// Ingest a batch, then flush every partition whose time-based flush
    /// interval has elapsed. An empty batch still drives the time-based
    /// flushes.
    pub async fn insert_all(&self, records: Vec<SinkRecord>) -> Result<()> {
        for record in records {
            self.insert(record).await?;
        }

        let sinks: Vec<Arc<PartitionSink>> = self.sinks.lock().values().cloned().collect();
        for sink in sinks {
            if sink.should_flush() {
                sink.flush_buffer().await?;
            }
        }
        Ok(())
    }

    /// The committable offset for `topic_partition`; drives the ingestion
    /// trigger for files flushed since the last call.
    pub async fn get_offset(&self, topic_partition: &TopicPartition) -> Result<i64> {
        let sink = self
            .sinks
            .lock()
            .get(topic_partition)
            .cloned()
            .context(UnknownPartitionSnafu {
                topic_partition: topic_partition.clone(),
            })?;
        sink.get_offset().await
    }

    /// Drop and close the sinks of revoked partitions.
    pub async fn close(&self, partitions: &[TopicPartition]) {
        let closing: Vec<Arc<PartitionSink>> = {
            let mut sinks = self.sinks.lock();
            partitions
                .iter()
                .filter_map(|topic_partition| sinks.remove(topic_partition))
                .collect()
        };
        for sink in closing {
            sink.close().await;
        }
    }

    /// Close every sink; used on task shutdown.
    pub async fn close_all(&self) {
        let closing: Vec<Arc<PartitionSink>> = {
            let mut sinks = self.sinks.lock();
            sinks.drain().map(|(_, sink)| sink).collect()
        };
        let n_sinks = closing.len();
        join_all(closing.iter().map(|sink| sink.close())).await;
        info!(n_sinks, "sink service closed");
    }

    fn sink_for(&self, topic_partition: &TopicPartition) -> Arc<PartitionSink> {
        let mut sinks = self.sinks.lock();
        if let Some(sink) = sinks.get(topic_partition) {
            return Arc::clone(sink);
        }
        let sink = Arc::new(PartitionSink::new(
            topic_partition.clone(),
            Arc::clone(&self.conn),
            Arc::clone(&self.config),
            Arc::clone(&self.time_provider),
            Arc::clone(&self.metric_registry),
        ));
        sinks.insert(topic_partition.clone(), Arc::clone(&sink));
        sink
    }
}
