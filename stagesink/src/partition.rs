//! The per-partition state machine: lazy bootstrap and recovery, buffered
//! insertion with threshold flushing, offset bookkeeping, broken-record
//! routing and the commit-time ingestion trigger.

use crate::{
    bootstrap, cleaner,
    buffer::PartitionBuffer,
    config::{OnNullValues, SinkConfig},
    error::{
        IngestReportSnafu, IngestTriggerSnafu, ListStageSnafu, LoadHistorySnafu,
        MoveToTableStageSnafu, NoConnectionSnafu, PurgeSnafu, Result, SerializeRecordSnafu,
        TableStageUploadSnafu, UploadSnafu,
    },
    metrics::SinkMetrics,
    record, recovery,
};
use data_types::{
    file_name::{self, StagedFileName},
    RecordContent, RecordValue, SinkRecord, TopicPartition,
};
use metric::Registry;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use snafu::{ensure, ResultExt};
use stage_time::TimeProvider;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warehouse::{retry::BackoffIngestionService, ConnectionService, IngestionService};

/// The two file watch lists, guarded by one lock.
#[derive(Debug, Default)]
struct FileLists {
    /// Flushed since the last offset commit; drained by
    /// [`PartitionSink::get_offset`].
    pending_commit: Vec<String>,
    /// Under reconciliation by the cleaner.
    reconciling: Vec<String>,
}

/// State and pipeline of one assigned topic partition.
///
/// Producer tasks call [`insert`](Self::insert), the framework's commit
/// callback calls [`get_offset`](Self::get_offset), and a background
/// cleaner task reconciles staged files; the locks here are only ever held
/// for in-memory mutation, never across remote calls.
#[derive(Debug)]
pub struct PartitionSink {
    topic_partition: TopicPartition,
    table_name: String,
    stage_name: String,
    pipe_name: String,
    prefix: String,

    conn: Arc<dyn ConnectionService>,
    ingest: Arc<dyn IngestionService>,
    config: Arc<SinkConfig>,
    time_provider: Arc<dyn TimeProvider>,
    metrics: SinkMetrics,

    /// Highest offset observed by insert; `-1` before the first record.
    processed_offset: AtomicI64,
    /// One past the highest offset staged; `-1` before the first flush.
    flushed_offset: AtomicI64,
    /// Next offset the upstream may consider durably handed off.
    committed_offset: AtomicI64,
    previous_flush_millis: AtomicI64,

    buffer: Mutex<PartitionBuffer>,
    files: Mutex<FileLists>,

    force_reset: AtomicBool,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PartitionSink {
    /// Create the sink for `topic_partition`. No remote calls happen here;
    /// bootstrap and recovery run lazily on the first insert.
    pub fn new(
        topic_partition: TopicPartition,
        conn: Arc<dyn ConnectionService>,
        config: Arc<SinkConfig>,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: Arc<Registry>,
    ) -> Self {
        let table_name = config.table_name_for_topic(topic_partition.topic());
        let stage_name = config.stage_name_for_table(&table_name);
        let pipe_name = config.pipe_name_for(&table_name, topic_partition.partition());
        let prefix = file_name::file_prefix(
            conn.connector_name(),
            &table_name,
            topic_partition.partition(),
        );
        let ingest: Arc<dyn IngestionService> = Arc::new(BackoffIngestionService::new(
            conn.build_ingest_service(&stage_name, &pipe_name),
        ));
        let metrics = SinkMetrics::new(metric_registry, &topic_partition);
        let now_millis = time_provider.now().timestamp_millis();

        Self {
            topic_partition,
            table_name,
            stage_name,
            pipe_name,
            prefix,
            conn,
            ingest,
            config,
            time_provider,
            metrics,
            processed_offset: AtomicI64::new(-1),
            flushed_offset: AtomicI64::new(-1),
            committed_offset: AtomicI64::new(0),
            previous_flush_millis: AtomicI64::new(now_millis),
            buffer: Mutex::new(PartitionBuffer::new()),
            files: Default::default(),
            force_reset: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            tasks: Default::default(),
        }
    }

    /// The partition this sink serves.
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Highest offset observed by insert, `-1` before the first record.
    pub fn processed_offset(&self) -> i64 {
        self.processed_offset.load(Ordering::Acquire)
    }

    /// One past the highest staged offset, `-1` before the first flush.
    pub fn flushed_offset(&self) -> i64 {
        self.flushed_offset.load(Ordering::Acquire)
    }

    /// Next offset the upstream may consider durably handed off.
    pub fn committed_offset(&self) -> i64 {
        self.committed_offset.load(Ordering::Acquire)
    }

    /// Snapshot of the files currently under reconciliation.
    pub fn cleaner_file_names(&self) -> Vec<String> {
        self.files.lock().reconciling.clone()
    }

    /// Snapshot of the files flushed since the last offset commit.
    pub fn pending_commit_file_names(&self) -> Vec<String> {
        self.files.lock().pending_commit.clone()
    }

    /// Ingest one record.
    ///
    /// The first call bootstraps the warehouse objects, recovers the stage
    /// listing and starts the cleaner. Records at or below the processed
    /// offset are dropped. Broken records go straight to the table stage
    /// without advancing any offset, so the upstream re-presents the same
    /// offset until a well-formed record arrives or the offset commits.
    pub async fn insert(self: &Arc<Self>, sink_record: SinkRecord) -> Result<()> {
        self.init(sink_record.offset).await?;

        if sink_record.offset <= self.processed_offset.load(Ordering::Acquire) {
            debug!(
                topic_partition = %self.topic_partition,
                offset = sink_record.offset,
                "record already processed, ignoring",
            );
            return Ok(());
        }

        let key_content = sink_record.key.as_ref().and_then(record::to_content);
        let value_content = record::to_content(&sink_record.value);

        if self.config.on_null_values == OnNullValues::Ignore {
            let empty_first_party = matches!(
                &sink_record.value,
                RecordValue::Content(content) if !content.is_broken() && content.is_value_null()
            );
            if sink_record.value.is_null() || empty_first_party {
                debug!(
                    topic_partition = %self.topic_partition,
                    offset = sink_record.offset,
                    "dropping record with null value",
                );
                return Ok(());
            }
        }

        let any_broken = key_content
            .as_ref()
            .map_or(false, RecordContent::is_broken)
            || value_content
                .as_ref()
                .map_or(false, RecordContent::is_broken);
        if any_broken {
            return self
                .write_broken_parts(&sink_record, key_content.as_ref(), value_content.as_ref())
                .await;
        }

        let line = record::serialize_record(
            &sink_record,
            key_content.as_ref(),
            value_content.as_ref(),
            &self.config.metadata,
        )
        .context(SerializeRecordSnafu {
            offset: sink_record.offset,
        })?;

        let (detached, buffered_bytes) = {
            let mut buffer = self.buffer.lock();
            self.processed_offset
                .store(sink_record.offset, Ordering::Release);
            buffer.insert(sink_record.offset, &line);

            let over_size = buffer.buffer_size_bytes() >= self.config.file_size_bytes;
            let over_count = self.config.record_count > 0
                && buffer.num_records() >= self.config.record_count;
            let buffered_bytes = buffer.buffer_size_bytes();
            let detached = (over_size || over_count).then(|| std::mem::take(&mut *buffer));
            (detached, buffered_bytes)
        };

        self.metrics
            .processed_offset
            .set(sink_record.offset.max(0) as u64);
        self.metrics.memory_usage.set(buffered_bytes);

        match detached {
            Some(buffer) => self.flush(buffer).await,
            None => Ok(()),
        }
    }

    /// Detach and stage whatever is buffered, regardless of thresholds.
    pub async fn flush_buffer(self: &Arc<Self>) -> Result<()> {
        let detached = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut *buffer))
            }
        };
        match detached {
            Some(buffer) => self.flush(buffer).await,
            None => Ok(()),
        }
    }

    /// Whether the time-based flush interval has elapsed since the last
    /// flush.
    pub fn should_flush(&self) -> bool {
        let now_millis = self.time_provider.now().timestamp_millis();
        now_millis - self.previous_flush_millis.load(Ordering::Acquire)
            >= self.config.flush_time().as_millis() as i64
    }

    /// The committable offset for this partition.
    ///
    /// Draining the files flushed since the last call, this advances the
    /// committed offset to the flushed offset and hands the drained files
    /// to the ingestion service. With nothing newly flushed it returns the
    /// committed offset unchanged and performs no remote call.
    pub async fn get_offset(&self) -> Result<i64> {
        let drained = {
            let mut files = self.files.lock();
            if files.pending_commit.is_empty() {
                return Ok(self.committed_offset.load(Ordering::Acquire));
            }
            std::mem::take(&mut files.pending_commit)
        };

        let flushed = self.flushed_offset.load(Ordering::Acquire);
        self.committed_offset.store(flushed, Ordering::Release);
        if flushed > 0 {
            self.metrics.committed_offset.set((flushed - 1) as u64);
        }
        self.metrics.files_on_ingestion.add(drained.len() as u64);

        let now_millis = self.time_provider.now().timestamp_millis();
        for name in &drained {
            if let Ok(staged_at) = file_name::time_ingested(name) {
                self.metrics
                    .commit_lag_millis
                    .set(now_millis.saturating_sub(staged_at).max(0) as u64);
            }
        }

        debug!(
            topic_partition = %self.topic_partition,
            n_files = drained.len(),
            committed_offset = flushed,
            "triggering ingestion at offset commit",
        );
        self.ingest
            .ingest_files(&drained)
            .await
            .context(IngestTriggerSnafu)?;

        Ok(flushed)
    }

    /// Stop the background tasks, release the ingestion client and emit a
    /// final telemetry report.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!(
                    topic_partition = %self.topic_partition,
                    "background task did not stop in time",
                );
            }
        }
        self.ingest.close().await;
        self.metrics.emit_snapshot(&self.topic_partition);
        self.metrics.unregister();
        info!(topic_partition = %self.topic_partition, "partition sink closed");
    }

    async fn init(self: &Arc<Self>, first_record_offset: i64) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        ensure!(!self.conn.is_closed(), NoConnectionSnafu);

        let objects = bootstrap::ensure_table_stage_pipe(
            self.conn.as_ref(),
            &self.table_name,
            &self.stage_name,
            &self.pipe_name,
        )
        .await?;
        self.metrics.reused_table.set(objects.reused_table as u64);
        self.metrics.reused_stage.set(objects.reused_stage as u64);
        self.metrics.reused_pipe.set(objects.reused_pipe as u64);

        let reprocess = self.recover(first_record_offset).await?;

        let handle = tokio::spawn(cleaner::run_cleaner(Arc::clone(self)));
        self.tasks.lock().push(handle);
        if !reprocess.is_empty() {
            let handle = tokio::spawn(cleaner::run_delayed_reprocess_purge(
                Arc::clone(self),
                reprocess,
            ));
            self.tasks.lock().push(handle);
        }

        self.initialized.store(true, Ordering::Release);
        info!(
            topic_partition = %self.topic_partition,
            table = %self.table_name,
            stage = %self.stage_name,
            pipe = %self.pipe_name,
            "partition sink initialized",
        );
        Ok(())
    }

    /// Enumerate the stage and split pre-existing files into the set the
    /// upstream will re-deliver (returned, purged after a delay) and the
    /// set to reconcile (seeded into the cleaner list).
    async fn recover(&self, first_record_offset: i64) -> Result<Vec<String>> {
        let listed = self
            .conn
            .list_stage(&self.stage_name, &self.prefix)
            .await
            .context(ListStageSnafu {
                stage: self.stage_name.clone(),
            })?;
        let n_listed = listed.len();

        let split = recovery::split_reprocess_files(listed, first_record_offset);
        info!(
            topic_partition = %self.topic_partition,
            n_listed,
            n_preserve = split.preserve.len(),
            n_reprocess = split.reprocess.len(),
            first_record_offset,
            "recovered stage state",
        );

        self.metrics.files_on_stage.add(split.preserve.len() as u64);
        self.files.lock().reconciling.extend(split.preserve);
        Ok(split.reprocess)
    }

    async fn write_broken_parts(
        &self,
        sink_record: &SinkRecord,
        key_content: Option<&RecordContent>,
        value_content: Option<&RecordContent>,
    ) -> Result<()> {
        let now_millis = self.time_provider.now().timestamp_millis();
        for (content, is_key) in [(key_content, true), (value_content, false)] {
            let content = match content {
                Some(content) if content.is_broken() => content,
                _ => continue,
            };
            let name = file_name::broken_record_file_name(
                &self.prefix,
                sink_record.offset,
                now_millis,
                is_key,
            );
            warn!(
                topic_partition = %self.topic_partition,
                offset = sink_record.offset,
                file_name = %name,
                is_key,
                "routing broken record part to the table stage",
            );
            self.conn
                .put_to_table_stage(&self.table_name, &name, &content.content_bytes())
                .await
                .context(TableStageUploadSnafu {
                    file_name: name.clone(),
                })?;
            self.metrics.files_table_stage_broken_record.inc(1);
        }
        // the offset is intentionally not advanced: the upstream will
        // re-present it, letting a repaired record still flow
        Ok(())
    }

    async fn flush(&self, buffer: PartitionBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let now = self.time_provider.now();
        let name = StagedFileName {
            prefix: self.prefix.clone(),
            start_offset: buffer.first_offset(),
            end_offset: buffer.last_offset(),
            ingest_time_millis: now.timestamp_millis(),
        }
        .encode();

        self.conn
            .put_with_cache(&self.stage_name, &name, buffer.data())
            .await
            .context(UploadSnafu {
                file_name: name.clone(),
            })?;

        self.flushed_offset
            .fetch_max(buffer.last_offset() + 1, Ordering::AcqRel);
        {
            let mut files = self.files.lock();
            files.pending_commit.push(name.clone());
            files.reconciling.push(name.clone());
        }

        self.metrics
            .flushed_offset
            .set(self.flushed_offset.load(Ordering::Acquire).max(0) as u64);
        self.metrics.files_on_stage.add(1);
        self.metrics.memory_usage.set(0);
        self.previous_flush_millis
            .store(now.timestamp_millis(), Ordering::Release);

        debug!(
            topic_partition = %self.topic_partition,
            file_name = %name,
            n_records = buffer.num_records(),
            "staged buffer",
        );
        Ok(())
    }

    /// One reconciliation pass; see the module documentation of
    /// [`crate::cleaner`].
    pub(crate) async fn check_status(&self) -> Result<()> {
        let mut undecided = { std::mem::take(&mut self.files.lock().reconciling) };
        if undecided.is_empty() {
            return Ok(());
        }

        let mut loaded = Vec::new();
        let mut failed = Vec::new();

        let report = self
            .ingest
            .read_ingest_report(&undecided)
            .await
            .context(IngestReportSnafu)?;
        cleaner::partition_by_status(&mut undecided, &report, &mut loaded, &mut failed);

        let now_millis = self.time_provider.now().timestamp_millis();
        let one_hour_ago = now_millis - cleaner::ONE_HOUR.as_millis() as i64;
        let ten_minutes_ago = now_millis - cleaner::TEN_MINUTES.as_millis() as i64;

        let mut old_files = Vec::new();
        for name in undecided.clone() {
            let staged_at = match file_name::time_ingested(&name) {
                Ok(staged_at) => staged_at,
                Err(e) => {
                    warn!(file_name = %name, e = %e, "undecodable file under watch, quarantining");
                    failed.push(name.clone());
                    undecided.retain(|f| f != &name);
                    continue;
                }
            };
            if staged_at < one_hour_ago {
                failed.push(name.clone());
                undecided.retain(|f| f != &name);
            } else if staged_at < ten_minutes_ago {
                old_files.push(name);
            }
        }

        if !old_files.is_empty() {
            let history = self
                .ingest
                .read_load_history(&undecided, one_hour_ago)
                .await
                .context(LoadHistorySnafu)?;
            cleaner::partition_by_status(&mut undecided, &history, &mut loaded, &mut failed);
        }

        if !loaded.is_empty() {
            self.conn
                .purge_stage(&self.stage_name, &loaded)
                .await
                .context(PurgeSnafu {
                    stage: self.stage_name.clone(),
                })?;
        }
        if !failed.is_empty() {
            warn!(
                topic_partition = %self.topic_partition,
                n_files = failed.len(),
                "quarantining failed files on the table stage",
            );
            self.conn
                .move_to_table_stage(&self.table_name, &self.stage_name, &failed)
                .await
                .context(MoveToTableStageSnafu {
                    table: self.table_name.clone(),
                })?;
        }

        self.files.lock().reconciling.extend(undecided);

        let finished = (loaded.len() + failed.len()) as u64;
        if finished > 0 {
            self.metrics.files_on_stage.sub(finished);
            self.metrics.files_on_ingestion.sub(finished);
            self.metrics.files_purged.inc(loaded.len() as u64);
            self.metrics
                .files_table_stage_ingest_fail
                .inc(failed.len() as u64);

            let mut purged_max: Option<i64> = None;
            for name in &loaded {
                if let Ok(end) = file_name::end_offset(name) {
                    purged_max = Some(purged_max.map_or(end, |m| m.max(end)));
                }
                if let Ok(staged_at) = file_name::time_ingested(name) {
                    self.metrics
                        .ingestion_lag_millis
                        .set(now_millis.saturating_sub(staged_at).max(0) as u64);
                }
            }
            if let Some(end) = purged_max {
                self.metrics.purged_offset.set(end.max(0) as u64);
            }
        }
        Ok(())
    }

    /// Re-list the stage and union the result into the reconciliation
    /// list, deduplicated. Called after a failed cycle so that no in-flight
    /// file is forgotten.
    pub(crate) async fn reset_cleaner_files(&self) -> Result<()> {
        let listed = self
            .conn
            .list_stage(&self.stage_name, &self.prefix)
            .await
            .context(ListStageSnafu {
                stage: self.stage_name.clone(),
            })?;

        let mut files = self.files.lock();
        let known: HashSet<&String> = files.reconciling.iter().collect();
        let missing: Vec<String> = listed
            .into_iter()
            .filter(|name| !known.contains(name))
            .collect();
        drop(known);
        let n_restored = missing.len();
        files.reconciling.extend(missing);
        drop(files);

        info!(
            topic_partition = %self.topic_partition,
            n_restored,
            "restored cleaner file list from the stage",
        );
        Ok(())
    }

    pub(crate) async fn purge_reprocess_files(&self, files: &[String]) {
        match self.conn.purge_stage(&self.stage_name, files).await {
            Ok(()) => {
                info!(
                    topic_partition = %self.topic_partition,
                    n_files = files.len(),
                    "purged files whose offsets the upstream re-delivers",
                );
                self.metrics.files_purged.inc(files.len() as u64);
            }
            Err(e) => {
                // a later recovery will list these files again
                warn!(
                    topic_partition = %self.topic_partition,
                    e = %e,
                    "failed to purge reprocess files",
                );
            }
        }
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn is_force_reset(&self) -> bool {
        self.force_reset.load(Ordering::Acquire)
    }

    pub(crate) fn set_force_reset(&self) {
        self.force_reset.store(true, Ordering::Release);
        self.metrics.cleaner_restarts.inc(1);
    }

    pub(crate) fn clear_force_reset(&self) {
        self.force_reset.store(false, Ordering::Release);
    }

    pub(crate) fn emit_telemetry_snapshot(&self) {
        self.metrics.emit_snapshot(&self.topic_partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkMetadataConfig;
    use assert_matches::assert_matches;
    use crate::error::Error;
    use metric::{Attributes, U64Counter, U64Gauge};
    use serde_json::{json, Value};
    use stage_time::{MockProvider, Time};
    use warehouse::mock::{MockConnection, MockIngestionService};
    use warehouse::IngestStatus;

    const T0_MILLIS: i64 = 1_650_000_000_000;

    struct TestContext {
        sink: Arc<PartitionSink>,
        conn: Arc<MockConnection>,
        ingest: Arc<MockIngestionService>,
        time: Arc<MockProvider>,
        registry: Arc<Registry>,
        stage: String,
        table: String,
        prefix: String,
    }

    fn test_context(config: SinkConfig) -> TestContext {
        let conn = Arc::new(MockConnection::default());
        let ingest = conn.ingest_service();
        let time = Arc::new(MockProvider::new(Time::from_timestamp_millis(T0_MILLIS)));
        let registry = Arc::new(Registry::new());
        let config = Arc::new(config);

        let table = config.table_name_for_topic("topicA");
        let stage = config.stage_name_for_table(&table);
        let prefix = file_name::file_prefix("test-connector", &table, 0);

        let sink = Arc::new(PartitionSink::new(
            TopicPartition::new("topicA", 0),
            Arc::clone(&conn) as Arc<dyn ConnectionService>,
            config,
            Arc::clone(&time) as Arc<dyn TimeProvider>,
            Arc::clone(&registry),
        ));
        TestContext {
            sink,
            conn,
            ingest,
            time,
            registry,
            stage,
            table,
            prefix,
        }
    }

    fn no_meta_config() -> SinkConfig {
        SinkConfig {
            file_size_bytes: u64::MAX,
            record_count: 0,
            flush_time_sec: 3_600,
            metadata: SinkMetadataConfig {
                all: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn json_record(offset: i64, payload: &Value) -> SinkRecord {
        SinkRecord::new(
            TopicPartition::new("topicA", 0),
            offset,
            RecordValue::Native(serde_json::to_vec(payload).unwrap()),
        )
    }

    /// Accounted size of one staged line for `payload` under `config`.
    fn line_bytes(payload: &Value, config: &SinkConfig) -> u64 {
        let probe = json_record(0, payload);
        let content = record::to_content(&probe.value);
        let line =
            record::serialize_record(&probe, None, content.as_ref(), &config.metadata).unwrap();
        2 * line.chars().count() as u64
    }

    fn attributes() -> Attributes {
        Attributes::from(vec![
            ("topic", "topicA".to_string()),
            ("partition", "0".to_string()),
        ])
    }

    fn gauge_value(registry: &Registry, name: &str) -> u64 {
        registry
            .get_instrument::<U64Gauge>(name)
            .unwrap()
            .get_observer(&attributes())
            .unwrap()
            .fetch()
    }

    fn counter_value(registry: &Registry, name: &str) -> u64 {
        registry
            .get_instrument::<U64Counter>(name)
            .unwrap()
            .get_observer(&attributes())
            .unwrap()
            .fetch()
    }

    #[tokio::test]
    async fn size_triggered_flush_commits_offsets() {
        let base = no_meta_config();
        let per_record = line_bytes(&json!("abcd"), &base);
        let config = SinkConfig {
            // the second record crosses the threshold, the first does not
            file_size_bytes: per_record + 1,
            ..base
        };
        let ctx = test_context(config);

        ctx.sink
            .insert(json_record(100, &json!("abcd")))
            .await
            .unwrap();
        assert!(ctx.conn.stage_file_names(&ctx.stage).is_empty());
        assert_eq!(ctx.sink.processed_offset(), 100);
        assert_eq!(
            gauge_value(&ctx.registry, "stagesink_memory_usage"),
            per_record
        );

        ctx.sink
            .insert(json_record(101, &json!("efgh")))
            .await
            .unwrap();

        // the threshold is evaluated after the insert, so both records
        // land in the flushed file
        let staged = ctx.conn.stage_file_names(&ctx.stage);
        assert_eq!(staged.len(), 1);
        let parsed = StagedFileName::parse(&staged[0]).unwrap();
        assert_eq!((parsed.start_offset, parsed.end_offset), (100, 101));
        assert_eq!(parsed.ingest_time_millis, T0_MILLIS);
        assert_eq!(ctx.sink.flushed_offset(), 102);
        assert_eq!(gauge_value(&ctx.registry, "stagesink_memory_usage"), 0);

        // a third record starts a fresh buffer
        ctx.sink
            .insert(json_record(102, &json!("ijkl")))
            .await
            .unwrap();
        assert_eq!(ctx.conn.stage_file_names(&ctx.stage).len(), 1);

        let committed = ctx.sink.get_offset().await.unwrap();
        assert_eq!(committed, 102);
        assert_eq!(ctx.sink.committed_offset(), 102);
        assert_eq!(ctx.ingest.ingested_files(), staged);
    }

    #[tokio::test]
    async fn oversized_single_record_flushes_alone() {
        let config = SinkConfig {
            file_size_bytes: 1,
            ..no_meta_config()
        };
        let ctx = test_context(config);

        ctx.sink
            .insert(json_record(50, &json!("payload")))
            .await
            .unwrap();

        let staged = ctx.conn.stage_file_names(&ctx.stage);
        assert_eq!(staged.len(), 1);
        let parsed = StagedFileName::parse(&staged[0]).unwrap();
        assert_eq!((parsed.start_offset, parsed.end_offset), (50, 50));
        assert_eq!(ctx.sink.flushed_offset(), 51);
    }

    #[tokio::test]
    async fn record_count_threshold_triggers_flush() {
        let config = SinkConfig {
            record_count: 2,
            ..no_meta_config()
        };
        let ctx = test_context(config);

        ctx.sink.insert(json_record(0, &json!(1))).await.unwrap();
        assert!(ctx.conn.stage_file_names(&ctx.stage).is_empty());

        ctx.sink.insert(json_record(1, &json!(2))).await.unwrap();
        let staged = ctx.conn.stage_file_names(&ctx.stage);
        assert_eq!(staged.len(), 1);
        let parsed = StagedFileName::parse(&staged[0]).unwrap();
        assert_eq!((parsed.start_offset, parsed.end_offset), (0, 1));
    }

    #[tokio::test]
    async fn records_at_or_below_the_processed_offset_are_ignored() {
        let ctx = test_context(no_meta_config());

        ctx.sink.insert(json_record(10, &json!("a"))).await.unwrap();
        ctx.sink.insert(json_record(5, &json!("b"))).await.unwrap();
        ctx.sink.insert(json_record(10, &json!("c"))).await.unwrap();
        assert_eq!(ctx.sink.processed_offset(), 10);

        ctx.sink.flush_buffer().await.unwrap();
        let staged = ctx.conn.stage_file_names(&ctx.stage);
        assert_eq!(staged.len(), 1);
        let parsed = StagedFileName::parse(&staged[0]).unwrap();
        // only the first record made it into the buffer
        assert_eq!((parsed.start_offset, parsed.end_offset), (10, 10));
    }

    #[tokio::test]
    async fn broken_record_goes_to_the_table_stage_without_advancing() {
        let ctx = test_context(no_meta_config());

        let broken = SinkRecord::new(
            TopicPartition::new("topicA", 0),
            7,
            RecordValue::Content(RecordContent::broken(b"\x00junk".to_vec())),
        );
        ctx.sink.insert(broken).await.unwrap();

        assert!(ctx.conn.stage_file_names(&ctx.stage).is_empty());
        let quarantined = ctx.conn.table_stage_file_names(&ctx.table);
        assert_eq!(quarantined.len(), 1);
        assert!(file_name::is_broken_record_name(&quarantined[0]));
        assert!(quarantined[0].contains("_value"));
        assert!(ctx.sink.processed_offset() < 7);
        assert_eq!(
            counter_value(
                &ctx.registry,
                "stagesink_file_count_table_stage_broken_record"
            ),
            1
        );

        // the repaired record at the same offset still flows
        ctx.sink.insert(json_record(7, &json!("fixed"))).await.unwrap();
        assert_eq!(ctx.sink.processed_offset(), 7);
    }

    #[tokio::test]
    async fn broken_key_is_quarantined_separately() {
        let ctx = test_context(no_meta_config());

        let mut with_broken_key = json_record(3, &json!("ok"));
        with_broken_key.key = Some(RecordValue::Content(RecordContent::broken(
            b"badkey".to_vec(),
        )));
        ctx.sink.insert(with_broken_key).await.unwrap();

        let quarantined = ctx.conn.table_stage_file_names(&ctx.table);
        assert_eq!(quarantined.len(), 1);
        assert!(quarantined[0].contains("_key"));
        // nothing is buffered and no offset advances
        assert_eq!(ctx.sink.processed_offset(), -1);
        ctx.sink.flush_buffer().await.unwrap();
        assert!(ctx.conn.stage_file_names(&ctx.stage).is_empty());
    }

    #[tokio::test]
    async fn tombstones_are_dropped_under_ignore() {
        let config = SinkConfig {
            on_null_values: OnNullValues::Ignore,
            ..no_meta_config()
        };
        let ctx = test_context(config);

        // community converter null
        let tombstone = SinkRecord::new(TopicPartition::new("topicA", 0), 40, RecordValue::Null);
        ctx.sink.insert(tombstone).await.unwrap();
        assert_eq!(ctx.sink.processed_offset(), -1);

        // first-party content that is semantically empty
        let empty = SinkRecord::new(
            TopicPartition::new("topicA", 0),
            41,
            RecordValue::Content(RecordContent::Structured {
                data: vec![Value::Null],
            }),
        );
        ctx.sink.insert(empty).await.unwrap();
        assert_eq!(ctx.sink.processed_offset(), -1);

        ctx.sink.flush_buffer().await.unwrap();
        assert!(ctx.conn.stage_file_names(&ctx.stage).is_empty());
    }

    #[tokio::test]
    async fn tombstones_are_kept_under_default() {
        let ctx = test_context(no_meta_config());

        let tombstone = SinkRecord::new(TopicPartition::new("topicA", 0), 40, RecordValue::Null);
        ctx.sink.insert(tombstone).await.unwrap();
        assert_eq!(ctx.sink.processed_offset(), 40);

        ctx.sink.flush_buffer().await.unwrap();
        let staged = ctx.conn.stage_file_names(&ctx.stage);
        assert_eq!(staged.len(), 1);
        let content = ctx.conn.stage_file_content(&ctx.stage, &staged[0]).unwrap();
        assert_eq!(content, "{\"content\":null}\n");
    }

    #[tokio::test]
    async fn get_offset_is_idempotent_and_quiet_without_new_files() {
        let config = SinkConfig {
            file_size_bytes: 1,
            ..no_meta_config()
        };
        let ctx = test_context(config);

        // nothing flushed yet: committed offset unchanged, no remote call
        assert_eq!(ctx.sink.get_offset().await.unwrap(), 0);
        assert_eq!(ctx.ingest.ingest_call_count(), 0);

        ctx.sink.insert(json_record(9, &json!("x"))).await.unwrap();
        assert_eq!(ctx.sink.get_offset().await.unwrap(), 10);
        assert_eq!(ctx.ingest.ingest_call_count(), 1);

        // no intervening flush: same offset, no second ingestion call
        assert_eq!(ctx.sink.get_offset().await.unwrap(), 10);
        assert_eq!(ctx.ingest.ingest_call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_purges_redelivered_files_after_a_delay() {
        let ctx = test_context(no_meta_config());

        let staged_at = T0_MILLIS - 1_000;
        let keep = format!("{}/20_29_{}.json.gz", ctx.prefix, staged_at);
        let redelivered_1 = format!("{}/30_39_{}.json.gz", ctx.prefix, staged_at);
        let redelivered_2 = format!("{}/40_49_{}.json.gz", ctx.prefix, staged_at);
        for name in [&keep, &redelivered_1, &redelivered_2] {
            ctx.conn.seed_stage_file(&ctx.stage, name.clone(), "old");
        }

        // first record after (re)assignment arrives at offset 30
        ctx.sink.insert(json_record(30, &json!("r"))).await.unwrap();

        // only the in-flight file is reconciled
        assert_eq!(ctx.sink.cleaner_file_names(), vec![keep.clone()]);

        // the redundant files are purged one clean period later
        tokio::time::sleep(cleaner::CLEAN_PERIOD + Duration::from_secs(1)).await;
        let purged = ctx.conn.purged_files();
        assert!(purged.contains(&redelivered_1));
        assert!(purged.contains(&redelivered_2));
        assert!(!purged.contains(&keep));
        assert_eq!(ctx.conn.stage_file_names(&ctx.stage), vec![keep]);
    }

    #[tokio::test]
    async fn cleaner_reconciles_from_both_status_sources() {
        let ctx = test_context(no_meta_config());

        let f1 = format!("{}/0_9_{}.json.gz", ctx.prefix, T0_MILLIS - 5 * 60 * 1_000);
        let f2 = format!("{}/10_19_{}.json.gz", ctx.prefix, T0_MILLIS - 30 * 60 * 1_000);
        let f3 = format!("{}/20_29_{}.json.gz", ctx.prefix, T0_MILLIS - 2 * 60 * 60 * 1_000);
        for name in [&f1, &f2, &f3] {
            ctx.conn.seed_stage_file(&ctx.stage, name.clone(), "x");
        }

        ctx.sink.insert(json_record(100, &json!("r"))).await.unwrap();
        assert_eq!(ctx.sink.cleaner_file_names().len(), 3);

        ctx.ingest.set_report_status(f1.clone(), IngestStatus::Loaded);
        ctx.ingest.set_history_status(f2.clone(), IngestStatus::Failed);

        ctx.sink.check_status().await.unwrap();

        assert_eq!(ctx.conn.purged_files(), vec![f1.clone()]);

        let mut moved = ctx.conn.moved_files();
        moved.sort();
        let mut expected = vec![f2.clone(), f3.clone()];
        expected.sort();
        assert_eq!(moved, expected);

        assert!(ctx.sink.cleaner_file_names().is_empty());
        assert_eq!(gauge_value(&ctx.registry, "stagesink_purged_offset"), 9);
        assert_eq!(
            counter_value(&ctx.registry, "stagesink_file_count_purged"),
            1
        );
        assert_eq!(
            counter_value(
                &ctx.registry,
                "stagesink_file_count_table_stage_ingest_fail"
            ),
            2
        );

        // the history scan only covered the files the report left
        // undecided and still young enough to matter
        assert_eq!(
            ctx.ingest.history_queries(),
            vec![(vec![f2], T0_MILLIS - 60 * 60 * 1_000)]
        );
    }

    #[tokio::test]
    async fn undecided_files_stay_under_watch() {
        let ctx = test_context(no_meta_config());

        let young = format!("{}/0_9_{}.json.gz", ctx.prefix, T0_MILLIS - 1_000);
        ctx.conn.seed_stage_file(&ctx.stage, young.clone(), "x");
        ctx.sink.insert(json_record(100, &json!("r"))).await.unwrap();

        // no terminal status anywhere: the file survives the pass
        ctx.sink.check_status().await.unwrap();
        assert_eq!(ctx.sink.cleaner_file_names(), vec![young]);
        assert!(ctx.conn.purged_files().is_empty());
        assert!(ctx.conn.moved_files().is_empty());
        // young files do not warrant a history scan
        assert!(ctx.ingest.history_queries().is_empty());
    }

    #[tokio::test]
    async fn failed_reconciliation_recovers_by_relisting() {
        let ctx = test_context(no_meta_config());

        let name = format!("{}/0_9_{}.json.gz", ctx.prefix, T0_MILLIS - 1_000);
        ctx.conn.seed_stage_file(&ctx.stage, name.clone(), "x");
        ctx.sink.insert(json_record(100, &json!("r"))).await.unwrap();

        ctx.ingest.fail_next_reports(1);
        let err = ctx.sink.check_status().await.unwrap_err();
        assert_matches!(err, Error::IngestReport { .. });
        // the failed pass consumed the watch list
        assert!(ctx.sink.cleaner_file_names().is_empty());

        // re-listing the stage restores it, deduplicated
        ctx.sink.reset_cleaner_files().await.unwrap();
        ctx.sink.reset_cleaner_files().await.unwrap();
        assert_eq!(ctx.sink.cleaner_file_names(), vec![name]);
    }

    #[tokio::test(start_paused = true)]
    async fn cleaner_loop_relists_after_a_failed_cycle() {
        let ctx = test_context(no_meta_config());

        let name = format!("{}/0_9_{}.json.gz", ctx.prefix, T0_MILLIS - 1_000);
        ctx.conn.seed_stage_file(&ctx.stage, name.clone(), "x");
        ctx.sink.insert(json_record(100, &json!("r"))).await.unwrap();

        ctx.ingest.fail_next_reports(1);

        // first cycle fails and schedules the re-list
        tokio::time::sleep(cleaner::CLEAN_PERIOD + Duration::from_secs(1)).await;
        assert_eq!(
            counter_value(&ctx.registry, "stagesink_cleaner_restart_count"),
            1
        );

        // second cycle restores the watch list from the stage
        tokio::time::sleep(cleaner::CLEAN_PERIOD).await;
        assert_eq!(ctx.sink.cleaner_file_names(), vec![name]);
    }

    #[tokio::test]
    async fn failed_upload_escalates_with_the_buffer_already_detached() {
        let config = SinkConfig {
            file_size_bytes: 1,
            ..no_meta_config()
        };
        let ctx = test_context(config);
        ctx.conn.fail_next_put(1);

        let err = ctx
            .sink
            .insert(json_record(5, &json!("lost")))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Upload { .. });
        assert_eq!(ctx.sink.flushed_offset(), -1);
        assert!(ctx.sink.pending_commit_file_names().is_empty());

        // the next record starts a fresh buffer and stages cleanly
        ctx.sink.insert(json_record(6, &json!("ok"))).await.unwrap();
        let staged = ctx.conn.stage_file_names(&ctx.stage);
        assert_eq!(staged.len(), 1);
        let parsed = StagedFileName::parse(&staged[0]).unwrap();
        assert_eq!((parsed.start_offset, parsed.end_offset), (6, 6));
    }

    #[tokio::test]
    async fn closed_connection_aborts_startup() {
        let ctx = test_context(no_meta_config());
        ctx.conn.set_closed();

        let err = ctx
            .sink
            .insert(json_record(0, &json!("x")))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoConnection);
        assert_eq!(err.error_code(), Some(5010));
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_exhaustion_propagates_from_get_offset() {
        let config = SinkConfig {
            file_size_bytes: 1,
            ..no_meta_config()
        };
        let ctx = test_context(config);

        ctx.sink.insert(json_record(3, &json!("x"))).await.unwrap();
        ctx.ingest.fail_next_ingests(usize::MAX);

        let err = ctx.sink.get_offset().await.unwrap_err();
        assert_matches!(err, Error::IngestTrigger { .. });
        // the files stay under reconciliation, so nothing is lost
        assert_eq!(ctx.sink.cleaner_file_names().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_the_cleaner_and_releases_the_client() {
        let ctx = test_context(no_meta_config());
        ctx.sink.insert(json_record(1, &json!("x"))).await.unwrap();

        ctx.sink.close().await;

        assert!(ctx.ingest.was_closed());
        assert!(ctx
            .registry
            .get_instrument::<U64Gauge>("stagesink_memory_usage")
            .unwrap()
            .get_observer(&attributes())
            .is_none());
    }

    #[tokio::test]
    async fn time_advances_are_reflected_in_staged_names() {
        let config = SinkConfig {
            file_size_bytes: 1,
            ..no_meta_config()
        };
        let ctx = test_context(config);

        ctx.time.inc(Duration::from_secs(5));
        ctx.sink.insert(json_record(0, &json!("x"))).await.unwrap();

        let staged = ctx.conn.stage_file_names(&ctx.stage);
        let parsed = StagedFileName::parse(&staged[0]).unwrap();
        assert_eq!(parsed.ingest_time_millis, T0_MILLIS + 5_000);
    }
}
