//! In-memory mock implementations backing the sink's tests.

use crate::{ConnectionService, IngestStatus, IngestionService, WarehouseError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct MockConnectionState {
    closed: bool,
    tables: HashSet<String>,
    stages: HashSet<String>,
    pipes: HashSet<String>,
    incompatible_tables: HashSet<String>,
    incompatible_stages: HashSet<String>,
    incompatible_pipes: HashSet<String>,
    // stage name -> file name -> content
    stage_files: BTreeMap<String, BTreeMap<String, String>>,
    // table name -> file name -> bytes
    table_stage_files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    created_tables: Vec<String>,
    created_stages: Vec<String>,
    created_pipes: Vec<String>,
    purged: Vec<String>,
    moved: Vec<String>,
    fail_list_stage_remaining: usize,
    fail_put_remaining: usize,
}

/// A [`ConnectionService`] over in-memory state, with failure injection
/// switches and recorded operations for assertions.
#[derive(Debug)]
pub struct MockConnection {
    name: String,
    state: Mutex<MockConnectionState>,
    ingest: Arc<MockIngestionService>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new("test-connector")
    }
}

impl MockConnection {
    /// Create an open connection named `name` with empty state.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Default::default(),
            ingest: Arc::new(MockIngestionService::default()),
        }
    }

    /// The ingestion service every `build_ingest_service` call hands out.
    pub fn ingest_service(&self) -> Arc<MockIngestionService> {
        Arc::clone(&self.ingest)
    }

    /// Mark the connection closed.
    pub fn set_closed(&self) {
        self.state.lock().closed = true;
    }

    /// Pretend `table` already exists.
    pub fn add_existing_table(&self, table: impl Into<String>) {
        self.state.lock().tables.insert(table.into());
    }

    /// Pretend `stage` already exists.
    pub fn add_existing_stage(&self, stage: impl Into<String>) {
        self.state.lock().stages.insert(stage.into());
    }

    /// Pretend `pipe` already exists.
    pub fn add_existing_pipe(&self, pipe: impl Into<String>) {
        self.state.lock().pipes.insert(pipe.into());
    }

    /// Make an existing `table` report as incompatible.
    pub fn mark_table_incompatible(&self, table: impl Into<String>) {
        self.state.lock().incompatible_tables.insert(table.into());
    }

    /// Make an existing `stage` report as incompatible.
    pub fn mark_stage_incompatible(&self, stage: impl Into<String>) {
        self.state.lock().incompatible_stages.insert(stage.into());
    }

    /// Make an existing `pipe` report as incompatible.
    pub fn mark_pipe_incompatible(&self, pipe: impl Into<String>) {
        self.state.lock().incompatible_pipes.insert(pipe.into());
    }

    /// Place a file on `stage` without going through an upload.
    pub fn seed_stage_file(
        &self,
        stage: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<String>,
    ) {
        self.state
            .lock()
            .stage_files
            .entry(stage.into())
            .or_default()
            .insert(file_name.into(), content.into());
    }

    /// Fail the next `n` `list_stage` calls.
    pub fn fail_next_list_stage(&self, n: usize) {
        self.state.lock().fail_list_stage_remaining = n;
    }

    /// Fail the next `n` `put_with_cache` calls.
    pub fn fail_next_put(&self, n: usize) {
        self.state.lock().fail_put_remaining = n;
    }

    /// Names of the files currently on `stage`.
    pub fn stage_file_names(&self, stage: &str) -> Vec<String> {
        self.state
            .lock()
            .stage_files
            .get(stage)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Content of one staged file.
    pub fn stage_file_content(&self, stage: &str, file_name: &str) -> Option<String> {
        self.state
            .lock()
            .stage_files
            .get(stage)
            .and_then(|files| files.get(file_name).cloned())
    }

    /// Names of the files on the quarantine stage of `table`.
    pub fn table_stage_file_names(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .table_stage_files
            .get(table)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// All files ever purged, in call order.
    pub fn purged_files(&self) -> Vec<String> {
        self.state.lock().purged.clone()
    }

    /// All files ever moved to a table stage, in call order.
    pub fn moved_files(&self) -> Vec<String> {
        self.state.lock().moved.clone()
    }

    /// Tables created through this connection.
    pub fn created_tables(&self) -> Vec<String> {
        self.state.lock().created_tables.clone()
    }

    /// Stages created through this connection.
    pub fn created_stages(&self) -> Vec<String> {
        self.state.lock().created_stages.clone()
    }

    /// Pipes created through this connection.
    pub fn created_pipes(&self) -> Vec<String> {
        self.state.lock().created_pipes.clone()
    }
}

#[async_trait]
impl ConnectionService for MockConnection {
    fn connector_name(&self) -> &str {
        &self.name
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().tables.contains(table))
    }

    async fn stage_exists(&self, stage: &str) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().stages.contains(stage))
    }

    async fn pipe_exists(&self, pipe: &str) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().pipes.contains(pipe))
    }

    async fn is_table_compatible(&self, table: &str) -> Result<bool, WarehouseError> {
        Ok(!self.state.lock().incompatible_tables.contains(table))
    }

    async fn is_stage_compatible(&self, stage: &str) -> Result<bool, WarehouseError> {
        Ok(!self.state.lock().incompatible_stages.contains(stage))
    }

    async fn is_pipe_compatible(
        &self,
        pipe: &str,
        _table: &str,
        _stage: &str,
    ) -> Result<bool, WarehouseError> {
        Ok(!self.state.lock().incompatible_pipes.contains(pipe))
    }

    async fn create_table(&self, table: &str) -> Result<(), WarehouseError> {
        let mut state = self.state.lock();
        state.tables.insert(table.to_string());
        state.created_tables.push(table.to_string());
        Ok(())
    }

    async fn create_stage(&self, stage: &str) -> Result<(), WarehouseError> {
        let mut state = self.state.lock();
        state.stages.insert(stage.to_string());
        state.created_stages.push(stage.to_string());
        Ok(())
    }

    async fn create_pipe(
        &self,
        pipe: &str,
        _table: &str,
        _stage: &str,
    ) -> Result<(), WarehouseError> {
        let mut state = self.state.lock();
        state.pipes.insert(pipe.to_string());
        state.created_pipes.push(pipe.to_string());
        Ok(())
    }

    async fn list_stage(
        &self,
        stage: &str,
        prefix: &str,
    ) -> Result<Vec<String>, WarehouseError> {
        let mut state = self.state.lock();
        if state.fail_list_stage_remaining > 0 {
            state.fail_list_stage_remaining -= 1;
            return Err(WarehouseError::io("injected list_stage failure"));
        }
        Ok(state
            .stage_files
            .get(stage)
            .map(|files| {
                files
                    .keys()
                    .filter(|name| name.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_with_cache(
        &self,
        stage: &str,
        file_name: &str,
        content: &str,
    ) -> Result<(), WarehouseError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(WarehouseError::not_connected("connection closed"));
        }
        if state.fail_put_remaining > 0 {
            state.fail_put_remaining -= 1;
            return Err(WarehouseError::io("injected put failure"));
        }
        state
            .stage_files
            .entry(stage.to_string())
            .or_default()
            .insert(file_name.to_string(), content.to_string());
        Ok(())
    }

    async fn put_to_table_stage(
        &self,
        table: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), WarehouseError> {
        self.state
            .lock()
            .table_stage_files
            .entry(table.to_string())
            .or_default()
            .insert(file_name.to_string(), content.to_vec());
        Ok(())
    }

    async fn purge_stage(&self, stage: &str, files: &[String]) -> Result<(), WarehouseError> {
        let mut state = self.state.lock();
        if let Some(staged) = state.stage_files.get_mut(stage) {
            for file in files {
                staged.remove(file);
            }
        }
        state.purged.extend(files.iter().cloned());
        Ok(())
    }

    async fn move_to_table_stage(
        &self,
        table: &str,
        stage: &str,
        files: &[String],
    ) -> Result<(), WarehouseError> {
        let mut state = self.state.lock();
        for file in files {
            let content = state
                .stage_files
                .get_mut(stage)
                .and_then(|staged| staged.remove(file))
                .unwrap_or_default();
            state
                .table_stage_files
                .entry(table.to_string())
                .or_default()
                .insert(file.clone(), content.into_bytes());
            state.moved.push(file.clone());
        }
        Ok(())
    }

    fn build_ingest_service(&self, _stage: &str, _pipe: &str) -> Arc<dyn IngestionService> {
        Arc::clone(&self.ingest) as _
    }
}

#[derive(Debug, Default)]
struct MockIngestionState {
    report: HashMap<String, IngestStatus>,
    history: HashMap<String, IngestStatus>,
    ingest_calls: Vec<Vec<String>>,
    ingest_attempts: usize,
    history_queries: Vec<(Vec<String>, i64)>,
    fail_ingest_remaining: usize,
    fail_report_remaining: usize,
    fail_history_remaining: usize,
    closed: bool,
}

/// An [`IngestionService`] with scripted statuses and recorded calls.
///
/// The ingest report answers for every asked file, defaulting to
/// [`IngestStatus::NotFound`]; the load history only answers for files it
/// was scripted with, mirroring the two real endpoints.
#[derive(Debug, Default)]
pub struct MockIngestionService {
    state: Mutex<MockIngestionState>,
}

impl MockIngestionService {
    /// Script the ingest-report status of `file`.
    pub fn set_report_status(&self, file: impl Into<String>, status: IngestStatus) {
        self.state.lock().report.insert(file.into(), status);
    }

    /// Script the load-history status of `file`.
    pub fn set_history_status(&self, file: impl Into<String>, status: IngestStatus) {
        self.state.lock().history.insert(file.into(), status);
    }

    /// Fail the next `n` `ingest_files` calls.
    pub fn fail_next_ingests(&self, n: usize) {
        self.state.lock().fail_ingest_remaining = n;
    }

    /// Fail the next `n` `read_ingest_report` calls.
    pub fn fail_next_reports(&self, n: usize) {
        self.state.lock().fail_report_remaining = n;
    }

    /// Fail the next `n` `read_load_history` calls.
    pub fn fail_next_histories(&self, n: usize) {
        self.state.lock().fail_history_remaining = n;
    }

    /// All files passed to successful `ingest_files` calls, flattened in
    /// call order.
    pub fn ingested_files(&self) -> Vec<String> {
        self.state.lock().ingest_calls.iter().flatten().cloned().collect()
    }

    /// Number of successful `ingest_files` calls.
    pub fn ingest_call_count(&self) -> usize {
        self.state.lock().ingest_calls.len()
    }

    /// Number of `ingest_files` attempts, including failed ones.
    pub fn ingest_attempts(&self) -> usize {
        self.state.lock().ingest_attempts
    }

    /// The `(files, since_millis)` arguments of every history scan.
    pub fn history_queries(&self) -> Vec<(Vec<String>, i64)> {
        self.state.lock().history_queries.clone()
    }

    /// Whether `close` was called.
    pub fn was_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl IngestionService for MockIngestionService {
    async fn ingest_files(&self, files: &[String]) -> Result<(), WarehouseError> {
        let mut state = self.state.lock();
        state.ingest_attempts += 1;
        if state.fail_ingest_remaining > 0 {
            state.fail_ingest_remaining -= 1;
            return Err(WarehouseError::io("injected ingest failure"));
        }
        state.ingest_calls.push(files.to_vec());
        Ok(())
    }

    async fn read_ingest_report(
        &self,
        files: &[String],
    ) -> Result<HashMap<String, IngestStatus>, WarehouseError> {
        let mut state = self.state.lock();
        if state.fail_report_remaining > 0 {
            state.fail_report_remaining -= 1;
            return Err(WarehouseError::io("injected report failure"));
        }
        Ok(files
            .iter()
            .map(|f| {
                let status = state
                    .report
                    .get(f)
                    .copied()
                    .unwrap_or(IngestStatus::NotFound);
                (f.clone(), status)
            })
            .collect())
    }

    async fn read_load_history(
        &self,
        files: &[String],
        since_millis: i64,
    ) -> Result<HashMap<String, IngestStatus>, WarehouseError> {
        let mut state = self.state.lock();
        if state.fail_history_remaining > 0 {
            state.fail_history_remaining -= 1;
            return Err(WarehouseError::io("injected history failure"));
        }
        state
            .history_queries
            .push((files.to_vec(), since_millis));
        Ok(files
            .iter()
            .filter_map(|f| state.history.get(f).map(|s| (f.clone(), *s)))
            .collect())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WarehouseErrorKind;

    #[tokio::test]
    async fn bootstrap_surface_tracks_creations() {
        let conn = MockConnection::default();
        assert!(!conn.table_exists("t").await.unwrap());
        conn.create_table("t").await.unwrap();
        assert!(conn.table_exists("t").await.unwrap());
        assert!(conn.is_table_compatible("t").await.unwrap());
        assert_eq!(conn.created_tables(), vec!["t".to_string()]);

        conn.mark_table_incompatible("t");
        assert!(!conn.is_table_compatible("t").await.unwrap());
    }

    #[tokio::test]
    async fn staged_files_move_and_purge() {
        let conn = MockConnection::default();
        conn.seed_stage_file("s", "p/0_1_2.json.gz", "data");
        conn.seed_stage_file("s", "p/2_3_4.json.gz", "more");
        conn.seed_stage_file("s", "q/0_1_2.json.gz", "other prefix");

        assert_eq!(
            conn.list_stage("s", "p/").await.unwrap(),
            vec!["p/0_1_2.json.gz".to_string(), "p/2_3_4.json.gz".to_string()]
        );

        conn.purge_stage("s", &["p/0_1_2.json.gz".to_string()])
            .await
            .unwrap();
        conn.move_to_table_stage("t", "s", &["p/2_3_4.json.gz".to_string()])
            .await
            .unwrap();

        assert_eq!(conn.stage_file_names("s"), vec!["q/0_1_2.json.gz".to_string()]);
        assert_eq!(
            conn.table_stage_file_names("t"),
            vec!["p/2_3_4.json.gz".to_string()]
        );
        assert_eq!(conn.purged_files(), vec!["p/0_1_2.json.gz".to_string()]);
        assert_eq!(conn.moved_files(), vec!["p/2_3_4.json.gz".to_string()]);
    }

    #[tokio::test]
    async fn report_answers_all_files_history_only_known_ones() {
        let service = MockIngestionService::default();
        service.set_report_status("f1", IngestStatus::Loaded);
        service.set_history_status("f2", IngestStatus::Failed);

        let files = vec!["f1".to_string(), "f2".to_string()];
        let report = service.read_ingest_report(&files).await.unwrap();
        assert_eq!(report.get("f1"), Some(&IngestStatus::Loaded));
        assert_eq!(report.get("f2"), Some(&IngestStatus::NotFound));

        let history = service.read_load_history(&files, 123).await.unwrap();
        assert_eq!(history.get("f1"), None);
        assert_eq!(history.get("f2"), Some(&IngestStatus::Failed));
        assert_eq!(service.history_queries(), vec![(files, 123)]);
    }

    #[tokio::test]
    async fn closed_connection_rejects_uploads() {
        let conn = MockConnection::default();
        conn.set_closed();
        let err = conn
            .put_with_cache("s", "p/0_0_1.json.gz", "x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), WarehouseErrorKind::NotConnected);
    }
}
