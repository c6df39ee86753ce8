//! Contracts consumed by the sink: a connection that executes DDL and
//! object-storage operations against the warehouse, and an ingestion
//! service that triggers and reports on asynchronous file loads.
//!
//! The in-memory [`mock`] implementations back the sink's tests.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

pub mod mock;
pub mod retry;

/// Generic boxed error type used at the warehouse boundary.
///
/// The dynamic boxing makes it easy to carry errors from different client
/// implementations; the kind preserves how callers should react.
#[derive(Debug)]
pub struct WarehouseError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: WarehouseErrorKind,
}

impl WarehouseError {
    /// Wrap an error with an explicit kind.
    pub fn new(
        kind: WarehouseErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The remote rejected our input.
    pub fn invalid_input(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WarehouseErrorKind::InvalidInput, e)
    }

    /// A network or service fault.
    pub fn io(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WarehouseErrorKind::IO, e)
    }

    /// The connection is closed or was never established.
    pub fn not_connected(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WarehouseErrorKind::NotConnected, e)
    }

    /// Anything else.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WarehouseErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> WarehouseErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for WarehouseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WarehouseError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for WarehouseError {}

impl From<std::io::Error> for WarehouseError {
    fn from(e: std::io::Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: WarehouseErrorKind::IO,
        }
    }
}

impl From<String> for WarehouseError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: WarehouseErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for WarehouseError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: WarehouseErrorKind::Unknown,
        }
    }
}

/// Broad classification of a [`WarehouseError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WarehouseErrorKind {
    /// This operation failed for an unknown reason.
    Unknown,

    /// This operation was provided with invalid input data.
    InvalidInput,

    /// A fatal IO error occurred - non-fatal errors should be retried
    /// internally.
    IO,

    /// The connection is closed or was never established.
    NotConnected,
}

/// Status of one staged file as reported by the ingestion service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IngestStatus {
    /// All rows of the file were loaded into the table.
    Loaded,
    /// The file was rejected.
    Failed,
    /// Some rows loaded, some were rejected.
    PartiallyLoaded,
    /// The reporting endpoint no longer (or does not yet) know the file.
    NotFound,
    /// The file is queued or mid-load.
    Pending,
}

impl IngestStatus {
    /// Whether this status ends the file's reconciliation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Loaded | Self::Failed | Self::PartiallyLoaded)
    }
}

/// Executes DDL and object-storage operations against the warehouse.
///
/// Creation operations must be idempotent or safe under races with other
/// workers bootstrapping the same objects.
#[async_trait]
pub trait ConnectionService: Debug + Send + Sync + 'static {
    /// Name of the connector instance that owns this connection.
    fn connector_name(&self) -> &str;

    /// Whether the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Whether `table` exists.
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError>;

    /// Whether `stage` exists.
    async fn stage_exists(&self, stage: &str) -> Result<bool, WarehouseError>;

    /// Whether `pipe` exists.
    async fn pipe_exists(&self, pipe: &str) -> Result<bool, WarehouseError>;

    /// Whether an existing `table` has the schema the sink requires.
    async fn is_table_compatible(&self, table: &str) -> Result<bool, WarehouseError>;

    /// Whether an existing `stage` is usable by the sink.
    async fn is_stage_compatible(&self, stage: &str) -> Result<bool, WarehouseError>;

    /// Whether an existing `pipe` binds `stage` to `table` with the
    /// ingestion definition the sink requires.
    async fn is_pipe_compatible(
        &self,
        pipe: &str,
        table: &str,
        stage: &str,
    ) -> Result<bool, WarehouseError>;

    /// Create `table`.
    async fn create_table(&self, table: &str) -> Result<(), WarehouseError>;

    /// Create `stage`.
    async fn create_stage(&self, stage: &str) -> Result<(), WarehouseError>;

    /// Create `pipe` binding `stage` to `table`.
    async fn create_pipe(
        &self,
        pipe: &str,
        table: &str,
        stage: &str,
    ) -> Result<(), WarehouseError>;

    /// List the names of all files on `stage` under `prefix`.
    async fn list_stage(&self, stage: &str, prefix: &str)
        -> Result<Vec<String>, WarehouseError>;

    /// Upload `content` to `stage` as `file_name`. Overwriting an existing
    /// file of the same name is permitted.
    async fn put_with_cache(
        &self,
        stage: &str,
        file_name: &str,
        content: &str,
    ) -> Result<(), WarehouseError>;

    /// Upload raw bytes to the quarantine stage of `table`.
    async fn put_to_table_stage(
        &self,
        table: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<(), WarehouseError>;

    /// Delete `files` from `stage`.
    async fn purge_stage(&self, stage: &str, files: &[String]) -> Result<(), WarehouseError>;

    /// Relocate `files` from `stage` to the quarantine stage of `table`.
    async fn move_to_table_stage(
        &self,
        table: &str,
        stage: &str,
        files: &[String],
    ) -> Result<(), WarehouseError>;

    /// Build the ingestion service client for `pipe` over `stage`.
    fn build_ingest_service(&self, stage: &str, pipe: &str) -> Arc<dyn IngestionService>;
}

/// Triggers asynchronous ingestion of staged files and reports on their
/// outcome through two endpoints with different retention windows.
#[async_trait]
pub trait IngestionService: Debug + Send + Sync + 'static {
    /// Ask the warehouse to ingest `files`. Implementations retry
    /// internally and return an error only once their retry budget is
    /// exhausted.
    async fn ingest_files(&self, files: &[String]) -> Result<(), WarehouseError>;

    /// Short-window, low-latency status lookup. Files the endpoint does not
    /// remember come back as [`IngestStatus::NotFound`].
    async fn read_ingest_report(
        &self,
        files: &[String],
    ) -> Result<HashMap<String, IngestStatus>, WarehouseError>;

    /// Long-window, higher-latency status scan covering loads since
    /// `since_millis`.
    async fn read_load_history(
        &self,
        files: &[String],
        since_millis: i64,
    ) -> Result<HashMap<String, IngestStatus>, WarehouseError>;

    /// Release the client.
    async fn close(&self);
}
