//! Error taxonomy of the sink.
//!
//! Fatal configuration errors carry the stable numeric codes surfaced to
//! operators; everything else is either retried by the reconciliation loop
//! or escalated to the hosting framework for a task restart.

use data_types::TopicPartition;
use snafu::Snafu;
use warehouse::WarehouseError;

/// Errors of the sink pipeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("connection to the warehouse is closed or was never provided (error 5010)"))]
    NoConnection,

    #[snafu(display("table {table} exists but is incompatible with the sink (error 5003)"))]
    IncompatibleTable { table: String },

    #[snafu(display("stage {stage} exists but is incompatible with the sink (error 5004)"))]
    IncompatibleStage { stage: String },

    #[snafu(display("pipe {pipe} exists but is incompatible with the sink (error 5005)"))]
    IncompatiblePipe { pipe: String },

    #[snafu(display("failed to check or create {object}: {source}"))]
    Bootstrap {
        object: String,
        source: WarehouseError,
    },

    #[snafu(display("failed to list stage {stage}: {source}"))]
    ListStage {
        stage: String,
        source: WarehouseError,
    },

    #[snafu(display("failed to upload {file_name} to the stage: {source}"))]
    Upload {
        file_name: String,
        source: WarehouseError,
    },

    #[snafu(display("failed to upload broken record {file_name} to the table stage: {source}"))]
    TableStageUpload {
        file_name: String,
        source: WarehouseError,
    },

    #[snafu(display("failed to purge files from stage {stage}: {source}"))]
    Purge {
        stage: String,
        source: WarehouseError,
    },

    #[snafu(display("failed to move files to the stage of table {table}: {source}"))]
    MoveToTableStage {
        table: String,
        source: WarehouseError,
    },

    #[snafu(display("failed to read the ingest report: {source}"))]
    IngestReport { source: WarehouseError },

    #[snafu(display("failed to scan the load history: {source}"))]
    LoadHistory { source: WarehouseError },

    #[snafu(display("failed to trigger ingestion: {source}"))]
    IngestTrigger { source: WarehouseError },

    #[snafu(display("failed to serialize record at offset {offset}: {source}"))]
    SerializeRecord {
        offset: i64,
        source: serde_json::Error,
    },

    #[snafu(display("no partition sink registered for {topic_partition}"))]
    UnknownPartition { topic_partition: TopicPartition },
}

impl Error {
    /// The stable numeric code of fatal configuration errors, if this is
    /// one.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Self::IncompatibleTable { .. } => Some(5003),
            Self::IncompatibleStage { .. } => Some(5004),
            Self::IncompatiblePipe { .. } => Some(5005),
            Self::NoConnection => Some(5010),
            _ => None,
        }
    }

    /// Whether the error aborts startup rather than a single operation.
    pub fn is_configuration_fatal(&self) -> bool {
        self.error_code().is_some()
    }
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
