//! Bounded-backoff decoration of an [`IngestionService`].

use crate::{IngestStatus, IngestionService, WarehouseError};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use observability_deps::tracing::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Default number of ingest attempts before giving up.
pub const DEFAULT_MAX_INGEST_ATTEMPTS: usize = 10;

/// Wraps an [`IngestionService`] so that [`IngestionService::ingest_files`]
/// retries transient failures with exponential backoff and surfaces an
/// error only after the attempt budget is spent.
///
/// Status reads are not retried here; the reconciliation loop that issues
/// them re-runs every cycle anyway.
#[derive(Debug)]
pub struct BackoffIngestionService {
    inner: Arc<dyn IngestionService>,
    backoff_config: BackoffConfig,
    max_attempts: usize,
}

impl BackoffIngestionService {
    /// Decorate `inner` with the default attempt budget.
    pub fn new(inner: Arc<dyn IngestionService>) -> Self {
        Self::with_config(inner, BackoffConfig::default(), DEFAULT_MAX_INGEST_ATTEMPTS)
    }

    /// Decorate `inner` with an explicit backoff configuration and attempt
    /// budget.
    pub fn with_config(
        inner: Arc<dyn IngestionService>,
        backoff_config: BackoffConfig,
        max_attempts: usize,
    ) -> Self {
        Self {
            inner,
            backoff_config,
            max_attempts,
        }
    }
}

#[async_trait]
impl IngestionService for BackoffIngestionService {
    async fn ingest_files(&self, files: &[String]) -> Result<(), WarehouseError> {
        debug!(n_files = files.len(), "triggering ingest");
        Backoff::new(&self.backoff_config)
            .retry_with_limit("ingest_files", self.max_attempts, || {
                let inner = Arc::clone(&self.inner);
                async move { inner.ingest_files(files).await }
            })
            .await
            .map_err(|e| WarehouseError::io(e.to_string()))
    }

    async fn read_ingest_report(
        &self,
        files: &[String],
    ) -> Result<HashMap<String, IngestStatus>, WarehouseError> {
        self.inner.read_ingest_report(files).await
    }

    async fn read_load_history(
        &self,
        files: &[String],
        since_millis: i64,
    ) -> Result<HashMap<String, IngestStatus>, WarehouseError> {
        self.inner.read_load_history(files, since_millis).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
