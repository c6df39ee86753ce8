//! The per-partition reconciliation loop.
//!
//! Every cycle the cleaner takes ownership of the files under watch,
//! queries the short-window ingest report, falls back to the long-window
//! load history for files the report no longer remembers, purges what
//! loaded, quarantines what failed or aged out, and hands the undecided
//! remainder back for the next cycle. A cycle that fails leaves no state
//! behind: the next cycle re-lists the stage and starts over.

use crate::partition::PartitionSink;
use observability_deps::tracing::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use warehouse::IngestStatus;

/// Interval between reconciliation cycles, and the delay before purging
/// reprocess files found during recovery.
pub(crate) const CLEAN_PERIOD: Duration = Duration::from_secs(60);

/// Files older than this are asked about through the load history, since
/// the ingest report's retention is about this long.
pub(crate) const TEN_MINUTES: Duration = Duration::from_secs(10 * 60);

/// Files older than this with no terminal status are deemed failed.
pub(crate) const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// Move every file with a terminal status out of `files` into `loaded` or
/// `failed`; non-terminal and unreported files stay in `files`.
pub(crate) fn partition_by_status(
    files: &mut Vec<String>,
    statuses: &HashMap<String, IngestStatus>,
    loaded: &mut Vec<String>,
    failed: &mut Vec<String>,
) {
    files.retain(|name| match statuses.get(name) {
        Some(IngestStatus::Loaded) => {
            loaded.push(name.clone());
            false
        }
        Some(IngestStatus::Failed) | Some(IngestStatus::PartiallyLoaded) => {
            failed.push(name.clone());
            false
        }
        _ => true,
    });
}

/// Run reconciliation cycles until the sink shuts down.
pub(crate) async fn run_cleaner(sink: Arc<PartitionSink>) {
    info!(topic_partition = %sink.topic_partition(), "starting cleaner");
    loop {
        sink.emit_telemetry_snapshot();

        tokio::select! {
            _ = tokio::time::sleep(CLEAN_PERIOD) => {}
            _ = sink.shutdown_token().cancelled() => {
                info!(topic_partition = %sink.topic_partition(), "cleaner shutting down");
                return;
            }
        }

        if sink.is_force_reset() {
            match sink.reset_cleaner_files().await {
                Ok(()) => sink.clear_force_reset(),
                Err(e) => {
                    warn!(
                        topic_partition = %sink.topic_partition(),
                        e = %e,
                        "stage re-list failed, retrying next cycle",
                    );
                }
            }
            continue;
        }

        if let Err(e) = sink.check_status().await {
            error!(
                topic_partition = %sink.topic_partition(),
                e = %e,
                "file reconciliation failed, scheduling stage re-list",
            );
            sink.set_force_reset();
        }
    }
}

/// Purge the reprocess files found by recovery once the first cleaner
/// cycle has had a chance to run.
pub(crate) async fn run_delayed_reprocess_purge(sink: Arc<PartitionSink>, files: Vec<String>) {
    tokio::select! {
        _ = tokio::time::sleep(CLEAN_PERIOD) => {}
        _ = sink.shutdown_token().cancelled() => return,
    }
    sink.purge_reprocess_files(&files).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn terminal_statuses_are_split_out() {
        let mut files = names(&["f1", "f2", "f3", "f4", "f5"]);
        let statuses = HashMap::from([
            ("f1".to_string(), IngestStatus::Loaded),
            ("f2".to_string(), IngestStatus::Failed),
            ("f3".to_string(), IngestStatus::PartiallyLoaded),
            ("f4".to_string(), IngestStatus::Pending),
        ]);

        let mut loaded = vec![];
        let mut failed = vec![];
        partition_by_status(&mut files, &statuses, &mut loaded, &mut failed);

        assert_eq!(loaded, names(&["f1"]));
        assert_eq!(failed, names(&["f2", "f3"]));
        // pending and unreported files stay under watch
        assert_eq!(files, names(&["f4", "f5"]));
    }

    #[test]
    fn not_found_is_not_terminal() {
        let mut files = names(&["f1"]);
        let statuses = HashMap::from([("f1".to_string(), IngestStatus::NotFound)]);

        let mut loaded = vec![];
        let mut failed = vec![];
        partition_by_status(&mut files, &statuses, &mut loaded, &mut failed);

        assert!(loaded.is_empty());
        assert!(failed.is_empty());
        assert_eq!(files, names(&["f1"]));
    }
}
