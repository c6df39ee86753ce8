//! Per-partition sink pipeline of a streaming connector that ingests
//! records from a distributed log into a cloud warehouse through staged
//! files.
//!
//! For every assigned topic partition the [`SinkService`] owns a
//! [`PartitionSink`] that buffers records, flushes them as immutable files
//! to a remote internal stage, triggers asynchronous ingestion at offset
//! commit time, and reconciles file outcomes in a background cleaner:
//! loaded files are purged, failed or aged-out files are quarantined on
//! the destination table's stage. All durable state lives in the stage
//! listing and the offsets encoded in file names; a restarted task
//! recovers by re-listing the stage.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

mod bootstrap;
mod buffer;
mod cleaner;
mod metrics;
mod record;
mod recovery;

pub mod config;
pub mod error;
pub mod partition;
pub mod service;

pub use config::{OnNullValues, SinkConfig, SinkMetadataConfig};
pub use error::Error;
pub use partition::PartitionSink;
pub use service::SinkService;
