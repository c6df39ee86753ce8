//! Encoding and decoding of staged-file names.
//!
//! All durable state of the sink lives in the names of the files it stages:
//! `{prefix}/{start_offset}_{end_offset}_{ingest_time_millis}.json.gz`.
//! Broken records go to a parallel namespace that carries a single offset
//! and a key/value marker instead of an offset range.

use snafu::{OptionExt, ResultExt, Snafu};

/// Suffix of regular staged data files.
pub const STAGED_FILE_SUFFIX: &str = ".json.gz";

/// Suffix marking the broken-record namespace.
pub const BROKEN_FILE_SUFFIX: &str = ".broken.json.gz";

/// Errors when decoding a file name.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum FileNameError {
    #[snafu(display("staged file name '{name}' does not end in {STAGED_FILE_SUFFIX}"))]
    MissingSuffix { name: String },

    #[snafu(display("staged file name '{name}' is a broken-record file"))]
    BrokenNamespace { name: String },

    #[snafu(display(
        "staged file name '{name}' must carry start offset, end offset and ingest time"
    ))]
    MalformedFields { name: String },

    #[snafu(display("staged file name '{name}' carries a non-numeric field"))]
    NonNumericField {
        name: String,
        source: std::num::ParseIntError,
    },
}

/// Prefix under which one partition's files are staged.
pub fn file_prefix(connector_name: &str, table_name: &str, partition: i32) -> String {
    format!("{connector_name}/{table_name}/{partition}")
}

/// The decoded identity of a staged data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFileName {
    /// Connector/table/partition prefix.
    pub prefix: String,
    /// Offset of the first record in the file.
    pub start_offset: i64,
    /// Offset of the last record in the file.
    pub end_offset: i64,
    /// Wall-clock milliseconds at which the file was staged.
    pub ingest_time_millis: i64,
}

impl StagedFileName {
    /// Render the file name.
    pub fn encode(&self) -> String {
        format!(
            "{}/{}_{}_{}{}",
            self.prefix, self.start_offset, self.end_offset, self.ingest_time_millis,
            STAGED_FILE_SUFFIX
        )
    }

    /// Decode a file name produced by [`StagedFileName::encode`].
    pub fn parse(name: &str) -> Result<Self, FileNameError> {
        if name.ends_with(BROKEN_FILE_SUFFIX) {
            return BrokenNamespaceSnafu { name }.fail();
        }
        let stem = name
            .strip_suffix(STAGED_FILE_SUFFIX)
            .context(MissingSuffixSnafu { name })?;

        let (prefix, fields) = stem
            .rsplit_once('/')
            .context(MalformedFieldsSnafu { name })?;

        let mut parts = fields.split('_');
        let mut next_number = || -> Result<i64, FileNameError> {
            parts
                .next()
                .context(MalformedFieldsSnafu { name })?
                .parse()
                .context(NonNumericFieldSnafu { name })
        };
        let start_offset = next_number()?;
        let end_offset = next_number()?;
        let ingest_time_millis = next_number()?;
        if parts.next().is_some() {
            return MalformedFieldsSnafu { name }.fail();
        }

        Ok(Self {
            prefix: prefix.to_string(),
            start_offset,
            end_offset,
            ingest_time_millis,
        })
    }
}

/// Decode only the start offset of `name`.
pub fn start_offset(name: &str) -> Result<i64, FileNameError> {
    Ok(StagedFileName::parse(name)?.start_offset)
}

/// Decode only the end offset of `name`.
pub fn end_offset(name: &str) -> Result<i64, FileNameError> {
    Ok(StagedFileName::parse(name)?.end_offset)
}

/// Decode only the ingest timestamp of `name`, in epoch milliseconds.
pub fn time_ingested(name: &str) -> Result<i64, FileNameError> {
    Ok(StagedFileName::parse(name)?.ingest_time_millis)
}

/// Render the name for a broken-record file holding the key or value bytes
/// of the record at `offset`.
pub fn broken_record_file_name(
    prefix: &str,
    offset: i64,
    ingest_time_millis: i64,
    is_key: bool,
) -> String {
    let marker = if is_key { "key" } else { "value" };
    format!("{prefix}/{offset}_{ingest_time_millis}_{marker}{BROKEN_FILE_SUFFIX}")
}

/// Whether `name` belongs to the broken-record namespace.
pub fn is_broken_record_name(name: &str) -> bool {
    name.ends_with(BROKEN_FILE_SUFFIX)
}
