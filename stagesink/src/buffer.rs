//! The per-partition record accumulator.
//!
//! Note that the byte count kept here is an accounting convention (two
//! bytes per character of the serialized text), not the exact size of the
//! staged file; it only needs to keep flush sizes roughly bounded.

/// Accumulates serialized records between flushes.
///
/// Not internally synchronized; the owning partition sink serializes all
/// access under its buffer lock and detaches the whole buffer by swapping
/// in a fresh one.
#[derive(Debug)]
pub struct PartitionBuffer {
    data: String,
    num_records: i64,
    buffer_size_bytes: u64,
    first_offset: i64,
    last_offset: i64,
}

impl Default for PartitionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self {
            data: String::new(),
            num_records: 0,
            buffer_size_bytes: 0,
            first_offset: -1,
            last_offset: -1,
        }
    }

    /// Append one serialized record with its offset.
    pub fn insert(&mut self, offset: i64, serialized: &str) {
        if self.is_empty() {
            self.first_offset = offset;
        }
        self.data.push_str(serialized);
        self.data.push('\n');
        self.num_records += 1;
        self.buffer_size_bytes += 2 * serialized.chars().count() as u64;
        self.last_offset = offset;
    }

    /// Whether no record was inserted yet.
    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }

    /// The accumulated text.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Number of records inserted.
    pub fn num_records(&self) -> i64 {
        self.num_records
    }

    /// Accounted size in bytes.
    pub fn buffer_size_bytes(&self) -> u64 {
        self.buffer_size_bytes
    }

    /// Offset of the first record, `-1` while empty.
    pub fn first_offset(&self) -> i64 {
        self.first_offset
    }

    /// Offset of the last record, `-1` while empty.
    pub fn last_offset(&self) -> i64 {
        self.last_offset
    }
}
