//! Error types for `shiplog`.

/// Result type for state history log operations.
pub type ShipLogResult<T> = Result<T, ShipLogError>;

/// Errors returned by the `shiplog` crate.
#[derive(thiserror::Error, Debug)]
pub enum ShipLogError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The log's framing is invalid and cannot be repaired by tail truncation.
    #[error("corrupt log: {0}")]
    CorruptLog(String),

    /// The magic tag is valid but the format version is newer than this build supports.
    #[error("unsupported log version {version} (max supported {max})")]
    UnsupportedVersion {
        /// Version decoded from the entry magic.
        version: u32,
        /// Highest version this build can read.
        max: u32,
    },

    /// Requested block is below `begin` or at/above `end`.
    #[error("block {block_num} out of range [{begin}, {end})")]
    OutOfRange {
        /// The block number that was requested.
        block_num: u32,
        /// First block reachable through the catalog or the active segment.
        begin: u32,
        /// One past the last stored block.
        end: u32,
    },

    /// `prev_id` does not match the id of the preceding stored block.
    #[error("fork mismatch at block {block_num}: expected previous id {expected}, got {actual}")]
    ForkMismatch {
        /// Block number of the entry being appended.
        block_num: u32,
        /// Id currently stored for `block_num - 1` (hex).
        expected: String,
        /// `prev_id` carried by the rejected append (hex).
        actual: String,
    },

    /// A payload rewrite attempted to change the payload's byte length.
    #[error("payload length changed by in-place modify (expected {expected}, got {actual})")]
    LengthChanged {
        /// On-disk payload size.
        expected: u64,
        /// Size produced by the transform.
        actual: u64,
    },

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The writer thread faulted earlier; the fault is latched and no further
    /// writes are accepted.
    #[error("writer failed: {0}")]
    WriterFailed(String),

    /// Encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Decoding error.
    #[error("decode error: {0}")]
    Decode(String),
}
