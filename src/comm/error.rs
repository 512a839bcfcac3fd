use thiserror::Error;

/// Failures of the message-passing layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    /// The peer rank hung up before the expected message arrived.
    #[error("rank {rank} disconnected before delivering the expected message")]
    Disconnected {
        /// The rank that went away.
        rank: u32,
    },

    /// A rank outside `0..size` was addressed.
    #[error("rank {rank} is out of range for a communicator of size {size}")]
    InvalidRank {
        /// Requested rank.
        rank: u32,
        /// Number of ranks in the communicator.
        size: u32,
    },

    /// A received byte payload is not a whole number of records.
    #[error("payload of {len} bytes is not a multiple of the {record_size}-byte record size")]
    PayloadLength {
        /// Received byte count.
        len: usize,
        /// Expected record size in bytes.
        record_size: usize,
    },

    /// A scatter root supplied the wrong number of per-rank parts.
    #[error("scatter root supplied {got} parts for {expected} ranks")]
    PartCount {
        /// Number of ranks.
        expected: usize,
        /// Number of parts supplied.
        got: usize,
    },

    /// A structured payload could not be encoded or decoded.
    #[error("failed to encode or decode a structured payload: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for CommError {
    fn from(e: serde_json::Error) -> Self {
        CommError::Decode(e.to_string())
    }
}
