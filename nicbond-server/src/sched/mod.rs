pub mod fetch;
pub mod planner;

use std::net::IpAddr;
use thiserror::Error;

/// One contiguous byte range of the target object, assigned to a specific
/// (interface, common-client slot) pair. Ranges are inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    /// Global emission order, `0..N`.
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub attempt: u32,
    pub nic_ip: IpAddr,
    pub slot: u8,
}

impl ChunkTask {
    /// Bytes covered by this range, inclusive of both ends.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Download failure classification. Only `Retryable` feeds the backoff path.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("download cancelled")]
    Cancelled,
    #[error("planning failed: {0}")]
    Planning(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Retryable(_))
    }
}
