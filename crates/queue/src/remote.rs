//! Outbound seam to the remote knowledge store.
//!
//! The queue never talks HTTP itself. Host apps implement [`RemoteWriter`]
//! over whatever client they use and report failures as [`WriteFailure`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use memsync_core::EntryId;

use crate::types::{Metadata, QueueEntry};

/// A single write handed to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Stable across retries; usable as an idempotency key by the remote side.
    pub entry_id: EntryId,
    pub payload: Vec<u8>,
    pub metadata: Metadata,
    /// 1-based number of this attempt.
    pub attempt: u32,
}

impl WriteRequest {
    pub fn for_entry(entry: &QueueEntry) -> Self {
        Self {
            entry_id: entry.id,
            payload: entry.payload.clone(),
            metadata: entry.metadata.clone(),
            attempt: entry.attempt_count + 1,
        }
    }
}

/// Signal attached to a failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Host unreachable, connection reset, DNS failure.
    Network,
    /// No answer within the attempt deadline.
    Timeout,
    /// 4xx-equivalent response.
    ClientError(u16),
    /// 5xx-equivalent response.
    ServerError(u16),
    /// Anything the client could not map.
    Unknown,
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FailureKind::Network => f.write_str("network"),
            FailureKind::Timeout => f.write_str("timeout"),
            FailureKind::ClientError(code) => write!(f, "client error {code}"),
            FailureKind::ServerError(code) => write!(f, "server error {code}"),
            FailureKind::Unknown => f.write_str("unknown"),
        }
    }
}

/// A failed remote write.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct WriteFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl WriteFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, detail)
    }

    pub fn client_error(code: u16, detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ClientError(code), detail)
    }

    pub fn server_error(code: u16, detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ServerError(code), detail)
    }

    pub fn unknown(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Unknown, detail)
    }

    /// Map an HTTP-style status code onto a failure.
    pub fn from_status(code: u16, detail: impl Into<String>) -> Self {
        match code {
            400..=499 => Self::client_error(code, detail),
            500..=599 => Self::server_error(code, detail),
            _ => Self::unknown(detail),
        }
    }
}

/// Capability that performs the actual remote write.
#[async_trait]
pub trait RemoteWriter: Send + Sync {
    async fn write(&self, request: &WriteRequest) -> Result<(), WriteFailure>;
}

#[async_trait]
impl<W: RemoteWriter + ?Sized> RemoteWriter for Arc<W> {
    async fn write(&self, request: &WriteRequest) -> Result<(), WriteFailure> {
        (**self).write(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn request_carries_the_next_attempt_number() {
        let mut entry = QueueEntry::new(b"{}".to_vec(), Metadata::new(), Utc::now());
        entry.attempt_count = 2;

        let request = WriteRequest::for_entry(&entry);
        assert_eq!(request.entry_id, entry.id);
        assert_eq!(request.attempt, 3);
    }

    #[test]
    fn status_codes_map_to_kinds() {
        assert_eq!(WriteFailure::from_status(401, "").kind, FailureKind::ClientError(401));
        assert_eq!(WriteFailure::from_status(503, "").kind, FailureKind::ServerError(503));
        assert_eq!(WriteFailure::from_status(302, "").kind, FailureKind::Unknown);
    }

    #[test]
    fn failure_display_includes_kind_and_detail() {
        let failure = WriteFailure::server_error(502, "bad gateway");
        assert_eq!(failure.to_string(), "server error 502: bad gateway");
    }
}
