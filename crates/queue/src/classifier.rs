//! Failure classification.
//!
//! Every failed write attempt passes through [`ErrorClassifier::classify`].
//! Nothing else in the crate looks at status codes or failure kinds.

use serde::{Deserialize, Serialize};

use crate::remote::{FailureKind, WriteFailure};

/// Client status codes that indicate a transient condition by default.
pub const DEFAULT_RETRYABLE_CLIENT_CODES: &[u16] = &[408, 429];

/// Three-way verdict on a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Transient; try again after backoff.
    Retryable,
    /// Will never succeed; dead-letter now.
    Terminal,
    /// Not recognised; retry under the stricter attempt cap.
    Unknown,
}

impl Classification {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Classification::Terminal)
    }
}

/// Maps write failures to a [`Classification`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassifier {
    retryable_client_codes: Vec<u16>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_CLIENT_CODES.to_vec())
    }
}

impl ErrorClassifier {
    /// Build a classifier treating `retryable_client_codes` (4xx) as transient.
    pub fn new(retryable_client_codes: Vec<u16>) -> Self {
        Self {
            retryable_client_codes,
        }
    }

    pub fn retryable_client_codes(&self) -> &[u16] {
        &self.retryable_client_codes
    }

    pub fn classify(&self, failure: &WriteFailure) -> Classification {
        self.classify_kind(failure.kind)
    }

    pub fn classify_kind(&self, kind: FailureKind) -> Classification {
        match kind {
            FailureKind::Network | FailureKind::Timeout => Classification::Retryable,
            FailureKind::ServerError(code) if (500..600).contains(&code) => {
                Classification::Retryable
            }
            FailureKind::ClientError(code) if (400..500).contains(&code) => {
                if self.retryable_client_codes.contains(&code) {
                    Classification::Retryable
                } else {
                    Classification::Terminal
                }
            }
            // Codes reported under the wrong class are a reporting bug upstream.
            FailureKind::ServerError(_) | FailureKind::ClientError(_) => Classification::Unknown,
            FailureKind::Unknown => Classification::Unknown,
        }
    }
}
