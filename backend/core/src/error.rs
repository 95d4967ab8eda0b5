use thiserror::Error;
use uuid::Uuid;

use crate::instance::FailureKind;
use crate::types::OcrState;

/// Top-level error type for the DeepEyes pipeline.
#[derive(Debug, Error)]
pub enum DeepEyesError {
    /// Rate limiting, 5xx, connection resets. Retried with backoff.
    #[error("transient provider error ({provider}): {message}")]
    TransientProvider { provider: String, message: String },

    #[error("provider rejected request ({provider}): {message}")]
    PermanentProvider { provider: String, message: String },

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("OCR job {job_id} failed: {reason}")]
    OcrJobFailed { job_id: String, reason: String },

    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error(
        "replay determinism violation in {instance_id} at step #{seq}: recorded '{recorded}', requested '{requested}'"
    )]
    ReplayDeterminismViolation {
        instance_id: Uuid,
        seq: u32,
        recorded: String,
        requested: String,
    },

    #[error("invalid OCR transition {from} -> {to}")]
    InvalidOcrTransition { from: OcrState, to: OcrState },

    #[error("lease on {0} lost to another executor")]
    LeaseLost(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeepEyesError {
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermanentProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Errors worth repeating the same step for.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientProvider { .. } | Self::StoreWrite(_))
    }

    /// Errors that leave the instance non-terminal so a later execution resumes it.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::StoreWrite(_) | Self::LeaseLost(_))
    }

    /// Terminal failure classification recorded on the instance.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::PermanentProvider { .. } => FailureKind::ProviderRejected,
            Self::TransientProvider { .. } | Self::RetriesExhausted { .. } => {
                FailureKind::RetriesExhausted
            }
            Self::OcrJobFailed { .. } => FailureKind::OcrJobFailed,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            Self::ReplayDeterminismViolation { .. } => FailureKind::ReplayViolation,
            Self::InvalidOcrTransition { .. } => FailureKind::InvalidTransition,
            Self::StoreWrite(_)
            | Self::LeaseLost(_)
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Other(_) => FailureKind::Internal,
        }
    }
}
