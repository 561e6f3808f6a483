//! Structured results returned by every boundary operation

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Error;
use crate::store::{Bias, BiasSnapshot, DecisionRecord, PositionEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationFailed,
    ServerNotReady,
    StorageUnavailable,
    StorageError,
    ConsistencyCheckFailed,
    ResetNotConfirmed,
    ShuttingDown,
    InternalError,
}

/// Machine-readable failure with a hint on what to do next
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub error: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub guidance: String,
}

impl ErrorPayload {
    pub fn new(error: ErrorCode, message: impl Into<String>, guidance: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            field: None,
            guidance: guidance.into(),
        }
    }

    pub fn not_ready() -> Self {
        Self::new(
            ErrorCode::ServerNotReady,
            "Server is still starting up",
            "Retry once the storage connection is established.",
        )
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Validation { field, message } => Self {
                error: ErrorCode::ValidationFailed,
                message: message.clone(),
                field: Some(field.clone()),
                guidance: format!("Fix '{}' and resubmit.", field),
            },
            Error::Cancelled => Self::new(
                ErrorCode::ShuttingDown,
                err.to_string(),
                "The server is shutting down; retry against a running instance.",
            ),
            e if e.is_retryable() => Self::new(
                ErrorCode::StorageUnavailable,
                e.to_string(),
                "Storage is temporarily unreachable. Retry shortly.",
            ),
            Error::Storage(_) | Error::Serialization(_) | Error::Deserialization(_) => Self::new(
                ErrorCode::StorageError,
                err.to_string(),
                "Storage rejected the operation. Check the stored data for this symbol.",
            ),
            other => Self::new(
                ErrorCode::InternalError,
                other.to_string(),
                "Unexpected failure. Check the server logs.",
            ),
        }
    }
}

/// Discriminated result of a boundary operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<T> {
    Success(T),
    /// The caller's input was refused; nothing was changed
    Rejected(ErrorPayload),
    Error(ErrorPayload),
}

impl<T> Outcome<T> {
    pub fn from_result(result: crate::Result<T>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) if e.is_validation() => Outcome::Rejected(ErrorPayload::from_error(&e)),
            Err(e) => Outcome::Error(ErrorPayload::from_error(&e)),
        }
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&ErrorPayload> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Rejected(payload) | Outcome::Error(payload) => Some(payload),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Result of `get_current_bias`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BiasResponse {
    Found {
        symbol: String,
        #[serde(flatten)]
        snapshot: BiasSnapshot,
    },
    Absent {
        symbol: String,
        message: String,
        suggestion: String,
    },
    Rejected(ErrorPayload),
    Error(ErrorPayload),
}

impl BiasResponse {
    pub fn snapshot(&self) -> Option<&BiasSnapshot> {
        match self {
            BiasResponse::Found { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClearReport {
    pub symbol: String,
    pub deleted_keys: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetReport {
    pub symbol: String,
    pub deleted_keys: usize,
    pub keys_attempted: usize,
    pub previous_bias: Option<Bias>,
    pub reason: String,
    pub reset_at: DateTime<Utc>,
    /// Decision id of the `system_reset` audit record, when it could be written
    pub audit_decision_id: Option<String>,
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionHistory {
    pub symbol: String,
    pub count: usize,
    pub decisions: Vec<DecisionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionList {
    pub symbol: String,
    pub count: usize,
    pub positions: Vec<PositionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BiasOverview {
    pub biases: Vec<OverviewEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverviewEntry {
    pub symbol: String,
    pub bias: Option<Bias>,
    pub time_held_minutes: Option<i64>,
    pub confidence: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Starting,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub server: String,
    pub version: String,
    pub backend: String,
    pub server_ready: bool,
    pub storage_healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}
