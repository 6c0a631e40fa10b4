//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole telemetry core.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that occur between the hardware links and the
//! acquisition program.
//!
//! ## Error Hierarchy
//!
//! - **Link failures** (`LinkTimeout`, `LinkDisconnected`, `ProtocolError`): raised by
//!   link adapters and instrument drivers. The polling engine absorbs them and only
//!   surfaces them as staleness on the affected attributes.
//! - **Store failures** (`AttributeNotFound`, `StaleAttribute`).
//! - **Scan failures** (`ScanAlreadyRunning`, `ScanNotRunning`, `ScanAborted`,
//!   `SnapshotCaptureFailed`): returned synchronously to whoever drives the scan.
//! - **Exchange failures** (`ExchangeClientTimeout`): scoped to a single connection.
//! - **Motion failures** (`MotionTimeout`, `MotionRejected`): scoped to one command.
//! - **Ambient failures** (`Config`, `Configuration`, `Io`, `Notification`,
//!   `TaskFailed`, `ShutdownFailed`).
//!
//! Link adapters use the narrower [`LinkError`], which converts into `DaqError`
//! with `?`.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced by a link adapter transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No reply within the caller-supplied timeout.
    #[error("link timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The connection is closed or was never opened.
    #[error("link disconnected: {0}")]
    Disconnected(String),

    /// The instrument answered with something that cannot be decoded.
    #[error("malformed reply: {0}")]
    Protocol(String),
}

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link timeout: {0}")]
    LinkTimeout(String),

    #[error("Link disconnected: {0}")]
    LinkDisconnected(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Attribute '{0}' is stale")]
    StaleAttribute(String),

    #[error("A scan is already running (scan {0})")]
    ScanAlreadyRunning(String),

    #[error("No scan is running")]
    ScanNotRunning,

    #[error("Scan {0} was aborted")]
    ScanAborted(String),

    #[error("Snapshot capture failed after {attempts} attempt(s): {reason}")]
    SnapshotCaptureFailed { attempts: u32, reason: String },

    #[error("Exchange client timed out: {0}")]
    ExchangeClientTimeout(String),

    #[error("Motion timeout on axis '{axis}' (target {target})")]
    MotionTimeout { axis: String, target: f64 },

    #[error("Motion command rejected: {0}")]
    MotionRejected(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Task '{task}' failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<LinkError> for DaqError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout(after) => DaqError::LinkTimeout(format!("{after:?}")),
            LinkError::Disconnected(msg) => DaqError::LinkDisconnected(msg),
            LinkError::Protocol(msg) => DaqError::ProtocolError(msg),
        }
    }
}

impl DaqError {
    /// Short kind tag used on the exchange wire (`ERR <kind> <message>`).
    pub fn kind(&self) -> &'static str {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) => "Configuration",
            DaqError::Io(_) => "Io",
            DaqError::LinkTimeout(_) => "LinkTimeout",
            DaqError::LinkDisconnected(_) => "LinkDisconnected",
            DaqError::ProtocolError(_) => "ProtocolError",
            DaqError::AttributeNotFound(_) => "AttributeNotFound",
            DaqError::StaleAttribute(_) => "StaleAttribute",
            DaqError::ScanAlreadyRunning(_) => "ScanAlreadyRunning",
            DaqError::ScanNotRunning => "ScanNotRunning",
            DaqError::ScanAborted(_) => "ScanAborted",
            DaqError::SnapshotCaptureFailed { .. } => "SnapshotCaptureFailed",
            DaqError::ExchangeClientTimeout(_) => "ExchangeClientTimeout",
            DaqError::MotionTimeout { .. } => "MotionTimeout",
            DaqError::MotionRejected(_) => "MotionRejected",
            DaqError::Notification(_) => "Notification",
            DaqError::TaskFailed { .. } => "TaskFailed",
            DaqError::ShutdownFailed(_) => "ShutdownFailed",
        }
    }

    /// Whether the polling engine should treat this as a communication failure
    /// (retry with backoff) rather than a programming or configuration error.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            DaqError::LinkTimeout(_)
                | DaqError::LinkDisconnected(_)
                | DaqError::ProtocolError(_)
                | DaqError::Io(_)
        )
    }
}
