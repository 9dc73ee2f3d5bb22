//! Error types for the smart record controller
//!
//! Failures are scoped to a single source. Nothing in here should ever be
//! allowed to take the live stream down with it.

use thiserror::Error;

use crate::session::SourceId;

/// Errors surfaced by the controller and backend adapters
#[derive(Error, Debug)]
pub enum SmartRecError {
    /// The native smart-record capability failed to load at startup.
    /// Permanent for the lifetime of the process.
    #[error("smart record backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Native context creation returned a nonzero status
    #[error("attach failed for source {source_id}: {reason}")]
    AttachFailed { source_id: SourceId, reason: String },

    /// Teardown attempted while native code still references pinned memory
    #[error("source {source_id} busy: {outstanding} pinned reference(s) outstanding")]
    ResourceBusy { source_id: SourceId, outstanding: usize },

    /// The record bin could not be grafted into the live topology
    #[error("link failed for source {0}")]
    LinkFailed(SourceId),

    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    #[error("source {0} is already attached")]
    AlreadyAttached(SourceId),

    #[error("source {0} is faulted")]
    Faulted(SourceId),

    /// A native start/stop/destroy call returned a nonzero status
    #[error("{call} failed with status {status}")]
    NativeCall { call: &'static str, status: i32 },

    /// A delegated source rejected a required property or signal
    #[error("{operation} rejected by source: {reason}")]
    Source { operation: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SmartRecError {
    /// Whether the error disables the source until it is re-attached
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmartRecError::BackendUnavailable(_)
                | SmartRecError::AttachFailed { .. }
                | SmartRecError::LinkFailed(_)
                | SmartRecError::Faulted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SmartRecError>;
