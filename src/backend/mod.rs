//! Smart record backends
//!
//! Two strategies sit behind one contract:
//! - [`ManagedBackend`]: we own a record context (circular cache + encode
//!   path) and hand its record bin to the pipeline to graft in.
//! - [`DelegatedBackend`]: the source object already does smart record;
//!   we configure it and drive it through its signals.
//!
//! The strategy is picked once at attach time and lives on in the session's
//! [`NativeHandle`] variant.

mod delegated;
mod engine;
mod managed;

pub use delegated::{
    DelegatedBackend, DelegatedHandle, DelegatedStart, HandlerId, RecordDoneHandler,
    SmartRecordSource, SourceError, SourceProperty,
};
pub use engine::{EngineParams, RecordContext, RecordEngine};
pub use managed::{ManagedBackend, ManagedHandle};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::cache::FrameTap;
use crate::error::Result;
use crate::native::{CallbackContext, Container, NativePtr, NativeResourceGuard};
use crate::session::SourceId;

/// Which strategy a source records with; fixed at attach time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// We own the circular cache (raw capture devices)
    #[serde(alias = "managed_circular_buffer")]
    Managed,
    /// The source object records by itself (URI sources)
    #[serde(alias = "delegated_native")]
    Delegated,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Managed => write!(f, "managed"),
            BackendKind::Delegated => write!(f, "delegated"),
        }
    }
}

/// Seconds kept before and after the trigger instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordWindow {
    pub back_seconds: u32,
    pub front_seconds: u32,
}

impl RecordWindow {
    pub fn new(back_seconds: u32, front_seconds: u32) -> Self {
        Self {
            back_seconds,
            front_seconds,
        }
    }

    /// The cache cannot give back more than it holds; clamp, never reject
    pub fn clamp_back(self, cache_seconds: u32) -> Self {
        Self {
            back_seconds: self.back_seconds.min(cache_seconds),
            front_seconds: self.front_seconds,
        }
    }

    pub fn total_seconds(&self) -> u32 {
        self.back_seconds.saturating_add(self.front_seconds)
    }

    pub fn total(&self) -> Duration {
        Duration::from_secs(self.total_seconds() as u64)
    }
}

/// Read-only settings shared by every session of a backend
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub cache_seconds: u32,
    pub file_prefix: String,
    pub directory: PathBuf,
    pub container: Container,
    pub default_duration_seconds: u32,
}

impl BackendSettings {
    /// Per-source file prefix, e.g. `cam0_`
    pub fn source_prefix(&self, source_id: SourceId) -> String {
        format!("{}{}_", self.file_prefix, source_id)
    }
}

/// Returned by a successful start
#[derive(Debug, Clone, PartialEq)]
pub struct SessionToken {
    pub source_id: SourceId,
    /// Session id reported by the native side (0 when it reports none)
    pub native_session: u32,
    /// Window actually requested, after clamping
    pub window: RecordWindow,
    pub started_at: Instant,
}

/// Output the pipeline has to graft downstream of its encoded-stream tap
#[derive(Clone)]
pub enum RecordBin {
    /// `GstElement*` owned by a native record context
    Element(NativePtr),
    /// In-process cache fed frame by frame
    Tap(FrameTap),
}

impl std::fmt::Debug for RecordBin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordBin::Element(ptr) => f.debug_tuple("Element").field(&ptr.as_raw()).finish(),
            RecordBin::Tap(_) => f.debug_tuple("Tap").finish(),
        }
    }
}

/// Uniform contract over both strategies
pub trait BackendAdapter {
    /// What the strategy attaches to
    type Target;
    type Handle;

    fn kind(&self) -> BackendKind;

    /// Bind a source. The context becomes the handle's pinned user block.
    fn attach(
        &self,
        source_id: SourceId,
        target: Self::Target,
        context: CallbackContext,
    ) -> Result<Self::Handle>;

    /// Request a cut of `window` around now
    fn start(
        &self,
        handle: &mut Self::Handle,
        window: RecordWindow,
        label: Option<&str>,
    ) -> Result<SessionToken>;

    /// Ask the active segment to end early. `Ok(false)` when nothing is active.
    fn stop(&self, handle: &mut Self::Handle) -> Result<bool>;

    /// Release native resources. Fails with `ResourceBusy` while native code
    /// still holds a pin after `timeout`.
    fn teardown(&self, handle: &mut Self::Handle, timeout: Duration) -> Result<()>;
}

/// Backend-specific resources owned by a session between attach and teardown
pub enum NativeHandle {
    Managed(ManagedHandle),
    Delegated(DelegatedHandle),
}

impl NativeHandle {
    pub fn kind(&self) -> BackendKind {
        match self {
            NativeHandle::Managed(_) => BackendKind::Managed,
            NativeHandle::Delegated(_) => BackendKind::Delegated,
        }
    }

    pub fn callback(&self) -> &NativeResourceGuard<CallbackContext> {
        match self {
            NativeHandle::Managed(handle) => handle.callback(),
            NativeHandle::Delegated(handle) => handle.callback(),
        }
    }

    pub fn active(&self) -> Option<&SessionToken> {
        match self {
            NativeHandle::Managed(handle) => handle.active(),
            NativeHandle::Delegated(handle) => handle.active(),
        }
    }

    /// Forget the active segment after its completion or fault arrived
    pub fn clear_active(&mut self) {
        match self {
            NativeHandle::Managed(handle) => handle.clear_active(),
            NativeHandle::Delegated(handle) => handle.clear_active(),
        }
        self.callback().reset();
    }

    pub fn record_bin(&self) -> Option<RecordBin> {
        match self {
            NativeHandle::Managed(handle) => handle.record_bin(),
            NativeHandle::Delegated(_) => None,
        }
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("kind", &self.kind())
            .field("active", &self.active())
            .field("pins", &self.callback().outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_window_clamped_to_cache() {
        let window = RecordWindow::new(120, 10).clamp_back(60);
        assert_eq!(window.back_seconds, 60);
        assert_eq!(window.front_seconds, 10);
        assert_eq!(window.total_seconds(), 70);
    }

    #[test]
    fn test_window_within_cache_untouched() {
        let window = RecordWindow::new(10, 10).clamp_back(60);
        assert_eq!(window, RecordWindow::new(10, 10));
        assert_eq!(window.total(), Duration::from_secs(20));
    }

    #[test]
    fn test_source_prefix() {
        let settings = BackendSettings {
            cache_seconds: 60,
            file_prefix: "cam".into(),
            directory: PathBuf::from("/tmp"),
            container: Container::Mp4,
            default_duration_seconds: 10,
        };
        assert_eq!(settings.source_prefix(2), "cam2_");
    }

    #[test]
    fn test_backend_kind_names() {
        assert_eq!(BackendKind::Managed.to_string(), "managed");
        let kind: BackendKind = serde_json::from_str("\"delegated\"").unwrap();
        assert_eq!(kind, BackendKind::Delegated);
    }
}
