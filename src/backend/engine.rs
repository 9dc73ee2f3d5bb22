//! Record engine contract used by the managed backend
//!
//! An engine owns the circular cache and encode path for one source. The
//! DeepStream library and the in-process software cache both implement it.

use std::path::PathBuf;

use super::RecordBin;
use crate::error::Result;
use crate::native::{Container, NativePtr};

/// Creation parameters, mirroring `NvDsSRInitParams`
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub container: Container,
    /// 0 keeps the stream's own size
    pub width: u32,
    pub height: u32,
    pub file_prefix: String,
    pub directory: PathBuf,
    /// Used when a start does not carry a duration
    pub default_duration_seconds: u32,
    pub cache_seconds: u32,
}

/// Factory for per-source record contexts
pub trait RecordEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate the cache and encode path for one source
    fn create(&self, params: &EngineParams) -> Result<Box<dyn RecordContext>>;
}

/// One source's record context.
///
/// Completion is reported by handing `user_data` back through
/// [`deliver_completion`](crate::native::deliver_completion) exactly once per
/// successful start.
pub trait RecordContext: Send {
    /// Element the pipeline must graft, if the engine has one
    fn record_bin(&self) -> Option<RecordBin>;

    /// Start a cut `back_seconds` in the past lasting `duration_seconds` in
    /// total. Returns the engine's session id.
    fn start(&mut self, back_seconds: u32, duration_seconds: u32, user_data: NativePtr) -> Result<u32>;

    /// Ask a cut to end early. `Ok(false)` when it had already ended.
    fn stop(&mut self, session_id: u32) -> Result<bool>;

    fn destroy(self: Box<Self>) -> Result<()>;
}
