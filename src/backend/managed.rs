//! Managed circular-buffer backend
//!
//! Used for sources with no smart record of their own (USB/v4l2 capture).
//! Each attach creates a record context from the configured engine; the
//! pipeline grafts the returned record bin downstream of its encoder tap.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{
    BackendAdapter, BackendKind, BackendSettings, EngineParams, RecordBin, RecordContext,
    RecordEngine, RecordWindow, SessionToken,
};
use crate::error::{Result, SmartRecError};
use crate::native::{CallbackContext, NativePtr, NativeResourceGuard};
use crate::session::SourceId;

pub struct ManagedBackend {
    /// `Err` holds the load failure, reported once and cached
    engine: std::result::Result<Arc<dyn RecordEngine>, String>,
    settings: BackendSettings,
}

impl ManagedBackend {
    pub fn new(engine: Arc<dyn RecordEngine>, settings: BackendSettings) -> Self {
        Self {
            engine: Ok(engine),
            settings,
        }
    }

    /// Backend whose native capability failed to load
    pub fn unavailable(reason: impl Into<String>, settings: BackendSettings) -> Self {
        Self {
            engine: Err(reason.into()),
            settings,
        }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_ok()
    }
}

pub struct ManagedHandle {
    source_id: SourceId,
    context: Option<Box<dyn RecordContext>>,
    record_bin: Option<RecordBin>,
    callback: NativeResourceGuard<CallbackContext>,
    active: Option<SessionToken>,
    stop_requested: bool,
}

impl ManagedHandle {
    pub fn callback(&self) -> &NativeResourceGuard<CallbackContext> {
        &self.callback
    }

    pub fn active(&self) -> Option<&SessionToken> {
        self.active.as_ref()
    }

    pub fn clear_active(&mut self) {
        self.active = None;
        self.stop_requested = false;
    }

    pub fn record_bin(&self) -> Option<RecordBin> {
        self.record_bin.clone()
    }
}

impl BackendAdapter for ManagedBackend {
    type Target = ();
    type Handle = ManagedHandle;

    fn kind(&self) -> BackendKind {
        BackendKind::Managed
    }

    fn attach(&self, source_id: SourceId, _target: (), context: CallbackContext) -> Result<ManagedHandle> {
        let engine = self
            .engine
            .as_ref()
            .map_err(|reason| SmartRecError::BackendUnavailable(reason.clone()))?;

        let params = EngineParams {
            container: self.settings.container,
            width: 0,
            height: 0,
            file_prefix: self.settings.source_prefix(source_id),
            directory: self.settings.directory.clone(),
            default_duration_seconds: self.settings.default_duration_seconds,
            cache_seconds: self.settings.cache_seconds,
        };

        let record = engine
            .create(&params)
            .map_err(|e| SmartRecError::AttachFailed {
                source_id,
                reason: e.to_string(),
            })?;

        let Some(record_bin) = record.record_bin() else {
            if let Err(e) = record.destroy() {
                warn!("Failed to destroy bin-less record context for source {}: {}", source_id, e);
            }
            return Err(SmartRecError::AttachFailed {
                source_id,
                reason: format!("{} engine returned no record bin", engine.name()),
            });
        };

        info!(
            "Created {} record context for source {} (cache {}s, prefix {})",
            engine.name(),
            source_id,
            params.cache_seconds,
            params.file_prefix
        );

        Ok(ManagedHandle {
            source_id,
            context: Some(record),
            record_bin: Some(record_bin),
            callback: NativeResourceGuard::new(context),
            active: None,
            stop_requested: false,
        })
    }

    fn start(
        &self,
        handle: &mut ManagedHandle,
        window: RecordWindow,
        label: Option<&str>,
    ) -> Result<SessionToken> {
        let Some(record) = handle.context.as_mut() else {
            return Err(SmartRecError::Faulted(handle.source_id));
        };

        let window = window.clamp_back(self.settings.cache_seconds);
        handle.callback.prepare(label, window);
        // Armed before the call: the completion may race the return.
        handle.callback.arm(handle.callback.pin());

        let user_data = NativePtr::from_ref(&*handle.callback);
        match record.start(window.back_seconds, window.total_seconds(), user_data) {
            Ok(native_session) => {
                handle.callback.set_native_session(native_session);
                let token = SessionToken {
                    source_id: handle.source_id,
                    native_session,
                    window,
                    started_at: Instant::now(),
                };
                debug!(
                    "Source {} recording session {} (back {}s, total {}s)",
                    handle.source_id,
                    native_session,
                    window.back_seconds,
                    window.total_seconds()
                );
                handle.active = Some(token.clone());
                handle.stop_requested = false;
                Ok(token)
            }
            Err(e) => {
                drop(handle.callback.disarm());
                handle.callback.reset();
                Err(e)
            }
        }
    }

    fn stop(&self, handle: &mut ManagedHandle) -> Result<bool> {
        if handle.stop_requested {
            return Ok(false);
        }
        let (Some(active), Some(record)) = (handle.active.as_ref(), handle.context.as_mut()) else {
            return Ok(false);
        };

        let stopped = record.stop(active.native_session)?;
        if stopped {
            handle.stop_requested = true;
        } else {
            debug!(
                "Source {} session {} already ended",
                handle.source_id, active.native_session
            );
        }
        Ok(stopped)
    }

    fn teardown(&self, handle: &mut ManagedHandle, timeout: Duration) -> Result<()> {
        if let Err(pinned) = handle.callback.wait_idle(timeout) {
            return Err(SmartRecError::ResourceBusy {
                source_id: handle.source_id,
                outstanding: pinned.outstanding,
            });
        }

        handle.record_bin = None;
        handle.active = None;
        if let Some(record) = handle.context.take() {
            record.destroy()?;
            info!("Destroyed record context for source {}", handle.source_id);
        }
        Ok(())
    }
}
