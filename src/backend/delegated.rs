//! Delegated backend
//!
//! URI sources (nvurisrcbin) carry their own smart record. We only set its
//! properties, emit `start-sr` / `stop-sr`, and listen for `sr-done`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{BackendAdapter, BackendKind, BackendSettings, RecordWindow, SessionToken};
use crate::error::{Result, SmartRecError};
use crate::native::{CallbackContext, NativePtr, NativeResourceGuard, RecordingInfo};
use crate::session::SourceId;

/// `smart-record` value that enables event-triggered local recording
pub const SMART_RECORD_MODE_EVENTS: u32 = 2;

/// Properties the adapter sets on a delegated source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceProperty {
    SmartRecordMode(u32),
    DirPath(PathBuf),
    CacheSeconds(u32),
    FilePrefix(String),
}

impl SourceProperty {
    pub fn name(&self) -> &'static str {
        match self {
            SourceProperty::SmartRecordMode(_) => "smart-record",
            SourceProperty::DirPath(_) => "smart-rec-dir-path",
            SourceProperty::CacheSeconds(_) => "smart-rec-cache",
            SourceProperty::FilePrefix(_) => "smart-rec-file-prefix",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The source does not expose this property or signal
    #[error("{0} not supported by this source")]
    Unsupported(&'static str),

    /// The signal exists but rejected an argument's type
    #[error("argument type mismatch: {0}")]
    ArgumentType(String),

    #[error("{0}")]
    Rejected(String),
}

/// Arguments of the `start-sr` action signal
#[derive(Debug, Clone, Copy)]
pub struct DelegatedStart {
    /// Where the source writes the session id it assigned
    pub session_slot: NativePtr,
    pub back_seconds: u32,
    pub front_seconds: u32,
    /// Handed back with `sr-done`; may be null for builds that refuse it
    pub user_context: NativePtr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(pub u64);

/// `sr-done` handler: the finished recording, or why it failed
pub type RecordDoneHandler =
    Box<dyn Fn(std::result::Result<RecordingInfo, String>) + Send + Sync>;

/// A source object with built-in smart record
pub trait SmartRecordSource: Send + Sync {
    fn name(&self) -> String;

    fn set_property(&self, property: SourceProperty) -> std::result::Result<(), SourceError>;

    /// Configured cache size, if the source lets us read it
    fn cache_seconds(&self) -> std::result::Result<u32, SourceError>;

    fn emit_start(&self, request: &DelegatedStart) -> std::result::Result<(), SourceError>;

    fn emit_stop(&self, session_id: u32) -> std::result::Result<(), SourceError>;

    /// Handlers may run on any thread
    fn connect_done(&self, handler: RecordDoneHandler) -> std::result::Result<HandlerId, SourceError>;

    fn disconnect(&self, handler: HandlerId);
}

pub struct DelegatedBackend {
    settings: BackendSettings,
}

impl DelegatedBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    fn apply(
        &self,
        source: &dyn SmartRecordSource,
        property: SourceProperty,
        required: bool,
    ) -> Result<()> {
        let name = property.name();
        match source.set_property(property) {
            Ok(()) => Ok(()),
            Err(SourceError::Unsupported(_)) if !required => {
                debug!("Source {} has no {} property, skipping", source.name(), name);
                Ok(())
            }
            Err(e) if !required => {
                warn!("Source {} rejected {}: {}", source.name(), name, e);
                Ok(())
            }
            Err(e) => Err(SmartRecError::Source {
                operation: name,
                reason: e.to_string(),
            }),
        }
    }

    /// The source's own cache size wins when it reports one
    fn effective_cache(&self, source: &dyn SmartRecordSource) -> u32 {
        match source.cache_seconds() {
            Ok(seconds) if seconds > 0 => seconds,
            Ok(_) => self.settings.cache_seconds,
            Err(e) => {
                debug!("Source {} cache size unreadable ({}), using configured", source.name(), e);
                self.settings.cache_seconds
            }
        }
    }
}

pub struct DelegatedHandle {
    source_id: SourceId,
    source: Arc<dyn SmartRecordSource>,
    callback: NativeResourceGuard<CallbackContext>,
    handler: Option<HandlerId>,
    active: Option<SessionToken>,
    stop_requested: bool,
}

impl DelegatedHandle {
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

    pub fn source(&self) -> &Arc<dyn SmartRecordSource> {
        &self.source
    }
}

impl BackendAdapter for DelegatedBackend {
    type Target = Arc<dyn SmartRecordSource>;
    type Handle = DelegatedHandle;

    fn kind(&self) -> BackendKind {
        BackendKind::Delegated
    }

    fn attach(
        &self,
        source_id: SourceId,
        source: Arc<dyn SmartRecordSource>,
        context: CallbackContext,
    ) -> Result<DelegatedHandle> {
        let callback = NativeResourceGuard::new(context);

        self.apply(source.as_ref(), SourceProperty::SmartRecordMode(SMART_RECORD_MODE_EVENTS), true)?;
        self.apply(source.as_ref(), SourceProperty::DirPath(self.settings.directory.clone()), true)?;
        self.apply(source.as_ref(), SourceProperty::CacheSeconds(self.settings.cache_seconds), false)?;
        self.apply(
            source.as_ref(),
            SourceProperty::FilePrefix(self.settings.source_prefix(source_id)),
            false,
        )?;

        // Without sr-done nothing would ever release the in-flight pin.
        let done_context = callback.clone();
        let handler = source
            .connect_done(Box::new(move |done| {
                let settled = match done {
                    Ok(info) => done_context.settle_completion(info),
                    Err(reason) => done_context.settle_fault(reason),
                };
                if let Some(settled) = settled {
                    settled.dispatch();
                }
            }))
            .map_err(|e| SmartRecError::Source {
                operation: "sr-done",
                reason: e.to_string(),
            })?;

        info!(
            "Enabled smart record on {} for source {} (dir {:?})",
            source.name(),
            source_id,
            self.settings.directory
        );

        Ok(DelegatedHandle {
            source_id,
            source,
            callback,
            handler: Some(handler),
            active: None,
            stop_requested: false,
        })
    }

    fn start(
        &self,
        handle: &mut DelegatedHandle,
        window: RecordWindow,
        label: Option<&str>,
    ) -> Result<SessionToken> {
        let window = window.clamp_back(self.effective_cache(handle.source.as_ref()));
        handle.callback.prepare(label, window);
        handle.callback.set_native_session(0);
        handle.callback.arm(handle.callback.pin());

        let mut request = DelegatedStart {
            session_slot: handle.callback.session_slot(),
            back_seconds: window.back_seconds,
            front_seconds: window.front_seconds,
            user_context: NativePtr::from_ref(&*handle.callback),
        };

        let result = match handle.source.emit_start(&request) {
            Err(SourceError::ArgumentType(reason)) => {
                // Some builds only accept a null user context.
                debug!(
                    "start-sr refused user context on {} ({}), retrying without it",
                    handle.source.name(),
                    reason
                );
                request.user_context = NativePtr::null();
                handle.source.emit_start(&request)
            }
            other => other,
        };

        match result {
            Ok(()) => {
                let token = SessionToken {
                    source_id: handle.source_id,
                    native_session: handle.callback.native_session(),
                    window,
                    started_at: Instant::now(),
                };
                handle.active = Some(token.clone());
                handle.stop_requested = false;
                Ok(token)
            }
            Err(e) => {
                drop(handle.callback.disarm());
                handle.callback.reset();
                Err(SmartRecError::Source {
                    operation: "start-sr",
                    reason: e.to_string(),
                })
            }
        }
    }

    fn stop(&self, handle: &mut DelegatedHandle) -> Result<bool> {
        if handle.stop_requested {
            return Ok(false);
        }
        let Some(active) = handle.active.as_ref() else {
            return Ok(false);
        };

        handle
            .source
            .emit_stop(active.native_session)
            .map_err(|e| SmartRecError::Source {
                operation: "stop-sr",
                reason: e.to_string(),
            })?;
        handle.stop_requested = true;
        Ok(true)
    }

    fn teardown(&self, handle: &mut DelegatedHandle, timeout: Duration) -> Result<()> {
        if let Err(pinned) = handle.callback.wait_idle(timeout) {
            return Err(SmartRecError::ResourceBusy {
                source_id: handle.source_id,
                outstanding: pinned.outstanding,
            });
        }

        handle.active = None;
        if let Some(handler) = handle.handler.take() {
            handle.source.disconnect(handler);
            info!("Disconnected smart record on {}", handle.source.name());
        }
        Ok(())
    }
}
