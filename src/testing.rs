//! Fakes for the native side, driving completions through the real
//! user-context path

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    DelegatedStart, EngineParams, HandlerId, RecordBin, RecordContext, RecordDoneHandler,
    RecordEngine, SmartRecordSource, SourceError, SourceProperty,
};
use crate::error::{Result, SmartRecError};
use crate::native::{deliver_completion, deliver_fault, Container, NativePtr, RecordingInfo};

#[derive(Default)]
struct EngineState {
    create_status: Option<i32>,
    start_status: Option<i32>,
    created_prefixes: Vec<String>,
    starts: Vec<(u32, u32)>,
    stops: Vec<u32>,
    destroys: usize,
    next_session: u32,
    pending: VecDeque<(u32, NativePtr, PathBuf)>,
}

/// Record engine that keeps starts pending until the test completes them
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, status: i32) {
        self.state.lock().create_status = Some(status);
    }

    pub fn fail_start(&self, status: i32) {
        self.state.lock().start_status = Some(status);
    }

    pub fn created_prefixes(&self) -> Vec<String> {
        self.state.lock().created_prefixes.clone()
    }

    /// `(back_seconds, duration_seconds)` of every start
    pub fn starts(&self) -> Vec<(u32, u32)> {
        self.state.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<u32> {
        self.state.lock().stops.clone()
    }

    pub fn destroys(&self) -> usize {
        self.state.lock().destroys
    }

    /// Report the oldest pending start as written
    pub fn complete_next(&self, filename: &str) -> bool {
        let Some((session_id, user_data, dirpath)) = self.state.lock().pending.pop_front() else {
            return false;
        };
        let info = RecordingInfo {
            session_id,
            filename: filename.to_string(),
            dirpath,
            duration: Duration::ZERO,
            container: Container::Mp4,
            width: 0,
            height: 0,
        };
        unsafe { deliver_completion(user_data.as_raw(), info) }
    }

    pub fn fault_next(&self, reason: &str) -> bool {
        let Some((_, user_data, _)) = self.state.lock().pending.pop_front() else {
            return false;
        };
        unsafe { deliver_fault(user_data.as_raw(), reason.to_string()) }
    }
}

impl RecordEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create(&self, params: &EngineParams) -> Result<Box<dyn RecordContext>> {
        let mut state = self.state.lock();
        if let Some(status) = state.create_status {
            return Err(SmartRecError::NativeCall {
                call: "NvDsSRCreate",
                status,
            });
        }
        state.created_prefixes.push(params.file_prefix.clone());
        Ok(Box::new(FakeContext {
            state: Arc::clone(&self.state),
            directory: params.directory.clone(),
        }))
    }
}

struct FakeContext {
    state: Arc<Mutex<EngineState>>,
    directory: PathBuf,
}

impl RecordContext for FakeContext {
    fn record_bin(&self) -> Option<RecordBin> {
        Some(RecordBin::Element(NativePtr::dangling()))
    }

    fn start(&mut self, back_seconds: u32, duration_seconds: u32, user_data: NativePtr) -> Result<u32> {
        let mut state = self.state.lock();
        if let Some(status) = state.start_status {
            return Err(SmartRecError::NativeCall {
                call: "NvDsSRStart",
                status,
            });
        }
        state.next_session += 1;
        let session_id = state.next_session;
        state.starts.push((back_seconds, duration_seconds));
        state
            .pending
            .push_back((session_id, user_data, self.directory.clone()));
        Ok(session_id)
    }

    fn stop(&mut self, session_id: u32) -> Result<bool> {
        self.state.lock().stops.push(session_id);
        Ok(true)
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        self.state.lock().destroys += 1;
        Ok(())
    }
}

type SharedHandler = Arc<dyn Fn(std::result::Result<RecordingInfo, String>) + Send + Sync>;

#[derive(Default)]
struct SourceState {
    properties: Vec<SourceProperty>,
    unsupported: HashSet<String>,
    reported_cache: Option<u32>,
    refuse_user_context: bool,
    reject_connect: bool,
    starts: Vec<(u32, u32, bool)>,
    stops: Vec<u32>,
    next_session: u32,
    next_handler: u64,
    handler: Option<(HandlerId, SharedHandler)>,
}

/// URI source with built-in smart record
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unsupported(&self, property: &str) {
        self.state.lock().unsupported.insert(property.to_string());
    }

    pub fn report_cache(&self, seconds: u32) {
        self.state.lock().reported_cache = Some(seconds);
    }

    pub fn refuse_user_context(&self) {
        self.state.lock().refuse_user_context = true;
    }

    pub fn reject_connect(&self) {
        self.state.lock().reject_connect = true;
    }

    pub fn properties(&self) -> Vec<SourceProperty> {
        self.state.lock().properties.clone()
    }

    /// `(back, front, carried_user_context)` of every start
    pub fn starts(&self) -> Vec<(u32, u32, bool)> {
        self.state.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<u32> {
        self.state.lock().stops.clone()
    }

    pub fn has_handler(&self) -> bool {
        self.state.lock().handler.is_some()
    }

    /// Emit `sr-done` for the last start
    pub fn finish(&self, filename: &str) -> bool {
        let (session_id, handler) = {
            let state = self.state.lock();
            let Some((_, handler)) = state.handler.as_ref() else {
                return false;
            };
            (state.next_session, Arc::clone(handler))
        };
        handler(Ok(RecordingInfo {
            session_id,
            filename: filename.to_string(),
            dirpath: PathBuf::from("/tmp/smartrec-test"),
            duration: Duration::from_secs(12),
            container: Container::Mp4,
            width: 1920,
            height: 1080,
        }));
        true
    }

    pub fn fail(&self, reason: &str) -> bool {
        let handler = match self.state.lock().handler.as_ref() {
            Some((_, handler)) => Arc::clone(handler),
            None => return false,
        };
        handler(Err(reason.to_string()));
        true
    }
}

impl SmartRecordSource for FakeSource {
    fn name(&self) -> String {
        "fake-uri-source".to_string()
    }

    fn set_property(&self, property: SourceProperty) -> std::result::Result<(), SourceError> {
        let mut state = self.state.lock();
        if state.unsupported.contains(property.name()) {
            return Err(SourceError::Unsupported(property.name()));
        }
        state.properties.push(property);
        Ok(())
    }

    fn cache_seconds(&self) -> std::result::Result<u32, SourceError> {
        self.state
            .lock()
            .reported_cache
            .ok_or(SourceError::Unsupported("smart-rec-cache"))
    }

    fn emit_start(&self, request: &DelegatedStart) -> std::result::Result<(), SourceError> {
        let mut state = self.state.lock();
        if state.refuse_user_context && !request.user_context.is_null() {
            return Err(SourceError::ArgumentType("expected NULL user data".into()));
        }
        state.next_session += 1;
        if !request.session_slot.is_null() {
            // The slot is the context's AtomicU32 session field.
            let slot = unsafe { &*(request.session_slot.as_raw() as *const AtomicU32) };
            slot.store(state.next_session, Ordering::Release);
        }
        state.starts.push((
            request.back_seconds,
            request.front_seconds,
            !request.user_context.is_null(),
        ));
        Ok(())
    }

    fn emit_stop(&self, session_id: u32) -> std::result::Result<(), SourceError> {
        self.state.lock().stops.push(session_id);
        Ok(())
    }

    fn connect_done(&self, handler: RecordDoneHandler) -> std::result::Result<HandlerId, SourceError> {
        let mut state = self.state.lock();
        if state.reject_connect {
            return Err(SourceError::Unsupported("sr-done"));
        }
        state.next_handler += 1;
        let id = HandlerId(state.next_handler);
        state.handler = Some((id, Arc::from(handler)));
        Ok(id)
    }

    fn disconnect(&self, handler: HandlerId) {
        let mut state = self.state.lock();
        if state.handler.as_ref().is_some_and(|(id, _)| *id == handler) {
            state.handler = None;
        }
    }
}
