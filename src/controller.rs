//! Smart record controller
//!
//! The only component callers talk to. Triggers go through the cooldown gate,
//! then to the session's backend; completions come back from native threads
//! as events and are applied here before listeners see them.
//!
//! Lock order: a session's own lock is the only lock held across backend
//! calls. Native callbacks never take it, so teardown can wait for them.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendAdapter, BackendKind, BackendSettings, DelegatedBackend, ManagedBackend, NativeHandle,
    RecordBin, RecordEngine, RecordWindow, SessionToken, SmartRecordSource,
};
use crate::error::{Result, SmartRecError};
use crate::native::{CallbackContext, Container};
use crate::notify::{CompletionNotifier, CompletionRecord, RecordEvent};
use crate::session::{RecordingSession, SessionRegistry, SessionState, SourceId};
use crate::trigger::{Detection, DetectionFilter, TriggerEvent, TriggerGate};

/// Controller-wide settings, shared read-only by both backends
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Size of the rolling pre-event buffer
    pub cache_seconds: u32,
    pub back_seconds: u32,
    pub front_seconds: u32,
    pub default_duration_seconds: u32,
    pub file_prefix: String,
    pub output_directory: PathBuf,
    pub container: Container,
    /// Zero disables the gate
    pub cooldown: Duration,
    /// How long teardown waits for native code to let go
    pub teardown_timeout: Duration,
    pub detection_filter: DetectionFilter,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cache_seconds: 60,
            back_seconds: 10,
            front_seconds: 10,
            default_duration_seconds: 10,
            file_prefix: "cam".to_string(),
            output_directory: PathBuf::from("recordings"),
            container: Container::Mp4,
            cooldown: Duration::ZERO,
            teardown_timeout: Duration::from_secs(2),
            detection_filter: DetectionFilter::default(),
        }
    }
}

impl ControllerSettings {
    pub fn window(&self) -> RecordWindow {
        RecordWindow::new(self.back_seconds, self.front_seconds)
    }

    fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            cache_seconds: self.cache_seconds,
            file_prefix: self.file_prefix.clone(),
            directory: self.output_directory.clone(),
            container: self.container,
            default_duration_seconds: self.default_duration_seconds,
        }
    }
}

/// What a source is attached through
pub enum AttachTarget {
    /// We create the record context; the caller grafts the returned bin
    Managed,
    /// The source object records by itself
    Delegated(Arc<dyn SmartRecordSource>),
}

impl AttachTarget {
    pub fn kind(&self) -> BackendKind {
        match self {
            AttachTarget::Managed => BackendKind::Managed,
            AttachTarget::Delegated(_) => BackendKind::Delegated,
        }
    }
}

/// Why a trigger did not start a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Cooldown,
    AlreadyActive,
    /// Record bin not linked yet
    NotReady,
    NotAttached,
    Faulted,
    UnknownSource,
    /// Detection did not pass the filter
    Filtered,
}

/// Result of offering a trigger to the controller. Never an error: a
/// suppressed or failed trigger just yields no recording.
#[derive(Debug)]
pub enum TriggerOutcome {
    Started(SessionToken),
    Suppressed(SuppressReason),
    Failed(SmartRecError),
}

impl TriggerOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, TriggerOutcome::Started(_))
    }
}

pub struct SmartRecordController {
    settings: ControllerSettings,
    managed: ManagedBackend,
    delegated: DelegatedBackend,
    registry: SessionRegistry,
    gate: TriggerGate,
    notifier: CompletionNotifier,
}

impl SmartRecordController {
    /// `engine` is the managed strategy's native capability, or the reason it
    /// failed to load. A load failure disables managed attaches for the life
    /// of the controller.
    pub fn new(settings: ControllerSettings, engine: Result<Arc<dyn RecordEngine>>) -> Self {
        let backend_settings = settings.backend_settings();
        let managed = match engine {
            Ok(engine) => {
                info!("Managed smart record using {} engine", engine.name());
                ManagedBackend::new(engine, backend_settings.clone())
            }
            Err(e) => {
                let reason = match e {
                    SmartRecError::BackendUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                warn!("Managed smart record unavailable: {}", reason);
                ManagedBackend::unavailable(reason, backend_settings.clone())
            }
        };

        Self {
            gate: TriggerGate::new(settings.cooldown),
            managed,
            delegated: DelegatedBackend::new(backend_settings),
            registry: SessionRegistry::new(),
            notifier: CompletionNotifier::default(),
            settings,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn backend_available(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Managed => self.managed.is_available(),
            BackendKind::Delegated => true,
        }
    }

    /// Bind a source to a backend.
    ///
    /// For managed sources the returned bin must be grafted downstream of the
    /// encoded-stream tap, then reported through [`confirm_link`](Self::confirm_link).
    pub fn attach(
        &self,
        source_id: SourceId,
        name: Option<&str>,
        target: AttachTarget,
    ) -> Result<Option<RecordBin>> {
        if let Some(existing) = self.registry.get(source_id) {
            let mut session = existing.lock();
            if !session.can_reattach() {
                return Err(SmartRecError::AlreadyAttached(source_id));
            }
            self.release_handle(&mut session)?;
        }

        let kind = target.kind();
        let context = CallbackContext::new(source_id, name, self.notifier.sender());
        let attached = match target {
            AttachTarget::Managed => self
                .managed
                .attach(source_id, (), context)
                .map(NativeHandle::Managed),
            AttachTarget::Delegated(source) => self
                .delegated
                .attach(source_id, source, context)
                .map(NativeHandle::Delegated),
        };

        let mut session = RecordingSession::new(source_id, kind);
        match attached {
            Ok(handle) => {
                let record_bin = handle.record_bin();
                session.state = match kind {
                    BackendKind::Managed => SessionState::Configuring,
                    BackendKind::Delegated => SessionState::Idle,
                };
                session.handle = Some(handle);
                self.registry.insert(session);
                info!("Attached source {} with {} backend", source_id, kind);
                Ok(record_bin)
            }
            Err(e @ SmartRecError::BackendUnavailable(_)) => {
                warn!("Source {} cannot record: {}", source_id, e);
                session.fault(e.to_string());
                self.registry.insert(session);
                Err(e)
            }
            Err(e) => {
                // No handle: the session stays Idle and triggers report NotAttached.
                warn!("Failed to attach source {}: {}", source_id, e);
                self.registry.insert(session);
                Err(e)
            }
        }
    }

    /// Report whether the managed record bin was grafted into the pipeline
    pub fn confirm_link(&self, source_id: SourceId, linked: bool) -> Result<()> {
        let session = self
            .registry
            .get(source_id)
            .ok_or(SmartRecError::UnknownSource(source_id))?;
        let mut session = session.lock();
        if session.state != SessionState::Configuring {
            return Ok(());
        }

        if linked {
            session.state = SessionState::Idle;
            info!("Record bin linked for source {}", source_id);
            Ok(())
        } else {
            session.fault("record bin could not be linked");
            warn!("Recording disabled for source {}: link failed", source_id);
            Err(SmartRecError::LinkFailed(source_id))
        }
    }

    pub fn on_trigger(&self, event: TriggerEvent) -> TriggerOutcome {
        let source_id = event.source_id;
        if !self.gate.admit(source_id, event.timestamp) {
            debug!("Trigger on source {} within cooldown, suppressed", source_id);
            return TriggerOutcome::Suppressed(SuppressReason::Cooldown);
        }

        let Some(session) = self.registry.get(source_id) else {
            debug!("Trigger for unknown source {}", source_id);
            self.gate.forget(source_id);
            return TriggerOutcome::Suppressed(SuppressReason::UnknownSource);
        };
        let mut session = session.lock();

        match session.state {
            SessionState::Active | SessionState::Stopping => {
                info!(
                    "Source {} already recording, ignoring trigger ({})",
                    source_id,
                    event.label()
                );
                return TriggerOutcome::Suppressed(SuppressReason::AlreadyActive);
            }
            SessionState::Configuring => return TriggerOutcome::Suppressed(SuppressReason::NotReady),
            SessionState::Faulted => return TriggerOutcome::Suppressed(SuppressReason::Faulted),
            SessionState::Idle => {}
        }

        let window = self.settings.window();
        let label = event.label().to_string();
        let started = match session.handle.as_mut() {
            None => return TriggerOutcome::Suppressed(SuppressReason::NotAttached),
            Some(NativeHandle::Managed(handle)) => self.managed.start(handle, window, Some(&label)),
            Some(NativeHandle::Delegated(handle)) => {
                self.delegated.start(handle, window, Some(&label))
            }
        };

        match started {
            Ok(token) => {
                session.state = SessionState::Active;
                session.last_trigger_time = Some(event.timestamp);
                info!(
                    "Recording started on source {}: {} (back {}s, front {}s)",
                    source_id, label, token.window.back_seconds, token.window.front_seconds
                );
                session.label = Some(label);
                TriggerOutcome::Started(token)
            }
            Err(e) => {
                warn!("Failed to start recording on source {}: {}", source_id, e);
                TriggerOutcome::Failed(e)
            }
        }
    }

    /// Detections that fail the filter never reach the cooldown gate
    pub fn notify_detection(
        &self,
        source_id: SourceId,
        detection: &Detection,
        timestamp: Instant,
    ) -> TriggerOutcome {
        if !self.settings.detection_filter.matches(detection) {
            return TriggerOutcome::Suppressed(SuppressReason::Filtered);
        }
        self.on_trigger(TriggerEvent::detection(source_id, detection, timestamp))
    }

    /// At most one trigger per frame, from the first matching detection
    pub fn notify_frame_detections(
        &self,
        source_id: SourceId,
        detections: &[Detection],
        timestamp: Instant,
    ) -> TriggerOutcome {
        match detections
            .iter()
            .find(|detection| self.settings.detection_filter.matches(detection))
        {
            Some(detection) => self.notify_detection(source_id, detection, timestamp),
            None => TriggerOutcome::Suppressed(SuppressReason::Filtered),
        }
    }

    pub fn notify_manual_trigger(&self, source_id: SourceId, label: Option<&str>) -> TriggerOutcome {
        self.on_trigger(TriggerEvent::manual(source_id, label, Instant::now()))
    }

    /// Ask the active segment to end early. Its completion still arrives
    /// through the normal path.
    pub fn stop(&self, source_id: SourceId) -> Result<bool> {
        let session = self
            .registry
            .get(source_id)
            .ok_or(SmartRecError::UnknownSource(source_id))?;
        let mut session = session.lock();
        self.stop_locked(&mut session)
    }

    fn stop_locked(&self, session: &mut RecordingSession) -> Result<bool> {
        if session.state != SessionState::Active {
            return Ok(false);
        }
        let stopped = match session.handle.as_mut() {
            None => false,
            Some(NativeHandle::Managed(handle)) => self.managed.stop(handle)?,
            Some(NativeHandle::Delegated(handle)) => self.delegated.stop(handle)?,
        };
        if stopped {
            session.state = SessionState::Stopping;
            info!("Stop requested for source {}", session.source_id);
        }
        Ok(stopped)
    }

    /// Apply a finished segment and forward it to listeners.
    /// Returns false for a stale completion, which is dropped.
    pub fn on_completion(&self, record: CompletionRecord) -> bool {
        let source_id = record.source_id;
        match self.registry.get(source_id) {
            Some(session) => {
                let mut session = session.lock();
                if !session.state.is_recording() {
                    debug!(
                        "Stale completion for source {} in state {}, dropping",
                        source_id, session.state
                    );
                    return false;
                }
                session.state = SessionState::Idle;
                session.label = None;
                session.completed_segments += 1;
                if let Some(handle) = session.handle.as_mut() {
                    handle.clear_active();
                }
            }
            None => debug!("Completion for detached source {}", source_id),
        }

        info!(
            "Recording complete on source {}: {:?} ({:.1}s, {})",
            source_id, record.file_path, record.duration_seconds, record.trigger_label
        );
        self.notifier.publish(RecordEvent::Completed(record));
        true
    }

    /// An engine gave up mid-segment. The session faults until re-attached.
    pub fn on_fault(&self, source_id: SourceId, reason: String) {
        if let Some(session) = self.registry.get(source_id) {
            let mut session = session.lock();
            if let Some(handle) = session.handle.as_mut() {
                handle.clear_active();
            }
            session.label = None;
            session.fault(reason.clone());
        }
        error!("Recording fault on source {}: {}", source_id, reason);
        self.notifier.publish(RecordEvent::Faulted { source_id, reason });
    }

    pub fn handle_event(&self, event: RecordEvent) {
        match event {
            RecordEvent::Completed(record) => {
                self.on_completion(record);
            }
            RecordEvent::Faulted { source_id, reason } => self.on_fault(source_id, reason),
        }
    }

    /// Drain callback events on a task. Call once; `None` if the queue was
    /// already taken.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.notifier.take_receiver()?;
        let controller: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.handle_event(event);
            }
            debug!("Record event dispatcher stopped");
        }))
    }

    /// Apply queued callback events on the calling thread
    pub fn dispatch_pending(&self) -> usize {
        let events = self.notifier.drain_pending();
        let count = events.len();
        for event in events {
            self.handle_event(event);
        }
        count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.notifier.subscribe()
    }

    /// Stop, tear down and forget one source. On `ResourceBusy` the session
    /// is kept and detach may be retried once the completion arrived.
    pub fn detach(&self, source_id: SourceId) -> Result<()> {
        let session = self
            .registry
            .get(source_id)
            .ok_or(SmartRecError::UnknownSource(source_id))?;
        {
            let mut session = session.lock();
            if let Err(e) = self.stop_locked(&mut session) {
                warn!("Stop before detach failed for source {}: {}", source_id, e);
            }
            self.release_handle(&mut session)?;
        }

        self.registry.remove(source_id);
        self.gate.forget(source_id);
        info!("Detached source {}", source_id);
        Ok(())
    }

    fn release_handle(&self, session: &mut RecordingSession) -> Result<()> {
        let timeout = self.settings.teardown_timeout;
        match session.handle.as_mut() {
            None => return Ok(()),
            Some(NativeHandle::Managed(handle)) => self.managed.teardown(handle, timeout)?,
            Some(NativeHandle::Delegated(handle)) => self.delegated.teardown(handle, timeout)?,
        }
        session.handle = None;
        Ok(())
    }

    /// Best-effort stop and teardown of every session. Never fails.
    pub fn shutdown(&self) {
        let sessions = self.registry.drain();
        let count = sessions.len();

        for session in sessions {
            let mut session = session.lock();
            let source_id = session.source_id;
            if let Err(e) = self.stop_locked(&mut session) {
                warn!("Shutdown: stop failed for source {}: {}", source_id, e);
            }

            match self.release_handle(&mut session) {
                Ok(()) => {}
                Err(SmartRecError::ResourceBusy { outstanding, .. }) => {
                    warn!(
                        "Shutdown: source {} still has {} native reference(s), leaking its handle",
                        source_id, outstanding
                    );
                    // Native code may still call back into it.
                    if let Some(handle) = session.handle.take() {
                        std::mem::forget(handle);
                    }
                }
                Err(e) => {
                    warn!("Shutdown: teardown failed for source {}: {}", source_id, e);
                    session.handle = None;
                }
            }
        }

        info!("Smart record controller shut down ({} source(s))", count);
    }

    pub fn session_state(&self, source_id: SourceId) -> Option<SessionState> {
        self.registry.state(source_id)
    }

    pub fn completed_segments(&self, source_id: SourceId) -> Option<u64> {
        self.registry
            .get(source_id)
            .map(|session| session.lock().completed_segments)
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.registry.source_ids()
    }

    pub fn set_cooldown(&self, seconds: f64) {
        self.gate.set_cooldown(seconds);
        info!("Trigger cooldown set to {:?}", self.gate.cooldown());
    }

    pub fn cooldown(&self) -> Duration {
        self.gate.cooldown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, FakeSource};

    fn settings() -> ControllerSettings {
        ControllerSettings {
            output_directory: PathBuf::from("/tmp/smartrec-test"),
            teardown_timeout: Duration::from_millis(20),
            ..ControllerSettings::default()
        }
    }

    fn controller_with(settings: ControllerSettings) -> (SmartRecordController, FakeEngine) {
        let engine = FakeEngine::new();
        let controller = SmartRecordController::new(settings, Ok(Arc::new(engine.clone())));
        (controller, engine)
    }

    fn attach_linked(controller: &SmartRecordController, source_id: SourceId) {
        let bin = controller.attach(source_id, None, AttachTarget::Managed).unwrap();
        assert!(bin.is_some());
        assert_eq!(controller.session_state(source_id), Some(SessionState::Configuring));
        controller.confirm_link(source_id, true).unwrap();
    }

    fn manual(source_id: SourceId, at: Instant) -> TriggerEvent {
        TriggerEvent::manual(source_id, Some("key_R"), at)
    }

    #[test]
    fn test_cooldown_scenario_starts_exactly_two() {
        let (controller, engine) = controller_with(ControllerSettings {
            cooldown: Duration::from_secs(60),
            ..settings()
        });
        attach_linked(&controller, 0);
        let t0 = Instant::now();

        assert!(controller.on_trigger(manual(0, t0)).is_started());
        assert!(engine.complete_next("cam0_00001.mp4"));
        controller.dispatch_pending();

        assert!(matches!(
            controller.on_trigger(manual(0, t0 + Duration::from_secs(30))),
            TriggerOutcome::Suppressed(SuppressReason::Cooldown)
        ));
        assert!(controller
            .on_trigger(manual(0, t0 + Duration::from_secs(61)))
            .is_started());
        assert_eq!(engine.starts().len(), 2);
    }

    #[test]
    fn test_back_window_clamped_and_duration_reported() {
        let (controller, engine) = controller_with(ControllerSettings {
            cache_seconds: 60,
            back_seconds: 120,
            front_seconds: 10,
            ..settings()
        });
        attach_linked(&controller, 0);
        let mut listener = controller.subscribe();

        match controller.notify_manual_trigger(0, None) {
            TriggerOutcome::Started(token) => assert_eq!(token.window, RecordWindow::new(60, 10)),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(engine.starts(), vec![(60, 70)]);

        engine.complete_next("cam0_00001.mp4");
        assert_eq!(controller.dispatch_pending(), 1);
        match listener.try_recv().unwrap() {
            RecordEvent::Completed(record) => {
                assert_eq!(record.duration_seconds, 70.0);
                assert_eq!(record.trigger_label, "manual");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_returns_to_idle_with_one_record() {
        let (controller, engine) = controller_with(settings());
        attach_linked(&controller, 4);
        let mut listener = controller.subscribe();

        assert!(controller.on_trigger(manual(4, Instant::now())).is_started());
        assert_eq!(controller.session_state(4), Some(SessionState::Active));

        assert!(engine.complete_next("cam4_00001.mp4"));
        assert!(!engine.complete_next("cam4_00002.mp4"));
        controller.dispatch_pending();

        assert_eq!(controller.session_state(4), Some(SessionState::Idle));
        assert_eq!(controller.completed_segments(4), Some(1));
        match listener.try_recv().unwrap() {
            RecordEvent::Completed(record) => {
                assert_eq!(record.source_id, 4);
                assert_eq!(record.trigger_label, "key_R");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(listener.try_recv().is_err());
    }

    #[test]
    fn test_second_trigger_while_active_is_ignored() {
        let (controller, engine) = controller_with(settings());
        attach_linked(&controller, 0);
        let now = Instant::now();

        assert!(controller.on_trigger(manual(0, now)).is_started());
        assert!(matches!(
            controller.on_trigger(manual(0, now)),
            TriggerOutcome::Suppressed(SuppressReason::AlreadyActive)
        ));
        assert!(controller.stop(0).unwrap());
        assert!(matches!(
            controller.on_trigger(manual(0, now)),
            TriggerOutcome::Suppressed(SuppressReason::AlreadyActive)
        ));
        assert_eq!(engine.starts().len(), 1);
    }

    #[test]
    fn test_detach_busy_while_completion_outstanding() {
        let (controller, engine) = controller_with(settings());
        attach_linked(&controller, 0);
        assert!(controller.on_trigger(manual(0, Instant::now())).is_started());

        assert!(matches!(
            controller.detach(0),
            Err(SmartRecError::ResourceBusy { source_id: 0, outstanding: 1 })
        ));
        assert_eq!(engine.stops().len(), 1);
        assert_eq!(engine.destroys(), 0);
        assert_eq!(controller.session_state(0), Some(SessionState::Stopping));

        engine.complete_next("cam0_00001.mp4");
        controller.dispatch_pending();
        assert_eq!(controller.session_state(0), Some(SessionState::Idle));

        controller.detach(0).unwrap();
        assert_eq!(engine.destroys(), 1);
        assert!(controller.session_state(0).is_none());
    }

    #[test]
    fn test_backend_unavailable_never_starts() {
        let controller = SmartRecordController::new(
            settings(),
            Err(SmartRecError::BackendUnavailable(
                "libnvdsgst_smartrecord.so: cannot open shared object file".into(),
            )),
        );
        assert!(!controller.backend_available(BackendKind::Managed));

        assert!(matches!(
            controller.attach(0, None, AttachTarget::Managed),
            Err(SmartRecError::BackendUnavailable(_))
        ));
        assert_eq!(controller.session_state(0), Some(SessionState::Faulted));
        assert!(matches!(
            controller.notify_manual_trigger(0, None),
            TriggerOutcome::Suppressed(SuppressReason::Faulted)
        ));

        // Other backends keep working.
        let source = Arc::new(FakeSource::new());
        controller
            .attach(1, Some("uri0"), AttachTarget::Delegated(source.clone()))
            .unwrap();
        assert!(controller.notify_manual_trigger(1, None).is_started());
    }

    #[test]
    fn test_attach_failed_leaves_session_unattached() {
        let (controller, engine) = controller_with(settings());
        engine.fail_create(-1);
        assert!(matches!(
            controller.attach(0, None, AttachTarget::Managed),
            Err(SmartRecError::AttachFailed { .. })
        ));
        assert_eq!(controller.session_state(0), Some(SessionState::Idle));
        assert!(matches!(
            controller.notify_manual_trigger(0, None),
            TriggerOutcome::Suppressed(SuppressReason::NotAttached)
        ));
    }

    #[test]
    fn test_link_lifecycle() {
        let (controller, _engine) = controller_with(settings());
        controller.attach(0, None, AttachTarget::Managed).unwrap();
        assert!(matches!(
            controller.notify_manual_trigger(0, None),
            TriggerOutcome::Suppressed(SuppressReason::NotReady)
        ));
        assert!(matches!(
            controller.attach(0, None, AttachTarget::Managed),
            Err(SmartRecError::AlreadyAttached(0))
        ));

        assert!(matches!(
            controller.confirm_link(0, false),
            Err(SmartRecError::LinkFailed(0))
        ));
        assert_eq!(controller.session_state(0), Some(SessionState::Faulted));

        // A faulted session may be attached again.
        controller.attach(0, None, AttachTarget::Managed).unwrap();
        controller.confirm_link(0, true).unwrap();
        assert_eq!(controller.session_state(0), Some(SessionState::Idle));
    }

    #[test]
    fn test_failed_start_is_not_retried() {
        let (controller, engine) = controller_with(settings());
        attach_linked(&controller, 0);
        engine.fail_start(-2);

        assert!(matches!(
            controller.notify_manual_trigger(0, None),
            TriggerOutcome::Failed(SmartRecError::NativeCall { status: -2, .. })
        ));
        assert_eq!(controller.session_state(0), Some(SessionState::Idle));
        assert!(engine.starts().is_empty());
    }

    #[test]
    fn test_stop_only_when_active() {
        let (controller, _engine) = controller_with(settings());
        attach_linked(&controller, 0);
        assert!(!controller.stop(0).unwrap());
        assert!(matches!(controller.stop(9), Err(SmartRecError::UnknownSource(9))));

        controller.notify_manual_trigger(0, None);
        assert!(controller.stop(0).unwrap());
        assert!(!controller.stop(0).unwrap());
    }

    #[test]
    fn test_detection_filter_gates_triggers() {
        let (controller, _engine) = controller_with(settings());
        attach_linked(&controller, 0);
        let now = Instant::now();

        assert!(matches!(
            controller.notify_detection(0, &Detection::new(2, Some("car"), 0.9), now),
            TriggerOutcome::Suppressed(SuppressReason::Filtered)
        ));
        assert!(matches!(
            controller.notify_frame_detections(0, &[Detection::new(0, None, 0.1)], now),
            TriggerOutcome::Suppressed(SuppressReason::Filtered)
        ));

        let frame = [
            Detection::new(2, Some("car"), 0.9),
            Detection::new(0, Some("person"), 0.8),
        ];
        assert!(controller.notify_frame_detections(0, &frame, now).is_started());
    }

    #[test]
    fn test_fault_moves_session_to_faulted() {
        let (controller, engine) = controller_with(settings());
        attach_linked(&controller, 0);
        let mut listener = controller.subscribe();

        controller.notify_manual_trigger(0, None);
        assert!(engine.fault_next("encoder stalled"));
        controller.dispatch_pending();

        assert_eq!(controller.session_state(0), Some(SessionState::Faulted));
        assert!(matches!(
            listener.try_recv().unwrap(),
            RecordEvent::Faulted { source_id: 0, .. }
        ));
    }

    #[test]
    fn test_delegated_done_error_faults_session() {
        let (controller, _engine) = controller_with(settings());
        let source = Arc::new(FakeSource::new());
        controller
            .attach(3, None, AttachTarget::Delegated(source.clone()))
            .unwrap();
        let mut listener = controller.subscribe();

        assert!(controller.notify_manual_trigger(3, None).is_started());
        assert!(source.fail("filesink: no space left on device"));
        assert_eq!(controller.dispatch_pending(), 1);

        assert_eq!(controller.session_state(3), Some(SessionState::Faulted));
        assert!(matches!(
            listener.try_recv().unwrap(),
            RecordEvent::Faulted { source_id: 3, .. }
        ));
        assert!(matches!(
            controller.notify_manual_trigger(3, None),
            TriggerOutcome::Suppressed(SuppressReason::Faulted)
        ));
    }

    #[test]
    fn test_unknown_source_triggers_are_not_remembered() {
        let (controller, _engine) = controller_with(ControllerSettings {
            cooldown: Duration::from_secs(60),
            ..settings()
        });
        for source_id in 100..110 {
            assert!(matches!(
                controller.notify_manual_trigger(source_id, None),
                TriggerOutcome::Suppressed(SuppressReason::UnknownSource)
            ));
            assert!(controller.gate.last_trigger(source_id).is_none());
        }

        // Attached later, the source is not held back by earlier strays.
        attach_linked(&controller, 100);
        assert!(controller.notify_manual_trigger(100, None).is_started());
    }

    #[test]
    fn test_completion_after_detach_is_still_published() {
        let (controller, _engine) = controller_with(settings());
        let mut listener = controller.subscribe();
        let record = CompletionRecord {
            source_id: 8,
            file_path: PathBuf::from("/tmp/cam8_00001.mp4"),
            directory: PathBuf::from("/tmp"),
            duration_seconds: 20.0,
            trigger_label: "person".into(),
        };
        assert!(controller.on_completion(record));
        assert!(listener.try_recv().is_ok());

        attach_linked(&controller, 1);
        let stale = CompletionRecord {
            source_id: 1,
            file_path: PathBuf::from("/tmp/cam1_00001.mp4"),
            directory: PathBuf::from("/tmp"),
            duration_seconds: 20.0,
            trigger_label: "person".into(),
        };
        assert!(!controller.on_completion(stale));
    }

    #[test]
    fn test_shutdown_swallows_busy_sessions() {
        let (controller, engine) = controller_with(settings());
        attach_linked(&controller, 0);
        attach_linked(&controller, 1);
        controller.notify_manual_trigger(0, None);

        controller.shutdown();
        assert!(controller.sources().is_empty());
        // The idle source was destroyed; the busy one was leaked.
        assert_eq!(engine.destroys(), 1);
    }

    #[test]
    fn test_delegated_round_trip() {
        let (controller, _engine) = controller_with(settings());
        let source = Arc::new(FakeSource::new());
        source.report_cache(30);
        let bin = controller
            .attach(2, Some("uri2"), AttachTarget::Delegated(source.clone()))
            .unwrap();
        assert!(bin.is_none());
        assert_eq!(controller.session_state(2), Some(SessionState::Idle));

        let mut listener = controller.subscribe();
        assert!(controller.notify_manual_trigger(2, Some("person")).is_started());
        assert!(source.finish("cam2_00001.mp4"));
        controller.dispatch_pending();

        assert_eq!(controller.session_state(2), Some(SessionState::Idle));
        match listener.try_recv().unwrap() {
            RecordEvent::Completed(record) => {
                assert_eq!(record.source_id, 2);
                assert_eq!(record.duration_seconds, 12.0);
            }
            other => panic!("unexpected event {:?}", other),
        }

        controller.detach(2).unwrap();
        assert!(!source.has_handler());
    }

    #[test]
    fn test_set_cooldown_at_runtime() {
        let (controller, _engine) = controller_with(settings());
        assert_eq!(controller.cooldown(), Duration::ZERO);
        controller.set_cooldown(-1.0);
        assert_eq!(controller.cooldown(), Duration::ZERO);
        controller.set_cooldown(60.0);
        assert_eq!(controller.cooldown(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_dispatcher_applies_completions() {
        let engine = FakeEngine::new();
        let controller = Arc::new(SmartRecordController::new(
            settings(),
            Ok(Arc::new(engine.clone())),
        ));
        let dispatcher = controller.spawn_dispatcher().unwrap();
        assert!(controller.spawn_dispatcher().is_none());

        attach_linked(&controller, 0);
        let mut listener = controller.subscribe();
        assert!(controller.notify_manual_trigger(0, None).is_started());
        assert!(engine.complete_next("cam0_00001.mp4"));

        let event = listener.recv().await.unwrap();
        assert_eq!(event.source_id(), 0);
        assert_eq!(controller.session_state(0), Some(SessionState::Idle));

        dispatcher.abort();
    }
}
