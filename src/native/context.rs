//! Per-source user context block handed to native code as `userData`

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::ffi::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

use super::{NativePtr, PinToken, RecordingInfo};
use crate::backend::RecordWindow;
use crate::notify::{CompletionRecord, EventSender, RecordEvent};
use crate::session::SourceId;

/// Size of the `name` field in the native SRUserContext layout
pub const USER_CONTEXT_NAME_LEN: usize = 32;

#[derive(Debug, Clone)]
struct Cut {
    label: String,
    window: Option<RecordWindow>,
}

/// User context for one attached source.
///
/// The leading fields mirror `SRUserContext { int sessionid; char name[32]; }`
/// so the block can be handed to native code as-is. Everything after them is
/// Rust-owned and only reached through the completion path.
///
/// Lives inside a [`NativeResourceGuard`](super::NativeResourceGuard); a start
/// call parks a pin in `in_flight` and the matching completion takes it back.
/// `name` carries the current cut's label and is only written under `cut`.
#[repr(C)]
pub struct CallbackContext {
    session_id: c_int,
    name: UnsafeCell<[c_char; USER_CONTEXT_NAME_LEN]>,
    native_session: AtomicU32,
    source_id: SourceId,
    default_label: String,
    cut: Mutex<Cut>,
    in_flight: Mutex<Option<PinToken<CallbackContext>>>,
    events: EventSender,
}

impl CallbackContext {
    pub fn new(source_id: SourceId, friendly_name: Option<&str>, events: EventSender) -> Self {
        let default_label = match friendly_name {
            Some(name) if !name.is_empty() => truncate_label(name).to_string(),
            _ => format!("sid{}", source_id),
        };

        Self {
            session_id: (chrono::Utc::now().timestamp() & 0x7FFF_FFFF) as c_int,
            name: UnsafeCell::new(encode_name(&default_label)),
            native_session: AtomicU32::new(0),
            source_id,
            cut: Mutex::new(Cut {
                label: default_label.clone(),
                window: None,
            }),
            default_label,
            in_flight: Mutex::new(None),
            events,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn friendly_name(&self) -> &str {
        &self.default_label
    }

    /// The `sessionid` field of the native block
    pub fn user_session_id(&self) -> i32 {
        self.session_id
    }

    /// Copy of the `name` field as native code sees it
    pub fn name_field(&self) -> [c_char; USER_CONTEXT_NAME_LEN] {
        let _cut = self.cut.lock();
        // SAFETY: writers hold `cut`, which we hold too.
        unsafe { *self.name.get() }
    }

    pub fn label(&self) -> String {
        self.cut.lock().label.clone()
    }

    pub fn window(&self) -> Option<RecordWindow> {
        self.cut.lock().window
    }

    /// Set the label and window for the next cut.
    ///
    /// Must not be called while a recording is armed; the controller
    /// serializes starts per source.
    pub fn prepare(&self, label: Option<&str>, window: RecordWindow) {
        let mut cut = self.cut.lock();
        cut.label = match label {
            Some(label) if !label.is_empty() => truncate_label(label).to_string(),
            _ => self.default_label.clone(),
        };
        cut.window = Some(window);
        self.write_name(&cut.label);
    }

    /// Back to the attach-time label with no pending window
    pub fn reset(&self) {
        let mut cut = self.cut.lock();
        cut.label = self.default_label.clone();
        cut.window = None;
        self.write_name(&cut.label);
    }

    /// Caller holds `cut`
    fn write_name(&self, label: &str) {
        // SAFETY: only called with `cut` locked, and no start is armed while
        // a cut is being prepared, so native code is not reading the field.
        unsafe { *self.name.get() = encode_name(label) };
    }

    /// Address of the session-id slot native start calls write into
    pub fn session_slot(&self) -> NativePtr {
        NativePtr::from_ref(&self.native_session)
    }

    pub fn native_session(&self) -> u32 {
        self.native_session.load(Ordering::Acquire)
    }

    pub fn set_native_session(&self, session_id: u32) {
        self.native_session.store(session_id, Ordering::Release);
    }

    pub fn arm(&self, token: PinToken<CallbackContext>) {
        let previous = self.in_flight.lock().replace(token);
        if previous.is_some() {
            warn!(
                "Source {} re-armed with a recording still in flight",
                self.source_id
            );
        }
    }

    pub fn disarm(&self) -> Option<PinToken<CallbackContext>> {
        self.in_flight.lock().take()
    }

    /// Turn a finished segment into an event, taking back the in-flight pin.
    /// Returns `None` when nothing was armed.
    pub fn settle_completion(&self, info: RecordingInfo) -> Option<Settled> {
        let Some(pin) = self.disarm() else {
            debug!(
                "Completion for source {} with nothing in flight, dropping",
                self.source_id
            );
            return None;
        };

        let cut = self.cut.lock().clone();
        let record = CompletionRecord::from_recording(self.source_id, &info, cut.label, cut.window);
        Some(Settled {
            pin,
            event: RecordEvent::Completed(record),
            events: self.events.clone(),
        })
    }

    pub fn settle_fault(&self, reason: String) -> Option<Settled> {
        let pin = self.disarm()?;
        Some(Settled {
            pin,
            event: RecordEvent::Faulted {
                source_id: self.source_id,
                reason,
            },
            events: self.events.clone(),
        })
    }
}

// SAFETY: the only non-Sync field is `name`, which is written under the
// `cut` mutex and otherwise only read.
unsafe impl Sync for CallbackContext {}

/// An event ready to leave the native callback, still holding its pin
pub struct Settled {
    pin: PinToken<CallbackContext>,
    event: RecordEvent,
    events: EventSender,
}

impl Settled {
    /// Queue the event, then release the pin. The context may be freed as
    /// soon as this returns.
    pub fn dispatch(self) -> bool {
        let Settled { pin, event, events } = self;
        let queued = events.send(event).is_ok();
        if !queued {
            debug!("Event receiver closed, dropping record event");
        }
        drop(pin);
        queued
    }
}

/// Deliver a finished segment reported by native code.
///
/// # Safety
///
/// `user_data` must be null or the address of a [`CallbackContext`] owned by
/// a `NativeResourceGuard` that is armed for the recording being reported.
/// Native code reports each armed start at most once.
pub unsafe fn deliver_completion(user_data: *mut c_void, info: RecordingInfo) -> bool {
    if user_data.is_null() {
        warn!(
            "Recording {} finished without a user context, dropping",
            info.session_id
        );
        return false;
    }

    let settled = {
        let context = &*(user_data as *const CallbackContext);
        context.settle_completion(info)
    };
    settled.map(Settled::dispatch).unwrap_or(false)
}

/// Deliver a mid-segment failure reported by an engine.
///
/// # Safety
///
/// Same contract as [`deliver_completion`].
pub unsafe fn deliver_fault(user_data: *mut c_void, reason: String) -> bool {
    if user_data.is_null() {
        warn!("Recording fault without a user context: {}", reason);
        return false;
    }

    let settled = {
        let context = &*(user_data as *const CallbackContext);
        context.settle_fault(reason)
    };
    settled.map(Settled::dispatch).unwrap_or(false)
}

/// NUL-terminated copy of an already truncated label
fn encode_name(label: &str) -> [c_char; USER_CONTEXT_NAME_LEN] {
    let mut name = [0 as c_char; USER_CONTEXT_NAME_LEN];
    for (dst, src) in name
        .iter_mut()
        .take(USER_CONTEXT_NAME_LEN - 1)
        .zip(truncate_label(label).as_bytes())
    {
        *dst = *src as c_char;
    }
    name
}

/// Clip to what fits in the native name field, on a char boundary
fn truncate_label(label: &str) -> &str {
    let max = USER_CONTEXT_NAME_LEN - 1;
    if label.len() <= max {
        return label;
    }
    let mut end = max;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeResourceGuard;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn info(session_id: u32) -> RecordingInfo {
        RecordingInfo {
            session_id,
            filename: "cam0_00001.mp4".into(),
            dirpath: PathBuf::from("/tmp/rec"),
            duration: Duration::ZERO,
            container: crate::native::Container::Mp4,
            width: 0,
            height: 0,
        }
    }

    #[test]
    fn test_default_name_fills_native_field() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let context = CallbackContext::new(3, None, tx);
        assert_eq!(context.friendly_name(), "sid3");
        assert_eq!(context.name_field()[0], b's' as c_char);
        assert_eq!(context.name_field()[4], 0);
        assert!(context.user_session_id() >= 0);
    }

    #[test]
    fn test_labels_are_truncated_to_native_width() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let context = CallbackContext::new(0, Some("cam0"), tx);
        let long = "é".repeat(40);
        context.prepare(Some(&long), RecordWindow::new(1, 1));
        let label = context.label();
        assert!(label.len() <= USER_CONTEXT_NAME_LEN - 1);
        assert!(label.chars().all(|c| c == 'é'));

        context.reset();
        assert_eq!(context.label(), "cam0");
        assert!(context.window().is_none());
    }

    fn name_of(context: &CallbackContext) -> String {
        let field = context.name_field();
        let bytes: Vec<u8> = field.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_native_name_follows_cut_label() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let context = CallbackContext::new(0, None, tx);
        assert_eq!(name_of(&context), "sid0");

        context.prepare(Some("person"), RecordWindow::new(10, 10));
        assert_eq!(name_of(&context), "person");

        let long = "x".repeat(50);
        context.prepare(Some(&long), RecordWindow::new(1, 1));
        assert_eq!(name_of(&context), "x".repeat(USER_CONTEXT_NAME_LEN - 1));
        assert_eq!(context.name_field()[USER_CONTEXT_NAME_LEN - 1], 0);

        context.prepare(None, RecordWindow::new(1, 1));
        assert_eq!(name_of(&context), "sid0");

        context.prepare(Some("car"), RecordWindow::new(1, 1));
        context.reset();
        assert_eq!(name_of(&context), "sid0");
    }

    #[test]
    fn test_completion_releases_pin_and_carries_label() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = NativeResourceGuard::new(CallbackContext::new(1, Some("cam1"), tx));
        guard.prepare(Some("person"), RecordWindow::new(10, 5));
        guard.arm(guard.pin());
        assert_eq!(guard.outstanding(), 1);

        let delivered = unsafe { deliver_completion(guard.as_ptr() as *mut c_void, info(9)) };
        assert!(delivered);
        assert_eq!(guard.outstanding(), 0);

        match rx.try_recv().unwrap() {
            RecordEvent::Completed(record) => {
                assert_eq!(record.source_id, 1);
                assert_eq!(record.trigger_label, "person");
                assert_eq!(record.duration_seconds, 15.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_second_completion_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = NativeResourceGuard::new(CallbackContext::new(1, None, tx));
        guard.arm(guard.pin());
        let ptr = guard.as_ptr() as *mut c_void;
        assert!(unsafe { deliver_completion(ptr, info(1)) });
        assert!(!unsafe { deliver_completion(ptr, info(1)) });
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fault_and_null_user_data() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = NativeResourceGuard::new(CallbackContext::new(4, None, tx));
        assert!(!unsafe { deliver_fault(std::ptr::null_mut(), "boom".into()) });

        guard.arm(guard.pin());
        assert!(unsafe { deliver_fault(guard.as_ptr() as *mut c_void, "disk full".into()) });
        assert!(matches!(
            rx.try_recv().unwrap(),
            RecordEvent::Faulted { source_id: 4, .. }
        ));
        assert_eq!(guard.outstanding(), 0);
    }
}
