//! Native boundary
//!
//! Everything that hands memory to native smart-record code lives here:
//! the pin/release guard, the per-source user context block whose address
//! is passed as `userData`, and the DeepStream NvDsSR bindings.
//!
//! The rule for this module: nothing whose address was given to native code
//! is freed while that code may still call back with it.

mod context;
mod guard;
pub mod nvds;

pub use context::{deliver_completion, deliver_fault, CallbackContext, Settled, USER_CONTEXT_NAME_LEN};
pub use guard::{NativeResourceGuard, PinToken, StillPinned};

use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::time::Duration;

/// Raw pointer that may cross threads.
///
/// Native callbacks arrive on foreign threads carrying the pointers we gave
/// them; the pointee's lifetime is enforced by [`NativeResourceGuard`], not
/// by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativePtr(*mut c_void);

// SAFETY: NativePtr is an address only; dereferencing is always unsafe and
// guarded by the pin discipline of the owning guard.
unsafe impl Send for NativePtr {}
unsafe impl Sync for NativePtr {}

impl NativePtr {
    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub fn from_ref<T>(value: &T) -> Self {
        Self(value as *const T as *mut c_void)
    }

    /// Non-null placeholder for engines that have no real element pointer
    pub fn dangling() -> Self {
        Self(NonNull::<c_void>::dangling().as_ptr())
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// Output container requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
}

impl Container {
    /// NvDsSRContainerType value
    pub fn as_native(self) -> i32 {
        match self {
            Container::Mp4 => 0,
            Container::Mkv => 1,
        }
    }

    pub fn from_native(value: i32) -> Self {
        match value {
            1 => Container::Mkv,
            _ => Container::Mp4,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
        }
    }
}

/// What an engine reports when a segment finishes writing
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingInfo {
    /// Native session id the segment was started under
    pub session_id: u32,
    /// File name relative to `dirpath`
    pub filename: String,
    pub dirpath: PathBuf,
    /// Zero when the engine does not report it
    pub duration: Duration,
    pub container: Container,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_native_values() {
        assert_eq!(Container::Mp4.as_native(), 0);
        assert_eq!(Container::Mkv.as_native(), 1);
        assert_eq!(Container::from_native(1), Container::Mkv);
        assert_eq!(Container::from_native(42), Container::Mp4);
    }

    #[test]
    fn test_native_ptr_null_and_dangling() {
        assert!(NativePtr::null().is_null());
        assert!(!NativePtr::dangling().is_null());
        let value = 5u32;
        assert_eq!(NativePtr::from_ref(&value).as_raw() as *const u32, &value as *const u32);
    }
}
