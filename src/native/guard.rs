//! Pin/release guard for memory shared with native callbacks

use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Shared<T> {
    resource: T,
    pins: Mutex<usize>,
    idle: Condvar,
}

/// Owns a resource at a stable heap address and counts outstanding pins.
///
/// Clones share the same resource. The resource is freed when the last guard
/// clone and the last [`PinToken`] are gone, so a token parked on the native
/// side keeps the memory alive even if every owner has been dropped.
pub struct NativeResourceGuard<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for NativeResourceGuard<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Returned when pins are still outstanding at the wait deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StillPinned {
    pub outstanding: usize,
}

impl<T> NativeResourceGuard<T> {
    pub fn new(resource: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                resource,
                pins: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// Take a pin. The resource stays put until the token is released.
    pub fn pin(&self) -> PinToken<T> {
        *self.shared.pins.lock() += 1;
        PinToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Explicit release; equivalent to dropping the token
    pub fn release(token: PinToken<T>) {
        drop(token);
    }

    pub fn outstanding(&self) -> usize {
        *self.shared.pins.lock()
    }

    /// Stable address of the resource, valid while this guard or a pin lives
    pub fn as_ptr(&self) -> *const T {
        &self.shared.resource as *const T
    }

    /// Block until no pins are outstanding or the timeout elapses
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), StillPinned> {
        let deadline = Instant::now() + timeout;
        let mut pins = self.shared.pins.lock();
        while *pins > 0 {
            if self.shared.idle.wait_until(&mut pins, deadline).timed_out() {
                break;
            }
        }
        match *pins {
            0 => Ok(()),
            outstanding => Err(StillPinned { outstanding }),
        }
    }
}

impl<T> Deref for NativeResourceGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.shared.resource
    }
}

/// One outstanding reference held on behalf of native code
pub struct PinToken<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for PinToken<T> {
    fn drop(&mut self) {
        let mut pins = self.shared.pins.lock();
        *pins = pins.saturating_sub(1);
        if *pins == 0 {
            self.shared.idle.notify_all();
        }
    }
}

impl<T> std::fmt::Debug for PinToken<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinToken").finish_non_exhaustive()
    }
}
