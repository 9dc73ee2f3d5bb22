//! smartrec
//!
//! Event-triggered recording for live video sources. Keeps a rolling cache
//! of each stream and, on a detection or manual trigger, writes the window
//! around the trigger instant to a file.

pub mod backend;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod native;
pub mod notify;
pub mod session;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use controller::{
    AttachTarget, ControllerSettings, SmartRecordController, SuppressReason, TriggerOutcome,
};
pub use error::{Result, SmartRecError};
pub use notify::{CompletionRecord, RecordEvent};
pub use session::{SessionState, SourceId};
