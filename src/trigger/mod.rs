//! Trigger admission
//!
//! Detections and manual commands become [`TriggerEvent`]s. The
//! [`TriggerGate`] decides whether one is honored based on a per-source
//! cooldown; the [`DetectionFilter`] decides which detections count at all.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::session::SourceId;

/// Label used for manual triggers without one
pub const MANUAL_LABEL: &str = "manual";

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerCause {
    Detector { class_id: i32, label: String },
    Manual { label: String },
}

impl TriggerCause {
    pub fn label(&self) -> &str {
        match self {
            TriggerCause::Detector { label, .. } | TriggerCause::Manual { label } => label,
        }
    }
}

/// Ephemeral request for a cut; consumed synchronously
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub source_id: SourceId,
    pub cause: TriggerCause,
    pub confidence: Option<f32>,
    pub timestamp: Instant,
}

impl TriggerEvent {
    pub fn detection(source_id: SourceId, detection: &Detection, timestamp: Instant) -> Self {
        Self {
            source_id,
            cause: TriggerCause::Detector {
                class_id: detection.class_id,
                label: detection.trigger_label(),
            },
            confidence: Some(detection.confidence),
            timestamp,
        }
    }

    pub fn manual(source_id: SourceId, label: Option<&str>, timestamp: Instant) -> Self {
        let label = label
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .unwrap_or(MANUAL_LABEL);
        Self {
            source_id,
            cause: TriggerCause::Manual {
                label: label.to_string(),
            },
            confidence: None,
            timestamp,
        }
    }

    pub fn label(&self) -> &str {
        self.cause.label()
    }
}

/// Per-source cooldown gate
pub struct TriggerGate {
    cooldown: Mutex<Duration>,
    last_trigger: Mutex<HashMap<SourceId, Instant>>,
}

impl TriggerGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: Mutex::new(cooldown),
            last_trigger: Mutex::new(HashMap::new()),
        }
    }

    /// Admit iff the cooldown is zero or has elapsed since the last admitted
    /// trigger. Admission records `now` before returning, so a second trigger
    /// racing a slow start is rejected.
    pub fn admit(&self, source_id: SourceId, now: Instant) -> bool {
        let cooldown = *self.cooldown.lock();
        let mut last_trigger = self.last_trigger.lock();

        if !cooldown.is_zero() {
            if let Some(last) = last_trigger.get(&source_id) {
                if now.saturating_duration_since(*last) < cooldown {
                    return false;
                }
            }
        }
        last_trigger.insert(source_id, now);
        true
    }

    /// Negative or non-finite values disable the cooldown
    pub fn set_cooldown(&self, seconds: f64) {
        let cooldown = if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        };
        *self.cooldown.lock() = cooldown;
    }

    pub fn cooldown(&self) -> Duration {
        *self.cooldown.lock()
    }

    pub fn last_trigger(&self, source_id: SourceId) -> Option<Instant> {
        self.last_trigger.lock().get(&source_id).copied()
    }

    pub fn forget(&self, source_id: SourceId) {
        self.last_trigger.lock().remove(&source_id);
    }
}

impl Default for TriggerGate {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

/// One detector output for a frame
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: i32,
    pub label: Option<String>,
    pub confidence: f32,
}

impl Detection {
    pub fn new(class_id: i32, label: Option<&str>, confidence: f32) -> Self {
        Self {
            class_id,
            label: label.map(str::to_string),
            confidence,
        }
    }

    pub fn trigger_label(&self) -> String {
        match &self.label {
            Some(label) if !label.is_empty() => label.clone(),
            _ => format!("class{}", self.class_id),
        }
    }
}

/// Which detections are allowed to trigger a cut
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionFilter {
    pub class_ids: HashSet<i32>,
    /// Compared case-insensitively
    pub labels: HashSet<String>,
    pub min_confidence: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            class_ids: HashSet::from([0]),
            labels: HashSet::from(["person".to_string()]),
            min_confidence: 0.35,
        }
    }
}

impl DetectionFilter {
    /// Accept every class above `min_confidence`
    pub fn any_class(min_confidence: f32) -> Self {
        Self {
            class_ids: HashSet::new(),
            labels: HashSet::new(),
            min_confidence,
        }
    }

    pub fn matches(&self, detection: &Detection) -> bool {
        if detection.confidence < self.min_confidence {
            return false;
        }
        if self.class_ids.is_empty() && self.labels.is_empty() {
            return true;
        }
        if self.class_ids.contains(&detection.class_id) {
            return true;
        }
        detection.label.as_ref().is_some_and(|label| {
            self.labels
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(label))
        })
    }
}
