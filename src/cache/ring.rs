//! Rolling window of encoded frames

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One encoded access unit as it leaves the encoder
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Shared so the ring and a live cut can hold the same bytes
    pub data: Arc<[u8]>,
    /// Presentation timestamp on the stream clock
    pub pts: Duration,
    /// Cuts may only begin on a keyframe
    pub keyframe: bool,
}

impl EncodedFrame {
    pub fn new(data: impl Into<Arc<[u8]>>, pts: Duration, keyframe: bool) -> Self {
        Self {
            data: data.into(),
            pts,
            keyframe,
        }
    }
}

/// Keeps the most recent `capacity` of stream time
pub struct FrameRing {
    frames: VecDeque<EncodedFrame>,
    capacity: Duration,
    bytes: usize,
}

impl FrameRing {
    pub fn new(capacity: Duration) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity,
            bytes: 0,
        }
    }

    pub fn push(&mut self, frame: EncodedFrame) {
        // A clock that jumps backwards restarts the window.
        if self.latest_pts().is_some_and(|latest| frame.pts < latest) {
            self.clear();
        }
        self.bytes += frame.data.len();
        self.frames.push_back(frame);
        self.trim();
    }

    fn trim(&mut self) {
        let Some(latest) = self.latest_pts() else {
            return;
        };
        let cutoff = latest.saturating_sub(self.capacity);
        while let Some(front) = self.frames.front() {
            if front.pts >= cutoff {
                break;
            }
            if let Some(removed) = self.frames.pop_front() {
                self.bytes = self.bytes.saturating_sub(removed.data.len());
            }
        }
    }

    /// Frames from the first keyframe at or after `latest - back`.
    ///
    /// Empty when no keyframe qualifies; the cut then starts at the next
    /// live keyframe.
    pub fn cut(&self, back: Duration) -> Vec<EncodedFrame> {
        let Some(latest) = self.latest_pts() else {
            return Vec::new();
        };
        let cutoff = latest.saturating_sub(back);
        match self
            .frames
            .iter()
            .position(|frame| frame.keyframe && frame.pts >= cutoff)
        {
            Some(start) => self.frames.iter().skip(start).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn latest_pts(&self) -> Option<Duration> {
        self.frames.back().map(|frame| frame.pts)
    }

    /// Stream time currently held
    pub fn span(&self) -> Duration {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.pts.saturating_sub(first.pts),
            _ => Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }
}
