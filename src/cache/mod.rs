//! In-process record engine
//!
//! Keeps a rolling window of encoded frames per source and writes cuts from
//! it on a background thread. Used when DeepStream is not installed, and by
//! the agent's demo feed.
//!
//! The live path only touches memory: [`FrameTap::push`] appends to the ring
//! and forwards frames to an active cut over a channel. All disk I/O happens
//! on the writer thread, which reports the finished segment through the same
//! user-data completion path as the native library.

mod ring;
mod sink;

pub use ring::{EncodedFrame, FrameRing};
pub use sink::{segment_file_name, ElementaryStreamFactory, ElementaryStreamSink, SegmentSink, SinkFactory};

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backend::{EngineParams, RecordBin, RecordContext, RecordEngine};
use crate::error::{Result, SmartRecError};
use crate::native::{deliver_completion, deliver_fault, Container, NativePtr, RecordingInfo};

pub struct SoftwareEngine {
    sinks: Arc<dyn SinkFactory>,
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self::with_sink_factory(Arc::new(ElementaryStreamFactory::default()))
    }

    pub fn with_sink_factory(sinks: Arc<dyn SinkFactory>) -> Self {
        Self { sinks }
    }
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordEngine for SoftwareEngine {
    fn name(&self) -> &'static str {
        "software"
    }

    fn create(&self, params: &EngineParams) -> Result<Box<dyn RecordContext>> {
        std::fs::create_dir_all(&params.directory)?;
        Ok(Box::new(SoftwareContext {
            tap: FrameTap::new(Duration::from_secs(params.cache_seconds as u64)),
            params: params.clone(),
            sinks: Arc::clone(&self.sinks),
            next_session: 0,
            writers: Vec::new(),
        }))
    }
}

enum WriterCommand {
    Frame(EncodedFrame),
    Finish,
}

struct LiveCut {
    session_id: u32,
    /// Unknown until the first live frame when the ring was empty at start
    end_pts: Option<Duration>,
    front: Duration,
    tx: mpsc::Sender<WriterCommand>,
}

struct TapState {
    ring: FrameRing,
    recording: Option<LiveCut>,
}

/// Entry point for the pipeline's encoded stream
#[derive(Clone)]
pub struct FrameTap {
    state: Arc<Mutex<TapState>>,
}

impl FrameTap {
    fn new(capacity: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(TapState {
                ring: FrameRing::new(capacity),
                recording: None,
            })),
        }
    }

    /// Feed one encoded frame. Never blocks on disk.
    pub fn push(&self, frame: EncodedFrame) {
        let mut state = self.state.lock();
        let previous = state.ring.latest_pts();
        state.ring.push(frame.clone());

        let Some(cut) = state.recording.as_mut() else {
            return;
        };
        if let (Some(previous), Some(end)) = (previous, cut.end_pts) {
            if frame.pts < previous {
                // Stream clock restarted; carry over the front time still owed.
                let remaining = end.saturating_sub(previous);
                debug!(
                    "Clock restart during cut {}, {:.1}s left",
                    cut.session_id,
                    remaining.as_secs_f64()
                );
                cut.end_pts = Some(frame.pts + remaining);
            }
        }
        let end = *cut.end_pts.get_or_insert(frame.pts + cut.front);
        let finished = if frame.pts >= end {
            true
        } else {
            // A closed channel means the writer gave up; it has already
            // reported the fault.
            cut.tx.send(WriterCommand::Frame(frame)).is_err()
        };

        if finished {
            if let Some(cut) = state.recording.take() {
                let _ = cut.tx.send(WriterCommand::Finish);
                debug!("Cut {} reached its end", cut.session_id);
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording.is_some()
    }
}

struct SoftwareContext {
    tap: FrameTap,
    params: EngineParams,
    sinks: Arc<dyn SinkFactory>,
    next_session: u32,
    writers: Vec<JoinHandle<()>>,
}

impl RecordContext for SoftwareContext {
    fn record_bin(&self) -> Option<RecordBin> {
        Some(RecordBin::Tap(self.tap.clone()))
    }

    fn start(&mut self, back_seconds: u32, duration_seconds: u32, user_data: NativePtr) -> Result<u32> {
        let mut state = self.tap.state.lock();
        if state.recording.is_some() {
            return Err(SmartRecError::NativeCall {
                call: "start",
                status: -1,
            });
        }

        let duration = match duration_seconds {
            0 => self.params.default_duration_seconds,
            seconds => seconds,
        };
        let back = back_seconds.min(self.params.cache_seconds);
        let front = Duration::from_secs(duration.saturating_sub(back) as u64);

        let preroll = state.ring.cut(Duration::from_secs(back as u64));
        debug!(
            "Cut from {} cached frames ({:.1}s, {} bytes): {} preroll",
            state.ring.len(),
            state.ring.span().as_secs_f64(),
            state.ring.bytes(),
            preroll.len()
        );
        let end_pts = state.ring.latest_pts().map(|pts| pts + front);

        self.next_session = self.next_session.wrapping_add(1);
        let session_id = self.next_session;
        let job = SegmentJob {
            session_id,
            directory: self.params.directory.clone(),
            filename: segment_file_name(
                &self.params.file_prefix,
                session_id,
                chrono::Local::now(),
                self.sinks.extension(),
            ),
            container: self.params.container,
            sinks: Arc::clone(&self.sinks),
            user_data,
        };

        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(format!("smartrec-writer-{}", session_id))
            .spawn(move || job.run(preroll, rx))?;
        self.writers.retain(|writer| !writer.is_finished());
        self.writers.push(handle);

        if front.is_zero() && end_pts.is_some() {
            let _ = tx.send(WriterCommand::Finish);
        } else {
            state.recording = Some(LiveCut {
                session_id,
                end_pts,
                front,
                tx,
            });
        }
        Ok(session_id)
    }

    fn stop(&mut self, session_id: u32) -> Result<bool> {
        let mut state = self.tap.state.lock();
        match state.recording.take() {
            Some(cut) if cut.session_id == session_id => {
                let _ = cut.tx.send(WriterCommand::Finish);
                Ok(true)
            }
            other => {
                state.recording = other;
                // Ended on its own; the completion is already on its way.
                if session_id != 0 && session_id <= self.next_session {
                    return Ok(false);
                }
                Err(SmartRecError::NativeCall {
                    call: "stop",
                    status: -1,
                })
            }
        }
    }

    fn destroy(mut self: Box<Self>) -> Result<()> {
        if let Some(cut) = self.tap.state.lock().recording.take() {
            warn!("Destroying record context with cut {} still live", cut.session_id);
            let _ = cut.tx.send(WriterCommand::Finish);
        }
        for writer in self.writers.drain(..) {
            if writer.join().is_err() {
                error!("Segment writer thread panicked");
            }
        }
        Ok(())
    }
}

struct SegmentJob {
    session_id: u32,
    directory: PathBuf,
    filename: String,
    container: Container,
    sinks: Arc<dyn SinkFactory>,
    user_data: NativePtr,
}

impl SegmentJob {
    fn run(self, preroll: Vec<EncodedFrame>, rx: mpsc::Receiver<WriterCommand>) {
        match self.write(preroll, rx) {
            Ok(duration) => {
                info!(
                    "Wrote segment {:?} ({:.1}s)",
                    self.directory.join(&self.filename),
                    duration.as_secs_f64()
                );
                let info = RecordingInfo {
                    session_id: self.session_id,
                    filename: self.filename.clone(),
                    dirpath: self.directory.clone(),
                    duration,
                    container: self.container,
                    width: 0,
                    height: 0,
                };
                // SAFETY: user_data was pinned by the starter and stays armed
                // until this delivery.
                unsafe { deliver_completion(self.user_data.as_raw(), info) };
            }
            Err(e) => {
                error!("Segment {} failed: {}", self.filename, e);
                // SAFETY: as above.
                unsafe { deliver_fault(self.user_data.as_raw(), e.to_string()) };
            }
        }
    }

    fn write(&self, preroll: Vec<EncodedFrame>, rx: mpsc::Receiver<WriterCommand>) -> std::io::Result<Duration> {
        let mut sink = self.sinks.open(&self.directory.join(&self.filename))?;
        let mut elapsed = Duration::ZERO;
        let mut previous: Option<Duration> = None;

        let live = rx.into_iter().map_while(|command| match command {
            WriterCommand::Frame(frame) => Some(frame),
            WriterCommand::Finish => None,
        });

        for frame in preroll.into_iter().chain(live) {
            // Until a keyframe has been written, nothing else is decodable.
            if previous.is_none() && !frame.keyframe {
                continue;
            }
            sink.write_frame(&frame)?;
            if let Some(previous) = previous {
                // A clock restart adds nothing.
                elapsed += frame.pts.saturating_sub(previous);
            }
            previous = Some(frame.pts);
        }

        sink.finish()?;
        Ok(elapsed)
    }
}
