//! Segment output

use chrono::{DateTime, Local};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::EncodedFrame;

/// Receives the frames of one cut, in order
pub trait SegmentSink: Send {
    fn write_frame(&mut self, frame: &EncodedFrame) -> io::Result<()>;

    /// Flush and close; the file is complete once this returns `Ok`
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Opens a sink per cut
pub trait SinkFactory: Send + Sync {
    /// File extension for segments, without the dot
    fn extension(&self) -> &str;

    fn open(&self, path: &Path) -> io::Result<Box<dyn SegmentSink>>;
}

/// Writes access units back to back, e.g. an Annex-B H.264 stream
pub struct ElementaryStreamSink {
    writer: BufWriter<File>,
}

impl SegmentSink for ElementaryStreamSink {
    fn write_frame(&mut self, frame: &EncodedFrame) -> io::Result<()> {
        self.writer.write_all(&frame.data)
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

pub struct ElementaryStreamFactory {
    extension: String,
}

impl ElementaryStreamFactory {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

impl Default for ElementaryStreamFactory {
    fn default() -> Self {
        Self::new("h264")
    }
}

impl SinkFactory for ElementaryStreamFactory {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn SegmentSink>> {
        let file = File::create(path)?;
        Ok(Box::new(ElementaryStreamSink {
            writer: BufWriter::new(file),
        }))
    }
}

/// `{prefix}{seq:05}_{YYYYMMDD-HHMMSS}.{ext}`
pub fn segment_file_name(prefix: &str, sequence: u32, started: DateTime<Local>, extension: &str) -> String {
    format!(
        "{}{:05}_{}.{}",
        prefix,
        sequence,
        started.format("%Y%m%d-%H%M%S"),
        extension
    )
}
