//! Recording sources.
//!
//! A source delivers time-ordered batches of [`RawEvent`]s (and optionally
//! co-timed camera frames) until it stops running. Both the batch loader in
//! [`store`](crate::store) and the live [`stream`](crate::stream) ingestor pull
//! from the same [`EventSource`] trait.

pub mod csv;
pub mod evt3;

use crate::types::{RawEvent, Resolution};
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;

pub use self::csv::CsvSource;
pub use self::evt3::Evt3Source;

/// Errors raised by recording sources.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source unavailable: {path}: {reason}")]
    Unavailable { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),
}

/// A grayscale image captured alongside the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Capture timestamp in clock ticks
    pub timestamp: i64,
    pub width: u32,
    pub height: u32,
    /// Row-major 8-bit pixels
    pub pixels: Vec<u8>,
}

/// One batch pulled from a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceBatch {
    pub events: Vec<RawEvent>,
    pub frames: Vec<Frame>,
}

impl SourceBatch {
    pub fn from_events(events: Vec<RawEvent>) -> Self {
        Self {
            events,
            frames: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.frames.is_empty()
    }
}

/// A producer of time-ordered event batches.
///
/// Events must arrive in non-decreasing timestamp order across batches; the
/// index structures rely on it and do not re-sort.
pub trait EventSource {
    /// Fixed sensor resolution of the recording.
    fn resolution(&self) -> Resolution;

    /// Returns the next batch, or `Ok(None)` once the source is no longer running.
    fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError>;
}

impl<S: EventSource + ?Sized> EventSource for Box<S> {
    fn resolution(&self) -> Resolution {
        (**self).resolution()
    }

    fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError> {
        (**self).next_batch()
    }
}

/// A source backed by batches held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    resolution: Resolution,
    batches: VecDeque<SourceBatch>,
}

impl MemorySource {
    pub fn new(resolution: Resolution, batches: impl IntoIterator<Item = SourceBatch>) -> Self {
        Self {
            resolution,
            batches: batches.into_iter().collect(),
        }
    }

    /// Splits `events` into batches of at most `batch_size` events.
    pub fn from_events(resolution: Resolution, events: &[RawEvent], batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self::new(
            resolution,
            events
                .chunks(batch_size)
                .map(|chunk| SourceBatch::from_events(chunk.to_vec())),
        )
    }

    /// Number of batches not yet delivered.
    pub fn pending(&self) -> usize {
        self.batches.len()
    }
}

impl EventSource for MemorySource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError> {
        Ok(self.batches.pop_front())
    }
}

/// Opens a recording, choosing the reader from the file extension.
///
/// `.raw` files are read as EVT 3.0; `.csv` and `.txt` as event CSV.
pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Box<dyn EventSource>, SourceError> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    match ext.as_str() {
        "raw" => Ok(Box::new(Evt3Source::open(path)?)),
        "csv" | "txt" => Ok(Box::new(CsvSource::open(path)?)),
        _ => Err(SourceError::Unavailable {
            path: path.display().to_string(),
            reason: format!("unsupported recording extension {:?}", ext),
        }),
    }
}

/// Maps an open failure to [`SourceError::Unavailable`].
pub(crate) fn unavailable(path: &Path, err: std::io::Error) -> SourceError {
    SourceError::Unavailable {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_batches() {
        let events: Vec<RawEvent> = (0..5).map(|i| RawEvent::new(i, i, true, i as i64)).collect();
        let mut source = MemorySource::from_events(Resolution::default(), &events, 2);
        assert_eq!(source.pending(), 3);

        let first = source.next_batch().unwrap().unwrap();
        assert_eq!(first.events.len(), 2);
        source.next_batch().unwrap();
        let last = source.next_batch().unwrap().unwrap();
        assert_eq!(last.events, vec![events[4]]);
        assert!(source.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_open_path_rejects_unknown_extension() {
        let err = open_path("recording.aedat4").err().unwrap();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }

    #[test]
    fn test_open_path_missing_file_is_unavailable() {
        let err = open_path("/nonexistent/dir/recording.raw").err().unwrap();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }
}
