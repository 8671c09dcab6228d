//! Incremental, bounded-memory ingestion.
//!
//! A [`StreamIngestor`] is advanced one [`StreamIngestor::step`] per caller
//! tick. Each step pulls at most one batch from its source, converts
//! timestamps to milliseconds relative to the first timestamp seen, appends
//! to the [`StreamBuffer`] and evicts everything more than `max_z`
//! milliseconds behind the newest entry.
//!
//! The live buffer is never handed out. Consumers take a
//! [`StreamSnapshot`], a deep copy that can only be made while ingestion is
//! paused or finished.

use crate::source::{open_path, EventSource, Frame, SourceError};
use crate::types::{Event, Resolution};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Raw ticks per relative-time unit (microseconds to milliseconds).
const TICKS_PER_MS: f64 = 1_000.0;

/// Scaled units per raw tick of stream-relative time.
pub const STREAM_DIFF_SCALE: f32 = 1.0 / TICKS_PER_MS as f32;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("no source attached")]
    NoSource,

    #[error("snapshot requires a paused or finished stream, state is {0:?}")]
    NotPaused(IngestState),

    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Streaming,
    Paused,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continuing,
    /// The buffer just became non-empty for the first time.
    FirstBatch,
    /// The source is exhausted or disconnected.
    Finished,
}

/// Per-tick ingestion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepParams {
    /// Retention horizon in milliseconds.
    pub max_z: f64,
    pub pause: bool,
    /// Maximum retained events per millisecond.
    pub time_density: Option<f64>,
}

impl Default for StepParams {
    fn default() -> Self {
        Self {
            max_z: 100.0,
            pause: false,
            time_density: None,
        }
    }
}

/// Time-ordered events and frames within the retention horizon.
///
/// Event `t` and frame times are milliseconds since the stream epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamBuffer {
    events: VecDeque<Event>,
    frames: VecDeque<(Frame, f32)>,
}

impl StreamBuffer {
    pub fn events(&self) -> &VecDeque<Event> {
        &self.events
    }

    pub fn frames(&self) -> &VecDeque<(Frame, f32)> {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.frames.is_empty()
    }

    /// Relative time of the newest entry.
    pub fn newest(&self) -> Option<f32> {
        let event = self.events.back().map(|e| e.t);
        let frame = self.frames.back().map(|(_, t)| *t);
        match (event, frame) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drops entries more than `max_z` behind the newest; returns how many.
    pub fn evict(&mut self, max_z: f64) -> usize {
        let Some(newest) = self.newest() else {
            return 0;
        };
        let horizon = (newest as f64 - max_z) as f32;
        let before = self.events.len() + self.frames.len();
        while self.events.front().is_some_and(|e| e.t < horizon) {
            self.events.pop_front();
        }
        while self.frames.front().is_some_and(|(_, t)| *t < horizon) {
            self.frames.pop_front();
        }
        before - (self.events.len() + self.frames.len())
    }

    fn clear(&mut self) {
        self.events.clear();
        self.frames.clear();
    }
}

/// A frozen, independent copy of the stream buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub events: Vec<Event>,
    pub frames: Vec<(Frame, f32)>,
    pub resolution: Resolution,
}

/// Pulls from a source into a bounded buffer, one batch per step.
pub struct StreamIngestor {
    source: Option<Box<dyn EventSource>>,
    state: IngestState,
    buffer: StreamBuffer,
    epoch: Option<i64>,
    last_kept: Option<f64>,
    first_reported: bool,
    resolution: Resolution,
    pulled: u64,
}

impl Default for StreamIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIngestor {
    pub fn new() -> Self {
        Self {
            source: None,
            state: IngestState::Idle,
            buffer: StreamBuffer::default(),
            epoch: None,
            last_kept: None,
            first_reported: false,
            resolution: Resolution::default(),
            pulled: 0,
        }
    }

    /// Attaches `source`, discarding any previous stream.
    pub fn start(&mut self, source: Box<dyn EventSource>) {
        self.reset();
        self.resolution = source.resolution();
        self.source = Some(source);
        self.state = IngestState::Streaming;
    }

    /// Opens a recording and starts streaming from it.
    ///
    /// On failure the ingestor stays idle.
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), StreamError> {
        let source = open_path(path)?;
        self.start(source);
        Ok(())
    }

    /// Back to idle: drops the source and clears the buffer.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Advances ingestion by one tick.
    pub fn step(&mut self, params: &StepParams) -> Result<StepOutcome, StreamError> {
        match self.state {
            IngestState::Idle => return Err(StreamError::NoSource),
            IngestState::Finished => return Ok(StepOutcome::Finished),
            IngestState::Streaming | IngestState::Paused => {}
        }
        if params.pause {
            self.state = IngestState::Paused;
            return Ok(StepOutcome::Continuing);
        }
        self.state = IngestState::Streaming;

        let Some(source) = self.source.as_mut() else {
            return Err(StreamError::NoSource);
        };
        let batch = match source.next_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                info!(
                    pulled = self.pulled,
                    retained = self.buffer.len(),
                    "stream finished"
                );
                return Ok(self.finish());
            }
            Err(err) => {
                warn!(error = %err, retained = self.buffer.len(), "source disconnected");
                return Ok(self.finish());
            }
        };

        let spacing = params
            .time_density
            .filter(|d| *d > 0.0)
            .map(|d| 1.0 / d);
        for raw in &batch.events {
            self.pulled += 1;
            let t = self.relative_ms(raw.timestamp);
            if let (Some(spacing), Some(last)) = (spacing, self.last_kept) {
                if t - last < spacing {
                    continue;
                }
            }
            self.last_kept = Some(t);
            self.buffer.events.push_back(Event::new(
                raw.x as f32,
                raw.y as f32,
                t as f32,
                raw.polarity,
            ));
        }
        for frame in batch.frames {
            let t = self.relative_ms(frame.timestamp);
            self.buffer.frames.push_back((frame, t as f32));
        }

        let evicted = self.buffer.evict(params.max_z);
        debug!(retained = self.buffer.len(), evicted, "stream step");

        if !self.first_reported && !self.buffer.is_empty() {
            self.first_reported = true;
            return Ok(StepOutcome::FirstBatch);
        }
        Ok(StepOutcome::Continuing)
    }

    /// Deep copy of the buffer, only while paused or finished.
    pub fn snapshot(&self) -> Result<StreamSnapshot, StreamError> {
        match self.state {
            IngestState::Paused | IngestState::Finished => Ok(StreamSnapshot {
                events: self.buffer.events.iter().copied().collect(),
                frames: self.buffer.frames.iter().cloned().collect(),
                resolution: self.resolution,
            }),
            state => Err(StreamError::NotPaused(state)),
        }
    }

    fn relative_ms(&mut self, timestamp: i64) -> f64 {
        let epoch = *self.epoch.get_or_insert(timestamp);
        (timestamp - epoch) as f64 / TICKS_PER_MS
    }

    fn finish(&mut self) -> StepOutcome {
        self.source = None;
        self.state = IngestState::Finished;
        StepOutcome::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, SourceBatch};
    use crate::types::RawEvent;

    fn raw_ms(ms: &[i64]) -> Vec<RawEvent> {
        ms.iter()
            .map(|&m| RawEvent::new(1, 2, true, 5_000 + m * 1000))
            .collect()
    }

    fn ingestor(batches: Vec<Vec<RawEvent>>) -> StreamIngestor {
        let source = MemorySource::new(
            Resolution::default(),
            batches.into_iter().map(SourceBatch::from_events),
        );
        let mut ingestor = StreamIngestor::new();
        ingestor.start(Box::new(source));
        ingestor
    }

    /// Yields one batch, then fails.
    struct Disconnecting(bool);

    impl EventSource for Disconnecting {
        fn resolution(&self) -> Resolution {
            Resolution::default()
        }

        fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError> {
            if std::mem::replace(&mut self.0, true) {
                Err(SourceError::InvalidFormat("link lost".to_string()))
            } else {
                Ok(Some(SourceBatch::from_events(raw_ms(&[0, 1]))))
            }
        }
    }

    #[test]
    fn test_step_without_source() {
        let mut ingestor = StreamIngestor::new();
        assert!(matches!(
            ingestor.step(&StepParams::default()),
            Err(StreamError::NoSource)
        ));
    }

    #[test]
    fn test_first_batch_reported_once() {
        let mut ingestor = ingestor(vec![vec![], raw_ms(&[0, 1]), raw_ms(&[2])]);
        let params = StepParams::default();
        assert_eq!(ingestor.step(&params).unwrap(), StepOutcome::Continuing);
        assert_eq!(ingestor.step(&params).unwrap(), StepOutcome::FirstBatch);
        assert_eq!(ingestor.step(&params).unwrap(), StepOutcome::Continuing);
        assert_eq!(ingestor.step(&params).unwrap(), StepOutcome::Finished);
        assert_eq!(ingestor.step(&params).unwrap(), StepOutcome::Finished);
        assert_eq!(ingestor.state(), IngestState::Finished);
        assert_eq!(ingestor.buffer().len(), 3);
    }

    #[test]
    fn test_relative_time_and_eviction() {
        let mut ingestor = ingestor(vec![raw_ms(&[0, 5, 10]), raw_ms(&[20, 30])]);
        let params = StepParams {
            max_z: 12.0,
            ..StepParams::default()
        };
        ingestor.step(&params).unwrap();
        let ts: Vec<f32> = ingestor.buffer().events().iter().map(|e| e.t).collect();
        assert_eq!(ts, vec![0.0, 5.0, 10.0]);

        ingestor.step(&params).unwrap();
        let ts: Vec<f32> = ingestor.buffer().events().iter().map(|e| e.t).collect();
        assert_eq!(ts, vec![20.0, 30.0]);
    }

    #[test]
    fn test_time_density_limits_retention() {
        let events: Vec<i64> = (0..10).collect();
        let mut ingestor = ingestor(vec![raw_ms(&events)]);
        let params = StepParams {
            max_z: 1000.0,
            time_density: Some(0.5),
            ..StepParams::default()
        };
        ingestor.step(&params).unwrap();
        let ts: Vec<f32> = ingestor.buffer().events().iter().map(|e| e.t).collect();
        assert_eq!(ts, vec![0.0, 2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_pause_stops_pulling_and_allows_snapshot() {
        let mut ingestor = ingestor(vec![raw_ms(&[0]), raw_ms(&[1])]);
        ingestor.step(&StepParams::default()).unwrap();
        assert!(matches!(
            ingestor.snapshot(),
            Err(StreamError::NotPaused(IngestState::Streaming))
        ));

        let paused = StepParams {
            pause: true,
            ..StepParams::default()
        };
        assert_eq!(ingestor.step(&paused).unwrap(), StepOutcome::Continuing);
        assert_eq!(ingestor.state(), IngestState::Paused);
        let snapshot = ingestor.snapshot().unwrap();
        assert_eq!(snapshot.events.len(), 1);

        ingestor.step(&StepParams::default()).unwrap();
        assert_eq!(ingestor.buffer().len(), 2);
        assert_eq!(snapshot.events.len(), 1);
    }

    #[test]
    fn test_frames_share_the_horizon() {
        let frame = |ms: i64| Frame {
            timestamp: 5_000 + ms * 1000,
            width: 2,
            height: 1,
            pixels: vec![0, 255],
        };
        let batches = vec![
            SourceBatch {
                events: raw_ms(&[0]),
                frames: vec![frame(0)],
            },
            SourceBatch {
                events: raw_ms(&[50]),
                frames: vec![frame(50)],
            },
        ];
        let mut ingestor = StreamIngestor::new();
        ingestor.start(Box::new(MemorySource::new(Resolution::default(), batches)));
        let params = StepParams {
            max_z: 10.0,
            ..StepParams::default()
        };
        ingestor.step(&params).unwrap();
        ingestor.step(&params).unwrap();
        let frames = ingestor.buffer().frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, 50.0);
    }

    #[test]
    fn test_disconnect_finishes_with_buffer() {
        let mut ingestor = StreamIngestor::new();
        ingestor.start(Box::new(Disconnecting(false)));
        let params = StepParams::default();
        assert_eq!(ingestor.step(&params).unwrap(), StepOutcome::FirstBatch);
        assert_eq!(ingestor.step(&params).unwrap(), StepOutcome::Finished);
        assert_eq!(ingestor.snapshot().unwrap().events.len(), 2);
    }

    #[test]
    fn test_open_missing_file_stays_idle() {
        let mut ingestor = StreamIngestor::new();
        let err = ingestor.open_file("/nonexistent/recording.raw").unwrap_err();
        assert!(matches!(
            err,
            StreamError::Source(SourceError::Unavailable { .. })
        ));
        assert_eq!(ingestor.state(), IngestState::Idle);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut ingestor = ingestor(vec![raw_ms(&[0])]);
        ingestor.step(&StepParams::default()).unwrap();
        ingestor.reset();
        assert_eq!(ingestor.state(), IngestState::Idle);
        assert!(ingestor.buffer().is_empty());
    }
}
