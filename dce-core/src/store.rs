//! Immutable, time-ordered event storage.
//!
//! Loading is the single place where raw clock ticks become scaled time:
//! every stored event's `t` is `(timestamp - earliest) * diff_scale`, with
//! `diff_scale` chosen so the whole recording spans [`LoadOptions::time_span`]
//! units. All later components work in scaled time.

use crate::index::{IndexError, TimeIndex};
use crate::source::{EventSource, SourceError};
use crate::types::{BoundingVolume, Event, RawEvent, Resolution};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Nominal scaled length of a full recording.
pub const DEFAULT_TIME_SPAN: f64 = 5000.0;

/// Time scale used by [`EventStore::empty_scene`].
pub const EMPTY_SCENE_DIFF_SCALE: f32 = 5.0;

/// Errors that can occur while loading events.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("source produced no events")]
    EmptySource,

    #[error("decimation factor must be at least 1, got {0}")]
    InvalidDecimation(u32),

    #[error("time span must be positive, got {0}")]
    InvalidTimeSpan(f64),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Options controlling how raw events are ingested.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Keep every `mod_freq`-th event.
    pub mod_freq: u32,
    /// Scaled length the recorded span is mapped onto.
    pub time_span: f64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            mod_freq: 1,
            time_span: DEFAULT_TIME_SPAN,
        }
    }
}

impl LoadOptions {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.mod_freq == 0 {
            return Err(StoreError::InvalidDecimation(self.mod_freq));
        }
        if self.time_span.is_nan() || self.time_span <= 0.0 {
            return Err(StoreError::InvalidTimeSpan(self.time_span));
        }
        Ok(())
    }
}

/// The ordered event sequence plus its derived statistics.
///
/// Events are stored in non-decreasing scaled-time order. This is a
/// precondition on the source, not something the store enforces; index
/// queries over an unordered store return unspecified indices.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStore {
    events: Vec<Event>,
    diff_scale: f32,
    earliest: i64,
    latest: i64,
    bounds: BoundingVolume,
    resolution: Resolution,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Creates a store in the pre-load state.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            diff_scale: 0.0,
            earliest: 0,
            latest: 0,
            bounds: BoundingVolume::inverted(),
            resolution: Resolution::default(),
        }
    }

    /// A valid scene with no events, used when nothing has been loaded yet.
    pub fn empty_scene() -> Self {
        Self {
            diff_scale: EMPTY_SCENE_DIFF_SCALE,
            bounds: BoundingVolume::zero(),
            ..Self::new()
        }
    }

    /// Ingests a time-ordered sequence of raw events.
    ///
    /// Applies `mod_freq` decimation, rescales time and computes the bounds.
    /// Fails with [`StoreError::EmptySource`] when nothing survives.
    pub fn load<I>(events: I, resolution: Resolution, options: LoadOptions) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = RawEvent>,
    {
        options.validate()?;
        let mut builder = StoreBuilder::new(options);
        builder.extend(events);
        builder.finish(resolution)
    }

    /// Drains `source` and loads everything it produces.
    ///
    /// A source error aborts the load; no partially populated store escapes.
    pub fn load_source<S>(source: &mut S, options: LoadOptions) -> Result<Self, StoreError>
    where
        S: EventSource + ?Sized,
    {
        options.validate()?;
        let resolution = source.resolution();
        let mut builder = StoreBuilder::new(options);
        let mut batches = 0usize;
        while let Some(batch) = source.next_batch()? {
            builder.extend(batch.events);
            batches += 1;
        }
        debug!(batches, "drained source");
        builder.finish(resolution)
    }

    /// Clears all events and statistics back to the pre-load state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[inline]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Scaled units per raw clock tick.
    #[inline]
    pub fn diff_scale(&self) -> f32 {
        self.diff_scale
    }

    /// Raw timestamps of the first and last kept event.
    pub fn raw_span(&self) -> (i64, i64) {
        (self.earliest, self.latest)
    }

    #[inline]
    pub fn bounds(&self) -> &BoundingVolume {
        &self.bounds
    }

    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Binary-search view over the stored events.
    pub fn index(&self) -> Result<TimeIndex<'_>, IndexError> {
        TimeIndex::new(&self.events)
    }

    /// Rescales the time extent of the bounds; used for unit conversion.
    pub(crate) fn scale_time_bounds(&mut self, factor: f32) {
        self.bounds.scale_time(factor);
    }
}

/// Accumulates raw events before scaling.
struct StoreBuilder {
    options: LoadOptions,
    counter: u64,
    events: Vec<Event>,
    /// Ticks since `earliest`, kept wide until the scale is known.
    ticks: Vec<i64>,
    earliest: Option<i64>,
    latest: i64,
}

impl StoreBuilder {
    fn new(options: LoadOptions) -> Self {
        Self {
            options,
            counter: 0,
            events: Vec::new(),
            ticks: Vec::new(),
            earliest: None,
            latest: i64::MIN,
        }
    }

    fn extend<I: IntoIterator<Item = RawEvent>>(&mut self, events: I) {
        let modulus = self.options.mod_freq as u64;
        for raw in events {
            let keep = self.counter % modulus == 0;
            self.counter += 1;
            if !keep {
                continue;
            }

            let earliest = *self.earliest.get_or_insert(raw.timestamp);
            self.latest = self.latest.max(raw.timestamp);
            self.ticks.push(raw.timestamp - earliest);
            self.events
                .push(Event::new(raw.x as f32, raw.y as f32, 0.0, raw.polarity));
        }
    }

    fn finish(mut self, resolution: Resolution) -> Result<EventStore, StoreError> {
        let Some(earliest) = self.earliest else {
            return Err(StoreError::EmptySource);
        };

        // A single-instant recording is treated as spanning one tick.
        let span = (self.latest - earliest).max(1) as f64;
        let diff_scale = self.options.time_span / span;

        let mut bounds = BoundingVolume::inverted();
        for (event, &ticks) in self.events.iter_mut().zip(&self.ticks) {
            event.t = (ticks as f64 * diff_scale) as f32;
            bounds.include([event.x, event.y, event.t]);
        }
        bounds.refresh_center();

        info!(
            events = self.events.len(),
            read = self.counter,
            diff_scale,
            "loaded events"
        );

        Ok(EventStore {
            events: self.events,
            diff_scale: diff_scale as f32,
            earliest,
            latest: self.latest,
            bounds,
            resolution,
        })
    }
}
