//! Exposure windows.
//!
//! The presentation layer edits a [`ShutterWindow`], which always holds both a
//! time window and an event-index window. [`ShutterWindow::spec`] picks the
//! authoritative one and yields a [`WindowSpec`], which is resolved exactly
//! once into an inclusive index range before reaching the compute stage.

use crate::index::{IndexError, TimeIndex};
use crate::store::EventStore;
use crate::types::{Event, IndexRange};
use serde::{Deserialize, Serialize};

/// Which addressing mode drives the exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterType {
    #[default]
    Time,
    Event,
}

/// Display unit for time-valued fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[serde(alias = "us")]
    Microseconds,
    #[default]
    #[serde(alias = "ms")]
    Milliseconds,
    #[serde(alias = "s")]
    Seconds,
}

impl TimeUnit {
    /// Raw clock ticks (microseconds) per unit.
    pub fn ticks_per_unit(&self) -> f32 {
        match self {
            Self::Microseconds => 1.0,
            Self::Milliseconds => 1_000.0,
            Self::Seconds => 1_000_000.0,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Microseconds => "us",
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
        }
    }
}

impl std::str::FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "us" | "microseconds" => Ok(Self::Microseconds),
            "ms" | "milliseconds" => Ok(Self::Milliseconds),
            "s" | "seconds" => Ok(Self::Seconds),
            other => Err(format!("unknown time unit: {}. Use us, ms or s", other)),
        }
    }
}

/// Pixel rectangle that events must fall inside (edges inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpaceWindow {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl SpaceWindow {
    pub fn new(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    /// A window that admits every finite coordinate.
    pub fn unbounded() -> Self {
        Self::new(f32::MIN, f32::MAX, f32::MAX, f32::MIN)
    }

    /// The bounding rectangle of a store.
    pub fn covering(store: &EventStore) -> Self {
        let bounds = store.bounds();
        Self::new(bounds.min[1], bounds.max[0], bounds.max[1], bounds.min[0])
    }

    #[inline]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.left <= x && x <= self.right && self.top <= y && y <= self.bottom
    }

    /// `(top, right, bottom, left)` as uploaded to the kernel.
    pub fn to_array(&self) -> [f32; 4] {
        [self.top, self.right, self.bottom, self.left]
    }
}

/// The authoritative exposure window, in exactly one addressing mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowSpec {
    /// Scaled-time bounds `[left, right]`, multiplied by `norm_factor` before lookup.
    Time {
        left: f32,
        right: f32,
        norm_factor: f32,
    },
    /// Inclusive event-index bounds. The Morlet center still comes from the
    /// time shutter and is given directly in scaled time.
    EventIndex { left: u32, right: u32, center_t: f32 },
}

/// A window reduced to one canonical index range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedWindow {
    pub range: IndexRange,
    /// Scaled time at the middle of the window (Morlet center).
    pub center_t: f32,
}

impl ResolvedWindow {
    pub fn empty() -> Self {
        Self {
            range: IndexRange::empty(),
            center_t: 0.0,
        }
    }
}

impl WindowSpec {
    /// Resolves to an index range clamped to the store.
    pub fn resolve(&self, events: &[Event]) -> Result<ResolvedWindow, IndexError> {
        let index = TimeIndex::new(events)?;
        match *self {
            WindowSpec::Time {
                left,
                right,
                norm_factor,
            } => {
                let l = index.first_at_or_after(left, norm_factor);
                let r = index.last_at_or_before(right, norm_factor);
                // An interval holding no event resolves to l = r + 1.
                let range = if left > right {
                    IndexRange::empty()
                } else {
                    IndexRange::new(l as u32, r as u32)
                };
                let (tl, tr) = (left * norm_factor, right * norm_factor);
                Ok(ResolvedWindow {
                    range,
                    center_t: tl + (tr - tl) * 0.5,
                })
            }
            WindowSpec::EventIndex {
                left,
                right,
                center_t,
            } => {
                let range = IndexRange::new(left, right).clamp_to(index.len());
                if range.is_empty() {
                    return Ok(ResolvedWindow::empty());
                }
                Ok(ResolvedWindow { range, center_t })
            }
        }
    }
}

/// Window state edited by the presentation layer.
///
/// The shutter sub-windows are offsets from the primary window's left edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutterWindow {
    pub shutter_type: ShutterType,
    pub time_window: [f32; 2],
    pub event_window: [u32; 2],
    pub time_shutter: [f32; 2],
    pub event_shutter: [u32; 2],
    pub space_window: SpaceWindow,
    pub positive_only: bool,
}

impl Default for ShutterWindow {
    fn default() -> Self {
        Self {
            shutter_type: ShutterType::Time,
            time_window: [0.0, 0.0],
            event_window: [0, 0],
            time_shutter: [0.0, 0.0],
            event_shutter: [0, 0],
            space_window: SpaceWindow::default(),
            positive_only: false,
        }
    }
}

impl ShutterWindow {
    /// A window covering every event of `store`.
    pub fn covering(store: &EventStore) -> Self {
        let bounds = store.bounds();
        let (t_min, t_max) = if store.is_empty() {
            (0.0, 1.0)
        } else {
            (bounds.min[2], bounds.max[2])
        };
        let last = store.len().saturating_sub(1) as u32;

        Self {
            shutter_type: ShutterType::Time,
            time_window: [t_min, t_max],
            event_window: [0, last],
            time_shutter: [0.0, t_max - t_min],
            event_shutter: [0, last],
            space_window: SpaceWindow::covering(store),
            positive_only: false,
        }
    }

    /// Absolute shutter bounds in time.
    pub fn time_bounds(&self) -> (f32, f32) {
        let base = self.time_window[0];
        (base + self.time_shutter[0], base + self.time_shutter[1])
    }

    /// Absolute shutter bounds in event index.
    pub fn event_bounds(&self) -> (u32, u32) {
        let base = self.event_window[0];
        (
            base.saturating_add(self.event_shutter[0]),
            base.saturating_add(self.event_shutter[1]),
        )
    }

    /// The authoritative window for the current shutter type.
    pub fn spec(&self, norm_factor: f32) -> WindowSpec {
        match self.shutter_type {
            ShutterType::Time => {
                let (left, right) = self.time_bounds();
                WindowSpec::Time {
                    left,
                    right,
                    norm_factor,
                }
            }
            ShutterType::Event => {
                let (left, right) = self.event_bounds();
                let (tl, tr) = self.time_bounds();
                WindowSpec::EventIndex {
                    left,
                    right,
                    center_t: (tl + (tr - tl) * 0.5) * norm_factor,
                }
            }
        }
    }

    /// Slides the primary window forward by one frame period.
    ///
    /// Only the window matching the shutter type moves.
    pub fn advance(&mut self, time_period: f32, event_period: u32) {
        match self.shutter_type {
            ShutterType::Time => {
                self.time_window[0] += time_period;
                self.time_window[1] += time_period;
            }
            ShutterType::Event => {
                self.event_window[0] = self.event_window[0].saturating_add(event_period);
                self.event_window[1] = self.event_window[1].saturating_add(event_period);
            }
        }
    }

    /// Multiplies every time-valued field by `factor`.
    pub(crate) fn scale_time(&mut self, factor: f32) {
        for value in self
            .time_window
            .iter_mut()
            .chain(self.time_shutter.iter_mut())
        {
            *value *= factor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_at(ts: &[f32]) -> Vec<Event> {
        ts.iter().map(|&t| Event::new(0.0, 0.0, t, true)).collect()
    }

    #[test]
    fn test_time_spec_resolves_to_index_range() {
        let events = events_at(&[0.0, 10.0, 20.0, 30.0]);
        let spec = WindowSpec::Time {
            left: 5.0,
            right: 25.0,
            norm_factor: 1.0,
        };
        let resolved = spec.resolve(&events).unwrap();
        assert_eq!(resolved.range, IndexRange::new(1, 2));
        assert_eq!(resolved.center_t, 15.0);
    }

    #[test]
    fn test_time_spec_without_events_is_empty() {
        let events = events_at(&[0.0, 10.0, 20.0, 30.0]);
        let spec = WindowSpec::Time {
            left: 11.0,
            right: 19.0,
            norm_factor: 1.0,
        };
        assert!(spec.resolve(&events).unwrap().range.is_empty());

        let inverted = WindowSpec::Time {
            left: 25.0,
            right: 5.0,
            norm_factor: 1.0,
        };
        assert!(inverted.resolve(&events).unwrap().range.is_empty());
    }

    #[test]
    fn test_event_spec_clamps_and_centers() {
        let events = events_at(&[0.0, 10.0, 20.0, 30.0]);
        let resolved = WindowSpec::EventIndex {
            left: 1,
            right: 9,
            center_t: 12.5,
        }
        .resolve(&events)
        .unwrap();
        assert_eq!(resolved.range, IndexRange::new(1, 3));
        assert_eq!(resolved.center_t, 12.5);

        let inverted = WindowSpec::EventIndex {
            left: 3,
            right: 1,
            center_t: 0.0,
        }
        .resolve(&events)
            .unwrap();
        assert!(inverted.range.is_empty());
    }

    #[test]
    fn test_event_mode_centers_on_time_shutter() {
        let window = ShutterWindow {
            shutter_type: ShutterType::Event,
            time_window: [100.0, 200.0],
            time_shutter: [10.0, 30.0],
            event_window: [0, 3],
            event_shutter: [0, 3],
            ..ShutterWindow::default()
        };
        assert_eq!(
            window.spec(2.0),
            WindowSpec::EventIndex {
                left: 0,
                right: 3,
                center_t: 240.0,
            }
        );

        let events = events_at(&[0.0, 10.0, 20.0, 30.0]);
        let resolved = window.spec(1.0).resolve(&events).unwrap();
        assert_eq!(resolved.range, IndexRange::new(0, 3));
        assert_eq!(resolved.center_t, 120.0);
    }

    #[test]
    fn test_shutter_offsets_from_primary_left_edge() {
        let window = ShutterWindow {
            time_window: [100.0, 200.0],
            time_shutter: [10.0, 30.0],
            event_window: [5, 50],
            event_shutter: [2, 4],
            ..ShutterWindow::default()
        };
        assert_eq!(window.time_bounds(), (110.0, 130.0));
        assert_eq!(window.event_bounds(), (7, 9));
        assert_eq!(
            window.spec(1.0),
            WindowSpec::Time {
                left: 110.0,
                right: 130.0,
                norm_factor: 1.0
            }
        );
    }

    #[test]
    fn test_advance_moves_authoritative_window() {
        let mut window = ShutterWindow {
            time_window: [0.0, 10.0],
            event_window: [0, 9],
            ..ShutterWindow::default()
        };
        window.advance(5.0, 3);
        assert_eq!(window.time_window, [5.0, 15.0]);
        assert_eq!(window.event_window, [0, 9]);

        window.shutter_type = ShutterType::Event;
        window.advance(5.0, 3);
        assert_eq!(window.event_window, [3, 12]);
    }

    #[test]
    fn test_space_window_contains_edges() {
        let space = SpaceWindow::new(0.0, 10.0, 5.0, 2.0);
        assert!(space.contains(2.0, 0.0));
        assert!(space.contains(10.0, 5.0));
        assert!(!space.contains(1.9, 3.0));
        assert!(!space.contains(5.0, 5.1));
        assert!(SpaceWindow::unbounded().contains(1e6, -1e6));
    }

    #[test]
    fn test_time_unit_parsing() {
        assert_eq!("ms".parse::<TimeUnit>().unwrap(), TimeUnit::Milliseconds);
        assert_eq!("US".parse::<TimeUnit>().unwrap(), TimeUnit::Microseconds);
        assert!("minutes".parse::<TimeUnit>().is_err());
    }
}
