//! Core event and geometry types.
//!
//! A [`RawEvent`] is what a recording source produces: integer pixel
//! coordinates, a 64-bit clock tick and a polarity bit. Once ingested into an
//! [`EventStore`](crate::store::EventStore) every event is converted to the
//! packed [`Event`] form that the compute backends consume directly.

use bytemuck::{Pod, Zeroable};

/// An event as produced by a recording source.
///
/// Timestamps are kept as signed 64-bit ticks (microseconds for every source
/// in this crate) so no precision is lost before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// Pixel column
    pub x: u16,
    /// Pixel row
    pub y: u16,
    /// true = ON (brightness increase), false = OFF
    pub polarity: bool,
    /// Timestamp in clock ticks
    pub timestamp: i64,
}

impl RawEvent {
    /// Creates a new raw event.
    #[inline]
    pub fn new(x: u16, y: u16, polarity: bool, timestamp: i64) -> Self {
        Self {
            x,
            y,
            polarity,
            timestamp,
        }
    }
}

/// A stored event in normalized form: `(x, y, t_scaled, polarity)`.
///
/// The layout is four packed `f32`s so that a slice of events can be uploaded
/// verbatim as a `vec4<f32>` storage buffer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Event {
    pub x: f32,
    pub y: f32,
    /// Scaled (or stream-relative) time
    pub t: f32,
    /// 1.0 for ON events, 0.0 for OFF events
    pub p: f32,
}

impl Event {
    #[inline]
    pub fn new(x: f32, y: f32, t: f32, polarity: bool) -> Self {
        Self {
            x,
            y,
            t,
            p: if polarity { 1.0 } else { 0.0 },
        }
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.p >= 0.5
    }
}

/// Sensor resolution reported by a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Sensor width in pixels
    pub width: u32,
    /// Sensor height in pixels
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        // Gen4 sensor geometry (1280x720)
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Axis-aligned bounds of the stored events, with z being scaled time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingVolume {
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub center: [f32; 3],
}

impl BoundingVolume {
    /// Bounds that any point will shrink on the first [`include`](Self::include).
    pub fn inverted() -> Self {
        Self {
            min: [f32::MAX; 3],
            max: [f32::MIN; 3],
            center: [0.0; 3],
        }
    }

    /// All-zero bounds, used for the empty scene.
    pub fn zero() -> Self {
        Self {
            min: [0.0; 3],
            max: [0.0; 3],
            center: [0.0; 3],
        }
    }

    /// Grows the bounds componentwise to contain `point`.
    #[inline]
    pub fn include(&mut self, point: [f32; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(point[axis]);
            self.max[axis] = self.max[axis].max(point[axis]);
        }
    }

    /// Multiplies the time (z) extent by `factor` and refreshes the center.
    pub fn scale_time(&mut self, factor: f32) {
        self.min[2] *= factor;
        self.max[2] *= factor;
        self.refresh_center();
    }

    pub fn refresh_center(&mut self) {
        for axis in 0..3 {
            self.center[axis] = 0.5 * (self.min[axis] + self.max[axis]);
        }
    }
}

impl Default for BoundingVolume {
    fn default() -> Self {
        Self::inverted()
    }
}

/// An inclusive event-index range `[left, right]`.
///
/// `left > right` is a valid value and denotes an empty range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRange {
    pub left: u32,
    pub right: u32,
}

impl IndexRange {
    pub fn new(left: u32, right: u32) -> Self {
        Self { left, right }
    }

    /// A canonical empty range.
    pub fn empty() -> Self {
        Self { left: 1, right: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.left > self.right
    }

    /// Number of indices covered.
    #[inline]
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.right - self.left) as usize + 1
        }
    }

    /// Restricts the range to indices below `count`.
    pub fn clamp_to(&self, count: usize) -> Self {
        if count == 0 {
            return Self::empty();
        }
        let last = (count - 1).min(u32::MAX as usize) as u32;
        Self {
            left: self.left,
            right: self.right.min(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_polarity_encoding() {
        let on = Event::new(1.0, 2.0, 3.0, true);
        let off = Event::new(1.0, 2.0, 3.0, false);
        assert_eq!(on.p, 1.0);
        assert_eq!(off.p, 0.0);
        assert!(on.is_positive());
        assert!(!off.is_positive());
    }

    #[test]
    fn test_event_is_four_packed_floats() {
        assert_eq!(std::mem::size_of::<Event>(), 16);
        let events = [Event::new(1.0, 2.0, 3.0, true)];
        let floats: &[f32] = bytemuck::cast_slice(&events);
        assert_eq!(floats, &[1.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn test_bounding_volume_include() {
        let mut bounds = BoundingVolume::inverted();
        bounds.include([1.0, 5.0, 0.0]);
        bounds.include([3.0, 2.0, 10.0]);
        bounds.refresh_center();
        assert_eq!(bounds.min, [1.0, 2.0, 0.0]);
        assert_eq!(bounds.max, [3.0, 5.0, 10.0]);
        assert_eq!(bounds.center, [2.0, 3.5, 5.0]);
    }

    #[test]
    fn test_index_range_empty_and_clamp() {
        assert!(IndexRange::empty().is_empty());
        assert_eq!(IndexRange::new(3, 1).len(), 0);
        assert_eq!(IndexRange::new(1, 2).len(), 2);
        assert_eq!(IndexRange::new(0, 100).clamp_to(4), IndexRange::new(0, 3));
        assert!(IndexRange::new(0, 100).clamp_to(0).is_empty());
    }
}
