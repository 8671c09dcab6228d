//! Query surface for the presentation layer.
//!
//! A [`Scene`] pairs an [`EventStore`] with the [`ShutterWindow`] being edited
//! and tracks the unit its time-valued fields are expressed in. Events on the
//! compute side always stay in scaled time; only the window fields and the
//! bounds are converted, and lookups multiply back by the norm factor.

use crate::contribution::Contribution;
use crate::index::IndexError;
use crate::shutter::ExposureRequest;
use crate::store::EventStore;
use crate::window::{ResolvedWindow, ShutterWindow, TimeUnit};

/// Unit of the window's time-valued fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeDomain {
    /// Scaled store time.
    #[default]
    Scaled,
    /// Real time in the given unit.
    Unit(TimeUnit),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    store: EventStore,
    window: ShutterWindow,
    domain: TimeDomain,
}

impl Default for Scene {
    fn default() -> Self {
        Self::empty()
    }
}

impl Scene {
    /// A scene over [`EventStore::empty_scene`] with a unit time window.
    pub fn empty() -> Self {
        let window = ShutterWindow {
            time_window: [0.0, 1.0],
            time_shutter: [0.0, 1.0],
            ..ShutterWindow::default()
        };
        Self {
            store: EventStore::empty_scene(),
            window,
            domain: TimeDomain::Scaled,
        }
    }

    /// A scene with the window fitted to `store`.
    pub fn new(store: EventStore) -> Self {
        let window = ShutterWindow::covering(&store);
        Self {
            store,
            window,
            domain: TimeDomain::Scaled,
        }
    }

    #[inline]
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    #[inline]
    pub fn window(&self) -> &ShutterWindow {
        &self.window
    }

    /// Window fields are interpreted in [`Scene::domain`] units.
    #[inline]
    pub fn window_mut(&mut self) -> &mut ShutterWindow {
        &mut self.window
    }

    #[inline]
    pub fn domain(&self) -> TimeDomain {
        self.domain
    }

    /// Multiplier taking current window units to scaled time.
    pub fn norm_factor(&self) -> f32 {
        match self.domain {
            TimeDomain::Scaled => 1.0,
            TimeDomain::Unit(unit) => self.store.diff_scale() * unit.ticks_per_unit(),
        }
    }

    /// Time of event `index` in current window units.
    pub fn timestamp(&self, index: usize) -> Result<f32, IndexError> {
        self.store.index()?.timestamp(index, self.norm_factor())
    }

    /// First event at or after `t` (current window units).
    pub fn first_event(&self, t: f32) -> Result<usize, IndexError> {
        Ok(self.store.index()?.first_at_or_after(t, self.norm_factor()))
    }

    /// Last event at or before `t` (current window units).
    pub fn last_event(&self, t: f32) -> Result<usize, IndexError> {
        Ok(self.store.index()?.last_at_or_before(t, self.norm_factor()))
    }

    /// Converts every time-valued field back to scaled time.
    pub fn normalize_time(&mut self) {
        let factor = self.norm_factor();
        if self.domain != TimeDomain::Scaled {
            self.scale_time(factor);
            self.domain = TimeDomain::Scaled;
        }
    }

    /// Converts every time-valued field from scaled time into `unit`.
    ///
    /// Switching from one unit to another goes through scaled time.
    pub fn oddize_time(&mut self, unit: TimeUnit) {
        if self.domain == TimeDomain::Unit(unit) {
            return;
        }
        self.normalize_time();
        let factor = self.store.diff_scale() * unit.ticks_per_unit();
        if factor > 0.0 && factor.is_finite() {
            self.scale_time(factor.recip());
            self.domain = TimeDomain::Unit(unit);
        }
    }

    fn scale_time(&mut self, factor: f32) {
        self.window.scale_time(factor);
        self.store.scale_time_bounds(factor);
    }

    /// Resolves the authoritative window to an index range.
    ///
    /// An empty store resolves to the empty range.
    pub fn resolve(&self) -> ResolvedWindow {
        let spec = self.window.spec(self.norm_factor());
        match spec.resolve(self.store.events()) {
            Ok(resolved) => resolved,
            Err(_) => ResolvedWindow::empty(),
        }
    }

    /// Builds the exposure request for the current window.
    pub fn exposure_request(&self, contribution: Contribution) -> ExposureRequest {
        let resolved = self.resolve();
        ExposureRequest {
            range: resolved.range,
            center_t: resolved.center_t,
            space: self.window.space_window,
            positive_only: self.window.positive_only,
            contribution,
            diff_scale: self.store.diff_scale(),
        }
    }

    /// Replaces the store and refits the window.
    pub fn load(&mut self, store: EventStore) {
        *self = Self::new(store);
    }

    /// Back to the empty scene.
    pub fn reset(&mut self) {
        *self = Self::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LoadOptions;
    use crate::types::{RawEvent, Resolution};
    use crate::window::ShutterType;
    use approx::assert_relative_eq;

    fn store() -> EventStore {
        // 3 ms of recording mapped onto 30 scaled units.
        let raw = [0, 1000, 2000, 3000]
            .iter()
            .enumerate()
            .map(|(i, &t)| RawEvent::new(i as u16, i as u16, i % 2 == 0, t));
        let options = LoadOptions {
            time_span: 30.0,
            ..LoadOptions::default()
        };
        EventStore::load(raw, Resolution::default(), options).unwrap()
    }

    #[test]
    fn test_window_fitted_on_load() {
        let scene = Scene::new(store());
        let window = scene.window();
        assert_eq!(window.time_window, [0.0, 30.0]);
        assert_eq!(window.event_window, [0, 3]);
        assert_eq!(window.time_shutter, [0.0, 30.0]);
        assert_eq!(window.space_window.right, 3.0);
        assert_eq!(scene.resolve().range.len(), 4);
    }

    #[test]
    fn test_queries_in_scaled_time() {
        let scene = Scene::new(store());
        assert_eq!(scene.first_event(5.0).unwrap(), 1);
        assert_eq!(scene.last_event(25.0).unwrap(), 2);
        assert_eq!(scene.timestamp(2).unwrap(), 20.0);
    }

    #[test]
    fn test_queries_in_milliseconds() {
        let mut scene = Scene::new(store());
        scene.oddize_time(TimeUnit::Milliseconds);
        assert_relative_eq!(scene.timestamp(2).unwrap(), 2.0, epsilon = 1e-5);
        assert_eq!(scene.first_event(0.5).unwrap(), 1);
        assert_eq!(scene.last_event(2.5).unwrap(), 2);
        assert_relative_eq!(scene.window().time_window[1], 3.0, epsilon = 1e-5);
        assert_relative_eq!(scene.store().bounds().max[2], 3.0, epsilon = 1e-5);
    }

    #[test]
    fn test_normalize_inverts_oddize() {
        let mut scene = Scene::new(store());
        scene.window_mut().time_window = [3.7, 21.3];
        scene.window_mut().time_shutter = [1.1, 9.9];
        let before = scene.clone();

        for unit in [TimeUnit::Seconds, TimeUnit::Microseconds, TimeUnit::Milliseconds] {
            scene.oddize_time(unit);
        }
        scene.normalize_time();

        assert_eq!(scene.domain(), TimeDomain::Scaled);
        for (a, b) in scene
            .window()
            .time_window
            .iter()
            .chain(&scene.window().time_shutter)
            .zip(before.window().time_window.iter().chain(&before.window().time_shutter))
        {
            assert_relative_eq!(*a, *b, max_relative = 1e-5);
        }
        assert_relative_eq!(
            scene.store().bounds().max[2],
            before.store().bounds().max[2],
            max_relative = 1e-5
        );
    }

    #[test]
    fn test_exposure_request_for_event_window() {
        let mut scene = Scene::new(store());
        let window = scene.window_mut();
        window.shutter_type = ShutterType::Event;
        window.event_window = [1, 3];
        window.event_shutter = [0, 1];
        let request = scene.exposure_request(Contribution::default());
        assert_eq!((request.range.left, request.range.right), (1, 2));
        assert_eq!(request.center_t, 15.0);
    }

    #[test]
    fn test_empty_scene_is_safe() {
        let scene = Scene::empty();
        assert_eq!(scene.window().time_window, [0.0, 1.0]);
        assert_eq!(scene.first_event(0.0), Err(IndexError::EmptyStore));
        assert!(scene.exposure_request(Contribution::default()).range.is_empty());
    }

    #[test]
    fn test_reset() {
        let mut scene = Scene::new(store());
        scene.oddize_time(TimeUnit::Seconds);
        scene.reset();
        assert_eq!(scene, Scene::empty());
    }
}
