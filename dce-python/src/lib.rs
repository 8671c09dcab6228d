//! Python bindings for digital coded exposure with numpy support.
//!
//! Exposes a `Scene` (loaded recording, shutter window and exposure) and a
//! `Stream` (bounded incremental ingestion). Exposures run on the host
//! backend.

use dce_core::{
    analyze, open_path, ComputeOutput, Contribution, EventStore, HostBackend, IngestState, LoadOptions,
    Scene as CoreScene, ShutterCompute, ShutterType, SpaceWindow, StepOutcome, StepParams,
    StreamIngestor, TimeDomain, TimeUnit,
};
use numpy::{IntoPyArray, PyArray2};
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::str::FromStr;

fn value_err(err: impl std::fmt::Display) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn runtime_err(err: impl std::fmt::Display) -> PyErr {
    PyRuntimeError::new_err(err.to_string())
}

/// Flattens `rows` into an `(N, W)` float32 array.
fn rows_to_array<'py, const W: usize>(
    py: Python<'py>,
    rows: &[[f32; W]],
) -> PyResult<&'py PyArray2<f32>> {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    flat.into_pyarray(py).reshape([rows.len(), W])
}

/// A loaded recording with its shutter window.
///
/// Time-valued window fields are in scaled store time until `set_unit` is
/// called with "us", "ms" or "s".
#[pyclass(name = "Scene")]
pub struct PyScene {
    scene: CoreScene,
    compute: ShutterCompute<HostBackend>,
    contribution: Contribution,
    last: Option<ComputeOutput>,
}

impl PyScene {
    fn from_scene(scene: CoreScene) -> PyResult<Self> {
        let mut compute = ShutterCompute::new(HostBackend::new());
        compute.bind(scene.store().events()).map_err(runtime_err)?;
        Ok(Self {
            scene,
            compute,
            contribution: Contribution::default(),
            last: None,
        })
    }
}

#[pymethods]
impl PyScene {
    /// Loads `path` (.raw or .csv), or creates an empty scene.
    #[new]
    #[pyo3(signature = (path=None, mod_freq=1, time_span=5000.0))]
    fn new(path: Option<&str>, mod_freq: u32, time_span: f64) -> PyResult<Self> {
        let Some(path) = path else {
            return Self::from_scene(CoreScene::empty());
        };
        let options = LoadOptions {
            mod_freq,
            time_span,
        };
        let mut source = open_path(path).map_err(|e| PyIOError::new_err(e.to_string()))?;
        let store = EventStore::load_source(&mut source, options).map_err(value_err)?;
        Self::from_scene(CoreScene::new(store))
    }

    fn __len__(&self) -> usize {
        self.scene.store().len()
    }

    fn __repr__(&self) -> String {
        let res = self.scene.store().resolution();
        format!(
            "Scene(events={}, sensor={}x{})",
            self.scene.store().len(),
            res.width,
            res.height
        )
    }

    /// Back to the empty scene.
    fn reset(&mut self) -> PyResult<()> {
        *self = Self::from_scene(CoreScene::empty())?;
        Ok(())
    }

    #[getter]
    fn sensor_size(&self) -> (u32, u32) {
        let res = self.scene.store().resolution();
        (res.width, res.height)
    }

    #[getter]
    fn diff_scale(&self) -> f32 {
        self.scene.store().diff_scale()
    }

    /// Bounding volume as ((min_x, min_y, min_t), (max_x, max_y, max_t)).
    #[getter]
    fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        let bounds = self.scene.store().bounds();
        (bounds.min, bounds.max)
    }

    /// Events as an (N, 4) array of x, y, t, polarity.
    #[getter]
    fn events<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f32>> {
        let rows: Vec<[f32; 4]> = self
            .scene
            .store()
            .events()
            .iter()
            .map(|e| [e.x, e.y, e.t, e.p])
            .collect();
        rows_to_array(py, &rows)
    }

    /// Current time unit: "scaled", "us", "ms" or "s".
    #[getter]
    fn unit(&self) -> &'static str {
        match self.scene.domain() {
            TimeDomain::Scaled => "scaled",
            TimeDomain::Unit(unit) => unit.suffix(),
        }
    }

    /// Converts window fields to `unit`, or back to scaled time for None.
    #[pyo3(signature = (unit=None))]
    fn set_unit(&mut self, unit: Option<&str>) -> PyResult<()> {
        match unit {
            Some(name) => self
                .scene
                .oddize_time(TimeUnit::from_str(name).map_err(PyValueError::new_err)?),
            None => self.scene.normalize_time(),
        }
        Ok(())
    }

    fn first_event(&self, t: f32) -> PyResult<usize> {
        self.scene.first_event(t).map_err(value_err)
    }

    fn last_event(&self, t: f32) -> PyResult<usize> {
        self.scene.last_event(t).map_err(value_err)
    }

    fn timestamp(&self, index: usize) -> PyResult<f32> {
        self.scene.timestamp(index).map_err(value_err)
    }

    /// "time" or "event".
    #[getter]
    fn shutter_type(&self) -> &'static str {
        match self.scene.window().shutter_type {
            ShutterType::Time => "time",
            ShutterType::Event => "event",
        }
    }

    #[setter]
    fn set_shutter_type(&mut self, value: &str) -> PyResult<()> {
        self.scene.window_mut().shutter_type = match value {
            "time" => ShutterType::Time,
            "event" => ShutterType::Event,
            other => return Err(value_err(format!("unknown shutter type {:?}", other))),
        };
        Ok(())
    }

    #[getter]
    fn time_window(&self) -> (f32, f32) {
        let [l, r] = self.scene.window().time_window;
        (l, r)
    }

    #[setter]
    fn set_time_window(&mut self, value: (f32, f32)) {
        self.scene.window_mut().time_window = [value.0, value.1];
    }

    /// Shutter offsets relative to the time window's left edge.
    #[getter]
    fn time_shutter(&self) -> (f32, f32) {
        let [l, r] = self.scene.window().time_shutter;
        (l, r)
    }

    #[setter]
    fn set_time_shutter(&mut self, value: (f32, f32)) {
        self.scene.window_mut().time_shutter = [value.0, value.1];
    }

    #[getter]
    fn event_window(&self) -> (u32, u32) {
        let [l, r] = self.scene.window().event_window;
        (l, r)
    }

    #[setter]
    fn set_event_window(&mut self, value: (u32, u32)) {
        self.scene.window_mut().event_window = [value.0, value.1];
    }

    #[getter]
    fn event_shutter(&self) -> (u32, u32) {
        let [l, r] = self.scene.window().event_shutter;
        (l, r)
    }

    #[setter]
    fn set_event_shutter(&mut self, value: (u32, u32)) {
        self.scene.window_mut().event_shutter = [value.0, value.1];
    }

    /// Space window as (top, right, bottom, left).
    #[getter]
    fn space_window(&self) -> (f32, f32, f32, f32) {
        let s = self.scene.window().space_window;
        (s.top, s.right, s.bottom, s.left)
    }

    #[setter]
    fn set_space_window(&mut self, value: (f32, f32, f32, f32)) {
        self.scene.window_mut().space_window = SpaceWindow::new(value.0, value.1, value.2, value.3);
    }

    #[getter]
    fn positive_only(&self) -> bool {
        self.scene.window().positive_only
    }

    #[setter]
    fn set_positive_only(&mut self, value: bool) {
        self.scene.window_mut().positive_only = value;
    }

    /// Slides the window forward by one period.
    #[pyo3(signature = (time_period=0.0, event_period=0))]
    fn advance(&mut self, time_period: f32, event_period: u32) {
        self.scene.window_mut().advance(time_period, event_period);
    }

    /// Uses a constant weight per exposed event.
    #[pyo3(signature = (contribution=1.0))]
    fn set_base(&mut self, contribution: f32) -> PyResult<()> {
        let contribution = Contribution::Base { contribution };
        contribution.validate().map_err(value_err)?;
        self.contribution = contribution;
        Ok(())
    }

    /// Uses a Morlet wavelet centered on the shutter.
    fn set_morlet(&mut self, freq_hz: f32, h: f32) -> PyResult<()> {
        let contribution = Contribution::Morlet { freq_hz, h };
        contribution.validate().map_err(value_err)?;
        self.contribution = contribution;
        Ok(())
    }

    /// Runs one exposure over the current window.
    ///
    /// Returns a dict with `points` ((N, 3) array of x, y, weight),
    /// `count`, `sum_x` and `sum_y`.
    fn expose<'py>(&mut self, py: Python<'py>) -> PyResult<&'py PyDict> {
        let request = self.scene.exposure_request(self.contribution);
        self.compute.run(&request).map_err(runtime_err)?;
        let output = self.compute.snapshot().map_err(runtime_err)?;

        let dict = PyDict::new(py);
        dict.set_item("points", rows_to_array(py, &output.points)?)?;
        dict.set_item("count", output.count)?;
        dict.set_item("sum_x", output.sum_x)?;
        dict.set_item("sum_y", output.sum_y)?;
        dict.set_item("range", (request.range.left, request.range.right))?;
        self.last = Some(output);
        Ok(dict)
    }

    /// Principal axes of the last exposure.
    ///
    /// Returns a dict with `mean`, `eigenvalues`, `axes` (scaled by the
    /// square root of each eigenvalue) and `ndc` (origin and tips projected
    /// onto the scene bounds).
    fn pca<'py>(&self, py: Python<'py>) -> PyResult<&'py PyDict> {
        let output = self
            .last
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("no exposure has been run"))?;
        let axes = analyze(output).map_err(value_err)?;
        let ndc = axes.project(self.scene.store().bounds());

        let dict = PyDict::new(py);
        dict.set_item("mean", axes.mean)?;
        dict.set_item("eigenvalues", axes.eigenvalues)?;
        dict.set_item("axes", axes.axes)?;
        dict.set_item("ndc", (ndc.origin, ndc.tips))?;
        Ok(dict)
    }
}

/// Bounded incremental ingestion of a recording.
#[pyclass(name = "Stream", unsendable)]
pub struct PyStream {
    ingestor: StreamIngestor,
}

#[pymethods]
impl PyStream {
    #[new]
    fn new(path: &str) -> PyResult<Self> {
        let mut ingestor = StreamIngestor::new();
        ingestor
            .open_file(path)
            .map_err(|e| PyIOError::new_err(e.to_string()))?;
        Ok(Self { ingestor })
    }

    fn __len__(&self) -> usize {
        self.ingestor.buffer().len()
    }

    /// "idle", "streaming", "paused" or "finished".
    #[getter]
    fn state(&self) -> &'static str {
        match self.ingestor.state() {
            IngestState::Idle => "idle",
            IngestState::Streaming => "streaming",
            IngestState::Paused => "paused",
            IngestState::Finished => "finished",
        }
    }

    /// Advances by one tick. Returns "continuing", "first_batch" or "finished".
    #[pyo3(signature = (max_z=100.0, pause=false, time_density=None))]
    fn step(&mut self, max_z: f64, pause: bool, time_density: Option<f64>) -> PyResult<&'static str> {
        let params = StepParams {
            max_z,
            pause,
            time_density,
        };
        let outcome = self.ingestor.step(&params).map_err(runtime_err)?;
        Ok(match outcome {
            StepOutcome::Continuing => "continuing",
            StepOutcome::FirstBatch => "first_batch",
            StepOutcome::Finished => "finished",
        })
    }

    /// Copy of the buffered events as an (N, 4) array of x, y, t (ms), polarity.
    ///
    /// Only allowed while paused or finished.
    fn snapshot<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f32>> {
        let snapshot = self.ingestor.snapshot().map_err(runtime_err)?;
        let rows: Vec<[f32; 4]> = snapshot.events.iter().map(|e| [e.x, e.y, e.t, e.p]).collect();
        rows_to_array(py, &rows)
    }
}

/// Digital coded exposure module for Python.
#[pymodule]
fn dce(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyScene>()?;
    m.add_class::<PyStream>()?;
    Ok(())
}
