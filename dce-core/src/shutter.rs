//! Digital coded exposure.
//!
//! [`ShutterCompute`] drives a [`ComputeBackend`] through one
//! filter-weight-accumulate pass per exposure: every event in the resolved
//! index range that lies inside the space window and passes the polarity
//! filter is weighted by the active [`Contribution`] and appended to the
//! output arena at a slot taken from an atomic cursor. The x and y coordinates
//! of emitted points are summed alongside; the sums are unweighted.
//!
//! Emission order is unspecified. Nothing downstream depends on it.

use crate::contribution::{morlet, Contribution, ContributionError};
use crate::types::{Event, IndexRange};
use crate::window::SpaceWindow;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;
use tracing::debug;

/// Invocations per workgroup.
pub const WORKGROUP_SIZE: u32 = 256;

/// Errors reported by a compute backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("no compatible GPU adapter was found")]
    NoAdapter,

    #[error("failed to acquire GPU device: {0}")]
    RequestDevice(String),

    #[error("failed to build exposure kernel: {0}")]
    KernelBuild(String),

    #[error("kernel dispatch failed: {0}")]
    Dispatch(String),

    #[error("failed to map GPU buffer for readback")]
    Map,

    #[error("no event buffer has been uploaded")]
    NotUploaded,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid contribution: {0}")]
    InvalidContribution(#[from] ContributionError),
}

/// Uniform block handed to the kernel.
///
/// Field order matches the `Params` struct of the WGSL kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct KernelParams {
    /// `(top, right, bottom, left)`
    pub space_window: [f32; 4],
    pub event_bound_l: u32,
    pub event_bound_r: u32,
    pub is_positive_only: u32,
    pub use_morlet: u32,
    pub morlet_freq: f32,
    pub morlet_center_t: f32,
    pub morlet_h: f32,
    pub base_contribution: f32,
}

impl KernelParams {
    pub fn new(request: &ExposureRequest) -> Self {
        let mut params = KernelParams {
            space_window: request.space.to_array(),
            event_bound_l: request.range.left,
            event_bound_r: request.range.right,
            is_positive_only: request.positive_only as u32,
            morlet_center_t: request.center_t,
            ..KernelParams::default()
        };
        match request.contribution {
            Contribution::Base { contribution } => params.base_contribution = contribution,
            Contribution::Morlet { h, .. } => {
                params.use_morlet = 1;
                params.morlet_freq = request.contribution.scaled_frequency(request.diff_scale);
                params.morlet_h = h;
            }
        }
        params
    }

    /// Spatial and polarity filters.
    #[inline]
    pub fn admits(&self, event: &Event) -> bool {
        let [top, right, bottom, left] = self.space_window;
        left <= event.x
            && event.x <= right
            && top <= event.y
            && event.y <= bottom
            && (self.is_positive_only == 0 || event.is_positive())
    }

    /// Weight of an admitted event at scaled time `t`.
    #[inline]
    pub fn weight(&self, t: f32) -> f32 {
        if self.use_morlet != 0 {
            morlet(t - self.morlet_center_t, self.morlet_freq, self.morlet_h)
        } else {
            self.base_contribution
        }
    }
}

/// Scalars read back after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Counters {
    pub count: u32,
    pub sum_x: f32,
    pub sum_y: f32,
}

/// The collaborator that stores buffers and runs the kernel.
///
/// Buffer contents must not be read until [`ComputeBackend::barrier`] has
/// returned after the last dispatch.
pub trait ComputeBackend {
    fn name(&self) -> &'static str;

    /// Uploads `events` as the read-only input and sizes the output arena to
    /// match. Buffers are reused when the length is unchanged.
    fn upload(&mut self, events: &[Event]) -> Result<(), BackendError>;

    /// Zeroes the counters and dispatches `workgroups` groups of
    /// [`WORKGROUP_SIZE`] invocations.
    fn dispatch(&mut self, params: &KernelParams, workgroups: u32) -> Result<(), BackendError>;

    /// Blocks until every write of the last dispatch is visible.
    fn barrier(&mut self) -> Result<(), BackendError>;

    fn read_counters(&mut self) -> Result<Counters, BackendError>;

    /// Reads the first `count` `(x, y, weight)` triples of the arena.
    fn read_points(&mut self, count: u32) -> Result<Vec<[f32; 3]>, BackendError>;

    /// Drops every buffer held by the backend.
    fn release(&mut self);
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn upload(&mut self, events: &[Event]) -> Result<(), BackendError> {
        (**self).upload(events)
    }

    fn dispatch(&mut self, params: &KernelParams, workgroups: u32) -> Result<(), BackendError> {
        (**self).dispatch(params, workgroups)
    }

    fn barrier(&mut self) -> Result<(), BackendError> {
        (**self).barrier()
    }

    fn read_counters(&mut self) -> Result<Counters, BackendError> {
        (**self).read_counters()
    }

    fn read_points(&mut self, count: u32) -> Result<Vec<[f32; 3]>, BackendError> {
        (**self).read_points(count)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Everything one exposure needs, with the window already resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureRequest {
    pub range: IndexRange,
    /// Scaled time at the shutter center.
    pub center_t: f32,
    pub space: SpaceWindow,
    pub positive_only: bool,
    pub contribution: Contribution,
    /// Scaled units per raw tick of the bound events.
    pub diff_scale: f32,
}

/// Scalars of the last exposure.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ComputeSummary {
    pub count: u32,
    pub sum_x: f32,
    pub sum_y: f32,
    /// False when the exposure was a no-op.
    pub dispatched: bool,
}

/// A point-in-time copy of the output arena.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComputeOutput {
    /// `(x, y, weight)` per emitted event, unordered.
    pub points: Vec<[f32; 3]>,
    pub count: u32,
    pub sum_x: f32,
    pub sum_y: f32,
}

impl ComputeOutput {
    /// Mean position from the running sums.
    pub fn mean(&self) -> Option<[f32; 2]> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f32;
        Some([self.sum_x / n, self.sum_y / n])
    }

    /// Sum of the weights of all emitted points.
    pub fn total_weight(&self) -> f64 {
        self.points.iter().map(|p| p[2] as f64).sum()
    }
}

/// Owns the backend buffers and runs exposures against them.
pub struct ShutterCompute<B> {
    backend: B,
    bound_len: Option<usize>,
    last: ComputeSummary,
}

impl<B: ComputeBackend> ShutterCompute<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            bound_len: None,
            last: ComputeSummary::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of events currently uploaded.
    pub fn bound_len(&self) -> Option<usize> {
        self.bound_len
    }

    /// Uploads `events` as the input of every following exposure.
    pub fn bind(&mut self, events: &[Event]) -> Result<(), ComputeError> {
        if self.bound_len != Some(events.len()) {
            debug!(
                backend = self.backend.name(),
                from = ?self.bound_len,
                to = events.len(),
                "resizing exposure buffers"
            );
        }
        self.backend.upload(events)?;
        self.bound_len = Some(events.len());
        self.last = ComputeSummary::default();
        Ok(())
    }

    /// Runs one exposure and blocks until its scalars are readable.
    ///
    /// An empty input or an empty range is a no-op with a zero count.
    pub fn run(&mut self, request: &ExposureRequest) -> Result<ComputeSummary, ComputeError> {
        request.contribution.validate()?;
        let len = self.bound_len.ok_or(BackendError::NotUploaded)?;

        let range = request.range.clamp_to(len);
        if len == 0 || range.is_empty() {
            self.last = ComputeSummary::default();
            return Ok(self.last);
        }

        let params = KernelParams::new(&ExposureRequest {
            range,
            ..*request
        });
        let workgroups = (len as u32).div_ceil(WORKGROUP_SIZE);
        debug!(
            backend = self.backend.name(),
            left = range.left,
            right = range.right,
            workgroups,
            "dispatching exposure"
        );

        self.backend.dispatch(&params, workgroups)?;
        self.backend.barrier()?;
        let counters = self.backend.read_counters()?;

        self.last = ComputeSummary {
            count: counters.count,
            sum_x: counters.sum_x,
            sum_y: counters.sum_y,
            dispatched: true,
        };
        Ok(self.last)
    }

    /// Summary of the last exposure.
    pub fn summary(&self) -> ComputeSummary {
        self.last
    }

    /// Copies the emitted points of the last exposure.
    pub fn snapshot(&mut self) -> Result<ComputeOutput, ComputeError> {
        let points = if self.last.count == 0 {
            Vec::new()
        } else {
            self.backend.read_points(self.last.count)?
        };
        Ok(ComputeOutput {
            points,
            count: self.last.count,
            sum_x: self.last.sum_x,
            sum_y: self.last.sum_y,
        })
    }

    /// Drops the uploaded buffers.
    pub fn release(&mut self) {
        self.backend.release();
        self.bound_len = None;
        self.last = ComputeSummary::default();
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}
