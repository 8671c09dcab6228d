//! Principal axes of an exposure.
//!
//! The means come from the running sums accumulated by the kernel, not from
//! the points, so they must be divided by the emitted count. Covariance uses
//! Bessel's correction and is reduced in parallel; results may differ from a
//! sequential sum by reordering error only.

use crate::shutter::ComputeOutput;
use crate::types::BoundingVolume;
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PcaError {
    #[error("PCA needs at least 2 points, got {0}")]
    InsufficientPoints(u32),

    #[error("covariance has no real eigenvalues (discriminant {discriminant})")]
    DegenerateCovariance { discriminant: f64 },
}

/// Sample covariance of the emitted (x, y) positions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Covariance {
    pub xx: f64,
    pub xy: f64,
    pub yy: f64,
}

/// Eigen-decomposition of the spatial covariance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrincipalAxes {
    pub mean: [f32; 2],
    pub covariance: Covariance,
    /// Major eigenvalue first.
    pub eigenvalues: [f32; 2],
    /// Unit eigenvectors scaled by the square root of their eigenvalue.
    pub axes: [[f32; 2]; 2],
}

/// Axis line segments in normalised device coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisIndicators {
    pub origin: [f32; 3],
    pub tips: [[f32; 3]; 2],
}

/// Computes the principal axes of `output`.
pub fn analyze(output: &ComputeOutput) -> Result<PrincipalAxes, PcaError> {
    let count = output.count.min(output.points.len() as u32);
    if count < 2 {
        return Err(PcaError::InsufficientPoints(count));
    }

    let n = count as f64;
    let mean_x = output.sum_x as f64 / n;
    let mean_y = output.sum_y as f64 / n;

    let (sxx, sxy, syy) = output.points[..count as usize]
        .par_iter()
        .map(|p| {
            let dx = p[0] as f64 - mean_x;
            let dy = p[1] as f64 - mean_y;
            (dx * dx, dx * dy, dy * dy)
        })
        .reduce(|| (0.0, 0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2));

    let bessel = 1.0 / (count as f64 - 1.0);
    let cov = Covariance {
        xx: sxx * bessel,
        xy: sxy * bessel,
        yy: syy * bessel,
    };

    // Discriminant of lambda^2 - trace lambda + det = 0, written as a sum of
    // squares so rounding cannot push it below zero.
    let trace = cov.xx + cov.yy;
    let discriminant = (cov.xx - cov.yy).powi(2) + 4.0 * cov.xy * cov.xy;
    if !discriminant.is_finite() || discriminant < 0.0 {
        return Err(PcaError::DegenerateCovariance { discriminant });
    }
    let root = discriminant.sqrt();
    let major = (trace + root) / 2.0;
    let minor = (trace - root) / 2.0;

    Ok(PrincipalAxes {
        mean: [mean_x as f32, mean_y as f32],
        covariance: cov,
        eigenvalues: [major as f32, minor as f32],
        axes: [
            scaled_eigenvector(&cov, major, [1.0, 0.0]),
            scaled_eigenvector(&cov, minor, [0.0, 1.0]),
        ],
    })
}

/// Solves `(cov_xx - l) vx + cov_xy vy = 0` for a unit vector, scaled by sqrt(l).
fn scaled_eigenvector(cov: &Covariance, lambda: f64, fallback: [f64; 2]) -> [f32; 2] {
    let candidates = [[lambda - cov.yy, cov.xy], [cov.xy, lambda - cov.xx]];
    let [vx, vy] = candidates
        .into_iter()
        .map(|v| (v, v[0].hypot(v[1])))
        .filter(|(_, norm)| *norm > f64::EPSILON * (1.0 + lambda.abs()))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(v, norm)| [v[0] / norm, v[1] / norm])
        .unwrap_or(fallback);

    let scale = lambda.max(0.0).sqrt();
    [(vx * scale) as f32, (vy * scale) as f32]
}

impl PrincipalAxes {
    /// Maps the mean and axis tips through the orthographic projection of
    /// the bounds' x/y extent onto `[-1, 1]`.
    pub fn project(&self, bounds: &BoundingVolume) -> AxisIndicators {
        let span = |axis: usize| {
            let extent = bounds.max[axis] - bounds.min[axis];
            if extent.abs() > f32::EPSILON {
                extent
            } else {
                1.0
            }
        };
        let (w, h) = (span(0), span(1));
        let origin = [
            2.0 * (self.mean[0] - bounds.min[0]) / w - 1.0,
            2.0 * (self.mean[1] - bounds.min[1]) / h - 1.0,
            0.0,
        ];
        let tip = |axis: [f32; 2]| {
            [
                origin[0] + 2.0 * axis[0] / w,
                origin[1] + 2.0 * axis[1] / h,
                0.0,
            ]
        };
        AxisIndicators {
            origin,
            tips: [tip(self.axes[0]), tip(self.axes[1])],
        }
    }
}
