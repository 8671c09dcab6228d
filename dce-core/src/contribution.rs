//! Per-event contribution functions.

use serde::{Deserialize, Serialize};
use std::f32::consts::{LN_2, PI};
use thiserror::Error;

/// Raw clock ticks per second.
const TICKS_PER_SECOND: f32 = 1_000_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContributionError {
    #[error("Morlet width must be positive and finite, got {0}")]
    InvalidWidth(f32),

    #[error("Morlet frequency must be finite, got {0}")]
    InvalidFrequency(f32),

    #[error("base contribution must be finite, got {0}")]
    InvalidWeight(f32),
}

/// The weighting applied to every event that passes the filters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Contribution {
    /// Constant weight.
    Base { contribution: f32 },
    /// Gaussian-windowed cosine centred on the shutter.
    ///
    /// `freq_hz` is in cycles per second of recording time, `h` is the full
    /// width at half maximum of the envelope in scaled time units.
    Morlet { freq_hz: f32, h: f32 },
}

impl Default for Contribution {
    fn default() -> Self {
        Contribution::Base { contribution: 1.0 }
    }
}

impl Contribution {
    pub fn validate(&self) -> Result<(), ContributionError> {
        match *self {
            Contribution::Base { contribution } if !contribution.is_finite() => {
                Err(ContributionError::InvalidWeight(contribution))
            }
            Contribution::Morlet { freq_hz, .. } if !freq_hz.is_finite() => {
                Err(ContributionError::InvalidFrequency(freq_hz))
            }
            Contribution::Morlet { h, .. } if !(h.is_finite() && h > 0.0) => {
                Err(ContributionError::InvalidWidth(h))
            }
            _ => Ok(()),
        }
    }

    pub fn is_morlet(&self) -> bool {
        matches!(self, Contribution::Morlet { .. })
    }

    /// Frequency in cycles per scaled time unit.
    pub fn scaled_frequency(&self, diff_scale: f32) -> f32 {
        match *self {
            Contribution::Morlet { freq_hz, .. } if diff_scale > 0.0 => {
                freq_hz / TICKS_PER_SECOND / diff_scale
            }
            _ => 0.0,
        }
    }
}

/// Windowed cosine `cos(2 pi f dt) * exp(-4 ln2 dt^2 / h^2)`.
#[inline]
pub fn morlet(dt: f32, freq: f32, h: f32) -> f32 {
    (2.0 * PI * freq * dt).cos() * (-4.0 * LN_2 * dt * dt / (h * h)).exp()
}
