//! TOML configuration for exposures and streaming.
//!
//! ```toml
//! pca = true
//!
//! [load]
//! mod_freq = 2
//! time_span = 5000.0
//!
//! [shutter]
//! mode = "time"
//! unit = "ms"
//! time_window = [0.0, 40.0]
//! time_shutter = [10.0, 20.0]
//! positive_only = true
//!
//! [contribution]
//! kind = "morlet"
//! freq_hz = 100.0
//! h = 250.0
//!
//! [stream]
//! max_z = 50.0
//! time_density = 20.0
//! ```

use crate::contribution::Contribution;
use crate::scene::Scene;
use crate::store::LoadOptions;
use crate::stream::StepParams;
use crate::window::{ShutterType, SpaceWindow, TimeUnit};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Window overrides. Unset fields keep the values fitted to the data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutterConfig {
    pub mode: ShutterType,
    /// Unit of the time fields; scaled store time when unset.
    pub unit: Option<TimeUnit>,
    pub time_window: Option<[f32; 2]>,
    pub time_shutter: Option<[f32; 2]>,
    pub event_window: Option<[u32; 2]>,
    pub event_shutter: Option<[u32; 2]>,
    pub space_window: Option<SpaceWindow>,
    pub positive_only: bool,
}

impl ShutterConfig {
    /// Writes these overrides into the scene's window.
    ///
    /// A time window given without a shutter exposes the whole window.
    pub fn apply(&self, scene: &mut Scene) {
        match self.unit {
            Some(unit) => scene.oddize_time(unit),
            None => scene.normalize_time(),
        }

        let window = scene.window_mut();
        window.shutter_type = self.mode;
        window.positive_only = self.positive_only;
        if let Some(tw) = self.time_window {
            window.time_window = tw;
            window.time_shutter = [0.0, tw[1] - tw[0]];
        }
        if let Some(ts) = self.time_shutter {
            window.time_shutter = ts;
        }
        if let Some(ew) = self.event_window {
            window.event_window = ew;
            window.event_shutter = [0, ew[1].saturating_sub(ew[0])];
        }
        if let Some(es) = self.event_shutter {
            window.event_shutter = es;
        }
        if let Some(space) = self.space_window {
            window.space_window = space;
        }
    }
}

/// Streaming parameters without the per-tick pause flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Retention horizon in milliseconds.
    pub max_z: f64,
    /// Maximum retained events per millisecond.
    pub time_density: Option<f64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let params = StepParams::default();
        Self {
            max_z: params.max_z,
            time_density: params.time_density,
        }
    }
}

impl StreamConfig {
    pub fn step_params(&self, pause: bool) -> StepParams {
        StepParams {
            max_z: self.max_z,
            pause,
            time_density: self.time_density,
        }
    }
}

/// Complete exposure configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub load: LoadOptions,
    pub shutter: ShutterConfig,
    pub contribution: Contribution,
    pub stream: StreamConfig,
    /// Compute principal axes after each exposure.
    pub pca: bool,
}

impl ExposureConfig {
    /// Reads and validates a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.load
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        self.contribution
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.stream.max_z.is_nan() || self.stream.max_z < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "stream.max_z must be non-negative, got {}",
                self.stream.max_z
            )));
        }
        if let Some(density) = self.stream.time_density {
            if density.is_nan() || density <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "stream.time_density must be positive, got {}",
                    density
                )));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for ExposureConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStore;
    use crate::types::{RawEvent, Resolution};

    #[test]
    fn test_empty_config_is_default() {
        let config: ExposureConfig = "".parse().unwrap();
        assert_eq!(config, ExposureConfig::default());
        assert_eq!(config.load.mod_freq, 1);
        assert_eq!(config.contribution, Contribution::Base { contribution: 1.0 });
    }

    #[test]
    fn test_full_config() {
        let text = r#"
            pca = true

            [load]
            mod_freq = 2

            [shutter]
            mode = "event"
            event_window = [10, 90]
            space_window = { top = 0.0, right = 100.0, bottom = 50.0, left = 0.0 }
            positive_only = true

            [contribution]
            kind = "morlet"
            freq_hz = 100.0
            h = 250.0

            [stream]
            max_z = 50.0
            time_density = 20.0
        "#;
        let config: ExposureConfig = text.parse().unwrap();
        assert!(config.pca);
        assert_eq!(config.load.mod_freq, 2);
        assert_eq!(config.load.time_span, 5000.0);
        assert_eq!(config.shutter.mode, ShutterType::Event);
        assert_eq!(config.shutter.event_window, Some([10, 90]));
        assert!(config.contribution.is_morlet());
        assert_eq!(config.stream.step_params(true).time_density, Some(20.0));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            "[load]\nmod_freq = 0\n".parse::<ExposureConfig>(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            "[contribution]\nkind = \"morlet\"\nfreq_hz = 1.0\nh = 0.0\n".parse::<ExposureConfig>(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            "[stream]\ntime_density = -1.0\n".parse::<ExposureConfig>(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            "[shutter]\nmode = \"sideways\"\n".parse::<ExposureConfig>(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_apply_in_milliseconds() {
        let raw = (0..4).map(|i| RawEvent::new(i, i, true, i as i64 * 1000));
        let options = LoadOptions {
            time_span: 30.0,
            ..LoadOptions::default()
        };
        let mut scene = Scene::new(EventStore::load(raw, Resolution::default(), options).unwrap());

        let shutter = ShutterConfig {
            unit: Some(TimeUnit::Milliseconds),
            time_window: Some([0.5, 2.5]),
            ..ShutterConfig::default()
        };
        shutter.apply(&mut scene);
        let range = scene.resolve().range;
        assert_eq!((range.left, range.right), (1, 2));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dce.toml");
        std::fs::write(&path, "pca = true\n").unwrap();
        assert!(ExposureConfig::from_file(&path).unwrap().pca);
        assert!(matches!(
            ExposureConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
