//! Configuration system using Figment
//!
//! This module provides strongly-typed configuration loading. Settings are
//! assembled from:
//! 1. built-in defaults,
//! 2. a `rust_scope.toml` file (base configuration),
//! 3. environment variables (prefixed with `RUSTSCOPE_`).
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `RUSTSCOPE_` prefix can override
//! configuration values:
//!
//! ```text
//! RUSTSCOPE_STAGE__SHEET_ANGLE_DEGREES=30.0
//! RUSTSCOPE_ABLATION__LASER_POWER=0.5
//! RUSTSCOPE_NETWORK__PORT=4100
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, ScopeError};
use crate::signals::Vector3;

/// Top-level configuration for agent, backends and network bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Stage travel limits and scan layout.
    #[serde(default)]
    pub stage: StageSettings,
    /// Point-ablation parameters.
    #[serde(default)]
    pub ablation: AblationSettings,
    /// Remote bridge endpoint.
    #[serde(default)]
    pub network: NetworkSettings,
    /// Channel capacities of the signal path.
    #[serde(default)]
    pub channels: ChannelSettings,
}

/// Stage travel limits, consulted by backends on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    /// Minimum allowed stage position per axis.
    pub min: Vector3,
    /// Maximum allowed stage position per axis.
    pub max: Vector3,
    /// Leaning angle of the light sheet for oblique scan layouts; 0 means an
    /// axis-aligned sheet.
    pub sheet_angle_degrees: f32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            min: Vector3::splat(-100.0),
            max: Vector3::splat(100.0),
            sheet_angle_degrees: 0.0,
        }
    }
}

/// Parameters used when building ablation laser paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AblationSettings {
    /// Laser power applied at each point.
    pub laser_power: f32,
    /// Time the laser dwells on a point, in microseconds.
    pub dwell_time_us: u64,
    /// Path sampling step size, in micrometers.
    pub step_size_um: f32,
    /// How often the full point list is repeated.
    pub repetitions: u32,
    /// Whether stage travel time counts against a point's dwell time.
    pub count_move_time: bool,
}

impl Default for AblationSettings {
    fn default() -> Self {
        Self {
            laser_power: 0.0,
            dwell_time_us: 0,
            step_size_um: 1.0,
            repetitions: 1,
            count_move_time: true,
        }
    }
}

/// Remote bridge endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Host the server binds to / the client connects to.
    pub host: String,
    /// Port of the control connection.
    pub port: u16,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
        }
    }
}

/// Capacities for the bounded channels of the signal path.
///
/// Sends on the signal channel block when it is full; a slow consumer exerts
/// backpressure on the hardware worker instead of losing signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Capacity of the agent's signal output channel.
    pub signal_capacity: usize,
    /// Capacity of the agent's inbound command channel.
    pub command_capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            signal_capacity: 50,
            command_capacity: 32,
        }
    }
}

impl Settings {
    /// Loads settings from `rust_scope.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(Path::new("rust_scope.toml"))
    }

    /// Loads settings from a specific TOML file and the environment.
    pub fn load_from(path: &Path) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RUSTSCOPE_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks semantic constraints that parsing cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        let min = self.stage.min;
        let max = self.stage.max;
        if min.x > max.x || min.y > max.y || min.z > max.z {
            return Err(ScopeError::Configuration(format!(
                "stage.min {min:?} must be componentwise <= stage.max {max:?}"
            )));
        }
        if self.channels.signal_capacity == 0 || self.channels.command_capacity == 0 {
            return Err(ScopeError::Configuration(
                "channel capacities must be non-zero".to_string(),
            ));
        }
        if self.ablation.step_size_um <= 0.0 {
            return Err(ScopeError::Configuration(
                "ablation.step_size_um must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.channels.signal_capacity, 50);
        assert_eq!(settings.stage.min, Vector3::splat(-100.0));
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[stage]\nmin = {{ x = -10.0, y = -10.0, z = 0.0 }}\nmax = {{ x = 10.0, y = 10.0, z = 5.0 }}\nsheet_angle_degrees = 30.0\n\n[network]\nport = 4100"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.stage.min.z, 0.0);
        assert_eq!(settings.stage.sheet_angle_degrees, 30.0);
        assert_eq!(settings.network.port, 4100);
        // untouched sections keep their defaults
        assert_eq!(settings.ablation.repetitions, 1);
    }

    #[test]
    fn inverted_stage_bounds_are_rejected() {
        let mut settings = Settings::default();
        settings.stage.min = Vector3::new(5.0, 0.0, 0.0);
        settings.stage.max = Vector3::new(-5.0, 10.0, 10.0);
        assert!(matches!(
            settings.validate(),
            Err(ScopeError::Configuration(_))
        ));
    }
}
