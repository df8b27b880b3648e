//! Configuration management.
//!
//! `Settings` covers the tunables of the concurrency core: frame-pool
//! geometry, worker poll tick and channel depth, and the acquisition
//! engine's queue depth and hardware timeouts. Loaded from a TOML file via
//! the `config` crate; every load is followed by a semantic `validate()`
//! pass so impossible values fail at startup, not mid-acquisition.

use config::Config;
use serde::Deserialize;
use std::time::Duration;

use crate::buffer::FrameDtype;
use crate::error::{CoreResult, ScopeError};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub pool: PoolSettings,
    pub worker: WorkerSettings,
    pub acquisition: AcquisitionSettings,
}

/// Frame-pool geometry. Sized once at startup for the worst-case frame.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    /// Frame shape, outermost dimension first.
    pub frame_shape: Vec<usize>,
    /// Element type of every slot.
    pub dtype: FrameDtype,
    /// Number of pre-allocated slots.
    pub slot_count: usize,
}

/// Worker run-loop tuning.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    /// Poll interval of the cooperative run loop.
    #[serde(with = "duration_millis")]
    pub tick: Duration,
    /// Depth of the inbound command channel.
    pub channel_depth: usize,
}

/// Acquisition engine tuning.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Depth of the frame-id handoff queue between signal and data threads.
    pub handoff_depth: usize,
    /// Bound on waiting for a hardware completion acknowledgement.
    #[serde(with = "duration_millis")]
    pub device_ack_timeout: Duration,
    /// Bound on the signal thread waiting for a data-side response.
    #[serde(with = "duration_millis")]
    pub response_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            pool: PoolSettings::default(),
            worker: WorkerSettings::default(),
            acquisition: AcquisitionSettings::default(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            frame_shape: vec![2048, 2048],
            dtype: FrameDtype::U16,
            slot_count: 16,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            channel_depth: 32,
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            handoff_depth: 8,
            device_ack_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Load and validate settings from a TOML file.
    pub fn load(path: &str) -> CoreResult<Self> {
        let s = Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;
        let settings: Settings = s.try_deserialize().map_err(ScopeError::from)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization checks.
    pub fn validate(&self) -> CoreResult<()> {
        if self.pool.slot_count == 0 {
            return Err(ScopeError::Config("pool.slot_count must be > 0".into()));
        }
        if self.pool.frame_shape.is_empty() || self.pool.frame_shape.contains(&0) {
            return Err(ScopeError::Config(format!(
                "pool.frame_shape {:?} has a zero dimension",
                self.pool.frame_shape
            )));
        }
        if self.worker.tick.is_zero() {
            return Err(ScopeError::Config("worker.tick must be > 0".into()));
        }
        if self.worker.channel_depth == 0 {
            return Err(ScopeError::Config("worker.channel_depth must be > 0".into()));
        }
        if self.acquisition.handoff_depth == 0 {
            return Err(ScopeError::Config(
                "acquisition.handoff_depth must be > 0".into(),
            ));
        }
        if self.acquisition.device_ack_timeout.is_zero()
            || self.acquisition.response_timeout.is_zero()
        {
            return Err(ScopeError::Config(
                "acquisition timeouts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().expect("defaults must validate");
    }

    #[test]
    fn test_validate_rejects_zero_slots() {
        let mut settings = Settings::default();
        settings.pool.slot_count = 0;
        assert!(matches!(settings.validate(), Err(ScopeError::Config(_))));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            log_level = "debug"

            [pool]
            slot_count = 4
            "#,
        )
        .expect("parse");
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.pool.slot_count, 4);
        assert_eq!(settings.pool.frame_shape, vec![2048, 2048]);
        assert_eq!(settings.worker.channel_depth, 32);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scope.toml");
        std::fs::write(
            &path,
            "log_level = \"warn\"\n\n[acquisition]\nhandoff_depth = 2\n",
        )
        .expect("write");

        let settings = Settings::load(path.to_str().expect("utf8")).expect("load");
        assert_eq!(settings.log_level, "warn");
        assert_eq!(settings.acquisition.handoff_depth, 2);
        assert!(Settings::load("/nonexistent/scope.toml").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let mut settings = Settings::default();
        settings.worker.tick = Duration::ZERO;
        assert!(settings.validate().is_err());
    }
}
