//! Engine and compile configuration.

use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Highest spherical-harmonics degree the project pass evaluates
pub const MAX_SH_DEGREE: u8 = 3;

/// Engine-wide tuning, loadable from TOML
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sort entries each slot can hold before the first growth
    pub initial_tile_capacity: u32,
    /// Headroom multiplier applied when a slot grows
    pub growth_factor: f32,
    /// Color composited behind the splats
    pub background: [f32; 3],
    /// Fence wait limit in milliseconds; unlimited when absent
    pub fence_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_tile_capacity: 65_536,
            growth_factor: 1.5,
            background: [0.0, 0.0, 0.0],
            fence_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> EngineResult<()> {
        if !self.growth_factor.is_finite() {
            return Err(EngineError::Config(format!(
                "growth_factor must be finite, got {}",
                self.growth_factor
            )));
        }
        if self.background.iter().any(|c| !c.is_finite()) {
            return Err(EngineError::Config("background must be finite".into()));
        }
        Ok(())
    }

    /// Growth multiplier, never below 1
    pub fn effective_growth(&self) -> f32 {
        self.growth_factor.max(1.0)
    }

    pub fn fence_timeout(&self) -> Option<std::time::Duration> {
        self.fence_timeout_ms.map(std::time::Duration::from_millis)
    }
}

/// Options recognized by `ComputeEngine::compile`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileSettings {
    pub sh_degree: u8,
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            sh_degree: MAX_SH_DEGREE,
        }
    }
}

impl CompileSettings {
    /// SH degree clamped to the supported range
    pub fn effective_sh_degree(&self) -> u32 {
        if self.sh_degree > MAX_SH_DEGREE {
            log::warn!(
                "SH degree {} outside 0..={}, clamping to {}",
                self.sh_degree,
                MAX_SH_DEGREE,
                MAX_SH_DEGREE
            );
            return MAX_SH_DEGREE as u32;
        }
        self.sh_degree as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str("growth_factor = 2.0\n").unwrap();
        assert_eq!(config.growth_factor, 2.0);
        assert_eq!(config.initial_tile_capacity, 65_536);
        assert_eq!(config.fence_timeout_ms, None);
    }

    #[test]
    fn test_full_toml() {
        let text = r#"
            initial_tile_capacity = 1024
            growth_factor = 1.25
            background = [0.1, 0.2, 0.3]
            fence_timeout_ms = 5000
        "#;
        let config = EngineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.initial_tile_capacity, 1024);
        assert_eq!(config.background, [0.1, 0.2, 0.3]);
        assert_eq!(config.fence_timeout(), Some(std::time::Duration::from_secs(5)));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("growth_factor = \"fast\"").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_growth_below_one_is_treated_as_one() {
        let config = EngineConfig {
            growth_factor: 0.5,
            ..Default::default()
        };
        assert_eq!(config.effective_growth(), 1.0);
    }

    #[test]
    fn test_sh_degree_clamped() {
        assert_eq!(CompileSettings { sh_degree: 7 }.effective_sh_degree(), 3);
        assert_eq!(CompileSettings { sh_degree: 1 }.effective_sh_degree(), 1);
        assert_eq!(CompileSettings::default().effective_sh_degree(), 3);
    }
}
