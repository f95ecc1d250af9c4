//! Engine configuration
//!
//! Hosts construct an [`EngineConfig`] (or load one from YAML) and hand it
//! to [`crate::context::Context::new`]. Everything here has a sensible
//! default; the zero-config path is `Context::new(backend,
//! EngineConfig::default())`.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Tunables fixed at context construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output device name for the cpal backend (`None` = system default).
    pub output_device: Option<String>,

    /// Number of HRTF voices pre-allocated in the panner bank.
    pub hrtf_voices: usize,

    /// Number of stereo panner voices pre-allocated in the panner bank.
    pub stereo_voices: usize,

    /// Block scratch buffers pre-populated in the block buffer cache.
    /// Sized for the worst tick: one per live source plus one per
    /// generator plus headroom for the spatializer.
    pub block_buffer_reserve: usize,

    /// Capacity reserved for live sources/effects/generators before a
    /// debug-asserted cold-path reallocation.
    pub object_reserve: usize,

    /// Streaming generator ring size in blocks (per channel).
    pub stream_ring_blocks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_device: None,
            hrtf_voices: 32,
            stereo_voices: 64,
            block_buffer_reserve: 64,
            object_reserve: 256,
            stream_ring_blocks: 16,
        }
    }
}

/// Load a config from a YAML file.
///
/// Missing file → defaults. Unparseable file → warn and defaults; a bad
/// config should never keep audio from starting.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("config {:?} not found, using defaults", path);
        return T::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("failed to parse config {:?}: {}, using defaults", path, e);
                T::default()
            }
        },
        Err(e) => {
            log::warn!("failed to read config {:?}: {}, using defaults", path, e);
            T::default()
        }
    }
}

/// Save a config as YAML, creating parent directories as needed.
pub fn save_config<T>(config: &T, path: &Path) -> std::io::Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_returns_default() {
        let config: EngineConfig = load_config(Path::new("/nonexistent/synthizer.yaml"));
        assert_eq!(config.hrtf_voices, EngineConfig::default().hrtf_voices);
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");

        let mut config = EngineConfig::default();
        config.hrtf_voices = 8;
        config.output_device = Some("Speakers".to_string());
        save_config(&config, &path).unwrap();

        let loaded: EngineConfig = load_config(&path);
        assert_eq!(loaded.hrtf_voices, 8);
        assert_eq!(loaded.output_device.as_deref(), Some("Speakers"));
    }

    #[test]
    fn test_garbage_yaml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "hrtf_voices: [not a number").unwrap();

        let loaded: EngineConfig = load_config(&path);
        assert_eq!(loaded.hrtf_voices, EngineConfig::default().hrtf_voices);
    }
}
