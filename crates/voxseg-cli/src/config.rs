//! Node configuration – reads/writes `~/.voxseg/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::warn;
use voxseg_perception::SyncConfig;
use voxseg_server::{DEFAULT_MIN_POINTS_IN_VOXEL, NodeConfig, ServerConfig};

/// Geometry of the stand-in world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub grid_size: [u32; 3],
    pub origin: [f32; 3],
    pub resolution: [f32; 3],
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            grid_size: [128, 128, 64],
            origin: [-3.2, -3.2, -0.4],
            resolution: [0.05, 0.05, 0.05],
        }
    }
}

/// Persisted configuration stored in `~/.voxseg/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Frames per automatic world update; absent means manual mode (the
    /// world only advances on compute requests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default = "default_min_points_in_voxel")]
    pub min_points_in_voxel: u32,

    /// Per-topic capacity of the input bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub world: WorldConfig,
}

fn default_min_points_in_voxel() -> u32 {
    DEFAULT_MIN_POINTS_IN_VOXEL
}
fn default_bus_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: None,
            min_points_in_voxel: default_min_points_in_voxel(),
            bus_capacity: default_bus_capacity(),
            sync: SyncConfig::default(),
            world: WorldConfig::default(),
        }
    }
}

impl Config {
    /// Library-level settings for the node.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            server: ServerConfig {
                batch_size: self.batch_size.and_then(NonZeroUsize::new),
                min_points_in_voxel: self.min_points_in_voxel,
            },
            sync: self.sync,
            ..NodeConfig::default()
        }
    }
}

/// Return the path to `~/.voxseg/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".voxseg").join("config.toml")
}

/// Load the config from disk with `VOXSEG_*` overrides applied. Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    Ok(load_from(&config_path())?.map(|mut cfg| {
        apply_env_overrides(&mut cfg);
        cfg
    }))
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `VOXSEG_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `VOXSEG_BATCH_SIZE` | `batch_size` (`0` or `manual` selects manual mode) |
/// | `VOXSEG_MIN_POINTS_IN_VOXEL` | `min_points_in_voxel` |
/// | `VOXSEG_SLOP` | `sync.slop` |
/// | `VOXSEG_QUEUE_SIZE` | `sync.queue_size` |
///
/// Unparseable values are logged and ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("VOXSEG_BATCH_SIZE") {
        match parse_batch_size(&v) {
            Some(batch) => cfg.batch_size = batch,
            None => warn!(value = %v, "ignoring invalid VOXSEG_BATCH_SIZE"),
        }
    }
    if let Ok(v) = std::env::var("VOXSEG_MIN_POINTS_IN_VOXEL") {
        match v.trim().parse::<u32>() {
            Ok(n) => cfg.min_points_in_voxel = n,
            Err(_) => warn!(value = %v, "ignoring invalid VOXSEG_MIN_POINTS_IN_VOXEL"),
        }
    }
    if let Ok(v) = std::env::var("VOXSEG_SLOP") {
        match v.trim().parse::<f64>() {
            Ok(s) if s.is_finite() && s >= 0.0 => cfg.sync.slop = s,
            _ => warn!(value = %v, "ignoring invalid VOXSEG_SLOP"),
        }
    }
    if let Ok(v) = std::env::var("VOXSEG_QUEUE_SIZE") {
        match v.trim().parse::<usize>() {
            Ok(n) if n > 0 => cfg.sync.queue_size = n,
            _ => warn!(value = %v, "ignoring invalid VOXSEG_QUEUE_SIZE"),
        }
    }
}

/// `Some(None)` is manual mode; `None` means the value is unusable.
fn parse_batch_size(value: &str) -> Option<Option<usize>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("manual") {
        return Some(None);
    }
    match value.parse::<usize>().ok()? {
        0 => Some(None),
        n => Some(Some(n)),
    }
}

/// Save the config to disk, creating `~/.voxseg/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
