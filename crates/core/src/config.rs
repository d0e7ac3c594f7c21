use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "BAGCOCKPIT_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory holding the category-structured bag tree.
    pub bags_dir: PathBuf,
    /// SQLite database file for bag metadata, relative to the data dir
    /// unless absolute.
    pub db_path: PathBuf,
    /// Host directory that open-loop evaluation output is copied into.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Settings for the external bag player process and the open-loop wait loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Player binary, e.g. `ros2`.
    pub player_bin: String,
    /// Arguments placed before the bag path, e.g. `["bag", "play"]`.
    pub player_args: Vec<String>,
    /// Environment setup scripts sourced before the player command. When
    /// non-empty the whole command line runs through `/bin/bash -c`.
    pub source_scripts: Vec<PathBuf>,
    /// Delay after `start` before the orchestrator begins polling, giving
    /// the player time to attach.
    pub attach_delay_secs: f64,
    /// Interval between completion polls in the open-loop wait loop.
    pub completion_poll_secs: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bags_dir: PathBuf::from("data/rosbags"),
            db_path: PathBuf::from("rosbag_metadata.db"),
            output_dir: PathBuf::from("/tmp/output"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            player_bin: "ros2".to_string(),
            player_args: vec!["bag".to_string(), "play".to_string()],
            source_scripts: Vec::new(),
            attach_delay_secs: 2.0,
            completion_poll_secs: 5.0,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. BAGCOCKPIT_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        let default_cfg = AppConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.bags_dir, PathBuf::from("data/rosbags"));
        assert_eq!(cfg.paths.db_path, PathBuf::from("rosbag_metadata.db"));
        assert_eq!(cfg.paths.output_dir, PathBuf::from("/tmp/output"));

        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.host, "0.0.0.0");

        assert_eq!(cfg.playback.player_bin, "ros2");
        assert_eq!(cfg.playback.player_args, vec!["bag", "play"]);
        assert!(cfg.playback.source_scripts.is_empty());
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig {
            playback: PlaybackConfig {
                player_bin: "/opt/ros/bin/ros2".to_string(),
                source_scripts: vec![PathBuf::from("/opt/ros/galactic/setup.bash")],
                ..PlaybackConfig::default()
            },
            ..AppConfig::default()
        };
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let path = temp.path().join("missing.toml");
        let loaded = AppConfig::load_from_path(&path).expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let decoded: AppConfig =
            toml::from_str("[server]\nport = 9000\n").expect("deserialize partial config");
        assert_eq!(decoded.server.port, 9000);
        assert_eq!(decoded.server.host, "0.0.0.0");
        assert_eq!(decoded.playback.player_bin, "ros2");
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli_path = Path::new("/custom");
        let result = data_dir(Some(cli_path));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let data_dir = temp.path().join("data");
        initialize_data_dir(&data_dir).expect("initialize data dir");

        assert!(data_dir.exists());
        assert!(data_dir.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let data_dir = temp.path().to_path_buf();

        let cfg_path = data_dir.join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(&data_dir).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
    }
}
