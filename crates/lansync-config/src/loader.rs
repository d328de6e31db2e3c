//! Configuration loader utilities

use crate::{Config, ConfigBuilder, ConfigError, ConfigResult, ENV_PREFIX};
use std::path::{Path, PathBuf};

/// Common loading patterns on top of [`ConfigBuilder`]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the first default location that exists
    pub fn load_default() -> ConfigResult<Config> {
        let mut builder = ConfigBuilder::new().add_defaults();

        if let Some(path) = Self::config_exists() {
            builder = builder.add_source_file(path);
        }

        builder.add_env_prefix(ENV_PREFIX).build()
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Configuration file not found",
                ),
            });
        }

        ConfigBuilder::new()
            .add_defaults()
            .add_source_file(path)
            .add_env_prefix(ENV_PREFIX)
            .build()
    }

    /// Serialize a configuration, format chosen by extension
    pub fn render(config: &Config, path: &Path) -> ConfigResult<String> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::to_string_pretty(config).map_err(|e| ConfigError::Serialization {
                message: format!("Failed to serialize to TOML: {}", e),
            }),
            Some("json") => {
                serde_json::to_string_pretty(config).map_err(|e| ConfigError::Serialization {
                    message: format!("Failed to serialize to JSON: {}", e),
                })
            }
            _ => serde_yaml::to_string(config).map_err(|e| ConfigError::Serialization {
                message: format!("Failed to serialize to YAML: {}", e),
            }),
        }
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(config: &Config, path: P) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = Self::render(config, path)?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Write the default configuration to `path`
    pub fn generate_default_config<P: AsRef<Path>>(path: P) -> ConfigResult<()> {
        Self::save_to_file(&Config::default(), path)
    }

    /// Default configuration file paths in order of preference
    fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("lansync.yaml"),
            PathBuf::from("lansync.yml"),
            PathBuf::from("lansync.toml"),
        ];

        if let Some(config_dir) = dirs::config_dir() {
            let lansync_dir = config_dir.join("lansync");
            paths.push(lansync_dir.join("config.yaml"));
            paths.push(lansync_dir.join("config.yml"));
            paths.push(lansync_dir.join("config.toml"));
        }

        #[cfg(unix)]
        {
            paths.push(PathBuf::from("/etc/lansync/config.yaml"));
        }

        paths
    }

    /// First default location that exists
    pub fn config_exists() -> Option<PathBuf> {
        Self::default_config_paths()
            .into_iter()
            .find(|path| path.exists())
    }
}
