//! Shell configuration.
//!
//! Settings resolve in precedence order: command-line flags, then the
//! `strix.toml` config file, then built-in defaults under the platform data
//! directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use strix_extensions::{default_data_dir, DEFAULT_LOCALE};

/// Config file name looked up in the data directory when `--config` is absent
pub const CONFIG_FILE: &str = "strix.toml";

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    extensions_dir: Option<PathBuf>,
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    locale: Option<String>,
}

/// Fully resolved shell settings
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Directory holding extension packages
    pub extensions_dir: PathBuf,
    /// Directory for profile data (storage database lives here)
    pub data_dir: PathBuf,
    /// Active locale
    pub locale: String,
}

impl ShellConfig {
    /// Resolve settings from optional flag overrides and an optional config
    /// file path.
    pub fn resolve(
        extensions_dir: Option<PathBuf>,
        data_dir: Option<PathBuf>,
        config_path: Option<&Path>,
    ) -> Result<Self> {
        let file = match config_path {
            Some(path) => read_file(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => {
                let default_path = default_data_dir().join(CONFIG_FILE);
                if default_path.is_file() {
                    read_file(&default_path).with_context(|| {
                        format!("failed to read config {}", default_path.display())
                    })?
                } else {
                    FileConfig::default()
                }
            }
        };

        let data_dir = data_dir
            .or(file.data_dir)
            .unwrap_or_else(default_data_dir);
        let extensions_dir = extensions_dir
            .or(file.extensions_dir)
            .unwrap_or_else(|| data_dir.join("extensions"));
        let locale = file.locale.unwrap_or_else(|| DEFAULT_LOCALE.to_string());

        Ok(Self {
            extensions_dir,
            data_dir,
            locale,
        })
    }

    /// Path of the extension storage database inside the data directory
    #[must_use]
    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("extension-storage.db")
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}
