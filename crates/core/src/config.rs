use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PAGE_SIZE_MIN: usize = 10;
pub const PAGE_SIZE_MAX: usize = 10_000;
pub const PREFETCH_PAGES_MIN: usize = 1;
pub const PREFETCH_PAGES_MAX: usize = 10;
pub const MAX_RESULT_ROWS_MIN: u64 = 1_000;
pub const MAX_RESULT_ROWS_MAX: u64 = 10_485_760;

const fn default_page_size() -> usize {
    500
}

const fn default_prefetch_pages() -> usize {
    2
}

const fn default_max_result_rows() -> u64 {
    1_048_576
}

/// Tunables for the paging core. Out-of-range values from the config file
/// clamp to their documented bounds instead of failing the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_prefetch_pages")]
    pub prefetch_pages: usize,
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            prefetch_pages: default_prefetch_pages(),
            max_result_rows: default_max_result_rows(),
        }
    }
}

impl ViewerConfig {
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            page_size: self.page_size.clamp(PAGE_SIZE_MIN, PAGE_SIZE_MAX),
            prefetch_pages: self
                .prefetch_pages
                .clamp(PREFETCH_PAGES_MIN, PREFETCH_PAGES_MAX),
            max_result_rows: self
                .max_result_rows
                .clamp(MAX_RESULT_ROWS_MIN, MAX_RESULT_ROWS_MAX),
        }
    }

    /// Rows requested per prefetch load: the target page plus the
    /// configured number of pages ahead.
    #[must_use]
    pub fn fetch_len(&self) -> usize {
        self.page_size * (1 + self.prefetch_pages)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to create config directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize {
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn load_default() -> Result<ViewerConfig, ConfigError> {
    load_from_path(default_config_path()?)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<ViewerConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(ViewerConfig::default());
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if raw.trim().is_empty() {
        return Ok(ViewerConfig::default());
    }

    let parsed: ViewerConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parsed.clamped())
}

pub fn persist_to_path(config: ViewerConfig, path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent_dir) = path.parent() {
        fs::create_dir_all(parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    let rendered =
        toml::to_string_pretty(&config).map_err(|source| ConfigError::Serialize { source })?;
    fs::write(path, rendered).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let base_dir = if let Some(custom) = env::var_os("TRELLIS_CONFIG_DIR") {
        PathBuf::from(custom)
    } else if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ConfigError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(ConfigError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("trellis").join("viewer.toml"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{load_from_path, persist_to_path, ViewerConfig};

    #[test]
    fn missing_file_loads_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let config =
            load_from_path(temp_dir.path().join("viewer.toml")).expect("load should succeed");
        assert_eq!(config, ViewerConfig::default());
        assert_eq!(config.page_size, 500);
        assert_eq!(config.prefetch_pages, 2);
        assert_eq!(config.max_result_rows, 1_048_576);
    }

    #[test]
    fn out_of_range_values_clamp_on_load() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("viewer.toml");
        std::fs::write(
            &path,
            "page_size = 3\nprefetch_pages = 99\nmax_result_rows = 1\n",
        )
        .expect("failed to seed config file");

        let config = load_from_path(&path).expect("load should succeed");
        assert_eq!(config.page_size, 10);
        assert_eq!(config.prefetch_pages, 10);
        assert_eq!(config.max_result_rows, 1_000);
    }

    #[test]
    fn partial_files_fall_back_per_field() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("viewer.toml");
        std::fs::write(&path, "page_size = 250\n").expect("failed to seed config file");

        let config = load_from_path(&path).expect("load should succeed");
        assert_eq!(config.page_size, 250);
        assert_eq!(config.prefetch_pages, 2);
    }

    #[test]
    fn persist_then_reload_roundtrips() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("nested").join("viewer.toml");
        let config = ViewerConfig {
            page_size: 100,
            prefetch_pages: 3,
            max_result_rows: 2_000,
        };

        persist_to_path(config, &path).expect("persist should succeed");
        let reloaded = load_from_path(&path).expect("reload should succeed");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn fetch_len_covers_target_and_prefetch_pages() {
        let config = ViewerConfig::default();
        assert_eq!(config.fetch_len(), 1_500);
    }
}
