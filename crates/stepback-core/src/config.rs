//! Runtime configuration.
//!
//! [`RuntimeConfig`] is read from RON, TOML or JSON, with the format chosen
//! by file extension. Every field has a default, so a config file only needs
//! to name what it changes.

use crate::codec::BINARY_FORMAT;
use crate::compress::DEFAULT_LEVEL;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file has an extension we don't support.
    #[error("unsupported config format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    #[error("parse error in {source_name}: {detail}")]
    Parse { source_name: String, detail: String },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Config types
// ===========================================================================

/// Snapshot history settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Record every unit after each completed round.
    pub enabled: bool,
    /// Compress recorded snapshots in the background.
    pub compress: bool,
    /// zlib level, 0 to 9.
    pub compression_level: u32,
    /// Oldest snapshots are evicted beyond this depth. `None` is unbounded.
    pub max_depth: Option<usize>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compress: false,
            compression_level: DEFAULT_LEVEL,
            max_depth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `0` runs every unit on one dedicated worker, `n > 0` uses a pool of
    /// `n` workers, negative values are treated as `1`.
    pub concurrency: i32,
    /// Codec format name. Unknown names fall back to `binary`.
    pub codec: String,
    pub history: HistoryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            codec: BINARY_FORMAT.to_string(),
            history: HistoryConfig::default(),
        }
    }
}

// ===========================================================================
// Loading
// ===========================================================================

/// Supported config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(ConfigError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

fn parse<T: DeserializeOwned>(format: Format, content: &str, source_name: &str) -> Result<T, ConfigError> {
    let parsed = match format {
        Format::Ron => ron::from_str(content).map_err(|e| e.to_string()),
        Format::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|detail| ConfigError::Parse {
        source_name: source_name.to_string(),
        detail,
    })
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = parse(Format::Toml, content, "<toml>")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = parse(Format::Ron, content, "<ron>")?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file, choosing the format from its extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        let config: Self = parse(format, &content, &path.display().to_string())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.compression_level > 9 {
            return Err(ConfigError::Invalid {
                field: "history.compression_level",
                reason: format!("{} is outside 0..=9", self.history.compression_level),
            });
        }
        if self.history.max_depth == Some(0) {
            return Err(ConfigError::Invalid {
                field: "history.max_depth",
                reason: "must be at least 1 when set".to_string(),
            });
        }
        if self.codec.is_empty() {
            return Err(ConfigError::Invalid {
                field: "codec",
                reason: "format name must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.codec, "binary");
        assert!(config.history.enabled);
    }

    #[test]
    fn toml_overrides() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            concurrency = 4
            codec = "json"

            [history]
            compress = true
            compression_level = 9
            max_depth = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.codec, "json");
        assert!(config.history.enabled);
        assert!(config.history.compress);
        assert_eq!(config.history.max_depth, Some(16));
    }

    #[test]
    fn ron_config() {
        let config = RuntimeConfig::from_ron_str(
            "(concurrency: -2, history: (enabled: false, max_depth: Some(3)))",
        )
        .unwrap();
        assert_eq!(config.concurrency, -2);
        assert!(!config.history.enabled);
        assert_eq!(config.history.max_depth, Some(3));
        assert_eq!(config.history.compression_level, DEFAULT_LEVEL);
    }

    #[test]
    fn invalid_values_rejected() {
        match RuntimeConfig::from_toml_str("[history]\ncompression_level = 12") {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "history.compression_level"),
            other => panic!("expected Invalid, got: {other:?}"),
        }
        assert!(matches!(
            RuntimeConfig::from_toml_str("[history]\nmax_depth = 0"),
            Err(ConfigError::Invalid { field: "history.max_depth", .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("concurrency = \"many\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn detect_format_by_extension() {
        assert_eq!(detect_format(Path::new("run.toml")).unwrap(), Format::Toml);
        assert_eq!(detect_format(Path::new("run.ron")).unwrap(), Format::Ron);
        assert_eq!(detect_format(Path::new("run.json")).unwrap(), Format::Json);
        assert!(matches!(
            detect_format(Path::new("run")),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = std::env::temp_dir().join(format!("stepback_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime.json");
        std::fs::write(&path, r#"{ "concurrency": 2, "history": { "compress": true } }"#).unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.concurrency, 2);
        assert!(config.history.compress);
        assert!(matches!(
            RuntimeConfig::load(&dir.join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
