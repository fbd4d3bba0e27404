//! Reading configuration files.
//!
//! The format follows the file extension: `.json`/`.jsonc` (comments
//! allowed), `.yaml`/`.yml` or `.toml`. Errors name the file and, where the
//! parser reports one, the line and column.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chainwall_core::errors::ERROR_CONFIG;

use crate::Config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: invalid {format}: {message}", path.display())]
    Parse {
        path: PathBuf,
        format: ConfigFormat,
        message: String,
    },
    #[error("unsupported config format '{0}' (expected json, jsonc, yaml, yml or toml)")]
    UnsupportedFormat(String),
    #[error("validation: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        ERROR_CONFIG
    }
}

/// Configuration file syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON with `//` and `/* */` comments.
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match ext.to_ascii_lowercase().as_str() {
            "json" | "jsonc" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        })
    }
}

/// Load a configuration file, picking the format from its extension.
///
/// The result is not validated; see [`validate_config`](crate::validate_config).
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path)?;
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text, format).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        format,
        message,
    })
}

/// Parse configuration text. The error is the parser's message with its
/// position.
pub fn parse_config(text: &str, format: ConfigFormat) -> Result<Config, String> {
    match format {
        ConfigFormat::Json => {
            let stripped = json_comments::StripComments::new(text.as_bytes());
            serde_json::from_reader(stripped).map_err(|e| e.to_string())
        }
        ConfigFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::from_str(text).map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_follows_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.JSONC")).unwrap(), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("/etc/cw.yml")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("cw.toml")).unwrap(), ConfigFormat::Toml);
        let err = ConfigFormat::from_path(Path::new("cw")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(ref e) if e.is_empty()));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_config("/nonexistent/chainwall.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().starts_with("/nonexistent/chainwall.json: "));
    }

    #[test]
    fn json_syntax_error_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{\n  \"nodes\": [\n    { \"name\": \"in\", }\n  ]\n}\n").unwrap();

        let err = load_config(&path).unwrap_err();
        let text = err.to_string();
        assert!(matches!(err, ConfigError::Parse { format: ConfigFormat::Json, .. }));
        assert!(text.contains("broken.json: invalid json"), "{text}");
        assert!(text.contains("line 3"), "{text}");
    }

    #[test]
    fn comments_are_stripped_before_parsing() {
        let cfg = parse_config(
            r#"{ /* block */ "nodes": [ { "name": "log", "type": "Logger" } ] // tail
            }"#,
            ConfigFormat::Json,
        )
        .unwrap();
        assert_eq!(cfg.nodes[0].name, "log");
    }

    #[test]
    fn missing_nodes_key_is_a_parse_error() {
        let err = parse_config("[core]\nworkers = 2\n", ConfigFormat::Toml).unwrap_err();
        assert!(err.contains("nodes"), "{err}");
    }
}
