//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`RouterConfig`], and run
//! validation before returning.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::RouterConfig;

/// Load a [`RouterConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(RouterConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_stream_router::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("router.toml"))?;
/// println!("{} arms", config.arms.len());
/// ```
pub fn load_from_file(path: &Path) -> Result<RouterConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`RouterConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
///
/// # Errors
///
/// `ConfigError::Parse` for malformed TOML, `ConfigError::Validation` with
/// every violation joined by newlines otherwise.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<RouterConfig, ConfigError> {
    let config: RouterConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[routing]
policy = "thompson"
seed = 42

[[arms]]
id = "small"
resource_class = "gpu-small"
backend = "echo"
usd_micros_per_1k_tokens = 100

[[arms]]
id = "large"
resource_class = "gpu-large"
backend = "echo"
usd_micros_per_1k_tokens = 900
quality = 0.9
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "inline").unwrap();
        assert_eq!(config.arms.len(), 2);
        assert_eq!(config.routing.seed, Some(42));
    }

    #[test]
    fn test_load_from_str_malformed_toml_returns_parse_error() {
        let err = load_from_str("[[arms]\nid =", "broken.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref file, .. } if file == "broken.toml"));
    }

    #[test]
    fn test_load_from_str_invalid_values_returns_validation_error() {
        let toml = "[routing]\nchallenger_fraction = 2.0\nucb_c = -1.0\n";
        match load_from_str(toml, "inline").unwrap_err() {
            ConfigError::Validation(msg) => {
                assert!(msg.contains("routing.challenger_fraction"));
                assert!(msg.contains("routing.ucb_c"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_reads_temp_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID_TOML.as_bytes()).unwrap();
        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.arms[1].id.as_str(), "large");
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let err = load_from_file(Path::new("/nonexistent/router.toml")).unwrap_err();
        match err {
            ConfigError::Io { file, .. } => assert!(file.contains("router.toml")),
            other => panic!("expected io error, got {other:?}"),
        }
    }
}
