//! Configuration loading
//!
//! Reads a JSON5 file, substitutes `${VAR}` references from the environment,
//! deserializes into [`Config`] and validates it. A handful of environment
//! variables override the file for container deployments.

pub mod types;

pub use types::*;

use regex::Regex;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use url::Url;

/// Explicit config file path
pub const CONFIG_PATH_ENV: &str = "MEDIA_PROXY_CONFIG_PATH";
pub const PORT_ENV: &str = "MEDIA_PROXY_PORT";
pub const BIND_ENV: &str = "MEDIA_PROXY_BIND";
pub const LOG_ENV: &str = "MEDIA_PROXY_LOG";

const DEFAULT_CONFIG_FILE: &str = "media-proxy.json5";
const FALLBACK_CONFIG_FILE: &str = "media-proxy.json";

const REDACTED: &str = "[REDACTED]";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

fn invalid(path: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        path: path.to_string(),
        message: message.into(),
    }
}

/// Get the config file path.
/// Priority: MEDIA_PROXY_CONFIG_PATH > ./media-proxy.json5 > ./media-proxy.json
pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }

    let json5 = PathBuf::from(DEFAULT_CONFIG_FILE);
    if json5.exists() {
        return json5;
    }
    PathBuf::from(FALLBACK_CONFIG_FILE)
}

/// Load the effective configuration: file at [`config_path`], then
/// environment overrides, then validation.
pub fn load_config() -> Result<Config, ConfigError> {
    let mut config = load_config_file(&config_path())?;
    apply_env_overrides(&mut config)?;
    validate_config(&mut config)?;
    Ok(config)
}

/// Parse and validate a config file without environment overrides.
/// A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let mut config = load_config_file(path)?;
    validate_config(&mut config)?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;

    serde_json::from_value(value).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Parse JSON5 content
fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid")
    });

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full_match), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = var.as_str();

        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

/// Apply MEDIA_PROXY_PORT / MEDIA_PROXY_BIND / MEDIA_PROXY_LOG.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(port) = env::var(PORT_ENV) {
        config.server.port = port
            .trim()
            .parse()
            .map_err(|_| invalid(PORT_ENV, format!("not a valid port: {port:?}")))?;
    }
    if let Ok(bind) = env::var(BIND_ENV) {
        if !bind.trim().is_empty() {
            config.server.bind = bind.trim().to_string();
        }
    }
    if let Ok(level) = env::var(LOG_ENV) {
        if !level.trim().is_empty() {
            config.logging.level = level.trim().to_string();
        }
    }
    Ok(())
}

/// Check invariants and normalize clampable values in place.
pub fn validate_config(config: &mut Config) -> Result<(), ConfigError> {
    for (i, origin) in config.media.allowed_origins.iter().enumerate() {
        let path = format!("media.allowedOrigins[{i}]");
        let url = Url::parse(origin).map_err(|e| invalid(&path, format!("{origin:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid(&path, format!("{origin:?} is not an http(s) origin")));
        }
    }

    let media = &mut config.media;
    if media.max_width == 0 {
        return Err(invalid("media.maxWidth", "must be at least 1"));
    }
    if media.max_quality == 0 || media.max_quality > 100 {
        return Err(invalid("media.maxQuality", "must be between 1 and 100"));
    }
    media.default_quality = media.default_quality.clamp(1, media.max_quality);
    if media.max_input_bytes == 0 {
        return Err(invalid("media.maxInputBytes", "must be at least 1"));
    }
    if media.fetch_timeout_ms == 0 {
        return Err(invalid("media.fetchTimeoutMs", "must be at least 1"));
    }
    if media.connect_timeout_ms == 0 {
        return Err(invalid("media.connectTimeoutMs", "must be at least 1"));
    }

    if let Some(storage) = &config.storage {
        let url = Url::parse(&storage.base_url)
            .map_err(|e| invalid("storage.baseUrl", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid("storage.baseUrl", "must be an http(s) url"));
        }
        if storage.bucket.trim_matches('/').is_empty() {
            return Err(invalid("storage.bucket", "must not be empty"));
        }
        if storage.timeout_ms == 0 {
            return Err(invalid("storage.timeoutMs", "must be at least 1"));
        }
    }

    if config.write_back.workers == 0 {
        return Err(invalid("writeBack.workers", "must be at least 1"));
    }
    if config.write_back.queue_capacity == 0 {
        return Err(invalid("writeBack.queueCapacity", "must be at least 1"));
    }

    if config.rate_limit.enabled {
        if config.rate_limit.max_requests == 0 {
            return Err(invalid("rateLimit.maxRequests", "must be at least 1"));
        }
        if config.rate_limit.window_ms == 0 {
            return Err(invalid("rateLimit.windowMs", "must be at least 1"));
        }
    }

    Ok(())
}

/// The config as JSON with secrets masked, for `config show`.
pub fn redacted_json(config: &Config) -> Value {
    let mut config = config.clone();
    if let Some(storage) = config.storage.as_mut() {
        if !storage.service_key.is_empty() {
            storage.service_key = REDACTED.to_string();
        }
    }
    serde_json::to_value(&config).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn create_temp_config(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!(config.media.allowed_origins.is_empty());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = TempDir::new().unwrap();
        let path = create_temp_config(
            &dir,
            "media-proxy.json5",
            r#"{
                // trusted origins
                server: { port: 9000 },
                media: {
                    allowedOrigins: ["https://cdn.example.com"],
                    defaultQuality: 95,
                    maxQuality: 85,
                },
                storage: {
                    baseUrl: "https://project.storage.example.net",
                    bucket: "media",
                },
            }"#,
        );

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.media.allowed_origins.len(), 1);
        // clamped into [1, maxQuality]
        assert_eq!(config.media.default_quality, 85);
        assert_eq!(config.storage.unwrap().bucket, "media");
    }

    #[test]
    fn test_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = create_temp_config(&dir, "bad.json5", "{ invalid json }");
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_env_var_substitution() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("MEDIA_PROXY_TEST_KEY", "sk-secret");

        let dir = TempDir::new().unwrap();
        let path = create_temp_config(
            &dir,
            "c.json5",
            r#"{ storage: { baseUrl: "https://s.example.net", bucket: "b", serviceKey: "${MEDIA_PROXY_TEST_KEY}" } }"#,
        );
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.storage.unwrap().service_key, "sk-secret");

        env::remove_var("MEDIA_PROXY_TEST_KEY");
    }

    #[test]
    fn test_env_var_escaped() {
        let result = substitute_env_in_string("$${ESCAPED_VAR}").unwrap();
        assert_eq!(result, "${ESCAPED_VAR}");
    }

    #[test]
    fn test_env_var_missing() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::remove_var("NONEXISTENT_VAR_12345");
        let result = substitute_env_in_string("Bearer ${NONEXISTENT_VAR_12345}");

        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar { var }) if var == "NONEXISTENT_VAR_12345")
        );
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var(PORT_ENV, "7070");
        env::set_var(BIND_ENV, "127.0.0.1");
        env::set_var(LOG_ENV, "debug");

        let mut config = Config::default();
        apply_env_overrides(&mut config).unwrap();
        assert_eq!(config.server.port, 7070);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.logging.level, "debug");

        env::set_var(PORT_ENV, "not-a-port");
        assert!(matches!(
            apply_env_overrides(&mut config),
            Err(ConfigError::ValidationError { .. })
        ));

        env::remove_var(PORT_ENV);
        env::remove_var(BIND_ENV);
        env::remove_var(LOG_ENV);
    }

    #[test]
    fn test_config_path_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var(CONFIG_PATH_ENV, "/etc/media-proxy/custom.json5");
        assert_eq!(config_path(), PathBuf::from("/etc/media-proxy/custom.json5"));
        env::remove_var(CONFIG_PATH_ENV);
    }

    #[test]
    fn test_validation_rejects_bad_origin() {
        let mut config = Config::default();
        config.media.allowed_origins = vec!["ftp://files.example.com".to_string()];
        let err = validate_config(&mut config).unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref path, .. } if path == "media.allowedOrigins[0]")
        );

        config.media.allowed_origins = vec!["not a url".to_string()];
        assert!(validate_config(&mut config).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = Config::default();
        config.write_back.workers = 0;
        assert!(validate_config(&mut config).is_err());

        let mut config = Config::default();
        config.write_back.queue_capacity = 0;
        assert!(validate_config(&mut config).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.media.connect_timeout_ms = 0;
        let err = validate_config(&mut config).unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref path, .. } if path == "media.connectTimeoutMs")
        );

        let mut config = Config::default();
        config.storage = Some(StorageConfig {
            base_url: "https://s.example.net".to_string(),
            bucket: "media".to_string(),
            service_key: String::new(),
            object_path: "/storage/v1/object".to_string(),
            public_path: "/storage/v1/object/public".to_string(),
            variant_prefix: "_variants".to_string(),
            timeout_ms: 0,
        });
        let err = validate_config(&mut config).unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref path, .. } if path == "storage.timeoutMs")
        );
    }

    #[test]
    fn test_validation_clamps_default_quality() {
        let mut config = Config::default();
        config.media.default_quality = 0;
        validate_config(&mut config).unwrap();
        assert_eq!(config.media.default_quality, 1);
    }

    #[test]
    fn test_redacted_json_masks_service_key() {
        let mut config = Config::default();
        config.storage = Some(StorageConfig {
            base_url: "https://s.example.net".to_string(),
            bucket: "media".to_string(),
            service_key: "sk-very-secret".to_string(),
            object_path: "/storage/v1/object".to_string(),
            public_path: "/storage/v1/object/public".to_string(),
            variant_prefix: "_variants".to_string(),
            timeout_ms: 1000,
        });

        let json = redacted_json(&config);
        assert_eq!(json["storage"]["serviceKey"], REDACTED);
        assert!(!json.to_string().contains("sk-very-secret"));
    }
}
