//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level kit-twin configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling: Option<PollingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryConfig>,
}

/// Session backend and the application it should launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the session-management backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default = "default_app_id")]
    pub app_id: String,

    #[serde(default = "default_app_version")]
    pub version: String,

    #[serde(default = "default_profile")]
    pub profile: String,

    /// Bearer token sent with every backend request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Per-request timeout in milliseconds (default: 30s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: None,
            app_id: default_app_id(),
            version: default_app_version(),
            profile: default_profile(),
            token: None,
            token_env: None,
            request_timeout_ms: None,
        }
    }
}

impl ServiceConfig {
    /// Resolve the bearer token: `token` first, then the `token_env` variable.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

fn default_app_id() -> String {
    "usd-viewer-msft".into()
}

fn default_app_version() -> String {
    "106.1.0".into()
}

fn default_profile() -> String {
    "azurelb-wss".into()
}

/// Media parameters handed to the realtime transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_cursor")]
    pub cursor: String,

    /// Reconnect budget for routed sessions.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Reconnect budget for direct-server streams.
    #[serde(default = "default_direct_max_reconnects")]
    pub direct_max_reconnects: u32,

    #[serde(default = "default_connectivity_timeout")]
    pub connectivity_timeout_ms: u64,

    /// Access token placed in routed endpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Re-resolve the session endpoint when the stream stops while still wanted.
    #[serde(default)]
    pub reattach_on_stop: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            cursor: default_cursor(),
            max_reconnects: default_max_reconnects(),
            direct_max_reconnects: default_direct_max_reconnects(),
            connectivity_timeout_ms: default_connectivity_timeout(),
            access_token: None,
            reattach_on_stop: false,
        }
    }
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_fps() -> u32 {
    60
}

fn default_cursor() -> String {
    "free".into()
}

fn default_max_reconnects() -> u32 {
    30
}

fn default_direct_max_reconnects() -> u32 {
    5
}

fn default_connectivity_timeout() -> u64 {
    120_000
}

/// Poll cadences and optional ceilings. No ceiling means poll until teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_session_ready_interval")]
    pub session_ready_interval_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ready_max_attempts: Option<u32>,

    #[serde(default = "default_kit_probe_interval")]
    pub kit_probe_interval_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kit_probe_max_attempts: Option<u32>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            session_ready_interval_ms: default_session_ready_interval(),
            session_ready_max_attempts: None,
            kit_probe_interval_ms: default_kit_probe_interval(),
            kit_probe_max_attempts: None,
        }
    }
}

impl PollingConfig {
    pub fn session_ready_interval(&self) -> Duration {
        Duration::from_millis(self.session_ready_interval_ms)
    }

    pub fn kit_probe_interval(&self) -> Duration {
        Duration::from_millis(self.kit_probe_interval_ms)
    }
}

fn default_session_ready_interval() -> u64 {
    60_000
}

fn default_kit_probe_interval() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "kit_twin_runtime=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Identifiers for the display-only telemetry and report embeds.
///
/// kit-twin does not talk to these services; the values are carried so a
/// front end can find them in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_hub_namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_hub_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_id: Option<String>,
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::KitTwinError::Io)?;

        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::KitTwinError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn service(&self) -> ServiceConfig {
        self.service.clone().unwrap_or_default()
    }

    pub fn stream(&self) -> StreamConfig {
        self.stream.clone().unwrap_or_default()
    }

    pub fn polling(&self) -> PollingConfig {
        self.polling.clone().unwrap_or_default()
    }

    pub fn service_address(&self) -> Option<String> {
        self.service
            .as_ref()
            .and_then(|s| s.address.clone())
            .filter(|a| !a.is_empty())
    }

    /// Get a config value by dotted path (e.g. "polling.kit_probe_interval_ms").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        match self.service_address() {
            None => warnings.push("No session service address configured".to_string()),
            Some(address) => {
                if !address.starts_with("http://") && !address.starts_with("https://") {
                    errors.push(format!(
                        "Session service address must be an http(s) URL: {address}"
                    ));
                }
            }
        }

        if let Some(service) = &self.service {
            if service.token_env.is_some() && service.resolve_token().is_none() {
                warnings.push(format!(
                    "Service token env var '{}' is not set",
                    service.token_env.as_deref().unwrap_or_default()
                ));
            }
        }

        if let Some(polling) = &self.polling {
            if polling.kit_probe_interval_ms == 0 {
                errors.push("polling.kit_probe_interval_ms cannot be 0".to_string());
            }
            if polling.session_ready_interval_ms == 0 {
                errors.push("polling.session_ready_interval_ms cannot be 0".to_string());
            }
        }

        if let Some(stream) = &self.stream {
            if stream.fps == 0 {
                errors.push("stream.fps cannot be 0".to_string());
            }
            if stream.access_token.is_none() {
                warnings.push(
                    "No stream access token configured, routed endpoints use a placeholder"
                        .to_string(),
                );
            }
        }

        (warnings, errors)
    }
}

/// Base directory for kit-twin data: `~/.kit_twin/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kit_twin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_KT_ADDR", "http://svc.local") };
        let input = r#"{"address": "${TEST_KT_ADDR}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("http://svc.local"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_KT_ADDR") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_KT_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        let service = config.service();
        assert_eq!(service.app_id, "usd-viewer-msft");
        assert_eq!(service.version, "106.1.0");
        assert_eq!(service.profile, "azurelb-wss");

        let polling = config.polling();
        assert_eq!(polling.session_ready_interval_ms, 60_000);
        assert_eq!(polling.kit_probe_interval_ms, 1_000);
        assert!(polling.kit_probe_max_attempts.is_none());

        let stream = config.stream();
        assert_eq!((stream.width, stream.height, stream.fps), (1920, 1080, 60));
        assert_eq!(stream.cursor, "free");
        assert!(!stream.reattach_on_stop);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/kit-twin/config.json")).unwrap();
        assert!(config.service.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                service: { address: "http://svc:8011", profile: "default" },
                polling: { kit_probe_interval_ms: 250, kit_probe_max_attempts: 40 },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.service_address().as_deref(), Some("http://svc:8011"));
        assert_eq!(config.service().profile, "default");
        assert_eq!(config.service().app_id, "usd-viewer-msft");
        assert_eq!(config.polling().kit_probe_interval_ms, 250);
        assert_eq!(config.polling().kit_probe_max_attempts, Some(40));
        assert_eq!(config.polling().session_ready_interval_ms, 60_000);
    }

    #[test]
    fn test_service_resolve_token() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_KT_TOKEN", "from-env") };
        let service = ServiceConfig {
            token_env: Some("TEST_KT_TOKEN".into()),
            ..ServiceConfig::default()
        };
        assert_eq!(service.resolve_token(), Some("from-env".into()));

        let direct = ServiceConfig {
            token: Some("direct".into()),
            token_env: Some("TEST_KT_TOKEN".into()),
            ..ServiceConfig::default()
        };
        assert_eq!(direct.resolve_token(), Some("direct".into()));
        unsafe { std::env::remove_var("TEST_KT_TOKEN") };
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_get_path() {
        let config: Config =
            json5::from_str(r#"{ service: { address: "http://svc" } }"#).unwrap();
        assert_eq!(
            config.get_path("service.address"),
            Some(serde_json::json!("http://svc"))
        );
        assert!(config.get_path("service.missing").is_none());
    }

    #[test]
    fn test_validate_bad_address_errors() {
        let config: Config = json5::from_str(r#"{ service: { address: "svc:8011" } }"#).unwrap();
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("http")),
            "Expected an error about the address scheme, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_missing_address_warns() {
        let (warnings, errors) = Config::default().validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("address")));
    }
}
