use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub gate: Gate,
    pub audit: Audit,
    #[serde(default)]
    pub smoke: Smoke,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_credential_digits")]
    pub min_credential_digits: usize,
    #[serde(default = "default_clear_deferred_on_lockout")]
    pub clear_deferred_on_lockout: bool,
    #[serde(default = "default_account_type")]
    pub default_account_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub sink: String,
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smoke {
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,
    #[serde(default = "default_sender")]
    pub sender: String,
}

impl Default for Smoke {
    fn default() -> Self {
        Self {
            webhook_url: default_webhook_url(),
            sender: default_sender(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_credential_digits() -> usize {
    6
}

fn default_clear_deferred_on_lockout() -> bool {
    true
}

fn default_account_type() -> String {
    "checking".to_string()
}

fn default_webhook_url() -> String {
    "http://localhost:5005/webhooks/rest/webhook".to_string()
}

fn default_sender() -> String {
    "test_user".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.server.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "server.listen_addr={} is not a socket address",
            cfg.server.listen_addr
        )));
    }
    if cfg.gate.max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gate.max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.gate.min_credential_digits == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gate.min_credential_digits must be >= 1".to_string(),
        ));
    }
    if cfg.gate.default_account_type.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gate.default_account_type must not be empty".to_string(),
        ));
    }
    if cfg
        .audit
        .sqlite_path
        .as_ref()
        .map(|v| v.trim().is_empty())
        .unwrap_or(false)
    {
        return Err(ConfigError::UnsupportedConfig(
            "audit.sqlite_path must not be empty when set".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("teller-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:5055"

gate:
  max_attempts: 3
  min_credential_digits: 6
  clear_deferred_on_lockout: true
  default_account_type: "checking"

audit:
  sink: "jsonl"
  jsonl_path: "./teller-audit.jsonl"
"#
        .to_string()
    }

    #[test]
    fn loads_base_config_with_smoke_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.gate.max_attempts, 3);
        assert!(cfg.gate.clear_deferred_on_lockout);
        assert_eq!(cfg.smoke.sender, "test_user");
        assert!(cfg.smoke.webhook_url.ends_with("/webhooks/rest/webhook"));
        assert!(cfg.audit.sqlite_path.is_none());
    }

    #[test]
    fn gate_fields_fall_back_to_defaults() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:5055"
gate: {}
audit:
  sink: "jsonl"
  jsonl_path: "./a.jsonl"
  sqlite_path: "./a.db"
"#;
        let cfg = load_and_validate(&write_temp_config(yaml)).expect("defaults should apply");
        assert_eq!(cfg.gate.min_credential_digits, 6);
        assert_eq!(cfg.gate.default_account_type, "checking");
        assert_eq!(cfg.audit.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_zero_attempt_budget() {
        let path = write_temp_config(&base_yaml().replace("max_attempts: 3", "max_attempts: 0"));
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn schema_only_accepts_jsonl_audit_sink() {
        let path = write_temp_config(&base_yaml().replace("sink: \"jsonl\"", "sink: \"stdout\""));
        let err = load_and_validate(&path).expect_err("expected schema rejection");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let path = write_temp_config(&base_yaml().replace("127.0.0.1:5055", "localhost"));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_and_validate("/nonexistent/teller.yaml").expect_err("expected read error");
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
