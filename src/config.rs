// Configuration File Support
//
// This module provides configuration file parsing for the Azure CLI MCP server.
// Supports TOML format with environment variable overrides.
// Configuration files are loaded from the XDG config directory:
// ~/.config/azure-cli-mcp/config.toml

use crate::tools::{CommandPolicy, OutputInspector};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for any command or auth timeout (one hour)
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Upper bound for concurrently running CLI commands
pub const MAX_CONCURRENT_LIMIT: usize = 50;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Wrapped CLI binary configuration
    pub cli: CliConfig,

    /// Command execution limits
    pub execution: ExecutionConfig,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Command allow/deny policy
    pub policy: PolicyConfig,

    /// Optional HTTP status endpoint
    pub http: HttpConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,

    /// Log file path; stderr when unset
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            log_file: None,
        }
    }
}

/// Wrapped CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CliConfig {
    /// Binary to invoke (resolved through PATH unless absolute)
    pub binary: String,

    /// Extra environment variables for every child process
    pub env: BTreeMap<String, String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("AZURE_CORE_NO_COLOR".to_string(), "true".to_string());
        env.insert(
            "AZURE_CORE_COLLECT_TELEMETRY".to_string(),
            "false".to_string(),
        );
        Self {
            binary: "az".to_string(),
            env,
        }
    }
}

/// Command execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Default wall-clock timeout per command
    pub command_timeout_secs: u64,

    /// Upper clamp for per-call timeout overrides
    pub max_timeout_secs: u64,

    /// Maximum captured bytes per stream (stdout, stderr)
    pub max_output_bytes: usize,

    /// Maximum CLI commands running at once
    pub max_concurrent_commands: usize,

    /// Regexes that mark a zero-exit run as failed when matched in stderr
    pub fatal_stderr_patterns: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 300,
            max_timeout_secs: MAX_TIMEOUT_SECS,
            max_output_bytes: 1024 * 1024,
            max_concurrent_commands: 5,
            fatal_stderr_patterns: vec!["(?m)^ERROR:".to_string()],
        }
    }
}

impl ExecutionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Upper bound on a whole login attempt
    pub auth_timeout_secs: u64,

    /// Timeout for the account-status probe
    pub probe_timeout_secs: u64,

    /// Non-interactive credentials; absent selects the device-code flow
    pub service_credential: Option<ServiceCredential>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 300,
            probe_timeout_secs: 30,
            service_credential: None,
        }
    }
}

impl AuthConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Service principal credentials
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceCredential {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,

    /// Subscription selected after login
    #[serde(default)]
    pub subscription_id: Option<String>,
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

/// Command policy configuration
///
/// Patterns are space-separated subcommand words matched as a prefix of the
/// requested command path; `*` matches any single word.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// When non-empty, only matching commands may run
    pub allowed_commands: Vec<String>,

    /// Commands that run only with an explicit confirmation
    pub denied_commands: Vec<String>,

    /// Commands that never run
    pub forbidden_commands: Vec<String>,

    /// Commands that run without an authenticated session
    pub unauthenticated_commands: Vec<String>,

    /// Maximum length of the command text in bytes
    pub max_command_length: usize,

    /// Directories `@file` arguments may reference
    pub allowed_file_roots: Vec<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            denied_commands: Vec::new(),
            forbidden_commands: Vec::new(),
            unauthenticated_commands: vec![
                "version".to_string(),
                "--version".to_string(),
                "find".to_string(),
                "--help".to_string(),
                "-h".to_string(),
            ],
            max_command_length: 4096,
            allowed_file_roots: Vec::new(),
        }
    }
}

/// HTTP status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Whether to serve /health, /metrics and /api/info
    pub enabled: bool,

    /// Port to listen on
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// Environment overrides are applied after parsing and the result is
    /// validated before it is returned.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "azure-cli-mcp", "azure-cli-mcp")
        {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("azure-cli-mcp")
                .join("config.toml")
        }
    }

    /// Apply process environment overrides
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// Recognized variables:
    /// - AZURE_TENANT_ID / AZURE_CLIENT_ID / AZURE_CLIENT_SECRET (all three
    ///   form a service credential), AZURE_SUBSCRIPTION_ID
    /// - COMMAND_TIMEOUT, AUTH_TIMEOUT (1..=3600)
    /// - MAX_CONCURRENT_COMMANDS (1..=50), MAX_OUTPUT_BYTES
    /// - LOG_LEVEL, LOG_FILE, AZURE_CLI_MCP_BINARY
    ///
    /// Out-of-range numbers are ignored.
    pub fn apply_overrides_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(level) = non_empty("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(file) = non_empty("LOG_FILE") {
            self.logging.log_file = Some(file);
        }
        if let Some(binary) = non_empty("AZURE_CLI_MCP_BINARY") {
            self.cli.binary = binary;
        }

        if let Some(secs) = non_empty("COMMAND_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            if (1..=MAX_TIMEOUT_SECS).contains(&secs) {
                self.execution.command_timeout_secs = secs;
            }
        }
        if let Some(secs) = non_empty("AUTH_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            if (1..=MAX_TIMEOUT_SECS).contains(&secs) {
                self.auth.auth_timeout_secs = secs;
            }
        }
        if let Some(n) = non_empty("MAX_CONCURRENT_COMMANDS").and_then(|v| v.parse::<usize>().ok())
        {
            if (1..=MAX_CONCURRENT_LIMIT).contains(&n) {
                self.execution.max_concurrent_commands = n;
            }
        }
        if let Some(n) = non_empty("MAX_OUTPUT_BYTES").and_then(|v| v.parse::<usize>().ok()) {
            if n > 0 {
                self.execution.max_output_bytes = n;
            }
        }

        if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            non_empty("AZURE_TENANT_ID"),
            non_empty("AZURE_CLIENT_ID"),
            non_empty("AZURE_CLIENT_SECRET"),
        ) {
            self.auth.service_credential = Some(ServiceCredential {
                client_id,
                client_secret,
                tenant_id,
                subscription_id: None,
            });
        }
        if let Some(subscription) = non_empty("AZURE_SUBSCRIPTION_ID") {
            if let Some(cred) = self.auth.service_credential.as_mut() {
                cred.subscription_id = Some(subscription);
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// Command patterns and stderr regexes are compiled here so a malformed
    /// policy fails at startup instead of on the first request.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.cli.binary.trim().is_empty() {
            anyhow::bail!("CLI binary must not be empty");
        }

        let exec = &self.execution;
        if !(1..=MAX_TIMEOUT_SECS).contains(&exec.command_timeout_secs) {
            anyhow::bail!("Command timeout must be between 1 and {} seconds", MAX_TIMEOUT_SECS);
        }
        if exec.max_timeout_secs < exec.command_timeout_secs || exec.max_timeout_secs > MAX_TIMEOUT_SECS {
            anyhow::bail!(
                "Max timeout must be between the command timeout and {} seconds",
                MAX_TIMEOUT_SECS
            );
        }
        if exec.max_output_bytes == 0 {
            anyhow::bail!("Max output bytes must be > 0");
        }
        if !(1..=MAX_CONCURRENT_LIMIT).contains(&exec.max_concurrent_commands) {
            anyhow::bail!(
                "Max concurrent commands must be between 1 and {}",
                MAX_CONCURRENT_LIMIT
            );
        }
        OutputInspector::new(&exec.fatal_stderr_patterns)
            .context("Invalid fatal_stderr_patterns")?;

        if !(1..=MAX_TIMEOUT_SECS).contains(&self.auth.auth_timeout_secs) {
            anyhow::bail!("Auth timeout must be between 1 and {} seconds", MAX_TIMEOUT_SECS);
        }
        if self.auth.probe_timeout_secs == 0 {
            anyhow::bail!("Probe timeout must be > 0");
        }
        if let Some(cred) = &self.auth.service_credential {
            if cred.client_id.trim().is_empty()
                || cred.client_secret.is_empty()
                || cred.tenant_id.trim().is_empty()
            {
                anyhow::bail!("Service credential requires client_id, client_secret and tenant_id");
            }
        }

        if self.policy.max_command_length == 0 {
            anyhow::bail!("Max command length must be > 0");
        }
        CommandPolicy::from_config(&self.policy).context("Invalid command policy")?;

        if self.http.enabled && self.http.port == 0 {
            anyhow::bail!("HTTP port must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Copy of the configuration safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(cred) = copy.auth.service_credential.as_mut() {
            cred.client_secret = "***".to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.cli.binary, "az");
        assert_eq!(config.execution.command_timeout_secs, 300);
        assert_eq!(config.execution.max_concurrent_commands, 5);
        assert_eq!(config.execution.max_output_bytes, 1024 * 1024);
        assert!(config.auth.service_credential.is_none());
        assert!(config.policy.denied_commands.is_empty());
        assert!(!config.http.enabled);
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_timeout_bounds() {
        let mut config = Config::default();
        config.execution.command_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.execution.command_timeout_secs = 3601;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.auth_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_concurrency_bounds() {
        let mut config = Config::default();
        config.execution.max_concurrent_commands = 0;
        assert!(config.validate().is_err());

        config.execution.max_concurrent_commands = 51;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_malformed_pattern() {
        let mut config = Config::default();
        config.policy.denied_commands = vec!["group; delete".to_string()];
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid command policy"));
    }

    #[test]
    fn test_config_validation_bad_regex() {
        let mut config = Config::default();
        config.execution.fatal_stderr_patterns = vec!["(unclosed".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_credential_field() {
        let mut config = Config::default();
        config.auth.service_credential = Some(ServiceCredential {
            client_id: "client".to_string(),
            client_secret: String::new(),
            tenant_id: "tenant".to_string(),
            subscription_id: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().with_extension("nonexistent");
        let config = Config::load_from_path(&path);
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_valid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[logging]
level = "debug"
format = "json"

[cli]
binary = "/usr/local/bin/az"

[execution]
command_timeout_secs = 120
max_output_bytes = 4096

[auth]
auth_timeout_secs = 600

[auth.service_credential]
client_id = "app-id"
client_secret = "s3cret"
tenant_id = "tenant-id"

[policy]
denied_commands = ["group delete", "account *"]
allowed_file_roots = ["/srv/templates"]
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.cli.binary, "/usr/local/bin/az");
        assert_eq!(config.execution.command_timeout_secs, 120);
        assert_eq!(config.execution.max_output_bytes, 4096);
        assert_eq!(config.execution.max_concurrent_commands, 5);
        assert_eq!(config.auth.auth_timeout_secs, 600);
        let cred = config.auth.service_credential.as_ref().unwrap();
        assert_eq!(cred.client_id, "app-id");
        assert_eq!(config.policy.denied_commands.len(), 2);
        assert_eq!(config.policy.allowed_file_roots, vec![PathBuf::from("/srv/templates")]);
        assert!(config.validate().is_ok());

        assert!(Config::load_from_path(temp_file.path()).is_ok());
    }

    #[test]
    fn test_load_invalid_toml_config() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[logging\nlevel = \"debug\"\n").unwrap();
        assert!(Config::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default().apply_overrides_with(lookup_from(&[
            ("LOG_LEVEL", "DEBUG"),
            ("LOG_FILE", "test.log"),
            ("COMMAND_TIMEOUT", "600"),
            ("MAX_CONCURRENT_COMMANDS", "10"),
            ("AZURE_TENANT_ID", "test-tenant"),
            ("AZURE_CLIENT_ID", "test-client"),
            ("AZURE_CLIENT_SECRET", "test-secret"),
            ("AZURE_SUBSCRIPTION_ID", "test-sub"),
        ]));

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.log_file.as_deref(), Some("test.log"));
        assert_eq!(config.execution.command_timeout_secs, 600);
        assert_eq!(config.execution.max_concurrent_commands, 10);
        let cred = config.auth.service_credential.unwrap();
        assert_eq!(cred.tenant_id, "test-tenant");
        assert_eq!(cred.client_id, "test-client");
        assert_eq!(cred.client_secret, "test-secret");
        assert_eq!(cred.subscription_id.as_deref(), Some("test-sub"));
    }

    #[test]
    fn test_env_overrides_partial_credentials_ignored() {
        let config = Config::default().apply_overrides_with(lookup_from(&[
            ("AZURE_TENANT_ID", "test-tenant"),
            ("AZURE_CLIENT_ID", "test-client"),
        ]));
        assert!(config.auth.service_credential.is_none());
    }

    #[test]
    fn test_env_overrides_invalid_values() {
        let config = Config::default().apply_overrides_with(lookup_from(&[
            ("COMMAND_TIMEOUT", "0"),
            ("MAX_CONCURRENT_COMMANDS", "100"),
            ("AUTH_TIMEOUT", "not-a-number"),
        ]));
        assert_eq!(config.execution.command_timeout_secs, 300);
        assert_eq!(config.execution.max_concurrent_commands, 5);
        assert_eq!(config.auth.auth_timeout_secs, 300);
    }

    #[test]
    fn test_debug_and_redacted_hide_secret() {
        let config = Config::default().apply_overrides_with(lookup_from(&[
            ("AZURE_TENANT_ID", "t"),
            ("AZURE_CLIENT_ID", "c"),
            ("AZURE_CLIENT_SECRET", "super-secret-value"),
        ]));
        assert!(!format!("{:?}", config).contains("super-secret-value"));

        let printed = toml::to_string(&config.redacted()).unwrap();
        assert!(!printed.contains("super-secret-value"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn test_log_level_parsing() {
        let mut config = Config::default();
        config.logging.level = "debug".to_string();
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_config_path() {
        assert!(Config::config_path().ends_with("config.toml"));
    }
}
