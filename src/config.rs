//! Settings for sessions, the pool and the command-line transport.
//!
//! Settings are read from TOML; every section has defaults so a partial
//! file is valid. Each section is checked with [`Validate`] before use.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::scope_options;
use crate::identity::{Endpoint, Identity};
use crate::reconciler::ReconcileOptions;
use crate::transport::ApiVersion;

/// Environment variable overriding the client program path.
pub const CLI_ENV_VAR: &str = "VCS_SANDBOX_CLI";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Session construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Operational timeout applied to every transport session.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether sessions reconnect automatically.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Prefix of the session name shown on the server.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Protocol major version requested through a gateway.
    #[serde(default = "default_api_major")]
    pub api_major: u32,
    /// Protocol minor version requested through a gateway.
    #[serde(default = "default_api_minor")]
    pub api_minor: u32,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_session_prefix() -> String {
    format!("vcs-sandbox/{}", env!("CARGO_PKG_VERSION"))
}

fn default_api_major() -> u32 {
    4
}

fn default_api_minor() -> u32 {
    16
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            auto_reconnect: default_true(),
            session_prefix: default_session_prefix(),
            api_major: default_api_major(),
            api_minor: default_api_minor(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn api_version(&self) -> ApiVersion {
        ApiVersion {
            major: self.api_major,
            minor: self.api_minor,
        }
    }
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.timeout_secs == 0 {
            result.add_error("session timeout_secs must be at least 1");
        }

        if self.timeout_secs > 3600 {
            result.add_warning("session timeout over 1 hour may hide hung commands");
        }

        if self.session_prefix.trim().is_empty() {
            result.add_error("session_prefix cannot be empty");
        }

        result
    }
}

/// Session pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum idle sessions kept per identity.
    #[serde(default = "default_max_idle")]
    pub max_idle_per_identity: usize,
    /// Idle sessions kept per identity regardless of the soft idle time.
    #[serde(default)]
    pub min_idle_per_identity: usize,
    /// Idle time after which a session is always evictable.
    #[serde(default = "default_min_evictable_idle_secs")]
    pub min_evictable_idle_secs: u64,
    /// Idle time after which a session is evictable when above the idle minimum.
    #[serde(default = "default_soft_min_evictable_idle_secs")]
    pub soft_min_evictable_idle_secs: u64,
    /// Interval between background eviction sweeps.
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Probe liveness before handing out an idle session.
    #[serde(default = "default_true")]
    pub test_on_borrow: bool,
}

fn default_max_idle() -> usize {
    8
}

fn default_min_evictable_idle_secs() -> u64 {
    600
}

fn default_soft_min_evictable_idle_secs() -> u64 {
    120
}

fn default_eviction_interval_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_identity: default_max_idle(),
            min_idle_per_identity: 0,
            min_evictable_idle_secs: default_min_evictable_idle_secs(),
            soft_min_evictable_idle_secs: default_soft_min_evictable_idle_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    pub fn min_evictable_idle(&self) -> Duration {
        Duration::from_secs(self.min_evictable_idle_secs)
    }

    pub fn soft_min_evictable_idle(&self) -> Duration {
        Duration::from_secs(self.soft_min_evictable_idle_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

impl Validate for PoolConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_idle_per_identity == 0 {
            result.add_warning("max_idle_per_identity = 0 evicts every idle session on each sweep");
        }

        if self.min_idle_per_identity > self.max_idle_per_identity {
            result.add_error("min_idle_per_identity cannot exceed max_idle_per_identity");
        }

        if self.eviction_interval_secs == 0 {
            result.add_error("eviction_interval_secs must be at least 1");
        }

        if self.soft_min_evictable_idle_secs > self.min_evictable_idle_secs {
            result.add_warning(
                "soft_min_evictable_idle_secs above min_evictable_idle_secs has no effect",
            );
        }

        result
    }
}

/// Command-line client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Client program name or path.
    #[serde(default = "default_program")]
    pub program: String,
    /// Extra environment passed to every client process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Environment variable the client reads its password from.
    ///
    /// When unset the password is passed as `--password`, which makes it
    /// visible in the process list.
    #[serde(default)]
    pub password_env: Option<String>,
}

fn default_program() -> String {
    "si".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            env: HashMap::new(),
            password_env: None,
        }
    }
}

impl Validate for CliConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.program.trim().is_empty() {
            result.add_error("cli program cannot be empty");
        }

        match &self.password_env {
            Some(name) if name.trim().is_empty() => {
                result.add_error("cli password_env cannot be empty");
            }
            None => {
                result.add_warning("cli password_env unset; passwords are passed on the command line");
            }
            _ => {}
        }

        result
    }
}

/// Server identity as written in a settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub gateway_host: Option<String>,
    #[serde(default)]
    pub gateway_port: Option<u16>,
    pub user: String,
    /// Environment variable holding the secret; never stored in the file.
    pub secret_env: String,
    #[serde(default)]
    pub secure: bool,
}

impl ServerConfig {
    /// Builds the identity, reading the secret from the environment.
    pub fn identity(&self) -> Result<Identity> {
        let secret = std::env::var(&self.secret_env).map_err(|_| {
            Error::Config(format!(
                "environment variable '{}' not set",
                self.secret_env
            ))
        })?;

        let mut identity = Identity::new(
            Endpoint::new(self.host.clone(), self.port),
            self.user.clone(),
            secret,
        )
        .with_secure(self.secure);

        if let Some(host) = &self.gateway_host {
            let port = self.gateway_port.unwrap_or(self.port);
            identity = identity.with_gateway(Endpoint::new(host.clone(), port));
        }

        Ok(identity)
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.host.trim().is_empty() {
            result.add_error("server host cannot be empty");
        }

        if self.user.trim().is_empty() {
            result.add_error("server user cannot be empty");
        }

        if self.gateway_port.is_some() && self.gateway_host.is_none() {
            result.add_warning("gateway_port is ignored without gateway_host");
        }

        result
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub cli: CliConfig,
    #[serde(default)]
    pub sandbox: ReconcileOptions,
}

impl Settings {
    /// Parses settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("failed to parse settings: {}", e)))
    }

    /// Loads settings from a TOML file and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut settings = Self::from_toml(&content)?;
        settings.apply_env();
        Ok(settings)
    }

    /// Applies environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(program) = std::env::var(CLI_ENV_VAR) {
            if !program.trim().is_empty() {
                self.cli.program = program;
            }
        }
    }
}

impl Validate for Settings {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        if let Some(server) = &self.server {
            result.merge(server.validate());
        }
        result.merge(self.session.validate());
        result.merge(self.pool.validate());
        result.merge(self.cli.validate());
        result.merge(self.sandbox.validate());
        result
    }
}

impl Validate for ReconcileOptions {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Some(scope) = &self.scope {
            if scope_options(scope).is_empty() {
                result.add_warning("sandbox scope is blank and will be ignored");
            }
        }

        result
    }
}
