//! Pipeline configuration
//!
//! Loaded from a TOML file, then adjusted by `SCRIPTGATE_*` environment
//! variables. Every field has a default, so an empty file (or none at all)
//! is a valid configuration.

use crate::error::ConfigError;
use crate::generator::{CommandGenerator, FallbackGenerator};
use scriptgate_cache::CacheConfig;
use scriptgate_policy::DEFAULT_POLICY;
use scriptgate_runner::{RunnerConfig, RuntimeCommand, DEFAULT_PATH, NOBODY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "SCRIPTGATE_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Base directory for the cache and audit log
    pub data_dir: PathBuf,
    /// Result cache
    pub cache: CacheSection,
    /// Policies and auditing
    pub security: SecuritySection,
    /// Execution runner
    pub runner: RunnerSection,
    /// Code generators
    pub generator: GeneratorSection,
    /// Log output
    pub logging: LoggingSection,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache: CacheSection::default(),
            security: SecuritySection::default(),
            runner: RunnerSection::default(),
            generator: GeneratorSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

/// `[cache]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Cache generated scripts at all
    pub enabled: bool,
    /// Keep entries on disk across restarts
    pub persistent: bool,
    /// Store directory; `<data_dir>/cache` when unset
    pub dir: Option<PathBuf>,
    /// Entry lifetime in seconds
    pub ttl_secs: u64,
    /// Capacity bound
    pub max_entries: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            persistent: true,
            dir: None,
            ttl_secs: 3600,
            max_entries: 10_000,
        }
    }
}

/// `[security]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Policy used when a request names none
    pub default_policy: String,
    /// Directory of custom policy documents
    pub policies_dir: Option<PathBuf>,
    /// Audit log file; `<data_dir>/audit.jsonl` when unset
    pub audit_log: Option<PathBuf>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            default_policy: DEFAULT_POLICY.to_string(),
            policies_dir: None,
            audit_log: None,
        }
    }
}

/// `[runner]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// Python interpreter
    pub python: RuntimeCommand,
    /// JavaScript interpreter
    pub javascript: RuntimeCommand,
    /// Parent of per-run scratch directories
    pub scratch_root: Option<PathBuf>,
    /// Resource sampling period
    pub sample_interval_ms: u64,
    /// SIGTERM to SIGKILL delay
    pub kill_grace_ms: u64,
    /// CPU overrun tolerated before the sampler kills
    pub cpu_slack_ms: u64,
    /// uid used when running as root
    pub sandbox_uid: u32,
    /// gid used when running as root
    pub sandbox_gid: u32,
    /// `PATH` inside the sandbox
    pub path: String,
}

impl Default for RunnerSection {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            python: runner.python,
            javascript: runner.javascript,
            scratch_root: runner.scratch_root,
            sample_interval_ms: duration_ms(runner.sample_interval),
            kill_grace_ms: duration_ms(runner.kill_grace),
            cpu_slack_ms: duration_ms(runner.cpu_slack),
            sandbox_uid: NOBODY,
            sandbox_gid: NOBODY,
            path: DEFAULT_PATH.to_string(),
        }
    }
}

/// `[generator]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSection {
    /// First retry delay; doubles per attempt
    pub backoff_ms: u64,
    /// External generator commands
    pub providers: Vec<ProviderConfig>,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            backoff_ms: 500,
            providers: Vec::new(),
        }
    }
}

/// One `[[generator.providers]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name used in stats and audit records
    pub name: String,
    /// Program to run
    pub command: String,
    /// Program arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Lower runs first
    #[serde(default)]
    pub priority: u32,
    /// Attempts before moving to the next provider
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    /// Per-attempt timeout
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
    /// Whether the provider is tried at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "human" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(other.to_string()),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_generator_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// `$SCRIPTGATE_DATA_DIR`, else the XDG data dir, else `./.scriptgate`
fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("SCRIPTGATE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("scriptgate");
    }
    std::env::var_os("HOME").map_or_else(
        || PathBuf::from(".scriptgate"),
        |home| PathBuf::from(home).join(".local/share/scriptgate"),
    )
}

impl GateConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] on malformed input
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `path` (or start from defaults) and apply environment overrides
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or an override
    /// does not parse
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text, path)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `SCRIPTGATE_*` overrides read through `lookup`
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidEnv`] for unparseable numbers or formats
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>((key, value): (String, String)) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidEnv { key, value })
        }
        let get = |suffix: &str| {
            let key = format!("{ENV_PREFIX}{suffix}");
            lookup(&key).filter(|v| !v.is_empty()).map(|v| (key, v))
        };

        if let Some((_, dir)) = get("CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(pair) = get("CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse(pair)?;
        }
        if let Some(pair) = get("CACHE_MAX_ENTRIES") {
            self.cache.max_entries = parse(pair)?;
        }
        if let Some((_, name)) = get("DEFAULT_POLICY") {
            self.security.default_policy = name;
        }
        if let Some((_, dir)) = get("POLICIES_DIR") {
            self.security.policies_dir = Some(PathBuf::from(dir));
        }
        if let Some((_, file)) = get("AUDIT_LOG") {
            self.security.audit_log = Some(PathBuf::from(file));
        }
        if let Some((_, level)) = get("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(pair) = get("LOG_FORMAT") {
            self.logging.format = parse(pair)?;
        }
        Ok(())
    }

    /// Set the data directory
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the default policy
    #[must_use]
    pub fn with_default_policy(mut self, name: impl Into<String>) -> Self {
        self.security.default_policy = name.into();
        self
    }

    /// Set the custom policy directory
    #[must_use]
    pub fn with_policies_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.security.policies_dir = Some(dir.into());
        self
    }

    /// Keep the cache in memory only
    #[must_use]
    pub fn with_ephemeral_cache(mut self) -> Self {
        self.cache.persistent = false;
        self
    }

    /// Turn caching off
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.cache.enabled = false;
        self
    }

    /// Set the cache TTL
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl_secs = ttl.as_secs();
        self
    }

    /// Add an external generator
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.generator.providers.push(provider);
        self
    }

    /// Resolved audit log path
    #[must_use]
    pub fn audit_log_path(&self) -> PathBuf {
        self.security
            .audit_log
            .clone()
            .unwrap_or_else(|| self.data_dir.join("audit.jsonl"))
    }

    /// Resolved cache store directory
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(|| self.data_dir.join("cache"))
    }

    /// Settings for the result cache
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache.max_entries,
            default_ttl: Duration::from_secs(self.cache.ttl_secs),
        }
    }

    /// Settings for the execution runner
    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        let section = &self.runner;
        RunnerConfig {
            python: section.python.clone(),
            javascript: section.javascript.clone(),
            scratch_root: section.scratch_root.clone(),
            sample_interval: Duration::from_millis(section.sample_interval_ms.max(1)),
            kill_grace: Duration::from_millis(section.kill_grace_ms),
            cpu_slack: Duration::from_millis(section.cpu_slack_ms),
            sandbox_uid: section.sandbox_uid,
            sandbox_gid: section.sandbox_gid,
            path_env: section.path.clone(),
        }
    }

    /// Fallback chain over the configured providers, if any
    #[must_use]
    pub fn generator(&self) -> Option<FallbackGenerator> {
        if self.generator.providers.is_empty() {
            return None;
        }
        let chain = self.generator.providers.iter().fold(
            FallbackGenerator::new(Duration::from_millis(self.generator.backoff_ms)),
            |chain, p| {
                let command = CommandGenerator::new(
                    &p.name,
                    &p.command,
                    p.args.clone(),
                    Duration::from_secs(p.timeout_secs),
                );
                chain.with_provider(Arc::new(command), p.priority, p.max_attempts)
            },
        );
        for provider in self.generator.providers.iter().filter(|p| !p.enabled) {
            chain.set_enabled(&provider.name, false);
        }
        Some(chain)
    }
}
