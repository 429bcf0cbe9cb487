//! Declarative policy documents
//!
//! A [`PolicyDocument`] is the serde form of a policy as it appears in YAML
//! or TOML files. Every field is optional so the same shape serves both as a
//! complete policy and as a set of overrides on a `base` policy.
//!
//! ```yaml
//! name: data-team
//! base: moderate
//! reject_threshold: low
//! ceilings:
//!   memory_mb: 512
//! blocked_imports:
//!   - sqlite3
//!   - { name: ftplib, severity: critical }
//! patterns:
//!   - name: no-env-dump
//!     pattern: 'os\.environ'
//!     severity: medium
//! ```

use crate::error::PolicyError;
use schemars::JsonSchema;
use scriptgate_model::{Language, Severity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Severity given to list entries declared without one
pub const DEFAULT_RULE_SEVERITY: Severity = Severity::High;

/// Declared strictness of a policy
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Maximum restrictions, rejects on low severity
    Strict,
    /// Balanced restrictions, rejects on medium severity
    Moderate,
    /// Minimal restrictions, rejects on high severity
    Permissive,
    /// User-defined
    #[default]
    Custom,
}

impl PolicyMode {
    /// Reject threshold used when a policy does not declare one
    #[inline]
    #[must_use]
    pub const fn default_threshold(self) -> Severity {
        match self {
            Self::Strict => Severity::Low,
            Self::Moderate | Self::Custom => Severity::Medium,
            Self::Permissive => Severity::High,
        }
    }
}

/// A blocked import or callable, with or without an explicit severity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum NameRule {
    /// Bare name at the default severity
    Bare(String),
    /// Name with severity
    Detailed {
        /// Module or callable name
        name: String,
        /// Severity of a match
        #[serde(default = "default_rule_severity")]
        severity: Severity,
    },
}

fn default_rule_severity() -> Severity {
    DEFAULT_RULE_SEVERITY
}

impl NameRule {
    /// Rule name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Bare(name) | Self::Detailed { name, .. } => name,
        }
    }

    /// Rule severity
    #[inline]
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Bare(_) => DEFAULT_RULE_SEVERITY,
            Self::Detailed { severity, .. } => *severity,
        }
    }

    /// Shorthand for a detailed rule
    #[must_use]
    pub fn new(name: impl Into<String>, severity: Severity) -> Self {
        Self::Detailed {
            name: name.into(),
            severity,
        }
    }
}

/// A textual pattern rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PatternDocument {
    /// Rule name reported in findings
    pub name: String,
    /// Regular expression matched against the full source
    pub pattern: String,
    /// Severity of a match
    #[serde(default = "default_rule_severity")]
    pub severity: Severity,
    /// Message reported in findings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Restrict the rule to these languages (empty means all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<Language>,
}

impl PatternDocument {
    /// Create a pattern rule for every language
    #[must_use]
    pub fn new(name: &str, pattern: &str, severity: Severity, message: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            severity,
            message: Some(message.to_string()),
            languages: Vec::new(),
        }
    }

    /// Restrict to one language
    #[must_use]
    pub fn only(mut self, language: Language) -> Self {
        self.languages = vec![language];
        self
    }
}

/// Resource ceilings in human units; unset fields inherit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CeilingsDocument {
    /// CPU time in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_secs: Option<u64>,
    /// Memory in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Wall-clock timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_timeout_secs: Option<u64>,
    /// Captured bytes per output stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<u64>,
    /// Largest file the workload may write, in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size_mb: Option<u64>,
    /// Process/thread count for the sandbox identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u64>,
}

/// Serde form of a security policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    /// Policy name
    #[serde(default)]
    pub name: String,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Policy this document extends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Declared mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PolicyMode>,
    /// Findings at or above this severity reject the candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_threshold: Option<Severity>,
    /// Resource ceilings
    #[serde(default)]
    pub ceilings: CeilingsDocument,
    /// Whether the workload may reach the network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_allowed: Option<bool>,
    /// Whether the scratch area stays writable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_writable: Option<bool>,
    /// Absolute path prefixes code may reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<Vec<String>>,
    /// Blocked modules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_imports: Vec<NameRule>,
    /// Blocked callables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_callables: Vec<NameRule>,
    /// Textual pattern rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<PatternDocument>,
    /// Replace the base's lists instead of extending them
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replace_lists: bool,
}

impl PolicyDocument {
    /// Create an empty document with a name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Extend `base`
    #[must_use]
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Parse a YAML document
    ///
    /// # Errors
    /// Returns error if the document is malformed
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self, PolicyError> {
        serde_yaml::from_str(text).map_err(|source| PolicyError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse a TOML document
    ///
    /// # Errors
    /// Returns error if the document is malformed
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, PolicyError> {
        toml::from_str(text).map_err(|source| PolicyError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Render as YAML
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_yaml(&self) -> Result<String, PolicyError> {
        serde_yaml::to_string(self).map_err(|e| PolicyError::Serialization(e.to_string()))
    }
}

/// Read every `*.yaml`, `*.yml` and `*.toml` document in `dir`, sorted by
/// file name
///
/// A missing directory yields no documents.
///
/// # Errors
/// Returns error if a file cannot be read or parsed
pub fn load_dir(dir: &Path) -> Result<Vec<PolicyDocument>, PolicyError> {
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "policies directory does not exist");
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| PolicyError::io_error(dir, e))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PolicyError::io_error(dir, e))?;
        paths.push(entry.path());
    }
    paths.sort();

    let mut documents = Vec::new();
    for path in paths {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let parse: fn(&str, &Path) -> Result<PolicyDocument, PolicyError> = match ext {
            "yaml" | "yml" => PolicyDocument::from_yaml,
            "toml" => PolicyDocument::from_toml,
            _ => continue,
        };
        let text = std::fs::read_to_string(&path).map_err(|e| PolicyError::io_error(&path, e))?;
        let document = parse(&text, &path)?;
        if document.name.trim().is_empty() {
            return Err(PolicyError::MissingName { path });
        }
        tracing::info!(policy = %document.name, file = %path.display(), "custom policy loaded");
        documents.push(document);
    }
    Ok(documents)
}
