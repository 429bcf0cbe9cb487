//! Compiled, immutable security policies

use crate::document::{
    CeilingsDocument, NameRule, PatternDocument, PolicyDocument, PolicyMode,
};
use crate::error::PolicyError;
use regex::Regex;
use scriptgate_model::{Language, PolicyId, Severity};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Numeric resource ceilings enforced by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCeilings {
    /// CPU time
    pub cpu_time: Duration,
    /// Memory in bytes
    pub memory_bytes: u64,
    /// Wall-clock timeout
    pub wall_timeout: Duration,
    /// Captured bytes per output stream
    pub max_output_bytes: u64,
    /// Largest file the workload may write
    pub max_file_size_bytes: u64,
    /// Process/thread count for the sandbox identity
    pub max_processes: u64,
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self {
            cpu_time: Duration::from_secs(30),
            memory_bytes: 256 * MIB,
            wall_timeout: Duration::from_secs(60),
            max_output_bytes: 64 * 1024,
            max_file_size_bytes: 5 * MIB,
            max_processes: 50,
        }
    }
}

impl ResourceCeilings {
    fn apply(self, doc: &CeilingsDocument) -> Self {
        Self {
            cpu_time: doc.cpu_time_secs.map_or(self.cpu_time, Duration::from_secs),
            memory_bytes: doc.memory_mb.map_or(self.memory_bytes, |mb| mb * MIB),
            wall_timeout: doc
                .wall_timeout_secs
                .map_or(self.wall_timeout, Duration::from_secs),
            max_output_bytes: doc.max_output_bytes.unwrap_or(self.max_output_bytes),
            max_file_size_bytes: doc
                .max_file_size_mb
                .map_or(self.max_file_size_bytes, |mb| mb * MIB),
            max_processes: doc.max_processes.unwrap_or(self.max_processes),
        }
    }

    fn to_document(self) -> CeilingsDocument {
        CeilingsDocument {
            cpu_time_secs: Some(self.cpu_time.as_secs()),
            memory_mb: Some(self.memory_bytes / MIB),
            wall_timeout_secs: Some(self.wall_timeout.as_secs()),
            max_output_bytes: Some(self.max_output_bytes),
            max_file_size_mb: Some(self.max_file_size_bytes / MIB),
            max_processes: Some(self.max_processes),
        }
    }
}

/// A compiled textual pattern rule
#[derive(Debug, Clone)]
pub struct PatternRule {
    name: String,
    regex: Regex,
    severity: Severity,
    message: String,
    languages: Vec<Language>,
}

impl PatternRule {
    /// Compile a pattern document
    ///
    /// # Errors
    /// Returns error if the regular expression is invalid
    pub fn compile(doc: &PatternDocument) -> Result<Self, PolicyError> {
        let regex = Regex::new(&doc.pattern).map_err(|source| PolicyError::InvalidPattern {
            rule: doc.name.clone(),
            source,
        })?;
        Ok(Self {
            name: doc.name.clone(),
            regex,
            severity: doc.severity,
            message: doc
                .message
                .clone()
                .unwrap_or_else(|| format!("matched pattern rule '{}'", doc.name)),
            languages: doc.languages.clone(),
        })
    }

    /// Rule name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compiled expression
    #[inline]
    #[must_use]
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Severity of a match
    #[inline]
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Message reported with a match
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the rule applies to `language`
    #[inline]
    #[must_use]
    pub fn applies_to(&self, language: Language) -> bool {
        self.languages.is_empty() || self.languages.contains(&language)
    }

    fn to_document(&self) -> PatternDocument {
        PatternDocument {
            name: self.name.clone(),
            pattern: self.regex.as_str().to_string(),
            severity: self.severity,
            message: Some(self.message.clone()),
            languages: self.languages.clone(),
        }
    }

    fn key(&self) -> (&str, &str) {
        (&self.name, self.regex.as_str())
    }
}

/// An immutable security policy snapshot
///
/// Built once by [`SecurityPolicy::compile`] or [`merge`]; never mutated
/// afterwards. A reload produces a new value with a new version.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    id: PolicyId,
    description: String,
    mode: PolicyMode,
    reject_threshold: Severity,
    blocked_imports: BTreeMap<String, Severity>,
    blocked_callables: BTreeMap<String, Severity>,
    patterns: Vec<PatternRule>,
    ceilings: ResourceCeilings,
    network_allowed: bool,
    filesystem_writable: bool,
    allowed_paths: Vec<String>,
    digest: String,
}

impl SecurityPolicy {
    /// Empty policy every standalone document is compiled onto
    fn baseline() -> Self {
        Self {
            id: PolicyId::new("baseline", 1),
            description: String::new(),
            mode: PolicyMode::Custom,
            reject_threshold: PolicyMode::Custom.default_threshold(),
            blocked_imports: BTreeMap::new(),
            blocked_callables: BTreeMap::new(),
            patterns: Vec::new(),
            ceilings: ResourceCeilings::default(),
            network_allowed: false,
            filesystem_writable: false,
            allowed_paths: Vec::new(),
            digest: String::new(),
        }
    }

    /// Compile a standalone document
    ///
    /// Unset fields take the conservative defaults: no network, read-only
    /// scratch, moderate ceilings.
    ///
    /// # Errors
    /// Returns error if a pattern does not compile
    pub fn compile(doc: &PolicyDocument) -> Result<Self, PolicyError> {
        let mut doc = doc.clone();
        if doc.reject_threshold.is_none() {
            doc.reject_threshold = doc.mode.map(PolicyMode::default_threshold);
        }
        merge(&Self::baseline(), &doc)
    }

    /// Identifier and version
    #[inline]
    #[must_use]
    pub fn id(&self) -> &PolicyId {
        &self.id
    }

    /// Policy name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Description
    #[inline]
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declared mode
    #[inline]
    #[must_use]
    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    /// Findings at or above this severity reject a candidate
    #[inline]
    #[must_use]
    pub fn reject_threshold(&self) -> Severity {
        self.reject_threshold
    }

    /// Blocked module names and their severities
    #[inline]
    #[must_use]
    pub fn blocked_imports(&self) -> &BTreeMap<String, Severity> {
        &self.blocked_imports
    }

    /// Blocked callable names and their severities
    #[inline]
    #[must_use]
    pub fn blocked_callables(&self) -> &BTreeMap<String, Severity> {
        &self.blocked_callables
    }

    /// Textual pattern rules
    #[inline]
    #[must_use]
    pub fn patterns(&self) -> &[PatternRule] {
        &self.patterns
    }

    /// Resource ceilings
    #[inline]
    #[must_use]
    pub fn ceilings(&self) -> &ResourceCeilings {
        &self.ceilings
    }

    /// Whether the workload may reach the network
    #[inline]
    #[must_use]
    pub fn network_allowed(&self) -> bool {
        self.network_allowed
    }

    /// Whether the scratch area stays writable during execution
    #[inline]
    #[must_use]
    pub fn filesystem_writable(&self) -> bool {
        self.filesystem_writable
    }

    /// Absolute path prefixes code may reference
    #[inline]
    #[must_use]
    pub fn allowed_paths(&self) -> &[String] {
        &self.allowed_paths
    }

    /// Whether `path` lies under an allowed root
    #[must_use]
    pub fn path_allowed(&self, path: &str) -> bool {
        self.allowed_paths.iter().any(|root| {
            let root = root.trim_end_matches('/');
            root.is_empty()
                || path == root
                || path
                    .strip_prefix(root)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// SHA-256 of the canonical document, hex encoded
    #[inline]
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Same policy under another version
    #[must_use]
    pub(crate) fn with_version(mut self, version: u32) -> Self {
        self.id.version = version;
        self
    }

    /// Fully explicit document describing this policy
    #[must_use]
    pub fn to_document(&self) -> PolicyDocument {
        PolicyDocument {
            name: self.id.name.clone(),
            description: Some(self.description.clone()).filter(|d| !d.is_empty()),
            base: None,
            mode: Some(self.mode),
            reject_threshold: Some(self.reject_threshold),
            ceilings: self.ceilings.to_document(),
            network_allowed: Some(self.network_allowed),
            filesystem_writable: Some(self.filesystem_writable),
            allowed_paths: Some(self.allowed_paths.clone()),
            blocked_imports: rules_to_document(&self.blocked_imports),
            blocked_callables: rules_to_document(&self.blocked_callables),
            patterns: self.patterns.iter().map(PatternRule::to_document).collect(),
            replace_lists: false,
        }
    }

    fn compute_digest(&self) -> Result<String, PolicyError> {
        let bytes = serde_json::to_vec(&self.to_document())
            .map_err(|e| PolicyError::Serialization(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

fn rules_to_document(rules: &BTreeMap<String, Severity>) -> Vec<NameRule> {
    rules
        .iter()
        .map(|(name, severity)| NameRule::new(name.clone(), *severity))
        .collect()
}

fn union_rules(target: &mut BTreeMap<String, Severity>, rules: &[NameRule]) {
    for rule in rules {
        let severity = rule.severity();
        target
            .entry(rule.name().to_string())
            .and_modify(|existing| *existing = (*existing).max(severity))
            .or_insert(severity);
    }
}

/// Produce a new policy from `base` and `overrides`
///
/// Scalar fields present in `overrides` replace the base's. Blocked imports,
/// callables and patterns union with the base, keeping the higher severity
/// for duplicates, unless `overrides.replace_lists` is set. The result is a
/// [`PolicyMode::Custom`] policy unless the overrides name a mode.
///
/// # Errors
/// Returns error if an override pattern does not compile
pub fn merge(base: &SecurityPolicy, overrides: &PolicyDocument) -> Result<SecurityPolicy, PolicyError> {
    let name = if overrides.name.trim().is_empty() {
        base.id.name.clone()
    } else {
        overrides.name.trim().to_string()
    };

    let (mut blocked_imports, mut blocked_callables, mut patterns) = if overrides.replace_lists {
        (BTreeMap::new(), BTreeMap::new(), Vec::new())
    } else {
        (
            base.blocked_imports.clone(),
            base.blocked_callables.clone(),
            base.patterns.clone(),
        )
    };
    union_rules(&mut blocked_imports, &overrides.blocked_imports);
    union_rules(&mut blocked_callables, &overrides.blocked_callables);

    for doc in &overrides.patterns {
        let rule = PatternRule::compile(doc)?;
        match patterns.iter_mut().find(|p| p.key() == rule.key()) {
            Some(existing) => existing.severity = existing.severity.max(rule.severity),
            None => patterns.push(rule),
        }
    }

    let mut policy = SecurityPolicy {
        id: PolicyId::new(name, 1),
        description: overrides
            .description
            .clone()
            .unwrap_or_else(|| base.description.clone()),
        mode: overrides.mode.unwrap_or(PolicyMode::Custom),
        reject_threshold: overrides.reject_threshold.unwrap_or(base.reject_threshold),
        blocked_imports,
        blocked_callables,
        patterns,
        ceilings: base.ceilings.apply(&overrides.ceilings),
        network_allowed: overrides.network_allowed.unwrap_or(base.network_allowed),
        filesystem_writable: overrides
            .filesystem_writable
            .unwrap_or(base.filesystem_writable),
        allowed_paths: overrides
            .allowed_paths
            .clone()
            .unwrap_or_else(|| base.allowed_paths.clone()),
        digest: String::new(),
    };
    policy.digest = policy.compute_digest()?;
    Ok(policy)
}
