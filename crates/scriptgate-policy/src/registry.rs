//! Process-wide policy table with atomic reload
//!
//! Readers take one [`Arc`] snapshot per operation and keep using it for the
//! whole operation. Reloads build a complete new [`PolicyTable`] off to the
//! side and publish it with a single pointer swap, so an in-flight request
//! sees either the old table or the new one, never a mix.
//!
//! Writers (reloads and default changes) are serialized by a separate guard
//! held from reading the current table until the swap, so two concurrent
//! reloads cannot both derive versions from the same predecessor.

use crate::builtin::{self, BUILTIN_NAMES, DEFAULT_POLICY};
use crate::document::{self, PolicyDocument};
use crate::error::PolicyError;
use crate::policy::{merge, SecurityPolicy};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An immutable set of policies
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: BTreeMap<String, Arc<SecurityPolicy>>,
    default: String,
    generation: u64,
}

impl PolicyTable {
    /// Look up a policy
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<SecurityPolicy>> {
        self.policies.get(name)
    }

    /// Name of the default policy
    #[inline]
    #[must_use]
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Policy names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// All policies in name order
    pub fn policies(&self) -> impl Iterator<Item = &Arc<SecurityPolicy>> {
        self.policies.values()
    }

    /// Number of swaps that produced this table
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Outcome of a reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Policies that did not exist before
    pub added: Vec<String>,
    /// Policies whose content changed (version bumped)
    pub changed: Vec<String>,
    /// Policies that disappeared
    pub removed: Vec<String>,
    /// Generation of the published table
    pub generation: u64,
}

impl ReloadReport {
    /// Whether the reload changed anything
    #[inline]
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Registry of named policies
#[derive(Debug)]
pub struct PolicyRegistry {
    table: RwLock<Arc<PolicyTable>>,
    writer: Mutex<()>,
    policies_dir: Option<PathBuf>,
}

impl PolicyRegistry {
    /// Registry holding only the built-in policies
    ///
    /// # Errors
    /// Returns error if a built-in fails to compile
    pub fn with_builtins() -> Result<Self, PolicyError> {
        let table = build_table(&[], None, DEFAULT_POLICY, 0)?;
        Ok(Self {
            table: RwLock::new(Arc::new(table)),
            writer: Mutex::new(()),
            policies_dir: None,
        })
    }

    /// Registry holding the built-ins plus every document in `dir`
    ///
    /// # Errors
    /// Returns error if a document cannot be read, parsed or merged
    pub fn from_dir(dir: impl Into<PathBuf>) -> Result<Self, PolicyError> {
        let dir = dir.into();
        let documents = document::load_dir(&dir)?;
        let table = build_table(&documents, None, DEFAULT_POLICY, 0)?;
        tracing::info!(count = table.policies.len(), dir = %dir.display(), "policies loaded");
        Ok(Self {
            table: RwLock::new(Arc::new(table)),
            writer: Mutex::new(()),
            policies_dir: Some(dir),
        })
    }

    /// Directory used by [`PolicyRegistry::reload_from_dir`]
    #[inline]
    #[must_use]
    pub fn policies_dir(&self) -> Option<&Path> {
        self.policies_dir.as_deref()
    }

    /// Current table snapshot
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicyTable> {
        Arc::clone(&self.table.read())
    }

    /// Resolve a policy by name
    ///
    /// # Errors
    /// Returns [`PolicyError::NotFound`] if no policy has that name
    pub fn resolve(&self, name: &str) -> Result<Arc<SecurityPolicy>, PolicyError> {
        self.snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(name.to_string()))
    }

    /// Resolve the default policy
    ///
    /// # Errors
    /// Returns error if the default name no longer resolves
    pub fn resolve_default(&self) -> Result<Arc<SecurityPolicy>, PolicyError> {
        let table = self.snapshot();
        table
            .get(table.default_name())
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(table.default_name().to_string()))
    }

    /// Resolve `name`, or the default when `None`
    ///
    /// # Errors
    /// Returns [`PolicyError::NotFound`] for unknown names
    pub fn resolve_or_default(&self, name: Option<&str>) -> Result<Arc<SecurityPolicy>, PolicyError> {
        match name {
            Some(name) => self.resolve(name),
            None => self.resolve_default(),
        }
    }

    /// Policy names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.snapshot().names().map(str::to_string).collect()
    }

    /// Render a policy as a fully explicit YAML document
    ///
    /// # Errors
    /// Returns error if the policy is unknown or cannot be serialized
    pub fn export(&self, name: &str) -> Result<String, PolicyError> {
        self.resolve(name)?.to_document().to_yaml()
    }

    /// Change the default policy
    ///
    /// # Errors
    /// Returns [`PolicyError::NotFound`] if `name` is unknown
    pub fn set_default(&self, name: &str) -> Result<(), PolicyError> {
        let _writer = self.writer.lock();
        let mut guard = self.table.write();
        if guard.get(name).is_none() {
            return Err(PolicyError::NotFound(name.to_string()));
        }
        let mut next = PolicyTable::clone(&guard);
        next.default = name.to_string();
        next.generation += 1;
        *guard = Arc::new(next);
        tracing::info!(policy = name, "default policy set");
        Ok(())
    }

    /// Replace all custom policies with `documents`
    ///
    /// The new table is built completely before it is published. Policies
    /// whose content is unchanged keep their version and snapshot.
    ///
    /// # Errors
    /// Returns error if any document fails; the current table stays active
    pub fn reload(&self, documents: &[PolicyDocument]) -> Result<ReloadReport, PolicyError> {
        let _writer = self.writer.lock();
        let current = self.snapshot();
        let default = if documents.iter().any(|d| d.name == current.default)
            || BUILTIN_NAMES.contains(&current.default.as_str())
        {
            current.default.clone()
        } else {
            DEFAULT_POLICY.to_string()
        };
        let next = build_table(documents, Some(&current), &default, current.generation + 1)?;

        let mut report = ReloadReport {
            generation: next.generation,
            ..ReloadReport::default()
        };
        for (name, policy) in &next.policies {
            match current.policies.get(name) {
                None => report.added.push(name.clone()),
                Some(old) if !Arc::ptr_eq(old, policy) => report.changed.push(name.clone()),
                Some(_) => {}
            }
        }
        report.removed = current
            .policies
            .keys()
            .filter(|name| !next.policies.contains_key(*name))
            .cloned()
            .collect();

        *self.table.write() = Arc::new(next);
        tracing::info!(
            generation = report.generation,
            added = report.added.len(),
            changed = report.changed.len(),
            removed = report.removed.len(),
            "policy table swapped"
        );
        Ok(report)
    }

    /// Reload from the directory given at construction
    ///
    /// # Errors
    /// Returns error if no directory is configured or loading fails
    pub fn reload_from_dir(&self) -> Result<ReloadReport, PolicyError> {
        let dir = self.policies_dir.as_deref().ok_or(PolicyError::NoPolicyDir)?;
        let documents = document::load_dir(dir)?;
        self.reload(&documents)
    }
}

/// Compile built-ins plus `documents`, resolving `base` references in
/// dependency order, and carry versions over from `previous`
fn build_table(
    documents: &[PolicyDocument],
    previous: Option<&PolicyTable>,
    default: &str,
    generation: u64,
) -> Result<PolicyTable, PolicyError> {
    let mut compiled: BTreeMap<String, SecurityPolicy> = BTreeMap::new();
    for doc in builtin::documents() {
        let policy = SecurityPolicy::compile(&doc)?;
        compiled.insert(policy.name().to_string(), policy);
    }

    let mut pending: Vec<&PolicyDocument> = documents.iter().collect();
    for doc in &pending {
        let shadows = BUILTIN_NAMES.contains(&doc.name.as_str());
        if shadows && doc.base.as_deref() != Some(doc.name.as_str()) {
            return Err(PolicyError::ShadowsBuiltin(doc.name.clone()));
        }
    }

    while !pending.is_empty() {
        let before = pending.len();
        let mut waiting = Vec::new();
        for doc in pending {
            let ready = match doc.base.as_deref() {
                None => Some(SecurityPolicy::compile(doc)?),
                Some(base) if base == doc.name => {
                    let base_policy = compiled.get(base).ok_or_else(|| PolicyError::UnknownBase {
                        policy: doc.name.clone(),
                        base: base.to_string(),
                    })?;
                    Some(merge(base_policy, doc)?)
                }
                Some(base) => match compiled.get(base) {
                    Some(base_policy) => Some(merge(base_policy, doc)?),
                    None => None,
                },
            };
            match ready {
                Some(policy) => {
                    compiled.insert(policy.name().to_string(), policy);
                }
                None => waiting.push(doc),
            }
        }
        if waiting.len() == before {
            let known: Vec<&str> = documents.iter().map(|d| d.name.as_str()).collect();
            if let Some(doc) = waiting.iter().find(|d| {
                d.base
                    .as_deref()
                    .is_some_and(|b| !known.contains(&b) && !compiled.contains_key(b))
            }) {
                return Err(PolicyError::UnknownBase {
                    policy: doc.name.clone(),
                    base: doc.base.clone().unwrap_or_default(),
                });
            }
            return Err(PolicyError::InheritanceCycle(
                waiting.iter().map(|d| d.name.clone()).collect(),
            ));
        }
        pending = waiting;
    }

    let policies = compiled
        .into_iter()
        .map(|(name, policy)| {
            let versioned = match previous.and_then(|t| t.policies.get(&name)) {
                Some(old) if old.digest() == policy.digest() => Arc::clone(old),
                Some(old) => Arc::new(policy.with_version(old.id().version + 1)),
                None => Arc::new(policy),
            };
            (name, versioned)
        })
        .collect::<BTreeMap<_, _>>();

    if !policies.contains_key(default) {
        return Err(PolicyError::NotFound(default.to_string()));
    }

    Ok(PolicyTable {
        policies,
        default: default.to_string(),
        generation,
    })
}
