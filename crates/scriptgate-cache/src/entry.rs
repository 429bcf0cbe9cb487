//! Cache entries

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scriptgate_model::{ExecutionResult, Fingerprint, Language, PolicyId, ScanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a cache factory produces on a miss
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDraft {
    /// Language of `source`
    pub language: Language,
    /// Request prompt, kept for inspection
    pub prompt: String,
    /// Generated code
    pub source: String,
    /// Scan of `source`
    pub scan: ScanResult,
    /// Generator that produced the code
    pub generator: Option<String>,
}

/// How a lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Entry already existed
    Cached,
    /// This caller ran the factory
    Generated,
    /// Another caller's in-flight factory produced the entry
    Coalesced,
}

impl Origin {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Generated => "generated",
            Self::Coalesced => "coalesced",
        }
    }

    /// Whether no new generation happened for this caller
    #[must_use]
    pub fn is_hit(self) -> bool {
        !matches!(self, Self::Generated)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a cached script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request fingerprint; its hex form is the script id
    pub fingerprint: Fingerprint,
    /// Code language
    pub language: Language,
    /// Request prompt
    pub prompt: String,
    /// Generated code, byte-for-byte as scanned
    pub source: String,
    /// Scan that admitted the code
    pub scan: ScanResult,
    /// Generator that produced the code
    pub generator: Option<String>,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
    /// When the entry stops being served
    pub expires_at: DateTime<Utc>,
    /// Last lookup
    pub last_accessed_at: DateTime<Utc>,
    /// Number of lookups served
    pub access_count: u64,
    /// Most recent execution of this code
    pub last_execution: Option<ExecutionResult>,
}

impl CacheEntry {
    /// Stable textual script id
    #[must_use]
    pub fn script_id(&self) -> String {
        self.fingerprint.to_string()
    }

    /// Policy the code was admitted under
    #[must_use]
    pub fn policy(&self) -> &PolicyId {
        self.scan.policy()
    }

    /// Whether the entry has expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Listing row for this entry
    #[must_use]
    pub fn summary(&self) -> CacheSummary {
        CacheSummary {
            script_id: self.fingerprint,
            language: self.language,
            policy: self.policy().clone(),
            created_at: self.created_at,
            access_count: self.access_count,
            executed: self.last_execution.is_some(),
        }
    }
}

/// Row returned by [`ResultCache::list`](crate::ResultCache::list)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSummary {
    /// Fingerprint
    pub script_id: Fingerprint,
    /// Code language
    pub language: Language,
    /// Policy the code was admitted under
    pub policy: PolicyId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Lookups served
    pub access_count: u64,
    /// Whether the code has been executed
    pub executed: bool,
}

#[derive(Debug)]
struct EntryState {
    last_accessed_at: DateTime<Utc>,
    access_count: u64,
    last_execution: Option<ExecutionResult>,
}

/// Shared cache slot: immutable content plus small mutable bookkeeping
#[derive(Debug)]
pub(crate) struct EntryCell {
    fingerprint: Fingerprint,
    language: Language,
    prompt: String,
    source: String,
    scan: ScanResult,
    generator: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: Mutex<EntryState>,
}

impl EntryCell {
    pub(crate) fn from_draft(fingerprint: Fingerprint, draft: CacheDraft, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            fingerprint,
            language: draft.language,
            prompt: draft.prompt,
            source: draft.source,
            scan: draft.scan,
            generator: draft.generator,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            state: Mutex::new(EntryState {
                last_accessed_at: now,
                access_count: 0,
                last_execution: None,
            }),
        }
    }

    pub(crate) fn from_entry(entry: CacheEntry) -> Self {
        Self {
            fingerprint: entry.fingerprint,
            language: entry.language,
            prompt: entry.prompt,
            source: entry.source,
            scan: entry.scan,
            generator: entry.generator,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            state: Mutex::new(EntryState {
                last_accessed_at: entry.last_accessed_at,
                access_count: entry.access_count,
                last_execution: entry.last_execution,
            }),
        }
    }

    pub(crate) fn snapshot(&self) -> CacheEntry {
        let state = self.state.lock();
        CacheEntry {
            fingerprint: self.fingerprint,
            language: self.language,
            prompt: self.prompt.clone(),
            source: self.source.clone(),
            scan: self.scan.clone(),
            generator: self.generator.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_accessed_at: state.last_accessed_at,
            access_count: state.access_count,
            last_execution: state.last_execution.clone(),
        }
    }

    pub(crate) fn touch(&self) {
        let mut state = self.state.lock();
        state.last_accessed_at = Utc::now();
        state.access_count += 1;
    }

    pub(crate) fn record_execution(&self, result: ExecutionResult) {
        self.state.lock().last_execution = Some(result);
    }

    pub(crate) fn is_admitted(&self) -> bool {
        self.scan.is_passed()
    }

    pub(crate) fn language(&self) -> Language {
        self.language
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time left before expiry, zero once past
    pub(crate) fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptgate_model::{Severity, SourceDigest};

    fn draft() -> CacheDraft {
        let source = "print('hi')\n".to_string();
        CacheDraft {
            language: Language::Python,
            prompt: "say hi".into(),
            scan: ScanResult::evaluate(
                Vec::new(),
                PolicyId::new("moderate", 1),
                Language::Python,
                Severity::Medium,
                SourceDigest::of(&source),
            ),
            source,
            generator: Some("static".into()),
        }
    }

    #[test]
    fn snapshot_round_trips_through_cell() {
        let fp = Fingerprint::new([7; 32]);
        let cell = EntryCell::from_draft(fp, draft(), Duration::from_secs(60));
        cell.touch();
        let snapshot = cell.snapshot();
        assert_eq!(snapshot.access_count, 1);
        assert_eq!(snapshot.script_id(), fp.to_string());

        let again = EntryCell::from_entry(snapshot.clone()).snapshot();
        assert_eq!(again, snapshot);
    }

    #[test]
    fn expiry_window() {
        let cell = EntryCell::from_draft(Fingerprint::new([1; 32]), draft(), Duration::from_secs(60));
        let remaining = cell.remaining();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
        assert!(!cell.snapshot().is_expired_at(Utc::now()));
    }

    #[test]
    fn origin_hits() {
        assert!(Origin::Cached.is_hit());
        assert!(Origin::Coalesced.is_hit());
        assert!(!Origin::Generated.is_hit());
    }
}
