//! Scan findings and verdicts

use crate::fingerprint::SourceDigest;
use crate::language::Language;
use crate::severity::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an immutable policy snapshot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyId {
    /// Policy name
    pub name: String,
    /// Monotonic version, bumped when a reload changes the policy's content
    pub version: u32,
}

impl PolicyId {
    /// Create policy id
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// A single rule match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFinding {
    /// Rule that matched
    pub rule: String,
    /// Declared severity of the rule
    pub severity: Severity,
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
    /// Human-readable explanation
    pub message: String,
    /// Source text that triggered the rule
    pub matched: String,
}

/// Overall scan outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// No blocking findings
    Passed,
    /// At least one finding at or above the reject threshold
    Rejected,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "PASSED",
            Self::Rejected => "REJECTED",
        })
    }
}

/// Result of scanning one source text under one policy
///
/// Immutable once produced. Build it with [`ScanResult::evaluate`], which
/// derives the verdict from the findings so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    findings: Vec<ScanFinding>,
    verdict: Verdict,
    policy: PolicyId,
    language: Language,
    reject_threshold: Severity,
    source_digest: SourceDigest,
}

impl ScanResult {
    /// Compute the verdict for `findings` against `reject_threshold`
    #[must_use]
    pub fn evaluate(
        findings: Vec<ScanFinding>,
        policy: PolicyId,
        language: Language,
        reject_threshold: Severity,
        source_digest: SourceDigest,
    ) -> Self {
        let verdict = if findings.iter().any(|f| f.severity >= reject_threshold) {
            Verdict::Rejected
        } else {
            Verdict::Passed
        };
        Self {
            findings,
            verdict,
            policy,
            language,
            reject_threshold,
            source_digest,
        }
    }

    /// All findings, ordered by location then rule
    #[inline]
    #[must_use]
    pub fn findings(&self) -> &[ScanFinding] {
        &self.findings
    }

    /// Overall verdict
    #[inline]
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// Whether the verdict is PASSED
    #[inline]
    #[must_use]
    pub fn is_passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }

    /// Policy snapshot used
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &PolicyId {
        &self.policy
    }

    /// Language the source was parsed as
    #[inline]
    #[must_use]
    pub fn language(&self) -> Language {
        self.language
    }

    /// Threshold the verdict was computed against
    #[inline]
    #[must_use]
    pub fn reject_threshold(&self) -> Severity {
        self.reject_threshold
    }

    /// Digest of the scanned source
    #[inline]
    #[must_use]
    pub fn source_digest(&self) -> &SourceDigest {
        &self.source_digest
    }

    /// Findings at or above the reject threshold
    pub fn blocking(&self) -> impl Iterator<Item = &ScanFinding> {
        self.findings
            .iter()
            .filter(move |f| f.severity >= self.reject_threshold)
    }

    /// Highest severity among the findings
    #[must_use]
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}
