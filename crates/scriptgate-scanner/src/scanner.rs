//! Policy-driven scan over the abstract syntax tree and the raw text

use crate::adapters::{JavaScriptAdapter, LanguageAdapter, PythonAdapter};
use crate::error::ParseError;
use crate::tree::{LineIndex, NodeKind, Span, SyntaxNode};
use rayon::prelude::*;
use scriptgate_model::{Language, ScanFinding, ScanResult, Severity, SourceDigest, Verdict};
use scriptgate_policy::SecurityPolicy;
use std::collections::BTreeMap;

/// Rule name for a blocked module reference
pub const RULE_BLOCKED_IMPORT: &str = "blocked-import";
/// Rule name for a blocked callee
pub const RULE_BLOCKED_CALL: &str = "blocked-call";
/// Rule name for a path literal outside the allowlist
pub const RULE_PATH_OUTSIDE_ALLOWLIST: &str = "path-outside-allowlist";
/// Rule name for unparsable source
pub const RULE_SYNTAX_ERROR: &str = "syntax-error";

/// Longest matched text kept in a finding
const MAX_MATCHED_CHARS: usize = 80;

/// Stateless security scanner
///
/// `scan` is a pure function of `(source, language, policy)`: no I/O, no
/// shared mutable state, so one scanner may serve any number of threads.
pub struct Scanner {
    adapters: Vec<Box<dyn LanguageAdapter>>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field(
                "languages",
                &self.adapters.iter().map(|a| a.language()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    /// Scanner with the Python and JavaScript adapters
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: vec![Box::new(PythonAdapter), Box::new(JavaScriptAdapter)],
        }
    }

    /// Languages this scanner can parse
    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.adapters.iter().map(|a| a.language())
    }

    fn adapter(&self, language: Language) -> Option<&dyn LanguageAdapter> {
        self.adapters
            .iter()
            .find(|a| a.language() == language)
            .map(AsRef::as_ref)
    }

    /// Scan `source` as `language` under `policy`
    ///
    /// Never fails: source that does not parse, or a language without an
    /// adapter, yields a REJECTED result carrying a critical
    /// `syntax-error` finding.
    #[tracing::instrument(skip_all, fields(language = %language, policy = %policy.id()))]
    pub fn scan(&self, source: &str, language: Language, policy: &SecurityPolicy) -> ScanResult {
        let index = LineIndex::new(source);
        let mut findings = Vec::new();

        let parsed = match self.adapter(language) {
            Some(adapter) => adapter.parse(source),
            None => Err(ParseError::Grammar {
                language: language.name().to_string(),
                message: "no adapter registered".into(),
            }),
        };
        match parsed {
            Ok(tree) => walk_tree(&tree, policy, &mut findings),
            Err(err) => {
                let (line, column) = err.position();
                tracing::debug!(%err, "source did not parse");
                findings.push(ScanFinding {
                    rule: RULE_SYNTAX_ERROR.into(),
                    severity: Severity::Critical,
                    line,
                    column,
                    message: err.to_string(),
                    matched: String::new(),
                });
            }
        }

        for rule in policy.patterns().iter().filter(|r| r.applies_to(language)) {
            for m in rule.regex().find_iter(source) {
                let span = index.span(m.start());
                findings.push(ScanFinding {
                    rule: rule.name().to_string(),
                    severity: rule.severity(),
                    line: span.line,
                    column: span.column,
                    message: rule.message().to_string(),
                    matched: clip(m.as_str()),
                });
            }
        }

        findings.sort_by(|a, b| {
            (a.line, a.column, &a.rule, &a.matched).cmp(&(b.line, b.column, &b.rule, &b.matched))
        });
        findings.dedup();

        let result = ScanResult::evaluate(
            findings,
            policy.id().clone(),
            language,
            policy.reject_threshold(),
            SourceDigest::of(source),
        );

        let verdict = match result.verdict() {
            Verdict::Passed => "passed",
            Verdict::Rejected => "rejected",
        };
        metrics::counter!("scriptgate_scans_total", "verdict" => verdict).increment(1);
        tracing::debug!(verdict, findings = result.findings().len(), "scan complete");
        result
    }

    /// Scan many independent sources in parallel
    ///
    /// Results come back in input order.
    #[must_use]
    pub fn scan_many(
        &self,
        sources: &[(String, Language)],
        policy: &SecurityPolicy,
    ) -> Vec<ScanResult> {
        sources
            .par_iter()
            .map(|(source, language)| self.scan(source, *language, policy))
            .collect()
    }
}

fn clip(text: &str) -> String {
    text.chars().take(MAX_MATCHED_CHARS).collect()
}

fn finding(rule: &str, severity: Severity, span: Span, message: String, matched: &str) -> ScanFinding {
    ScanFinding {
        rule: rule.into(),
        severity,
        line: span.line,
        column: span.column,
        message,
        matched: clip(matched),
    }
}

fn walk_tree(tree: &SyntaxNode, policy: &SecurityPolicy, findings: &mut Vec<ScanFinding>) {
    for node in tree.walk() {
        match node.kind {
            NodeKind::Module => {}
            NodeKind::Import => {
                if let Some((blocked, severity)) = blocked_import(&node.name, policy.blocked_imports()) {
                    findings.push(finding(
                        RULE_BLOCKED_IMPORT,
                        severity,
                        node.span,
                        format!("import of blocked module '{blocked}'"),
                        &node.name,
                    ));
                }
            }
            NodeKind::Call => {
                if let Some((blocked, severity)) = blocked_call(&node.name, policy.blocked_callables()) {
                    findings.push(finding(
                        RULE_BLOCKED_CALL,
                        severity,
                        node.span,
                        format!("call to blocked function '{blocked}'"),
                        &node.name,
                    ));
                }
            }
            NodeKind::PathLiteral => {
                if !policy.path_allowed(&node.name) {
                    findings.push(finding(
                        RULE_PATH_OUTSIDE_ALLOWLIST,
                        Severity::Medium,
                        node.span,
                        format!("path '{}' is outside the allowed paths", node.name),
                        &node.name,
                    ));
                }
            }
        }
    }
}

/// Longest blocked module that `name` equals or lives under
fn blocked_import<'p>(
    name: &str,
    blocked: &'p BTreeMap<String, Severity>,
) -> Option<(&'p str, Severity)> {
    blocked
        .iter()
        .filter(|(module, _)| {
            name == module.as_str()
                || name
                    .strip_prefix(module.as_str())
                    .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('/'))
        })
        .max_by_key(|(module, _)| module.len())
        .map(|(module, severity)| (module.as_str(), *severity))
}

/// Most severe blocked callable matching `callee` by full name or dotted suffix
///
/// Resolution is by literal name only: `from os import system as s; s()`
/// is not caught here.
fn blocked_call<'p>(
    callee: &str,
    blocked: &'p BTreeMap<String, Severity>,
) -> Option<(&'p str, Severity)> {
    blocked
        .iter()
        .filter(|(name, _)| {
            callee == name.as_str()
                || callee
                    .strip_suffix(name.as_str())
                    .is_some_and(|head| head.ends_with('.'))
        })
        .max_by_key(|(name, severity)| (**severity, name.len()))
        .map(|(name, severity)| (name.as_str(), *severity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use scriptgate_policy::{NameRule, PolicyDocument, PolicyRegistry};

    fn builtin(name: &str) -> std::sync::Arc<SecurityPolicy> {
        PolicyRegistry::with_builtins().unwrap().resolve(name).unwrap()
    }

    fn rules(result: &ScanResult) -> Vec<&str> {
        result.findings().iter().map(|f| f.rule.as_str()).collect()
    }

    #[test]
    fn strict_rejects_single_blocked_call() {
        let policy = builtin("strict");
        let result = Scanner::new().scan("x = eval('1 + 1')\nprint(x)\n", Language::Python, &policy);

        assert_eq!(result.verdict(), Verdict::Rejected);
        assert_eq!(result.findings().len(), 1);
        let finding = &result.findings()[0];
        assert_eq!(finding.rule, RULE_BLOCKED_CALL);
        assert_eq!(finding.matched, "eval");
        assert!(finding.severity >= Severity::Low);
        assert_eq!((finding.line, finding.column), (1, 5));
    }

    #[test]
    fn permissive_passes_clean_code() {
        let policy = builtin("permissive");
        let source = "def fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\n\nprint(fib(10))\n";
        let result = Scanner::new().scan(source, Language::Python, &policy);

        assert!(result.is_passed());
        assert!(result.findings().is_empty());
        assert!(result.source_digest().matches(source));
    }

    #[test]
    fn dotted_prefix_import_matches() {
        let policy = builtin("moderate");
        let result = Scanner::new().scan("import urllib.request\n", Language::Python, &policy);
        assert_eq!(rules(&result), vec![RULE_BLOCKED_IMPORT]);
        assert_eq!(result.findings()[0].matched, "urllib.request");
        assert!(!result.is_passed());

        let clean = Scanner::new().scan("import urllibx\n", Language::Python, &policy);
        assert!(clean.findings().is_empty());
    }

    #[test]
    fn javascript_subpath_import_matches() {
        let policy = builtin("strict");
        let result = Scanner::new().scan(
            "const p = require('fs/promises');\n",
            Language::JavaScript,
            &policy,
        );
        assert_eq!(rules(&result), vec![RULE_BLOCKED_IMPORT]);
    }

    #[test]
    fn import_matching_is_case_sensitive() {
        let policy = builtin("strict");
        let result = Scanner::new().scan("import OS\n", Language::Python, &policy);
        assert!(result.findings().is_empty());
    }

    #[test]
    fn call_suffix_matching() {
        let policy = builtin("strict");
        let result = Scanner::new().scan("window.eval('x');\n", Language::JavaScript, &policy);
        assert_eq!(rules(&result), vec![RULE_BLOCKED_CALL]);
        assert_eq!(result.findings()[0].severity, Severity::Critical);

        let clean = Scanner::new().scan("medieval('x');\n", Language::JavaScript, &policy);
        assert!(clean.findings().is_empty());
    }

    #[test]
    fn aliased_call_is_not_resolved() {
        let mut doc = PolicyDocument::named("calls");
        doc.blocked_callables = vec![NameRule::Bare("os.system".into())];
        let policy = SecurityPolicy::compile(&doc).unwrap();

        let result = Scanner::new().scan("from os import system as s\ns('ls')\n", Language::Python, &policy);
        assert!(result.findings().is_empty());
    }

    #[test]
    fn syntax_error_rejects() {
        let policy = builtin("permissive");
        let result = Scanner::new().scan("def broken(:\n", Language::Python, &policy);

        assert_eq!(result.verdict(), Verdict::Rejected);
        assert_eq!(rules(&result), vec![RULE_SYNTAX_ERROR]);
        assert_eq!(result.findings()[0].severity, Severity::Critical);
    }

    #[test]
    fn path_outside_allowlist() {
        let policy = builtin("moderate");
        let result = Scanner::new().scan(
            "a = '/tmp/out.txt'\nb = '/etc/passwd'\n",
            Language::Python,
            &policy,
        );
        assert_eq!(rules(&result), vec![RULE_PATH_OUTSIDE_ALLOWLIST]);
        assert_eq!(result.findings()[0].line, 2);
    }

    #[test]
    fn pattern_findings_carry_positions() {
        let policy = builtin("strict");
        let source = "const el = document.body;\nel.innerHTML = '<b>x</b>';\n";
        let result = Scanner::new().scan(source, Language::JavaScript, &policy);

        let dom = result
            .findings()
            .iter()
            .find(|f| f.rule == "dom-write")
            .unwrap();
        assert_eq!((dom.line, dom.column), (2, 3));
        assert_eq!(dom.matched, ".innerHTML =");
    }

    #[test]
    fn findings_below_threshold_pass() {
        let mut doc = PolicyDocument::named("lenient");
        doc.reject_threshold = Some(Severity::High);
        doc.blocked_callables = vec![NameRule::new("print", Severity::Low)];
        let policy = SecurityPolicy::compile(&doc).unwrap();

        let result = Scanner::new().scan("print('hi')\n", Language::Python, &policy);
        assert!(result.is_passed());
        assert_eq!(result.findings().len(), 1);
        assert_eq!(result.blocking().count(), 0);
    }

    #[test]
    fn findings_are_ordered() {
        let policy = builtin("strict");
        let source = "import os\nexec('x')\neval('y')\n";
        let result = Scanner::new().scan(source, Language::Python, &policy);
        let lines: Vec<_> = result.findings().iter().map(|f| f.line).collect();
        let mut sorted = lines.clone();
        sorted.sort_unstable();
        assert_eq!(lines, sorted);
    }

    #[test]
    fn scan_many_preserves_order() {
        let policy = builtin("strict");
        let sources = vec![
            ("print(1)\n".to_string(), Language::Python),
            ("eval('1')\n".to_string(), Language::Python),
            ("console.log(1);\n".to_string(), Language::JavaScript),
        ];
        let results = Scanner::new().scan_many(&sources, &policy);
        let verdicts: Vec<_> = results.iter().map(ScanResult::verdict).collect();
        assert_eq!(verdicts, vec![Verdict::Passed, Verdict::Rejected, Verdict::Passed]);
    }

    proptest! {
        #[test]
        fn scan_is_deterministic(source in "[a-z_().' /\n]{0,120}", js in any::<bool>()) {
            let policy = builtin("strict");
            let language = if js { Language::JavaScript } else { Language::Python };
            let scanner = Scanner::new();
            let first = scanner.scan(&source, language, &policy);
            let second = scanner.scan(&source, language, &policy);
            prop_assert_eq!(first, second);
        }
    }
}
