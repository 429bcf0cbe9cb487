//! Built-in policies: `strict`, `moderate` and `permissive`

use crate::document::{CeilingsDocument, NameRule, PatternDocument, PolicyDocument, PolicyMode};
use scriptgate_model::{Language, Severity};

/// Name of the policy used when a request names none
pub const DEFAULT_POLICY: &str = "moderate";

/// Names of the built-in policies
pub const BUILTIN_NAMES: [&str; 3] = ["strict", "moderate", "permissive"];

fn rules(severity: Severity, names: &[&str]) -> Vec<NameRule> {
    names.iter().map(|n| NameRule::new(*n, severity)).collect()
}

fn ceilings(cpu: u64, memory_mb: u64, wall: u64, file_mb: u64, processes: u64) -> CeilingsDocument {
    CeilingsDocument {
        cpu_time_secs: Some(cpu),
        memory_mb: Some(memory_mb),
        wall_timeout_secs: Some(wall),
        max_output_bytes: Some(64 * 1024),
        max_file_size_mb: Some(file_mb),
        max_processes: Some(processes),
    }
}

fn browser_and_network_patterns(severity: Severity) -> Vec<PatternDocument> {
    vec![
        PatternDocument::new(
            "dom-write",
            r"document\.write\s*\(|\.innerHTML\s*=",
            severity,
            "writes raw markup into a document",
        )
        .only(Language::JavaScript),
        PatternDocument::new(
            "network-request",
            r"\bXMLHttpRequest\b|\bfetch\s*\(",
            severity,
            "performs a network request",
        )
        .only(Language::JavaScript),
    ]
}

/// Maximum restrictions; rejects anything at low severity or above
#[must_use]
pub fn strict() -> PolicyDocument {
    let mut blocked_callables = rules(
        Severity::Critical,
        &["eval", "exec", "compile", "__import__", "Function"],
    );
    blocked_callables.extend(rules(
        Severity::High,
        &[
            "open", "file", "input", "exit", "quit", "reload", "os.system", "os.popen",
            "setattr", "getattr", "globals",
        ],
    ));

    let mut patterns = vec![
        PatternDocument::new(
            "system-call",
            r"os\.system|os\.popen|subprocess\.",
            Severity::High,
            "spawns a shell or subprocess",
        )
        .only(Language::Python),
        PatternDocument::new(
            "encoded-payload",
            r"base64\.b64decode\s*\(|\batob\s*\(",
            Severity::Medium,
            "decodes an embedded payload",
        ),
        PatternDocument::new(
            "hex-escaped-string",
            r"(\\x[0-9a-fA-F]{2}){8,}",
            Severity::Medium,
            "long hex-escaped string often hides code",
        ),
        PatternDocument::new(
            "dunder-traversal",
            r"__(subclasses|globals|builtins|code)__",
            Severity::High,
            "walks interpreter internals",
        )
        .only(Language::Python),
    ];
    patterns.extend(browser_and_network_patterns(Severity::High));

    PolicyDocument {
        name: "strict".into(),
        description: Some("Strict security policy with maximum restrictions".into()),
        mode: Some(PolicyMode::Strict),
        reject_threshold: Some(Severity::Low),
        ceilings: ceilings(10, 128, 30, 1, 10),
        network_allowed: Some(false),
        filesystem_writable: Some(false),
        allowed_paths: Some(Vec::new()),
        blocked_imports: rules(
            Severity::High,
            &[
                "os", "subprocess", "sys", "shutil", "socket", "urllib", "requests", "pickle",
                "ctypes", "multiprocessing", "threading", "importlib", "child_process", "fs",
                "net", "http", "https", "dgram", "vm", "worker_threads", "cluster",
            ],
        ),
        blocked_callables,
        patterns,
        ..PolicyDocument::default()
    }
}

/// Balanced restrictions; rejects at medium severity or above
#[must_use]
pub fn moderate() -> PolicyDocument {
    let mut blocked_callables = rules(
        Severity::Critical,
        &["eval", "exec", "compile", "__import__", "Function"],
    );
    blocked_callables.extend(rules(
        Severity::Medium,
        &["exit", "quit", "reload", "os.system", "os.popen"],
    ));

    let mut patterns = vec![
        PatternDocument::new(
            "system-call",
            r"os\.system|subprocess\.",
            Severity::Low,
            "spawns a shell or subprocess",
        )
        .only(Language::Python),
        PatternDocument::new(
            "dunder-traversal",
            r"__(subclasses|globals|builtins|code)__",
            Severity::High,
            "walks interpreter internals",
        )
        .only(Language::Python),
    ];
    patterns.extend(browser_and_network_patterns(Severity::Medium));

    PolicyDocument {
        name: "moderate".into(),
        description: Some("Moderate security policy with balanced restrictions".into()),
        mode: Some(PolicyMode::Moderate),
        reject_threshold: Some(Severity::Medium),
        ceilings: ceilings(30, 256, 60, 5, 50),
        network_allowed: Some(false),
        filesystem_writable: Some(true),
        allowed_paths: Some(vec!["/tmp".into(), "/usr/share".into()]),
        blocked_imports: rules(
            Severity::High,
            &[
                "subprocess", "socket", "urllib", "requests", "pickle", "ctypes",
                "multiprocessing", "threading", "child_process", "net", "dgram", "vm",
                "worker_threads", "cluster",
            ],
        ),
        blocked_callables,
        patterns,
        ..PolicyDocument::default()
    }
}

/// Minimal restrictions; rejects only at high severity or above
#[must_use]
pub fn permissive() -> PolicyDocument {
    PolicyDocument {
        name: "permissive".into(),
        description: Some("Permissive security policy with minimal restrictions".into()),
        mode: Some(PolicyMode::Permissive),
        reject_threshold: Some(Severity::High),
        ceilings: ceilings(60, 512, 120, 10, 100),
        network_allowed: Some(false),
        filesystem_writable: Some(true),
        allowed_paths: Some(vec!["/".into()]),
        blocked_imports: rules(Severity::High, &["ctypes"]),
        blocked_callables: rules(
            Severity::High,
            &["eval", "exec", "compile", "__import__", "Function"],
        ),
        patterns: vec![PatternDocument::new(
            "risky-import",
            r"import\s+(subprocess|socket|urllib|requests|pickle)\b",
            Severity::Medium,
            "imports a module with process or network reach",
        )
        .only(Language::Python)],
        ..PolicyDocument::default()
    }
}

/// All built-in documents
#[must_use]
pub fn documents() -> Vec<PolicyDocument> {
    vec![strict(), moderate(), permissive()]
}
