//! What gets executed and what it is given

use crate::error::RunnerError;
use scriptgate_model::{Fingerprint, Language, ScanResult};
use scriptgate_policy::SecurityPolicy;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Source code together with the passed scan that admits it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedSource {
    /// Request fingerprint, used to correlate audit events
    pub fingerprint: Fingerprint,
    /// Language to run as
    pub language: Language,
    /// Code, byte-for-byte as scanned
    pub source: String,
    /// Scan of `source`
    pub scan: ScanResult,
}

impl ApprovedSource {
    /// Bundle source with its scan
    #[must_use]
    pub fn new(fingerprint: Fingerprint, language: Language, source: String, scan: ScanResult) -> Self {
        Self {
            fingerprint,
            language,
            source,
            scan,
        }
    }

    /// Check that the scan admits exactly this code under `policy`
    ///
    /// # Errors
    /// Returns [`RunnerError::UnscannedCode`] naming the first failed check
    pub fn verify(&self, policy: &SecurityPolicy) -> Result<(), RunnerError> {
        if !self.scan.is_passed() {
            return Err(RunnerError::UnscannedCode(format!(
                "scan verdict is {}",
                self.scan.verdict()
            )));
        }
        if !self.scan.source_digest().matches(&self.source) {
            return Err(RunnerError::UnscannedCode(
                "source does not match the scanned digest".into(),
            ));
        }
        if self.scan.language() != self.language {
            return Err(RunnerError::UnscannedCode(format!(
                "scanned as {} but submitted as {}",
                self.scan.language(),
                self.language
            )));
        }
        if self.scan.policy() != policy.id() {
            return Err(RunnerError::UnscannedCode(format!(
                "scanned under policy '{}' but executing under '{}'",
                self.scan.policy(),
                policy.id()
            )));
        }
        Ok(())
    }
}

/// Inputs handed to a workload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionBindings {
    /// Bytes written to stdin, which is then closed
    pub stdin: Option<Vec<u8>>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Arguments after the script path
    pub args: Vec<String>,
    /// Files written into scratch, keyed by relative name
    pub files: BTreeMap<String, Vec<u8>>,
}

impl ExecutionBindings {
    /// No inputs
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set stdin
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a positional argument
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an input file
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }

    /// Reject bindings that would escape scratch or subvert the loader
    ///
    /// # Errors
    /// Returns [`RunnerError::InvalidBinding`] describing the offending entry
    pub fn validate(&self, script_name: &str) -> Result<(), RunnerError> {
        for name in self.files.keys() {
            let relative = scratch_relative(name)?;
            if relative == Path::new(script_name) {
                return Err(RunnerError::InvalidBinding(format!(
                    "input file '{name}' would overwrite the script"
                )));
            }
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(RunnerError::InvalidBinding(format!(
                    "invalid environment variable name '{key}'"
                )));
            }
            if key.starts_with("LD_") || key.starts_with("PYTHON") || key.starts_with("NODE_") {
                return Err(RunnerError::InvalidBinding(format!(
                    "environment variable '{key}' is reserved"
                )));
            }
        }
        if self.args.iter().any(|a| a.contains('\0')) {
            return Err(RunnerError::InvalidBinding("argument contains NUL".into()));
        }
        Ok(())
    }

    /// Write input files below `root`
    ///
    /// # Errors
    /// Returns error if a name escapes `root` or a write fails
    pub(crate) fn write_files(&self, root: &Path) -> Result<(), RunnerError> {
        for (name, contents) in &self.files {
            let path = root.join(scratch_relative(name)?);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RunnerError::io("create input dir", &e))?;
            }
            std::fs::write(&path, contents).map_err(|e| RunnerError::io("write input file", &e))?;
        }
        Ok(())
    }
}

/// Normalize `name` to a path that stays inside the scratch directory
fn scratch_relative(name: &str) -> Result<PathBuf, RunnerError> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RunnerError::InvalidBinding(format!(
                    "input file '{name}' escapes the scratch directory"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(RunnerError::InvalidBinding("input file name is empty".into()));
    }
    Ok(out)
}
