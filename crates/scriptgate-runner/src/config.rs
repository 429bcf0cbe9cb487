//! Runner configuration

use scriptgate_model::Language;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default search path handed to workloads
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// uid/gid of `nobody`, used when the runner starts as root
pub const NOBODY: u32 = 65534;

/// Interpreter invocation for one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCommand {
    /// Executable name or absolute path
    pub program: String,
    /// Arguments placed before the script path
    #[serde(default)]
    pub args: Vec<String>,
}

impl RuntimeCommand {
    /// Command with fixed leading arguments
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `python3` in isolated mode without bytecode writes
    #[must_use]
    pub fn python() -> Self {
        Self::new("python3", ["-I", "-B"])
    }

    /// `node`
    #[must_use]
    pub fn node() -> Self {
        Self::new("node", Vec::<String>::new())
    }
}

/// Execution runner settings
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Python interpreter
    pub python: RuntimeCommand,
    /// JavaScript interpreter
    pub javascript: RuntimeCommand,
    /// Parent directory for per-run scratch areas; system temp when `None`
    pub scratch_root: Option<PathBuf>,
    /// How often `/proc` is sampled while the workload runs
    pub sample_interval: Duration,
    /// Time between SIGTERM and SIGKILL when tearing a workload down
    pub kill_grace: Duration,
    /// CPU time tolerated past the ceiling before the sampler steps in
    pub cpu_slack: Duration,
    /// Identity workloads drop to when the runner is root
    pub sandbox_uid: u32,
    /// Group workloads drop to when the runner is root
    pub sandbox_gid: u32,
    /// `PATH` seen by the workload
    pub path_env: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python: RuntimeCommand::python(),
            javascript: RuntimeCommand::node(),
            scratch_root: None,
            sample_interval: Duration::from_millis(50),
            kill_grace: Duration::from_millis(500),
            cpu_slack: Duration::from_secs(2),
            sandbox_uid: NOBODY,
            sandbox_gid: NOBODY,
            path_env: DEFAULT_PATH.to_string(),
        }
    }
}

impl RunnerConfig {
    /// Interpreter for `language`
    #[must_use]
    pub fn runtime(&self, language: Language) -> &RuntimeCommand {
        match language {
            Language::Python => &self.python,
            Language::JavaScript => &self.javascript,
        }
    }

    /// Script file name written into scratch
    #[must_use]
    pub fn script_name(language: Language) -> &'static str {
        match language {
            Language::Python => "main.py",
            Language::JavaScript => "main.js",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.runtime(Language::Python).program, "python3");
        assert_eq!(config.runtime(Language::Python).args, vec!["-I", "-B"]);
        assert_eq!(config.runtime(Language::JavaScript).program, "node");
        assert_eq!(config.sandbox_uid, NOBODY);
        assert_eq!(RunnerConfig::script_name(Language::JavaScript), "main.js");
    }

    #[test]
    fn runtime_args_default_to_empty() {
        let cmd: RuntimeCommand = serde_json::from_str(r#"{"program": "/opt/py/bin/python3"}"#).unwrap();
        assert_eq!(cmd.program, "/opt/py/bin/python3");
        assert!(cmd.args.is_empty());
    }
}
