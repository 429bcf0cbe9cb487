//! Boundary with external code generators
//!
//! Generators are collaborators: the pipeline hands them a request and
//! treats whatever comes back as untrusted text. [`FallbackGenerator`]
//! layers priority ordering, bounded retries with backoff, and health
//! checks over any number of concrete generators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulldown_cmark::{CodeBlockKind, Event, Parser as MdParser, Tag, TagEnd};
use scriptgate_model::{normalize_context, GenerationContext, GenerationParams, InputsSummary, Language};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// What a generator is asked to produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Task description
    pub prompt: String,
    /// Target language
    pub language: Language,
    /// Policy the result will be scanned under
    pub policy: String,
    /// Extra generation parameters
    #[serde(default)]
    pub params: GenerationParams,
    /// Caller context folded into the instructions
    #[serde(default, skip_serializing_if = "GenerationContext::is_empty")]
    pub context: GenerationContext,
}

impl GenerationRequest {
    /// Request for `prompt` in `language`
    pub fn new(prompt: impl Into<String>, language: Language, policy: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            language,
            policy: policy.into(),
            params: GenerationParams::new(),
            context: GenerationContext::new(),
        }
    }

    /// Add a context entry
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Task description as a generator should see it
    ///
    /// The prompt is cleaned, framed by the kind of task it describes and
    /// enriched with context. Context is read in normalized form, so two
    /// requests with the same fingerprint get the same task text.
    #[must_use]
    pub fn task(&self) -> String {
        let cleaned = clean_prompt(&self.prompt);
        let kind = TaskKind::detect(&cleaned);
        let enhanced = enhance_with_context(cleaned, &self.context);
        let task = kind.frame(&enhanced);
        tracing::debug!(
            prompt_len = self.prompt.len(),
            task_len = task.len(),
            kind = ?kind,
            "prompt processed"
        );
        task
    }

    /// Full instruction text for a language model
    #[must_use]
    pub fn instructions(&self) -> String {
        let guidance = match self.language {
            Language::Python => {
                "Use only the standard library. Handle exceptions. Print results to stdout."
            }
            Language::JavaScript => {
                "Use modern syntax with const/let. Run under Node without extra packages. \
                 Print results with console.log."
            }
        };
        format!(
            "Write a {} script that does the following:\n\n{}\n\n{guidance}\n\
             The script is checked against the '{}' security policy before it runs; \
             avoid network access, subprocesses and dynamic evaluation.\n\
             Reply with the code only.",
            self.language.name(),
            self.task(),
            self.policy,
        )
    }
}

/// Punctuation kept by [`clean_prompt`] besides letters, digits and `_`
const PROMPT_PUNCTUATION: &str = ".,!?;:()[]{}\"'`~@#$%^&*+=|\\/<>-";

/// Collapse whitespace runs to one space and drop control and other
/// unexpected characters
fn clean_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || PROMPT_PUNCTUATION.contains(*c))
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Broad category of a task, guessed from keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    DataProcessing,
    FileOperations,
    ApiIntegration,
    WebScraping,
    Automation,
    General,
}

impl TaskKind {
    /// Checked in order; the first kind with a matching keyword wins
    const KEYWORDS: [(Self, &'static [&'static str]); 5] = [
        (
            Self::DataProcessing,
            &["process", "analyze", "parse", "transform", "convert", "csv", "json", "data"],
        ),
        (
            Self::FileOperations,
            &["file", "read", "write", "create", "delete", "move", "copy", "directory", "folder"],
        ),
        (
            Self::ApiIntegration,
            &["api", "http", "request", "endpoint", "rest", "graphql", "fetch", "post", "get"],
        ),
        (
            Self::WebScraping,
            &["scrape", "crawl", "extract", "html", "website", "url"],
        ),
        (
            Self::Automation,
            &["automate", "schedule", "batch", "loop", "repeat", "workflow"],
        ),
    ];

    fn detect(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();
        Self::KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map_or(Self::General, |(kind, _)| *kind)
    }

    fn frame(self, task: &str) -> String {
        let lead = match self {
            Self::DataProcessing => "Process the following data",
            Self::FileOperations => "Perform file operations",
            Self::ApiIntegration => "Create API integration",
            Self::WebScraping => "Scrape web data",
            Self::Automation => "Automate task",
            Self::General => return task.to_string(),
        };
        format!("{lead}: {task}")
    }
}

/// Fold `files`, `data`, `environment` and the shape of `inputs` into the task
fn enhance_with_context(mut task: String, context: &GenerationContext) -> String {
    if context.is_empty() {
        return task;
    }
    let normalized = normalize_context(context);

    if let Some(files) = normalized.get("files") {
        task = format!("Given files: {}. {task}", render_list(files));
    }
    if let Some(data) = normalized.get("data") {
        task = format!("{task}\n\nContext: Data: {}", render(data));
    }
    if let Some(environment) = normalized.get("environment") {
        task = format!("{task}\n\nEnvironment: {}", render(environment));
    }
    if let Some(inputs) = InputsSummary::from_context(context) {
        let types: Vec<&str> = inputs.types.iter().map(|kind| kind.name()).collect();
        task = format!(
            "{task}\n\nThe function should accept {} parameters of types: {}",
            inputs.count,
            types.join(", ")
        );
    }
    task
}

/// Strings bare, everything else as JSON
fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_list(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(", "),
        other => render(other),
    }
}

/// A generator failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("generator '{provider}' failed: {message}")]
pub struct GenerationError {
    /// Generator that failed
    pub provider: String,
    /// What went wrong
    pub message: String,
    /// Whether trying again may help
    pub retryable: bool,
}

impl GenerationError {
    /// Failure worth retrying (timeouts, rate limits, empty replies)
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that will not go away on retry
    pub fn fatal(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Something that turns a prompt into source code
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Stable name used in stats and audit records
    fn name(&self) -> String;

    /// Produce candidate source for `request`
    ///
    /// # Errors
    /// Returns [`GenerationError`]; `retryable` says whether to try again
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    /// Whether the generator can currently take requests
    async fn health_check(&self) -> bool {
        true
    }
}

/// Exit status an external generator uses to ask for a retry
pub const EX_TEMPFAIL: i32 = 75;

/// Runs an external command per request
///
/// The request is written to stdin as JSON (with an extra `instructions`
/// field) and stdout is taken as the reply.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct CommandPayload<'a> {
    #[serde(flatten)]
    request: &'a GenerationRequest,
    instructions: String,
}

impl CommandGenerator {
    /// Generator named `name` running `program args...`
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, payload: Vec<u8>) -> Result<std::process::Output, GenerationError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GenerationError::fatal(&self.name, format!("cannot start {}: {e}", self.program)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // a generator may exit without reading; its status says why
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(GenerationError::transient(&self.name, format!("writing request: {e}")));
                }
            }
        }
        child
            .wait_with_output()
            .await
            .map_err(|e| GenerationError::transient(&self.name, format!("waiting for reply: {e}")))
    }
}

#[async_trait]
impl CodeGenerator for CommandGenerator {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let payload = serde_json::to_vec(&CommandPayload {
            request,
            instructions: request.instructions(),
        })
        .map_err(|e| GenerationError::fatal(&self.name, e.to_string()))?;

        let output = tokio::time::timeout(self.timeout, self.run(payload))
            .await
            .map_err(|_| {
                GenerationError::transient(&self.name, format!("no reply within {}s", self.timeout.as_secs()))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("exited with {}: {}", output.status, stderr.trim());
            return Err(match output.status.code() {
                Some(EX_TEMPFAIL) | None => GenerationError::transient(&self.name, message),
                Some(_) => GenerationError::fatal(&self.name, message),
            });
        }
        let reply = String::from_utf8(output.stdout)
            .map_err(|_| GenerationError::fatal(&self.name, "reply is not UTF-8"))?;
        if reply.trim().is_empty() {
            return Err(GenerationError::transient(&self.name, "empty reply"));
        }
        Ok(reply)
    }

    async fn health_check(&self) -> bool {
        if self.program.contains('/') {
            return std::path::Path::new(&self.program).is_file();
        }
        std::env::var_os("PATH")
            .is_some_and(|path| std::env::split_paths(&path).any(|dir| dir.join(&self.program).is_file()))
    }
}

/// Per-provider counters kept by [`FallbackGenerator`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Attempts made
    pub requests: u64,
    /// Attempts that produced code
    pub successes: u64,
    /// Attempts that failed
    pub failures: u64,
    /// Result of the latest health check
    pub healthy: bool,
    /// Time of the latest attempt
    pub last_used: Option<DateTime<Utc>>,
}

struct Provider {
    generator: Arc<dyn CodeGenerator>,
    name: String,
    priority: u32,
    max_attempts: u32,
    enabled: AtomicBool,
}

/// Tries generators in priority order until one produces code
///
/// Lower priority numbers go first. Each provider gets up to its
/// `max_attempts`, with exponential backoff between attempts, but only
/// retryable errors are retried. Providers failing their health check are
/// skipped.
pub struct FallbackGenerator {
    providers: Vec<Provider>,
    backoff: Duration,
    stats: DashMap<String, ProviderStats>,
}

impl std::fmt::Debug for FallbackGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackGenerator")
            .field("providers", &self.providers.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl FallbackGenerator {
    /// Empty chain with `backoff` as the first retry delay
    #[must_use]
    pub fn new(backoff: Duration) -> Self {
        Self {
            providers: Vec::new(),
            backoff,
            stats: DashMap::new(),
        }
    }

    /// Add a provider
    #[must_use]
    pub fn with_provider(mut self, generator: Arc<dyn CodeGenerator>, priority: u32, max_attempts: u32) -> Self {
        let name = generator.name();
        self.stats.insert(
            name.clone(),
            ProviderStats {
                healthy: true,
                ..ProviderStats::default()
            },
        );
        self.providers.push(Provider {
            generator,
            name,
            priority,
            max_attempts: max_attempts.max(1),
            enabled: AtomicBool::new(true),
        });
        // stable: equal priorities keep insertion order
        self.providers.sort_by_key(|p| p.priority);
        self
    }

    /// Provider names in the order they are tried
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }

    /// Enable or disable a provider; returns false if unknown
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let Some(provider) = self.providers.iter().find(|p| p.name == name) else {
            return false;
        };
        provider.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!(provider = name, enabled, "generator provider toggled");
        true
    }

    /// Snapshot of per-provider counters
    #[must_use]
    pub fn stats(&self) -> BTreeMap<String, ProviderStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn record(&self, name: &str, success: bool) {
        if let Some(mut stats) = self.stats.get_mut(name) {
            stats.requests += 1;
            stats.last_used = Some(Utc::now());
            if success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        }
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!("scriptgate_generations_total", "provider" => name.to_string(), "outcome" => outcome)
            .increment(1);
    }

    async fn healthy(&self, provider: &Provider) -> bool {
        let healthy = provider.generator.health_check().await;
        if let Some(mut stats) = self.stats.get_mut(&provider.name) {
            stats.healthy = healthy;
        }
        healthy
    }
}

#[async_trait]
impl CodeGenerator for FallbackGenerator {
    fn name(&self) -> String {
        "fallback".to_string()
    }

    #[tracing::instrument(skip_all, fields(language = %request.language))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let mut last_error = None;
        for provider in self.providers.iter().filter(|p| p.enabled.load(Ordering::Relaxed)) {
            if !self.healthy(provider).await {
                tracing::warn!(provider = %provider.name, "skipping unhealthy generator");
                continue;
            }
            for attempt in 0..provider.max_attempts {
                match provider.generator.generate(request).await {
                    Ok(code) => {
                        self.record(&provider.name, true);
                        tracing::debug!(provider = %provider.name, attempt, "generator succeeded");
                        return Ok(code);
                    }
                    Err(err) => {
                        self.record(&provider.name, false);
                        tracing::warn!(provider = %provider.name, attempt, error = %err, "generator failed");
                        let retry = err.retryable && attempt + 1 < provider.max_attempts;
                        last_error = Some(err);
                        if !retry {
                            break;
                        }
                        tokio::time::sleep(self.backoff * 2u32.saturating_pow(attempt)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| GenerationError::fatal("fallback", "no healthy generator available")))
    }

    async fn health_check(&self) -> bool {
        for provider in self.providers.iter().filter(|p| p.enabled.load(Ordering::Relaxed)) {
            if self.healthy(provider).await {
                return true;
            }
        }
        false
    }
}

/// Pull code out of a Markdown reply
///
/// Returns the first fenced block labelled for `language`, else the first
/// fenced block, else the reply unchanged.
#[must_use]
pub fn extract_code(reply: &str, language: Language) -> String {
    if !reply.contains("```") && !reply.contains("~~~") {
        return reply.to_string();
    }
    let mut blocks: Vec<(Option<String>, String)> = Vec::new();
    let mut current: Option<(Option<String>, String)> = None;
    for event in MdParser::new(reply) {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(label))) => {
                let label = label.split_whitespace().next().map(str::to_ascii_lowercase);
                current = Some((label, String::new()));
            }
            Event::Text(text) => {
                if let Some((_, ref mut code)) = current {
                    code.push_str(&text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
            }
            _ => {}
        }
    }
    let matches_language = |label: &Option<String>| {
        label
            .as_deref()
            .and_then(|l| l.parse::<Language>().ok())
            .is_some_and(|l| l == language)
    };
    blocks
        .iter()
        .find(|(label, _)| matches_language(label))
        .or_else(|| blocks.first())
        .map_or_else(|| reply.to_string(), |(_, code)| code.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    fn request() -> GenerationRequest {
        GenerationRequest::new("print the first ten primes", Language::Python, "moderate")
    }

    #[test]
    fn instructions_mention_language_and_policy() {
        let text = request().instructions();
        assert!(text.starts_with("Write a python script"));
        assert!(text.contains("print the first ten primes"));
        assert!(text.contains("'moderate'"));
    }

    #[test]
    fn prompt_whitespace_and_stray_characters_are_cleaned() {
        assert_eq!(
            clean_prompt("  sum\tthe   numbers\n\nin a list\u{7}  "),
            "sum the numbers in a list"
        );
        assert_eq!(clean_prompt("résumé: x <= 3 && y != 'a'"), "résumé: x <= 3 && y != 'a'");
        assert_eq!(clean_prompt("a \u{200b} b"), "a b");
    }

    #[test]
    fn task_kind_frames_the_prompt() {
        let framed = |prompt: &str| GenerationRequest::new(prompt, Language::Python, "moderate").task();
        assert_eq!(framed("convert a CSV to rows"), "Process the following data: convert a CSV to rows");
        assert_eq!(framed("copy a folder"), "Perform file operations: copy a folder");
        assert_eq!(framed("call the weather API"), "Create API integration: call the weather API");
        assert_eq!(framed("crawl a website"), "Scrape web data: crawl a website");
        assert_eq!(framed("schedule a backup"), "Automate task: schedule a backup");
        assert_eq!(framed("print the first ten primes"), "print the first ten primes");
        // data keywords win over later categories
        assert_eq!(TaskKind::detect("fetch json"), TaskKind::DataProcessing);
    }

    #[test]
    fn context_enriches_the_task() {
        let request = GenerationRequest::new("sum the numbers", Language::Python, "moderate")
            .with_context("files", serde_json::json!(["b.txt", "a.txt"]))
            .with_context("environment", serde_json::json!("ci"))
            .with_context("inputs", serde_json::json!([3, "4", "five"]));
        assert_eq!(
            request.task(),
            "Given files: a.txt, b.txt. sum the numbers\n\nEnvironment: ci\n\n\
             The function should accept 3 parameters of types: number, string"
        );
        let text = request.instructions();
        assert!(text.contains("Given files: a.txt, b.txt."));
        assert!(!text.contains("five"));
    }

    #[test]
    fn structured_data_context_is_rendered_as_json() {
        let request = GenerationRequest::new("summarize", Language::Python, "moderate")
            .with_context("data", serde_json::json!({"rows": 10, "columns": ["b", "a"]}));
        assert_eq!(
            request.task(),
            "summarize\n\nContext: Data: {\"columns\":[\"a\",\"b\"],\"rows\":10}"
        );
    }

    #[test]
    fn extract_prefers_matching_fence() {
        let reply = "Here you go:\n\n```bash\necho hi\n```\n\n```python\nprint('hi')\n```\n";
        assert_eq!(extract_code(reply, Language::Python), "print('hi')\n");
        assert_eq!(extract_code(reply, Language::JavaScript), "echo hi\n");
    }

    #[test]
    fn extract_leaves_plain_code_alone() {
        let code = "# heading-looking comment\nprint(1)\n";
        assert_eq!(extract_code(code, Language::Python), code);
    }

    proptest::proptest! {
        #[test]
        fn unfenced_replies_pass_through(text in "[a-z0-9 =()#\n]{0,200}") {
            proptest::prop_assert_eq!(extract_code(&text, Language::Python), text);
        }
    }

    #[test]
    fn extract_accepts_unlabelled_fence() {
        assert_eq!(extract_code("```\nconsole.log(1)\n```", Language::JavaScript), "console.log(1)\n");
    }

    fn mock(name: &'static str) -> MockCodeGenerator {
        let mut mock = MockCodeGenerator::new();
        mock.expect_name().return_const(name.to_string());
        mock.expect_health_check().returning(|| true);
        mock
    }

    #[tokio::test]
    async fn falls_back_in_priority_order() {
        let mut primary = mock("primary");
        primary
            .expect_generate()
            .times(1)
            .returning(|_| Err(GenerationError::fatal("primary", "bad key")));
        let mut backup = mock("backup");
        backup
            .expect_generate()
            .times(1)
            .returning(|_| Ok("print(1)\n".to_string()));

        let chain = FallbackGenerator::new(Duration::from_millis(1))
            .with_provider(Arc::new(backup), 2, 3)
            .with_provider(Arc::new(primary), 1, 3);
        assert_eq!(chain.provider_names(), vec!["primary", "backup"]);

        let code = chain.generate(&request()).await.unwrap();
        assert_eq!(code, "print(1)\n");
        let stats = chain.stats();
        assert_eq!(stats["primary"].failures, 1);
        assert_eq!(stats["backup"].successes, 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_up_to_the_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let mut flaky = mock("flaky");
        flaky.expect_generate().times(3).returning(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(GenerationError::transient("flaky", "rate limited"))
        });
        let chain = FallbackGenerator::new(Duration::from_millis(1)).with_provider(Arc::new(flaky), 1, 3);

        let err = chain.generate(&request()).await.unwrap_err();
        assert!(err.retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unhealthy_and_disabled_providers_are_skipped() {
        let mut sick = MockCodeGenerator::new();
        sick.expect_name().return_const("sick".to_string());
        sick.expect_health_check().returning(|| false);
        sick.expect_generate().never();
        let mut off = mock("off");
        off.expect_generate().never();
        let chain = FallbackGenerator::new(Duration::from_millis(1))
            .with_provider(Arc::new(sick), 1, 1)
            .with_provider(Arc::new(off), 2, 1);
        assert!(chain.set_enabled("off", false));

        let err = chain.generate(&request()).await.unwrap_err();
        assert!(!err.retryable);
        assert!(!chain.stats()["sick"].healthy);
        assert!(!chain.health_check().await);
    }

    #[tokio::test]
    async fn command_generator_reads_stdout() {
        let generator = CommandGenerator::new(
            "cat-back",
            "sh",
            vec!["-c".into(), "cat >/dev/null; printf 'print(42)\\n'".into()],
            Duration::from_secs(5),
        );
        assert!(generator.health_check().await);
        assert_eq!(generator.generate(&request()).await.unwrap(), "print(42)\n");
    }

    #[tokio::test]
    async fn command_generator_classifies_failures() {
        let tempfail = CommandGenerator::new("t", "sh", vec!["-c".into(), "exit 75".into()], Duration::from_secs(5));
        assert!(tempfail.generate(&request()).await.unwrap_err().retryable);

        let broken = CommandGenerator::new("b", "sh", vec!["-c".into(), "exit 2".into()], Duration::from_secs(5));
        assert!(!broken.generate(&request()).await.unwrap_err().retryable);

        let slow = CommandGenerator::new("s", "sh", vec!["-c".into(), "sleep 5".into()], Duration::from_millis(200));
        let err = slow.generate(&request()).await.unwrap_err();
        assert!(err.retryable);
        assert!(err.message.contains("no reply"));

        let missing = CommandGenerator::new("m", "no-such-generator-binary", Vec::new(), Duration::from_secs(1));
        assert!(!missing.health_check().await);
        assert!(!missing.generate(&request()).await.unwrap_err().retryable);
    }
}
