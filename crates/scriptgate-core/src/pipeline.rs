//! Pipeline orchestrator
//!
//! Ties the policy registry, generator, scanner, result cache, runner and
//! audit log into the generate -> scan -> execute flow. Code reaches the
//! runner only through a passing [`ScanResult`] under the same policy
//! snapshot that was resolved at the start of the request.

use crate::config::GateConfig;
use crate::error::PipelineError;
use crate::generator::{extract_code, CodeGenerator, GenerationError, GenerationRequest};
use async_trait::async_trait;
use scriptgate_audit::{
    AuditEventKind, AuditFilter, AuditLog, AuditPayload, AuditStats, JsonlFileSink, NewEvent,
};
use scriptgate_cache::{
    CacheDraft, CacheEntry, CacheError, CacheStats, CacheStore, CacheSummary, FileCacheStore,
    Origin, ResultCache,
};
use scriptgate_model::{
    ExecutionResult, Fingerprint, GenerationContext, GenerationParams, Language, ScanResult,
};
use scriptgate_policy::{PolicyDocument, PolicyRegistry, ReloadReport, SecurityPolicy};
use scriptgate_runner::{ApprovedSource, ExecutionBindings, Runner};
use scriptgate_scanner::Scanner;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One pipeline request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Task description
    pub prompt: String,
    /// Target language
    pub language: Language,
    /// Policy name; the configured default when `None`
    pub policy: Option<String>,
    /// Generation parameters, part of the fingerprint
    pub params: GenerationParams,
    /// Optional caller context; fingerprinted in normalized form, so
    /// concrete `inputs` values do not split the cache
    pub context: GenerationContext,
    /// Run the code once it passes
    pub execute: bool,
    /// Inputs for the run
    pub bindings: ExecutionBindings,
}

impl GenerateRequest {
    /// Generate-only request under the default policy
    pub fn new(prompt: impl Into<String>, language: Language) -> Self {
        Self {
            prompt: prompt.into(),
            language,
            policy: None,
            params: GenerationParams::new(),
            context: GenerationContext::new(),
            execute: false,
            bindings: ExecutionBindings::new(),
        }
    }

    /// Use a named policy
    #[must_use]
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    /// Add a generation parameter
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Add a context entry such as `files`, `data`, `environment` or `inputs`
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Execute with `bindings` after a passing scan
    #[must_use]
    pub fn executing(mut self, bindings: ExecutionBindings) -> Self {
        self.execute = true;
        self.bindings = bindings;
        self
    }
}

/// What a request produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    /// Request fingerprint
    pub script_id: Fingerprint,
    /// Code that passed the scan
    pub code: String,
    /// The passing scan
    pub scan_result: ScanResult,
    /// Execution, when requested
    pub execution_result: Option<ExecutionResult>,
    /// How the code was obtained; `Generated` when caching is off
    pub origin: Origin,
}

/// Listing filter for [`Pipeline::list_cached`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only this language
    pub language: Option<Language>,
    /// Only scripts admitted under this policy name
    pub policy: Option<String>,
}

/// What [`Pipeline::clear`] removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearTarget {
    /// One script by id
    One(String),
    /// Everything
    All,
}

/// Snapshot of pipeline counters
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Cache counters; `None` when caching is off
    pub cache: Option<CacheStats>,
    /// Audit event counts
    pub audit: AuditStats,
    /// Loaded policy names
    pub policies: Vec<String>,
    /// Policy table generation
    pub policy_generation: u64,
    /// Generator in use
    pub generator: String,
}

/// Generator used when none is configured
#[derive(Debug)]
struct Unconfigured;

#[async_trait]
impl CodeGenerator for Unconfigured {
    fn name(&self) -> String {
        "unconfigured".to_string()
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        Err(GenerationError::fatal(
            "unconfigured",
            "no generator configured; add [[generator.providers]] to the config",
        ))
    }

    async fn health_check(&self) -> bool {
        false
    }
}

/// Everything a generation needs, owned so it can move into a cache flight
struct Production {
    generator: Arc<dyn CodeGenerator>,
    scanner: Arc<Scanner>,
    audit: Arc<AuditLog>,
    policy: Arc<SecurityPolicy>,
    fingerprint: Fingerprint,
    request: GenerationRequest,
}

impl Production {
    /// Generate, extract and scan; audits every decision it makes
    async fn run(self, via_cache: bool) -> Result<CacheDraft, PipelineError> {
        let policy_id = self.policy.id().clone();
        if via_cache {
            self.audit.append(
                NewEvent::new(
                    AuditEventKind::CacheMiss,
                    AuditPayload::Cache {
                        origin: Origin::Generated.as_str().to_string(),
                    },
                )
                .correlated(self.fingerprint)
                .under(policy_id.clone()),
            )?;
        }

        let reply = match self.generator.generate(&self.request).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(fingerprint = %self.fingerprint.short(), error = %err, "generation failed");
                self.audit.append(
                    NewEvent::error(AuditEventKind::GenerationFailed, err.to_string())
                        .correlated(self.fingerprint)
                        .under(policy_id),
                )?;
                return Err(err.into());
            }
        };

        let language = self.request.language;
        let source = extract_code(&reply, language);
        let scan = self.scanner.scan(&source, language, &self.policy);
        self.audit
            .append(NewEvent::scan(scan.clone()).correlated(self.fingerprint))?;
        tracing::info!(
            fingerprint = %self.fingerprint.short(),
            verdict = %scan.verdict(),
            findings = scan.findings().len(),
            "candidate scanned"
        );

        Ok(CacheDraft {
            language,
            prompt: self.request.prompt,
            source,
            scan,
            generator: Some(self.generator.name()),
        })
    }
}

/// The orchestrator
pub struct Pipeline {
    config: GateConfig,
    registry: Arc<PolicyRegistry>,
    scanner: Arc<Scanner>,
    cache: Option<ResultCache<PipelineError>>,
    audit: Arc<AuditLog>,
    runner: Runner,
    generator: Arc<dyn CodeGenerator>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("policies", &self.registry.names())
            .field("cache", &self.cache)
            .field("generator", &self.generator.name())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Start building a pipeline from `config`
    #[must_use]
    pub fn builder(config: GateConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Policy registry
    #[must_use]
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Audit log
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Execution runner
    #[must_use]
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Whether results are cached
    #[must_use]
    pub fn caching(&self) -> bool {
        self.cache.is_some()
    }

    /// Cancel every running execution
    ///
    /// Workloads are torn down as on a timeout and report `Killed`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Generate code, scan it and optionally run it
    ///
    /// # Errors
    /// - [`PipelineError::PolicyNotFound`] for an unknown policy
    /// - [`PipelineError::Generation`] when every generator gave up
    /// - [`PipelineError::ScanRejected`] with the findings when the code
    ///   fails its scan
    /// - [`PipelineError::Execution`] when the runner cannot run the code
    /// - [`PipelineError::Audit`] when an event cannot be recorded
    #[tracing::instrument(
        skip_all,
        fields(
            language = %request.language,
            policy = tracing::field::Empty,
            fingerprint = tracing::field::Empty,
        )
    )]
    pub async fn generate_and_maybe_execute(
        &self,
        request: GenerateRequest,
    ) -> Result<PipelineOutcome, PipelineError> {
        // one snapshot for the whole request
        let policy = self
            .registry
            .resolve_or_default(request.policy.as_deref())?;
        let fingerprint = Fingerprint::compute(
            &request.prompt,
            request.language,
            policy.id(),
            &request.params,
            &request.context,
        )
        .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;
        let span = tracing::Span::current();
        span.record("policy", tracing::field::display(policy.id()));
        span.record("fingerprint", tracing::field::display(fingerprint.short()));

        let production = self.production(fingerprint, &request, &policy);
        let (draft, origin) = match &self.cache {
            Some(cache) => match cache
                .get_or_create(fingerprint, move || production.run(true))
                .await
            {
                Ok(lookup) => (Draft::from(lookup.entry), lookup.origin),
                Err(CacheError::Factory(err)) => return Err((*err).clone()),
                Err(CacheError::FlightAborted(message)) => {
                    return Err(PipelineError::Aborted(message))
                }
                Err(CacheError::Unavailable(message)) => {
                    tracing::warn!(%message, "cache unavailable, continuing uncached");
                    let draft = self.production(fingerprint, &request, &policy).run(false).await?;
                    (Draft::from(draft), Origin::Generated)
                }
            },
            None => (Draft::from(production.run(false).await?), Origin::Generated),
        };

        if !draft.scan.is_passed() {
            tracing::info!(findings = draft.scan.findings().len(), "candidate rejected");
            return Err(PipelineError::ScanRejected {
                script_id: fingerprint,
                policy: policy.name().to_string(),
                findings: draft.scan.findings().to_vec(),
            });
        }
        if origin.is_hit() {
            self.audit.append(
                NewEvent::new(
                    AuditEventKind::CacheHit,
                    AuditPayload::Cache {
                        origin: origin.as_str().to_string(),
                    },
                )
                .correlated(fingerprint)
                .under(policy.id().clone()),
            )?;
        }

        let execution_result = if request.execute {
            let approved = ApprovedSource::new(
                fingerprint,
                request.language,
                draft.source.clone(),
                draft.scan.clone(),
            );
            let result = self.execute(approved, policy, request.bindings).await?;
            if let Some(cache) = &self.cache {
                if !cache.attach_execution(&fingerprint, result.clone()).await {
                    tracing::debug!("entry expired before the execution was recorded");
                }
            }
            Some(result)
        } else {
            None
        };

        tracing::info!(%origin, executed = execution_result.is_some(), "request complete");
        Ok(PipelineOutcome {
            script_id: fingerprint,
            code: draft.source,
            scan_result: draft.scan,
            execution_result,
            origin,
        })
    }

    fn production(
        &self,
        fingerprint: Fingerprint,
        request: &GenerateRequest,
        policy: &Arc<SecurityPolicy>,
    ) -> Production {
        Production {
            generator: Arc::clone(&self.generator),
            scanner: Arc::clone(&self.scanner),
            audit: Arc::clone(&self.audit),
            policy: Arc::clone(policy),
            fingerprint,
            request: GenerationRequest {
                prompt: request.prompt.clone(),
                language: request.language,
                policy: policy.name().to_string(),
                params: request.params.clone(),
                context: request.context.clone(),
            },
        }
    }

    /// Run approved code off the request task
    ///
    /// Dropping the returned future cancels the workload through the
    /// guard, so the runner still tears it down and audits the outcome.
    async fn execute(
        &self,
        approved: ApprovedSource,
        policy: Arc<SecurityPolicy>,
        bindings: ExecutionBindings,
    ) -> Result<ExecutionResult, PipelineError> {
        let token = self.shutdown.child_token();
        let _cancel_on_drop = token.clone().drop_guard();
        let runner = self.runner.clone();
        let handle = tokio::spawn(async move {
            runner.execute(&approved, &policy, &bindings, token).await
        });
        let result = handle
            .await
            .map_err(|e| PipelineError::Aborted(e.to_string()))??;
        tracing::info!(
            termination = %result.termination,
            exit_code = ?result.exit_code,
            wall_ms = result.wall_time_ms,
            "execution finished"
        );
        Ok(result)
    }

    /// Scan local source outside the generation flow
    ///
    /// The verdict is audited like any other.
    ///
    /// # Errors
    /// Returns error for an unknown policy or an audit failure
    pub fn scan_source(
        &self,
        source: &str,
        language: Language,
        policy: Option<&str>,
    ) -> Result<ScanResult, PipelineError> {
        let policy = self.registry.resolve_or_default(policy)?;
        let scan = self.scanner.scan(source, language, &policy);
        self.audit.append(NewEvent::scan(scan.clone()))?;
        Ok(scan)
    }

    /// Cached scripts matching `filter`, oldest first
    #[must_use]
    pub fn list_cached(&self, filter: &ListFilter) -> Vec<CacheSummary> {
        let Some(cache) = &self.cache else {
            return Vec::new();
        };
        cache
            .list(filter.language)
            .into_iter()
            .filter(|row| filter.policy.as_ref().map_or(true, |p| &row.policy.name == p))
            .collect()
    }

    /// Full detail of one cached script
    ///
    /// # Errors
    /// [`PipelineError::InvalidScriptId`] for a malformed id,
    /// [`PipelineError::NotFound`] when nothing is cached under it
    pub async fn inspect(&self, script_id: &str) -> Result<CacheEntry, PipelineError> {
        let fingerprint = parse_script_id(script_id)?;
        let Some(cache) = &self.cache else {
            return Err(PipelineError::NotFound(script_id.to_string()));
        };
        cache
            .inspect(&fingerprint)
            .await
            .ok_or_else(|| PipelineError::NotFound(script_id.to_string()))
    }

    /// Remove cached scripts; returns how many were removed
    ///
    /// Clearing an id that is not cached removes nothing and succeeds.
    ///
    /// # Errors
    /// [`PipelineError::InvalidScriptId`] for a malformed id
    pub async fn clear(&self, target: ClearTarget) -> Result<usize, PipelineError> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let removed = match target {
            ClearTarget::One(id) => {
                let fingerprint = parse_script_id(&id)?;
                usize::from(cache.invalidate(&fingerprint).await)
            }
            ClearTarget::All => cache.clear().await,
        };
        tracing::info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Reload custom policies from the configured directory
    ///
    /// # Errors
    /// Returns the load error (the previous table stays active) or an
    /// audit failure
    pub fn reload_policies(&self) -> Result<ReloadReport, PipelineError> {
        let outcome = self.registry.reload_from_dir();
        self.audit_reload(outcome)
    }

    /// Replace custom policies with `documents`
    ///
    /// # Errors
    /// See [`reload_policies`](Self::reload_policies)
    pub fn reload_policies_with(
        &self,
        documents: &[PolicyDocument],
    ) -> Result<ReloadReport, PipelineError> {
        let outcome = self.registry.reload(documents);
        self.audit_reload(outcome)
    }

    fn audit_reload(
        &self,
        outcome: Result<ReloadReport, scriptgate_policy::PolicyError>,
    ) -> Result<ReloadReport, PipelineError> {
        match outcome {
            Ok(report) => {
                let names = report
                    .added
                    .iter()
                    .chain(&report.changed)
                    .cloned()
                    .collect();
                self.audit.append(NewEvent::new(
                    AuditEventKind::PolicyReloaded,
                    AuditPayload::Policy { names },
                ))?;
                Ok(report)
            }
            Err(err) => {
                tracing::error!(%err, "policy reload failed, keeping current table");
                self.audit.append(NewEvent::error(
                    AuditEventKind::Error,
                    format!("policy reload failed: {err}"),
                ))?;
                Err(err.into())
            }
        }
    }

    /// Audit events matching `filter`
    ///
    /// # Errors
    /// Returns error if the log cannot be read
    pub fn audit_events(
        &self,
        filter: AuditFilter,
    ) -> Result<Vec<scriptgate_audit::AuditEvent>, PipelineError> {
        Ok(self.audit.query(filter).collect()?)
    }

    /// Check the audit hash chain; returns the number of events verified
    ///
    /// # Errors
    /// Returns error on the first broken link
    pub fn verify_audit(&self) -> Result<u64, PipelineError> {
        Ok(self.audit.verify_integrity()?)
    }

    /// Counters across the pipeline
    ///
    /// # Errors
    /// Returns error if the audit log cannot be read
    pub async fn stats(&self) -> Result<PipelineStats, PipelineError> {
        let cache = match &self.cache {
            Some(cache) => {
                cache.run_maintenance().await;
                Some(cache.stats())
            }
            None => None,
        };
        let table = self.registry.snapshot();
        Ok(PipelineStats {
            cache,
            audit: self.audit.stats()?,
            policies: table.names().map(str::to_string).collect(),
            policy_generation: table.generation(),
            generator: self.generator.name(),
        })
    }
}

/// Code and scan, whichever path produced them
struct Draft {
    source: String,
    scan: ScanResult,
}

impl From<CacheEntry> for Draft {
    fn from(entry: CacheEntry) -> Self {
        Self {
            source: entry.source,
            scan: entry.scan,
        }
    }
}

impl From<CacheDraft> for Draft {
    fn from(draft: CacheDraft) -> Self {
        Self {
            source: draft.source,
            scan: draft.scan,
        }
    }
}

fn parse_script_id(script_id: &str) -> Result<Fingerprint, PipelineError> {
    Fingerprint::from_str(script_id.trim())
        .map_err(|_| PipelineError::InvalidScriptId(script_id.to_string()))
}

/// Assembles a [`Pipeline`]
///
/// Anything not supplied explicitly is built from the configuration.
pub struct PipelineBuilder {
    config: GateConfig,
    registry: Option<Arc<PolicyRegistry>>,
    audit: Option<Arc<AuditLog>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    generator: Option<Arc<dyn CodeGenerator>>,
}

impl PipelineBuilder {
    /// Builder over `config`
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            registry: None,
            audit: None,
            cache_store: None,
            generator: None,
        }
    }

    /// Use an existing registry
    #[must_use]
    pub fn registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use an existing audit log
    #[must_use]
    pub fn audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Persist cache entries in `store`
    #[must_use]
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Use `generator` instead of the configured providers
    #[must_use]
    pub fn generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Build the pipeline
    ///
    /// A cache store that cannot be opened degrades to running uncached.
    ///
    /// # Errors
    /// Returns error if policies cannot be loaded, the default policy is
    /// unknown, or the audit log cannot be opened
    pub async fn build(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;

        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(match &config.security.policies_dir {
                Some(dir) => PolicyRegistry::from_dir(dir)?,
                None => PolicyRegistry::with_builtins()?,
            }),
        };
        if registry.snapshot().default_name() != config.security.default_policy {
            registry.set_default(&config.security.default_policy)?;
        }

        let audit = match self.audit {
            Some(audit) => audit,
            None => {
                let sink = JsonlFileSink::open(config.audit_log_path())?;
                Arc::new(AuditLog::open(Arc::new(sink))?)
            }
        };

        let cache = if config.cache.enabled {
            open_cache(&config, self.cache_store).await
        } else {
            None
        };

        let generator = self
            .generator
            .or_else(|| {
                config
                    .generator()
                    .map(|chain| Arc::new(chain) as Arc<dyn CodeGenerator>)
            })
            .unwrap_or_else(|| Arc::new(Unconfigured));

        let runner = Runner::new(config.runner_config(), Arc::clone(&audit));
        tracing::info!(
            policies = registry.names().len(),
            caching = cache.is_some(),
            generator = %generator.name(),
            "pipeline ready"
        );

        Ok(Pipeline {
            config,
            registry,
            scanner: Arc::new(Scanner::new()),
            cache,
            audit,
            runner,
            generator,
            shutdown: CancellationToken::new(),
        })
    }
}

async fn open_cache(
    config: &GateConfig,
    store: Option<Arc<dyn CacheStore>>,
) -> Option<ResultCache<PipelineError>> {
    let store: Option<Arc<dyn CacheStore>> = match store {
        Some(store) => Some(store),
        None if config.cache.persistent => match FileCacheStore::open(config.cache_dir()) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                tracing::warn!(%err, "cache store unavailable, running uncached");
                return None;
            }
        },
        None => None,
    };
    match store {
        Some(store) => match ResultCache::open(config.cache_config(), store).await {
            Ok(cache) => Some(cache),
            Err(err) => {
                tracing::warn!(%err, "cache store unavailable, running uncached");
                None
            }
        },
        None => Some(ResultCache::new(config.cache_config())),
    }
}
