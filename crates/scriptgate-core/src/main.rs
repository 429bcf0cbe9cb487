use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use scriptgate_audit::{AuditEventKind, AuditFilter};
use scriptgate_core::{
    logging, ClearTarget, GateConfig, GenerateRequest, ListFilter, Pipeline, PipelineError,
};
use scriptgate_model::{Fingerprint, Language, ScanResult};
use scriptgate_runner::ExecutionBindings;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Exit status for a rejected scan
const EXIT_REJECTED: i32 = 2;
/// Exit status for code that ran but did not complete cleanly
const EXIT_WORKLOAD: i32 = 3;

fn cli() -> Command {
    Command::new("scriptgate")
        .version(scriptgate_core::VERSION)
        .about("Generate, scan and sandbox untrusted scripts")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to a scriptgate.toml"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print machine-readable JSON"),
        )
        .subcommand(
            Command::new("run")
                .about("Generate code for a prompt and optionally execute it")
                .arg(Arg::new("prompt").required(true).help("What the script should do"))
                .arg(
                    Arg::new("language")
                        .long("language")
                        .short('l')
                        .default_value("python")
                        .help("python or javascript"),
                )
                .arg(Arg::new("policy").long("policy").short('p').help("Policy name"))
                .arg(
                    Arg::new("execute")
                        .long("execute")
                        .short('x')
                        .action(ArgAction::SetTrue)
                        .help("Run the code after it passes the scan"),
                )
                .arg(
                    Arg::new("param")
                        .long("param")
                        .action(ArgAction::Append)
                        .value_name("KEY=VALUE")
                        .help("Generation parameter; VALUE is parsed as JSON when possible"),
                )
                .arg(
                    Arg::new("context")
                        .long("context")
                        .action(ArgAction::Append)
                        .value_name("KEY=VALUE")
                        .help("Context entry (files, data, environment, inputs); VALUE is parsed as JSON when possible"),
                )
                .arg(
                    Arg::new("env")
                        .long("env")
                        .short('e')
                        .action(ArgAction::Append)
                        .value_name("KEY=VALUE")
                        .help("Environment variable for the workload"),
                )
                .arg(
                    Arg::new("arg")
                        .long("arg")
                        .action(ArgAction::Append)
                        .allow_hyphen_values(true)
                        .help("Argument passed to the script"),
                )
                .arg(
                    Arg::new("stdin")
                        .long("stdin")
                        .value_parser(value_parser!(PathBuf))
                        .help("File fed to the workload's stdin"),
                ),
        )
        .subcommand(
            Command::new("scan")
                .about("Scan local files without generating or running anything")
                .arg(
                    Arg::new("files")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(Arg::new("policy").long("policy").short('p').help("Policy name"))
                .arg(
                    Arg::new("language")
                        .long("language")
                        .short('l')
                        .help("Override language detection by extension"),
                ),
        )
        .subcommand(
            Command::new("list")
                .about("List cached scripts")
                .arg(Arg::new("language").long("language").short('l'))
                .arg(Arg::new("policy").long("policy").short('p')),
        )
        .subcommand(
            Command::new("show")
                .about("Show one cached script")
                .arg(Arg::new("script_id").required(true)),
        )
        .subcommand(
            Command::new("clear")
                .about("Remove cached scripts")
                .arg(Arg::new("script_id").conflicts_with("all"))
                .arg(
                    Arg::new("all")
                        .long("all")
                        .action(ArgAction::SetTrue)
                        .help("Remove every cached script"),
                ),
        )
        .subcommand(
            Command::new("policies")
                .about("Browse and reload policies")
                .subcommand(Command::new("list").about("List policy names"))
                .subcommand(
                    Command::new("show")
                        .about("Print a policy as YAML")
                        .arg(Arg::new("name").required(true)),
                )
                .subcommand(Command::new("reload").about("Reload the policies directory")),
        )
        .subcommand(
            Command::new("audit")
                .about("Query or verify the audit log")
                .subcommand(
                    Command::new("query")
                        .about("Print matching events")
                        .arg(Arg::new("kind").long("kind").help("e.g. scan_rejected"))
                        .arg(Arg::new("id").long("id").help("Script id to correlate"))
                        .arg(
                            Arg::new("limit")
                                .long("limit")
                                .default_value("50")
                                .value_parser(value_parser!(usize)),
                        ),
                )
                .subcommand(Command::new("verify").about("Check the hash chain")),
        )
        .subcommand(Command::new("stats").about("Show pipeline statistics"))
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    let code = match dispatch(&matches).await {
        Ok(code) => code,
        Err(err) => {
            let rejected = err
                .downcast_ref::<PipelineError>()
                .is_some_and(|e| matches!(e, PipelineError::ScanRejected { .. }));
            if let Some(findings) = err.downcast_ref::<PipelineError>().and_then(PipelineError::findings) {
                for f in findings {
                    eprintln!("  {}:{} [{}] {}: {}", f.line, f.column, f.severity, f.rule, f.message);
                }
            }
            eprintln!("error: {err:#}");
            if rejected {
                EXIT_REJECTED
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}

async fn dispatch(matches: &ArgMatches) -> Result<i32> {
    let config = GateConfig::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    logging::init(&config.logging);
    let json = matches.get_flag("json");
    let pipeline = Arc::new(Pipeline::builder(config).build().await?);

    let shutdown = Arc::clone(&pipeline);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping running executions");
            shutdown.shutdown();
        }
    });

    match matches.subcommand() {
        Some(("run", sub)) => run(&pipeline, sub, json).await,
        Some(("scan", sub)) => scan(&pipeline, sub, json),
        Some(("list", sub)) => {
            let filter = ListFilter {
                language: sub.get_one::<String>("language").map(|l| l.parse()).transpose()?,
                policy: sub.get_one::<String>("policy").cloned(),
            };
            let rows = pipeline.list_cached(&filter);
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in &rows {
                    println!(
                        "{}  {:<10}  {:<16}  {}  hits={}{}",
                        row.script_id,
                        row.language,
                        row.policy,
                        row.created_at.format("%Y-%m-%d %H:%M:%S"),
                        row.access_count,
                        if row.executed { "  executed" } else { "" },
                    );
                }
            }
            Ok(0)
        }
        Some(("show", sub)) => {
            let id = sub.get_one::<String>("script_id").context("script id required")?;
            let entry = pipeline.inspect(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("script   {}", entry.script_id());
                println!("language {}", entry.language);
                println!("policy   {}", entry.policy());
                println!("prompt   {}", entry.prompt);
                println!("created  {}", entry.created_at);
                println!("expires  {}", entry.expires_at);
                println!("hits     {}", entry.access_count);
                if let Some(exec) = &entry.last_execution {
                    println!("last run {} (exit {:?})", exec.termination, exec.exit_code);
                }
                println!("\n{}", entry.source);
            }
            Ok(0)
        }
        Some(("clear", sub)) => {
            let target = match sub.get_one::<String>("script_id") {
                Some(id) => ClearTarget::One(id.clone()),
                None if sub.get_flag("all") => ClearTarget::All,
                None => bail!("give a script id or --all"),
            };
            let removed = pipeline.clear(target).await?;
            println!("removed {removed} script(s)");
            Ok(0)
        }
        Some(("policies", sub)) => policies(&pipeline, sub, json),
        Some(("audit", sub)) => audit(&pipeline, sub, json),
        Some(("stats", _)) => {
            let stats = pipeline.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("generator  {}", stats.generator);
                println!("policies   {} (generation {})", stats.policies.join(", "), stats.policy_generation);
                match stats.cache {
                    Some(cache) => println!(
                        "cache      {} entries, {} hits, {} misses, {} coalesced, {:.1}% hit rate",
                        cache.entries,
                        cache.hits,
                        cache.misses,
                        cache.coalesced,
                        cache.hit_rate() * 100.0
                    ),
                    None => println!("cache      disabled"),
                }
                println!("audit      {} events", stats.audit.total);
                for (kind, count) in &stats.audit.by_kind {
                    println!("  {kind:<20} {count}");
                }
            }
            Ok(0)
        }
        _ => {
            cli().print_help()?;
            Ok(1)
        }
    }
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn json_or_string(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn run(pipeline: &Pipeline, sub: &ArgMatches, json: bool) -> Result<i32> {
    let prompt = sub.get_one::<String>("prompt").context("prompt required")?;
    let language: Language = sub
        .get_one::<String>("language")
        .map_or("python", String::as_str)
        .parse()?;
    let mut request = GenerateRequest::new(prompt.clone(), language);
    if let Some(policy) = sub.get_one::<String>("policy") {
        request = request.with_policy(policy.clone());
    }
    for raw in sub.get_many::<String>("param").into_iter().flatten() {
        let (key, value) = split_pair(raw)?;
        request = request.with_param(key, json_or_string(value));
    }
    for raw in sub.get_many::<String>("context").into_iter().flatten() {
        let (key, value) = split_pair(raw)?;
        request = request.with_context(key, json_or_string(value));
    }
    if sub.get_flag("execute") {
        let mut bindings = ExecutionBindings::new();
        for raw in sub.get_many::<String>("env").into_iter().flatten() {
            let (key, value) = split_pair(raw)?;
            bindings = bindings.with_env(key, value);
        }
        for arg in sub.get_many::<String>("arg").into_iter().flatten() {
            bindings = bindings.with_arg(arg.clone());
        }
        if let Some(path) = sub.get_one::<PathBuf>("stdin") {
            let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            bindings = bindings.with_stdin(data);
        }
        request = request.executing(bindings);
    }

    let outcome = pipeline.generate_and_maybe_execute(request).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        eprintln!(
            "script {} ({}) {} under {}",
            outcome.script_id.short(),
            outcome.origin,
            outcome.scan_result.verdict(),
            outcome.scan_result.policy()
        );
        print_findings(&outcome.scan_result);
        match &outcome.execution_result {
            None => println!("{}", outcome.code),
            Some(result) => {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
                eprintln!(
                    "-- {} exit={:?} wall={}ms{}",
                    result.termination,
                    result.exit_code,
                    result.wall_time_ms,
                    if result.truncated() { " (output truncated)" } else { "" }
                );
            }
        }
    }
    Ok(match &outcome.execution_result {
        Some(result) if !result.succeeded() => EXIT_WORKLOAD,
        _ => 0,
    })
}

fn detect_language(path: &Path) -> Result<Language> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => Ok(Language::Python),
        Some("js" | "mjs" | "cjs") => Ok(Language::JavaScript),
        _ => bail!("cannot tell the language of {}; pass --language", path.display()),
    }
}

fn scan(pipeline: &Pipeline, sub: &ArgMatches, json: bool) -> Result<i32> {
    let forced: Option<Language> = sub.get_one::<String>("language").map(|l| l.parse()).transpose()?;
    let policy = sub.get_one::<String>("policy").map(String::as_str);
    let mut rejected = false;
    let mut results = Vec::new();
    for path in sub.get_many::<PathBuf>("files").into_iter().flatten() {
        let language = match forced {
            Some(language) => language,
            None => detect_language(path)?,
        };
        let source = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let result = pipeline.scan_source(&source, language, policy)?;
        rejected |= !result.is_passed();
        if !json {
            println!("{}: {} under {}", path.display(), result.verdict(), result.policy());
            print_findings(&result);
        }
        results.push(serde_json::json!({ "file": path, "result": result }));
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }
    Ok(if rejected { EXIT_REJECTED } else { 0 })
}

fn print_findings(result: &ScanResult) {
    for f in result.findings() {
        println!("  {}:{} [{}] {}: {}", f.line, f.column, f.severity, f.rule, f.message);
    }
}

fn policies(pipeline: &Pipeline, sub: &ArgMatches, json: bool) -> Result<i32> {
    match sub.subcommand() {
        Some(("show", args)) => {
            let name = args.get_one::<String>("name").context("policy name required")?;
            print!("{}", pipeline.registry().export(name).map_err(PipelineError::from)?);
        }
        Some(("reload", _)) => {
            let report = pipeline.reload_policies()?;
            println!(
                "generation {}: {} added, {} changed, {} removed",
                report.generation,
                report.added.len(),
                report.changed.len(),
                report.removed.len()
            );
        }
        _ => {
            let table = pipeline.registry().snapshot();
            if json {
                let names: Vec<_> = table.names().collect();
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                for policy in table.policies() {
                    let marker = if policy.name() == table.default_name() { "*" } else { " " };
                    println!("{marker} {:<16} {}", policy.id(), policy.description());
                }
            }
        }
    }
    Ok(0)
}

fn audit(pipeline: &Pipeline, sub: &ArgMatches, json: bool) -> Result<i32> {
    match sub.subcommand() {
        Some(("verify", _)) => {
            let count = pipeline.verify_audit()?;
            println!("audit chain intact: {count} event(s)");
        }
        Some(("query", args)) => {
            let mut filter = AuditFilter::all();
            if let Some(kind) = args.get_one::<String>("kind") {
                filter = filter.kind(kind.parse::<AuditEventKind>().map_err(anyhow::Error::msg)?);
            }
            if let Some(id) = args.get_one::<String>("id") {
                let fingerprint: Fingerprint = id.parse().with_context(|| format!("invalid script id '{id}'"))?;
                filter = filter.correlation(fingerprint);
            }
            if let Some(limit) = args.get_one::<usize>("limit") {
                filter = filter.limit(*limit);
            }
            let events = pipeline.audit_events(filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else {
                for event in &events {
                    println!(
                        "#{:<6} {}  {:<18} {}  {}",
                        event.seq,
                        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        event.kind,
                        event.correlation_id.map_or_else(|| "-".repeat(16), |fp| fp.short()),
                        event.policy.as_ref().map_or_else(String::new, ToString::to_string),
                    );
                }
            }
        }
        _ => bail!("use `audit query` or `audit verify`"),
    }
    Ok(0)
}
