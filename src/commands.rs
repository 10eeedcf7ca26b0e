use crate::certs::KeytoolGenerator;
use crate::config::{read_raw, resolve_document};
use crate::error::{ProcessErrorDetails, ServError};
use crate::lock::LockManager;
use crate::merge::{get_path, set_path};
use crate::paths::{
    absolutize, config_dir_from_path, write_atomic_text, Layout, ACTIVE_ENV_ENV, CONFIG_FILE_NAME,
    LOG_ENV,
};
use crate::ports::OsPortProbe;
use crate::preview::{self, Preview, PreviewKind};
use crate::registry::Registry;
use crate::runner::RealRunner;
use crate::supervisor::{tail_log, Supervisor};
use crate::vars::Variables;
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::{json, Value};
use std::env;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "servman", version, about = "Run and supervise local app-server instances")]
pub struct Cli {
    #[arg(long, global = true, default_value = CONFIG_FILE_NAME)]
    pub config: PathBuf,
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve config, allocate ports, patch artifacts and launch.
    Start {
        #[arg(long)]
        env: Option<String>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Artifacts to show instead of starting (implies --dry-run).
        #[arg(long, value_enum, value_delimiter = ',')]
        preview: Vec<PreviewKind>,
    },
    Stop {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = false, conflicts_with = "name")]
        all: bool,
        /// Seconds to wait before escalating to SIGKILL.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    Status {
        #[arg(long)]
        name: Option<String>,
    },
    List,
    Restart {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Remove records and directories of instances that are not running.
    Prune {
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    Lock {
        #[arg(long)]
        env: Option<String>,
        #[arg(long, default_value_t = false)]
        update: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    Unlock {
        #[arg(long)]
        env: Option<String>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Logs {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Read a dot-path from the effective config.
    Get {
        key: String,
        #[arg(long)]
        env: Option<String>,
    },
    /// Write `<key>=<value>` into the config file.
    Set {
        assignment: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Context {
    pub config_path: PathBuf,
    pub json: bool,
    pub layout: Layout,
}

pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn build_context(cli: &Cli) -> Result<Context, ServError> {
    Ok(Context {
        config_path: absolutize(&cli.config),
        json: cli.json,
        layout: Layout::resolve()?,
    })
}

/// `--env`, else `SERVMAN_ENV`, else the default environment.
fn active_env(flag: Option<String>) -> Option<String> {
    flag.or_else(|| env::var(ACTIVE_ENV_ENV).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn run(cli: Cli) -> Result<(), ServError> {
    let ctx = build_context(&cli)?;
    let registry = Registry::new(ctx.layout.clone());
    let runner = RealRunner;
    let probe = OsPortProbe;
    let keystores = KeytoolGenerator::new(&runner);
    let supervisor = Supervisor::new(&registry, &runner, &probe, &keystores);

    match cli.command {
        Commands::Start {
            env,
            dry_run,
            preview,
        } => handle_start(&ctx, &registry, &supervisor, active_env(env), dry_run, preview),
        Commands::Stop {
            name,
            all,
            timeout,
            dry_run,
        } => handle_stop(&ctx, &registry, &supervisor, name, all, timeout, dry_run),
        Commands::Status { name } => {
            let name = instance_name(&ctx, &registry, name)?;
            let status = supervisor.status(&name)?;
            let summary = format!("{} {} {}", status.name, status.state.as_str(), status.url);
            emit(&ctx, json!(status), summary, Vec::new())
        }
        Commands::List => {
            let statuses = supervisor.list()?;
            let summary = statuses
                .iter()
                .map(|status| format!("{}\t{}\t{}", status.name, status.state.as_str(), status.url))
                .collect::<Vec<_>>()
                .join("\n");
            emit(&ctx, json!(statuses), summary, Vec::new())
        }
        Commands::Restart { name, dry_run } => {
            let name = instance_name(&ctx, &registry, name)?;
            if dry_run {
                let status = supervisor.status(&name)?;
                let summary = format!("would restart {} (currently {})", name, status.state.as_str());
                return emit(&ctx, json!({"dry_run": true, "instance": status}), summary, Vec::new());
            }
            let outcome = supervisor.restart(&name)?;
            let summary = format!("{} restarted at {}", outcome.name, outcome.url);
            emit(&ctx, json!(outcome), summary, Vec::new())
        }
        Commands::Prune { force, dry_run } => handle_prune(&ctx, &supervisor, force, dry_run),
        Commands::Lock {
            env,
            update,
            dry_run,
        } => {
            let outcome = LockManager::new(&ctx.config_path).lock(active_env(env).as_deref(), update, dry_run)?;
            let verb = if dry_run { "would lock" } else { "locked" };
            let summary = format!("{verb} {} in {}", outcome.environment, outcome.lock_file.display());
            emit(&ctx, json!(outcome), summary, Vec::new())
        }
        Commands::Unlock { env, dry_run } => {
            let outcome = LockManager::new(&ctx.config_path).unlock(active_env(env).as_deref(), dry_run)?;
            let summary = if outcome.was_locked {
                format!("unlocked {}", outcome.environment)
            } else {
                format!("{} was not locked", outcome.environment)
            };
            emit(&ctx, json!(outcome), summary, Vec::new())
        }
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Logs { name, lines } => {
            let name = instance_name(&ctx, &registry, name)?;
            let record = registry.require(&name)?;
            let text = tail_log(&record.paths(), lines)?;
            let payload = json!({"name": name, "log_file": record.paths().log_file(), "lines": text});
            emit(&ctx, payload, text, Vec::new())
        }
    }
}

/// Named instance, or the one whose project directory holds the config file.
fn instance_name(ctx: &Context, registry: &Registry, name: Option<String>) -> Result<String, ServError> {
    if let Some(name) = name {
        return Ok(name);
    }
    let project_dir = config_dir_from_path(&ctx.config_path);
    let matches = registry.find_by_project(&project_dir)?;
    match matches.as_slice() {
        [] => Err(ServError::InstanceNotFound(format!(
            "no instance belongs to {}; pass --name",
            project_dir.display()
        ))),
        [only] => Ok(only.name.clone()),
        many => Err(ServError::Config(format!(
            "several instances belong to {}: {}; pass --name",
            project_dir.display(),
            many.iter()
                .map(|record| record.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

fn handle_start(
    ctx: &Context,
    registry: &Registry,
    supervisor: &Supervisor<'_>,
    environment: Option<String>,
    dry_run: bool,
    kinds: Vec<PreviewKind>,
) -> Result<(), ServError> {
    if dry_run || !kinds.is_empty() {
        let preview = preview::preview(
            registry,
            &OsPortProbe,
            &ctx.config_path,
            environment.as_deref(),
            &kinds,
        )?;
        let summary = render_preview(&preview);
        let warnings = preview.warnings.clone();
        return emit(ctx, json!(preview), summary, warnings);
    }
    let outcome = supervisor.start(&ctx.config_path, environment.as_deref())?;
    let summary = if outcome.already_running {
        format!("{} already running at {}", outcome.name, outcome.url)
    } else {
        match (outcome.pid, outcome.container_id.as_deref()) {
            (Some(pid), _) => format!("{} running at {} (pid {pid})", outcome.name, outcome.url),
            (None, Some(id)) => format!("{} running at {} (container {id})", outcome.name, outcome.url),
            _ => format!("{} running at {}", outcome.name, outcome.url),
        }
    };
    let warnings = outcome.warnings.clone();
    emit(ctx, json!(outcome), summary, warnings)
}

fn render_preview(preview: &Preview) -> String {
    let mut sections = vec![format!(
        "instance {} -> {}\nports: http {} shutdown {}{}{}",
        preview.name,
        preview.instance_dir.display(),
        preview.ports.http,
        preview.ports.shutdown,
        preview
            .ports
            .jmx
            .map(|port| format!(" jmx {port}"))
            .unwrap_or_default(),
        preview
            .ports
            .https
            .map(|port| format!(" https {port}"))
            .unwrap_or_default(),
    )];
    sections.push(format!("# runtime\n{}", pretty(&preview.runtime)));
    if let Some(engine) = &preview.engine_config {
        sections.push(format!("# engine config\n{}", pretty(engine)));
    }
    if let Some(xml) = &preview.server_xml {
        sections.push(format!("# server.xml\n{}", xml.trim_end()));
    }
    if let Some(rewrite) = &preview.rewrite_config {
        sections.push(format!("# rewrite.config\n{}", rewrite.trim_end()));
    }
    if let Some(xml) = &preview.web_xml {
        sections.push(format!("# web.xml\n{}", xml.trim_end()));
    }
    if let Some(plan) = &preview.keystore {
        sections.push(format!("# keystore\n{}", pretty(plan)));
    }
    if let Some(plan) = &preview.redirect {
        sections.push(format!("# redirect\n{}", pretty(plan)));
    }
    sections.join("\n\n")
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn handle_stop(
    ctx: &Context,
    registry: &Registry,
    supervisor: &Supervisor<'_>,
    name: Option<String>,
    all: bool,
    timeout: Option<u64>,
    dry_run: bool,
) -> Result<(), ServError> {
    if all {
        if dry_run {
            let statuses = supervisor.list()?;
            let live: Vec<&str> = statuses
                .iter()
                .filter(|status| status.live)
                .map(|status| status.name.as_str())
                .collect();
            let summary = format!("would stop: {}", live.join(", "));
            return emit(ctx, json!({"dry_run": true, "would_stop": live}), summary, Vec::new());
        }
        let summary = supervisor.stop_all(timeout)?;
        let failed = summary.failed;
        let total = summary.total;
        let text = summary
            .results
            .iter()
            .map(|item| match &item.error {
                Some(err) => format!("{}: failed: {err}", item.name),
                None => format!("{}: stopped", item.name),
            })
            .collect::<Vec<_>>()
            .join("\n");
        if failed > 0 {
            // Per-instance errors were already logged; text mode also gets the report.
            if !ctx.json {
                println!("{text}");
            }
            return Err(ServError::BulkFailure {
                failed,
                total,
                summary: json!(summary),
            });
        }
        return emit(ctx, json!(summary), text, Vec::new());
    }
    let name = instance_name(ctx, registry, name)?;
    if dry_run {
        let status = supervisor.status(&name)?;
        let summary = if status.live {
            format!("would stop {name}")
        } else {
            format!("{name} is not running")
        };
        return emit(ctx, json!({"dry_run": true, "instance": status}), summary, Vec::new());
    }
    let outcome = supervisor.stop(&name, timeout)?;
    let summary = if outcome.was_running {
        format!("{} stopped ({})", outcome.name, outcome.method)
    } else {
        format!("{} was not running", outcome.name)
    };
    emit(ctx, json!(outcome), summary, Vec::new())
}

fn handle_prune(
    ctx: &Context,
    supervisor: &Supervisor<'_>,
    force: bool,
    dry_run: bool,
) -> Result<(), ServError> {
    let (candidates, running) = supervisor.prune_candidates()?;
    let names: Vec<String> = candidates.iter().map(|record| record.name.clone()).collect();
    if dry_run {
        let summary = format!("would remove: {}", names.join(", "));
        return emit(
            ctx,
            json!({"dry_run": true, "would_remove": names, "running": running}),
            summary,
            Vec::new(),
        );
    }
    if candidates.is_empty() {
        return emit(ctx, json!({"removed": [], "running": running}), "nothing to prune".to_string(), Vec::new());
    }
    if !force {
        if ctx.json || !io::stdin().is_terminal() {
            return Err(ServError::Config(
                "prune requires --force when not interactive (or use --dry-run to preview)".to_string(),
            ));
        }
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Remove {} instance(s): {}?", names.len(), names.join(", ")))
            .default(false)
            .interact()?;
        if !confirmed {
            return emit(ctx, json!({"removed": [], "cancelled": true}), "cancelled".to_string(), Vec::new());
        }
    }
    let removed = supervisor.prune(&candidates)?;
    let summary = format!("removed: {}", removed.join(", "));
    emit(ctx, json!({"removed": removed, "running": running}), summary, Vec::new())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), ServError> {
    match command {
        ConfigCommand::Get { key, env } => {
            let resolved = LockManager::new(&ctx.config_path).resolve_for_start(active_env(env).as_deref())?;
            let mut document = serde_json::to_value(&resolved.config.settings)?;
            if let Value::Object(map) = &mut document {
                map.insert("embeddedConfig".to_string(), resolved.config.engine_config.clone());
            }
            let value = get_path(&document, &key)
                .cloned()
                .ok_or_else(|| ServError::Config(format!("'{key}' is not set in the effective config")))?;
            let summary = match &value {
                Value::String(text) => text.clone(),
                other => serde_json::to_string_pretty(other)?,
            };
            emit(ctx, json!({"key": key, "value": value}), summary, resolved.warnings)
        }
        ConfigCommand::Set { assignment, dry_run } => {
            let (key, raw_value) = assignment.split_once('=').ok_or_else(|| {
                ServError::Config(format!("expected <key>=<value>, got '{assignment}'"))
            })?;
            let key = key.trim();
            LockManager::new(&ctx.config_path).guard_mutation(dry_run)?;
            let (_, document) = read_raw(&ctx.config_path)?;
            let value = serde_json::from_str::<Value>(raw_value)
                .unwrap_or_else(|_| Value::String(raw_value.to_string()));
            let updated = set_path(&document, key, value.clone()).map_err(ServError::Config)?;
            let project_dir = config_dir_from_path(&ctx.config_path);
            // Refuse to write a document that would no longer resolve.
            resolve_document(
                &ctx.config_path,
                &project_dir,
                &updated,
                None,
                &Variables::load(&project_dir),
            )?;
            if dry_run {
                let summary = serde_json::to_string_pretty(&updated)?;
                return emit(ctx, json!({"dry_run": true, "document": updated}), summary, Vec::new());
            }
            let body = serde_json::to_string_pretty(&updated)?;
            write_atomic_text(&ctx.config_path, &format!("{body}\n"))?;
            let summary = format!("{key} = {value}");
            emit(
                ctx,
                json!({"key": key, "value": value, "path": ctx.config_path}),
                summary,
                Vec::new(),
            )
        }
    }
}

/// JSON envelope on stdout with `--json`, the human summary otherwise.
/// Warnings reach text-mode users through the log on stderr.
fn emit(ctx: &Context, payload: Value, summary: String, warnings: Vec<String>) -> Result<(), ServError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
            warnings,
        };
        print_json(&wrapper)?;
    } else if !summary.is_empty() {
        println!("{summary}");
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), ServError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

fn error_envelope(err: &ServError) -> JsonResult<Value> {
    JsonResult {
        ok: false,
        result: err.partial_result(),
        error: Some(err.to_string()),
        error_details: err.details(),
        warnings: Vec::new(),
    }
}

pub fn report_error(json: bool, err: &ServError) {
    if json {
        if print_json(&error_envelope(err)).is_ok() {
            return;
        }
    }
    eprintln!("error: {err}");
}
