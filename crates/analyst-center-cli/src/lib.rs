//! Command surface for the `analyst-center` binary.
//!
//! - `run` plans and executes one request against the configured services.
//! - `check-sql` reports the read-only guard verdict without touching a database.
//! - `config check` validates a configuration file and prints its hashes.
//! - `archive` inspects and audits runs written with `--archive-db`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use analyst_center_archive_sqlite::SqliteRunArchive;
use analyst_center_capability::Collaborators;
use analyst_center_config::load_config_from_path;
use analyst_center_domain::{OrchestratorError, RunId, RunOverrides};
use analyst_center_orchestrator::Orchestrator;
use analyst_center_provider::{HttpJsonGenerator, HttpSearchService, SearchService};
use analyst_center_sql_guard::{DataStore, SqlGuard, SqliteDataStore};
use analyst_center_trace::{audit_run, RunArchive};
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::error;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "analyst-center")]
#[command(about = "Plan-and-execute data analysis over SQL, web search, and charts")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Run(RunArgs),
    CheckSql(CheckSqlArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// `SQLite` database queried by query capabilities.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    query: String,
    #[arg(long = "capability")]
    capabilities: Vec<String>,
    #[arg(long)]
    archive_db: Option<PathBuf>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    planner_model: Option<String>,
    /// `<capability>=<model_id>`, repeatable.
    #[arg(long = "capability-model")]
    capability_models: Vec<String>,
}

#[derive(Debug, Args)]
pub struct CheckSqlArgs {
    #[arg(long)]
    sql: String,
    #[arg(long)]
    row_cap: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Check(ConfigCheckArgs),
}

#[derive(Debug, Args)]
pub struct ConfigCheckArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum ArchiveCommand {
    Runs(ArchiveRunsArgs),
    Show(ArchiveRunArgs),
    Audit(ArchiveRunArgs),
}

#[derive(Debug, Args)]
pub struct ArchiveRunsArgs {
    #[arg(long)]
    archive_db: PathBuf,
}

#[derive(Debug, Args)]
pub struct ArchiveRunArgs {
    #[arg(long)]
    archive_db: PathBuf,
    #[arg(long)]
    run_id: String,
}

/// Install the stderr `fmt` subscriber. `RUST_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Executes the parsed command.
///
/// # Errors
/// Returns an error when configuration loading, a collaborator, the run
/// itself, or archive access fails, and when `check-sql` or `archive audit`
/// report a negative verdict.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => run_request(args),
        Command::CheckSql(args) => check_sql(&args),
        Command::Config { command } => match command {
            ConfigCommand::Check(args) => check_config(&args.config),
        },
        Command::Archive { command } => run_archive(command),
    }
}

fn run_request(args: RunArgs) -> Result<()> {
    let envelope = load_config_from_path(&args.config)?;
    let config = &envelope.config;

    let generator = HttpJsonGenerator::from_endpoint(&config.generation)
        .map_err(setup_error("generation endpoint"))?;
    let search = config
        .search
        .as_ref()
        .map(HttpSearchService::from_endpoint)
        .transpose()
        .map_err(setup_error("search endpoint"))?;
    let store = args.db.map(SqliteDataStore::new);

    let archive = match args.archive_db.as_deref() {
        Some(path) => Some(open_archive(path)?),
        None => None,
    };

    let orchestrator = Orchestrator::new(
        &envelope,
        Collaborators {
            generator: &generator,
            data_store: store.as_ref().map(|store| store as &dyn DataStore),
            search: search.as_ref().map(|search| search as &dyn SearchService),
        },
    )
    .map_err(setup_error("orchestrator"))?;
    let orchestrator = match &archive {
        Some(archive) => orchestrator.with_archive(archive),
        None => orchestrator,
    };

    let overrides = RunOverrides {
        planner_model: args.planner_model,
        capability_models: parse_capability_models(&args.capability_models)?,
        request_timeout_ms: args.timeout_ms,
    };
    let response = orchestrator
        .run(&args.query, &args.capabilities, &overrides)
        .map_err(public_error)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn check_sql(args: &CheckSqlArgs) -> Result<()> {
    let guard = args.row_cap.map_or_else(SqlGuard::default, SqlGuard::new);
    match guard.check(&args.sql) {
        Ok(query) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"accepted": true, "query": query}))?
            );
            Ok(())
        }
        Err(rejection) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"accepted": false, "rejection": rejection}))?
            );
            Err(anyhow!("sql rejected ({}): {}", rejection.kind.as_str(), rejection.message))
        }
    }
}

fn check_config(path: &Path) -> Result<()> {
    let envelope = load_config_from_path(path)?;
    let capabilities = envelope
        .config
        .capabilities
        .iter()
        .map(|capability| json!({"name": capability.name, "kind": capability.kind}))
        .collect::<Vec<_>>();
    let payload = json!({
        "config_name": envelope.config.config_name,
        "config_version": envelope.config.config_version,
        "source_yaml_hash": envelope.source_yaml_hash,
        "normalized_hash": envelope.normalized_hash,
        "capabilities": capabilities,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_archive(command: ArchiveCommand) -> Result<()> {
    match command {
        ArchiveCommand::Runs(args) => {
            let archive = open_archive(&args.archive_db)?;
            println!("{}", serde_json::to_string_pretty(&archive.list_runs()?)?);
            Ok(())
        }
        ArchiveCommand::Show(args) => {
            let archive = open_archive(&args.archive_db)?;
            let run_id = parse_run_id(&args.run_id)?;
            let Some(run) = archive.get_run(run_id)? else {
                return Err(anyhow!("run not found: {run_id}"));
            };
            let payload = json!({
                "run": run,
                "messages": archive.list_messages(run_id)?,
                "trace_records": archive.list_trace_records(run_id)?,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        ArchiveCommand::Audit(args) => {
            let archive = open_archive(&args.archive_db)?;
            let run_id = parse_run_id(&args.run_id)?;
            if archive.get_run(run_id)?.is_none() {
                return Err(anyhow!("run not found: {run_id}"));
            }
            let report = audit_run(&archive, run_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.chain_valid {
                return Err(anyhow!(
                    "message hash chain is broken at seq {}",
                    report
                        .first_invalid_seq
                        .map_or_else(|| "?".to_string(), |seq| seq.to_string())
                ));
            }
            Ok(())
        }
    }
}

fn open_archive(path: &Path) -> Result<SqliteRunArchive> {
    let archive = SqliteRunArchive::open(path)?;
    archive.migrate()?;
    Ok(archive)
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(raw).map_err(|err| anyhow!("invalid --run-id value: {err}"))?;
    Ok(RunId(ulid))
}

fn parse_capability_models(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| {
            let (name, model) = pair.split_once('=').ok_or_else(|| {
                anyhow!("invalid --capability-model `{pair}`; expected <capability>=<model_id>")
            })?;
            Ok((name.trim().to_string(), model.trim().to_string()))
        })
        .collect()
}

/// Callers only see the sanitized text. Failed runs are logged by the
/// orchestrator; use [`setup_error`] for anything raised before the run.
fn public_error(err: OrchestratorError) -> anyhow::Error {
    anyhow!("{}: {}", err.code(), err.public_message())
}

fn setup_error(stage: &'static str) -> impl Fn(OrchestratorError) -> anyhow::Error {
    move |err| {
        error!(stage, code = err.code(), error = %err, "run setup failed");
        public_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_capability_models, parse_run_id};

    #[test]
    fn capability_model_pairs_are_split_on_the_first_equals() {
        let parsed = parse_capability_models(&["sql=coder=v2".to_string(), " web = fast ".to_string()])
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(parsed.get("sql").map(String::as_str), Some("coder=v2"));
        assert_eq!(parsed.get("web").map(String::as_str), Some("fast"));
        assert!(parse_capability_models(&["sql".to_string()]).is_err());
    }

    #[test]
    fn run_id_must_be_a_ulid() {
        assert!(parse_run_id("01J0SQQP7M70P6Y3R4T8D8G8M2").is_ok());
        assert!(parse_run_id("not-a-ulid").is_err());
    }
}
