use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jemima_pack_store_sqlite::SqliteRoomStore;
use jemima_pack_workflow::{
    assign, audit_sealed_file, generate, seal_directory, seal_pack_file, AssignError, PackConfig, Secret,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "packctl.v1";
const LOG_ENV: &str = "PACKCTL_LOG";

#[derive(Debug, Parser)]
#[command(name = "packctl")]
#[command(about = "Sealed game pack tooling for Jemima's Asking")]
struct Cli {
    /// YAML or JSON settings file; flags below override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    password: Option<String>,
    #[arg(long, global = true)]
    iterations: Option<u32>,
    #[arg(long, global = true)]
    pool: Option<PathBuf>,
    #[arg(long, global = true)]
    templates: Option<PathBuf>,
    #[arg(long, global = true)]
    rooms_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seal missing packs from the templates into the pool.
    Generate(GenerateArgs),
    /// Assign the oldest available pair to a new room.
    Start,
    /// Counts of available, claimed and used packs.
    Status,
    /// Normalize, stamp and seal one authored pack.
    Seal(SealArgs),
    /// Report what a sealed file holds.
    Audit(AuditArgs),
    /// Seal every JSON file in a directory.
    SealDir(SealDirArgs),
    /// Room store schema management.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Defaults to the pool's `new/` directory.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SealArgs {
    input: PathBuf,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct AuditArgs {
    file: PathBuf,
}

#[derive(Debug, Args)]
struct SealDirArgs {
    #[arg(default_value = ".")]
    dir: PathBuf,
    #[arg(long, default_value_t = false)]
    keep_json: bool,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(CLI_CONTRACT_VERSION.to_string()));
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries exactly one JSON document.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            let message = format!("{err:#}");
            tracing::error!(error = %message, "command failed");
            if emit_json(json!({"error": "command_failed", "message": message})).is_err() {
                eprintln!("error: {message}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = resolve_config(&cli)?;
    let now = OffsetDateTime::now_utc();
    match cli.command {
        Command::Generate(args) => {
            let out = args.out.unwrap_or_else(|| config.pool().new_dir());
            let report = generate(&config, &out, now)?;
            emit_json(serde_json::to_value(report)?)?;
        }
        Command::Start => return run_start(&config),
        Command::Status => emit_json(serde_json::to_value(config.pool().status()?)?)?,
        Command::Seal(args) => {
            let report = seal_pack_file(&config, &args.input, args.out.as_deref(), now)?;
            emit_json(serde_json::to_value(report)?)?;
        }
        Command::Audit(args) => emit_json(serde_json::to_value(audit_sealed_file(&config, &args.file)?)?)?,
        Command::SealDir(args) => {
            let sealed = seal_directory(&config, &args.dir, args.keep_json)?;
            emit_json(json!({"dir": args.dir.display().to_string(), "sealed": sealed}))?;
        }
        Command::Db { command } => run_db(&command, &config)?,
    }
    Ok(ExitCode::SUCCESS)
}

/// Exhaustion is an expected outcome and exits 0; every other failure
/// exits non-zero with its error code.
fn run_start(config: &PackConfig) -> Result<ExitCode> {
    let mut store = open_room_store(&config.rooms_db)?;
    match assign(config, &mut store) {
        Ok(outcome) => {
            emit_json(serde_json::to_value(outcome)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(AssignError::PoolExhausted) => {
            emit_json(json!({"error": AssignError::PoolExhausted.code()}))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::error!(code = err.code(), error = %err, "assignment failed");
            emit_json(json!({"error": err.code(), "message": err.to_string()}))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_db(command: &DbCommand, config: &PackConfig) -> Result<()> {
    let mut store = SqliteRoomStore::open(&config.rooms_db)?;
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate => {
            let before = store.schema_status()?;
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(json!({
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<PackConfig> {
    let mut config = match &cli.config {
        Some(path) => PackConfig::load(path)?,
        None => PackConfig::default(),
    };
    if let Some(password) = &cli.password {
        config.password = Secret::new(password.as_str());
    }
    if let Some(iterations) = cli.iterations {
        config.pbkdf2_iterations = iterations;
    }
    if let Some(pool) = &cli.pool {
        config.pool_dir.clone_from(pool);
    }
    if let Some(templates) = &cli.templates {
        config.templates_dir.clone_from(templates);
    }
    if let Some(rooms_db) = &cli.rooms_db {
        config.rooms_db.clone_from(rooms_db);
    }
    config.validate()?;
    Ok(config)
}

fn open_room_store(path: &Path) -> Result<SqliteRoomStore> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut store = SqliteRoomStore::open(path)?;
    store.migrate()?;
    Ok(store)
}
