use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use movement_xref_api::{BackendConfig, CacheSettings, ExportFormat, MovementXrefApi};
use movement_xref_store_postgrest::{PostgrestConfig, DEFAULT_TABLE, DEFAULT_UNITS_RELATION};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "mx")]
#[command(about = "Movement cross-reference CLI")]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct BackendArgs {
    #[arg(long, global = true, env = "MOVEMENT_XREF_BACKEND", value_enum, default_value_t = Backend::Sqlite)]
    backend: Backend,
    #[arg(long, global = true, env = "MOVEMENT_XREF_DB", default_value = "./movement_xref.sqlite3")]
    db: PathBuf,
    #[arg(long, global = true, env = "SUPABASE_URL")]
    supabase_url: Option<String>,
    #[arg(long, global = true, env = "SUPABASE_ANON_KEY", hide_env_values = true)]
    supabase_anon_key: Option<String>,
    #[arg(long, global = true, env = "SUPABASE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    #[arg(long, global = true, default_value = DEFAULT_TABLE)]
    table: String,
    /// Relation listing distinct units.
    #[arg(long, global = true, default_value = DEFAULT_UNITS_RELATION)]
    units_relation: String,
    /// The remote table predates the `ano` column.
    #[arg(long, global = true)]
    without_year_column: bool,
    #[arg(long, global = true, default_value_t = 20)]
    http_timeout_secs: u64,
    /// Off by default for one-shot commands.
    #[arg(long, global = true, env = "MOVEMENT_XREF_CACHE_TTL_SECS", default_value_t = 0)]
    cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Sqlite,
    Postgrest,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Units {
        #[command(subcommand)]
        command: Box<UnitsCommand>,
    },
    Consult(ConsultArgs),
    Export(ExportArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    ImportCsv(DbImportCsvArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbImportCsvArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum UnitsCommand {
    List,
}

#[derive(Debug, Args)]
struct ConsultArgs {
    #[arg(long)]
    unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExportFormatArg {
    Csv,
    Xlsx,
}

impl From<ExportFormatArg> for ExportFormat {
    fn from(value: ExportFormatArg) -> Self {
        match value {
            ExportFormatArg::Csv => Self::Csv,
            ExportFormatArg::Xlsx => Self::Xlsx,
        }
    }
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    unit: String,
    #[arg(long, value_enum, default_value_t = ExportFormatArg::Csv)]
    format: ExportFormatArg,
    /// Output file; defaults to `consolidado_<unit>.<format>` in the working directory.
    #[arg(long)]
    out: Option<PathBuf>,
}

impl BackendArgs {
    fn backend_config(&self) -> Result<BackendConfig> {
        match self.backend {
            Backend::Sqlite => Ok(BackendConfig::Sqlite { db_path: self.db.clone() }),
            Backend::Postgrest => {
                let (Some(url), Some(key)) =
                    (self.supabase_url.as_deref(), self.supabase_anon_key.as_deref())
                else {
                    return Err(anyhow!(
                        "postgrest backend requires SUPABASE_URL and SUPABASE_ANON_KEY"
                    ));
                };
                let config = PostgrestConfig::new(url, key)?
                    .with_access_token(self.access_token.clone())
                    .with_table(&self.table)
                    .with_units_relation(&self.units_relation)
                    .with_timeout(Duration::from_secs(self.http_timeout_secs))
                    .with_year_column(!self.without_year_column);
                Ok(BackendConfig::Postgrest(config))
            }
        }
    }

    fn api(&self) -> Result<MovementXrefApi> {
        Ok(MovementXrefApi::from_config(
            self.backend_config()?,
            CacheSettings::from_ttl_secs(self.cache_ttl_secs),
        ))
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("MOVEMENT_XREF_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = cli.backend.api()?;
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Units { command } => run_units(&command, &api),
        Command::Consult(args) => run_consult(&args, &api),
        Command::Export(args) => run_export(&args, &api),
    }
}

fn run_db(command: DbCommand, api: &MovementXrefApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(api),
        DbCommand::Migrate(args) => run_db_migrate(&args, api),
        DbCommand::ImportCsv(args) => run_db_import_csv(&args, api),
    }
}

fn run_db_schema_version(api: &MovementXrefApi) -> Result<()> {
    let status = api.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, api: &MovementXrefApi) -> Result<()> {
    let result = api.migrate(args.dry_run)?;
    if result.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": result.current_version,
            "target_version": result.target_version,
            "would_apply_versions": result.would_apply_versions,
            "inferred_from_legacy": result.inferred_from_legacy
        }));
    }

    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": result.current_version,
        "applied_versions": result.would_apply_versions,
        "after_version": result.after_version,
        "target_version": result.target_version,
        "up_to_date": result.up_to_date
    }))
}

fn run_db_import_csv(args: &DbImportCsvArgs, api: &MovementXrefApi) -> Result<()> {
    let summary = api.import_csv(&args.input)?;
    emit_json(serde_json::to_value(summary)?)
}

fn run_units(command: &UnitsCommand, api: &MovementXrefApi) -> Result<()> {
    match command {
        UnitsCommand::List => {
            let units = api.list_units()?;
            emit_json(serde_json::json!({
                "count": units.len(),
                "units": units
            }))
        }
    }
}

fn run_consult(args: &ConsultArgs, api: &MovementXrefApi) -> Result<()> {
    let report = api.consult(&args.unit)?;
    emit_json(serde_json::to_value(report)?)
}

fn run_export(args: &ExportArgs, api: &MovementXrefApi) -> Result<()> {
    let artifact = api.export(&args.unit, args.format.into())?;
    let out = args.out.clone().unwrap_or_else(|| PathBuf::from(&artifact.file_name));
    fs::write(&out, &artifact.bytes)
        .with_context(|| format!("failed to write export file {}", out.display()))?;
    tracing::info!(path = %out.display(), bytes = artifact.bytes.len(), "export written");

    emit_json(serde_json::json!({
        "unit": args.unit,
        "format": ExportFormat::from(args.format).as_str(),
        "file_name": artifact.file_name,
        "content_type": artifact.content_type,
        "path": out.display().to_string(),
        "bytes": artifact.bytes.len()
    }))
}
