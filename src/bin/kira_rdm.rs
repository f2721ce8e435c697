use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_refdata_manager::config::{ConfigLoader, ResolvedConfig};
use kira_refdata_manager::domain::DataSource;
use kira_refdata_manager::error::RdmError;
use kira_refdata_manager::output::{
    CheckResult, JsonOutput, OutputMode, SnapshotList, TextOutput, UpdateOutcome, UpdateSummary,
};
use kira_refdata_manager::pipeline::{Pipeline, PipelineSettings, ProgressSink};
use kira_refdata_manager::store::Store;
use kira_refdata_manager::transfer::SourceClient;

#[derive(Parser)]
#[command(name = "kira-rdm")]
#[command(about = "Staged, verified downloads of reference datasets with dated snapshots")]
#[command(version, author)]
struct Cli {
    /// Path to kira-rdm.json (defaults to the working directory, then the user config dir)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, verify and promote sources (all when none given)")]
    Update(UpdateArgs),
    #[command(about = "Restore the snapshot nearest to a date into a new directory")]
    Restore(RestoreArgs),
    #[command(about = "List snapshots of a source")]
    Snapshots(SourceArgs),
    #[command(about = "Validate the configuration")]
    Check,
}

#[derive(Args)]
struct UpdateArgs {
    #[arg(long = "source")]
    sources: Vec<String>,
}

#[derive(Args)]
struct RestoreArgs {
    /// Snapshot date, YYYY-MM-DD
    #[arg(long)]
    date: String,

    /// Directory to create; must not exist
    #[arg(long)]
    destination: String,

    #[arg(long)]
    source: Option<String>,
}

#[derive(Args)]
struct SourceArgs {
    #[arg(long)]
    source: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<RdmError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &RdmError) -> u8 {
    match error {
        RdmError::MissingConfig
        | RdmError::UnknownSource(_)
        | RdmError::SnapshotNotFound(_)
        | RdmError::SnapshotEmpty(_)
        | RdmError::RestoreDestinationExists(_) => 2,
        RdmError::Connection(_)
        | RdmError::ConnectionExhausted { .. }
        | RdmError::Transfer(_)
        | RdmError::TransferStatus { .. }
        | RdmError::AuthenticationRejected(_)
        | RdmError::ItemNotFound(_)
        | RdmError::RetriesExhausted { .. }
        | RdmError::Listing(_)
        | RdmError::StagingAborted { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Update(args) => run_update(&config, args, output_mode),
        Commands::Restore(args) => run_restore(&config, args, output_mode),
        Commands::Snapshots(args) => run_snapshots(&config, args, output_mode),
        Commands::Check => run_check(&config, output_mode),
    }
}

fn run_update(
    config: &ResolvedConfig,
    args: UpdateArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let selected: Vec<&DataSource> = if args.sources.is_empty() {
        config.sources.iter().collect()
    } else {
        args.sources
            .iter()
            .map(|name| config.source(name))
            .collect::<Result<_, _>>()?
    };

    let mut updates = Vec::new();
    let mut first_error = None;
    for source in selected {
        let outcome = pipeline_for(config, source)
            .and_then(|pipeline| pipeline.run_update(sink_for(output_mode)));
        match outcome {
            Ok(report) => updates.push(UpdateOutcome {
                source: source.name.clone(),
                success: true,
                report: Some(report),
                error: None,
            }),
            Err(err) => {
                tracing::error!(source = %source.name, error = %err, "update failed");
                updates.push(UpdateOutcome {
                    source: source.name.clone(),
                    success: false,
                    report: None,
                    error: Some(err.to_string()),
                });
                first_error.get_or_insert(err);
            }
        }
    }

    let summary = UpdateSummary { updates };
    match output_mode {
        OutputMode::Json => JsonOutput::print_update(&summary).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_update(&summary).into_diagnostic()?,
    }
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_restore(
    config: &ResolvedConfig,
    args: RestoreArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let source = select_source(config, args.source.as_deref())?;
    let destination = absolute_destination(&args.destination)?;
    let pipeline = pipeline_for(config, source)?;
    let report = pipeline.run_restore(&args.date, &destination, sink_for(output_mode))?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_restore(&report).into_diagnostic(),
        OutputMode::Text => TextOutput::print_restore(&report).into_diagnostic(),
    }
}

fn run_snapshots(
    config: &ResolvedConfig,
    args: SourceArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let source = select_source(config, args.source.as_deref())?;
    let pipeline = pipeline_for(config, source)?;
    let manager = pipeline.snapshots();
    let snapshots = manager.list()?;
    let result = SnapshotList {
        source: source.name.clone(),
        backup_dir: manager.backup_dir().to_string(),
        snapshots: snapshots.iter().map(ToString::to_string).collect(),
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_snapshots(&result).into_diagnostic(),
        OutputMode::Text => TextOutput::print_snapshots(&result).into_diagnostic(),
    }
}

fn run_check(config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    for source in &config.sources {
        SourceClient::for_source(source, config.timeouts)?;
    }
    let result = CheckResult {
        live_root: config.live_root.to_string(),
        backup_root: config.backup_root.to_string(),
        sources: config.sources.iter().map(|source| source.name.clone()).collect(),
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_check(&result).into_diagnostic(),
        OutputMode::Text => TextOutput::print_check(&result).into_diagnostic(),
    }
}

fn pipeline_for(
    config: &ResolvedConfig,
    source: &DataSource,
) -> Result<Pipeline<SourceClient>, RdmError> {
    let client = SourceClient::for_source(source, config.timeouts)?;
    Ok(Pipeline::new(
        source.clone(),
        Store::from_config(config),
        client,
        PipelineSettings::from_config(config),
    ))
}

/// `--source` may be omitted when the config declares exactly one source.
fn select_source<'a>(
    config: &'a ResolvedConfig,
    name: Option<&str>,
) -> Result<&'a DataSource, RdmError> {
    match (name, config.sources.as_slice()) {
        (Some(name), _) => config.source(name),
        (None, [only]) => Ok(only),
        (None, _) => Err(RdmError::UnknownSource(
            "--source is required when several sources are configured".to_string(),
        )),
    }
}

fn absolute_destination(value: &str) -> Result<Utf8PathBuf, RdmError> {
    let path = Utf8Path::new(value);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|err| RdmError::Filesystem(err.to_string()))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|_| RdmError::Filesystem("non-utf8 working directory".to_string()))?;
    Ok(cwd.join(path))
}

fn sink_for(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &TextOutput,
    }
}
