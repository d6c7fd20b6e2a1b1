use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use testrelay::relay::{self, RelayState};
use testrelay::{
    ConfigurationError, ExecutionCoordinator, ExecutionError, ExecutionMode, ExecutionOptions,
    ExecutionReport, ExecutionSummary, InMemoryRecordStore, Settings, SubjectId, TestStatus,
};

#[derive(Parser, Debug)]
#[command(
    name = "testrelay",
    version,
    author,
    about = "Dispatch test runs to CI and collect their results"
)]
struct Cli {
    /// Configuration file (defaults to ./testrelay.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run test cases and wait for their results.
    Run(RunArgs),
    /// Run the result relay that CI posts results to.
    Serve(ServeArgs),
    /// Configuration commands.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Requirement the run belongs to. Omit for a bulk run.
    #[arg(long)]
    subject: Option<String>,
    /// Test case to run; repeat for several.
    #[arg(long = "test-case", required = true)]
    test_cases: Vec<String>,
    /// How results are obtained.
    #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
    mode: ModeArg,
    /// Print the final report and summary as JSON.
    #[arg(long)]
    json: bool,
    /// Write an execution journal under this directory.
    #[arg(long)]
    journal: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address; overrides `relay.bind`.
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Auto,
    Ci,
    Simulated,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => ExecutionMode::Auto,
            ModeArg::Ci => ExecutionMode::Ci,
            ModeArg::Simulated => ExecutionMode::Simulated,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            if is_configuration_error(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("testrelay=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<ConfigurationError>().is_some()
            || matches!(
                cause.downcast_ref::<ExecutionError>(),
                Some(ExecutionError::Configuration(_))
            )
    })
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::load(cli.config.as_deref())?;
    match cli.command {
        Command::Run(args) => run_execution(settings, args).await,
        Command::Serve(args) => serve_relay(settings, args).await,
        Command::Config(ConfigCommand::Show) => {
            let rendered = settings.to_toml().context("failed to render settings")?;
            print!("{}", rendered);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_execution(mut settings: Settings, args: RunArgs) -> Result<ExitCode> {
    if let Some(dir) = args.journal {
        settings.journal_dir = Some(dir);
    }

    let store = Arc::new(InMemoryRecordStore::new());
    let coordinator = ExecutionCoordinator::from_settings(&settings, store)?;
    let subject = args.subject.map(SubjectId::new).unwrap_or_else(SubjectId::bulk);
    let handle = coordinator.start(
        subject,
        args.test_cases,
        ExecutionOptions::new().with_mode(args.mode.into()),
    )?;

    if !args.json {
        println!(
            "{} {} for {}",
            "Started".green().bold(),
            handle.request_id(),
            handle.subject_id()
        );
        coordinator.on_progress(&handle, |results| {
            for result in results {
                println!("  {} {}", status_label(result.status), result.test_case_id);
            }
        });
    }

    let report = tokio::select! {
        report = handle.wait() => report,
        _ = tokio::signal::ctrl_c() => {
            coordinator.cancel(&handle);
            handle.wait().await
        }
    };
    let summary = coordinator.summary(handle.request_id());

    if args.json {
        let output = json!({ "report": report, "summary": summary });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_report(&report, summary.as_ref());
    }

    Ok(if report.outcome.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn status_label(status: TestStatus) -> String {
    let label = format!("{:<11}", status.label());
    match status {
        TestStatus::Passed => label.green().to_string(),
        TestStatus::Failed => label.red().to_string(),
        TestStatus::Blocked => label.yellow().to_string(),
        TestStatus::Cancelled => label.dimmed().to_string(),
        TestStatus::Running => label.cyan().to_string(),
        TestStatus::NotStarted => label,
    }
}

fn print_report(report: &ExecutionReport, summary: Option<&ExecutionSummary>) {
    let banner = report.outcome.banner();
    if report.outcome.is_completed() {
        println!("{}", banner.green().bold());
    } else {
        println!("{}", banner.red().bold());
    }

    if let Some(summary) = summary {
        let counts: Vec<String> = summary
            .status_counts
            .iter()
            .map(|(status, count)| format!("{} {}", count, status.label()))
            .collect();
        println!("{} tests: {}", summary.total_tests, counts.join(", "));
    }
    if !report.unresolved.is_empty() {
        println!(
            "{} {}",
            "No result for:".yellow(),
            report.unresolved.join(", ")
        );
    }
    if !report.unreconciled.is_empty() {
        println!(
            "{} {}",
            "Not recorded:".red(),
            report.unreconciled.join(", ")
        );
    }
}

async fn serve_relay(settings: Settings, args: ServeArgs) -> Result<ExitCode> {
    let bind = args.bind.unwrap_or_else(|| settings.relay.bind.clone());
    let state = RelayState::from_settings(&settings.relay);
    relay::serve(&bind, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(ExitCode::SUCCESS)
}
