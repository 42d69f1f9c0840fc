use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use leafly_harvest::app::{App, ProgressSinkKind, RunOptions, RunResult, StrainFetch};
use leafly_harvest::config::{ConfigLoader, ResolvedConfig};
use leafly_harvest::domain::StrainSlug;
use leafly_harvest::error::HarvestError;
use leafly_harvest::http::ReqwestTransport;
use leafly_harvest::identity::IdentityPool;
use leafly_harvest::output::{CsvExport, JsonOutput, OutputMode};
use leafly_harvest::pacing::ThreadPacer;
use leafly_harvest::tui::Tui;

type HarvestApp = App<ReqwestTransport, ThreadPacer>;

#[derive(Parser)]
#[command(name = "leafly-harvest")]
#[command(about = "Resumable harvester for Leafly strain metadata and reviews")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// JSON config file (defaults to ./leafly-harvest.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch metadata, then reviews for every strain not yet on disk")]
    Run(RunArgs),
    #[command(about = "Load or scrape the strain table")]
    Strains(StrainsArgs),
    #[command(about = "Fetch reviews for a single strain")]
    Reviews(ReviewsArgs),
    #[command(about = "Merge review artifacts into one sorted table")]
    Aggregate(AggregateArgs),
    #[command(about = "Show snapshot and artifact state")]
    Status,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    limit: Option<usize>,

    #[arg(long)]
    no_shuffle: bool,

    #[arg(long)]
    keep_going: bool,

    #[arg(long)]
    refresh_metadata: bool,

    /// Write the aggregated review table as CSV.
    #[arg(long)]
    csv: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct StrainsArgs {
    #[arg(long)]
    refresh: bool,

    #[arg(long)]
    csv: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct ReviewsArgs {
    slug: String,
}

#[derive(Args)]
struct AggregateArgs {
    #[arg(long)]
    join_strains: bool,

    #[arg(long)]
    csv: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(harvest) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(harvest));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::InvalidSlug(_)
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidConfig(_) => 2,
        err if err.is_remote() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    // The TUI owns the terminal, so stay quiet there unless RUST_LOG asks.
    let default_filter = match output_mode {
        OutputMode::NonInteractive => "info",
        OutputMode::Interactive => "off",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = build_app(config);

    match cli.command {
        Commands::Run(args) => run_harvest(args, app, output_mode),
        Commands::Strains(args) => run_strains(args, app),
        Commands::Reviews(args) => run_reviews(args, app, output_mode),
        Commands::Aggregate(args) => run_aggregate(args, app),
        Commands::Status => {
            let result = app.status()?;
            JsonOutput::print_status(&result).into_diagnostic()?;
            Ok(())
        }
    }
}

fn build_app(config: ResolvedConfig) -> HarvestApp {
    let identities = IdentityPool::new(
        config.user_agents.clone(),
        config.proxies.clone(),
        config.rotate_every,
        config.seed,
    );
    let transport = ReqwestTransport::new(config.request_timeout);
    App::new(config.store(), config, transport, ThreadPacer, identities)
}

fn run_harvest(args: RunArgs, app: HarvestApp, output_mode: OutputMode) -> miette::Result<()> {
    let options = RunOptions {
        shuffle: !args.no_shuffle,
        limit: args.limit,
        keep_going: args.keep_going,
        refresh_metadata: args.refresh_metadata,
    };
    let result = match output_mode {
        OutputMode::NonInteractive => app.run(options, &JsonOutput)?,
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Run);
            tui.run(move |sink| app.run(options, sink))?
        }
    };
    if let Some(path) = &args.csv {
        CsvExport::write_reviews(path, &result.table)?;
    }
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_run(&result).into_diagnostic()?,
        OutputMode::Interactive => print_run_summary(&result),
    }
    Ok(())
}

fn run_strains(args: StrainsArgs, app: HarvestApp) -> miette::Result<()> {
    let result = app.strains(args.refresh, &JsonOutput)?;
    if let Some(path) = &args.csv {
        CsvExport::write_strains(path, &result.table)?;
    }
    JsonOutput::print_strains(&result).into_diagnostic()?;
    Ok(())
}

fn run_reviews(args: ReviewsArgs, app: HarvestApp, output_mode: OutputMode) -> miette::Result<()> {
    let slug: StrainSlug = args.slug.parse()?;
    let result = match output_mode {
        OutputMode::NonInteractive => app.fetch_reviews(&slug, &JsonOutput)?,
        OutputMode::Interactive => {
            let mut tui = Tui::new(ProgressSinkKind::Reviews);
            tui.run(move |sink| app.fetch_reviews(&slug, sink))?
        }
    };
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_fetch(&result).into_diagnostic()?,
        OutputMode::Interactive => print_fetch_line(&result),
    }
    Ok(())
}

fn run_aggregate(args: AggregateArgs, app: HarvestApp) -> miette::Result<()> {
    let result = app.aggregate(args.join_strains, &JsonOutput)?;
    if let Some(path) = &args.csv {
        CsvExport::write_reviews(path, &result.table)?;
    }
    JsonOutput::print_aggregate(&result).into_diagnostic()?;
    Ok(())
}

fn print_run_summary(result: &RunResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}leafly-harvest summary{reset}");
    println!(
        "{green}strains: {}  queued: {}  fetched: {}{reset}",
        result.strains, result.queued, result.fetched
    );
    if result.failed > 0 {
        println!("{yellow}failed: {}{reset}", result.failed);
    }
    for item in result.items.iter().filter(|item| item.action == "failed") {
        print_fetch_line(item);
    }
    println!("{cyan}aggregated review rows: {}{reset}", result.review_rows);
    if let Some(path) = &result.aggregate_path {
        println!("{cyan}checkpoint: {path}{reset}");
    }
}

fn print_fetch_line(item: &StrainFetch) {
    match (&item.error, &item.artifact_path) {
        (Some(error), _) => println!("{} failed: {error}", item.slug),
        (None, Some(path)) => println!(
            "{} {} ({} reviews, {} pages) -> {path}",
            item.slug, item.action, item.reviews, item.pages
        ),
        (None, None) => println!("{} {}", item.slug, item.action),
    }
}
