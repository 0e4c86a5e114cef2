use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use trialscope::app::App;
use trialscope::config::ConfigLoader;
use trialscope::domain::{SearchRequest, Source};
use trialscope::error::TrialScopeError;
use trialscope::export;
use trialscope::output::{JsonOutput, SourcesResult};

#[derive(Parser)]
#[command(name = "trialscope")]
#[command(about = "Clinical trial and literature search across registries, with optional AI relevance scoring")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run one query across the selected sources and export a CSV artifact")]
    Search(SearchArgs),
    #[command(about = "List the available sources and their coverage")]
    Sources,
}

#[derive(Args)]
struct SearchArgs {
    /// Free-text condition or topic to search for.
    #[arg(long)]
    query: String,

    /// Source to query; repeat for several. All sources when omitted.
    #[arg(long = "source", value_enum)]
    sources: Vec<Source>,

    /// Cap on results fetched per source.
    #[arg(long, default_value_t = 50)]
    max_results: usize,

    /// Anthropic API key; falls back to ANTHROPIC_API_KEY. Relevance
    /// scoring is skipped when neither is set.
    #[arg(long)]
    api_key: Option<String>,

    /// CSV artifact path. A timestamped name in the working directory when
    /// omitted.
    #[arg(long)]
    out: Option<Utf8PathBuf>,

    /// Pipeline config file (defaults to trialscope.json when present).
    #[arg(long)]
    config: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<TrialScopeError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &TrialScopeError) -> u8 {
    match error {
        TrialScopeError::EmptyQuery
        | TrialScopeError::NoSourcesSelected
        | TrialScopeError::InvalidMaxResults(_)
        | TrialScopeError::UnknownSource(_)
        | TrialScopeError::ConfigRead(_)
        | TrialScopeError::ConfigParse(_)
        | TrialScopeError::InvalidThresholds(_)
        | TrialScopeError::InvalidSimilarity(_)
        | TrialScopeError::InvalidBatchSize => 2,
        TrialScopeError::HttpClient(_) | TrialScopeError::Filesystem(_) => 3,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Search(args) => run_search(args),
        Commands::Sources => {
            let result = SourcesResult {
                sources: Source::all().iter().map(Source::info).collect(),
            };
            JsonOutput::print_sources(&result).into_diagnostic()
        }
    }
}

fn run_search(args: SearchArgs) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref()).into_diagnostic()?;
    let app = App::new(config).into_diagnostic()?;

    let sources = if args.sources.is_empty() {
        Source::all().to_vec()
    } else {
        args.sources.clone()
    };
    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
    let request =
        SearchRequest::new(args.query.clone(), sources, args.max_results).with_api_key(api_key);

    let report = app.search(&request, &JsonOutput).into_diagnostic()?;

    let path = args
        .out
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from(export::default_artifact_name()));
    export::write_csv(&report.records, &path).into_diagnostic()?;

    JsonOutput::print_search(&report).into_diagnostic()
}
