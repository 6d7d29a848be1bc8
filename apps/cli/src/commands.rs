//! CLI command definitions, routing, and tracing setup.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use mcpinsider_collector::{
    CollectionOutcome, GitHubFetchers, RssClient, StopReason, default_fetcher, run_collection,
};
use mcpinsider_core::admin::CatalogAdmin;
use mcpinsider_core::enrichment::{EnrichmentSession, GeminiClient};
use mcpinsider_core::gateway::{self, Stage, StageEvent, StageMap, SubprocessRunner};
use mcpinsider_core::merge::{MergeEngine, MergeOptions, PassReport};
use mcpinsider_core::news::{NewsOptions, NewsOutcome, run_news_pass};
use mcpinsider_core::pipeline::{self, AnalyzeOutcome, CollectAndAnalyze, PassProgress};
use mcpinsider_core::scheduler::{FileConfigSource, Scheduler, watch_config_file};
use mcpinsider_shared::{AppConfig, config_file_path, init_config, load_config, resolve_api_key};
use mcpinsider_storage::Documents;

use crate::server::{self, AppState};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// MCP Insider: harvest, annotate, and publish a catalog of MCP servers.
#[derive(Parser)]
#[command(
    name = "mcpinsider",
    version,
    about = "Harvest MCP server repositories, annotate them with an LLM, and curate the catalog.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.mcpinsider/mcpinsider.toml).
    #[arg(long, global = true, env = "MCPINSIDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run one collection pass and save the raw batch.
    Collect {
        /// Collect even if `collector.enabled` is false.
        #[arg(long)]
        force: bool,
    },

    /// Merge the latest raw batch into the catalog.
    Analyze,

    /// Summarize new articles from the configured news feeds.
    News,

    /// Run collection + analysis on the configured interval, following
    /// config file changes.
    Watch,

    /// Start the admin HTTP server.
    Serve {
        /// Address to bind (overrides `server.bind`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a pipeline stage and stream its output to this terminal.
    Stage {
        /// collect, analyze, or deploy.
        name: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Resolved config shared by every command.
pub(crate) struct Context {
    pub config_path: PathBuf,
    pub config: AppConfig,
}

impl Context {
    pub(crate) fn load(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => config_file_path()?,
        };
        let config = load_config(&config_path)
            .wrap_err_with(|| format!("loading {}", config_path.display()))?;
        Ok(Self {
            config_path,
            config,
        })
    }

    fn documents(&self) -> Documents {
        Documents::open_dir(&self.config.paths.data_dir)
    }
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Per-stage log file for commands that run as pipeline stages.
fn stage_log_file(cli: &Cli, ctx: &Context) -> Option<File> {
    let stage = match cli.command {
        Command::Collect { .. } => Stage::Collect,
        Command::Analyze => Stage::Analyze,
        _ => return None,
    };
    let data_dir = &ctx.config.paths.data_dir;
    let path = data_dir.join(stage.log_file_name()?);

    let opened = std::fs::create_dir_all(data_dir)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(&path));
    match opened {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("warning: cannot open {}: {e}", path.display());
            None
        }
    }
}

/// Initialize tracing based on CLI flags. Stage commands also append plain
/// log lines to their log file in the data dir.
pub(crate) fn init_tracing(cli: &Cli, ctx: &Context) {
    use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

    let filter = match cli.verbose {
        0 => "mcpinsider=info",
        1 => "mcpinsider=debug,tower_http=debug",
        _ => "mcpinsider=trace,tower_http=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    let console = match cli.log_format {
        LogFormat::Text => fmt::layer().with_target(false).boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    let file = stage_log_file(cli, ctx).map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli, ctx: Context) -> Result<ExitCode> {
    match cli.command {
        Command::Collect { force } => cmd_collect(&ctx, force).await,
        Command::Analyze => cmd_analyze(&ctx).await,
        Command::News => cmd_news(&ctx).await,
        Command::Watch => cmd_watch(&ctx).await,
        Command::Serve { bind } => cmd_serve(&ctx, bind.as_deref()).await,
        Command::Stage { name } => cmd_stage(&ctx, &name).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(&ctx),
            ConfigAction::Show => cmd_config_show(&ctx),
        },
    }
}

fn text_generator(config: &AppConfig) -> Result<GeminiClient> {
    let api_key = resolve_api_key(config)?;
    Ok(GeminiClient::new(&config.analyzer, api_key)?)
}

fn merge_engine(config: &AppConfig) -> Result<MergeEngine> {
    Ok(MergeEngine::new(
        Arc::new(text_generator(config)?),
        MergeOptions::from(&config.analyzer),
    ))
}

fn stage_runner(ctx: &Context) -> Result<SubprocessRunner> {
    let exe = std::env::current_exe().wrap_err("cannot locate the mcpinsider executable")?;
    let stages = StageMap::from_config(&ctx.config.stages, &exe, &ctx.config_path)?;
    Ok(SubprocessRunner::new(stages))
}

async fn cmd_collect(ctx: &Context, force: bool) -> Result<ExitCode> {
    let mut collector = ctx.config.collector.clone();
    if force {
        collector.enabled = true;
    }
    let fetcher = default_fetcher(&collector)?;
    let docs = ctx.documents();

    match run_collection(&collector, &fetcher, &docs, Utc::now()).await? {
        CollectionOutcome::Skipped => {
            println!("Collector is disabled (use --force to collect anyway).");
        }
        CollectionOutcome::Saved { count, stop } => {
            println!();
            println!("  Collected {count} repositories.");
            if let StopReason::FetchError(reason) = &stop {
                println!("  Stopped early: {reason}");
            }
            println!("  Saved to: {}", ctx.config.paths.data_dir.join("raw_data.json").display());
            println!();
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_analyze(ctx: &Context) -> Result<ExitCode> {
    let engine = merge_engine(&ctx.config)?;
    let mut session = EnrichmentSession::from_config(&ctx.config.analyzer);
    let docs = ctx.documents();
    let reporter = CliProgress::new();

    let outcome = pipeline::analyze(&docs, &engine, &mut session, Utc::now(), &reporter).await?;
    match outcome {
        AnalyzeOutcome::NoRawBatch => {
            reporter.spinner.finish_and_clear();
            println!("No raw batch found. Run `mcpinsider collect` first.");
        }
        AnalyzeOutcome::Completed(report) => {
            println!();
            println!("  Analysis complete.");
            println!("  Enriched: {}", report.enriched);
            println!("  Skipped:  {}", report.skipped);
            println!("  Pruned:   {}", report.pruned);
            if report.exhausted {
                println!("  No enrichment model was available for the remaining records.");
            }
            println!();
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_news(ctx: &Context) -> Result<ExitCode> {
    let generator = text_generator(&ctx.config)?;
    let fetcher = RssClient::new()?;
    let mut session = EnrichmentSession::from_config(&ctx.config.analyzer);

    let outcome = run_news_pass(
        &ctx.documents(),
        &fetcher,
        &generator,
        &mut session,
        &NewsOptions::from(&ctx.config.news),
        Utc::now(),
    )
    .await?;
    match outcome {
        NewsOutcome::NoFeeds => {
            let path = ctx.config.paths.data_dir.join("news_feeds.json");
            println!("No feed list found at {}.", path.display());
        }
        NewsOutcome::Completed { added, total } => {
            println!();
            println!("  News updated.");
            println!("  Added: {added}");
            println!("  Total: {total}");
            println!();
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_watch(ctx: &Context) -> Result<ExitCode> {
    let engine = merge_engine(&ctx.config)?;
    // Fail fast on a collector config the first pass could not use.
    ctx.config.collector.validate()?;
    let pass = CollectAndAnalyze::new(
        ctx.documents(),
        Arc::new(GitHubFetchers),
        engine,
        EnrichmentSession::from_config(&ctx.config.analyzer),
    );

    let scheduler = Scheduler::new(
        Arc::new(FileConfigSource::new(&ctx.config_path)),
        Arc::new(pass),
    );
    let changes = watch_config_file(
        ctx.config_path.clone(),
        std::time::Duration::from_millis(ctx.config.watch.debounce_ms),
    )?;

    info!(config = %ctx.config_path.display(), "watching for config changes");
    tokio::select! {
        result = scheduler.run(changes) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, stopping scheduler"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_serve(ctx: &Context, bind: Option<&str>) -> Result<ExitCode> {
    let state = AppState {
        admin: Arc::new(CatalogAdmin::new(ctx.documents(), &ctx.config_path)),
        stages: Arc::new(stage_runner(ctx)?),
    };
    let bind = bind.unwrap_or(&ctx.config.server.bind);
    server::serve(bind, state)
        .await
        .wrap_err_with(|| format!("admin server on {bind}"))?;
    Ok(ExitCode::SUCCESS)
}

/// Relay a stage to this terminal and exit with its exit code.
async fn cmd_stage(ctx: &Context, name: &str) -> Result<ExitCode> {
    let runner = stage_runner(ctx)?;
    let mut stream = gateway::open_stage(&runner, name).await?;

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c() => {
                stream.cancel();
                eprintln!("interrupted, stage killed");
                return Ok(ExitCode::from(130));
            }
        };
        match event {
            Some(StageEvent::Output { text }) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            Some(StageEvent::ErrorOutput { text }) => {
                stderr.write_all(text.as_bytes())?;
                stderr.flush()?;
            }
            Some(StageEvent::Done { code }) => return Ok(exit_code(code)),
            None => return Ok(ExitCode::FAILURE),
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}

fn cmd_config_init(ctx: &Context) -> Result<ExitCode> {
    let path = init_config(&ctx.config_path)?;
    println!("Config initialized at: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show(ctx: &Context) -> Result<ExitCode> {
    let toml_str = toml::to_string_pretty(&ctx.config)?;
    println!("# {}", display_path(&ctx.config_path));
    println!("{toml_str}");
    Ok(ExitCode::SUCCESS)
}

fn display_path(path: &Path) -> String {
    if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not found, showing defaults)", path.display())
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl PassProgress for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn record_progress(&self, current: usize, total: usize, name: &str) {
        self.spinner
            .set_message(format!("Analyzing [{current}/{total}] {name}"));
    }

    fn done(&self, _report: &PassReport) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_stage_and_globals() {
        let cli = Cli::try_parse_from([
            "mcpinsider",
            "--config",
            "/tmp/mi.toml",
            "-vv",
            "stage",
            "deploy",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/mi.toml")));
        assert!(matches!(cli.command, Command::Stage { ref name } if name == "deploy"));
    }

    #[test]
    fn collect_force_flag() {
        let cli = Cli::try_parse_from(["mcpinsider", "collect", "--force"]).unwrap();
        assert!(matches!(cli.command, Command::Collect { force: true }));
    }

    #[test]
    fn news_subcommand_parses() {
        let cli = Cli::try_parse_from(["mcpinsider", "news"]).unwrap();
        assert!(matches!(cli.command, Command::News));
    }

    #[test]
    fn exit_codes_map_into_range() {
        assert_eq!(exit_code(0), ExitCode::SUCCESS);
        assert_eq!(exit_code(-1), ExitCode::FAILURE);
        assert_eq!(exit_code(300), ExitCode::FAILURE);
        assert_eq!(exit_code(3), ExitCode::from(3));
    }

    #[test]
    fn stage_commands_get_a_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.data_dir = dir.path().join("data");
        let ctx = Context {
            config_path: dir.path().join("mi.toml"),
            config,
        };

        let cli = Cli::try_parse_from(["mcpinsider", "analyze"]).unwrap();
        assert!(stage_log_file(&cli, &ctx).is_some());
        assert!(dir.path().join("data/analyzer.log").exists());

        let cli = Cli::try_parse_from(["mcpinsider", "serve"]).unwrap();
        assert!(stage_log_file(&cli, &ctx).is_none());
    }
}
