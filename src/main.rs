use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use catalog_sync::catalog::SpotifyClient;
use catalog_sync::config::{self, Config, EnvConfig};
use catalog_sync::model::Label;
use catalog_sync::reconcile::{KeywordTable, ReconcileOptions, Reconciler};
use catalog_sync::report::{ErrorLog, Progress, RunOutcome, SyncReport};
use catalog_sync::store::{load_labels, CatalogStore, PgStore};
use catalog_sync::sync::{SyncOptions, SyncOrchestrator};

#[derive(Parser)]
#[command(
    name = "catalog-sync",
    version,
    about = "Sync label catalogs from Spotify and reconcile label assignments"
)]
struct Cli {
    /// TOML config file (default: $CATALOG_SYNC_CONFIG or ./catalog-sync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (LOG_LEVEL takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync a label's albums from the catalog
    Sync(SyncArgs),
    /// Correct release label assignments for a label
    Reconcile(ReconcileArgs),
    /// Apply database migrations
    Migrate,
}

#[derive(Args)]
struct SyncArgs {
    /// Label name or slug
    #[arg(long, required_unless_present = "all", conflicts_with = "all")]
    label: Option<String>,

    /// Sync every configured label, one after another
    #[arg(long)]
    all: bool,

    /// Resolve only and print what would be written
    #[arg(long)]
    dry_run: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ReconcileArgs {
    /// Label name or slug
    #[arg(long)]
    label: String,

    /// Report planned reassignments without writing
    #[arg(long)]
    dry_run: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Handles acquired once per invocation.
struct Runtime {
    config: Config,
    catalog: SpotifyClient,
    store: PgStore,
    error_log: ErrorLog,
    cancel: CancellationToken,
}

impl Runtime {
    async fn open(config_override: Option<PathBuf>) -> Result<Self> {
        let env = EnvConfig::from_env()?;
        let config_path = Config::resolve_path(config_override.as_deref(), env.config_path.as_deref());
        let config = Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
        let error_log = ErrorLog::open(&config.sync.error_log).with_context(|| {
            format!("Cannot open {}", config.sync.error_log.display())
        })?;
        let catalog = SpotifyClient::new(
            env.credentials.clone(),
            &env.api_base,
            &env.accounts_base,
            &config,
        )
        .context("Failed to create HTTP client")?;
        let store = PgStore::connect(&env.database_url, &config)
            .await
            .context("Failed to connect to database. Is PostgreSQL running?")?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the current album");
                token.cancel();
            }
        });

        Ok(Self {
            config,
            catalog,
            store,
            error_log,
            cancel,
        })
    }

    /// Rows for every configured label. Real runs create missing rows; dry
    /// runs only report them.
    async fn labels(&self, dry_run: bool) -> Result<Vec<Label>> {
        let labels = load_labels(&self.store, &self.config.labels, dry_run)
            .await
            .context("Failed to load labels")?;
        for label in labels.iter().filter(|l| !l.is_stored()) {
            eprintln!(
                "{} {} is not in the database yet; a real run would create it",
                "Note:".yellow().bold(),
                label.name.bright_white()
            );
        }
        Ok(labels)
    }

    fn find_label<'l>(&self, labels: &'l [Label], name: &str) -> Result<&'l Label> {
        let spec = self
            .config
            .label(name)
            .with_context(|| format!("Label {:?} is not configured", name))?;
        let slug = spec.slug();
        labels
            .iter()
            .find(|l| l.slug == slug)
            .with_context(|| format!("Label {:?} missing from database", name))
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn migrate() -> Result<u8> {
    let url = EnvConfig::database_url()?;
    let store = PgStore::connect(&url, &Config::default())
        .await
        .context("Failed to connect to database. Is PostgreSQL running?")?;
    let result = match store.migrate().await {
        Ok(()) => store.counts().await.map_err(anyhow::Error::from),
        Err(e) => Err(anyhow::Error::from(e).context("Migration failed")),
    };
    store.close().await;
    let counts = result?;

    println!("{} Migrations applied", "✓".green());
    println!();
    println!("  {} {}", "Labels:".white(), counts.labels);
    println!("  {} {}", "Artists:".white(), counts.artists);
    println!("  {} {}", "Releases:".white(), counts.releases);
    println!("  {} {}", "Tracks:".white(), counts.tracks);
    println!(
        "  {} {} release, {} track",
        "Credits:".white(),
        counts.release_artists,
        counts.track_artists
    );
    Ok(0)
}

/// Cancelled beats failed beats partial.
fn combined_exit_code(reports: &[SyncReport]) -> u8 {
    if reports.iter().any(|r| r.outcome == RunOutcome::Cancelled) {
        130
    } else if reports.iter().any(|r| r.outcome == RunOutcome::Failed) {
        1
    } else {
        reports.iter().map(SyncReport::exit_code).max().unwrap_or(0)
    }
}

async fn sync(rt: &Runtime, args: &SyncArgs) -> Result<u8> {
    let labels = rt.labels(args.dry_run).await?;
    let targets: Vec<&Label> = match &args.label {
        Some(name) if !args.all => vec![rt.find_label(&labels, name)?],
        _ => labels.iter().collect(),
    };

    let options = SyncOptions {
        page_size: rt.config.sync.page_size,
        max_pages: rt.config.sync.max_pages,
        dry_run: args.dry_run,
    };
    let mut orchestrator = SyncOrchestrator::new(
        &rt.catalog,
        &rt.store,
        &rt.error_log,
        options,
        rt.cancel.clone(),
    )
    .with_progress(Progress::new(!args.json));

    let mut reports = Vec::with_capacity(targets.len());
    for label in targets {
        let report = orchestrator.run_sync(label).await;
        if !args.json {
            report.print_summary();
        }
        let stop = report.outcome != RunOutcome::Completed;
        reports.push(report);
        if stop {
            break;
        }
    }

    if args.json {
        let out = if args.all {
            serde_json::to_string_pretty(&reports)?
        } else {
            serde_json::to_string_pretty(&reports.first())?
        };
        println!("{}", out);
    } else if reports.iter().any(|r| r.has_failures()) {
        println!();
        println!(
            "{} Failed items were appended to {}. Run {} again to retry.",
            "Tip:".yellow().bold(),
            rt.config.sync.error_log.display(),
            "catalog-sync sync".bright_cyan()
        );
    }
    Ok(combined_exit_code(&reports))
}

async fn reconcile(rt: &Runtime, args: &ReconcileArgs) -> Result<u8> {
    let labels = rt.labels(args.dry_run).await?;
    let target = rt.find_label(&labels, &args.label)?;
    let table = KeywordTable::from_labels(&rt.config.labels);
    let options = ReconcileOptions {
        page_size: rt.config.sync.page_size,
        max_pages: rt.config.sync.max_pages,
        dry_run: args.dry_run,
    };

    Progress::new(!args.json).header("Catalog Reconcile", &target.name, args.dry_run);
    let report = Reconciler::new(&rt.store, &rt.error_log)
        .reconcile_label(&rt.catalog, target, &labels, &table, &options, &rt.cancel)
        .await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_summary();
    }
    Ok(report.exit_code())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .ok();
}

async fn run(cli: Cli) -> Result<u8> {
    match cli.command {
        Command::Migrate => migrate().await,
        Command::Sync(args) => {
            let rt = Runtime::open(cli.config).await?;
            let result = sync(&rt, &args).await;
            rt.store.close().await;
            result
        }
        Command::Reconcile(args) => {
            let rt = Runtime::open(cli.config).await?;
            let result = reconcile(&rt, &args).await;
            rt.store.close().await;
            result
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let dotenv = config::load_dotenv();
    init_tracing(cli.verbose);
    if let Some(path) = dotenv {
        debug!("Loaded environment from {}", path.display());
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(1)
        }
    }
}
