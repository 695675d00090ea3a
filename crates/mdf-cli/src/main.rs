use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mdf_extract::{decompose_all, default_model_groups, load_model_groups, rank_groups};
use mdf_harvest::{HarvestOrchestrator, ReplayViewFactory};
use mdf_report::{
    run_and_report, spawn_harvest_and_notify, write_listings_csv, write_ranked_csv,
    write_results_html, DeliveryContext, Messenger, NoopMessenger, TelegramMessenger,
};
use mdf_store::{cache_key, sqlite_url, ProductStore, ResultCache};

#[derive(Debug, Parser)]
#[command(name = "mdf-cli")]
#[command(about = "Marketplace Deal Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one harvest-and-deliver cycle.
    Harvest {
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Rebuild report files from the cached harvest, without going live.
    Report {
        #[arg(long)]
        query: Option<String>,
    },
    /// Keep running and harvest on the configured schedule.
    Watch,
}

#[derive(Debug, Clone)]
struct AppConfig {
    cache_dir: PathBuf,
    report_dir: PathBuf,
    database_path: PathBuf,
    fixture_path: PathBuf,
    query: String,
    bot_token: Option<String>,
    chat_id: i64,
    model_groups_path: Option<PathBuf>,
    scheduler_enabled: bool,
    harvest_cron_1: String,
    harvest_cron_2: String,
    marketplace: String,
}

impl AppConfig {
    fn from_env() -> Self {
        Self {
            cache_dir: std::env::var("MDF_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cache")),
            report_dir: std::env::var("MDF_REPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            database_path: std::env::var("MDF_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./marketplace_deals.db")),
            fixture_path: std::env::var("MDF_FIXTURE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures/lenovo-thinkbook.json")),
            query: std::env::var("MDF_QUERY").unwrap_or_else(|_| "lenovo thinkbook".to_string()),
            bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.is_empty()),
            chat_id: std::env::var("MDF_CHAT_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            model_groups_path: std::env::var("MDF_MODEL_GROUPS").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("MDF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            harvest_cron_1: std::env::var("MDF_HARVEST_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            harvest_cron_2: std::env::var("MDF_HARVEST_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            marketplace: std::env::var("MDF_MARKETPLACE")
                .unwrap_or_else(|_| "Yandex Market".to_string()),
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();
}

async fn build_context(config: &AppConfig) -> anyhow::Result<DeliveryContext> {
    let messenger: Arc<dyn Messenger> = match &config.bot_token {
        Some(token) => Arc::new(TelegramMessenger::new(token.clone())?),
        None => Arc::new(NoopMessenger),
    };

    let store = match ProductStore::connect(&sqlite_url(&config.database_path)).await {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(error = %err, "product store unavailable, continuing without it");
            None
        }
    };

    let groups = match &config.model_groups_path {
        Some(path) => load_model_groups(path)?,
        None => default_model_groups(),
    };

    Ok(DeliveryContext {
        messenger,
        store,
        groups,
        report_dir: config.report_dir.clone(),
        marketplace: config.marketplace.clone(),
    })
}

fn build_orchestrator(
    config: &AppConfig,
    fixture: Option<PathBuf>,
) -> anyhow::Result<HarvestOrchestrator<ReplayViewFactory>> {
    let fixture = fixture.unwrap_or_else(|| config.fixture_path.clone());
    let factory = ReplayViewFactory::from_file(&fixture)
        .with_context(|| format!("loading replay fixture {}", fixture.display()))?;
    Ok(HarvestOrchestrator::new(
        factory,
        ResultCache::new(config.cache_dir.clone()),
    ))
}

async fn run_harvest(
    config: &AppConfig,
    query: Option<String>,
    fixture: Option<PathBuf>,
) -> anyhow::Result<()> {
    let query = query.unwrap_or_else(|| config.query.clone());
    let orchestrator = build_orchestrator(config, fixture)?;
    let ctx = build_context(config).await?;

    match run_and_report(&orchestrator, &ctx, config.chat_id, &query).await? {
        Some(artifacts) => println!(
            "harvest complete: query='{}' report={}",
            query,
            artifacts.html.display()
        ),
        None => println!("harvest produced no listings for query '{query}'"),
    }
    Ok(())
}

async fn run_report(config: &AppConfig, query: Option<String>) -> anyhow::Result<()> {
    let query = query.unwrap_or_else(|| config.query.clone());
    let cache = ResultCache::new(config.cache_dir.clone());
    let key = cache_key(&query);

    let records = match cache.load(&key).await {
        Ok(records) => records,
        Err(err) => {
            println!("no usable cache for query '{query}' ({err}); run `mdf-cli harvest` first");
            return Ok(());
        }
    };

    let listings = decompose_all(&records);
    let groups = match &config.model_groups_path {
        Some(path) => load_model_groups(path)?,
        None => default_model_groups(),
    };
    let ranked = rank_groups(&listings, &groups);

    tokio::fs::create_dir_all(&config.report_dir)
        .await
        .with_context(|| format!("creating {}", config.report_dir.display()))?;
    write_listings_csv(config.report_dir.join("listings.csv"), &listings)?;
    write_ranked_csv(config.report_dir.join("best_offers.csv"), &ranked)?;
    write_results_html(config.report_dir.join("results.html"), &ranked)?;

    println!(
        "report rebuilt from cache: {} listings, {} groups",
        listings.len(),
        ranked.len()
    );
    Ok(())
}

async fn run_watch(config: &AppConfig) -> anyhow::Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config, None)?);
    let ctx = Arc::new(build_context(config).await?);

    if !config.scheduler_enabled {
        info!("scheduler disabled, running a single harvest cycle");
        let _ = spawn_harvest_and_notify(
            orchestrator,
            ctx,
            config.chat_id,
            config.query.clone(),
        )
        .await;
        return Ok(());
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.harvest_cron_1, &config.harvest_cron_2] {
        let orchestrator = orchestrator.clone();
        let ctx = ctx.clone();
        let query = config.query.clone();
        let chat_id = config.chat_id;
        let job = Job::new_async(cron.as_str(), move |_uuid, _scheduler| {
            let orchestrator = orchestrator.clone();
            let ctx = ctx.clone();
            let query = query.clone();
            Box::pin(async move {
                info!(query, "scheduled harvest triggered");
                let _ = spawn_harvest_and_notify(orchestrator, ctx, chat_id, query);
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;
    }
    scheduler.start().await.context("starting scheduler")?;
    info!(
        cron_1 = %config.harvest_cron_1,
        cron_2 = %config.harvest_cron_2,
        "watching on schedule, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl+c")?;
    info!("shutting down watcher");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Harvest {
        query: None,
        fixture: None,
    }) {
        Commands::Harvest { query, fixture } => run_harvest(&config, query, fixture).await?,
        Commands::Report { query } => run_report(&config, query).await?,
        Commands::Watch => run_watch(&config).await?,
    }

    Ok(())
}
