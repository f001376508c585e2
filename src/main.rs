use actix::prelude::*;
use anyhow::Context as AnyhowContext;
use clap::{Parser, Subcommand};
use pricefeed::aliexpress::{self, AffiliateApi, AliExpressClient};
use pricefeed::category::{CategoryCounter, SqliteCategoryRepository};
use pricefeed::config::{self, Settings};
use pricefeed::fetch::{self, HttpFetcher};
use pricefeed::product::SqliteProductRepository;
use pricefeed::reconcile::Reconciler;
use pricefeed::service::{ImportUpload, ImportUrl, ListJobs, RunAll, RunSource, SyncService};
use pricefeed::sync::SyncOrchestrator;
use pricefeed::sync_job::SqliteSyncJobRepository;
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use typesafe_repository::async_ops::List;

#[derive(Parser, Debug)]
#[command(name = "pricefeed", version, about = "Feed ingestion and product reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run configured sources on schedule until interrupted
    Serve,
    /// Run configured sources once, optionally only those of one platform
    Sync { platform: Option<String> },
    /// Import a local CSV or XML file
    Import {
        platform: String,
        file: PathBuf,
        #[arg(long)]
        category: Option<String>,
    },
    /// Fetch and import a remote feed
    ImportUrl {
        platform: String,
        url: String,
        #[arg(long)]
        category: Option<String>,
    },
    /// Extract the AliExpress product id from a product or short link
    ResolveId { url: String },
    /// Print catalog and category counts
    Stats,
    /// Print recent sync jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Serialize)]
struct StatsOutput {
    #[serde(flatten)]
    catalog: pricefeed_types::product::CatalogStats,
    categories: Vec<pricefeed_types::category::Category>,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), anyhow::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[actix::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    config::load_env_file(".env")?;
    let settings = Settings::from_env()?;
    let cli = Cli::parse();

    if let Some(dir) = Path::new(&settings.database_path).parent() {
        std::fs::create_dir_all(dir)
            .context(format!("Unable to create {}", dir.display()))?;
    }
    let conn = Connection::open(&settings.database_path).await?;
    let products = Arc::new(SqliteProductRepository::init(conn.clone()).await?);
    let categories = Arc::new(SqliteCategoryRepository::init(conn.clone()).await?);
    let jobs = Arc::new(SqliteSyncJobRepository::init(conn).await?);

    let client = fetch::build_client(settings.fetch_timeout)?;
    let api: Option<Arc<dyn AffiliateApi>> = settings.aliexpress.clone().map(|credentials| {
        Arc::new(
            AliExpressClient::new(
                client.clone(),
                settings.aliexpress_endpoint.clone(),
                credentials,
            )
            .with_target(
                settings.target_currency.clone(),
                settings.target_language.clone(),
            ),
        ) as Arc<dyn AffiliateApi>
    });
    let reconciler = Reconciler::new(products.clone(), categories.clone())
        .with_concurrency(settings.reconcile_concurrency);
    let counter = CategoryCounter::new(products, categories.clone());
    let orchestrator = SyncOrchestrator::new(
        reconciler,
        counter.clone(),
        jobs,
        Arc::new(HttpFetcher::new(client.clone())),
        api,
    )
    .with_concurrency(settings.sync_concurrency);

    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        let token = t;
        match signal::ctrl_c().await {
            Ok(_) => token.cancel(),
            Err(err) => log::error!("Unable to listen to shutdown: {err}"),
        }
    });

    let mut service = SyncService::new(orchestrator, &settings.sources_path, token.clone());
    if matches!(cli.command, Commands::Serve) {
        service = service.with_schedule(settings.sync_interval);
    }
    let addr = service.start();

    match cli.command {
        Commands::Serve => {
            log::info!(
                "Syncing sources from {} every {}m",
                settings.sources_path,
                settings.sync_interval.as_secs() / 60
            );
            token.cancelled().await;
            log::info!("Shutting down");
        }
        Commands::Sync { platform: None } => print_json(&addr.send(RunAll).await??)?,
        Commands::Sync {
            platform: Some(platform),
        } => print_json(&addr.send(RunSource(platform)).await??)?,
        Commands::Import {
            platform,
            file,
            category,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .context(format!("Unable to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let job = addr
                .send(ImportUpload {
                    platform,
                    file_name,
                    data,
                    category,
                })
                .await??;
            print_json(&job)?;
        }
        Commands::ImportUrl {
            platform,
            url,
            category,
        } => {
            let job = addr
                .send(ImportUrl {
                    platform,
                    url,
                    category,
                })
                .await??;
            print_json(&job)?;
        }
        Commands::ResolveId { url } => match aliexpress::resolve_product_id(&client, &url).await {
            Some(id) => println!("{id}"),
            None => return Err(anyhow::anyhow!("No product id found in {url}")),
        },
        Commands::Stats => {
            let catalog = counter.stats().await?;
            let mut categories = categories.list().await?;
            categories.sort_by(|a, b| a.slug.cmp(&b.slug));
            print_json(&StatsOutput {
                catalog,
                categories,
            })?;
        }
        Commands::Jobs { limit } => print_json(&addr.send(ListJobs(limit)).await??)?,
    }
    Ok(())
}
