use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use imob_sync::ScrapeConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "imob-cli")]
#[command(about = "Harvest real-estate listings into a store")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl, extract and persist new listings (default).
    Scrape {
        /// Keep results in memory instead of writing to a store.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply SQL migrations to DATABASE_URL.
    Migrate,
    /// Crawl the catalog and print canonical listing links.
    Crawl,
}

#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    catalog_url: Option<String>,
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    #[arg(long, global = true)]
    task_timeout_secs: Option<u64>,
    /// Show the browser window.
    #[arg(long, global = true)]
    headed: bool,
    #[arg(long, global = true)]
    no_export: bool,
}

impl Overrides {
    fn apply(self, config: &mut ScrapeConfig) {
        if let Some(url) = self.catalog_url {
            config.catalog_url = url;
        }
        if let Some(n) = self.concurrency.filter(|n| *n > 0) {
            config.concurrency = n;
        }
        if let Some(n) = self.batch_size.filter(|n| *n > 0) {
            config.batch_size = n;
        }
        if let Some(secs) = self.task_timeout_secs.filter(|s| *s > 0) {
            config.task_timeout = std::time::Duration::from_secs(secs);
        }
        if self.headed {
            config.browser.headless = false;
        }
        if self.no_export {
            config.export_dir = None;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = ScrapeConfig::from_env();
    cli.overrides.apply(&mut config);

    match cli.command.unwrap_or(Commands::Scrape {
        dry_run: false,
        json: false,
    }) {
        Commands::Scrape { dry_run, json } => {
            config.dry_run = dry_run;
            let summary = imob_sync::run_scrape_once(config).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                println!(
                    "scrape complete: job_id={} status={} links={} new={} persisted={} failed_extractions={} failed_batches={}",
                    summary.job_id,
                    summary.status,
                    summary.links_found,
                    summary.new_links,
                    summary.persisted,
                    summary.extraction_failures,
                    summary.failed_batches
                );
                if let Some(path) = &summary.spreadsheet {
                    println!("spreadsheet: {path}");
                }
            }
        }
        Commands::Migrate => {
            imob_sync::run_migrations(&config).await?;
            println!("migrations applied");
        }
        Commands::Crawl => {
            let links = imob_sync::run_crawl(&config).await?;
            for link in &links {
                println!("{link}");
            }
            tracing::info!(links = links.len(), "crawl complete");
        }
    }

    Ok(())
}
