use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use placescout::crawler::{CrawlDeps, Crawler, PhaseSelection};
use placescout::metrics::CrawlMetrics;
use placescout::provider::GooglePlaces;
use placescout::status::{clear_checkpoints, crawl_status};
use placescout::store::CheckpointStore;
use placescout_common::{CrawlConfig, CrawlIdentity};

#[derive(Parser)]
#[command(name = "placescout", about = "Exhaustive Google Places crawl of one area", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl an area, resuming from checkpoints when present.
    Run(RunArgs),
    /// Show saved checkpoints for an area.
    Status(AreaArgs),
    /// Delete saved checkpoints for an area.
    Clear(AreaArgs),
}

#[derive(Args)]
struct AreaArgs {
    /// Area name, e.g. "New York". Defaults to PLACESCOUT_CITY.
    city: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    area: AreaArgs,
    /// Place type to search for. Defaults to LOCATION_TYPE.
    #[arg(long = "type")]
    place_type: Option<String>,
    #[arg(long, value_enum, default_value_t = PhaseSelection::All)]
    phase: PhaseSelection,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    max_deep_dives: Option<u64>,
}

impl AreaArgs {
    fn apply(&self, config: &mut CrawlConfig) {
        if let Some(city) = &self.city {
            config.city = city.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let mut config = CrawlConfig::from_env()?;

    match cli.command {
        Command::Run(args) => {
            args.area.apply(&mut config);
            if let Some(place_type) = args.place_type {
                config.place_type = place_type;
            }
            if let Some(workers) = args.workers {
                config.max_workers = workers;
            }
            if let Some(max) = args.max_deep_dives {
                config.max_deep_dives = max;
            }
            run(config, args.phase).await
        }
        Command::Status(area) => {
            area.apply(&mut config);
            let identity = CrawlIdentity::new(&config.city)?;
            let store = CheckpointStore::new(config.checkpoint_dir());
            println!("{}", crawl_status(&store, &identity).await?);
            Ok(())
        }
        Command::Clear(area) => {
            area.apply(&mut config);
            let identity = CrawlIdentity::new(&config.city)?;
            let store = CheckpointStore::new(config.checkpoint_dir());
            let removed = clear_checkpoints(&store, &identity).await?;
            info!(identity = identity.slug(), removed, "Cleared checkpoints");
            Ok(())
        }
    }
}

async fn run(config: CrawlConfig, phase: PhaseSelection) -> Result<()> {
    config.log_redacted();

    let metrics = Arc::new(CrawlMetrics::new());
    let google = Arc::new(GooglePlaces::from_config(&config, metrics.clone())?);
    let deps = CrawlDeps::builder()
        .places(google.clone())
        .geocoder(google)
        .metrics(metrics)
        .build();
    let mut crawler = Crawler::new(config, deps)?;

    let cancel = crawler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next tile and checkpointing");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let report = crawler.run(phase).await?;
    println!("{report}");
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("placescout=info".parse()?)
        .add_directive("places_client=info".parse()?);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}
