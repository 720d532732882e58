use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use harvester::{
    crawler::{CrawlOptions, Crawler},
    elevation::GoogleElevation,
    enrichment::{EnrichmentOptions, EnrichmentPipeline},
    fetcher::{HttpPageFetcher, SEARCH_RESULTS_PER_PAGE},
    geocoding::{DetailPageGeocoder, Geocoder, MapboxGeocoder},
    runner::{Runner, RunnerOptions},
    scheduler::{Scheduler, DEFAULT_SCHEDULE},
    server,
    store::{JsonFileStore, ListingStore, RedisStore},
    utils::read_areas,
};
use log::{debug, error, info};
use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Real estate listing harvester", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
    /// Area to search, may be given more than once
    #[arg(short = 'a', long = "area")]
    areas: Vec<String>,
    /// File with one area per line
    #[arg(long)]
    areas_file: Option<PathBuf>,
    /// Number of search pages fetched at the same time
    #[arg(short = 'c', long, default_value_t = 4)]
    concurrency: usize,
    /// Number of retries per failed or empty page
    #[arg(short = 'r', long, default_value_t = 3)]
    retries: u32,
    /// Listings per search page
    #[arg(long, default_value_t = SEARCH_RESULTS_PER_PAGE)]
    page_size: usize,
    /// Directory for diagnostics and replay dumps
    #[arg(short = 'o', long, default_value = "output")]
    output_dir: PathBuf,
    /// Where the GeoJSON feature collection is written
    #[arg(long, default_value = "public/listings_feature_collection.json")]
    feature_collection: PathBuf,
    /// JSON file used as the listing store when no redis url is set
    #[arg(long, default_value = "output/listings.json")]
    db_file: PathBuf,
    /// Redis connection url; the listing store lives in redis when set
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,
    /// Where listing coordinates come from
    #[arg(long, value_enum, default_value_t = GeocoderKind::Mapbox)]
    geocoder: GeocoderKind,
    #[arg(long, env = "MAPBOX_ACCESS_TOKEN", hide_env_values = true)]
    mapbox_access_token: Option<String>,
    #[arg(long, env = "GMAPS_ELEVATION_APIKEY", hide_env_values = true)]
    elevation_api_key: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum GeocoderKind {
    /// Mapbox batch geocoding, needs MAPBOX_ACCESS_TOKEN
    Mapbox,
    /// Coordinates scraped from each listing's detail page
    DetailPage,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run one harvest cycle and exit
    Run,
    /// Geocode stored listings that have no valid coordinates
    Backfill,
    /// Serve the public directory, run on request and on a schedule
    Serve {
        #[arg(short = 'p', long, default_value_t = 3000)]
        port: u16,
        /// Cron expression with seconds
        #[arg(short = 's', long, default_value = DEFAULT_SCHEDULE)]
        schedule: String,
        #[arg(long, default_value = "public")]
        public_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    if let Ok(env) = std::env::var("RUST_LOG") {
        if env == "debug" {
            println!("{number:/>width$}", number = "", width = 20);
            println!("Debug mode enabled");
            println!("{number:/>width$}", number = "", width = 20);
            println!();
        }
    }

    let mut areas = args.areas.clone();
    if let Some(path) = &args.areas_file {
        areas.extend(read_areas(path)?);
    }
    if areas.is_empty() && !matches!(args.command, Command::Backfill) {
        return Err(anyhow!(
            "no areas to search, pass --area or --areas-file"
        ));
    }

    debug!("Starting harvester with {:#?}", args.command);

    let runner = Arc::new(build_runner(&args, areas)?);

    match args.command {
        Command::Run => {
            runner.run_exclusive().await?;
        }
        Command::Backfill => {
            runner.backfill().await?;
        }
        Command::Serve {
            port,
            schedule,
            public_dir,
        } => {
            let should_terminate = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
            signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

            let scheduler = Scheduler::new(&schedule, runner.clone())?;
            let st = should_terminate.clone();
            let scheduled = tokio::spawn(async move { scheduler.run(st).await });

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let served = server::serve(addr, runner.clone(), &public_dir, should_terminate).await;

            if runner.guard().is_running() {
                info!("waiting for the active run to finish before exiting");
            }
            runner.guard().wait_idle(Duration::from_millis(500)).await;
            if let Err(e) = scheduled.await {
                error!("scheduler task failed: {}", e);
            }
            served?;
        }
    }

    Ok(())
}

fn build_runner(args: &Args, areas: Vec<String>) -> anyhow::Result<Runner> {
    let fetcher = HttpPageFetcher::new(args.page_size).context("could not build http client")?;
    let crawl_options = CrawlOptions::default_builder()
        .concurrency(args.concurrency)
        .url_retries(args.retries)
        .diagnostics_dir(Some(args.output_dir.join("empty-pages")))
        .build()?;
    let crawler = Crawler::new(Arc::new(fetcher), crawl_options);

    let geocoder: Arc<dyn Geocoder> = match (args.geocoder, &args.mapbox_access_token) {
        (GeocoderKind::Mapbox, Some(token)) => Arc::new(MapboxGeocoder::new(token)),
        (GeocoderKind::Mapbox, None) => {
            return Err(anyhow!(
                "MAPBOX_ACCESS_TOKEN is not set, pass it or use --geocoder detail-page"
            ))
        }
        (GeocoderKind::DetailPage, _) => Arc::new(
            DetailPageGeocoder::new(args.concurrency)
                .context("could not build detail page client")?,
        ),
    };
    let enrichment = EnrichmentPipeline::new(
        geocoder,
        Arc::new(GoogleElevation::new(&args.elevation_api_key)),
        EnrichmentOptions::default_builder().build()?,
    );

    let store: Arc<dyn ListingStore> = match &args.redis_url {
        Some(url) => Arc::new(RedisStore::new(url)?),
        None => Arc::new(JsonFileStore::new(args.db_file.clone())),
    };

    let options = RunnerOptions::default_builder()
        .areas(areas)
        .output_dir(args.output_dir.clone())
        .feature_collection_path(Some(args.feature_collection.clone()))
        .build()?;

    Ok(Runner::new(crawler, enrichment, store, options))
}
