use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use inquire::{Select, Text};
use meteo_core::{
    Config, Database, FetchJob, FetchMode, FetchPipeline, JobQueue, SampleStore, SqliteJobQueue,
    SqliteSampleStore, Worker, WeatherSample,
    http::{self, AppState},
    provider::provider_from_config,
    schedule::Scheduler,
    worker,
};
use std::{path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "meteo", version, about = "Current-weather sampler")]
pub struct Cli {
    /// Use this config file instead of the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server, with workers and the scheduler in-process.
    Serve {
        /// Don't start workers here; run `meteo worker` separately.
        #[arg(long)]
        no_worker: bool,
    },

    /// Run background workers only.
    Worker,

    /// Fetch and store a sample right now.
    Fetch {
        #[command(flatten)]
        location: LocationArgs,
    },

    /// Queue a fetch for the workers.
    Enqueue {
        #[command(flatten)]
        location: LocationArgs,
    },

    /// Show the most recently observed sample.
    Latest,

    /// List stored samples, newest observation first.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Interactively edit the configuration file.
    Configure,
}

#[derive(Debug, clap::Args)]
pub struct LocationArgs {
    /// Free-text label stored with the sample.
    #[arg(long)]
    city: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    lat: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    lon: Option<f64>,
}

impl LocationArgs {
    fn resolve(self, config: &Config) -> FetchJob {
        FetchJob {
            city: self.city.unwrap_or_else(|| config.defaults.city.clone()),
            latitude: self.lat.unwrap_or(config.defaults.latitude),
            longitude: self.lon.unwrap_or(config.defaults.longitude),
        }
    }
}

/// Everything built out of the config file.
struct Services {
    config: Config,
    store: Arc<SqliteSampleStore>,
    queue: SqliteJobQueue,
    pipeline: FetchPipeline,
}

impl Services {
    fn open(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let db_path = config.database_path()?;
        let db = Database::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        let store = Arc::new(SqliteSampleStore::new(db.clone()));
        let queue = SqliteJobQueue::new(db);
        let provider = provider_from_config(&config)?;
        let pipeline = FetchPipeline::new(provider, store.clone());

        Ok(Self { config, store, queue, pipeline })
    }

    fn worker(&self) -> Worker {
        Worker::new(self.queue.clone(), self.pipeline.clone(), self.config.worker.poll_interval())
    }
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!("failed to listen for ctrl-c: {e}"),
        }
        let _ = tx.send(true);
    });
    rx
}

fn print_sample(sample: &WeatherSample) {
    println!("{sample}");
    println!("  coordinates: {}, {}", sample.latitude, sample.longitude);
    println!("  wind:        {} km/h", sample.windspeed_kmh);
    println!("  stored at:   {}", sample.created_at.to_rfc3339());
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;

        match self.command {
            Command::Serve { no_worker } => serve(Services::open(config)?, no_worker).await,
            Command::Worker => {
                let services = Services::open(config)?;
                let shutdown = shutdown_signal();
                worker::run_pool(
                    services.worker(),
                    services.config.worker.concurrency,
                    services.config.worker.stale_after(),
                    shutdown,
                )
                .await?;
                Ok(())
            }
            Command::Fetch { location } => {
                let services = Services::open(config)?;
                let job = location.resolve(&services.config);
                let sample = services.pipeline.run(&job.city, job.latitude, job.longitude).await?;
                print_sample(&sample);
                Ok(())
            }
            Command::Enqueue { location } => {
                let services = Services::open(config)?;
                let job = location.resolve(&services.config);
                let id = services.queue.enqueue_fetch(job).await?;
                println!("Fetch scheduled (job {id})");
                Ok(())
            }
            Command::Latest => {
                let services = Services::open(config)?;
                match services.store.latest().await? {
                    Some(sample) => print_sample(&sample),
                    None => println!("No samples yet"),
                }
                Ok(())
            }
            Command::History { limit } => {
                let services = Services::open(config)?;
                let samples = services.store.recent(limit).await?;
                if samples.is_empty() {
                    println!("No samples yet");
                }
                for sample in samples {
                    println!("{sample}");
                }
                Ok(())
            }
            Command::Configure => configure(config, self.config),
        }
    }
}

async fn serve(services: Services, no_worker: bool) -> Result<()> {
    let config = &services.config;
    let shutdown = shutdown_signal();

    let workers = if no_worker {
        None
    } else {
        Some(tokio::spawn(worker::run_pool(
            services.worker(),
            config.worker.concurrency,
            config.worker.stale_after(),
            shutdown.clone(),
        )))
    };

    let queue: Arc<dyn JobQueue> = Arc::new(services.queue.clone());
    let scheduler = Scheduler::new(queue.clone(), &config.schedules, Utc::now())?;
    let scheduler = if scheduler.is_empty() {
        None
    } else {
        Some(tokio::spawn(scheduler.run(config.scheduler.tick(), shutdown.clone())))
    };

    let state = AppState {
        pipeline: services.pipeline.clone(),
        queue,
        fetch_mode: config.server.fetch_mode,
        defaults: config.defaults.clone(),
    };
    if config.server.fetch_mode == FetchMode::Inline {
        info!("fetch endpoint runs the pipeline inline");
    }

    let addr = config.listen_addr()?;
    let listener =
        TcpListener::bind(addr).await.with_context(|| format!("Failed to bind {addr}"))?;

    let mut server_shutdown = shutdown.clone();
    http::serve(listener, http::create_router(state), async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    })
    .await
    .context("HTTP server failed")?;

    if let Some(handle) = scheduler {
        handle.await.context("Scheduler task failed")?;
    }
    if let Some(handle) = workers {
        handle.await.context("Worker pool task failed")??;
    }
    Ok(())
}

fn configure(mut config: Config, path: Option<PathBuf>) -> Result<()> {
    config.api.base_url = Text::new("Weather API base URL:")
        .with_default(&config.api.base_url)
        .prompt()?;

    config.server.listen = Text::new("HTTP listen address:")
        .with_default(&config.server.listen)
        .prompt()?;

    let current_db = config.database_path()?.display().to_string();
    let db = Text::new("Database file:").with_default(&current_db).prompt()?;
    config.database.path = Some(PathBuf::from(db));

    let modes = vec!["deferred", "inline"];
    let start = if config.server.fetch_mode == FetchMode::Inline { 1 } else { 0 };
    let mode = Select::new("Fetch endpoint mode:", modes).with_starting_cursor(start).prompt()?;
    config.server.fetch_mode = if mode == "inline" { FetchMode::Inline } else { FetchMode::Deferred };

    config.validate()?;
    match &path {
        Some(p) => config.save_to(p)?,
        None => config.save()?,
    }

    let shown = match path {
        Some(p) => p,
        None => Config::config_file_path()?,
    };
    println!("Configuration saved to {}", shown.display());
    Ok(())
}
