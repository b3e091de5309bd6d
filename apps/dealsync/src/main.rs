mod cache;
mod config;
mod db;
mod errors;
mod migration;
mod models;
mod progress;
mod routes;
mod state;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use clap::{Args, Parser, Subcommand};
use tokio::sync::{watch, Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, S3Config};
use crate::db::create_pool;
use crate::migration::controller::{RunOptions, MAX_BATCH_SIZE};
use crate::migration::run_deal_backfill;
use crate::routes::build_router;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "dealsync", version, about = "Zoho deals legacy backfill")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Migrate legacy deal rows into the current deals table
    Run(RunArgs),
    /// Serve the health, trigger and status endpoints
    Serve,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Read, transform and classify without writing anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Rows per batch (defaults to BACKFILL_BATCH_SIZE, then 500)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_BATCH_SIZE as u64))]
    batch_size: Option<u64>,
    /// Rename the legacy table once the run completes
    #[arg(long, default_value_t = false)]
    archive_legacy: bool,
    /// Continue from the persisted checkpoint
    #[arg(long, default_value_t = false, conflicts_with = "start_after")]
    resume: bool,
    /// Overwrite migrated rows whose legacy data changed
    #[arg(long, default_value_t = false)]
    force: bool,
    /// Skip legacy rows up to and including this primary key
    #[arg(long)]
    start_after: Option<i64>,
    /// Print the report as JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl RunArgs {
    fn options(&self, config: &Config) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            batch_size: self
                .batch_size
                .map(|n| n as usize)
                .unwrap_or(config.batch_size),
            archive_legacy: self.archive_legacy,
            resume: self.resume,
            force: self.force,
            start_after: self.start_after,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting dealsync v{}", env!("CARGO_PKG_VERSION"));

    let state = build_state(config).await?;

    match cli.command {
        Commands::Run(args) => {
            let options = args.options(&state.config);
            let report = run_deal_backfill(&state, &options).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
            Ok(ExitCode::from(report.exit_code()))
        }
        Commands::Serve => {
            serve(state).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build_state(config: Config) -> Result<AppState> {
    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;

    // Initialize Redis
    let redis = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            info!("Redis client initialized");
            Some(client)
        }
        None => {
            warn!("REDIS_URL not set; progress tracking and cache invalidation disabled");
            None
        }
    };

    // Initialize S3 / MinIO
    let s3 = match &config.s3 {
        Some(s3_config) => {
            let client = build_s3_client(s3_config).await;
            info!("S3 client initialized (bucket: {})", s3_config.bucket);
            Some(client)
        }
        None => {
            info!("S3 not configured; reports are only logged");
            None
        }
    };

    Ok(AppState {
        db,
        redis,
        s3,
        config,
        shutdown: shutdown_signal(),
        backfill_lock: Arc::new(Mutex::new(())),
    })
}

/// Flips the returned receiver to `true` on the first Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested; stopping after the current batch");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn serve(state: AppState) -> Result<()> {
    let mut shutdown = state.shutdown.clone();
    let addr: SocketAddr = format!("0.0.0.0:{}", state.config.port).parse()?;

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &S3Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.access_key_id,
        &config.secret_access_key,
        None,
        None,
        "dealsync-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            database_url: "postgres://localhost/deals".into(),
            redis_url: None,
            s3: None,
            port: 8080,
            rust_log: "info".into(),
            legacy_table: "zoho_deals_legacy".into(),
            batch_size: 250,
            fetch_timeout: Duration::from_secs(30),
            fetch_attempts: 3,
            owner_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            write_retry_backoff: Duration::from_millis(500),
            checkpoint_timeout: Duration::from_secs(10),
            failure_window: 200,
            failure_min_samples: 50,
            max_failure_rate: 0.5,
        }
    }

    #[test]
    fn test_run_flags_map_to_options() {
        let cli = Cli::try_parse_from([
            "dealsync",
            "run",
            "--dry-run",
            "--batch-size",
            "2",
            "--archive-legacy",
            "--force",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let options = args.options(&config());
        assert!(options.dry_run);
        assert!(options.archive_legacy);
        assert!(options.force);
        assert!(!options.resume);
        assert_eq!(options.batch_size, 2);
    }

    #[test]
    fn test_batch_size_defaults_to_config() {
        let cli = Cli::try_parse_from(["dealsync", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.options(&config()).batch_size, 250);
    }

    #[test]
    fn test_batch_size_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["dealsync", "run", "--batch-size", "0"]).is_err());
        assert!(Cli::try_parse_from(["dealsync", "run", "--batch-size", "10001"]).is_err());
    }

    #[test]
    fn test_resume_conflicts_with_start_after() {
        assert!(
            Cli::try_parse_from(["dealsync", "run", "--resume", "--start-after", "10"]).is_err()
        );
    }
}
