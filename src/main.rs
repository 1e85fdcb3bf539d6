use anyhow::Result;
use clap::Parser;
use reaction_sync::{api, app, config, db, jobs};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/reactions.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let shutdown = CancellationToken::new();
    let app = app::build(&cfg, pool, shutdown.clone()).await?;

    if cfg.app.import_interval_seconds > 0 && !app.scheduled.is_empty() {
        info!(
            every_secs = cfg.app.import_interval_seconds,
            services = app.scheduled.len(),
            "starting import scheduler"
        );
        jobs::spawn_scheduler(
            app.state.jobs.clone(),
            app.scheduled.clone(),
            Duration::from_secs(cfg.app.import_interval_seconds),
            cfg.app.import_limit,
            shutdown.clone(),
        );
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            return;
        }
        info!("shutting down");
        signal_token.cancel();
    });

    api::serve(cfg.listen_addr()?, api::router(app.state), shutdown).await
}
