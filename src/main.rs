use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use alpha_watch::browser::HttpBrowserSession;
use alpha_watch::config::{Config, TICK_INTERVAL_SECS};
use alpha_watch::notifier::{Notifier, NotifierConfig};
use alpha_watch::orchestrator::Orchestrator;
use alpha_watch::repository::Repository;
use alpha_watch::store::Store;
use alpha_watch::{lock, timeutil};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Scrapes crypto airdrop/listing event feeds and dispatches reminder notifications"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to a lock file preventing two worker instances from racing.
    /// Overrides LOCK_FILE.
    #[arg(long, global = true)]
    lock_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs a single fetch -> persist -> dispatch tick, then exits.
    Run,
    /// Runs ticks forever, sleeping between them, until SIGINT/SIGTERM.
    Watch,
    /// Applies the schema file against the configured database and exits.
    Schema {
        /// Path to the SQL schema file. Defaults to SCHEMA_PATH / ./schema.sql.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Prints the resolved configuration as JSON, with secrets redacted.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(lock_file) = args.lock_file.clone() {
        config.lock_file = Some(lock_file);
    }

    let _lock_guard = match &config.lock_file {
        Some(path) => Some(lock::acquire(path).context("acquiring single-instance lock")?),
        None => None,
    };

    match args.command {
        Command::Config => {
            print_config(&config);
            Ok(())
        }
        Command::Schema { path } => {
            let schema_path = path.unwrap_or_else(|| config.schema_path.clone());
            let store = Store::new(&config);
            store
                .ensure_schema(&schema_path)
                .await
                .context("applying schema")?;
            tracing::info!(path = %schema_path.display(), "schema applied");
            Ok(())
        }
        Command::Run => {
            config.validate().context("validating configuration")?;
            let orchestrator = build_orchestrator(&config).await?;
            run_once(&orchestrator).await
        }
        Command::Watch => {
            config.validate().context("validating configuration")?;
            let orchestrator = build_orchestrator(&config).await?;
            watch(&orchestrator).await
        }
    }
}

async fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let tz = timeutil::get_timezone(&config.timezone).context("resolving timezone")?;
    let store = Store::new(config);
    let repository = Repository::new(&store).await.context("connecting to database")?;

    let notifier_config = NotifierConfig::from(config);
    let notifier = Notifier::new(notifier_config).context("building notifier client")?;

    let session = HttpBrowserSession::new(config.alpha_url.clone(), config.playwright_proxy.as_deref())
        .context("building browser session")?;

    Ok(Orchestrator::new(
        config.clone(),
        tz,
        repository,
        notifier,
        Box::new(session),
    ))
}

async fn run_once(orchestrator: &Orchestrator) -> Result<()> {
    orchestrator.tick().await.context("running tick")?;
    tracing::info!("tick complete");
    Ok(())
}

async fn watch(orchestrator: &Orchestrator) -> Result<()> {
    loop {
        if let Err(err) = orchestrator.tick().await {
            tracing::error!(error = %err, "tick failed, continuing to next cycle");
        }

        let sleep = tokio::time::sleep(std::time::Duration::from_secs(TICK_INTERVAL_SECS));
        tokio::select! {
            _ = sleep => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, exiting after current tick");
                return Ok(());
            }
        }
    }
}

fn print_config(config: &Config) {
    let redacted = serde_json::json!({
        "alpha_url": config.alpha_url,
        "language": config.language,
        "timezone": config.timezone,
        "reminder_offsets": config.reminder_offsets,
        "quiet_hours": config.quiet_hours.map(|(s, e)| format!("{s}-{e}")),
        "spug_quiet_channel": config.spug_quiet_channel,
        "db_host": config.db_host,
        "db_port": config.db_port,
        "db_user": config.db_user,
        "db_password": config.db_password.as_ref().map(|_| "***"),
        "db_name": config.db_name,
        "db_pool_minsize": config.db_pool_minsize,
        "db_pool_maxsize": config.db_pool_maxsize,
        "spug_base_url": config.spug_base_url,
        "spug_token": config.spug_token.as_ref().map(|_| "***"),
        "spug_timeout_seconds": config.spug_timeout_seconds,
        "spug_channel": config.spug_channel,
        "spug_xsend_user_id": config.spug_xsend_user_id.as_ref().map(|_| "***"),
        "spug_proxy": config.spug_proxy,
        "playwright_proxy": config.playwright_proxy,
        "log_level": config.log_level,
        "lock_file": config.lock_file,
        "schema_path": config.schema_path,
    });
    println!("{}", serde_json::to_string_pretty(&redacted).unwrap());
}
