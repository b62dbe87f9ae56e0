use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crawldash_lib::{CoreConfig, CoreEvent, SessionCore};

/// Follow crawl task updates over the dashboard's push channel
#[derive(Debug, Parser)]
#[command(name = "crawldash", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "CRAWLDASH_CONFIG")]
    config: Option<PathBuf>,

    /// Log in with these credentials instead of restoring the saved session
    #[arg(long, num_args = 2, value_names = ["USERNAME", "PASSWORD"])]
    login: Option<Vec<String>>,

    /// Task to follow; may be repeated
    #[arg(short, long = "task")]
    tasks: Vec<u64>,

    /// Follow every task
    #[arg(long)]
    all: bool,

    /// End the session and clear the saved credential on exit
    #[arg(long)]
    logout_on_exit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "crawldash_lib=debug,crawldash=debug,warn".into()
            } else {
                "crawldash_lib=info,crawldash=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let cli = Cli::parse();
    let config = CoreConfig::load(cli.config.as_deref()).await?;
    let core = SessionCore::new(config)?;
    let mut subscriber = core.subscribe();

    // Topics are remembered and replayed once the channel comes up
    for task_id in &cli.tasks {
        core.subscribe_task(*task_id).await;
    }
    if cli.all {
        core.subscribe_all_tasks().await;
    }

    let identity = match cli.login.as_deref() {
        Some([username, password]) => core.login(username, password).await?,
        Some(_) => return Err(anyhow!("--login takes a username and a password")),
        None => {
            let identity = core.restore().await?;
            if !core.auth().is_authenticated().await {
                return Err(anyhow!("No saved session; run with --login USERNAME PASSWORD"));
            }
            identity
        }
    };
    match identity {
        Some(identity) => info!(user = %identity.display_name(), "Signed in"),
        None => info!("Signed in"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = subscriber.recv_typed() => {
                let Some(event) = event else { break };
                match &event {
                    CoreEvent::ConnectionStateChanged(snapshot) => {
                        info!(state = %snapshot.state, attempt = snapshot.attempt_count, "Connection state changed");
                    }
                    CoreEvent::ChannelError { error, fatal: true } => {
                        error!(%error, "Push channel gave up");
                    }
                    CoreEvent::ChannelError { error, .. } => warn!(%error, "Push channel error"),
                    CoreEvent::SessionEnded { reason } => {
                        warn!(%reason, "Session ended");
                        break;
                    }
                    other => info!(event = ?other.kind(), payload = ?other, "Event"),
                }
            }
        }
    }

    if cli.logout_on_exit {
        core.logout().await;
    }
    core.shutdown().await;
    Ok(())
}
