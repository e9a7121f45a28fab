#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mucbot::bot::{Bot, RunOutcome};
use mucbot::config::{Config, LoggingConfig};
use mucbot::transport::{mock::MockTransport, Transport};

fn init_logging(cfg: &LoggingConfig) {
    let level = if cfg.enabled { cfg.level.as_str() } else { "off" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The network adapter is behind the `Transport` trait; the in-process
/// transport here runs the bot offline until a wire implementation is
/// plugged in.
fn build_transport(config: &Config) -> Arc<dyn Transport> {
    Arc::new(MockTransport::new(&config.identity))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = PathBuf::from(
        std::env::var("MUCBOT_CONFIG").unwrap_or_else(|_| "mucbot.toml".to_string()),
    );
    let boot_config = Config::load(&config_path)?;
    init_logging(&boot_config.logging);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "mucbot starting"
    );

    let interrupt = CancellationToken::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                interrupt.cancel();
            }
        });
    }

    // Restart rebuilds everything from a fresh config read; connection loss
    // retries with a fixed delay.
    loop {
        let config = Config::load(&config_path)?;
        let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs);
        let transport = build_transport(&config);
        let bot = Bot::new(config, transport, interrupt.child_token())?;

        match bot.run().await? {
            RunOutcome::Shutdown => break,
            RunOutcome::Restart => {
                info!("restarting");
            }
            RunOutcome::ConnectionLost(reason) => {
                if interrupt.is_cancelled() {
                    break;
                }
                warn!(reason = %reason, delay_secs = reconnect_delay.as_secs(), "connection lost, reconnecting");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }

    info!("mucbot stopped");
    Ok(())
}
