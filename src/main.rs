mod config;
mod error;
mod filter;
mod footer;
mod forward;
mod mastodon;
mod platform;
mod relay;
mod transform;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::filter::StatusFilter;
use crate::forward::ChannelForwarder;
use crate::mastodon::client::MastodonClient;
use crate::mastodon::source::MastodonSource;
use crate::platform::telegram::TelegramPublisher;
use crate::relay::retry::RetryPolicy;
use crate::relay::store::SqliteRelayStore;
use crate::relay::Bridge;
use crate::transform::Transformer;

/// Relay posts between a Mastodon account and a Telegram channel.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(default_value = "config.toml")]
    config: PathBuf,

    /// Log debug output
    #[arg(short, long, conflicts_with = "silent")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    silent: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn log_filter(&self) -> &'static str {
        if self.verbose {
            "info,mastodon_telegram_bridge=debug"
        } else if self.silent {
            "warn"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Loading configuration from: {}", cli.config.display());
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let m2t = &config.mastodon_to_telegram;
    let t2m = &config.telegram_to_mastodon;
    info!("Configuration loaded successfully");
    info!("  Mastodon: {}", config.mastodon.base_url());
    info!("  Database: {}", config.storage.database_path.display());
    if m2t.disable {
        info!("  Mastodon -> Telegram: disabled");
    } else {
        info!(
            "  Mastodon -> Telegram: channel {}, every {}s, scope {:?}",
            m2t.channel_chat_id, m2t.poll_interval_secs, m2t.filter.scope
        );
    }
    if t2m.disable {
        info!("  Telegram -> Mastodon: disabled");
    } else {
        info!(
            "  Telegram -> Mastodon: channel {}, visibility {}",
            t2m.channel_chat_id, t2m.visibility
        );
    }

    if cli.dry_run {
        info!("Dry run: configuration is valid");
        return Ok(());
    }

    let client = Arc::new(MastodonClient::new(&config.mastodon)?);
    let account = client
        .verify_credentials()
        .await
        .context("Failed to verify Mastodon credentials")?;
    info!("Logged in to Mastodon as @{} ({})", account.acct, account.id);

    let app_name = match client.verify_app().await {
        Ok(app) => Some(app.name),
        Err(e) if e.is_auth() => {
            return Err(e).context("Failed to verify Mastodon application");
        }
        Err(e) => {
            warn!("Could not look up Mastodon application: {}", e);
            None
        }
    };

    let store = SqliteRelayStore::open(&config.storage.database_path)?;
    let bot = Bot::new(&config.telegram.bot_token);
    let shutdown = CancellationToken::new();

    let bridge_task = if m2t.disable {
        None
    } else {
        let source = MastodonSource::new(client.clone(), account.clone(), m2t.max_pages);
        info!("Watching statuses of @{}", source.account().acct);
        let publisher = TelegramPublisher::new(
            bot.clone(),
            m2t.channel_chat_id,
            m2t.pm_chat_id,
            RetryPolicy::new(&config.retry),
        );
        let filter = StatusFilter::new(&m2t.filter, account.id.clone(), app_name, m2t.relay_self_replies);
        let bridge = Bridge::new(
            Arc::new(source),
            Arc::new(publisher),
            store,
            account.id.clone(),
            filter,
            Transformer::new(m2t),
            &config.retry,
        );
        Some(tokio::spawn(bridge.run(m2t.poll_interval(), shutdown.clone())))
    };

    let telegram_task = if t2m.disable {
        None
    } else {
        let forwarder = ChannelForwarder::new(t2m, client.clone(), RetryPolicy::new(&config.retry))?;
        Some(tokio::spawn(platform::telegram::run(
            bot.clone(),
            Arc::new(forwarder),
            shutdown.clone(),
        )))
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down...");
                shutdown.cancel();
            }
        });
    }

    let result = match bridge_task {
        Some(handle) => handle.await.context("Bridge loop panicked")?,
        None => {
            shutdown.cancelled().await;
            Ok(())
        }
    };

    shutdown.cancel();
    if let Some(handle) = telegram_task {
        if let Err(e) = handle.await {
            warn!("Telegram dispatcher task failed: {}", e);
        }
    }

    result
}
