use std::env;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;

use xca_monitor::api::{self, ApiState};
use xca_monitor::cli::Cli;
use xca_monitor::config::Config;
use xca_monitor::db;
use xca_monitor::error::AppError;
use xca_monitor::logging::init_logging;
use xca_monitor::metrics::AppMetrics;
use xca_monitor::monitor::{MonitorSettings, NotificationSink, PostSource, SettingsHandle};
use xca_monitor::repository::MatchRepository;
use xca_monitor::scheduler::Monitor;
use xca_monitor::services::telegram::TelegramClient;
use xca_monitor::services::twitter::TwitterClient;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging(&env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = Config::from_env()?;
    cli.apply(&mut config);
    tracing::info!("Service starting with config: {:?}", config);

    let pool = db::create_pool_with_retry(&config.database.url, 3, Duration::from_secs(2)).await?;
    let repository = Arc::new(MatchRepository::new(pool));
    let metrics = Arc::new(AppMetrics::new()?);

    let monitor = Monitor::builder(
        SettingsHandle::new(MonitorSettings::from_config(&config)),
        repository,
    )
    .source(build_source(&config))
    .sink(build_sink(&config).await)
    .metrics(metrics.clone())
    .max_stored_matches(config.database.max_stored_matches)
    .build();

    if cli.once {
        let report = monitor.check_now().await?;
        println!(
            "Checked {} accounts, scanned {} posts, found {} matches{}",
            report.accounts_polled,
            report.posts_scanned,
            report.matches.len(),
            if report.rate_limited { " (rate limited)" } else { "" }
        );
        for m in &report.matches {
            println!("@{} {} {:?}", m.account, m.permalink, m.extracted_values);
        }
        return Ok(());
    }

    if cli.auto_start {
        if let Err(err) = monitor.start().await {
            tracing::warn!("Auto-start failed: {}", err);
        }
    }

    let port = config.api.port;
    let app = api::create_router(ApiState {
        monitor: monitor.clone(),
        metrics,
        config: Arc::new(config),
    });

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("API listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(monitor))
        .await?;

    tracing::info!("Service stopped cleanly");
    Ok(())
}

fn build_source(config: &Config) -> Option<Arc<dyn PostSource>> {
    let Some(token) = config.twitter.bearer_token.clone() else {
        tracing::warn!("TWITTER_BEARER_TOKEN not set; post source unavailable");
        return None;
    };

    match TwitterClient::new(
        config.twitter.api_url.clone(),
        token,
        Duration::from_secs(config.twitter.timeout_seconds),
    ) {
        Ok(client) => Some(Arc::new(client) as Arc<dyn PostSource>),
        Err(err) => {
            tracing::error!("Could not create Twitter client: {}", err);
            None
        }
    }
}

async fn build_sink(config: &Config) -> Option<Arc<dyn NotificationSink>> {
    let Some(token) = config.telegram.bot_token.clone() else {
        tracing::warn!("TELEGRAM_BOT_TOKEN not set; notifications unavailable");
        return None;
    };

    let client = match TelegramClient::new(
        config.telegram.api_url.clone(),
        token,
        Duration::from_secs(config.telegram.timeout_seconds),
    ) {
        Ok(client) => client,
        Err(err) => {
            tracing::error!("Could not create Telegram client: {}", err);
            return None;
        }
    };

    match client.get_me().await {
        Ok(bot) => {
            tracing::info!(
                "Telegram bot verified: {} (@{})",
                bot.first_name,
                bot.username.as_deref().unwrap_or("-")
            );
            Some(Arc::new(client) as Arc<dyn NotificationSink>)
        }
        Err(err) => {
            tracing::error!("Telegram token check failed; notifications unavailable: {}", err);
            None
        }
    }
}

async fn shutdown_signal(monitor: Monitor) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        return;
    }

    tracing::info!("Shutdown signal received. Stopping monitor.");
    if let Err(err) = monitor.stop().await {
        tracing::error!("Error while stopping monitor: {}", err);
    }
}
