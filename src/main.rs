mod config;
mod cookies;
mod deliver;
mod download;
mod error;
mod estimator;
mod formats;
mod handlers;
mod lock;
mod publish;
mod session;
mod subscription;
mod users;
mod ytdlp;

use crate::{
    config::{Config, PublishStrategy},
    cookies::CookieRefresher,
    error::AppError,
    lock::RedisLockStore,
    publish::{HttpPublisher, Publisher, SftpPublisher},
    session::SessionStore,
    subscription::SubscriptionGate,
    users::UserDirectory,
    ytdlp::YtDlpClient,
};
use handlers::{build_handler, AppServices};
use std::{sync::Arc, time::Duration};
use teloxide::{net::default_reqwest_settings, prelude::*};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, instrument, warn, Instrument};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    if let Err(err) = run().await {
        eprintln!("fatal error: {err}");
        error!(error = %err, "Application terminated with fatal error");
        return Err(err);
    }
    info!("Application shutdown complete");
    Ok(())
}

#[instrument]
async fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Initializing ytgrab bot");
    dotenv::dotenv().ok();

    let config = Arc::new(Config::from_env()?);

    let client = default_reqwest_settings()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| {
            error!(error = %e, "Failed to build HTTP client");
            e
        })?;
    info!("HTTP client configured successfully");

    let bot = Bot::from_env_with_client(client);
    info!("Telegram bot initialized");

    let users = UserDirectory::connect(&config.db_dsn).await?;
    info!("User directory ready");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    let locks = Arc::new(RedisLockStore::new(redis_conn));
    info!("Lock store connected");

    let publisher: Arc<dyn Publisher> = match config.publish_strategy {
        PublishStrategy::Sftp => {
            let storage = config
                .storage
                .clone()
                .ok_or_else(|| AppError::Config("sftp publishing requires storage settings".into()))?;
            Arc::new(SftpPublisher::new(storage))
        }
        PublishStrategy::Http => {
            Arc::new(HttpPublisher::new(config.http_port, config.work_dir.join("serve")))
        }
    };
    info!(strategy = ?config.publish_strategy, "Publisher configured");

    let cookies = Arc::new(CookieRefresher::new(config.cookie_refresh_command.clone()));
    let _cookie_task = cookies.spawn_periodic();

    let ytdlp = Arc::new(YtDlpClient::new(config.cookie_file.clone()));
    let services = AppServices {
        config: config.clone(),
        sessions: SessionStore::new(),
        users,
        locks,
        media: ytdlp.clone(),
        downloader: ytdlp,
        publisher,
        gate: Arc::new(SubscriptionGate::new(config.required_channels.clone())),
        cookies,
    };
    info!("Application services initialized");

    let mut dispatcher = Dispatcher::builder(bot, build_handler())
        .dependencies(dptree::deps![services])
        .build();
    info!("Dispatcher built successfully");

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(
        async move {
            info!("Shutdown signal handler spawned");
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown");
            if let Ok(wait) = shutdown_token.shutdown() {
                wait.await;
                info!("Graceful shutdown completed");
            } else {
                warn!("Failed to initiate graceful shutdown");
            }
        }
        .in_current_span(),
    );

    info!("Starting dispatcher event loop");
    dispatcher.dispatch().await;
    info!("Dispatcher stopped");
    Ok(())
}

#[cfg(unix)]
#[instrument]
async fn shutdown_signal() {
    info!("Setting up signal handlers for graceful shutdown");
    let term = signal(SignalKind::terminate());
    let interrupt = signal(SignalKind::interrupt());
    match (term, interrupt) {
        (Ok(mut term), Ok(mut interrupt)) => {
            info!("SIGTERM and SIGINT handlers registered successfully");
            tokio::select! {
                _ = term.recv() => {
                    info!("Received SIGTERM signal");
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT signal");
                }
            }
        }
        (Ok(mut term), Err(err)) => {
            warn!(error = %err, "Failed to register SIGINT handler, falling back to SIGTERM only");
            let _ = term.recv().await;
            info!("Received SIGTERM signal");
        }
        (Err(err), Ok(mut interrupt)) => {
            warn!(error = %err, "Failed to register SIGTERM handler, falling back to SIGINT only");
            let _ = interrupt.recv().await;
            info!("Received SIGINT signal");
        }
        (Err(term_err), Err(int_err)) => {
            error!(sigterm_error = %term_err, sigint_error = %int_err, "Failed to register both SIGTERM and SIGINT handlers");
            warn!("Falling back to Ctrl+C handler");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
    }
}

#[cfg(not(unix))]
#[instrument]
async fn shutdown_signal() {
    info!("Waiting for Ctrl+C signal");
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C signal");
}
