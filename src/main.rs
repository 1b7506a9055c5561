use std::{process, sync::Arc};

use axum::Router;
use shelfcache::{
    cache::{CacheWarmer, WarmerConfig},
    config::{self, LoadError},
    context::ServiceContext,
    infra::{error::InfraError, telemetry},
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Warm(_) => run_warm(settings).await,
        config::Command::Stats(args) => run_stats(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let context = Arc::new(ServiceContext::build(&settings).await?);
    context.spawn_background();

    // Application read/write routes are mounted by embedding crates; the
    // standalone binary serves health, ops and the real-time channel.
    let router = context.router(Router::new());

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        target = "shelfcache::serve",
        addr = %settings.server.addr,
        base_url = %settings.server.public_base_url,
        "listening"
    );

    let hub = Arc::clone(&context.hub);
    let result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Long-lived sockets would otherwise hold the drain open.
            hub.close_all("server shutting down");
        })
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    context.shutdown(settings.server.graceful_shutdown).await;
    result
}

async fn run_warm(settings: config::Settings) -> Result<(), AppError> {
    let mut warm_config = WarmerConfig::from_settings(
        &settings.warmer,
        &settings.server.public_base_url,
        true,
    );
    if warm_config.endpoints.is_empty() {
        return Err(AppError::validation(
            "warm requires at least one entry in warmer.endpoints",
        ));
    }
    if !settings.cache.enabled {
        warn!(
            target = "shelfcache::warm",
            "cache is disabled in configuration; the target service may not cache these responses"
        );
    }
    warm_config.enabled = true;

    let warmer = CacheWarmer::new(warm_config).map_err(InfraError::from)?;
    let report = warmer
        .warm_cycle()
        .await
        .ok_or_else(|| AppError::unexpected("warm cycle did not run"))?;

    print_json(&report, true)?;
    if report.failed > 0 || report.skipped > 0 {
        return Err(AppError::unexpected(format!(
            "{} warm request(s) failed, {} target(s) skipped",
            report.failed, report.skipped
        )));
    }
    Ok(())
}

async fn run_stats(settings: config::Settings, args: config::StatsArgs) -> Result<(), AppError> {
    let context = ServiceContext::build(&settings).await?;
    let stats = context.store.stats().await;
    context.shutdown(settings.server.graceful_shutdown).await;
    print_json(&stats, args.pretty)
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<(), AppError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(target = "shelfcache::serve", "shutdown signal received");
}
