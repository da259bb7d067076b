use std::{process, sync::Arc};

use fortunecat::{
    application::{
        composer::{ComposerConfig, FortuneComposer},
        error::AppError,
        refresh::{RefreshConfig, RefreshOrchestrator},
    },
    cache::ContentCache,
    config,
    domain::screen::ContentSnapshot,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        openai::OpenAiGenerator,
        pinecone::PineconeIndex,
        store, telemetry,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

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

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Snapshot(_) => run_snapshot(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = store::build_store(&settings.store)?;
    let index = Arc::new(PineconeIndex::new(&settings.index)?);
    let generator = Arc::new(OpenAiGenerator::new(&settings.openai)?);

    let composer = Arc::new(FortuneComposer::new(
        ComposerConfig::from(&settings),
        generator,
        index,
        Arc::clone(&store),
    ));
    let cache = Arc::new(ContentCache::new());
    let orchestrator = RefreshOrchestrator::new(
        RefreshConfig::from(&settings),
        Arc::clone(&cache),
        composer,
        store,
    );

    let shutdown = CancellationToken::new();
    let refresh_handle = orchestrator.spawn(shutdown.clone());

    let router = http::build_router(
        HttpState { cache },
        http::cors_layer(&settings.server.cors_origins),
    );
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "fortunecat::serve",
        addr = %settings.server.addr,
        "Listening"
    );

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;

    // The server may also stop on its own error; the loop must stop either way.
    shutdown.cancel();
    let grace = settings.server.graceful_shutdown;
    match tokio::time::timeout(grace, refresh_handle).await {
        Ok(Ok(())) => info!(target = "fortunecat::serve", "Refresh loop stopped"),
        Ok(Err(err)) => warn!(
            target = "fortunecat::serve",
            error = %err,
            "Refresh loop ended abnormally"
        ),
        Err(_) => warn!(
            target = "fortunecat::serve",
            grace_seconds = grace.as_secs(),
            "Refresh loop still busy after the grace period; exiting anyway"
        ),
    }

    served.map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn run_snapshot(settings: config::Settings) -> Result<(), AppError> {
    let store = store::build_store(&settings.store)?;
    let key = settings.store.snapshot_key.as_str();

    let blob = store
        .get(key)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no snapshot stored under `{key}`")))?;
    let snapshot: ContentSnapshot = serde_json::from_slice(&blob)
        .map_err(|err| AppError::unexpected(format!("snapshot `{key}` is not valid: {err}")))?;
    let rendered = serde_json::to_string_pretty(&snapshot)
        .map_err(|err| AppError::unexpected(err.to_string()))?;

    println!("{rendered}");
    Ok(())
}

/// Resolves on SIGINT, SIGTERM, or once `shutdown` is cancelled elsewhere.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => {}
    }

    info!(target = "fortunecat::serve", "Shutdown requested");
    shutdown.cancel();
}
