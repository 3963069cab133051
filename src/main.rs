use std::sync::Arc;

use anyhow::Error;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use lyricq::api::{self, AppState};
use lyricq::config::ConfigContext;
use lyricq::engine::CommandEngine;
use lyricq::queue::QueueHandle;
use lyricq::scheduler;
use lyricq::telemetry;
use lyricq::worker::Processor;

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    tokio::fs::create_dir_all(&config.upload_dir).await?;
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let (queue, recv_events) = QueueHandle::new(config.queue_options());
    let engine = Arc::new(CommandEngine::new(&config.renderer));
    let processor = Processor::new(queue.clone(), engine, config.processor_settings());

    let scheduler_spawn = {
        let cancel_token = cancel_token.clone();
        let queue = queue.clone();
        tokio::spawn(
            async move {
                if let Err(err) = scheduler::serve(cancel_token, queue, recv_events, processor).await {
                    error!("Error running scheduler: {}", err);
                }
            }
            .instrument(info_span!("scheduler")),
        )
    };

    let app = api::create_router(AppState {
        queue,
        upload_dir: config.upload_dir.clone(),
        output_dir: config.output_dir.clone(),
    });
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(listen = %config.listen, "Serving render queue API");

    let shutdown = cancel_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    debug!("HTTP server stopped");
    cancel_token.cancel();
    info!("Waiting for scheduler to shutdown...");
    scheduler_spawn.await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    info!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
