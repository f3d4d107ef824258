mod app;
mod config;
mod core;

use std::sync::Arc;

use anyhow::{Context, Result};
use app::AppState;
use config::{Config, HandlerConfig};
use core::{
    ExhaustedTask, ForwardHandler, HandlerRegistry, ImapTransport, MimeParser,
    Orchestrator, Pipeline, RetryQueue, RouteTable, SpoolDir, SpoolHandler,
    bind_health_listener, run_dead_letter_writer, run_health_server,
};
use mailtask_helpers::logging::{self, LogSettings};
use mailtask_helpers::shutdown;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEAD_LETTER_CHANNEL_CAPACITY: usize = 256;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(LogSettings::service(
        "mailtask-server",
        "MAILTASK_LOG",
        "mailtask_server=info,async_imap=warn,tokio=warn",
    ));

    let config = Config::load().context("failed to load configuration")?;
    let shutdown = CancellationToken::new();

    let handlers = build_handlers(&config);
    let routes = RouteTable::new(&config.routes);

    let exhausted_sink = match &config.dead_letter_dir {
        Some(dir) => {
            let (tx, rx) =
                mpsc::channel::<ExhaustedTask>(DEAD_LETTER_CHANNEL_CAPACITY);
            tokio::spawn(run_dead_letter_writer(rx, SpoolDir::new(dir.clone())));
            Some(tx)
        }
        None => None,
    };

    info!(
        "server starting: imap={}:{}, mailboxes={}, routes={}, handlers={}, health_listen={}",
        config.imap.host,
        config.imap.port,
        config.mailboxes.len(),
        routes.len(),
        handlers.destinations().join(","),
        config.health_listen
    );

    let pipeline = Pipeline {
        transport: Arc::new(ImapTransport::new(config.imap.clone())),
        parser: Arc::new(MimeParser::new(routes)),
        handlers,
        queue: RetryQueue::new(config.queue_limits(), config.retry_policy()),
        exhausted_sink,
    };
    let orchestrator = Arc::new(Orchestrator::new(
        pipeline,
        config.ingest_settings(),
        shutdown.clone(),
    ));

    let state = AppState {
        orchestrator: orchestrator.clone(),
        source: config.source.clone(),
        shutdown: shutdown.clone(),
    };

    let listener = bind_health_listener(&config.health_listen).await?;
    let health = tokio::spawn(run_health_server(listener, state));

    orchestrator
        .start()
        .await
        .context("failed to start mail ingestion")?;

    let signal = shutdown::listen_shutdown(shutdown.clone()).await;
    info!("server stopping: signal={signal}");

    orchestrator.stop().await;
    health.await.context("health listener task failed")??;

    info!("server stopped");
    Ok(())
}

fn build_handlers(config: &Config) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for (name, handler) in &config.handlers {
        match handler {
            HandlerConfig::Forward { addr, timeout_secs } => {
                registry.register(
                    name.clone(),
                    Arc::new(ForwardHandler::new(
                        name.clone(),
                        addr.clone(),
                        config.source.clone(),
                        *timeout_secs,
                    )),
                );
            }
            HandlerConfig::Spool { dir } => {
                registry.register(
                    name.clone(),
                    Arc::new(SpoolHandler::new(name.clone(), SpoolDir::new(dir.clone()))),
                );
            }
        }
    }
    registry
}
