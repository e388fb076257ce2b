use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use tokio::{sync::watch, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
    api::{AppState, run_api_server},
    clients::{
        database::{DatabaseClient, OutcomeStore},
        gateway::transport_for,
        health::HealthChecker,
        rbmq::{MessageBus, RabbitMqClient},
    },
    config::Config,
    dispatcher::Dispatcher,
    failure::FailureController,
    handlers::{EmailHandler, HandlerRegistry, SmsHandler},
    recorder::OutcomeRecorder,
    topology::Topology,
};

/// Runs the consumer until Ctrl-C/SIGTERM or until a dispatcher stops.
///
/// The broker connection is closed on every exit path once it was opened.
pub async fn run_worker(config: Config) -> Result<(), Error> {
    let database = Arc::new(DatabaseClient::connect(&config.database_url).await?);
    database.migrate().await?;

    let rabbitmq = Arc::new(RabbitMqClient::connect(&config).await?);

    let result = consume(&config, database, Arc::clone(&rabbitmq)).await;

    rabbitmq.close().await;

    result
}

pub fn build_registry(config: &Config, recorder: OutcomeRecorder) -> Result<HandlerRegistry, Error> {
    let email_transport = transport_for(
        config.email_gateway_url.as_deref(),
        config.gateway_timeout_seconds,
    )?;
    let sms_transport = transport_for(
        config.sms_gateway_url.as_deref(),
        config.gateway_timeout_seconds,
    )?;

    Ok(HandlerRegistry::new(
        EmailHandler::new(email_transport, recorder.clone(), config.max_retries),
        SmsHandler::new(sms_transport, recorder, config.max_retries),
    ))
}

async fn consume(
    config: &Config,
    database: Arc<DatabaseClient>,
    rabbitmq: Arc<RabbitMqClient>,
) -> Result<(), Error> {
    let topology = Topology::from_config(config);

    let setup_channel = rabbitmq.open_channel().await?;
    topology.setup(&setup_channel).await?;

    let store: Arc<dyn OutcomeStore> = database;
    let recorder = OutcomeRecorder::new(Arc::clone(&store), config.write_retry_config());
    let registry = Arc::new(build_registry(config, recorder.clone())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut dispatchers = JoinSet::new();

    for binding in topology.bindings() {
        let channel = rabbitmq.open_channel().await?;
        let deliveries = channel.consume(&binding.queue).await?;
        let bus: Arc<dyn MessageBus> = Arc::new(channel);

        let failures = FailureController::new(
            Arc::clone(&bus),
            &topology,
            binding.clone(),
            recorder.clone(),
            config.max_retries,
        );
        let dispatcher = Dispatcher::new(
            binding.clone(),
            bus,
            Arc::clone(&registry),
            failures,
            recorder.clone(),
        );

        let shutdown = shutdown_rx.clone();
        dispatchers.spawn(async move {
            let queue = dispatcher.queue().to_string();
            let settled = dispatcher.run(deliveries, shutdown).await;
            (queue, settled)
        });
    }

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(Arc::clone(&store), rabbitmq.clone()),
        store,
    });
    let mut api_shutdown = shutdown_rx.clone();
    let mut api = tokio::spawn(run_api_server(state, config.server_port, async move {
        let _ = api_shutdown.changed().await;
    }));

    info!(
        queues = topology.bindings().len(),
        "Notification consumer started"
    );

    let mut failure: Option<Error> = None;

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        Some(joined) = dispatchers.join_next() => {
            let reason = match joined {
                Ok((queue, Ok(settled))) => anyhow!("Dispatcher for {} stopped after {} deliveries", queue, settled),
                Ok((queue, Err(e))) => anyhow!("Dispatcher for {} failed: {}", queue, e),
                Err(e) => anyhow!("Dispatcher task panicked: {}", e),
            };
            error!(error = %reason, "Stopping consumer");
            failure = Some(reason);
        }
        joined = &mut api => {
            let reason = match joined {
                Ok(Ok(())) => anyhow!("API server stopped unexpectedly"),
                Ok(Err(e)) => anyhow!("API server failed: {}", e),
                Err(e) => anyhow!("API server task panicked: {}", e),
            };
            error!(error = %reason, "Stopping consumer");
            failure = Some(reason);
        }
    }

    let _ = shutdown_tx.send(true);

    // Each dispatcher settles its in-flight delivery before returning, so
    // acknowledgments are drained before the connection is closed.
    while let Some(joined) = dispatchers.join_next().await {
        match joined {
            Ok((queue, Ok(settled))) => info!(queue = %queue, settled, "Dispatcher drained"),
            Ok((queue, Err(e))) => warn!(queue = %queue, error = %e, "Dispatcher ended with error"),
            Err(e) => warn!(error = %e, "Dispatcher task panicked"),
        }
    }

    if !api.is_finished() {
        if let Err(e) = api.await {
            warn!(error = %e, "API server task panicked");
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
