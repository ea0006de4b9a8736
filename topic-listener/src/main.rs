use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use topic_listener::config::Config;
use topic_listener::coordinator::Coordinator;
use topic_listener::dispatcher::{json, Dispatcher};
use topic_listener::observability::TracingOutcomeSink;
use topic_listener::offset_tracker::OffsetTracker;
use topic_listener::purchases::{LoggingPurchaseProcessor, Purchase};
use topic_listener::rejoin;
use topic_listener::server::{router, serve, setup_metrics_recorder};
use topic_listener::TopicListener;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config, coordinator: Arc<Coordinator>) -> Result<JoinHandle<()>> {
    let recorder = setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let router = router(coordinator, recorder);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = ?e, bind = %bind, "Metrics server stopped");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting topic listener");

    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;
    config.validate().context("Invalid configuration")?;
    info!("Configuration loaded: {:?}", config);

    let dispatcher = Dispatcher::builder()
        .register(
            &config.purchases_topic,
            json::<Purchase>,
            Arc::new(LoggingPurchaseProcessor),
        )
        .build()
        .context("Failed to build topic handler table")?;

    for topic in config.topics() {
        if !dispatcher.is_registered(&topic) {
            warn!(topic = %topic, "Subscribed topic has no handler, its messages will be skipped");
        }
    }

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(dispatcher),
        Arc::new(OffsetTracker::new()),
        Arc::new(TracingOutcomeSink),
        config.to_claim_config(),
    ));

    let server_handle = start_server(&config, coordinator.clone())?;
    info!("Started metrics server on {}", config.bind_address());

    let shutdown = CancellationToken::new();
    let listener = TopicListener::from_config(&config, coordinator);
    let policy = config.to_rejoin_policy();
    let run_shutdown = shutdown.clone();
    let mut listener_handle =
        tokio::spawn(async move { rejoin::run(&listener, &policy, &run_shutdown).await });

    let outcome = tokio::select! {
        joined = &mut listener_handle => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = ?e, "Failed to listen for ctrl+c signal");
            }
            info!("Received shutdown signal, shutting down gracefully...");
            shutdown.cancel();

            match tokio::time::timeout(config.shutdown_timeout(), &mut listener_handle).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    error!(
                        "Listener shutdown timed out after {:?}",
                        config.shutdown_timeout()
                    );
                    None
                }
            }
        }
    };

    server_handle.abort();

    match outcome {
        Some(Ok(Ok(()))) => {
            info!("Topic listener stopped");
            Ok(())
        }
        Some(Ok(Err(e))) => Err(e).context("Topic listener stopped with a fatal error"),
        Some(Err(e)) => Err(e).context("Topic listener task panicked"),
        None => {
            listener_handle.abort();
            anyhow::bail!("Topic listener did not shut down in time")
        }
    }
}
