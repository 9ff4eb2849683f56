//! Data Sender Service - Main Entry Point
//!
//! Relays control-queue payloads to AMQP, Kafka and MQTT brokers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use data_sender::{
    AmqpSender, ControlListener, DispatchEngine, DummySender, EntitySerializer,
    JsonEntitySerializer, KafkaSender, MqttSender, SenderConfig, Sender,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "data_sender=info".into()),
    );
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = SenderConfig::from_env().context("invalid configuration")?;

    info!("Starting Data Sender Service v{}", env!("CARGO_PKG_VERSION"));
    info!(
        reconnect_delay_ms = config.reconnect_delay_ms,
        connect_timeout_ms = config.connect_timeout_ms,
        max_in_flight = config.max_in_flight,
        "Configuration loaded"
    );

    // Initialize components
    let serializer: Arc<dyn EntitySerializer> = Arc::new(JsonEntitySerializer::new());
    let timeout = config.connect_timeout();

    let mut senders: Vec<Arc<dyn Sender>> = vec![
        Arc::new(AmqpSender::new(&config.amqp_queue, timeout)),
        Arc::new(KafkaSender::new(&config.kafka_queue, timeout, Arc::clone(&serializer))),
        Arc::new(MqttSender::new(&config.mqtt_queue, timeout)),
    ];
    if config.enable_dummy_sender {
        senders.push(Arc::new(DummySender::new(&config.dummy_queue)));
    }

    let engines = senders
        .into_iter()
        .map(|sender| {
            info!(sender = sender.name(), queue = %sender.queue_name(), "Registering sender");
            Arc::new(DispatchEngine::new(
                sender,
                Arc::clone(&serializer),
                config.max_in_flight,
            ))
        })
        .collect();

    ControlListener::new(&config, engines).run().await;

    Ok(())
}
