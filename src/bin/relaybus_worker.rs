//! relaybus-worker: RPC and job bus worker
//!
//! Serves an `echo` RPC operation on `{service}.echo` and, when a `bus`
//! section is configured, consumes the job stream, logging every event.
//!
//! ## Configuration
//! - relaybus.yaml / RELAYBUS_CONFIG: YAML configuration file
//! - RELAYBUS__*: overrides (e.g. RELAYBUS__BROKER__HOST)
//! - SERVICE_NAME, RABBITMQ_*, REDIS_*: legacy variables
//! - RELAYBUS_LOG: log filter (default: info)

use tracing::{info, Instrument};

use relaybus::bus::{handler_fn as bus_handler_fn, EventBus};
use relaybus::config::Config;
use relaybus::rpc::{handler_fn, AmqpRpcServer};
use relaybus::storage::{ConnectionPool, RedisManager};
use relaybus::transport::{AmqpTransport, BrokerConnection};
use relaybus::utils::bootstrap::{init_tracing, service_span};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let span = service_span(&config.service.name);

    run(config).instrument(span).await
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let connection = BrokerConnection::new(
        AmqpTransport,
        config.broker.endpoint(),
        config.broker.settings(),
    )?;
    connection.connect().await;

    let mut server = AmqpRpcServer::new(connection.clone(), config.service.name.clone())?;
    server.register(
        "echo",
        handler_fn(|request| async move { Ok(request) }),
    )?;
    let rpc = server.start().await?;

    let pool = ConnectionPool::new(RedisManager::new(&config.store.url)?, config.store.pool.clone())?;
    pool.warm().await;
    let reaper = pool.spawn_reaper();

    let consumer = match &config.bus {
        Some(options) => {
            let bus = EventBus::connect(pool.clone(), options.clone()).await?;
            bus.subscribe(bus_handler_fn(|message| async move {
                info!(
                    job_id = %message.job_id,
                    event_type = %message.event.event_type,
                    payload = %message.event.payload,
                    "Event received"
                );
                Ok(())
            }))
            .await;
            Some(bus.start_consuming(config.service.consumer_name()))
        }
        None => None,
    };

    info!(
        service = %config.service.name,
        queues = ?rpc.queues(),
        bus = config.bus.is_some(),
        "relaybus-worker started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(consumer) = consumer {
        consumer.shutdown().await;
    }
    rpc.stop().await;
    reaper.shutdown().await;
    connection.shutdown().await;

    Ok(())
}
