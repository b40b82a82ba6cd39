//! Broker CLI
//!
//! Publishes to and consumes from RabbitMQ queues through the resilient
//! `broker` client. Connection settings come from `RABBITMQ_*` environment
//! variables (see `core_config::rabbitmq::RabbitMqConfig`).
//!
//! ```text
//! broker-cli publish orders '{"id": 1}'
//! broker-cli publish orders ping --unconfirmed
//! broker-cli consume orders --limit 10
//! broker-cli metrics
//! ```

use broker::{metrics, BrokerClient, ClientConfig};
use clap::{Parser, Subcommand};
use core_config::rabbitmq::RabbitMqConfig;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use futures::StreamExt;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "broker-cli")]
#[command(about = "Publish to and consume from RabbitMQ queues")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Publish one message and wait for the broker to acknowledge it
    Publish {
        /// Target queue, declared if missing
        queue: String,

        /// Message body
        payload: String,

        /// Return as soon as the message is written, without waiting for a confirm
        #[arg(short, long)]
        unconfirmed: bool,
    },

    /// Consume messages, acknowledging each one
    Consume {
        /// Queue to consume from, declared if missing
        queue: String,

        /// Stop after this many messages. Runs until Ctrl+C when omitted.
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Connect and print the client metrics in Prometheus text format
    Metrics,
}

/// Run the CLI
///
/// # Errors
///
/// Returns an error if:
/// - RabbitMQ configuration is invalid
/// - The metrics recorder cannot be installed
/// - The broker rejects the credentials or stays unreachable
/// - A publish or consume fails
pub async fn run() -> Result<()> {
    install_color_eyre();

    let cli = Cli::parse();

    let environment = Environment::from_env();
    init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let rabbitmq = RabbitMqConfig::from_env().wrap_err("Failed to load RabbitMQ configuration")?;
    let client = BrokerClient::new(rabbitmq.addr.clone(), ClientConfig::from(&rabbitmq));
    info!(client = ?client, "Broker client started");

    let outcome = tokio::select! {
        result = execute(&client, cli.command) => result,
        result = shutdown_signal() => result,
    };

    if let Err(e) = client.close().await {
        warn!(error = %e, "Broker client did not close cleanly");
    }

    outcome
}

async fn execute(client: &BrokerClient, command: Commands) -> Result<()> {
    match command {
        Commands::Publish {
            queue,
            payload,
            unconfirmed,
        } => {
            client
                .ensure_queue(&queue)
                .await
                .wrap_err_with(|| format!("Failed to declare queue {}", queue))?;

            if unconfirmed {
                client
                    .send_unconfirmed(&queue, payload.as_bytes())
                    .await
                    .wrap_err("Publish failed")?;
            } else {
                client
                    .send_confirmed(&queue, payload.as_bytes())
                    .await
                    .wrap_err("Confirmed publish failed")?;
            }

            info!(queue = %queue, bytes = payload.len(), confirmed = !unconfirmed, "Message published");
        }
        Commands::Consume { queue, limit } => consume(client, &queue, limit).await?,
        Commands::Metrics => {
            client.wait_connected().await.wrap_err("Failed to connect")?;
            println!("{}", metrics::render_metrics());
        }
    }

    Ok(())
}

async fn consume(client: &BrokerClient, queue: &str, limit: Option<usize>) -> Result<()> {
    client
        .ensure_queue(queue)
        .await
        .wrap_err_with(|| format!("Failed to declare queue {}", queue))?;

    let mut deliveries = client
        .consume(queue)
        .await
        .wrap_err_with(|| format!("Failed to consume from {}", queue))?;

    let mut received = 0usize;
    while limit.is_none_or(|limit| received < limit) {
        let Some(delivery) = deliveries.next().await else {
            warn!(queue = %queue, "Consumer channel closed");
            break;
        };
        let delivery = delivery.wrap_err("Delivery failed")?;

        info!(
            queue = %queue,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            body = %String::from_utf8_lossy(&delivery.data),
            "Message received"
        );
        delivery.ack().await.wrap_err("Failed to acknowledge delivery")?;
        received += 1;
    }

    info!(queue = %queue, received, "Consumer finished");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<_, eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_publish() {
        let cli = Cli::try_parse_from(["broker-cli", "publish", "orders", "hello"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Publish {
                queue: "orders".to_string(),
                payload: "hello".to_string(),
                unconfirmed: false,
            }
        );
    }

    #[test]
    fn test_parse_publish_unconfirmed() {
        let cli =
            Cli::try_parse_from(["broker-cli", "publish", "orders", "hello", "--unconfirmed"])
                .unwrap();
        assert!(matches!(cli.command, Commands::Publish { unconfirmed: true, .. }));
    }

    #[test]
    fn test_parse_consume_with_limit() {
        let cli = Cli::try_parse_from(["broker-cli", "consume", "orders", "-l", "5"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Consume {
                queue: "orders".to_string(),
                limit: Some(5),
            }
        );

        let cli = Cli::try_parse_from(["broker-cli", "consume", "orders"]).unwrap();
        assert!(matches!(cli.command, Commands::Consume { limit: None, .. }));
    }

    #[test]
    fn test_parse_rejects_missing_payload() {
        assert!(Cli::try_parse_from(["broker-cli", "publish", "orders"]).is_err());
        assert!(Cli::try_parse_from(["broker-cli", "consume", "orders", "--limit", "many"]).is_err());
    }

    #[test]
    fn test_parse_metrics() {
        let cli = Cli::try_parse_from(["broker-cli", "metrics"]).unwrap();
        assert_eq!(cli.command, Commands::Metrics);
    }
}
