//! Broker CLI - Entry Point
//!
//! Operator tool for publishing to and consuming from RabbitMQ queues.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_broker_cli::run().await
}
