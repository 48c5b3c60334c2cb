use std::time::Duration;

use anyhow::{Context, Result};
use broker_service::{logging, BrokerClient, Config, Message};
use futures::StreamExt;
use tracing::{info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");

    let config = Config::load().context("Failed to load configuration")?;
    let client = BrokerClient::from_config(&config)
        .await
        .context("Error creating broker")?;

    tokio::select! {
        result = drain(&client) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    client.close().await.context("Failed to close broker")?;
    Ok(())
}

/// Log every decoded message. When the subscription ends (backend closed it or the connection
/// dropped) subscribe again, which reconnects on demand.
async fn drain(client: &BrokerClient) -> Result<()> {
    loop {
        let mut deliveries = match client.consume::<Message>().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                if !client.is_recoverable(&e).await {
                    return Err(e).context("Error consuming messages");
                }
                warn!("Broker unavailable, retrying in {:?}: {}", RESUBSCRIBE_DELAY, e);
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                continue;
            }
        };

        info!("Waiting for messages");
        while let Some(delivery) = deliveries.next().await {
            info!("Received message: {:?}", delivery.body);
        }

        warn!(
            skipped = deliveries.skipped(),
            "Delivery stream closed, re-subscribing"
        );
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}
