use std::time::Duration;

use anyhow::{Context, Result};
use broker_service::{logging, BrokerClient, Config};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

const MESSAGE_COUNT: u32 = 5;

#[derive(Debug, Serialize)]
struct ProducerMessage {
    id: u32,
    message: String,
    time: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");

    let config = Config::load().context("Failed to load configuration")?;
    let client = BrokerClient::from_config(&config)
        .await
        .context("Error creating broker")?;

    for id in 1..=MESSAGE_COUNT {
        let message = ProducerMessage {
            id,
            message: "Hello from producer".to_string(),
            time: Utc::now(),
        };

        match client.publish(&message).await {
            Ok(()) => info!("Successfully published message {}", id),
            Err(e) => error!("Failed to publish message {}: {}", id, e),
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    client.close().await.context("Failed to close broker")?;
    Ok(())
}
