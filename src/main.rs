//! pubsub-link: console publisher/subscriber
//!
//! Subscribes to the configured topics and prints every message received.
//! Each line read from stdin of the form `topic payload` is published.
//! Reconnects of either connection are reported as they happen.

mod config;

use config::Config;
use chrono::Utc;
use pubsub_link::{Client, ConnectionState, Message, Side};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        addr = %config.addr(),
        retry_attempts = config.retry_attempts,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        topics = config.subscribe.len(),
        "Starting pubsub-link"
    );

    let client = Arc::new(Client::new(config.client_options()));
    client.start().await?;

    let mut reconnects = client.reconnects();
    tokio::spawn(async move {
        while let Ok(event) = reconnects.recv().await {
            println!("{} connection reconnected at {}", event.side, event.at);
        }
    });

    for side in [Side::Publish, Side::Subscribe] {
        let mut changes = client.state_changes(side);
        tokio::spawn(async move {
            while let Ok(state) = changes.recv().await {
                if state == ConnectionState::Closed {
                    println!("{side} connection closed at {}", Utc::now());
                }
            }
        });
    }

    let mut subscriptions = Vec::with_capacity(config.subscribe.len());
    for topic in &config.subscribe {
        let subscription = client
            .subscribe(topic, |message: &Message| {
                println!("[{}] {}", message.topic, message.payload);
            })
            .await?;
        info!(topic = subscription.topic(), "Subscribed");
        subscriptions.push(subscription);
    }
    info!(topics = ?client.topics(), "Reading `topic payload` lines from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };

        let Some((topic, payload)) = line.trim().split_once(' ') else {
            if !line.trim().is_empty() {
                warn!(%line, "Expected `topic payload`");
            }
            continue;
        };

        // Publish in the background so a stalled connection does not block input.
        let client = Arc::clone(&client);
        let (topic, payload) = (topic.to_string(), payload.to_string());
        tokio::spawn(async move {
            match client.publish(&topic, &payload).await {
                Ok(()) => info!(%topic, "Published"),
                Err(e) => warn!(%topic, error = %e, "Publish failed"),
            }
        });
    }

    info!("Shutting down");
    drop(subscriptions);
    client.shutdown();
    Ok(())
}
