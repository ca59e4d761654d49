//! Load generator for a running streampoll service.
//!
//! Listeners long-poll random `doc-<k>` streams and report the average
//! delay between a message being posted and being received. Posters append
//! `{id, timestamp}` messages with increasing ids to random streams.
//!
//! Environment: `BASE_URL` (default `http://localhost:3000`), `NUM_DOCS`
//! (10), `NUM_LISTENERS` (100), `NUM_POSTERS` (100).

use anyhow::Context;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use streampoll::observability::init_tracing;
use streampoll::types::now_millis;
use tokio::task::JoinSet;

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    id: String,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct AppendBody<'a> {
    stream: &'a str,
    id: &'a str,
    message: Message,
}

#[derive(Debug, Clone)]
struct LoadConfig {
    base_url: String,
    num_docs: u64,
    num_listeners: u64,
    num_posters: u64,
}

impl LoadConfig {
    fn from_env() -> Self {
        Self {
            base_url: std::env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            num_docs: env_or("NUM_DOCS", 10).max(1),
            num_listeners: env_or("NUM_LISTENERS", 100),
            num_posters: env_or("NUM_POSTERS", 100),
        }
    }
}

fn env_or(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Running mean of delivery delays, in milliseconds.
#[derive(Debug, Default)]
struct DelayStats {
    samples: u64,
    mean_ms: f64,
}

impl DelayStats {
    fn record(&mut self, delay_ms: u64) {
        self.samples += 1;
        self.mean_ms += (delay_ms as f64 - self.mean_ms) / self.samples as f64;
    }
}

/// One long-poll. Returns the id of the last message received, if any.
async fn long_poll(
    client: &Client,
    base_url: &str,
    stream: &str,
    version: &str,
    stats: &mut DelayStats,
) -> anyhow::Result<Option<String>> {
    let messages: Vec<Message> = client
        .get(format!("{base_url}/messages"))
        .query(&[("stream", stream), ("version", version)])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
        .context("decode poll response")?;

    let now = now_millis();
    for message in &messages {
        if let Ok(sent) = message.timestamp.parse::<u64>() {
            stats.record(now.saturating_sub(sent));
        }
    }
    Ok(messages.last().map(|message| message.id.clone()))
}

async fn post_message(
    client: &Client,
    base_url: &str,
    stream: &str,
    version: u64,
) -> anyhow::Result<()> {
    let id = version.to_string();
    let body = AppendBody {
        stream,
        id: &id,
        message: Message {
            id: id.clone(),
            timestamp: now_millis().to_string(),
        },
    };
    // 409 is expected when posters share a stream.
    client
        .post(format!("{base_url}/message"))
        .json(&body)
        .send()
        .await?;
    Ok(())
}

async fn run_listener(client: Arc<Client>, base_url: String, listener: u64, stream: String) {
    let mut version = "0".to_string();
    let mut stats = DelayStats::default();
    let mut polls: u64 = 0;

    loop {
        polls += 1;
        match long_poll(&client, &base_url, &stream, &version, &mut stats).await {
            Ok(Some(last)) => version = last,
            Ok(None) => {}
            Err(err) => tracing::debug!(listener, error = %err, "poll failed"),
        }
        if polls % 10 == 0 {
            tracing::info!(
                listener,
                %stream,
                polls,
                avg_delay_ms = stats.mean_ms as u64,
                "listener progress"
            );
        }
    }
}

async fn run_poster(client: Arc<Client>, base_url: String, stream: String) {
    let mut version: u64 = 0;
    loop {
        if let Err(err) = post_message(&client, &base_url, &stream, version).await {
            tracing::debug!(%stream, error = %err, "post failed");
        }
        version += 1;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = LoadConfig::from_env();
    tracing::info!(?config, "starting load generator");

    let client = Arc::new(Client::new());
    let mut tasks = JoinSet::new();

    for listener in 0..config.num_listeners {
        let doc = rand::rng().random_range(0..config.num_docs);
        tasks.spawn(run_listener(
            Arc::clone(&client),
            config.base_url.clone(),
            listener,
            format!("doc-{doc}"),
        ));
    }
    for _ in 0..config.num_posters {
        let doc = rand::rng().random_range(0..config.num_docs);
        tasks.spawn(run_poster(
            Arc::clone(&client),
            config.base_url.clone(),
            format!("doc-{doc}"),
        ));
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("stopping load generator");
    tasks.shutdown().await;
    Ok(())
}
