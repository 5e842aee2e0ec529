//! Temperature/humidity sensor simulator
//!
//! Publishes a random JSON reading at a fixed interval, handy for exercising a broker
//! and the `watch` command without real hardware.

use std::time::Duration;

use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mqtt::{Client, Message, QoS};

pub const DEFAULT_TOPIC: &str = "sensors/temperature-humidity";
pub const DEFAULT_INTERVAL_MS: u64 = 100;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl SensorReading {
    /// Temperature in 20..30 °C, humidity in 40..60 %, two decimals each
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            temperature: round2(rng.gen_range(20.0..30.0)),
            humidity: round2(rng.gen_range(40.0..60.0)),
            timestamp: Local::now().timestamp_millis(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    pub topic: String,
    pub interval: Duration,
    pub qos: QoS,
    /// Stop after this many readings; `None` runs until cancelled
    pub count: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            qos: QoS::AtMostOnce,
            count: None,
        }
    }
}

/// Publishes readings until cancelled or `count` is reached, returning how many were sent
///
/// Failed publishes are logged and skipped so a reconnect does not end the run.
pub async fn run(client: &Client, config: &SimulatorConfig, shutdown: CancellationToken) -> Result<u64> {
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(config.interval);
    let mut sent = 0u64;

    info!(
        "Publishing readings to '{}' every {:?}",
        config.topic, config.interval
    );

    while config.count.map_or(true, |count| sent < count) {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let reading = SensorReading::random(&mut rng);
        let payload =
            serde_json::to_vec(&reading).map_err(|e| eyre!("Failed to encode reading: {}", e))?;
        match client
            .publish(Message::new(config.topic.as_str(), payload, config.qos))
            .await
        {
            Ok(_) => {
                sent += 1;
                debug!(
                    "Published reading {}: {:.2} °C, {:.2} %",
                    sent, reading.temperature, reading.humidity
                );
            }
            Err(e) => warn!("Failed to publish reading: {}", e),
        }
    }

    info!("Simulator stopped after {} readings", sent);
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let reading = SensorReading::random(&mut rng);
            assert!((20.0..=30.0).contains(&reading.temperature));
            assert!((40.0..=60.0).contains(&reading.humidity));
        }
    }

    #[test]
    fn reading_serializes_as_flat_json() {
        let mut rng = StdRng::seed_from_u64(1);
        let reading = SensorReading::random(&mut rng);
        let json: serde_json::Value = serde_json::to_value(&reading).unwrap();
        assert!(json["temperature"].is_f64());
        assert!(json["humidity"].is_f64());
        assert!(json["timestamp"].is_i64());
        assert_eq!(json.as_object().unwrap().len(), 3);

        // 2001-09-09 onwards, the first 13-digit millisecond timestamp
        assert!(reading.timestamp >= 1_000_000_000_000);
    }
}
