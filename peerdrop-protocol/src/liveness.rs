//! Peer Liveness Tracker
//!
//! Every connected peer gets a probe task. Each probe interval it runs one
//! measurement round: up to three sequential `ping`s, each waiting for the
//! `pong` that echoes its timestamp. Timed-out attempts are left out of the
//! average. If every attempt times out the latency is [`UNREACHABLE_LATENCY_MS`].
//!
//! Rounds of one connection never overlap: the probe task awaits the round
//! before waiting for the next tick, and missed ticks are delayed rather than
//! fired in a burst.

use crate::connection::{ConnectionRegistry, NetworkQuality};
use crate::events::{ConnectionEvent, EventSender};
use crate::message::{current_timestamp, Message};
use crate::transport::MessageSink;
use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Latency recorded when no attempt of a round got a reply
pub const UNREACHABLE_LATENCY_MS: u64 = 999;

/// Default time between measurement rounds
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(5000);

/// Default wait for one `pong`
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default attempts per round
pub const DEFAULT_PING_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub probe_interval: Duration,
    pub ping_timeout: Duration,
    pub ping_attempts: u32,
}

impl LivenessConfig {
    /// Reject timings the probe cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.probe_interval.is_zero() {
            return Err(ProtocolError::Configuration(
                "probe interval must be positive".to_string(),
            ));
        }
        if self.ping_attempts == 0 {
            return Err(ProtocolError::Configuration(
                "at least one ping attempt is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            ping_attempts: DEFAULT_PING_ATTEMPTS,
        }
    }
}

type PendingKey = (String, i64);

/// Runs the probe tasks and matches incoming `pong`s to outstanding pings
#[derive(Debug)]
pub struct LivenessTracker {
    local_id: String,
    config: LivenessConfig,
    registry: Arc<ConnectionRegistry>,
    events: EventSender,
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<Instant>>>,
    probes: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LivenessTracker {
    /// A zero probe interval falls back to [`DEFAULT_PROBE_INTERVAL`]
    pub fn new(
        local_id: impl Into<String>,
        mut config: LivenessConfig,
        registry: Arc<ConnectionRegistry>,
        events: EventSender,
    ) -> Self {
        if config.probe_interval.is_zero() {
            warn!(
                "Zero probe interval, using {} ms",
                DEFAULT_PROBE_INTERVAL.as_millis()
            );
            config.probe_interval = DEFAULT_PROBE_INTERVAL;
        }
        Self {
            local_id: local_id.into(),
            config,
            registry,
            events,
            pending: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Start probing `connection_id`, replacing any earlier probe for it
    ///
    /// The first round runs one probe interval from now.
    pub async fn start(self: &Arc<Self>, connection_id: &str, sink: Arc<dyn MessageSink>) {
        let tracker = Arc::clone(self);
        let id = connection_id.to_string();
        let task = tokio::spawn(async move {
            tracker.probe_loop(&id, sink).await;
        });

        if let Some(previous) = self
            .probes
            .lock()
            .await
            .insert(connection_id.to_string(), task)
        {
            previous.abort();
        }
        debug!("Liveness probe started for {}", connection_id);
    }

    /// Cancel the probe for `connection_id` and forget its outstanding pings
    pub async fn stop(&self, connection_id: &str) {
        if let Some(task) = self.probes.lock().await.remove(connection_id) {
            task.abort();
            debug!("Liveness probe stopped for {}", connection_id);
        }
        self.pending
            .lock()
            .await
            .retain(|(id, _), _| id != connection_id);
    }

    /// Cancel every probe
    pub async fn stop_all(&self) {
        for (_, task) in self.probes.lock().await.drain() {
            task.abort();
        }
        self.pending.lock().await.clear();
    }

    /// Whether a probe task is running for `connection_id`
    pub async fn is_probing(&self, connection_id: &str) -> bool {
        self.probes
            .lock()
            .await
            .get(connection_id)
            .is_some_and(|task| !task.is_finished())
    }

    /// Match a `pong` to the ping that carried `timestamp`
    ///
    /// Pongs nobody waits for (late or unsolicited) are ignored.
    pub async fn on_pong(&self, connection_id: &str, timestamp: i64) {
        let waiter = self
            .pending
            .lock()
            .await
            .remove(&(connection_id.to_string(), timestamp));
        match waiter {
            Some(tx) => {
                let _ = tx.send(Instant::now());
            }
            None => debug!(
                "Ignoring unmatched pong {} from {}",
                timestamp, connection_id
            ),
        }
    }

    async fn probe_loop(&self, connection_id: &str, sink: Arc<dyn MessageSink>) {
        let period = self.config.probe_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.measure_latency(connection_id, sink.as_ref()).await {
                Ok(latency_ms) => self.record(connection_id, latency_ms).await,
                Err(e) => {
                    warn!("Liveness probe for {} ended: {}", connection_id, e);
                    break;
                }
            }
        }
    }

    /// Run one measurement round and return the average latency in ms
    ///
    /// # Errors
    ///
    /// Fails only when sending a ping fails; timeouts are not errors.
    pub async fn measure_latency(&self, connection_id: &str, sink: &dyn MessageSink) -> Result<u64> {
        let round_start = current_timestamp();
        let mut samples: Vec<Duration> = Vec::new();

        for attempt in 0..self.config.ping_attempts {
            let timestamp = round_start + i64::from(attempt);
            let key = (connection_id.to_string(), timestamp);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(key.clone(), tx);

            let sent_at = Instant::now();
            let ping = Message::Ping {
                timestamp,
                peer_id: self.local_id.clone(),
            };
            if let Err(e) = sink.send(&ping).await {
                self.pending.lock().await.remove(&key);
                return Err(e);
            }

            match tokio::time::timeout(self.config.ping_timeout, rx).await {
                Ok(Ok(received_at)) => samples.push(received_at.duration_since(sent_at)),
                _ => {
                    self.pending.lock().await.remove(&key);
                    debug!(
                        "Ping {} to {} timed out (attempt {})",
                        timestamp,
                        connection_id,
                        attempt + 1
                    );
                }
            }
        }

        Ok(average_latency_ms(&samples))
    }

    async fn record(&self, connection_id: &str, latency_ms: u64) {
        let Some(quality) = self.registry.update_latency(connection_id, latency_ms).await else {
            return;
        };
        if quality == NetworkQuality::Poor {
            info!("Link to {} is poor ({} ms)", connection_id, latency_ms);
        } else {
            debug!("Latency to {}: {} ms ({})", connection_id, latency_ms, quality);
        }
        self.events.connection(ConnectionEvent::Updated {
            connection_id: connection_id.to_string(),
            latency_ms,
            quality,
        });
    }
}

/// Rounded mean of the samples, or the unreachable sentinel
fn average_latency_ms(samples: &[Duration]) -> u64 {
    if samples.is_empty() {
        return UNREACHABLE_LATENCY_MS;
    }
    let total: f64 = samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
    (total / samples.len() as f64).round() as u64
}
