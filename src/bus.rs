use crate::model::AgentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Logical topics carried over the inter-satellite link.
pub mod topics {
    pub const HEALTH: &str = "swarm/health";
    pub const HELLO: &str = "swarm/hello";
    pub const BROADCAST: &str = "swarm/broadcast";
}

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryQuality {
    /// Best-effort: failures are dropped silently (HELLO beacons, gossip).
    FireAndForget,
    /// Acknowledged: the publish fails loudly if nothing took the message.
    AtLeastOnce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub sender: AgentId,
    pub topic: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

impl BusMessage {
    pub fn new(sender: AgentId, topic: &str, payload: Vec<u8>) -> Self {
        Self {
            sender,
            topic: topic.into(),
            payload,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no subscribers for topic {0}")]
    NoSubscribers(String),
    #[error("all subscriber channels closed for topic {0}")]
    ChannelsClosed(String),
    #[error("injected publish failure")]
    InjectedFailure,
}

/// Abstract reliable/unreliable publish-subscribe transport. The physical
/// radio layer below this is out of scope; implementations only need topic
/// fanout and optional directed delivery.
#[async_trait]
pub trait SwarmBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        message: BusMessage,
        quality: DeliveryQuality,
        receiver: Option<&AgentId>,
    ) -> Result<(), BusError>;

    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &AgentId,
    ) -> Result<mpsc::Receiver<BusMessage>, BusError>;

    /// Outbound congestion approximation in [0, 1], for hosts without a
    /// bandwidth governor. Implementations without queue visibility report 0.
    fn congestion_hint(&self) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub injected_failures: u64,
}

struct Subscription {
    topic: String,
    subscriber: AgentId,
    tx: mpsc::Sender<BusMessage>,
}

struct BusState {
    subscriptions: Vec<Subscription>,
    stats: BusStats,
    fail_next: u32,
}

/// In-process reference bus: topic fanout over bounded tokio channels with
/// directed delivery. Used by the constellation simulation and the test
/// suite; a flight deployment substitutes the real ISL transport.
pub struct InMemoryBus {
    state: Mutex<BusState>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscriptions: Vec::new(),
                stats: BusStats::default(),
                fail_next: 0,
            }),
        }
    }

    /// Fail the next `n` publishes, for exercising retry/backoff paths.
    pub fn inject_failures(&self, n: u32) {
        self.lock_state().fail_next = n;
    }

    pub fn stats(&self) -> BusStats {
        self.lock_state().stats
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SwarmBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        message: BusMessage,
        quality: DeliveryQuality,
        receiver: Option<&AgentId>,
    ) -> Result<(), BusError> {
        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let mut state = self.lock_state();
            state.stats.published += 1;

            if state.fail_next > 0 {
                state.fail_next -= 1;
                state.stats.injected_failures += 1;
                return Err(BusError::InjectedFailure);
            }

            state.subscriptions.retain(|s| !s.tx.is_closed());
            state
                .subscriptions
                .iter()
                .filter(|s| s.topic == topic)
                .filter(|s| receiver.map_or(true, |r| &s.subscriber == r))
                .map(|s| s.tx.clone())
                .collect()
        };

        if targets.is_empty() {
            return match quality {
                DeliveryQuality::FireAndForget => Ok(()),
                DeliveryQuality::AtLeastOnce => Err(BusError::NoSubscribers(topic.into())),
            };
        }

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for tx in targets {
            match quality {
                DeliveryQuality::FireAndForget => match tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dropped += 1,
                },
                DeliveryQuality::AtLeastOnce => match tx.send(message.clone()).await {
                    Ok(()) => delivered += 1,
                    Err(_) => dropped += 1,
                },
            }
        }

        {
            let mut state = self.lock_state();
            state.stats.delivered += delivered;
            state.stats.dropped += dropped;
        }

        if quality == DeliveryQuality::AtLeastOnce && delivered == 0 {
            return Err(BusError::ChannelsClosed(topic.into()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &AgentId,
    ) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        debug!(topic, subscriber = %subscriber, "bus subscription added");
        self.lock_state().subscriptions.push(Subscription {
            topic: topic.into(),
            subscriber: subscriber.clone(),
            tx,
        });
        Ok(rx)
    }

    fn congestion_hint(&self) -> f64 {
        let state = self.lock_state();
        state
            .subscriptions
            .iter()
            .map(|s| 1.0 - s.tx.capacity() as f64 / s.tx.max_capacity() as f64)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id(serial: &str) -> AgentId {
        AgentId::new(serial).unwrap()
    }

    #[tokio::test]
    async fn test_publish_fanout_and_directed_delivery() {
        let bus = InMemoryBus::new();
        let a = test_id("SAT-A");
        let b = test_id("SAT-B");
        let mut rx_a = bus.subscribe(topics::HELLO, &a).await.unwrap();
        let mut rx_b = bus.subscribe(topics::HELLO, &b).await.unwrap();

        let msg = BusMessage::new(a.clone(), topics::HELLO, vec![1, 2, 3]);
        bus.publish(topics::HELLO, msg.clone(), DeliveryQuality::AtLeastOnce, None)
            .await
            .unwrap();
        assert_eq!(rx_a.recv().await.unwrap().payload, vec![1, 2, 3]);
        assert_eq!(rx_b.recv().await.unwrap().payload, vec![1, 2, 3]);

        bus.publish(topics::HELLO, msg, DeliveryQuality::AtLeastOnce, Some(&b))
            .await
            .unwrap();
        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_at_least_once_requires_subscriber() {
        let bus = InMemoryBus::new();
        let a = test_id("SAT-A");
        let msg = BusMessage::new(a, topics::HEALTH, vec![0]);
        let err = bus
            .publish(topics::HEALTH, msg.clone(), DeliveryQuality::AtLeastOnce, None)
            .await;
        assert!(matches!(err, Err(BusError::NoSubscribers(_))));

        // Fire-and-forget shrugs it off.
        assert!(bus
            .publish(topics::HEALTH, msg, DeliveryQuality::FireAndForget, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = InMemoryBus::new();
        let a = test_id("SAT-A");
        let _rx = bus.subscribe(topics::HEALTH, &a).await.unwrap();
        bus.inject_failures(1);

        let msg = BusMessage::new(a, topics::HEALTH, vec![0]);
        assert_eq!(
            bus.publish(topics::HEALTH, msg.clone(), DeliveryQuality::AtLeastOnce, None)
                .await,
            Err(BusError::InjectedFailure)
        );
        assert!(bus
            .publish(topics::HEALTH, msg, DeliveryQuality::AtLeastOnce, None)
            .await
            .is_ok());
        assert_eq!(bus.stats().injected_failures, 1);
    }
}
