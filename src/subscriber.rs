//! Broker side of the bridge: topic filtering, payload decoding and the
//! MQTT dispatch loop feeding the frame queue.

use crate::config::BrokerConfig;
use crate::frame::TelemetryFrame;
use crate::queue::FrameQueue;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Outgoing request slots between the client handle and the event loop.
const CLIENT_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("unable to connect to broker {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: ConnectionError,
    },
    #[error("subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
    #[error("broker connection lost: {0}")]
    Disconnected(#[source] ConnectionError),
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued { evicted: usize },
    Ignored,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub received: u64,
    pub queued: u64,
    pub ignored: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct FeedCounters {
    received: AtomicU64,
    queued: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
}

/// Read side of the subscriber counters, for the liveness report.
#[derive(Debug, Clone, Default)]
pub struct FeedStatsHandle(Arc<FeedCounters>);

impl FeedStatsHandle {
    pub fn snapshot(&self) -> FeedStats {
        FeedStats {
            received: self.0.received.load(Ordering::Relaxed),
            queued: self.0.queued.load(Ordering::Relaxed),
            ignored: self.0.ignored.load(Ordering::Relaxed),
            rejected: self.0.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedSubscriber {
    queue: Arc<FrameQueue>,
    topic_suffix: String,
    counters: FeedStatsHandle,
}

impl FeedSubscriber {
    pub fn new(queue: Arc<FrameQueue>, topic_suffix: impl Into<String>) -> Self {
        Self {
            queue,
            topic_suffix: topic_suffix.into(),
            counters: FeedStatsHandle::default(),
        }
    }

    /// Filter, decode and enqueue one broker message. Runs on the broker
    /// dispatch task; the only blocking point is the queue lock.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Delivery {
        let counters = &self.counters.0;
        counters.received.fetch_add(1, Ordering::Relaxed);
        debug!("{} {}", topic, String::from_utf8_lossy(payload));

        if !topic.ends_with(self.topic_suffix.as_str()) {
            warn!("unexpected topic {}", topic);
            counters.ignored.fetch_add(1, Ordering::Relaxed);
            return Delivery::Ignored;
        }
        if payload.is_empty() {
            warn!("empty payload on {}", topic);
            counters.ignored.fetch_add(1, Ordering::Relaxed);
            return Delivery::Ignored;
        }

        match TelemetryFrame::decode(payload) {
            Ok(frame) => {
                let outcome = self.queue.push(frame);
                counters.queued.fetch_add(1, Ordering::Relaxed);
                if outcome.evicted > 0 {
                    debug!("queue full, evicted {} stale frame(s)", outcome.evicted);
                }
                Delivery::Queued {
                    evicted: outcome.evicted,
                }
            }
            Err(e) => {
                error!("JSON parse error! {}", e);
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                Delivery::Rejected
            }
        }
    }

    pub fn stats(&self) -> FeedStats {
        self.counters.snapshot()
    }

    pub fn stats_handle(&self) -> FeedStatsHandle {
        self.counters.clone()
    }
}

/// Live broker session. Created by [`FeedConnection::connect`], which only
/// returns once the broker has acknowledged the connection.
pub struct FeedConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    topic_filter: String,
}

impl FeedConnection {
    pub async fn connect(config: &BrokerConfig, client_id: String) -> Result<Self, FeedError> {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keepalive());

        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected with result code {:?}", ack.code);
                    break;
                }
                Ok(_) => {}
                Err(source) => {
                    return Err(FeedError::Connect {
                        host: config.host.clone(),
                        port: config.port,
                        source,
                    });
                }
            }
        }

        let connection = Self {
            client,
            eventloop,
            topic_filter: config.topic_filter.clone(),
        };
        connection.subscribe()?;
        Ok(connection)
    }

    fn subscribe(&self) -> Result<(), FeedError> {
        self.client
            .try_subscribe(self.topic_filter.as_str(), QoS::AtMostOnce)
            .map_err(|source| FeedError::Subscribe {
                topic: self.topic_filter.clone(),
                source,
            })?;
        info!("subscribed to {}", self.topic_filter);
        Ok(())
    }

    /// Dispatch broker traffic into `subscriber` until the connection drops.
    /// A dropped connection ends the loop; reconnecting is left to whoever
    /// supervises the process.
    pub async fn run(mut self, subscriber: FeedSubscriber) -> Result<(), FeedError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    subscriber.handle_message(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("Disconnected by broker");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    info!("Disconnected: {}", e);
                    return Err(FeedError::Disconnected(e));
                }
            }
        }
    }
}
