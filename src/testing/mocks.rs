//! Mock implementations for testing
//!
//! Provides a scripted [`Transport`] so the client and relay can be exercised
//! without a broker.

use crate::transport::{Handshake, OutgoingPublish, Transport, TransportEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// A packet the mock was asked to put on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum SentPacket {
    Handshake(Handshake),
    Publish {
        topic: String,
        payload: String,
        message_id: u16,
        qos: u8,
        retain: bool,
        dup: bool,
    },
}

impl SentPacket {
    pub fn topic(&self) -> Option<&str> {
        match self {
            SentPacket::Publish { topic, .. } => Some(topic),
            SentPacket::Handshake(_) => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("mock transport failure")]
pub struct MockTransportError;

/// Scripted transport.
///
/// Events are fed through the paired [`MockHandle`]. With `auto_broker` the
/// mock plays a well-behaved broker itself: every open connects, every
/// handshake is accepted and every QoS publish is acknowledged.
#[derive(Debug)]
pub struct MockTransport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    loopback: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<SentPacket>>>,
    opens: Arc<Mutex<Vec<Duration>>>,
    closes: Arc<Mutex<usize>>,
    auto_broker: bool,
    pub should_fail: bool,
}

/// Test-side view of a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockHandle {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<SentPacket>>>,
    opens: Arc<Mutex<Vec<Duration>>>,
    closes: Arc<Mutex<usize>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let opens = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(0));
        let handle = MockHandle {
            events: tx.clone(),
            sent: sent.clone(),
            opens: opens.clone(),
            closes: closes.clone(),
        };
        let transport = Self {
            events: rx,
            loopback: tx,
            sent,
            opens,
            closes,
            auto_broker: false,
            should_fail: false,
        };
        (transport, handle)
    }

    /// A mock that connects, accepts and acknowledges on its own
    pub fn auto_broker() -> (Self, MockHandle) {
        let (mut transport, handle) = Self::new();
        transport.auto_broker = true;
        (transport, handle)
    }

    fn record(&self, packet: SentPacket) {
        if let Ok(mut sent) = self.sent.try_lock() {
            sent.push(packet);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    fn open(&mut self, delay: Duration) {
        if let Ok(mut opens) = self.opens.try_lock() {
            opens.push(delay);
        }
        if self.auto_broker {
            let _ = self.loopback.send(TransportEvent::Connected);
        }
    }

    async fn next_event(&mut self) -> TransportEvent {
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(MockTransportError);
        }
        self.record(SentPacket::Handshake(handshake.clone()));
        if self.auto_broker {
            let _ = self.loopback.send(TransportEvent::HandshakeAccepted);
        }
        Ok(())
    }

    async fn send_publish(&mut self, publish: OutgoingPublish<'_>) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(MockTransportError);
        }
        self.record(SentPacket::Publish {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_string(),
            message_id: publish.message_id,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
        });
        if self.auto_broker && publish.qos > 0 {
            let _ = self
                .loopback
                .send(TransportEvent::Acknowledged(publish.message_id));
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Ok(mut closes) = self.closes.try_lock() {
            *closes += 1;
        }
    }
}

impl MockHandle {
    /// Queue an event for the transport to report
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub async fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().await.clone()
    }

    /// Only the PUBLISH packets, in send order
    pub async fn publishes(&self) -> Vec<SentPacket> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|p| matches!(p, SentPacket::Publish { .. }))
            .cloned()
            .collect()
    }

    /// Delays passed to every `open` call so far
    pub async fn opens(&self) -> Vec<Duration> {
        self.opens.lock().await.clone()
    }

    pub async fn closes(&self) -> usize {
        *self.closes.lock().await
    }

    pub async fn clear_history(&self) {
        self.sent.lock().await.clear();
        self.opens.lock().await.clear();
    }
}
