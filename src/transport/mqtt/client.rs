//! MQTT session state machine
//!
//! [`MqttClient`] owns one [`Transport`] and, for QoS > 0, one
//! [`InFlightRegistry`]. It reacts to [`TransportEvent`]s (handshake,
//! acknowledgments, reconnects) and is driven by the relay loop; it never
//! spawns tasks of its own.

use super::connection::{check_publish_len, ConnectionOptions, ConnectionState, MqttError};
use super::health_monitor::HealthMonitor;
use super::inflight::InFlightRegistry;
use super::network::NetworkTransport;
use crate::transport::{OutgoingPublish, Transport, TransportEvent};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How often the in-flight registry is swept for expired publishes
pub const RESEND_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Reliable publisher for one broker session
pub struct MqttClient<T: Transport> {
    transport: T,
    options: ConnectionOptions,
    state: ConnectionState,
    /// Present iff QoS > 0
    registry: Option<InFlightRegistry>,
    next_id: u16,
    last_connect_error: Option<String>,
    session_accepted: bool,
    handshake_refused: bool,
}

impl MqttClient<NetworkTransport> {
    /// Client over a real TCP/TLS connection to `options.address`
    pub fn from_options(options: ConnectionOptions) -> Result<Self, MqttError> {
        let transport = NetworkTransport::new(&options)?;
        Ok(Self::new(transport, options))
    }
}

impl<T: Transport> MqttClient<T> {
    pub fn new(transport: T, options: ConnectionOptions) -> Self {
        let registry = (options.qos > 0).then(InFlightRegistry::new);
        Self {
            transport,
            options,
            state: ConnectionState::Disconnected,
            registry,
            next_id: 0,
            last_connect_error: None,
            session_accepted: false,
            handshake_refused: false,
        }
    }

    /// Begin the first connection attempt
    pub fn start(&mut self) {
        info!(
            "MQTT connecting to {} as {}",
            self.options.address, self.options.client_id
        );
        self.state = ConnectionState::Connecting;
        self.transport.open(Duration::ZERO);
    }

    /// Wait for the transport's next event. Cancel-safe.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.transport.next_event().await
    }

    /// Apply one transport event to the session
    pub async fn handle_event(&mut self, event: TransportEvent) {
        if self.state == ConnectionState::Disconnected {
            debug!(?event, "MQTT ignoring event after shutdown");
            return;
        }

        let reconnect = HealthMonitor::reconnect_delay(&event, self.handshake_refused);
        self.state = HealthMonitor::determine_next_state(self.state, &event);

        match event {
            TransportEvent::Connected => {
                info!("MQTT Connected...");
                self.last_connect_error = None;
                self.session_accepted = false;
                self.handshake_refused = false;
                let handshake = self.options.handshake();
                if let Err(e) = self.transport.send_handshake(&handshake).await {
                    warn!("MQTT handshake not sent: {}", e);
                }
            }
            TransportEvent::ConnectFailed(reason) => {
                if HealthMonitor::should_log_connect_error(
                    self.last_connect_error.as_deref(),
                    &reason,
                ) {
                    warn!("MQTT connect error: {}", reason);
                }
                self.last_connect_error = Some(reason);
            }
            TransportEvent::HandshakeAccepted => {
                self.session_accepted = true;
                info!("MQTT Connection established.");
            }
            TransportEvent::HandshakeRejected(code) => {
                self.handshake_refused = true;
                error!("MQTT Connection error: {}", code);
            }
            TransportEvent::Acknowledged(message_id) => {
                let known = self
                    .registry
                    .as_mut()
                    .is_some_and(|registry| registry.acknowledge(message_id));
                if !known {
                    warn!("MQTT Publishing acknowledge for unknown message: {}", message_id);
                }
            }
            TransportEvent::Incoming { topic, payload } => {
                info!(
                    "MQTT Incoming message {}: {}",
                    topic,
                    String::from_utf8_lossy(&payload)
                );
            }
            TransportEvent::Protocol(description) => {
                debug!("MQTT {}", description);
            }
            TransportEvent::Closed(reason) => {
                let reason = reason.as_deref().unwrap_or("closed by peer");
                if self.session_accepted {
                    warn!("MQTT connection lost: {}", reason);
                } else {
                    warn!("MQTT Connection failed: {}", reason);
                }
                self.session_accepted = false;
            }
        }

        if let Some(delay) = reconnect {
            self.transport.open(delay);
        }
    }

    /// Publish `payload` on `topic` and return the message id it was given.
    ///
    /// With QoS > 0 the publish is tracked until acknowledged, even when the
    /// session is down; the next sweep after reconnecting resends it.
    ///
    /// A publish that can never be framed, or that finds every message id
    /// still awaiting acknowledgment, is dropped and neither tracked nor sent.
    pub async fn publish(&mut self, topic: &str, payload: &str) -> Result<u16, MqttError> {
        let qos = self.options.wire_qos();
        if let Err(e) = check_publish_len(topic, payload, qos) {
            warn!("MQTT publish to {} dropped: {}", topic, e);
            return Err(e);
        }
        let message_id = match self.allocate_message_id() {
            Ok(message_id) => message_id,
            Err(e) => {
                warn!("MQTT publish to {} dropped: {}", topic, e);
                return Err(e);
            }
        };

        if let Some(registry) = self.registry.as_mut() {
            registry.add(topic, message_id, payload);
        }

        if HealthMonitor::can_publish(self.state) {
            let publish = OutgoingPublish {
                topic,
                payload,
                message_id,
                qos,
                retain: self.options.retain,
                dup: false,
            };
            if let Err(e) = self.transport.send_publish(publish).await {
                warn!("MQTT publish {} failed: {}", message_id, e);
            }
        } else {
            debug!("MQTT not connected, publish {} to {} not sent", message_id, topic);
        }

        Ok(message_id)
    }

    /// Resend every tracked publish whose deadline has passed.
    ///
    /// Nothing is swept while the session is down, and an entry's retry count
    /// and deadline only move once its resend was handed to the transport.
    /// The pass stops at the first failed send. Returns how many publishes
    /// were resent.
    pub async fn resend_expired(&mut self, now: Instant) -> usize {
        if !HealthMonitor::can_publish(self.state) {
            return 0;
        }
        let Some(registry) = self.registry.as_mut() else {
            return 0;
        };

        let qos = self.options.wire_qos();
        let retain = self.options.retain;
        let mut resent = 0;
        for message_id in registry.due(now) {
            let Some(entry) = registry.get(message_id) else {
                continue;
            };
            let publish = OutgoingPublish {
                topic: &entry.topic,
                payload: &entry.payload,
                message_id,
                qos,
                retain,
                dup: true,
            };
            if let Err(e) = self.transport.send_publish(publish).await {
                warn!("MQTT resend {} failed: {}", message_id, e);
                break;
            }
            if let Some(entry) = registry.mark_resent(message_id, now) {
                info!("MQTT resending ({}): {}", entry.retry_count, message_id);
            }
            resent += 1;
        }
        resent
    }

    /// Period of the resend timer, `None` when QoS 0 needs no timer
    pub fn resend_interval(&self) -> Option<Duration> {
        self.registry.as_ref().map(|_| RESEND_CHECK_INTERVAL)
    }

    /// Close the session without flushing anything still in flight
    pub fn shutdown(&mut self) {
        if let Some(registry) = self.registry.as_mut() {
            if !registry.is_empty() {
                warn!("MQTT shutting down with {} unacknowledged publishes", registry.len());
            }
            registry.clear();
        }
        self.transport.close();
        self.state = ConnectionState::Disconnected;
        self.session_accepted = false;
        info!("MQTT disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn in_flight(&self) -> Option<&InFlightRegistry> {
        self.registry.as_ref()
    }

    /// Number of unacknowledged publishes, 0 for QoS 0
    pub fn in_flight_len(&self) -> usize {
        self.registry.as_ref().map_or(0, InFlightRegistry::len)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // 16-bit counter that wraps, never hands out 0 and skips ids still in flight
    fn allocate_message_id(&mut self) -> Result<u16, MqttError> {
        let pending = self.registry.as_ref();
        if pending.is_some_and(|registry| registry.len() >= usize::from(u16::MAX)) {
            return Err(MqttError::MessageIdsExhausted);
        }
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if !pending.is_some_and(|registry| registry.contains(self.next_id)) {
                return Ok(self.next_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockTransport, SentPacket};
    use crate::transport::mqtt::connection::BrokerAddress;
    use crate::transport::mqtt::health_monitor::RECONNECT_DELAY;
    use crate::transport::mqtt::inflight::RESEND_INTERVAL;

    fn options(qos: u8) -> ConnectionOptions {
        let mut options = ConnectionOptions::new(BrokerAddress::new("localhost", 1883), "rtl_433-test");
        options.qos = qos;
        options
    }

    async fn connected_client(
        qos: u8,
    ) -> (MqttClient<MockTransport>, crate::testing::mocks::MockHandle) {
        let (transport, handle) = MockTransport::new();
        let mut client = MqttClient::new(transport, options(qos));
        client.start();
        client.handle_event(TransportEvent::Connected).await;
        client.handle_event(TransportEvent::HandshakeAccepted).await;
        (client, handle)
    }

    #[tokio::test]
    async fn test_start_opens_immediately() {
        let (transport, handle) = MockTransport::new();
        let mut client = MqttClient::new(transport, options(1));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.start();
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(handle.opens().await, vec![Duration::ZERO]);
    }

    #[tokio::test]
    async fn test_connected_sends_handshake_and_waits_for_connack() {
        let (transport, handle) = MockTransport::new();
        let mut client = MqttClient::new(transport, options(1));
        client.start();

        client.handle_event(TransportEvent::Connected).await;
        assert_eq!(client.state(), ConnectionState::Connecting);
        let sent = handle.sent().await;
        assert!(matches!(&sent[..], [SentPacket::Handshake(h)] if h.client_id == "rtl_433-test"));

        client.handle_event(TransportEvent::HandshakeAccepted).await;
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_message_ids_wrap_and_skip_zero() {
        let (mut client, _handle) = connected_client(0).await;
        client.next_id = u16::MAX - 1;
        assert_eq!(client.publish("t", "a").await.unwrap(), u16::MAX);
        assert_eq!(client.publish("t", "b").await.unwrap(), 1);
        assert_eq!(client.publish("t", "c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_wrapped_ids_skip_unacknowledged_publish() {
        let (mut client, _handle) = connected_client(1).await;
        let first = client.publish("first/topic", "precious").await.unwrap();
        assert_eq!(first, 1);

        for _ in 0..3 {
            let id = client.publish("t", "p").await.unwrap();
            client.handle_event(TransportEvent::Acknowledged(id)).await;
        }
        client.next_id = u16::MAX - 1;
        let id = client.publish("t", "p").await.unwrap();
        assert_eq!(id, u16::MAX);
        client.handle_event(TransportEvent::Acknowledged(id)).await;

        // 1 is still pending, so the counter moves past it
        assert_eq!(client.publish("t", "p").await.unwrap(), 2);
        assert_eq!(client.in_flight_len(), 2);
        let kept = client.in_flight().unwrap().get(1).unwrap();
        assert_eq!(kept.topic, "first/topic");
        assert_eq!(kept.payload, "precious");
    }

    #[tokio::test]
    async fn test_oversized_publish_is_dropped() {
        let (mut client, handle) = connected_client(1).await;
        let big = "x".repeat(300 * 1024);

        let err = client.publish("rtl_433/h/states", &big).await.unwrap_err();
        assert!(matches!(err, MqttError::PacketTooLarge { .. }));
        assert_eq!(client.in_flight_len(), 0);
        assert!(handle.publishes().await.is_empty());

        // Later publishes are unaffected and the dropped one used no id
        assert_eq!(client.publish("t", "small").await.unwrap(), 1);
        assert_eq!(client.in_flight_len(), 1);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_qos0_has_no_registry_or_timer() {
        let (mut client, handle) = connected_client(0).await;
        assert!(client.in_flight().is_none());
        assert_eq!(client.resend_interval(), None);

        client.publish("rtl_433/h/events", "{}").await.unwrap();
        assert_eq!(client.in_flight_len(), 0);
        let publishes = handle.publishes().await;
        assert!(matches!(&publishes[..], [SentPacket::Publish { qos: 0, dup: false, .. }]));
    }

    #[tokio::test]
    async fn test_qos1_publish_is_tracked_until_acknowledged() {
        let (mut client, _handle) = connected_client(1).await;
        assert_eq!(client.resend_interval(), Some(RESEND_CHECK_INTERVAL));

        let id = client.publish("t", "p").await.unwrap();
        assert_eq!(client.in_flight_len(), 1);

        client.handle_event(TransportEvent::Acknowledged(id)).await;
        assert_eq!(client.in_flight_len(), 0);

        // Unknown ids are logged and ignored
        client.handle_event(TransportEvent::Acknowledged(999)).await;
        assert_eq!(client.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_qos2_is_served_as_qos1() {
        let (mut client, handle) = connected_client(2).await;
        client.publish("t", "p").await.unwrap();
        let publishes = handle.publishes().await;
        assert!(matches!(&publishes[..], [SentPacket::Publish { qos: 1, .. }]));
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_only_tracked() {
        let (transport, handle) = MockTransport::new();
        let mut client = MqttClient::new(transport, options(1));
        client.start();

        client.publish("t", "p").await.unwrap();
        assert!(handle.publishes().await.is_empty());
        assert_eq!(client.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_skipped_while_not_connected() {
        let (transport, _handle) = MockTransport::new();
        let mut client = MqttClient::new(transport, options(1));
        client.start();
        client.publish("t", "p").await.unwrap();

        let later = Instant::now() + RESEND_INTERVAL * 3;
        assert_eq!(client.resend_expired(later).await, 0);
        let entry = client.in_flight().unwrap().iter().next().unwrap();
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn test_resend_sets_dup() {
        let (mut client, handle) = connected_client(1).await;
        let id = client.publish("t", "p").await.unwrap();

        let later = Instant::now() + RESEND_INTERVAL;
        assert_eq!(client.resend_expired(later).await, 1);

        let publishes = handle.publishes().await;
        assert_eq!(publishes.len(), 2);
        assert!(matches!(
            &publishes[1],
            SentPacket::Publish { message_id, dup: true, .. } if *message_id == id
        ));
    }

    #[tokio::test]
    async fn test_failed_resend_leaves_retry_counts() {
        let (mut client, handle) = connected_client(1).await;
        for topic in ["a", "b", "c"] {
            client.publish(topic, "p").await.unwrap();
        }
        handle.clear_history().await;

        let later = Instant::now() + RESEND_INTERVAL;
        client.transport_mut().should_fail = true;
        assert_eq!(client.resend_expired(later).await, 0);
        let counts: Vec<u32> = client.in_flight().unwrap().iter().map(|e| e.retry_count).collect();
        assert_eq!(counts, vec![0, 0, 0]);

        client.transport_mut().should_fail = false;
        assert_eq!(client.resend_expired(later).await, 3);
        let counts: Vec<u32> = client.in_flight().unwrap().iter().map(|e| e.retry_count).collect();
        assert_eq!(counts, vec![1, 1, 1]);
        assert_eq!(handle.publishes().await.len(), 3);
    }

    #[tokio::test]
    async fn test_close_after_session_reconnects_immediately() {
        let (mut client, handle) = connected_client(1).await;
        handle.clear_history().await;

        client.handle_event(TransportEvent::Closed(None)).await;
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert_eq!(handle.opens().await, vec![Duration::ZERO]);
    }

    #[tokio::test]
    async fn test_failed_connects_use_fixed_cadence() {
        let (transport, handle) = MockTransport::new();
        let mut client = MqttClient::new(transport, options(0));
        client.start();
        handle.clear_history().await;

        for _ in 0..3 {
            client
                .handle_event(TransportEvent::ConnectFailed("refused".to_string()))
                .await;
        }
        assert_eq!(handle.opens().await, vec![RECONNECT_DELAY; 3]);
        assert_eq!(client.last_connect_error.as_deref(), Some("refused"));

        client.handle_event(TransportEvent::Connected).await;
        assert_eq!(client.last_connect_error, None);
    }

    #[tokio::test]
    async fn test_rejected_handshake_delays_reconnect() {
        let (transport, handle) = MockTransport::new();
        let mut client = MqttClient::new(transport, options(1));
        client.start();
        client.handle_event(TransportEvent::Connected).await;
        handle.clear_history().await;

        client.handle_event(TransportEvent::HandshakeRejected(5)).await;
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert!(handle.opens().await.is_empty());

        client.handle_event(TransportEvent::Closed(None)).await;
        assert_eq!(handle.opens().await, vec![RECONNECT_DELAY]);
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry_and_closes() {
        let (mut client, handle) = connected_client(1).await;
        client.publish("a", "1").await.unwrap();
        client.publish("b", "2").await.unwrap();

        client.shutdown();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.in_flight_len(), 0);
        assert_eq!(handle.closes().await, 1);

        // Late events do not revive the session
        handle.clear_history().await;
        client.handle_event(TransportEvent::Closed(None)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(handle.opens().await.is_empty());
    }
}
