//! MQTT client state machine tests
//!
//! The client is driven with scripted transport events from the mock, so the
//! reconnect and resend paths can be walked step by step.

use rtl433_mqtt::testing::mocks::{MockHandle, MockTransport, SentPacket};
use rtl433_mqtt::transport::mqtt::{
    BrokerAddress, ConnectionOptions, ConnectionState, Credentials, MqttClient, RECONNECT_DELAY,
    RESEND_INTERVAL,
};
use rtl433_mqtt::transport::TransportEvent;
use std::time::Duration;
use tokio::time::Instant;

fn client(qos: u8) -> (MqttClient<MockTransport>, MockHandle) {
    let (transport, handle) = MockTransport::new();
    let mut options = ConnectionOptions::new(BrokerAddress::new("broker", 1883), "rtl_433-0000ffff");
    options.qos = qos;
    options.retain = true;
    options.credentials = Some(Credentials {
        username: "user".to_string(),
        password: Some("pass".to_string()),
    });
    (MqttClient::new(transport, options), handle)
}

async fn establish(client: &mut MqttClient<MockTransport>) {
    client.handle_event(TransportEvent::Connected).await;
    client.handle_event(TransportEvent::HandshakeAccepted).await;
}

#[tokio::test]
async fn test_handshake_carries_session_parameters() {
    let (mut client, handle) = client(1);
    client.start();
    client.handle_event(TransportEvent::Connected).await;

    let sent = handle.sent().await;
    let SentPacket::Handshake(handshake) = &sent[0] else {
        panic!("expected handshake, got {sent:?}");
    };
    assert_eq!(handshake.client_id, "rtl_433-0000ffff");
    assert_eq!(handshake.username.as_deref(), Some("user"));
    assert_eq!(handshake.password.as_deref(), Some("pass"));
    assert_eq!(handshake.keep_alive, Duration::from_secs(60));
}

#[tokio::test]
async fn test_publish_flags_follow_options() {
    let (mut client, handle) = client(1);
    client.start();
    establish(&mut client).await;

    let id = client.publish("rtl_433/h/events", "{\"model\":\"X\"}").await.unwrap();
    let publishes = handle.publishes().await;
    assert_eq!(
        publishes,
        vec![SentPacket::Publish {
            topic: "rtl_433/h/events".to_string(),
            payload: "{\"model\":\"X\"}".to_string(),
            message_id: id,
            qos: 1,
            retain: true,
            dup: false,
        }]
    );
}

#[tokio::test]
async fn test_reconnect_resends_publish_made_while_down() {
    let (mut client, handle) = client(1);
    client.start();
    establish(&mut client).await;

    // Link drops; a record arrives while the client is reconnecting
    client.handle_event(TransportEvent::Closed(None)).await;
    assert_eq!(client.state(), ConnectionState::Connecting);
    let id = client.publish("rtl_433/h/events", "{}").await.unwrap();
    assert!(handle.publishes().await.is_empty());

    // Sweeps while down neither send nor count retries
    let start = Instant::now();
    assert_eq!(client.resend_expired(start + RESEND_INTERVAL * 2).await, 0);

    establish(&mut client).await;
    assert_eq!(client.resend_expired(start + RESEND_INTERVAL * 2).await, 1);

    let publishes = handle.publishes().await;
    assert_eq!(publishes.len(), 1);
    assert!(matches!(
        &publishes[0],
        SentPacket::Publish { message_id, dup: true, .. } if *message_id == id
    ));
    let entry = client.in_flight().unwrap().get(id).unwrap();
    assert_eq!(entry.retry_count, 1);

    client.handle_event(TransportEvent::Acknowledged(id)).await;
    assert_eq!(client.in_flight_len(), 0);
}

#[tokio::test]
async fn test_unacknowledged_publish_is_resent_every_interval() {
    let (mut client, handle) = client(1);
    client.start();
    establish(&mut client).await;
    client.publish("t", "p").await.unwrap();

    let mut now = Instant::now();
    for _ in 0..4 {
        now += RESEND_INTERVAL;
        assert_eq!(client.resend_expired(now).await, 1);
    }
    assert_eq!(handle.publishes().await.len(), 5);
    assert_eq!(
        client.in_flight().unwrap().iter().next().unwrap().retry_count,
        4
    );
}

#[tokio::test]
async fn test_reconnect_cadence() {
    let (mut client, handle) = client(0);
    client.start();

    client
        .handle_event(TransportEvent::ConnectFailed("connection refused".to_string()))
        .await;
    establish(&mut client).await;
    client.handle_event(TransportEvent::Closed(Some("reset".to_string()))).await;

    assert_eq!(
        handle.opens().await,
        vec![Duration::ZERO, RECONNECT_DELAY, Duration::ZERO]
    );
}

#[tokio::test]
async fn test_close_before_connack_is_a_failed_attempt() {
    let (mut client, handle) = client(1);
    client.start();
    client.handle_event(TransportEvent::Connected).await;
    client.handle_event(TransportEvent::Closed(None)).await;

    assert_eq!(client.state(), ConnectionState::Connecting);
    assert_eq!(handle.opens().await.len(), 2);
}

#[tokio::test]
async fn test_incoming_and_protocol_events_keep_state() {
    let (mut client, _handle) = client(1);
    client.start();
    establish(&mut client).await;

    client
        .handle_event(TransportEvent::Incoming {
            topic: "rtl_433/cmd".to_string(),
            payload: bytes::Bytes::from_static(b"hello"),
        })
        .await;
    client
        .handle_event(TransportEvent::Protocol("subscription acknowledged".to_string()))
        .await;
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_failed_send_keeps_publish_tracked() {
    let (mut client, _handle) = client(1);
    client.start();
    establish(&mut client).await;

    client.transport_mut().should_fail = true;
    let id = client.publish("t", "p").await.unwrap();
    assert!(client.in_flight().unwrap().get(id).is_some());
}
