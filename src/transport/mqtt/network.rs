//! TCP/TLS transport speaking MQTT 3.1.1
//!
//! Packets are framed with the rumqttc v4 codec over a plain tokio socket, so
//! message ids, resends and reconnects stay under the client's control.

use super::connection::{
    check_publish_len, BrokerAddress, ConnectionOptions, MqttError, KEEP_ALIVE, MAX_PACKET_SIZE,
};
use super::message_handler::MessageHandler;
use super::tls::{self, TlsSettings};
use crate::transport::{Handshake, OutgoingPublish, Transport, TransportEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rumqttc::mqttbytes::v4::{Codec, Connect, Packet, Publish};
use rumqttc::mqttbytes::QoS;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> BrokerStream for S {}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Box<dyn BrokerStream>, MqttError>> + Send>>;

enum Link {
    Idle,
    Connecting(ConnectFuture),
    Open(Framed<Box<dyn BrokerStream>, Codec>),
}

impl Link {
    fn describe(&self) -> &'static str {
        match self {
            Link::Idle => "idle",
            Link::Connecting(_) => "connecting",
            Link::Open(_) => "open",
        }
    }
}

/// Network-backed [`Transport`] for one broker address
pub struct NetworkTransport {
    address: BrokerAddress,
    tls: Option<TlsSettings>,
    link: Link,
    /// Set when a send fails; reported as `Closed` on the next poll
    pending_close: Option<String>,
    last_sent: Instant,
    keep_alive: Duration,
    /// CONNECT is out and the broker must answer by then
    connack_due: Option<Instant>,
    /// PINGREQ is out and the broker must answer by then
    pingresp_due: Option<Instant>,
}

impl NetworkTransport {
    /// Prepare a transport for `options`. TLS material is loaded here, so a
    /// bad certificate path fails at startup instead of on every reconnect.
    pub fn new(options: &ConnectionOptions) -> Result<Self, MqttError> {
        let tls = options
            .tls
            .as_ref()
            .map(|tls_options| tls::build(tls_options, &options.address.host))
            .transpose()?;

        Ok(Self {
            address: options.address.clone(),
            tls,
            link: Link::Idle,
            pending_close: None,
            last_sent: Instant::now(),
            keep_alive: KEEP_ALIVE,
            connack_due: None,
            pingresp_due: None,
        })
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    fn reset_link(&mut self, link: Link) {
        self.link = link;
        self.connack_due = None;
        self.pingresp_due = None;
    }

    async fn send(&mut self, packet: Packet) -> Result<(), MqttError> {
        let framed = match &mut self.link {
            Link::Open(framed) => framed,
            other => return Err(MqttError::NotConnected(other.describe())),
        };

        match framed.send(packet).await {
            Ok(()) => {
                self.last_sent = Instant::now();
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.pending_close = Some(reason.clone());
                Err(MqttError::Protocol(reason))
            }
        }
    }
}

async fn dial(
    address: BrokerAddress,
    tls: Option<TlsSettings>,
    delay: Duration,
) -> Result<Box<dyn BrokerStream>, MqttError> {
    if !delay.is_zero() {
        sleep(delay).await;
    }

    let tcp = TcpStream::connect((address.host.as_str(), address.port)).await?;
    tcp.set_nodelay(true)?;

    let stream: Box<dyn BrokerStream> = match tls {
        Some(tls) => Box::new(tls.connector.connect(tls.server_name, tcp).await?),
        None => Box::new(tcp),
    };
    Ok(stream)
}

#[async_trait]
impl Transport for NetworkTransport {
    type Error = MqttError;

    fn open(&mut self, delay: Duration) {
        debug!(address = %self.address, ?delay, "MQTT opening connection");
        self.pending_close = None;
        let connect = dial(self.address.clone(), self.tls.clone(), delay);
        self.reset_link(Link::Connecting(Box::pin(connect)));
    }

    async fn next_event(&mut self) -> TransportEvent {
        if let Some(reason) = self.pending_close.take() {
            self.reset_link(Link::Idle);
            return TransportEvent::Closed(Some(reason));
        }

        match &mut self.link {
            Link::Idle => std::future::pending().await,
            Link::Connecting(connect) => match connect.await {
                Ok(stream) => {
                    let codec = Codec {
                        max_incoming_size: MAX_PACKET_SIZE,
                        max_outgoing_size: MAX_PACKET_SIZE,
                    };
                    self.reset_link(Link::Open(Framed::new(stream, codec)));
                    self.last_sent = Instant::now();
                    TransportEvent::Connected
                }
                Err(e) => {
                    self.reset_link(Link::Idle);
                    TransportEvent::ConnectFailed(e.to_string())
                }
            },
            Link::Open(framed) => {
                let outcome = loop {
                    // An unanswered CONNECT or PINGREQ ends the link when it
                    // comes due; otherwise the timer is the next ping.
                    let (wake_at, overdue) = match (self.connack_due, self.pingresp_due) {
                        (Some(due), _) => (due, Some("no CONNACK within keep-alive")),
                        (None, Some(due)) => (due, Some("no PINGRESP within keep-alive")),
                        (None, None) => (self.last_sent + self.keep_alive, None),
                    };
                    tokio::select! {
                        frame = framed.next() => match frame {
                            Some(Ok(packet)) => {
                                match &packet {
                                    Packet::ConnAck(_) => self.connack_due = None,
                                    Packet::PingResp => self.pingresp_due = None,
                                    _ => {}
                                }
                                if let Some(event) = MessageHandler::route_packet(packet) {
                                    break event;
                                }
                            }
                            Some(Err(e)) => break TransportEvent::Closed(Some(e.to_string())),
                            None => break TransportEvent::Closed(None),
                        },
                        _ = sleep_until(wake_at) => {
                            if let Some(reason) = overdue {
                                break TransportEvent::Closed(Some(reason.to_string()));
                            }
                            trace!("MQTT sending PINGREQ");
                            if let Err(e) = framed.send(Packet::PingReq).await {
                                break TransportEvent::Closed(Some(e.to_string()));
                            }
                            self.last_sent = Instant::now();
                            self.pingresp_due = Some(self.last_sent + self.keep_alive);
                        }
                    }
                };

                if matches!(outcome, TransportEvent::Closed(_)) {
                    self.reset_link(Link::Idle);
                }
                outcome
            }
        }
    }

    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), MqttError> {
        let mut connect = Connect::new(handshake.client_id.as_str());
        connect.keep_alive = u16::try_from(handshake.keep_alive.as_secs()).unwrap_or(u16::MAX);
        connect.clean_session = true;
        if let Some(username) = &handshake.username {
            connect.set_login(
                username.as_str(),
                handshake.password.as_deref().unwrap_or_default(),
            );
        }
        self.send(Packet::Connect(connect)).await?;
        self.connack_due = Some(self.last_sent + self.keep_alive);
        Ok(())
    }

    /// An oversized publish fails on its own and leaves the link up
    async fn send_publish(&mut self, publish: OutgoingPublish<'_>) -> Result<(), MqttError> {
        check_publish_len(publish.topic, publish.payload, publish.qos)?;
        let qos = if publish.qos == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        };
        let mut packet = Publish::new(publish.topic, qos, publish.payload.as_bytes());
        if qos != QoS::AtMostOnce {
            packet.pkid = publish.message_id;
        }
        packet.retain = publish.retain;
        packet.dup = publish.dup;
        self.send(Packet::Publish(packet)).await
    }

    fn close(&mut self) {
        if !matches!(self.link, Link::Idle) {
            debug!(address = %self.address, "MQTT closing connection");
        }
        self.reset_link(Link::Idle);
        self.pending_close = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn options_for(port: u16) -> ConnectionOptions {
        ConnectionOptions::new(BrokerAddress::new("127.0.0.1", port), "rtl_433-test")
    }

    #[tokio::test]
    async fn test_send_without_link_fails() {
        let mut transport = NetworkTransport::new(&options_for(1883)).unwrap();
        let handshake = options_for(1883).handshake();
        let err = transport.send_handshake(&handshake).await.unwrap_err();
        assert!(matches!(err, MqttError::NotConnected("idle")));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_failure() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = NetworkTransport::new(&options_for(port)).unwrap();
        transport.open(Duration::ZERO);
        assert!(matches!(
            transport.next_event().await,
            TransportEvent::ConnectFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_handshake_and_connack_against_local_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            // CONNECT fixed header
            assert_eq!(buf[0], 0x10);
            let mut rest = vec![0u8; buf[1] as usize];
            socket.read_exact(&mut rest).await.unwrap();
            // CONNACK, session accepted
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            // PUBACK for message id 7
            socket.write_all(&[0x40, 0x02, 0x00, 0x07]).await.unwrap();
            socket
        });

        let options = options_for(port);
        let mut transport = NetworkTransport::new(&options).unwrap();
        transport.open(Duration::ZERO);
        assert_eq!(transport.next_event().await, TransportEvent::Connected);

        transport.send_handshake(&options.handshake()).await.unwrap();
        assert_eq!(
            transport.next_event().await,
            TransportEvent::HandshakeAccepted
        );
        assert_eq!(
            transport.next_event().await,
            TransportEvent::Acknowledged(7)
        );

        let socket = broker.await.unwrap();
        drop(socket);
        assert!(matches!(
            transport.next_event().await,
            TransportEvent::Closed(_)
        ));
    }

    // Accepts one client, reads its CONNECT and optionally accepts the session
    async fn accept_session(listener: TcpListener, connack: bool) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x10);
        let mut rest = vec![0u8; buf[1] as usize];
        socket.read_exact(&mut rest).await.unwrap();
        if connack {
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        }
        socket
    }

    async fn connect_with_keep_alive(
        port: u16,
        keep_alive: Duration,
    ) -> (NetworkTransport, ConnectionOptions) {
        let options = options_for(port);
        let mut transport = NetworkTransport::new(&options).unwrap();
        transport.keep_alive = keep_alive;
        transport.open(Duration::ZERO);
        assert_eq!(transport.next_event().await, TransportEvent::Connected);
        transport.send_handshake(&options.handshake()).await.unwrap();
        (transport, options)
    }

    #[tokio::test]
    async fn test_oversized_publish_fails_without_closing_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let mut socket = accept_session(listener, true).await;
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            // PUBLISH, QoS 1
            assert_eq!(buf[0], 0x32);
            let mut rest = vec![0u8; buf[1] as usize];
            socket.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..3], &[0x00, 0x01, b't']);
            socket.write_all(&[0x40, 0x02, 0x00, 0x09]).await.unwrap();
            socket
        });

        let (mut transport, _) = connect_with_keep_alive(port, KEEP_ALIVE).await;
        assert_eq!(transport.next_event().await, TransportEvent::HandshakeAccepted);

        let big = "x".repeat(300 * 1024);
        let oversized = OutgoingPublish {
            topic: "t",
            payload: &big,
            message_id: 8,
            qos: 1,
            retain: false,
            dup: false,
        };
        assert!(matches!(
            transport.send_publish(oversized).await,
            Err(MqttError::PacketTooLarge { .. })
        ));

        let small = OutgoingPublish {
            topic: "t",
            payload: "small",
            message_id: 9,
            qos: 1,
            retain: false,
            dup: false,
        };
        transport.send_publish(small).await.unwrap();
        assert_eq!(transport.next_event().await, TransportEvent::Acknowledged(9));

        let _socket = broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_connack_closes_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(accept_session(listener, false));

        let (mut transport, _) = connect_with_keep_alive(port, Duration::from_millis(200)).await;
        match transport.next_event().await {
            TransportEvent::Closed(Some(reason)) => assert!(reason.contains("CONNACK")),
            other => panic!("expected close, got {other:?}"),
        }

        let _socket = broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_pingresp_closes_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let mut socket = accept_session(listener, true).await;
            let mut ping = [0u8; 2];
            socket.read_exact(&mut ping).await.unwrap();
            (socket, ping)
        });

        let (mut transport, _) = connect_with_keep_alive(port, Duration::from_millis(200)).await;
        assert_eq!(transport.next_event().await, TransportEvent::HandshakeAccepted);
        match transport.next_event().await {
            TransportEvent::Closed(Some(reason)) => assert!(reason.contains("PINGRESP")),
            other => panic!("expected close, got {other:?}"),
        }

        let (_socket, ping) = broker.await.unwrap();
        assert_eq!(ping, [0xC0, 0x00]);
    }

    #[tokio::test]
    async fn test_answered_pings_keep_link_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let mut socket = accept_session(listener, true).await;
            let mut ping = [0u8; 2];
            loop {
                if socket.read_exact(&mut ping).await.is_err() {
                    break;
                }
                assert_eq!(ping, [0xC0, 0x00]);
                if socket.write_all(&[0xD0, 0x00]).await.is_err() {
                    break;
                }
            }
        });

        let keep_alive = Duration::from_millis(100);
        let (mut transport, _) = connect_with_keep_alive(port, keep_alive).await;
        assert_eq!(transport.next_event().await, TransportEvent::HandshakeAccepted);

        // Several ping rounds pass without the link reporting anything
        let quiet = tokio::time::timeout(keep_alive * 5, transport.next_event()).await;
        assert!(quiet.is_err());

        transport.close();
        broker.abort();
    }

    #[tokio::test]
    async fn test_close_returns_to_idle() {
        let mut transport = NetworkTransport::new(&options_for(1883)).unwrap();
        transport.open(Duration::from_secs(60));
        transport.close();
        let publish = OutgoingPublish {
            topic: "t",
            payload: "p",
            message_id: 1,
            qos: 1,
            retain: false,
            dup: false,
        };
        assert!(matches!(
            transport.send_publish(publish).await,
            Err(MqttError::NotConnected("idle"))
        ));
    }
}
