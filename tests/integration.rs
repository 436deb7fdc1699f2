//! Integration Tests for the EdgeMQ broker
//!
//! These tests run a broker on a loopback port and drive it with raw MQTT
//! packets, checking the flows a real client would see.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use edgemq::broker::{Broker, BrokerConfig};
use edgemq::codec::{Decoder, Encoder};
use edgemq::config::{
    AclConfig, AclPermissions, AclRole, AuthConfig, Config, PipelineConfig, UserConfig,
};
use edgemq::hooks::{CompositeHooks, Hooks};
use edgemq::pipeline::ThresholdPipeline;
use edgemq::protocol::{
    ConnAck, Connect, Disconnect, Packet, Properties, ProtocolVersion, Publish, QoS, ReasonCode,
    SubAck, Subscribe, Subscription, SubscriptionOptions, Will,
};
use edgemq::{AclProvider, AuthProvider};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Test configuration helper
fn test_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        max_connections: 100,
        max_keep_alive: 300,
        shutdown_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

struct Running {
    broker: Arc<Broker>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.broker.shutdown();
        let _ = timeout(Duration::from_secs(3), self.handle).await;
    }
}

async fn start(config: BrokerConfig) -> Running {
    start_broker(Broker::new(config)).await
}

async fn start_broker(broker: Broker) -> Running {
    let addr = broker.config().bind_addr;
    let broker = Arc::new(broker);
    let runner = broker.clone();
    let handle = tokio::spawn(async move {
        runner.run().await.expect("broker run failed");
    });

    // Give broker time to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    Running {
        broker,
        addr,
        handle,
    }
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
    protocol_version: ProtocolVersion,
    next_packet_id: u16,
}

impl TestClient {
    async fn connect(addr: SocketAddr, version: ProtocolVersion) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(version);
        Self {
            stream,
            encoder: Encoder::new(version),
            decoder,
            buf: BytesMut::with_capacity(4096),
            protocol_version: version,
            next_packet_id: 1,
        }
    }

    /// Connect and complete the CONNECT/CONNACK exchange
    async fn open(addr: SocketAddr, version: ProtocolVersion, client_id: &str) -> Self {
        let mut client = Self::connect(addr, version).await;
        let connack = client.mqtt_connect(client_id).await;
        assert_eq!(connack.reason_code, ReasonCode::Success);
        client
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    /// Next packet, or None on timeout or close
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.buf) {
                self.buf.advance(consumed);
                return Some(packet);
            }
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(3)).await
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    async fn expect_nothing(&mut self) {
        let packet = self.recv_within(Duration::from_millis(300)).await;
        assert!(packet.is_none(), "unexpected packet {:?}", packet);
    }

    fn connect_packet(&self, client_id: &str) -> Connect {
        Connect {
            protocol_version: self.protocol_version,
            client_id: client_id.to_string(),
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
            properties: Properties::default(),
        }
    }

    async fn send_connect(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str) -> ConnAck {
        let connect = self.connect_packet(client_id);
        self.send_connect(connect).await
    }

    async fn subscribe_with(&mut self, filter: &str, options: SubscriptionOptions) -> SubAck {
        let packet_id = self.packet_id();
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                options,
            }],
            properties: Properties::default(),
        });
        self.send(&subscribe).await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => {
                assert_eq!(ack.packet_id, packet_id);
                ack
            }
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> SubAck {
        self.subscribe_with(filter, SubscriptionOptions::with_qos(qos))
            .await
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Option<u16> {
        let packet_id = (qos != QoS::AtMostOnce).then(|| self.packet_id());
        let publish = Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
            properties: Properties::default(),
        });
        self.send(&publish).await;
        packet_id
    }

    async fn disconnect(mut self) {
        self.send(&Packet::Disconnect(Disconnect::new(ReasonCode::Success)))
            .await;
        // Wait for the broker to close its side
        let _ = self.recv_within(Duration::from_secs(1)).await;
    }

    fn packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

#[tokio::test]
async fn test_connect_v311_success() {
    let running = start(test_config(next_port())).await;

    let mut client = TestClient::connect(running.addr, ProtocolVersion::V311).await;
    let connack = client.mqtt_connect("test-client").await;
    assert_eq!(connack.reason_code, ReasonCode::Success);
    assert!(!connack.session_present);

    running.stop().await;
}

#[tokio::test]
async fn test_connect_v5_advertises_features() {
    let mut config = test_config(next_port());
    config.wildcard_subscription_available = false;
    config.max_packet_size = 4096;
    let running = start(config).await;

    let mut client = TestClient::connect(running.addr, ProtocolVersion::V5).await;
    let connack = client.mqtt_connect("features").await;
    assert_eq!(connack.reason_code, ReasonCode::Success);
    assert!(!connack.session_present);

    let props = &connack.properties;
    assert_eq!(props.maximum_qos, Some(1));
    assert_eq!(props.wildcard_subscription_available, Some(0));
    assert_eq!(props.shared_subscription_available, Some(0));
    assert_eq!(props.maximum_packet_size, Some(4096));
    assert_eq!(props.assigned_client_identifier, None);

    let suback = client.subscribe("a/+", QoS::AtMostOnce).await;
    assert_eq!(
        suback.reason_codes,
        vec![ReasonCode::WildcardSubsNotSupported]
    );

    running.stop().await;
}

#[tokio::test]
async fn test_empty_client_id_is_assigned() {
    let running = start(test_config(next_port())).await;

    let mut client = TestClient::connect(running.addr, ProtocolVersion::V5).await;
    let connack = client.mqtt_connect("").await;
    assert_eq!(connack.reason_code, ReasonCode::Success);
    let assigned = connack
        .properties
        .assigned_client_identifier
        .expect("assigned client id");
    assert!(assigned.starts_with("edgemq-"));

    running.stop().await;
}

#[tokio::test]
async fn test_ping() {
    let running = start(test_config(next_port())).await;

    let mut client = TestClient::open(running.addr, ProtocolVersion::V311, "pinger").await;
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));

    running.stop().await;
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = test_config(next_port());
    config.max_connections = 1;
    let running = start(config).await;

    let _first = TestClient::open(running.addr, ProtocolVersion::V5, "first").await;
    let mut second = TestClient::connect(running.addr, ProtocolVersion::V5).await;
    let connack = second.mqtt_connect("second").await;
    assert_eq!(connack.reason_code, ReasonCode::ServerUnavailable);

    running.stop().await;
}

// ============================================================================
// PUBLISH / SUBSCRIBE
// ============================================================================

#[tokio::test]
async fn test_publish_subscribe_fifo() {
    let running = start(test_config(next_port())).await;

    let mut sub = TestClient::open(running.addr, ProtocolVersion::V311, "sub").await;
    let suback = sub.subscribe("sensors/+/temp", QoS::AtLeastOnce).await;
    assert_eq!(suback.reason_codes, vec![ReasonCode::GrantedQoS1]);

    let mut publisher = TestClient::open(running.addr, ProtocolVersion::V311, "pub").await;
    for i in 0..20 {
        publisher
            .publish("sensors/kitchen/temp", format!("{}", i).as_bytes(), QoS::AtMostOnce, false)
            .await;
    }

    for i in 0..20 {
        let publish = sub.expect_publish().await;
        assert_eq!(&*publish.topic, "sensors/kitchen/temp");
        assert_eq!(publish.payload, Bytes::from(format!("{}", i)));
        assert_eq!(publish.qos, QoS::AtMostOnce);
        assert!(!publish.retain);
    }

    running.stop().await;
}

#[tokio::test]
async fn test_qos1_puback_and_delivery() {
    let running = start(test_config(next_port())).await;

    let mut sub = TestClient::open(running.addr, ProtocolVersion::V5, "sub").await;
    sub.subscribe("q/1", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::open(running.addr, ProtocolVersion::V5, "pub").await;
    let packet_id = publisher
        .publish("q/1", b"hello", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    match publisher.recv().await {
        Some(Packet::PubAck(ack)) => {
            assert_eq!(ack.packet_id, packet_id);
            assert_eq!(ack.reason_code, ReasonCode::Success);
        }
        other => panic!("Expected PUBACK, got {:?}", other),
    }

    let publish = sub.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(publish.packet_id.is_some());
    assert_eq!(publish.payload, Bytes::from_static(b"hello"));

    running.stop().await;
}

#[tokio::test]
async fn test_publish_with_no_subscribers() {
    let running = start(test_config(next_port())).await;

    let mut publisher = TestClient::open(running.addr, ProtocolVersion::V5, "lonely").await;
    let packet_id = publisher
        .publish("nobody/listens", b"x", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    match publisher.recv().await {
        Some(Packet::PubAck(ack)) => {
            assert_eq!(ack.packet_id, packet_id);
            assert_eq!(ack.reason_code, ReasonCode::NoMatchingSubscribers);
        }
        other => panic!("Expected PUBACK, got {:?}", other),
    }
    assert_eq!(running.broker.retained_count(), 0);

    running.stop().await;
}

#[tokio::test]
async fn test_qos2_publish_is_rejected() {
    let running = start(test_config(next_port())).await;

    let mut publisher = TestClient::open(running.addr, ProtocolVersion::V5, "qos2").await;
    publisher
        .publish("a/b", b"x", QoS::ExactlyOnce, false)
        .await;
    match publisher.recv().await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::QoSNotSupported);
        }
        other => panic!("Expected DISCONNECT, got {:?}", other),
    }

    running.stop().await;
}

#[tokio::test]
async fn test_subscribe_qos2_is_downgraded() {
    let running = start(test_config(next_port())).await;

    let mut sub = TestClient::open(running.addr, ProtocolVersion::V311, "sub").await;
    let suback = sub.subscribe("a/b", QoS::ExactlyOnce).await;
    assert_eq!(suback.reason_codes, vec![ReasonCode::GrantedQoS1]);

    running.stop().await;
}

#[tokio::test]
async fn test_no_local() {
    let running = start(test_config(next_port())).await;

    let mut client = TestClient::open(running.addr, ProtocolVersion::V5, "echo").await;
    let options = SubscriptionOptions {
        no_local: true,
        ..SubscriptionOptions::with_qos(QoS::AtMostOnce)
    };
    client.subscribe_with("chat", options).await;
    client.publish("chat", b"me", QoS::AtMostOnce, false).await;
    client.expect_nothing().await;

    running.stop().await;
}

// ============================================================================
// Retained messages
// ============================================================================

#[tokio::test]
async fn test_retained_replacement_and_clearing() {
    let running = start(test_config(next_port())).await;

    let mut publisher = TestClient::open(running.addr, ProtocolVersion::V311, "pub").await;
    publisher.publish("status/door", b"open", QoS::AtMostOnce, true).await;
    publisher.publish("status/door", b"closed", QoS::AtMostOnce, true).await;
    settle().await;
    assert_eq!(running.broker.retained_count(), 1);

    let mut late = TestClient::open(running.addr, ProtocolVersion::V311, "late").await;
    late.subscribe("status/#", QoS::AtMostOnce).await;
    let publish = late.expect_publish().await;
    assert_eq!(&*publish.topic, "status/door");
    assert_eq!(publish.payload, Bytes::from_static(b"closed"));
    assert!(publish.retain);
    late.expect_nothing().await;

    // Empty retained payload clears the topic
    publisher.publish("status/door", b"", QoS::AtMostOnce, true).await;
    let cleared = late.expect_publish().await;
    assert!(cleared.payload.is_empty());
    settle().await;
    assert_eq!(running.broker.retained_count(), 0);

    let mut later = TestClient::open(running.addr, ProtocolVersion::V311, "later").await;
    later.subscribe("status/#", QoS::AtMostOnce).await;
    later.expect_nothing().await;

    running.stop().await;
}

#[tokio::test]
async fn test_retained_delivered_before_live() {
    let running = start(test_config(next_port())).await;

    let mut publisher = TestClient::open(running.addr, ProtocolVersion::V311, "pub").await;
    publisher.publish("feed", b"retained", QoS::AtMostOnce, true).await;
    settle().await;

    let mut sub = TestClient::open(running.addr, ProtocolVersion::V311, "sub").await;
    sub.subscribe("feed", QoS::AtMostOnce).await;
    publisher.publish("feed", b"live", QoS::AtMostOnce, false).await;

    let first = sub.expect_publish().await;
    assert_eq!(first.payload, Bytes::from_static(b"retained"));
    assert!(first.retain);
    let second = sub.expect_publish().await;
    assert_eq!(second.payload, Bytes::from_static(b"live"));
    assert!(!second.retain);

    running.stop().await;
}

#[tokio::test]
async fn test_retain_not_available() {
    let mut config = test_config(next_port());
    config.retain_available = false;
    let running = start(config).await;

    let mut publisher = TestClient::open(running.addr, ProtocolVersion::V5, "pub").await;
    publisher.publish("a", b"x", QoS::AtMostOnce, true).await;
    match publisher.recv().await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::RetainNotSupported);
        }
        other => panic!("Expected DISCONNECT, got {:?}", other),
    }
    assert_eq!(running.broker.retained_count(), 0);

    running.stop().await;
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_disconnect_removes_subscriptions() {
    let running = start(test_config(next_port())).await;

    let mut sub = TestClient::open(running.addr, ProtocolVersion::V311, "sub").await;
    sub.subscribe("a/#", QoS::AtMostOnce).await;
    sub.subscribe("b", QoS::AtLeastOnce).await;
    assert_eq!(running.broker.subscription_count(), 2);
    assert_eq!(running.broker.connection_count(), 1);

    sub.disconnect().await;
    settle().await;
    assert_eq!(running.broker.subscription_count(), 0);
    assert_eq!(running.broker.connection_count(), 0);

    running.stop().await;
}

#[tokio::test]
async fn test_unsubscribe() {
    let running = start(test_config(next_port())).await;

    let mut sub = TestClient::open(running.addr, ProtocolVersion::V5, "sub").await;
    sub.subscribe("a", QoS::AtMostOnce).await;
    sub.send(&Packet::Unsubscribe(edgemq::protocol::Unsubscribe {
        packet_id: 9,
        filters: vec!["a".to_string(), "b".to_string()],
        properties: Properties::default(),
    }))
    .await;
    match sub.recv().await {
        Some(Packet::UnsubAck(ack)) => {
            assert_eq!(ack.packet_id, 9);
            assert_eq!(
                ack.reason_codes,
                vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted]
            );
        }
        other => panic!("Expected UNSUBACK, got {:?}", other),
    }
    assert_eq!(running.broker.subscription_count(), 0);

    running.stop().await;
}

#[tokio::test]
async fn test_session_takeover() {
    let running = start(test_config(next_port())).await;

    let mut first = TestClient::open(running.addr, ProtocolVersion::V5, "device").await;
    first.subscribe("old/topic", QoS::AtMostOnce).await;

    let _second = TestClient::open(running.addr, ProtocolVersion::V5, "device").await;
    match first.recv().await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::SessionTakenOver);
        }
        other => panic!("Expected DISCONNECT, got {:?}", other),
    }
    settle().await;
    assert_eq!(running.broker.connection_count(), 1);
    assert_eq!(running.broker.subscription_count(), 0);

    running.stop().await;
}

#[tokio::test]
async fn test_will_published_on_abrupt_close() {
    let running = start(test_config(next_port())).await;

    let mut watcher = TestClient::open(running.addr, ProtocolVersion::V311, "watcher").await;
    watcher.subscribe("clients/+/status", QoS::AtMostOnce).await;

    let mut doomed = TestClient::connect(running.addr, ProtocolVersion::V311).await;
    let mut connect = doomed.connect_packet("doomed");
    connect.will = Some(Will {
        topic: "clients/doomed/status".to_string(),
        payload: Bytes::from_static(b"offline"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    assert_eq!(doomed.send_connect(connect).await.reason_code, ReasonCode::Success);
    drop(doomed);

    let will = watcher.expect_publish().await;
    assert_eq!(&*will.topic, "clients/doomed/status");
    assert_eq!(will.payload, Bytes::from_static(b"offline"));

    running.stop().await;
}

#[tokio::test]
async fn test_will_suppressed_on_normal_disconnect() {
    let running = start(test_config(next_port())).await;

    let mut watcher = TestClient::open(running.addr, ProtocolVersion::V311, "watcher").await;
    watcher.subscribe("clients/#", QoS::AtMostOnce).await;

    let mut polite = TestClient::connect(running.addr, ProtocolVersion::V311).await;
    let mut connect = polite.connect_packet("polite");
    connect.will = Some(Will {
        topic: "clients/polite".to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    polite.send_connect(connect).await;
    polite.disconnect().await;

    watcher.expect_nothing().await;

    running.stop().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_v5_clients() {
    let running = start(test_config(next_port())).await;

    let mut client = TestClient::open(running.addr, ProtocolVersion::V5, "stayer").await;
    running.broker.shutdown();
    match client.recv().await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::ServerShuttingDown);
        }
        other => panic!("Expected DISCONNECT, got {:?}", other),
    }
    let _ = timeout(Duration::from_secs(3), running.handle).await;
    assert_eq!(running.broker.connection_count(), 0);
}

#[tokio::test]
async fn test_keep_alive_timeout_publishes_will() {
    let running = start(test_config(next_port())).await;

    let mut watcher = TestClient::open(running.addr, ProtocolVersion::V311, "watcher").await;
    watcher.subscribe("clients/+/status", QoS::AtMostOnce).await;

    let mut sleepy = TestClient::connect(running.addr, ProtocolVersion::V5).await;
    let mut connect = sleepy.connect_packet("sleepy");
    connect.keep_alive = 1;
    connect.will = Some(Will {
        topic: "clients/sleepy/status".to_string(),
        payload: Bytes::from_static(b"lost"),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Properties::default(),
    });
    assert_eq!(sleepy.send_connect(connect).await.reason_code, ReasonCode::Success);

    // One and a half keep alive periods of silence
    let silent_since = tokio::time::Instant::now();
    match sleepy.recv_within(Duration::from_secs(3)).await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::KeepAliveTimeout);
        }
        other => panic!("Expected DISCONNECT, got {:?}", other),
    }
    let waited = silent_since.elapsed();
    assert!(waited >= Duration::from_millis(1200), "closed after {:?}", waited);
    assert!(waited < Duration::from_millis(2500), "closed after {:?}", waited);
    assert_eq!(sleepy.recv_within(Duration::from_millis(500)).await, None);

    let will = watcher.expect_publish().await;
    assert_eq!(&*will.topic, "clients/sleepy/status");
    assert_eq!(will.payload, Bytes::from_static(b"lost"));

    settle().await;
    assert_eq!(running.broker.connection_count(), 1);

    running.stop().await;
}

#[tokio::test]
async fn test_ping_keeps_connection_alive() {
    let running = start(test_config(next_port())).await;

    let mut client = TestClient::connect(running.addr, ProtocolVersion::V5).await;
    let mut connect = client.connect_packet("busy");
    connect.keep_alive = 1;
    assert_eq!(client.send_connect(connect).await.reason_code, ReasonCode::Success);

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        client.send(&Packet::PingReq).await;
        assert_eq!(client.recv().await, Some(Packet::PingResp));
    }
    assert_eq!(running.broker.connection_count(), 1);

    running.stop().await;
}

// ============================================================================
// Limits
// ============================================================================

#[tokio::test]
async fn test_topic_level_limit() {
    let running = start(test_config(next_port())).await;
    let deep = "/".repeat(200);

    let mut listener = TestClient::open(running.addr, ProtocolVersion::V5, "listener").await;
    listener.subscribe("a/#", QoS::AtMostOnce).await;

    let mut client = TestClient::open(running.addr, ProtocolVersion::V5, "deep").await;
    let ack = client.subscribe(&deep, QoS::AtMostOnce).await;
    assert_eq!(ack.reason_codes, vec![ReasonCode::TopicFilterInvalid]);
    let ack = client.subscribe(&format!("{}#", deep), QoS::AtMostOnce).await;
    assert_eq!(ack.reason_codes, vec![ReasonCode::TopicFilterInvalid]);
    assert_eq!(running.broker.subscription_count(), 1);

    client.publish(&deep, b"x", QoS::AtMostOnce, false).await;
    match client.recv().await {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::TopicNameInvalid);
        }
        other => panic!("Expected DISCONNECT, got {:?}", other),
    }

    // Other clients are unaffected
    let mut publisher = TestClient::open(running.addr, ProtocolVersion::V5, "shallow").await;
    publisher.publish("a/b", b"ok", QoS::AtMostOnce, false).await;
    let publish = listener.expect_publish().await;
    assert_eq!(&*publish.topic, "a/b");

    running.stop().await;
}

// ============================================================================
// Auth / ACL
// ============================================================================

fn secured_broker(port: u16) -> Broker {
    let auth = AuthConfig {
        enabled: true,
        allow_anonymous: false,
        users: vec![
            UserConfig {
                username: "sensor".to_string(),
                password: Some("s3cret".to_string()),
                password_hash: None,
                role: Some("sensor".to_string()),
            },
            UserConfig {
                username: "viewer".to_string(),
                password: Some("look".to_string()),
                password_hash: None,
                role: None,
            },
        ],
    };
    let acl = AclConfig {
        enabled: true,
        roles: vec![AclRole {
            name: "sensor".to_string(),
            publish: vec!["sensors/%c/#".to_string()],
            subscribe: vec!["sensors/#".to_string()],
        }],
        default: AclPermissions {
            publish: vec![],
            subscribe: vec!["public/#".to_string()],
        },
    };

    let auth = Arc::new(AuthProvider::new(&auth));
    let acl = Arc::new(AclProvider::new(&acl, auth.clone()));
    let hooks: Arc<dyn Hooks> = Arc::new(CompositeHooks::new().with(auth).with(acl));
    Broker::with_hooks(test_config(port), hooks)
}

async fn login(addr: SocketAddr, client_id: &str, user: &str, password: &str) -> (TestClient, ConnAck) {
    let mut client = TestClient::connect(addr, ProtocolVersion::V5).await;
    let mut connect = client.connect_packet(client_id);
    connect.username = Some(user.to_string());
    connect.password = Some(Bytes::copy_from_slice(password.as_bytes()));
    let connack = client.send_connect(connect).await;
    (client, connack)
}

#[tokio::test]
async fn test_authentication() {
    let running = start_broker(secured_broker(next_port())).await;

    let (_, connack) = login(running.addr, "s1", "sensor", "wrong").await;
    assert_eq!(connack.reason_code, ReasonCode::NotAuthorized);

    let mut anonymous = TestClient::connect(running.addr, ProtocolVersion::V5).await;
    let connack = anonymous.mqtt_connect("anon").await;
    assert_eq!(connack.reason_code, ReasonCode::NotAuthorized);

    let (_, connack) = login(running.addr, "s1", "sensor", "s3cret").await;
    assert_eq!(connack.reason_code, ReasonCode::Success);

    running.stop().await;
}

#[tokio::test]
async fn test_acl_denials() {
    let running = start_broker(secured_broker(next_port())).await;

    let (mut viewer, _) = login(running.addr, "v1", "viewer", "look").await;
    let suback = viewer.subscribe("sensors/#", QoS::AtMostOnce).await;
    assert_eq!(suback.reason_codes, vec![ReasonCode::NotAuthorized]);
    let suback = viewer.subscribe("public/news", QoS::AtMostOnce).await;
    assert_eq!(suback.reason_codes, vec![ReasonCode::Success]);

    let (mut sensor, _) = login(running.addr, "s1", "sensor", "s3cret").await;
    sensor.subscribe("sensors/#", QoS::AtMostOnce).await;

    // Another client's subtree is off limits
    let packet_id = sensor
        .publish("sensors/s2/temp", b"1", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    match sensor.recv().await {
        Some(Packet::PubAck(ack)) => {
            assert_eq!(ack.packet_id, packet_id);
            assert_eq!(ack.reason_code, ReasonCode::NotAuthorized);
        }
        other => panic!("Expected PUBACK, got {:?}", other),
    }

    sensor
        .publish("sensors/s1/temp", b"2", QoS::AtMostOnce, false)
        .await;
    let publish = sensor.expect_publish().await;
    assert_eq!(&*publish.topic, "sensors/s1/temp");

    running.stop().await;
}

// ============================================================================
// Inline client and threshold pipeline
// ============================================================================

#[tokio::test]
async fn test_pipeline_over_tcp() {
    let running = start(test_config(next_port())).await;
    let inline = running.broker.inline_client().unwrap().clone();
    ThresholdPipeline::start(&PipelineConfig::default(), &inline)
        .await
        .unwrap();

    let mut watcher = TestClient::open(running.addr, ProtocolVersion::V311, "watcher").await;
    watcher.subscribe("temperature/result", QoS::AtLeastOnce).await;

    let mut sensor = TestClient::open(running.addr, ProtocolVersion::V311, "sensor").await;
    for (reading, label) in [("31.0", "high"), ("30.5", "normal"), ("abc", "normal")] {
        sensor
            .publish("temperature/send", reading.as_bytes(), QoS::AtMostOnce, false)
            .await;
        let publish = watcher.expect_publish().await;
        assert_eq!(&*publish.topic, "temperature/result");
        assert_eq!(publish.payload, Bytes::from(label));
        assert_eq!(publish.qos, QoS::AtMostOnce);
    }

    // The latest label is retained for late subscribers
    let mut late = TestClient::open(running.addr, ProtocolVersion::V311, "late").await;
    late.subscribe("temperature/result", QoS::AtMostOnce).await;
    let retained = late.expect_publish().await;
    assert_eq!(retained.payload, Bytes::from_static(b"normal"));
    assert!(retained.retain);

    running.stop().await;
}

#[tokio::test]
async fn test_inline_and_network_clients_exchange_messages() {
    let running = start(test_config(next_port())).await;
    let inline = running.broker.inline_client().unwrap().clone();

    let (tx, mut rx) = mpsc::unbounded_channel();
    inline.subscribe("cmd/+", 7, tx).await.unwrap();

    let mut device = TestClient::open(running.addr, ProtocolVersion::V5, "device").await;
    device.subscribe("reply/#", QoS::AtMostOnce).await;
    device.publish("cmd/reboot", b"now", QoS::AtLeastOnce, false).await;

    let message = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&*message.topic, "cmd/reboot");
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert_eq!(message.subscription_id, Some(7));
    match device.recv().await {
        Some(Packet::PubAck(ack)) => assert_eq!(ack.reason_code, ReasonCode::Success),
        other => panic!("Expected PUBACK, got {:?}", other),
    }

    let delivered = inline
        .publish("reply/reboot", "ok", false, QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    let reply = device.expect_publish().await;
    assert_eq!(reply.payload, Bytes::from_static(b"ok"));

    running.stop().await;
    assert!(!inline.is_alive());
}

#[tokio::test]
async fn test_config_drives_broker() {
    let port = next_port();
    let config = Config::parse(&format!(
        "[server]\nbind = \"127.0.0.1:{}\"\n\n[mqtt]\nmax_qos = 0\n",
        port
    ))
    .unwrap();
    let running = start(BrokerConfig::from(&config)).await;

    let mut client = TestClient::open(running.addr, ProtocolVersion::V311, "cfg").await;
    let suback = client.subscribe("x", QoS::AtLeastOnce).await;
    assert_eq!(suback.reason_codes, vec![ReasonCode::Success]);

    running.stop().await;
}
