//! Scripted broker for driving a [`Client`] over in-memory streams

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use mqtt_explorer::mqtt::codec::MqttCodec;
use mqtt_explorer::mqtt::packet::{ConnAck, Connect, ConnectReturnCode, Packet, Publish};
use mqtt_explorer::mqtt::{
    ClientSettings, Client, Connector, ConnectionOptions, Event, Message, QoS, ReconnectPolicy,
    Transport,
};

/// Generous so paused-clock tests can jump over keep-alive intervals
pub const WAIT: Duration = Duration::from_secs(60);

/// Hands the broker side of every accepted connection to the test
pub struct TestConnector {
    brokers: mpsc::UnboundedSender<Broker>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
}

impl TestConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Broker>) {
        let (brokers, receiver) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            brokers,
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        });
        (connector, receiver)
    }

    /// Makes further connection attempts fail at the socket level
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, _options: &ConnectionOptions) -> io::Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused by test"));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.brokers
            .send(Broker::new(server))
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "test dropped the broker receiver"))?;
        Ok(Box::new(client))
    }
}

/// Broker end of one connection
pub struct Broker {
    framed: Framed<DuplexStream, MqttCodec>,
}

impl Broker {
    fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, MqttCodec::default()),
        }
    }

    pub async fn recv(&mut self) -> Packet {
        match tokio::time::timeout(WAIT, self.framed.next()).await {
            Ok(Some(Ok(packet))) => packet,
            Ok(Some(Err(e))) => panic!("broker failed to decode: {}", e),
            Ok(None) => panic!("client closed the connection"),
            Err(_) => panic!("no packet from client within {:?}", WAIT),
        }
    }

    /// Next packet, or `None` once the client has closed the connection
    pub async fn next_packet(&mut self) -> Option<Packet> {
        match tokio::time::timeout(WAIT, self.framed.next()).await {
            Ok(Some(Ok(packet))) => Some(packet),
            Ok(None) | Ok(Some(Err(_))) => None,
            Err(_) => panic!("connection still open after {:?}", WAIT),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.framed.send(packet).await.expect("broker write");
    }

    /// Writes bytes without framing
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.expect("broker raw write");
        stream.flush().await.expect("broker flush");
    }

    pub async fn accept_connect(&mut self, session_present: bool) -> Connect {
        self.answer_connect(ConnAck {
            session_present,
            code: ConnectReturnCode::Accepted,
        })
        .await
    }

    pub async fn answer_connect(&mut self, connack: ConnAck) -> Connect {
        let connect = match self.recv().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        self.send(Packet::ConnAck(connack)).await;
        connect
    }

    pub async fn publish(&mut self, topic: &str, payload: &str, qos: QoS, packet_id: Option<u16>) {
        let message = Message::new(topic, payload.to_string(), qos);
        self.send(Packet::Publish(Publish::from_message(&message, packet_id, false)))
            .await;
    }

    /// Waits until the client closes its end, failing on any further packet
    pub async fn expect_closed(&mut self) {
        match tokio::time::timeout(WAIT, self.framed.next()).await {
            Ok(None) | Ok(Some(Err(_))) => {}
            Ok(Some(Ok(packet))) => panic!("expected close, got {:?}", packet),
            Err(_) => panic!("connection still open after {:?}", WAIT),
        }
    }
}

/// A client wired to a [`TestConnector`]
pub struct Harness {
    pub client: Client,
    pub events: mpsc::Receiver<Event>,
    pub connector: Arc<TestConnector>,
    brokers: mpsc::UnboundedReceiver<Broker>,
}

impl Harness {
    pub fn new(settings: ClientSettings) -> Self {
        let (connector, brokers) = TestConnector::new();
        let (client, events) = Client::new(settings, connector.clone());
        Self {
            client,
            events,
            connector,
            brokers,
        }
    }

    pub async fn next_broker(&mut self) -> Broker {
        match tokio::time::timeout(WAIT, self.brokers.recv()).await {
            Ok(Some(broker)) => broker,
            _ => panic!("client did not open a connection"),
        }
    }

    /// Connects and completes the handshake, returning the broker and the CONNECT seen
    pub async fn connect(&mut self, options: ConnectionOptions, session_present: bool) -> (Broker, Connect) {
        let client = self.client.clone();
        let pending = tokio::spawn(async move { client.connect(options).await });
        let mut broker = self.next_broker().await;
        let connect = broker.accept_connect(session_present).await;
        let outcome = pending.await.unwrap().expect("connect");
        assert_eq!(outcome.session_present, session_present);
        assert_eq!(outcome.client_id, connect.client_id);
        (broker, connect)
    }

    pub async fn next_event(&mut self) -> Event {
        match tokio::time::timeout(WAIT, self.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("no event within {:?}", WAIT),
        }
    }

    /// Skips events until one satisfies `predicate`
    pub async fn wait_for(&mut self, predicate: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = self.next_event().await;
            if predicate(&event) {
                return event;
            }
        }
    }

    /// Collects every event already queued
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn settings() -> ClientSettings {
    ClientSettings {
        reconnect: ReconnectPolicy::disabled(),
        ack_timeout_ms: 5_000,
        connect_timeout_ms: 5_000,
        ..ClientSettings::default()
    }
}

pub fn reconnecting_settings(initial_delay_ms: u64, max_attempts: Option<u32>) -> ClientSettings {
    ClientSettings {
        reconnect: ReconnectPolicy {
            enabled: true,
            initial_delay_ms,
            max_delay_ms: initial_delay_ms * 8,
            max_attempts,
        },
        ..settings()
    }
}

pub fn options(client_id: &str) -> ConnectionOptions {
    ConnectionOptions::new("broker.test", 1883).with_client_id(client_id)
}
