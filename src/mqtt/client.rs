//! Client façade
//!
//! [`Client`] is a cheap, cloneable handle around one [`Session`] and at most one live
//! transport. A background connection task (see [`super::handler`]) owns the framed
//! transport and is the only writer; API calls hand packets to it through a channel, so
//! packets are never interleaved on the wire.
//!
//! # Architecture
//!
//! ```text
//!  API calls ──► [Shared: Session + waiters] ──► outbound channel ──► connection task ──► transport
//!                          ▲                                               │
//!                          └──────────── inbound packets ◄─────────────────┘
//!                                              │
//!                              registry handlers + Event channel
//! ```
//!
//! All session mutations happen under one async mutex. Events are emitted after that
//! lock is released, in the order the session produced them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, trace, warn};

use super::config::{ClientSettings, ConnectionOptions};
use super::error::{MqttError, TransportError, ValidationError};
use super::handler::{self, DriverHandle};
use super::packet::{ConnectReturnCode, Message, Packet, QoS, SubscribeReturnCode};
use super::registry::{HandlerId, MessageHandler, SubscriptionRegistry};
use super::session::{Session, SessionEvent, SessionState};
use super::topic::TopicFilter;
use super::transport::{Connector, TcpConnector};

const MAX_STATUS_ERRORS: usize = 20;
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Requested,
    Transport(String),
    Protocol(String),
    KeepAliveTimeout,
    Refused(ConnectReturnCode),
    ReconnectCancelled,
    /// The reconnect policy ran out of attempts
    ReconnectExhausted,
}

impl DisconnectReason {
    pub(crate) fn from_error(error: &MqttError) -> Self {
        match error {
            MqttError::Transport(TransportError::KeepAliveTimeout) => DisconnectReason::KeepAliveTimeout,
            MqttError::Protocol(e) => DisconnectReason::Protocol(e.to_string()),
            MqttError::Auth(code) => DisconnectReason::Refused(*code),
            other => DisconnectReason::Transport(other.to_string()),
        }
    }
}

/// Connectivity transitions and deliveries, in session order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected { session_present: bool },
    Disconnected(DisconnectReason),
    Reconnecting { attempt: u32, delay: Duration },
    Message(Message),
    DeliveryAbandoned { packet_id: u16, message: Message },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub session_present: bool,
    /// The id actually used, generated when none was configured
    pub client_id: String,
}

/// Snapshot of the client for status displays
#[derive(Clone, Debug, Default)]
pub struct ClientStatus {
    pub state: SessionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// Final acknowledgement a waiter is completed with
#[derive(Debug)]
pub(crate) enum Ack {
    Published,
    Subscribed(Vec<(String, SubscribeReturnCode)>),
    Unsubscribed,
}

type AckSender = oneshot::Sender<Result<Ack, MqttError>>;

/// State guarded by the session mutex
#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) session: Option<Session>,
    pub(crate) waiters: HashMap<u16, AckSender>,
    pub(crate) connect_waiter: Option<oneshot::Sender<Result<ConnectOutcome, MqttError>>>,
    /// Present exactly while a connection is established
    pub(crate) outbound: Option<mpsc::UnboundedSender<Packet>>,
    pub(crate) driver: Option<DriverHandle>,
}

impl Shared {
    pub(crate) fn session_mut(&mut self) -> Result<&mut Session, MqttError> {
        self.session
            .as_mut()
            .ok_or_else(|| MqttError::InvalidState("no session".to_string()))
    }

    pub(crate) fn owns_driver(&self, id: u64) -> bool {
        self.driver.as_ref().map(|d| d.id) == Some(id)
    }

    fn send_packets(&self, packets: Vec<Packet>) -> Result<(), MqttError> {
        if packets.is_empty() {
            return Ok(());
        }
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(MqttError::Transport(TransportError::NotConnected))?;
        for packet in packets {
            outbound
                .send(packet)
                .map_err(|_| MqttError::Transport(TransportError::ConnectionLost))?;
        }
        Ok(())
    }

    /// Resolves waiters for session events and maps the rest to public events
    pub(crate) fn complete(&mut self, events: Vec<SessionEvent>) -> Vec<Event> {
        let mut public = Vec::new();
        for event in events {
            match event {
                SessionEvent::Connected { session_present } => {
                    public.push(Event::Connected { session_present })
                }
                SessionEvent::ConnectRefused(code) => debug!("Connect refused: {}", code),
                SessionEvent::Deliver(message) => public.push(Event::Message(message)),
                SessionEvent::Acknowledged { packet_id } => {
                    self.resolve(packet_id, Ok(Ack::Published))
                }
                SessionEvent::Subscribed { packet_id, results } => {
                    if !self.waiters.contains_key(&packet_id) {
                        debug!("Resubscribe {} answered: {:?}", packet_id, results);
                    }
                    self.resolve(packet_id, Ok(Ack::Subscribed(results)))
                }
                SessionEvent::Unsubscribed { packet_id, .. } => {
                    self.resolve(packet_id, Ok(Ack::Unsubscribed))
                }
                SessionEvent::Abandoned { packet_id, message } => {
                    self.resolve(
                        packet_id,
                        Err(MqttError::DeliveryAbandoned {
                            packet_id,
                            message: message.clone(),
                        }),
                    );
                    public.push(Event::DeliveryAbandoned { packet_id, message });
                }
                SessionEvent::RequestFailed { packet_id } => self.resolve(
                    packet_id,
                    Err(MqttError::Transport(TransportError::ConnectionLost)),
                ),
                SessionEvent::PingResponse => trace!("PINGRESP"),
            }
        }
        public
    }

    fn resolve(&mut self, packet_id: u16, result: Result<Ack, MqttError>) {
        if let Some(waiter) = self.waiters.remove(&packet_id) {
            // the caller may have given up already
            let _ = waiter.send(result);
        }
    }

    pub(crate) fn fail_connect(&mut self, error: MqttError) {
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(error));
        }
    }
}

pub(crate) struct Inner {
    pub(crate) shared: Mutex<Shared>,
    pub(crate) registry: RwLock<SubscriptionRegistry>,
    pub(crate) settings: ClientSettings,
    pub(crate) connector: Arc<dyn Connector>,
    events: mpsc::Sender<Event>,
    status: watch::Sender<ClientStatus>,
    next_driver_id: AtomicU64,
}

impl Inner {
    pub(crate) fn set_state(&self, state: SessionState) {
        self.status.send_modify(|status| status.state = state);
    }

    pub(crate) fn record_error(&self, error: &MqttError) {
        self.status.send_modify(|status| {
            status.error_messages.push(error.to_string());
            if status.error_messages.len() > MAX_STATUS_ERRORS {
                status.error_messages.remove(0);
            }
        });
    }

    pub(crate) fn record_sent(&self) {
        self.status.send_modify(|status| {
            status.messages_sent += 1;
            status.last_activity = Some(Local::now());
        });
    }

    pub(crate) fn clear_registry(&self) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Runs registry handlers for deliveries and forwards every event to the receiver
    pub(crate) async fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            if let Event::Message(message) = &event {
                self.status.send_modify(|status| {
                    status.messages_received += 1;
                    status.last_activity = Some(Local::now());
                });
                // lock released before any handler runs
                let delivery = self
                    .registry
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .matching(&message.topic);
                delivery.dispatch(message);
            }
            if self.events.send(event).await.is_err() {
                trace!("Event receiver dropped");
            }
        }
    }
}

/// Handle to one MQTT session
///
/// Clones share the same session. Call [`disconnect`](Client::disconnect) to stop the
/// background connection task; dropping the handles alone does not.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Creates an idle client and the receiver for its [`Event`] stream
    ///
    /// The event channel is bounded by `settings.event_capacity`; the connection task waits
    /// when it is full, so the receiver must be drained.
    pub fn new(settings: ClientSettings, connector: Arc<dyn Connector>) -> (Self, mpsc::Receiver<Event>) {
        let (events, receiver) = mpsc::channel(settings.event_capacity.max(1));
        let (status, _) = watch::channel(ClientStatus::default());
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared::default()),
            registry: RwLock::new(SubscriptionRegistry::new()),
            settings,
            connector,
            events,
            status,
            next_driver_id: AtomicU64::new(0),
        });
        (Self { inner }, receiver)
    }

    /// Client over plain TCP
    pub fn tcp(settings: ClientSettings) -> (Self, mpsc::Receiver<Event>) {
        Self::new(settings, Arc::new(TcpConnector))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Connects and waits for the broker's CONNACK
    ///
    /// A persistent session (clean-session off) is resumed when the options equal those
    /// of the previous session; anything else starts a new session. If the first attempt
    /// fails and auto-reconnect is enabled, the call fails but attempts continue in the
    /// background until [`cancel_reconnect`](Client::cancel_reconnect) or
    /// [`disconnect`](Client::disconnect).
    pub async fn connect(&self, options: ConnectionOptions) -> Result<ConnectOutcome, MqttError> {
        let (receiver, abandoned) = {
            let mut shared = self.inner.shared.lock().await;
            if shared.driver.is_some() {
                return Err(MqttError::InvalidState(
                    "client is already connected or connecting".to_string(),
                ));
            }

            let resume = !options.clean_session
                && shared
                    .session
                    .as_ref()
                    .is_some_and(|s| s.can_connect() && s.options() == &options);

            let mut abandoned = Vec::new();
            if resume {
                info!("Resuming session for '{}'", options.client_id);
            } else {
                let session = Session::new(options, self.inner.settings.max_redeliveries)?;
                if let Some(mut previous) = shared.session.replace(session) {
                    let events = previous
                        .drain_outbound()
                        .into_iter()
                        .map(|(packet_id, message)| SessionEvent::Abandoned { packet_id, message })
                        .collect();
                    abandoned = shared.complete(events);
                }
                self.inner.clear_registry();
            }

            let (sender, receiver) = oneshot::channel();
            shared.connect_waiter = Some(sender);
            let id = self.inner.next_driver_id.fetch_add(1, Ordering::Relaxed) + 1;
            shared.driver = Some(handler::spawn(self.inner.clone(), id));
            (receiver, abandoned)
        };

        self.inner.emit_all(abandoned).await;

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionClosed.into()),
        }
    }

    /// Publishes with the configured acknowledgement timeout
    ///
    /// Returns the packet id for QoS 1/2 once the final acknowledgement arrived.
    pub async fn publish(&self, message: Message) -> Result<Option<u16>, MqttError> {
        self.publish_with_timeout(message, self.inner.settings.ack_timeout())
            .await
    }

    /// Publishes, waiting at most `timeout` for PUBACK/PUBCOMP
    ///
    /// On timeout the in-flight entry is kept and resent on the next reconnect unless it
    /// is removed with [`abort`](Client::abort).
    pub async fn publish_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Option<u16>, MqttError> {
        let max = self.inner.settings.max_payload_size;
        if message.payload.len() > max {
            return Err(ValidationError::PayloadTooLarge {
                size: message.payload.len(),
                max,
            }
            .into());
        }

        let waiter = {
            let mut shared = self.inner.shared.lock().await;
            let session = shared
                .session
                .as_mut()
                .ok_or(MqttError::Transport(TransportError::NotConnected))?;
            let (packet_id, step) = session.publish(message)?;
            shared.send_packets(step.outbound)?;
            packet_id.map(|id| {
                let (sender, receiver) = oneshot::channel();
                shared.waiters.insert(id, sender);
                (id, receiver)
            })
        };

        let Some((packet_id, receiver)) = waiter else {
            return Ok(None);
        };
        self.await_ack(packet_id, receiver, timeout).await?;
        Ok(Some(packet_id))
    }

    /// Subscribes a single filter without a handler; messages arrive as [`Event::Message`]
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<SubscribeReturnCode, MqttError> {
        let results = self
            .subscribe_many(vec![(filter.to_string(), qos)], None)
            .await?;
        Ok(first_code(results))
    }

    /// Subscribes a single filter and registers `handler` for matching messages
    pub async fn subscribe_with_handler<F>(
        &self,
        filter: &str,
        qos: QoS,
        handler: F,
    ) -> Result<SubscribeReturnCode, MqttError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let results = self
            .subscribe_many(vec![(filter.to_string(), qos)], Some(Arc::new(handler)))
            .await?;
        Ok(first_code(results))
    }

    /// Subscribes several filters in one SUBSCRIBE
    ///
    /// Registrations are added before the request is written so that messages following
    /// the SUBACK are not missed; refused filters are unregistered again.
    pub async fn subscribe_many(
        &self,
        filters: Vec<(String, QoS)>,
        handler: Option<MessageHandler>,
    ) -> Result<Vec<(String, SubscribeReturnCode)>, MqttError> {
        let parsed = filters
            .iter()
            .map(|(filter, qos)| TopicFilter::new(filter.as_str()).map(|f| (f, *qos)))
            .collect::<Result<Vec<_>, _>>()?;

        let (packet_id, receiver, ids) = {
            let mut shared = self.inner.shared.lock().await;
            let session = shared
                .session
                .as_mut()
                .ok_or(MqttError::Transport(TransportError::NotConnected))?;
            let (packet_id, step) = session.subscribe(filters)?;

            let ids: Vec<HandlerId> = {
                let mut registry = self
                    .inner
                    .registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                parsed
                    .into_iter()
                    .map(|(filter, qos)| registry.add(filter, qos, handler.clone()))
                    .collect()
            };

            let (sender, receiver) = oneshot::channel();
            shared.waiters.insert(packet_id, sender);
            if let Err(e) = shared.send_packets(step.outbound) {
                shared.waiters.remove(&packet_id);
                self.unregister(&ids);
                return Err(e);
            }
            (packet_id, receiver, ids)
        };

        let ack = self
            .await_ack(packet_id, receiver, self.inner.settings.ack_timeout())
            .await;
        match ack {
            Ok(Ack::Subscribed(results)) => {
                let refused: Vec<HandlerId> = results
                    .iter()
                    .zip(&ids)
                    .filter(|((_, code), _)| *code == SubscribeReturnCode::Failure)
                    .map(|(_, id)| *id)
                    .collect();
                self.unregister(&refused);
                Ok(results)
            }
            Ok(other) => Err(MqttError::InvalidState(format!(
                "unexpected acknowledgement {:?} for SUBSCRIBE",
                other
            ))),
            // SUBACK may still arrive after a local timeout
            Err(e @ MqttError::Timeout { .. }) => Err(e),
            Err(e) => {
                self.unregister(&ids);
                Err(e)
            }
        }
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        let (packet_id, receiver) = {
            let mut shared = self.inner.shared.lock().await;
            let session = shared
                .session
                .as_mut()
                .ok_or(MqttError::Transport(TransportError::NotConnected))?;
            let (packet_id, step) = session.unsubscribe(vec![filter.to_string()])?;
            let (sender, receiver) = oneshot::channel();
            shared.waiters.insert(packet_id, sender);
            if let Err(e) = shared.send_packets(step.outbound) {
                shared.waiters.remove(&packet_id);
                return Err(e);
            }
            (packet_id, receiver)
        };

        self.await_ack(packet_id, receiver, self.inner.settings.ack_timeout())
            .await?;
        let removed = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(filter);
        debug!("Unsubscribed '{}' ({} registrations removed)", filter, removed);
        Ok(())
    }

    /// Removes a single handler registration without touching the broker subscription
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_handler(id)
    }

    /// Highest QoS among local registrations matching `topic`
    pub fn effective_qos(&self, topic: &str) -> Option<QoS> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .effective_qos(topic)
    }

    /// Sends DISCONNECT, releases the transport and stops reconnecting
    ///
    /// Safe to call repeatedly and concurrently; only the first call does the work.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let driver = {
            let mut shared = self.inner.shared.lock().await;
            // no driver: never connected, already given up, or another call is stopping it
            let Some(driver) = shared.driver.take() else {
                return Ok(());
            };

            let outbound = shared.outbound.take();
            if let Some(session) = shared.session.as_mut() {
                let step = session.begin_disconnect();
                self.inner.set_state(session.state());
                if let Some(outbound) = outbound {
                    for packet in step.outbound {
                        let _ = outbound.send(packet);
                    }
                }
            }
            driver
        };

        driver.stop(DISCONNECT_GRACE).await;

        let mut events = {
            let mut shared = self.inner.shared.lock().await;
            shared.outbound = None;
            shared.fail_connect(TransportError::ConnectionClosed.into());
            let step = match shared.session.as_mut() {
                Some(session) => {
                    let step = session.finish_disconnect();
                    self.inner.set_state(session.state());
                    step
                }
                None => Default::default(),
            };
            shared.complete(step.events)
        };

        info!("Disconnected");
        events.push(Event::Disconnected(DisconnectReason::Requested));
        self.inner.emit_all(events).await;
        Ok(())
    }

    /// Stops a pending or running reconnection; returns whether one was stopped
    pub async fn cancel_reconnect(&self) -> bool {
        let driver = {
            let mut shared = self.inner.shared.lock().await;
            let reconnecting = matches!(
                shared.session.as_ref().map(Session::state),
                Some(SessionState::Reconnecting { .. } | SessionState::Connecting)
            );
            if !reconnecting {
                return false;
            }
            shared.driver.take()
        };

        let Some(driver) = driver else {
            return false;
        };
        driver.stop(DISCONNECT_GRACE).await;

        let mut events = {
            let mut shared = self.inner.shared.lock().await;
            shared.outbound = None;
            shared.fail_connect(TransportError::ConnectionClosed.into());
            let step = match shared.session.as_mut() {
                Some(session) => {
                    let step = session.connection_lost(None);
                    self.inner.set_state(session.state());
                    step
                }
                None => Default::default(),
            };
            shared.complete(step.events)
        };

        info!("Reconnection cancelled");
        events.push(Event::Disconnected(DisconnectReason::ReconnectCancelled));
        self.inner.emit_all(events).await;
        true
    }

    /// Gives up an outbound in-flight entry, failing its waiter
    ///
    /// Returns the original message so the caller can decide to publish it again.
    pub async fn abort(&self, packet_id: u16) -> Option<Message> {
        let mut shared = self.inner.shared.lock().await;
        let message = shared.session.as_mut()?.abort(packet_id)?;
        if let Some(waiter) = shared.waiters.remove(&packet_id) {
            let _ = waiter.send(Err(MqttError::DeliveryAbandoned {
                packet_id,
                message: message.clone(),
            }));
        }
        Some(message)
    }

    pub fn state(&self) -> SessionState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status.subscribe()
    }

    /// Number of outbound QoS 1/2 messages not yet fully acknowledged
    pub async fn in_flight(&self) -> usize {
        let shared = self.inner.shared.lock().await;
        shared.session.as_ref().map_or(0, Session::outbound_len)
    }

    /// Granted subscriptions of the current session
    pub async fn subscriptions(&self) -> Vec<(String, QoS)> {
        let shared = self.inner.shared.lock().await;
        shared.session.as_ref().map_or_else(Vec::new, |s| {
            s.subscriptions()
                .iter()
                .map(|(filter, qos)| (filter.clone(), *qos))
                .collect()
        })
    }

    async fn await_ack(
        &self,
        packet_id: u16,
        receiver: oneshot::Receiver<Result<Ack, MqttError>>,
        timeout: Duration,
    ) -> Result<Ack, MqttError> {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost.into()),
            Err(_) => {
                self.inner.shared.lock().await.waiters.remove(&packet_id);
                warn!("No acknowledgement for packet {} within {:?}", packet_id, timeout);
                let error = MqttError::Timeout {
                    packet_id: Some(packet_id),
                };
                self.inner.record_error(&error);
                Err(error)
            }
        }
    }

    fn unregister(&self, ids: &[HandlerId]) {
        if ids.is_empty() {
            return;
        }
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            registry.remove_handler(*id);
        }
    }
}

fn first_code(results: Vec<(String, SubscribeReturnCode)>) -> SubscribeReturnCode {
    results
        .into_iter()
        .next()
        .map_or(SubscribeReturnCode::Failure, |(_, code)| code)
}
