//! Session state machine
//!
//! A [`Session`] owns everything the broker and client must agree on for one client
//! identifier: connection state, packet identifiers, in-flight QoS 1/2 tables and the
//! subscription set. It performs no I/O. Every operation returns a [`Step`] listing the
//! packets to write and the events to surface, and the caller drives the transport.
//!
//! # State Machine
//!
//! ```text
//!            start_connect            CONNACK(0)
//!   Idle ─────────────────► Connecting ──────────► Connected
//!    ▲                          │  ▲                   │
//!    │          CONNACK(refused)│  │start_connect      │begin_disconnect
//!    ├──────────────────────────┘  │                   ▼
//!    │                        Reconnecting ◄──── Disconnecting
//!    │   connection_lost(None)     ▲    connection_lost(Some)
//!    └─────────────────────────────┴──── (from Connecting/Connected)
//! ```
//!
//! Entries survive reconnects unless the session is clean. On every accepted CONNACK the
//! outbound table is flushed in publish order: entries that were already sent go out again
//! as duplicates (or as PUBREL when only PUBCOMP is missing) and count towards the
//! redelivery cap.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::config::ConnectionOptions;
use super::error::{MqttError, ProtocolError, TransportError, ValidationError};
use super::packet::{
    ConnAck, ConnectReturnCode, Message, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
use super::topic::{validate_filter, validate_topic_name};

const GENERATED_ID_PREFIX: &str = "mqtt-explorer-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting {
        attempt: u32,
    },
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("Idle"),
            SessionState::Connecting => f.write_str("Connecting"),
            SessionState::Connected => f.write_str("Connected"),
            SessionState::Disconnecting => f.write_str("Disconnecting"),
            SessionState::Reconnecting { attempt } => write!(f, "Reconnecting (attempt {})", attempt),
        }
    }
}

/// Acknowledgement an outbound QoS 1/2 message is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

#[derive(Debug, Clone)]
pub struct OutboundEntry {
    pub message: Message,
    pub state: OutboundState,
    pub retries: u32,
    /// `None` while the entry is queued and has never been written
    pub first_sent: Option<Instant>,
    seq: u64,
}

/// Something the session wants the owner to know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        session_present: bool,
    },
    ConnectRefused(ConnectReturnCode),
    /// Message ready for the application
    Deliver(Message),
    /// Final acknowledgement for an outbound publish
    Acknowledged {
        packet_id: u16,
    },
    Subscribed {
        packet_id: u16,
        results: Vec<(String, SubscribeReturnCode)>,
    },
    Unsubscribed {
        packet_id: u16,
        filters: Vec<String>,
    },
    /// In-flight entry given up; carries the original message for re-publishing
    Abandoned {
        packet_id: u16,
        message: Message,
    },
    /// A SUBSCRIBE/UNSUBSCRIBE that will never be answered
    RequestFailed {
        packet_id: u16,
    },
    PingResponse,
}

/// Outcome of one session operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    pub outbound: Vec<Packet>,
    pub events: Vec<SessionEvent>,
}

impl Step {
    fn send(packet: Packet) -> Self {
        Self {
            outbound: vec![packet],
            events: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug)]
pub struct Session {
    options: ConnectionOptions,
    state: SessionState,
    next_packet_id: u16,
    next_seq: u64,
    outbound: HashMap<u16, OutboundEntry>,
    /// Inbound QoS 2 messages awaiting PUBREL
    inbound: HashMap<u16, Message>,
    subscriptions: BTreeMap<String, QoS>,
    pending_subscribes: HashMap<u16, Vec<(String, QoS)>>,
    pending_unsubscribes: HashMap<u16, Vec<String>>,
    max_redeliveries: u32,
}

impl Session {
    /// Creates an idle session
    ///
    /// An empty client id is replaced by a generated one for clean sessions; a persistent
    /// session needs a stable id and is rejected without one.
    pub fn new(mut options: ConnectionOptions, max_redeliveries: u32) -> Result<Self, ValidationError> {
        if options.client_id.is_empty() {
            if !options.clean_session {
                return Err(ValidationError::EmptyClientId);
            }
            options.client_id = generate_client_id();
            debug!("Generated client id {}", options.client_id);
        }

        Ok(Self {
            options,
            state: SessionState::Idle,
            next_packet_id: 1,
            next_seq: 0,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            subscriptions: BTreeMap::new(),
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            max_redeliveries,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    pub fn is_clean(&self) -> bool {
        self.options.clean_session
    }

    pub fn subscriptions(&self) -> &BTreeMap<String, QoS> {
        &self.subscriptions
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn outbound_entry(&self, packet_id: u16) -> Option<&OutboundEntry> {
        self.outbound.get(&packet_id)
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_subscribes.len() + self.pending_unsubscribes.len()
    }

    /// Whether a new connection attempt may start from the current state
    pub fn can_connect(&self) -> bool {
        matches!(self.state, SessionState::Idle | SessionState::Reconnecting { .. })
    }

    /// Begins a connection attempt and yields the CONNECT packet
    pub fn start_connect(&mut self) -> Result<Step, MqttError> {
        if !self.can_connect() {
            return Err(MqttError::InvalidState(format!(
                "cannot connect while {}",
                self.state
            )));
        }

        let mut step = Step::default();
        if self.options.clean_session {
            self.discard_session_state(false, &mut step);
        }

        info!("Connecting as '{}' to {}", self.options.client_id, self.options);
        self.state = SessionState::Connecting;
        step.outbound.push(Packet::Connect(self.options.to_connect()));
        Ok(step)
    }

    /// Marks the session as waiting for the next reconnect attempt
    pub fn mark_reconnecting(&mut self, attempt: u32) {
        self.state = SessionState::Reconnecting { attempt };
    }

    /// Feeds one inbound packet through the state machine
    ///
    /// Out-of-order acknowledgements come back as non-fatal [`ProtocolError::UnexpectedAck`]
    /// and leave every table untouched; any other error means the connection must close.
    pub fn handle(&mut self, packet: Packet) -> Result<Step, MqttError> {
        trace!("Session {} handling {:?}", self.state, packet.packet_type());

        match (self.state, packet) {
            (SessionState::Connecting, Packet::ConnAck(connack)) => Ok(self.on_connack(connack)),
            (SessionState::Connected | SessionState::Disconnecting, packet) => {
                self.handle_connected(packet)
            }
            (state, packet) => Err(ProtocolError::UnexpectedPacket {
                packet: packet.packet_type(),
                state: state.to_string(),
            }
            .into()),
        }
    }

    fn handle_connected(&mut self, packet: Packet) -> Result<Step, MqttError> {
        match packet {
            Packet::Publish(publish) => Ok(self.on_publish(publish)),
            Packet::PubAck(id) => self.on_puback(id),
            Packet::PubRec(id) => self.on_pubrec(id),
            Packet::PubRel(id) => Ok(self.on_pubrel(id)),
            Packet::PubComp(id) => self.on_pubcomp(id),
            Packet::SubAck(suback) => self.on_suback(suback),
            Packet::UnsubAck(id) => self.on_unsuback(id),
            Packet::PingResp => Ok(Step {
                outbound: Vec::new(),
                events: vec![SessionEvent::PingResponse],
            }),
            other => Err(ProtocolError::UnexpectedPacket {
                packet: other.packet_type(),
                state: self.state.to_string(),
            }
            .into()),
        }
    }

    fn on_connack(&mut self, connack: ConnAck) -> Step {
        let mut step = Step::default();

        if connack.code != ConnectReturnCode::Accepted {
            warn!("Broker refused connection: {}", connack.code);
            self.state = SessionState::Idle;
            step.events.push(SessionEvent::ConnectRefused(connack.code));
            return step;
        }

        info!(
            "Connected as '{}' (session present: {})",
            self.options.client_id, connack.session_present
        );
        self.state = SessionState::Connected;
        step.events.push(SessionEvent::Connected {
            session_present: connack.session_present,
        });

        self.flush_outbound(&mut step);

        if !self.options.clean_session && !self.subscriptions.is_empty() {
            let filters: Vec<(String, QoS)> = self
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter.clone(), *qos))
                .collect();
            match self.allocate_packet_id() {
                Ok(packet_id) => {
                    debug!("Resubscribing to {} filters", filters.len());
                    self.pending_subscribes.insert(packet_id, filters.clone());
                    step.outbound
                        .push(Packet::Subscribe(Subscribe { packet_id, filters }));
                }
                Err(e) => warn!("Could not resubscribe: {}", e),
            }
        }

        step
    }

    /// Writes every outbound entry in publish order, resending those already sent once
    fn flush_outbound(&mut self, step: &mut Step) {
        let mut ids: Vec<(u64, u16)> = self
            .outbound
            .iter()
            .map(|(id, entry)| (entry.seq, *id))
            .collect();
        ids.sort_unstable();

        let now = Instant::now();
        for (_, packet_id) in ids {
            let Some(entry) = self.outbound.get_mut(&packet_id) else {
                continue;
            };

            let resend = entry.first_sent.is_some();
            if resend {
                entry.retries += 1;
                if entry.retries > self.max_redeliveries {
                    if let Some(entry) = self.outbound.remove(&packet_id) {
                        warn!(
                            "Abandoning packet {} to '{}' after {} redeliveries",
                            packet_id, entry.message.topic, self.max_redeliveries
                        );
                        step.events.push(SessionEvent::Abandoned {
                            packet_id,
                            message: entry.message,
                        });
                    }
                    continue;
                }
            } else {
                entry.first_sent = Some(now);
            }

            let packet = match entry.state {
                OutboundState::AwaitingPubComp => Packet::PubRel(packet_id),
                OutboundState::AwaitingPubAck | OutboundState::AwaitingPubRec => Packet::Publish(
                    Publish::from_message(&entry.message, Some(packet_id), resend),
                ),
            };
            step.outbound.push(packet);
        }
    }

    fn on_publish(&mut self, publish: Publish) -> Step {
        let mut step = Step::default();
        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => step.events.push(SessionEvent::Deliver(publish.to_message())),
            (QoS::AtLeastOnce, Some(id)) => {
                step.outbound.push(Packet::PubAck(id));
                step.events.push(SessionEvent::Deliver(publish.to_message()));
            }
            (QoS::ExactlyOnce, Some(id)) => {
                if self.inbound.contains_key(&id) {
                    debug!("Duplicate QoS 2 publish {}, resending PUBREC", id);
                } else {
                    self.inbound.insert(id, publish.to_message());
                }
                step.outbound.push(Packet::PubRec(id));
            }
            (_, None) => warn!("Dropping QoS {} publish without packet id", publish.qos),
        }
        step
    }

    fn on_puback(&mut self, packet_id: u16) -> Result<Step, MqttError> {
        self.expect_outbound(packet_id, OutboundState::AwaitingPubAck, PacketType::PubAck)?;
        self.outbound.remove(&packet_id);
        Ok(Step {
            outbound: Vec::new(),
            events: vec![SessionEvent::Acknowledged { packet_id }],
        })
    }

    fn on_pubrec(&mut self, packet_id: u16) -> Result<Step, MqttError> {
        match self.outbound.get_mut(&packet_id) {
            Some(entry) if entry.state == OutboundState::AwaitingPubRec => {
                entry.state = OutboundState::AwaitingPubComp;
                Ok(Step::send(Packet::PubRel(packet_id)))
            }
            // our PUBREL got lost, answer again
            Some(entry) if entry.state == OutboundState::AwaitingPubComp => {
                Ok(Step::send(Packet::PubRel(packet_id)))
            }
            _ => Err(unexpected_ack(PacketType::PubRec, packet_id)),
        }
    }

    fn on_pubrel(&mut self, packet_id: u16) -> Step {
        let mut step = Step::send(Packet::PubComp(packet_id));
        match self.inbound.remove(&packet_id) {
            Some(message) => step.events.push(SessionEvent::Deliver(message)),
            None => debug!("PUBREL for unknown packet {}, completing without delivery", packet_id),
        }
        step
    }

    fn on_pubcomp(&mut self, packet_id: u16) -> Result<Step, MqttError> {
        self.expect_outbound(packet_id, OutboundState::AwaitingPubComp, PacketType::PubComp)?;
        self.outbound.remove(&packet_id);
        Ok(Step {
            outbound: Vec::new(),
            events: vec![SessionEvent::Acknowledged { packet_id }],
        })
    }

    fn on_suback(&mut self, suback: SubAck) -> Result<Step, MqttError> {
        let filters = self
            .pending_subscribes
            .remove(&suback.packet_id)
            .ok_or_else(|| unexpected_ack(PacketType::SubAck, suback.packet_id))?;

        if filters.len() != suback.return_codes.len() {
            warn!(
                "SUBACK {} carries {} return codes for {} filters",
                suback.packet_id,
                suback.return_codes.len(),
                filters.len()
            );
        }

        let mut results = Vec::with_capacity(filters.len());
        for (index, (filter, _requested)) in filters.into_iter().enumerate() {
            let code = suback
                .return_codes
                .get(index)
                .copied()
                .unwrap_or(SubscribeReturnCode::Failure);
            match code {
                SubscribeReturnCode::Success(granted) => {
                    self.subscriptions.insert(filter.clone(), granted);
                }
                SubscribeReturnCode::Failure => {
                    warn!("Broker refused subscription to '{}'", filter);
                    self.subscriptions.remove(&filter);
                }
            }
            results.push((filter, code));
        }

        Ok(Step {
            outbound: Vec::new(),
            events: vec![SessionEvent::Subscribed {
                packet_id: suback.packet_id,
                results,
            }],
        })
    }

    fn on_unsuback(&mut self, packet_id: u16) -> Result<Step, MqttError> {
        let filters = self
            .pending_unsubscribes
            .remove(&packet_id)
            .ok_or_else(|| unexpected_ack(PacketType::UnsubAck, packet_id))?;
        for filter in &filters {
            self.subscriptions.remove(filter);
        }
        Ok(Step {
            outbound: Vec::new(),
            events: vec![SessionEvent::Unsubscribed { packet_id, filters }],
        })
    }

    fn expect_outbound(
        &self,
        packet_id: u16,
        expected: OutboundState,
        packet: PacketType,
    ) -> Result<(), MqttError> {
        match self.outbound.get(&packet_id) {
            Some(entry) if entry.state == expected => Ok(()),
            _ => Err(unexpected_ack(packet, packet_id)),
        }
    }

    /// Queues or sends an application message
    ///
    /// QoS 0 needs a live connection. QoS 1/2 messages get a packet id and are written
    /// immediately when connected, otherwise held until the next CONNACK.
    pub fn publish(&mut self, message: Message) -> Result<(Option<u16>, Step), MqttError> {
        validate_topic_name(&message.topic)?;

        if message.qos == QoS::AtMostOnce {
            if self.state != SessionState::Connected {
                return Err(TransportError::NotConnected.into());
            }
            return Ok((
                None,
                Step::send(Packet::Publish(Publish::from_message(&message, None, false))),
            ));
        }

        if !matches!(
            self.state,
            SessionState::Connected | SessionState::Connecting | SessionState::Reconnecting { .. }
        ) {
            return Err(TransportError::NotConnected.into());
        }

        let packet_id = self.allocate_packet_id()?;
        let connected = self.state == SessionState::Connected;
        let state = match message.qos {
            QoS::ExactlyOnce => OutboundState::AwaitingPubRec,
            _ => OutboundState::AwaitingPubAck,
        };

        let mut step = Step::default();
        if connected {
            step.outbound.push(Packet::Publish(Publish::from_message(
                &message,
                Some(packet_id),
                false,
            )));
        } else {
            debug!("Queued packet {} to '{}' until connected", packet_id, message.topic);
        }

        self.next_seq += 1;
        self.outbound.insert(
            packet_id,
            OutboundEntry {
                message,
                state,
                retries: 0,
                first_sent: connected.then(Instant::now),
                seq: self.next_seq,
            },
        );
        Ok((Some(packet_id), step))
    }

    pub fn subscribe(&mut self, filters: Vec<(String, QoS)>) -> Result<(u16, Step), MqttError> {
        if filters.is_empty() {
            return Err(ValidationError::NoFilters.into());
        }
        for (filter, _) in &filters {
            validate_filter(filter)?;
        }
        self.require_connected()?;

        let packet_id = self.allocate_packet_id()?;
        self.pending_subscribes.insert(packet_id, filters.clone());
        Ok((
            packet_id,
            Step::send(Packet::Subscribe(Subscribe { packet_id, filters })),
        ))
    }

    pub fn unsubscribe(&mut self, filters: Vec<String>) -> Result<(u16, Step), MqttError> {
        if filters.is_empty() {
            return Err(ValidationError::NoFilters.into());
        }
        for filter in &filters {
            validate_filter(filter)?;
        }
        self.require_connected()?;

        let packet_id = self.allocate_packet_id()?;
        self.pending_unsubscribes.insert(packet_id, filters.clone());
        Ok((
            packet_id,
            Step::send(Packet::Unsubscribe(Unsubscribe { packet_id, filters })),
        ))
    }

    /// Starts a graceful disconnect; only a connected session sends DISCONNECT
    pub fn begin_disconnect(&mut self) -> Step {
        let step = match self.state {
            SessionState::Connected => Step::send(Packet::Disconnect),
            _ => Step::default(),
        };
        if self.state != SessionState::Idle {
            self.state = SessionState::Disconnecting;
        }
        step
    }

    /// Completes a disconnect once the transport is released
    ///
    /// Clean sessions drop every table here; abandoned entries are reported.
    pub fn finish_disconnect(&mut self) -> Step {
        let mut step = Step::default();
        self.fail_pending_requests(&mut step);
        if self.options.clean_session {
            self.discard_session_state(true, &mut step);
        }
        self.state = SessionState::Idle;
        step
    }

    /// Records the loss of the transport
    ///
    /// Pending SUBSCRIBE/UNSUBSCRIBE requests fail. With `reconnect_attempt` set the session
    /// moves to `Reconnecting`, otherwise to `Idle`; in-flight entries are kept either way.
    pub fn connection_lost(&mut self, reconnect_attempt: Option<u32>) -> Step {
        let mut step = Step::default();
        self.fail_pending_requests(&mut step);
        self.state = match reconnect_attempt {
            Some(attempt) => SessionState::Reconnecting { attempt },
            None => SessionState::Idle,
        };
        step
    }

    /// Gives up an outbound entry on request, returning its message
    pub fn abort(&mut self, packet_id: u16) -> Option<Message> {
        self.outbound.remove(&packet_id).map(|entry| {
            debug!("Aborted packet {} to '{}'", packet_id, entry.message.topic);
            entry.message
        })
    }

    /// Removes every outbound entry in publish order, used when the session is replaced
    pub fn drain_outbound(&mut self) -> Vec<(u16, Message)> {
        let mut entries: Vec<(u64, u16, Message)> = self
            .outbound
            .drain()
            .map(|(id, entry)| (entry.seq, id, entry.message))
            .collect();
        entries.sort_unstable_by_key(|(seq, _, _)| *seq);
        entries
            .into_iter()
            .map(|(_, id, message)| (id, message))
            .collect()
    }

    fn require_connected(&self) -> Result<(), MqttError> {
        if self.state == SessionState::Connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected.into())
        }
    }

    fn fail_pending_requests(&mut self, step: &mut Step) {
        let ids = self
            .pending_subscribes
            .drain()
            .map(|(id, _)| id)
            .chain(self.pending_unsubscribes.drain().map(|(id, _)| id));
        step.events
            .extend(ids.map(|packet_id| SessionEvent::RequestFailed { packet_id }));
    }

    /// Clears subscriptions and in-flight state
    ///
    /// With `include_queued` unset, entries that were never written survive so publishes
    /// accepted while reconnecting still go out on the new connection.
    fn discard_session_state(&mut self, include_queued: bool, step: &mut Step) {
        self.fail_pending_requests(step);
        self.subscriptions.clear();
        self.inbound.clear();

        let mut dropped: Vec<(u64, u16)> = self
            .outbound
            .iter()
            .filter(|(_, entry)| include_queued || entry.first_sent.is_some())
            .map(|(id, entry)| (entry.seq, *id))
            .collect();
        dropped.sort_unstable();

        for (_, packet_id) in dropped {
            if let Some(entry) = self.outbound.remove(&packet_id) {
                step.events.push(SessionEvent::Abandoned {
                    packet_id,
                    message: entry.message,
                });
            }
        }
    }

    fn id_in_use(&self, id: u16) -> bool {
        self.outbound.contains_key(&id)
            || self.pending_subscribes.contains_key(&id)
            || self.pending_unsubscribes.contains_key(&id)
    }

    /// Next free identifier in 1..=65535, wrapping and skipping ids still in use
    fn allocate_packet_id(&mut self) -> Result<u16, ValidationError> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.id_in_use(id) {
                return Ok(id);
            }
        }
        Err(ValidationError::PacketIdsExhausted)
    }
}

fn unexpected_ack(packet: PacketType, packet_id: u16) -> MqttError {
    ProtocolError::UnexpectedAck { packet, packet_id }.into()
}

fn generate_client_id() -> String {
    format!("{}{:08x}", GENERATED_ID_PREFIX, rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(clean: bool) -> ConnectionOptions {
        ConnectionOptions::new("localhost", 1883)
            .with_client_id("unit")
            .with_clean_session(clean)
    }

    fn connected(clean: bool) -> Session {
        let mut session = Session::new(options(clean), 3).unwrap();
        session.start_connect().unwrap();
        session
            .handle(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Accepted,
            }))
            .unwrap();
        session
    }

    fn accept(session_present: bool) -> Packet {
        Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Accepted,
        })
    }

    #[test]
    fn generated_client_id_for_clean_sessions_only() {
        let options = ConnectionOptions::new("localhost", 1883);
        let session = Session::new(options.clone(), 3).unwrap();
        assert!(session.client_id().starts_with("mqtt-explorer-"));
        assert_eq!(session.client_id().len(), "mqtt-explorer-".len() + 8);

        assert_eq!(
            Session::new(options.with_clean_session(false), 3).unwrap_err(),
            ValidationError::EmptyClientId
        );
    }

    #[test]
    fn refused_connack_returns_to_idle() {
        let mut session = Session::new(options(true), 3).unwrap();
        let step = session.start_connect().unwrap();
        assert!(matches!(step.outbound[0], Packet::Connect(_)));

        let step = session
            .handle(Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::NotAuthorized,
            }))
            .unwrap();
        assert_eq!(
            step.events,
            vec![SessionEvent::ConnectRefused(ConnectReturnCode::NotAuthorized)]
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn qos1_ack_removes_only_matching_entry() {
        let mut session = connected(true);
        let (first, _) = session
            .publish(Message::new("a", "1", QoS::AtLeastOnce))
            .unwrap();
        let (second, _) = session
            .publish(Message::new("a", "2", QoS::AtLeastOnce))
            .unwrap();
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first, second);

        let step = session.handle(Packet::PubAck(first)).unwrap();
        assert_eq!(step.events, vec![SessionEvent::Acknowledged { packet_id: first }]);
        assert_eq!(session.outbound_len(), 1);
        assert!(session.outbound_entry(second).is_some());
    }

    #[test]
    fn qos2_handshake_in_order() {
        let mut session = connected(true);
        let (id, step) = session
            .publish(Message::new("a", "x", QoS::ExactlyOnce))
            .unwrap();
        let id = id.unwrap();
        assert!(matches!(&step.outbound[0], Packet::Publish(p) if p.packet_id == Some(id)));

        // PUBCOMP before PUBREL was sent
        let err = session.handle(Packet::PubComp(id)).unwrap_err();
        assert!(!err.is_fatal_to_connection());
        assert_eq!(
            session.outbound_entry(id).map(|e| e.state),
            Some(OutboundState::AwaitingPubRec)
        );

        // PUBACK does not complete a QoS 2 entry either
        assert!(session.handle(Packet::PubAck(id)).is_err());

        let step = session.handle(Packet::PubRec(id)).unwrap();
        assert_eq!(step.outbound, vec![Packet::PubRel(id)]);
        assert_eq!(
            session.outbound_entry(id).map(|e| e.state),
            Some(OutboundState::AwaitingPubComp)
        );

        let step = session.handle(Packet::PubComp(id)).unwrap();
        assert_eq!(step.events, vec![SessionEvent::Acknowledged { packet_id: id }]);
        assert_eq!(session.outbound_len(), 0);
    }

    #[test]
    fn duplicate_inbound_qos2_is_delivered_once() {
        let mut session = connected(true);
        let publish = |dup| {
            Packet::Publish(Publish {
                dup,
                qos: QoS::ExactlyOnce,
                retain: false,
                topic: "a/b".into(),
                packet_id: Some(5),
                payload: "x".into(),
            })
        };

        let step = session.handle(publish(false)).unwrap();
        assert_eq!(step.outbound, vec![Packet::PubRec(5)]);
        assert!(step.events.is_empty());

        let step = session.handle(publish(true)).unwrap();
        assert_eq!(step.outbound, vec![Packet::PubRec(5)]);
        assert!(step.events.is_empty());

        let step = session.handle(Packet::PubRel(5)).unwrap();
        assert_eq!(step.outbound, vec![Packet::PubComp(5)]);
        assert_eq!(step.events.len(), 1);

        let step = session.handle(Packet::PubRel(5)).unwrap();
        assert_eq!(step.outbound, vec![Packet::PubComp(5)]);
        assert!(step.events.is_empty());
    }

    #[test]
    fn resume_resends_as_duplicates_and_resubscribes() {
        let mut session = connected(false);
        let (sub_id, _) = session
            .subscribe(vec![("a/#".into(), QoS::AtLeastOnce), ("b".into(), QoS::ExactlyOnce)])
            .unwrap();
        session
            .handle(Packet::SubAck(SubAck {
                packet_id: sub_id,
                return_codes: vec![
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                    SubscribeReturnCode::Success(QoS::ExactlyOnce),
                ],
            }))
            .unwrap();

        let (q1, _) = session.publish(Message::new("a/1", "one", QoS::AtLeastOnce)).unwrap();
        let (q2, _) = session.publish(Message::new("a/2", "two", QoS::ExactlyOnce)).unwrap();
        let (q2b, _) = session.publish(Message::new("a/3", "three", QoS::ExactlyOnce)).unwrap();
        session.handle(Packet::PubRec(q2b.unwrap())).unwrap();

        session.connection_lost(Some(1));
        assert_eq!(session.state(), SessionState::Reconnecting { attempt: 1 });
        session.start_connect().unwrap();
        let step = session.handle(accept(true)).unwrap();

        assert_eq!(step.outbound.len(), 4);
        assert!(matches!(&step.outbound[0], Packet::Publish(p) if p.dup && p.packet_id == q1));
        assert!(matches!(&step.outbound[1], Packet::Publish(p) if p.dup && p.packet_id == q2));
        assert_eq!(step.outbound[2], Packet::PubRel(q2b.unwrap()));
        match &step.outbound[3] {
            Packet::Subscribe(s) => assert_eq!(
                s.filters,
                vec![("a/#".to_string(), QoS::AtLeastOnce), ("b".to_string(), QoS::ExactlyOnce)]
            ),
            other => panic!("expected SUBSCRIBE, got {:?}", other),
        }
        assert_eq!(session.outbound_entry(q1.unwrap()).map(|e| e.retries), Some(1));
    }

    #[test]
    fn clean_reconnect_starts_empty() {
        let mut session = connected(true);
        let (sub_id, _) = session.subscribe(vec![("a".into(), QoS::AtMostOnce)]).unwrap();
        session
            .handle(Packet::SubAck(SubAck {
                packet_id: sub_id,
                return_codes: vec![SubscribeReturnCode::Success(QoS::AtMostOnce)],
            }))
            .unwrap();
        let (id, _) = session.publish(Message::new("a", "x", QoS::AtLeastOnce)).unwrap();

        session.connection_lost(Some(1));
        // queued while reconnecting, survives the clean start
        let (queued, _) = session.publish(Message::new("a", "later", QoS::AtLeastOnce)).unwrap();

        let step = session.start_connect().unwrap();
        assert!(step.events.contains(&SessionEvent::Abandoned {
            packet_id: id.unwrap(),
            message: Message::new("a", "x", QoS::AtLeastOnce),
        }));
        assert!(session.subscriptions().is_empty());

        let step = session.handle(accept(false)).unwrap();
        assert_eq!(step.outbound.len(), 1);
        assert!(matches!(&step.outbound[0], Packet::Publish(p) if !p.dup && p.packet_id == queued));
    }

    #[test]
    fn redelivery_cap_abandons_entry() {
        let mut session = connected(false);
        let (id, _) = session.publish(Message::new("a", "x", QoS::AtLeastOnce)).unwrap();
        let id = id.unwrap();

        for attempt in 1..=3 {
            session.connection_lost(Some(attempt));
            session.start_connect().unwrap();
            let step = session.handle(accept(true)).unwrap();
            assert_eq!(step.outbound.len(), 1);
        }

        session.connection_lost(Some(4));
        session.start_connect().unwrap();
        let step = session.handle(accept(true)).unwrap();
        assert!(step.outbound.is_empty());
        assert!(matches!(
            step.events.as_slice(),
            [SessionEvent::Connected { .. }, SessionEvent::Abandoned { packet_id, .. }] if *packet_id == id
        ));
    }

    #[test]
    fn refused_filters_stay_out_of_subscription_set() {
        let mut session = connected(true);
        let (id, _) = session
            .subscribe(vec![("ok".into(), QoS::AtLeastOnce), ("denied".into(), QoS::AtLeastOnce)])
            .unwrap();
        let step = session
            .handle(Packet::SubAck(SubAck {
                packet_id: id,
                return_codes: vec![
                    SubscribeReturnCode::Success(QoS::AtMostOnce),
                    SubscribeReturnCode::Failure,
                ],
            }))
            .unwrap();
        assert!(matches!(&step.events[0], SessionEvent::Subscribed { results, .. } if results.len() == 2));
        assert_eq!(session.subscriptions().get("ok"), Some(&QoS::AtMostOnce));
        assert!(!session.subscriptions().contains_key("denied"));
    }

    #[test]
    fn illegal_packets_are_fatal() {
        let mut session = Session::new(options(true), 3).unwrap();
        session.start_connect().unwrap();
        let err = session
            .handle(Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "a".into(),
                packet_id: None,
                payload: "x".into(),
            }))
            .unwrap_err();
        assert!(err.is_fatal_to_connection());

        let mut session = connected(true);
        assert!(session.handle(accept(false)).unwrap_err().is_fatal_to_connection());
        assert!(session.handle(Packet::PingReq).unwrap_err().is_fatal_to_connection());
    }

    #[test]
    fn pending_requests_fail_on_connection_loss() {
        let mut session = connected(true);
        let (id, _) = session.subscribe(vec![("a".into(), QoS::AtMostOnce)]).unwrap();
        let step = session.connection_lost(None);
        assert_eq!(step.events, vec![SessionEvent::RequestFailed { packet_id: id }]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn qos0_requires_connection_and_validation_happens_first() {
        let mut session = Session::new(options(true), 3).unwrap();
        assert!(matches!(
            session.publish(Message::new("a", "x", QoS::AtMostOnce)),
            Err(MqttError::Transport(TransportError::NotConnected))
        ));
        assert!(matches!(
            session.publish(Message::new("a/#", "x", QoS::AtMostOnce)),
            Err(MqttError::Validation(ValidationError::WildcardInTopic(_)))
        ));
        assert!(matches!(
            session.subscribe(vec![("a#".into(), QoS::AtMostOnce)]),
            Err(MqttError::Validation(_))
        ));
    }

    #[test]
    fn packet_ids_wrap_and_skip_in_use() {
        let mut session = connected(true);
        session.next_packet_id = u16::MAX;
        let (a, _) = session.publish(Message::new("a", "x", QoS::AtLeastOnce)).unwrap();
        let (b, _) = session.publish(Message::new("a", "x", QoS::AtLeastOnce)).unwrap();
        assert_eq!(a, Some(u16::MAX));
        assert_eq!(b, Some(1));

        session.next_packet_id = u16::MAX;
        let (c, _) = session.publish(Message::new("a", "x", QoS::AtLeastOnce)).unwrap();
        assert_eq!(c, Some(2));
    }

    #[test]
    fn disconnect_clears_only_clean_sessions() {
        let mut session = connected(false);
        session.publish(Message::new("a", "x", QoS::AtLeastOnce)).unwrap();
        assert_eq!(session.begin_disconnect().outbound, vec![Packet::Disconnect]);
        let step = session.finish_disconnect();
        assert!(step.events.is_empty());
        assert_eq!(session.outbound_len(), 1);
        assert_eq!(session.state(), SessionState::Idle);

        let mut session = connected(true);
        session.publish(Message::new("a", "x", QoS::AtLeastOnce)).unwrap();
        session.begin_disconnect();
        let step = session.finish_disconnect();
        assert_eq!(step.events.len(), 1);
        assert_eq!(session.outbound_len(), 0);
    }
}
