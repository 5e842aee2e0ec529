//! Connection task
//!
//! One task per [`Client`](super::client::Client) connect call. It opens the transport,
//! performs the CONNECT/CONNACK handshake, then serves the connection until it is lost
//! or cancelled, and applies the reconnect policy in between.
//!
//! ```text
//!   ┌──────────► establish ──(ok)──► serve ──(lost)──┐
//!   │               │                                 │
//!   │             (failed)                            ▼
//!   └──(backoff)─── handle_loss ◄─────────────────────┘
//!                       │
//!              (refused / exhausted / cancelled) ──► exit
//! ```
//!
//! Cancellation always comes from the client (`disconnect`, `cancel_reconnect`), which
//! takes ownership of the session transition. A task that notices it no longer owns the
//! driver slot exits without touching the session.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{ConnectOutcome, DisconnectReason, Event, Inner};
use super::codec::MqttCodec;
use super::error::{MqttError, TransportError};
use super::keepalive::{KeepAlive, KeepAliveAction};
use super::packet::Packet;
use super::session::SessionEvent;
use super::transport::Transport;

type Transported = Framed<Box<dyn Transport>, MqttCodec>;

/// Handle to a running connection task
pub(crate) struct DriverHandle {
    pub(crate) id: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl DriverHandle {
    /// Cancels the task and waits for it to release the transport
    pub(crate) async fn stop(mut self, grace: Duration) {
        self.cancel.cancel();
        if timeout(grace, &mut self.join).await.is_err() {
            warn!("Connection task {} did not stop within {:?}, aborting", self.id, grace);
            self.join.abort();
        }
    }
}

pub(crate) fn spawn(inner: Arc<Inner>, id: u64) -> DriverHandle {
    let cancel = CancellationToken::new();
    let join = tokio::spawn(run(inner, id, cancel.clone()));
    DriverHandle { id, cancel, join }
}

enum Attempt {
    Connected(Connection),
    Failed(MqttError),
    Cancelled,
}

enum Exit {
    Lost(MqttError),
    Cancelled,
}

struct Connection {
    framed: Transported,
    outbound: mpsc::UnboundedReceiver<Packet>,
    keep_alive: KeepAlive,
}

impl Connection {
    async fn write(&mut self, inner: &Inner, packet: Packet) -> Result<(), MqttError> {
        let is_publish = matches!(packet, Packet::Publish(_));
        self.framed.send(packet).await?;
        self.keep_alive.on_packet_sent(Instant::now());
        if is_publish {
            inner.record_sent();
        }
        Ok(())
    }

    /// Writes whatever the client queued (usually DISCONNECT) and closes the stream
    async fn shutdown(mut self, inner: &Inner) {
        while let Ok(packet) = self.outbound.try_recv() {
            if let Err(e) = self.write(inner, packet).await {
                debug!("Write during shutdown failed: {}", e);
                return;
            }
        }
        if let Err(e) = self.framed.close().await {
            debug!("Closing transport failed: {}", e);
        }
    }
}

async fn run(inner: Arc<Inner>, id: u64, cancel: CancellationToken) {
    let mut attempt = 0u32;

    loop {
        let error = match establish(&inner, &cancel).await {
            Attempt::Cancelled => return,
            Attempt::Failed(error) => error,
            Attempt::Connected(connection) => {
                attempt = 0;
                match serve(&inner, &cancel, connection).await {
                    Exit::Cancelled => return,
                    Exit::Lost(error) => error,
                }
            }
        };

        if !handle_loss(&inner, id, &cancel, &mut attempt, error).await {
            return;
        }
    }
}

async fn establish(inner: &Arc<Inner>, cancel: &CancellationToken) -> Attempt {
    let deadline = Instant::now() + inner.settings.connect_timeout();
    tokio::select! {
        _ = cancel.cancelled() => Attempt::Cancelled,
        result = timeout_at(deadline, handshake(inner)) => match result {
            Ok(Ok(connection)) => Attempt::Connected(connection),
            Ok(Err(error)) => Attempt::Failed(error),
            Err(_) => Attempt::Failed(TransportError::ConnectTimeout.into()),
        },
    }
}

async fn handshake(inner: &Arc<Inner>) -> Result<Connection, MqttError> {
    let options = {
        let mut shared = inner.shared.lock().await;
        shared.session_mut()?.options().clone()
    };

    let stream = inner.connector.connect(&options).await?;
    let mut framed = Framed::new(stream, MqttCodec::new(inner.settings.max_packet_size));

    let (packets, events) = {
        let mut shared = inner.shared.lock().await;
        let session = shared.session_mut()?;
        let step = session.start_connect()?;
        let clean = session.is_clean();
        inner.set_state(session.state());
        if clean {
            inner.clear_registry();
        }
        let events = shared.complete(step.events);
        (step.outbound, events)
    };
    inner.emit_all(events).await;
    for packet in packets {
        framed.send(packet).await?;
    }

    let reply = match framed.next().await {
        Some(result) => result?,
        None => return Err(TransportError::ConnectionClosed.into()),
    };

    let (sender, receiver) = mpsc::unbounded_channel();
    let (packets, events) = {
        let mut shared = inner.shared.lock().await;
        let session = shared.session_mut()?;
        let step = session.handle(reply)?;
        inner.set_state(session.state());

        let refused = step.events.iter().find_map(|event| match event {
            SessionEvent::ConnectRefused(code) => Some(*code),
            _ => None,
        });
        if let Some(code) = refused {
            return Err(MqttError::Auth(code));
        }

        let outcome = ConnectOutcome {
            session_present: step.events.iter().any(|event| {
                matches!(event, SessionEvent::Connected { session_present: true })
            }),
            client_id: session.client_id().to_string(),
        };
        shared.outbound = Some(sender);
        let events = shared.complete(step.events);
        if let Some(waiter) = shared.connect_waiter.take() {
            let _ = waiter.send(Ok(outcome));
        }
        (step.outbound, events)
    };

    let mut connection = Connection {
        framed,
        outbound: receiver,
        keep_alive: KeepAlive::new(
            options.keep_alive(),
            inner.settings.keep_alive_timeout_percent,
            Instant::now(),
        ),
    };
    inner.emit_all(events).await;
    for packet in packets {
        connection.write(inner, packet).await?;
    }
    Ok(connection)
}

async fn serve(inner: &Arc<Inner>, cancel: &CancellationToken, mut connection: Connection) -> Exit {
    loop {
        let deadline = connection.keep_alive.next_deadline();

        tokio::select! {
            _ = cancel.cancelled() => {
                connection.shutdown(inner).await;
                return Exit::Cancelled;
            }
            frame = connection.framed.next() => {
                let packet = match frame {
                    Some(Ok(packet)) => packet,
                    Some(Err(error)) => return Exit::Lost(error),
                    None => return Exit::Lost(TransportError::ConnectionClosed.into()),
                };
                connection.keep_alive.on_packet_received(Instant::now());
                if let Err(error) = process_inbound(inner, &mut connection, packet).await {
                    return Exit::Lost(error);
                }
            }
            queued = connection.outbound.recv() => match queued {
                Some(packet) => {
                    if let Err(error) = connection.write(inner, packet).await {
                        return Exit::Lost(error);
                    }
                }
                // sender dropped by disconnect, cancellation follows
                None => {
                    cancel.cancelled().await;
                    connection.shutdown(inner).await;
                    return Exit::Cancelled;
                }
            },
            _ = keep_alive_tick(deadline) => match connection.keep_alive.poll(Instant::now()) {
                KeepAliveAction::SendPing => {
                    debug!("Sending PINGREQ");
                    if let Err(error) = connection.write(inner, Packet::PingReq).await {
                        return Exit::Lost(error);
                    }
                }
                KeepAliveAction::Expired => {
                    warn!("Nothing received from broker within the keep-alive window");
                    return Exit::Lost(TransportError::KeepAliveTimeout.into());
                }
                KeepAliveAction::Idle => {}
            },
        }
    }
}

async fn keep_alive_tick(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn process_inbound(
    inner: &Arc<Inner>,
    connection: &mut Connection,
    packet: Packet,
) -> Result<(), MqttError> {
    let result = {
        let mut shared = inner.shared.lock().await;
        let session = shared.session_mut()?;
        match session.handle(packet) {
            Ok(step) => {
                inner.set_state(session.state());
                let events = shared.complete(step.events);
                Ok((step.outbound, events))
            }
            Err(error) => Err(error),
        }
    };

    match result {
        Ok((packets, events)) => {
            inner.emit_all(events).await;
            for packet in packets {
                connection.write(inner, packet).await?;
            }
            Ok(())
        }
        Err(error) if !error.is_fatal_to_connection() => {
            warn!("Ignoring {}", error);
            inner.record_error(&error);
            Ok(())
        }
        Err(error) => {
            error!("Closing connection: {}", error);
            Err(error)
        }
    }
}

/// Applies the reconnect policy after a failed attempt or a lost connection
///
/// Returns whether the task should try again.
async fn handle_loss(
    inner: &Arc<Inner>,
    id: u64,
    cancel: &CancellationToken,
    attempt: &mut u32,
    error: MqttError,
) -> bool {
    let reason = DisconnectReason::from_error(&error);
    let refused = matches!(reason, DisconnectReason::Refused(_));
    let next_attempt = *attempt + 1;
    let policy = &inner.settings.reconnect;
    let retry = !refused && policy.should_retry(next_attempt);

    inner.record_error(&error);

    let mut events = {
        let mut shared = inner.shared.lock().await;
        if cancel.is_cancelled() || !shared.owns_driver(id) {
            return false;
        }
        shared.outbound = None;
        let step = match shared.session.as_mut() {
            Some(session) => {
                let step = session.connection_lost(retry.then_some(next_attempt));
                inner.set_state(session.state());
                step
            }
            None => Default::default(),
        };
        let events = shared.complete(step.events);
        shared.fail_connect(error);
        if !retry {
            shared.driver = None;
        }
        events
    };

    if *attempt == 0 || refused {
        info!("Connection ended: {:?}", reason);
        events.push(Event::Disconnected(reason));
    } else if !retry {
        warn!("Giving up after {} reconnect attempts", *attempt);
        events.push(Event::Disconnected(DisconnectReason::ReconnectExhausted));
    }

    let delay = policy.delay_for(next_attempt);
    if retry {
        info!("Reconnecting in {:?} (attempt {})", delay, next_attempt);
        events.push(Event::Reconnecting {
            attempt: next_attempt,
            delay,
        });
    }
    inner.emit_all(events).await;

    *attempt = next_attempt;
    if !retry {
        return false;
    }

    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
