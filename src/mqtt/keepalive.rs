//! Keep-alive bookkeeping for one connection
//!
//! Tracks when the last packet went out, when the last one came in and whether a
//! PINGREQ is outstanding. The connection loop asks [`KeepAlive::poll`] what to do
//! whenever the deadline from [`KeepAlive::next_deadline`] passes.
//!
//! The connection is dead once nothing has been received for the response window,
//! however busy the outbound side is. A quiet inbound side therefore also triggers a
//! ping, so a client that only publishes still hears from a live broker.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Nothing due yet
    Idle,
    /// Send exactly one PINGREQ now
    SendPing,
    /// Nothing was received within the response window
    Expired,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    response_timeout: Duration,
    last_sent: Instant,
    last_received: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    /// `timeout_percent` is relative to `interval`; 150 gives the usual 1.5x window
    pub fn new(interval: Duration, timeout_percent: u32, now: Instant) -> Self {
        Self {
            interval,
            response_timeout: interval * timeout_percent / 100,
            last_sent: now,
            last_received: now,
            ping_sent_at: None,
        }
    }

    /// Zero interval disables keep-alive
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn on_packet_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Any inbound packet proves the connection alive
    pub fn on_packet_received(&mut self, now: Instant) {
        self.last_received = now;
        self.ping_sent_at = None;
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    pub fn poll(&mut self, now: Instant) -> KeepAliveAction {
        if !self.is_enabled() {
            return KeepAliveAction::Idle;
        }
        if now >= self.last_received + self.response_timeout {
            return KeepAliveAction::Expired;
        }
        if self.ping_sent_at.is_none() && now >= self.ping_due() {
            self.ping_sent_at = Some(now);
            self.last_sent = now;
            return KeepAliveAction::SendPing;
        }
        KeepAliveAction::Idle
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.is_enabled() {
            return None;
        }
        let expiry = self.last_received + self.response_timeout;
        Some(match self.ping_sent_at {
            Some(_) => expiry,
            None => self.ping_due().min(expiry),
        })
    }

    fn ping_due(&self) -> Instant {
        self.last_sent.min(self.last_received) + self.interval
    }
}
