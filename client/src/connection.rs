//! Connection lifecycle, reconnect backoff and offline queue replay

use crate::error::SyncError;
use crate::queue::ActionQueue;
use crate::transport::{SessionId, Transport, TransportEvent, TransportEventKind};
use log::{debug, error, info, warn};
use shared::{
    decode_client_message, decode_server_message, encode_client_message, ClientMessage,
    ServerMessage,
};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; stays here until `connect` is called again
    Error,
}

/// `min(base * 2^attempt, max)`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

/// Owns the transport and the connection state machine.
///
/// Messages sent while not connected go to the offline queue, which is
/// replayed in full as part of the transition to `Connected`, before control
/// returns to the caller.
pub struct ConnectionManager {
    transport: Box<dyn Transport>,
    auth_token: String,
    state: ConnectionState,
    session: Option<SessionId>,
    attempt: u32,
    reconnect_at: Option<Instant>,
    queue: ActionQueue,
    backoff: BackoffPolicy,
}

impl ConnectionManager {
    pub fn new(
        transport: Box<dyn Transport>,
        auth_token: impl Into<String>,
        backoff: BackoffPolicy,
        queue_capacity: usize,
    ) -> Self {
        Self {
            transport,
            auth_token: auth_token.into(),
            state: ConnectionState::Disconnected,
            session: None,
            attempt: 0,
            reconnect_at: None,
            queue: ActionQueue::new(queue_capacity),
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    /// Opens a session unless one is open or opening. Cancels any pending
    /// reconnect timer. When called from `Error`, the attempt counter starts over.
    pub fn connect(&mut self, now: Instant) -> Result<(), SyncError> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!("connect() ignored, already {:?}", self.state);
                return Ok(());
            }
            ConnectionState::Error => self.attempt = 0,
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
        }

        self.reconnect_at = None;
        self.open_session(now)
    }

    /// Cancels the reconnect timer and closes the session. Nothing reconnects
    /// until `connect` is called again.
    pub fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.session = None;
        self.transport.close();
        if self.state != ConnectionState::Disconnected {
            info!("Disconnected");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Fires the reconnect timer if it is due
    pub fn poll(&mut self, now: Instant) -> Result<(), SyncError> {
        match self.reconnect_at {
            Some(deadline) if now >= deadline && self.state == ConnectionState::Reconnecting => {
                self.reconnect_at = None;
                info!("Reconnect attempt {}", self.attempt);
                self.open_session(now)
            }
            _ => Ok(()),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Transmits when connected, otherwise queues. A send failure on a live
    /// session counts as a dropped connection and the message is queued.
    pub fn send(&mut self, message: ClientMessage, now: Instant) -> Result<Delivery, SyncError> {
        if self.state == ConnectionState::Connected {
            let frame = encode_client_message(&message)?;
            match self.transport.send(frame) {
                Ok(()) => return Ok(Delivery::Sent),
                Err(e) => {
                    warn!("Send failed, connection lost: {}", e);
                    self.connection_lost(now);
                }
            }
        }

        self.queue.enqueue(message, now)?;
        Ok(Delivery::Queued)
    }

    /// Applies a transport event. Returns inbound messages for dispatch;
    /// keepalive is answered here and malformed frames are dropped.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) -> Option<ServerMessage> {
        // Accepted even from a replaced session; these actions would be lost otherwise
        if let TransportEventKind::Undelivered(frames) = &event.kind {
            self.requeue_undelivered(event.session, frames, now);
            return None;
        }

        if self.session != Some(event.session) {
            debug!(
                "Ignoring {:?} from stale session {}",
                event.kind, event.session.0
            );
            return None;
        }

        match event.kind {
            TransportEventKind::Opened => {
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Connected;
                    self.attempt = 0;
                    self.reconnect_at = None;
                    info!("Connected (session {})", event.session.0);
                    self.replay_queue(now);
                }
                None
            }
            TransportEventKind::Frame(text) => match decode_server_message(&text) {
                Ok(ServerMessage::Ping {}) => {
                    self.reply_pong();
                    None
                }
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Ignoring inbound frame: {}", e);
                    None
                }
            },
            TransportEventKind::Closed {
                server_initiated: true,
            } => {
                info!("Server closed the session");
                self.disconnect();
                None
            }
            TransportEventKind::Closed {
                server_initiated: false,
            } => {
                warn!("Connection dropped");
                self.connection_lost(now);
                None
            }
            TransportEventKind::Error(reason) => {
                warn!("Transport error: {}", reason);
                self.connection_lost(now);
                None
            }
            TransportEventKind::Undelivered(_) => None,
        }
    }

    fn open_session(&mut self, now: Instant) -> Result<(), SyncError> {
        self.state = ConnectionState::Connecting;
        match self.transport.open(&self.auth_token) {
            Ok(session) => {
                debug!("Connecting (session {})", session.0);
                self.session = Some(session);
                Ok(())
            }
            Err(SyncError::InvalidInput(reason)) => {
                error!("Cannot open a session: {}", reason);
                self.session = None;
                self.state = ConnectionState::Error;
                Err(SyncError::InvalidInput(reason))
            }
            Err(e) => {
                warn!("Failed to open session: {}", e);
                self.connection_lost(now);
                Ok(())
            }
        }
    }

    fn connection_lost(&mut self, now: Instant) {
        self.session = None;
        self.transport.close();

        if self.attempt >= self.backoff.max_attempts {
            error!(
                "Giving up after {} reconnect attempts",
                self.attempt
            );
            self.reconnect_at = None;
            self.state = ConnectionState::Error;
            return;
        }

        let delay = self.backoff.delay(self.attempt);
        self.attempt += 1;
        self.state = ConnectionState::Reconnecting;
        self.reconnect_at = Some(now + delay);
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, self.attempt, self.backoff.max_attempts
        );
    }

    fn replay_queue(&mut self, now: Instant) {
        if self.queue.is_empty() {
            return;
        }

        let transport = &mut self.transport;
        let result = self.queue.drain_in_order(|action| {
            let frame = encode_client_message(&action.message)?;
            transport.send(frame)
        });

        match result {
            Ok(replayed) => info!("Replayed {} queued actions", replayed),
            Err(e) => {
                warn!("Connection lost while replaying queue: {}", e);
                self.connection_lost(now);
            }
        }
    }

    fn requeue_undelivered(&mut self, from: SessionId, frames: &[String], now: Instant) {
        let messages: Vec<ClientMessage> = frames
            .iter()
            .filter_map(|frame| match decode_client_message(frame) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Dropping unsent frame that does not decode: {}", e);
                    None
                }
            })
            .collect();

        let requeued = self.queue.requeue_front(messages, now);
        if requeued > 0 {
            info!("Requeued {} actions unsent by session {}", requeued, from.0);
        }

        // A newer session is already live, so nothing else will trigger a replay
        if self.state == ConnectionState::Connected && self.session != Some(from) {
            self.replay_queue(now);
        }
    }

    fn reply_pong(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let result = encode_client_message(&ClientMessage::Pong {})
            .map_err(SyncError::from)
            .and_then(|frame| self.transport.send(frame));
        if let Err(e) = result {
            warn!("Failed to answer ping: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use shared::encode_server_message;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(1000);

    fn manager(max_attempts: u32, capacity: usize) -> (ConnectionManager, MemoryTransport) {
        let transport = MemoryTransport::new();
        let wire = transport.clone();
        let backoff = BackoffPolicy {
            base_delay: BASE,
            max_delay: MAX,
            max_attempts,
        };
        (
            ConnectionManager::new(Box::new(transport), "token", backoff, capacity),
            wire,
        )
    }

    fn opened(wire: &MemoryTransport) -> TransportEvent {
        TransportEvent::new(wire.current_session().unwrap(), TransportEventKind::Opened)
    }

    fn purchase(seq: u64) -> ClientMessage {
        ClientMessage::PurchaseUpgrade {
            upgrade_id: "gloves".to_string(),
            client_seq: seq,
        }
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(0, BASE, MAX), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, BASE, MAX), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, BASE, MAX), Duration::from_millis(800));
        assert_eq!(backoff_delay(4, BASE, MAX), MAX);
        assert_eq!(backoff_delay(64, BASE, MAX), MAX);
    }

    #[test]
    fn test_connect_lifecycle() {
        let (mut manager, wire) = manager(3, 8);
        let now = Instant::now();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect(now).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(wire.tokens(), vec!["token".to_string()]);

        manager.handle_event(opened(&wire), now);
        assert_eq!(manager.state(), ConnectionState::Connected);

        // Already connected: no second socket
        manager.connect(now).unwrap();
        assert_eq!(wire.open_count(), 1);
    }

    #[test]
    fn test_send_while_connected() {
        let (mut manager, wire) = manager(3, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);

        assert_eq!(manager.send(purchase(1), now), Ok(Delivery::Sent));
        assert_eq!(wire.sent_messages(), vec![purchase(1)]);
        assert!(manager.queue().is_empty());
    }

    #[test]
    fn test_send_while_disconnected_queues() {
        let (mut manager, wire) = manager(3, 1);
        let now = Instant::now();

        assert_eq!(manager.send(purchase(1), now), Ok(Delivery::Queued));
        assert!(matches!(
            manager.send(purchase(2), now),
            Err(SyncError::QueueFull { capacity: 1, .. })
        ));
        assert!(wire.sent_frames().is_empty());
    }

    #[test]
    fn test_queue_replayed_on_connect() {
        let (mut manager, wire) = manager(3, 8);
        let now = Instant::now();
        for seq in 1..=3 {
            manager.send(purchase(seq), now).unwrap();
        }

        manager.connect(now).unwrap();
        assert!(wire.sent_frames().is_empty());
        manager.handle_event(opened(&wire), now);

        assert_eq!(wire.sent_messages(), vec![purchase(1), purchase(2), purchase(3)]);
        assert!(manager.queue().is_empty());
    }

    #[test]
    fn test_drop_schedules_backoff() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);

        let session = wire.current_session().unwrap();
        manager.handle_event(
            TransportEvent::new(session, TransportEventKind::Closed { server_initiated: false }),
            now,
        );

        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.attempt(), 1);
        assert_eq!(manager.reconnect_deadline(), Some(now + BASE));

        // Not yet due
        manager.poll(now + BASE / 2).unwrap();
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        manager.poll(now + BASE).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(wire.open_count(), 2);

        // Second failure doubles the delay
        let later = now + BASE;
        let session = wire.current_session().unwrap();
        manager.handle_event(
            TransportEvent::new(session, TransportEventKind::Error("refused".to_string())),
            later,
        );
        assert_eq!(manager.reconnect_deadline(), Some(later + BASE * 2));

        // Success resets the counter
        manager.poll(later + BASE * 2).unwrap();
        manager.handle_event(opened(&wire), later + BASE * 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.attempt(), 0);
    }

    #[test]
    fn test_server_close_does_not_reconnect() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);

        let session = wire.current_session().unwrap();
        manager.handle_event(
            TransportEvent::new(session, TransportEventKind::Closed { server_initiated: true }),
            now,
        );

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reconnect_deadline(), None);
        manager.poll(now + MAX * 10).unwrap();
        assert_eq!(wire.open_count(), 1);
    }

    #[test]
    fn test_exhausted_attempts_enter_error() {
        let (mut manager, wire) = manager(2, 8);
        let mut now = Instant::now();
        wire.set_fail_open(true);

        manager.connect(now).unwrap();
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        for _ in 0..2 {
            now = manager.reconnect_deadline().unwrap();
            manager.poll(now).unwrap();
        }

        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(manager.reconnect_deadline(), None);

        // Manual connect starts over
        wire.set_fail_open(false);
        manager.connect(now).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(manager.attempt(), 0);
    }

    #[test]
    fn test_disconnect_cancels_reconnect_timer() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        wire.set_fail_open(true);
        manager.connect(now).unwrap();
        assert!(manager.reconnect_deadline().is_some());

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reconnect_deadline(), None);

        wire.set_fail_open(false);
        manager.poll(now + MAX).unwrap();
        assert_eq!(wire.open_count(), 0);
    }

    #[test]
    fn test_manual_connect_cancels_reconnect_timer() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);
        let session = wire.current_session().unwrap();
        manager.handle_event(
            TransportEvent::new(session, TransportEventKind::Error("reset".to_string())),
            now,
        );
        assert!(manager.reconnect_deadline().is_some());

        manager.connect(now).unwrap();
        assert_eq!(manager.reconnect_deadline(), None);
        assert_eq!(wire.open_count(), 2);

        // The cancelled timer must not open a third socket
        manager.poll(now + MAX).unwrap();
        assert_eq!(wire.open_count(), 2);
    }

    #[test]
    fn test_stale_session_events_ignored() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        let old = wire.current_session().unwrap();
        manager.disconnect();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);

        manager.handle_event(
            TransportEvent::new(old, TransportEventKind::Closed { server_initiated: false }),
            now,
        );
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);

        let ping = encode_server_message(&ServerMessage::Ping {}).unwrap();
        let session = wire.current_session().unwrap();
        let inbound =
            manager.handle_event(TransportEvent::new(session, TransportEventKind::Frame(ping)), now);

        assert!(inbound.is_none());
        assert_eq!(wire.sent_messages(), vec![ClientMessage::Pong {}]);
    }

    #[test]
    fn test_malformed_frame_ignored() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);
        let session = wire.current_session().unwrap();

        let inbound = manager.handle_event(
            TransportEvent::new(session, TransportEventKind::Frame("{garbage".to_string())),
            now,
        );
        assert!(inbound.is_none());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_send_failure_requeues_and_reconnects() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);

        wire.fail_sends_after(0);
        assert_eq!(manager.send(purchase(1), now), Ok(Delivery::Queued));
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.queue().len(), 1);

        wire.restore_sends();
        manager.poll(now + BASE).unwrap();
        manager.handle_event(opened(&wire), now + BASE);
        assert_eq!(wire.sent_messages(), vec![purchase(1)]);
    }

    #[test]
    fn test_interrupted_replay_keeps_remainder() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        for seq in 1..=3 {
            manager.send(purchase(seq), now).unwrap();
        }

        wire.fail_sends_after(1);
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.queue().len(), 2);

        wire.restore_sends();
        manager.poll(now + BASE).unwrap();
        manager.handle_event(opened(&wire), now + BASE);

        assert_eq!(wire.sent_messages(), vec![purchase(1), purchase(2), purchase(3)]);
    }

    fn undelivered(session: SessionId, messages: &[ClientMessage]) -> TransportEvent {
        let frames = messages
            .iter()
            .map(|m| encode_client_message(m).unwrap())
            .collect();
        TransportEvent::new(session, TransportEventKind::Undelivered(frames))
    }

    #[test]
    fn test_unsent_frames_requeued_ahead_of_later_actions() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        for seq in 1..=3 {
            manager.send(purchase(seq), now).unwrap();
        }
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);
        // Replay was accepted by the transport but the socket died before writing
        assert!(manager.queue().is_empty());
        wire.take_sent();

        let session = wire.current_session().unwrap();
        manager.handle_event(undelivered(session, &[purchase(2), purchase(3)]), now);
        assert_eq!(manager.queue().len(), 2);

        manager.handle_event(
            TransportEvent::new(session, TransportEventKind::Error("broken pipe".to_string())),
            now,
        );
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.send(purchase(4), now), Ok(Delivery::Queued));

        manager.poll(now + BASE).unwrap();
        manager.handle_event(opened(&wire), now + BASE);
        assert_eq!(
            wire.sent_messages(),
            vec![purchase(2), purchase(3), purchase(4)]
        );
        assert!(manager.queue().is_empty());
    }

    #[test]
    fn test_unsent_frames_from_replaced_session_replayed() {
        let (mut manager, wire) = manager(5, 8);
        let now = Instant::now();
        manager.connect(now).unwrap();
        let old = wire.current_session().unwrap();
        manager.disconnect();
        manager.connect(now).unwrap();
        manager.handle_event(opened(&wire), now);

        manager.handle_event(
            undelivered(old, &[purchase(1), ClientMessage::Pong {}]),
            now,
        );

        assert_eq!(wire.sent_messages(), vec![purchase(1)]);
        assert!(manager.queue().is_empty());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }
}
