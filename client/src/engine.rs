//! The synchronization engine
//!
//! [`SyncClient`] wires the components together: taps go through the
//! [`TapBatcher`] into the [`OptimisticLedger`], every outbound action goes
//! through the [`ConnectionManager`], and inbound server messages are
//! dispatched back into the ledger. It never blocks and never reads the
//! clock; the caller passes `now` into every call and asks
//! [`SyncClient::next_deadline`] when it next needs to call [`SyncClient::poll`].
//!
//! Observers registered with `on_state_update`, `on_error` and
//! `on_challenges_completed` run synchronously inside the call that caused them.

use crate::batcher::{PendingBatch, TapBatcher};
use crate::config::SyncConfig;
use crate::connection::{BackoffPolicy, ConnectionManager, ConnectionState, Delivery};
use crate::error::SyncError;
use crate::ledger::{LedgerSettings, OptimisticLedger, Reconciliation, Rollback};
use crate::sequence::SequenceAllocator;
use crate::transport::{Transport, TransportEvent};
use log::{debug, info, warn};
use shared::{ActionRejected, ClientMessage, GameStateSnapshot, ServerMessage, StateDelta};
use std::time::Instant;

pub type StateObserver = Box<dyn FnMut(&GameStateSnapshot) + Send>;
pub type ErrorObserver = Box<dyn FnMut(&SyncError) + Send>;
pub type ChallengeObserver = Box<dyn FnMut(&[String]) + Send>;

pub struct SyncClient {
    connection: ConnectionManager,
    batcher: TapBatcher,
    ledger: OptimisticLedger,
    sequence: SequenceAllocator,
    state_observers: Vec<StateObserver>,
    error_observers: Vec<ErrorObserver>,
    challenge_observers: Vec<ChallengeObserver>,
    last_state: ConnectionState,
}

impl SyncClient {
    pub fn new(transport: Box<dyn Transport>, config: &SyncConfig) -> Self {
        let backoff = BackoffPolicy {
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            max_attempts: config.max_reconnect_attempts,
        };

        Self {
            connection: ConnectionManager::new(
                transport,
                config.auth_token.clone(),
                backoff,
                config.action_queue_capacity,
            ),
            batcher: TapBatcher::new(config.tap_batch_interval, config.max_tap_batch_count),
            ledger: OptimisticLedger::new(LedgerSettings::from(config)),
            sequence: SequenceAllocator::new(config.initial_client_seq),
            state_observers: Vec::new(),
            error_observers: Vec::new(),
            challenge_observers: Vec::new(),
            last_state: ConnectionState::Disconnected,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn snapshot(&self) -> &GameStateSnapshot {
        self.ledger.snapshot()
    }

    pub fn ledger(&self) -> &OptimisticLedger {
        &self.ledger
    }

    pub fn queued_actions(&self) -> usize {
        self.connection.queue().len()
    }

    pub fn pending_batch(&self) -> &PendingBatch {
        self.batcher.pending()
    }

    pub fn on_state_update(&mut self, observer: impl FnMut(&GameStateSnapshot) + Send + 'static) {
        self.state_observers.push(Box::new(observer));
    }

    pub fn on_error(&mut self, observer: impl FnMut(&SyncError) + Send + 'static) {
        self.error_observers.push(Box::new(observer));
    }

    pub fn on_challenges_completed(&mut self, observer: impl FnMut(&[String]) + Send + 'static) {
        self.challenge_observers.push(Box::new(observer));
    }

    pub fn connect(&mut self, now: Instant) -> Result<(), SyncError> {
        let result = self.connection.connect(now);
        self.track_connection(result)
    }

    /// Flushes any pending taps, then closes the session and cancels every timer.
    pub fn disconnect(&mut self, now: Instant) {
        if let Err(e) = self.flush_taps(now) {
            debug!("Final tap flush failed: {}", e);
        }
        self.connection.disconnect();
        self.last_state = self.connection.state();
    }

    /// Registers `count` taps at `combo_multiplier`. The gain shows up in the
    /// snapshot immediately; the network message follows on the next flush.
    ///
    /// A flush triggered by this call that cannot be queued rolls the batch
    /// back, reports the overflow to the error observers and returns it.
    pub fn send_tap(&mut self, count: u32, combo_multiplier: f64, now: Instant) -> Result<(), SyncError> {
        if count == 0 {
            return Err(SyncError::InvalidInput("tap count must be positive".to_string()));
        }
        if !combo_multiplier.is_finite() || combo_multiplier <= 0.0 {
            return Err(SyncError::InvalidInput(format!(
                "invalid combo multiplier {}",
                combo_multiplier
            )));
        }

        let full = self.batcher.register_tap(
            count,
            combo_multiplier,
            now,
            &mut self.sequence,
            &mut self.ledger,
        );
        self.notify_state();

        match full {
            Some(batch) => self.send_batch(batch, now),
            None => Ok(()),
        }
    }

    /// Returns the clientSeq the purchase was sent or queued under.
    pub fn purchase_generator(
        &mut self,
        generator_id: &str,
        count: u32,
        now: Instant,
    ) -> Result<u64, SyncError> {
        if generator_id.is_empty() {
            return Err(SyncError::InvalidInput("generator id is empty".to_string()));
        }
        if count == 0 {
            return Err(SyncError::InvalidInput("purchase count must be positive".to_string()));
        }

        self.flush_before_action(now);
        let client_seq = self.sequence.next();
        self.send_action(
            ClientMessage::PurchaseGenerator {
                generator_id: generator_id.to_string(),
                count,
                client_seq,
            },
            now,
        )?;
        Ok(client_seq)
    }

    pub fn purchase_upgrade(&mut self, upgrade_id: &str, now: Instant) -> Result<u64, SyncError> {
        if upgrade_id.is_empty() {
            return Err(SyncError::InvalidInput("upgrade id is empty".to_string()));
        }

        self.flush_before_action(now);
        let client_seq = self.sequence.next();
        self.send_action(
            ClientMessage::PurchaseUpgrade {
                upgrade_id: upgrade_id.to_string(),
                client_seq,
            },
            now,
        )?;
        Ok(client_seq)
    }

    pub fn request_sync(&mut self, now: Instant) -> Result<(), SyncError> {
        self.flush_before_action(now);
        self.send_action(ClientMessage::SyncRequest {}, now)
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        let inbound = self.connection.handle_event(event, now);
        if let Err(e) = self.track_connection(Ok(())) {
            debug!("Connection error after transport event: {}", e);
        }

        if let Some(message) = inbound {
            self.dispatch(message, now);
        }
    }

    /// Fires whichever timers are due and advances passive production.
    pub fn poll(&mut self, now: Instant) {
        let result = self.connection.poll(now);
        if let Err(e) = self.track_connection(result) {
            debug!("Reconnect failed: {}", e);
        }

        if let Some(batch) = self.batcher.poll(now) {
            if let Err(e) = self.send_batch(batch, now) {
                debug!("Timed tap flush failed: {}", e);
            }
        }

        self.ledger.advance(now);
    }

    /// Earliest instant at which [`SyncClient::poll`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.connection.deadline(), self.batcher.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dispatch(&mut self, message: ServerMessage, now: Instant) {
        debug!("Received {}", message.type_name());

        match message {
            ServerMessage::StateFull(state) => {
                if self.ledger.reconcile_full(&state, now) == Reconciliation::Applied {
                    self.notify_state();
                }
            }
            ServerMessage::StateDelta(delta) => self.apply_delta(&delta, now),
            ServerMessage::TapConfirmed(confirmed) => {
                let outcome = self.ledger.reconcile_delta(
                    &confirmed.patch(),
                    confirmed.seq,
                    confirmed.server_timestamp,
                    &confirmed.confirmed_client_seqs,
                    now,
                );
                if outcome == Reconciliation::Applied {
                    self.notify_state();
                }
                if !confirmed.completed_challenges.is_empty() {
                    info!("Challenges completed: {:?}", confirmed.completed_challenges);
                    for observer in &mut self.challenge_observers {
                        observer(confirmed.completed_challenges.as_slice());
                    }
                }
            }
            ServerMessage::ActionRejected(rejection) => self.apply_rejection(rejection, now),
            ServerMessage::Error(payload) => {
                let description = payload
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string());
                warn!("Server error: {}", description);
                self.report_error(SyncError::Server(description));
            }
            ServerMessage::Ping {} => debug!("Ping reached the engine"),
        }
    }

    fn apply_delta(&mut self, delta: &StateDelta, now: Instant) {
        let confirmed = delta
            .confirmed_client_seq
            .map(|high_water| self.ledger.outstanding_up_to(high_water))
            .unwrap_or_default();

        let outcome = self.ledger.reconcile_delta(
            &delta.patch,
            delta.seq,
            delta.server_timestamp,
            &confirmed,
            now,
        );
        if outcome == Reconciliation::Applied {
            self.notify_state();
        }
    }

    fn apply_rejection(&mut self, rejection: ActionRejected, now: Instant) {
        if !self.sequence.has_issued(rejection.client_seq) {
            warn!(
                "Ignoring rejection of clientSeq {} which was never issued",
                rejection.client_seq
            );
            return;
        }

        warn!(
            "Server rejected clientSeq {}: {}",
            rejection.client_seq, rejection.reason
        );
        match self
            .ledger
            .reject_optimistic(rejection.client_seq, rejection.correct_state.as_ref(), now)
        {
            Rollback::Restored { essence } => debug!("Essence restored to {}", essence),
            Rollback::Diverged { live, expected } => debug!(
                "State already corrected (live {}, expected {})",
                live, expected
            ),
            Rollback::Unknown => {}
        }
        self.notify_state();

        self.report_error(SyncError::Rejected {
            client_seq: rejection.client_seq,
            reason: rejection.reason,
        });
    }

    // Taps registered before an action are sent ahead of it
    fn flush_before_action(&mut self, now: Instant) {
        if let Err(e) = self.flush_taps(now) {
            debug!("Tap flush ahead of action failed: {}", e);
        }
    }

    fn flush_taps(&mut self, now: Instant) -> Result<(), SyncError> {
        match self.batcher.flush() {
            Some(batch) => self.send_batch(batch, now),
            None => Ok(()),
        }
    }

    fn send_batch(&mut self, batch: PendingBatch, now: Instant) -> Result<(), SyncError> {
        let client_seqs = batch.client_seqs.clone();
        debug!("Flushing {} taps as {:?}", batch.count, client_seqs);

        match self.send_action(batch.into_message(), now) {
            Ok(()) => Ok(()),
            Err(e) => {
                for client_seq in client_seqs {
                    self.ledger.reject_optimistic(client_seq, None, now);
                }
                self.notify_state();
                self.report_error(e.clone());
                Err(e)
            }
        }
    }

    fn send_action(&mut self, message: ClientMessage, now: Instant) -> Result<(), SyncError> {
        let result = self.connection.send(message, now);
        // A failed send may have dropped the connection
        self.track_connection(Ok(()))?;

        match result? {
            Delivery::Sent => {}
            Delivery::Queued => debug!("Queued ({} waiting)", self.connection.queue().len()),
        }
        Ok(())
    }

    fn track_connection(&mut self, result: Result<(), SyncError>) -> Result<(), SyncError> {
        let state = self.connection.state();
        if state != self.last_state {
            debug!("Connection {:?} -> {:?}", self.last_state, state);
            self.last_state = state;
            if state == ConnectionState::Error && result.is_ok() {
                self.report_error(SyncError::ReconnectExhausted {
                    attempts: self.connection.attempt(),
                });
            }
        }

        if let Err(e) = &result {
            self.report_error(e.clone());
        }
        result
    }

    fn notify_state(&mut self) {
        let snapshot = self.ledger.snapshot();
        for observer in &mut self.state_observers {
            observer(snapshot);
        }
    }

    fn report_error(&mut self, error: SyncError) {
        for observer in &mut self.error_observers {
            observer(&error);
        }
    }
}
