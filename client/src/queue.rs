//! Bounded offline queue for actions attempted while not connected

use crate::error::SyncError;
use log::{debug, warn};
use shared::{ActionKind, ClientMessage};
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAction {
    pub kind: ActionKind,
    pub message: ClientMessage,
    pub enqueued_at: Instant,
}

/// FIFO of actions waiting for a live session.
///
/// Entries leave the queue only by being handed to a sender that reports
/// success, so each one is replayed exactly once and strictly in enqueue order.
#[derive(Debug)]
pub struct ActionQueue {
    actions: VecDeque<QueuedAction>,
    capacity: usize,
}

impl ActionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            actions: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends to the tail. At capacity the action is refused with
    /// [`SyncError::QueueFull`] and the queue is left unchanged.
    pub fn enqueue(&mut self, message: ClientMessage, now: Instant) -> Result<(), SyncError> {
        let kind = message.action_kind().ok_or_else(|| {
            SyncError::InvalidInput("keepalive traffic cannot be queued".to_string())
        })?;

        if self.actions.len() >= self.capacity {
            warn!(
                "Offline queue full ({} actions), refusing {}",
                self.capacity,
                kind.as_str()
            );
            return Err(SyncError::QueueFull {
                capacity: self.capacity,
                kind,
            });
        }

        self.actions.push_back(QueuedAction {
            kind,
            message,
            enqueued_at: now,
        });
        debug!("Queued {} ({} pending)", kind.as_str(), self.actions.len());
        Ok(())
    }

    /// Hands entries to `sender` head first. Stops at the first failure and
    /// keeps that entry and everything behind it for the next drain.
    ///
    /// Returns the number of actions delivered.
    pub fn drain_in_order<F>(&mut self, mut sender: F) -> Result<usize, SyncError>
    where
        F: FnMut(&QueuedAction) -> Result<(), SyncError>,
    {
        let mut delivered = 0;

        while let Some(action) = self.actions.front() {
            if let Err(e) = sender(action) {
                warn!(
                    "Drain interrupted after {} actions, {} remain: {}",
                    delivered,
                    self.actions.len(),
                    e
                );
                return Err(e);
            }
            self.actions.pop_front();
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Puts actions that were handed out but never delivered back at the head,
    /// keeping their relative order. These were accepted once already, so
    /// capacity is not enforced and the queue may run over it until drained.
    ///
    /// Returns the number of actions requeued; keepalive traffic is skipped.
    pub fn requeue_front(&mut self, messages: Vec<ClientMessage>, now: Instant) -> usize {
        let mut requeued = 0;

        for message in messages.into_iter().rev() {
            let Some(kind) = message.action_kind() else {
                continue;
            };
            self.actions.push_front(QueuedAction {
                kind,
                message,
                enqueued_at: now,
            });
            requeued += 1;
        }

        if self.actions.len() > self.capacity {
            warn!(
                "Offline queue over capacity after requeue ({}/{})",
                self.actions.len(),
                self.capacity
            );
        }
        requeued
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedAction> {
        self.actions.iter()
    }
}
