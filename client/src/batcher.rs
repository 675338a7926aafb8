//! Coalescing of rapid tap input into periodic network messages

use crate::ledger::{OptimisticDelta, OptimisticLedger};
use crate::sequence::SequenceAllocator;
use log::debug;
use shared::ClientMessage;
use std::time::{Duration, Instant};

/// Taps accumulated since the last flush
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PendingBatch {
    pub count: u32,
    /// Highest combo seen since the last flush
    pub combo_multiplier: f64,
    pub client_seqs: Vec<u64>,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.client_seqs.is_empty()
    }

    pub fn into_message(self) -> ClientMessage {
        ClientMessage::Tap {
            count: self.count,
            combo_multiplier: self.combo_multiplier,
            client_seqs: self.client_seqs,
        }
    }
}

/// Applies each tap optimistically the moment it happens and sends them in
/// batches, either when the batch interval passes without a new tap or when
/// the batch reaches `max_count` taps.
pub struct TapBatcher {
    pending: PendingBatch,
    interval: Duration,
    max_count: u32,
    flush_at: Option<Instant>,
}

impl TapBatcher {
    pub fn new(interval: Duration, max_count: u32) -> Self {
        Self {
            pending: PendingBatch::default(),
            interval,
            max_count: max_count.max(1),
            flush_at: None,
        }
    }

    /// Records one input burst of `count` taps.
    ///
    /// Returns the batch when this burst filled it; the caller sends it.
    pub fn register_tap(
        &mut self,
        count: u32,
        combo_multiplier: f64,
        now: Instant,
        sequence: &mut SequenceAllocator,
        ledger: &mut OptimisticLedger,
    ) -> Option<PendingBatch> {
        let client_seq = sequence.next();
        let gain = (ledger.snapshot().click_power * combo_multiplier).floor() * f64::from(count);
        ledger.apply_optimistic(client_seq, OptimisticDelta::tap(gain, count), now);

        self.pending.count = self.pending.count.saturating_add(count);
        self.pending.combo_multiplier = if self.pending.is_empty() {
            combo_multiplier
        } else {
            self.pending.combo_multiplier.max(combo_multiplier)
        };
        self.pending.client_seqs.push(client_seq);
        self.flush_at = Some(now + self.interval);

        if self.pending.count >= self.max_count {
            debug!("Tap batch full at {} taps", self.pending.count);
            return self.flush();
        }

        None
    }

    /// Flushes if the batch timer has elapsed
    pub fn poll(&mut self, now: Instant) -> Option<PendingBatch> {
        match self.flush_at {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Takes the batch and cancels the timer. `None` when nothing is pending.
    pub fn flush(&mut self) -> Option<PendingBatch> {
        self.flush_at = None;
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    pub fn pending(&self) -> &PendingBatch {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerSettings;

    fn ledger() -> OptimisticLedger {
        OptimisticLedger::new(LedgerSettings {
            project_passive: false,
            ..LedgerSettings::default()
        })
    }

    #[test]
    fn test_register_tap_applies_gain_immediately() {
        let mut batcher = TapBatcher::new(Duration::from_millis(50), 100);
        let mut sequence = SequenceAllocator::new(1);
        let mut ledger = ledger();
        let now = Instant::now();

        // click power 1.0 * combo 2.7 floors to 2, times 3 taps
        let flushed = batcher.register_tap(3, 2.7, now, &mut sequence, &mut ledger);

        assert!(flushed.is_none());
        assert_eq!(ledger.snapshot().essence, 6.0);
        assert_eq!(ledger.snapshot().total_clicks, 3);
        assert!(ledger.is_outstanding(1));
        assert_eq!(batcher.pending().client_seqs, vec![1]);
    }

    #[test]
    fn test_combo_is_max_not_sum() {
        let mut batcher = TapBatcher::new(Duration::from_millis(50), 100);
        let mut sequence = SequenceAllocator::new(1);
        let mut ledger = ledger();
        let now = Instant::now();

        batcher.register_tap(1, 1.5, now, &mut sequence, &mut ledger);
        batcher.register_tap(1, 3.0, now, &mut sequence, &mut ledger);
        batcher.register_tap(1, 2.0, now, &mut sequence, &mut ledger);

        let pending = batcher.pending();
        assert_eq!(pending.count, 3);
        assert_eq!(pending.combo_multiplier, 3.0);
        assert_eq!(pending.client_seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_timer_restarts_on_each_tap() {
        let mut batcher = TapBatcher::new(Duration::from_millis(50), 100);
        let mut sequence = SequenceAllocator::new(1);
        let mut ledger = ledger();
        let t0 = Instant::now();

        batcher.register_tap(1, 1.0, t0, &mut sequence, &mut ledger);
        batcher.register_tap(1, 1.2, t0 + Duration::from_millis(10), &mut sequence, &mut ledger);
        batcher.register_tap(1, 1.1, t0 + Duration::from_millis(20), &mut sequence, &mut ledger);

        assert_eq!(batcher.deadline(), Some(t0 + Duration::from_millis(70)));
        assert!(batcher.poll(t0 + Duration::from_millis(60)).is_none());

        let batch = batcher.poll(t0 + Duration::from_millis(70)).unwrap();
        assert_eq!(batch.count, 3);
        assert_eq!(batch.combo_multiplier, 1.2);

        assert!(batcher.pending().is_empty());
        assert_eq!(batcher.deadline(), None);
        assert!(batcher.poll(t0 + Duration::from_millis(500)).is_none());
    }

    #[test]
    fn test_size_threshold_flushes_immediately() {
        let mut batcher = TapBatcher::new(Duration::from_millis(50), 5);
        let mut sequence = SequenceAllocator::new(1);
        let mut ledger = ledger();
        let now = Instant::now();

        assert!(batcher
            .register_tap(3, 1.0, now, &mut sequence, &mut ledger)
            .is_none());
        let batch = batcher
            .register_tap(2, 1.0, now, &mut sequence, &mut ledger)
            .unwrap();

        assert_eq!(batch.count, 5);
        assert_eq!(batch.client_seqs, vec![1, 2]);
        assert!(batcher.pending().is_empty());
        assert_eq!(batcher.deadline(), None);
    }

    #[test]
    fn test_flush_empty_is_none() {
        let mut batcher = TapBatcher::new(Duration::from_millis(50), 5);
        assert!(batcher.flush().is_none());
    }

    #[test]
    fn test_batch_into_message() {
        let batch = PendingBatch {
            count: 4,
            combo_multiplier: 2.0,
            client_seqs: vec![10, 11],
        };
        assert_eq!(
            batch.into_message(),
            ClientMessage::Tap {
                count: 4,
                combo_multiplier: 2.0,
                client_seqs: vec![10, 11]
            }
        );
    }
}
