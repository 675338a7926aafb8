//! Optimistic projection of the authoritative game state
//!
//! The ledger owns the [`GameStateSnapshot`] handed to observers. Local actions
//! are applied to it immediately and remembered under their clientSeq together
//! with a checkpoint of the fields they touched. Server messages then either
//! restate the truth (full sync), merge a subset of it on top of the still
//! unconfirmed speculation (delta sync), or reject a single speculative update,
//! in which case it is rolled back while keeping passive production earned
//! during the round trip.

use crate::config::SyncConfig;
use log::debug;
use shared::{GameStateSnapshot, StateFull, StatePatch};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Change applied speculatively for one clientSeq
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OptimisticDelta {
    pub essence: f64,
    pub lifetime_essence: f64,
    pub total_clicks: u64,
}

impl OptimisticDelta {
    pub fn tap(gain: f64, count: u32) -> Self {
        Self {
            essence: gain,
            lifetime_essence: gain,
            total_clicks: u64::from(count),
        }
    }

    fn accumulate(&mut self, other: &OptimisticDelta) {
        self.essence += other.essence;
        self.lifetime_essence += other.lifetime_essence;
        self.total_clicks += other.total_clicks;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Checkpoint {
    essence: f64,
    lifetime_essence: f64,
    total_clicks: u64,
}

impl Checkpoint {
    fn capture(snapshot: &GameStateSnapshot) -> Self {
        Self {
            essence: snapshot.essence,
            lifetime_essence: snapshot.lifetime_essence,
            total_clicks: snapshot.total_clicks,
        }
    }

    fn remove(&mut self, delta: &OptimisticDelta) {
        self.essence = (self.essence - delta.essence).max(0.0);
        self.lifetime_essence = (self.lifetime_essence - delta.lifetime_essence).max(0.0);
        self.total_clicks = self.total_clicks.saturating_sub(delta.total_clicks);
    }
}

#[derive(Debug, Clone)]
struct OptimisticUpdateRecord {
    checkpoint: Checkpoint,
    delta: OptimisticDelta,
    applied_at: Instant,
    // Ledger's cumulative passive accrual when this update was applied
    passive_mark: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Applied,
    /// Older than the last applied server seq; snapshot fields untouched
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rollback {
    Restored { essence: f64 },
    /// Live essence no longer follows the update's trajectory, so an
    /// intervening sync already corrected it.
    Diverged { live: f64, expected: f64 },
    /// No outstanding update under that clientSeq
    Unknown,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub accrual_cap: Duration,
    pub divergence_ratio: f64,
    pub divergence_floor: f64,
    pub project_passive: bool,
}

impl From<&SyncConfig> for LedgerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            accrual_cap: config.rollback_accrual_cap,
            divergence_ratio: config.rollback_divergence_ratio,
            divergence_floor: config.rollback_divergence_floor,
            project_passive: config.project_passive,
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

pub struct OptimisticLedger {
    snapshot: GameStateSnapshot,
    outstanding: BTreeMap<u64, OptimisticUpdateRecord>,
    settings: LedgerSettings,
    last_advanced: Option<Instant>,
    passive_accrued: f64,
}

impl OptimisticLedger {
    pub fn new(settings: LedgerSettings) -> Self {
        Self::with_snapshot(GameStateSnapshot::new(), settings)
    }

    pub fn with_snapshot(snapshot: GameStateSnapshot, settings: LedgerSettings) -> Self {
        Self {
            snapshot,
            outstanding: BTreeMap::new(),
            settings,
            last_advanced: None,
            passive_accrued: 0.0,
        }
    }

    pub fn snapshot(&self) -> &GameStateSnapshot {
        &self.snapshot
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn outstanding_seqs(&self) -> Vec<u64> {
        self.outstanding.keys().copied().collect()
    }

    pub fn is_outstanding(&self, client_seq: u64) -> bool {
        self.outstanding.contains_key(&client_seq)
    }

    /// Outstanding clientSeqs at or below `high_water`, ascending
    pub fn outstanding_up_to(&self, high_water: u64) -> Vec<u64> {
        self.outstanding
            .range(..=high_water)
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Essence currently credited on top of the server's word
    pub fn projected_gain(&self) -> f64 {
        self.pending_totals(|_| true).essence
    }

    /// Projects passive production up to `now`. Returns true if the snapshot changed.
    pub fn advance(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_advanced.replace(now) else {
            return false;
        };

        let elapsed = now.saturating_duration_since(last);
        let production = self.snapshot.production_per_second;
        if !self.settings.project_passive || elapsed.is_zero() || production <= 0.0 {
            if now < last {
                self.last_advanced = Some(last);
            }
            return false;
        }

        let gained = production * elapsed.as_secs_f64();
        self.snapshot.essence += gained;
        self.snapshot.lifetime_essence += gained;
        self.passive_accrued += gained;
        true
    }

    pub fn apply_optimistic(&mut self, client_seq: u64, delta: OptimisticDelta, now: Instant) {
        self.advance(now);

        let record = OptimisticUpdateRecord {
            checkpoint: Checkpoint::capture(&self.snapshot),
            delta,
            applied_at: now,
            passive_mark: self.passive_accrued,
        };

        self.snapshot.essence += delta.essence;
        self.snapshot.lifetime_essence += delta.lifetime_essence;
        self.snapshot.total_clicks += delta.total_clicks;

        debug!(
            "Optimistic update {}: +{} essence ({} outstanding)",
            client_seq,
            delta.essence,
            self.outstanding.len() + 1
        );
        self.outstanding.insert(client_seq, record);
    }

    /// Replaces every authoritative field and drops all outstanding speculation.
    pub fn reconcile_full(&mut self, state: &StateFull, now: Instant) -> Reconciliation {
        if state.seq < self.snapshot.confirmed_server_seq {
            debug!(
                "Ignoring stale full sync {} (at {})",
                state.seq, self.snapshot.confirmed_server_seq
            );
            return Reconciliation::Stale;
        }

        if !self.outstanding.is_empty() {
            debug!(
                "Full sync {} supersedes {} outstanding updates",
                state.seq,
                self.outstanding.len()
            );
        }
        self.outstanding.clear();

        self.snapshot = GameStateSnapshot {
            essence: state.essence,
            lifetime_essence: state.lifetime_essence,
            production_per_second: state.production_per_second,
            click_power: state.click_power,
            crit_chance: state.crit_chance,
            crit_multiplier: state.crit_multiplier,
            total_clicks: state.total_clicks,
            generators: state.generators.clone(),
            purchased_upgrades: state.purchased_upgrades.clone(),
            confirmed_server_seq: state.seq,
            last_sync_timestamp: state.server_timestamp,
        };
        self.last_advanced = Some(now);

        Reconciliation::Applied
    }

    /// Merges the fields present in `patch` and retires `confirmed` updates.
    ///
    /// Resource totals are layered: the live value becomes the server value
    /// plus whatever is still outstanding. Confirmations are honoured even
    /// when the message itself is stale.
    pub fn reconcile_delta(
        &mut self,
        patch: &StatePatch,
        seq: u64,
        server_timestamp: u64,
        confirmed: &[u64],
        now: Instant,
    ) -> Reconciliation {
        self.advance(now);

        for client_seq in confirmed {
            if self.outstanding.remove(client_seq).is_some() {
                debug!("Confirmed optimistic update {}", client_seq);
            }
        }

        if seq < self.snapshot.confirmed_server_seq {
            debug!(
                "Ignoring stale delta {} (at {})",
                seq, self.snapshot.confirmed_server_seq
            );
            return Reconciliation::Stale;
        }

        let pending = self.pending_totals(|_| true);
        if let Some(essence) = patch.essence {
            self.snapshot.essence = essence + pending.essence;
        }
        if let Some(lifetime_essence) = patch.lifetime_essence {
            self.snapshot.lifetime_essence = lifetime_essence + pending.lifetime_essence;
        }
        if let Some(total_clicks) = patch.total_clicks {
            self.snapshot.total_clicks = total_clicks + pending.total_clicks;
        }
        self.apply_rates(patch);

        self.snapshot.confirmed_server_seq = seq;
        self.snapshot.last_sync_timestamp = server_timestamp;

        Reconciliation::Applied
    }

    /// Rolls back one rejected update, then applies `correct_state` verbatim.
    pub fn reject_optimistic(
        &mut self,
        client_seq: u64,
        correct_state: Option<&StatePatch>,
        now: Instant,
    ) -> Rollback {
        self.advance(now);

        let outcome = match self.outstanding.remove(&client_seq) {
            Some(record) => self.roll_back(client_seq, record, now),
            None => Rollback::Unknown,
        };

        if let Some(patch) = correct_state {
            self.apply_override(patch);
        }

        outcome
    }

    fn roll_back(&mut self, client_seq: u64, record: OptimisticUpdateRecord, now: Instant) -> Rollback {
        let later = self.pending_totals(|seq| seq > client_seq);
        let accrued_locally = self.passive_accrued - record.passive_mark;
        let expected =
            record.checkpoint.essence + record.delta.essence + accrued_locally + later.essence;
        let live = self.snapshot.essence;

        let tolerance = (expected.abs() * self.settings.divergence_ratio)
            .max(self.settings.divergence_floor);
        if (live - expected).abs() > tolerance {
            debug!(
                "Skipping rollback of {}: live {} diverged from expected {}",
                client_seq, live, expected
            );
            return Rollback::Diverged { live, expected };
        }

        let round_trip = now
            .saturating_duration_since(record.applied_at)
            .min(self.settings.accrual_cap);
        let accrual = self.snapshot.production_per_second.max(0.0) * round_trip.as_secs_f64();

        self.snapshot.essence = (record.checkpoint.essence + accrual).max(0.0) + later.essence;
        self.snapshot.lifetime_essence =
            (record.checkpoint.lifetime_essence + accrual).max(0.0) + later.lifetime_essence;
        self.snapshot.total_clicks = record.checkpoint.total_clicks + later.total_clicks;

        // Later checkpoints were captured with this update included
        for (_, newer) in self.outstanding.range_mut(client_seq + 1..) {
            newer.checkpoint.remove(&record.delta);
        }

        debug!(
            "Rolled back {}: essence {} -> {}",
            client_seq, live, self.snapshot.essence
        );
        Rollback::Restored {
            essence: self.snapshot.essence,
        }
    }

    fn apply_override(&mut self, patch: &StatePatch) {
        if let Some(essence) = patch.essence {
            self.snapshot.essence = essence;
        }
        if let Some(lifetime_essence) = patch.lifetime_essence {
            self.snapshot.lifetime_essence = lifetime_essence;
        }
        if let Some(total_clicks) = patch.total_clicks {
            self.snapshot.total_clicks = total_clicks;
        }
        self.apply_rates(patch);
    }

    fn apply_rates(&mut self, patch: &StatePatch) {
        if let Some(production) = patch.production_per_second {
            self.snapshot.production_per_second = production;
        }
        if let Some(click_power) = patch.click_power {
            self.snapshot.click_power = click_power;
        }
        if let Some(crit_chance) = patch.crit_chance {
            self.snapshot.crit_chance = crit_chance;
        }
        if let Some(crit_multiplier) = patch.crit_multiplier {
            self.snapshot.crit_multiplier = crit_multiplier;
        }
        if let Some(generators) = &patch.generators {
            self.snapshot.generators = generators.clone();
        }
        if let Some(upgrades) = &patch.purchased_upgrades {
            self.snapshot.purchased_upgrades = upgrades.clone();
        }
    }

    fn pending_totals<F>(&self, include: F) -> OptimisticDelta
    where
        F: Fn(u64) -> bool,
    {
        let mut totals = OptimisticDelta::default();
        for (seq, record) in &self.outstanding {
            if include(*seq) {
                totals.accumulate(&record.delta);
            }
        }
        totals
    }
}

impl Default for OptimisticLedger {
    fn default() -> Self {
        Self::new(LedgerSettings::default())
    }
}
