//! Performance benchmarks for the hot paths of the sync client

use client::batcher::TapBatcher;
use client::config::SyncConfig;
use client::engine::SyncClient;
use client::ledger::{LedgerSettings, OptimisticDelta, OptimisticLedger};
use client::queue::ActionQueue;
use client::sequence::SequenceAllocator;
use client::transport::{MemoryTransport, TransportEvent, TransportEventKind};
use shared::{
    decode_server_message, encode_client_message, encode_server_message, ClientMessage,
    ServerMessage, StatePatch, TapConfirmed,
};
use std::time::{Duration, Instant};

fn ledger_settings() -> LedgerSettings {
    LedgerSettings {
        project_passive: true,
        ..LedgerSettings::default()
    }
}

/// Benchmarks optimistic application of single taps
#[test]
fn benchmark_optimistic_apply() {
    let mut ledger = OptimisticLedger::new(ledger_settings());
    let base = Instant::now();

    let iterations = 100_000;
    let start = Instant::now();

    for seq in 0..iterations {
        ledger.apply_optimistic(
            seq,
            OptimisticDelta::tap(1.0, 1),
            base + Duration::from_micros(seq),
        );
    }

    let duration = start.elapsed();
    println!(
        "Optimistic apply: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(ledger.outstanding_count(), iterations as usize);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks delta reconciliation with a realistic number of outstanding updates
#[test]
fn benchmark_delta_reconciliation() {
    let mut ledger = OptimisticLedger::new(ledger_settings());
    let now = Instant::now();

    let iterations = 10_000u64;
    let start = Instant::now();

    for round in 0..iterations {
        // Keep about 20 updates in flight, confirming the oldest each round
        let seq = round + 20;
        ledger.apply_optimistic(seq, OptimisticDelta::tap(2.0, 1), now);
        let patch = StatePatch {
            essence: Some(round as f64),
            total_clicks: Some(round),
            ..StatePatch::default()
        };
        ledger.reconcile_delta(&patch, round, round, &[round], now);
    }

    let duration = start.elapsed();
    println!(
        "Delta reconciliation: {} rounds in {:?} ({:.2} μs/round)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 1000);
}

/// Benchmarks rollback of the oldest of many outstanding updates
#[test]
fn benchmark_rollback() {
    let iterations = 1_000u64;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut ledger = OptimisticLedger::new(ledger_settings());
        let now = Instant::now();
        for seq in 1..=50 {
            ledger.apply_optimistic(seq, OptimisticDelta::tap(3.0, 1), now);
        }
        ledger.reject_optimistic(1, None, now);
    }

    let duration = start.elapsed();
    println!(
        "Rollback with 50 outstanding: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks tap registration through the batcher
#[test]
fn benchmark_tap_batching() {
    let mut batcher = TapBatcher::new(Duration::from_millis(50), 50);
    let mut sequence = SequenceAllocator::new(1);
    let mut ledger = OptimisticLedger::new(ledger_settings());
    let now = Instant::now();

    let iterations = 100_000;
    let mut batches = 0;
    let start = Instant::now();

    for _ in 0..iterations {
        if batcher
            .register_tap(1, 1.5, now, &mut sequence, &mut ledger)
            .is_some()
        {
            batches += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Tap batching: {} taps into {} batches in {:?}",
        iterations, batches, duration
    );

    assert_eq!(batches, iterations / 50);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks offline queue fill and drain
#[test]
fn benchmark_queue_cycle() {
    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut queue = ActionQueue::new(100);
        let now = Instant::now();
        for seq in 0..100 {
            queue
                .enqueue(
                    ClientMessage::PurchaseUpgrade {
                        upgrade_id: "golden_gloves".to_string(),
                        client_seq: seq,
                    },
                    now,
                )
                .unwrap();
        }
        let drained = queue.drain_in_order(|_| Ok(())).unwrap();
        assert_eq!(drained, 100);
    }

    let duration = start.elapsed();
    println!(
        "Queue fill/drain of 100: {} cycles in {:?}",
        iterations, duration
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks envelope encoding and decoding
#[test]
fn benchmark_message_codec() {
    let tap = ClientMessage::Tap {
        count: 50,
        combo_multiplier: 2.5,
        client_seqs: (1..=50).collect(),
    };
    let confirmed = encode_server_message(&ServerMessage::TapConfirmed(TapConfirmed {
        essence: 123_456.0,
        lifetime_essence: 999_999.0,
        total_clicks: 4242,
        confirmed_client_seqs: (1..=50).collect(),
        seq: 77,
        completed_challenges: vec![],
        server_timestamp: 1_700_000_000_000,
    }))
    .unwrap();

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = encode_client_message(&tap).unwrap();
        assert!(!frame.is_empty());
        let decoded = decode_server_message(&confirmed).unwrap();
        assert!(matches!(decoded, ServerMessage::TapConfirmed(_)));
    }

    let duration = start.elapsed();
    println!(
        "Codec: {} encode/decode pairs in {:?} ({:.2} μs/pair)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Benchmarks the full engine path from tap to confirmation
#[test]
fn benchmark_engine_tap_confirm_cycle() {
    let config = SyncConfig {
        project_passive: false,
        ..SyncConfig::default()
    };
    let transport = MemoryTransport::new();
    let wire = transport.clone();
    let mut client = SyncClient::new(Box::new(transport), &config);
    let base = Instant::now();
    client.connect(base).unwrap();
    let session = wire.current_session().unwrap();
    client.handle_transport_event(TransportEvent::new(session, TransportEventKind::Opened), base);

    let rounds = 1_000u64;
    let start = Instant::now();

    for round in 0..rounds {
        let now = base + Duration::from_millis(round * 100);
        for _ in 0..10 {
            client.send_tap(1, 1.0, now).unwrap();
        }
        client.poll(now + Duration::from_millis(50));

        let seqs: Vec<u64> = wire
            .take_sent()
            .into_iter()
            .flat_map(|message| match message {
                ClientMessage::Tap { client_seqs, .. } => client_seqs,
                _ => Vec::new(),
            })
            .collect();
        let frame = encode_server_message(&ServerMessage::TapConfirmed(TapConfirmed {
            essence: ((round + 1) * 10) as f64,
            lifetime_essence: ((round + 1) * 10) as f64,
            total_clicks: (round + 1) * 10,
            confirmed_client_seqs: seqs,
            seq: round + 1,
            completed_challenges: vec![],
            server_timestamp: round,
        }))
        .unwrap();
        client.handle_transport_event(
            TransportEvent::new(session, TransportEventKind::Frame(frame)),
            now + Duration::from_millis(80),
        );
    }

    let duration = start.elapsed();
    println!(
        "Engine tap/confirm: {} rounds in {:?} ({:.2} μs/round)",
        rounds,
        duration,
        duration.as_micros() as f64 / rounds as f64
    );

    assert_eq!(client.ledger().outstanding_count(), 0);
    assert_eq!(client.snapshot().total_clicks, rounds * 10);
    assert!(duration.as_millis() < 5000);
}
