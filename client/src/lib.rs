//! # Clicker Sync Client Library
//!
//! This library is the client-side half of the clicker synchronization
//! protocol. It keeps a locally predicted view of the player's resources in
//! step with an authoritative server while the player taps far faster than
//! the network should carry individual messages.
//!
//! ## Architecture Overview
//!
//! ### Optimistic Projection
//! Every tap is applied to the local snapshot the moment it happens and
//! remembered under its clientSeq with a checkpoint of the resources it
//! touched. Between server updates essence keeps growing at the server's
//! production rate, so the display never stalls waiting for a round trip.
//!
//! ### Batching
//! Taps are coalesced into one `tap` message per quiet interval (or per full
//! batch), carrying the clientSeqs of every tap inside it.
//!
//! ### Reconciliation
//! Full syncs replace the snapshot and drop all speculation. Deltas merge the
//! fields they carry underneath whatever is still unconfirmed. A rejected
//! action is rolled back to its checkpoint plus the passive production earned
//! while the rejection was in flight.
//!
//! ### Disconnect Tolerance
//! Actions attempted while offline wait in a bounded queue and are replayed in
//! order, once, as soon as a session opens. Dropped connections are retried
//! with exponential backoff until a configured number of attempts.
//!
//! ## Module Organization
//!
//! - `config`: `SyncConfig`, defaults and `CLICKER_*` environment overrides
//! - `error`: `SyncError`, the one error type of the crate
//! - `sequence`: clientSeq allocation
//! - `queue`: the offline action queue
//! - `batcher`: tap coalescing
//! - `ledger`: optimistic snapshot, reconciliation and rollback
//! - `connection`: connection state machine and reconnect backoff
//! - `transport`: the `Transport` seam, its WebSocket and in-memory implementations
//! - `engine`: `SyncClient`, which composes all of the above
//! - `network`: the tokio driver and its cloneable `SyncHandle`
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::SyncConfig;
//! use client::network;
//!
//! # async fn run() -> Result<(), client::error::SyncError> {
//! let config = SyncConfig::from_env().with_auth_token("token");
//! let (handle, driver) = network::start(&config);
//!
//! handle.connect().await?;
//! handle.send_tap(1, 1.5)?;
//! let client_seq = handle.purchase_generator("crystal_mine", 1).await?;
//! println!("purchase sent as {}", client_seq);
//!
//! handle.shutdown()?;
//! let _ = driver.await;
//! # Ok(())
//! # }
//! ```
//!
//! The engine itself is synchronous and takes the current time as an
//! argument, so it can also be driven by hand with a
//! [`transport::MemoryTransport`] in tests.

pub mod batcher;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod network;
pub mod queue;
pub mod sequence;
pub mod transport;
