//! Async driver for [`SyncClient`]
//!
//! One task owns the engine and multiplexes caller commands, transport
//! events, engine timers and periodic snapshot publication. Callers talk to
//! it through a cloneable [`SyncHandle`]; reads go through `watch` channels,
//! errors and completed challenges are broadcast.

use crate::config::SyncConfig;
use crate::connection::ConnectionState;
use crate::engine::SyncClient;
use crate::error::SyncError;
use crate::transport::{TransportEvent, WsTransport};
use log::{debug, info, warn};
use shared::GameStateSnapshot;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, MissedTickBehavior};

const BROADCAST_CAPACITY: usize = 64;

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Disconnect,
    Tap {
        count: u32,
        combo_multiplier: f64,
    },
    PurchaseGenerator {
        generator_id: String,
        count: u32,
        reply: oneshot::Sender<Result<u64, SyncError>>,
    },
    PurchaseUpgrade {
        upgrade_id: String,
        reply: oneshot::Sender<Result<u64, SyncError>>,
    },
    RequestSync {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Shutdown,
}

/// Cloneable caller surface of a running [`SyncDriver`].
///
/// Every method fails with [`SyncError::Stopped`] once the driver has exited.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    snapshot: watch::Receiver<GameStateSnapshot>,
    errors: broadcast::Sender<SyncError>,
    challenges: broadcast::Sender<Vec<String>>,
}

impl SyncHandle {
    pub async fn connect(&self) -> Result<(), SyncError> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Connect { reply })?;
        response.await.map_err(|_| SyncError::Stopped)?
    }

    pub fn disconnect(&self) -> Result<(), SyncError> {
        self.submit(Command::Disconnect)
    }

    /// Fire-and-forget; invalid input and overflow surface on [`SyncHandle::subscribe_errors`].
    pub fn send_tap(&self, count: u32, combo_multiplier: f64) -> Result<(), SyncError> {
        self.submit(Command::Tap {
            count,
            combo_multiplier,
        })
    }

    pub async fn purchase_generator(
        &self,
        generator_id: impl Into<String>,
        count: u32,
    ) -> Result<u64, SyncError> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::PurchaseGenerator {
            generator_id: generator_id.into(),
            count,
            reply,
        })?;
        response.await.map_err(|_| SyncError::Stopped)?
    }

    pub async fn purchase_upgrade(&self, upgrade_id: impl Into<String>) -> Result<u64, SyncError> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::PurchaseUpgrade {
            upgrade_id: upgrade_id.into(),
            reply,
        })?;
        response.await.map_err(|_| SyncError::Stopped)?
    }

    pub async fn request_sync(&self) -> Result<(), SyncError> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::RequestSync { reply })?;
        response.await.map_err(|_| SyncError::Stopped)?
    }

    /// Flushes pending taps, closes the session and stops the driver.
    pub fn shutdown(&self) -> Result<(), SyncError> {
        self.submit(Command::Shutdown)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn snapshot(&self) -> GameStateSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<GameStateSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<SyncError> {
        self.errors.subscribe()
    }

    pub fn subscribe_challenges(&self) -> broadcast::Receiver<Vec<String>> {
        self.challenges.subscribe()
    }

    fn submit(&self, command: Command) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::Stopped)
    }
}

pub struct SyncDriver {
    client: SyncClient,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    snapshot_tx: watch::Sender<GameStateSnapshot>,
    publish_interval: Duration,
}

impl SyncDriver {
    /// `events` must be the receiver paired with the client's transport.
    pub fn new(
        mut client: SyncClient,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        publish_interval: Duration,
    ) -> (Self, SyncHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(client.connection_state());
        let (snapshot_tx, snapshot) = watch::channel(client.snapshot().clone());
        let (errors, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (challenges, _) = broadcast::channel(BROADCAST_CAPACITY);

        let error_tx = errors.clone();
        client.on_error(move |e| {
            // No subscribers is fine
            let _ = error_tx.send(e.clone());
        });
        let challenge_tx = challenges.clone();
        client.on_challenges_completed(move |ids| {
            let _ = challenge_tx.send(ids.to_vec());
        });

        let driver = Self {
            client,
            events,
            commands,
            state_tx,
            snapshot_tx,
            publish_interval,
        };
        let handle = SyncHandle {
            commands: commands_tx,
            state,
            snapshot,
            errors,
            challenges,
        };
        (driver, handle)
    }

    pub async fn run(mut self) {
        let mut publish = interval(self.publish_interval);
        publish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.client.next_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command) {
                                break;
                            }
                        }
                        // Every handle is gone
                        None => {
                            self.client.disconnect(Instant::now());
                            break;
                        }
                    }
                }

                Some(event) = self.events.recv() => {
                    self.client.handle_transport_event(event, Instant::now());
                }

                _ = wait_until(deadline) => {
                    self.client.poll(Instant::now());
                }

                _ = publish.tick() => {
                    self.client.poll(Instant::now());
                }
            }

            self.publish();
        }

        self.publish();
        info!("Sync driver stopped");
    }

    fn handle_command(&mut self, command: Command) -> bool {
        let now = Instant::now();

        match command {
            Command::Connect { reply } => {
                let _ = reply.send(self.client.connect(now));
            }
            Command::Disconnect => self.client.disconnect(now),
            Command::Tap {
                count,
                combo_multiplier,
            } => {
                if let Err(e) = self.client.send_tap(count, combo_multiplier, now) {
                    warn!("Tap not registered: {}", e);
                }
            }
            Command::PurchaseGenerator {
                generator_id,
                count,
                reply,
            } => {
                let _ = reply.send(self.client.purchase_generator(&generator_id, count, now));
            }
            Command::PurchaseUpgrade { upgrade_id, reply } => {
                let _ = reply.send(self.client.purchase_upgrade(&upgrade_id, now));
            }
            Command::RequestSync { reply } => {
                let _ = reply.send(self.client.request_sync(now));
            }
            Command::Shutdown => {
                debug!("Shutdown requested");
                self.client.disconnect(now);
                return false;
            }
        }

        true
    }

    fn publish(&mut self) {
        let state = self.client.connection_state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });

        let snapshot = self.client.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if current == snapshot {
                return false;
            }
            *current = snapshot.clone();
            true
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Builds a WebSocket-backed client from `config` and spawns its driver.
pub fn start(config: &SyncConfig) -> (SyncHandle, JoinHandle<()>) {
    let (transport, events) = WsTransport::new(config.server_url.clone());
    let client = SyncClient::new(Box::new(transport), config);
    let (driver, handle) = SyncDriver::new(client, events, config.snapshot_publish_interval);
    (handle, tokio::spawn(driver.run()))
}
