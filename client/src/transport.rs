//! Transport capability used by the connection manager
//!
//! A transport opens authenticated sessions, sends text frames fire-and-forget
//! and reports what happens to the session as [`TransportEvent`]s on a channel
//! that the owner of the engine drains. Every session gets a fresh
//! [`SessionId`] so that late events from a replaced session can be told apart.
//! Frames accepted by `send` that never reached the socket come back as
//! `Undelivered` ahead of the event that ends the session.

use crate::error::SyncError;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{decode_client_message, ClientMessage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Opened,
    Frame(String),
    /// `server_initiated` is true when the server closed the session on purpose
    Closed { server_initiated: bool },
    Error(String),
    /// Frames accepted by `send` but never written, oldest first
    Undelivered(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub session: SessionId,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(session: SessionId, kind: TransportEventKind) -> Self {
        Self { session, kind }
    }
}

pub trait Transport: Send {
    /// Starts opening a session. Success is reported later as `Opened`.
    fn open(&mut self, auth_token: &str) -> Result<SessionId, SyncError>;

    fn send(&mut self, frame: String) -> Result<(), SyncError>;

    /// Closes the current session, if any. Emits no further events for it.
    fn close(&mut self);
}

enum SessionCommand {
    Send(String),
    Close,
}

struct WsSession {
    id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

/// WebSocket transport. Each session runs in its own task that owns the socket.
pub struct WsTransport {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    session: Option<WsSession>,
    next_session: u64,
}

impl WsTransport {
    /// Returns the transport and the receiver its events are delivered on.
    pub fn new(url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            url: url.into(),
            events,
            session: None,
            next_session: 1,
        };
        (transport, events_rx)
    }
}

impl Transport for WsTransport {
    fn open(&mut self, auth_token: &str) -> Result<SessionId, SyncError> {
        self.close();

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::InvalidInput(format!("invalid server url: {}", e)))?;
        if !auth_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", auth_token))
                .map_err(|e| SyncError::InvalidInput(format!("invalid auth token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let id = SessionId(self.next_session);
        self.next_session += 1;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            run_session(id, request, commands_rx, events).await;
        });

        debug!("Opening session {} to {}", id.0, self.url);
        self.session = Some(WsSession { id, commands, task });
        Ok(id)
    }

    fn send(&mut self, frame: String) -> Result<(), SyncError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| SyncError::Transport("no open session".to_string()))?;

        session
            .commands
            .send(SessionCommand::Send(frame))
            .map_err(|_| SyncError::Transport(format!("session {} has ended", session.id.0)))
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Closing session {}", session.id.0);
            if session.commands.send(SessionCommand::Close).is_err() {
                session.task.abort();
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_session(
    id: SessionId,
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let emit = |kind: TransportEventKind| {
        // The receiver only goes away when the engine is shutting down
        let _ = events.send(TransportEvent::new(id, kind));
    };

    let stream = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!("Session {} failed to connect: {}", id.0, e);
            return_undelivered(id, &mut commands, None, &events);
            emit(TransportEventKind::Error(e.to_string()));
            return;
        }
    };

    info!("Session {} open", id.0);
    emit(TransportEventKind::Opened);

    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Send(text)) => {
                        if let Err(e) = sink.send(Message::Text(text.clone())).await {
                            error!("Session {} send failed: {}", id.0, e);
                            return_undelivered(id, &mut commands, Some(text), &events);
                            emit(TransportEventKind::Error(e.to_string()));
                            break;
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        let _ = sink.close().await;
                        debug!("Session {} closed by client", id.0);
                        break;
                    }
                }
            }

            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => emit(TransportEventKind::Frame(text)),
                    Some(Ok(Message::Close(reason))) => {
                        info!("Session {} closed by server: {:?}", id.0, reason);
                        return_undelivered(id, &mut commands, None, &events);
                        emit(TransportEventKind::Closed { server_initiated: true });
                        break;
                    }
                    // Control frames are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Session {} receive failed: {}", id.0, e);
                        return_undelivered(id, &mut commands, None, &events);
                        emit(TransportEventKind::Error(e.to_string()));
                        break;
                    }
                    None => {
                        warn!("Session {} stream ended", id.0);
                        return_undelivered(id, &mut commands, None, &events);
                        emit(TransportEventKind::Closed { server_initiated: false });
                        break;
                    }
                }
            }
        }
    }
}

/// Closes the command channel so later `send` calls fail, then collects the
/// frames still buffered behind `failed`.
fn drain_unsent(
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    failed: Option<String>,
) -> Vec<String> {
    commands.close();

    let mut frames: Vec<String> = failed.into_iter().collect();
    while let Ok(command) = commands.try_recv() {
        if let SessionCommand::Send(text) = command {
            frames.push(text);
        }
    }
    frames
}

fn return_undelivered(
    id: SessionId,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    failed: Option<String>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let frames = drain_unsent(commands, failed);
    if frames.is_empty() {
        return;
    }
    warn!("Session {} ended with {} frames unsent", id.0, frames.len());
    let _ = events.send(TransportEvent::new(
        id,
        TransportEventKind::Undelivered(frames),
    ));
}

#[derive(Debug, Default)]
struct MemoryState {
    tokens: Vec<String>,
    sent: Vec<String>,
    closes: usize,
    current: Option<SessionId>,
    next_session: u64,
    fail_open: bool,
    send_budget: Option<usize>,
}

/// In-process transport that records everything sent through it.
///
/// Clones share state, so a test keeps one clone to inspect traffic and to
/// script failures while the engine owns the other. Session events are
/// supplied by the test itself.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session most recently opened and not yet closed
    pub fn current_session(&self) -> Option<SessionId> {
        self.lock().current
    }

    pub fn open_count(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    pub fn tokens(&self) -> Vec<String> {
        self.lock().tokens.clone()
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Decoded frames sent so far, in order. Undecodable frames are skipped.
    pub fn sent_messages(&self) -> Vec<ClientMessage> {
        self.lock()
            .sent
            .iter()
            .filter_map(|frame| decode_client_message(frame).ok())
            .collect()
    }

    /// Like [`MemoryTransport::sent_messages`] but clears the record
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        let frames = std::mem::take(&mut self.lock().sent);
        frames
            .iter()
            .filter_map(|frame| decode_client_message(frame).ok())
            .collect()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Lets `budget` more sends succeed, then fails every send after that.
    pub fn fail_sends_after(&self, budget: usize) {
        self.lock().send_budget = Some(budget);
    }

    pub fn restore_sends(&self) {
        self.lock().send_budget = None;
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, auth_token: &str) -> Result<SessionId, SyncError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        state.next_session += 1;
        let id = SessionId(state.next_session);
        state.tokens.push(auth_token.to_string());
        state.current = Some(id);
        Ok(id)
    }

    fn send(&mut self, frame: String) -> Result<(), SyncError> {
        let mut state = self.lock();
        if state.current.is_none() {
            return Err(SyncError::Transport("no open session".to_string()));
        }
        match state.send_budget {
            Some(0) => return Err(SyncError::Transport("connection reset".to_string())),
            Some(budget) => state.send_budget = Some(budget - 1),
            None => {}
        }
        state.sent.push(frame);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.lock();
        if state.current.take().is_some() {
            state.closes += 1;
        }
    }
}
