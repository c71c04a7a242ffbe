//! One client session over the market-channel WebSocket.
//!
//! A session owns its connection plus three workers (read, write, heartbeat)
//! scoped to a per-connection cancellation token; the session-level token is
//! cancelled exactly once, on close. Failure detection from any worker elects
//! a single reconnect driver through a compare-and-set guard.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use core_types::{BookError, ConnState, FeedConfig};
use poly_wire::{DynamicOp, InitialSubscribe};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Invoked once per received text frame.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;
/// Invoked once per state transition with (session id, new state).
/// Never called while the session lock is held.
pub type StateChangeHandler = Arc<dyn Fn(&str, ConnState) + Send + Sync>;

enum Outbound {
    Frame(String),
    Ping,
}

pub struct WsSession {
    id: String,
    cfg: Arc<FeedConfig>,
    on_message: MessageHandler,
    on_state: Option<StateChangeHandler>,
    /// Session scope; cancelled on close only.
    root: CancellationToken,
    state: Mutex<ConnState>,
    tokens: Mutex<Vec<String>>,
    last_pong: Mutex<Instant>,
    write_tx: mpsc::Sender<Outbound>,
    /// The receiving end survives reconnects; each write worker holds the
    /// lock for the lifetime of its connection.
    write_rx: tokio::sync::Mutex<mpsc::Receiver<Outbound>>,
    conn_token: Mutex<CancellationToken>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    closed: AtomicBool,
}

impl WsSession {
    pub fn new(
        id: impl Into<String>,
        cfg: Arc<FeedConfig>,
        token_ids: Vec<String>,
        parent: &CancellationToken,
        on_message: MessageHandler,
        on_state: Option<StateChangeHandler>,
    ) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(cfg.message_buffer_size.max(1));
        let root = parent.child_token();
        let conn_token = root.child_token();
        Arc::new(Self {
            id: id.into(),
            cfg,
            on_message,
            on_state,
            root,
            state: Mutex::new(ConnState::Disconnected),
            tokens: Mutex::new(token_ids),
            last_pong: Mutex::new(Instant::now()),
            write_tx,
            write_rx: tokio::sync::Mutex::new(write_rx),
            conn_token: Mutex::new(conn_token),
            workers: tokio::sync::Mutex::new(Vec::new()),
            reconnecting: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Dial the endpoint and bring the session to Active. Any workers from a
    /// previous connection are cancelled and joined first.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.conn_token.lock().cancel();
        self.join_workers().await;

        self.set_state(ConnState::Connecting);

        let dial = timeout(HANDSHAKE_TIMEOUT, connect_async(self.cfg.endpoint.as_str())).await;
        let (ws, _resp) = match dial {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                self.set_state(ConnState::Disconnected);
                return Err(err).context("websocket handshake");
            }
            Err(_) => {
                self.set_state(ConnState::Disconnected);
                anyhow::bail!("websocket handshake timed out");
            }
        };

        *self.last_pong.lock() = Instant::now();
        let conn = self.root.child_token();
        *self.conn_token.lock() = conn.clone();

        self.set_state(ConnState::Connected);

        let (sink, source) = ws.split();
        {
            let mut workers = self.workers.lock().await;
            workers.push(tokio::spawn(self.clone().read_worker(source, conn.clone())));
            workers.push(tokio::spawn(self.clone().write_worker(sink, conn.clone())));
            workers.push(tokio::spawn(self.clone().heartbeat_worker(conn.clone())));
        }

        let tokens = self.tokens.lock().clone();
        if !tokens.is_empty() {
            self.set_state(ConnState::Subscribing);
            let count = tokens.len();
            let frame = InitialSubscribe::market(tokens).to_json();
            if let Err(err) = self.enqueue(frame).await {
                conn.cancel();
                self.set_state(ConnState::Disconnected);
                return Err(anyhow::Error::new(err)).context("initial subscribe enqueue");
            }
            tracing::info!(session = %self.id, tokens = count, "initial subscription enqueued");
        }

        self.set_state(ConnState::Active);
        self.reconnect_attempts.store(0, Ordering::Release);
        self.reconnecting.store(false, Ordering::Release);
        tracing::info!(session = %self.id, endpoint = %self.cfg.endpoint, "session active");
        Ok(())
    }

    /// Dynamic subscribe on a live session. Fails with a state conflict when
    /// the session is not Connected/Active.
    pub async fn add_tokens(&self, token_ids: &[String]) -> Result<(), BookError> {
        if token_ids.is_empty() {
            return Ok(());
        }
        {
            let state = *self.state.lock();
            if state != ConnState::Active && state != ConnState::Connected {
                return Err(BookError::StateConflict { state });
            }
            let mut tokens = self.tokens.lock();
            for token in token_ids {
                if !tokens.iter().any(|t| t == token) {
                    tokens.push(token.clone());
                }
            }
        }
        let frame = DynamicOp::subscribe(token_ids.to_vec()).to_json();
        self.enqueue(frame).await
    }

    /// Dynamic unsubscribe; same state requirements as [`Self::add_tokens`].
    pub async fn remove_tokens(&self, token_ids: &[String]) -> Result<(), BookError> {
        if token_ids.is_empty() {
            return Ok(());
        }
        {
            let state = *self.state.lock();
            if state != ConnState::Active && state != ConnState::Connected {
                return Err(BookError::StateConflict { state });
            }
            self.tokens.lock().retain(|t| !token_ids.contains(t));
        }
        let frame = DynamicOp::unsubscribe(token_ids.to_vec()).to_json();
        self.enqueue(frame).await
    }

    /// Single-shot close: terminal state, cancel everything, join workers.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnState::Closed);
        self.root.cancel();
        self.join_workers().await;
        tracing::info!(session = %self.id, "session closed");
    }

    async fn enqueue(&self, frame: String) -> Result<(), BookError> {
        let conn = self.conn_token.lock().clone();
        tokio::select! {
            _ = self.root.cancelled() => Err(BookError::Stream("session closed".to_string())),
            _ = conn.cancelled() => Err(BookError::Stream("connection lost".to_string())),
            sent = self.write_tx.send_timeout(Outbound::Frame(frame), ENQUEUE_TIMEOUT) => {
                match sent {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(BookError::Timeout),
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                        Err(BookError::Stream("write queue closed".to_string()))
                    }
                }
            }
        }
    }

    async fn read_worker(self: Arc<Self>, mut source: WsSource, cancel: CancellationToken) {
        let deadline = Duration::from_secs(self.cfg.read_deadline_s().max(1));
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = timeout(deadline, source.next()) => frame,
            };
            match frame {
                Err(_) => {
                    tracing::warn!(session = %self.id, "read deadline exceeded");
                    break;
                }
                Ok(None) => {
                    tracing::warn!(session = %self.id, "stream ended");
                    break;
                }
                Ok(Some(Err(err))) => {
                    tracing::warn!(session = %self.id, error = %err, "read error");
                    break;
                }
                Ok(Some(Ok(msg))) => match msg {
                    Message::Text(text) => (self.on_message)(text.as_str()),
                    Message::Pong(_) => *self.last_pong.lock() = Instant::now(),
                    // tungstenite queues the pong reply on the next write.
                    Message::Ping(_) => {}
                    Message::Close(_) => {
                        tracing::info!(session = %self.id, "server close frame");
                        break;
                    }
                    _ => {}
                },
            }
        }
        self.trigger_reconnect();
    }

    async fn write_worker(self: Arc<Self>, mut sink: WsSink, cancel: CancellationToken) {
        let mut rx = self.write_rx.lock().await;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = rx.recv() => item,
            };
            let Some(item) = item else {
                return;
            };
            let msg = match item {
                Outbound::Frame(frame) => Message::Text(frame.into()),
                Outbound::Ping => Message::Ping(Vec::new().into()),
            };
            match timeout(WRITE_TIMEOUT, sink.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(session = %self.id, error = %err, "write error");
                    break;
                }
                Err(_) => {
                    tracing::warn!(session = %self.id, "write deadline exceeded");
                    break;
                }
            }
        }
        drop(rx);
        self.trigger_reconnect();
    }

    async fn heartbeat_worker(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.cfg.ping_interval_s.max(1));
        let grace = Duration::from_secs(self.cfg.read_deadline_s().max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if self.last_pong.lock().elapsed() > grace {
                        tracing::warn!(session = %self.id, "pong timeout");
                        break;
                    }
                    // A full queue just skips this ping round.
                    let _ = self.write_tx.try_send(Outbound::Ping);
                }
            }
        }
        self.trigger_reconnect();
    }

    /// Elect exactly one reconnect driver per failure. Losers return
    /// immediately; the winner tears the connection down and drives the
    /// backoff loop from a fresh task.
    fn trigger_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) || self.root.is_cancelled() {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        metrics::counter!("feed.session_reconnect").increment(1);
        self.conn_token.lock().cancel();
        self.set_state(ConnState::Reconnecting);
        let session = self.clone();
        tokio::spawn(async move { session.run_reconnect().await });
    }

    async fn run_reconnect(self: Arc<Self>) {
        self.join_workers().await;
        // Pending writes belong to the dead connection.
        self.drain_write_queue().await;

        loop {
            if self.closed.load(Ordering::Acquire) || self.root.is_cancelled() {
                return;
            }
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
            let max_attempts = self.cfg.reconnect_max_attempts;
            if max_attempts > 0 && attempt > max_attempts {
                tracing::warn!(session = %self.id, attempts = attempt - 1, "reconnect attempts exhausted");
                self.set_state(ConnState::Disconnected);
                self.reconnecting.store(false, Ordering::Release);
                return;
            }

            let delay = backoff_delay(&self.cfg, attempt);
            tracing::info!(
                session = %self.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = self.root.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect().await {
                Ok(()) => {
                    tracing::info!(session = %self.id, "reconnected");
                    return;
                }
                Err(err) => {
                    tracing::warn!(session = %self.id, error = %err, "reconnect attempt failed");
                }
            }
        }
    }

    async fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn drain_write_queue(&self) {
        let mut rx = self.write_rx.lock().await;
        while rx.try_recv().is_ok() {}
    }

    /// Transition with identical-state suppression. Closed is terminal.
    /// The handler runs after the lock is released.
    fn set_state(&self, next: ConnState) {
        let changed = {
            let mut state = self.state.lock();
            if *state == next || (*state == ConnState::Closed && next != ConnState::Closed) {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            tracing::debug!(session = %self.id, state = %next, "state change");
            if let Some(handler) = &self.on_state {
                handler(&self.id, next);
            }
        }
    }
}

fn backoff_delay(cfg: &FeedConfig, attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(-0.2..=0.2);
    backoff_delay_with_jitter(cfg, attempt, jitter)
}

/// Exponential backoff doubling from the configured floor, with a jitter
/// fraction applied and the result clamped into [floor, ceiling].
pub fn backoff_delay_with_jitter(cfg: &FeedConfig, attempt: u32, jitter: f64) -> Duration {
    let floor = cfg.reconnect_min_ms.max(1);
    let ceiling = cfg.reconnect_max_ms.max(floor);
    let shift = attempt.saturating_sub(1).min(32);
    let base = floor.saturating_mul(1u64 << shift).min(ceiling);
    let jittered = (base as f64 * (1.0 + jitter)).round() as i64;
    let clamped = (jittered.max(0) as u64).clamp(floor, ceiling);
    Duration::from_millis(clamped)
}
