//! Shards a subscription set across sessions, bounded by
//! `max_tokens_per_conn`. The token→session map is the authoritative routing
//! table; the session list only orders capacity allocation and close.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use core_types::{BookError, ConnState, FeedConfig};

use crate::session::{MessageHandler, StateChangeHandler, WsSession};

pub struct SessionPool {
    cfg: Arc<FeedConfig>,
    on_message: MessageHandler,
    on_state: Option<StateChangeHandler>,
    cancel: CancellationToken,
    inner: RwLock<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    sessions: Vec<Arc<WsSession>>,
    route: HashMap<String, Arc<WsSession>>,
    next_session_id: u64,
    connected: bool,
}

impl SessionPool {
    pub fn new(
        cfg: Arc<FeedConfig>,
        cancel: CancellationToken,
        on_message: MessageHandler,
        on_state: Option<StateChangeHandler>,
    ) -> Self {
        Self {
            cfg,
            on_message,
            on_state,
            cancel,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    /// Open one idle session so later subscriptions have somewhere to land.
    /// Idempotent.
    pub async fn connect(&self) -> Result<(), BookError> {
        if self.inner.read().connected {
            return Ok(());
        }
        let session = self.new_session(Vec::new());
        session
            .connect()
            .await
            .map_err(|e| BookError::Stream(e.to_string()))?;

        let raced = {
            let mut inner = self.inner.write();
            if inner.connected {
                true
            } else {
                inner.sessions.push(session.clone());
                inner.connected = true;
                false
            }
        };
        if raced {
            session.close().await;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.read().connected
    }

    /// Route net-new tokens: fill spare capacity on existing sessions in list
    /// order, then open one fresh session per remaining group.
    pub async fn subscribe(&self, token_ids: &[String]) -> Result<(), BookError> {
        let mut pending: Vec<String> = {
            let inner = self.inner.read();
            let mut fresh = Vec::new();
            for token in token_ids {
                if !inner.route.contains_key(token) && !fresh.contains(token) {
                    fresh.push(token.clone());
                }
            }
            fresh
        };
        if pending.is_empty() {
            return Ok(());
        }

        self.connect().await?;

        let sessions: Vec<Arc<WsSession>> = self.inner.read().sessions.clone();
        let mut unplaced = Vec::new();
        for session in sessions {
            if pending.is_empty() {
                break;
            }
            let spare = self
                .cfg
                .max_tokens_per_conn
                .saturating_sub(session.token_count());
            if spare == 0 {
                continue;
            }
            let take = spare.min(pending.len());
            let chunk: Vec<String> = pending.drain(..take).collect();
            match session.add_tokens(&chunk).await {
                Ok(()) => {
                    let mut inner = self.inner.write();
                    for token in &chunk {
                        inner.route.insert(token.clone(), session.clone());
                    }
                }
                Err(err) => {
                    tracing::warn!(session = session.id(), error = %err, "dynamic subscribe failed");
                    unplaced.extend(chunk);
                }
            }
        }
        pending.extend(unplaced);

        for group in pending.chunks(self.cfg.max_tokens_per_conn.max(1)) {
            let session = self.new_session(group.to_vec());
            // connect() issues the initial bulk subscribe for the group.
            session
                .connect()
                .await
                .map_err(|e| BookError::Stream(e.to_string()))?;
            let mut inner = self.inner.write();
            for token in group {
                inner.route.insert(token.clone(), session.clone());
            }
            inner.sessions.push(session);
        }
        Ok(())
    }

    /// Remove routes and tell each owning session to drop its share. A
    /// session left with zero tokens stays open as an idle spare.
    pub async fn unsubscribe(&self, token_ids: &[String]) -> Result<(), BookError> {
        let mut grouped: Vec<(Arc<WsSession>, Vec<String>)> = Vec::new();
        {
            let mut inner = self.inner.write();
            for token in token_ids {
                if let Some(session) = inner.route.remove(token) {
                    match grouped.iter_mut().find(|(s, _)| Arc::ptr_eq(s, &session)) {
                        Some((_, tokens)) => tokens.push(token.clone()),
                        None => grouped.push((session, vec![token.clone()])),
                    }
                }
            }
        }

        let mut first_err = None;
        for (session, tokens) in grouped {
            if let Err(err) = session.remove_tokens(&tokens).await {
                tracing::warn!(session = session.id(), error = %err, "dynamic unsubscribe failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close every session concurrently and clear all routing state.
    pub async fn close(&self) {
        let sessions: Vec<Arc<WsSession>> = {
            let mut inner = self.inner.write();
            inner.route.clear();
            inner.connected = false;
            inner.sessions.drain(..).collect()
        };
        join_all(sessions.iter().map(|s| s.close())).await;
        self.cancel.cancel();
    }

    /// Authoritative routing lookup.
    pub fn session_for(&self, token_id: &str) -> Option<Arc<WsSession>> {
        self.inner.read().route.get(token_id).cloned()
    }

    pub fn status(&self) -> HashMap<String, ConnState> {
        self.inner
            .read()
            .sessions
            .iter()
            .map(|s| (s.id().to_string(), s.state()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Tokens currently routed, across all sessions.
    pub fn token_count(&self) -> usize {
        self.inner.read().route.len()
    }

    pub fn is_all_active(&self) -> bool {
        let inner = self.inner.read();
        !inner.sessions.is_empty()
            && inner.sessions.iter().all(|s| {
                matches!(s.state(), ConnState::Active | ConnState::Connected)
            })
    }

    fn new_session(&self, token_ids: Vec<String>) -> Arc<WsSession> {
        let id = {
            let mut inner = self.inner.write();
            let id = format!("session-{}", inner.next_session_id);
            inner.next_session_id += 1;
            id
        };
        WsSession::new(
            id,
            self.cfg.clone(),
            token_ids,
            &self.cancel,
            self.on_message.clone(),
            self.on_state.clone(),
        )
    }
}
