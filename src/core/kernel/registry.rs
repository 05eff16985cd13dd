use crate::core::types::{WsCallback, WsToken};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Sent to a live session to ask it to close.
///
/// `callback` replaces the stream's own callback for the final `Disconnect`.
pub struct CloseRequest {
    pub callback: Option<WsCallback>,
}

struct Entry {
    path: String,
    close: Option<oneshot::Sender<CloseRequest>>,
}

/// Token to live-stream table for one engine.
///
/// The table never owns a session. It holds the sending half of each
/// session's close channel; the session task owns itself and removes its own
/// entry once its close handshake is done.
pub struct SessionRegistry {
    next_token: AtomicU64,
    sessions: Mutex<HashMap<WsToken, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            // zero is WsToken::INVALID
            next_token: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh token. Tokens are never reused for the engine's lifetime.
    pub fn next_token(&self) -> WsToken {
        WsToken::new(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Track `token` and hand back the receiver its session listens on.
    pub fn insert(&self, token: WsToken, path: &str) -> oneshot::Receiver<CloseRequest> {
        let (tx, rx) = oneshot::channel();
        self.sessions.lock().insert(
            token,
            Entry {
                path: path.to_string(),
                close: Some(tx),
            },
        );
        trace!(%token, path, "session registered");
        rx
    }

    /// Ask the session behind `token` to close.
    ///
    /// Returns false, and does nothing, for an unknown token or one whose
    /// close is already under way.
    pub fn close(&self, token: WsToken, callback: Option<WsCallback>) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(&token) else {
            trace!(%token, "close on unknown token ignored");
            return false;
        };
        let Some(close) = entry.close.take() else {
            trace!(%token, "close already requested");
            return false;
        };

        if close.send(CloseRequest { callback }).is_err() {
            // the session task is gone, most likely with its execution context
            sessions.remove(&token);
            return false;
        }
        debug!(%token, path = %entry.path, "close requested");
        true
    }

    /// Forget `token`. Called by the session itself once it has closed.
    pub fn remove(&self, token: WsToken) -> bool {
        self.sessions.lock().remove(&token).is_some()
    }

    /// Drop every entry. Parked sessions see their close channel hang up and exit silently.
    pub fn clear(&self) {
        let mut sessions = self.sessions.lock();
        if !sessions.is_empty() {
            debug!(sessions = sessions.len(), "clearing session registry");
        }
        sessions.clear();
    }

    pub fn contains(&self, token: WsToken) -> bool {
        self.sessions.lock().contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
