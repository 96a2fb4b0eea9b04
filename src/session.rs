//! Handshake and session state tracking
//!
//! The client sees exactly one logical session for the lifetime of the
//! proxy. This module tracks where that session stands in the handshake,
//! remembers the most recent `initialize` request for automatic replay after
//! a server restart, and arms the one-shot settle step that completes a
//! replayed handshake.
//!
//! All methods take `&self` and lock a plain mutex internally; no await
//! points ever occur under the lock.

use std::sync::Mutex;
use tracing::{debug, info};

use crate::protocol::METHOD_INITIALIZE;

/// Where the client-visible session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake traffic seen yet
    Uninitialized,
    /// Client sent `initialize`, completion notification still outstanding
    Initializing,
    /// Handshake complete, ordinary traffic flowing
    Active,
    /// A restart finished and recovery has not been decided yet
    Restarting,
    /// The cached `initialize` was auto-sent to the new server
    Replayed,
    /// No cached request exists; waiting for the client to re-initialize
    AwaitingReinit,
}

impl SessionState {
    /// True for any state after a restart and before a fresh handshake
    #[allow(dead_code)]
    pub fn is_recovering(&self) -> bool {
        matches!(
            self,
            SessionState::Restarting | SessionState::Replayed | SessionState::AwaitingReinit
        )
    }
}

struct SessionInner {
    state: SessionState,
    initialized: bool,
    awaiting_reinit: bool,
    cached_initialize: Option<String>,
    /// Armed per replayed restart; consumed when the replay response settles
    pending_settle: bool,
}

/// Tracks the client-visible session across server restarts
pub struct SessionTracker {
    inner: Mutex<SessionInner>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                initialized: false,
                awaiting_reinit: false,
                cached_initialize: None,
                pending_settle: false,
            }),
        }
    }

    /// Record a client-sent `initialize` request.
    ///
    /// The exact line is cached for replay; only a newer `initialize`
    /// replaces it. Receiving one also counts as recovery when the session
    /// was waiting for re-initialization.
    pub fn cache_initialize(&self, line: &str) {
        let mut inner = self.lock();
        if inner.cached_initialize.is_some() {
            debug!("replacing cached initialize request");
        }
        inner.cached_initialize = Some(line.to_string());
        inner.awaiting_reinit = false;
        inner.state = SessionState::Initializing;
    }

    /// Record the client's `notifications/initialized`, completing a handshake
    pub fn mark_initialized(&self) {
        let mut inner = self.lock();
        inner.initialized = true;
        inner.state = SessionState::Active;
    }

    /// Whether the session is waiting for the client to re-initialize
    pub fn awaiting_reinit(&self) -> bool {
        self.lock().awaiting_reinit
    }

    /// Count the arrival of a session-less-answerable method as recovery.
    ///
    /// A fresh `initialize` goes through [`cache_initialize`] instead, which
    /// restarts the handshake properly.
    pub fn recover_on_safe_method(&self, method: &str) {
        let mut inner = self.lock();
        if !inner.awaiting_reinit {
            return;
        }
        inner.awaiting_reinit = false;
        if method != METHOD_INITIALIZE {
            info!(method, "resuming session on session-less method");
            inner.state = SessionState::Active;
        }
    }

    /// Transition into recovery after a completed restart.
    ///
    /// Returns the cached `initialize` line when one exists; the caller
    /// replays it to the new server and the settle step is armed. Without a
    /// cached line the session waits for the client to re-initialize.
    pub fn begin_recovery(&self) -> Option<String> {
        let mut inner = self.lock();
        inner.initialized = false;
        inner.state = SessionState::Restarting;
        match inner.cached_initialize.clone() {
            Some(cached) => {
                inner.pending_settle = true;
                inner.awaiting_reinit = false;
                inner.state = SessionState::Replayed;
                Some(cached)
            }
            None => {
                inner.awaiting_reinit = true;
                inner.state = SessionState::AwaitingReinit;
                None
            }
        }
    }

    /// Consume the pending settle step, at most once per restart.
    ///
    /// Returns true exactly when the caller just intercepted the response to
    /// a replayed `initialize`; the session is marked active again.
    pub fn settle_replay(&self) -> bool {
        let mut inner = self.lock();
        if !inner.pending_settle {
            return false;
        }
        inner.pending_settle = false;
        inner.initialized = true;
        inner.state = SessionState::Active;
        true
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    #[allow(dead_code)]
    pub fn initialized(&self) -> bool {
        self.lock().initialized
    }

    #[allow(dead_code)]
    pub fn cached_initialize(&self) -> Option<String> {
        self.lock().cached_initialize.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        // A poisoned mutex indicates a panic mid-update; state is beyond
        // repair at that point, so propagating the panic is correct
        self.inner.lock().unwrap()
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const INIT_LINE: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;

    #[test]
    fn test_handshake_progression() {
        let session = SessionTracker::new();
        assert_eq!(session.state(), SessionState::Uninitialized);

        session.cache_initialize(INIT_LINE);
        assert_eq!(session.state(), SessionState::Initializing);
        assert!(!session.initialized());

        session.mark_initialized();
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.initialized());
    }

    #[test]
    fn test_recovery_with_cached_request_replays_identical_bytes() {
        let session = SessionTracker::new();
        session.cache_initialize(INIT_LINE);
        session.mark_initialized();

        let first = session.begin_recovery();
        assert_eq!(first.as_deref(), Some(INIT_LINE));
        assert_eq!(session.state(), SessionState::Replayed);
        assert!(!session.initialized());

        // A second restart replays byte-identical content
        session.settle_replay();
        let second = session.begin_recovery();
        assert_eq!(second.as_deref(), Some(INIT_LINE));
    }

    #[test]
    fn test_recovery_without_cached_request_awaits_reinit() {
        let session = SessionTracker::new();
        assert!(session.begin_recovery().is_none());
        assert_eq!(session.state(), SessionState::AwaitingReinit);
        assert!(session.awaiting_reinit());
        assert!(session.state().is_recovering());
    }

    #[test]
    fn test_settle_fires_at_most_once_per_restart() {
        let session = SessionTracker::new();
        session.cache_initialize(INIT_LINE);
        session.begin_recovery();

        assert!(session.settle_replay());
        assert!(!session.settle_replay());
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.initialized());
    }

    #[test]
    fn test_settle_never_fires_without_replay() {
        let session = SessionTracker::new();
        session.cache_initialize(INIT_LINE);
        // First start: nothing to settle, the real response goes to the client
        assert!(!session.settle_replay());
    }

    #[test]
    fn test_safe_method_clears_awaiting_reinit() {
        let session = SessionTracker::new();
        session.begin_recovery();
        assert!(session.awaiting_reinit());

        session.recover_on_safe_method("tools/list");
        assert!(!session.awaiting_reinit());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_fresh_initialize_clears_awaiting_reinit() {
        let session = SessionTracker::new();
        session.begin_recovery();
        assert!(session.awaiting_reinit());

        session.cache_initialize(INIT_LINE);
        assert!(!session.awaiting_reinit());
        assert_eq!(session.state(), SessionState::Initializing);
        assert_eq!(session.cached_initialize().as_deref(), Some(INIT_LINE));
    }

    #[test]
    fn test_mid_session_initialize_is_recached() {
        let session = SessionTracker::new();
        session.cache_initialize(INIT_LINE);
        session.mark_initialized();

        let newer = r#"{"jsonrpc":"2.0","id":9,"method":"initialize","params":{"x":1}}"#;
        session.cache_initialize(newer);
        assert_eq!(session.cached_initialize().as_deref(), Some(newer));
    }
}
