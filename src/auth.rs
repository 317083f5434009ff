//! Authentication boundary.
//!
//! Login flows live outside this crate; the sync engine only needs to know
//! who the current user is, which bearer token to send, and how to tear a
//! session down when the remote reports that authorization has expired.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::types::User;

/// Session source supplied by the host application.
pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool {
        self.current_user().is_some()
    }

    fn current_user(&self) -> Option<User>;

    /// Bearer token for remote calls.
    fn access_token(&self) -> Option<String>;

    /// Forget stored credentials. Called at most once per expired session.
    fn clear_session(&self);
}

// ============================================================================
// StaticAuth
// ============================================================================

struct StaticSession {
    user: User,
    token: String,
}

/// In-memory `AuthProvider` holding a single user and token.
#[derive(Default)]
pub struct StaticAuth {
    session: Mutex<Option<StaticSession>>,
    cleared: AtomicUsize,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user: User, token: impl Into<String>) -> Self {
        let auth = Self::new();
        auth.sign_in(user, token);
        auth
    }

    pub fn sign_in(&self, user: User, token: impl Into<String>) {
        *self.session.lock() = Some(StaticSession {
            user,
            token: token.into(),
        });
    }

    /// How many times `clear_session` has run.
    pub fn clear_count(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }
}

impl AuthProvider for StaticAuth {
    fn current_user(&self) -> Option<User> {
        self.session.lock().as_ref().map(|s| s.user.clone())
    }

    fn access_token(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.token.clone())
    }

    fn clear_session(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        *self.session.lock() = None;
    }
}

// ============================================================================
// SessionLatch
// ============================================================================

/// Exactly-once guard for session teardown.
///
/// Several in-flight remote calls can observe the same expired token; only
/// the first `trip()` for the current session returns `true`. Each
/// `reset()` starts a new session generation, and a trip carrying an older
/// generation never fires. Generation and tripped flag share one atomic
/// word (`generation << 1 | tripped`) so a reset cannot interleave with a
/// trip.
#[derive(Debug, Default)]
pub struct SessionLatch {
    state: AtomicU64,
}

impl SessionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the current session. Capture it before a remote call
    /// and hand it back to `trip`.
    pub fn generation(&self) -> u64 {
        self.state.load(Ordering::SeqCst) >> 1
    }

    /// Returns `true` for exactly one caller per session, and only when
    /// `generation` is still the current one.
    pub fn trip(&self, generation: u64) -> bool {
        let armed = generation << 1;
        self.state
            .compare_exchange(armed, armed | 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_tripped(&self) -> bool {
        self.state.load(Ordering::SeqCst) & 1 == 1
    }

    /// Re-arm after a fresh login.
    pub fn reset(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                Some(((s >> 1).wrapping_add(1)) << 1)
            });
    }
}
