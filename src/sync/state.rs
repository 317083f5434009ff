//! Connectivity state machine.
//!
//! Two independent facts drive it: whether the device has network, and
//! whether a session is active. The session survives `Disconnected`, so a
//! signed-in client that reconnects goes straight back to
//! `OnlineAuthenticated`.

use std::fmt;

use crate::types::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Offline,
    OnlineUnauthenticated,
    OnlineAuthenticated,
}

impl ConnectivityState {
    /// Remote calls are only attempted in this state.
    pub fn can_sync(self) -> bool {
        matches!(self, ConnectivityState::OnlineAuthenticated)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Offline => "offline",
            ConnectivityState::OnlineUnauthenticated => "online-unauthenticated",
            ConnectivityState::OnlineAuthenticated => "online-authenticated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Connected,
    Disconnected,
    LoggedIn(User),
    LoggedOut,
    /// The remote rejected the session's credentials.
    SessionExpired,
}

/// State change produced by one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// Entered the state in which queued work can be replayed.
    pub fn became_syncable(&self) -> bool {
        !self.from.can_sync() && self.to.can_sync()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Connectivity {
    online: bool,
    user: Option<User>,
}

impl Connectivity {
    pub fn new(online: bool, user: Option<User>) -> Self {
        Self { online, user }
    }

    pub fn state(&self) -> ConnectivityState {
        match (self.online, self.user.is_some()) {
            (false, _) => ConnectivityState::Offline,
            (true, false) => ConnectivityState::OnlineUnauthenticated,
            (true, true) => ConnectivityState::OnlineAuthenticated,
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn apply(&mut self, signal: Signal) -> Transition {
        let from = self.state();
        match signal {
            Signal::Connected => self.online = true,
            Signal::Disconnected => self.online = false,
            Signal::LoggedIn(user) => self.user = Some(user),
            Signal::LoggedOut | Signal::SessionExpired => self.user = None,
        }
        Transition {
            from,
            to: self.state(),
        }
    }
}
