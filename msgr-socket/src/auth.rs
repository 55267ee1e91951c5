//! Session-loss detection and the auth-failure teardown.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, warn};

use msgr_core::error::MsgrError;

use crate::events::{ConnectionState, FatalKind};
use crate::manager::ConnectionManager;

lazy_static! {
    static ref LOGIN_BLOCKED: Regex = Regex::new(r"(?i)blocked the login").unwrap();

    static ref NOT_LOGGED_IN: Regex = Regex::new(
        r"(?i)not logged in|login required|unauthorized|not ?authorized|session expired|checkpoint"
    ).unwrap();

    // Errors a transport reports while it is being torn down on purpose.
    static ref BENIGN_SHUTDOWN: Regex = Regex::new(
        r"(?i)no subscription existed|client disconnecting|connection closed|connection reset|connection aborted|broken pipe|network timeout|i/o error"
    ).unwrap();
}

/// Why the session was declared lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReason {
    NotLoggedIn,
    LoginBlocked,
}

impl AuthReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotLoggedIn => "not_logged_in",
            Self::LoginBlocked => "login_blocked",
        }
    }
}

impl std::fmt::Display for AuthReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error as session loss, if it is one.
pub fn classify_auth(text: &str, error: Option<&MsgrError>) -> Option<AuthReason> {
    if LOGIN_BLOCKED.is_match(text) {
        Some(AuthReason::LoginBlocked)
    } else if NOT_LOGGED_IN.is_match(text) || error.map_or(false, MsgrError::is_auth) {
        Some(AuthReason::NotLoggedIn)
    } else {
        None
    }
}

/// Whether a failure text is expected while intentionally closing.
pub fn is_benign_shutdown(text: &str) -> bool {
    BENIGN_SHUTDOWN.is_match(text)
}

impl ConnectionManager {
    /// Tear everything down after a session loss and emit `fatal`.
    ///
    /// Only the first trip while logged in emits; later trips are logged
    /// and ignored. Nothing reconnects until a new start.
    pub(crate) async fn emit_auth(&mut self, reason: AuthReason, detail: &str) {
        if !self.session.logged_in {
            warn!("auth failure ({reason}) after logout ignored: {detail}");
            return;
        }
        error!("session lost ({reason}): {detail}");

        self.timers.clear();
        self.tasks.clear("session lost");
        if let Some(transport) = self.transport.take() {
            transport.end(true).await;
        }
        self.generation += 1;

        self.session.logged_in = false;
        self.session.ending = true;
        self.set_state(ConnectionState::Idle);
        self.emit_fatal(FatalKind::AuthError, reason.as_str(), detail);
    }
}
