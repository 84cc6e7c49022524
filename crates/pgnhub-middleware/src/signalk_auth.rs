//! SignalK token authentication.
//!
//! [`AuthTokenManager`] is a pure state machine; it builds the login and
//! logout frames and interprets responses, while the SignalK adapter owns
//! the socket and the timers.
//!
//! ```text
//! Anonymous -> Authenticating -> Authenticated -> Renewing -> Authenticated
//!                    |                                 |
//!                    +----------> Anonymous <----------+
//! ```
//!
//! A failed login or renewal degrades to `Anonymous` and leaves the socket
//! open, since the server may still stream public data.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use pgnhub_types::AuthStatus;
use serde_json::{Value, json};
use uuid::Uuid;

/// Renew this long before the token expires.
pub const RENEW_BEFORE_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// A renewal is never scheduled sooner than this after a login.
pub const MIN_RENEW_AFTER: Duration = Duration::from_secs(5);

/// Give up on a login response after this long.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    Authenticating,
    Authenticated,
    Renewing,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Token held after a successful login.
#[derive(Debug, Clone, PartialEq)]
struct AuthSession {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    renew_at: Option<DateTime<Utc>>,
}

/// Seconds after issue at which a token living `ttl` seconds is renewed:
/// [`RENEW_BEFORE_EXPIRY`] ahead of expiry, but no earlier than half its
/// lifetime and never sooner than [`MIN_RENEW_AFTER`].
fn renew_after(ttl: i64) -> i64 {
    let lead = RENEW_BEFORE_EXPIRY.as_secs() as i64;
    (ttl - lead).max(ttl / 2).max(MIN_RENEW_AFTER.as_secs() as i64)
}

/// Result of feeding a login response to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Authenticated,
    Failed(String),
}

#[derive(Debug)]
pub struct AuthTokenManager {
    credentials: Option<Credentials>,
    state: AuthState,
    session: Option<AuthSession>,
    pending_request: Option<String>,
}

impl AuthTokenManager {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            state: AuthState::Anonymous,
            session: None,
            pending_request: None,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.pending_request.is_some()
    }

    /// Login frame to send, or `None` when no credentials are configured.
    /// Moves to `Renewing` when a token is already held.
    pub fn begin_login(&mut self) -> Option<Value> {
        let creds = self.credentials.as_ref()?;
        let request_id = Uuid::new_v4().to_string();
        let frame = json!({
            "requestId": request_id,
            "login": { "username": creds.username, "password": creds.password },
        });
        self.state = if self.session.is_some() {
            AuthState::Renewing
        } else {
            AuthState::Authenticating
        };
        self.pending_request = Some(request_id);
        Some(frame)
    }

    /// Whether `frame` answers the outstanding login request.
    pub fn is_response(&self, frame: &Value) -> bool {
        match (&self.pending_request, frame.get("requestId").and_then(Value::as_str)) {
            (Some(pending), Some(id)) => pending == id,
            _ => false,
        }
    }

    /// Interpret a response. Returns `None` while the server still reports
    /// the request as pending (`statusCode` 202) or when `frame` is not
    /// the awaited response.
    pub fn handle_response(&mut self, frame: &Value, now: DateTime<Utc>) -> Option<AuthOutcome> {
        if !self.is_response(frame) {
            return None;
        }
        let status = frame.get("statusCode").and_then(Value::as_u64).unwrap_or(0);
        if status == 202 {
            return None;
        }
        self.pending_request = None;

        let login = frame.get("login");
        let token = login
            .and_then(|l| l.get("token"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty());
        match (status, token) {
            (200, Some(token)) => {
                let ttl = login
                    .and_then(|l| l.get("timeToLive"))
                    .and_then(Value::as_i64)
                    .filter(|ttl| *ttl > 0);
                self.session = Some(AuthSession {
                    token: token.to_string(),
                    expires_at: ttl.map(|ttl| now + TimeDelta::seconds(ttl)),
                    renew_at: ttl.map(|ttl| now + TimeDelta::seconds(renew_after(ttl))),
                });
                self.state = AuthState::Authenticated;
                Some(AuthOutcome::Authenticated)
            }
            _ => {
                let reason = frame
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("login rejected with status {status}"));
                self.degrade();
                Some(AuthOutcome::Failed(reason))
            }
        }
    }

    /// The outstanding login got no answer in time.
    pub fn expire_pending(&mut self) -> Option<AuthOutcome> {
        self.pending_request.take()?;
        self.degrade();
        Some(AuthOutcome::Failed("login timed out".into()))
    }

    fn degrade(&mut self) {
        self.session = None;
        self.pending_request = None;
        self.state = AuthState::Anonymous;
    }

    /// Time left until the renewal should be sent. `None` when no renewal
    /// is scheduled.
    pub fn renew_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.state != AuthState::Authenticated {
            return None;
        }
        let due = self.session.as_ref()?.renew_at?;
        Some((due - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Logout frame for the held token, clearing the session either way.
    pub fn logout(&mut self) -> Option<Value> {
        let session = self.session.take();
        self.degrade();
        session.map(|s| {
            json!({
                "requestId": Uuid::new_v4().to_string(),
                "logout": { "token": s.token },
            })
        })
    }

    pub fn token(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.token.as_str())
    }

    pub fn status(&self, now: DateTime<Utc>) -> AuthStatus {
        let session = self.session.as_ref();
        AuthStatus {
            is_authenticated: matches!(
                self.state,
                AuthState::Authenticated | AuthState::Renewing
            ) && session.is_some(),
            has_token: session.is_some(),
            time_until_expiry: session
                .and_then(|s| s.expires_at)
                .map(|at| (at - now).num_seconds().max(0)),
        }
    }
}
