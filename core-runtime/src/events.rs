//! # Acquisition Events
//!
//! Progress notifications from the request broker and the authority resolver,
//! fanned out to any number of host subscribers over a
//! `tokio::sync::broadcast` channel.
//!
//! Hosts typically use them to show a "signing in" indicator while
//! [`AuthEvent::InteractionStarted`] is outstanding, or to feed telemetry
//! keyed by correlation id. Payloads carry home-account ids and scope
//! strings only; token material never enters an event.
//!
//! ```rust
//! use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
//!
//! let bus = EventBus::new(16);
//! let mut events = bus.subscribe();
//!
//! let _ = bus.emit(CoreEvent::Auth(AuthEvent::SignedOut {
//!     account_id: "uid.utid".to_string(),
//! }));
//!
//! let event = events.try_recv().unwrap();
//! assert_eq!(event.account_id(), Some("uid.utid"));
//! ```
//!
//! A subscriber that falls more than `capacity` events behind receives
//! `RecvError::Lagged` once and then resumes with the oldest retained event.
//! Publishing with nobody subscribed is not an error publishers act on.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError, TryRecvError};
pub use tokio::sync::broadcast::Receiver;

/// Channel capacity used by [`EventBus::default`].
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Auth(AuthEvent),
    Authority(AuthorityEvent),
}

impl CoreEvent {
    /// Stable event name, e.g. `"CacheHit"`.
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::Auth(event) => event.name(),
            CoreEvent::Authority(AuthorityEvent::Resolved { .. }) => "AuthorityResolved",
            CoreEvent::Authority(AuthorityEvent::Invalidated { .. }) => "AuthorityInvalidated",
        }
    }

    /// Correlation id of the acquisition the event belongs to, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Auth(
                AuthEvent::AcquisitionStarted { correlation_id, .. }
                | AuthEvent::CacheHit { correlation_id, .. }
                | AuthEvent::TokenRefreshing { correlation_id, .. }
                | AuthEvent::TokenRefreshed { correlation_id, .. }
                | AuthEvent::InteractionRequired { correlation_id, .. }
                | AuthEvent::InteractionStarted { correlation_id },
            ) => Some(correlation_id.as_str()),
            CoreEvent::Auth(AuthEvent::AuthError { correlation_id, .. }) => {
                correlation_id.as_deref()
            }
            _ => None,
        }
    }

    pub fn account_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Auth(
                AuthEvent::CacheHit { account_id, .. }
                | AuthEvent::TokenRefreshing { account_id, .. }
                | AuthEvent::TokenRefreshed { account_id, .. }
                | AuthEvent::SignedIn { account_id, .. }
                | AuthEvent::SignedOut { account_id },
            ) => Some(account_id.as_str()),
            _ => None,
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Auth(AuthEvent::AuthError { recoverable: false, .. }) => EventSeverity::Error,
            CoreEvent::Auth(AuthEvent::AuthError { .. })
            | CoreEvent::Auth(AuthEvent::InteractionRequired { .. }) => EventSeverity::Warning,
            CoreEvent::Auth(AuthEvent::SignedIn { .. } | AuthEvent::SignedOut { .. })
            | CoreEvent::Authority(AuthorityEvent::Invalidated { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Token acquisition and account lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// A flow started. Requests that join an in-flight flow do not emit this.
    AcquisitionStarted {
        correlation_id: String,
        /// Space-delimited requested scopes.
        scopes: String,
    },
    CacheHit {
        correlation_id: String,
        account_id: String,
    },
    TokenRefreshing {
        correlation_id: String,
        account_id: String,
    },
    TokenRefreshed {
        correlation_id: String,
        account_id: String,
        /// Unix seconds.
        expires_at: i64,
    },
    /// A silent request stopped because the user has to be involved.
    InteractionRequired {
        correlation_id: String,
        reason: String,
    },
    /// The authorization page is on screen.
    InteractionStarted { correlation_id: String },
    SignedIn {
        account_id: String,
        authority: String,
    },
    /// The account and all of its cached credentials are gone.
    SignedOut { account_id: String },
    AuthError {
        correlation_id: Option<String>,
        message: String,
        /// Retrying or interacting may still succeed.
        recoverable: bool,
    },
}

impl AuthEvent {
    fn name(&self) -> &'static str {
        match self {
            AuthEvent::AcquisitionStarted { .. } => "AcquisitionStarted",
            AuthEvent::CacheHit { .. } => "CacheHit",
            AuthEvent::TokenRefreshing { .. } => "TokenRefreshing",
            AuthEvent::TokenRefreshed { .. } => "TokenRefreshed",
            AuthEvent::InteractionRequired { .. } => "InteractionRequired",
            AuthEvent::InteractionStarted { .. } => "InteractionStarted",
            AuthEvent::SignedIn { .. } => "SignedIn",
            AuthEvent::SignedOut { .. } => "SignedOut",
            AuthEvent::AuthError { .. } => "AuthError",
        }
    }
}

/// Authority metadata cache changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthorityEvent {
    /// Discovery ran. Cache hits are silent.
    Resolved { authority: String, issuer: String },
    Invalidated { authority: String },
}

/// Cloneable handle to one broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to every current subscriber.
    ///
    /// Returns how many subscribers got the event; `Err` means there were
    /// none, which callers are free to ignore.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        tracing::trace!(
            event = event.name(),
            correlation_id = event.correlation_id().unwrap_or_default(),
            "Publishing event"
        );
        self.sender.send(event)
    }

    /// New subscriber. Nothing emitted before this call is replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
