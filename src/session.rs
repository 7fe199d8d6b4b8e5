//! Session credential holder.
//!
//! Holds the bearer credential for the current login and publishes every
//! present/absent transition on a watch channel. The sync coordinator follows
//! that channel; the command layer reads the current value per request.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Opaque bearer credential issued by the server at login
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw token. Blank tokens are not credentials.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak the token into logs
        write!(f, "Credential(<{} chars>)", self.0.len())
    }
}

/// Present/absent credential with change notification.
///
/// Clones share the same underlying session.
#[derive(Clone)]
pub struct SessionHolder {
    tx: Arc<watch::Sender<Option<Credential>>>,
}

impl Default for SessionHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHolder")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl SessionHolder {
    /// Start logged out
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Start with an already issued credential
    pub fn with_credential(credential: Credential) -> Self {
        let (tx, _) = watch::channel(Some(credential));
        Self { tx: Arc::new(tx) }
    }

    /// Store a credential (login). Re-acquiring the same credential does not
    /// notify watchers.
    pub fn acquire(&self, credential: Credential) {
        let changed = self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&credential) {
                false
            } else {
                *current = Some(credential);
                true
            }
        });
        if changed {
            info!("session acquired");
        }
    }

    /// Drop the credential (logout). Returns whether one was present.
    pub fn clear(&self) -> bool {
        let had = self.tx.send_if_modified(|current| current.take().is_some());
        if had {
            info!("session cleared");
        }
        had
    }

    pub fn current(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Follow present/absent transitions
    pub fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}
