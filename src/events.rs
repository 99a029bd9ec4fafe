//! Event surface and handler registrations.
//!
//! Three events reach the owning layer: connection failed, connection
//! restored and error message. They are raised synchronously on whichever
//! task the broker delivered its callback from; nothing is queued, and a
//! listener that panics is not caught here.
//!
//! [`HandlerBinding`] is the owned registration of the connector's handler on
//! one broker session. Releasing it (explicitly or by drop) detaches the
//! handler, so a discarded session can never fire into the connector.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::broker::{BrokerSession, SessionEvent};
use crate::config::Endpoint;
use crate::error::BusError;

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Synchronous listener callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registry of listeners for one event type.
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Returns false if the id was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Invoke every listener in registration order.
    ///
    /// The registry lock is not held while listeners run, so a listener may
    /// add or remove registrations.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why the connection reports itself restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreReason {
    /// The current session reconnected to its endpoint.
    Reconnected { endpoint: Endpoint },
    /// The connector re-homed to a newly promoted primary. Subscriptions are
    /// already re-established; the owner should run recovery.
    MasterSwitched { endpoint: Endpoint },
}

impl fmt::Display for RestoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnected { endpoint } => write!(f, "Redis connection to {endpoint} restored"),
            Self::MasterSwitched { endpoint } => {
                write!(f, "Redis master was switched to {endpoint}")
            }
        }
    }
}

/// Event raised to the owning bus layer.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectionFailed(Arc<BusError>),
    ConnectionRestored(RestoreReason),
    ErrorMessage(Arc<BusError>),
}

impl ConnectionEvent {
    /// Translate a data-session event.
    pub fn from_session(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Failed { endpoint, reason } => Self::ConnectionFailed(Arc::new(
                BusError::Connection(format!("{endpoint}: {reason}")),
            )),
            SessionEvent::Restored { endpoint } => Self::ConnectionRestored(
                RestoreReason::Reconnected {
                    endpoint: endpoint.clone(),
                },
            ),
            SessionEvent::Error { message, .. } => {
                Self::ErrorMessage(Arc::new(BusError::Server(message.clone())))
            }
        }
    }
}

/// Listeners for [`ConnectionEvent`]s.
pub type EventHub = Listeners<ConnectionEvent>;

/// Owned registration of one handler on one broker session.
pub struct HandlerBinding {
    session: Arc<dyn BrokerSession>,
    id: Mutex<Option<ListenerId>>,
}

impl HandlerBinding {
    /// Register `handler` on `session`.
    pub fn attach(session: Arc<dyn BrokerSession>, handler: Listener<SessionEvent>) -> Self {
        let id = session.add_event_handler(handler);
        Self {
            session,
            id: Mutex::new(Some(id)),
        }
    }

    /// Detach the handler. Idempotent.
    pub fn release(&self) {
        let id = self.id.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(id) = id {
            self.session.remove_event_handler(id);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for HandlerBinding {
    fn drop(&mut self) {
        self.release();
    }
}
