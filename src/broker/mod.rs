//! Broker client capability.
//!
//! This module contains:
//! - `Broker` trait: opens sessions from [`ConnectionOptions`]
//! - `BrokerSession` trait: one live session (data or discovery)
//! - Implementations: Redis (feature `redis`), in-memory
//!
//! A session opened with [`CommandMode::Sentinel`](crate::config::CommandMode)
//! only answers discovery commands and pub/sub; data commands fail.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::config::{ConnectionOptions, Endpoint};
use crate::error::Result;
use crate::events::{Listener, ListenerId};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Handler for payloads arriving on a subscribed channel.
///
/// The session awaits each returned future before delivering the next
/// payload on the same channel, which preserves broker delivery order.
pub type MessageHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connectivity event pushed by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Failed { endpoint: Endpoint, reason: String },
    Restored { endpoint: Endpoint },
    Error { endpoint: Endpoint, message: String },
}

/// Reply of a server-side script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Int(i64),
    Data(Bytes),
    Status(String),
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Interpret the reply as an unsigned integer (integer or decimal text).
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(n) => u64::try_from(*n).ok(),
            Self::Data(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
            Self::Status(text) => text.trim().parse().ok(),
            Self::Array(items) => items.first().and_then(Self::as_u64),
            Self::Nil => None,
        }
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a session to the first reachable endpoint in `options`.
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn BrokerSession>>;
}

/// One live broker session.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Endpoint this session is connected to.
    fn endpoint(&self) -> Endpoint;

    /// Whether the session currently has a usable link.
    fn is_connected(&self) -> bool;

    /// Whether commands for `key` are routable from this session.
    fn is_key_connected(&self, database: i64, key: &str) -> bool;

    /// Subscribe `handler` to `channel`, replacing any existing handler for it.
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Evaluate a Lua script atomically on the server.
    async fn evaluate_script(
        &self,
        database: i64,
        script: &str,
        keys: &[String],
        args: &[Bytes],
    ) -> Result<ScriptValue>;

    /// Ask a sentinel for the current primary of `service_name`.
    async fn master_address(&self, service_name: &str) -> Result<Endpoint>;

    /// Close the session. With `drain`, in-flight commands may complete first.
    async fn close(&self, drain: bool);

    /// Register a connectivity event handler.
    fn add_event_handler(&self, handler: Listener<SessionEvent>) -> ListenerId;

    fn remove_event_handler(&self, id: ListenerId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_value_as_u64() {
        assert_eq!(ScriptValue::Int(8).as_u64(), Some(8));
        assert_eq!(ScriptValue::Int(-1).as_u64(), None);
        assert_eq!(ScriptValue::Data(Bytes::from_static(b"42")).as_u64(), Some(42));
        assert_eq!(ScriptValue::Status("OK".to_string()).as_u64(), None);
        assert_eq!(
            ScriptValue::Array(vec![ScriptValue::Int(3), ScriptValue::Nil]).as_u64(),
            Some(3)
        );
        assert_eq!(ScriptValue::Nil.as_u64(), None);
        assert!(ScriptValue::Nil.is_nil());
    }
}
