//! Test utilities.
//!
//! Recording collaborators and a ready-made sentinel topology on the
//! in-memory broker.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::broker::MemoryBroker;
use crate::config::Endpoint;
use crate::connection::{BusConnection, ConnectorSettings};
use crate::discovery::DiscoveryPolicy;
use crate::events::{ConnectionEvent, ListenerId, RestoreReason};
use crate::trace::TraceSink;
use crate::utils::retry::RetryPolicy;

/// Service name used by [`SentinelTopology`].
pub const SERVICE: &str = "mymaster";

/// Trace sink that keeps every line.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    information: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn information(&self) -> Vec<String> {
        self.information
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TraceSink for RecordingSink {
    fn information(&self, message: &str) {
        self.information
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }
}

/// Collects connection events.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
}

impl EventLog {
    /// Start recording events from `connection`.
    pub fn attach(&self, connection: &BusConnection) -> ListenerId {
        let events = self.events.clone();
        connection.on_event(move |event| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn failed(&self) -> usize {
        self.count(|e| matches!(e, ConnectionEvent::ConnectionFailed(_)))
    }

    pub fn errors(&self) -> usize {
        self.count(|e| matches!(e, ConnectionEvent::ErrorMessage(_)))
    }

    /// Endpoints of every `ConnectionRestored(MasterSwitched)` event, in order.
    pub fn switches(&self) -> Vec<Endpoint> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::ConnectionRestored(RestoreReason::MasterSwitched { endpoint }) => {
                    Some(endpoint)
                }
                _ => None,
            })
            .collect()
    }

    pub fn reconnects(&self) -> usize {
        self.count(|e| {
            matches!(
                e,
                ConnectionEvent::ConnectionRestored(RestoreReason::Reconnected { .. })
            )
        })
    }

    fn count(&self, pred: impl Fn(&ConnectionEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

/// Data node `10.0.0.<n>:6379`.
pub fn node(n: u8) -> Endpoint {
    Endpoint::new(format!("10.0.0.{n}"), 6379)
}

/// Sentinel `10.0.1.1:26379`.
pub fn sentinel() -> Endpoint {
    Endpoint::new("10.0.1.1", 26379)
}

/// Short, bounded timings for tests.
pub fn fast_settings() -> ConnectorSettings {
    let interval = Duration::from_millis(200);
    ConnectorSettings {
        recovery: RetryPolicy::bounded_by(interval, Some(Duration::from_secs(2))),
        discovery: DiscoveryPolicy {
            reconnect: RetryPolicy::fixed(interval),
            connected_poll: RetryPolicy::fixed(interval),
        },
        drain_timeout: Duration::from_secs(1),
    }
}

/// One sentinel watching `SERVICE`, with data nodes `node(1)..=node(n)`.
/// `node(1)` starts as primary.
pub struct SentinelTopology {
    pub broker: MemoryBroker,
    pub nodes: Vec<Endpoint>,
}

impl SentinelTopology {
    pub fn new(node_count: u8) -> Self {
        let broker = MemoryBroker::new();
        let nodes: Vec<Endpoint> = (1..=node_count.max(1)).map(node).collect();
        for endpoint in &nodes {
            broker.add_node(endpoint.clone());
        }
        broker.add_sentinel(sentinel(), SERVICE, nodes[0].clone());
        Self { broker, nodes }
    }

    pub fn connection_string(&self) -> String {
        format!("{},serviceName={SERVICE}", sentinel())
    }

    /// Unconnected connection on this topology.
    pub fn connection(&self) -> BusConnection {
        BusConnection::new(Arc::new(self.broker.clone()), fast_settings())
    }

    /// Promote `endpoint` and announce it.
    pub async fn switch_to(&self, endpoint: &Endpoint) {
        self.broker.switch_master(SERVICE, endpoint.clone()).await;
    }
}
