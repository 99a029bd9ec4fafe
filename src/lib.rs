//! sentinel-bus - resilient Redis pub/sub connector
//!
//! A single self-healing logical channel for an application message bus:
//! publish through server-side scripts, ordered delivery to a subscriber
//! callback, and automatic re-homing when Redis Sentinel promotes a new
//! primary. After a reconnect the owner can restore the last observed id
//! into the broker so a stale primary never hands out an older id.
//!
//! ```no_run
//! # async fn run() -> sentinel_bus::Result<()> {
//! use std::sync::Arc;
//! use sentinel_bus::{BusConnection, BusSettings, ConnectionEvent, TracingSink};
//!
//! let settings = BusSettings::load(None)?;
//! let bus = BusConnection::with_redis(&settings);
//! bus.on_event(|event| {
//!     if let ConnectionEvent::ConnectionRestored(reason) = event {
//!         tracing::info!(%reason, "connection restored");
//!     }
//! });
//! bus.connect(&settings.connection_string, Arc::new(TracingSink)).await?;
//! bus.subscribe("bus", |message| println!("{}", message.id)).await?;
//! bus.publish(settings.database, "bus", b"hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod recovery;
pub mod sequence;
pub mod trace;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broker::{Broker, BrokerSession, MemoryBroker, ScriptValue, SessionEvent};
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
pub use codec::{CodecError, Message};
pub use config::{BusSettings, ConfigError, ConnectionOptions, Endpoint};
pub use connection::{BusConnection, ConnectorSettings, RehomeOutcome};
pub use discovery::{DiscoveryLink, TopologyChange};
pub use error::{BusError, Result};
pub use events::{ConnectionEvent, ListenerId, RestoreReason};
pub use recovery::RestoreOutcome;
pub use trace::{TraceSink, TracingSink};
