//! In-memory broker for tests and local development.
//!
//! Models a set of data nodes (each with its own keyspace) and sentinels
//! that know which node is primary for each service. Scripts are Rust
//! functions registered under their Lua source text; the publish and restore
//! scripts used by the connector are registered by default.
//!
//! Pub/sub delivery is synchronous with respect to the publisher: a script
//! that publishes does not return until every subscriber handler has run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{Broker, BrokerSession, MessageHandler, ScriptValue, SessionEvent};
use crate::config::{CommandMode, ConnectionOptions, Endpoint};
use crate::connection::PUBLISH_SCRIPT;
use crate::discovery::SWITCH_MASTER_CHANNEL;
use crate::error::{BusError, Result};
use crate::events::{Listener, ListenerId, Listeners};
use crate::recovery::RESTORE_LATEST_SCRIPT;

/// Rust stand-in for a Lua script.
pub type ScriptFn =
    Arc<dyn Fn(&mut ScriptContext<'_>, &[String], &[Bytes]) -> Result<ScriptValue> + Send + Sync>;

/// Keyspace view handed to a script.
pub struct ScriptContext<'a> {
    database: i64,
    values: &'a mut HashMap<(i64, String), Bytes>,
    published: Vec<(String, Bytes)>,
}

impl ScriptContext<'_> {
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.values.get(&(self.database, key.to_string()))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|v| {
                std::str::from_utf8(v)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        BusError::Script("ERR value is not an integer or out of range".to_string())
                    })
            })
            .transpose()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Bytes>) {
        self.values
            .insert((self.database, key.to_string()), value.into());
    }

    pub fn incr(&mut self, key: &str) -> Result<u64> {
        let next = self.get_u64(key)?.unwrap_or(0) + 1;
        self.set(key, next.to_string());
        Ok(next)
    }

    pub fn publish(&mut self, channel: &str, payload: impl Into<Bytes>) {
        self.published.push((channel.to_string(), payload.into()));
    }
}

/// `INCR` the key, publish `<id> <frame>` on the channel named by the key.
fn publish_script(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    args: &[Bytes],
) -> Result<ScriptValue> {
    let key = first(keys, "KEYS")?;
    let frame = first(args, "ARGV")?;
    let id = ctx.incr(key)?;
    let mut payload = format!("{id} ").into_bytes();
    payload.extend_from_slice(frame);
    ctx.publish(key, payload);
    i64::try_from(id)
        .map(ScriptValue::Int)
        .map_err(|_| BusError::Script("ERR increment would overflow".to_string()))
}

/// Set the key to `ARGV[1]` only if the stored value is lower (missing counts as 0).
fn restore_script(
    ctx: &mut ScriptContext<'_>,
    keys: &[String],
    args: &[Bytes],
) -> Result<ScriptValue> {
    let key = first(keys, "KEYS")?;
    let latest: u64 = std::str::from_utf8(first(args, "ARGV")?)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BusError::Script("ERR latest value is not a number".to_string()))?;
    // Lua's tonumber() yields nil for non-numeric text, which the script treats as 0.
    let current = ctx.get_u64(key).ok().flatten().unwrap_or(0);
    if current < latest {
        ctx.set(key, latest.to_string());
        Ok(ScriptValue::Data(Bytes::from(latest.to_string())))
    } else {
        Ok(ScriptValue::Nil)
    }
}

fn first<'a, T>(items: &'a [T], name: &str) -> Result<&'a T> {
    items
        .first()
        .ok_or_else(|| BusError::Script(format!("ERR {name}[1] missing")))
}

struct NodeState {
    values: HashMap<(i64, String), Bytes>,
    reachable: bool,
    routable: bool,
}

struct SentinelState {
    masters: HashMap<String, Endpoint>,
    reachable: bool,
}

#[derive(Default)]
struct State {
    nodes: HashMap<Endpoint, NodeState>,
    sentinels: HashMap<Endpoint, SentinelState>,
    sessions: Vec<Weak<MemorySession>>,
    scripts: HashMap<String, ScriptFn>,
    data_connects: usize,
    sentinel_connects: usize,
}

impl State {
    fn live_sessions(&self) -> impl Iterator<Item = Arc<MemorySession>> + '_ {
        self.sessions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| !s.closed.load(Ordering::SeqCst))
    }
}

type Shared = Arc<Mutex<State>>;

fn lock(state: &Shared) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process broker with data nodes and sentinels.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Shared,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker with the connector's scripts registered.
    pub fn new() -> Self {
        let broker = Self {
            state: Arc::new(Mutex::new(State::default())),
        };
        broker.register_script(PUBLISH_SCRIPT, Arc::new(publish_script));
        broker.register_script(RESTORE_LATEST_SCRIPT, Arc::new(restore_script));
        broker
    }

    /// Register a Rust implementation for a script source.
    pub fn register_script(&self, source: &str, script: ScriptFn) {
        lock(&self.state).scripts.insert(source.to_string(), script);
    }

    /// Add a reachable data node.
    pub fn add_node(&self, endpoint: Endpoint) {
        lock(&self.state).nodes.entry(endpoint).or_insert(NodeState {
            values: HashMap::new(),
            reachable: true,
            routable: true,
        });
    }

    /// Add a reachable sentinel that reports `master` for `service`.
    pub fn add_sentinel(&self, endpoint: Endpoint, service: &str, master: Endpoint) {
        lock(&self.state)
            .sentinels
            .entry(endpoint)
            .or_insert_with(|| SentinelState {
                masters: HashMap::new(),
                reachable: true,
            })
            .masters
            .insert(service.to_string(), master);
    }

    /// Control whether new connections to a node or sentinel succeed.
    pub fn set_reachable(&self, endpoint: &Endpoint, reachable: bool) {
        let mut state = lock(&self.state);
        if let Some(node) = state.nodes.get_mut(endpoint) {
            node.reachable = reachable;
        }
        if let Some(sentinel) = state.sentinels.get_mut(endpoint) {
            sentinel.reachable = reachable;
        }
    }

    /// Control whether keys on a node report as routable.
    pub fn set_routable(&self, endpoint: &Endpoint, routable: bool) {
        if let Some(node) = lock(&self.state).nodes.get_mut(endpoint) {
            node.routable = routable;
        }
    }

    pub fn set_value(
        &self,
        endpoint: &Endpoint,
        database: i64,
        key: &str,
        value: impl Into<Bytes>,
    ) {
        if let Some(node) = lock(&self.state).nodes.get_mut(endpoint) {
            node.values.insert((database, key.to_string()), value.into());
        }
    }

    pub fn value(&self, endpoint: &Endpoint, database: i64, key: &str) -> Option<Bytes> {
        lock(&self.state)
            .nodes
            .get(endpoint)
            .and_then(|node| node.values.get(&(database, key.to_string())).cloned())
    }

    /// Stored value parsed as an integer.
    pub fn value_u64(&self, endpoint: &Endpoint, database: i64, key: &str) -> Option<u64> {
        self.value(endpoint, database, key)
            .and_then(|v| std::str::from_utf8(&v).ok()?.parse().ok())
    }

    /// Number of data sessions opened so far.
    pub fn data_connects(&self) -> usize {
        lock(&self.state).data_connects
    }

    /// Number of sentinel sessions opened so far.
    pub fn sentinel_connects(&self) -> usize {
        lock(&self.state).sentinel_connects
    }

    /// Open sessions connected to `endpoint`.
    pub fn open_sessions(&self, endpoint: &Endpoint) -> usize {
        lock(&self.state)
            .live_sessions()
            .filter(|s| s.endpoint == *endpoint)
            .count()
    }

    /// Event handlers attached across open sessions connected to `endpoint`.
    pub fn event_handler_count(&self, endpoint: &Endpoint) -> usize {
        lock(&self.state)
            .live_sessions()
            .filter(|s| s.endpoint == *endpoint)
            .map(|s| s.handlers.len())
            .sum()
    }

    /// Drop the link of every open session on `endpoint` and raise `Failed`.
    pub fn fail_sessions(&self, endpoint: &Endpoint, reason: &str) {
        for session in self.sessions_at(endpoint) {
            session.connected.store(false, Ordering::SeqCst);
            session.handlers.emit(&SessionEvent::Failed {
                endpoint: endpoint.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// Bring back every open session on `endpoint` and raise `Restored`.
    pub fn restore_sessions(&self, endpoint: &Endpoint) {
        for session in self.sessions_at(endpoint) {
            session.connected.store(true, Ordering::SeqCst);
            session.handlers.emit(&SessionEvent::Restored {
                endpoint: endpoint.clone(),
            });
        }
    }

    /// Raise a server error message on every open session on `endpoint`.
    pub fn emit_error(&self, endpoint: &Endpoint, message: &str) {
        for session in self.sessions_at(endpoint) {
            session.handlers.emit(&SessionEvent::Error {
                endpoint: endpoint.clone(),
                message: message.to_string(),
            });
        }
    }

    /// Promote `new_master` for `service` and announce it on every sentinel.
    pub async fn switch_master(&self, service: &str, new_master: Endpoint) {
        let old = {
            let mut state = lock(&self.state);
            let mut old = None;
            for sentinel in state.sentinels.values_mut() {
                let previous = sentinel
                    .masters
                    .insert(service.to_string(), new_master.clone());
                if previous.is_some() {
                    old = previous;
                }
            }
            old
        };
        let old = old.unwrap_or_else(|| new_master.clone());
        let payload = format!(
            "{} {} {} {} {}",
            service, old.host, old.port, new_master.host, new_master.port
        );
        self.announce(payload).await;
    }

    /// Deliver a raw payload on the sentinel switch channel.
    pub async fn announce(&self, payload: impl Into<Bytes>) {
        deliver(
            &self.state,
            None,
            CommandMode::Sentinel,
            SWITCH_MASTER_CHANNEL,
            payload.into(),
        )
        .await;
    }

    /// Publish a raw payload to data subscribers connected to `endpoint`.
    pub async fn publish(&self, endpoint: &Endpoint, channel: &str, payload: impl Into<Bytes>) {
        deliver(&self.state, Some(endpoint), CommandMode::Standard, channel, payload.into()).await;
    }

    fn sessions_at(&self, endpoint: &Endpoint) -> Vec<Arc<MemorySession>> {
        lock(&self.state)
            .live_sessions()
            .filter(|s| s.endpoint == *endpoint)
            .collect()
    }
}

/// Run the subscriber handlers for `channel`, outside the state lock.
async fn deliver(
    state: &Shared,
    endpoint: Option<&Endpoint>,
    mode: CommandMode,
    channel: &str,
    payload: Bytes,
) {
    let targets: Vec<MessageHandler> = lock(state)
        .live_sessions()
        .filter(|s| s.mode == mode && endpoint.map_or(true, |ep| s.endpoint == *ep))
        .filter_map(|s| s.subscription(channel))
        .collect();

    debug!(channel = %channel, subscribers = targets.len(), "Delivering in-memory publication");

    for handler in targets {
        handler(payload.clone()).await;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn BrokerSession>> {
        let mut state = lock(&self.state);
        let endpoint = options
            .endpoints
            .iter()
            .find(|ep| match options.command_mode {
                CommandMode::Standard => state.nodes.get(*ep).is_some_and(|n| n.reachable),
                CommandMode::Sentinel => state.sentinels.get(*ep).is_some_and(|s| s.reachable),
            })
            .cloned()
            .ok_or_else(|| {
                let tried: Vec<String> =
                    options.endpoints.iter().map(ToString::to_string).collect();
                BusError::Connection(format!("No reachable endpoint in [{}]", tried.join(", ")))
            })?;

        match options.command_mode {
            CommandMode::Standard => state.data_connects += 1,
            CommandMode::Sentinel => state.sentinel_connects += 1,
        }

        let session = Arc::new(MemorySession {
            endpoint,
            mode: options.command_mode,
            state: self.state.clone(),
            subscriptions: Mutex::new(HashMap::new()),
            handlers: Listeners::new(),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        state.sessions.retain(|s| s.strong_count() > 0);
        state.sessions.push(Arc::downgrade(&session));

        Ok(session)
    }
}

/// Session on a [`MemoryBroker`].
pub struct MemorySession {
    endpoint: Endpoint,
    mode: CommandMode,
    state: Shared,
    subscriptions: Mutex<HashMap<String, MessageHandler>>,
    handlers: Listeners<SessionEvent>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl MemorySession {
    fn subscription(&self, channel: &str) -> Option<MessageHandler> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection(format!("session to {} is closed", self.endpoint)));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Connection(format!("no link to {}", self.endpoint)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn is_key_connected(&self, _database: i64, _key: &str) -> bool {
        self.is_connected()
            && lock(&self.state)
                .nodes
                .get(&self.endpoint)
                .is_some_and(|n| n.routable)
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection(format!("session to {} is closed", self.endpoint)));
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);
        Ok(())
    }

    async fn evaluate_script(
        &self,
        database: i64,
        script: &str,
        keys: &[String],
        args: &[Bytes],
    ) -> Result<ScriptValue> {
        if self.mode == CommandMode::Sentinel {
            return Err(BusError::Script(
                "ERR unknown command 'EVAL' for sentinel session".to_string(),
            ));
        }
        self.ensure_open()?;

        let outcome = {
            let mut state = lock(&self.state);
            let script = state
                .scripts
                .get(script)
                .cloned()
                .ok_or_else(|| BusError::Script("NOSCRIPT No matching script".to_string()));
            match (script, state.nodes.get_mut(&self.endpoint)) {
                (Ok(script), Some(node)) if node.reachable => {
                    let mut ctx = ScriptContext {
                        database,
                        values: &mut node.values,
                        published: Vec::new(),
                    };
                    script(&mut ctx, keys, args).map(|value| (value, ctx.published))
                }
                (Err(e), _) => Err(e),
                _ => Err(BusError::Connection(format!("{} is unreachable", self.endpoint))),
            }
        };

        let (value, published) = outcome?;
        for (channel, payload) in published {
            deliver(
                &self.state,
                Some(&self.endpoint),
                CommandMode::Standard,
                &channel,
                payload,
            )
            .await;
        }
        Ok(value)
    }

    async fn master_address(&self, service_name: &str) -> Result<Endpoint> {
        if self.mode != CommandMode::Sentinel {
            return Err(BusError::Discovery(
                "master lookup requires a sentinel session".to_string(),
            ));
        }
        self.ensure_open()?;
        lock(&self.state)
            .sentinels
            .get(&self.endpoint)
            .and_then(|s| s.masters.get(service_name).cloned())
            .ok_or_else(|| {
                BusError::Discovery(format!("No master found for service '{service_name}'"))
            })
    }

    // Scripts run to completion under the state lock, so there is nothing to drain.
    async fn close(&self, _drain: bool) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn add_event_handler(&self, handler: Listener<SessionEvent>) -> ListenerId {
        self.handlers.add(handler)
    }

    fn remove_event_handler(&self, id: ListenerId) -> bool {
        self.handlers.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    use futures::FutureExt;

    use super::*;
    use crate::codec::Message;

    fn node(host: &str) -> Endpoint {
        Endpoint::new(host, 6379)
    }

    async fn data_session(broker: &MemoryBroker, endpoint: &Endpoint) -> Arc<dyn BrokerSession> {
        let options = ConnectionOptions::parse(&endpoint.to_string()).unwrap();
        broker.connect(&options).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_picks_first_reachable() {
        let broker = MemoryBroker::new();
        broker.add_node(node("b"));
        let options = ConnectionOptions::parse("a:6379,b:6379").unwrap();

        let session = broker.connect(&options).await.unwrap();
        assert_eq!(session.endpoint(), node("b"));
        assert_eq!(broker.data_connects(), 1);
    }

    #[tokio::test]
    async fn test_connect_fails_without_reachable_endpoint() {
        let broker = MemoryBroker::new();
        broker.add_node(node("a"));
        broker.set_reachable(&node("a"), false);

        let result = broker.connect(&ConnectionOptions::parse("a:6379").unwrap()).await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }

    #[tokio::test]
    async fn test_publish_script_assigns_ids_and_delivers() {
        let broker = MemoryBroker::new();
        let a = node("a");
        broker.add_node(a.clone());
        let session = data_session(&broker, &a).await;

        let last = Arc::new(AtomicU64::new(0));
        let seen = last.clone();
        session
            .subscribe(
                "bus",
                Arc::new(move |payload: Bytes| {
                    let seen = seen.clone();
                    async move {
                        let message = Message::decode(&payload).unwrap();
                        seen.store(message.id, Ordering::SeqCst);
                    }
                    .boxed()
                }),
            )
            .await
            .unwrap();

        let frame = Message::frame(b"hi").unwrap();
        for expected in 1..=3 {
            let value = session
                .evaluate_script(0, PUBLISH_SCRIPT, &["bus".to_string()], &[frame.clone()])
                .await
                .unwrap();
            assert_eq!(value, ScriptValue::Int(expected));
            assert_eq!(last.load(Ordering::SeqCst), expected as u64);
        }
        assert_eq!(broker.value_u64(&a, 0, "bus"), Some(3));
    }

    #[tokio::test]
    async fn test_restore_script_never_regresses() {
        let broker = MemoryBroker::new();
        let a = node("a");
        broker.add_node(a.clone());
        broker.set_value(&a, 0, "bus", "10");
        let session = data_session(&broker, &a).await;
        let keys = ["bus".to_string()];

        let lower = session
            .evaluate_script(0, RESTORE_LATEST_SCRIPT, &keys, &[Bytes::from("7")])
            .await
            .unwrap();
        assert!(lower.is_nil());
        assert_eq!(broker.value_u64(&a, 0, "bus"), Some(10));

        let higher = session
            .evaluate_script(0, RESTORE_LATEST_SCRIPT, &keys, &[Bytes::from("12")])
            .await
            .unwrap();
        assert_eq!(higher.as_u64(), Some(12));
        assert_eq!(broker.value_u64(&a, 0, "bus"), Some(12));
    }

    #[tokio::test]
    async fn test_unknown_script() {
        let broker = MemoryBroker::new();
        broker.add_node(node("a"));
        let session = data_session(&broker, &node("a")).await;

        let result = session.evaluate_script(0, "return 1", &[], &[]).await;
        assert!(matches!(result, Err(BusError::Script(m)) if m.starts_with("NOSCRIPT")));
    }

    #[tokio::test]
    async fn test_sentinel_session_rejects_data_commands() {
        let broker = MemoryBroker::new();
        let s = Endpoint::new("s", 26379);
        broker.add_sentinel(s.clone(), "svc", node("a"));
        let options = ConnectionOptions::parse("s:26379,serviceName=svc")
            .unwrap()
            .sentinel_options();
        let session = broker.connect(&options).await.unwrap();

        assert_eq!(session.master_address("svc").await.unwrap(), node("a"));
        assert!(matches!(
            session.master_address("other").await,
            Err(BusError::Discovery(_))
        ));
        assert!(matches!(
            session.evaluate_script(0, PUBLISH_SCRIPT, &[], &[]).await,
            Err(BusError::Script(_))
        ));
        assert_eq!(broker.sentinel_connects(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_stops_receiving() {
        let broker = MemoryBroker::new();
        let a = node("a");
        broker.add_node(a.clone());
        let session = data_session(&broker, &a).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        session
            .subscribe(
                "bus",
                Arc::new(move |_: Bytes| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {}.boxed()
                }),
            )
            .await
            .unwrap();

        broker.publish(&a, "bus", "x").await;
        session.close(true).await;
        broker.publish(&a, "bus", "y").await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(broker.open_sessions(&a), 0);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_failed_session_reports_disconnected() {
        let broker = MemoryBroker::new();
        let a = node("a");
        broker.add_node(a.clone());
        let session = data_session(&broker, &a).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        session.add_event_handler(Arc::new(move |e: &SessionEvent| {
            sink.lock().unwrap().push(e.clone());
        }));

        broker.fail_sessions(&a, "socket closed");
        assert!(!session.is_connected());
        assert!(!session.is_key_connected(0, "bus"));

        broker.restore_sessions(&a);
        assert!(session.is_connected());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::Failed { .. }));
        assert!(matches!(events[1], SessionEvent::Restored { .. }));
    }

    #[tokio::test]
    async fn test_routable_flag() {
        let broker = MemoryBroker::new();
        let a = node("a");
        broker.add_node(a.clone());
        let session = data_session(&broker, &a).await;

        broker.set_routable(&a, false);
        assert!(session.is_connected());
        assert!(!session.is_key_connected(0, "bus"));
        broker.set_routable(&a, true);
        assert!(session.is_key_connected(0, "bus"));
    }
}
