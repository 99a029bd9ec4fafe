//! Redis broker backed by `redis-rs`.
//!
//! Each session owns one [`ConnectionManager`] per logical database it has
//! touched, a pub/sub pump task per subscribed channel, and a health-check
//! task that turns PING outcomes into [`SessionEvent`]s.
//!
//! Pub/sub pumps re-establish their own connection when the stream ends, so
//! subscriptions survive a transient drop on the same endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerSession, MessageHandler, ScriptValue, SessionEvent};
use crate::config::{CommandMode, ConnectionOptions, Endpoint};
use crate::error::{BusError, Result};
use crate::events::{Listener, ListenerId, Listeners};

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Opens sessions against real Redis servers and sentinels.
#[derive(Debug, Clone)]
pub struct RedisBroker {
    health_check_interval: Duration,
}

impl RedisBroker {
    pub fn new(health_check_interval: Duration) -> Self {
        Self {
            health_check_interval,
        }
    }
}

impl Default for RedisBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

fn connection_info(
    endpoint: &Endpoint,
    options: &ConnectionOptions,
    database: i64,
) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(endpoint.host.clone(), endpoint.port),
        redis: RedisConnectionInfo {
            db: database,
            username: options.user.clone(),
            password: options.password.clone(),
            ..Default::default()
        },
    }
}

async fn open_manager(
    endpoint: &Endpoint,
    options: &ConnectionOptions,
    database: i64,
) -> Result<(Client, ConnectionManager)> {
    let client = Client::open(connection_info(endpoint, options, database))
        .map_err(|e| BusError::Connection(format!("{endpoint}: {e}")))?;
    let connect = ConnectionManager::new(client.clone());
    let mut manager = tokio::time::timeout(options.connect_timeout, connect)
        .await
        .map_err(|_| {
            BusError::Connection(format!(
                "{endpoint}: connect timed out after {:?}",
                options.connect_timeout
            ))
        })?
        .map_err(|e| BusError::Connection(format!("{endpoint}: {e}")))?;
    if let Some(name) = &options.client_name {
        set_client_name(&mut manager, name).await;
    }
    Ok((client, manager))
}

/// `CLIENT SETNAME` on a fresh manager. Not reapplied after the manager
/// reconnects internally.
async fn set_client_name(manager: &mut ConnectionManager, name: &str) {
    let reply: redis::RedisResult<()> = redis::cmd("CLIENT")
        .arg("SETNAME")
        .arg(name)
        .query_async(manager)
        .await;
    if let Err(e) = reply {
        warn!(name = %name, error = %e, "CLIENT SETNAME failed");
    }
}

/// Counts a command as in flight until dropped, including when the caller
/// abandons the future mid-await.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn is_link_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_timeout() || e.is_connection_refusal()
}

fn map_error(endpoint: &Endpoint, e: RedisError) -> BusError {
    if is_link_error(&e) {
        BusError::Connection(format!("{endpoint}: {e}"))
    } else {
        BusError::Script(e.to_string())
    }
}

fn to_script_value(value: Value) -> ScriptValue {
    match value {
        Value::Nil => ScriptValue::Nil,
        Value::Int(n) => ScriptValue::Int(n),
        Value::BulkString(data) => ScriptValue::Data(Bytes::from(data)),
        Value::Array(items) | Value::Set(items) => {
            ScriptValue::Array(items.into_iter().map(to_script_value).collect())
        }
        Value::SimpleString(text) => ScriptValue::Status(text),
        Value::Okay => ScriptValue::Status("OK".to_string()),
        Value::Boolean(b) => ScriptValue::Int(i64::from(b)),
        Value::Double(d) => ScriptValue::Status(d.to_string()),
        Value::VerbatimString { text, .. } => ScriptValue::Data(Bytes::from(text)),
        other => ScriptValue::Status(format!("{other:?}")),
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn BrokerSession>> {
        let database = match options.command_mode {
            CommandMode::Standard => options.default_database,
            CommandMode::Sentinel => 0,
        };

        let mut last_error = BusError::Connection("no endpoints configured".to_string());
        for endpoint in &options.endpoints {
            match open_manager(endpoint, options, database).await {
                Ok((client, manager)) => {
                    info!(
                        endpoint = %endpoint,
                        mode = ?options.command_mode,
                        "Connected to Redis"
                    );
                    let session = RedisSession::new(
                        endpoint.clone(),
                        options.clone(),
                        client,
                        database,
                        manager,
                        self.health_check_interval,
                    );
                    return Ok(Arc::new(session));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Redis endpoint unreachable");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Live session on one Redis endpoint.
pub struct RedisSession {
    endpoint: Endpoint,
    options: ConnectionOptions,
    client: Client,
    managers: tokio::sync::Mutex<HashMap<i64, ConnectionManager>>,
    default_database: i64,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    handlers: Arc<Listeners<SessionEvent>>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    reconnect_interval: Duration,
}

impl RedisSession {
    fn new(
        endpoint: Endpoint,
        options: ConnectionOptions,
        client: Client,
        database: i64,
        manager: ConnectionManager,
        health_check_interval: Duration,
    ) -> Self {
        let handlers = Arc::new(Listeners::new());
        let connected = Arc::new(AtomicBool::new(true));
        let monitor = tokio::spawn(health_check(
            endpoint.clone(),
            manager.clone(),
            handlers.clone(),
            connected.clone(),
            health_check_interval,
        ));

        Self {
            endpoint,
            options,
            client,
            managers: tokio::sync::Mutex::new(HashMap::from([(database, manager)])),
            default_database: database,
            pumps: Mutex::new(HashMap::new()),
            monitor: Mutex::new(Some(monitor)),
            handlers,
            connected,
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            reconnect_interval: health_check_interval,
        }
    }

    async fn manager(&self, database: i64) -> Result<ConnectionManager> {
        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(&database) {
            return Ok(manager.clone());
        }
        let (_, manager) = open_manager(&self.endpoint, &self.options, database).await?;
        managers.insert(database, manager.clone());
        Ok(manager)
    }

    fn stop_tasks(&self) {
        for (_, pump) in self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            pump.abort();
        }
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
    }
}

impl Drop for RedisSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// PING on an interval; report link transitions and server errors.
async fn health_check(
    endpoint: Endpoint,
    mut manager: ConnectionManager,
    handlers: Arc<Listeners<SessionEvent>>,
    connected: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let ping: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut manager).await;
        match ping {
            Ok(_) => {
                if !connected.swap(true, Ordering::SeqCst) {
                    info!(endpoint = %endpoint, "Redis link restored");
                    handlers.emit(&SessionEvent::Restored {
                        endpoint: endpoint.clone(),
                    });
                }
            }
            Err(e) if is_link_error(&e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    error!(endpoint = %endpoint, error = %e, "Redis link failed");
                    handlers.emit(&SessionEvent::Failed {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Redis server error");
                handlers.emit(&SessionEvent::Error {
                    endpoint: endpoint.clone(),
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Forward messages on `channel` to `handler`, re-subscribing after a drop.
async fn pump(
    endpoint: Endpoint,
    client: Client,
    channel: String,
    handler: MessageHandler,
    mut pubsub: redis::aio::PubSub,
    reconnect_interval: Duration,
) {
    loop {
        {
            let mut messages = std::pin::pin!(pubsub.into_on_message());
            while let Some(message) = messages.next().await {
                handler(Bytes::copy_from_slice(message.get_payload_bytes())).await;
            }
        }

        warn!(endpoint = %endpoint, channel = %channel, "Subscription stream ended, resubscribing");
        pubsub = loop {
            tokio::time::sleep(reconnect_interval).await;
            match subscribe_channel(&client, &channel).await {
                Ok(pubsub) => break pubsub,
                Err(e) => debug!(channel = %channel, error = %e, "Resubscribe attempt failed"),
            }
        };
        info!(endpoint = %endpoint, channel = %channel, "Resubscribed");
    }
}

async fn subscribe_channel(
    client: &Client,
    channel: &str,
) -> redis::RedisResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

#[async_trait]
impl BrokerSession for RedisSession {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    // Single-node deployments route every key through the same link.
    fn is_key_connected(&self, _database: i64, _key: &str) -> bool {
        self.is_connected()
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection(format!("session to {} is closed", self.endpoint)));
        }
        let pubsub = subscribe_channel(&self.client, channel)
            .await
            .map_err(|e| map_error(&self.endpoint, e))?;
        let task = tokio::spawn(pump(
            self.endpoint.clone(),
            self.client.clone(),
            channel.to_string(),
            handler,
            pubsub,
            self.reconnect_interval,
        ));

        let previous = self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), task);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!(endpoint = %self.endpoint, channel = %channel, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let task = self
            .pumps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    async fn evaluate_script(
        &self,
        database: i64,
        script: &str,
        keys: &[String],
        args: &[Bytes],
    ) -> Result<ScriptValue> {
        if self.options.command_mode == CommandMode::Sentinel {
            return Err(BusError::Script(
                "ERR scripts are not available on a sentinel session".to_string(),
            ));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection(format!("session to {} is closed", self.endpoint)));
        }

        let mut manager = self.manager(database).await?;
        let script = redis::Script::new(script);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_ref());
        }

        let in_flight = InFlight::enter(&self.in_flight);
        let reply = tokio::time::timeout(self.options.sync_timeout, async {
            let value: redis::RedisResult<Value> = invocation.invoke_async(&mut manager).await;
            value
        })
        .await;
        drop(in_flight);

        match reply {
            Ok(Ok(value)) => Ok(to_script_value(value)),
            Ok(Err(e)) => Err(map_error(&self.endpoint, e)),
            Err(_) => Err(BusError::Connection(format!(
                "{}: script timed out after {:?}",
                self.endpoint, self.options.sync_timeout
            ))),
        }
    }

    async fn master_address(&self, service_name: &str) -> Result<Endpoint> {
        if self.options.command_mode != CommandMode::Sentinel {
            return Err(BusError::Discovery(
                "master lookup requires a sentinel session".to_string(),
            ));
        }
        let mut manager = self.manager(self.default_database).await?;
        let reply: Option<Vec<String>> = tokio::time::timeout(
            self.options.sync_timeout,
            redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(service_name)
                .query_async(&mut manager),
        )
        .await
        .map_err(|_| BusError::Discovery(format!("{}: master lookup timed out", self.endpoint)))?
        .map_err(|e| BusError::Discovery(format!("{}: {e}", self.endpoint)))?;

        match reply.as_deref() {
            Some([host, port]) => {
                let port = port
                    .parse()
                    .map_err(|_| BusError::Discovery(format!("invalid master port '{port}'")))?;
                Ok(Endpoint::new(host.as_str(), port))
            }
            _ => Err(BusError::Discovery(format!(
                "No master found for service '{service_name}'"
            ))),
        }
    }

    async fn close(&self, drain: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if drain {
            let deadline = tokio::time::Instant::now() + self.options.sync_timeout;
            while self.in_flight.load(Ordering::SeqCst) > 0
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        }
        self.stop_tasks();
        self.managers.lock().await.clear();
        self.connected.store(false, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "Redis session closed");
    }

    fn add_event_handler(&self, handler: Listener<SessionEvent>) -> ListenerId {
        self.handlers.add(handler)
    }

    fn remove_event_handler(&self, id: ListenerId) -> bool {
        self.handlers.remove(id)
    }
}
