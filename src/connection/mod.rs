//! Data connection.
//!
//! [`BusConnection`] holds the live session to the current primary, runs
//! publish scripts, delivers subscribed messages, and re-homes itself when
//! the discovery link announces a new primary.
//!
//! # Re-home
//!
//! Triggered by a `+switch-master` notification, by the primary the discovery
//! link resolves after it reconnects, or by an explicit
//! [`BusConnection::rehome`]. Re-homes are serialised. A notification that
//! names the current primary is a no-op. Otherwise:
//!
//! 1. open a session to the new primary (on failure the old session stays)
//! 2. release the old session's handler binding
//! 3. install the new session under a fresh generation
//! 4. re-subscribe every remembered channel
//! 5. close the old session (drained, bounded by `drain_timeout`)
//! 6. raise `ConnectionRestored(MasterSwitched)`
//!
//! Messages still arriving from the old session carry a stale generation and
//! are dropped before they reach the callback or the latest id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerSession, MessageHandler, ScriptValue, SessionEvent};
use crate::codec::Message;
use crate::config::{BusSettings, ConnectionOptions, Endpoint};
use crate::discovery::{DiscoveryLink, DiscoveryPolicy, PrimaryHandler, TopologyChange};
use crate::error::{BusError, Result};
use crate::events::{ConnectionEvent, EventHub, HandlerBinding, ListenerId, RestoreReason};
use crate::recovery::{restore_latest_value, RestoreOutcome};
use crate::sequence::LatestMessageId;
use crate::trace::{TraceSink, TracingSink};
use crate::utils::retry::{retry_with_policy, RetryPolicy};


/// Publish script: bump the id counter at `KEYS[1]` and publish
/// `"<id> <frame>"` on the channel of the same name. Returns the id.
pub const PUBLISH_SCRIPT: &str = r#"local id = redis.call('INCR', KEYS[1])
redis.call('PUBLISH', KEYS[1], id .. ' ' .. ARGV[1])
return id"#;

/// Consumer callback for decoded messages.
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Result of a re-home request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehomeOutcome {
    /// The announced endpoint is already the current primary.
    AlreadyCurrent,
    /// The data session now points at the announced endpoint.
    Switched,
}

/// Timing knobs for the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorSettings {
    /// Connectivity wait before a restore.
    pub recovery: RetryPolicy,
    pub discovery: DiscoveryPolicy,
    /// Upper bound on draining a replaced or closed session.
    pub drain_timeout: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self::from(&BusSettings::default())
    }
}

impl From<&BusSettings> for ConnectorSettings {
    fn from(settings: &BusSettings) -> Self {
        Self {
            recovery: settings.recovery.policy(),
            discovery: DiscoveryPolicy {
                reconnect: settings.discovery.reconnect_policy(),
                connected_poll: settings.discovery.connected_poll_policy(),
            },
            drain_timeout: settings.drain_timeout(),
        }
    }
}

/// Live data session plus the registration of our handler on it.
struct DataHandle {
    session: Arc<dyn BrokerSession>,
    binding: HandlerBinding,
    generation: u64,
}

struct Inner {
    broker: Arc<dyn Broker>,
    settings: ConnectorSettings,
    trace: RwLock<Arc<dyn TraceSink>>,
    options: Mutex<Option<ConnectionOptions>>,
    active: Mutex<Option<Arc<DataHandle>>>,
    generation: AtomicU64,
    latest: LatestMessageId,
    events: EventHub,
    subscriptions: Mutex<HashMap<String, MessageCallback>>,
    discovery: Mutex<Option<DiscoveryLink>>,
    rehome_lock: tokio::sync::Mutex<()>,
    /// Bumped by every `close`; aborts a connect that is still retrying.
    close_requests: watch::Sender<u64>,
}

/// Resilient connection to the primary of a (possibly sentinel-managed) Redis.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct BusConnection {
    inner: Arc<Inner>,
}

impl BusConnection {
    pub fn new(broker: Arc<dyn Broker>, settings: ConnectorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                settings,
                trace: RwLock::new(Arc::new(TracingSink)),
                options: Mutex::new(None),
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
                latest: LatestMessageId::default(),
                events: EventHub::new(),
                subscriptions: Mutex::new(HashMap::new()),
                discovery: Mutex::new(None),
                rehome_lock: tokio::sync::Mutex::new(()),
                close_requests: watch::Sender::new(0),
            }),
        }
    }

    /// Connection backed by real Redis, timed from `settings`.
    #[cfg(feature = "redis")]
    pub fn with_redis(settings: &BusSettings) -> Self {
        let broker = crate::broker::RedisBroker::new(settings.health_check_interval());
        Self::new(Arc::new(broker), ConnectorSettings::from(settings))
    }

    /// Open the data session described by `connection_string`.
    ///
    /// In sentinel mode (`serviceName=` present) the discovery link is started
    /// first and the data session points at the primary it resolves.
    pub async fn connect(&self, connection_string: &str, trace: Arc<dyn TraceSink>) -> Result<()> {
        let inner = &self.inner;
        let mut closes = inner.close_requests.subscribe();
        let _serial = inner.rehome_lock.lock().await;

        if inner.current().is_some() {
            return Err(BusError::Connection("connection already started".to_string()));
        }
        let mut options = ConnectionOptions::parse(connection_string)?;
        *inner.trace.write().unwrap_or_else(PoisonError::into_inner) = trace;

        if options.is_sentinel() {
            let link = DiscoveryLink::start(
                inner.broker.clone(),
                options.sentinel_options(),
                inner.switch_handler(),
                inner.settings.discovery,
            )
            .await?;
            match link.resolve_master().await {
                Ok(master) => options.retarget(master),
                Err(e) => {
                    link.stop().await;
                    return Err(e);
                }
            }
            link.on_reestablished(inner.reresolve_handler());
            *inner.discovery.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
        }

        let session = match inner.open_session(&options, &mut closes).await {
            Ok(session) => session,
            Err(e) => {
                inner.stop_discovery().await;
                return Err(e);
            }
        };
        info!(
            endpoint = %session.endpoint(),
            sentinel = options.is_sentinel(),
            "Data connection started"
        );
        *inner.options.lock().unwrap_or_else(PoisonError::into_inner) = Some(options);
        inner.install(session);
        Ok(())
    }

    /// Subscribe `on_message` to `channel`.
    ///
    /// Each payload is decoded, handed to `on_message`, then folded into the
    /// latest id. Subscribing again to the same channel replaces the callback.
    /// Waits for any re-home in progress, so the channel always lands on the
    /// session that stays live.
    pub async fn subscribe<F>(&self, channel: &str, on_message: F) -> Result<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        // A re-home must not swap the session between the lookup and SUBSCRIBE.
        let _serial = inner.rehome_lock.lock().await;
        let handle = inner.current().ok_or(BusError::NotConnected)?;
        let callback: MessageCallback = Arc::new(on_message);

        inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), callback.clone());

        let handler = inner.message_handler(channel, callback, handle.generation);
        if let Err(e) = handle.session.subscribe(channel, handler).await {
            inner
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(channel);
            return Err(e);
        }
        info!(channel = %channel, endpoint = %handle.session.endpoint(), "Subscribed");
        Ok(())
    }

    /// Evaluate `script` with `key` as `KEYS[1]` and `payload` as `ARGV[1]`.
    pub async fn script_evaluate(
        &self,
        database: i64,
        script: &str,
        key: &str,
        payload: impl Into<Bytes>,
    ) -> Result<ScriptValue> {
        let handle = self.inner.current().ok_or(BusError::NotConnected)?;
        handle
            .session
            .evaluate_script(database, script, &[key.to_string()], &[payload.into()])
            .await
    }

    /// Publish `payload` on channel `key` with the next id from the counter at `key`.
    ///
    /// Returns the assigned id.
    pub async fn publish(&self, database: i64, key: &str, payload: &[u8]) -> Result<u64> {
        let frame = Message::frame(payload)?;
        let reply = self
            .script_evaluate(database, PUBLISH_SCRIPT, key, frame)
            .await?;
        let id = reply
            .as_u64()
            .ok_or_else(|| BusError::Script(format!("unexpected publish reply {reply:?}")))?;
        debug!(key = %key, id, "Published");
        Ok(id)
    }

    /// Raise the stored counter at `key` to the latest observed id.
    ///
    /// Best effort: failures go to the trace sink and come back as
    /// [`RestoreOutcome::Failed`].
    pub async fn restore_latest_value_for_key(&self, database: i64, key: &str) -> RestoreOutcome {
        let inner = &self.inner;
        let trace = inner.trace();
        let Some(handle) = inner.current() else {
            let e = BusError::NotConnected;
            trace.error(&format!(
                "Error while restoring Redis Key to the latest Value: {e}"
            ));
            return RestoreOutcome::Failed(e.to_string());
        };
        restore_latest_value(
            handle.session.as_ref(),
            database,
            key,
            inner.latest.get(),
            &inner.settings.recovery,
            trace.as_ref(),
        )
        .await
    }

    /// Point the data session at `endpoint`. See the module docs.
    pub async fn rehome(&self, endpoint: Endpoint) -> Result<RehomeOutcome> {
        self.inner.rehome(endpoint).await
    }

    /// Unsubscribe `key`, stop discovery, and close the data session.
    ///
    /// With `drain`, the session may finish in-flight commands for up to
    /// `drain_timeout`. Closing a connection that never started does nothing,
    /// except to abort a `connect` still retrying an unreachable primary.
    pub async fn close(&self, key: &str, drain: bool) {
        let inner = &self.inner;
        inner.close_requests.send_modify(|requests| *requests += 1);
        let _serial = inner.rehome_lock.lock().await;

        inner.stop_discovery().await;

        let handle = inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        handle.binding.release();

        if let Err(e) = handle.session.unsubscribe(key).await {
            warn!(key = %key, error = %e, "Unsubscribe failed during close");
        }
        inner.close_session(handle.session.as_ref(), drain).await;
        info!(endpoint = %handle.session.endpoint(), "Data connection closed");
    }

    /// Register a listener for connection events.
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove(id)
    }

    /// Highest message id delivered so far.
    pub fn latest_message_id(&self) -> u64 {
        self.inner.latest.get()
    }

    /// Endpoint of the live data session.
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.inner.current().map(|handle| handle.session.endpoint())
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .current()
            .is_some_and(|handle| handle.session.is_connected())
    }

    /// Whether the connection string named a sentinel service.
    pub fn is_sentinel(&self) -> bool {
        self.inner
            .options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(ConnectionOptions::is_sentinel)
    }

    /// The running discovery link, in sentinel mode.
    pub fn discovery(&self) -> Option<DiscoveryLink> {
        self.inner
            .discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<DataHandle>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn trace(&self) -> Arc<dyn TraceSink> {
        self.trace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn open_session(
        &self,
        options: &ConnectionOptions,
        closes: &mut watch::Receiver<u64>,
    ) -> Result<Arc<dyn BrokerSession>> {
        if options.abort_on_connect_fail {
            return self.broker.connect(options).await;
        }
        let attempts = retry_with_policy(&self.settings.discovery.reconnect, "redis", || {
            self.broker.connect(options)
        });
        tokio::select! {
            result = attempts => result,
            _ = closes.changed() => {
                info!("Connect abandoned, connection closed");
                Err(BusError::Connection("connection closed while connecting".to_string()))
            }
        }
    }

    /// Make `session` the active one under a new generation.
    fn install(self: &Arc<Self>, session: Arc<dyn BrokerSession>) -> Arc<DataHandle> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<Self> = Arc::downgrade(self);
        let binding = HandlerBinding::attach(
            session.clone(),
            Arc::new(move |event: &SessionEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_session_event(generation, event);
                }
            }),
        );
        let handle = Arc::new(DataHandle {
            session,
            binding,
            generation,
        });
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        handle
    }

    fn on_session_event(&self, generation: u64, event: &SessionEvent) {
        if generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        match event {
            SessionEvent::Failed { endpoint, reason } => {
                error!(endpoint = %endpoint, reason = %reason, "Data connection failed");
            }
            SessionEvent::Restored { endpoint } => {
                info!(endpoint = %endpoint, "Data connection restored");
            }
            SessionEvent::Error { endpoint, message } => {
                warn!(endpoint = %endpoint, message = %message, "Redis error message");
            }
        }
        self.events.emit(&ConnectionEvent::from_session(event));
    }

    fn message_handler(
        self: &Arc<Self>,
        channel: &str,
        callback: MessageCallback,
        generation: u64,
    ) -> MessageHandler {
        let weak = Arc::downgrade(self);
        let channel = channel.to_string();
        Arc::new(move |payload: Bytes| {
            if let Some(inner) = weak.upgrade() {
                inner.deliver(&channel, generation, &callback, &payload);
            }
            futures::future::ready(()).boxed()
        })
    }

    fn deliver(&self, channel: &str, generation: u64, callback: &MessageCallback, payload: &[u8]) {
        if generation != self.generation.load(Ordering::SeqCst) {
            debug!(channel = %channel, generation, "Discarding message from replaced session");
            return;
        }
        match Message::decode(payload) {
            Ok(message) => {
                let id = message.id;
                callback(message);
                self.latest.observe(id);
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Undecodable message");
                self.events
                    .emit(&ConnectionEvent::ErrorMessage(Arc::new(BusError::Decode(e))));
            }
        }
    }

    fn switch_handler(self: &Arc<Self>) -> MessageHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |payload: Bytes| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_switch_notification(&payload).await;
                }
            }
            .boxed()
        })
    }

    async fn on_switch_notification(self: &Arc<Self>, payload: &[u8]) {
        let change = match TopologyChange::parse(payload) {
            Ok(Some(change)) => change,
            Ok(None) => {
                debug!("Ignoring empty switch notification");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed switch notification");
                return;
            }
        };

        let service = self
            .options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|options| options.service_name.clone());
        if service.as_deref() != Some(change.service_name.as_str()) {
            debug!(service = %change.service_name, "Ignoring switch for another service");
            return;
        }

        info!(
            service = %change.service_name,
            old = %change.old_primary,
            new = %change.new_primary,
            "Primary switch announced"
        );
        self.follow_primary(change.new_primary).await;
    }

    /// Re-home handler for the primary resolved after a discovery reconnect.
    fn reresolve_handler(self: &Arc<Self>) -> PrimaryHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |endpoint: Endpoint| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.follow_primary(endpoint).await;
                }
            }
            .boxed()
        })
    }

    async fn follow_primary(self: &Arc<Self>, endpoint: Endpoint) {
        if let Err(e) = self.rehome(endpoint).await {
            error!(error = %e, "Re-home failed");
            self.events.emit(&ConnectionEvent::ConnectionFailed(Arc::new(e)));
        }
    }

    async fn rehome(self: &Arc<Self>, endpoint: Endpoint) -> Result<RehomeOutcome> {
        let _serial = self.rehome_lock.lock().await;

        let mut options = self
            .options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BusError::NotConnected)?;
        // Only the first configured endpoint is compared.
        if options.primary_endpoint() == Some(&endpoint) {
            debug!(endpoint = %endpoint, "Already on announced primary");
            return Ok(RehomeOutcome::AlreadyCurrent);
        }
        let old = self.current().ok_or(BusError::NotConnected)?;

        options.retarget(endpoint.clone());
        let session = self.broker.connect(&options).await?;

        old.binding.release();
        let handle = self.install(session);
        *self.options.lock().unwrap_or_else(PoisonError::into_inner) = Some(options);

        let subscriptions: Vec<(String, MessageCallback)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(channel, callback)| (channel.clone(), callback.clone()))
            .collect();
        for (channel, callback) in subscriptions {
            let handler = self.message_handler(&channel, callback, handle.generation);
            if let Err(e) = handle.session.subscribe(&channel, handler).await {
                error!(channel = %channel, error = %e, "Re-subscribe failed after re-home");
                self.events.emit(&ConnectionEvent::ErrorMessage(Arc::new(e)));
            }
        }

        self.close_session(old.session.as_ref(), true).await;
        info!(from = %old.session.endpoint(), to = %endpoint, "Re-homed data connection");

        self.events
            .emit(&ConnectionEvent::ConnectionRestored(RestoreReason::MasterSwitched {
                endpoint,
            }));
        Ok(RehomeOutcome::Switched)
    }

    async fn close_session(&self, session: &dyn BrokerSession, drain: bool) {
        if !drain {
            session.close(false).await;
            return;
        }
        let timeout = self.settings.drain_timeout;
        if tokio::time::timeout(timeout, session.close(true)).await.is_err() {
            warn!(endpoint = %session.endpoint(), ?timeout, "Drain timed out, closing");
            session.close(false).await;
        }
    }

    async fn stop_discovery(&self) {
        let link = self
            .discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            link.stop().await;
        }
    }
}
