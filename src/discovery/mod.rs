//! Discovery (sentinel) link.
//!
//! A control-plane session, separate from the data session, that resolves
//! the current primary for a service and watches [`SWITCH_MASTER_CHANNEL`]
//! for promotions.
//!
//! The link heals itself:
//! - on failure it detaches its handler, closes the session and reconnects
//!   with the same endpoint list until it succeeds (or the reconnect policy
//!   is exhausted, when one is configured);
//! - on restoration it polls `is_connected` before re-subscribing, since the
//!   client can report "restored" before commands are routable.
//!
//! Switch notifications published while the link was down are lost, so after
//! a reconnect the link resolves the primary again and hands it to the
//! handler registered with [`DiscoveryLink::on_reestablished`].

mod topology;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerSession, MessageHandler, SessionEvent};
use crate::config::{ConnectionOptions, Endpoint};
use crate::error::{BusError, Result};
use crate::events::HandlerBinding;
use crate::utils::retry::{poll_until, retry_with_policy, RetryPolicy};

pub use topology::{TopologyChange, TopologyParseError};

/// Channel on which sentinels announce a primary switch.
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Receives the primary resolved after the link reconnects.
pub type PrimaryHandler = Arc<dyn Fn(Endpoint) -> BoxFuture<'static, ()> + Send + Sync>;

/// Timing for the discovery link's self-healing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    /// Reconnect attempts after a failure.
    pub reconnect: RetryPolicy,
    /// Connectivity probes after a restore, before re-subscribing.
    pub connected_poll: RetryPolicy,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        let interval = std::time::Duration::from_millis(200);
        Self {
            reconnect: RetryPolicy::fixed(interval),
            connected_poll: RetryPolicy::fixed(interval),
        }
    }
}

struct LinkInner {
    broker: Arc<dyn Broker>,
    options: ConnectionOptions,
    on_switch: MessageHandler,
    on_reestablished: Mutex<Option<PrimaryHandler>>,
    policy: DiscoveryPolicy,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
    binding: Mutex<Option<HandlerBinding>>,
    restarting: AtomicBool,
    stopped: AtomicBool,
    restarts: AtomicUsize,
}

/// Handle to a running discovery link. Cheap to clone.
#[derive(Clone)]
pub struct DiscoveryLink {
    inner: Arc<LinkInner>,
}

impl DiscoveryLink {
    /// Open the sentinel session and subscribe `on_switch` to switch notifications.
    ///
    /// `options` must be discovery options
    /// (see [`ConnectionOptions::sentinel_options`]).
    pub async fn start(
        broker: Arc<dyn Broker>,
        options: ConnectionOptions,
        on_switch: MessageHandler,
        policy: DiscoveryPolicy,
    ) -> Result<Self> {
        if !options.is_sentinel() {
            return Err(BusError::Discovery(
                "discovery requires a service name".to_string(),
            ));
        }
        let inner = Arc::new(LinkInner {
            broker,
            options,
            on_switch,
            on_reestablished: Mutex::new(None),
            policy,
            session: Mutex::new(None),
            binding: Mutex::new(None),
            restarting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
        });
        inner.establish().await?;
        Ok(Self { inner })
    }

    /// Ask the sentinel for the current primary of the configured service.
    pub async fn resolve_master(&self) -> Result<Endpoint> {
        self.inner.resolve_master().await
    }

    /// Hand the freshly resolved primary to `handler` after every reconnect.
    ///
    /// Replaces any previously registered handler.
    pub fn on_reestablished(&self, handler: PrimaryHandler) {
        *self
            .inner
            .on_reestablished
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Stop healing and close the sentinel session.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.teardown().await;
    }

    /// Number of reconnects started after a failure.
    pub fn restart_count(&self) -> usize {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    /// Current sentinel session, if established.
    pub fn session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.inner.current_session()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl LinkInner {
    fn current_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn resolve_master(&self) -> Result<Endpoint> {
        let service = self
            .options
            .service_name
            .as_deref()
            .ok_or_else(|| BusError::Discovery("no service name configured".to_string()))?;
        let session = self
            .current_session()
            .ok_or_else(|| BusError::Discovery("discovery link is not established".to_string()))?;
        let master = session.master_address(service).await?;
        info!(service = %service, master = %master, "Resolved primary");
        Ok(master)
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        let session = self.broker.connect(&self.options).await?;
        if let Err(e) = session
            .subscribe(SWITCH_MASTER_CHANNEL, self.on_switch.clone())
            .await
        {
            session.close(false).await;
            return Err(e);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let binding = HandlerBinding::attach(
            session.clone(),
            Arc::new(move |event: &SessionEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_session_event(event);
                }
            }),
        );

        info!(endpoint = %session.endpoint(), "Discovery link established");
        *self.binding.lock().unwrap_or_else(PoisonError::into_inner) = Some(binding);
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(())
    }

    /// Detach the handler, then close the session.
    async fn teardown(&self) {
        let binding = self
            .binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(binding) = binding {
            binding.release();
        }
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.close(false).await;
        }
    }

    fn on_session_event(self: &Arc<Self>, event: &SessionEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        match event {
            SessionEvent::Failed { endpoint, reason } => {
                warn!(endpoint = %endpoint, reason = %reason, "Discovery link failed");
                if self.restarting.swap(true, Ordering::SeqCst) {
                    return;
                }
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.restart().await;
                    inner.restarting.store(false, Ordering::SeqCst);
                });
            }
            SessionEvent::Restored { endpoint } => {
                info!(endpoint = %endpoint, "Discovery link restored");
                let Some(session) = self.current_session() else {
                    return;
                };
                let inner = self.clone();
                tokio::spawn(async move { inner.resubscribe(session).await });
            }
            SessionEvent::Error { endpoint, message } => {
                warn!(endpoint = %endpoint, message = %message, "Discovery server error");
            }
        }
    }

    async fn restart(self: &Arc<Self>) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.teardown().await;

        let result = retry_with_policy(&self.policy.reconnect, "sentinel", || {
            let inner = self.clone();
            async move {
                if inner.stopped.load(Ordering::SeqCst) {
                    return Ok(());
                }
                inner.establish().await
            }
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "Discovery link could not be re-established");
        } else if self.stopped.load(Ordering::SeqCst) {
            // Raced with stop(): drop whatever was opened.
            self.teardown().await;
        } else {
            self.announce_resolved_primary().await;
        }
    }

    async fn announce_resolved_primary(&self) {
        let handler = self
            .on_reestablished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            return;
        };
        match self.resolve_master().await {
            Ok(master) => handler(master).await,
            Err(e) => warn!(error = %e, "Could not resolve primary after reconnect"),
        }
    }

    async fn resubscribe(&self, session: Arc<dyn BrokerSession>) {
        let ready = poll_until(&self.policy.connected_poll, || session.is_connected()).await;
        let still_current = self
            .current_session()
            .is_some_and(|current| Arc::ptr_eq(&current, &session));
        if !ready || !still_current || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        match session
            .subscribe(SWITCH_MASTER_CHANNEL, self.on_switch.clone())
            .await
        {
            Ok(()) => info!(
                endpoint = %session.endpoint(),
                "Re-subscribed to switch notifications"
            ),
            Err(e) => error!(error = %e, "Failed to re-subscribe to switch notifications"),
        }
    }
}
