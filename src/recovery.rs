//! Restore the latest observed id into the broker after a reconnect.
//!
//! A freshly promoted primary may have missed the last writes before the
//! switch. Restoring raises the stored counter to the highest id this
//! connector has seen, and never lowers a value a faster peer already set.

use std::fmt;

use bytes::Bytes;
use tracing::debug;

use crate::broker::BrokerSession;
use crate::error::{BusError, Result};
use crate::trace::TraceSink;
use crate::utils::retry::{poll_until, RetryPolicy};

/// Compare-and-set: raise `KEYS[1]` to `ARGV[1]` if it is lower.
///
/// A missing key counts as 0. Returns the new value, or nil if unchanged.
pub const RESTORE_LATEST_SCRIPT: &str = r#"local current = tonumber(redis.call('GET', KEYS[1])) or 0
local latest = tonumber(ARGV[1])
if current < latest then
    redis.call('SET', KEYS[1], ARGV[1])
    return ARGV[1]
end
return nil"#;

/// Result of a restore attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The stored value was raised to this id.
    Restored(u64),
    /// The stored value was already at or above the latest id.
    Unchanged,
    /// The restore did not complete; the message was sent to the trace sink.
    Failed(String),
}

impl fmt::Display for RestoreOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restored(id) => write!(f, "restored to {id}"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Wait until `key` is routable, then raise its stored value to `latest`.
///
/// Never returns an error: failures are reported to `trace` and folded
/// into [`RestoreOutcome::Failed`].
pub async fn restore_latest_value(
    session: &dyn BrokerSession,
    database: i64,
    key: &str,
    latest: u64,
    policy: &RetryPolicy,
    trace: &dyn TraceSink,
) -> RestoreOutcome {
    match try_restore(session, database, key, latest, policy).await {
        Ok(Some(value)) => {
            trace.information(&format!(
                "Restored Redis Key {key} to the latest Value {value}"
            ));
            RestoreOutcome::Restored(value)
        }
        Ok(None) => {
            debug!(key = %key, latest, "Stored value already current");
            RestoreOutcome::Unchanged
        }
        Err(e) => {
            let message = format!("Error while restoring Redis Key to the latest Value: {e}");
            trace.error(&message);
            RestoreOutcome::Failed(e.to_string())
        }
    }
}

async fn try_restore(
    session: &dyn BrokerSession,
    database: i64,
    key: &str,
    latest: u64,
    policy: &RetryPolicy,
) -> Result<Option<u64>> {
    if !poll_until(policy, || session.is_key_connected(database, key)).await {
        return Err(BusError::RecoveryTimeout {
            key: key.to_string(),
            waited: policy.budget().unwrap_or_default(),
        });
    }

    let reply = session
        .evaluate_script(
            database,
            RESTORE_LATEST_SCRIPT,
            &[key.to_string()],
            &[Bytes::from(latest.to_string())],
        )
        .await?;

    if reply.is_nil() {
        return Ok(None);
    }
    reply
        .as_u64()
        .map(Some)
        .ok_or_else(|| BusError::Script(format!("unexpected restore reply {reply:?}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::broker::memory::ScriptContext;
    use crate::broker::{Broker, MemoryBroker};
    use crate::config::{ConnectionOptions, Endpoint};
    use crate::test_utils::RecordingSink;

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(200)).with_max_attempts(5)
    }

    async fn setup(
        stored: Option<&'static str>,
    ) -> (MemoryBroker, Endpoint, Arc<dyn BrokerSession>) {
        let broker = MemoryBroker::new();
        let endpoint = Endpoint::new("10.0.0.2", 6379);
        broker.add_node(endpoint.clone());
        if let Some(value) = stored {
            broker.set_value(&endpoint, 0, "bus", value);
        }
        let session = broker
            .connect(&ConnectionOptions::parse("10.0.0.2:6379").unwrap())
            .await
            .unwrap();
        (broker, endpoint, session)
    }

    #[tokio::test]
    async fn test_raises_stale_value() {
        let (broker, endpoint, session) = setup(Some("5")).await;
        let sink = RecordingSink::default();

        let outcome = restore_latest_value(session.as_ref(), 0, "bus", 8, &policy(), &sink).await;

        assert_eq!(outcome, RestoreOutcome::Restored(8));
        assert_eq!(broker.value_u64(&endpoint, 0, "bus"), Some(8));
        assert_eq!(
            sink.information(),
            vec!["Restored Redis Key bus to the latest Value 8".to_string()]
        );
    }

    #[tokio::test]
    async fn test_never_regresses() {
        for stored in ["8", "9"] {
            let (broker, endpoint, session) = setup(Some(stored)).await;
            let sink = RecordingSink::default();

            let outcome =
                restore_latest_value(session.as_ref(), 0, "bus", 8, &policy(), &sink).await;

            assert_eq!(outcome, RestoreOutcome::Unchanged);
            assert_eq!(
                broker.value(&endpoint, 0, "bus").as_deref(),
                Some(stored.as_bytes())
            );
            assert!(sink.information().is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_key_counts_as_zero() {
        let (broker, endpoint, session) = setup(None).await;
        let sink = RecordingSink::default();

        let outcome = restore_latest_value(session.as_ref(), 0, "bus", 3, &policy(), &sink).await;
        assert_eq!(outcome, RestoreOutcome::Restored(3));
        assert_eq!(broker.value_u64(&endpoint, 0, "bus"), Some(3));

        let (_, _, session) = setup(None).await;
        let outcome = restore_latest_value(session.as_ref(), 0, "bus", 0, &policy(), &sink).await;
        assert_eq!(outcome, RestoreOutcome::Unchanged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_key_to_become_routable() {
        let (broker, endpoint, session) = setup(Some("5")).await;
        broker.set_routable(&endpoint, false);
        let sink = RecordingSink::default();

        let unblock = broker.clone();
        let node = endpoint.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            unblock.set_routable(&node, true);
        });

        let outcome = restore_latest_value(session.as_ref(), 0, "bus", 8, &policy(), &sink).await;
        assert_eq!(outcome, RestoreOutcome::Restored(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_and_reports_error() {
        let (broker, endpoint, session) = setup(Some("5")).await;
        broker.set_routable(&endpoint, false);
        let sink = RecordingSink::default();

        let outcome = restore_latest_value(session.as_ref(), 0, "bus", 8, &policy(), &sink).await;

        assert!(matches!(outcome, RestoreOutcome::Failed(_)));
        assert_eq!(broker.value_u64(&endpoint, 0, "bus"), Some(5));
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Error while restoring Redis Key to the latest Value:"));
    }

    #[tokio::test]
    async fn test_script_failure_is_swallowed() {
        let (broker, endpoint, session) = setup(Some("5")).await;
        broker.register_script(
            RESTORE_LATEST_SCRIPT,
            Arc::new(|_: &mut ScriptContext<'_>, _: &[String], _: &[Bytes]| {
                Err(BusError::Script("ERR Error running script".to_string()))
            }),
        );
        let sink = RecordingSink::default();

        let outcome = restore_latest_value(session.as_ref(), 0, "bus", 8, &policy(), &sink).await;

        assert!(matches!(outcome, RestoreOutcome::Failed(_)));
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(broker.value_u64(&endpoint, 0, "bus"), Some(5));
    }
}
