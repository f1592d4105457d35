//! Database-full handling.
//!
//! When an insert hits the store quota, an [`OverflowChain`] runs its links in
//! order. Each link either resolves the overflow (the insert may be retried)
//! or passes on to its successor; a chain where no link resolves reports
//! [`OverflowOutcome::Unresolved`] and ingestion halts.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::events::{EventBus, PipelineEvent};
use crate::sample::Sample;
use crate::store::{OrderingPolicy, SampleStore, StoreError};
use crate::worker::{Interrupted, Shutdown};

/// Result of running a link or a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowOutcome {
    /// Space was freed; the blocked insert may be retried
    Resolved,
    /// Nothing was freed; the caller must escalate
    Unresolved,
}

/// Chain composition selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowChainSpec {
    /// wait → delete → notify: self-healing, evicts old data
    WaitDeleteNotify {
        wait: Duration,
        delete_count: usize,
        priority_based: bool,
    },
    /// wait → notify → stop: keeps stored data, halts ingestion
    WaitNotifyStop { wait: Duration },
}

impl Default for OverflowChainSpec {
    fn default() -> Self {
        OverflowChainSpec::WaitDeleteNotify {
            wait: Duration::from_secs(5),
            delete_count: 100,
            priority_based: true,
        }
    }
}

/// One link of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Give a concurrent consumer time to free space; never resolves by itself
    Wait { duration: Duration },
    /// Evict `count` records, lowest priority first or strictly oldest first
    DeleteOldest { count: usize, priority_based: bool },
    /// Raise a "database full" notification
    Notify,
    /// Halt ingestion
    Stop,
}

impl OverflowStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            OverflowStrategy::Wait { .. } => "wait",
            OverflowStrategy::DeleteOldest { .. } => "delete",
            OverflowStrategy::Notify => "notify",
            OverflowStrategy::Stop => "stop",
        }
    }

    /// Apply this link once.
    pub async fn process(
        &self,
        ctx: &OverflowContext<'_>,
        chain: &str,
    ) -> Result<OverflowOutcome, Interrupted> {
        match *self {
            OverflowStrategy::Wait { duration } => {
                debug!(wait_ms = duration.as_millis() as u64, "Waiting for free space");
                ctx.shutdown.sleep(duration).await?;
                Ok(OverflowOutcome::Unresolved)
            }
            OverflowStrategy::DeleteOldest {
                count,
                priority_based,
            } => {
                let policy = if priority_based {
                    OrderingPolicy::LowestPriorityFirst
                } else {
                    OrderingPolicy::OldestFirst
                };
                match ctx.store.lock().remove_ordered(count, policy) {
                    Ok(removed) if !removed.is_empty() => {
                        info!(removed = removed.len(), ?policy, "Evicted samples to free space");
                        Ok(OverflowOutcome::Resolved)
                    }
                    Ok(_) => Ok(OverflowOutcome::Unresolved),
                    Err(e) => {
                        warn!(error = %e, "Eviction failed");
                        Ok(OverflowOutcome::Unresolved)
                    }
                }
            }
            OverflowStrategy::Notify => {
                ctx.events.publish(PipelineEvent::DatabaseFull {
                    strategy: chain.to_string(),
                });
                Ok(OverflowOutcome::Unresolved)
            }
            OverflowStrategy::Stop => {
                ctx.halted.store(true, Ordering::SeqCst);
                Ok(OverflowOutcome::Unresolved)
            }
        }
    }
}

/// Everything a link may touch.
pub struct OverflowContext<'a> {
    pub store: &'a Mutex<SampleStore>,
    pub events: &'a EventBus,
    /// Set by the stop link; ingestion checks it after every chain run
    pub halted: &'a AtomicBool,
    pub shutdown: &'a Shutdown,
}

/// Ordered list of links; each link's successor is the next element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowChain {
    links: Vec<OverflowStrategy>,
}

impl OverflowChain {
    pub fn new(links: Vec<OverflowStrategy>) -> Self {
        Self { links }
    }

    /// Build the chain for a configuration.
    pub fn from_spec(spec: &OverflowChainSpec) -> Self {
        match *spec {
            OverflowChainSpec::WaitDeleteNotify {
                wait,
                delete_count,
                priority_based,
            } => Self::new(vec![
                OverflowStrategy::Wait { duration: wait },
                OverflowStrategy::DeleteOldest {
                    count: delete_count,
                    priority_based,
                },
                OverflowStrategy::Notify,
            ]),
            OverflowChainSpec::WaitNotifyStop { wait } => Self::new(vec![
                OverflowStrategy::Wait { duration: wait },
                OverflowStrategy::Notify,
                OverflowStrategy::Stop,
            ]),
        }
    }

    pub fn links(&self) -> &[OverflowStrategy] {
        &self.links
    }

    /// Run links in order until one resolves the overflow.
    pub async fn execute(&self, ctx: &OverflowContext<'_>) -> Result<OverflowOutcome, Interrupted> {
        let label = self.to_string();
        for link in &self.links {
            if link.process(ctx, &label).await? == OverflowOutcome::Resolved {
                debug!(strategy = link.name(), "Overflow resolved");
                return Ok(OverflowOutcome::Resolved);
            }
        }
        Ok(OverflowOutcome::Unresolved)
    }
}

impl fmt::Display for OverflowChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.links.iter().map(|l| l.name()).collect();
        write!(f, "{}", names.join(" -> "))
    }
}

/// How an overflow-aware insert ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The batch is stored
    Stored,
    /// The chain could not free enough space; ingestion must halt
    Unresolved,
    /// The batch alone is larger than the whole quota
    Oversized,
}

/// Errors of an overflow-aware insert other than running out of space.
#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    #[error("interrupted by shutdown")]
    Interrupted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<Interrupted> for InsertError {
    fn from(_: Interrupted) -> Self {
        InsertError::Interrupted
    }
}

/// Insert `samples`, running the overflow chain each time the quota blocks
/// the insert, until it succeeds or the chain gives up.
pub async fn insert_with_overflow(
    chain: &OverflowChain,
    ctx: &OverflowContext<'_>,
    samples: &[Sample],
) -> Result<InsertOutcome, InsertError> {
    loop {
        let attempt = ctx.store.lock().insert(samples);
        match attempt {
            Ok(()) => return Ok(InsertOutcome::Stored),
            Err(StoreError::Full { required, .. }) => {
                let max_bytes = ctx.store.lock().quota().max_bytes;
                if required > max_bytes {
                    return Ok(InsertOutcome::Oversized);
                }

                warn!(
                    required,
                    max_bytes,
                    chain = %chain,
                    "Store quota exceeded, running overflow strategies"
                );
                match chain.execute(ctx).await? {
                    OverflowOutcome::Resolved => continue,
                    OverflowOutcome::Unresolved => return Ok(InsertOutcome::Unresolved),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreQuota;
    use serde_json::json;

    struct Fixture {
        store: Mutex<SampleStore>,
        events: EventBus,
        halted: AtomicBool,
        shutdown: Shutdown,
        _trigger: crate::worker::ShutdownTrigger,
    }

    impl Fixture {
        fn new(max_bytes: u64) -> Self {
            let (trigger, shutdown) = Shutdown::channel();
            Self {
                store: Mutex::new(SampleStore::in_memory(StoreQuota::new(max_bytes))),
                events: EventBus::new(),
                halted: AtomicBool::new(false),
                shutdown,
                _trigger: trigger,
            }
        }

        fn ctx(&self) -> OverflowContext<'_> {
            OverflowContext {
                store: &self.store,
                events: &self.events,
                halted: &self.halted,
                shutdown: &self.shutdown,
            }
        }
    }

    fn sample(priority: u8, ts: i64) -> Sample {
        Sample::new("dev", priority, json!({"reading": ts})).at(ts)
    }

    const SHORT: Duration = Duration::from_millis(5);

    #[test]
    fn test_chain_from_spec() {
        let chain = OverflowChain::from_spec(&OverflowChainSpec::WaitDeleteNotify {
            wait: SHORT,
            delete_count: 3,
            priority_based: false,
        });
        assert_eq!(chain.to_string(), "wait -> delete -> notify");
        assert_eq!(
            chain.links()[1],
            OverflowStrategy::DeleteOldest {
                count: 3,
                priority_based: false
            }
        );

        let chain = OverflowChain::from_spec(&OverflowChainSpec::WaitNotifyStop { wait: SHORT });
        assert_eq!(chain.to_string(), "wait -> notify -> stop");
    }

    #[tokio::test]
    async fn test_wait_delegates() {
        let fx = Fixture::new(1_000);
        let outcome = OverflowStrategy::Wait { duration: SHORT }
            .process(&fx.ctx(), "wait")
            .await
            .unwrap();
        assert_eq!(outcome, OverflowOutcome::Unresolved);
    }

    #[tokio::test]
    async fn test_wait_interrupted() {
        let fx = Fixture::new(1_000);
        fx._trigger.fire();
        let result = OverflowStrategy::Wait {
            duration: Duration::from_secs(60),
        }
        .process(&fx.ctx(), "wait")
        .await;
        assert_eq!(result, Err(Interrupted));
    }

    #[tokio::test]
    async fn test_delete_resolves_when_records_removed() {
        let fx = Fixture::new(100_000);
        fx.store
            .lock()
            .insert(&[sample(1, 1), sample(0, 2), sample(1, 3)])
            .unwrap();

        let link = OverflowStrategy::DeleteOldest {
            count: 1,
            priority_based: true,
        };
        assert_eq!(
            link.process(&fx.ctx(), "t").await.unwrap(),
            OverflowOutcome::Resolved
        );

        // The priority-0 sample went first.
        let left = fx.store.lock().peek_ordered(10, OrderingPolicy::OldestFirst);
        assert!(left.iter().all(|s| s.sample.priority == 1));
    }

    #[tokio::test]
    async fn test_delete_on_empty_store_is_unresolved() {
        let fx = Fixture::new(1_000);
        let link = OverflowStrategy::DeleteOldest {
            count: 5,
            priority_based: false,
        };
        assert_eq!(
            link.process(&fx.ctx(), "t").await.unwrap(),
            OverflowOutcome::Unresolved
        );
    }

    #[tokio::test]
    async fn test_notify_publishes_event() {
        let fx = Fixture::new(1_000);
        let mut rx = fx.events.subscribe();
        let outcome = OverflowStrategy::Notify
            .process(&fx.ctx(), "wait -> notify -> stop")
            .await
            .unwrap();

        assert_eq!(outcome, OverflowOutcome::Unresolved);
        assert_eq!(
            rx.recv().await,
            Some(PipelineEvent::DatabaseFull {
                strategy: "wait -> notify -> stop".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_stop_chain_halts_ingestion() {
        let fx = Fixture::new(1_000);
        let chain = OverflowChain::from_spec(&OverflowChainSpec::WaitNotifyStop { wait: SHORT });

        assert_eq!(
            chain.execute(&fx.ctx()).await.unwrap(),
            OverflowOutcome::Unresolved
        );
        assert!(fx.halted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_retry_after_resolved_overflow_succeeds() {
        let fx = Fixture::new(0);
        let one = fx.store.lock().encoded_size(&sample(0, 1)).unwrap();
        fx.store.lock().set_quota(one * 3 + one / 2);
        fx.store
            .lock()
            .insert(&[sample(0, 1), sample(0, 2), sample(0, 3)])
            .unwrap();

        let blocked = [sample(0, 4)];
        assert!(fx.store.lock().insert(&blocked).unwrap_err().is_full());

        let chain = OverflowChain::from_spec(&OverflowChainSpec::WaitDeleteNotify {
            wait: SHORT,
            delete_count: 1,
            priority_based: false,
        });
        assert_eq!(
            chain.execute(&fx.ctx()).await.unwrap(),
            OverflowOutcome::Resolved
        );
        fx.store.lock().insert(&blocked).unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_thousand_byte_quota() {
        let fx = Fixture::new(1_000);
        let chain = OverflowChain::from_spec(&OverflowChainSpec::WaitDeleteNotify {
            wait: SHORT,
            delete_count: 1,
            priority_based: false,
        });

        // Build batches of roughly 100 bytes per record, 1200 bytes in total.
        let mut inserted = Vec::new();
        let mut total = 0u64;
        let mut ts = 0;
        while total < 1_200 {
            ts += 1;
            let s = Sample::new("dev", 0, json!({"pad": "x".repeat(40)})).at(ts);
            total += fx.store.lock().encoded_size(&s).unwrap();
            inserted.push(s);
        }

        for chunk in inserted.chunks(3) {
            let outcome = insert_with_overflow(&chain, &fx.ctx(), chunk).await.unwrap();
            assert_eq!(outcome, InsertOutcome::Stored);
            assert!(fx.store.lock().size_bytes() <= 1_000);
        }

        // Exactly the oldest records were evicted: what is left is a suffix.
        let store = fx.store.lock();
        let left: Vec<i64> = store
            .peek_ordered(usize::MAX, OrderingPolicy::OldestFirst)
            .iter()
            .map(|s| s.sample.timestamp)
            .collect();
        assert!(!left.is_empty());
        let first = left[0];
        assert_eq!(left, (first..=ts).collect::<Vec<_>>());
        assert!(first > 1);
    }

    #[tokio::test]
    async fn test_insert_oversized_batch() {
        let fx = Fixture::new(50);
        let chain = OverflowChain::from_spec(&OverflowChainSpec::default());
        let outcome = insert_with_overflow(&chain, &fx.ctx(), &[sample(0, 1)])
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Oversized);
    }

    #[tokio::test]
    async fn test_insert_unresolved_with_stop_chain() {
        let fx = Fixture::new(0);
        let one = fx.store.lock().encoded_size(&sample(0, 1)).unwrap();
        fx.store.lock().set_quota(one + one / 2);
        fx.store.lock().insert(&[sample(0, 1)]).unwrap();

        let chain = OverflowChain::from_spec(&OverflowChainSpec::WaitNotifyStop { wait: SHORT });
        let outcome = insert_with_overflow(&chain, &fx.ctx(), &[sample(0, 2)])
            .await
            .unwrap();

        assert_eq!(outcome, InsertOutcome::Unresolved);
        assert!(fx.halted.load(Ordering::SeqCst));
        // Stored data is untouched by the conservative chain.
        assert_eq!(fx.store.lock().record_count(), 1);
    }
}
