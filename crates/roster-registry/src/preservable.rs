use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roster_core::{BufferState, Delta, InstanceInfo, Interest, Source, SourceMatcher};

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::eviction::{EvictionItem, EvictionQueue, EvictionStrategy, PercentageDropStrategy};
use crate::index::InterestStream;
use crate::registry::{CopyFate, Registry, SnapshotStream, SourcedRegistry};

struct PreservableInner {
    registry: Registry,
    queue: EvictionQueue,
    strategy: Box<dyn EvictionStrategy>,
    expected_size: AtomicUsize,
    self_preserving: AtomicBool,
    /// Signalled by successful writes so a parked eviction loop re-evaluates.
    resume: Notify,
    cancel: CancellationToken,
}

/// Registry wrapper that routes lapsed copies through an eviction queue and
/// stops evicting when too much of the registry would disappear at once.
#[derive(Clone)]
pub struct PreservableRegistry {
    inner: Arc<PreservableInner>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PreservableRegistry {
    /// Wraps `registry` with the percentage-drop strategy from `config` and
    /// starts the eviction loop on `runtime`.
    pub fn new(registry: Registry, config: &RegistryConfig, runtime: &Handle) -> Self {
        Self::with_strategy(
            registry,
            Box::new(PercentageDropStrategy::new(
                config.eviction_allowed_percentage_drop,
            )),
            config,
            runtime,
        )
    }

    pub fn with_strategy(
        registry: Registry,
        strategy: Box<dyn EvictionStrategy>,
        config: &RegistryConfig,
        runtime: &Handle,
    ) -> Self {
        let inner = Arc::new(PreservableInner {
            registry,
            queue: EvictionQueue::new(config.eviction_timeout),
            strategy,
            expected_size: AtomicUsize::new(0),
            self_preserving: AtomicBool::new(false),
            resume: Notify::new(),
            cancel: CancellationToken::new(),
        });
        let task = runtime.spawn(run_eviction(inner.clone()));
        Self {
            inner,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn expected_registry_size(&self) -> usize {
        self.inner.expected_size.load(Ordering::Acquire)
    }

    pub fn is_self_preserving(&self) -> bool {
        self.inner.self_preserving.load(Ordering::Acquire)
    }

    pub fn pending_evictions(&self) -> usize {
        self.inner.queue.len()
    }

    /// Queues copies for eviction; they are removed once eligible and the
    /// strategy allows it.
    pub fn enqueue(&self, copies: Vec<(String, Source)>) -> usize {
        let queued = self.inner.queue.push_batch(copies);
        if queued > 0 {
            debug!(queued, "queued evictions");
        }
        queued
    }

    fn note_write(&self) {
        let size = self.inner.registry.size();
        self.inner.expected_size.fetch_max(size, Ordering::AcqRel);
        self.inner.resume.notify_one();
    }
}

impl SourcedRegistry for PreservableRegistry {
    fn register(&self, info: InstanceInfo, source: &Source) -> Result<bool, RegistryError> {
        let stored = self.inner.registry.register(info, source)?;
        if stored {
            self.note_write();
        }
        Ok(stored)
    }

    fn update(&self, id: &str, deltas: &[Delta], source: &Source) -> Result<bool, RegistryError> {
        self.inner.registry.update(id, deltas, source)
    }

    fn unregister(&self, id: &str, source: &Source) -> Result<bool, RegistryError> {
        let removed = self.inner.registry.unregister(id, source)?;
        if removed {
            self.inner.resume.notify_one();
        }
        Ok(removed)
    }

    fn mark_batch(&self, source: &Source, state: BufferState) -> Result<(), RegistryError> {
        self.inner.registry.mark_batch(source, state)
    }

    fn for_interest_matching(
        &self,
        interest: Interest,
        matcher: SourceMatcher,
    ) -> Result<InterestStream, RegistryError> {
        self.inner.registry.for_interest_matching(interest, matcher)
    }

    fn for_snapshot(&self, interest: &Interest) -> Result<SnapshotStream, RegistryError> {
        self.inner.registry.for_snapshot(interest)
    }

    fn size(&self) -> usize {
        self.inner.registry.size()
    }

    fn is_shut_down(&self) -> bool {
        self.inner.registry.is_shut_down()
    }

    fn evict_source(&self, source: &Source) -> usize {
        let copies = self.inner.registry.copies_where(|s| s.same_generation(source));
        self.enqueue(copies)
    }

    fn evict_all_except(&self, retain: &SourceMatcher) -> usize {
        let copies = self.inner.registry.copies_where(|s| !retain.matches(s));
        self.enqueue(copies)
    }

    fn evict_stale_generations(&self, source: &Source) -> usize {
        let copies = self
            .inner
            .registry
            .copies_where(|s| s == source && s.generation != source.generation);
        self.enqueue(copies)
    }

    fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.queue.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.registry.shutdown();
    }
}

async fn run_eviction(inner: Arc<PreservableInner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            ready = inner.queue.ready() => {
                if !ready {
                    break;
                }
            }
        }

        if evict_ready(&inner) {
            continue;
        }

        // Self-preserving: hold the queue until a write or new item arrives.
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.resume.notified() => {}
            _ = inner.queue.changed() => {}
        }
    }
    debug!("eviction loop stopped");
}

/// Dispatches eligible items, asking the strategy before each one that would
/// delete an id. Returns `false` when the strategy refused.
///
/// Items whose copy is gone (replaced by a newer generation or already
/// removed) are dropped, and copies shadowed by another source are removed
/// without counting against the allowance.
fn evict_ready(inner: &PreservableInner) -> bool {
    loop {
        let now = Instant::now();
        let harmless = inner
            .queue
            .extract_ready(now, |item| inner.registry.copy_fate(&item.id, &item.source) != CopyFate::Last);
        for item in harmless {
            dispatch(inner, item);
        }

        let pending = inner.queue.ready_weight(now);
        let expected = inner.expected_size.load(Ordering::Acquire);
        let current = inner.registry.size();
        if pending == 0 {
            leave_self_preservation(inner, expected, current);
            return true;
        }
        if inner.strategy.allowed_to_evict(expected, current, pending) == 0 {
            if !inner.self_preserving.swap(true, Ordering::AcqRel) {
                info!(expected, current, pending, "entering self preservation mode");
            }
            return false;
        }
        leave_self_preservation(inner, expected, current);
        for item in inner.queue.take(1, now) {
            dispatch(inner, item);
        }
    }
}

fn leave_self_preservation(inner: &PreservableInner, expected: usize, current: usize) {
    if inner.self_preserving.swap(false, Ordering::AcqRel) {
        info!(expected, current, "leaving self preservation mode");
    }
}

fn dispatch(inner: &PreservableInner, item: EvictionItem) {
    match inner.registry.remove_copy(&item.id, &item.source) {
        Ok(removal) => {
            if removal.id_deleted {
                let _ = inner
                    .expected_size
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        Some(n.saturating_sub(1))
                    });
            }
            debug!(id = %item.id, source = %item.source, removed = removal.removed, "evicted");
        }
        Err(err) => warn!(id = %item.id, error = %err, "eviction failed"),
    }
}
