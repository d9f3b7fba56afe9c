use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use roster_core::Source;

/// A lapsed copy awaiting removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionItem {
    pub id: String,
    pub source: Source,
    pub weight: u32,
    pub queued_at: Instant,
}

impl EvictionItem {
    fn key(&self) -> QueueKey {
        (self.id.clone(), self.source.clone(), self.source.generation)
    }
}

/// `Source` equality ignores the generation, so it is keyed explicitly.
type QueueKey = (String, Source, u64);

struct QueueState {
    items: VecDeque<EvictionItem>,
    queued: HashSet<QueueKey>,
    closed: bool,
}

impl QueueState {
    fn pop_front(&mut self) -> Option<EvictionItem> {
        let item = self.items.pop_front()?;
        self.queued.remove(&item.key());
        Some(item)
    }
}

/// Multi-producer, single-consumer pull queue of lapsed copies.
///
/// Producers never block. Items become eligible `delay` after they were
/// queued; the consumer asks for at most `n` eligible items at a time. A copy
/// (id, source and generation) is queued at most once.
pub struct EvictionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    delay: Duration,
}

impl EvictionQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                queued: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
            delay,
        }
    }

    pub fn push(&self, id: impl Into<String>, source: Source) {
        self.push_batch([(id.into(), source)]);
    }

    /// Queues several items atomically so the consumer sees them together.
    pub fn push_batch(&self, items: impl IntoIterator<Item = (String, Source)>) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.closed {
            return 0;
        }
        let mut added = 0;
        for (id, source) in items {
            let item = EvictionItem {
                id,
                source,
                weight: 1,
                queued_at: now,
            };
            if state.queued.insert(item.key()) {
                state.items.push_back(item);
                added += 1;
            }
        }
        drop(state);
        if added > 0 {
            self.notify.notify_one();
        }
        added
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight of items eligible at `now`.
    pub fn ready_weight(&self, now: Instant) -> usize {
        let state = self.state.lock();
        state
            .items
            .iter()
            .take_while(|item| item.queued_at + self.delay <= now)
            .map(|item| item.weight as usize)
            .sum()
    }

    /// Pops up to `n` items eligible at `now`, oldest first.
    pub fn take(&self, n: usize, now: Instant) -> Vec<EvictionItem> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        while out.len() < n {
            match state.items.front() {
                Some(item) if item.queued_at + self.delay <= now => {
                    if let Some(item) = state.pop_front() {
                        out.push(item);
                    }
                }
                _ => break,
            }
        }
        out
    }

    /// Removes every item eligible at `now` that satisfies `pred`, keeping
    /// the order of the rest.
    pub fn extract_ready(
        &self,
        now: Instant,
        mut pred: impl FnMut(&EvictionItem) -> bool,
    ) -> Vec<EvictionItem> {
        let mut state = self.state.lock();
        let eligible = state
            .items
            .iter()
            .take_while(|item| item.queued_at + self.delay <= now)
            .count();
        let mut out = Vec::new();
        let mut kept = VecDeque::with_capacity(state.items.len());
        for (pos, item) in std::mem::take(&mut state.items).into_iter().enumerate() {
            if pos < eligible && pred(&item) {
                out.push(item);
            } else {
                kept.push_back(item);
            }
        }
        for item in &out {
            state.queued.remove(&item.key());
        }
        state.items = kept;
        out
    }

    /// Waits until the oldest item is eligible. Returns `false` once the
    /// queue is closed.
    pub async fn ready(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            let deadline = {
                let state = self.state.lock();
                if state.closed {
                    return false;
                }
                state.items.front().map(|item| item.queued_at + self.delay)
            };
            match deadline {
                Some(at) if at <= Instant::now() => return true,
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Resolves on the next push or close, whether or not anything is
    /// eligible yet.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Decides how many pending evictions may run now.
pub trait EvictionStrategy: Send + Sync {
    /// `expected_size` is the size the registry is believed to have,
    /// `current_size` its actual size, and `pending` the weight of eligible
    /// evictions.
    fn allowed_to_evict(&self, expected_size: usize, current_size: usize, pending: usize) -> usize;
}

/// Refuses any batch that would shrink the registry below
/// `expected_size * (100 - allowed_drop) / 100`; otherwise allows it whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PercentageDropStrategy {
    allowed_drop: u8,
}

impl PercentageDropStrategy {
    pub fn new(allowed_drop: u8) -> Self {
        Self {
            allowed_drop: allowed_drop.min(100),
        }
    }

    pub fn allowed_drop(&self) -> u8 {
        self.allowed_drop
    }

    fn floor(&self, expected_size: usize) -> usize {
        expected_size * (100 - self.allowed_drop as usize) / 100
    }
}

impl Default for PercentageDropStrategy {
    fn default() -> Self {
        Self::new(20)
    }
}

impl EvictionStrategy for PercentageDropStrategy {
    fn allowed_to_evict(&self, expected_size: usize, current_size: usize, pending: usize) -> usize {
        let floor = self.floor(expected_size);
        match current_size.checked_sub(pending) {
            Some(after) if after >= floor => pending,
            None if floor == 0 => pending,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use roster_core::Source;
    use tokio::time::Instant;

    use super::{EvictionQueue, EvictionStrategy, PercentageDropStrategy};

    #[test]
    fn twenty_five_of_a_hundred_is_refused() {
        let strategy = PercentageDropStrategy::new(20);
        assert_eq!(strategy.allowed_to_evict(100, 100, 25), 0);
    }

    #[test]
    fn fifteen_of_a_hundred_is_allowed_whole() {
        let strategy = PercentageDropStrategy::new(20);
        assert_eq!(strategy.allowed_to_evict(100, 100, 15), 15);
    }

    #[test]
    fn drop_exactly_to_the_floor_is_allowed() {
        let strategy = PercentageDropStrategy::default();
        assert_eq!(strategy.allowed_to_evict(100, 100, 20), 20);
        assert_eq!(strategy.allowed_to_evict(100, 100, 21), 0);
    }

    #[test]
    fn empty_expectation_allows_everything() {
        let strategy = PercentageDropStrategy::default();
        assert_eq!(strategy.allowed_to_evict(0, 3, 3), 3);
        assert_eq!(strategy.allowed_to_evict(0, 0, 2), 2);
    }

    #[test]
    fn shrunken_registry_is_protected() {
        let strategy = PercentageDropStrategy::default();
        // Already at the floor; nothing more may go.
        assert_eq!(strategy.allowed_to_evict(100, 80, 1), 0);
        assert_eq!(PercentageDropStrategy::new(250).allowed_drop(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn items_become_eligible_after_delay() {
        let queue = EvictionQueue::new(Duration::from_secs(30));
        queue.push("a", Source::replicated("p1"));
        assert_eq!(queue.ready_weight(Instant::now()), 0);
        assert!(queue.take(10, Instant::now()).is_empty());

        assert!(queue.ready().await);
        let now = Instant::now();
        assert_eq!(queue.ready_weight(now), 1);
        let items = queue.take(10, now);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "a");
        assert_eq!(items[0].weight, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn take_respects_requested_count_and_order() {
        let queue = EvictionQueue::new(Duration::ZERO);
        let added = queue.push_batch(
            ["a", "b", "c"]
                .into_iter()
                .map(|id| (id.to_string(), Source::replicated("p1"))),
        );
        assert_eq!(added, 3);
        let first = queue.take(2, Instant::now());
        assert_eq!(
            first.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn close_releases_waiting_consumer() {
        let queue = std::sync::Arc::new(EvictionQueue::new(Duration::ZERO));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.ready().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(!waiter.await.expect("waiter task"));
        assert_eq!(queue.push_batch([("a".to_string(), Source::local("n"))]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_copy_is_queued_once() {
        let queue = EvictionQueue::new(Duration::ZERO);
        let old = Source::replicated("p1").with_generation(1);
        let new = Source::replicated("p1").with_generation(2);

        assert_eq!(queue.push_batch([("a".to_string(), old.clone())]), 1);
        assert_eq!(
            queue.push_batch([("a".to_string(), old.clone()), ("b".to_string(), old.clone())]),
            1
        );
        // Another generation of the same peer is a different copy.
        assert_eq!(queue.push_batch([("a".to_string(), new)]), 1);
        assert_eq!(queue.len(), 3);

        // Once taken, the copy may be queued again.
        let taken = queue.take(1, Instant::now());
        assert_eq!(taken[0].id, "a");
        assert_eq!(queue.push_batch([("a".to_string(), old)]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn extract_ready_leaves_waiting_and_rejected_items() {
        let queue = EvictionQueue::new(Duration::from_secs(10));
        let peer = Source::replicated("p1");
        queue.push_batch(
            ["a", "b", "c"]
                .into_iter()
                .map(|id| (id.to_string(), peer.clone())),
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        queue.push("d", peer.clone());

        let extracted = queue.extract_ready(Instant::now(), |item| item.id != "b");
        assert_eq!(
            extracted.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.ready_weight(Instant::now()), 1);
        assert_eq!(queue.take(10, Instant::now())[0].id, "b");
    }
}
