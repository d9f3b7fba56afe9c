use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use roster_core::{
    BufferState, Change, ChangeNotification, InstanceInfo, Interest, Origin, Source,
    SourceMatcher,
};

/// Live notifications a subscriber may have queued before its stream is cut
/// off. The initial state is queued on top of this.
pub const SUBSCRIBER_BACKLOG: usize = 1024;

/// Identity of one shared index: equal interests viewed through equal source
/// matchers share a single index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub interest: Interest,
    pub matcher: SourceMatcher,
}

impl IndexKey {
    pub fn new(interest: Interest, matcher: SourceMatcher) -> Self {
        Self {
            interest: interest.normalized(),
            matcher,
        }
    }

    pub(crate) fn admits(&self, info: &InstanceInfo, source: Option<&Source>) -> bool {
        let source_ok = match source {
            Some(source) => self.matcher.matches(source),
            None => self.matcher == SourceMatcher::Any,
        };
        source_ok && self.interest.matches(info)
    }
}

struct IndexState {
    /// Ids currently visible through this index with their last value.
    members: BTreeMap<String, Arc<InstanceInfo>>,
    /// Sources with an open batch, keyed by [`Source::batch_key`].
    open_batches: HashSet<(Origin, String)>,
    subscribers: HashMap<u64, mpsc::Sender<ChangeNotification>>,
}

/// One interest's view of the registry, fanned out to every subscriber.
pub(crate) struct Index {
    key: IndexKey,
    state: Mutex<IndexState>,
}

impl Index {
    fn new(key: IndexKey, members: BTreeMap<String, Arc<InstanceInfo>>) -> Self {
        Self {
            key,
            state: Mutex::new(IndexState {
                members,
                open_batches: HashSet::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Registers a subscriber and queues its initial state: `BufferStart`,
    /// one `Add` per member, `BufferEnd`, then a live `BufferStart` when some
    /// source is mid-batch.
    fn subscribe(&self, id: u64) -> mpsc::Receiver<ChangeNotification> {
        let mut state = self.state.lock();
        let (tx, rx) = mpsc::channel(state.members.len() + 3 + SUBSCRIBER_BACKLOG);
        let interest = &self.key.interest;
        let _ = tx.try_send(ChangeNotification::buffer_start(interest.clone()));
        for info in state.members.values() {
            let _ = tx.try_send(ChangeNotification::add(info.clone()));
        }
        let _ = tx.try_send(ChangeNotification::buffer_end(interest.clone()));
        if !state.open_batches.is_empty() {
            let _ = tx.try_send(ChangeNotification::buffer_start(interest.clone()));
        }
        state.subscribers.insert(id, tx);
        rx
    }

    /// Maps a registry change onto this index's view and fans it out.
    fn publish(&self, notification: &ChangeNotification) {
        let Some(info) = notification.info() else {
            return;
        };
        let mut state = self.state.lock();
        let visible = match notification.change {
            Change::Delete(_) => false,
            _ => self.key.admits(info, notification.source.as_ref()),
        };
        let known = state.members.get(&info.id).cloned();

        let change = match (known, visible) {
            (None, false) => return,
            (None, true) => Change::Add(info.clone()),
            (Some(previous), true) => {
                if *previous == **info {
                    return;
                }
                match &notification.change {
                    Change::Modify { deltas, .. } => Change::Modify {
                        info: info.clone(),
                        deltas: deltas.clone(),
                    },
                    _ => Change::Modify {
                        info: info.clone(),
                        deltas: info.diff_older(&previous),
                    },
                }
            }
            (Some(previous), false) => Change::Delete(previous),
        };

        match &change {
            Change::Delete(_) => {
                state.members.remove(&info.id);
            }
            _ => {
                state.members.insert(info.id.clone(), info.clone());
            }
        }

        let out = ChangeNotification {
            change,
            source: notification.source.clone(),
        };
        self.fan_out(&mut state.subscribers, &out);
    }

    /// Tracks a source's batch boundary; subscribers see `BufferStart` when
    /// the first batch opens and `BufferEnd` when the last one closes.
    fn publish_marker(&self, source: &Source, buffer: BufferState) {
        let mut state = self.state.lock();
        let key = source.batch_key();
        let change = match buffer {
            BufferState::Start => {
                let was_idle = state.open_batches.is_empty();
                if !state.open_batches.insert(key) || !was_idle {
                    return;
                }
                Change::BufferStart(self.key.interest.clone())
            }
            BufferState::End => {
                if !state.open_batches.remove(&key) || !state.open_batches.is_empty() {
                    return;
                }
                Change::BufferEnd(self.key.interest.clone())
            }
        };
        let out = ChangeNotification {
            change,
            source: Some(source.clone()),
        };
        self.fan_out(&mut state.subscribers, &out);
    }

    /// Queues `out` for every subscriber. One whose backlog is full is
    /// dropped, which ends its stream once it drains what was queued.
    fn fan_out(
        &self,
        subscribers: &mut HashMap<u64, mpsc::Sender<ChangeNotification>>,
        out: &ChangeNotification,
    ) {
        subscribers.retain(|id, tx| match tx.try_send(out.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(interest = %self.key.interest, subscriber = id, "subscriber fell behind, closing its stream");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        state.subscribers.remove(&id);
        state.subscribers.is_empty()
    }

    fn close(&self) {
        self.state.lock().subscribers.clear();
    }
}

/// Deduplicating map from [`IndexKey`] to the shared index.
pub(crate) struct IndexRegistry {
    indexes: Mutex<HashMap<IndexKey, Arc<Index>>>,
    next_subscriber: AtomicU64,
}

impl IndexRegistry {
    pub(crate) fn new() -> Self {
        Self {
            indexes: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Subscribes to an existing index, or returns `None` when `key` has none.
    pub(crate) fn subscribe_existing(self: &Arc<Self>, key: &IndexKey) -> Option<InterestStream> {
        let indexes = self.indexes.lock();
        let index = indexes.get(key)?.clone();
        Some(self.attach(index))
    }

    /// Installs a freshly seeded index, or subscribes to the one another
    /// caller installed first.
    ///
    /// Callers must exclude concurrent publishers while computing `members`
    /// and calling this.
    pub(crate) fn install(
        self: &Arc<Self>,
        key: IndexKey,
        members: BTreeMap<String, Arc<InstanceInfo>>,
    ) -> InterestStream {
        let mut indexes = self.indexes.lock();
        let index = indexes
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(interest = %key.interest, "creating interest index");
                Arc::new(Index::new(key, members))
            })
            .clone();
        drop(indexes);
        self.attach(index)
    }

    fn attach(self: &Arc<Self>, index: Arc<Index>) -> InterestStream {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let rx = index.subscribe(id);
        InterestStream {
            rx,
            id,
            index,
            registry: Arc::downgrade(self),
        }
    }

    pub(crate) fn publish(&self, notification: &ChangeNotification) {
        for index in self.snapshot() {
            index.publish(notification);
        }
    }

    pub(crate) fn publish_marker(&self, source: &Source, state: BufferState) {
        for index in self.snapshot() {
            index.publish_marker(source, state);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.indexes.lock().len()
    }

    /// Completes every open subscription and drops all indexes.
    pub(crate) fn close(&self) {
        let drained: Vec<Arc<Index>> = self.indexes.lock().drain().map(|(_, i)| i).collect();
        for index in drained {
            index.close();
        }
    }

    fn snapshot(&self) -> Vec<Arc<Index>> {
        self.indexes.lock().values().cloned().collect()
    }

    fn release(&self, index: &Arc<Index>, subscriber: u64) {
        let mut indexes = self.indexes.lock();
        if index.unsubscribe(subscriber) {
            if let Some(current) = indexes.get(&index.key) {
                if Arc::ptr_eq(current, index) {
                    debug!(interest = %index.key.interest, "dropping idle interest index");
                    indexes.remove(&index.key);
                }
            }
        }
    }
}

/// Live change stream for one interest.
///
/// Starts with the interest's current state framed by `BufferStart` and
/// `BufferEnd`, then relays changes until the registry shuts down or the
/// stream is dropped.
pub struct InterestStream {
    rx: mpsc::Receiver<ChangeNotification>,
    id: u64,
    index: Arc<Index>,
    registry: Weak<IndexRegistry>,
}

impl InterestStream {
    pub fn interest(&self) -> &Interest {
        &self.index.key.interest
    }

    /// Next notification, or `None` once the registry has shut down.
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        self.rx.recv().await
    }

    /// Next notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChangeNotification> {
        self.rx.try_recv().ok()
    }
}

impl Stream for InterestStream {
    type Item = ChangeNotification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for InterestStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.index, self.id);
        }
    }
}

impl std::fmt::Debug for InterestStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterestStream")
            .field("interest", &self.index.key.interest)
            .field("subscriber", &self.id)
            .finish()
    }
}
