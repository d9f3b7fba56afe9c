use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use roster_core::{BufferState, Delta, InstanceInfo, Interest, Source, SourceMatcher};

use crate::error::RegistryError;
use crate::holder::InstanceHolder;
use crate::index::{IndexKey, IndexRegistry, InterestStream};

/// Finite stream of the records matching an interest at call time.
pub type SnapshotStream = stream::Iter<std::vec::IntoIter<Arc<InstanceInfo>>>;

type HolderRef = Arc<Mutex<InstanceHolder>>;

/// Outcome of removing one source's copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyRemoval {
    /// A copy with a matching generation existed and was dropped.
    pub removed: bool,
    /// That copy was the last one, so the id left the registry.
    pub id_deleted: bool,
}

/// What removing one source's copy would do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFate {
    /// No copy from that source and generation is stored.
    Absent,
    /// Other sources still hold the id, so only the copy goes.
    Shadowed,
    /// It is the id's last copy; removing it shrinks the registry.
    Last,
}

/// Operations shared by the plain store and its self-preserving wrapper.
///
/// Every method returns quickly; subscriptions are delivered asynchronously
/// through the returned streams.
pub trait SourcedRegistry: Send + Sync {
    /// Stores `info` as `source`'s copy.
    fn register(&self, info: InstanceInfo, source: &Source) -> Result<bool, RegistryError>;
    /// Applies `deltas` to `source`'s copy of `id`. Unknown ids are a no-op.
    fn update(&self, id: &str, deltas: &[Delta], source: &Source) -> Result<bool, RegistryError>;
    /// Drops `source`'s copy of `id`. Unknown ids are a no-op.
    fn unregister(&self, id: &str, source: &Source) -> Result<bool, RegistryError>;
    /// Forwards a batch boundary reported by `source`.
    fn mark_batch(&self, source: &Source, state: BufferState) -> Result<(), RegistryError>;
    fn for_interest_matching(
        &self,
        interest: Interest,
        matcher: SourceMatcher,
    ) -> Result<InterestStream, RegistryError>;
    fn for_snapshot(&self, interest: &Interest) -> Result<SnapshotStream, RegistryError>;
    fn size(&self) -> usize;
    fn is_shut_down(&self) -> bool;
    /// Lapses every copy contributed by `source` (same generation).
    fn evict_source(&self, source: &Source) -> usize;
    /// Lapses every copy whose source does not match `retain`.
    fn evict_all_except(&self, retain: &SourceMatcher) -> usize;
    /// Lapses copies left by earlier generations of `source`.
    fn evict_stale_generations(&self, source: &Source) -> usize;
    fn shutdown(&self);

    fn for_interest(&self, interest: Interest) -> Result<InterestStream, RegistryError> {
        self.for_interest_matching(interest, SourceMatcher::Any)
    }
}

struct RegistryInner {
    holders: RwLock<HashMap<String, HolderRef>>,
    /// Writers hold this shared while mutating a holder and publishing the
    /// result; seeding a new index or taking a snapshot holds it exclusively.
    publish_gate: RwLock<()>,
    indexes: Arc<IndexRegistry>,
    shut_down: AtomicBool,
}

/// In-memory registry store: one holder per id plus the interest indexes.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                holders: RwLock::new(HashMap::new()),
                publish_gate: RwLock::new(()),
                indexes: Arc::new(IndexRegistry::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn register(&self, info: InstanceInfo, source: &Source) -> Result<bool, RegistryError> {
        self.ensure_open()?;
        if info.id.is_empty() {
            return Err(RegistryError::InvalidRecord("empty instance id"));
        }
        let info = Arc::new(info);
        let _gate = self.inner.publish_gate.read();
        loop {
            let holder = self.holder_or_insert(&info.id);
            let mut guard = holder.lock();
            if guard.is_retired() {
                continue;
            }
            if let Some(notification) = guard.update(source.clone(), info.clone()) {
                self.inner.indexes.publish(&notification);
            }
            debug!(id = %info.id, %source, "stored copy");
            return Ok(true);
        }
    }

    pub fn update(&self, id: &str, deltas: &[Delta], source: &Source) -> Result<bool, RegistryError> {
        self.ensure_open()?;
        let _gate = self.inner.publish_gate.read();
        let Some(holder) = self.holder(id) else {
            return Ok(false);
        };
        let mut guard = holder.lock();
        if guard.is_retired() {
            return Ok(false);
        }
        let Some(current) = guard.get_from(source).cloned() else {
            return Ok(false);
        };
        let mut next = (*current).clone();
        for delta in deltas {
            match next.apply_delta(delta) {
                Ok(applied) => next = applied,
                Err(err) => warn!(%id, %source, error = %err, "skipping delta"),
            }
        }
        if next == *current {
            return Ok(false);
        }
        if let Some(notification) = guard.update(source.clone(), Arc::new(next)) {
            self.inner.indexes.publish(&notification);
        }
        Ok(true)
    }

    pub fn unregister(&self, id: &str, source: &Source) -> Result<bool, RegistryError> {
        self.remove_copy(id, source).map(|r| r.removed)
    }

    /// Like [`Registry::unregister`] but also reports whether the id left the
    /// registry.
    pub fn remove_copy(&self, id: &str, source: &Source) -> Result<CopyRemoval, RegistryError> {
        self.ensure_open()?;
        let _gate = self.inner.publish_gate.read();
        let Some(holder) = self.holder(id) else {
            return Ok(CopyRemoval::default());
        };
        let mut guard = holder.lock();
        if guard.is_retired() {
            return Ok(CopyRemoval::default());
        }
        let removal = guard.remove(source);
        if let Some(notification) = &removal.notification {
            self.inner.indexes.publish(notification);
        }
        let id_deleted = removal.removed && guard.is_empty();
        if id_deleted {
            guard.retire();
            let mut holders = self.inner.holders.write();
            if holders.get(id).is_some_and(|h| Arc::ptr_eq(h, &holder)) {
                holders.remove(id);
            }
        }
        if removal.removed {
            debug!(%id, %source, id_deleted, "removed copy");
        }
        Ok(CopyRemoval {
            removed: removal.removed,
            id_deleted,
        })
    }

    pub fn mark_batch(&self, source: &Source, state: BufferState) -> Result<(), RegistryError> {
        self.ensure_open()?;
        let _gate = self.inner.publish_gate.read();
        self.inner.indexes.publish_marker(source, state);
        Ok(())
    }

    pub fn for_interest(&self, interest: Interest) -> Result<InterestStream, RegistryError> {
        self.for_interest_matching(interest, SourceMatcher::Any)
    }

    /// Live stream of `interest` as seen through copies whose source matches
    /// `matcher`.
    pub fn for_interest_matching(
        &self,
        interest: Interest,
        matcher: SourceMatcher,
    ) -> Result<InterestStream, RegistryError> {
        self.ensure_open()?;
        let key = IndexKey::new(interest, matcher);
        if let Some(stream) = self.inner.indexes.subscribe_existing(&key) {
            return Ok(stream);
        }
        let _gate = self.inner.publish_gate.write();
        let members = self.collect(&key);
        Ok(self.inner.indexes.install(key, members))
    }

    pub fn for_snapshot(&self, interest: &Interest) -> Result<SnapshotStream, RegistryError> {
        self.ensure_open()?;
        Ok(stream::iter(self.snapshot(interest)))
    }

    /// Current winners matching `interest`, ordered by id.
    pub fn snapshot(&self, interest: &Interest) -> Vec<Arc<InstanceInfo>> {
        let key = IndexKey::new(interest.clone(), SourceMatcher::Any);
        let _gate = self.inner.publish_gate.write();
        self.collect(&key).into_values().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<InstanceInfo>> {
        let holder = self.holder(id)?;
        let guard = holder.lock();
        guard.get().cloned()
    }

    pub fn copy_fate(&self, id: &str, source: &Source) -> CopyFate {
        let Some(holder) = self.holder(id) else {
            return CopyFate::Absent;
        };
        let guard = holder.lock();
        if guard.is_retired() || !guard.sources().any(|s| s.same_generation(source)) {
            CopyFate::Absent
        } else if guard.size() == 1 {
            CopyFate::Last
        } else {
            CopyFate::Shadowed
        }
    }

    /// Number of sources holding a copy of `id`.
    pub fn copies_of(&self, id: &str) -> usize {
        self.holder(id).map_or(0, |h| h.lock().size())
    }

    pub fn size(&self) -> usize {
        self.inner.holders.read().len()
    }

    /// `(id, source)` for every stored copy whose source satisfies `pred`.
    /// Sources carry the stored generation.
    pub fn copies_where(&self, pred: impl Fn(&Source) -> bool) -> Vec<(String, Source)> {
        let mut out = Vec::new();
        for holder in self.holders() {
            let guard = holder.lock();
            for source in guard.sources().filter(|s| pred(s)) {
                out.push((guard.id().to_string(), source.clone()));
            }
        }
        out
    }

    /// Number of live interest indexes.
    pub fn index_count(&self) -> usize {
        self.inner.indexes.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _gate = self.inner.publish_gate.write();
        self.inner.indexes.close();
        info!(size = self.size(), "registry shut down");
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        Ok(())
    }

    fn holder(&self, id: &str) -> Option<HolderRef> {
        self.inner.holders.read().get(id).cloned()
    }

    fn holder_or_insert(&self, id: &str) -> HolderRef {
        if let Some(holder) = self.holder(id) {
            return holder;
        }
        self.inner
            .holders
            .write()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(InstanceHolder::new(id))))
            .clone()
    }

    fn holders(&self) -> Vec<HolderRef> {
        self.inner.holders.read().values().cloned().collect()
    }

    fn collect(&self, key: &IndexKey) -> BTreeMap<String, Arc<InstanceInfo>> {
        let mut members = BTreeMap::new();
        for holder in self.holders() {
            let guard = holder.lock();
            if let (Some(info), Some(source)) = (guard.get(), guard.winner_source()) {
                if key.admits(info, Some(source)) {
                    members.insert(info.id.clone(), info.clone());
                }
            }
        }
        members
    }
}

impl SourcedRegistry for Registry {
    fn register(&self, info: InstanceInfo, source: &Source) -> Result<bool, RegistryError> {
        Registry::register(self, info, source)
    }

    fn update(&self, id: &str, deltas: &[Delta], source: &Source) -> Result<bool, RegistryError> {
        Registry::update(self, id, deltas, source)
    }

    fn unregister(&self, id: &str, source: &Source) -> Result<bool, RegistryError> {
        Registry::unregister(self, id, source)
    }

    fn mark_batch(&self, source: &Source, state: BufferState) -> Result<(), RegistryError> {
        Registry::mark_batch(self, source, state)
    }

    fn for_interest_matching(
        &self,
        interest: Interest,
        matcher: SourceMatcher,
    ) -> Result<InterestStream, RegistryError> {
        Registry::for_interest_matching(self, interest, matcher)
    }

    fn for_snapshot(&self, interest: &Interest) -> Result<SnapshotStream, RegistryError> {
        Registry::for_snapshot(self, interest)
    }

    fn size(&self) -> usize {
        Registry::size(self)
    }

    fn is_shut_down(&self) -> bool {
        Registry::is_shut_down(self)
    }

    fn evict_source(&self, source: &Source) -> usize {
        let copies = self.copies_where(|s| s.same_generation(source));
        copies
            .into_iter()
            .filter(|(id, s)| Registry::unregister(self, id, s).unwrap_or(false))
            .count()
    }

    fn evict_all_except(&self, retain: &SourceMatcher) -> usize {
        let copies = self.copies_where(|s| !retain.matches(s));
        copies
            .into_iter()
            .filter(|(id, s)| Registry::unregister(self, id, s).unwrap_or(false))
            .count()
    }

    fn evict_stale_generations(&self, source: &Source) -> usize {
        let copies = self.copies_where(|s| s == source && s.generation != source.generation);
        copies
            .into_iter()
            .filter(|(id, s)| Registry::unregister(self, id, s).unwrap_or(false))
            .count()
    }

    fn shutdown(&self) {
        Registry::shutdown(self)
    }
}
