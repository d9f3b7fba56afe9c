use std::sync::Arc;

use roster_core::{ChangeNotification, InstanceInfo, Source};

#[derive(Debug)]
struct Entry {
    source: Source,
    info: Arc<InstanceInfo>,
    arrival: u64,
}

impl Entry {
    fn rank(&self) -> (u8, u64) {
        (self.source.origin.rank(), self.arrival)
    }
}

/// Result of [`InstanceHolder::remove`].
#[derive(Debug, Default)]
pub struct Removal {
    /// The source had a copy with a matching generation and it was dropped.
    pub removed: bool,
    /// Notification for subscribers, when the visible value changed.
    pub notification: Option<ChangeNotification>,
}

/// Reconciles every source's copy of one registry id into a single winner.
///
/// The winner is the copy from the highest-precedence origin; within an
/// origin the copy that arrived first keeps priority. Replacing an existing
/// source's copy keeps its original arrival slot.
#[derive(Debug)]
pub struct InstanceHolder {
    id: String,
    // Sorted by (origin rank, arrival); index 0 is the winner.
    entries: Vec<Entry>,
    next_arrival: u64,
    retired: bool,
}

impl InstanceHolder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Vec::new(),
            next_arrival: 0,
            retired: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current winner.
    pub fn get(&self) -> Option<&Arc<InstanceInfo>> {
        self.entries.first().map(|e| &e.info)
    }

    /// Source of the current winner, carrying the stored generation.
    pub fn winner_source(&self) -> Option<&Source> {
        self.entries.first().map(|e| &e.source)
    }

    /// Copy held for `source`, if any.
    pub fn get_from(&self, source: &Source) -> Option<&Arc<InstanceInfo>> {
        self.entries
            .iter()
            .find(|e| &e.source == source)
            .map(|e| &e.info)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sources with a live copy, generations included.
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.entries.iter().map(|e| &e.source)
    }

    /// Inserts or replaces the copy for `source`.
    ///
    /// Returns `Add` when the holder was empty, `Modify` when the winning value
    /// or the winning source changed, and nothing otherwise.
    pub fn update(&mut self, source: Source, info: Arc<InstanceInfo>) -> Option<ChangeNotification> {
        let previous = self
            .entries
            .first()
            .map(|e| (e.source.clone(), e.info.clone()));

        match self.entries.iter_mut().find(|e| e.source == source) {
            Some(entry) => {
                entry.source = source;
                entry.info = info;
            }
            None => {
                let arrival = self.next_arrival;
                self.next_arrival += 1;
                self.entries.push(Entry {
                    source,
                    info,
                    arrival,
                });
                self.entries.sort_by_key(Entry::rank);
            }
        }

        let winner = self.entries.first()?;
        match previous {
            None => Some(ChangeNotification::add(winner.info.clone()).with_source(winner.source.clone())),
            Some((prev_source, prev_info)) => {
                if prev_source == winner.source && *prev_info == *winner.info {
                    return None;
                }
                let deltas = winner.info.diff_older(&prev_info);
                Some(
                    ChangeNotification::modify(winner.info.clone(), deltas)
                        .with_source(winner.source.clone()),
                )
            }
        }
    }

    /// Drops the copy held for `source` when its generation matches.
    ///
    /// Removing a non-winning copy changes nothing visible. Removing the
    /// winner promotes the next copy (`Modify`) or, when none is left,
    /// reports `Delete`.
    pub fn remove(&mut self, source: &Source) -> Removal {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.source.same_generation(source))
        else {
            return Removal::default();
        };
        let removed = self.entries.remove(pos);
        if pos != 0 {
            return Removal {
                removed: true,
                notification: None,
            };
        }
        let notification = match self.entries.first() {
            None => ChangeNotification::delete(removed.info).with_source(removed.source),
            Some(next) => {
                let deltas = next.info.diff_older(&removed.info);
                ChangeNotification::modify(next.info.clone(), deltas).with_source(next.source.clone())
            }
        };
        Removal {
            removed: true,
            notification: Some(notification),
        }
    }

    /// Marks an empty holder as detached from the registry map; writers that
    /// still hold a reference must look the id up again.
    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }
}
