use std::sync::Arc;

use crate::delta::Delta;
use crate::instance::InstanceInfo;
use crate::interest::Interest;
use crate::source::Source;

/// Batch delimiter state reported by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    Start,
    End,
}

/// Registry change or batch boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Add(Arc<InstanceInfo>),
    /// New winning value; `deltas` lists the field changes from the previous
    /// one and is empty when the winner changed identity without a diff.
    Modify {
        info: Arc<InstanceInfo>,
        deltas: Vec<Delta>,
    },
    Delete(Arc<InstanceInfo>),
    BufferStart(Interest),
    BufferEnd(Interest),
}

/// Change plus the source that caused it, when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub change: Change,
    pub source: Option<Source>,
}

impl ChangeNotification {
    pub fn add(info: Arc<InstanceInfo>) -> Self {
        Self::from(Change::Add(info))
    }

    pub fn modify(info: Arc<InstanceInfo>, deltas: Vec<Delta>) -> Self {
        Self::from(Change::Modify { info, deltas })
    }

    pub fn delete(info: Arc<InstanceInfo>) -> Self {
        Self::from(Change::Delete(info))
    }

    pub fn buffer_start(interest: Interest) -> Self {
        Self::from(Change::BufferStart(interest))
    }

    pub fn buffer_end(interest: Interest) -> Self {
        Self::from(Change::BufferEnd(interest))
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Record carried by a data notification.
    pub fn info(&self) -> Option<&Arc<InstanceInfo>> {
        match &self.change {
            Change::Add(info) | Change::Delete(info) | Change::Modify { info, .. } => Some(info),
            Change::BufferStart(_) | Change::BufferEnd(_) => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.info().map(|info| info.id.as_str())
    }

    pub fn is_marker(&self) -> bool {
        matches!(self.change, Change::BufferStart(_) | Change::BufferEnd(_))
    }
}

impl From<Change> for ChangeNotification {
    fn from(change: Change) -> Self {
        Self {
            change,
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Change, ChangeNotification};
    use crate::instance::InstanceInfo;
    use crate::interest::Interest;
    use crate::source::Source;

    #[test]
    fn data_notifications_expose_id() {
        let info = Arc::new(InstanceInfo::new("i-1", "app"));
        let n = ChangeNotification::modify(info.clone(), Vec::new()).with_source(Source::local("n"));
        assert_eq!(n.id(), Some("i-1"));
        assert_eq!(n.source, Some(Source::local("n")));
        assert!(!n.is_marker());
        assert!(matches!(ChangeNotification::delete(info).change, Change::Delete(_)));
    }

    #[test]
    fn markers_have_no_record() {
        let n = ChangeNotification::buffer_start(Interest::FullRegistry);
        assert!(n.is_marker());
        assert!(n.info().is_none());
    }
}
