use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Where a copy of a registry entry came from.
///
/// Declaration order is precedence order: `Local` beats `Replicated`, which
/// beats `Bridged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Origin {
    /// Registered directly with this process.
    Local,
    /// Copied from a peer registry node.
    Replicated,
    /// Imported from an external registry.
    Bridged,
}

impl Origin {
    /// Precedence rank; lower wins.
    pub fn rank(self) -> u8 {
        match self {
            Origin::Local => 0,
            Origin::Replicated => 1,
            Origin::Bridged => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Replicated => "replicated",
            Origin::Bridged => "bridged",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance tag for one contributor's copy of a registry entry.
///
/// Equality and hashing use `(origin, name)` only. `generation` tells apart
/// successive connections of the same contributor, so a late removal issued
/// on behalf of an old connection cannot delete data re-sent by a newer one.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Source {
    pub origin: Origin,
    pub name: String,
    #[serde(default)]
    pub generation: u64,
}

impl Source {
    pub fn new(origin: Origin, name: impl Into<String>) -> Self {
        Self {
            origin,
            name: name.into(),
            generation: 0,
        }
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self::new(Origin::Local, name)
    }

    pub fn replicated(peer: impl Into<String>) -> Self {
        Self::new(Origin::Replicated, peer)
    }

    pub fn bridged(name: impl Into<String>) -> Self {
        Self::new(Origin::Bridged, name)
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Same contributor and same connection generation.
    pub fn same_generation(&self, other: &Source) -> bool {
        self == other && self.generation == other.generation
    }

    /// Key under which batch markers from this source are tracked.
    ///
    /// All local writers share one key; remote contributors are keyed by
    /// `(origin, name)`.
    pub fn batch_key(&self) -> (Origin, String) {
        match self.origin {
            Origin::Local => (Origin::Local, String::new()),
            origin => (origin, self.name.clone()),
        }
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.name == other.name
    }
}

impl Hash for Source {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.origin.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.origin, self.name, self.generation)
    }
}
