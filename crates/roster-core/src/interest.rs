use std::fmt;

use serde::{Deserialize, Serialize};

use crate::instance::InstanceInfo;
use crate::source::{Origin, Source};

/// Subscription predicate over registration records.
///
/// Build unions through [`Interest::composite`] so structurally-equal unions
/// compare (and hash) equal regardless of construction order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interest {
    /// Matches nothing.
    Empty,
    /// Matches every record.
    FullRegistry,
    /// Application names compare case-insensitively; the canonical form is
    /// lowercase.
    Application(String),
    Vip(String),
    SecureVip(String),
    Instance(String),
    /// Union of atomic interests.
    Composite(Vec<Interest>),
}

impl Interest {
    pub fn application(name: impl Into<String>) -> Self {
        Interest::Application(name.into().to_ascii_lowercase())
    }

    pub fn vip(vip: impl Into<String>) -> Self {
        Interest::Vip(vip.into())
    }

    pub fn secure_vip(vip: impl Into<String>) -> Self {
        Interest::SecureVip(vip.into())
    }

    pub fn instance(id: impl Into<String>) -> Self {
        Interest::Instance(id.into())
    }

    /// Union of `parts`, flattened, deduplicated and sorted.
    ///
    /// Collapses to `Empty` when nothing remains, to the single member when
    /// only one remains, and to `FullRegistry` when any member is.
    pub fn composite(parts: impl IntoIterator<Item = Interest>) -> Self {
        let mut atoms = Vec::new();
        for part in parts {
            part.flatten_into(&mut atoms);
        }
        if atoms.contains(&Interest::FullRegistry) {
            return Interest::FullRegistry;
        }
        atoms.sort();
        atoms.dedup();
        match atoms.len() {
            0 => Interest::Empty,
            1 => atoms.remove(0),
            _ => Interest::Composite(atoms),
        }
    }

    /// Canonical form of this interest; equal predicates normalize equal.
    pub fn normalized(&self) -> Interest {
        match self {
            Interest::Composite(parts) => Interest::composite(parts.iter().cloned()),
            Interest::Application(app) => Interest::application(app.as_str()),
            other => other.clone(),
        }
    }

    fn flatten_into(self, out: &mut Vec<Interest>) {
        match self {
            Interest::Composite(parts) => {
                for part in parts {
                    part.flatten_into(out);
                }
            }
            Interest::Empty => {}
            Interest::Application(app) => out.push(Interest::application(app)),
            atom => out.push(atom),
        }
    }

    pub fn matches(&self, info: &InstanceInfo) -> bool {
        match self {
            Interest::Empty => false,
            Interest::FullRegistry => true,
            Interest::Application(app) => info.app.eq_ignore_ascii_case(app),
            Interest::Vip(vip) => info.vip_address.as_deref() == Some(vip.as_str()),
            Interest::SecureVip(vip) => info.secure_vip_address.as_deref() == Some(vip.as_str()),
            Interest::Instance(id) => &info.id == id,
            Interest::Composite(parts) => parts.iter().any(|part| part.matches(info)),
        }
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::Empty => f.write_str("empty"),
            Interest::FullRegistry => f.write_str("full"),
            Interest::Application(app) => write!(f, "app={app}"),
            Interest::Vip(vip) => write!(f, "vip={vip}"),
            Interest::SecureVip(vip) => write!(f, "svip={vip}"),
            Interest::Instance(id) => write!(f, "id={id}"),
            Interest::Composite(parts) => {
                f.write_str("[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Predicate over the source that contributed a copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceMatcher {
    Any,
    Origin(Origin),
    /// Same contributor, any generation.
    Exact(Source),
    Not(Box<SourceMatcher>),
}

impl SourceMatcher {
    pub fn not(inner: SourceMatcher) -> Self {
        SourceMatcher::Not(Box::new(inner))
    }

    pub fn matches(&self, source: &Source) -> bool {
        match self {
            SourceMatcher::Any => true,
            SourceMatcher::Origin(origin) => source.origin == *origin,
            SourceMatcher::Exact(expected) => expected == source,
            SourceMatcher::Not(inner) => !inner.matches(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Interest, SourceMatcher};
    use crate::instance::InstanceInfo;
    use crate::source::{Origin, Source};

    fn info() -> InstanceInfo {
        InstanceInfo::new("i-1", "Billing")
            .with_vip("billing.vip")
            .with_secure_vip("billing.svip")
    }

    #[test]
    fn atomic_interests_match_their_field() {
        let info = info();
        assert!(Interest::FullRegistry.matches(&info));
        assert!(Interest::application("billing").matches(&info));
        assert!(Interest::vip("billing.vip").matches(&info));
        assert!(Interest::secure_vip("billing.svip").matches(&info));
        assert!(Interest::instance("i-1").matches(&info));
        assert!(!Interest::instance("i-2").matches(&info));
        assert!(!Interest::vip("other").matches(&info));
        assert!(!Interest::Empty.matches(&info));
    }

    #[test]
    fn composite_is_order_and_duplicate_insensitive() {
        let a = Interest::composite([
            Interest::application("x"),
            Interest::vip("v"),
            Interest::application("x"),
        ]);
        let b = Interest::composite([
            Interest::vip("v"),
            Interest::composite([Interest::application("x")]),
        ]);
        assert_eq!(a, b);
        assert_eq!(
            Interest::Composite(vec![Interest::vip("v"), Interest::application("x")]).normalized(),
            a
        );
    }

    #[test]
    fn application_case_does_not_split_predicates() {
        assert_eq!(Interest::application("Billing"), Interest::application("billing"));
        assert_eq!(
            Interest::Application("BILLING".into()).normalized(),
            Interest::application("billing")
        );
        assert_eq!(
            Interest::composite([
                Interest::Application("Billing".into()),
                Interest::Application("billing".into()),
            ]),
            Interest::application("billing")
        );
        assert!(Interest::application("BILLING").matches(&info()));
    }

    #[test]
    fn composite_collapses_degenerate_unions() {
        assert_eq!(Interest::composite([]), Interest::Empty);
        assert_eq!(
            Interest::composite([Interest::Empty, Interest::vip("v")]),
            Interest::vip("v")
        );
        assert_eq!(
            Interest::composite([Interest::vip("v"), Interest::FullRegistry]),
            Interest::FullRegistry
        );
    }

    #[test]
    fn composite_matches_any_member() {
        let interest = Interest::composite([Interest::application("nope"), Interest::instance("i-1")]);
        assert!(interest.matches(&info()));
    }

    #[test]
    fn source_matchers() {
        let local = Source::local("n1");
        let peer = Source::replicated("p1").with_generation(3);
        assert!(SourceMatcher::Any.matches(&peer));
        assert!(SourceMatcher::Origin(Origin::Local).matches(&local));
        assert!(!SourceMatcher::Origin(Origin::Local).matches(&peer));
        assert!(SourceMatcher::Exact(Source::replicated("p1")).matches(&peer));
        assert!(SourceMatcher::not(SourceMatcher::Exact(local.clone())).matches(&peer));
        assert!(!SourceMatcher::not(SourceMatcher::Exact(local.clone())).matches(&local));
    }
}
