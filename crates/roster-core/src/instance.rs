use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::delta::{Delta, DeltaField};
use crate::error::DeltaError;

/// Lifecycle status advertised by a registered instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Up,
    Down,
    Starting,
    OutOfService,
    #[default]
    Unknown,
}

impl Status {
    /// Case-insensitive parse; anything unrecognized maps to `Unknown`.
    pub fn from_name(name: &str) -> Status {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "UP" => Status::Up,
            "DOWN" => Status::Down,
            "STARTING" => Status::Starting,
            "OUTOFSERVICE" => Status::OutOfService,
            _ => Status::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
            Status::Starting => "STARTING",
            Status::OutOfService => "OUT_OF_SERVICE",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named network endpoint exposed by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    pub secure: bool,
}

impl ServicePort {
    pub fn new(port: u16) -> Self {
        Self {
            name: None,
            port,
            secure: false,
        }
    }

    pub fn named(name: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            name: Some(name.into()),
            port,
            secure,
        }
    }
}

/// Immutable, versioned registration record.
///
/// Records are replaced wholesale or advanced one field at a time through
/// [`InstanceInfo::apply_delta`]; they are never mutated in place once
/// published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub app: String,
    pub app_group: Option<String>,
    pub vip_address: Option<String>,
    pub secure_vip_address: Option<String>,
    pub hostname: Option<String>,
    pub status: Status,
    pub ports: BTreeSet<ServicePort>,
    pub metadata: BTreeMap<String, String>,
    pub version: u64,
}

impl InstanceInfo {
    pub fn new(id: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            app: app.into(),
            app_group: None,
            vip_address: None,
            secure_vip_address: None,
            hostname: None,
            status: Status::Unknown,
            ports: BTreeSet::new(),
            metadata: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_vip(mut self, vip: impl Into<String>) -> Self {
        self.vip_address = Some(vip.into());
        self
    }

    pub fn with_secure_vip(mut self, vip: impl Into<String>) -> Self {
        self.secure_vip_address = Some(vip.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_port(mut self, port: ServicePort) -> Self {
        self.ports.insert(port);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Materializes the record produced by applying `delta` to `self`.
    pub fn apply_delta(&self, delta: &Delta) -> Result<InstanceInfo, DeltaError> {
        if delta.id != self.id {
            return Err(DeltaError::IdMismatch {
                expected: self.id.clone(),
                actual: delta.id.clone(),
            });
        }
        let mut next = self.clone();
        match &delta.field {
            DeltaField::App(v) => next.app = v.clone(),
            DeltaField::AppGroup(v) => next.app_group = v.clone(),
            DeltaField::VipAddress(v) => next.vip_address = v.clone(),
            DeltaField::SecureVipAddress(v) => next.secure_vip_address = v.clone(),
            DeltaField::Hostname(v) => next.hostname = v.clone(),
            DeltaField::Status(v) => next.status = *v,
            DeltaField::Ports(v) => next.ports = v.clone(),
            DeltaField::Metadata(v) => next.metadata = v.clone(),
        }
        next.version = delta.version;
        Ok(next)
    }

    /// Deltas that turn `older` into `self`, stamped with `self.version`.
    ///
    /// Returns an empty list when the records differ only in version or are
    /// for different ids.
    pub fn diff_older(&self, older: &InstanceInfo) -> Vec<Delta> {
        if self.id != older.id {
            return Vec::new();
        }
        let mut fields = Vec::new();
        if self.app != older.app {
            fields.push(DeltaField::App(self.app.clone()));
        }
        if self.app_group != older.app_group {
            fields.push(DeltaField::AppGroup(self.app_group.clone()));
        }
        if self.vip_address != older.vip_address {
            fields.push(DeltaField::VipAddress(self.vip_address.clone()));
        }
        if self.secure_vip_address != older.secure_vip_address {
            fields.push(DeltaField::SecureVipAddress(self.secure_vip_address.clone()));
        }
        if self.hostname != older.hostname {
            fields.push(DeltaField::Hostname(self.hostname.clone()));
        }
        if self.status != older.status {
            fields.push(DeltaField::Status(self.status));
        }
        if self.ports != older.ports {
            fields.push(DeltaField::Ports(self.ports.clone()));
        }
        if self.metadata != older.metadata {
            fields.push(DeltaField::Metadata(self.metadata.clone()));
        }
        fields
            .into_iter()
            .map(|field| Delta {
                id: self.id.clone(),
                version: self.version,
                field,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{InstanceInfo, ServicePort, Status};
    use crate::delta::{Delta, DeltaField};
    use crate::error::DeltaError;

    fn sample() -> InstanceInfo {
        InstanceInfo::new("i-1", "billing")
            .with_vip("billing.vip")
            .with_status(Status::Starting)
            .with_port(ServicePort::new(8080))
            .with_version(1)
    }

    #[test]
    fn status_parse_is_case_insensitive_with_unknown_fallback() {
        assert_eq!(Status::from_name("up"), Status::Up);
        assert_eq!(Status::from_name("Down"), Status::Down);
        assert_eq!(Status::from_name("out_of_service"), Status::OutOfService);
        assert_eq!(Status::from_name("OUT_OF_SERVICE"), Status::OutOfService);
        assert_eq!(Status::from_name("sleeping"), Status::Unknown);
        assert_eq!(Status::from_name(""), Status::Unknown);
    }

    #[test]
    fn apply_delta_replaces_one_field_and_bumps_version() {
        let info = sample();
        let delta = Delta {
            id: "i-1".into(),
            version: 2,
            field: DeltaField::Status(Status::Up),
        };
        let next = info.apply_delta(&delta).expect("delta should apply");
        assert_eq!(next.status, Status::Up);
        assert_eq!(next.version, 2);
        assert_eq!(next.vip_address, info.vip_address);
        assert_eq!(info.status, Status::Starting);
    }

    #[test]
    fn apply_delta_rejects_foreign_id() {
        let delta = Delta {
            id: "i-2".into(),
            version: 2,
            field: DeltaField::App("other".into()),
        };
        let err = sample().apply_delta(&delta).expect_err("id mismatch");
        assert!(matches!(err, DeltaError::IdMismatch { .. }));
    }

    #[test]
    fn diff_then_apply_reconstructs_newer_record() {
        let older = sample();
        let newer = older
            .clone()
            .with_status(Status::Up)
            .with_metadata("zone", "a")
            .with_hostname("h1")
            .with_version(5);

        let deltas = newer.diff_older(&older);
        assert_eq!(deltas.len(), 3);
        assert!(deltas.iter().all(|d| d.version == 5));

        let mut rebuilt = older;
        for delta in &deltas {
            rebuilt = rebuilt.apply_delta(delta).expect("delta should apply");
        }
        assert_eq!(rebuilt, newer);
    }

    #[test]
    fn diff_of_identical_records_is_empty() {
        let info = sample();
        assert!(info.diff_older(&info.clone().with_version(9)).is_empty());
    }
}
