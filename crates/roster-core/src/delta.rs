use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DeltaError;
use crate::instance::{ServicePort, Status};

/// New value for one named field of a registration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaField {
    App(String),
    AppGroup(Option<String>),
    VipAddress(Option<String>),
    SecureVipAddress(Option<String>),
    Hostname(Option<String>),
    Status(Status),
    Ports(BTreeSet<ServicePort>),
    Metadata(BTreeMap<String, String>),
}

impl DeltaField {
    pub fn name(&self) -> FieldName {
        match self {
            DeltaField::App(_) => FieldName::App,
            DeltaField::AppGroup(_) => FieldName::AppGroup,
            DeltaField::VipAddress(_) => FieldName::VipAddress,
            DeltaField::SecureVipAddress(_) => FieldName::SecureVipAddress,
            DeltaField::Hostname(_) => FieldName::Hostname,
            DeltaField::Status(_) => FieldName::Status,
            DeltaField::Ports(_) => FieldName::Ports,
            DeltaField::Metadata(_) => FieldName::Metadata,
        }
    }
}

/// Field names accepted in the named (wire) form of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldName {
    App,
    AppGroup,
    VipAddress,
    SecureVipAddress,
    Hostname,
    Status,
    Ports,
    Metadata,
}

impl FieldName {
    pub const ALL: [FieldName; 8] = [
        FieldName::App,
        FieldName::AppGroup,
        FieldName::VipAddress,
        FieldName::SecureVipAddress,
        FieldName::Hostname,
        FieldName::Status,
        FieldName::Ports,
        FieldName::Metadata,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::App => "app",
            FieldName::AppGroup => "appGroup",
            FieldName::VipAddress => "vipAddress",
            FieldName::SecureVipAddress => "secureVipAddress",
            FieldName::Hostname => "hostname",
            FieldName::Status => "status",
            FieldName::Ports => "ports",
            FieldName::Metadata => "metadata",
        }
    }
}

impl FromStr for FieldName {
    type Err = DeltaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| DeltaError::UnknownField(s.to_string()))
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-field change to the record identified by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub id: String,
    pub version: u64,
    pub field: DeltaField,
}

impl Delta {
    pub fn new(id: impl Into<String>, version: u64, field: DeltaField) -> Self {
        Self {
            id: id.into(),
            version,
            field,
        }
    }
}
