use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use tracing::warn;

use roster_core::delta::FieldName;
use roster_core::{Delta, DeltaError, DeltaField, Status};

use crate::error::CodecError;

/// Named-field form of a delta as carried on the wire.
///
/// Keeping the field as text lets a receiver drop a delta for a field it does
/// not know without failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDelta {
    pub id: String,
    pub version: u64,
    pub field: String,
    pub value: Value,
}

impl WireDelta {
    pub fn from_delta(delta: &Delta) -> Result<Self, CodecError> {
        let value = match &delta.field {
            DeltaField::App(v) => serialized(v)?,
            DeltaField::AppGroup(v)
            | DeltaField::VipAddress(v)
            | DeltaField::SecureVipAddress(v)
            | DeltaField::Hostname(v) => serialized(v)?,
            DeltaField::Status(v) => Value::Text(v.as_str().to_string()),
            DeltaField::Ports(v) => serialized(v)?,
            DeltaField::Metadata(v) => serialized(v)?,
        };
        Ok(Self {
            id: delta.id.clone(),
            version: delta.version,
            field: delta.field.name().as_str().to_string(),
            value,
        })
    }

    pub fn into_delta(self) -> Result<Delta, DeltaError> {
        let name: FieldName = self.field.parse()?;
        let field = match name {
            FieldName::App => DeltaField::App(deserialized(name, &self.value)?),
            FieldName::AppGroup => DeltaField::AppGroup(deserialized(name, &self.value)?),
            FieldName::VipAddress => DeltaField::VipAddress(deserialized(name, &self.value)?),
            FieldName::SecureVipAddress => {
                DeltaField::SecureVipAddress(deserialized(name, &self.value)?)
            }
            FieldName::Hostname => DeltaField::Hostname(deserialized(name, &self.value)?),
            FieldName::Status => match self.value.as_text() {
                Some(text) => DeltaField::Status(Status::from_name(text)),
                None => {
                    return Err(DeltaError::InvalidValue {
                        field: name.to_string(),
                        reason: "expected text".into(),
                    })
                }
            },
            FieldName::Ports => DeltaField::Ports(deserialized(name, &self.value)?),
            FieldName::Metadata => DeltaField::Metadata(deserialized(name, &self.value)?),
        };
        Ok(Delta {
            id: self.id,
            version: self.version,
            field,
        })
    }

    /// Converts to a delta, logging and dropping it when the field is unknown
    /// or malformed.
    pub fn into_delta_or_warn(self) -> Option<Delta> {
        let id = self.id.clone();
        match self.into_delta() {
            Ok(delta) => Some(delta),
            Err(err) => {
                warn!(%id, error = %err, "dropping undecodable delta");
                None
            }
        }
    }
}

fn serialized<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    Value::serialized(value).map_err(|e| CodecError::Encode(e.to_string()))
}

fn deserialized<T: for<'de> Deserialize<'de>>(name: FieldName, value: &Value) -> Result<T, DeltaError> {
    value.deserialized().map_err(|e| DeltaError::InvalidValue {
        field: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ciborium::value::Value;
    use roster_core::{Delta, DeltaError, DeltaField, ServicePort, Status};

    use super::WireDelta;

    #[test]
    fn known_fields_convert_back() {
        let deltas = vec![
            Delta::new("i-1", 2, DeltaField::App("billing".into())),
            Delta::new("i-1", 2, DeltaField::VipAddress(None)),
            Delta::new("i-1", 3, DeltaField::Status(Status::OutOfService)),
            Delta::new(
                "i-1",
                4,
                DeltaField::Ports([ServicePort::named("http", 80, false)].into_iter().collect()),
            ),
            Delta::new(
                "i-1",
                5,
                DeltaField::Metadata(BTreeMap::from([("zone".to_string(), "a".to_string())])),
            ),
        ];
        for delta in deltas {
            let wire = WireDelta::from_delta(&delta).expect("delta should encode");
            assert_eq!(wire.into_delta().expect("delta should decode"), delta);
        }
    }

    #[test]
    fn unknown_field_is_rejected() {
        let wire = WireDelta {
            id: "i-1".into(),
            version: 1,
            field: "color".into(),
            value: Value::Text("blue".into()),
        };
        assert_eq!(
            wire.clone().into_delta(),
            Err(DeltaError::UnknownField("color".into()))
        );
        assert!(wire.into_delta_or_warn().is_none());
    }

    #[test]
    fn mistyped_value_is_rejected() {
        let wire = WireDelta {
            id: "i-1".into(),
            version: 1,
            field: "app".into(),
            value: Value::Integer(3.into()),
        };
        assert!(matches!(
            wire.into_delta(),
            Err(DeltaError::InvalidValue { .. })
        ));
    }

    #[test]
    fn status_text_is_parsed_leniently() {
        let wire = WireDelta {
            id: "i-1".into(),
            version: 1,
            field: "status".into(),
            value: Value::Text("hibernating".into()),
        };
        let delta = wire.into_delta().expect("status should decode");
        assert_eq!(delta.field, DeltaField::Status(Status::Unknown));
    }
}
