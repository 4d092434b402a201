//! Typed views over identity and business records
//!
//! Records travel through the [`RecordStore`](crate::store::RecordStore) as
//! JSON objects. Writes between the two sides only ever go through
//! [`BusinessPatch`] and [`IdentityPatch`], which are built by the
//! allow-listed projections below and cannot carry any other field.

use crate::error::{SyncError, SyncResult};
use crate::store::Record;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    Admin,
}

/// Authoritative authentication-facing record of a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    /// Tour/route code
    pub key: String,
    pub display_name: String,
    pub role: Role,
    #[serde(deserialize_with = "flag")]
    pub active: bool,
    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Operational mirror of an identity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessRecord {
    /// Row identity assigned by the store; absent until inserted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub key: String,
    pub display_name: String,
    #[serde(deserialize_with = "flag")]
    pub active: bool,
    pub role: Role,
    /// Owned by the business side; reconciliation never writes it
    #[serde(default)]
    pub daily_target: i64,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flag")]
    pub soft_deleted: bool,
}

impl BusinessRecord {
    /// New mirror record seeded from a forward delta
    pub fn from_patch(key: &str, patch: BusinessPatch) -> Self {
        Self {
            id: None,
            key: key.to_string(),
            display_name: patch.display_name,
            active: patch.active,
            role: patch.role,
            daily_target: 0,
            last_synced_at: Some(patch.last_synced_at),
            soft_deleted: false,
        }
    }
}

/// Identity → business delta
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessPatch {
    pub display_name: String,
    pub active: bool,
    pub role: Role,
    pub last_synced_at: DateTime<Utc>,
}

/// Business → identity delta
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl IdentityPatch {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.role.is_none()
            && self.active.is_none()
            && self.device_id.is_none()
    }
}

/// Fields the forward delta carries, everything else on the business side
/// is left untouched.
pub fn project_forward(identity: &IdentityRecord, now: DateTime<Utc>) -> BusinessPatch {
    BusinessPatch {
        display_name: identity.display_name.clone(),
        active: identity.active,
        role: identity.role,
        last_synced_at: now,
    }
}

/// Pick the reverse-syncable fields out of an arbitrary business-side map.
///
/// Unknown fields are dropped. A known field holding a value of the wrong
/// type is rejected.
pub fn project_reverse(fields: &Record) -> SyncResult<IdentityPatch> {
    let mut patch = IdentityPatch::default();

    for (name, value) in fields {
        if value.is_null() {
            continue;
        }
        match name.as_str() {
            "displayName" => patch.display_name = Some(typed_field(name, value)?),
            "role" => patch.role = Some(typed_field(name, value)?),
            "deviceId" => patch.device_id = Some(typed_field(name, value)?),
            "active" => {
                patch.active = Some(parse_flag(value).ok_or_else(|| {
                    SyncError::InvalidOperation(format!(
                        "field `active` expects a boolean flag, got {value}"
                    ))
                })?);
            }
            _ => {}
        }
    }

    Ok(patch)
}

fn typed_field<T: DeserializeOwned>(name: &str, value: &Value) -> SyncResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| SyncError::InvalidOperation(format!("field `{name}`: {e}")))
}

/// Encode a typed record or patch as a store record
pub fn to_record<T: Serialize>(value: &T) -> SyncResult<Record> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Serialization(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Decode a store record into a typed record
pub fn from_record<T: DeserializeOwned>(record: Record) -> SyncResult<T> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Flags are stored either as booleans or as 0/1 integers
pub(crate) fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::Null => Some(false),
        _ => None,
    }
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parse_flag(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a boolean flag, got {value}")))
}
