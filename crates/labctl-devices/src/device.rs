//! Device record and its update delta.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Observed device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    #[default]
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Unknown => "unknown",
        }
    }

    /// Status after a message arrives that carries no explicit status.
    ///
    /// Hearing from a device brings it back online unless it reported an
    /// error, which sticks until the device clears it.
    pub fn on_message(self) -> Self {
        match self {
            DeviceStatus::Error => DeviceStatus::Error,
            _ => DeviceStatus::Online,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plugin-defined metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ScalarValue {
    /// Convert a JSON value; arrays and objects are not scalars.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(ScalarValue::Null),
            serde_json::Value::Bool(b) => Some(ScalarValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(ScalarValue::Int)
                .or_else(|| n.as_f64().map(ScalarValue::Float)),
            serde_json::Value::String(s) => Some(ScalarValue::String(s.clone())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::String(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::String(v)
    }
}

/// A known device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub device_type: String,
    pub status: DeviceStatus,
    pub first_seen: DateTime<Utc>,
    /// Never moves backwards.
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, ScalarValue>,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    /// Seconds since the device was last heard from.
    pub fn silence_at(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen).num_seconds()
    }
}

/// Partial update merged into a device by `upsert`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusDelta {
    pub device_type: Option<String>,
    pub status: Option<DeviceStatus>,
    pub metadata: BTreeMap<String, ScalarValue>,
    /// When the message was observed; defaults to now.
    pub observed_at: Option<DateTime<Utc>>,
}

impl StatusDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_on_message() {
        assert_eq!(DeviceStatus::Offline.on_message(), DeviceStatus::Online);
        assert_eq!(DeviceStatus::Unknown.on_message(), DeviceStatus::Online);
        assert_eq!(DeviceStatus::Error.on_message(), DeviceStatus::Error);
    }

    #[test]
    fn test_scalar_from_json() {
        assert_eq!(ScalarValue::from_json(&json!(3)), Some(ScalarValue::Int(3)));
        assert_eq!(ScalarValue::from_json(&json!(1.5)), Some(ScalarValue::Float(1.5)));
        assert_eq!(ScalarValue::from_json(&json!("x")), Some("x".into()));
        assert_eq!(ScalarValue::from_json(&json!([1])), None);
    }

    #[test]
    fn test_scalar_serde_untagged() {
        let meta: BTreeMap<String, ScalarValue> =
            serde_json::from_value(json!({"fw": "1.2", "lamp_hours": 120, "ok": true, "x": null}))
                .unwrap();
        assert_eq!(meta["fw"], ScalarValue::String("1.2".to_string()));
        assert_eq!(meta["lamp_hours"], ScalarValue::Int(120));
        assert_eq!(meta["ok"], ScalarValue::Bool(true));
        assert_eq!(meta["x"], ScalarValue::Null);
    }
}
