//! JSON envelopes exchanged over the message bus.
//!
//! Command, acknowledgment and device presence messages share these shapes.
//! Each envelope validates itself after deserialization; handlers should call
//! `validate()` (or use [`parse_envelope`]) before trusting a payload.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum serialized size of command params.
pub const MAX_PARAMS_BYTES: usize = 64 * 1024;
/// Maximum serialized size of ack details.
pub const MAX_DETAILS_BYTES: usize = 32 * 1024;
/// Maximum serialized size of module status fields.
pub const MAX_FIELDS_BYTES: usize = 16 * 1024;
pub const MAX_LABELS: usize = 20;
pub const MAX_LABEL_LEN: usize = 50;
const MAX_REQ_ID_LEN: usize = 255;
const MAX_NAME_LEN: usize = 100;

/// Acknowledgment response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    #[default]
    Ok,
    BadJson,
    BadRequest,
    DeviceError,
    ModuleError,
    Exception,
    Timeout,
    Dispatched,
    Scheduled,
    InUse,
    NotOwner,
    BadAction,
}

impl ResponseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::Ok => "OK",
            ResponseCode::BadJson => "BAD_JSON",
            ResponseCode::BadRequest => "BAD_REQUEST",
            ResponseCode::DeviceError => "DEVICE_ERROR",
            ResponseCode::ModuleError => "MODULE_ERROR",
            ResponseCode::Exception => "EXCEPTION",
            ResponseCode::Timeout => "TIMEOUT",
            ResponseCode::Dispatched => "DISPATCHED",
            ResponseCode::Scheduled => "SCHEDULED",
            ResponseCode::InUse => "IN_USE",
            ResponseCode::NotOwner => "NOT_OWNER",
            ResponseCode::BadAction => "BAD_ACTION",
        }
    }

    /// Map a service error onto the closest ack code.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::ResourceBusy(_) | Error::Denied(_) => ResponseCode::InUse,
            Error::Validation(_) | Error::NotFound(_) => ResponseCode::BadRequest,
            Error::Serialization(_) => ResponseCode::BadJson,
            Error::HandlerFault { .. } => ResponseCode::ModuleError,
            _ => ResponseCode::Exception,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command sent to a module on `<root>/<module>/cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub req_id: String,
    pub actor: String,
    /// RFC 3339 timestamp
    pub ts: String,
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl CommandEnvelope {
    /// Build a command stamped with the current time and a fresh `req_id`.
    pub fn new(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            req_id: uuid::Uuid::new_v4().to_string(),
            actor: actor.into(),
            ts: now_rfc3339(),
            action: action.into(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = req_id.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_len("req_id", &self.req_id, MAX_REQ_ID_LEN)?;
        check_len("actor", &self.actor, MAX_NAME_LEN)?;
        validate_actor(&self.actor)?;
        parse_timestamp(&self.ts)?;
        if self.action.trim().is_empty() {
            return Err(Error::validation("action cannot be empty"));
        }
        check_len("action", self.action.trim(), MAX_NAME_LEN)?;
        check_json_size("params", &self.params, MAX_PARAMS_BYTES)
    }

    /// Build the acknowledgment for this command.
    pub fn ack(&self, code: ResponseCode, error: Option<String>) -> CommandAck {
        CommandAck {
            req_id: self.req_id.clone(),
            success: matches!(
                code,
                ResponseCode::Ok | ResponseCode::Dispatched | ResponseCode::Scheduled
            ),
            action: self.action.trim().to_string(),
            actor: self.actor.clone(),
            code,
            error,
            details: serde_json::Map::new(),
            ts: now_rfc3339(),
        }
    }
}

/// Acknowledgment published on a module's status topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub req_id: String,
    pub success: bool,
    pub action: String,
    pub actor: String,
    #[serde(default)]
    pub code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
    pub ts: String,
}

impl CommandAck {
    pub fn validate(&self) -> Result<()> {
        check_len("req_id", &self.req_id, MAX_REQ_ID_LEN)?;
        parse_timestamp(&self.ts)?;
        if let Some(error) = &self.error {
            if error.chars().count() > 1000 {
                return Err(Error::validation("error too long (>1000 characters)"));
            }
        }
        check_json_size("details", &self.details, MAX_DETAILS_BYTES)
    }
}

/// Heartbeat on `<root>/device/<id>/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusEnvelope {
    pub device_id: String,
    pub online: bool,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
}

impl DeviceStatusEnvelope {
    pub fn validate(&self) -> Result<()> {
        validate_device_id(&self.device_id)?;
        parse_timestamp(&self.ts)?;
        if matches!(self.uptime_seconds, Some(up) if up < 0.0 || !up.is_finite()) {
            return Err(Error::validation("uptime_seconds must be a non-negative number"));
        }
        Ok(())
    }
}

/// Announcement on `<root>/device/<id>/meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetaEnvelope {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
    pub ts: String,
}

fn default_version() -> String {
    "unknown".to_string()
}

impl DeviceMetaEnvelope {
    pub fn validate(&self) -> Result<()> {
        validate_device_id(&self.device_id)?;
        parse_timestamp(&self.ts)?;
        for module in &self.modules {
            validate_module_name(module)?;
        }
        if self.labels.len() > MAX_LABELS {
            return Err(Error::validation(format!(
                "too many labels ({} > {MAX_LABELS})",
                self.labels.len()
            )));
        }
        if self.labels.iter().any(|l| l.chars().count() > MAX_LABEL_LEN) {
            return Err(Error::validation(format!(
                "label too long (>{MAX_LABEL_LEN} characters)"
            )));
        }
        check_len("version", &self.version, MAX_NAME_LEN)
    }
}

/// Module state report on `<root>/<module>/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatusEnvelope {
    pub state: String,
    #[serde(default = "default_true")]
    pub online: bool,
    pub ts: String,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl ModuleStatusEnvelope {
    pub fn validate(&self) -> Result<()> {
        check_len("state", &self.state, 50)?;
        parse_timestamp(&self.ts)?;
        check_json_size("fields", &self.fields, MAX_FIELDS_BYTES)
    }
}

/// Deserialize and validate an envelope in one step.
pub fn parse_envelope<T>(payload: &[u8], validate: impl Fn(&T) -> Result<()>) -> Result<T>
where
    T: DeserializeOwned,
{
    let envelope: T = serde_json::from_slice(payload)?;
    validate(&envelope)?;
    Ok(envelope)
}

/// Actors are `api`, `orchestrator`, `user`, `scheduler` or `host:<name>`.
pub fn validate_actor(actor: &str) -> Result<()> {
    match actor {
        "api" | "orchestrator" | "user" | "scheduler" => Ok(()),
        a if a.len() > "host:".len() && a.starts_with("host:") => Ok(()),
        a => Err(Error::validation(format!(
            "invalid actor '{a}': must be one of api, orchestrator, user, scheduler or host:*"
        ))),
    }
}

/// Device ids are non-empty and use `[A-Za-z0-9_-]`.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    check_len("device_id", device_id, MAX_REQ_ID_LEN)?;
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation(format!(
            "device id '{device_id}' may only contain alphanumerics, hyphens and underscores"
        )));
    }
    Ok(())
}

/// Module names are non-empty and use `[A-Za-z0-9_]`.
pub fn validate_module_name(name: &str) -> Result<()> {
    check_len("module name", name, MAX_NAME_LEN)?;
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::validation(format!("invalid module name: {name}")));
    }
    Ok(())
}

/// Parse an RFC 3339 timestamp (a trailing `Z` is accepted).
pub fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::validation(format!("invalid timestamp format: {ts}")))
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(format!("{field} cannot be empty")));
    }
    if value.chars().count() > max {
        return Err(Error::validation(format!("{field} too long (>{max} characters)")));
    }
    Ok(())
}

fn check_json_size<T: Serialize>(field: &str, value: &T, max: usize) -> Result<()> {
    let size = serde_json::to_vec(value)?.len();
    if size > max {
        return Err(Error::validation(format!(
            "{field} too large ({size} bytes > {max})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_envelope_valid() {
        let cmd = CommandEnvelope::new("api", "power_on").with_param("level", json!(3));
        assert!(cmd.validate().is_ok());

        let parsed: CommandEnvelope =
            parse_envelope(&serde_json::to_vec(&cmd).unwrap(), CommandEnvelope::validate).unwrap();
        assert_eq!(parsed.params["level"], json!(3));
    }

    #[test]
    fn test_command_envelope_rejects_bad_actor_and_ts() {
        let mut cmd = CommandEnvelope::new("robot", "start");
        assert!(cmd.validate().is_err());

        cmd.actor = "host:bench-3".to_string();
        assert!(cmd.validate().is_ok());

        cmd.ts = "yesterday".to_string();
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_command_envelope_rejects_blank_action() {
        let cmd = CommandEnvelope::new("user", "   ");
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_params_size_limit() {
        let big = "x".repeat(MAX_PARAMS_BYTES);
        let cmd = CommandEnvelope::new("api", "configure").with_param("blob", json!(big));
        assert!(matches!(cmd.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_ack_success_follows_code() {
        let cmd = CommandEnvelope::new("api", "start").with_req_id("r1");
        let ok = cmd.ack(ResponseCode::Ok, None);
        assert!(ok.success);
        assert_eq!(ok.req_id, "r1");

        let busy = cmd.ack(ResponseCode::InUse, Some("locked".to_string()));
        assert!(!busy.success);
        let json = serde_json::to_value(&busy).unwrap();
        assert_eq!(json["code"], "IN_USE");
    }

    #[test]
    fn test_device_meta_validation() {
        let mut meta = DeviceMetaEnvelope {
            device_id: "bench-1".to_string(),
            device_type: Some("projector".to_string()),
            modules: vec!["proj".to_string()],
            labels: vec!["room-a".to_string()],
            version: "1.2".to_string(),
            ts: "2024-01-01T00:00:00Z".to_string(),
        };
        assert!(meta.validate().is_ok());

        meta.device_id = "bench 1".to_string();
        assert!(meta.validate().is_err());

        meta.device_id = "bench-1".to_string();
        meta.labels = (0..=MAX_LABELS).map(|i| i.to_string()).collect();
        assert!(meta.validate().is_err());

        meta.labels = vec!["x".repeat(MAX_LABEL_LEN + 1)];
        assert!(meta.validate().is_err());

        meta.labels.clear();
        meta.modules = vec!["bad-name".to_string()];
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_device_status_defaults() {
        let status: DeviceStatusEnvelope = serde_json::from_value(json!({
            "device_id": "bench-1",
            "online": true,
            "ts": "2024-01-01T00:00:00+00:00"
        }))
        .unwrap();
        assert!(status.validate().is_ok());
        assert!(status.uptime_seconds.is_none());
    }

    #[test]
    fn test_response_code_from_error() {
        assert_eq!(
            ResponseCode::from_error(&Error::busy("device-1")),
            ResponseCode::InUse
        );
        assert_eq!(
            ResponseCode::from_error(&Error::internal("x")),
            ResponseCode::Exception
        );
    }
}
