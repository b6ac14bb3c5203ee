//! Topic filters and the lab topic layout.
//!
//! Filters follow MQTT semantics: `/` separates levels, `+` matches exactly
//! one level and a trailing `#` matches any number of remaining levels,
//! including none (`lab/#` matches `lab`). Filters are parsed once into
//! segments so matching an inbound topic never re-parses the pattern.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `+`
    Single,
    /// `#`, only ever the last segment
    Multi,
}

/// A validated, pre-split topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicFilter {
    /// Parse and validate a filter.
    pub fn parse(filter: &str) -> Result<Self> {
        if filter.is_empty() {
            return Err(Error::validation("topic filter must not be empty"));
        }

        let parts: Vec<&str> = filter.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "+" => Segment::Single,
                "#" if i == last => Segment::Multi,
                "#" => {
                    return Err(Error::validation(format!(
                        "'#' must be the last level in filter '{filter}'"
                    )))
                }
                p if p.contains('+') || p.contains('#') => {
                    return Err(Error::validation(format!(
                        "wildcards must occupy a whole level in filter '{filter}'"
                    )))
                }
                p => Segment::Literal(p.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: filter.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the filter contains `+` or `#`.
    pub fn has_wildcards(&self) -> bool {
        self.segments.iter().any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Check whether a concrete topic matches this filter.
    pub fn matches(&self, topic: &str) -> bool {
        // Wildcards in the first level never match `$` system topics.
        if topic.starts_with('$') && !matches!(self.segments.first(), Some(Segment::Literal(_))) {
            return false;
        }

        let mut levels = topic.split('/');
        for segment in &self.segments {
            match segment {
                Segment::Multi => return true,
                Segment::Single => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(expected) => match levels.next() {
                    Some(level) if level == expected => {}
                    _ => return false,
                },
            }
        }
        levels.next().is_none()
    }

    /// Values captured by `+` levels, in order.
    pub fn captures<'t>(&self, topic: &'t str) -> Option<Vec<&'t str>> {
        if !self.matches(topic) {
            return None;
        }
        Some(
            self.segments
                .iter()
                .zip(topic.split('/'))
                .filter(|(segment, _)| matches!(segment, Segment::Single))
                .map(|(_, level)| level)
                .collect(),
        )
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for TopicFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Validate a concrete (publishable) topic.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::validation("topic must not be empty"));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(Error::validation(format!(
            "topic '{topic}' must not contain wildcards"
        )));
    }
    Ok(())
}

/// Topic layout rooted at a deployment-specific prefix.
///
/// ```text
/// <root>/<module>/cmd                 commands for a module
/// <root>/<module>/status              module status
/// <root>/device/<device_id>/status    device heartbeat
/// <root>/device/<device_id>/meta      device announcement
/// <root>/dlq/...                      dead letters
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    root: String,
}

impl TopicScheme {
    pub fn new(root: impl Into<String>) -> Result<Self> {
        let root = root.into().trim_matches('/').to_string();
        if root.is_empty() {
            return Err(Error::config("topic root must not be empty"));
        }
        validate_topic(&root).map_err(|e| Error::config(e.to_string()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn command_topic(&self, module: &str) -> String {
        format!("{}/{}/cmd", self.root, module)
    }

    pub fn status_topic(&self, module: &str) -> String {
        format!("{}/{}/status", self.root, module)
    }

    pub fn device_status_topic(&self, device_id: &str) -> String {
        format!("{}/device/{}/status", self.root, device_id)
    }

    pub fn device_meta_topic(&self, device_id: &str) -> String {
        format!("{}/device/{}/meta", self.root, device_id)
    }

    pub fn device_status_filter(&self) -> String {
        format!("{}/device/+/status", self.root)
    }

    pub fn device_meta_filter(&self) -> String {
        format!("{}/device/+/meta", self.root)
    }

    /// Dead letter topic for a failure tied to a device and optionally a module.
    pub fn dlq_topic(&self, device_id: Option<&str>, module: Option<&str>) -> String {
        match (device_id, module) {
            (Some(device), Some(module)) => format!("{}/dlq/{}/{}", self.root, device, module),
            (Some(device), None) => format!("{}/dlq/{}/device", self.root, device),
            _ => format!("{}/dlq/orchestrator", self.root),
        }
    }

    /// Extract the module name from `<root>/<module>/cmd`.
    pub fn parse_command_topic<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let rest = topic.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let module = rest.strip_suffix("/cmd")?;
        if module.is_empty() || module.contains('/') || module == "device" || module == "dlq" {
            None
        } else {
            Some(module)
        }
    }

    /// Extract the device id from `<root>/device/<id>/...`.
    pub fn parse_device_topic<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let rest = topic
            .strip_prefix(self.root.as_str())?
            .strip_prefix("/device/")?;
        rest.split('/').next().filter(|id| !id.is_empty())
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            root: crate::config::DEFAULT_TOPIC_ROOT.to_string(),
        }
    }
}
