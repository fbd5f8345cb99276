//! Small helpers shared across the cloud and controller clients.

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;

/// An identifier the cloud may emit as either a JSON string or a bare
/// number. Round-trips to a canonical textual form either way, so it can be
/// interpolated directly into a URL path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct PermissiveId(pub String);

impl fmt::Display for PermissiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PermissiveId {
    fn from(s: &str) -> Self {
        PermissiveId(s.to_string())
    }
}

impl From<String> for PermissiveId {
    fn from(s: String) -> Self {
        PermissiveId(s)
    }
}

struct PermissiveIdVisitor;

impl<'de> Visitor<'de> for PermissiveIdVisitor {
    type Value = PermissiveId;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a JSON string or number identifier")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(PermissiveId(value.to_string()))
    }

    fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(PermissiveId(value))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(PermissiveId(value.to_string()))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(PermissiveId(value.to_string()))
    }

    fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        // Cloud identifiers are always integral; format without a trailing
        // fractional part when the value happens to arrive as a float.
        if value.fract() == 0.0 {
            Ok(PermissiveId((value as i64).to_string()))
        } else {
            Ok(PermissiveId(value.to_string()))
        }
    }
}

impl<'de> Deserialize<'de> for PermissiveId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PermissiveIdVisitor)
    }
}

/// Redacts a value that must never appear in logs. Used at call sites that
/// might otherwise be tempted to `{:?}`-format a whole struct containing a
/// secret field.
pub fn redacted() -> &'static str {
    "<redacted>"
}
