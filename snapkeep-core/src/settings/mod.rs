/*!
Settings provider contract and adapters.

The host application owns a typed key/value settings store. Snapshot code only
depends on the read/write contract defined here; the storage behind it is an
adapter concern.
*/

pub mod file;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

pub use file::JsonFileSettings;

/// Type tag of a stored setting
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    Bool,
    Int,
    Str,
}

impl fmt::Display for SettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingType::Bool => "bool",
            SettingType::Int => "int",
            SettingType::Str => "str",
        };
        f.write_str(name)
    }
}

/// A typed setting value
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl SettingValue {
    pub fn setting_type(&self) -> SettingType {
        match self {
            SettingValue::Bool(_) => SettingType::Bool,
            SettingValue::Int(_) => SettingType::Int,
            SettingValue::Str(_) => SettingType::Str,
        }
    }

    /// Parse raw text as a value of the given type
    pub fn parse(raw: &str, setting_type: SettingType) -> Option<Self> {
        let raw = raw.trim();
        match setting_type {
            SettingType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(SettingValue::Bool(true)),
                "false" | "0" | "no" | "off" => Some(SettingValue::Bool(false)),
                _ => None,
            },
            SettingType::Int => raw.parse().ok().map(SettingValue::Int),
            SettingType::Str => Some(SettingValue::Str(raw.to_string())),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(v) => write!(f, "{v}"),
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Str(v) => f.write_str(v),
        }
    }
}

/// Read/write contract of the host settings store
///
/// Implementations must be shareable between the scheduler thread and
/// request-handling threads.
pub trait SettingsProvider: Send + Sync {
    /// Fetch the raw value stored under `key`
    fn get(&self, key: &str) -> Option<SettingValue>;

    /// Store `value` under `key`, attributing the change to `actor`
    fn set(&self, key: &str, value: SettingValue, actor: Option<&str>) -> Result<()>;

    /// Boolean lookup; absent or differently-typed values yield `default`
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(SettingValue::Bool(v)) => v,
            _ => default,
        }
    }

    /// Integer lookup; absent or differently-typed values yield `default`
    fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(SettingValue::Int(v)) => v,
            _ => default,
        }
    }

    /// String lookup; `None` when absent or differently typed
    fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(SettingValue::Str(v)) => Some(v),
            _ => None,
        }
    }
}

/// In-process settings store
///
/// Useful for embedding and tests; values do not survive the process.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, SettingValue>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert used to seed fixtures
    pub fn with(self, key: &str, value: SettingValue) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
        self
    }
}

impl SettingsProvider for MemorySettings {
    fn get(&self, key: &str) -> Option<SettingValue> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: SettingValue, _actor: Option<&str>) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| crate::SnapshotError::settings("settings lock poisoned"))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookups_fall_back_on_type_mismatch() {
        let settings = MemorySettings::new()
            .with("flag", SettingValue::Str("yes".into()))
            .with("count", SettingValue::Int(4));

        assert!(settings.get_bool("flag", true));
        assert!(!settings.get_bool("flag", false));
        assert_eq!(settings.get_int("count", 1), 4);
        assert_eq!(settings.get_int("missing", 9), 9);
        assert_eq!(settings.get_str("count"), None);
    }

    #[test]
    fn test_set_overwrites() {
        let settings = MemorySettings::new();
        settings
            .set("max_snapshots", SettingValue::Int(3), Some("admin"))
            .unwrap();
        settings
            .set("max_snapshots", SettingValue::Int(5), Some("admin"))
            .unwrap();
        assert_eq!(settings.get_int("max_snapshots", 10), 5);
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(
            SettingValue::parse("Off", SettingType::Bool),
            Some(SettingValue::Bool(false))
        );
        assert_eq!(
            SettingValue::parse(" 30 ", SettingType::Int),
            Some(SettingValue::Int(30))
        );
        assert_eq!(SettingValue::parse("thirty", SettingType::Int), None);
        assert_eq!(
            SettingValue::parse("02:00", SettingType::Str),
            Some(SettingValue::Str("02:00".into()))
        );
    }

    #[test]
    fn test_value_serialization_is_tagged() {
        let json = serde_json::to_string(&SettingValue::Int(30)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":30}"#);
    }
}
