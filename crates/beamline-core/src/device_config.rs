//! Schema-validated device configuration.
//!
//! Devices declare the keys they accept and the value type of each key.
//! `configure` calls are validated against that declaration before they reach
//! the driver, so unknown keys never slip through.

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A configuration change: key to new value.
pub type ConfigUpdate = HashMap<String, Value>;

/// Value type of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    /// Any JSON number
    Float,
    /// JSON integer
    Integer,
    /// JSON boolean
    Bool,
    /// JSON string
    Text,
}

impl ConfigKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ConfigKind::Float => value.is_number(),
            ConfigKind::Integer => value.is_i64() || value.is_u64(),
            ConfigKind::Bool => value.is_boolean(),
            ConfigKind::Text => value.is_string(),
        }
    }
}

/// Keys a device accepts in `configure`, with their value types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    fields: BTreeMap<String, ConfigKind>,
}

impl ConfigSchema {
    /// Schema accepting no keys at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a key.
    pub fn field(mut self, key: impl Into<String>, kind: ConfigKind) -> Self {
        self.fields.insert(key.into(), kind);
        self
    }

    /// Declared type of `key`.
    pub fn kind_of(&self, key: &str) -> Option<ConfigKind> {
        self.fields.get(key).copied()
    }

    /// Declared keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Check an update for `device` against the schema.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first unknown key or type mismatch.
    pub fn validate(&self, device: &str, update: &ConfigUpdate) -> ScanResult<()> {
        let mut keys: Vec<&String> = update.keys().collect();
        keys.sort();
        for key in keys {
            let Some(kind) = self.fields.get(key.as_str()) else {
                return Err(ScanError::InvalidConfig {
                    target: device.to_string(),
                    message: format!("unknown configuration key '{key}'"),
                });
            };
            let value = &update[key.as_str()];
            if !kind.accepts(value) {
                return Err(ScanError::InvalidConfig {
                    target: device.to_string(),
                    message: format!("key '{key}' expects {kind:?}, got {value}"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ConfigSchema {
        ConfigSchema::new()
            .field("velocity", ConfigKind::Float)
            .field("frames", ConfigKind::Integer)
    }

    #[test]
    fn accepts_declared_keys() {
        let update: ConfigUpdate = [
            ("velocity".to_string(), json!(2.5)),
            ("frames".to_string(), json!(10)),
        ]
        .into_iter()
        .collect();
        assert!(schema().validate("samx", &update).is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        let update: ConfigUpdate = [("acceleration".to_string(), json!(1.0))]
            .into_iter()
            .collect();
        let err = schema().validate("samx", &update).unwrap_err();
        assert!(err.to_string().contains("acceleration"));
    }

    #[test]
    fn rejects_type_mismatch() {
        let update: ConfigUpdate = [("frames".to_string(), json!(1.5))].into_iter().collect();
        assert!(matches!(
            schema().validate("det", &update),
            Err(ScanError::InvalidConfig { .. })
        ));
    }
}
