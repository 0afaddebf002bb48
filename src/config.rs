//! Dotted-key JSON configuration, mirroring the original `JsonConfig`.

use serde_json::Value;
use std::path::Path;

/// A loaded configuration document, queried by dotted key path
/// (`"mqtt.host"`, `"bluetooth.server.socket_buffer_size"`, ...).
#[derive(Clone, Debug)]
pub struct Config {
    root: Value,
}

impl Config {
    /// Loads configuration from a JSON file. Missing files are treated as
    /// an empty document so that every key falls back to its default.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let path = path.as_ref();
        let root = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("config file {} not found, using defaults", path.display());
                Value::Object(Default::default())
            }
            Err(err) => return Err(err),
        };
        Ok(Self { root })
    }

    #[cfg(test)]
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    fn get(&self, key: &str) -> Option<&Value> {
        let mut cur = &self.root;
        for part in key.split('.') {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).and_then(Value::as_str).map(str::to_owned).unwrap_or_else(|| default.to_owned())
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(Value::as_f64).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_lookup_with_defaults() {
        let cfg = Config::from_value(json!({
            "mqtt": {"host": "10.0.0.1", "port": 1884},
            "bluetooth": {"max_repair_count": 5}
        }));
        assert_eq!(cfg.get_str("mqtt.host", "127.0.0.1"), "10.0.0.1");
        assert_eq!(cfg.get_i64("mqtt.port", 1883), 1884);
        assert_eq!(cfg.get_i64("bluetooth.max_repair_count", 3), 5);
        assert_eq!(cfg.get_i64("bluetooth.max_reconnect_count", 3), 3);
        assert_eq!(cfg.get_str("mqtt.username", "admin"), "admin");
    }

    #[test]
    fn missing_intermediate_object_falls_back() {
        let cfg = Config::from_value(json!({}));
        assert_eq!(cfg.get_i64("bluetooth.server.socket_buffer_size", 1024), 1024);
    }
}
