//! Key-path configuration store.
//!
//! Parameters are addressed by `/`-separated paths such as
//! `network/localAddress`. Files ending in `.toml` are read and written as
//! TOML, anything else as JSON; both are held as one JSON tree in memory.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const LOCAL_ADDRESS_KEY: &str = "network/localAddress";
pub const LOCAL_PORT_KEY: &str = "network/localPort";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("could not find config parameter with path: {0}")]
    NotFound(String),

    #[error("config parameter {path} has the wrong type: {source}")]
    Type { path: String, #[source] source: serde_json::Error },

    #[error("config parameter {path} is invalid: {message}")]
    Invalid { path: String, message: String },

    #[error("serialize config: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Toml,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Format::Toml,
            _ => Format::Json,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    format: Format,
    root: Value,
}

impl ConfigStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        let format = Format::for_path(&path);
        let root = match format {
            Format::Json => serde_json::from_str(&text)
                .map_err(|e| ConfigError::Parse { path: path.clone(), message: e.to_string() })?,
            Format::Toml => toml::from_str::<Value>(&text)
                .map_err(|e| ConfigError::Parse { path: path.clone(), message: e.to_string() })?,
        };
        debug!("config: loaded {}", path.display());
        Ok(Self { path: Some(path), format, root })
    }

    /// In-memory store, mostly for tests and for composing config in code.
    pub fn from_value(root: Value) -> Self {
        Self { path: None, format: Format::Json, root }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get<T: DeserializeOwned>(&self, key_path: &str) -> Result<T, ConfigError> {
        debug!("config: retrieving parameter {}", key_path);
        let node = self.lookup(key_path)?;
        serde_json::from_value(node.clone())
            .map_err(|source| ConfigError::Type { path: key_path.to_string(), source })
    }

    pub fn get_raw(&self, key_path: &str) -> Result<&Value, ConfigError> {
        self.lookup(key_path)
    }

    /// Sets a parameter, creating intermediate objects (and replacing
    /// non-object nodes on the way) as needed. Call `save` to persist.
    pub fn set<T: Serialize>(&mut self, key_path: &str, value: T) -> Result<(), ConfigError> {
        let value = serde_json::to_value(value).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        let parts = split_path(key_path);
        let Some((last, parents)) = parts.split_last() else {
            return Err(ConfigError::Invalid { path: key_path.to_string(), message: "empty path".into() });
        };

        let mut node = &mut self.root;
        for key in parents {
            node = ensure_object(node).entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(node).insert(last.to_string(), value);
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Err(ConfigError::Invalid { path: String::new(), message: "store has no backing file".into() });
        };
        let text = match self.format {
            Format::Json => serde_json::to_string_pretty(&self.root).map_err(|e| ConfigError::Serialize(e.to_string()))?,
            Format::Toml => toml::to_string_pretty(&self.root).map_err(|e| ConfigError::Serialize(e.to_string()))?,
        };
        std::fs::write(path, text).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        debug!("config: saved {}", path.display());
        Ok(())
    }

    fn lookup(&self, key_path: &str) -> Result<&Value, ConfigError> {
        let mut node = &self.root;
        for key in split_path(key_path) {
            node = node.get(key).ok_or_else(|| ConfigError::NotFound(key_path.to_string()))?;
        }
        Ok(node)
    }
}

fn split_path(key_path: &str) -> Vec<&str> {
    key_path.split('/').filter(|s| !s.is_empty()).collect()
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just made an object"),
    }
}

/// Local endpoint the receiver binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub local_address: Ipv4Addr,
    pub local_port: u16,
}

impl NetworkConfig {
    pub fn from_store(store: &ConfigStore) -> Result<Self, ConfigError> {
        let addr: String = store.get(LOCAL_ADDRESS_KEY)?;
        let local_address = addr.parse::<Ipv4Addr>().map_err(|e| ConfigError::Invalid {
            path: LOCAL_ADDRESS_KEY.to_string(),
            message: format!("{:?} is not a dotted-quad IPv4 address: {}", addr, e),
        })?;
        let local_port: u16 = store.get(LOCAL_PORT_KEY)?;
        Ok(Self { local_address, local_port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("aero-config-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_get_nested_parameters() {
        let store = ConfigStore::from_value(json!({
            "network": { "localAddress": "127.0.0.1", "localPort": 5000 }
        }));
        let addr: String = store.get("network/localAddress").unwrap();
        let port: i64 = store.get("network/localPort").unwrap();
        assert_eq!(addr, "127.0.0.1");
        assert_eq!(port, 5000);
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let store = ConfigStore::from_value(json!({ "network": {} }));
        let err = store.get::<String>("network/localAddress").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(ref p) if p == "network/localAddress"));
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let store = ConfigStore::from_value(json!({ "network": { "localPort": "five" } }));
        assert!(matches!(store.get::<u16>("network/localPort"), Err(ConfigError::Type { .. })));
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut store = ConfigStore::from_value(json!({ "network": 3 }));
        store.set("network/localPort", 6000).unwrap();
        store.set("logging/level/console", "debug").unwrap();
        assert_eq!(store.get::<u16>("network/localPort").unwrap(), 6000);
        assert_eq!(store.get::<String>("logging/level/console").unwrap(), "debug");
    }

    #[test]
    fn test_network_config() {
        let store = ConfigStore::from_value(json!({
            "network": { "localAddress": "0.0.0.0", "localPort": 5000 }
        }));
        let net = NetworkConfig::from_store(&store).unwrap();
        assert_eq!(net.local_address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(net.local_port, 5000);

        let bad = ConfigStore::from_value(json!({
            "network": { "localAddress": "localhost", "localPort": 5000 }
        }));
        assert!(matches!(NetworkConfig::from_store(&bad), Err(ConfigError::Invalid { .. })));

        let out_of_range = ConfigStore::from_value(json!({
            "network": { "localAddress": "0.0.0.0", "localPort": 70000 }
        }));
        assert!(matches!(NetworkConfig::from_store(&out_of_range), Err(ConfigError::Type { .. })));
    }

    #[test]
    fn test_json_save_and_reload() {
        let path = temp_path("roundtrip.json");
        std::fs::write(&path, r#"{ "network": { "localAddress": "127.0.0.1", "localPort": 5000 } }"#).unwrap();

        let mut store = ConfigStore::load(&path).unwrap();
        store.set("network/localPort", 5001).unwrap();
        store.save().unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.get::<u16>("network/localPort").unwrap(), 5001);
        assert_eq!(reloaded.get::<String>("network/localAddress").unwrap(), "127.0.0.1");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_toml_file_is_supported() {
        let path = temp_path("net.toml");
        std::fs::write(&path, "[network]\nlocalAddress = \"10.0.0.2\"\nlocalPort = 7000\n").unwrap();

        let store = ConfigStore::load(&path).unwrap();
        let net = NetworkConfig::from_store(&store).unwrap();
        assert_eq!(net.local_address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(net.local_port, 7000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(ConfigStore::load(temp_path("absent.json")), Err(ConfigError::Io { .. })));
    }
}
