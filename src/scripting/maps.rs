//! Scoped key/value maps visible to scripts
//!
//! Five stores with different lifetimes:
//!
//! | Scope | Accessors | Lifetime |
//! |---|---|---|
//! | global | `global_map`, `g` | process, shared by every channel |
//! | global channel | `global_channel_map`, `gc` | process, cleared only on request |
//! | channel | `channel_map`, `c` | one pipeline instance |
//! | connector | `connector_map`, `co` | one connector run over one message |
//! | response | `response_map`, `r` | one message |
//!
//! Values are stored as JSON so any script backend can read them back.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A single synchronized key/value store
#[derive(Debug, Default)]
pub struct ScopedMap {
    entries: RwLock<HashMap<String, Value>>,
}

/// Reference-counted handle to a [`ScopedMap`]
pub type SharedMap = Arc<ScopedMap>;

impl ScopedMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new map behind a shared handle
    pub fn shared() -> SharedMap {
        Arc::new(Self::new())
    }

    // Poisoned locks are recovered, entries stay readable
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Write a value and return it
    pub fn put(&self, key: impl Into<String>, value: Value) -> Value {
        self.write().insert(key.into(), value.clone());
        value
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.read().clone()
    }
}

/// Which of the five maps an accessor addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapScope {
    Global,
    GlobalChannel,
    Channel,
    Connector,
    Response,
}

impl MapScope {
    pub const ALL: [MapScope; 5] = [
        MapScope::Global,
        MapScope::GlobalChannel,
        MapScope::Channel,
        MapScope::Connector,
        MapScope::Response,
    ];

    /// Function names scripts use to reach this map
    pub fn accessors(&self) -> &'static [&'static str] {
        match self {
            MapScope::Global => &["global_map", "g"],
            MapScope::GlobalChannel => &["global_channel_map", "gc"],
            MapScope::Channel => &["channel_map", "c"],
            MapScope::Connector => &["connector_map", "co"],
            MapScope::Response => &["response_map", "r"],
        }
    }
}

/// Process-wide maps, created once and handed to every pipeline
#[derive(Debug, Clone, Default)]
pub struct GlobalMaps {
    global: SharedMap,
    global_channel: SharedMap,
}

impl GlobalMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(&self) -> &SharedMap {
        &self.global
    }

    pub fn global_channel(&self) -> &SharedMap {
        &self.global_channel
    }

    /// Administrative reset of both process-wide maps
    pub fn clear(&self) {
        self.global.clear();
        self.global_channel.clear();
    }
}

/// The five map handles bound to one script invocation
#[derive(Debug, Clone)]
pub struct ScopedMaps {
    global: SharedMap,
    global_channel: SharedMap,
    channel: SharedMap,
    connector: SharedMap,
    response: SharedMap,
}

impl ScopedMaps {
    pub fn new(globals: &GlobalMaps, channel: SharedMap, connector: SharedMap, response: SharedMap) -> Self {
        Self {
            global: globals.global.clone(),
            global_channel: globals.global_channel.clone(),
            channel,
            connector,
            response,
        }
    }

    /// Fresh maps that share nothing with any pipeline
    pub fn isolated() -> Self {
        Self::new(&GlobalMaps::new(), ScopedMap::shared(), ScopedMap::shared(), ScopedMap::shared())
    }

    pub fn get(&self, scope: MapScope) -> &SharedMap {
        match scope {
            MapScope::Global => &self.global,
            MapScope::GlobalChannel => &self.global_channel,
            MapScope::Channel => &self.channel,
            MapScope::Connector => &self.connector,
            MapScope::Response => &self.response,
        }
    }

    /// Same maps with a different connector map
    pub fn with_connector(&self, connector: SharedMap) -> Self {
        Self {
            connector,
            ..self.clone()
        }
    }
}
