//! Policy store: an ordered set of declarative policies with match
//! predicates and configuration fragments.
//!
//! Grounded on `netconfig.rs`'s `MatchSection` and its `glob_match`/
//! `glob_match_inner` helpers, generalized from matching one `.network`
//! file to a prioritized, revisioned store of many policies. The revision
//! counter mirrors `nanny/main.c`'s `ni_fsm_policies_changed_since`.

use crate::device::{DeviceKind, DeviceRecord};
use crate::document::Node;
use crate::error::{Error, Name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub kind: Option<DeviceKind>,
    pub name_glob: Option<String>,
    pub hwaddr_glob: Option<String>,
    pub carrier_up: Option<bool>,
}

impl Match {
    pub fn matches(&self, device: &DeviceRecord) -> bool {
        if let Some(kind) = self.kind {
            if device.kind() != kind {
                return false;
            }
        }
        if let Some(glob) = &self.name_glob {
            if !glob_match(glob, &device.attrs.name) {
                return false;
            }
        }
        if let Some(glob) = &self.hwaddr_glob {
            if !glob_match(glob, &device.attrs.hwaddr) {
                return false;
            }
        }
        if let Some(want_up) = self.carrier_up {
            if device.attrs.flags.link_up != want_up {
                return false;
            }
        }
        true
    }
}

/// Case-sensitive glob supporting `*` and `?`. Adapted from the donor's
/// `[Match]`-section matcher.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    glob_match_inner(pattern.as_bytes(), text.as_bytes())
}

fn glob_match_inner(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(b'*'), _) => {
            glob_match_inner(&pattern[1..], text)
                || (!text.is_empty() && glob_match_inner(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match_inner(&pattern[1..], &text[1..]),
        (Some(&p), Some(&t)) if p == t => glob_match_inner(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyId(pub String);

#[derive(Debug, Clone)]
pub struct Policy {
    pub id: PolicyId,
    pub priority: i64,
    pub matcher: Match,
    /// Opaque configuration fragment (target stage, addressing method,
    /// etc.) -- represented as a document so it round-trips losslessly
    /// through `policy.put`/`policy.list`.
    pub config: Node,
}

impl Policy {
    pub fn to_document(&self) -> Node {
        let mut doc = Node::new("policy")
            .with_attr("id", self.id.0.clone())
            .with_attr("priority", self.priority.to_string());
        let mut match_node = Node::new("match");
        if let Some(kind) = self.matcher.kind {
            match_node = match_node.with_attr("type", format!("{kind:?}").to_lowercase());
        }
        if let Some(g) = &self.matcher.name_glob {
            match_node = match_node.with_attr("name", g);
        }
        if let Some(g) = &self.matcher.hwaddr_glob {
            match_node = match_node.with_attr("hwaddr", g);
        }
        if let Some(up) = self.matcher.carrier_up {
            match_node = match_node.with_attr("carrier", if up { "up" } else { "down" });
        }
        doc = doc.with_child(match_node);
        doc = doc.with_child(self.config.clone());
        doc
    }
}

/// Insertion order is preserved so equal-priority ties break by the order
/// policies were inserted, per invariant testing in §8.
#[derive(Default)]
pub struct PolicyStore {
    policies: Vec<Policy>,
    revision: u64,
}

impl PolicyStore {
    pub fn new() -> Self {
        PolicyStore::default()
    }

    pub fn insert(&mut self, policy: Policy) {
        if let Some(existing) = self.policies.iter_mut().find(|p| p.id == policy.id) {
            *existing = policy;
        } else {
            self.policies.push(policy);
        }
        self.revision += 1;
    }

    pub fn remove(&mut self, id: &PolicyId) -> Result<Policy, Error> {
        let pos = self
            .policies
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| Error::configuration(Name::NotFound, format!("policy {} not found", id.0)))?;
        let policy = self.policies.remove(pos);
        self.revision += 1;
        Ok(policy)
    }

    pub fn get(&self, id: &PolicyId) -> Option<&Policy> {
        self.policies.iter().find(|p| &p.id == id)
    }

    /// Policies in priority order, lowest first, ties broken by insertion
    /// order (a stable sort over the insertion-ordered vector guarantees
    /// this).
    pub fn iter_by_priority(&self) -> Vec<&Policy> {
        let mut out: Vec<&Policy> = self.policies.iter().collect();
        out.sort_by_key(|p| p.priority);
        out
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Matching policies in priority order; the reconciler selects the last
    /// (highest-priority) entry.
    pub fn get_applicable(&self, device: &DeviceRecord) -> Vec<&Policy> {
        self.iter_by_priority()
            .into_iter()
            .filter(|p| p.matcher.matches(device))
            .collect()
    }

    pub fn select(&self, device: &DeviceRecord) -> Option<&Policy> {
        self.get_applicable(device).into_iter().last()
    }

    pub fn list(&self) -> &[Policy] {
        &self.policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceAttrs, DeviceHandle, LinkFlags};

    fn device(name: &str, kind: DeviceKind) -> DeviceRecord {
        DeviceRecord {
            handle: DeviceHandle { index: 1, generation: 0 },
            attrs: DeviceAttrs {
                name: name.to_string(),
                kind: Some(kind),
                hwaddr: "52:54:00:00:00:01".into(),
                mtu: 1500,
                flags: LinkFlags { device_up: true, link_up: true, network_up: false },
                addresses: Vec::new(),
                routes: Vec::new(),
            },
            leases: Vec::new(),
        }
    }

    fn policy(id: &str, priority: i64, matcher: Match) -> Policy {
        Policy {
            id: PolicyId(id.into()),
            priority,
            matcher,
            config: Node::new("config"),
        }
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("eth*", "eth0"));
        assert!(glob_match("eth?", "eth0"));
        assert!(!glob_match("eth?", "eth10"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("wlan*", "eth0"));
    }

    #[test]
    fn match_by_kind_and_name() {
        let m = Match {
            kind: Some(DeviceKind::Ethernet),
            name_glob: Some("eth*".into()),
            hwaddr_glob: None,
            carrier_up: None,
        };
        assert!(m.matches(&device("eth0", DeviceKind::Ethernet)));
        assert!(!m.matches(&device("wlan0", DeviceKind::Wifi)));
    }

    #[test]
    fn revision_increments_on_mutation() {
        let mut store = PolicyStore::new();
        assert_eq!(store.revision(), 0);
        store.insert(policy("a", 10, Match { kind: None, name_glob: None, hwaddr_glob: None, carrier_up: None }));
        assert_eq!(store.revision(), 1);
        store.remove(&PolicyId("a".into())).unwrap();
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn priority_ties_break_by_insertion_order() {
        let mut store = PolicyStore::new();
        let any = Match { kind: None, name_glob: None, hwaddr_glob: None, carrier_up: None };
        store.insert(policy("first", 10, any.clone()));
        store.insert(policy("second", 10, any.clone()));
        let ordered = store.iter_by_priority();
        assert_eq!(ordered[0].id.0, "first");
        assert_eq!(ordered[1].id.0, "second");
    }

    #[test]
    fn priority_tie_swap_changes_selection_order() {
        let mut store = PolicyStore::new();
        let any = Match { kind: None, name_glob: None, hwaddr_glob: None, carrier_up: None };
        store.insert(policy("second", 10, any.clone()));
        store.insert(policy("first", 10, any.clone()));
        let ordered = store.iter_by_priority();
        assert_eq!(ordered[0].id.0, "second");
        assert_eq!(ordered[1].id.0, "first");
    }

    #[test]
    fn select_picks_highest_priority_matching() {
        let mut store = PolicyStore::new();
        let eth = Match { kind: Some(DeviceKind::Ethernet), name_glob: None, hwaddr_glob: None, carrier_up: None };
        store.insert(policy("low", 1, eth.clone()));
        store.insert(policy("high", 100, eth.clone()));
        let dev = device("eth0", DeviceKind::Ethernet);
        assert_eq!(store.select(&dev).unwrap().id.0, "high");
    }

    #[test]
    fn select_is_pure_repeated_calls_agree() {
        let mut store = PolicyStore::new();
        let eth = Match { kind: Some(DeviceKind::Ethernet), name_glob: None, hwaddr_glob: None, carrier_up: None };
        store.insert(policy("only", 1, eth));
        let dev = device("eth0", DeviceKind::Ethernet);
        let a = store.select(&dev).map(|p| p.id.clone());
        let b = store.select(&dev).map(|p| p.id.clone());
        assert_eq!(a, b);
    }

    #[test]
    fn policy_document_round_trip_preserves_fields() {
        let p = policy(
            "wifi-home",
            5,
            Match { kind: Some(DeviceKind::Wifi), name_glob: Some("wlan*".into()), hwaddr_glob: None, carrier_up: None },
        );
        let doc = p.to_document();
        assert_eq!(doc.attr("id"), Some("wifi-home"));
        assert_eq!(doc.child("match").unwrap().attr("name"), Some("wlan*"));
    }
}
