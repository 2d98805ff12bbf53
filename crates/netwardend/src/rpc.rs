//! Inbound/outbound RPC surface (§6), exposed over `zbus` — the donor
//! ecosystem's own standing choice for exactly this role (`networkd`,
//! `timesyncd` and `udevd` all declare the same dependency, though none of
//! them wire up an interface in committed source; this module is the first
//! one in the lineage that actually does).
//!
//! Objects: a root manager at `/org/netwarden1/Manager`, one object per
//! device at `/org/netwarden1/Device/<index>`, one object per policy at
//! `/org/netwarden1/Policy/<id>`. Mutating calls never touch the reconciler
//! directly -- they translate into `Event::Rpc(..)` pushed onto the shared
//! event source, per §9's redesign note ("callback-based dbus handlers
//! capturing manager pointer" -> "messages delivered to the reconciler's
//! event queue"). Read-only calls serve a point-in-time snapshot the main
//! loop republishes after every reconciler tick.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use zbus::interface;

use crate::device::{DeviceKind, LinkFlags};
use crate::document::Node;
use crate::error::{Error, Name};
use crate::event::{Event, EventSourceHandle, KernelEvent, LeaseEvent, RpcSignal};
use crate::lease::{AddrFamily, AddrconfMethod, Lease};
use crate::policy::{Match, Policy, PolicyId};
use crate::reconciler::Reconciler;
use crate::worker::Stage;

pub const BUS_NAME: &str = "org.netwarden1";
pub const MANAGER_PATH: &str = "/org/netwarden1/Manager";

pub fn device_path(index: u32) -> String {
    format!("/org/netwarden1/Device/{index}")
}

pub fn policy_path(id: &str) -> String {
    format!("/org/netwarden1/Policy/{}", sanitize_path_segment(id))
}

fn sanitize_path_segment(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// A point-in-time view of one device, republished after every reconciler
/// tick so RPC reads never block on the reconciler's lock.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub index: u32,
    pub name: String,
    pub kind: DeviceKind,
    pub flags: LinkFlags,
    pub hwaddr: String,
    pub mtu: u32,
    pub addresses: Vec<String>,
    pub routes: Vec<String>,
    pub stage: Stage,
    pub failed: bool,
    pub selected_policy: Option<String>,
    pub leases: Vec<Lease>,
}

#[derive(Debug, Clone, Default)]
pub struct RpcSnapshot {
    pub devices: Vec<DeviceSnapshot>,
    pub policies: Vec<Policy>,
}

pub type SharedSnapshot = Arc<Mutex<RpcSnapshot>>;

/// Rebuilds the snapshot from the reconciler's live state. Called by the
/// main loop after each tick; the RPC thread only ever reads the result.
pub fn build_snapshot(reconciler: &Reconciler) -> RpcSnapshot {
    let devices = reconciler
        .inventory
        .iter()
        .map(|record| {
            let worker = reconciler.workers.get(&record.handle.index);
            DeviceSnapshot {
                index: record.handle.index,
                name: record.attrs.name.clone(),
                kind: record.kind(),
                flags: record.attrs.flags,
                hwaddr: record.attrs.hwaddr.clone(),
                mtu: record.attrs.mtu,
                addresses: record.attrs.addresses.clone(),
                routes: record.attrs.routes.clone(),
                stage: worker.map(|w| w.stage()).unwrap_or(Stage::DeviceExists),
                failed: worker.map(|w| w.is_failed()).unwrap_or(false),
                selected_policy: worker.and_then(|w| w.selected_policy.as_ref().map(|p| p.0.clone())),
                leases: record.leases.clone(),
            }
        })
        .collect();
    let policies = reconciler.policies.list().to_vec();
    RpcSnapshot { devices, policies }
}

fn stage_name(stage: Stage) -> &'static str {
    match stage {
        Stage::DeviceExists => "device-exists",
        Stage::DeviceReady => "device-ready",
        Stage::LinkAuthenticated => "link-authenticated",
        Stage::LinkUp => "link-up",
        Stage::NetworkAddressAcquiring => "network-address-acquiring",
        Stage::NetworkUp => "network-up",
        Stage::Steady => "steady",
    }
}

fn kind_name(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Ethernet => "ethernet",
        DeviceKind::Wifi => "wifi",
        DeviceKind::Bond => "bond",
        DeviceKind::Bridge => "bridge",
        DeviceKind::Vlan => "vlan",
        DeviceKind::Modem => "modem",
        DeviceKind::Virtual => "virtual",
    }
}

fn parse_kind(s: &str) -> Option<DeviceKind> {
    match s {
        "ethernet" => Some(DeviceKind::Ethernet),
        "wifi" => Some(DeviceKind::Wifi),
        "bond" => Some(DeviceKind::Bond),
        "bridge" => Some(DeviceKind::Bridge),
        "vlan" => Some(DeviceKind::Vlan),
        "modem" => Some(DeviceKind::Modem),
        "virtual" => Some(DeviceKind::Virtual),
        _ => None,
    }
}

/// Parses a `<policy>` document (as produced by `Policy::to_document`) back
/// into a `Policy`, the server side of `policy.put`.
pub fn parse_policy_document(node: &Node) -> Option<Policy> {
    let id = node.attr("id")?.to_string();
    let priority: i64 = node.attr("priority")?.parse().ok()?;
    let match_node = node.child("match")?;
    let matcher = Match {
        kind: match_node.attr("type").and_then(parse_kind),
        name_glob: match_node.attr("name").map(|s| s.to_string()),
        hwaddr_glob: match_node.attr("hwaddr").map(|s| s.to_string()),
        carrier_up: match_node.attr("carrier").map(|s| s == "up"),
    };
    let config = node.child("config").cloned().unwrap_or_else(|| Node::new("config"));
    Some(Policy { id: PolicyId(id), priority, matcher, config })
}

/// Renders the document model the `show-xml` command prints.
pub fn snapshot_to_document(snapshot: &RpcSnapshot, only: Option<&str>) -> Node {
    let mut root = Node::new("network-state");
    for device in &snapshot.devices {
        if let Some(name) = only {
            if device.name != name {
                continue;
            }
        }
        let mut node = Node::new("interface")
            .with_attr("index", device.index.to_string())
            .with_attr("name", device.name.clone())
            .with_attr("type", kind_name(device.kind))
            .with_attr("state", stage_name(device.stage))
            .with_attr("mtu", device.mtu.to_string())
            .with_attr("hwaddr", device.hwaddr.clone());
        if let Some(p) = &device.selected_policy {
            node = node.with_attr("policy", p.clone());
        }
        for addr in &device.addresses {
            node = node.with_child(Node::new("address").with_attr("local", addr.clone()));
        }
        for route in &device.routes {
            node = node.with_child(Node::new("route").with_attr("value", route.clone()));
        }
        for lease in &device.leases {
            node = node.with_child(lease.to_document());
        }
        root = root.with_child(node);
    }
    root
}

/// The root manager object: `manager.*` methods from §6, plus the
/// `policy.put`/`delete`/`list` surface (centralized here rather than on
/// per-policy objects, since `put` must be able to create one that doesn't
/// exist yet -- the same split wicked's own nanny/client interface uses).
pub struct ManagerIface {
    pub snapshot: SharedSnapshot,
    pub events: EventSourceHandle,
}

fn index_by_name(snapshot: &RpcSnapshot, name: &str) -> Option<u32> {
    snapshot.devices.iter().find(|d| d.name == name).map(|d| d.index)
}

#[interface(name = "org.netwarden1.Manager1")]
impl ManagerIface {
    /// `manager.get_managed_objects()`.
    async fn get_managed_objects(&self) -> Vec<(u32, String, String, String)> {
        let snap = self.snapshot.lock().unwrap();
        snap.devices
            .iter()
            .map(|d| (d.index, d.name.clone(), kind_name(d.kind).to_string(), stage_name(d.stage).to_string()))
            .collect()
    }

    /// `device.ifup(config, deadline)`, dispatched by interface name here.
    /// An empty `config_xml` means "use whatever policy already matches";
    /// a non-empty one must parse as a document, installed as an ad-hoc
    /// policy overriding normal selection for this device.
    async fn ifup(&self, name: String, config_xml: String, deadline_secs: u32) -> zbus::fdo::Result<()> {
        let snap = self.snapshot.lock().unwrap();
        if index_by_name(&snap, &name).is_none() {
            return Err(zbus::fdo::Error::Failed(format!("{}: {}", Name::DeviceUnknown.as_str(), name)));
        }
        drop(snap);
        let config = if config_xml.trim().is_empty() {
            None
        } else {
            Some(Node::parse(&config_xml).ok_or_else(|| {
                zbus::fdo::Error::Failed(format!("{}: malformed ifup config", Name::PolicyInvalid.as_str()))
            })?)
        };
        self.events.send(Event::Rpc(RpcSignal::IfUp(name, config, deadline_secs)));
        Ok(())
    }

    /// `device.ifdown(options)`.
    async fn ifdown(&self, name: String, delete: bool) -> zbus::fdo::Result<()> {
        let snap = self.snapshot.lock().unwrap();
        if index_by_name(&snap, &name).is_none() {
            return Err(zbus::fdo::Error::Failed(format!("{}: {}", Name::DeviceUnknown.as_str(), name)));
        }
        drop(snap);
        self.events.send(Event::Rpc(RpcSignal::IfDown(name, delete)));
        Ok(())
    }

    /// `device.delete()` -- always tears down fully (§9 resolved Open
    /// Question), regardless of user-controlled / selected-policy state.
    async fn delete(&self, name: String) -> zbus::fdo::Result<()> {
        self.events.send(Event::Rpc(RpcSignal::IfDown(name, true)));
        Ok(())
    }

    /// `device.install_lease(lease_xml)`.
    async fn install_lease(&self, name: String, lease_xml: String) -> zbus::fdo::Result<()> {
        let snap = self.snapshot.lock().unwrap();
        let index = index_by_name(&snap, &name)
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("{}: {}", Name::DeviceUnknown.as_str(), name)))?;
        drop(snap);
        let node = Node::parse(&lease_xml)
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("{}: malformed lease document", Name::LeaseUnavailable.as_str())))?;
        let lease = Lease::from_document(&node)
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("{}: malformed lease document", Name::LeaseUnavailable.as_str())))?;
        self.events.send(Event::Lease(LeaseEvent::Acquired(index, lease.family, lease.method, lease)));
        Ok(())
    }

    /// `policy.put(id, policy_doc)`.
    async fn policy_put(&self, policy_doc: String) -> zbus::fdo::Result<()> {
        let node = Node::parse(&policy_doc)
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("{}: not a policy document", Name::PolicyInvalid.as_str())))?;
        let policy = parse_policy_document(&node)
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("{}: missing id/priority/match", Name::PolicyInvalid.as_str())))?;
        self.events.send(Event::Rpc(RpcSignal::PolicyAdded(policy)));
        Ok(())
    }

    /// `policy.delete(id)`.
    async fn policy_delete(&self, id: String) -> zbus::fdo::Result<()> {
        self.events.send(Event::Rpc(RpcSignal::PolicyRemoved(PolicyId(id))));
        Ok(())
    }

    /// `policy.list()`.
    async fn policy_list(&self) -> Vec<String> {
        let snap = self.snapshot.lock().unwrap();
        snap.policies.iter().map(|p| p.id.0.clone()).collect()
    }

    /// `prompt-response(security_id, path, value)`, delivered as an RPC
    /// signal into the event source (§4.7).
    async fn prompt_response(&self, security_id: String, path: String, value: String) -> zbus::fdo::Result<()> {
        self.events.send(Event::Rpc(RpcSignal::PromptResponse(security_id, path, value)));
        Ok(())
    }

    /// `manager.check(resolve|route, hostnames, timeout, af)`.
    async fn check(
        &self,
        mode: String,
        hostnames: Vec<String>,
        timeout_secs: u32,
        af: String,
    ) -> Vec<(String, bool, String, String)> {
        let timeout = Duration::from_secs(timeout_secs.max(1) as u64);
        hostnames
            .iter()
            .map(|host| match check_host(&mode, host, timeout, &af) {
                Ok(()) => (host.clone(), true, String::new(), String::new()),
                Err(e) => (host.clone(), false, e.name.as_str().to_string(), e.message().to_string()),
            })
            .collect()
    }
}

/// Results of `manager.check`. `resolve` only performs DNS resolution;
/// `route` additionally verifies reachability with a non-transmitting UDP
/// `connect()` (the kernel resolves a route for the destination without any
/// bytes leaving the host; an unreachable destination fails the connect
/// itself on most platforms for this exact reason).
pub fn check_host(mode: &str, host: &str, timeout: Duration, af: &str) -> Result<(), Error> {
    let want_v6 = af.eq_ignore_ascii_case("ipv6");
    let want_v4 = af.eq_ignore_ascii_case("ipv4");

    let candidates: Vec<SocketAddr> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| Error::configuration(Name::UnresolvableHostname, format!("cannot resolve {host}")))?
        .filter(|a| if want_v6 { a.is_ipv6() } else if want_v4 { a.is_ipv4() } else { true })
        .collect();

    if candidates.is_empty() {
        return Err(Error::configuration(Name::UnresolvableHostname, format!("cannot resolve {host}")));
    }

    if mode != "route" {
        return Ok(());
    }

    let _ = timeout;
    for addr in candidates {
        let local: SocketAddr = match addr.ip() {
            IpAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            IpAddr::V6(_) => "[::]:0".parse().unwrap(),
        };
        if let Ok(sock) = UdpSocket::bind(local) {
            if sock.connect(addr).is_ok() {
                return Ok(());
            }
        }
    }
    Err(Error::configuration(Name::UnreachableAddress, format!("no route to {host}")))
}

/// Read-only per-device object, registered/unregistered by the main loop as
/// `DeviceCreate`/`DeviceDelete` kernel events are observed.
pub struct DeviceIface {
    pub index: u32,
    pub snapshot: SharedSnapshot,
}

impl DeviceIface {
    fn with_record<T>(&self, f: impl FnOnce(&DeviceSnapshot) -> T) -> Option<T> {
        let snap = self.snapshot.lock().unwrap();
        snap.devices.iter().find(|d| d.index == self.index).map(f)
    }
}

#[interface(name = "org.netwarden1.Device1")]
impl DeviceIface {
    #[zbus(property)]
    async fn name(&self) -> String {
        self.with_record(|d| d.name.clone()).unwrap_or_default()
    }

    #[zbus(property)]
    async fn device_type(&self) -> String {
        self.with_record(|d| kind_name(d.kind).to_string()).unwrap_or_default()
    }

    #[zbus(property)]
    async fn state(&self) -> String {
        self.with_record(|d| stage_name(d.stage).to_string()).unwrap_or_default()
    }

    #[zbus(property)]
    async fn addresses(&self) -> Vec<String> {
        self.with_record(|d| d.addresses.clone()).unwrap_or_default()
    }
}

/// Read-only per-policy object.
pub struct PolicyIface {
    pub id: PolicyId,
    pub snapshot: SharedSnapshot,
}

#[interface(name = "org.netwarden1.Policy1")]
impl PolicyIface {
    #[zbus(property)]
    async fn priority(&self) -> i64 {
        let snap = self.snapshot.lock().unwrap();
        snap.policies.iter().find(|p| p.id == self.id).map(|p| p.priority).unwrap_or(0)
    }

    #[zbus(property)]
    async fn document(&self) -> String {
        let snap = self.snapshot.lock().unwrap();
        snap.policies
            .iter()
            .find(|p| p.id == self.id)
            .map(|p| p.to_document().serialize())
            .unwrap_or_default()
    }
}

/// Indices of kernel events whose only RPC-observable effect is a signal
/// emission, kept separate from `Event` (which already carries everything
/// the reconciler needs) so the signal-emission call site in `main.rs` can
/// pattern-match without re-deriving state.
#[derive(Debug, Clone)]
pub enum OutboundSignal {
    DeviceCreate(u32, String),
    DeviceDelete(u32, String),
    LinkUp(u32),
    LinkDown(u32),
    LinkAssociationLost(u32),
    LeaseChanged(u32, AddrFamily, AddrconfMethod, bool),
}

pub fn outbound_signal_for_kernel_event(event: &KernelEvent, names: &HashMap<u32, String>) -> Option<OutboundSignal> {
    match event {
        KernelEvent::DeviceCreate(idx, attrs) => Some(OutboundSignal::DeviceCreate(*idx, attrs.name.clone())),
        KernelEvent::DeviceDelete(idx) => {
            Some(OutboundSignal::DeviceDelete(*idx, names.get(idx).cloned().unwrap_or_default()))
        }
        KernelEvent::LinkUp(idx) => Some(OutboundSignal::LinkUp(*idx)),
        KernelEvent::LinkDown(idx) => Some(OutboundSignal::LinkDown(*idx)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceAttrs, DeviceKind as DK, LinkFlags as LF};
    use crate::policy::Match;

    fn sample_snapshot() -> RpcSnapshot {
        RpcSnapshot {
            devices: vec![DeviceSnapshot {
                index: 3,
                name: "eth0".into(),
                kind: DK::Ethernet,
                flags: LF { device_up: true, link_up: true, network_up: true },
                hwaddr: "52:54:00:00:00:01".into(),
                mtu: 1500,
                addresses: vec!["10.0.0.2/24".into()],
                routes: vec!["default via 10.0.0.1".into()],
                stage: Stage::NetworkUp,
                failed: false,
                selected_policy: Some("dhcp".into()),
                leases: vec![],
            }],
            policies: vec![],
        }
    }

    #[test]
    fn snapshot_to_document_renders_interface_with_addresses() {
        let snap = sample_snapshot();
        let doc = snapshot_to_document(&snap, None);
        let iface = doc.child("interface").unwrap();
        assert_eq!(iface.attr("name"), Some("eth0"));
        assert_eq!(iface.attr("state"), Some("network-up"));
        assert!(iface.children_named("address").next().is_some());
    }

    #[test]
    fn snapshot_to_document_filters_by_name() {
        let snap = sample_snapshot();
        let doc = snapshot_to_document(&snap, Some("nope"));
        assert!(doc.child("interface").is_none());
    }

    #[test]
    fn policy_document_round_trips_through_parse() {
        let policy = Policy {
            id: PolicyId("dhcp".into()),
            priority: 10,
            matcher: Match { kind: Some(DK::Ethernet), name_glob: Some("eth*".into()), hwaddr_glob: None, carrier_up: None },
            config: Node::new("config").with_attr("method", "dhcp"),
        };
        let doc = policy.to_document();
        let back = parse_policy_document(&doc).unwrap();
        assert_eq!(back.id, policy.id);
        assert_eq!(back.priority, policy.priority);
        assert_eq!(back.matcher.name_glob, policy.matcher.name_glob);
    }

    #[test]
    fn parse_policy_document_rejects_missing_match() {
        let doc = Node::new("policy").with_attr("id", "x").with_attr("priority", "1");
        assert!(parse_policy_document(&doc).is_none());
    }

    #[test]
    fn check_resolve_rejects_unresolvable_hostname() {
        let err = check_host(
            "resolve",
            "this-host-does-not-exist.invalid.example.",
            Duration::from_secs(1),
            "ipv4",
        )
        .unwrap_err();
        assert_eq!(err.name, Name::UnresolvableHostname);
    }

    #[test]
    fn build_snapshot_reflects_reconciler_state() {
        let mut r = Reconciler::new();
        let attrs = DeviceAttrs {
            name: "eth0".into(),
            kind: Some(DK::Ethernet),
            hwaddr: "52:54:00:00:00:01".into(),
            mtu: 1500,
            flags: LF { device_up: true, link_up: true, network_up: false },
            addresses: vec![],
            routes: vec![],
        };
        let (handle, _, _) = r.inventory.observe(3, attrs);
        r.workers.insert(3, crate::worker::Worker::new(handle, DK::Ethernet));
        let snap = build_snapshot(&r);
        assert_eq!(snap.devices.len(), 1);
        assert_eq!(snap.devices[0].name, "eth0");
    }
}
