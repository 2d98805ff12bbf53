//! Leases: the output of one address-configuration acquisition, and their
//! atomic on-disk persistence.
//!
//! Grounded on `manager.rs`'s `apply_lease`/`remove_lease` and `main.rs`'s
//! `write_state_files` (write-to-temp, then rename) and on `wickedd.c`'s
//! `wicked_try_restart_addrconf` recovery shape.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::document::Node;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
    Ipv4,
    Ipv6,
}

impl AddrFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            AddrFamily::Ipv4 => "ipv4",
            AddrFamily::Ipv6 => "ipv6",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ipv4" => Some(AddrFamily::Ipv4),
            "ipv6" => Some(AddrFamily::Ipv6),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrconfMethod {
    Static,
    Dhcp4,
    Ipv4ll,
    Dhcp6,
    Autoconf,
}

impl AddrconfMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AddrconfMethod::Static => "static",
            AddrconfMethod::Dhcp4 => "dhcp",
            AddrconfMethod::Ipv4ll => "ipv4ll",
            AddrconfMethod::Dhcp6 => "dhcp6",
            AddrconfMethod::Autoconf => "autoconf",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(AddrconfMethod::Static),
            "dhcp" => Some(AddrconfMethod::Dhcp4),
            "ipv4ll" => Some(AddrconfMethod::Ipv4ll),
            "dhcp6" => Some(AddrconfMethod::Dhcp6),
            "autoconf" => Some(AddrconfMethod::Autoconf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub family: AddrFamily,
    pub method: AddrconfMethod,
    pub addresses: Vec<String>,
    pub routes: Vec<String>,
    pub dns: Vec<String>,
    /// Unix seconds after which this lease is stale. `None` means no expiry.
    pub expiry: Option<u64>,
}

impl Lease {
    /// A lease with an expiry in the past is stale.
    pub fn is_valid(&self, now: u64) -> bool {
        match self.expiry {
            Some(expiry) => expiry > now,
            None => true,
        }
    }

    pub fn to_document(&self) -> Node {
        let mut node = Node::new("lease")
            .with_attr("family", self.family.as_str())
            .with_attr("method", self.method.as_str());
        if let Some(expiry) = self.expiry {
            node = node.with_attr("expiry", expiry.to_string());
        }
        for addr in &self.addresses {
            node = node.with_child(Node::new("address").with_attr("value", addr));
        }
        for route in &self.routes {
            node = node.with_child(Node::new("route").with_attr("value", route));
        }
        for server in &self.dns {
            node = node.with_child(Node::new("dns").with_attr("value", server));
        }
        node
    }

    pub fn from_document(node: &Node) -> Option<Lease> {
        let family = AddrFamily::parse(node.attr("family")?)?;
        let method = AddrconfMethod::parse(node.attr("method")?)?;
        let expiry = node.attr("expiry").and_then(|s| s.parse().ok());
        let addresses = node
            .children_named("address")
            .filter_map(|c| c.attr("value").map(|s| s.to_string()))
            .collect();
        let routes = node
            .children_named("route")
            .filter_map(|c| c.attr("value").map(|s| s.to_string()))
            .collect();
        let dns = node
            .children_named("dns")
            .filter_map(|c| c.attr("value").map(|s| s.to_string()))
            .collect();
        Some(Lease {
            family,
            method,
            addresses,
            routes,
            dns,
            expiry,
        })
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn slot_path(dir: &Path, ifname: &str, family: AddrFamily, method: AddrconfMethod, ext: &str) -> PathBuf {
    dir.join(format!("{ifname}.{}.{}.{ext}", family.as_str(), method.as_str()))
}

pub fn lease_path(leases_dir: &Path, ifname: &str, family: AddrFamily, method: AddrconfMethod) -> PathBuf {
    slot_path(leases_dir, ifname, family, method, "lease")
}

pub fn request_path(requests_dir: &Path, ifname: &str, family: AddrFamily, method: AddrconfMethod) -> PathBuf {
    slot_path(requests_dir, ifname, family, method, "req")
}

/// Write `contents` to `path` atomically: write to a sibling temp file, then
/// rename over the destination. A reader can never observe a partial file.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn persist_lease(
    leases_dir: &Path,
    ifname: &str,
    lease: &Lease,
) -> Result<(), Error> {
    let path = lease_path(leases_dir, ifname, lease.family, lease.method);
    write_atomic(&path, &lease.to_document().serialize()).map_err(Error::from)
}

pub fn remove_lease(leases_dir: &Path, ifname: &str, family: AddrFamily, method: AddrconfMethod) -> Result<(), Error> {
    let path = lease_path(leases_dir, ifname, family, method);
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read and validate a persisted lease. Returns `Ok(None)` both when the
/// file is absent and when it is malformed or partial -- callers treat both
/// as "nothing usable here", per the recovery algorithm's "parse fails or
/// file is partial: delete it and skip".
pub fn read_lease(path: &Path) -> Result<Option<Lease>, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let node = match Node::parse(&contents) {
        Some(n) => n,
        None => {
            let _ = fs::remove_file(path);
            return Ok(None);
        }
    };
    match Lease::from_document(&node) {
        Some(lease) => Ok(Some(lease)),
        None => {
            let _ = fs::remove_file(path);
            Ok(None)
        }
    }
}
