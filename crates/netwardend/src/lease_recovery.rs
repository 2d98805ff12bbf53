//! Startup lease recovery: rereads persisted leases and reattaches
//! address-configuration state without disrupting already-installed
//! addresses.
//!
//! Grounded almost directly on `wickedd.c`'s `wicked_discover_state` /
//! `wicked_try_restart_addrconf`: for each device and addrconf slot, read
//! the lease, discard if invalid or stale, recover the original request,
//! and resubmit -- only emitting the synthetic `lease-acquired` once the
//! engine confirms ownership.

use std::path::Path;

use crate::document::Node;
use crate::error::Error;
use crate::lease::{self, AddrFamily, AddrconfMethod, Lease};

/// The persisted original acquisition request, recovered alongside its
/// lease so renegotiation can resume with the same parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub ifname: String,
    pub family: AddrFamily,
    pub method: AddrconfMethod,
    /// Free-form negotiation parameters (e.g. DUID, requested address hint).
    pub params: Vec<(String, String)>,
    pub resume_from_existing_lease: bool,
}

impl LeaseRequest {
    pub fn to_document(&self) -> Node {
        let mut node = Node::new("request")
            .with_attr("family", self.family.as_str())
            .with_attr("method", self.method.as_str())
            .with_attr("resume", self.resume_from_existing_lease.to_string());
        for (k, v) in &self.params {
            node = node.with_child(Node::new("param").with_attr("key", k).with_attr("value", v));
        }
        node
    }

    pub fn from_document(ifname: &str, node: &Node) -> Option<LeaseRequest> {
        let family = AddrFamily::parse(node.attr("family")?)?;
        let method = AddrconfMethod::parse(node.attr("method")?)?;
        let resume = node.attr("resume").map(|s| s == "true").unwrap_or(false);
        let params = node
            .children_named("param")
            .filter_map(|c| Some((c.attr("key")?.to_string(), c.attr("value")?.to_string())))
            .collect();
        Some(LeaseRequest {
            ifname: ifname.to_string(),
            family,
            method,
            params,
            resume_from_existing_lease: resume,
        })
    }
}

pub fn persist_request(requests_dir: &Path, req: &LeaseRequest) -> Result<(), Error> {
    let path = lease::request_path(requests_dir, &req.ifname, req.family, req.method);
    lease::write_atomic(&path, &req.to_document().serialize()).map_err(Error::from)
}

pub fn read_request(path: &Path, ifname: &str) -> Result<Option<LeaseRequest>, Error> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let node = match Node::parse(&contents) {
        Some(n) => n,
        None => return Ok(None),
    };
    Ok(LeaseRequest::from_document(ifname, &node))
}

/// Outcome of attempting recovery for one (device, family, method) slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No lease file present for this slot.
    NoLease,
    /// Lease file was absent a matching request; recovery skipped.
    MissingRequest,
    /// Lease present and valid, request recovered, ready for resubmission.
    Resumed(Lease, LeaseRequest),
}

/// Steps 1-4 of the recovery algorithm (§4.6): the actual resubmission to
/// an address-configuration engine (step 5) and the synthetic event (step
/// 6) are the caller's responsibility, since they require a live engine
/// connection this module does not own.
pub fn recover_slot(
    leases_dir: &Path,
    requests_dir: &Path,
    ifname: &str,
    family: AddrFamily,
    method: AddrconfMethod,
    now: u64,
) -> Result<RecoveryOutcome, Error> {
    let lease_path = lease::lease_path(leases_dir, ifname, family, method);
    let lease = match lease::read_lease(&lease_path)? {
        Some(lease) => lease,
        None => return Ok(RecoveryOutcome::NoLease),
    };

    if !lease.is_valid(now) {
        let _ = lease::remove_lease(leases_dir, ifname, family, method);
        return Ok(RecoveryOutcome::NoLease);
    }

    let request_path = lease::request_path(requests_dir, ifname, family, method);
    let mut request = match read_request(&request_path, ifname)? {
        Some(request) => request,
        None => return Ok(RecoveryOutcome::MissingRequest),
    };
    request.resume_from_existing_lease = true;

    Ok(RecoveryOutcome::Resumed(lease, request))
}
