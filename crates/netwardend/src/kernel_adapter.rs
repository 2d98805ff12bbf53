//! Bridges the raw rtnetlink bindings in `netlink.rs` into the event-driven
//! world the reconciler expects.
//!
//! `netlink.rs` only exposes synchronous dump/request calls — no
//! `RTMGRP_LINK`/`RTMGRP_IPV4_IFADDR` multicast subscription exists in this
//! codebase. Grounded on `legacy_manager.rs`'s own pattern of calling
//! `discover_links`/`configure_links` by re-listing on demand rather than
//! subscribing to kernel notifications: `poll()` re-lists links and
//! addresses on every call and diffs against the previously observed
//! snapshot, synthesizing the same `KernelEvent`s a multicast listener would
//! have delivered. The apply-side helpers (`bring_up`, `set_mtu`,
//! `add_address`, `remove_address`, `add_route`) wrap the corresponding
//! `netlink` calls, translating `io::Result` into `crate::error::Error`.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::device::{DeviceAttrs, LinkFlags};
use crate::error::Error;
use crate::event::KernelEvent;
use crate::netlink::{self, AddrInfo, LinkInfo};

fn attrs_from_link(link: &LinkInfo, addresses: &[String]) -> DeviceAttrs {
    DeviceAttrs {
        name: link.name.clone(),
        kind: None,
        hwaddr: link.mac.clone(),
        mtu: link.mtu,
        flags: LinkFlags {
            device_up: true,
            link_up: link.is_up(),
            network_up: link.is_running(),
        },
        addresses: addresses.to_vec(),
        routes: Vec::new(),
    }
}

fn format_addr(addr: &AddrInfo) -> String {
    format!("{}/{}", addr.address, addr.prefix_len)
}

/// Polling diff engine: holds the last observed link/address snapshot and
/// emits the delta as `KernelEvent`s each time `poll()` runs.
pub struct KernelAdapter {
    links: HashMap<u32, LinkInfo>,
    addresses: HashMap<u32, Vec<AddrInfo>>,
}

impl KernelAdapter {
    pub fn new() -> Self {
        KernelAdapter {
            links: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    /// Re-lists links and addresses from the kernel and returns the set of
    /// events needed to bring a consumer's view from the previous snapshot
    /// to the current one. Loopback is skipped, matching `discover_links`.
    pub fn poll(&mut self) -> Result<Vec<KernelEvent>, Error> {
        let current_links = netlink::list_links()?;
        let current_addrs = netlink::list_addresses()?;

        let mut addrs_by_index: HashMap<u32, Vec<AddrInfo>> = HashMap::new();
        for addr in current_addrs {
            addrs_by_index.entry(addr.ifindex).or_default().push(addr);
        }

        let mut events = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for link in &current_links {
            if link.is_loopback() {
                continue;
            }
            seen.insert(link.index);
            let addrs = addrs_by_index.remove(&link.index).unwrap_or_default();
            let addr_strs: Vec<String> = addrs.iter().map(format_addr).collect();

            match self.links.get(&link.index) {
                None => {
                    events.push(KernelEvent::DeviceCreate(
                        link.index,
                        attrs_from_link(link, &addr_strs),
                    ));
                }
                Some(prev) => {
                    if prev.name != link.name {
                        events.push(KernelEvent::Rename(link.index, link.name.clone()));
                    }
                    if prev.mtu != link.mtu {
                        events.push(KernelEvent::MtuChange(link.index, link.mtu));
                    }
                    if !prev.is_running() && link.is_running() {
                        events.push(KernelEvent::LinkUp(link.index));
                    }
                    if prev.is_running() && !link.is_running() {
                        events.push(KernelEvent::LinkDown(link.index));
                    }

                    let prev_addrs: Vec<String> = self
                        .addresses
                        .get(&link.index)
                        .map(|a| a.iter().map(format_addr).collect())
                        .unwrap_or_default();
                    for added in addr_strs.iter().filter(|a| !prev_addrs.contains(a)) {
                        events.push(KernelEvent::AddressAdded(link.index, added.clone()));
                    }
                    for removed in prev_addrs.iter().filter(|a| !addr_strs.contains(a)) {
                        events.push(KernelEvent::AddressRemoved(link.index, removed.clone()));
                    }
                }
            }

            self.addresses.insert(link.index, addrs);
        }

        let gone: Vec<u32> = self
            .links
            .keys()
            .filter(|idx| !seen.contains(idx))
            .copied()
            .collect();
        for idx in gone {
            events.push(KernelEvent::DeviceDelete(idx));
            self.links.remove(&idx);
            self.addresses.remove(&idx);
        }

        self.links = current_links
            .into_iter()
            .filter(|l| !l.is_loopback())
            .map(|l| (l.index, l))
            .collect();

        Ok(events)
    }
}

impl Default for KernelAdapter {
    fn default() -> Self {
        KernelAdapter::new()
    }
}

/// Brings a link administratively up or down.
pub fn bring_up(ifindex: u32, up: bool) -> Result<(), Error> {
    netlink::set_link_up(ifindex, up).map_err(Error::from)
}

pub fn set_mtu(ifindex: u32, mtu: u32) -> Result<(), Error> {
    netlink::set_link_mtu(ifindex, mtu).map_err(Error::from)
}

pub fn add_address(
    ifindex: u32,
    address: Ipv4Addr,
    prefix_len: u8,
    broadcast: Option<Ipv4Addr>,
) -> Result<(), Error> {
    match netlink::add_address(ifindex, address, prefix_len, broadcast) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn remove_address(ifindex: u32, address: Ipv4Addr, prefix_len: u8) -> Result<(), Error> {
    netlink::del_address(ifindex, address, prefix_len).map_err(Error::from)
}

pub fn add_route(
    destination: Ipv4Addr,
    prefix_len: u8,
    gateway: Option<Ipv4Addr>,
    ifindex: u32,
    metric: Option<u32>,
) -> Result<(), Error> {
    match netlink::add_route(
        destination,
        prefix_len,
        gateway,
        ifindex,
        metric,
        netlink::rtprot_dhcp(),
    ) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn flush(ifindex: u32) -> Result<(), Error> {
    netlink::flush_addresses(ifindex)?;
    netlink::flush_routes(ifindex)?;
    Ok(())
}
