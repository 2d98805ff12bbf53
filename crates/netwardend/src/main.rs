//! netwardend — host-local network configuration daemon.
//!
//! Drives every network device on the host through a per-interface FSM
//! (`worker.rs`) under a single-threaded reconciler (`reconciler.rs`),
//! observing the kernel through a polling netlink adapter, negotiating
//! DHCPv4 leases directly, and exposing the inbound/outbound RPC surface
//! over `zbus`. Persists leases and policies under `Environment::root_dir`.
//!
//! Usage:
//!   netwardend                 # Run as daemon
//!   netwardend --help          # Show help

mod device;
mod dhcp;
mod document;
mod env;
mod error;
mod event;
mod kernel_adapter;
mod lease;
mod lease_recovery;
mod netlink;
mod policy;
mod reconciler;
mod rpc;
mod secret;
mod worker;

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use device::DeviceKind;
use dhcp::{ClientIdMode, DhcpClient, DhcpClientConfig, DhcpState};
use env::Environment;
use event::{Event, EventSource, EventSourceHandle, LeaseEvent};
use lease::{AddrFamily, AddrconfMethod, Lease};
use lease_recovery::RecoveryOutcome;
use policy::Policy;
use reconciler::Reconciler;
use secret::{Resolved, SecretGateway};
use worker::Stage;

/// Send an sd_notify message to the service manager, if any.
fn sd_notify(msg: &str) {
    if let Ok(path) = std::env::var("NOTIFY_SOCKET") {
        let path = if let Some(stripped) = path.strip_prefix('@') {
            format!("\0{}", stripped)
        } else {
            path
        };
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(msg.as_bytes(), &path);
        }
    }
}

/// Parse WATCHDOG_USEC from the environment and return the keepalive
/// interval (half the watchdog period).
fn watchdog_interval() -> Option<Duration> {
    let usec: u64 = std::env::var("WATCHDOG_USEC").ok()?.parse().ok()?;
    if usec == 0 {
        return None;
    }
    Some(Duration::from_micros(usec / 2))
}

fn setup_logging(env: &Environment) {
    let level = std::env::var("NETWARDEND_LOG_LEVEL")
        .ok()
        .and_then(|l| match l.to_lowercase().as_str() {
            "debug" | "7" => Some(log::LevelFilter::Debug),
            "info" | "6" => Some(log::LevelFilter::Info),
            "notice" | "5" | "warning" | "4" => Some(log::LevelFilter::Warn),
            "err" | "3" | "crit" | "2" | "alert" | "1" | "emerg" | "0" => Some(log::LevelFilter::Error),
            _ => None,
        })
        .unwrap_or(if env.debug_facilities.is_empty() { log::LevelFilter::Info } else { log::LevelFilter::Debug });

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][netwardend][{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .ok();
}

fn print_help() {
    eprintln!("netwardend — host-local network configuration daemon");
    eprintln!();
    eprintln!("Usage: netwardend [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>     Read additional configuration from <path>");
    eprintln!("  --root-dir <path>   Root directory for persisted leases/policies (default /)");
    eprintln!("  --debug <facility>  Enable debug logging for <facility> (repeatable)");
    eprintln!("  --foreground        Do not detach from the controlling terminal");
    eprintln!("  --no-recovery       Skip startup lease recovery");
    eprintln!("  --help, -h          Show this help message");
    eprintln!("  --version           Show version information");
}

fn print_version() {
    eprintln!("netwardend 0.1.0");
}

/// Opens a raw socket bound to a specific interface for DHCP client traffic.
fn open_dhcp_socket(ifname: &str) -> io::Result<i32> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            libc::IPPROTO_UDP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BROADCAST,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let ifname_c = std::ffi::CString::new(ifname)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid interface name"))?;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname_c.as_ptr() as *const libc::c_void,
            ifname_c.as_bytes_with_nul().len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = 68u16.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY;
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

fn send_dhcp_broadcast(fd: i32, pkt: &dhcp::DhcpPacket) -> io::Result<()> {
    let data = pkt.serialize();
    let mut dst: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    dst.sin_family = libc::AF_INET as libc::sa_family_t;
    dst.sin_port = 67u16.to_be();
    dst.sin_addr.s_addr = u32::from(Ipv4Addr::BROADCAST).to_be();

    let sent = unsafe {
        libc::sendto(
            fd,
            data.as_ptr() as *const libc::c_void,
            data.len(),
            0,
            &dst as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recv_dhcp_packet(fd: i32) -> Option<dhcp::DhcpPacket> {
    let mut buf = [0u8; 4096];
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), libc::MSG_DONTWAIT) };
    if n <= 0 {
        return None;
    }
    dhcp::DhcpPacket::parse(&buf[..n as usize]).ok()
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut out = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(out)
}

fn parse_cidr(s: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = s.split_once('/')?;
    Some((addr.parse().ok()?, prefix.parse().ok()?))
}

/// One live DHCPv4 negotiation. The socket is closed when the session is
/// dropped, whether that is an orderly release or the worker tearing down.
struct DhcpSession {
    client: DhcpClient,
    fd: i32,
}

impl Drop for DhcpSession {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn dhcp_lease_to_lease(lease: &dhcp::DhcpLease) -> Lease {
    let mut routes: Vec<String> = lease.routers.iter().map(|gw| format!("default via {gw}")).collect();
    for (dest, prefix, gw) in &lease.classless_routes {
        routes.push(format!("{dest}/{prefix} via {gw}"));
    }
    Lease {
        family: AddrFamily::Ipv4,
        method: AddrconfMethod::Dhcp4,
        addresses: vec![format!("{}/{}", lease.address, lease.prefix_len())],
        routes,
        dns: lease.dns_servers.iter().map(|d| d.to_string()).collect(),
        expiry: Some(lease::now_unix() + u64::from(lease.lease_time)),
    }
}

fn desired_method(policy: &Policy) -> AddrconfMethod {
    policy.config.attr("method").and_then(AddrconfMethod::parse).unwrap_or(AddrconfMethod::Dhcp4)
}

fn static_lease_from_policy(policy: &Policy) -> Lease {
    let addresses = policy.config.children_named("address").filter_map(|n| n.attr("value").map(str::to_string)).collect();
    let routes = policy.config.children_named("route").filter_map(|n| n.attr("value").map(str::to_string)).collect();
    let dns = policy.config.children_named("dns").filter_map(|n| n.attr("value").map(str::to_string)).collect();
    Lease {
        family: AddrFamily::Ipv4,
        method: AddrconfMethod::Static,
        addresses,
        routes,
        dns,
        expiry: None,
    }
}

fn load_policies(dir: &Path) -> Vec<Policy> {
    let mut policies = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return policies,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("policy") {
            continue;
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if let Some(node) = document::Node::parse(&contents) {
            if let Some(policy) = rpc::parse_policy_document(&node) {
                policies.push(policy);
            }
        }
    }
    policies
}

/// Startup recovery: for every persisted lease slot whose device already
/// exists in the inventory, replay it as a synthetic `lease-acquired` event
/// (§4.6, steps 5-6). Slots whose device hasn't appeared yet are left on
/// disk for a future cycle.
fn recover_leases(env: &Environment, reconciler: &Reconciler, events: &EventSourceHandle) {
    let leases_dir = env.leases_dir();
    let entries = match std::fs::read_dir(&leases_dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy().into_owned();
        let trimmed = match name.strip_suffix(".lease") {
            Some(t) => t,
            None => continue,
        };
        let parts: Vec<&str> = trimmed.splitn(3, '.').collect();
        let (ifname, family_str, method_str) = match parts.as_slice() {
            [a, b, c] => (*a, *b, *c),
            _ => continue,
        };
        let family = match AddrFamily::parse(family_str) {
            Some(f) => f,
            None => continue,
        };
        let method = match AddrconfMethod::parse(method_str) {
            Some(m) => m,
            None => continue,
        };
        let index = match reconciler.inventory.lookup_by_name(ifname) {
            Some(r) => r.handle.index,
            None => continue,
        };
        match lease_recovery::recover_slot(&leases_dir, &env.requests_dir(), ifname, family, method, lease::now_unix()) {
            Ok(RecoveryOutcome::Resumed(lease, request)) => {
                let _ = lease_recovery::persist_request(&env.requests_dir(), &request);
                events.send(Event::Lease(LeaseEvent::Acquired(index, family, method, lease)));
            }
            Ok(_) => {}
            Err(e) => log::warn!("{ifname}: lease recovery failed: {e}"),
        }
    }
}

/// A point-in-time, owned view of one worker plus the device/policy data the
/// main loop's side-effect passes need, gathered in one read so later passes
/// never hold a borrow of `Reconciler` across a mutating call.
struct WorkerSnapshot {
    index: u32,
    stage: Stage,
    target: Stage,
    kind: DeviceKind,
    device_name: String,
    hwaddr: String,
    method: AddrconfMethod,
    selected_policy: Option<policy::PolicyId>,
}

fn snapshot_workers(reconciler: &Reconciler) -> Vec<WorkerSnapshot> {
    reconciler
        .workers
        .values()
        .filter_map(|w| {
            let record = reconciler.inventory.lookup_by_index(w.device.index)?;
            let method = w
                .selected_policy
                .as_ref()
                .and_then(|id| reconciler.policies.get(id))
                .map(desired_method)
                .unwrap_or(AddrconfMethod::Dhcp4);
            Some(WorkerSnapshot {
                index: w.device.index,
                stage: w.stage(),
                target: w.target,
                kind: record.kind(),
                device_name: record.attrs.name.clone(),
                hwaddr: record.attrs.hwaddr.clone(),
                method,
                selected_policy: w.selected_policy.clone(),
            })
        })
        .collect()
}

/// Resolves (or re-checks) deferred PSKs for wifi/modem workers targeting
/// `LINK_AUTHENTICATED` or beyond, gating `reconciler`'s secret-pending set.
fn apply_secrets(snapshots: &[WorkerSnapshot], reconciler: &mut Reconciler, gateway: &mut SecretGateway) {
    for w in snapshots {
        if !w.kind.requires_authentication() || w.target < Stage::LinkAuthenticated {
            reconciler.mark_secret_pending(w.index, false);
            continue;
        }
        let psk_path = w
            .selected_policy
            .as_ref()
            .and_then(|id| reconciler.policies.get(id))
            .and_then(|p| p.config.attr("psk-path"))
            .unwrap_or("/wireless/psk")
            .to_string();
        let security_id = format!("wifi:{}", w.device_name);
        let pending = matches!(gateway.resolve(&security_id, &psk_path), Resolved::Pending);
        reconciler.mark_secret_pending(w.index, pending);
    }
}

/// Brings devices administratively up once their worker reaches
/// `DEVICE_READY` or beyond. Idempotent via `brought_up`.
fn apply_kernel_side_effects(snapshots: &[WorkerSnapshot], brought_up: &mut HashSet<u32>) {
    let live: HashSet<u32> = snapshots.iter().map(|w| w.index).collect();
    brought_up.retain(|idx| live.contains(idx));
    for w in snapshots {
        if w.stage >= Stage::DeviceReady && brought_up.insert(w.index) {
            if let Err(e) = kernel_adapter::bring_up(w.index, true) {
                log::warn!("{}: failed to bring up link: {e}", w.device_name);
            }
        }
    }
}

fn start_dhcp_session(w: &WorkerSnapshot, dhcp_sessions: &mut HashMap<u32, DhcpSession>) {
    let mac = match parse_mac(&w.hwaddr) {
        Some(m) => m,
        None => {
            log::warn!("{}: no usable hardware address for DHCP", w.device_name);
            return;
        }
    };
    let fd = match open_dhcp_socket(&w.device_name) {
        Ok(fd) => fd,
        Err(e) => {
            log::warn!("{}: failed to open DHCP socket: {e}", w.device_name);
            return;
        }
    };
    let config = DhcpClientConfig {
        ifindex: w.index,
        ifname: w.device_name.clone(),
        mac,
        client_identifier: ClientIdMode::Mac,
        ..DhcpClientConfig::default()
    };
    let mut client = DhcpClient::new(config);
    if let Some(pkt) = client.next_packet() {
        log::info!("{}: sending DHCPDISCOVER (xid={:#010x})", w.device_name, client.xid);
        if let Err(e) = send_dhcp_broadcast(fd, &pkt) {
            log::warn!("{}: failed to send DISCOVER: {e}", w.device_name);
        }
    }
    dhcp_sessions.insert(w.index, DhcpSession { client, fd });
}

/// Starts/stops per-device addressing (DHCP negotiation or a static lease)
/// as workers cross `NETWORK_ADDRESS_ACQUIRING`, and installs the resulting
/// lease's addresses/routes into the kernel once a worker reaches
/// `NETWORK_UP`.
fn apply_addressing(
    env: &Environment,
    snapshots: &[WorkerSnapshot],
    reconciler: &Reconciler,
    events: &EventSourceHandle,
    dhcp_sessions: &mut HashMap<u32, DhcpSession>,
    installed: &mut HashSet<u32>,
) {
    let live: HashSet<u32> = snapshots.iter().map(|w| w.index).collect();
    installed.retain(|idx| live.contains(idx));
    dhcp_sessions.retain(|idx, _| live.contains(idx));

    for w in snapshots {
        if w.stage == Stage::NetworkAddressAcquiring && !dhcp_sessions.contains_key(&w.index) {
            match w.method {
                AddrconfMethod::Dhcp4 => start_dhcp_session(w, dhcp_sessions),
                AddrconfMethod::Static => {
                    if let Some(policy) = w.selected_policy.as_ref().and_then(|id| reconciler.policies.get(id)) {
                        let lease = static_lease_from_policy(policy);
                        let _ = lease::persist_lease(&env.leases_dir(), &w.device_name, &lease);
                        events.send(Event::Lease(LeaseEvent::Acquired(w.index, lease.family, lease.method, lease)));
                    }
                }
                _ => {}
            }
        }

        if w.stage < Stage::NetworkAddressAcquiring {
            if let Some(session) = dhcp_sessions.remove(&w.index) {
                if let Some(release) = session.client.build_release() {
                    let _ = send_dhcp_broadcast(session.fd, &release);
                }
            }
            // Withdraw whatever lease(s) this device actually holds, not a
            // hardcoded DHCPv4 family/method — a statically-addressed device
            // or an IPv6 lease must be removed too (S3: policy swap withdraws
            // the stale address regardless of which method produced it).
            if let Some(record) = reconciler.inventory.lookup_by_index(w.index) {
                if !record.leases.is_empty() {
                    for lease in &record.leases {
                        let _ = lease::remove_lease(&env.leases_dir(), &w.device_name, lease.family, lease.method);
                        events.send(Event::Lease(LeaseEvent::Lost(
                            w.index,
                            lease.family,
                            lease.method,
                            "policy demoted".to_string(),
                        )));
                    }
                    let _ = kernel_adapter::flush(w.index);
                }
            }
        }

        if w.stage < Stage::NetworkUp {
            installed.remove(&w.index);
        } else if installed.insert(w.index) {
            if let Some(record) = reconciler.inventory.lookup_by_index(w.index) {
                apply_installed_leases(record);
            }
        }
    }
}

fn apply_installed_leases(record: &device::DeviceRecord) {
    for lease in &record.leases {
        if lease.family != AddrFamily::Ipv4 {
            continue;
        }
        for addr in &lease.addresses {
            if let Some((ip, prefix)) = parse_cidr(addr) {
                if let Err(e) = kernel_adapter::add_address(record.handle.index, ip, prefix, None) {
                    log::warn!("{}: failed to add address {addr}: {e}", record.attrs.name);
                }
            }
        }
        for route in &lease.routes {
            if let Some(rest) = route.strip_prefix("default via ") {
                if let Ok(gw) = rest.parse::<Ipv4Addr>() {
                    let _ = kernel_adapter::add_route(Ipv4Addr::UNSPECIFIED, 0, Some(gw), record.handle.index, None);
                }
            } else if let Some((cidr, gw)) = route.split_once(" via ") {
                if let (Some((dest, prefix)), Ok(gw)) = (parse_cidr(cidr), gw.parse::<Ipv4Addr>()) {
                    let _ = kernel_adapter::add_route(dest, prefix, Some(gw), record.handle.index, None);
                }
            }
        }
    }
}

fn poll_dhcp_sessions(env: &Environment, events: &EventSourceHandle, dhcp_sessions: &mut HashMap<u32, DhcpSession>) {
    for (&index, session) in dhcp_sessions.iter_mut() {
        while let Some(reply) = recv_dhcp_packet(session.fd) {
            if let Some(lease) = session.client.process_reply(&reply) {
                let lease = dhcp_lease_to_lease(&lease);
                let _ = lease::persist_lease(&env.leases_dir(), &session.client.config.ifname, &lease);
                events.send(Event::Lease(LeaseEvent::Acquired(index, lease.family, lease.method, lease)));
                continue;
            }
            if session.client.state == DhcpState::Requesting {
                if let Some(pkt) = session.client.next_packet() {
                    let _ = send_dhcp_broadcast(session.fd, &pkt);
                }
            }
        }

        let should_retransmit = session
            .client
            .last_send
            .map(|t| t.elapsed() >= session.client.retransmit_timeout())
            .unwrap_or(true);
        if should_retransmit && !session.client.max_attempts_reached() && session.client.state != DhcpState::Bound {
            if let Some(pkt) = session.client.next_packet() {
                let _ = send_dhcp_broadcast(session.fd, &pkt);
            }
        }

        if session.client.state == DhcpState::Bound {
            if let Some(lease) = session.client.lease.clone() {
                if lease.is_expired() {
                    events.send(Event::Lease(LeaseEvent::Lost(
                        index,
                        AddrFamily::Ipv4,
                        AddrconfMethod::Dhcp4,
                        "expired".into(),
                    )));
                    let _ = lease::remove_lease(&env.leases_dir(), &session.client.config.ifname, AddrFamily::Ipv4, AddrconfMethod::Dhcp4);
                } else if lease.needs_renewal() {
                    if let Some(pkt) = session.client.next_packet() {
                        let _ = send_dhcp_broadcast(session.fd, &pkt);
                    }
                }
            }
        }
    }
}

/// Fails parked workers whose deadline has passed; `Worker::tick` only acts
/// on an explicit `WorkerEvent::DeadlineExpired`, so the driving loop is
/// responsible for noticing the deadline and injecting it.
fn check_deadlines(reconciler: &mut Reconciler, events: &EventSourceHandle, now: Instant) {
    let mut expired_ifup = Vec::new();
    for (index, worker) in &reconciler.workers {
        if worker.parked.is_some() && worker.deadline.map(|d| now >= d).unwrap_or(false) {
            events.send(Event::DeadlineExpired(*index));
        }
        if worker.stage() < Stage::NetworkUp && worker.ifup_deadline.map(|d| now >= d).unwrap_or(false) {
            expired_ifup.push(*index);
        }
    }
    for index in expired_ifup {
        if let Some(worker) = reconciler.workers.get_mut(&index) {
            worker.ifup_deadline = None;
        }
        events.send(Event::DeadlineExpired(index));
    }
}

fn establish_rpc_connection(snapshot: rpc::SharedSnapshot, events: EventSourceHandle) -> zbus::Result<zbus::blocking::Connection> {
    let manager = rpc::ManagerIface { snapshot, events };
    zbus::blocking::connection::Builder::system()?
        .name(rpc::BUS_NAME)?
        .serve_at(rpc::MANAGER_PATH, manager)?
        .build()
}

/// Republishes the RPC snapshot and registers/unregisters per-device and
/// per-policy objects to match the reconciler's current state.
fn publish_rpc_state(
    connection: Option<&zbus::blocking::Connection>,
    reconciler: &Reconciler,
    snapshot: &rpc::SharedSnapshot,
    registered_devices: &mut HashSet<u32>,
    registered_policies: &mut HashSet<String>,
) {
    let fresh = rpc::build_snapshot(reconciler);
    let live_devices: HashSet<u32> = fresh.devices.iter().map(|d| d.index).collect();
    let live_policies: HashSet<String> = fresh.policies.iter().map(|p| p.id.0.clone()).collect();

    if let Some(connection) = connection {
        let object_server = connection.object_server();

        for device in &fresh.devices {
            if registered_devices.insert(device.index) {
                let iface = rpc::DeviceIface { index: device.index, snapshot: snapshot.clone() };
                if let Err(e) = object_server.at(rpc::device_path(device.index), iface) {
                    log::warn!("{}: failed to publish device object: {e}", device.name);
                }
            }
        }
        registered_devices.retain(|idx| {
            if live_devices.contains(idx) {
                true
            } else {
                let _ = object_server.remove::<rpc::DeviceIface, _>(rpc::device_path(*idx));
                false
            }
        });

        for policy in &fresh.policies {
            if registered_policies.insert(policy.id.0.clone()) {
                let iface = rpc::PolicyIface { id: policy.id.clone(), snapshot: snapshot.clone() };
                if let Err(e) = object_server.at(rpc::policy_path(&policy.id.0), iface) {
                    log::warn!("{}: failed to publish policy object: {e}", policy.id.0);
                }
            }
        }
        registered_policies.retain(|id| {
            if live_policies.contains(id) {
                true
            } else {
                let _ = object_server.remove::<rpc::PolicyIface, _>(rpc::policy_path(id));
                false
            }
        });
    }

    *snapshot.lock().unwrap() = fresh;
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    for arg in &args[1..] {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return;
            }
            "--version" => {
                print_version();
                return;
            }
            _ => {}
        }
    }

    let env = match Environment::from_args_and_env(&args) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("netwardend: {e}");
            std::process::exit(2);
        }
    };

    setup_logging(&env);
    log::info!("netwardend starting (root-dir={})", env.root_dir.display());

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown)).ok();
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown)).ok();
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&reload)).ok();

    let mut reconciler = Reconciler::new();
    let (handle, mut events) = EventSource::new();
    let mut kernel_adapter = kernel_adapter::KernelAdapter::new();
    let mut secret_gateway = SecretGateway::with_event_sink(handle.clone());

    for policy in load_policies(&env.policies_dir()) {
        reconciler.policies.insert(policy);
    }

    match kernel_adapter.poll() {
        Ok(initial) => {
            for e in initial {
                handle.send(Event::Kernel(e));
            }
        }
        Err(e) => log::warn!("initial link discovery failed: {e}"),
    }
    reconciler.tick(&mut events, Instant::now());

    if env.recover_leases {
        recover_leases(&env, &reconciler, &handle);
        reconciler.tick(&mut events, Instant::now());
    }

    let snapshot: rpc::SharedSnapshot = Arc::new(Mutex::new(rpc::build_snapshot(&reconciler)));
    let connection = match establish_rpc_connection(snapshot.clone(), handle.clone()) {
        Ok(c) => Some(c),
        Err(e) => {
            log::warn!("failed to establish RPC bus connection, RPC surface disabled: {e}");
            None
        }
    };

    let mut registered_devices: HashSet<u32> = HashSet::new();
    let mut registered_policies: HashSet<String> = HashSet::new();
    let mut dhcp_sessions: HashMap<u32, DhcpSession> = HashMap::new();
    let mut brought_up: HashSet<u32> = HashSet::new();
    let mut installed: HashSet<u32> = HashSet::new();

    sd_notify("READY=1\nSTATUS=Managing network interfaces");
    log::info!("netwardend ready");

    let poll_interval = Duration::from_millis(500);
    let watchdog = watchdog_interval();
    let mut last_watchdog = Instant::now();
    let mut last_kernel_poll = Instant::now() - poll_interval;

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();

        if reload.swap(false, Ordering::Relaxed) {
            log::info!("reloading policies (SIGHUP)");
            for policy in load_policies(&env.policies_dir()) {
                reconciler.policies.insert(policy);
            }
        }

        if last_kernel_poll.elapsed() >= poll_interval {
            match kernel_adapter.poll() {
                Ok(kevents) => {
                    for e in kevents {
                        handle.send(Event::Kernel(e));
                    }
                }
                Err(e) => log::warn!("link poll failed: {e}"),
            }
            last_kernel_poll = now;
        }

        let deadline = reconciler.tick(&mut events, now);

        let snapshots = snapshot_workers(&reconciler);
        apply_secrets(&snapshots, &mut reconciler, &mut secret_gateway);
        apply_kernel_side_effects(&snapshots, &mut brought_up);
        apply_addressing(&env, &snapshots, &reconciler, &handle, &mut dhcp_sessions, &mut installed);
        poll_dhcp_sessions(&env, &handle, &mut dhcp_sessions);
        publish_rpc_state(connection.as_ref(), &reconciler, &snapshot, &mut registered_devices, &mut registered_policies);
        check_deadlines(&mut reconciler, &handle, now);

        if let Some(interval) = watchdog {
            if last_watchdog.elapsed() >= interval {
                sd_notify("WATCHDOG=1");
                last_watchdog = Instant::now();
            }
        }

        Reconciler::sleep_until(&mut events, deadline, now);
    }

    log::info!("netwardend shutting down");
    sd_notify("STOPPING=1\nSTATUS=Shutting down");

    for (_, session) in dhcp_sessions.drain() {
        if let Some(release) = session.client.build_release() {
            let _ = send_dhcp_broadcast(session.fd, &release);
        }
    }

    log::info!("netwardend stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sd_notify_without_socket_does_not_panic() {
        unsafe { std::env::remove_var("NOTIFY_SOCKET") };
        sd_notify("READY=1");
    }

    #[test]
    fn watchdog_interval_absent_is_none() {
        unsafe { std::env::remove_var("WATCHDOG_USEC") };
        assert!(watchdog_interval().is_none());
    }

    #[test]
    fn watchdog_interval_halves_the_period() {
        unsafe { std::env::set_var("WATCHDOG_USEC", "10000000") };
        assert_eq!(watchdog_interval(), Some(Duration::from_secs(5)));
        unsafe { std::env::remove_var("WATCHDOG_USEC") };
    }

    #[test]
    fn parse_mac_accepts_colon_hex() {
        assert_eq!(parse_mac("52:54:00:00:00:01"), Some([0x52, 0x54, 0x00, 0x00, 0x00, 0x01]));
        assert_eq!(parse_mac("not-a-mac"), None);
    }

    #[test]
    fn parse_cidr_splits_address_and_prefix() {
        assert_eq!(parse_cidr("10.0.0.2/24"), Some(("10.0.0.2".parse().unwrap(), 24)));
        assert_eq!(parse_cidr("garbage"), None);
    }

    #[test]
    fn desired_method_reads_policy_config_attr() {
        let policy = Policy {
            id: policy::PolicyId("p".into()),
            priority: 0,
            matcher: policy::Match { kind: None, name_glob: None, hwaddr_glob: None, carrier_up: None },
            config: document::Node::new("config").with_attr("method", "static"),
        };
        assert_eq!(desired_method(&policy), AddrconfMethod::Static);
    }

    #[test]
    fn static_lease_from_policy_collects_addresses_and_routes() {
        let policy = Policy {
            id: policy::PolicyId("p".into()),
            priority: 0,
            matcher: policy::Match { kind: None, name_glob: None, hwaddr_glob: None, carrier_up: None },
            config: document::Node::new("config")
                .with_child(document::Node::new("address").with_attr("value", "10.0.0.5/24"))
                .with_child(document::Node::new("route").with_attr("value", "default via 10.0.0.1")),
        };
        let lease = static_lease_from_policy(&policy);
        assert_eq!(lease.addresses, vec!["10.0.0.5/24".to_string()]);
        assert_eq!(lease.routes, vec!["default via 10.0.0.1".to_string()]);
        assert_eq!(lease.method, AddrconfMethod::Static);
    }

    #[test]
    fn load_policies_skips_non_policy_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        assert!(load_policies(dir.path()).is_empty());
    }

    #[test]
    fn load_policies_reads_valid_policy_documents() {
        let dir = tempfile::tempdir().unwrap();
        let policy = Policy {
            id: policy::PolicyId("dhcp".into()),
            priority: 5,
            matcher: policy::Match { kind: Some(DeviceKind::Ethernet), name_glob: Some("eth*".into()), hwaddr_glob: None, carrier_up: None },
            config: document::Node::new("config").with_attr("method", "dhcp"),
        };
        std::fs::write(dir.path().join("dhcp.policy"), policy.to_document().serialize()).unwrap();
        let loaded = load_policies(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id.0, "dhcp");
    }
}
