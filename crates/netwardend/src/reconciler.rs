//! The reconciler: the single-threaded driver that selects applicable
//! policies per device, enqueues rechecks, and runs worker FSM ticks.
//!
//! Grounded on `nanny/main.c`'s `interface_manager` main loop: the
//! policy-changed check, the recheck-queue drain, the down-queue drain, and
//! `ni_fsm_do`/timeout wait all correspond directly. Unlike the donor, the
//! down queue here actually invokes `teardown` (resolved Open Question).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::device::{DeviceHandle, DeviceInventory};
use crate::event::{Event, EventSource, KernelEvent, LeaseEvent, RpcSignal, SequencedEvent};
use crate::policy::{Match, Policy, PolicyId, PolicyStore};
use crate::worker::{Stage, Worker, WorkerEvent};

pub struct Reconciler {
    pub inventory: DeviceInventory,
    pub policies: PolicyStore,
    pub workers: HashMap<u32, Worker>,
    recheck: VecDeque<u32>,
    recheck_set: std::collections::HashSet<u32>,
    down: VecDeque<u32>,
    down_set: std::collections::HashSet<u32>,
    last_seen_policy_revision: u64,
    /// Indices currently blocked on a secret the prompt gateway hasn't
    /// resolved yet (§4.7). Only consulted for `LINK_AUTHENTICATED`-gated
    /// kinds; sticky until `mark_secret_ready` clears it.
    secret_pending: std::collections::HashSet<u32>,
}

impl Reconciler {
    pub fn new() -> Self {
        Reconciler {
            inventory: DeviceInventory::new(),
            policies: PolicyStore::new(),
            workers: HashMap::new(),
            recheck: VecDeque::new(),
            recheck_set: std::collections::HashSet::new(),
            down: VecDeque::new(),
            down_set: std::collections::HashSet::new(),
            last_seen_policy_revision: 0,
            secret_pending: std::collections::HashSet::new(),
        }
    }

    /// Marks a worker as blocked on a deferred secret (or clears the block).
    /// Driven by the caller's `SecretGateway::resolve` outcome before `tick`.
    pub fn mark_secret_pending(&mut self, index: u32, pending: bool) {
        if pending {
            self.secret_pending.insert(index);
        } else {
            self.secret_pending.remove(&index);
        }
    }

    pub fn is_secret_pending(&self, index: u32) -> bool {
        self.secret_pending.contains(&index)
    }

    /// Coalescing enqueue: a worker already pending a recheck is not
    /// duplicated.
    pub fn schedule_recheck(&mut self, index: u32) {
        if self.recheck_set.insert(index) {
            self.recheck.push_back(index);
        }
    }

    pub fn schedule_down(&mut self, index: u32) {
        if self.down_set.insert(index) {
            self.down.push_back(index);
        }
    }

    fn apply_kernel_event(&mut self, event: KernelEvent) {
        match event {
            KernelEvent::DeviceCreate(index, attrs) => {
                let kind = attrs.kind.unwrap_or(crate::device::DeviceKind::Ethernet);
                let (handle, _, _) = self.inventory.observe(index, attrs);
                self.workers
                    .entry(index)
                    .or_insert_with(|| Worker::new(handle, kind));
                self.schedule_recheck(index);
            }
            KernelEvent::DeviceDelete(index) => {
                let _ = self.inventory.forget(index);
                // Always teardown on delete (resolved Open Question).
                self.schedule_down(index);
            }
            KernelEvent::LinkUp(index) => {
                if let Some(w) = self.workers.get_mut(&index) {
                    w.on_event(WorkerEvent::LinkUp);
                }
                self.schedule_recheck(index);
            }
            KernelEvent::LinkDown(index) => {
                if let Some(w) = self.workers.get_mut(&index) {
                    w.on_event(WorkerEvent::LinkDown);
                }
            }
            KernelEvent::AddressAdded(_, _)
            | KernelEvent::AddressRemoved(_, _)
            | KernelEvent::MtuChange(_, _)
            | KernelEvent::Rename(_, _) => {}
        }
    }

    fn apply_lease_event(&mut self, event: LeaseEvent) {
        match event {
            LeaseEvent::Acquired(index, family, method, lease) => {
                if let Some(record) = self.inventory.lookup_by_index_mut(index) {
                    record.leases.retain(|l| !(l.family == family && l.method == method));
                    record.leases.push(lease);
                }
                if let Some(w) = self.workers.get_mut(&index) {
                    w.on_event(WorkerEvent::LeaseAcquired);
                }
            }
            LeaseEvent::Lost(index, family, method, _reason) => {
                if let Some(record) = self.inventory.lookup_by_index_mut(index) {
                    record.leases.retain(|l| !(l.family == family && l.method == method));
                }
                if let Some(w) = self.workers.get_mut(&index) {
                    w.on_event(WorkerEvent::LeaseLost);
                }
            }
            LeaseEvent::Renewed(index, family, method, lease) => {
                if let Some(record) = self.inventory.lookup_by_index_mut(index) {
                    record.leases.retain(|l| !(l.family == family && l.method == method));
                    record.leases.push(lease);
                }
            }
        }
    }

    fn apply_rpc_signal(&mut self, event: RpcSignal) {
        match event {
            RpcSignal::PolicyAdded(p) | RpcSignal::PolicyChanged(p) => self.policies.insert(p),
            RpcSignal::PolicyRemoved(id) => {
                let _ = self.policies.remove(&id);
            }
            RpcSignal::IfUp(name, config, deadline_secs) => {
                if let Some(index) = self.index_by_name(&name) {
                    // An ad-hoc config wins over any matching policy
                    // (priority i64::MAX) and is keyed on the device name,
                    // so a repeated ifup with the identical config resolves
                    // to the same PolicyId and is a no-op per S8#5.
                    if let Some(config) = config {
                        self.policies.insert(Policy {
                            id: Self::ifup_policy_id(&name),
                            priority: i64::MAX,
                            matcher: Match {
                                kind: None,
                                name_glob: Some(name.clone()),
                                hwaddr_glob: None,
                                carrier_up: None,
                            },
                            config,
                        });
                    }
                    if let Some(w) = self.workers.get_mut(&index) {
                        w.target(Stage::NetworkUp);
                        w.ifup_deadline = if deadline_secs > 0 {
                            Some(Instant::now() + Duration::from_secs(deadline_secs as u64))
                        } else {
                            None
                        };
                    }
                    self.schedule_recheck(index);
                }
            }
            RpcSignal::IfDown(name, delete) => {
                if let Some(index) = self.index_by_name(&name) {
                    let _ = self.policies.remove(&Self::ifup_policy_id(&name));
                    if delete {
                        self.schedule_down(index);
                    } else if let Some(w) = self.workers.get_mut(&index) {
                        w.target(Stage::DeviceReady);
                        self.schedule_recheck(index);
                    }
                }
            }
            RpcSignal::PromptResponse(_, _, _) => {
                // secret storage is handled by the caller wiring the gateway;
                // the reconciler only needs to recheck parked workers, which
                // happens via the generic DeadlineExpired/event delivery path.
            }
        }
    }

    fn index_by_name(&self, name: &str) -> Option<u32> {
        self.inventory.lookup_by_name(name).map(|r| r.handle.index)
    }

    fn ifup_policy_id(name: &str) -> PolicyId {
        PolicyId(format!("ifup:{name}"))
    }

    fn deliver(&mut self, sequenced: SequencedEvent) {
        match sequenced.event {
            Event::Kernel(e) => self.apply_kernel_event(e),
            Event::Lease(e) => self.apply_lease_event(e),
            Event::Rpc(e) => self.apply_rpc_signal(e),
            Event::DeadlineExpired(index) => {
                if let Some(w) = self.workers.get_mut(&index) {
                    w.on_event(WorkerEvent::DeadlineExpired);
                }
                self.schedule_recheck(index);
            }
        }
    }

    /// One reconciler tick (§4.5, steps 1-5). Step 6 (sleeping on the event
    /// source) is the caller's loop, driven by the returned deadline.
    pub fn tick(&mut self, events: &mut EventSource, now: Instant) -> Option<Instant> {
        // Step 1: policy revision advanced -> recheck every user-controlled worker.
        let revision = self.policies.revision();
        if revision != self.last_seen_policy_revision {
            self.last_seen_policy_revision = revision;
            let indices: Vec<u32> = self.workers.keys().copied().collect();
            for index in indices {
                self.schedule_recheck(index);
            }
        }

        // Step 4 (events): deliver anything queued before re-evaluating policy.
        for sequenced in events.drain() {
            self.deliver(sequenced);
        }

        // Step 2: drain recheck queue.
        while let Some(index) = self.recheck.pop_front() {
            self.recheck_set.remove(&index);
            self.recheck_one(index);
        }

        // Step 3: drain down queue, invoking teardown (resolved Open Question).
        while let Some(index) = self.down.pop_front() {
            self.down_set.remove(&index);
            if let Some(w) = self.workers.get_mut(&index) {
                w.teardown();
            }
        }

        // Step 5: tick every worker, collecting the earliest wakeup.
        let mut earliest: Option<Instant> = None;
        let device_ready_by_index: HashMap<u32, bool> = self
            .workers
            .keys()
            .map(|idx| (*idx, self.inventory.lookup_by_index(*idx).is_some()))
            .collect();
        for (index, worker) in self.workers.iter_mut() {
            let mut device_ready = device_ready_by_index.get(index).copied().unwrap_or(false);
            if device_ready && self.secret_pending.contains(index) && worker.stage() == Stage::LinkAuthenticated {
                device_ready = false;
            }
            if let Some(deadline) = worker.tick(now, device_ready) {
                earliest = Some(match earliest {
                    Some(e) if e < deadline => e,
                    _ => deadline,
                });
            }
        }

        earliest
    }

    fn recheck_one(&mut self, index: u32) {
        let device = match self.inventory.lookup_by_index(index) {
            Some(d) => d.clone(),
            None => return,
        };
        let selected = self.policies.select(&device).map(|p| p.id.clone());
        if let Some(worker) = self.workers.get_mut(&index) {
            if worker.selected_policy != selected {
                // A selected policy swapped for a *different* policy (not just
                // acquired/lost) can change the resolved method (static <->
                // DHCP, different address pool, ...) even though both ends
                // target NETWORK_UP. Force a pass through
                // NETWORK_ADDRESS_ACQUIRING so the stale lease is withdrawn
                // before the new policy's config is applied (S3).
                let reassigned = matches!(
                    (&worker.selected_policy, &selected),
                    (Some(old), Some(new)) if old != new
                );
                worker.selected_policy = selected;
                let target_stage = if worker.selected_policy.is_some() {
                    Stage::NetworkUp
                } else {
                    Stage::DeviceReady
                };
                if reassigned && worker.stage() >= Stage::NetworkAddressAcquiring {
                    worker.target(Stage::NetworkAddressAcquiring);
                }
                worker.target(target_stage);
            }
            worker.last_seen_revision = self.policies.revision();
        }
    }

    /// Wait for the next tick: blocks on the event source until an event
    /// arrives or `deadline` expires, draining anything queued.
    pub fn sleep_until(events: &mut EventSource, deadline: Option<Instant>, now: Instant) {
        let timeout = deadline.map(|d| d.saturating_duration_since(now)).or(Some(Duration::from_secs(3600)));
        events.wait(timeout);
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Reconciler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceAttrs, DeviceKind, LinkFlags};
    use crate::event::Event;
    use crate::lease::{AddrFamily, AddrconfMethod, Lease};
    use crate::policy::{Match, Policy, PolicyId};
    use crate::document::Node;

    fn eth_attrs(name: &str) -> DeviceAttrs {
        DeviceAttrs {
            name: name.to_string(),
            kind: Some(DeviceKind::Ethernet),
            hwaddr: "52:54:00:00:00:01".into(),
            mtu: 1500,
            flags: LinkFlags { device_up: true, link_up: true, network_up: false },
            addresses: Vec::new(),
            routes: Vec::new(),
        }
    }

    fn dhcp_policy(priority: i64) -> Policy {
        Policy {
            id: PolicyId("dhcp".into()),
            priority,
            matcher: Match { kind: Some(DeviceKind::Ethernet), name_glob: None, hwaddr_glob: None, carrier_up: None },
            config: Node::new("config"),
        }
    }

    #[test]
    fn fresh_bring_up_reaches_network_up_after_lease_acquired() {
        let mut r = Reconciler::new();
        let (handle, mut events) = EventSource::new();
        r.policies.insert(dhcp_policy(10));

        handle.send(Event::Kernel(KernelEvent::DeviceCreate(3, eth_attrs("eth0"))));
        let now = Instant::now();
        r.tick(&mut events, now);
        r.tick(&mut events, now);

        assert_eq!(r.workers[&3].stage(), Stage::NetworkAddressAcquiring);

        let lease = Lease {
            family: AddrFamily::Ipv4,
            method: AddrconfMethod::Dhcp4,
            addresses: vec!["10.0.0.2/24".into()],
            routes: vec!["default via 10.0.0.1".into()],
            dns: vec![],
            expiry: None,
        };
        handle.send(Event::Lease(LeaseEvent::Acquired(3, AddrFamily::Ipv4, AddrconfMethod::Dhcp4, lease)));
        r.tick(&mut events, now);
        r.tick(&mut events, now);

        assert_eq!(r.workers[&3].stage(), Stage::NetworkUp);
        let record = r.inventory.lookup_by_index(3).unwrap();
        assert_eq!(record.leases.len(), 1);
    }

    #[test]
    fn device_delete_schedules_teardown_and_removes_from_inventory() {
        let mut r = Reconciler::new();
        let (handle, mut events) = EventSource::new();
        handle.send(Event::Kernel(KernelEvent::DeviceCreate(3, eth_attrs("eth0"))));
        let now = Instant::now();
        r.tick(&mut events, now);

        handle.send(Event::Kernel(KernelEvent::DeviceDelete(3)));
        r.tick(&mut events, now);

        assert!(r.inventory.lookup_by_index(3).is_none());
        assert!(r.workers[&3].is_in_teardown() || r.workers[&3].stage() == Stage::DeviceExists);
    }

    #[test]
    fn secret_pending_parks_worker_at_link_authenticated() {
        let mut r = Reconciler::new();
        let (handle, mut events) = EventSource::new();
        let mut attrs = eth_attrs("wlan0");
        attrs.kind = Some(DeviceKind::Wifi);
        handle.send(Event::Kernel(KernelEvent::DeviceCreate(7, attrs)));
        let now = Instant::now();
        r.tick(&mut events, now);
        r.workers.get_mut(&7).unwrap().target(Stage::LinkAuthenticated);
        r.mark_secret_pending(7, true);
        r.tick(&mut events, now);
        assert_eq!(r.workers[&7].stage(), Stage::DeviceReady);

        r.mark_secret_pending(7, false);
        r.tick(&mut events, now);
        assert_eq!(r.workers[&7].stage(), Stage::LinkAuthenticated);
    }

    #[test]
    fn ifup_with_config_installs_adhoc_policy_and_targets_network_up() {
        let mut r = Reconciler::new();
        let (handle, mut events) = EventSource::new();
        handle.send(Event::Kernel(KernelEvent::DeviceCreate(4, eth_attrs("eth1"))));
        let now = Instant::now();
        r.tick(&mut events, now);

        let config = Node::new("config").with_child(Node::new("address").with_attr("local", "10.1.1.9/24"));
        handle.send(Event::Rpc(RpcSignal::IfUp("eth1".into(), Some(config), 30)));
        r.tick(&mut events, now);

        assert_eq!(r.workers[&4].target, Stage::NetworkUp);
        assert_eq!(r.workers[&4].selected_policy, Some(Reconciler::ifup_policy_id("eth1")));
        assert!(r.workers[&4].ifup_deadline.is_some());
        assert!(r.policies.get(&Reconciler::ifup_policy_id("eth1")).is_some());
    }

    #[test]
    fn ifup_repeated_with_identical_config_does_not_reassign() {
        let mut r = Reconciler::new();
        let (handle, mut events) = EventSource::new();
        handle.send(Event::Kernel(KernelEvent::DeviceCreate(4, eth_attrs("eth1"))));
        let now = Instant::now();
        r.tick(&mut events, now);

        let config = Node::new("config");
        handle.send(Event::Rpc(RpcSignal::IfUp("eth1".into(), Some(config.clone()), 0)));
        r.tick(&mut events, now);
        r.tick(&mut events, now);
        let stage_after_first = r.workers[&4].stage();

        handle.send(Event::Rpc(RpcSignal::IfUp("eth1".into(), Some(config), 0)));
        r.tick(&mut events, now);

        // Same policy id selected again -> no forced demotion (S8#5).
        assert_eq!(r.workers[&4].stage(), stage_after_first);
    }

    #[test]
    fn ifdown_removes_adhoc_ifup_policy() {
        let mut r = Reconciler::new();
        let (handle, mut events) = EventSource::new();
        handle.send(Event::Kernel(KernelEvent::DeviceCreate(4, eth_attrs("eth1"))));
        let now = Instant::now();
        r.tick(&mut events, now);

        handle.send(Event::Rpc(RpcSignal::IfUp("eth1".into(), Some(Node::new("config")), 0)));
        r.tick(&mut events, now);
        assert!(r.policies.get(&Reconciler::ifup_policy_id("eth1")).is_some());

        handle.send(Event::Rpc(RpcSignal::IfDown("eth1".into(), false)));
        r.tick(&mut events, now);
        assert!(r.policies.get(&Reconciler::ifup_policy_id("eth1")).is_none());
    }

    #[test]
    fn recheck_coalesces_duplicate_requests() {
        let mut r = Reconciler::new();
        r.schedule_recheck(5);
        r.schedule_recheck(5);
        assert_eq!(r.recheck.len(), 1);
    }

    #[test]
    fn policy_swap_to_different_policy_forces_readdressing() {
        let mut r = Reconciler::new();
        let (handle, mut events) = EventSource::new();
        let mut static_policy = dhcp_policy(10);
        static_policy.id = PolicyId("static".into());
        r.policies.insert(static_policy);

        handle.send(Event::Kernel(KernelEvent::DeviceCreate(3, eth_attrs("eth0"))));
        let now = Instant::now();
        r.tick(&mut events, now);
        r.tick(&mut events, now);
        assert_eq!(r.workers[&3].stage(), Stage::NetworkAddressAcquiring);

        let lease = Lease {
            family: AddrFamily::Ipv4,
            method: AddrconfMethod::Static,
            addresses: vec!["192.168.1.5/24".into()],
            routes: vec![],
            dns: vec![],
            expiry: None,
        };
        handle.send(Event::Lease(LeaseEvent::Acquired(3, AddrFamily::Ipv4, AddrconfMethod::Static, lease)));
        r.tick(&mut events, now);
        r.tick(&mut events, now);
        assert_eq!(r.workers[&3].stage(), Stage::NetworkUp);
        assert_eq!(r.workers[&3].selected_policy, Some(PolicyId("static".into())));

        // Replace the static policy with a higher-priority DHCP one carrying
        // a different id; the worker must demote to re-acquire instead of
        // staying pinned at NETWORK_UP with the stale static lease.
        r.policies.insert(dhcp_policy(20));
        r.tick(&mut events, now);

        assert_eq!(r.workers[&3].selected_policy, Some(PolicyId("dhcp".into())));
        assert!(r.workers[&3].stage() <= Stage::NetworkAddressAcquiring);
        assert_eq!(r.workers[&3].target, Stage::NetworkUp);
    }

    #[test]
    fn policy_revision_bump_marks_all_workers_for_recheck() {
        let mut r = Reconciler::new();
        let (handle, mut events) = EventSource::new();
        handle.send(Event::Kernel(KernelEvent::DeviceCreate(3, eth_attrs("eth0"))));
        let now = Instant::now();
        r.tick(&mut events, now);

        r.policies.insert(dhcp_policy(10));
        r.tick(&mut events, now);
        // after this tick the worker should have picked up the new policy
        assert!(r.workers[&3].selected_policy.is_some());
    }
}
