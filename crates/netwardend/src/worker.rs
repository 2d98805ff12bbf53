//! Per-device finite-state worker.
//!
//! Grounded directly on SPEC_FULL.md §4.3; backoff shaped after `dhcp.rs`'s
//! `retransmit_timeout` (exponential, capped), generalized with jitter per
//! the resolved Open Question (base 1s, factor 2, cap 60s, jitter ±25%).

use std::time::{Duration, Instant};

use rand::Rng;

use crate::device::{DeviceHandle, DeviceKind};
use crate::policy::PolicyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    DeviceExists,
    DeviceReady,
    LinkAuthenticated,
    LinkUp,
    NetworkAddressAcquiring,
    NetworkUp,
    Steady,
}

impl Stage {
    pub const ORDER: [Stage; 7] = [
        Stage::DeviceExists,
        Stage::DeviceReady,
        Stage::LinkAuthenticated,
        Stage::LinkUp,
        Stage::NetworkAddressAcquiring,
        Stage::NetworkUp,
        Stage::Steady,
    ];

    pub fn next(self) -> Option<Stage> {
        let idx = Stage::ORDER.iter().position(|s| *s == self)?;
        Stage::ORDER.get(idx + 1).copied()
    }

    /// Whether a device of `kind` passes through this stage, or skips it.
    /// Only `LINK_AUTHENTICATED` is ever skipped (plain ethernet).
    pub fn applies_to(self, kind: DeviceKind) -> bool {
        if self == Stage::LinkAuthenticated {
            kind.requires_authentication()
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transient {
    /// DEVICE_READY: active stage until kernel confirms the apply.
    DeviceExists,
    DeviceReady,
    LinkAuthenticated,
    LinkUp,
    NetworkAddressAcquiring,
    NetworkUp,
    Steady,
    Failed(Stage),
    Teardown(Stage),
}

impl Transient {
    pub fn stage(self) -> Stage {
        match self {
            Transient::DeviceExists => Stage::DeviceExists,
            Transient::DeviceReady => Stage::DeviceReady,
            Transient::LinkAuthenticated => Stage::LinkAuthenticated,
            Transient::LinkUp => Stage::LinkUp,
            Transient::NetworkAddressAcquiring => Stage::NetworkAddressAcquiring,
            Transient::NetworkUp => Stage::NetworkUp,
            Transient::Steady => Stage::Steady,
            Transient::Failed(s) | Transient::Teardown(s) => s,
        }
    }

    fn active(stage: Stage) -> Transient {
        match stage {
            Stage::DeviceExists => Transient::DeviceExists,
            Stage::DeviceReady => Transient::DeviceReady,
            Stage::LinkAuthenticated => Transient::LinkAuthenticated,
            Stage::LinkUp => Transient::LinkUp,
            Stage::NetworkAddressAcquiring => Transient::NetworkAddressAcquiring,
            Stage::NetworkUp => Transient::NetworkUp,
            Stage::Steady => Transient::Steady,
        }
    }
}

/// Events delivered to a single worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    DeviceReady,
    LinkAuthenticated,
    LinkUp,
    LinkDown,
    LinkAssociationLost,
    LeaseAcquired,
    LeaseLost,
    SecretResolved,
    DeadlineExpired,
}

/// Exponential backoff with jitter, capped. Shaped after the DHCP client's
/// retransmit timeout, generalized to arbitrary worker stage retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub jitter: f64,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            jitter: 0.25,
            attempt: 0,
        }
    }
}

impl Backoff {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt
    }

    /// Computes the delay for the current attempt, then advances.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.factor.saturating_pow(self.attempt.min(16));
        let nominal = self.base.saturating_mul(exp).min(self.cap);
        self.attempt += 1;
        jitter(nominal, self.jitter)
    }
}

fn jitter(nominal: Duration, fraction: f64) -> Duration {
    let nominal_ms = nominal.as_millis() as f64;
    let spread = nominal_ms * fraction;
    let delta = rand::rng().random_range(-spread..=spread);
    let jittered_ms = (nominal_ms + delta).max(0.0);
    Duration::from_millis(jittered_ms as u64)
}

/// A worker's suspension point: what it is waiting for before `tick()` can
/// make further progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parked {
    KernelApply,
    LeaseAcquisition,
    Secret,
}

#[derive(Debug)]
pub struct Worker {
    pub device: DeviceHandle,
    pub kind: DeviceKind,
    pub state: Transient,
    pub target: Stage,
    pub selected_policy: Option<PolicyId>,
    pub last_seen_revision: u64,
    pub parked: Option<Parked>,
    pub deadline: Option<Instant>,
    /// Caller-supplied deadline from `device.ifup(config, deadline)` (§6),
    /// independent of the per-stage `deadline` above: bounds the whole
    /// climb to `NETWORK_UP`, not a single suspension point.
    pub ifup_deadline: Option<Instant>,
    backoff: Backoff,
    failures_at_stage: u32,
}

/// After this many consecutive failures at the same stage the worker parks
/// in `Failed` and stops retrying until externally recheck'd (§4.3, S4).
pub const MAX_STAGE_FAILURES: u32 = 5;

impl Worker {
    pub fn new(device: DeviceHandle, kind: DeviceKind) -> Self {
        Worker {
            device,
            kind,
            state: Transient::DeviceExists,
            target: Stage::DeviceExists,
            selected_policy: None,
            last_seen_revision: 0,
            parked: None,
            deadline: None,
            ifup_deadline: None,
            backoff: Backoff::default(),
            failures_at_stage: 0,
        }
    }

    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, Transient::Failed(_))
    }

    pub fn is_in_teardown(&self) -> bool {
        matches!(self.state, Transient::Teardown(_))
    }

    /// Sets the worker's target stage; may demote (e.g. a policy change
    /// dropping from NETWORK_UP to NETWORK_ADDRESS_ACQUIRING).
    pub fn target(&mut self, desired: Stage) {
        self.target = desired;
        if desired < self.stage() && !self.is_in_teardown() {
            self.state = Transient::Teardown(desired);
        }
    }

    /// Begins orderly descent to DEVICE_EXISTS.
    pub fn teardown(&mut self) {
        self.state = Transient::Teardown(Stage::DeviceExists);
        self.target = Stage::DeviceExists;
        self.parked = None;
        self.ifup_deadline = None;
    }

    pub fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::LinkAssociationLost if self.stage() >= Stage::LinkAuthenticated => {
                self.state = Transient::Teardown(Stage::DeviceReady);
                self.target = Stage::Steady;
                self.parked = None;
            }
            WorkerEvent::LinkDown => {
                self.parked = None;
            }
            WorkerEvent::DeviceReady if self.parked == Some(Parked::KernelApply) => {
                self.parked = None;
            }
            WorkerEvent::LinkAuthenticated if self.parked == Some(Parked::KernelApply) => {
                self.parked = None;
            }
            WorkerEvent::LinkUp if self.parked == Some(Parked::KernelApply) => {
                self.parked = None;
            }
            WorkerEvent::LeaseAcquired if self.parked == Some(Parked::LeaseAcquisition) => {
                self.parked = None;
            }
            WorkerEvent::LeaseLost => {
                if self.stage() >= Stage::NetworkUp {
                    self.target(Stage::NetworkAddressAcquiring);
                }
            }
            WorkerEvent::SecretResolved if self.parked == Some(Parked::Secret) => {
                self.parked = None;
            }
            WorkerEvent::DeadlineExpired => self.fail_current_stage("deadline expired"),
            _ => {}
        }
    }

    fn fail_current_stage(&mut self, _reason: &str) {
        let stage = self.stage();
        self.failures_at_stage += 1;
        self.parked = None;
        if self.failures_at_stage >= MAX_STAGE_FAILURES {
            self.state = Transient::Failed(stage);
        } else {
            let lowest_ok = self.lowest_satisfied_stage(stage);
            self.state = Transient::Teardown(lowest_ok);
        }
    }

    fn lowest_satisfied_stage(&self, failed_at: Stage) -> Stage {
        match failed_at {
            Stage::DeviceExists => Stage::DeviceExists,
            _ => Stage::DeviceReady,
        }
    }

    /// Advance as far as possible without blocking; returns the next
    /// desired wakeup deadline, if any.
    pub fn tick(&mut self, now: Instant, device_ready: bool) -> Option<Instant> {
        if self.parked.is_some() {
            return self.deadline;
        }

        match self.state {
            Transient::Failed(_) => None,
            Transient::Teardown(floor) => {
                let cur = self.stage();
                if cur <= floor {
                    self.state = Transient::active(if self.target >= floor { floor } else { self.target });
                    self.backoff.reset();
                    self.failures_at_stage = 0;
                    self.tick(now, device_ready)
                } else {
                    // demote one stage per tick
                    let idx = Stage::ORDER.iter().position(|s| *s == cur).unwrap();
                    let lower = Stage::ORDER[idx.saturating_sub(1)];
                    self.state = Transient::Teardown(floor.max(lower).min(cur));
                    if lower == cur {
                        self.state = Transient::active(cur);
                    }
                    None
                }
            }
            _ => self.advance(now, device_ready),
        }
    }

    fn advance(&mut self, now: Instant, device_ready: bool) -> Option<Instant> {
        let cur = self.stage();
        if cur >= self.target {
            return None;
        }
        let mut next = match cur.next() {
            Some(n) => n,
            None => return None,
        };
        while !next.applies_to(self.kind) {
            next = match next.next() {
                Some(n) => n,
                None => return None,
            };
        }

        match next {
            Stage::DeviceReady | Stage::LinkAuthenticated | Stage::LinkUp => {
                if device_ready {
                    self.state = Transient::active(next);
                    self.failures_at_stage = 0;
                    self.backoff.reset();
                    self.advance(now, device_ready)
                } else {
                    self.parked = Some(Parked::KernelApply);
                    let deadline = now + self.backoff.next_delay().max(Duration::from_secs(1));
                    self.deadline = Some(deadline);
                    Some(deadline)
                }
            }
            Stage::NetworkAddressAcquiring => {
                self.state = Transient::active(next);
                self.parked = Some(Parked::LeaseAcquisition);
                let deadline = now + Duration::from_secs(30);
                self.deadline = Some(deadline);
                Some(deadline)
            }
            Stage::NetworkUp | Stage::Steady => {
                self.state = Transient::active(next);
                self.failures_at_stage = 0;
                if next == Stage::NetworkUp {
                    self.ifup_deadline = None;
                }
                self.advance(now, device_ready)
            }
            Stage::DeviceExists => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn handle() -> DeviceHandle {
        DeviceHandle { index: 1, generation: 0 }
    }

    #[test]
    fn fresh_worker_starts_at_device_exists() {
        let w = Worker::new(handle(), DeviceKind::Ethernet);
        assert_eq!(w.stage(), Stage::DeviceExists);
    }

    #[test]
    fn ethernet_skips_link_authenticated() {
        assert!(!Stage::LinkAuthenticated.applies_to(DeviceKind::Ethernet));
        assert!(Stage::LinkAuthenticated.applies_to(DeviceKind::Wifi));
    }

    #[test]
    fn tick_advances_through_ready_states_when_device_ready() {
        let mut w = Worker::new(handle(), DeviceKind::Ethernet);
        w.target(Stage::NetworkAddressAcquiring);
        let now = Instant::now();
        w.tick(now, true);
        assert_eq!(w.stage(), Stage::NetworkAddressAcquiring);
        assert_eq!(w.parked, Some(Parked::LeaseAcquisition));
    }

    #[test]
    fn tick_parks_when_device_not_ready() {
        let mut w = Worker::new(handle(), DeviceKind::Ethernet);
        w.target(Stage::DeviceReady);
        let now = Instant::now();
        let deadline = w.tick(now, false);
        assert!(deadline.is_some());
        assert_eq!(w.stage(), Stage::DeviceExists);
        assert_eq!(w.parked, Some(Parked::KernelApply));
    }

    #[test]
    fn lease_acquired_unparks_and_reaches_network_up() {
        let mut w = Worker::new(handle(), DeviceKind::Ethernet);
        w.target(Stage::NetworkUp);
        let now = Instant::now();
        w.tick(now, true);
        assert_eq!(w.stage(), Stage::NetworkAddressAcquiring);
        w.on_event(WorkerEvent::LeaseAcquired);
        w.tick(now, true);
        assert_eq!(w.stage(), Stage::NetworkUp);
    }

    #[test]
    fn association_lost_forces_teardown_to_device_ready() {
        let mut w = Worker::new(handle(), DeviceKind::Wifi);
        w.state = Transient::Steady;
        w.target = Stage::Steady;
        w.on_event(WorkerEvent::LinkAssociationLost);
        assert!(w.is_in_teardown());
        let now = Instant::now();
        // drain teardown down to DeviceReady
        for _ in 0..10 {
            w.tick(now, true);
            if w.stage() == Stage::DeviceReady && !w.is_in_teardown() {
                break;
            }
        }
        assert_eq!(w.stage(), Stage::DeviceReady);
    }

    #[test]
    fn repeated_deadline_failures_park_in_failed_after_max() {
        let mut w = Worker::new(handle(), DeviceKind::Wifi);
        w.target(Stage::LinkAuthenticated);
        for _ in 0..MAX_STAGE_FAILURES {
            w.on_event(WorkerEvent::DeadlineExpired);
        }
        assert!(w.is_failed());
    }

    #[test]
    fn target_demotion_starts_teardown() {
        let mut w = Worker::new(handle(), DeviceKind::Ethernet);
        w.state = Transient::NetworkUp;
        w.target = Stage::NetworkUp;
        w.target(Stage::DeviceReady);
        assert!(w.is_in_teardown());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = Backoff { jitter: 0.0, ..Backoff::default() };
        let d0 = b.next_delay();
        let d1 = b.next_delay();
        let d2 = b.next_delay();
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));
        let mut attempts = Backoff { jitter: 0.0, ..Backoff::default() };
        for _ in 0..20 {
            let d = attempts.next_delay();
            assert!(d <= Duration::from_secs(60));
        }
    }
}
