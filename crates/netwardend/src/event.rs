//! Event source: normalizes kernel link events, lease engine callbacks, RPC
//! signals, and timer expirations into one ordered stream with sequence
//! numbers.
//!
//! Grounded on `main.rs`'s single poll loop (handling reload, DHCP receive,
//! watchdog on one cycle), generalized into an explicit channel per
//! SPEC_FULL.md §9 ("blocking waits" -> explicit event queue fed by
//! background threads).

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::time::Duration;

use crate::device::DeviceAttrs;
use crate::document::Node;
use crate::lease::{AddrFamily, AddrconfMethod, Lease};
use crate::policy::{Policy, PolicyId};

#[derive(Debug, Clone)]
pub enum KernelEvent {
    DeviceCreate(u32, DeviceAttrs),
    DeviceDelete(u32),
    LinkUp(u32),
    LinkDown(u32),
    AddressAdded(u32, String),
    AddressRemoved(u32, String),
    MtuChange(u32, u32),
    Rename(u32, String),
}

#[derive(Debug, Clone)]
pub enum LeaseEvent {
    Acquired(u32, AddrFamily, AddrconfMethod, Lease),
    Lost(u32, AddrFamily, AddrconfMethod, String),
    Renewed(u32, AddrFamily, AddrconfMethod, Lease),
}

#[derive(Debug, Clone)]
pub enum RpcSignal {
    PolicyAdded(Policy),
    PolicyChanged(Policy),
    PolicyRemoved(PolicyId),
    /// `device.ifup(config, deadline)`: target NETWORK_UP, an optional
    /// ad-hoc config overriding policy selection, and a deadline in seconds
    /// (0 = no deadline) bounding the worker's climb.
    IfUp(String, Option<Node>, u32),
    IfDown(String, bool),
    PromptResponse(String, String, String),
}

#[derive(Debug, Clone)]
pub enum Event {
    Kernel(KernelEvent),
    Lease(LeaseEvent),
    Rpc(RpcSignal),
    DeadlineExpired(u32),
}

#[derive(Debug, Clone)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: Event,
}

pub struct EventSourceHandle {
    sender: Sender<Event>,
}

impl EventSourceHandle {
    pub fn send(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventSourceHandle {
    fn clone(&self) -> Self {
        EventSourceHandle {
            sender: self.sender.clone(),
        }
    }
}

/// Single consumer side, owned by the reconciler. Assigns monotonically
/// increasing sequence numbers as events are drained, and enforces the
/// device-delete-before-device-create ordering guarantee for the same
/// index by having callers route both through the same channel in arrival
/// order (no reordering happens downstream of `send`).
pub struct EventSource {
    receiver: Receiver<Event>,
    next_seq: u64,
}

impl EventSource {
    pub fn new() -> (EventSourceHandle, EventSource) {
        let (tx, rx) = std::sync::mpsc::channel();
        (
            EventSourceHandle { sender: tx },
            EventSource {
                receiver: rx,
                next_seq: 0,
            },
        )
    }

    fn stamp(&mut self, event: Event) -> SequencedEvent {
        let seq = self.next_seq;
        self.next_seq += 1;
        SequencedEvent { seq, event }
    }

    /// Drains all currently queued events without blocking.
    pub fn drain(&mut self) -> Vec<SequencedEvent> {
        let mut out = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => out.push(self.stamp(event)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Blocks until an event arrives or `timeout` elapses, then drains
    /// anything queued. Used as the reconciler's sleep point (§4.5 step 6).
    pub fn wait(&mut self, timeout: Option<Duration>) -> Vec<SequencedEvent> {
        let first = match timeout {
            Some(d) => self.receiver.recv_timeout(d).ok(),
            None => self.receiver.recv().ok(),
        };
        let mut out = Vec::new();
        if let Some(event) = first {
            out.push(self.stamp(event));
        }
        out.extend(self.drain());
        out
    }
}
