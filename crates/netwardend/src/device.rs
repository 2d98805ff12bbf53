//! Device identity and the device inventory.
//!
//! Grounded on `manager.rs`'s `ManagedLink`/`NetworkManager`, generalized
//! from a flat index->link map into dense slotted storage with generation
//! counters, per the intrusive-list-to-dense-vector redesign note.

use std::collections::HashMap;

use crate::error::{Error, Name};
use crate::lease::Lease;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Ethernet,
    Wifi,
    Bond,
    Bridge,
    Vlan,
    Modem,
    Virtual,
}

impl DeviceKind {
    /// Whether this kind passes through `LINK_AUTHENTICATED` (wifi
    /// association, modem registration) rather than skipping it.
    pub fn requires_authentication(self) -> bool {
        matches!(self, DeviceKind::Wifi | DeviceKind::Modem)
    }
}

/// A stable handle into the inventory: a kernel index plus a generation
/// counter, so a handle captured before a delete+recreate cycle on the same
/// index is detected as stale rather than silently aliasing the new device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkFlags {
    pub device_up: bool,
    pub link_up: bool,
    pub network_up: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceAttrs {
    pub name: String,
    pub kind: Option<DeviceKind>,
    pub hwaddr: String,
    pub mtu: u32,
    pub flags: LinkFlags,
    pub addresses: Vec<String>,
    pub routes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub handle: DeviceHandle,
    pub attrs: DeviceAttrs,
    pub leases: Vec<Lease>,
}

impl DeviceRecord {
    pub fn kind(&self) -> DeviceKind {
        self.attrs.kind.unwrap_or(DeviceKind::Ethernet)
    }

    pub fn lease(&self, family: crate::lease::AddrFamily, method: crate::lease::AddrconfMethod) -> Option<&Lease> {
        self.leases
            .iter()
            .find(|l| l.family == family && l.method == method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveResult {
    New,
    Updated,
    Unchanged,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffMask {
    pub flags_changed: bool,
    pub addresses_changed: bool,
    pub mtu_changed: bool,
    pub renamed: bool,
}

struct Slot {
    generation: u32,
    record: Option<DeviceRecord>,
}

/// Maps stable device identity (kernel index, secondarily name) to the
/// current observed attributes. The reconciler is the sole writer.
#[derive(Default)]
pub struct DeviceInventory {
    slots: HashMap<u32, Slot>,
    by_name: HashMap<String, u32>,
}

impl DeviceInventory {
    pub fn new() -> Self {
        DeviceInventory::default()
    }

    /// Upsert. Returns the classification and a diff mask describing what
    /// changed relative to the prior observation (empty mask if `New`).
    pub fn observe(&mut self, index: u32, attrs: DeviceAttrs) -> (DeviceHandle, ObserveResult, DiffMask) {
        let entry = self.slots.entry(index).or_insert_with(|| Slot {
            generation: 0,
            record: None,
        });

        match &mut entry.record {
            None => {
                let handle = DeviceHandle {
                    index,
                    generation: entry.generation,
                };
                self.by_name.insert(attrs.name.clone(), index);
                entry.record = Some(DeviceRecord {
                    handle,
                    attrs,
                    leases: Vec::new(),
                });
                (handle, ObserveResult::New, DiffMask::default())
            }
            Some(record) => {
                let mut mask = DiffMask::default();
                if record.attrs.name != attrs.name {
                    mask.renamed = true;
                    self.by_name.remove(&record.attrs.name);
                    self.by_name.insert(attrs.name.clone(), index);
                }
                if record.attrs.flags != attrs.flags {
                    mask.flags_changed = true;
                }
                if record.attrs.addresses != attrs.addresses {
                    mask.addresses_changed = true;
                }
                if record.attrs.mtu != attrs.mtu {
                    mask.mtu_changed = true;
                }
                let unchanged = !mask.renamed && !mask.flags_changed && !mask.addresses_changed && !mask.mtu_changed
                    && record.attrs.hwaddr == attrs.hwaddr
                    && record.attrs.kind == attrs.kind
                    && record.attrs.routes == attrs.routes;
                record.attrs = attrs;
                let handle = record.handle;
                if unchanged {
                    (handle, ObserveResult::Unchanged, mask)
                } else {
                    (handle, ObserveResult::Updated, mask)
                }
            }
        }
    }

    /// Removes the device at `index`. The slot's generation is bumped so a
    /// later `device-create` for the same index produces a fresh handle.
    pub fn forget(&mut self, index: u32) -> Result<DeviceRecord, Error> {
        let slot = self
            .slots
            .get_mut(&index)
            .ok_or_else(|| Error::not_found(format!("device index {index} not found")))?;
        let record = slot
            .record
            .take()
            .ok_or_else(|| Error::not_found(format!("device index {index} not found")))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.by_name.remove(&record.attrs.name);
        Ok(record)
    }

    pub fn lookup_by_index(&self, index: u32) -> Option<&DeviceRecord> {
        self.slots.get(&index).and_then(|s| s.record.as_ref())
    }

    pub fn lookup_by_index_mut(&mut self, index: u32) -> Option<&mut DeviceRecord> {
        self.slots.get_mut(&index).and_then(|s| s.record.as_mut())
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&DeviceRecord> {
        self.by_name.get(name).and_then(|idx| self.lookup_by_index(*idx))
    }

    /// Whether `handle` still refers to the live occupant of its index (the
    /// generation matches). A stale handle captured across a delete+recreate
    /// no longer resolves.
    pub fn is_current(&self, handle: DeviceHandle) -> bool {
        self.slots
            .get(&handle.index)
            .map(|s| s.generation == handle.generation && s.record.is_some())
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.slots.values().filter_map(|s| s.record.as_ref())
    }

    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| s.record.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeviceRecord {
    pub fn require_kind_capability(&self, name: Name, ok: bool) -> Result<(), Error> {
        if ok {
            Ok(())
        } else {
            Err(Error::configuration(
                name,
                format!("operation not applicable to device kind {:?}", self.kind()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(name: &str) -> DeviceAttrs {
        DeviceAttrs {
            name: name.to_string(),
            kind: Some(DeviceKind::Ethernet),
            hwaddr: "52:54:00:00:00:01".into(),
            mtu: 1500,
            flags: LinkFlags::default(),
            addresses: Vec::new(),
            routes: Vec::new(),
        }
    }

    #[test]
    fn observe_new_then_unchanged() {
        let mut inv = DeviceInventory::new();
        let (h1, r1, _) = inv.observe(3, attrs("eth0"));
        assert_eq!(r1, ObserveResult::New);
        let (h2, r2, mask) = inv.observe(3, attrs("eth0"));
        assert_eq!(r2, ObserveResult::Unchanged);
        assert_eq!(h1, h2);
        assert!(!mask.renamed);
    }

    #[test]
    fn observe_detects_rename_and_updates_name_index() {
        let mut inv = DeviceInventory::new();
        inv.observe(3, attrs("eth0"));
        let (_, r, mask) = inv.observe(3, attrs("lan0"));
        assert_eq!(r, ObserveResult::Updated);
        assert!(mask.renamed);
        assert!(inv.lookup_by_name("lan0").is_some());
        assert!(inv.lookup_by_name("eth0").is_none());
    }

    #[test]
    fn forget_requires_existing_device() {
        let mut inv = DeviceInventory::new();
        assert!(inv.forget(99).is_err());
        inv.observe(3, attrs("eth0"));
        assert!(inv.forget(3).is_ok());
        assert!(inv.lookup_by_index(3).is_none());
    }

    #[test]
    fn index_reuse_bumps_generation_and_invalidates_old_handle() {
        let mut inv = DeviceInventory::new();
        let (h1, ..) = inv.observe(3, attrs("eth0"));
        inv.forget(3).unwrap();
        let (h2, result, _) = inv.observe(3, attrs("eth0"));
        assert_eq!(result, ObserveResult::New);
        assert_ne!(h1.generation, h2.generation);
        assert!(!inv.is_current(h1));
        assert!(inv.is_current(h2));
    }

    #[test]
    fn iter_yields_only_live_records() {
        let mut inv = DeviceInventory::new();
        inv.observe(3, attrs("eth0"));
        inv.observe(4, attrs("eth1"));
        inv.forget(3).unwrap();
        let names: Vec<_> = inv.iter().map(|r| r.attrs.name.clone()).collect();
        assert_eq!(names, vec!["eth1".to_string()]);
    }
}
