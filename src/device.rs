//! Arena of devices.
//!
//! Devices refer to each other (a MID controller and the inverters behind
//! it) through [`DeviceId`] indices, never through owning pointers.

use crate::{
    error::{Error, Result},
    families,
    register_map::{DeviceFamily, RegisterMap},
    transport::DeviceAddress,
};
use serde::Serialize;
use std::{collections::HashMap, fmt};

/// Index of a device in its [`DeviceArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Inverter,
    GridController,
}

impl From<DeviceFamily> for DeviceKind {
    fn from(family: DeviceFamily) -> Self {
        match family {
            DeviceFamily::PvSeries | DeviceFamily::EuSeries => DeviceKind::Inverter,
            DeviceFamily::MidController => DeviceKind::GridController,
        }
    }
}

/// One physical device. The register map is resolved once, at registration.
#[derive(Debug)]
pub struct Device {
    pub id: DeviceId,
    pub address: DeviceAddress,
    pub family: DeviceFamily,
    pub kind: DeviceKind,
    pub map: &'static RegisterMap,
    pub parent: Option<DeviceId>,
    pub children: Vec<DeviceId>,
}

impl Device {
    pub fn serial(&self) -> &str {
        &self.address.serial
    }
}

#[derive(Debug, Default)]
pub struct DeviceArena {
    devices: Vec<Device>,
    by_serial: HashMap<String, DeviceId>,
}

impl DeviceArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device. Serials are unique within the arena.
    pub fn insert(&mut self, serial: &str, unit_id: u8, family: DeviceFamily) -> Result<DeviceId> {
        if self.by_serial.contains_key(serial) {
            return Err(Error::Config(format!("device {serial} registered twice")));
        }
        let id = DeviceId(self.devices.len());
        self.devices.push(Device {
            id,
            address: DeviceAddress::new(serial, unit_id),
            family,
            kind: family.into(),
            map: families::register_map(family),
            parent: None,
            children: Vec::new(),
        });
        self.by_serial.insert(serial.to_string(), id);
        Ok(id)
    }

    /// Records `child` as belonging to `parent`.
    pub fn attach(&mut self, parent: DeviceId, child: DeviceId) -> Result<()> {
        if parent == child {
            return Err(Error::Config(format!("device {parent} cannot be its own parent")));
        }
        self.get(parent)?;
        if let Some(previous) = self.get(child)?.parent {
            return Err(Error::Config(format!(
                "device {child} already belongs to {previous}"
            )));
        }
        if self.ancestors(parent).any(|ancestor| ancestor == child) {
            return Err(Error::Config(format!(
                "device {child} is an ancestor of {parent}"
            )));
        }
        self.devices[child.0].parent = Some(parent);
        self.devices[parent.0].children.push(child);
        Ok(())
    }

    /// Parent, grandparent and so on of `id`, nearest first.
    pub fn ancestors(&self, id: DeviceId) -> impl Iterator<Item = DeviceId> + '_ {
        std::iter::successors(self.devices.get(id.0).and_then(|d| d.parent), |current| {
            self.devices.get(current.0).and_then(|d| d.parent)
        })
    }

    /// The device registered under `id`.
    pub fn get(&self, id: DeviceId) -> Result<&Device> {
        self.devices
            .get(id.0)
            .ok_or_else(|| Error::UnknownDevice(id.to_string()))
    }

    /// Looks up a device index by serial number.
    pub fn id_of(&self, serial: &str) -> Result<DeviceId> {
        self.by_serial
            .get(serial)
            .copied()
            .ok_or_else(|| Error::UnknownDevice(serial.to_string()))
    }

    /// Looks up a device by serial number.
    pub fn by_serial(&self, serial: &str) -> Result<&Device> {
        self.get(self.id_of(serial)?)
    }

    /// Devices attached directly below `id`, in attach order.
    pub fn children(&self, id: DeviceId) -> Result<impl Iterator<Item = &Device>> {
        let children = &self.get(id)?.children;
        Ok(children.iter().map(|child| &self.devices[child.0]))
    }

    /// Every device in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn devices_share_their_family_map() {
        let mut arena = DeviceArena::new();
        let a = arena.insert("1111111111", 1, DeviceFamily::PvSeries).unwrap();
        let b = arena.insert("2222222222", 2, DeviceFamily::PvSeries).unwrap();
        assert!(std::ptr::eq(arena.get(a).unwrap().map, arena.get(b).unwrap().map));
        assert_eq!(arena.id_of("2222222222").unwrap(), b);
        assert_matches!(
            arena.insert("1111111111", 3, DeviceFamily::EuSeries),
            Err(Error::Config(_))
        );
        assert_matches!(arena.id_of("missing"), Err(Error::UnknownDevice(_)));
    }

    #[test]
    fn parent_and_children_are_indices() {
        let mut arena = DeviceArena::new();
        let mid = arena.insert("MID0000001", 1, DeviceFamily::MidController).unwrap();
        let inv1 = arena.insert("1111111111", 2, DeviceFamily::PvSeries).unwrap();
        let inv2 = arena.insert("2222222222", 3, DeviceFamily::PvSeries).unwrap();
        arena.attach(mid, inv1).unwrap();
        arena.attach(mid, inv2).unwrap();

        assert_eq!(arena.get(mid).unwrap().kind, DeviceKind::GridController);
        assert_eq!(arena.get(inv1).unwrap().parent, Some(mid));
        let serials: Vec<_> = arena.children(mid).unwrap().map(Device::serial).collect();
        assert_eq!(serials, vec!["1111111111", "2222222222"]);

        assert_matches!(arena.attach(inv2, inv1), Err(Error::Config(_)));
        assert_matches!(arena.attach(mid, mid), Err(Error::Config(_)));
        assert_matches!(arena.attach(mid, DeviceId(9)), Err(Error::UnknownDevice(_)));
    }

    #[test]
    fn attach_rejects_cycles() {
        let mut arena = DeviceArena::new();
        let mid = arena.insert("MID0000001", 1, DeviceFamily::MidController).unwrap();
        let inv = arena.insert("1111111111", 2, DeviceFamily::PvSeries).unwrap();
        let leaf = arena.insert("2222222222", 3, DeviceFamily::EuSeries).unwrap();
        arena.attach(mid, inv).unwrap();
        arena.attach(inv, leaf).unwrap();
        assert_eq!(arena.ancestors(leaf).collect::<Vec<_>>(), vec![inv, mid]);

        assert_matches!(arena.attach(inv, mid), Err(Error::Config(_)));
        assert_matches!(arena.attach(leaf, mid), Err(Error::Config(_)));
        assert!(arena.get(mid).unwrap().parent.is_none());
        assert!(arena.children(leaf).unwrap().next().is_none());
    }
}
