//! The switch-wide port table: a fixed array of 253 slots indexed directly
//! by port id, with the two reserved sentinel ids the forwarding fast path
//! uses for "discard" and "send to all".

use tracing::debug;

use crate::errors::{Error, Result};
use crate::port::{Port, RingGrant};

/// Capacity of a `u8` id space minus the two sentinels.
pub const MAX_PORTS: usize = 253;

/// A destination in the switch: a real port slot, or one of the sentinels.
///
/// Encoding drop and broadcast as ordinary destination values lets the
/// forwarding fast path treat every decision uniformly as "write to slot
/// K".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u8);

impl PortId {
    /// Discard the packet.
    pub const DROP: PortId = PortId(255);
    /// Send to every other port.
    pub const BROADCAST: PortId = PortId(254);

    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_sentinel(self) -> bool {
        self.0 == Self::DROP.0 || self.0 == Self::BROADCAST.0
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::DROP => write!(f, "drop"),
            Self::BROADCAST => write!(f, "broadcast"),
            Self(raw) => write!(f, "{raw}"),
        }
    }
}

impl std::fmt::Debug for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PortId({self})")
    }
}

/// The port table. Owns every attached [`Port`]; table mutation and
/// reference-count edits must be serialized by the controller (the data
/// path never touches this).
pub struct Switch {
    slots: Box<[Option<Port>]>,
    count: usize,
}

impl Switch {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_PORTS).map(|_| None).collect(),
            count: 0,
        }
    }

    /// Attached ports.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Stores `port` under `id`, taking ownership.
    pub fn attach(&mut self, port: Port, id: PortId) -> Result<()> {
        if id.is_sentinel() || id.index() >= MAX_PORTS {
            return Err(Error::InvalidArgument("reserved or out-of-range port id"));
        }
        if self.count == MAX_PORTS {
            return Err(Error::ResourceExhausted("port table"));
        }
        let slot = &mut self.slots[id.index()];
        if slot.is_some() {
            return Err(Error::SlotOccupied(id));
        }
        debug!(iface = port.iface(), %id, "port attached");
        *slot = Some(port);
        self.count += 1;
        Ok(())
    }

    /// Removes the port named `iface` and returns ownership to the caller,
    /// who is then responsible for destroying it. Fails with `Busy` while
    /// any of its rings is still claimed.
    pub fn detach(&mut self, iface: &str) -> Result<Port> {
        for slot in self.slots.iter_mut() {
            match slot {
                Some(port) if port.iface() == iface => {
                    if port.refs() != 0 {
                        return Err(Error::Busy(iface.to_owned()));
                    }
                    let port = slot.take().expect("matched above");
                    self.count -= 1;
                    debug!(iface, "port detached");
                    return Ok(port);
                }
                _ => continue,
            }
        }
        Err(Error::NotFound(iface.to_owned()))
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    pub fn port_mut(&mut self, id: PortId) -> Option<&mut Port> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Claims queue `queue` of the port at `id` for a worker.
    pub fn claim(&mut self, id: PortId, queue: u16) -> Result<RingGrant> {
        self.port_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?
            .claim(queue)
    }

    /// Returns a grant to the port at `id`.
    pub fn release(&mut self, id: PortId, grant: RingGrant) -> Result<()> {
        self.port_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?
            .release(grant)
    }
}

impl Default for Switch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimFabric, SimNicSpec};

    fn fabric_with(names: &[&str]) -> SimFabric {
        let fabric = SimFabric::new();
        for name in names {
            fabric.provision(
                name,
                SimNicSpec {
                    queues: 1,
                    buf_size: 128,
                    pool_bufs: 0,
                },
            );
        }
        fabric
    }

    fn port(fabric: &SimFabric, name: &str) -> Port {
        Port::create(fabric, name, 1, 8, None).unwrap()
    }

    #[test]
    fn attach_detach_roundtrip() {
        let fabric = fabric_with(&["sim0"]);
        let mut sw = Switch::new();
        sw.attach(port(&fabric, "sim0"), PortId::new(0)).unwrap();
        assert_eq!(sw.len(), 1);
        let detached = sw.detach("sim0").unwrap();
        assert_eq!(sw.len(), 0);
        assert_eq!(detached.iface(), "sim0");
        // the slot is reusable afterwards
        sw.attach(detached, PortId::new(0)).unwrap();
        assert_eq!(sw.len(), 1);
    }

    #[test]
    fn attach_occupied_slot_fails() {
        let fabric = fabric_with(&["sim0", "sim1"]);
        let mut sw = Switch::new();
        sw.attach(port(&fabric, "sim0"), PortId::new(0)).unwrap();
        assert!(matches!(
            sw.attach(port(&fabric, "sim1"), PortId::new(0)),
            Err(Error::SlotOccupied(_))
        ));
        assert_eq!(sw.len(), 1);
    }

    #[test]
    fn attach_rejects_reserved_and_out_of_range_ids() {
        let fabric = fabric_with(&["sim0"]);
        let mut sw = Switch::new();
        for raw in [253u8, 254, 255] {
            let p = port(&fabric, "sim0");
            assert!(matches!(
                sw.attach(p, PortId::new(raw)),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(sw.is_empty());
    }

    #[test]
    fn attach_full_table_is_resource_exhausted() {
        let fabric = SimFabric::new();
        let mut sw = Switch::new();
        for i in 0..MAX_PORTS {
            let name = format!("sim{i}");
            fabric.provision(
                &name,
                SimNicSpec {
                    queues: 1,
                    buf_size: 64,
                    pool_bufs: 0,
                },
            );
            sw.attach(
                Port::create(&fabric, &name, 1, 4, None).unwrap(),
                PortId::new(i as u8),
            )
            .unwrap();
        }
        assert_eq!(sw.len(), MAX_PORTS);
        fabric.provision(
            "overflow0",
            SimNicSpec {
                queues: 1,
                buf_size: 64,
                pool_bufs: 0,
            },
        );
        let extra = Port::create(&fabric, "overflow0", 1, 4, None).unwrap();
        assert!(matches!(
            sw.attach(extra, PortId::new(0)),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn detach_unknown_port_is_not_found() {
        let mut sw = Switch::new();
        assert!(matches!(sw.detach("ghost0"), Err(Error::NotFound(_))));
    }

    #[test]
    fn detach_referenced_port_is_busy() {
        let fabric = fabric_with(&["sim0"]);
        let mut sw = Switch::new();
        sw.attach(port(&fabric, "sim0"), PortId::new(0)).unwrap();
        let grant = sw.claim(PortId::new(0), 0).unwrap();
        assert!(matches!(sw.detach("sim0"), Err(Error::Busy(_))));
        sw.release(PortId::new(0), grant).unwrap();
        assert!(sw.detach("sim0").is_ok());
    }
}
