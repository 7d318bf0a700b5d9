//! A switch port: one interface opened as N independently pollable
//! single-queue descriptors sharing one memory mapping.

use std::sync::Arc as StdArc;
use std::sync::atomic::AtomicBool;

use arrayvec::ArrayString;
use nix::sys::eventfd::EventFd;
use tracing::debug;
use triomphe::Arc;

use crate::device::{Bind, Device, IFNAMSIZ, MemMode, OpenSpec, RingDesc};
use crate::errors::{Error, Result};
use crate::ring::{MemRegion, Ring};

/// Exclusive use of one hardware queue of a port: the poll handle, the
/// receive and transmit rings, and the region they allocate from. This is
/// what a worker owns; it exists only between [`Port::claim`] and
/// [`Port::release`].
pub struct RingGrant {
    pub(crate) iface: ArrayString<IFNAMSIZ>,
    pub(crate) queue: u16,
    pub(crate) region: Arc<MemRegion>,
    pub(crate) rx: Arc<Ring>,
    pub(crate) tx: Arc<Ring>,
    pub(crate) irq: StdArc<EventFd>,
    pub(crate) doorbell: StdArc<EventFd>,
    pub(crate) alive: StdArc<AtomicBool>,
}

impl RingGrant {
    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn queue(&self) -> u16 {
        self.queue
    }

    pub fn region(&self) -> &Arc<MemRegion> {
        &self.region
    }
}

impl std::fmt::Debug for RingGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingGrant")
            .field("iface", &self.iface.as_str())
            .field("queue", &self.queue)
            .finish()
    }
}

/// One network interface bound into the switch: a reference count, the
/// bounded interface name, and one ring descriptor per hardware queue.
pub struct Port {
    iface: ArrayString<IFNAMSIZ>,
    refs: u32,
    rings: Vec<RingDesc>,
}

impl Port {
    /// Binds `iface` as `rings` independently owned queue descriptors over
    /// one shared mapping.
    ///
    /// The interface is first registered whole to validate capability and
    /// capture registration defaults (inheriting `master`'s buffer pool
    /// when given, so two ports can exchange buffers zero-copy); that
    /// baseline descriptor is closed immediately. Queue 0 is then re-opened
    /// in single-queue mode as the pool anchor, and every further queue is
    /// re-opened against the anchor's region so the mapping is never
    /// duplicated.
    ///
    /// On any failure every descriptor opened so far is closed before the
    /// error is returned; a half-bound port never leaks.
    pub fn create(
        dev: &dyn Device,
        iface: &str,
        rings: u16,
        slots: u32,
        master: Option<&Port>,
    ) -> Result<Port> {
        if iface.is_empty() {
            return Err(Error::InvalidArgument("empty interface name"));
        }
        if rings == 0 || slots == 0 {
            return Err(Error::InvalidArgument("zero rings or slots"));
        }
        let name = ArrayString::from(iface)
            .map_err(|_| Error::InvalidArgument("interface name too long"))?;

        let mem = master
            .map(|p| MemMode::Reuse(p.region().clone()))
            .unwrap_or(MemMode::Map);
        let baseline = dev.open(iface, &OpenSpec::new(rings, slots).mem(mem))?;
        let granted = baseline.info();
        let pool = baseline.region().clone();
        // The baseline registration exists only for its defaults and, when a
        // master was given, to anchor the shared pool.
        drop(baseline);

        let mut descs: Vec<RingDesc> = Vec::with_capacity(rings as usize);
        for q in 0..rings {
            let region = descs
                .first()
                .map(|anchor| anchor.region().clone())
                .unwrap_or_else(|| pool.clone());
            let spec = OpenSpec::new(rings, granted.slots)
                .bind(Bind::Queue(q))
                .mem(MemMode::Reuse(region));
            // `?` drops `descs`, closing queues 0..q.
            let desc = dev.open(iface, &spec)?;
            debug_assert_eq!(desc.region().id(), pool.id());
            descs.push(desc);
        }

        debug!(iface, rings, slots = granted.slots, "port bound");
        Ok(Port {
            iface: name,
            refs: 0,
            rings: descs,
        })
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn ring_count(&self) -> u16 {
        self.rings.len() as u16
    }

    /// Workers currently holding one of this port's rings.
    pub fn refs(&self) -> u32 {
        self.refs
    }

    /// The buffer pool shared by every ring of this port.
    pub fn region(&self) -> &Arc<MemRegion> {
        self.rings[0].region()
    }

    pub fn ring(&self, queue: u16) -> Option<&RingDesc> {
        self.rings.get(queue as usize)
    }

    /// Hands queue `queue` to a worker, bumping the reference count. A
    /// queue can be out only once; claiming it again is `Busy`.
    pub fn claim(&mut self, queue: u16) -> Result<RingGrant> {
        let iface = self.iface;
        let desc = self
            .rings
            .get_mut(queue as usize)
            .ok_or(Error::InvalidArgument("no such queue"))?;
        if desc.claimed {
            return Err(Error::Busy(iface.to_string()));
        }
        desc.claimed = true;
        self.refs += 1;
        Ok(RingGrant {
            iface,
            queue,
            region: desc.region().clone(),
            rx: desc.rx().clone(),
            tx: desc.tx().clone(),
            irq: desc.irq().clone(),
            doorbell: desc.doorbell().clone(),
            alive: desc.alive().clone(),
        })
    }

    /// Takes a grant back and drops the reference count.
    pub fn release(&mut self, grant: RingGrant) -> Result<()> {
        if grant.iface.as_str() != self.iface.as_str() {
            return Err(Error::InvalidArgument("grant belongs to another port"));
        }
        let desc = self
            .rings
            .get_mut(grant.queue as usize)
            .ok_or(Error::InvalidArgument("no such queue"))?;
        if !desc.claimed {
            return Err(Error::InvalidArgument("queue is not claimed"));
        }
        desc.claimed = false;
        self.refs -= 1;
        Ok(())
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        debug_assert_eq!(self.refs, 0, "port destroyed while referenced");
        debug!(iface = self.iface.as_str(), "port closed");
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("iface", &self.iface.as_str())
            .field("refs", &self.refs)
            .field("rings", &self.rings.len())
            .finish()
    }
}
