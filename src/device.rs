//! The device-facing seam: registration requests and open ring descriptors.
//!
//! A backend (the in-tree simulated fabric, or a kernel-bypass driver) only
//! has to implement [`Device::open`]; everything above it, from ports to
//! the port table to workers, is backend-agnostic.

use std::sync::Arc as StdArc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::eventfd::EventFd;
use triomphe::Arc;

use crate::errors::Result;
use crate::ring::{MemRegion, Ring};

/// Interface names are bounded like the kernel's.
pub const IFNAMSIZ: usize = libc::IFNAMSIZ;

/// What the device actually granted for a registration.
#[derive(Clone, Copy, Debug)]
pub struct RegInfo {
    pub rings: u16,
    pub slots: u32,
}

/// Whether a registration binds every hardware queue or exactly one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Bind {
    #[default]
    All,
    Queue(u16),
}

/// Whether the open establishes a fresh memory mapping or reuses one the
/// caller already holds (the no-remap path, and the way two interfaces come
/// to share a single buffer pool).
#[derive(Clone, Default)]
pub enum MemMode {
    #[default]
    Map,
    Reuse(Arc<MemRegion>),
}

impl std::fmt::Debug for MemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemMode::Map => write!(f, "Map"),
            MemMode::Reuse(r) => write!(f, "Reuse(region {})", r.id()),
        }
    }
}

/// A registration request: desired ring and per-ring slot counts plus the
/// binding and memory modes.
#[derive(Clone, Debug)]
pub struct OpenSpec {
    pub rings: u16,
    pub slots: u32,
    pub bind: Bind,
    pub mem: MemMode,
}

impl OpenSpec {
    pub fn new(rings: u16, slots: u32) -> Self {
        Self {
            rings,
            slots,
            bind: Bind::All,
            mem: MemMode::Map,
        }
    }

    pub fn bind(mut self, bind: Bind) -> Self {
        self.bind = bind;
        self
    }

    pub fn mem(mut self, mem: MemMode) -> Self {
        self.mem = mem;
        self
    }
}

/// A packet device that can be registered against.
pub trait Device: Send + Sync {
    fn open(&self, iface: &str, spec: &OpenSpec) -> Result<RingDesc>;
}

/// Close bookkeeping for one open descriptor. Dropping the guard is the
/// close; it runs exactly once.
pub struct OpenGuard {
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl OpenGuard {
    pub fn new(closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            closer: Some(Box::new(closer)),
        }
    }

    pub fn noop() -> Self {
        Self { closer: None }
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        if let Some(close) = self.closer.take() {
            close();
        }
    }
}

/// One open handle onto a device: the granted registration, the shared
/// memory region, one receive and one transmit ring, and the poll handle
/// that reports receive readiness.
///
/// For a [`Bind::All`] registration the ring views are those of queue 0;
/// such descriptors exist to be read for their registration state and
/// closed (the baseline open of the port binding protocol).
pub struct RingDesc {
    queue: u16,
    info: RegInfo,
    region: Arc<MemRegion>,
    rx: Arc<Ring>,
    tx: Arc<Ring>,
    irq: StdArc<EventFd>,
    doorbell: StdArc<EventFd>,
    alive: StdArc<AtomicBool>,
    pub(crate) claimed: bool,
    _guard: OpenGuard,
}

impl RingDesc {
    pub fn new(
        queue: u16,
        info: RegInfo,
        region: Arc<MemRegion>,
        rx: Arc<Ring>,
        tx: Arc<Ring>,
        irq: StdArc<EventFd>,
        doorbell: StdArc<EventFd>,
        alive: StdArc<AtomicBool>,
        guard: OpenGuard,
    ) -> Self {
        Self {
            queue,
            info,
            region,
            rx,
            tx,
            irq,
            doorbell,
            alive,
            claimed: false,
            _guard: guard,
        }
    }

    pub fn queue(&self) -> u16 {
        self.queue
    }

    pub fn info(&self) -> RegInfo {
        self.info
    }

    pub fn region(&self) -> &Arc<MemRegion> {
        &self.region
    }

    pub fn rx(&self) -> &Arc<Ring> {
        &self.rx
    }

    pub fn tx(&self) -> &Arc<Ring> {
        &self.tx
    }

    pub fn irq(&self) -> &StdArc<EventFd> {
        &self.irq
    }

    pub fn doorbell(&self) -> &StdArc<EventFd> {
        &self.doorbell
    }

    pub fn alive(&self) -> &StdArc<AtomicBool> {
        &self.alive
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RingDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingDesc")
            .field("queue", &self.queue)
            .field("region", &self.region.id())
            .field("claimed", &self.claimed)
            .finish()
    }
}
