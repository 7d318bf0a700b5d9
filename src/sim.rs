//! An in-process packet fabric implementing [`Device`].
//!
//! It stands where the kernel side of a bypass driver would stand: NICs are
//! provisioned by name, registrations bind their queues, readiness is a real
//! eventfd so workers can `poll(2)` it, and a pump moves frames between
//! wired NIC pairs (swapping buffer indexes when both sides live in one
//! region). Fault hooks let tests exercise the rollback and ring-failure
//! paths.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc as StdArc, Mutex};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::debug;
use triomphe::Arc;

use crate::device::{Bind, Device, MemMode, OpenGuard, OpenSpec, RegInfo, RingDesc};
use crate::errors::{Error, Result};
use crate::ring::{self, MemRegion, Ring, RingSlot};
use crate::worker::ShutdownToken;

const PUMP_TICK_MS: u16 = 20;

/// Capabilities of a provisioned NIC.
#[derive(Clone, Debug)]
pub struct SimNicSpec {
    /// Hardware queue pairs the NIC exposes.
    pub queues: u16,
    /// Size of one packet buffer.
    pub buf_size: usize,
    /// Buffer-pool capacity; 0 sizes it from the first registration with
    /// headroom for one master-linked twin.
    pub pool_bufs: usize,
}

impl Default for SimNicSpec {
    fn default() -> Self {
        Self {
            queues: 1,
            buf_size: 2048,
            pool_bufs: 0,
        }
    }
}

struct QueuePair {
    irq: StdArc<EventFd>,
    rx: Arc<Ring>,
    tx: Arc<Ring>,
}

struct NicState {
    region: Arc<MemRegion>,
    granted: RegInfo,
    queues: Vec<QueuePair>,
    doorbell: StdArc<EventFd>,
}

struct Nic {
    spec: SimNicSpec,
    state: Option<NicState>,
    open_now: StdArc<AtomicUsize>,
    failing: HashSet<u16>,
    plugged: StdArc<AtomicBool>,
    link: Option<String>,
    delivered: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Default)]
struct Inner {
    nics: HashMap<String, Nic>,
}

/// The fabric itself. One lock guards the NIC table; the rings hanging off
/// it are lock-free SPSC state shared with the descriptors already handed
/// out.
#[derive(Default)]
pub struct SimFabric {
    inner: Mutex<Inner>,
}

fn open_err(iface: &str, source: io::Error) -> Error {
    Error::Open {
        iface: iface.to_owned(),
        source,
    }
}

fn new_eventfd(iface: &str) -> Result<StdArc<EventFd>> {
    EventFd::from_flags(EfdFlags::EFD_NONBLOCK)
        .map(StdArc::new)
        .map_err(|e| open_err(iface, e.into()))
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a NIC under `name`. Replaces any previous one.
    pub fn provision(&self, name: &str, spec: SimNicSpec) {
        let mut inner = self.inner.lock().unwrap();
        inner.nics.insert(
            name.to_owned(),
            Nic {
                spec,
                state: None,
                open_now: StdArc::new(AtomicUsize::new(0)),
                failing: HashSet::new(),
                plugged: StdArc::new(AtomicBool::new(true)),
                link: None,
                delivered: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            },
        );
    }

    /// Connects two NICs back to back; `pump` then forwards queue `i` of
    /// each to queue `i` of the other.
    pub fn wire(&self, a: &str, b: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.nics.contains_key(a) {
            return Err(Error::NotFound(a.to_owned()));
        }
        if !inner.nics.contains_key(b) {
            return Err(Error::NotFound(b.to_owned()));
        }
        inner.nics.get_mut(a).unwrap().link = Some(b.to_owned());
        inner.nics.get_mut(b).unwrap().link = Some(a.to_owned());
        Ok(())
    }

    /// Number of descriptors currently open on `name`.
    pub fn open_count(&self, name: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .nics
            .get(name)
            .map(|n| n.open_now.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Makes the next single-queue registration of `queue` fail.
    pub fn fail_queue(&self, name: &str, queue: u16) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(nic) = inner.nics.get_mut(name) {
            nic.failing.insert(queue);
        }
    }

    /// Simulates device removal: every open descriptor's liveness flag is
    /// cleared and all pollers are woken.
    pub fn unplug(&self, name: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(nic) = inner.nics.get(name) {
            nic.plugged.store(false, Ordering::Release);
            if let Some(state) = nic.state.as_ref() {
                for pair in &state.queues {
                    let _ = pair.irq.write(1);
                }
            }
        }
    }

    pub fn region_id(&self, name: &str) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .nics
            .get(name)
            .and_then(|n| n.state.as_ref())
            .map(|s| s.region.id())
    }

    pub fn delivered(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .nics
            .get(name)
            .map(|n| n.delivered.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn discarded(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .nics
            .get(name)
            .map(|n| n.discarded.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Delivers one frame into a NIC's receive queue, as arriving traffic
    /// would, and signals readiness.
    pub fn inject(&self, name: &str, queue: u16, frame: &[u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let nic = inner
            .nics
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        let state = nic
            .state
            .as_ref()
            .ok_or(Error::InvalidArgument("interface not registered"))?;
        let pair = state
            .queues
            .get(queue as usize)
            .ok_or(Error::InvalidArgument("no such queue"))?;
        if frame.len() > state.region.buf_size() {
            return Err(Error::InvalidArgument("frame larger than pool buffer"));
        }
        let di = pair
            .rx
            .prod_next()
            .ok_or(Error::ResourceExhausted("receive ring"))?;
        // SAFETY: `di` came from prod_next and the fabric is the sole
        // producer of this rx ring; the slot's buffer is idle.
        unsafe {
            let slot = pair.rx.read_slot(di);
            let buf = &mut *state.region.buffer(slot.buf_idx);
            buf[..frame.len()].copy_from_slice(frame);
            pair.rx.write_slot(
                di,
                RingSlot {
                    buf_idx: slot.buf_idx,
                    len: frame.len() as u16,
                    flags: 0,
                },
            );
        }
        pair.rx.prod_advance();
        let _ = pair.irq.write(1);
        Ok(())
    }

    /// Pulls one transmitted frame out of a NIC's transmit queue, as the
    /// wire would.
    pub fn harvest(&self, name: &str, queue: u16) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        let nic = inner
            .nics
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        let state = nic
            .state
            .as_ref()
            .ok_or(Error::InvalidArgument("interface not registered"))?;
        let pair = state
            .queues
            .get(queue as usize)
            .ok_or(Error::InvalidArgument("no such queue"))?;
        let Some(si) = pair.tx.cons_peek() else {
            return Ok(None);
        };
        // SAFETY: `si` came from cons_peek and the fabric is the sole
        // consumer of this tx ring.
        let out = unsafe {
            let slot = pair.tx.read_slot(si);
            let buf = &*state.region.buffer(slot.buf_idx);
            buf[..slot.len as usize].to_vec()
        };
        pair.tx.cons_advance();
        Ok(Some(out))
    }

    /// Moves transmitted frames across every wired pair (queue `i` to queue
    /// `i`), discarding the TX backlog of unwired NICs so rings cannot
    /// wedge. Returns the number of frames handled.
    pub fn pump(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let mut handled = 0usize;
        for nic in inner.nics.values() {
            let Some(state) = nic.state.as_ref() else {
                continue;
            };
            let peer = nic
                .link
                .as_ref()
                .and_then(|p| inner.nics.get(p))
                .and_then(|p| p.state.as_ref().map(|s| (p, s)));
            for (q, pair) in state.queues.iter().enumerate() {
                match peer {
                    Some((pnic, pstate)) if q < pstate.queues.len() => {
                        let dst = &pstate.queues[q];
                        let mut delivered = 0u64;
                        while let Some(si) = pair.tx.cons_peek() {
                            let Some(di) = dst.rx.prod_next() else {
                                break;
                            };
                            // SAFETY: fabric is sole consumer of `pair.tx`
                            // and sole producer of `dst.rx`; indexes are
                            // fresh and unadvanced.
                            unsafe {
                                if state.region.id() == pstate.region.id() {
                                    ring::exchange(&pair.tx, si, &dst.rx, di);
                                } else {
                                    let s = pair.tx.read_slot(si);
                                    ring::copy_frame(&state.region, s, &pstate.region, &dst.rx, di);
                                }
                            }
                            pair.tx.cons_advance();
                            dst.rx.prod_advance();
                            delivered += 1;
                        }
                        if delivered > 0 {
                            let _ = dst.irq.write(1);
                            pnic.delivered.fetch_add(delivered, Ordering::Relaxed);
                            handled += delivered as usize;
                        }
                    }
                    _ => {
                        while pair.tx.cons_peek().is_some() {
                            pair.tx.cons_advance();
                            nic.discarded.fetch_add(1, Ordering::Relaxed);
                            handled += 1;
                        }
                    }
                }
            }
        }
        handled
    }

    /// Runs the pump until `shutdown` fires, waiting on the NIC doorbells
    /// between passes.
    pub fn pump_loop(&self, shutdown: &ShutdownToken) {
        while !shutdown.is_signaled() {
            let doorbells: Vec<StdArc<EventFd>> = {
                let inner = self.inner.lock().unwrap();
                inner
                    .nics
                    .values()
                    .filter_map(|n| n.state.as_ref().map(|s| s.doorbell.clone()))
                    .collect()
            };
            if doorbells.is_empty() {
                std::thread::sleep(Duration::from_millis(PUMP_TICK_MS as u64));
            } else {
                let mut fds: Vec<PollFd> = doorbells
                    .iter()
                    .map(|d| PollFd::new(d.as_fd(), PollFlags::POLLIN))
                    .collect();
                let _ = poll(&mut fds, PollTimeout::from(PUMP_TICK_MS));
                drop(fds);
                for d in &doorbells {
                    let _ = d.read();
                }
            }
            self.pump();
        }
    }
}

impl Device for SimFabric {
    fn open(&self, iface: &str, spec: &OpenSpec) -> Result<RingDesc> {
        if iface.is_empty() {
            return Err(Error::InvalidArgument("empty interface name"));
        }
        if spec.rings == 0 || spec.slots == 0 {
            return Err(Error::InvalidArgument("zero rings or slots"));
        }
        let mut inner = self.inner.lock().unwrap();
        let nic = inner
            .nics
            .get_mut(iface)
            .ok_or_else(|| open_err(iface, io::Error::from(io::ErrorKind::NotFound)))?;
        if !nic.plugged.load(Ordering::Acquire) {
            return Err(open_err(iface, io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        if spec.rings > nic.spec.queues {
            return Err(open_err(
                iface,
                io::Error::other("ring count beyond device capability"),
            ));
        }
        let queue = match spec.bind {
            Bind::All => 0,
            Bind::Queue(q) => {
                if q >= nic.spec.queues {
                    return Err(open_err(iface, io::Error::other("no such queue")));
                }
                if nic.failing.remove(&q) {
                    return Err(open_err(iface, io::Error::other("injected open fault")));
                }
                q
            }
        };

        if nic.state.is_none() {
            let region = match &spec.mem {
                MemMode::Map => {
                    let pool = if nic.spec.pool_bufs > 0 {
                        nic.spec.pool_bufs
                    } else {
                        spec.rings as usize * spec.slots as usize * 4
                    };
                    MemRegion::new(nic.spec.buf_size, pool)
                }
                MemMode::Reuse(region) => region.clone(),
            };
            let mut queues = Vec::with_capacity(spec.rings as usize);
            for _ in 0..spec.rings {
                queues.push(QueuePair {
                    irq: new_eventfd(iface)?,
                    rx: Arc::new(Ring::with_buffers(&region, spec.slots)?),
                    tx: Arc::new(Ring::with_buffers(&region, spec.slots)?),
                });
            }
            nic.state = Some(NicState {
                region,
                granted: RegInfo {
                    rings: spec.rings,
                    slots: spec.slots,
                },
                queues,
                doorbell: new_eventfd(iface)?,
            });
            debug!(iface, rings = spec.rings, slots = spec.slots, "registered");
        }

        let state = nic.state.as_ref().expect("state built above");
        if let MemMode::Reuse(region) = &spec.mem {
            if region.id() != state.region.id() {
                return Err(Error::InvalidArgument("foreign memory region"));
            }
        }
        if queue >= state.granted.rings {
            return Err(open_err(iface, io::Error::other("no such queue")));
        }
        let pair = &state.queues[queue as usize];
        nic.open_now.fetch_add(1, Ordering::SeqCst);
        let open_now = nic.open_now.clone();
        let guard = OpenGuard::new(move || {
            open_now.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(RingDesc::new(
            queue,
            state.granted,
            state.region.clone(),
            pair.rx.clone(),
            pair.tx.clone(),
            pair.irq.clone(),
            state.doorbell.clone(),
            nic.plugged.clone(),
            guard,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(queues: u16) -> SimNicSpec {
        SimNicSpec {
            queues,
            buf_size: 256,
            pool_bufs: 0,
        }
    }

    #[test]
    fn open_counts_pair_with_close() {
        let fabric = SimFabric::new();
        fabric.provision("sim0", spec(2));
        let d0 = fabric.open("sim0", &OpenSpec::new(2, 8)).unwrap();
        let d1 = fabric
            .open(
                "sim0",
                &OpenSpec::new(2, 8)
                    .bind(Bind::Queue(1))
                    .mem(MemMode::Reuse(d0.region().clone())),
            )
            .unwrap();
        assert_eq!(fabric.open_count("sim0"), 2);
        drop(d1);
        assert_eq!(fabric.open_count("sim0"), 1);
        drop(d0);
        assert_eq!(fabric.open_count("sim0"), 0);
    }

    #[test]
    fn open_unknown_interface_fails() {
        let fabric = SimFabric::new();
        assert!(matches!(
            fabric.open("ghost0", &OpenSpec::new(1, 8)),
            Err(Error::Open { .. })
        ));
    }

    #[test]
    fn open_beyond_capability_fails() {
        let fabric = SimFabric::new();
        fabric.provision("sim0", spec(2));
        assert!(matches!(
            fabric.open("sim0", &OpenSpec::new(4, 8)),
            Err(Error::Open { .. })
        ));
    }

    #[test]
    fn inject_then_harvest_roundtrip() {
        let fabric = SimFabric::new();
        fabric.provision("sim0", spec(1));
        let desc = fabric.open("sim0", &OpenSpec::new(1, 8)).unwrap();
        fabric.inject("sim0", 0, b"abc").unwrap();
        // move the frame from rx to tx by hand, as a worker would
        let si = desc.rx().cons_peek().unwrap();
        let di = desc.tx().prod_next().unwrap();
        unsafe { ring::exchange(desc.rx(), si, desc.tx(), di) };
        desc.rx().cons_advance();
        desc.tx().prod_advance();
        assert_eq!(fabric.harvest("sim0", 0).unwrap().unwrap(), b"abc");
        assert!(fabric.harvest("sim0", 0).unwrap().is_none());
    }

    #[test]
    fn pump_moves_frames_across_wire() {
        let fabric = SimFabric::new();
        fabric.provision("sim0", spec(1));
        fabric.provision("sim1", spec(1));
        fabric.wire("sim0", "sim1").unwrap();
        let d0 = fabric.open("sim0", &OpenSpec::new(1, 8)).unwrap();
        let d1 = fabric.open("sim1", &OpenSpec::new(1, 8)).unwrap();

        // transmit from sim0
        let di = d0.tx().prod_next().unwrap();
        unsafe {
            let slot = d0.tx().read_slot(di);
            (&mut *d0.region().buffer(slot.buf_idx))[..4].copy_from_slice(b"ping");
            d0.tx().write_slot(di, RingSlot { len: 4, ..slot });
        }
        d0.tx().prod_advance();

        assert_eq!(fabric.pump(), 1);
        let si = d1.rx().cons_peek().expect("frame delivered");
        let slot = unsafe { d1.rx().read_slot(si) };
        let buf = unsafe { &*d1.region().buffer(slot.buf_idx) };
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(fabric.delivered("sim1"), 1);
    }

    #[test]
    fn unplug_clears_liveness() {
        let fabric = SimFabric::new();
        fabric.provision("sim0", spec(1));
        let desc = fabric.open("sim0", &OpenSpec::new(1, 8)).unwrap();
        assert!(desc.is_alive());
        fabric.unplug("sim0");
        assert!(!desc.is_alive());
        assert!(matches!(
            fabric.open("sim0", &OpenSpec::new(1, 8)),
            Err(Error::Open { .. })
        ));
    }
}
