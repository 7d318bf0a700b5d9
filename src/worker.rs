//! Worker threads: each owns an exclusive set of ring grants and polls them
//! in a loop, handing packets between rings without ever locking against
//! another worker. Exclusivity comes from [`Port::claim`]; two workers can
//! only overlap by the controller releasing and re-claiming a ring.
//!
//! [`Port::claim`]: crate::port::Port::claim

use std::os::fd::AsFd;
use std::sync::Arc as StdArc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arrayvec::ArrayVec;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::port::RingGrant;
use crate::ring::{self, MemRegion, Ring, RingSlot};
use crate::switch::{MAX_PORTS, PortId};

/// Bound on the idle readiness wait; shutdown latency is at most this.
const POLL_TIMEOUT_MS: u16 = 100;

/// One-shot, broadcast shutdown signal. Signaling is idempotent and cannot
/// be retracted.
#[derive(Clone, Default)]
pub struct ShutdownToken(StdArc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Polling = 1,
    Draining = 2,
    Stopping = 3,
    Terminated = 4,
}

impl WorkerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Polling,
            2 => Self::Draining,
            3 => Self::Stopping,
            _ => Self::Terminated,
        }
    }
}

/// Ring failures reported to the controller. The worker keeps running with
/// the failed ring skipped; recovering the port is the controller's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    RingDisabled {
        worker: u8,
        port: PortId,
        queue: u16,
    },
    /// Every owned ring of this port is gone.
    PortLost { worker: u8, port: PortId },
}

/// What the forwarding policy gets to look at.
pub struct PacketView<'a> {
    pub frame: &'a [u8],
    pub queue: u16,
}

/// The external forwarding decision: where does a packet received on `src`
/// go? Returning [`PortId::DROP`] discards it, [`PortId::BROADCAST`] sends
/// it to every other owned ring.
pub trait ForwardPolicy: Send + Sync {
    fn decide(&self, src: PortId, pkt: &PacketView<'_>) -> PortId;
}

impl<F> ForwardPolicy for F
where
    F: Fn(PortId, &PacketView<'_>) -> PortId + Send + Sync,
{
    fn decide(&self, src: PortId, pkt: &PacketView<'_>) -> PortId {
        self(src, pkt)
    }
}

#[derive(Default)]
pub struct WorkerCounters {
    pub received: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
}

struct OwnedRing {
    port: PortId,
    grant: RingGrant,
    dead: bool,
}

/// A worker thread's resources: its identity and the rings it exclusively
/// owns. Construct with [`Worker::new`], start with [`Worker::spawn`].
pub struct Worker {
    id: u8,
    rings: ArrayVec<OwnedRing, MAX_PORTS>,
    policy: StdArc<dyn ForwardPolicy>,
    shutdown: ShutdownToken,
    events: Sender<WorkerEvent>,
    state: StdArc<AtomicU8>,
    counters: StdArc<WorkerCounters>,
}

impl Worker {
    pub fn new(
        id: u8,
        grants: impl IntoIterator<Item = (PortId, RingGrant)>,
        policy: StdArc<dyn ForwardPolicy>,
        shutdown: ShutdownToken,
        events: Sender<WorkerEvent>,
    ) -> Result<Self> {
        let mut rings = ArrayVec::new();
        for (port, grant) in grants {
            if rings.is_full() {
                return Err(Error::ResourceExhausted("worker ring table"));
            }
            rings.push(OwnedRing {
                port,
                grant,
                dead: false,
            });
        }
        Ok(Self {
            id,
            rings,
            policy,
            shutdown,
            events,
            state: StdArc::new(AtomicU8::new(WorkerState::Idle as u8)),
            counters: StdArc::new(WorkerCounters::default()),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn spawn(self) -> Result<WorkerHandle> {
        let id = self.id;
        let state = self.state.clone();
        let counters = self.counters.clone();
        let thread = thread::Builder::new()
            .name(format!("worker{id}"))
            .spawn(move || self.run())
            .map_err(|_| Error::Allocation("worker thread"))?;
        Ok(WorkerHandle {
            id,
            state,
            counters,
            thread,
        })
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn run(mut self) -> Vec<(PortId, RingGrant)> {
        debug!(worker = self.id, rings = self.rings.len(), "worker started");
        self.set_state(WorkerState::Polling);
        loop {
            if self.shutdown.is_signaled() {
                break;
            }
            let mut ready: ArrayVec<usize, MAX_PORTS> = ArrayVec::new();
            {
                let live: ArrayVec<usize, MAX_PORTS> = self
                    .rings
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| !r.dead)
                    .map(|(i, _)| i)
                    .collect();
                if live.is_empty() {
                    // nothing left to poll; stay responsive to shutdown
                    thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
                    continue;
                }
                let mut fds: ArrayVec<PollFd, MAX_PORTS> = live
                    .iter()
                    .map(|&i| PollFd::new(self.rings[i].grant.irq.as_fd(), PollFlags::POLLIN))
                    .collect();
                match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                    Ok(0) => continue,
                    Ok(_) => {
                        for (k, fd) in fds.iter().enumerate() {
                            match fd.revents() {
                                Some(revents) if !revents.is_empty() => ready.push(live[k]),
                                _ => {}
                            }
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(errno) => {
                        warn!(worker = self.id, %errno, "poll failed");
                        thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS as u64));
                        continue;
                    }
                }
            }
            if !ready.is_empty() {
                self.set_state(WorkerState::Draining);
                for i in ready {
                    self.drain(i);
                }
                self.set_state(WorkerState::Polling);
            }
        }
        self.set_state(WorkerState::Stopping);
        debug!(worker = self.id, "worker stopping");
        self.set_state(WorkerState::Terminated);
        self.rings
            .into_iter()
            .map(|r| (r.port, r.grant))
            .collect()
    }

    /// Moves every packet waiting on ring `i` to wherever the policy says.
    fn drain(&mut self, i: usize) {
        let port = self.rings[i].port;
        let queue = self.rings[i].grant.queue;
        if !self.rings[i].grant.alive.load(Ordering::Acquire) {
            self.disable(i);
            return;
        }
        if let Err(errno) = self.rings[i].grant.irq.read() {
            if errno != Errno::EAGAIN {
                warn!(worker = self.id, %port, queue, %errno, "poll handle failed");
                self.disable(i);
                return;
            }
        }
        let rx = self.rings[i].grant.rx.clone();
        let region = self.rings[i].grant.region.clone();
        let mut kicks: ArrayVec<usize, MAX_PORTS> = ArrayVec::new();
        while let Some(si) = rx.cons_peek() {
            // SAFETY: this worker is the sole consumer of its rx rings; the
            // slot stays ours until cons_advance below.
            let slot = unsafe { rx.read_slot(si) };
            self.counters.received.fetch_add(1, Ordering::Relaxed);
            let frame = unsafe { &(&*region.buffer(slot.buf_idx))[..slot.len as usize] };
            let dst = self.policy.decide(port, &PacketView { frame, queue });
            if dst == PortId::DROP {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            } else if dst == PortId::BROADCAST {
                self.fan_out(i, slot, &region, &mut kicks);
            } else {
                self.unicast(si, slot, &rx, &region, dst, &mut kicks);
            }
            rx.cons_advance();
        }
        for j in kicks {
            let _ = self.rings[j].grant.doorbell.write(1);
        }
    }

    /// Zero-copy hand-off into the owned ring of `dst`; falls back to a
    /// byte copy when the two rings live in different regions.
    fn unicast(
        &self,
        si: u32,
        slot: RingSlot,
        rx: &Ring,
        region: &MemRegion,
        dst: PortId,
        kicks: &mut ArrayVec<usize, MAX_PORTS>,
    ) {
        let Some(j) = self
            .rings
            .iter()
            .position(|r| !r.dead && r.port == dst)
        else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let target = &self.rings[j].grant;
        let Some(di) = target.tx.prod_next() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        // SAFETY: si/di are fresh cursor positions on rings this worker
        // exclusively owns the sw side of.
        unsafe {
            if target.region.id() == region.id() {
                ring::exchange(rx, si, &target.tx, di);
            } else {
                ring::copy_frame(region, slot, &target.region, &target.tx, di);
            }
        }
        target.tx.prod_advance();
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        if !kicks.contains(&j) {
            kicks.push(j);
        }
    }

    /// Broadcast: one copy per other live owned ring. Fan-out cannot reuse
    /// a single buffer, so this path always copies.
    fn fan_out(
        &self,
        src: usize,
        slot: RingSlot,
        region: &MemRegion,
        kicks: &mut ArrayVec<usize, MAX_PORTS>,
    ) {
        let src_port = self.rings[src].port;
        for (j, owned) in self.rings.iter().enumerate() {
            if owned.dead || owned.port == src_port {
                continue;
            }
            let target = &owned.grant;
            let Some(di) = target.tx.prod_next() else {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            // SAFETY: as in unicast; di is fresh and unadvanced.
            unsafe { ring::copy_frame(region, slot, &target.region, &target.tx, di) };
            target.tx.prod_advance();
            self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            if !kicks.contains(&j) {
                kicks.push(j);
            }
        }
    }

    fn disable(&mut self, i: usize) {
        if self.rings[i].dead {
            return;
        }
        self.rings[i].dead = true;
        let port = self.rings[i].port;
        let queue = self.rings[i].grant.queue;
        warn!(worker = self.id, %port, queue, "ring disabled");
        let _ = self.events.send(WorkerEvent::RingDisabled {
            worker: self.id,
            port,
            queue,
        });
        if !self.rings.iter().any(|r| !r.dead && r.port == port) {
            let _ = self.events.send(WorkerEvent::PortLost {
                worker: self.id,
                port,
            });
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("rings", &self.rings.len())
            .finish()
    }
}

/// Controller-side handle to a spawned worker.
pub struct WorkerHandle {
    id: u8,
    state: StdArc<AtomicU8>,
    counters: StdArc<WorkerCounters>,
    thread: JoinHandle<Vec<(PortId, RingGrant)>>,
}

impl WorkerHandle {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn counters(&self) -> StdArc<WorkerCounters> {
        self.counters.clone()
    }

    /// Waits for termination and returns the grants so the controller can
    /// release them back to their ports.
    pub fn join(self) -> thread::Result<Vec<(PortId, RingGrant)>> {
        self.thread.join()
    }
}
