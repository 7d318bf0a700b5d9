//! Shared packet memory and the per-queue slot rings built on top of it.
//!
//! A [`MemRegion`] is one mapping of equal-sized packet buffers; every ring
//! bound to the same region trades buffers by index, which is what makes the
//! hand-off in [`exchange`] free of byte copies.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use triomphe::Arc;

use crate::errors::{Error, Result};

/// Slot flag: the buffer index of this slot changed hands.
pub const SLOT_BUF_CHANGED: u16 = 0x0001;

/// One ring slot. Mirrors the hardware view: a buffer index, the byte count
/// of the frame it holds, and flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct RingSlot {
    pub buf_idx: u32,
    pub len: u16,
    pub flags: u16,
}

static REGION_IDS: AtomicU32 = AtomicU32::new(0);

/// A fixed pool of packet buffers shared by every ring bound to it.
///
/// Buffer indexes are handed out once, when a ring is bound, by the bump
/// allocator in [`alloc_range`](MemRegion::alloc_range); after that the pool
/// is read-only shared state and needs no locking.
pub struct MemRegion {
    id: u32,
    buf_size: usize,
    cap: usize,
    next: AtomicUsize,
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the region itself is append-only bookkeeping; buffer bytes are
// only touched through `buffer`, whose callers hold exclusive slot ownership.
unsafe impl Send for MemRegion {}
unsafe impl Sync for MemRegion {}

impl MemRegion {
    pub fn new(buf_size: usize, cap: usize) -> Arc<Self> {
        Arc::new(Self {
            id: REGION_IDS.fetch_add(1, Ordering::SeqCst),
            buf_size,
            cap,
            next: AtomicUsize::new(0),
            data: UnsafeCell::new(vec![0u8; buf_size * cap].into_boxed_slice()),
        })
    }

    /// Process-unique identity. Two descriptors may swap buffers only when
    /// their region ids are equal.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Reserves `n` fresh buffer indexes, returning the first.
    pub fn alloc_range(&self, n: usize) -> Result<u32> {
        let start = self.next.fetch_add(n, Ordering::SeqCst);
        if start + n > self.cap {
            // The range stays burned; ring binding is not retried piecemeal.
            return Err(Error::Allocation("memory region exhausted"));
        }
        Ok(start as u32)
    }

    /// Raw access to one buffer.
    ///
    /// # Safety
    ///
    /// The caller must own the slot currently holding `idx`; two owners of
    /// the same index at once is a data race.
    pub unsafe fn buffer(&self, idx: u32) -> *mut [u8] {
        if idx as usize >= self.cap {
            panic!("buffer index out of range");
        }
        let base = unsafe { (*self.data.get()).as_mut_ptr() };
        let ptr = unsafe { base.add(idx as usize * self.buf_size) };
        std::ptr::slice_from_raw_parts_mut(ptr, self.buf_size)
    }
}

impl std::fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRegion")
            .field("id", &self.id)
            .field("buf_size", &self.buf_size)
            .field("cap", &self.cap)
            .finish()
    }
}

/// A single-producer single-consumer slot ring.
///
/// RX rings are produced by the device and consumed by the owning worker;
/// TX rings the other way around. Every slot permanently carries a buffer
/// index, so the ring never allocates: moving a packet means moving an
/// index, not bytes.
pub struct Ring {
    num_slots: u32,
    prod: AtomicU32,
    cons: AtomicU32,
    slots: Box<[UnsafeCell<RingSlot>]>,
}

// SAFETY: cursor ownership is split producer/consumer; a slot is touched
// only by the side whose cursor currently covers it.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Builds a ring whose slots are pre-loaded with fresh buffers from
    /// `region`, one per slot.
    pub fn with_buffers(region: &MemRegion, num_slots: u32) -> Result<Self> {
        let first = region.alloc_range(num_slots as usize)?;
        let slots = (0..num_slots)
            .map(|i| {
                UnsafeCell::new(RingSlot {
                    buf_idx: first + i,
                    len: 0,
                    flags: 0,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            num_slots,
            prod: AtomicU32::new(0),
            cons: AtomicU32::new(0),
            slots,
        })
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    fn next(&self, i: u32) -> u32 {
        if i + 1 == self.num_slots { 0 } else { i + 1 }
    }

    /// Index of the next filled slot, if any. Consumer side.
    #[inline]
    pub fn cons_peek(&self) -> Option<u32> {
        let cons = self.cons.load(Ordering::Relaxed);
        if cons == self.prod.load(Ordering::Acquire) {
            None
        } else {
            Some(cons)
        }
    }

    /// Releases the slot returned by the last `cons_peek`.
    #[inline]
    pub fn cons_advance(&self) {
        let cons = self.cons.load(Ordering::Relaxed);
        self.cons.store(self.next(cons), Ordering::Release);
    }

    /// Index of the next free slot, if any. Producer side.
    #[inline]
    pub fn prod_next(&self) -> Option<u32> {
        let prod = self.prod.load(Ordering::Relaxed);
        if self.next(prod) == self.cons.load(Ordering::Acquire) {
            None
        } else {
            Some(prod)
        }
    }

    /// Publishes the slot returned by the last `prod_next`.
    #[inline]
    pub fn prod_advance(&self) {
        let prod = self.prod.load(Ordering::Relaxed);
        self.prod.store(self.next(prod), Ordering::Release);
    }

    /// # Safety
    ///
    /// `idx` must come from `cons_peek`/`prod_next` on the side the caller
    /// plays, and the matching advance must not have happened yet.
    #[inline]
    pub unsafe fn read_slot(&self, idx: u32) -> RingSlot {
        unsafe { *self.slots[idx as usize].get() }
    }

    /// # Safety
    ///
    /// Same contract as [`read_slot`](Ring::read_slot).
    #[inline]
    pub unsafe fn write_slot(&self, idx: u32, slot: RingSlot) {
        unsafe { *self.slots[idx as usize].get() = slot }
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("num_slots", &self.num_slots)
            .finish()
    }
}

/// Zero-copy hand-off: the filled buffer of `src` slot `si` moves into `dst`
/// slot `di`, and `dst`'s idle buffer moves back, keeping both rings fully
/// populated. Legal only when both rings share one region.
///
/// # Safety
///
/// `si`/`di` obey the [`read_slot`](Ring::read_slot) contract: `si` from
/// `src.cons_peek()`, `di` from `dst.prod_next()`, neither yet advanced.
pub unsafe fn exchange(src: &Ring, si: u32, dst: &Ring, di: u32) {
    let s = unsafe { src.read_slot(si) };
    let d = unsafe { dst.read_slot(di) };
    unsafe {
        dst.write_slot(
            di,
            RingSlot {
                buf_idx: s.buf_idx,
                len: s.len,
                flags: SLOT_BUF_CHANGED,
            },
        );
        src.write_slot(
            si,
            RingSlot {
                buf_idx: d.buf_idx,
                len: 0,
                flags: SLOT_BUF_CHANGED,
            },
        );
    }
}

/// Copying hand-off for cross-region forwarding and fan-out: the frame in
/// `s` is written into the buffer already owned by `dst` slot `di`.
///
/// # Safety
///
/// `s` must be a slot read under the consumer contract of its ring and `di`
/// must come from `dst.prod_next()`, not yet advanced.
pub unsafe fn copy_frame(
    src_region: &MemRegion,
    s: RingSlot,
    dst_region: &MemRegion,
    dst: &Ring,
    di: u32,
) {
    let sbuf = unsafe { &*src_region.buffer(s.buf_idx) };
    let d = unsafe { dst.read_slot(di) };
    let dbuf = unsafe { &mut *dst_region.buffer(d.buf_idx) };
    let len = (s.len as usize).min(dbuf.len());
    dbuf[..len].copy_from_slice(&sbuf[..len]);
    unsafe {
        dst.write_slot(
            di,
            RingSlot {
                buf_idx: d.buf_idx,
                len: len as u16,
                flags: 0,
            },
        );
    }
}
