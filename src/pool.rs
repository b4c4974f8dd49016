//! Lock-free shared slot pool.
//!
//! One backing allocation is cut into fixed-size slots. The leading slots
//! serve the TX direction and the rest RX, so senders and receivers never
//! contend on the same cursor or slot states. [`SlotPool::new`] splits the
//! slots evenly; [`SlotPool::for_region`] allocates one direction only, for an
//! endpoint that never uses the other.
//!
//! Each slot has an `AtomicU32` state: 0 is FREE, any other value is the
//! number of live references. A slot is claimed with `CAS(0 → 1)`, shared by
//! bumping the count and returned to FREE when the count drops back to 0.
//!
//! [`SlotLease`] is the single writer of a freshly acquired slot.
//! [`SlotLease::freeze`] turns it into a read-only [`SharedSlot`] that can be
//! cloned and moved between threads without copying the bytes.

use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::Error;

const FREE: u32 = 0;

/// Pool region a slot is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Tx,
    Rx,
}

pub struct SlotPool {
    memory: NonNull<u8>,
    len: usize,
    slot_size: usize,
    tx_slots: usize,
    rx_slots: usize,
    states: Box<[AtomicU32]>,
    tx_cursor: AtomicUsize,
    rx_cursor: AtomicUsize,
}

// Slot bytes are only written through a `SlotLease`, which the state CAS
// makes unique, and only read through `SharedSlot`s after the lease is gone.
unsafe impl Send for SlotPool {}
unsafe impl Sync for SlotPool {}

impl SlotPool {
    /// Allocate `num_slots` slots of `slot_size` bytes. `num_slots` must be
    /// even and at least 2.
    pub fn new(num_slots: usize, slot_size: usize) -> Result<Arc<Self>, Error> {
        if num_slots < 2 || num_slots % 2 != 0 {
            return Err(Error::InvalidParams);
        }
        Self::with_regions(num_slots / 2, num_slots / 2, slot_size)
    }

    /// Allocate `num_slots` slots for `region` and none for the other.
    pub fn for_region(region: Region, num_slots: usize, slot_size: usize) -> Result<Arc<Self>, Error> {
        if num_slots == 0 {
            return Err(Error::InvalidParams);
        }
        match region {
            Region::Tx => Self::with_regions(num_slots, 0, slot_size),
            Region::Rx => Self::with_regions(0, num_slots, slot_size),
        }
    }

    fn with_regions(tx_slots: usize, rx_slots: usize, slot_size: usize) -> Result<Arc<Self>, Error> {
        if slot_size == 0 {
            return Err(Error::InvalidParams);
        }
        let num_slots = tx_slots + rx_slots;
        let len = num_slots.checked_mul(slot_size).ok_or(Error::InvalidParams)?;
        let backing: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(backing) as *mut u8;
        let memory = NonNull::new(raw).ok_or(Error::InvalidParams)?;

        Ok(Arc::new(Self {
            memory,
            len,
            slot_size,
            tx_slots,
            rx_slots,
            states: (0..num_slots).map(|_| AtomicU32::new(FREE)).collect(),
            tx_cursor: AtomicUsize::new(0),
            rx_cursor: AtomicUsize::new(0),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// Slots in one region.
    pub fn region_len(&self, region: Region) -> usize {
        match region {
            Region::Tx => self.tx_slots,
            Region::Rx => self.rx_slots,
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Slots currently held, both regions.
    pub fn busy_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| s.load(Ordering::Acquire) != FREE)
            .count()
    }

    /// Slots currently held in one region.
    pub fn busy_in(&self, region: Region) -> usize {
        let range = self.range(region);
        self.states[range]
            .iter()
            .filter(|s| s.load(Ordering::Acquire) != FREE)
            .count()
    }

    fn range(&self, region: Region) -> std::ops::Range<usize> {
        match region {
            Region::Tx => 0..self.tx_slots,
            Region::Rx => self.tx_slots..self.tx_slots + self.rx_slots,
        }
    }

    /// Claim a FREE slot in `region`.
    ///
    /// Makes at most one attempt per slot in the region: each one advances the region cursor by
    /// CAS and then tries `FREE → BUSY` on the slot it landed on. Never
    /// blocks; on failure the caller drops its packet.
    pub fn acquire(self: &Arc<Self>, region: Region) -> Result<SlotLease, Error> {
        let (start, slots, cursor) = match region {
            Region::Tx => (0, self.tx_slots, &self.tx_cursor),
            Region::Rx => (self.tx_slots, self.rx_slots, &self.rx_cursor),
        };

        for _ in 0..slots {
            let current = cursor.load(Ordering::Relaxed);
            let next = (current + 1) % slots;
            if cursor
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let index = start + current;
            if self.states[index]
                .compare_exchange(FREE, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(SlotLease {
                    slot: SlotRef {
                        pool: Arc::clone(self),
                        index,
                    },
                    len: 0,
                });
            }
        }

        warn!(?region, busy = self.busy_in(region), "slot pool exhausted");
        Err(Error::PoolExhausted)
    }

    #[inline]
    fn retain(&self, index: usize) {
        let prev = self.states[index].fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev != FREE, "retain on a free slot");
    }

    #[inline]
    fn release(&self, index: usize) {
        let prev = self.states[index].fetch_sub(1, Ordering::Release);
        debug_assert!(prev != FREE, "double release of slot {}", index);
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.states.len());
        // In bounds: index < num_slots and len == num_slots * slot_size.
        unsafe { self.memory.as_ptr().add(index * self.slot_size) }
    }
}

impl Drop for SlotPool {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.memory.as_ptr(), self.len);
        // Allocated by `Box::into_raw` in `new` with this exact length.
        unsafe { drop(Box::from_raw(slice)) };
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("slot_size", &self.slot_size)
            .field("busy", &self.busy_count())
            .finish()
    }
}

/// One counted reference to a slot; releases on drop.
struct SlotRef {
    pool: Arc<SlotPool>,
    index: usize,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

/// Exclusive, writable hold on a slot.
pub struct SlotLease {
    slot: SlotRef,
    len: usize,
}

impl SlotLease {
    pub fn index(&self) -> usize {
        self.slot.index
    }

    pub fn capacity(&self) -> usize {
        self.slot.pool.slot_size
    }

    /// The whole slot, regardless of the filled length.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let pool = &self.slot.pool;
        // The lease is the only reference to this slot (state == 1).
        unsafe { std::slice::from_raw_parts_mut(pool.slot_ptr(self.slot.index), pool.slot_size) }
    }

    /// Mark the first `len` bytes as meaningful (clamped to capacity).
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.len = len.min(self.capacity());
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn filled(&self) -> &[u8] {
        let pool = &self.slot.pool;
        unsafe { std::slice::from_raw_parts(pool.slot_ptr(self.slot.index), self.len) }
    }

    /// Give up write access and share the filled bytes.
    pub fn freeze(self) -> SharedSlot {
        SharedSlot {
            slot: self.slot,
            len: self.len,
        }
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("index", &self.slot.index)
            .field("len", &self.len)
            .finish()
    }
}

/// Read-only, reference-counted view of a filled slot.
pub struct SharedSlot {
    slot: SlotRef,
    len: usize,
}

impl SharedSlot {
    pub fn index(&self) -> usize {
        self.slot.index
    }

    pub fn as_slice(&self) -> &[u8] {
        let pool = &self.slot.pool;
        // No writer exists once a lease is frozen.
        unsafe { std::slice::from_raw_parts(pool.slot_ptr(self.slot.index), self.len) }
    }
}

impl Clone for SharedSlot {
    fn clone(&self) -> Self {
        self.slot.pool.retain(self.slot.index);
        Self {
            slot: SlotRef {
                pool: Arc::clone(&self.slot.pool),
                index: self.slot.index,
            },
            len: self.len,
        }
    }
}

impl Deref for SharedSlot {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for SharedSlot {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for SharedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSlot")
            .field("index", &self.slot.index)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_regions_are_disjoint() {
        let pool = SlotPool::new(8, 16).unwrap();
        let tx: Vec<_> = (0..4).map(|_| pool.acquire(Region::Tx).unwrap()).collect();
        let rx: Vec<_> = (0..4).map(|_| pool.acquire(Region::Rx).unwrap()).collect();
        assert!(tx.iter().all(|l| l.index() < 4));
        assert!(rx.iter().all(|l| l.index() >= 4));
        assert_eq!(pool.busy_count(), 8);
        assert_eq!(pool.busy_in(Region::Tx), 4);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let pool = SlotPool::new(4, 8).unwrap();
        let a = pool.acquire(Region::Tx).unwrap();
        let b = pool.acquire(Region::Tx).unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(pool.acquire(Region::Tx).err(), Some(Error::PoolExhausted));
        // The other half is unaffected.
        assert!(pool.acquire(Region::Rx).is_ok());

        drop(a);
        let c = pool.acquire(Region::Tx).unwrap();
        assert_eq!(pool.busy_in(Region::Tx), 2);
        drop((b, c));
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn test_write_freeze_share() {
        let pool = SlotPool::new(2, 8).unwrap();
        let mut lease = pool.acquire(Region::Rx).unwrap();
        lease.as_mut_slice()[..5].copy_from_slice(b"hello");
        lease.set_len(5);
        assert_eq!(lease.filled(), b"hello");

        let shared = lease.freeze();
        let copy = shared.clone();
        assert_eq!(&*copy, b"hello");
        assert_eq!(pool.busy_in(Region::Rx), 1);
        assert_eq!(pool.acquire(Region::Rx).err(), Some(Error::PoolExhausted));

        drop(shared);
        assert_eq!(pool.busy_in(Region::Rx), 1, "clone still holds the slot");
        drop(copy);
        assert_eq!(pool.busy_count(), 0);
        assert!(pool.acquire(Region::Rx).is_ok());
    }

    #[test]
    fn test_shared_slot_crosses_threads() {
        let pool = SlotPool::new(2, 4).unwrap();
        let mut lease = pool.acquire(Region::Tx).unwrap();
        lease.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        lease.set_len(4);
        let shared = lease.freeze();
        let sum = std::thread::spawn(move || shared.iter().map(|&b| b as u32).sum::<u32>())
            .join()
            .unwrap();
        assert_eq!(sum, 10);
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn test_single_region_pool() {
        let pool = SlotPool::for_region(Region::Rx, 3, 8).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.region_len(Region::Tx), 0);
        assert_eq!(pool.acquire(Region::Tx).err(), Some(Error::PoolExhausted));

        let held: Vec<_> = (0..3).map(|_| pool.acquire(Region::Rx).unwrap()).collect();
        assert!(held.iter().all(|l| l.index() < 3));
        assert_eq!(pool.acquire(Region::Rx).err(), Some(Error::PoolExhausted));
        drop(held);
        assert_eq!(pool.busy_in(Region::Rx), 0);

        assert!(SlotPool::for_region(Region::Tx, 0, 8).is_err());
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(SlotPool::new(0, 8).is_err());
        assert!(SlotPool::new(3, 8).is_err());
        assert!(SlotPool::new(4, 0).is_err());
    }

    #[test]
    fn test_concurrent_acquire_release() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2_000;
        let pool = SlotPool::new(16, 8).unwrap();
        let owned: Vec<AtomicBool> = (0..pool.capacity()).map(|_| AtomicBool::new(false)).collect();
        let held = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let (pool, owned, held, peak) = (&pool, &owned, &held, &peak);
                scope.spawn(move || {
                    let region = if t % 2 == 0 { Region::Tx } else { Region::Rx };
                    for round in 0..ROUNDS {
                        let Ok(mut lease) = pool.acquire(region) else {
                            continue;
                        };
                        let index = lease.index();
                        assert!(!owned[index].swap(true, Ordering::AcqRel), "slot {} double-held", index);
                        let now = held.fetch_add(1, Ordering::AcqRel) + 1;
                        peak.fetch_max(now, Ordering::AcqRel);
                        assert!(now <= pool.capacity());

                        let stamp = (t * ROUNDS + round) as u64;
                        lease.as_mut_slice().copy_from_slice(&stamp.to_ne_bytes());
                        std::thread::yield_now();
                        assert_eq!(lease.as_mut_slice(), &stamp.to_ne_bytes());

                        held.fetch_sub(1, Ordering::AcqRel);
                        assert!(owned[index].swap(false, Ordering::AcqRel));
                        drop(lease);
                    }
                });
            }
        });

        assert!(peak.load(Ordering::Acquire) <= pool.capacity());
        assert_eq!(pool.busy_count(), 0);
    }
}
