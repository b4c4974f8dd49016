//! Handle-based piece arena.
//!
//! A single allocation holds `capacity` pieces of `piece_size` bytes. Free
//! pieces are tracked in a bitmap of `AtomicU64` words, so reservation and
//! release are lock-free and can happen on any thread. A [`PieceHandle`] is
//! the only way to reach a piece's bytes; it cannot be cloned, so ownership
//! of a piece moves with its handle and is never aliased.

use std::cell::UnsafeCell;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::Error;

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(1);

/// Move-only reference to one reserved piece.
#[derive(Debug, PartialEq, Eq)]
pub struct PieceHandle {
    arena: u32,
    index: u32,
}

impl PieceHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

pub struct PieceArena {
    id: u32,
    piece_size: usize,
    capacity: usize,
    memory: Box<[UnsafeCell<u8>]>,
    bitmap: Box<[AtomicU64]>,
    hint: AtomicUsize,
    reserved: AtomicUsize,
}

// Bytes behind a handle are only reachable through that handle, and handles
// are unique per piece.
unsafe impl Sync for PieceArena {}

impl PieceArena {
    pub fn new(capacity: usize, piece_size: usize) -> Result<Self, Error> {
        if capacity == 0 || piece_size == 0 || capacity > u32::MAX as usize {
            return Err(Error::InvalidParams);
        }
        let bytes = capacity.checked_mul(piece_size).ok_or(Error::InvalidParams)?;
        let words = capacity.div_ceil(64);

        Ok(Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            piece_size,
            capacity,
            memory: (0..bytes).map(|_| UnsafeCell::new(0)).collect(),
            bitmap: (0..words).map(|_| AtomicU64::new(0)).collect(),
            hint: AtomicUsize::new(0),
            reserved: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Bits of `word` that map to real pieces.
    fn valid_mask(&self, word: usize) -> u64 {
        let remaining = self.capacity - word * 64;
        if remaining >= 64 {
            u64::MAX
        } else {
            (1u64 << remaining) - 1
        }
    }

    /// Claim a free piece.
    pub fn reserve(&self) -> Result<PieceHandle, Error> {
        let words = self.bitmap.len();
        let start = self.hint.load(Ordering::Relaxed) % words;

        for step in 0..words {
            let w = (start + step) % words;
            let mask = self.valid_mask(w);
            let mut current = self.bitmap[w].load(Ordering::Acquire);
            loop {
                let free = !current & mask;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros();
                match self.bitmap[w].compare_exchange_weak(
                    current,
                    current | (1u64 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.hint.store(w, Ordering::Relaxed);
                        self.reserved.fetch_add(1, Ordering::AcqRel);
                        return Ok(PieceHandle {
                            arena: self.id,
                            index: (w * 64) as u32 + bit,
                        });
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        Err(Error::ArenaFull)
    }

    /// Return a piece to the free set.
    pub fn release(&self, handle: PieceHandle) -> Result<(), Error> {
        self.check(&handle)?;
        let (word, bit) = (handle.index as usize / 64, handle.index % 64);
        let prev = self.bitmap[word].fetch_and(!(1u64 << bit), Ordering::AcqRel);
        debug_assert!(prev & (1u64 << bit) != 0, "piece {} was not reserved", handle.index);
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Byte range of the piece inside the arena.
    pub fn resolve(&self, handle: &PieceHandle) -> Result<Range<usize>, Error> {
        self.check(handle)?;
        let start = handle.index as usize * self.piece_size;
        Ok(start..start + self.piece_size)
    }

    /// Shared view of a piece.
    ///
    /// The view borrows the handle, so the piece cannot be released while
    /// it is alive:
    ///
    /// ```compile_fail
    /// use rlnc::arena::PieceArena;
    ///
    /// let arena = PieceArena::new(1, 4).unwrap();
    /// let handle = arena.reserve().unwrap();
    /// let view = arena.slice(&handle).unwrap();
    /// arena.release(handle).unwrap();
    /// let _next = arena.reserve().unwrap();
    /// assert_eq!(view[0], 0);
    /// ```
    pub fn slice<'a>(&'a self, handle: &'a PieceHandle) -> Result<&'a [u8], Error> {
        let range = self.resolve(handle)?;
        let ptr = UnsafeCell::raw_get(self.memory[range].as_ptr());
        // The handle is the sole owner of these bytes and is borrowed shared.
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.piece_size) })
    }

    /// Writable view of a piece.
    ///
    /// Holds the handle mutably for as long as the view lives, so one piece
    /// never has two writers:
    ///
    /// ```compile_fail
    /// use rlnc::arena::PieceArena;
    ///
    /// let arena = PieceArena::new(1, 4).unwrap();
    /// let mut handle = arena.reserve().unwrap();
    /// let a = arena.slice_mut(&mut handle).unwrap();
    /// let b = arena.slice_mut(&mut handle).unwrap();
    /// a[0] = 1;
    /// b[0] = 2;
    /// ```
    pub fn slice_mut<'a>(&'a self, handle: &'a mut PieceHandle) -> Result<&'a mut [u8], Error> {
        let range = self.resolve(handle)?;
        let ptr = UnsafeCell::raw_get(self.memory[range].as_ptr());
        // The handle is the sole owner of these bytes and is borrowed mutably.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.piece_size) })
    }

    fn check(&self, handle: &PieceHandle) -> Result<(), Error> {
        if handle.arena != self.id || handle.index as usize >= self.capacity {
            return Err(Error::InvalidParams);
        }
        Ok(())
    }
}

impl std::fmt::Debug for PieceArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceArena")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("piece_size", &self.piece_size)
            .field("reserved", &self.reserved())
            .finish()
    }
}
