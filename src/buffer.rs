//! Hugepage arena and message buffers.
//!
//! `MsgBuffer` is a sequence of equal-sized packet slots inside one
//! hugepage-backed allocation, with per-packet headers stored inline so a
//! transmit needs no copy:
//!
//! ```text
//! [pkthdr 0][data ... max_data_size ...][pkthdr 1][pkthdr 2]...
//! ```
//!
//! Packet 0's header is contiguous with the start of the data; headers for
//! later packets live after the data region. "Fake" buffers borrow a single
//! packet straight out of the receive ring and carry no backing allocation.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use tracing::warn;

use crate::error::{Error, Result};
use crate::packet::{data_size_to_num_pkts, PktHdr, PktType, PKT_HDR_SIZE};

/// Smallest arena size class.
pub const MIN_CLASS_SIZE: usize = 64;
const MIN_CLASS_BITS: usize = 6;

/// Largest arena size class. Bounds the largest single allocation.
pub const MAX_CLASS_SIZE: usize = 8 * 1024 * 1024;

/// Number of power-of-two size classes (64 B ..= 8 MiB).
const NUM_CLASSES: usize = 18;

#[inline]
fn class_size(class: usize) -> usize {
    MIN_CLASS_SIZE << class
}

#[inline]
fn size_to_class(size: usize) -> usize {
    let size = size.max(MIN_CLASS_SIZE);
    let bits = usize::BITS as usize - (size - 1).leading_zeros() as usize;
    bits - MIN_CLASS_BITS
}

/// One mmap'ed reservation. Unmapped on drop.
struct Region {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

/// Hugepage-backed arena with power-of-two size classes.
///
/// Chunks split from larger classes on demand and return to their class free
/// list on free; classes are never coalesced. Reservations double in size as
/// the arena grows. When `MAP_HUGETLB` fails the arena falls back to ordinary
/// anonymous pages with a warning.
pub struct HugeAlloc {
    free_lists: Vec<Vec<NonNull<u8>>>,
    regions: Vec<Region>,
    prev_region_size: usize,
    stat_user_alloc_tot: usize,
    using_hugepages: bool,
}

// The arena owns all memory it hands out.
unsafe impl Send for HugeAlloc {}

impl HugeAlloc {
    /// Create an arena with an initial reservation.
    ///
    /// Fails only if no memory can be mapped at all; hugepage reservation
    /// failure falls back to 4 KiB pages.
    pub fn new(initial_size: usize) -> Result<Self> {
        let mut alloc = Self {
            free_lists: (0..NUM_CLASSES).map(|_| Vec::new()).collect(),
            regions: Vec::new(),
            prev_region_size: 0,
            stat_user_alloc_tot: 0,
            using_hugepages: true,
        };
        alloc.reserve_region(initial_size.max(MAX_CLASS_SIZE))?;
        Ok(alloc)
    }

    /// Map a new region of at least `min_size` bytes and carve it into
    /// max-class chunks.
    fn reserve_region(&mut self, min_size: usize) -> Result<()> {
        let mut size = (self.prev_region_size * 2).max(min_size).max(MAX_CLASS_SIZE);
        size = (size + MAX_CLASS_SIZE - 1) / MAX_CLASS_SIZE * MAX_CLASS_SIZE;

        let len = NonZeroUsize::new(size)
            .ok_or_else(|| Error::InvalidConfig("zero arena reservation".into()))?;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;

        let ptr = if self.using_hugepages {
            match unsafe {
                mmap_anonymous(None, len, prot, MapFlags::MAP_PRIVATE | MapFlags::MAP_HUGETLB)
            } {
                Ok(p) => p,
                Err(e) => {
                    warn!(bytes = size, error = %e, "hugepage reservation failed, falling back to 4 KiB pages");
                    self.using_hugepages = false;
                    unsafe { mmap_anonymous(None, len, prot, MapFlags::MAP_PRIVATE) }?
                }
            }
        } else {
            unsafe { mmap_anonymous(None, len, prot, MapFlags::MAP_PRIVATE) }?
        };

        let base = ptr.as_ptr() as *mut u8;
        for off in (0..size).step_by(MAX_CLASS_SIZE) {
            let chunk = unsafe { NonNull::new_unchecked(base.add(off)) };
            self.free_lists[NUM_CLASSES - 1].push(chunk);
        }

        self.regions.push(Region { ptr, len: size });
        self.prev_region_size = size;
        Ok(())
    }

    /// Allocate a chunk of at least `size` bytes.
    ///
    /// Returns the chunk pointer and its size class, or `None` if the size
    /// exceeds the largest class or no memory could be reserved.
    pub fn alloc_raw(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
        if size > MAX_CLASS_SIZE {
            return None;
        }
        let class = size_to_class(size);

        if self.free_lists[class].is_empty() && self.split_to(class).is_none() {
            // Grow the arena and retry once.
            if self.reserve_region(MAX_CLASS_SIZE).is_err() {
                return None;
            }
            self.split_to(class)?;
        }

        let ptr = self.free_lists[class].pop()?;
        self.stat_user_alloc_tot += class_size(class);
        Some((ptr, class))
    }

    /// Split the smallest available larger class down to `class`.
    fn split_to(&mut self, class: usize) -> Option<()> {
        if !self.free_lists[class].is_empty() {
            return Some(());
        }
        let mut donor = class + 1;
        while donor < NUM_CLASSES && self.free_lists[donor].is_empty() {
            donor += 1;
        }
        if donor >= NUM_CLASSES {
            return None;
        }

        // Halve the donor chunk until one half lands in the requested class,
        // keeping the lower half for further splitting.
        let ptr = self.free_lists[donor].pop().unwrap();
        while donor > class {
            donor -= 1;
            let buddy = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(class_size(donor))) };
            self.free_lists[donor].push(buddy);
        }
        self.free_lists[class].push(ptr);
        Some(())
    }

    /// Return a chunk to its class free list.
    pub fn free_raw(&mut self, ptr: NonNull<u8>, class: usize) {
        debug_assert!(class < NUM_CLASSES);
        self.stat_user_alloc_tot -= class_size(class);
        self.free_lists[class].push(ptr);
    }

    /// Total bytes currently allocated to users.
    pub fn stat_user_alloc_tot(&self) -> usize {
        self.stat_user_alloc_tot
    }

    /// True if the arena is backed by hugepages.
    pub fn using_hugepages(&self) -> bool {
        self.using_hugepages
    }
}

/// Shared handle to the arena. Background handler threads allocate response
/// buffers through the same mutex the dispatcher uses.
pub type SharedAlloc = Arc<Mutex<HugeAlloc>>;

enum Backing {
    /// Arena-backed. Returned to the arena on drop.
    Owned {
        base: *mut u8,
        class: usize,
        arena: SharedAlloc,
    },
    /// Fake buffer borrowing a single packet from the receive ring.
    Borrowed,
}

/// A message buffer with inline per-packet headers.
///
/// Invariant: `num_pkts == ceil(data_size / max_data_per_pkt)` with a floor
/// of one. An invalid buffer (allocation failure sentinel) has a null data
/// pointer; all other accessors must not be called on it.
pub struct MsgBuffer {
    /// Start of the data region (immediately after packet header 0).
    buf: *mut u8,
    max_data_size: usize,
    data_size: usize,
    max_num_pkts: usize,
    num_pkts: usize,
    max_data_per_pkt: usize,
    backing: Backing,
}

// Raw pointers into memory the buffer (or the receive ring) owns.
unsafe impl Send for MsgBuffer {}

impl MsgBuffer {
    /// Allocate a buffer for up to `max_data_size` data bytes.
    ///
    /// Stamps the magic into packet header 0; other header fields are laid
    /// down at transmission time. Returns an invalid buffer if the arena is
    /// out of memory.
    pub fn alloc(arena: &SharedAlloc, max_data_size: usize, max_data_per_pkt: usize) -> Self {
        let max_num_pkts = data_size_to_num_pkts(max_data_size, max_data_per_pkt);
        let total = max_data_size + max_num_pkts * PKT_HDR_SIZE;

        let chunk = arena.lock().unwrap().alloc_raw(total);
        let (base, class) = match chunk {
            Some((p, c)) => (p.as_ptr(), c),
            None => return Self::invalid(),
        };

        let hdr0 = PktHdr::new(0, 0, 0, PktType::Req, 0, 0);
        unsafe { hdr0.write_to(base) };

        Self {
            buf: unsafe { base.add(PKT_HDR_SIZE) },
            max_data_size,
            data_size: max_data_size,
            max_num_pkts,
            num_pkts: max_num_pkts,
            max_data_per_pkt,
            backing: Backing::Owned {
                base,
                class,
                arena: arena.clone(),
            },
        }
    }

    /// The invalid-buffer sentinel returned on allocation failure.
    pub fn invalid() -> Self {
        Self {
            buf: std::ptr::null_mut(),
            max_data_size: 0,
            data_size: 0,
            max_num_pkts: 0,
            num_pkts: 0,
            max_data_per_pkt: 1,
            backing: Backing::Borrowed,
        }
    }

    /// A fake single-packet buffer pointing at a receive-ring entry.
    ///
    /// # Safety
    /// `hdr_ptr` must point at a packet header followed by `data_size` data
    /// bytes, and the ring entry must outlive every use of the buffer.
    pub(crate) unsafe fn fake_from_ring(hdr_ptr: *const u8, data_size: usize, mdpp: usize) -> Self {
        Self {
            buf: unsafe { (hdr_ptr as *mut u8).add(PKT_HDR_SIZE) },
            max_data_size: data_size,
            data_size,
            max_num_pkts: 1,
            num_pkts: 1,
            max_data_per_pkt: mdpp,
            backing: Backing::Borrowed,
        }
    }

    /// True unless this is the allocation-failure sentinel.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.buf.is_null()
    }

    /// True iff this buffer is backed by the arena.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self.backing, Backing::Owned { .. })
    }

    /// Shrink the buffer to `new_data_size`, recomputing the packet count.
    /// Headers are not touched.
    pub fn resize(&mut self, new_data_size: usize) {
        assert!(self.is_valid());
        assert!(
            new_data_size <= self.max_data_size,
            "resize {} exceeds max data size {}",
            new_data_size,
            self.max_data_size
        );
        self.data_size = new_data_size;
        self.num_pkts = data_size_to_num_pkts(new_data_size, self.max_data_per_pkt);
    }

    /// Current data size in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Maximum data size this buffer can hold.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Current number of packets.
    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    /// Data bytes of packet `i`.
    #[inline]
    pub fn pkt_size(&self, i: usize) -> usize {
        debug_assert!(i < self.num_pkts);
        (self.data_size - i * self.max_data_per_pkt).min(self.max_data_per_pkt)
    }

    /// Pointer to the header of packet `i`.
    #[inline]
    pub(crate) fn pkthdr_ptr(&self, i: usize) -> *mut u8 {
        debug_assert!(self.is_valid());
        debug_assert!(i < self.max_num_pkts);
        if i == 0 {
            unsafe { self.buf.sub(PKT_HDR_SIZE) }
        } else {
            unsafe { self.buf.add(self.max_data_size + (i - 1) * PKT_HDR_SIZE) }
        }
    }

    /// Pointer to the data of packet `i`.
    #[inline]
    pub(crate) fn pkt_data_ptr(&self, i: usize) -> *const u8 {
        unsafe { self.buf.add(i * self.max_data_per_pkt) }
    }

    /// Write the header of packet `i`.
    #[inline]
    pub(crate) fn write_pkthdr(&mut self, i: usize, hdr: &PktHdr) {
        unsafe { hdr.write_to(self.pkthdr_ptr(i)) };
    }

    /// Data region as a slice.
    #[inline]
    pub fn data(&self) -> &[u8] {
        assert!(self.is_valid());
        unsafe { std::slice::from_raw_parts(self.buf, self.data_size) }
    }

    /// Data region as a mutable slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(self.is_valid());
        unsafe { std::slice::from_raw_parts_mut(self.buf, self.data_size) }
    }

    /// Copy `src` into the data region at `offset`.
    pub(crate) fn copy_in(&mut self, offset: usize, src: *const u8, len: usize) {
        debug_assert!(offset + len <= self.data_size);
        unsafe {
            std::ptr::copy_nonoverlapping(src, self.buf.add(offset), len);
        }
    }
}

impl Drop for MsgBuffer {
    fn drop(&mut self) {
        if let Backing::Owned { base, class, arena } = &self.backing {
            arena
                .lock()
                .unwrap()
                .free_raw(unsafe { NonNull::new_unchecked(*base) }, *class);
        }
    }
}

impl std::fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("valid", &self.is_valid())
            .field("dynamic", &self.is_dynamic())
            .field("data_size", &self.data_size)
            .field("num_pkts", &self.num_pkts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> SharedAlloc {
        Arc::new(Mutex::new(HugeAlloc::new(MAX_CLASS_SIZE).unwrap()))
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(size_to_class(1), 0);
        assert_eq!(size_to_class(64), 0);
        assert_eq!(size_to_class(65), 1);
        assert_eq!(size_to_class(128), 1);
        assert_eq!(size_to_class(MAX_CLASS_SIZE), NUM_CLASSES - 1);
        assert_eq!(class_size(NUM_CLASSES - 1), MAX_CLASS_SIZE);
    }

    #[test]
    fn test_alloc_free_reuse() {
        let a = arena();
        let (p1, c1) = a.lock().unwrap().alloc_raw(100).unwrap();
        assert_eq!(c1, size_to_class(100));
        a.lock().unwrap().free_raw(p1, c1);
        let (p2, c2) = a.lock().unwrap().alloc_raw(100).unwrap();
        assert_eq!(c2, c1);
        assert_eq!(p1, p2);
        a.lock().unwrap().free_raw(p2, c2);
        assert_eq!(a.lock().unwrap().stat_user_alloc_tot(), 0);
    }

    #[test]
    fn test_alloc_too_large() {
        let a = arena();
        assert!(a.lock().unwrap().alloc_raw(MAX_CLASS_SIZE + 1).is_none());
    }

    #[test]
    fn test_arena_growth() {
        let a = arena();
        let mut chunks = Vec::new();
        for _ in 0..4 {
            chunks.push(a.lock().unwrap().alloc_raw(MAX_CLASS_SIZE).unwrap());
        }
        for (p, c) in chunks {
            a.lock().unwrap().free_raw(p, c);
        }
    }

    #[test]
    fn test_msg_buffer_layout() {
        let a = arena();
        let mdpp = 1456;
        let mut m = MsgBuffer::alloc(&a, mdpp * 2 + 10, mdpp);
        assert!(m.is_valid());
        assert_eq!(m.num_pkts(), 3);
        assert_eq!(m.pkt_size(0), mdpp);
        assert_eq!(m.pkt_size(2), 10);

        // Header 0 sits immediately before the data region.
        assert_eq!(m.pkthdr_ptr(0) as usize + PKT_HDR_SIZE, m.data().as_ptr() as usize);
        // Trailing headers sit after the data region.
        assert_eq!(
            m.pkthdr_ptr(1) as usize,
            m.data().as_ptr() as usize + m.max_data_size()
        );

        // Magic was stamped in header 0.
        let hdr0 = unsafe { PktHdr::read_from(m.pkthdr_ptr(0)) };
        assert!(hdr0.is_valid());

        m.data_mut()[0] = 0xAB;
        assert_eq!(m.data()[0], 0xAB);
    }

    #[test]
    fn test_msg_buffer_resize_shrink() {
        let a = arena();
        let mdpp = 1456;
        let mut m = MsgBuffer::alloc(&a, mdpp * 4, mdpp);
        assert_eq!(m.num_pkts(), 4);
        m.resize(1);
        assert_eq!(m.num_pkts(), 1);
        assert_eq!(m.data_size(), 1);
        m.resize(0);
        assert_eq!(m.num_pkts(), 1);
    }

    #[test]
    fn test_msg_buffer_drop_returns_memory() {
        let a = arena();
        {
            let _m = MsgBuffer::alloc(&a, 1000, 1456);
            assert!(a.lock().unwrap().stat_user_alloc_tot() > 0);
        }
        assert_eq!(a.lock().unwrap().stat_user_alloc_tot(), 0);
    }

    #[test]
    fn test_invalid_sentinel() {
        let m = MsgBuffer::invalid();
        assert!(!m.is_valid());
    }
}
