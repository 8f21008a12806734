//! Arena allocator for protobuf messages.
//!
//! An arena batches many small allocations into a few large blocks obtained
//! from a pluggable [`Allocator`], and frees everything at once when the last
//! handle to its fuse group is dropped. Decoded messages, their repeated
//! field storage and their unknown-field buffers all live in an arena.
//!
//! Two arenas can be [`fuse`](Arena::fuse)d so they share one lifetime: after
//! a fuse, the whole group is freed when the last handle to *any* member is
//! dropped. Fusing is lock-free and may race with handle drops on other
//! threads; it may NOT race with another fuse on an overlapping group (the
//! `&mut` receivers rule out races on the same handle, but two handles whose
//! arenas were already fused share a root, and fusing both concurrently is
//! not supported).
//!
//! Allocation goes through `&mut self` and is therefore single-threaded per
//! arena; arenas in the same fuse group each keep their own bump cursor, so
//! different members may allocate from different threads.

use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use allocator_api2::alloc::{AllocError, Allocator, Global};

use crate::utils::{align_down, align_up, likely};

/// Runs when the arena is freed; receives the pointer it was registered with.
pub type CleanupFn = unsafe fn(*mut u8);

/// All bump allocations are rounded up to this alignment.
const MALLOC_ALIGN: usize = 8;
/// Blocks are conservatively 16-aligned in case anyone stores SSE data.
const BLOCK_ALIGN: usize = 16;

#[repr(C)]
struct MemBlock {
    // Atomic only for the benefit of space_allocated().
    next: AtomicPtr<MemBlock>,
    /// Usable bytes from the block start; cleanup entries grow down from
    /// `block + size`. Excludes the arena header when this block hosts it.
    size: u32,
    /// Full allocation size, needed to rebuild the layout on deallocate.
    alloc_size: u32,
    cleanups: u32,
    // Data follows.
}

#[repr(C)]
struct CleanupEnt {
    func: CleanupFn,
    ud: *mut u8,
}

const BLOCK_RESERVE: usize = align_up(core::mem::size_of::<MemBlock>(), MALLOC_ALIGN);

/// The arena header, placed at the tail of its first block (or of the
/// caller's seed memory). Handles and parent links refer to it by address,
/// so it never moves.
#[repr(C)]
struct RawArena<'alloc> {
    /// Tagged word: `(refcount << 1) | 1` while this arena is a fuse-group
    /// root, or the address of a parent arena (even, since headers are
    /// 8-aligned) after it has been fused into another group.
    parent_or_count: AtomicUsize,
    /// Singly-linked list threading every arena fused into this group.
    next: AtomicPtr<RawArena<'alloc>>,
    /// Cached tail of the `next` chain; may lag, never points backward.
    tail: AtomicPtr<RawArena<'alloc>>,
    blocks: AtomicPtr<MemBlock>,
    /// Bump cursor. Only the owning handle touches these, via `&mut`.
    ptr: UnsafeCell<*mut u8>,
    end: UnsafeCell<*mut u8>,
    /// Cleanup counter of the current block; null until a real block exists.
    cleanups: UnsafeCell<*mut u32>,
    block_alloc: &'alloc (dyn Allocator + Sync),
    /// Arenas over caller-supplied memory cannot be lifetime-extended and
    /// refuse to fuse.
    has_initial_block: bool,
}

const fn tagged_from_refcount(count: usize) -> usize {
    (count << 1) | 1
}

const fn refcount_from_tagged(poc: usize) -> usize {
    poc >> 1
}

const fn is_tagged_pointer(poc: usize) -> bool {
    poc & 1 == 0
}

fn tagged_from_pointer(p: *mut RawArena) -> usize {
    debug_assert!(p as usize & 1 == 0);
    p as usize
}

const fn pointer_from_tagged<'a>(poc: usize) -> *mut RawArena<'a> {
    poc as *mut RawArena<'a>
}

/// Walks parent pointers to the fuse-group root, collapsing levels as it
/// goes (path splitting: each visited node is re-pointed at its
/// grandparent). The relaxed store is fine because any stored value is a
/// valid parent that is at least as close to the root as before; threads
/// racing here all converge on the same root.
unsafe fn find_root<'a>(mut a: *mut RawArena<'a>) -> *mut RawArena<'a> {
    let mut poc = unsafe { (*a).parent_or_count.load(Ordering::Acquire) };
    while is_tagged_pointer(poc) {
        let next = pointer_from_tagged::<'a>(poc);
        let next_poc = unsafe { (*next).parent_or_count.load(Ordering::Acquire) };
        if is_tagged_pointer(next_poc) {
            unsafe { (*a).parent_or_count.store(next_poc, Ordering::Relaxed) };
        }
        a = next;
        poc = next_poc;
    }
    a
}

/// Frees every arena in the group's chain and every block in each arena.
/// Only called when the root's refcount has reached zero, so this thread
/// has exclusive access to everything reachable.
unsafe fn arena_dofree(mut a: *mut RawArena) {
    while !a.is_null() {
        // Load first: the header usually lives inside one of its own blocks.
        let next_arena = unsafe { (*a).next.load(Ordering::Acquire) };
        let alloc = unsafe { (*a).block_alloc };
        let mut block = unsafe { (*a).blocks.load(Ordering::Relaxed) };
        while !block.is_null() {
            let next_block = unsafe { (*block).next.load(Ordering::Relaxed) };
            let cleanups = unsafe { (*block).cleanups } as usize;
            if cleanups > 0 {
                let top = unsafe { (block as *mut u8).add((*block).size as usize) }
                    as *mut CleanupEnt;
                // Entries grow downward, so ascending address order runs
                // them most-recently-registered first.
                let mut ent = unsafe { top.sub(cleanups) };
                while ent < top {
                    unsafe { ((*ent).func)((*ent).ud) };
                    ent = unsafe { ent.add(1) };
                }
            }
            let layout = unsafe {
                Layout::from_size_align_unchecked((*block).alloc_size as usize, BLOCK_ALIGN)
            };
            unsafe { alloc.deallocate(NonNull::new_unchecked(block as *mut u8), layout) };
            block = next_block;
        }
        a = next_arena;
    }
}

unsafe fn arena_free(mut a: *mut RawArena) {
    let mut poc = unsafe { (*a).parent_or_count.load(Ordering::Acquire) };
    loop {
        while is_tagged_pointer(poc) {
            a = pointer_from_tagged(poc);
            poc = unsafe { (*a).parent_or_count.load(Ordering::Acquire) };
        }

        // A direct load is cheaper than an RMW, so only CAS when other
        // threads still hold references.
        if poc == tagged_from_refcount(1) {
            unsafe { arena_dofree(a) };
            return;
        }

        match unsafe {
            (*a).parent_or_count.compare_exchange(
                poc,
                tagged_from_refcount(refcount_from_tagged(poc) - 1),
                Ordering::Release,
                Ordering::Acquire,
            )
        } {
            Ok(_) => return,
            // Someone moved under us; the failed exchange reloaded poc.
            Err(actual) => poc = actual,
        }
    }
}

unsafe fn add_block(a: *mut RawArena, block: *mut MemBlock, usable: usize, alloc_size: usize) {
    unsafe {
        let prev = (*a).blocks.load(Ordering::Relaxed);
        block.write(MemBlock {
            next: AtomicPtr::new(prev),
            size: usable as u32,
            alloc_size: alloc_size as u32,
            cleanups: 0,
        });
        (*a).blocks.store(block, Ordering::Relaxed);

        *(*a).ptr.get() = (block as *mut u8).add(BLOCK_RESERVE);
        *(*a).end.get() = (block as *mut u8).add(usable);
        *(*a).cleanups.get() = core::ptr::addr_of_mut!((*block).cleanups);
    }
}

unsafe fn alloc_block(a: *mut RawArena, min_size: usize) -> bool {
    let last = unsafe { (*a).blocks.load(Ordering::Relaxed) };
    let last_size = if last.is_null() {
        128
    } else {
        unsafe { (*last).size as usize }
    };
    let block_size = min_size.max(last_size * 2) + BLOCK_RESERVE;
    let Ok(layout) = Layout::from_size_align(block_size, BLOCK_ALIGN) else {
        return false;
    };
    let Ok(mem) = (unsafe { (*a).block_alloc }).allocate(layout) else {
        return false;
    };
    unsafe { add_block(a, mem.as_ptr() as *mut MemBlock, block_size, block_size) };
    true
}

/// Handle to one arena. Dropping it releases this handle's reference; the
/// group's memory is reclaimed when the last handle in the fuse group goes.
pub struct Arena<'alloc> {
    raw: NonNull<RawArena<'alloc>>,
    _marker: PhantomData<&'alloc (dyn Allocator + Sync)>,
}

// A handle owns exactly one reference into the fuse group; frees and fuses
// synchronize through parent_or_count, and the bump cursor is only reachable
// through &mut self. Shared access only exposes the read-only diagnostics.
unsafe impl Send for Arena<'_> {}
unsafe impl Sync for Arena<'_> {}

static GLOBAL_ALLOC: Global = Global;

impl Arena<'static> {
    /// Arena backed by the global allocator.
    pub fn new() -> Self {
        Arena::new_in(&GLOBAL_ALLOC)
    }

    /// Arena backed by the global allocator with `cap` bytes ready to bump.
    pub fn with_capacity(cap: usize) -> Self {
        Arena::with_capacity_in(cap, &GLOBAL_ALLOC)
    }
}

impl Default for Arena<'static> {
    fn default() -> Self {
        Arena::new()
    }
}

impl<'alloc> Arena<'alloc> {
    pub fn new_in(alloc: &'alloc (dyn Allocator + Sync)) -> Self {
        Arena::with_capacity_in(256, alloc)
    }

    pub fn with_capacity_in(cap: usize, alloc: &'alloc (dyn Allocator + Sync)) -> Self {
        let header = core::mem::size_of::<RawArena>();
        let n = BLOCK_RESERVE + align_up(cap, MALLOC_ALIGN) + header;
        let layout = Layout::from_size_align(n, BLOCK_ALIGN).expect("arena block layout");
        let mem = alloc.allocate(layout).expect("arena allocation failed");
        let base = mem.as_ptr() as *mut u8;
        // The header sits at the tail; everything below it is the block.
        let usable = align_down(n - header, MALLOC_ALIGN);
        let raw = unsafe { base.add(usable) } as *mut RawArena<'alloc>;
        unsafe {
            raw.write(RawArena {
                parent_or_count: AtomicUsize::new(tagged_from_refcount(1)),
                next: AtomicPtr::new(core::ptr::null_mut()),
                tail: AtomicPtr::new(raw),
                blocks: AtomicPtr::new(core::ptr::null_mut()),
                ptr: UnsafeCell::new(core::ptr::null_mut()),
                end: UnsafeCell::new(core::ptr::null_mut()),
                cleanups: UnsafeCell::new(core::ptr::null_mut()),
                block_alloc: alloc,
                has_initial_block: false,
            });
            add_block(raw, base as *mut MemBlock, usable, n);
            Arena {
                raw: NonNull::new_unchecked(raw),
                _marker: PhantomData,
            }
        }
    }

    /// Arena over caller-supplied memory. The header is carved out of the
    /// tail of `mem`; nothing is allocated until the seed region runs out.
    /// Such an arena cannot be fused, since its lifetime cannot be extended.
    pub fn with_initial_block(mem: &'alloc mut [u8], alloc: &'alloc (dyn Allocator + Sync)) -> Self {
        let header = core::mem::size_of::<RawArena>();
        let start = mem.as_mut_ptr();
        let aligned = align_up(start as usize, MALLOC_ALIGN);
        let delta = aligned - start as usize;
        let n = if delta <= mem.len() {
            align_down(mem.len() - delta, MALLOC_ALIGN)
        } else {
            0
        };
        if n < header {
            // Seed too small to even hold the header.
            return Arena::new_in(alloc);
        }
        let base = aligned as *mut u8;
        let raw = unsafe { base.add(n - header) } as *mut RawArena<'alloc>;
        unsafe {
            raw.write(RawArena {
                parent_or_count: AtomicUsize::new(tagged_from_refcount(1)),
                next: AtomicPtr::new(core::ptr::null_mut()),
                tail: AtomicPtr::new(raw),
                blocks: AtomicPtr::new(core::ptr::null_mut()),
                ptr: UnsafeCell::new(base),
                end: UnsafeCell::new(raw as *mut u8),
                cleanups: UnsafeCell::new(core::ptr::null_mut()),
                block_alloc: alloc,
                has_initial_block: true,
            });
            Arena {
                raw: NonNull::new_unchecked(raw),
                _marker: PhantomData,
            }
        }
    }

    #[inline(always)]
    fn head_ptr(&self) -> *mut u8 {
        unsafe { *(*self.raw.as_ptr()).ptr.get() }
    }

    #[inline(always)]
    fn head_end(&self) -> *mut u8 {
        unsafe { *(*self.raw.as_ptr()).end.get() }
    }

    #[inline(always)]
    fn has(&self, size: usize) -> bool {
        (self.head_end() as usize).wrapping_sub(self.head_ptr() as usize) >= size
    }

    /// Bump-allocates `layout` rounded up to 8 bytes. The memory lives until
    /// the fuse group is freed; there is no per-allocation free.
    #[inline(always)]
    pub fn alloc_raw(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let size = align_up(layout.size(), MALLOC_ALIGN);
        let end = self.head_end() as usize;
        let aligned = align_up(self.head_ptr() as usize, layout.align().max(MALLOC_ALIGN));
        if likely(aligned <= end && end - aligned >= size) {
            unsafe {
                *(*self.raw.as_ptr()).ptr.get() = (aligned + size) as *mut u8;
                return Ok(NonNull::new_unchecked(aligned as *mut u8));
            }
        }
        self.alloc_outlined(layout, size)
    }

    #[inline(never)]
    fn alloc_outlined(&mut self, layout: Layout, size: usize) -> Result<NonNull<u8>, AllocError> {
        if !unsafe { alloc_block(self.raw.as_ptr(), size + layout.align()) } {
            return Err(AllocError);
        }
        debug_assert!(self.has(size + layout.align()));
        self.alloc_raw(layout)
    }

    /// Allocates and zero-fills.
    pub fn alloc_zeroed(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let p = self.alloc_raw(layout)?;
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0, layout.size()) };
        Ok(p)
    }

    /// Copies `data` into the arena.
    pub(crate) fn copy_bytes(&mut self, data: &[u8]) -> Result<NonNull<u8>, AllocError> {
        let layout = Layout::from_size_align(data.len().max(1), 1).map_err(|_| AllocError)?;
        let p = self.alloc_raw(layout)?;
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), p.as_ptr(), data.len()) };
        Ok(p)
    }

    /// Registers `func(ud)` to run when the fuse group is freed. Entries run
    /// in reverse registration order.
    ///
    /// # Safety
    /// `func` must be safe to call with `ud` at any point up to the free of
    /// the fuse group, from whichever thread drops the last handle.
    pub unsafe fn add_cleanup(&mut self, ud: *mut u8, func: CleanupFn) -> bool {
        let a = self.raw.as_ptr();
        unsafe {
            if (*(*a).cleanups.get()).is_null() || !self.has(core::mem::size_of::<CleanupEnt>()) {
                if !alloc_block(a, 128) {
                    return false;
                }
                debug_assert!(self.has(core::mem::size_of::<CleanupEnt>()));
            }
            let end = (*(*a).end.get()).sub(core::mem::size_of::<CleanupEnt>());
            *(*a).end.get() = end;
            (end as *mut CleanupEnt).write(CleanupEnt { func, ud });
            **(*a).cleanups.get() += 1;
        }
        true
    }

    /// Joins the fuse groups of `self` and `other` so they share one
    /// lifetime. Returns false (and changes nothing) if either group sits on
    /// caller-supplied memory or the groups use different block allocators.
    ///
    /// Safe against concurrent handle drops anywhere in either group, but
    /// concurrent fuses touching overlapping groups must be serialized by
    /// the caller.
    pub fn fuse(&mut self, other: &mut Arena<'alloc>) -> bool {
        unsafe {
            let mut r1 = find_root(self.raw.as_ptr());
            let mut r2 = find_root(other.raw.as_ptr());

            if r1 == r2 {
                return true; // Already fused.
            }

            if (*r1).has_initial_block || (*r2).has_initial_block {
                return false;
            }
            if !core::ptr::addr_eq(
                (*r1).block_alloc as *const (dyn Allocator + Sync),
                (*r2).block_alloc as *const (dyn Allocator + Sync),
            ) {
                return false;
            }

            let mut r1_poc = (*r1).parent_or_count.load(Ordering::Acquire);
            let mut r2_poc = (*r2).parent_or_count.load(Ordering::Acquire);
            debug_assert!(!is_tagged_pointer(r1_poc));
            debug_assert!(!is_tagged_pointer(r2_poc));

            // Join the smaller group into the larger to keep the tree flat.
            if refcount_from_tagged(r1_poc) < refcount_from_tagged(r2_poc) {
                core::mem::swap(&mut r1, &mut r2);
                core::mem::swap(&mut r1_poc, &mut r2_poc);
            }

            // The moment r1 becomes r2's parent, racing frees against r2's
            // old group start decrementing r1, so transfer the refcount we
            // saw first.
            let r2_count = refcount_from_tagged(r2_poc);
            (*r1)
                .parent_or_count
                .fetch_add(r2_count << 1, Ordering::Release);

            // Frees may have decremented r2 between our load and the
            // exchange; reconcile the difference on r1.
            let r2_old = (*r2)
                .parent_or_count
                .swap(tagged_from_pointer(r1), Ordering::AcqRel);
            debug_assert!(!is_tagged_pointer(r2_old));
            let delta = r2_count - refcount_from_tagged(r2_old);
            if delta != 0 {
                (*r1)
                    .parent_or_count
                    .fetch_sub(delta << 1, Ordering::Release);
            }

            // Append r2's chain of arenas to r1's.
            let r2_tail = (*r2).tail.load(Ordering::Relaxed);
            let mut r1_tail = (*r1).tail.load(Ordering::Relaxed);
            let mut r1_next = (*r1_tail).next.load(Ordering::Relaxed);
            while !r1_next.is_null() {
                // Stale cached tail; it always converges on the true tail.
                r1_tail = r1_next;
                r1_next = (*r1_tail).next.load(Ordering::Relaxed);
            }
            let old_next = (*r1_tail).next.swap(r2, Ordering::Relaxed);
            debug_assert!(old_next.is_null());
            (*r1).tail.store(r2_tail, Ordering::Relaxed);

            true
        }
    }

    /// Total bytes obtained from the block allocator across the fuse group.
    pub fn space_allocated(&self) -> usize {
        let mut total = 0usize;
        unsafe {
            let mut a = find_root(self.raw.as_ptr());
            while !a.is_null() {
                let mut block = (*a).blocks.load(Ordering::Relaxed);
                while !block.is_null() {
                    total += (*block).alloc_size as usize;
                    block = (*block).next.load(Ordering::Relaxed);
                }
                a = (*a).next.load(Ordering::Relaxed);
            }
        }
        total
    }

    /// Current refcount of this arena's fuse-group root. Diagnostics only;
    /// the value may be stale by the time the caller looks at it.
    pub fn debug_refcount(&self) -> usize {
        unsafe {
            let mut a = self.raw.as_ptr();
            let mut poc = (*a).parent_or_count.load(Ordering::Acquire);
            while is_tagged_pointer(poc) {
                a = pointer_from_tagged(poc);
                poc = (*a).parent_or_count.load(Ordering::Acquire);
            }
            refcount_from_tagged(poc)
        }
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        unsafe { arena_free(self.raw.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    /// Wraps Global and tracks outstanding allocations.
    struct Counting {
        allocs: AtomicUsize,
        deallocs: AtomicUsize,
    }

    impl Counting {
        fn new() -> Self {
            Counting {
                allocs: AtomicUsize::new(0),
                deallocs: AtomicUsize::new(0),
            }
        }

        fn live(&self) -> usize {
            self.allocs.load(Ordering::SeqCst) - self.deallocs.load(Ordering::SeqCst)
        }
    }

    unsafe impl Allocator for Counting {
        fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            Global.allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.deallocs.fetch_add(1, Ordering::SeqCst);
            unsafe { Global.deallocate(ptr, layout) }
        }
    }

    #[test]
    fn test_basic_allocation() {
        let mut arena = Arena::new();
        let a = arena.alloc_raw(Layout::new::<u64>()).unwrap();
        let b = arena.alloc_raw(Layout::new::<u64>()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % 8, 0);
        assert_eq!(b.as_ptr() as usize % 8, 0);
        unsafe {
            *(a.as_ptr() as *mut u64) = 42;
            *(b.as_ptr() as *mut u64) = 1337;
            assert_eq!(*(a.as_ptr() as *mut u64), 42);
            assert_eq!(*(b.as_ptr() as *mut u64), 1337);
        }
    }

    #[test]
    fn test_large_allocation_net_zero() {
        let counting = Counting::new();
        {
            let mut arena = Arena::new_in(&counting);
            let p = arena
                .alloc_raw(Layout::from_size_align(100_000, 8).unwrap())
                .unwrap();
            assert_eq!(p.as_ptr() as usize % 8, 0);
            unsafe {
                // Touch both ends.
                *p.as_ptr() = 1;
                *p.as_ptr().add(99_999) = 2;
            }
            assert!(arena.space_allocated() >= 100_000);
        }
        assert_eq!(counting.live(), 0);
    }

    #[test]
    fn test_block_growth() {
        let mut arena = Arena::new();
        let mut prev = core::ptr::null_mut();
        for i in 0..1000 {
            let p = arena
                .alloc_raw(Layout::from_size_align(64, 8).unwrap())
                .unwrap()
                .as_ptr();
            assert_ne!(p, prev);
            unsafe { core::ptr::write_bytes(p, i as u8, 64) };
            prev = p;
        }
    }

    static CLEANUP_ORDER: std::sync::Mutex<Vec<usize>> = std::sync::Mutex::new(Vec::new());

    unsafe fn record_cleanup(ud: *mut u8) {
        CLEANUP_ORDER.lock().unwrap().push(ud as usize);
    }

    #[test]
    fn test_cleanup_reverse_order() {
        CLEANUP_ORDER.lock().unwrap().clear();
        {
            let mut arena = Arena::new();
            for i in 1..=3usize {
                assert!(unsafe { arena.add_cleanup(i as *mut u8, record_cleanup) });
            }
        }
        assert_eq!(*CLEANUP_ORDER.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_fuse_chain() {
        let counting = Counting::new();
        {
            let mut a = Arena::new_in(&counting);
            let mut b = Arena::new_in(&counting);
            let mut c = Arena::new_in(&counting);
            assert!(a.fuse(&mut b));
            assert!(b.fuse(&mut c));
            unsafe {
                assert_eq!(find_root(a.raw.as_ptr()), find_root(c.raw.as_ptr()));
                assert_eq!(find_root(b.raw.as_ptr()), find_root(c.raw.as_ptr()));
            }
            assert_eq!(a.debug_refcount(), 3);
            drop(a);
            assert_eq!(counting.live(), 3); // Nothing freed yet.
            drop(b);
            assert_eq!(counting.live(), 3);
            drop(c); // Last handle frees all three.
        }
        assert_eq!(counting.live(), 0);
    }

    #[test]
    fn test_fuse_idempotent() {
        let mut a = Arena::new();
        let mut b = Arena::new();
        assert!(a.fuse(&mut b));
        assert!(a.fuse(&mut b));
        assert!(b.fuse(&mut a));
        assert_eq!(a.debug_refcount(), 2);
    }

    #[test]
    fn test_fuse_refused_for_initial_block() {
        let mut seed = [0u8; 1024];
        let mut a = Arena::with_initial_block(&mut seed, &GLOBAL_ALLOC);
        let mut b = Arena::new_in(&GLOBAL_ALLOC);
        assert!(!a.fuse(&mut b));
        assert!(!b.fuse(&mut a));
        assert_eq!(a.debug_refcount(), 1);
        assert_eq!(b.debug_refcount(), 1);
    }

    #[test]
    fn test_fuse_refused_for_allocator_mismatch() {
        let c1 = Counting::new();
        let c2 = Counting::new();
        let mut a = Arena::new_in(&c1);
        let mut b = Arena::new_in(&c2);
        assert!(!a.fuse(&mut b));
    }

    #[test]
    fn test_initial_block_allocations() {
        let counting = Counting::new();
        let mut seed = [0u8; 4096];
        {
            let mut arena = Arena::with_initial_block(&mut seed, &counting);
            let p = arena.alloc_raw(Layout::new::<u64>()).unwrap();
            assert_eq!(p.as_ptr() as usize % 8, 0);
            // Fits in the seed: nothing hits the allocator.
            assert_eq!(counting.live(), 0);
            // Overflow the seed; blocks now come from the allocator.
            arena
                .alloc_raw(Layout::from_size_align(8192, 8).unwrap())
                .unwrap();
            assert_eq!(counting.live(), 1);
        }
        assert_eq!(counting.live(), 0);
    }

    #[test]
    fn test_space_allocated_covers_group() {
        let mut a = Arena::new();
        let mut b = Arena::new();
        let before = a.space_allocated();
        assert!(a.fuse(&mut b));
        assert!(a.space_allocated() > before);
        assert_eq!(a.space_allocated(), b.space_allocated());
    }

    #[test]
    fn test_concurrent_frees() {
        let counting: &'static Counting = Box::leak(Box::new(Counting::new()));
        let mut handles = Vec::new();
        let mut first: Option<Arena> = None;
        for _ in 0..8 {
            let mut arena = Arena::new_in(counting);
            if let Some(f) = first.as_mut() {
                assert!(f.fuse(&mut arena));
            }
            if first.is_none() {
                first = Some(arena);
            } else {
                handles.push(arena);
            }
        }
        handles.push(first.unwrap());
        let threads: Vec<_> = handles
            .into_iter()
            .map(|h| std::thread::spawn(move || drop(h)))
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counting.live(), 0);
    }
}
