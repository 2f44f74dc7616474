//! Stable-latency column storage.
//!
//! A column is grown by dual-buffer incremental resize instead of amortised
//! doubling, so the worst-case cost of a single insert stays bounded:
//!
//! - two buffers, `A` (capacity C) and `B` (capacity 2C, absent initially);
//! - a migration cursor `m`: slots `[0, m)` live in `A`, slots `[m, size)`
//!   live in `B` at the same ordinal offset;
//! - growth past `C + C/2` allocates a fresh `B` at twice the capacity and
//!   starts migrating;
//! - every insert while `m > 0` moves a bounded batch (about one cache line
//!   of elements) from the top of `A`'s range into `B` and decrements `m`;
//!   at `m == 0`, `A` is freed and `B` takes its place.
//!
//! Reads and writes address the right buffer by comparing the slot index
//! against `m`. Contiguous runs therefore break at `m`; the job engine asks
//! for [`StableColumn::boundary`] when slicing arrays.
//!
//! The column is type-erased: element size and alignment come from the
//! component descriptor, and element lifetimes (construction, drops) are the
//! archetype's responsibility. The column only owns the buffers. Elements are
//! relocated bitwise, which is exactly a Rust move.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use crate::utils::CACHE_LINE;

const DEFAULT_INITIAL_CAPACITY: usize = 8;

struct RawBuffer {
    ptr: *mut u8,
    capacity: usize,
}

impl RawBuffer {
    const fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            capacity: 0,
        }
    }

    fn allocate(capacity: usize, elem_size: usize, align: usize) -> Self {
        debug_assert!(capacity > 0 && elem_size > 0);
        let bytes = crate::utils::align_to(capacity * elem_size, align);
        let layout = Layout::from_size_align(bytes, align).expect("column layout overflow");
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        Self { ptr, capacity }
    }

    fn release(&mut self, elem_size: usize, align: usize) {
        if !self.ptr.is_null() {
            let bytes = crate::utils::align_to(self.capacity * elem_size, align);
            let layout = Layout::from_size_align(bytes, align).expect("column layout overflow");
            unsafe { dealloc(self.ptr, layout) };
            self.ptr = std::ptr::null_mut();
            self.capacity = 0;
        }
    }

    fn is_empty(&self) -> bool {
        self.ptr.is_null()
    }
}

/// One type-erased component column with dual-buffer growth.
pub(crate) struct StableColumn {
    elem_size: usize,
    elem_align: usize,
    a: RawBuffer,
    b: RawBuffer,
    /// Slots `[0, migration)` are in `a`; `[migration, size)` in `b`.
    /// When `b` is absent, `migration == size`.
    migration: usize,
    /// Elements moved from `a` to `b` per insert
    batch: usize,
    initial_capacity: usize,
}

// The column is plain memory; thread safety is governed by the archetype's
// access rules (disjoint task ranges, manager lock).
unsafe impl Send for StableColumn {}
unsafe impl Sync for StableColumn {}

impl StableColumn {
    pub fn new(elem_size: usize, elem_align: usize) -> Self {
        Self::with_initial_capacity(elem_size, elem_align, DEFAULT_INITIAL_CAPACITY)
    }

    pub fn with_initial_capacity(
        elem_size: usize,
        elem_align: usize,
        initial_capacity: usize,
    ) -> Self {
        Self {
            elem_size,
            elem_align: elem_align.max(1),
            a: RawBuffer::empty(),
            b: RawBuffer::empty(),
            migration: 0,
            batch: if elem_size == 0 {
                1
            } else {
                (CACHE_LINE / elem_size).max(1)
            },
            initial_capacity: initial_capacity.max(1),
        }
    }

    /// First slot index that is not memory-contiguous with slot 0, or
    /// `usize::MAX` when the column is a single run.
    pub fn boundary(&self) -> usize {
        if self.b.is_empty() {
            usize::MAX
        } else {
            self.migration
        }
    }

    #[cfg(test)]
    pub fn migration_cursor(&self) -> usize {
        self.migration
    }

    pub fn capacity(&self) -> usize {
        if self.elem_size == 0 {
            usize::MAX
        } else {
            self.a.capacity.max(self.b.capacity)
        }
    }

    fn need_grow(&self, size: usize) -> bool {
        size + 1 > self.a.capacity + self.b.capacity / 2
    }

    /// Pointer to the slot that will hold the element at index `size`.
    ///
    /// The caller constructs the element through the returned pointer and
    /// only then increments its size: a failed construction must not leave a
    /// live slot behind.
    pub fn insert_ptr(&mut self, size: usize) -> *mut u8 {
        if self.elem_size == 0 {
            self.migration = size + 1;
            return NonNull::<u8>::dangling().as_ptr();
        }
        if self.need_grow(size) {
            self.grow(size);
        }
        if !self.b.is_empty() {
            self.migrate_step(size);
        }
        if self.b.is_empty() {
            // single-buffer stage: slot goes to A and stays in the prefix
            self.migration = size + 1;
            unsafe { self.a.ptr.add(size * self.elem_size) }
        } else {
            debug_assert!(size >= self.migration && size < self.b.capacity);
            unsafe { self.b.ptr.add(size * self.elem_size) }
        }
    }

    fn grow(&mut self, size: usize) {
        if !self.b.is_empty() {
            // K = 1 sized archetypes can hit the threshold before migration
            // finishes; drain the remainder so the roles can swap
            while self.migration > 0 {
                self.migrate_step(size);
            }
        }
        let new_capacity = (self.a.capacity * 2).max(self.initial_capacity);
        self.b = RawBuffer::allocate(new_capacity, self.elem_size, self.elem_align);
        self.promote_if_done(size);
    }

    fn migrate_step(&mut self, size: usize) {
        let k = self.batch.min(self.migration);
        if k > 0 {
            let first = self.migration - k;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.a.ptr.add(first * self.elem_size),
                    self.b.ptr.add(first * self.elem_size),
                    k * self.elem_size,
                );
            }
            self.migration -= k;
        }
        self.promote_if_done(size);
    }

    fn promote_if_done(&mut self, size: usize) {
        if self.migration == 0 && !self.b.is_empty() {
            self.a.release(self.elem_size, self.elem_align);
            self.a = std::mem::replace(&mut self.b, RawBuffer::empty());
            self.migration = size;
        }
    }

    /// Raw pointer to an existing slot
    pub fn slot_ptr(&self, index: usize) -> *mut u8 {
        if self.elem_size == 0 {
            return NonNull::<u8>::dangling().as_ptr();
        }
        let buffer = if index < self.migration { &self.a } else { &self.b };
        debug_assert!(index < buffer.capacity);
        unsafe { buffer.ptr.add(index * self.elem_size) }
    }

    /// Shrinkage bookkeeping after a swap-remove
    pub fn note_removed(&mut self, new_size: usize) {
        if self.migration > new_size {
            self.migration = new_size;
        }
    }

    /// Size went to zero; buffers are kept
    pub fn note_cleared(&mut self) {
        self.promote_if_done(0);
        self.migration = 0;
    }
}

impl Drop for StableColumn {
    fn drop(&mut self) {
        if self.elem_size > 0 {
            self.a.release(self.elem_size, self.elem_align);
            self.b.release(self.elem_size, self.elem_align);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Typed shim over the raw column for tests
    struct TypedColumn<T> {
        column: StableColumn,
        size: usize,
        _marker: std::marker::PhantomData<T>,
    }

    impl<T> TypedColumn<T> {
        fn new(initial: usize) -> Self {
            Self {
                column: StableColumn::with_initial_capacity(
                    std::mem::size_of::<T>(),
                    std::mem::align_of::<T>(),
                    initial,
                ),
                size: 0,
                _marker: std::marker::PhantomData,
            }
        }

        fn push(&mut self, value: T) {
            let ptr = self.column.insert_ptr(self.size) as *mut T;
            unsafe { std::ptr::write(ptr, value) };
            self.size += 1;
        }

        fn get(&self, index: usize) -> &T {
            assert!(index < self.size);
            unsafe { &*(self.column.slot_ptr(index) as *const T) }
        }
    }

    #[test]
    fn test_push_get_across_growth() {
        let mut col = TypedColumn::<u64>::new(4);
        for i in 0..1000u64 {
            col.push(i * 3);
        }
        for i in 0..1000usize {
            assert_eq!(*col.get(i), i as u64 * 3);
        }
    }

    #[test]
    fn test_capacity_one() {
        // the migration-cursor arithmetic must tolerate single-slot buffers
        let mut col = TypedColumn::<[u8; 16]>::new(1);
        for i in 0..100u8 {
            col.push([i; 16]);
        }
        for i in 0..100usize {
            assert_eq!(col.get(i)[0], i as u8);
        }
    }

    #[test]
    fn test_boundary_splits_runs() {
        let mut col = TypedColumn::<u32>::new(4);
        for i in 0..7u32 {
            col.push(i);
        }
        let boundary = col.column.boundary();
        if boundary != usize::MAX {
            assert!(boundary <= col.size);
            // both runs are internally contiguous
            for w in [(0, boundary), (boundary, col.size)] {
                for i in w.0..w.1.saturating_sub(1) {
                    let a = col.column.slot_ptr(i) as usize;
                    let b = col.column.slot_ptr(i + 1) as usize;
                    assert_eq!(b - a, 4);
                }
            }
        }
    }

    #[test]
    fn test_migration_terminates() {
        let mut col = TypedColumn::<u64>::new(8);
        for i in 0..10_000u64 {
            col.push(i);
        }
        // after enough inserts past the last growth, migration must finish
        while col.column.migration_cursor() != col.size
            && col.column.boundary() != usize::MAX
        {
            let size = col.size;
            col.push(size as u64);
        }
        assert_eq!(*col.get(9_999), 9_999);
    }

    #[test]
    fn test_zero_sized_elements() {
        let mut col = StableColumn::new(0, 1);
        for size in 0..32 {
            let ptr = col.insert_ptr(size);
            assert!(!ptr.is_null());
        }
        assert_eq!(col.capacity(), usize::MAX);
    }

    #[test]
    fn test_removal_clamps_cursor() {
        let mut col = TypedColumn::<u32>::new(2);
        for i in 0..20u32 {
            col.push(i);
        }
        // shrink below the cursor, then push again
        col.size = 3;
        col.column.note_removed(3);
        for i in 0..40u32 {
            col.push(100 + i);
        }
        assert_eq!(*col.get(0), 0);
        assert_eq!(*col.get(3), 100);
        assert_eq!(*col.get(42), 139);
    }
}
