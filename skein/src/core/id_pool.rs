// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Dense id allocator backed by a bitmap.
//!
//! Maps live objects to dense 1-based `u32` indices. Think "file descriptor
//! allocator" rather than "virtual-memory allocator": allocation always
//! returns the smallest free index, which keeps index-addressed arenas cache
//! friendly and makes iteration bounded by [`IdPool::max_index`].

/// Bits per bitmap chunk. Capacity is always a multiple of this.
const CHUNK_BITS: u32 = 64;

#[derive(Debug, Default)]
pub struct IdPool {
    /// Bitmap; bit = 1 means the index is free.
    freebm: Vec<u64>,
    /// Highest allocated index (0 when none are allocated).
    maxidx: u32,
}

impl IdPool {
    #[must_use]
    pub fn new() -> Self { Self::with_capacity(CHUNK_BITS) }

    /// `cap` is rounded up to a whole number of chunks.
    #[must_use]
    pub fn with_capacity(cap: u32) -> Self {
        let nchunks = cap.div_ceil(CHUNK_BITS).max(1) as usize;
        Self { freebm: vec![u64::MAX; nchunks], maxidx: 0 }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 { self.freebm.len() as u32 * CHUNK_BITS }

    /// Highest live index; bounds iteration over an index-addressed arena.
    #[must_use]
    pub fn max_index(&self) -> u32 { self.maxidx }

    /// Allocates the smallest free index (1-based). Grows by one chunk when
    /// every index is in use.
    pub fn alloc(&mut self) -> u32 {
        for (chunk_idx, chunk) in self.freebm.iter_mut().enumerate() {
            let bm = *chunk;
            if bm == 0 {
                continue; // all indices of this chunk are in use
            }
            let bit_idx = bm.trailing_zeros();
            *chunk = bm & !(1u64 << bit_idx);
            let idx = chunk_idx as u32 * CHUNK_BITS + bit_idx + 1;
            if idx > self.maxidx {
                self.maxidx = idx;
            }
            return idx;
        }
        // all chunks occupied; grow by one chunk
        let base = self.capacity();
        self.freebm.push(u64::MAX & !1);
        self.maxidx = base + 1;
        base + 1
    }

    /// Returns `idx` to the free set.
    ///
    /// # Panics
    ///
    /// Panics (debug) when `idx` is out of range or already free, which
    /// would indicate an id double-free.
    pub fn free(&mut self, idx: u32) {
        debug_assert!(idx > 0 && idx <= self.capacity(), "index {idx} out of range");
        let chunk_idx = ((idx - 1) / CHUNK_BITS) as usize;
        let bit_idx = (idx - 1) % CHUNK_BITS;
        debug_assert_eq!(
            self.freebm[chunk_idx] & (1u64 << bit_idx),
            0,
            "double free of index {idx}"
        );
        self.freebm[chunk_idx] |= 1u64 << bit_idx;

        if idx != self.maxidx {
            return;
        }

        // maxidx was freed; scan backward for the true maximum. Chunks that
        // are entirely free are skipped at chunk granularity.
        let mut chunk_idx = chunk_idx;
        loop {
            let chunk = self.freebm[chunk_idx];
            if chunk == 0 {
                // chunk is full and everything above it is free
                self.maxidx = (chunk_idx as u32 + 1) * CHUNK_BITS;
                return;
            } else if chunk != u64::MAX {
                // chunk has at least one allocated index; the highest one
                // sits right below the run of free bits at the top
                let top_free = chunk.leading_ones();
                self.maxidx = chunk_idx as u32 * CHUNK_BITS + (CHUNK_BITS - top_free);
                return;
            } else if chunk_idx == 0 {
                // every chunk is completely free
                self.maxidx = 0;
                return;
            } else {
                chunk_idx -= 1;
            }
        }
    }

    #[must_use]
    pub fn is_free(&self, idx: u32) -> bool {
        if idx == 0 || idx > self.capacity() {
            return true;
        }
        let chunk_idx = ((idx - 1) / CHUNK_BITS) as usize;
        let bit_idx = (idx - 1) % CHUNK_BITS;
        self.freebm[chunk_idx] & (1u64 << bit_idx) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dense_sequential_allocation() {
        let mut p = IdPool::with_capacity(3);
        const N: u32 = 200; // crosses three chunk boundaries

        for idx in 1..=p.capacity() {
            assert!(p.is_free(idx));
        }

        for expect in 1..=N {
            assert_eq!(p.alloc(), expect);
        }
        for idx in 1..=N {
            assert!(!p.is_free(idx));
        }
        assert_eq!(p.max_index(), N);
    }

    #[test]
    fn test_freed_slots_are_reused_smallest_first() {
        let mut p = IdPool::new();
        const N: u32 = 200;
        for _ in 1..=N {
            p.alloc();
        }

        // free every 4th entry
        for idx in 1..=N {
            if idx % 4 == 3 {
                p.free(idx);
            }
        }
        for idx in 1..=N {
            assert_eq!(p.is_free(idx), idx % 4 == 3, "idx {idx}");
        }

        // re-allocation fills the freed slots in ascending order
        for idx in 1..=N {
            if idx % 4 == 3 {
                assert_eq!(p.alloc(), idx);
            }
        }
        for idx in 1..=N {
            assert!(!p.is_free(idx));
        }
    }

    #[test]
    fn test_maxidx_rescan_on_free() {
        let mut p = IdPool::new();
        const N: u32 = 200;
        for _ in 1..=N {
            p.alloc();
        }
        assert_eq!(p.max_index(), N);

        // free with a pattern that hits idx == maxidx several times
        for idx in 10..=N {
            if idx % 4 != 3 {
                p.free(idx);
            }
        }
        for idx in 1..=N {
            if idx % 4 == 3 || idx < 10 {
                p.free(idx);
            }
        }

        assert_eq!(p.max_index(), 0);
        for idx in 1..=p.capacity() {
            assert!(p.is_free(idx));
        }
        assert_eq!(p.alloc(), 1);
    }

    #[test]
    fn test_growth_across_chunk_boundary() {
        let mut p = IdPool::with_capacity(64);
        assert_eq!(p.capacity(), 64);
        for _ in 0..64 {
            p.alloc();
        }
        assert_eq!(p.alloc(), 65);
        assert_eq!(p.capacity(), 128);
        assert_eq!(p.max_index(), 65);
        p.free(65);
        assert_eq!(p.max_index(), 64);
    }
}
