//! Size-bucketed free lists for a single stream within a [`crate::pool::SingleDevicePool`].
//!
//! Free chunks are kept in bins indexed by a rounded-up size class rather than in one flat list, so
//! a best-fit search only has to look at chunks already known to be large enough.

use crate::runtime::StreamId;

/// Identifies a chunk by which parent [`crate::raw_allocation::RawAllocation`] it belongs to and its
/// index within that parent's chunk slab.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ChunkRef {
    pub parent: usize,
    pub chunk: usize,
}

/// Round `size` up to the next multiple of `unit`. `unit` must be nonzero.
pub fn round_up(size: usize, unit: usize) -> usize {
    debug_assert!(unit > 0);
    if size == 0 {
        0
    } else {
        ((size + unit - 1) / unit) * unit
    }
}

/// The size-class index a chunk of `size` bytes (already a multiple of `unit`) belongs in: bin `i`
/// holds sizes in `(i * unit, (i + 1) * unit]`, so a chunk of rounded size `k * unit` lives in bin
/// `k - 1`. `size` must be at least 1.
pub fn bin_index(size: usize, unit: usize) -> usize {
    debug_assert!(unit > 0);
    debug_assert!(size > 0);
    (size - 1) / unit
}

/// Free-chunk bins for one stream. Bins are indexed by [`bin_index`] and grow on demand: a request
/// for a bin beyond the current capacity simply extends the `Vec` with empty bins, rather than
/// erroring, since bin count only reflects how large an allocation has been requested so far.
#[derive(Debug)]
pub struct Arena {
    pub stream: StreamId,
    bins: Vec<Vec<ChunkRef>>,
    unit: usize,
}

impl Arena {
    pub fn new(stream: StreamId, initial_bins: usize, unit: usize) -> Self {
        Self {
            stream,
            bins: vec![Vec::new(); initial_bins.max(1)],
            unit,
        }
    }

    fn ensure_bin(&mut self, index: usize) {
        if index >= self.bins.len() {
            #[cfg(feature = "log-objects")]
            log::trace!(
                "arena for stream {:?} growing from {} to {} bins",
                self.stream,
                self.bins.len(),
                index + 1
            );
            self.bins.resize_with(index + 1, Vec::new);
        }
    }

    /// Record a free chunk of `size` bytes (rounded up to `unit` by the caller) as available for
    /// reuse.
    pub fn insert(&mut self, size: usize, chunk: ChunkRef) {
        let index = bin_index(size, self.unit);
        self.ensure_bin(index);
        self.bins[index].push(chunk);
    }

    /// Remove and return the best-fit free chunk for a request of `size` bytes: the smallest bin at
    /// or above `size`'s bin index that is non-empty, popped LIFO (most recently freed first, which
    /// favors chunks still warm in cache on the host side doing the bookkeeping).
    pub fn take_best_fit(&mut self, size: usize) -> Option<ChunkRef> {
        let start = bin_index(size, self.unit);
        for index in start..self.bins.len() {
            if let Some(chunk) = self.bins[index].pop() {
                return Some(chunk);
            }
        }
        None
    }

    /// Remove a specific chunk reference from whichever bin it occupies, used when a chunk is about
    /// to be merged with a neighbor and so must not be independently reused afterward.
    pub fn remove(&mut self, size: usize, chunk: ChunkRef) {
        let index = bin_index(size, self.unit);
        if index >= self.bins.len() {
            return;
        }
        if let Some(pos) = self.bins[index].iter().position(|c| *c == chunk) {
            self.bins[index].swap_remove(pos);
        }
    }

    /// Total number of free chunks tracked across all bins.
    pub fn free_chunk_count(&self) -> usize {
        self.bins.iter().map(Vec::len).sum()
    }

    /// Iterate every free chunk reference currently tracked, regardless of bin.
    pub fn iter(&self) -> impl Iterator<Item = ChunkRef> + '_ {
        self.bins.iter().flatten().copied()
    }

    /// Drop every tracked free chunk. Used when the pool releases all free blocks back to the
    /// runtime.
    pub fn clear(&mut self) {
        for bin in &mut self.bins {
            bin.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_rounds_to_unit_multiples() {
        assert_eq!(round_up(0, 512), 0);
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(512, 512), 512);
        assert_eq!(round_up(513, 512), 1024);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_bin() {
        let mut arena = Arena::new(StreamId::DEFAULT, 4, 512);
        arena.insert(512, ChunkRef { parent: 0, chunk: 0 });
        arena.insert(1024, ChunkRef { parent: 0, chunk: 1 });
        let got = arena.take_best_fit(600).unwrap();
        assert_eq!(got, ChunkRef { parent: 0, chunk: 1 });
        assert_eq!(arena.free_chunk_count(), 1);
    }

    #[test]
    fn bins_grow_on_demand_beyond_initial_capacity() {
        let mut arena = Arena::new(StreamId::DEFAULT, 1, 512);
        arena.insert(512 * 100, ChunkRef { parent: 0, chunk: 0 });
        assert_eq!(arena.free_chunk_count(), 1);
    }

    #[test]
    fn bin_index_matches_the_documented_k_minus_one_scheme() {
        // A chunk of rounded size k*U lives in bin k-1.
        assert_eq!(bin_index(512, 512), 0);
        assert_eq!(bin_index(1024, 512), 1);
        assert_eq!(bin_index(1536, 512), 2);
        assert_eq!(bin_index(2048, 512), 3);
    }
}
