//! Chunk bookkeeping: the sub-blocks a [`crate::pool::SingleDevicePool`] carves out of each
//! [`crate::raw_allocation::RawAllocation`] it owns.
//!
//! Chunks live in a slab (`Vec<Chunk>`) per parent allocation and reference each other by index
//! rather than through `Rc`/`RefCell` pointers. Using indices sidesteps the cyclic-ownership problem
//! an `Rc<RefCell<Chunk>>` doubly-linked list would create, at the cost of every chunk reference
//! being an index into its parent's slab instead of a pointer.

use crate::runtime::StreamId;

/// One contiguous sub-block of a parent [`crate::raw_allocation::RawAllocation`].
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset of this chunk within its parent allocation.
    pub offset: u64,
    /// Size of this chunk in bytes.
    pub size: usize,
    /// Address-order predecessor within the parent allocation, if any.
    pub prev: Option<usize>,
    /// Address-order successor within the parent allocation, if any.
    pub next: Option<usize>,
    /// The stream this chunk was last used on. A free chunk may only be handed back to a request
    /// tagged with the same stream, since reuse across streams without synchronization would be a
    /// use-after-free race on the device.
    pub stream_tag: StreamId,
    pub in_use: bool,
}

impl Chunk {
    pub fn new(offset: u64, size: usize, stream_tag: StreamId) -> Self {
        Self {
            offset,
            size,
            prev: None,
            next: None,
            stream_tag,
            in_use: false,
        }
    }
}

/// Split `n` bytes off the front of the free chunk at `index` in `slab`, marking that front portion
/// in use and inserting a new free chunk for the remainder immediately after it.
///
/// Returns the index of the (now in-use) front chunk. If `n == chunk.size` the chunk is marked
/// in-use in place and no remainder chunk is created.
///
/// # Panics
/// Panics if the chunk at `index` is already in use or smaller than `n`; both are caller bugs in
/// this crate, never a condition a pool's public API should let a caller trigger.
pub fn split(slab: &mut Vec<Chunk>, index: usize, n: usize, stream_tag: StreamId) -> usize {
    let chunk = &slab[index];
    assert!(!chunk.in_use, "splitting an in-use chunk");
    assert!(chunk.size >= n, "split size exceeds chunk size");

    if chunk.size == n {
        let chunk = &mut slab[index];
        chunk.in_use = true;
        chunk.stream_tag = stream_tag;
        return index;
    }

    let remainder_offset = chunk.offset + n as u64;
    let remainder_size = chunk.size - n;
    let old_next = chunk.next;

    let remainder = Chunk {
        offset: remainder_offset,
        size: remainder_size,
        prev: Some(index),
        next: old_next,
        stream_tag,
        in_use: false,
    };
    let remainder_index = slab.len();
    slab.push(remainder);

    if let Some(next) = old_next {
        slab[next].prev = Some(remainder_index);
    }

    let chunk = &mut slab[index];
    chunk.size = n;
    chunk.in_use = true;
    chunk.stream_tag = stream_tag;
    chunk.next = Some(remainder_index);

    index
}

/// Coalesce the chunk at `index` with its address-order neighbors, as far as they are free and
/// carry the same stream tag. Returns the index of the surviving (merged) chunk; the chunks it
/// absorbed are left as zero-size tombstones in the slab rather than removed, so existing indices
/// elsewhere in the slab stay valid.
pub fn merge_with_neighbors(slab: &mut Vec<Chunk>, index: usize) -> usize {
    let mut index = index;

    while let Some(next) = slab[index].next {
        if slab[next].in_use || slab[next].stream_tag != slab[index].stream_tag {
            break;
        }
        absorb_next(slab, index);
        let _ = next;
    }

    while let Some(prev) = slab[index].prev {
        if slab[prev].in_use || slab[prev].stream_tag != slab[index].stream_tag {
            break;
        }
        absorb_next(slab, prev);
        index = prev;
    }

    index
}

/// Return the indices of every chunk that [`merge_with_neighbors`] would absorb into `index`,
/// without mutating anything. Callers that track free chunks in an auxiliary structure (such as an
/// [`crate::arena::Arena`]) need this to evict those chunks' stale entries before the merge
/// tombstones them.
pub fn free_neighbors(slab: &[Chunk], index: usize) -> Vec<usize> {
    let stream_tag = slab[index].stream_tag;
    let mut found = Vec::new();

    let mut cur = index;
    while let Some(next) = slab[cur].next {
        if slab[next].in_use || slab[next].stream_tag != stream_tag {
            break;
        }
        found.push(next);
        cur = next;
    }

    let mut cur = index;
    while let Some(prev) = slab[cur].prev {
        if slab[prev].in_use || slab[prev].stream_tag != stream_tag {
            break;
        }
        found.push(prev);
        cur = prev;
    }

    found
}

/// Absorb the chunk following `index` into `index`, extending its size and re-linking the chain.
/// The absorbed chunk becomes a zero-size tombstone and must never be referenced again.
fn absorb_next(slab: &mut Vec<Chunk>, index: usize) {
    let next = slab[index].next.expect("absorb_next requires a next chunk");
    let next_next = slab[next].next;
    let next_size = slab[next].size;

    slab[index].size += next_size;
    slab[index].next = next_next;
    if let Some(nn) = next_next {
        slab[nn].prev = Some(index);
    }

    let tomb = &mut slab[next];
    tomb.size = 0;
    tomb.prev = None;
    tomb.next = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_exact_size_marks_in_use_without_remainder() {
        let mut slab = vec![Chunk::new(0, 256, StreamId::DEFAULT)];
        let idx = split(&mut slab, 0, 256, StreamId::DEFAULT);
        assert_eq!(idx, 0);
        assert!(slab[0].in_use);
        assert_eq!(slab[0].size, 256);
        assert_eq!(slab[0].next, None);
    }

    #[test]
    fn split_smaller_creates_free_remainder() {
        let mut slab = vec![Chunk::new(0, 256, StreamId::DEFAULT)];
        let idx = split(&mut slab, 0, 64, StreamId::DEFAULT);
        assert_eq!(idx, 0);
        assert!(slab[0].in_use);
        assert_eq!(slab[0].size, 64);
        let rem = slab[0].next.unwrap();
        assert!(!slab[rem].in_use);
        assert_eq!(slab[rem].size, 192);
        assert_eq!(slab[rem].offset, 64);
        assert_eq!(slab[rem].prev, Some(0));
    }

    #[test]
    fn merge_recombines_split_chunk() {
        let mut slab = vec![Chunk::new(0, 256, StreamId::DEFAULT)];
        let idx = split(&mut slab, 0, 64, StreamId::DEFAULT);
        slab[idx].in_use = false;
        let merged = merge_with_neighbors(&mut slab, idx);
        assert_eq!(slab[merged].size, 256);
        assert_eq!(slab[merged].next, None);
    }

    #[test]
    fn free_neighbors_reports_both_sides_of_a_three_way_split() {
        let mut slab = vec![Chunk::new(0, 300, StreamId::DEFAULT)];
        let a = split(&mut slab, 0, 100, StreamId::DEFAULT);
        let rem = slab[a].next.unwrap();
        let b = split(&mut slab, rem, 100, StreamId::DEFAULT);
        slab[a].in_use = false;
        slab[b].in_use = false;
        let c = slab[b].next.unwrap();
        slab[c].in_use = false;

        let mut neighbors = free_neighbors(&slab, b);
        neighbors.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(neighbors, expected);
    }

    #[test]
    fn merge_stops_at_different_stream_tags() {
        let mut slab = vec![Chunk::new(0, 256, StreamId::DEFAULT)];
        let idx = split(&mut slab, 0, 64, StreamId(1));
        slab[idx].in_use = false;
        let rem = slab[idx].next.unwrap();
        slab[rem].stream_tag = StreamId(2);
        let merged = merge_with_neighbors(&mut slab, idx);
        assert_eq!(merged, idx);
        assert_eq!(slab[merged].size, 64);
    }
}
