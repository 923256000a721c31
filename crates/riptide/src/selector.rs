use std::collections::VecDeque;

use riptide_core::Bitfield;

/// Sorted, merged set of chunk-index ranges derived from file priorities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityRanges {
    ranges: Vec<std::ops::Range<u32>>,
}

impl PriorityRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, range: std::ops::Range<u32>) {
        if range.is_empty() {
            return;
        }
        self.ranges.push(range);
        self.normalize();
    }

    fn normalize(&mut self) {
        self.ranges.sort_by_key(|r| r.start);
        let mut merged: Vec<std::ops::Range<u32>> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, index: u32) -> bool {
        self.ranges
            .binary_search_by(|r| {
                if index < r.start {
                    std::cmp::Ordering::Greater
                } else if index >= r.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::ops::Range<u32>> {
        self.ranges.iter()
    }

    pub fn iter_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|r| r.clone())
    }
}

/// Decides which chunk index to request next.
///
/// Keeps a `wanted` bitfield: chunks not yet complete, inside an active
/// priority range, and not currently in flight. In-flight chunks move to the
/// partial queue, which `find` prefers so peers pile onto nearly-done chunks
/// (and, in endgame, re-request them).
#[derive(Debug)]
pub struct ChunkSelector {
    complete: Bitfield,
    wanted: Bitfield,
    high: PriorityRanges,
    normal: PriorityRanges,
    partial_queue: VecDeque<u32>,
    position: u32,
}

impl ChunkSelector {
    /// Priorities start empty; call `update_priorities` before `find`.
    pub fn new(complete: Bitfield) -> Self {
        let size = complete.size_bits();
        ChunkSelector {
            complete,
            wanted: Bitfield::with_size(size),
            high: PriorityRanges::new(),
            normal: PriorityRanges::new(),
            partial_queue: VecDeque::new(),
            position: 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.wanted.size_bits() as u32
    }

    pub fn high_priority(&self) -> &PriorityRanges {
        &self.high
    }

    pub fn normal_priority(&self) -> &PriorityRanges {
        &self.normal
    }

    pub fn is_wanted(&self, index: u32) -> bool {
        self.wanted.get(index as usize)
    }

    /// Count of chunks not yet verified within the active ranges, in flight
    /// or not. Drives the endgame toggle.
    pub fn outstanding(&self) -> u32 {
        (self.wanted.count_set() + self.partial_queue.len()) as u32
    }

    /// Rebuilds the cached `wanted` set after priority or completion
    /// changes.
    pub fn update_priorities(&mut self, high: PriorityRanges, normal: PriorityRanges) {
        self.high = high;
        self.normal = normal;
        let mut wanted = Bitfield::with_size(self.wanted.size_bits());
        for index in self.high.iter_indices().chain(self.normal.iter_indices()) {
            if !self.complete.get(index as usize) && !self.partial_queue.contains(&index) {
                wanted.set(index as usize);
            }
        }
        self.wanted = wanted;
    }

    /// A chunk verified: it is never wanted again.
    pub fn chunk_completed(&mut self, index: u32) {
        self.complete.set(index as usize);
        self.wanted.unset(index as usize);
        self.partial_queue.retain(|i| *i != index);
    }

    /// Marks a chunk in flight, moving it from `wanted` to the partial
    /// queue.
    pub fn using_index(&mut self, index: u32) {
        self.wanted.unset(index as usize);
        if !self.partial_queue.contains(&index) {
            self.partial_queue.push_back(index);
        }
    }

    /// In-flight mark removed (cancel or hash failure): the chunk becomes
    /// selectable again if priorities still want it.
    pub fn not_using_index(&mut self, index: u32) {
        self.partial_queue.retain(|i| *i != index);
        if !self.complete.get(index as usize)
            && (self.high.contains(index) || self.normal.contains(index))
        {
            self.wanted.set(index as usize);
        }
    }

    /// Whether this HAVE makes the peer interesting to us.
    pub fn received_have_chunk(&self, index: u32) -> bool {
        self.wanted.get(index as usize)
    }

    /// Whether the peer has anything we still want, counting in-flight
    /// chunks (their blocks may still need re-requesting).
    pub fn wants_any(&self, peer_chunks: &Bitfield) -> bool {
        self.wanted.iter_set().any(|i| peer_chunks.get(i))
            || self
                .partial_queue
                .iter()
                .any(|i| peer_chunks.get(*i as usize))
    }

    /// Picks a chunk the peer has. `claimable` lets the caller veto
    /// in-flight chunks that have no block left to hand out.
    pub fn find(
        &mut self,
        peer_chunks: &Bitfield,
        high_priority: bool,
        claimable: impl Fn(u32) -> bool,
    ) -> Option<u32> {
        // In-flight chunks first: finish what is started, and in endgame
        // this is where re-requests come from.
        if let Some(index) = self
            .partial_queue
            .iter()
            .copied()
            .find(|&i| peer_chunks.get(i as usize) && claimable(i))
        {
            return Some(index);
        }

        if high_priority {
            if let Some(index) = self.search_linear(peer_chunks, true) {
                return Some(index);
            }
        }
        self.search_linear(peer_chunks, false)
    }

    /// Linear search from the rotating cursor, wrapping once.
    fn search_linear(&mut self, peer_chunks: &Bitfield, high: bool) -> Option<u32> {
        let size = self.size();
        if size == 0 {
            return None;
        }
        let ranges = if high { &self.high } else { &self.normal };
        if ranges.is_empty() {
            return None;
        }
        let start = self.position % size;
        let hit = (start..size)
            .chain(0..start)
            .find(|&i| {
                self.wanted.get(i as usize) && ranges.contains(i) && peer_chunks.get(i as usize)
            });
        if let Some(index) = hit {
            self.position = index.wrapping_add(1);
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_set(n: usize) -> Bitfield {
        let mut bf = Bitfield::with_size(n);
        bf.set_all();
        bf
    }

    fn ranges(rs: &[std::ops::Range<u32>]) -> PriorityRanges {
        let mut pr = PriorityRanges::new();
        for r in rs {
            pr.insert(r.clone());
        }
        pr
    }

    #[test]
    fn ranges_merge_and_contain() {
        let pr = ranges(&[5..8, 0..3, 7..10, 4..4]);
        assert_eq!(pr.iter().count(), 2);
        assert!(pr.contains(0));
        assert!(!pr.contains(3));
        assert!(pr.contains(9));
        assert!(!pr.contains(10));
    }

    fn selector(n: usize) -> ChunkSelector {
        let mut s = ChunkSelector::new(Bitfield::with_size(n));
        s.update_priorities(PriorityRanges::new(), ranges(&[0..n as u32]));
        s
    }

    #[test]
    fn cursor_rotates_through_chunks() {
        let mut s = selector(4);
        let peer = all_set(4);
        let mut picked = Vec::new();
        for _ in 0..4 {
            // In-flight chunks are claimed out; veto re-selection.
            let i = s.find(&peer, false, |i| !picked.contains(&i)).unwrap();
            s.using_index(i);
            picked.push(i);
        }
        // The partial queue would now offer in-flight chunks; forbid them to
        // check the linear pass is exhausted.
        assert_eq!(s.find(&peer, false, |_| false), None);
        picked.sort();
        assert_eq!(picked, vec![0, 1, 2, 3]);
    }

    #[test]
    fn partial_queue_is_preferred() {
        let mut s = selector(8);
        let peer = all_set(8);
        let first = s.find(&peer, false, |_| true).unwrap();
        s.using_index(first);
        // Peer has everything, but the in-flight chunk wins.
        assert_eq!(s.find(&peer, false, |_| true), Some(first));
        // Unless it has nothing left to claim.
        let second = s.find(&peer, false, |_| false).unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn high_priority_falls_back_to_normal() {
        let mut s = ChunkSelector::new(Bitfield::with_size(10));
        s.update_priorities(ranges(&[2..3]), ranges(&[0..10]));
        let mut peer = Bitfield::with_size(10);
        peer.set(5);

        // Peer lacks the high range; normal fallback finds 5.
        assert_eq!(s.find(&peer, true, |_| true), Some(5));

        peer.set(2);
        assert_eq!(s.find(&peer, true, |_| true), Some(2));
        // Without the high flag the cursor search is over normal only, but
        // 2 is also in the normal range here, so exclude it via priorities.
        s.update_priorities(ranges(&[2..3]), ranges(&[5..6]));
        assert_eq!(s.find(&peer, false, |_| true), Some(5));
    }

    #[test]
    fn off_chunks_are_never_selected() {
        let mut s = ChunkSelector::new(Bitfield::with_size(6));
        // Only 2..4 is wanted at all.
        s.update_priorities(PriorityRanges::new(), ranges(&[2..4]));
        let peer = all_set(6);
        let a = s.find(&peer, false, |_| true).unwrap();
        s.using_index(a);
        let b = s.find(&peer, false, |_| false).unwrap();
        s.using_index(b);
        assert_eq!({ let mut v = vec![a, b]; v.sort(); v }, vec![2, 3]);
        assert_eq!(s.find(&peer, false, |_| false), None);
        assert_eq!(s.outstanding(), 2);
    }

    #[test]
    fn have_interest_and_unmarking() {
        let mut s = selector(4);
        assert!(s.received_have_chunk(1));
        s.using_index(1);
        assert!(!s.received_have_chunk(1));
        s.not_using_index(1);
        assert!(s.received_have_chunk(1));
        s.chunk_completed(1);
        assert!(!s.received_have_chunk(1));
        s.not_using_index(1);
        assert!(!s.is_wanted(1));
    }
}
