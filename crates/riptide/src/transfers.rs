use std::collections::HashMap;
use std::net::SocketAddr;

use riptide_core::layout::{BlockInfo, ChunkIndex, Layout};
use tracing::{debug, trace};

pub type PeerKey = SocketAddr;

/// Addresses one peer's attempt at one block. Stable across reallocation:
/// blocks live contiguously in their list and transfers are found by peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRef {
    pub chunk: u32,
    pub block_index: u32,
    pub peer: PeerKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Requested on the wire, no data yet.
    Queued,
    /// This transfer's bytes populate the chunk buffer.
    Leader,
    /// Data arriving for an already-led block; discarded unless it overtakes
    /// the leader with matching bytes.
    NotLeader,
    Erased,
}

#[derive(Debug, PartialEq)]
pub struct BlockTransfer {
    pub peer: PeerKey,
    pub state: TransferState,

    /// Bytes received so far; for the leader, bytes written to the buffer.
    pub position: u32,
    pub stall: u32,
}

#[derive(Debug)]
pub struct Block {
    pub info: BlockInfo,
    transfers: Vec<BlockTransfer>,
    finished: bool,

    /// Which peer's bytes are captured in the buffer; set when the block
    /// finishes, consumed by the hash-failure quorum.
    captured_by: Option<PeerKey>,
}

impl Block {
    fn new(info: BlockInfo) -> Self {
        Block {
            info,
            transfers: Vec::new(),
            finished: false,
            captured_by: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn transfers(&self) -> &[BlockTransfer] {
        &self.transfers
    }

    pub fn leader(&self) -> Option<&BlockTransfer> {
        self.transfers
            .iter()
            .find(|t| t.state == TransferState::Leader)
    }

    fn find(&self, peer: &PeerKey) -> Option<usize> {
        self.transfers
            .iter()
            .position(|t| t.peer == *peer && t.state != TransferState::Erased)
    }

    pub fn has_peer(&self, peer: &PeerKey) -> bool {
        self.find(peer).is_some()
    }

    fn live_transfers(&self) -> usize {
        self.transfers
            .iter()
            .filter(|t| t.state != TransferState::Erased)
            .count()
    }

    pub fn is_stalled(&self) -> bool {
        self.transfers
            .iter()
            .filter(|t| t.state != TransferState::Erased)
            .all(|t| t.stall > 0)
    }
}

/// All blocks of one in-flight chunk.
#[derive(Debug)]
pub struct BlockList {
    chunk: ChunkIndex,
    blocks: Vec<Block>,
    finished_count: u32,

    /// Hash verification attempts that came back wrong.
    pub failed_counter: u32,
}

impl BlockList {
    fn new(chunk: ChunkIndex, layout: &Layout) -> Self {
        BlockList {
            chunk,
            blocks: layout.iter_blocks(chunk).map(Block::new).collect(),
            finished_count: 0,
            failed_counter: 0,
        }
    }

    pub fn chunk(&self) -> ChunkIndex {
        self.chunk
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn is_all_finished(&self) -> bool {
        self.finished_count == self.blocks.len() as u32
    }

    pub fn finished_count(&self) -> u32 {
        self.finished_count
    }

    /// Picks a block for `peer` to request. Outside endgame only untouched
    /// blocks qualify; in endgame a block with only stalled strangers can be
    /// doubled up on.
    pub fn claim_block(&self, peer: &PeerKey, endgame: bool) -> Option<u32> {
        let untouched = self
            .blocks
            .iter()
            .position(|b| !b.finished && b.live_transfers() == 0);
        if let Some(i) = untouched {
            return Some(i as u32);
        }
        if !endgame {
            return None;
        }
        self.blocks
            .iter()
            .position(|b| !b.finished && !b.has_peer(peer) && b.is_stalled())
            .map(|i| i as u32)
    }
}

/// What happened to a non-leader transfer's incoming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotLeaderOutcome {
    /// Still behind the leader (or matching so far); bytes are dropped.
    Discard,
    /// Passed the leader with matching data; this transfer now leads.
    TookOver,
    /// Bytes disagreed with the buffer; transfer invalidated.
    Invalidated,
}

#[derive(Debug)]
pub enum HashFailOutcome {
    /// Attempt counter below the cap: minority contributors' blocks are
    /// re-queued, the listed peers should be deprioritized.
    Retry { suspects: Vec<PeerKey> },
    /// Cap reached: entry erased, all contributors should be dropped.
    Erased { culprits: Vec<PeerKey> },
}

/// Chunk-index → BlockList for every chunk currently in flight. Chunks in
/// here are by definition unverified; verification success or failure
/// removes the entry.
#[derive(Debug, Default)]
pub struct TransferList {
    lists: HashMap<u32, BlockList>,
}

impl TransferList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn contains(&self, chunk: u32) -> bool {
        self.lists.contains_key(&chunk)
    }

    pub fn get(&self, chunk: u32) -> Option<&BlockList> {
        self.lists.get(&chunk)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockList> {
        self.lists.values()
    }

    pub fn insert(&mut self, chunk: ChunkIndex, layout: &Layout) -> &mut BlockList {
        debug_assert!(!self.lists.contains_key(&chunk.get()));
        self.lists
            .entry(chunk.get())
            .or_insert_with(|| BlockList::new(chunk, layout))
    }

    fn block_mut(&mut self, r: &TransferRef) -> Option<&mut Block> {
        self.lists
            .get_mut(&r.chunk)?
            .blocks
            .get_mut(r.block_index as usize)
    }

    pub fn block(&self, r: &TransferRef) -> Option<&Block> {
        self.lists.get(&r.chunk)?.blocks.get(r.block_index as usize)
    }

    pub fn transfer(&self, r: &TransferRef) -> Option<&BlockTransfer> {
        let b = self.block(r)?;
        b.find(&r.peer).map(|i| &b.transfers[i])
    }

    /// Creates a queued transfer for `peer` on the given block.
    pub fn queue_transfer(&mut self, chunk: u32, block_index: u32, peer: PeerKey) -> Option<TransferRef> {
        let block = self
            .lists
            .get_mut(&chunk)?
            .blocks
            .get_mut(block_index as usize)?;
        if block.has_peer(&peer) {
            return None;
        }
        block.transfers.push(BlockTransfer {
            peer,
            state: TransferState::Queued,
            position: 0,
            stall: 0,
        });
        Some(TransferRef {
            chunk,
            block_index,
            peer,
        })
    }

    /// The PIECE header for this transfer arrived: the queued transfer goes
    /// active. The first writer leads; later writers stall behind it.
    /// Returns whether this transfer is the leader.
    pub fn downloading(&mut self, r: &TransferRef) -> bool {
        let Some(block) = self.block_mut(r) else {
            return false;
        };
        let has_leader = block
            .transfers
            .iter()
            .any(|t| t.state == TransferState::Leader);
        let Some(i) = block.find(&r.peer) else {
            return false;
        };
        let t = &mut block.transfers[i];
        if t.state != TransferState::Queued {
            return t.state == TransferState::Leader;
        }
        t.position = 0;
        if has_leader || block.finished {
            t.state = TransferState::NotLeader;
            false
        } else {
            t.state = TransferState::Leader;
            true
        }
    }

    /// Advances the leader as its bytes land in the chunk buffer.
    pub fn leader_advanced(&mut self, r: &TransferRef, bytes: u32) {
        if let Some(block) = self.block_mut(r)
            && let Some(i) = block.find(&r.peer)
        {
            let t = &mut block.transfers[i];
            debug_assert_eq!(t.state, TransferState::Leader);
            t.position += bytes;
            t.stall = 0;
        }
    }

    /// A non-leader received `bytes` more; `matches` says whether everything
    /// it has sent so far agrees with the captured buffer.
    pub fn not_leader_advanced(
        &mut self,
        r: &TransferRef,
        bytes: u32,
        matches: bool,
    ) -> NotLeaderOutcome {
        let Some(block) = self.block_mut(r) else {
            return NotLeaderOutcome::Discard;
        };
        let Some(i) = block.find(&r.peer) else {
            return NotLeaderOutcome::Discard;
        };
        if !matches {
            block.transfers[i].state = TransferState::Erased;
            trace!(?r, "mismatching non-leader data, transfer invalidated");
            return NotLeaderOutcome::Invalidated;
        }
        block.transfers[i].position += bytes;
        block.transfers[i].stall = 0;
        let position = block.transfers[i].position;

        let leader_position = block.leader().map(|t| t.position);
        match leader_position {
            Some(lp) if position > lp => {
                // Overtake: the stalled leader is demoted.
                for t in block.transfers.iter_mut() {
                    if t.state == TransferState::Leader {
                        t.state = TransferState::NotLeader;
                    }
                }
                block.transfers[i].state = TransferState::Leader;
                debug!(?r, "transfer took over block leadership");
                NotLeaderOutcome::TookOver
            }
            Some(_) => NotLeaderOutcome::Discard,
            None => {
                // Leader was erased; first survivor takes over.
                block.transfers[i].state = TransferState::Leader;
                NotLeaderOutcome::TookOver
            }
        }
    }

    /// Marks the block finished. Only honored for the leader. Returns
    /// whether the whole chunk is now finished.
    pub fn finished(&mut self, r: &TransferRef) -> Option<bool> {
        let list = self.lists.get_mut(&r.chunk)?;
        let block = list.blocks.get_mut(r.block_index as usize)?;
        let i = block.find(&r.peer)?;
        if block.transfers[i].state != TransferState::Leader || block.finished {
            return Some(list.is_all_finished());
        }
        block.finished = true;
        block.captured_by = Some(r.peer);
        // The block is settled; everyone else's attempts die with it.
        for t in block.transfers.iter_mut() {
            t.state = TransferState::Erased;
        }
        list.finished_count += 1;
        Some(list.is_all_finished())
    }

    /// Collects the duplicate transfers on a block other peers are still
    /// working, so the caller can emit CANCELs. Called right before
    /// `finished`.
    pub fn concurrent_peers(&self, r: &TransferRef) -> Vec<PeerKey> {
        self.block(r)
            .map(|b| {
                b.transfers
                    .iter()
                    .filter(|t| t.state != TransferState::Erased && t.peer != r.peer)
                    .map(|t| t.peer)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Erases one peer's transfer, e.g. on cancel or disconnect.
    pub fn erase_transfer(&mut self, r: &TransferRef) {
        if let Some(block) = self.block_mut(r)
            && let Some(i) = block.find(&r.peer)
        {
            block.transfers[i].state = TransferState::Erased;
        }
    }

    /// Bumps stall counters on one peer's transfers for a chunk; stalled
    /// transfers open their blocks for endgame re-requests.
    pub fn stall_transfer(&mut self, r: &TransferRef) {
        if let Some(block) = self.block_mut(r)
            && let Some(i) = block.find(&r.peer)
        {
            block.transfers[i].stall += 1;
        }
    }

    /// Verified: the entry is gone.
    pub fn hash_succeeded(&mut self, chunk: u32) -> Option<BlockList> {
        self.lists.remove(&chunk)
    }

    /// Verification failed. Below the attempt cap the most popular
    /// contributor's blocks are kept and the rest re-queued; at the cap the
    /// entry is erased and every contributor is a culprit.
    pub fn hash_failed(&mut self, chunk: u32, attempt_cap: u32) -> Option<HashFailOutcome> {
        let list = self.lists.get_mut(&chunk)?;
        list.failed_counter += 1;

        let mut contributions: HashMap<PeerKey, u32> = HashMap::new();
        for b in &list.blocks {
            if let Some(peer) = b.captured_by {
                *contributions.entry(peer).or_default() += 1;
            }
        }

        if list.failed_counter >= attempt_cap {
            let culprits = contributions.into_keys().collect();
            self.lists.remove(&chunk);
            return Some(HashFailOutcome::Erased { culprits });
        }

        // Quorum by captured block count: trust the peer that wrote the
        // most, retry everything written by the rest. A lone contributor of
        // a bad chunk has no quorum to hide behind.
        let (majority, suspects) = if contributions.len() > 1 {
            let majority = contributions
                .iter()
                .max_by_key(|(_, count)| **count)
                .map(|(peer, _)| *peer);
            let suspects = contributions
                .keys()
                .filter(|p| Some(**p) != majority)
                .copied()
                .collect();
            (majority, suspects)
        } else {
            (None, contributions.into_keys().collect::<Vec<_>>())
        };

        for b in list.blocks.iter_mut() {
            let keep = majority.is_some() && b.captured_by == majority;
            if b.finished && !keep {
                b.finished = false;
                b.captured_by = None;
                list.finished_count -= 1;
            }
            b.transfers.clear();
        }
        Some(HashFailOutcome::Retry { suspects })
    }

    /// Drops block lists nobody is working and nothing has been captured
    /// for, so their chunks become selectable again. Returns the reaped
    /// chunk indices.
    pub fn reap_idle(&mut self) -> Vec<u32> {
        let idle: Vec<u32> = self
            .lists
            .values()
            .filter(|l| {
                l.finished_count == 0
                    && l.blocks.iter().all(|b| b.live_transfers() == 0)
            })
            .map(|l| l.chunk.get())
            .collect();
        for index in &idle {
            self.lists.remove(index);
        }
        idle
    }

    /// Drops every transfer belonging to `peer`, returning the refs that
    /// were still live. Used on disconnect.
    pub fn erase_peer(&mut self, peer: &PeerKey) -> Vec<TransferRef> {
        let mut erased = Vec::new();
        for list in self.lists.values_mut() {
            for block in list.blocks.iter_mut() {
                for t in block.transfers.iter_mut() {
                    if t.peer == *peer && t.state != TransferState::Erased {
                        t.state = TransferState::Erased;
                        erased.push(TransferRef {
                            chunk: list.chunk.get(),
                            block_index: block.info.block_index,
                            peer: *peer,
                        });
                    }
                }
            }
        }
        erased
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::constants::BLOCK_LEN;

    fn addr(n: u8) -> PeerKey {
        format!("10.0.0.{n}:6881").parse().unwrap()
    }

    fn layout() -> Layout {
        // 2 chunks: 3 blocks + 1 short block.
        Layout::new(3 * BLOCK_LEN as u64 + 100, 3 * BLOCK_LEN).unwrap()
    }

    fn in_flight(tl: &mut TransferList, l: &Layout, chunk: u32) -> ChunkIndex {
        let c = l.validate_chunk(chunk).unwrap();
        tl.insert(c, l);
        c
    }

    #[test]
    fn first_writer_leads_then_one_leader_invariant() {
        let l = layout();
        let mut tl = TransferList::new();
        in_flight(&mut tl, &l, 0);

        let a = tl.queue_transfer(0, 0, addr(1)).unwrap();
        let b = tl.queue_transfer(0, 0, addr(2)).unwrap();
        // Same peer cannot queue twice on one block.
        assert!(tl.queue_transfer(0, 0, addr(1)).is_none());

        assert!(tl.downloading(&a));
        assert!(!tl.downloading(&b));

        let block = tl.block(&a).unwrap();
        let leaders = block
            .transfers()
            .iter()
            .filter(|t| t.state == TransferState::Leader)
            .count();
        assert_eq!(leaders, 1);
    }

    #[test]
    fn overtake_requires_matching_data() {
        let l = layout();
        let mut tl = TransferList::new();
        in_flight(&mut tl, &l, 0);

        let a = tl.queue_transfer(0, 0, addr(1)).unwrap();
        let b = tl.queue_transfer(0, 0, addr(2)).unwrap();
        tl.downloading(&a);
        tl.downloading(&b);
        tl.leader_advanced(&a, 100);

        // Behind the leader: discarded.
        assert_eq!(tl.not_leader_advanced(&b, 100, true), NotLeaderOutcome::Discard);
        // Past the leader with matching data: takes over.
        assert_eq!(tl.not_leader_advanced(&b, 50, true), NotLeaderOutcome::TookOver);
        let block = tl.block(&a).unwrap();
        assert_eq!(block.leader().unwrap().peer, addr(2));
        assert_eq!(
            block
                .transfers()
                .iter()
                .filter(|t| t.state == TransferState::Leader)
                .count(),
            1
        );
    }

    #[test]
    fn mismatching_late_writer_is_invalidated() {
        let l = layout();
        let mut tl = TransferList::new();
        in_flight(&mut tl, &l, 0);
        let a = tl.queue_transfer(0, 0, addr(1)).unwrap();
        let b = tl.queue_transfer(0, 0, addr(2)).unwrap();
        tl.downloading(&a);
        tl.downloading(&b);
        tl.leader_advanced(&a, 10);
        assert_eq!(
            tl.not_leader_advanced(&b, 10, false),
            NotLeaderOutcome::Invalidated
        );
        assert_eq!(tl.transfer(&b), None);
    }

    #[test]
    fn finished_only_honors_the_leader() {
        let l = layout();
        let mut tl = TransferList::new();
        // Chunk 1 is the short tail: a single block.
        in_flight(&mut tl, &l, 1);

        let a = tl.queue_transfer(1, 0, addr(1)).unwrap();
        let b = tl.queue_transfer(1, 0, addr(2)).unwrap();
        tl.downloading(&a);
        tl.downloading(&b);

        // Not the leader: block stays open.
        tl.finished(&b);
        assert!(!tl.get(1).unwrap().blocks()[0].is_finished());

        assert_eq!(tl.finished(&a), Some(true));
        assert!(tl.get(1).unwrap().is_all_finished());
    }

    #[test]
    fn claim_prefers_untouched_blocks_and_respects_endgame() {
        let l = layout();
        let mut tl = TransferList::new();
        in_flight(&mut tl, &l, 0);

        let r0 = tl.queue_transfer(0, 0, addr(1)).unwrap();
        assert_eq!(tl.get(0).unwrap().claim_block(&addr(2), false), Some(1));
        tl.queue_transfer(0, 1, addr(2)).unwrap();
        tl.queue_transfer(0, 2, addr(1)).unwrap();

        // Everything claimed: nothing outside endgame.
        assert_eq!(tl.get(0).unwrap().claim_block(&addr(2), false), None);
        // Endgame still requires the existing transfer to be stalled.
        assert_eq!(tl.get(0).unwrap().claim_block(&addr(2), true), None);
        tl.downloading(&r0);
        tl.stall_transfer(&r0);
        assert_eq!(tl.get(0).unwrap().claim_block(&addr(2), true), Some(0));
        // A peer never doubles up on its own block.
        assert_eq!(tl.get(0).unwrap().claim_block(&addr(1), true), None);
    }

    #[test]
    fn hash_fail_below_cap_keeps_majority_and_flags_minority() {
        let l = layout();
        let mut tl = TransferList::new();
        in_flight(&mut tl, &l, 0);

        // addr(1) contributes blocks 0 and 1, addr(2) contributes block 2.
        for (block, peer) in [(0, addr(1)), (1, addr(1)), (2, addr(2))] {
            let r = tl.queue_transfer(0, block, peer).unwrap();
            tl.downloading(&r);
            tl.finished(&r);
        }
        assert!(tl.get(0).unwrap().is_all_finished());

        match tl.hash_failed(0, 3).unwrap() {
            HashFailOutcome::Retry { suspects } => assert_eq!(suspects, vec![addr(2)]),
            other => panic!("expected retry, got {other:?}"),
        }
        let list = tl.get(0).unwrap();
        assert_eq!(list.failed_counter, 1);
        // Majority blocks kept, minority block reopened.
        assert!(list.blocks()[0].is_finished());
        assert!(list.blocks()[1].is_finished());
        assert!(!list.blocks()[2].is_finished());
        assert_eq!(list.finished_count(), 2);
    }

    #[test]
    fn hash_fail_single_contributor_requeues_everything() {
        let l = layout();
        let mut tl = TransferList::new();
        in_flight(&mut tl, &l, 0);
        for block in 0..3 {
            let r = tl.queue_transfer(0, block, addr(1)).unwrap();
            tl.downloading(&r);
            tl.finished(&r);
        }
        match tl.hash_failed(0, 3).unwrap() {
            HashFailOutcome::Retry { suspects } => assert_eq!(suspects, vec![addr(1)]),
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(tl.get(0).unwrap().finished_count(), 0);
    }

    #[test]
    fn hash_fail_at_cap_erases_and_blames_contributors() {
        let l = layout();
        let mut tl = TransferList::new();
        in_flight(&mut tl, &l, 0);
        for block in 0..3 {
            let r = tl.queue_transfer(0, block, addr(1)).unwrap();
            tl.downloading(&r);
            tl.finished(&r);
        }
        match tl.hash_failed(0, 1).unwrap() {
            HashFailOutcome::Erased { culprits } => assert_eq!(culprits, vec![addr(1)]),
            other => panic!("expected erased, got {other:?}"),
        }
        assert!(!tl.contains(0));
    }

    #[test]
    fn erase_peer_reports_live_refs() {
        let l = layout();
        let mut tl = TransferList::new();
        in_flight(&mut tl, &l, 0);
        tl.queue_transfer(0, 0, addr(1)).unwrap();
        tl.queue_transfer(0, 1, addr(1)).unwrap();
        tl.queue_transfer(0, 2, addr(2)).unwrap();
        let erased = tl.erase_peer(&addr(1));
        assert_eq!(erased.len(), 2);
        assert!(tl.get(0).unwrap().blocks()[2].has_peer(&addr(2)));
    }
}
