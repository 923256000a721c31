use std::collections::VecDeque;
use std::sync::Arc;

use riptide_core::Bitfield;
use riptide_core::layout::{BlockInfo, Layout};
use riptide_peer_protocol::Request;
use tracing::trace;

use crate::chunks::{ChunkHandle, ChunkStore, GetFlags};
use crate::selector::ChunkSelector;
use crate::transfers::{NotLeaderOutcome, PeerKey, TransferList, TransferRef};

/// One outstanding block request on the wire, pinning its chunk mapping so
/// the budget prefers chunks that are already being worked.
pub struct QueuedRequest {
    pub block: BlockInfo,
    pub transfer: TransferRef,
    pub chunk: Arc<ChunkHandle>,
}

/// Borrowed engine state `delegate` needs to pick work.
pub struct DelegateCtx<'a> {
    pub selector: &'a mut ChunkSelector,
    pub transfers: &'a mut TransferList,
    pub store: &'a ChunkStore,
    pub layout: &'a Layout,
    pub endgame: bool,
}

#[derive(Debug)]
pub enum PieceOutcome {
    /// The block completed; `cancels` lists other peers' duplicate
    /// transfers to CANCEL.
    BlockFinished {
        transfer: TransferRef,
        chunk_finished: bool,
        cancels: Vec<TransferRef>,
    },
    /// Data accepted (or silently discarded for a trailing non-leader).
    Accepted,
    /// Non-leader data contradicted the buffer; its transfer is gone.
    Invalidated,
    /// No outstanding request matches; the caller drains the bytes.
    Skip,
}

/// Per-peer ordered queue of outstanding block requests.
#[derive(Default)]
pub struct RequestQueue {
    peer: Option<PeerKey>,
    queue: VecDeque<QueuedRequest>,
}

impl RequestQueue {
    pub fn new(peer: PeerKey) -> Self {
        RequestQueue {
            peer: Some(peer),
            queue: VecDeque::new(),
        }
    }

    fn peer(&self) -> PeerKey {
        self.peer.expect("request queue used before binding a peer")
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.queue.iter()
    }

    /// Fills the pipeline up to `target` requests, creating transfers and
    /// pinning chunk mappings. Returns the REQUEST messages to put on the
    /// wire.
    pub fn delegate(
        &mut self,
        ctx: &mut DelegateCtx<'_>,
        peer_chunks: &Bitfield,
        high_priority: bool,
        target: usize,
    ) -> Vec<Request> {
        let peer = self.peer();
        let mut out = Vec::new();
        while self.queue.len() < target {
            let endgame = ctx.endgame;
            let transfers = &ctx.transfers;
            let Some(index) = ctx.selector.find(peer_chunks, high_priority, |c| {
                transfers
                    .get(c)
                    .is_none_or(|bl| bl.claim_block(&peer, endgame).is_some())
            }) else {
                break;
            };
            // Selector output is always within the layout.
            let chunk = ctx.layout.validate_chunk(index).unwrap();

            let handle = match ctx.store.get(
                chunk,
                GetFlags {
                    write: true,
                    not_hashing: true,
                },
            ) {
                Ok(h) => Arc::new(h),
                Err(e) => {
                    // Budget pressure or a hashing conflict; stop growing
                    // the pipeline this round.
                    trace!(chunk = index, "delegation backed off: {e}");
                    break;
                }
            };

            if !ctx.transfers.contains(index) {
                ctx.transfers.insert(chunk, ctx.layout);
                ctx.selector.using_index(index);
            }
            let Some(block_index) = ctx
                .transfers
                .get(index)
                .and_then(|bl| bl.claim_block(&peer, ctx.endgame))
            else {
                break;
            };
            let Some(transfer) = ctx.transfers.queue_transfer(index, block_index, peer) else {
                break;
            };
            // Claimed block indices are valid for the chunk.
            let block = ctx.layout.block(chunk, block_index).unwrap();
            out.push(Request::new(index, block.offset, block.len));
            self.queue.push_back(QueuedRequest {
                block,
                transfer,
                chunk: handle,
            });
        }
        out
    }

    /// Routes an incoming PIECE. It must match the head of the queue;
    /// anything else is a stale or unsolicited piece the session skips.
    pub fn receive_piece(
        &mut self,
        index: u32,
        begin: u32,
        data: &[u8],
        transfers: &mut TransferList,
    ) -> crate::Result<PieceOutcome> {
        let matches_head = self.queue.front().is_some_and(|q| {
            q.block.chunk.get() == index && q.block.offset == begin && q.block.len as usize == data.len()
        });
        if !matches_head {
            return Ok(PieceOutcome::Skip);
        }
        let entry = self.queue.pop_front().expect("checked non-empty");

        let is_leader = transfers.downloading(&entry.transfer);
        if is_leader {
            entry.chunk.write(entry.block.offset, data)?;
            transfers.leader_advanced(&entry.transfer, data.len() as u32);
            return Ok(self.finish_block(entry, transfers));
        }

        // Not the leader: bytes only matter if they overtake the leader
        // with agreeing content. Compare against whatever the leader has
        // already captured.
        let leader_position = transfers
            .block(&entry.transfer)
            .and_then(|b| b.leader())
            .map(|t| t.position as usize)
            .unwrap_or(0);
        let compare = leader_position.min(data.len());
        let agrees = entry.chunk.matches(entry.block.offset, &data[..compare]);
        match transfers.not_leader_advanced(&entry.transfer, data.len() as u32, agrees) {
            NotLeaderOutcome::TookOver => {
                entry.chunk.write(entry.block.offset, data)?;
                Ok(self.finish_block(entry, transfers))
            }
            NotLeaderOutcome::Discard => Ok(PieceOutcome::Accepted),
            NotLeaderOutcome::Invalidated => Ok(PieceOutcome::Invalidated),
        }
    }

    fn finish_block(&mut self, entry: QueuedRequest, transfers: &mut TransferList) -> PieceOutcome {
        let cancels = transfers.concurrent_peers(&entry.transfer);
        let cancels = cancels
            .into_iter()
            .map(|peer| TransferRef {
                peer,
                ..entry.transfer
            })
            .collect();
        match transfers.finished(&entry.transfer) {
            Some(chunk_finished) => PieceOutcome::BlockFinished {
                transfer: entry.transfer,
                chunk_finished,
                cancels,
            },
            None => PieceOutcome::Skip,
        }
    }

    /// Invalidates everything outstanding. Returns the CANCEL messages for
    /// the wire; callers only send them while the peer still serves us.
    pub fn cancel_all(&mut self, transfers: &mut TransferList) -> Vec<Request> {
        let mut cancels = Vec::with_capacity(self.queue.len());
        for entry in self.queue.drain(..) {
            transfers.erase_transfer(&entry.transfer);
            cancels.push(Request::new(
                entry.block.chunk.get(),
                entry.block.offset,
                entry.block.len,
            ));
        }
        cancels
    }

    /// Drops one queued request, e.g. when another peer finished the block
    /// first. Returns the CANCEL to send.
    pub fn cancel_block(
        &mut self,
        transfer: &TransferRef,
        transfers: &mut TransferList,
    ) -> Option<Request> {
        let pos = self.queue.iter().position(|q| {
            q.transfer.chunk == transfer.chunk && q.transfer.block_index == transfer.block_index
        })?;
        let entry = self.queue.remove(pos).expect("position is in range");
        transfers.erase_transfer(&entry.transfer);
        Some(Request::new(
            entry.block.chunk.get(),
            entry.block.offset,
            entry.block.len,
        ))
    }

    /// Marks everything outstanding stalled, opening the blocks up for
    /// endgame re-requests elsewhere.
    pub fn stall_all(&mut self, transfers: &mut TransferList) {
        for entry in &self.queue {
            transfers.stall_transfer(&entry.transfer);
        }
    }
}

/// Pipeline depth as a function of the peer's download rate (bytes/s).
pub fn pipe_size(rate: u64, endgame: bool) -> usize {
    let rate = rate as f64;
    if !endgame {
        if rate < 50_000.0 {
            ((rate + 2_000.0) / 2_000.0).max(2.0) as usize
        } else {
            (((rate + 160_000.0) / 4_000.0) as usize).min(200)
        }
    } else if rate < 4_000.0 {
        1
    } else {
        (((rate + 32_000.0) / 8_000.0) as usize).min(80)
    }
}
