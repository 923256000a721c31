use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use riptide_core::{Bitfield, Id20};
use riptide_peer_protocol::Request;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::trace;

use crate::error::Error;
use crate::rate::Rate;
use crate::request_queue::RequestQueue;
use crate::scheduler::EntryId;
use crate::session::WriterRequest;

/// Everything about a live peer session the engine mutates from outside the
/// session task. Locked per connection; never take the download lock while
/// holding this one.
pub struct ConnState {
    pub bitfield: Bitfield,
    pub got_bitfield: bool,
    pub got_any_message: bool,

    /// We choke the peer.
    pub up_choked: bool,
    /// The peer is interested in us.
    pub up_interested: bool,
    /// The peer chokes us.
    pub down_choked: bool,
    /// We are interested in the peer.
    pub down_interested: bool,

    pub snubbed: bool,

    pub down_rate: Rate,
    pub up_rate: Rate,

    pub requests: RequestQueue,

    /// REQUESTs the peer sent us, served one PIECE at a time.
    pub send_queue: VecDeque<Request>,

    pub last_seen: Instant,

    /// Last time our choke state toward the peer actually changed; basis of
    /// the 10 s anti-oscillation gap.
    pub last_choke_change: Option<Instant>,
    pub unchoked_at: Option<Instant>,

    /// A choke deferred by the oscillation gap, waiting on its timer.
    pub pending_choke: Option<bool>,
}

#[derive(Default)]
pub struct ConnTimers {
    pub stall: Option<EntryId>,
    pub delayed_choke: Option<EntryId>,
}

/// A live session bound to one peer. The session task owns the socket; this
/// shared half carries protocol state and the writer channel.
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub peer_id: Id20,
    pub incoming: bool,
    pub tx: UnboundedSender<WriterRequest>,
    pub state: parking_lot::Mutex<ConnState>,
    pub timers: parking_lot::Mutex<ConnTimers>,
}

impl PeerConnection {
    pub fn new(
        addr: SocketAddr,
        peer_id: Id20,
        incoming: bool,
        total_chunks: usize,
        tx: UnboundedSender<WriterRequest>,
    ) -> Self {
        PeerConnection {
            addr,
            peer_id,
            incoming,
            tx,
            state: parking_lot::Mutex::new(ConnState {
                bitfield: Bitfield::with_size(total_chunks),
                got_bitfield: false,
                got_any_message: false,
                up_choked: true,
                up_interested: false,
                down_choked: true,
                down_interested: false,
                snubbed: false,
                down_rate: Rate::new_transfer_rate(),
                up_rate: Rate::new_transfer_rate(),
                requests: RequestQueue::new(addr),
                send_queue: VecDeque::new(),
                last_seen: Instant::now(),
                last_choke_change: None,
                unchoked_at: None,
                pending_choke: None,
            }),
            timers: parking_lot::Mutex::new(ConnTimers::default()),
        }
    }

    pub fn send(&self, req: WriterRequest) {
        // A dropped writer means the session is tearing down; the erase
        // path will clean up.
        let _ = self.tx.send(req);
    }

    pub fn is_seeder(&self, total_chunks: usize) -> bool {
        let s = self.state.lock();
        s.bitfield.count_set() == total_chunks
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerConnection({})", self.addr)
    }
}

pub type ConnSlot = Box<dyn Fn(&std::sync::Arc<PeerConnection>) + Send>;

/// The set of admitted peer sessions, bounded by capacity.
///
/// Listeners registered on the connected/disconnected channels run inside
/// the engine lock and must only touch the connection itself.
pub struct ConnectionList {
    capacity: usize,
    conns: HashMap<SocketAddr, std::sync::Arc<PeerConnection>>,
    connected_slots: Vec<ConnSlot>,
    disconnected_slots: Vec<ConnSlot>,
}

impl ConnectionList {
    pub fn new(capacity: usize) -> Self {
        ConnectionList {
            capacity,
            conns: HashMap::new(),
            connected_slots: Vec::new(),
            disconnected_slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&std::sync::Arc<PeerConnection>> {
        self.conns.get(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<PeerConnection>> {
        self.conns.values()
    }

    pub fn slot_connected(&mut self, slot: ConnSlot) {
        self.connected_slots.push(slot);
    }

    pub fn slot_disconnected(&mut self, slot: ConnSlot) {
        self.disconnected_slots.push(slot);
    }

    pub fn insert(
        &mut self,
        conn: std::sync::Arc<PeerConnection>,
    ) -> Result<std::sync::Arc<PeerConnection>, Error> {
        if self.conns.len() >= self.capacity {
            return Err(Error::ConnectionLimit);
        }
        if self.conns.contains_key(&conn.addr) {
            return Err(Error::DuplicateConnection);
        }
        self.conns.insert(conn.addr, conn.clone());
        trace!(addr = %conn.addr, total = self.conns.len(), "connection admitted");
        for slot in &self.connected_slots {
            slot(&conn);
        }
        Ok(conn)
    }

    /// Removes the connection before notifying listeners, so a listener may
    /// iterate the list without seeing the corpse.
    pub fn erase(&mut self, addr: &SocketAddr) -> Option<std::sync::Arc<PeerConnection>> {
        let conn = self.conns.remove(addr)?;
        for slot in &self.disconnected_slots {
            slot(&conn);
        }
        Some(conn)
    }

    /// Once we are done, peers that also have everything are dead weight.
    pub fn erase_seeders(&mut self, total_chunks: usize) -> Vec<std::sync::Arc<PeerConnection>> {
        let seeders: Vec<SocketAddr> = self
            .conns
            .values()
            .filter(|c| c.is_seeder(total_chunks))
            .map(|c| c.addr)
            .collect();
        seeders.iter().filter_map(|a| self.erase(a)).collect()
    }

    /// Strips addresses we already have sessions with from a fresh tracker
    /// address list.
    pub fn set_difference(&self, addrs: &mut Vec<SocketAddr>) {
        addrs.retain(|a| !self.conns.contains_key(a));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::unbounded_channel;

    fn conn(n: u8) -> Arc<PeerConnection> {
        let (tx, _rx) = unbounded_channel();
        Arc::new(PeerConnection::new(
            format!("10.0.0.{n}:6881").parse().unwrap(),
            Id20::new([n; 20]),
            false,
            8,
            tx,
        ))
    }

    #[tokio::test]
    async fn capacity_and_duplicates_are_rejected() {
        let mut cl = ConnectionList::new(2);
        let a = conn(1);
        cl.insert(a.clone()).unwrap();
        assert!(matches!(
            cl.insert(a.clone()),
            Err(Error::DuplicateConnection)
        ));
        cl.insert(conn(2)).unwrap();
        assert!(matches!(cl.insert(conn(3)), Err(Error::ConnectionLimit)));
        assert_eq!(cl.len(), 2);
    }

    #[tokio::test]
    async fn erase_fires_slots_after_removal() {
        let mut cl = ConnectionList::new(4);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        cl.slot_disconnected(Box::new(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        }));
        let a = conn(1);
        cl.insert(a.clone()).unwrap();
        let erased = cl.erase(&a.addr).unwrap();
        assert_eq!(erased.addr, a.addr);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(cl.erase(&a.addr).is_none());
    }

    #[tokio::test]
    async fn erase_seeders_and_set_difference() {
        let mut cl = ConnectionList::new(4);
        let seeder = conn(1);
        seeder.state.lock().bitfield.set_all();
        let leecher = conn(2);
        cl.insert(seeder.clone()).unwrap();
        cl.insert(leecher.clone()).unwrap();

        let mut addrs = vec![seeder.addr, leecher.addr, "10.0.0.9:1".parse().unwrap()];
        cl.set_difference(&mut addrs);
        assert_eq!(addrs, vec!["10.0.0.9:1".parse().unwrap()]);

        let erased = cl.erase_seeders(8);
        assert_eq!(erased.len(), 1);
        assert_eq!(erased[0].addr, seeder.addr);
        assert_eq!(cl.len(), 1);
    }
}
