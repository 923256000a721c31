use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use riptide_core::Id20;
use tokio::time::Instant;
use tracing::trace;

/// Immutable address plus connection-scoring state. Owned by the
/// [`PeerList`]; outlives any live connection to the peer.
#[derive(Debug)]
pub struct PeerInfo {
    addr: SocketAddr,

    /// Where the peer says it accepts connections; restored into `addr`
    /// when a session ends so reconnects go to the right socket.
    listen_port: u16,

    pub peer_id: Option<Id20>,
    pub incoming: bool,
    pub connected: bool,
    pub last_connection: Option<Instant>,
    pub failed_counter: u32,
}

impl PeerInfo {
    fn new(addr: SocketAddr) -> Self {
        PeerInfo {
            addr,
            listen_port: addr.port(),
            peer_id: None,
            incoming: false,
            connected: false,
            last_connection: None,
            failed_counter: 0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn set_listen_port(&mut self, port: u16) {
        if port != 0 {
            self.listen_port = port;
        }
    }
}

/// Flags for [`PeerList::insert_address`] and friends.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertFlags {
    /// Also queue the address for outgoing connection attempts.
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CullFlags {
    /// Keep peers with a nonzero failed counter or recent activity.
    pub keep_interesting: bool,
}

/// Table of every peer we know about, keyed by IP with the port excluded
/// (one NAT address can host several clients, so the value is a list).
/// The available queue feeds outgoing connection attempts.
#[derive(Debug, Default)]
pub struct PeerList {
    peers: HashMap<IpAddr, Vec<PeerInfo>>,
    available: VecDeque<SocketAddr>,
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerInfo> {
        self.peers
            .get(&addr.ip())?
            .iter()
            .find(|p| p.addr.port() == addr.port())
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerInfo> {
        self.peers
            .get_mut(&addr.ip())?
            .iter_mut()
            .find(|p| p.addr.port() == addr.port())
    }

    /// Inserts if unknown. With `available` the address also enters the
    /// connect queue.
    pub fn insert_address(&mut self, addr: SocketAddr, flags: InsertFlags) -> bool {
        let entry = self.peers.entry(addr.ip()).or_default();
        let new = !entry.iter().any(|p| p.addr.port() == addr.port());
        if new {
            entry.push(PeerInfo::new(addr));
            trace!(%addr, "new peer address");
        }
        if flags.available && !self.available.contains(&addr) {
            self.available.push_back(addr);
        }
        new
    }

    /// Next address to try connecting to.
    pub fn pop_available(&mut self) -> Option<SocketAddr> {
        while let Some(addr) = self.available.pop_front() {
            match self.get(&addr) {
                Some(info) if !info.connected => return Some(addr),
                _ => continue,
            }
        }
        None
    }

    /// A session reached the handshake. Finds or creates the entry.
    pub fn connected(&mut self, addr: SocketAddr, incoming: bool) -> &mut PeerInfo {
        let entry = self.peers.entry(addr.ip()).or_default();
        let index = match entry.iter().position(|p| p.addr.port() == addr.port()) {
            Some(i) => i,
            None => {
                entry.push(PeerInfo::new(addr));
                entry.len() - 1
            }
        };
        let info = &mut entry[index];
        info.incoming = incoming;
        info.connected = true;
        info.last_connection = Some(Instant::now());
        info
    }

    /// A session ended. The address reverts to the peer's listen port so a
    /// future outgoing attempt reaches a listening socket.
    pub fn disconnected(&mut self, addr: &SocketAddr, requeue: bool) {
        let Some(entry) = self.peers.get_mut(&addr.ip()) else {
            return;
        };
        let Some(info) = entry.iter_mut().find(|p| p.addr.port() == addr.port()) else {
            return;
        };
        info.connected = false;
        let listen = SocketAddr::new(addr.ip(), info.listen_port);
        info.addr = listen;
        if requeue && !self.available.contains(&listen) {
            self.available.push_back(listen);
        }
    }

    pub fn record_failure(&mut self, addr: &SocketAddr) {
        if let Some(info) = self.get_mut(addr) {
            info.failed_counter += 1;
        }
    }

    /// Drops peers whose last activity is older than `max_age`. Returns how
    /// many were removed.
    pub fn cull(&mut self, max_age: Duration, flags: CullFlags) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.peers.retain(|_, entry| {
            entry.retain(|p| {
                if p.connected {
                    return true;
                }
                let recent = p
                    .last_connection
                    .is_some_and(|at| now.saturating_duration_since(at) < max_age);
                let keep = recent || (flags.keep_interesting && p.failed_counter > 0);
                if !keep {
                    removed += 1;
                }
                keep
            });
            !entry.is_empty()
        });
        let peers = &self.peers;
        self.available.retain(|addr| {
            peers
                .get(&addr.ip())
                .is_some_and(|entry| entry.iter().any(|p| p.addr.port() == addr.port()))
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8, port: u16) -> SocketAddr {
        format!("10.0.0.{n}:{port}").parse().unwrap()
    }

    #[test]
    fn insert_dedupes_by_ip_and_port() {
        let mut pl = PeerList::new();
        assert!(pl.insert_address(addr(1, 6881), InsertFlags { available: true }));
        assert!(!pl.insert_address(addr(1, 6881), InsertFlags { available: true }));
        assert!(pl.insert_address(addr(1, 6882), InsertFlags::default()));
        assert_eq!(pl.len(), 2);
        assert_eq!(pl.available_len(), 1);
    }

    #[test]
    fn pop_available_skips_connected() {
        let mut pl = PeerList::new();
        pl.insert_address(addr(1, 6881), InsertFlags { available: true });
        pl.insert_address(addr(2, 6881), InsertFlags { available: true });
        pl.connected(addr(1, 6881), false);
        assert_eq!(pl.pop_available(), Some(addr(2, 6881)));
        assert_eq!(pl.pop_available(), None);
    }

    #[test]
    fn disconnect_restores_listen_port() {
        let mut pl = PeerList::new();
        // Incoming connection from an ephemeral port.
        let ephemeral = addr(1, 50123);
        let info = pl.connected(ephemeral, true);
        info.set_listen_port(6881);
        pl.disconnected(&ephemeral, true);

        let listen = addr(1, 6881);
        assert!(pl.get(&listen).is_some());
        assert!(pl.get(&ephemeral).is_none());
        assert_eq!(pl.pop_available(), Some(listen));
    }

    #[tokio::test(start_paused = true)]
    async fn cull_respects_keep_interesting() {
        let mut pl = PeerList::new();
        pl.connected(addr(1, 1), false);
        pl.disconnected(&addr(1, 1), false);
        pl.connected(addr(2, 2), false);
        pl.disconnected(&addr(2, 2), false);
        pl.record_failure(&addr(2, 2));
        pl.insert_address(addr(3, 3), InsertFlags::default());

        tokio::time::advance(Duration::from_secs(7200)).await;
        let removed = pl.cull(Duration::from_secs(3600), CullFlags { keep_interesting: true });
        // 1 is stale, 3 never connected; 2 is kept for its failed counter.
        assert_eq!(removed, 2);
        assert!(pl.get(&addr(2, 2)).is_some());

        let removed = pl.cull(Duration::from_secs(3600), CullFlags::default());
        assert_eq!(removed, 1);
        assert!(pl.is_empty());
    }
}
