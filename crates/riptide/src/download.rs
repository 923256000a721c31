use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use riptide_core::layout::{ChunkIndex, Layout};
use riptide_core::metainfo::Metainfo;
use riptide_core::peer_id::generate_peer_id;
use riptide_core::resume::{FileResume, ResumeData};
use riptide_core::{Bitfield, Id20};
use riptide_peer_protocol::{Message, Request};
use riptide_tracker::{
    AnnounceStats, AnnounceStatsProvider, TrackerConfig, TrackerController, TrackerList,
    TrackerTransport,
};
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::choke::{ChokeCandidate, ChokeManager};
use crate::chunks::{ChunkSource, ChunkStore, GetFlags, SyncFlags};
use crate::config::Config;
use crate::connections::{ConnectionList, PeerConnection};
use crate::error::{Error, ProtocolViolation, Result};
use crate::files::FileList;
use crate::hash::HashQueue;
use crate::peers::{CullFlags, InsertFlags, PeerList};
use crate::request_queue::{DelegateCtx, PieceOutcome, pipe_size};
use crate::scheduler::Scheduler;
use crate::selector::ChunkSelector;
use crate::session::{self, WriterRequest};
use crate::signal::{CallbackKey, CallbackQueue, SignalBitfield};
use crate::throttle::ThrottleList;

const CHOKE_FLAP_GAP: std::time::Duration = std::time::Duration::from_secs(10);

static NEXT_CALLBACK_KEY: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy)]
enum TimerEvent {
    Tick,
    Stall(SocketAddr),
    DelayedChoke(SocketAddr),
}

/// Piece-state and bookkeeping guarded by one lock. Lock order: this lock,
/// then any connection's state, then the scheduler. Never the reverse.
struct DownloadState {
    files: FileList,
    selector: ChunkSelector,
    transfers: crate::transfers::TransferList,
    peers: PeerList,
    connections: ConnectionList,
    choker: ChokeManager,

    /// Recently verified chunks with their announcement times; trimmed to
    /// the configured window each tick.
    have_queue: VecDeque<(Instant, u32)>,

    endgame: bool,
    checked: bool,
    last_cull: Instant,
}

#[derive(Default)]
struct TransferStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    remaining: AtomicU64,
}

impl AnnounceStatsProvider for TransferStats {
    fn get(&self) -> AnnounceStats {
        AnnounceStats {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.remaining.load(Ordering::Relaxed),
        }
    }
}

/// One torrent: wires the piece engine, peer sessions, choking and the
/// tracker controller together.
pub struct Download {
    meta: Metainfo,
    layout: Layout,
    config: Config,
    peer_id: Id20,

    state: Mutex<DownloadState>,
    store: ChunkStore,
    hasher: HashQueue,
    tracker: Option<Arc<TrackerController>>,

    scheduler: Mutex<Scheduler<TimerEvent>>,
    signals: SignalBitfield,
    inbox: CallbackQueue,
    callback_key: CallbackKey,

    down_throttle: Mutex<ThrottleList>,
    up_throttle: Mutex<ThrottleList>,

    stats: Arc<TransferStats>,

    /// Wakes the engine loop to recompute its deadline.
    wake: Notify,
    /// Fired each tick after throttle refill; quota waiters subscribe.
    tick_notify: Notify,

    cancel: CancellationToken,
    stopped: AtomicBool,

    sig_rebalance: AtomicU32,
    sig_connect: AtomicU32,

    tick_timer: Mutex<Option<crate::scheduler::EntryId>>,

    peers_rx: Mutex<Option<UnboundedReceiver<SocketAddr>>>,
    weak: Weak<Download>,
}

impl Download {
    /// Builds a download around validated metainfo. `transport` carries the
    /// announce round trips; pass `None` for trackerless operation.
    pub fn new(
        meta: Metainfo,
        config: Config,
        source: Box<dyn ChunkSource>,
        transport: Option<Arc<dyn TrackerTransport>>,
    ) -> anyhow::Result<Arc<Self>> {
        meta.validate()?;
        let layout = meta.layout()?;
        let files = FileList::from_metainfo(&meta, layout);
        let selector = ChunkSelector::new(files.bitfield().clone());
        let peer_id = generate_peer_id();
        let callback_key = NEXT_CALLBACK_KEY.fetch_add(1, Ordering::Relaxed);

        let stats = Arc::new(TransferStats {
            remaining: AtomicU64::new(layout.total_bytes()),
            ..Default::default()
        });

        let (peers_tx, peers_rx) = unbounded_channel();
        let tracker = transport.map(|transport| {
            TrackerController::new(
                TrackerConfig::new(meta.info_hash, peer_id, config.listen_port),
                TrackerList::from_tiers(&meta.announce_tiers()),
                transport,
                stats.clone(),
                peers_tx,
            )
        });

        let download = Arc::new_cyclic(|weak: &Weak<Download>| {
            let sink_weak = weak.clone();
            let sink: crate::chunks::StorageErrorSink = Box::new(move |e| {
                let Some(d) = sink_weak.upgrade() else { return };
                let msg = format!("{e:#}");
                let d2 = d.clone();
                d.inbox
                    .push(d.callback_key, move || d2.fatal_storage_error(msg));
                d.wake.notify_one();
            });

            Download {
                state: Mutex::new(DownloadState {
                    files,
                    selector,
                    transfers: crate::transfers::TransferList::new(),
                    peers: PeerList::new(),
                    connections: ConnectionList::new(config.max_connections),
                    choker: ChokeManager::new(
                        config.unchoke_slots,
                        config.choke_grace_period(),
                        config.choke_cycle(),
                    ),
                    have_queue: VecDeque::new(),
                    endgame: false,
                    checked: false,
                    last_cull: Instant::now(),
                }),
                store: ChunkStore::new(layout, source, config.chunk_budget_bytes, sink),
                hasher: HashQueue::spawn(),
                tracker,
                scheduler: Mutex::new(Scheduler::new()),
                signals: SignalBitfield::new(),
                inbox: CallbackQueue::new(),
                callback_key,
                down_throttle: Mutex::new(ThrottleList::new(config.download_rate_limit)),
                up_throttle: Mutex::new(ThrottleList::new(config.upload_rate_limit)),
                stats,
                wake: Notify::new(),
                tick_notify: Notify::new(),
                cancel: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                sig_rebalance: AtomicU32::new(0),
                sig_connect: AtomicU32::new(0),
                tick_timer: Mutex::new(None),
                peers_rx: Mutex::new(Some(peers_rx)),
                weak: weak.clone(),
                meta,
                layout,
                config,
                peer_id,
            }
        });

        let w = Arc::downgrade(&download);
        let idx = download.signals.add_signal(move || {
            if let Some(d) = w.upgrade() {
                d.balance_chokes();
            }
        });
        download.sig_rebalance.store(idx, Ordering::Relaxed);
        let w = Arc::downgrade(&download);
        let idx = download.signals.add_signal(move || {
            if let Some(d) = w.upgrade() {
                d.connect_more_peers();
            }
        });
        download.sig_connect.store(idx, Ordering::Relaxed);

        Ok(download)
    }

    pub fn info_hash(&self) -> Id20 {
        self.meta.info_hash
    }

    pub fn our_peer_id(&self) -> Id20 {
        self.peer_id
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> Option<&Arc<TrackerController>> {
        self.tracker.as_ref()
    }

    pub fn is_endgame(&self) -> bool {
        self.state.lock().endgame
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().files.is_done()
    }

    pub fn completed_bitfield(&self) -> Bitfield {
        self.state.lock().files.bitfield().clone()
    }

    pub fn completed_bytes(&self) -> u64 {
        self.state.lock().files.completed_bytes()
    }

    // --- Lifecycle -------------------------------------------------------

    /// Initial check: hashes every chunk already on disk and seeds the
    /// bitfield from the results. Mismatches just leave bits unset; the
    /// torrent never fails to open over them.
    pub async fn open(self: &Arc<Self>) -> anyhow::Result<()> {
        let (tx, mut rx) = unbounded_channel::<(u32, Option<[u8; 20]>)>();
        let mut todo = self.layout.iter_chunks();
        let mut outstanding = 0usize;
        let mut bf = Bitfield::with_size(self.layout.total_chunks() as usize);

        loop {
            // A bounded window of queued chunks keeps the mapped set small.
            while outstanding < 32 {
                let Some(index) = todo.next() else { break };
                match self.store.get(index, GetFlags::default()) {
                    Ok(handle) => {
                        let tx = tx.clone();
                        self.hasher.push(self.callback_key, handle, move |h, digest| {
                            let _ = tx.send((h.index().get(), Some(digest)));
                        });
                    }
                    Err(e) => {
                        trace!(chunk = %index, "unreadable during check: {e}");
                        let _ = tx.send((index.get(), None));
                    }
                }
                outstanding += 1;
            }
            if outstanding == 0 {
                break;
            }
            let Some((index, digest)) = rx.recv().await else {
                break;
            };
            outstanding -= 1;
            if let Some(digest) = digest
                && self.meta.chunk_hash(index) == Some(&digest[..])
            {
                bf.set(index as usize);
            }
        }

        let mut st = self.state.lock();
        let st = &mut *st;
        st.files.set_completed(bf);
        st.selector = ChunkSelector::new(st.files.bitfield().clone());
        let (normal, high) = st.files.priority_ranges();
        st.selector.update_priorities(high, normal);
        st.checked = true;
        self.update_endgame(st);
        self.stats
            .remaining
            .store(st.files.remaining_bytes(), Ordering::Relaxed);
        info!(
            complete = st.files.bitfield().count_set(),
            total = self.layout.total_chunks(),
            "initial hash check finished"
        );
        Ok(())
    }

    /// Applies changed file priorities to the selector.
    pub fn apply_priorities(&self) {
        let mut st = self.state.lock();
        let st = &mut *st;
        let (normal, high) = st.files.priority_ranges();
        st.selector.update_priorities(high, normal);
    }

    pub fn with_files<R>(&self, f: impl FnOnce(&mut FileList) -> R) -> R {
        f(&mut self.state.lock().files)
    }

    /// Starts the engine: spawns the event loop, the tracker task and the
    /// peer-adder, and queues the tracker `started` announce.
    pub fn start(self: &Arc<Self>) {
        debug_assert!(self.state.lock().checked, "start before open");
        self.stopped.store(false, Ordering::Relaxed);

        let this = self.clone();
        tokio::spawn(async move { this.engine_loop().await });

        if let Some(rx) = self.peers_rx.lock().take() {
            let this = self.clone();
            tokio::spawn(async move { this.task_peer_adder(rx).await });
        }

        if let Some(tracker) = &self.tracker {
            tracker.send_start_event();
            let t = tracker.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move { t.run(cancel).await });
        }

        self.schedule_tick(Instant::now() + self.config.tick_interval());
        self.signals.signal(self.sig_connect.load(Ordering::Relaxed));
        self.wake.notify_one();
    }

    fn schedule_tick(&self, at: Instant) {
        let mut timer = self.tick_timer.lock();
        let mut sched = self.scheduler.lock();
        let id = *timer.get_or_insert_with(|| sched.add(TimerEvent::Tick));
        sched.insert(id, at);
    }

    /// Graceful stop: best-effort `stopped` announce, disconnect everyone,
    /// flush dirty chunks.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("stopping download");
        if let Some(tracker) = &self.tracker {
            tracker.send_stop_event();
        }
        let st = self.state.lock();
        for conn in st.connections.iter() {
            conn.send(WriterRequest::Disconnect(Ok(())));
        }
        drop(st);
        self.store.sync_chunks(SyncFlags {
            all: true,
            force: true,
            ..Default::default()
        });
        self.wake.notify_one();
    }

    /// Final teardown: cancels the engine loop and the tracker task.
    pub fn close(&self) {
        self.stop();
        if let Some(tracker) = &self.tracker {
            tracker.close();
        }
        self.hasher.remove(self.callback_key);
        self.inbox.cancel(self.callback_key);
        self.cancel.cancel();
    }

    /// Hands a manually discovered peer address to the engine.
    pub fn add_peer(self: &Arc<Self>, addr: SocketAddr) {
        self.state
            .lock()
            .peers
            .insert_address(addr, InsertFlags { available: true });
        self.signals.signal(self.sig_connect.load(Ordering::Relaxed));
        self.wake.notify_one();
    }

    /// Adopts an accepted inbound connection. Any connected byte stream
    /// works, so encrypted transport variants can be layered outside.
    pub fn accept<S>(self: &Arc<Self>, stream: S, addr: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move { session::run_incoming(this, stream, addr).await });
    }

    /// Serializable snapshot for restart continuity.
    pub fn resume_data(&self) -> ResumeData {
        let st = self.state.lock();
        ResumeData {
            bitfield: st.files.bitfield().as_bytes().to_vec(),
            files: st
                .files
                .files()
                .iter()
                .map(|f| FileResume {
                    completed_chunks: f.completed_chunks,
                })
                .collect(),
            trackers: self
                .tracker
                .as_ref()
                .map(|t| t.resume_state())
                .unwrap_or_default(),
        }
    }

    pub fn apply_resume(&self, resume: &ResumeData) -> anyhow::Result<()> {
        let total = self.layout.total_chunks() as usize;
        let bf = Bitfield::from_bytes(&resume.bitfield, total)?;
        let mut st = self.state.lock();
        let st = &mut *st;
        st.files.set_completed(bf);
        st.selector = ChunkSelector::new(st.files.bitfield().clone());
        let (normal, high) = st.files.priority_ranges();
        st.selector.update_priorities(high, normal);
        st.checked = true;
        self.stats
            .remaining
            .store(st.files.remaining_bytes(), Ordering::Relaxed);
        drop(st);
        if let Some(tracker) = &self.tracker {
            tracker.apply_resume(&resume.trackers);
        }
        Ok(())
    }

    // --- Engine loop (the "main thread") ---------------------------------

    async fn engine_loop(self: Arc<Self>) {
        loop {
            let deadline = self.scheduler.lock().next_time();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep_until_or_forever(deadline) => {}
            }

            // Tick order: cross-thread callbacks, expired timers, signals.
            // The select above plays the poll step.
            self.inbox.process();
            let fired = self.scheduler.lock().perform(Instant::now());
            for (_, event) in fired {
                self.handle_timer(event);
            }
            self.signals.process();
        }
        self.inbox.process();
        self.store.sync_chunks(SyncFlags {
            all: true,
            force: true,
            ..Default::default()
        });
        debug!("engine loop drained and exited");
    }

    fn handle_timer(self: &Arc<Self>, event: TimerEvent) {
        match event {
            TimerEvent::Tick => self.tick(),
            TimerEvent::Stall(addr) => self.peer_stalled(&addr),
            TimerEvent::DelayedChoke(addr) => self.apply_delayed_choke(&addr),
        }
    }

    fn tick(self: &Arc<Self>) {
        let now = Instant::now();
        self.down_throttle.lock().tick();
        self.up_throttle.lock().tick();
        self.tick_notify.notify_waiters();

        self.balance_chokes();
        self.connect_more_peers();

        let mut st = self.state.lock();
        let st = &mut *st;

        // Peers that have gone completely quiet get dropped.
        let idle_cutoff = self.config.peer_idle_timeout();
        for conn in st.connections.iter() {
            let last_seen = conn.state.lock().last_seen;
            if now.saturating_duration_since(last_seen) > idle_cutoff {
                debug!(addr = %conn.addr, "dropping idle peer");
                conn.send(WriterRequest::Disconnect(Err(Error::PeerIdle)));
            }
        }

        let window = self.config.have_queue_window();
        while let Some((at, _)) = st.have_queue.front() {
            if now.saturating_duration_since(*at) > window {
                st.have_queue.pop_front();
            } else {
                break;
            }
        }

        if now.saturating_duration_since(st.last_cull) >= self.config.cull_interval() {
            st.last_cull = now;
            let removed = st.peers.cull(
                self.config.cull_interval(),
                CullFlags {
                    keep_interesting: true,
                },
            );
            if removed > 0 {
                debug!(removed, "culled stale peers");
            }
        }
        self.store.sync_chunks(SyncFlags {
            sloppy: true,
            ..Default::default()
        });

        self.schedule_tick(now + self.config.tick_interval());
    }

    fn balance_chokes(self: &Arc<Self>) {
        let now = Instant::now();
        let conns = {
            let mut st = self.state.lock();
            let st = &mut *st;
            let mut candidates = Vec::with_capacity(st.connections.len());
            for conn in st.connections.iter() {
                let mut cs = conn.state.lock();
                candidates.push(ChokeCandidate {
                    peer: conn.addr,
                    interested: cs.up_interested,
                    unchoked: !cs.up_choked,
                    snubbed: cs.snubbed,
                    download_rate: cs.down_rate.rate(),
                    upload_rate: cs.up_rate.rate(),
                    unchoked_at: cs.unchoked_at,
                });
            }
            let mut decision = st.choker.balance(&candidates, now);
            if let Some(cycled) = st.choker.cycle(&candidates, now) {
                decision.unchoke.extend(cycled.unchoke);
                decision.choke.extend(cycled.choke);
            }
            let conns: Vec<_> = decision
                .unchoke
                .iter()
                .map(|a| (*a, false))
                .chain(decision.choke.iter().map(|a| (*a, true)))
                .filter_map(|(a, choke)| st.connections.get(&a).cloned().map(|c| (c, choke)))
                .collect();
            conns
        };
        for (conn, choke) in conns {
            self.set_choke(&conn, choke);
        }
    }

    fn connect_more_peers(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        loop {
            let addr = {
                let mut st = self.state.lock();
                if st.connections.len() >= self.config.min_connections
                    || st.connections.len() >= st.connections.capacity()
                {
                    break;
                }
                match st.peers.pop_available() {
                    Some(a) => a,
                    None => break,
                }
            };
            trace!(%addr, "initiating outgoing connection");
            let this = self.clone();
            tokio::spawn(async move { session::run_outgoing(this, addr).await });
        }
    }

    async fn task_peer_adder(self: Arc<Self>, mut rx: UnboundedReceiver<SocketAddr>) {
        loop {
            let addr = tokio::select! {
                _ = self.cancel.cancelled() => return,
                a = rx.recv() => match a {
                    Some(a) => a,
                    None => return,
                },
            };
            let mut st = self.state.lock();
            let mut addrs = vec![addr];
            st.connections.set_difference(&mut addrs);
            for a in addrs {
                st.peers.insert_address(a, InsertFlags { available: true });
            }
            drop(st);
            self.signals.signal(self.sig_connect.load(Ordering::Relaxed));
            self.wake.notify_one();
        }
    }

    // --- Session plumbing ------------------------------------------------

    pub(crate) fn register_connection(
        self: &Arc<Self>,
        addr: SocketAddr,
        peer_id: Id20,
        incoming: bool,
    ) -> Result<(Arc<PeerConnection>, UnboundedReceiver<WriterRequest>)> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(Error::DownloadStopped);
        }
        let (tx, rx) = unbounded_channel();
        let conn = Arc::new(PeerConnection::new(
            addr,
            peer_id,
            incoming,
            self.layout.total_chunks() as usize,
            tx,
        ));
        {
            let mut st = self.state.lock();
            let info = st.peers.connected(addr, incoming);
            info.peer_id = Some(peer_id);
            st.connections.insert(conn.clone())?;
        }
        self.down_throttle.lock().insert(addr);
        self.up_throttle.lock().insert(addr);

        let mut timers = conn.timers.lock();
        let mut sched = self.scheduler.lock();
        timers.stall = Some(sched.add(TimerEvent::Stall(addr)));
        timers.delayed_choke = Some(sched.add(TimerEvent::DelayedChoke(addr)));
        drop(sched);
        drop(timers);

        debug!(%addr, %peer_id, incoming, "peer connection registered");
        Ok((conn, rx))
    }

    pub(crate) fn connection_closed(&self, addr: &SocketAddr, error: Option<Error>) {
        if matches!(error, Some(Error::DuplicateConnection)) {
            // The losing half of a simultaneous connect; the established
            // session stays untouched.
            return;
        }
        let mut st = self.state.lock();
        let peer_fault = error.as_ref().is_some_and(|e| e.is_peer_fault());
        if let Some(conn) = st.connections.erase(addr) {
            let st = &mut *st;
            {
                let mut cs = conn.state.lock();
                let _ = cs.requests.cancel_all(&mut st.transfers);
            }
            st.transfers.erase_peer(addr);
            for index in st.transfers.reap_idle() {
                st.selector.not_using_index(index);
            }
            let timers = conn.timers.lock();
            let mut sched = self.scheduler.lock();
            if let Some(id) = timers.stall {
                sched.remove(id);
            }
            if let Some(id) = timers.delayed_choke {
                sched.remove(id);
            }
        }
        if peer_fault {
            st.peers.record_failure(addr);
        }
        let requeue = !peer_fault && !self.stopped.load(Ordering::Relaxed);
        st.peers.disconnected(addr, requeue);
        drop(st);
        self.down_throttle.lock().erase(addr);
        self.up_throttle.lock().erase(addr);
    }

    /// Dispatches one wire message from a session's reader.
    pub(crate) fn handle_message(self: &Arc<Self>, addr: &SocketAddr, msg: &Message<'_>) -> Result<()> {
        let conn = self
            .state
            .lock()
            .connections
            .get(addr)
            .cloned()
            .ok_or(Error::PeerDisconnected)?;
        let now = Instant::now();

        if !matches!(msg, Message::KeepAlive) {
            let mut cs = conn.state.lock();
            cs.last_seen = now;
            if matches!(msg, Message::Bitfield(_)) && cs.got_any_message {
                return Err(ProtocolViolation::LateBitfield.into());
            }
            cs.got_any_message = true;
        } else {
            conn.state.lock().last_seen = now;
            return Ok(());
        }

        match msg {
            Message::KeepAlive => unreachable!("handled above"),

            Message::Choke => {
                let mut st = self.state.lock();
                let st = &mut *st;
                let mut cs = conn.state.lock();
                cs.down_choked = true;
                // Outstanding requests die quietly; the peer won't serve
                // them anyway.
                let _ = cs.requests.cancel_all(&mut st.transfers);
                drop(cs);
                for index in st.transfers.reap_idle() {
                    st.selector.not_using_index(index);
                }
                if let Some(id) = conn.timers.lock().stall {
                    self.scheduler.lock().erase(id);
                }
            }

            Message::Unchoke => {
                conn.state.lock().down_choked = false;
                self.fill_requests(&conn);
            }

            Message::Interested => {
                let free_slot = {
                    let st = self.state.lock();
                    let mut cs = conn.state.lock();
                    cs.up_interested = true;
                    drop(cs);
                    let unchoked = st
                        .connections
                        .iter()
                        .filter(|c| !c.state.lock().up_choked)
                        .count();
                    unchoked < self.config.unchoke_slots
                };
                if free_slot {
                    self.set_choke(&conn, false);
                }
                self.signals
                    .signal(self.sig_rebalance.load(Ordering::Relaxed));
                self.wake.notify_one();
            }

            Message::NotInterested => {
                conn.state.lock().up_interested = false;
                self.set_choke(&conn, true);
            }

            Message::Have(index) => {
                if self.layout.validate_chunk(*index).is_none() {
                    return Err(ProtocolViolation::BadChunkIndex(*index).into());
                }
                let interesting = {
                    let st = self.state.lock();
                    let mut cs = conn.state.lock();
                    cs.bitfield.set(*index as usize);
                    st.selector.received_have_chunk(*index) && !cs.down_interested
                };
                if interesting {
                    conn.state.lock().down_interested = true;
                    conn.send(WriterRequest::Interested(true));
                    self.fill_requests(&conn);
                }
            }

            Message::Bitfield(bytes) => {
                let total = self.layout.total_chunks() as usize;
                let bf = Bitfield::from_bytes(bytes, total).map_err(|_| {
                    ProtocolViolation::BitfieldWrongSize {
                        got: bytes.len(),
                        expected: total.div_ceil(8),
                    }
                })?;
                let st = self.state.lock();
                let seeder = bf.is_all_set();
                let interesting = st.selector.wants_any(&bf);
                let done = st.files.is_done();
                let mut cs = conn.state.lock();
                cs.bitfield = bf;
                cs.got_bitfield = true;
                drop(cs);
                drop(st);
                if seeder && done {
                    return Err(Error::BothSeeders);
                }
                if interesting {
                    conn.state.lock().down_interested = true;
                    conn.send(WriterRequest::Interested(true));
                }
            }

            Message::Request(r) => {
                if r.length == 0 {
                    // Zero-length requests are dropped, not punished.
                    return Ok(());
                }
                if r.length > riptide_core::constants::MAX_REQUEST_LEN {
                    return Err(ProtocolViolation::RequestTooLong(r.length).into());
                }
                let Some(chunk) = self.layout.validate_chunk(r.index) else {
                    return Err(ProtocolViolation::BadChunkIndex(r.index).into());
                };
                let st = self.state.lock();
                let have = st.files.bitfield().get(r.index as usize);
                drop(st);
                let in_bounds = r
                    .begin
                    .checked_add(r.length)
                    .is_some_and(|end| end <= self.layout.chunk_len(chunk));
                if !have || !in_bounds {
                    return Err(ProtocolViolation::BadRequest {
                        index: r.index,
                        begin: r.begin,
                        length: r.length,
                    }
                    .into());
                }
                let mut cs = conn.state.lock();
                if cs.up_choked {
                    // Raced our choke; silently dropped.
                    return Ok(());
                }
                if !cs.send_queue.contains(r) {
                    cs.send_queue.push_back(*r);
                }
                drop(cs);
                conn.send(WriterRequest::Poke);
            }

            Message::Cancel(r) => {
                conn.state.lock().send_queue.retain(|q| q != r);
            }

            Message::Piece(p) => {
                if self.layout.validate_chunk(p.index).is_none() {
                    return Err(ProtocolViolation::BadChunkIndex(p.index).into());
                }
                self.stats
                    .downloaded
                    .fetch_add(p.data.len() as u64, Ordering::Relaxed);

                let mut st = self.state.lock();
                let st_ref = &mut *st;
                let mut cs = conn.state.lock();
                cs.down_rate.insert(p.data.len() as u64);
                cs.snubbed = false;
                let outcome =
                    cs.requests
                        .receive_piece(p.index, p.begin, p.data, &mut st_ref.transfers)?;
                drop(cs);

                // Re-arm the stall watchdog; data is flowing.
                if let Some(id) = conn.timers.lock().stall {
                    self.scheduler
                        .lock()
                        .update(id, now + self.config.stall_timeout());
                }

                match outcome {
                    PieceOutcome::BlockFinished {
                        chunk_finished,
                        cancels,
                        ..
                    } => {
                        for dup in cancels {
                            if let Some(other) = st_ref.connections.get(&dup.peer).cloned() {
                                let cancel = other
                                    .state
                                    .lock()
                                    .requests
                                    .cancel_block(&dup, &mut st_ref.transfers);
                                if let Some(cancel) = cancel {
                                    other.send(WriterRequest::Cancel(cancel));
                                }
                            }
                        }
                        if chunk_finished {
                            self.queue_chunk_hash(p.index);
                        }
                    }
                    PieceOutcome::Skip => {
                        trace!(index = p.index, begin = p.begin, "unmatched piece skipped");
                    }
                    PieceOutcome::Accepted | PieceOutcome::Invalidated => {}
                }
                drop(st);
                self.fill_requests(&conn);
            }
        }
        Ok(())
    }

    fn fill_requests(self: &Arc<Self>, conn: &Arc<PeerConnection>) {
        let mut st = self.state.lock();
        let st = &mut *st;
        let mut cs = conn.state.lock();
        let cs = &mut *cs;
        if cs.down_choked || !cs.down_interested {
            return;
        }
        let high = !st.selector.high_priority().is_empty();
        let target = pipe_size(cs.down_rate.rate(), st.endgame);
        let mut ctx = DelegateCtx {
            selector: &mut st.selector,
            transfers: &mut st.transfers,
            store: &self.store,
            layout: &self.layout,
            endgame: st.endgame,
        };
        let requests = cs.requests.delegate(&mut ctx, &cs.bitfield, high, target);
        if !requests.is_empty() {
            trace!(addr = %conn.addr, n = requests.len(), "requesting blocks");
            conn.send(WriterRequest::Requests(requests));
        } else if cs.requests.is_empty() && !st.selector.wants_any(&cs.bitfield) {
            // Nothing left this peer can give us.
            cs.down_interested = false;
            conn.send(WriterRequest::Interested(false));
        }
    }

    /// Chokes or unchokes a peer, deferring flaps within the anti-
    /// oscillation gap onto the scheduler.
    pub(crate) fn set_choke(self: &Arc<Self>, conn: &Arc<PeerConnection>, choke: bool) {
        let now = Instant::now();
        let mut cs = conn.state.lock();
        if cs.up_choked == choke {
            cs.pending_choke = None;
            return;
        }
        if let Some(changed_at) = cs.last_choke_change
            && now.saturating_duration_since(changed_at) < CHOKE_FLAP_GAP
        {
            cs.pending_choke = Some(choke);
            drop(cs);
            let timers = conn.timers.lock();
            if let Some(id) = timers.delayed_choke {
                self.scheduler.lock().update(id, changed_at + CHOKE_FLAP_GAP);
            }
            self.wake.notify_one();
            return;
        }
        cs.up_choked = choke;
        cs.last_choke_change = Some(now);
        cs.unchoked_at = (!choke).then_some(now);
        cs.pending_choke = None;
        drop(cs);
        conn.send(WriterRequest::Choke(choke));
    }

    fn apply_delayed_choke(self: &Arc<Self>, addr: &SocketAddr) {
        let Some(conn) = self.state.lock().connections.get(addr).cloned() else {
            return;
        };
        let pending = conn.state.lock().pending_choke.take();
        if let Some(choke) = pending {
            self.set_choke(&conn, choke);
        }
    }

    fn peer_stalled(self: &Arc<Self>, addr: &SocketAddr) {
        let mut st = self.state.lock();
        let st = &mut *st;
        let Some(conn) = st.connections.get(addr).cloned() else {
            return;
        };
        debug!(%addr, "peer stalled");
        let mut cs = conn.state.lock();
        cs.snubbed = true;
        cs.requests.stall_all(&mut st.transfers);
    }

    /// The scheduled fire time of a pending deferred choke, if any. The
    /// oscillation gap is observable here.
    pub fn delayed_choke_at(&self, addr: &SocketAddr) -> Option<Instant> {
        let conn = self.state.lock().connections.get(addr).cloned()?;
        let id = conn.timers.lock().delayed_choke?;
        self.scheduler.lock().scheduled_time(id)
    }

    // --- Verification pipeline -------------------------------------------

    fn queue_chunk_hash(self: &Arc<Self>, index: u32) {
        // Indices entering the pipeline were validated on the way in.
        let chunk = self.layout.validate_chunk(index).unwrap();
        self.store.set_hashing(chunk, true);
        match self.store.get(chunk, GetFlags::default()) {
            Ok(handle) => {
                let weak = self.weak.clone();
                let key = self.callback_key;
                self.hasher.push(key, handle, move |h, digest| {
                    drop(h);
                    let Some(d) = weak.upgrade() else { return };
                    let d2 = d.clone();
                    d.inbox.push(key, move || d2.hash_done(index, digest));
                    d.wake.notify_one();
                });
            }
            Err(e) => {
                // The sink saw it already; unblock the chunk for retries.
                warn!(chunk = index, "cannot map chunk for hashing: {e}");
                self.store.set_hashing(chunk, false);
            }
        }
    }

    fn hash_done(self: &Arc<Self>, index: u32, digest: [u8; 20]) {
        let chunk = match self.layout.validate_chunk(index) {
            Some(c) => c,
            None => return,
        };
        self.store.set_hashing(chunk, false);
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !st.transfers.contains(index) {
            // Raced a removal; tolerated as a no-op.
            return;
        }

        if self.meta.chunk_hash(index) == Some(&digest[..]) {
            st.transfers.hash_succeeded(index);
            self.chunk_verified(st, chunk);
        } else {
            self.chunk_corrupt(st, index);
        }

        // Either way the selectable set changed; top up every pipeline.
        let refill: Vec<_> = st.connections.iter().cloned().collect();
        drop(guard);
        for conn in refill {
            self.fill_requests(&conn);
        }
    }

    fn chunk_verified(self: &Arc<Self>, st: &mut DownloadState, chunk: ChunkIndex) {
        let index = chunk.get();
        debug!(chunk = index, "chunk verified");
        if !st.files.mark_completed(chunk) {
            return;
        }
        st.selector.chunk_completed(index);
        self.stats
            .remaining
            .store(st.files.remaining_bytes(), Ordering::Relaxed);
        st.have_queue.push_back((Instant::now(), index));

        // HAVE is broadcast only after verification, never before.
        for conn in st.connections.iter() {
            conn.send(WriterRequest::Have(index));
        }
        self.update_endgame(st);

        if st.files.is_done() {
            info!("download complete");
            if let Some(tracker) = &self.tracker {
                tracker.send_completed_event();
            }
            let seeders = st
                .connections
                .erase_seeders(self.layout.total_chunks() as usize);
            for conn in seeders {
                conn.send(WriterRequest::Disconnect(Ok(())));
            }
        }

        // Some peers may have stopped being interesting.
        for conn in st.connections.iter() {
            let mut cs = conn.state.lock();
            if cs.down_interested && !st.selector.wants_any(&cs.bitfield) {
                cs.down_interested = false;
                conn.send(WriterRequest::Interested(false));
            }
        }
    }

    fn chunk_corrupt(self: &Arc<Self>, st: &mut DownloadState, index: u32) {
        use crate::transfers::HashFailOutcome;
        warn!(chunk = index, "hash mismatch");
        match st
            .transfers
            .hash_failed(index, self.config.hash_fail_attempts)
        {
            Some(HashFailOutcome::Retry { suspects }) => {
                for peer in suspects {
                    st.peers.record_failure(&peer);
                    if let Some(conn) = st.connections.get(&peer) {
                        conn.state.lock().snubbed = true;
                    }
                }
            }
            Some(HashFailOutcome::Erased { culprits }) => {
                st.selector.not_using_index(index);
                for peer in culprits {
                    st.peers.record_failure(&peer);
                    if let Some(conn) = st.connections.get(&peer).cloned() {
                        debug!(addr = %peer, "disconnecting corrupting peer");
                        conn.send(WriterRequest::Disconnect(Ok(())));
                    }
                }
            }
            None => {}
        }
    }

    fn update_endgame(&self, st: &mut DownloadState) {
        let total = self.layout.total_chunks();
        let remaining = total - st.files.bitfield().count_set() as u32;
        let threshold = self.config.endgame_threshold(total);
        let endgame = remaining > 0 && remaining <= threshold;
        if endgame != st.endgame {
            info!(remaining, threshold, endgame, "endgame toggled");
            st.endgame = endgame;
        }
    }

    // --- Writer-side helpers ---------------------------------------------

    pub(crate) fn bitfield_message(&self) -> Option<Vec<u8>> {
        let st = self.state.lock();
        let bf = st.files.bitfield();
        if bf.is_empty() {
            return None;
        }
        Some(bf.as_bytes().to_vec())
    }

    pub(crate) fn pop_send_queue(&self, addr: &SocketAddr) -> Option<Request> {
        let conn = self.state.lock().connections.get(addr).cloned()?;
        let mut cs = conn.state.lock();
        if cs.up_choked {
            return None;
        }
        cs.send_queue.pop_front()
    }

    pub(crate) fn read_block(&self, r: &Request) -> Result<Vec<u8>> {
        let chunk = self
            .layout
            .validate_chunk(r.index)
            .ok_or(ProtocolViolation::BadChunkIndex(r.index))?;
        let handle = self.store.get(chunk, GetFlags::default())?;
        let mut out = vec![0u8; r.length as usize];
        handle.read_into(r.begin, &mut out);
        Ok(out)
    }

    pub(crate) fn on_uploaded(&self, addr: &SocketAddr, bytes: u32) {
        self.stats.uploaded.fetch_add(bytes as u64, Ordering::Relaxed);
        if let Some(conn) = self.state.lock().connections.get(addr) {
            conn.state.lock().up_rate.insert(bytes as u64);
        }
    }

    pub(crate) async fn acquire_download_quota(&self, addr: &SocketAddr, want: u64) {
        let mut want = want;
        loop {
            let granted = self.down_throttle.lock().request(addr, want);
            want -= granted;
            if want == 0 {
                return;
            }
            self.tick_notify.notified().await;
        }
    }

    pub(crate) async fn acquire_upload_quota(&self, addr: &SocketAddr, want: u64) {
        let mut want = want;
        loop {
            let granted = self.up_throttle.lock().request(addr, want);
            want -= granted;
            if want == 0 {
                return;
            }
            self.tick_notify.notified().await;
        }
    }

    fn fatal_storage_error(self: &Arc<Self>, message: String) {
        warn!("storage error, stopping download: {message}");
        if let Some(tracker) = &self.tracker {
            tracker.disable();
            tracker.close();
        }
        self.stop();
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
