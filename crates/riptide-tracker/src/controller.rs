use std::sync::Arc;

use parking_lot::Mutex;
use riptide_core::Id20;
use riptide_core::resume::TrackerResume;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::announce::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, AnnounceStatsProvider, ScrapeResponse,
    TrackerError, TrackerTransport,
};
use crate::list::TrackerList;
use crate::tracker::Tracker;

pub const FLAG_SEND_UPDATE: u32 = 0x01;
pub const FLAG_SEND_COMPLETED: u32 = 0x02;
pub const FLAG_SEND_START: u32 = 0x04;
pub const FLAG_SEND_STOP: u32 = 0x08;
pub const FLAG_ACTIVE: u32 = 0x10;
pub const FLAG_REQUESTING: u32 = 0x20;
pub const FLAG_FAILURE_MODE: u32 = 0x40;
pub const FLAG_PROMISCUOUS: u32 = 0x80;

pub const MASK_SEND: u32 =
    FLAG_SEND_UPDATE | FLAG_SEND_COMPLETED | FLAG_SEND_START | FLAG_SEND_STOP;

/// Escalating retry delay: 5, 10, 20, 40, 80, 160, then capped at 299.
pub fn backoff_seconds(consecutive_failures: u32) -> u64 {
    match consecutive_failures {
        0 => 0,
        n => (5u64 << (n - 1).min(6)).min(299),
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub info_hash: Id20,
    pub peer_id: Id20,
    pub port: u16,
    pub numwant: Option<u32>,

    /// Announce the `started` event to every tracker in parallel instead of
    /// walking the tier order.
    pub promiscuous_on_start: bool,

    /// How many announces requesting mode performs per tier before it turns
    /// itself off.
    pub requesting_attempt_cap: u32,
}

impl TrackerConfig {
    pub fn new(info_hash: Id20, peer_id: Id20, port: u16) -> Self {
        TrackerConfig {
            info_hash,
            peer_id,
            port,
            numwant: Some(50),
            promiscuous_on_start: false,
            requesting_attempt_cap: 4,
        }
    }
}

/// Work the scheduler has decided to perform. The tracker is already marked
/// busy; the driver (or a test) must route the transport result back through
/// `complete_announce` / `complete_scrape`.
pub enum Work {
    Announce {
        tracker: Arc<Tracker>,
        event: AnnounceEvent,
    },
    Scrape(Arc<Tracker>),
}

struct Inner {
    list: TrackerList,
    flags: u32,

    // Next tracker index to try within the current announce round.
    focus: usize,

    // The tracker that accepted our `started`; `stopped` must go to it.
    started: Option<Arc<Tracker>>,
    completed_sent: bool,

    consecutive_failures: u32,
    requesting_attempts: u32,

    timeout_at: Option<Instant>,
    scrape_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl Inner {
    fn set(&mut self, flags: u32) {
        self.flags |= flags;
    }

    fn clear(&mut self, flags: u32) {
        self.flags &= !flags;
    }

    fn has(&self, flags: u32) -> bool {
        self.flags & flags != 0
    }
}

/// Per-torrent announce scheduler over a tiered tracker list.
pub struct TrackerController {
    config: TrackerConfig,
    key: u32,
    inner: Mutex<Inner>,
    notify: Notify,
    transport: Arc<dyn TrackerTransport>,
    stats: Arc<dyn AnnounceStatsProvider>,
    peers_tx: UnboundedSender<std::net::SocketAddr>,
}

impl TrackerController {
    pub fn new(
        config: TrackerConfig,
        list: TrackerList,
        transport: Arc<dyn TrackerTransport>,
        stats: Arc<dyn AnnounceStatsProvider>,
        peers_tx: UnboundedSender<std::net::SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(TrackerController {
            config,
            key: rand::random(),
            inner: Mutex::new(Inner {
                list,
                flags: 0,
                focus: 0,
                started: None,
                completed_sent: false,
                consecutive_failures: 0,
                requesting_attempts: 0,
                timeout_at: None,
                scrape_at: None,
                last_success_at: None,
            }),
            notify: Notify::new(),
            transport,
            stats,
            peers_tx,
        })
    }

    // --- Observable surface ---------------------------------------------

    pub fn flags(&self) -> u32 {
        self.inner.lock().flags
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().has(FLAG_ACTIVE)
    }

    pub fn is_requesting(&self) -> bool {
        self.inner.lock().has(FLAG_REQUESTING)
    }

    pub fn is_failure_mode(&self) -> bool {
        self.inner.lock().has(FLAG_FAILURE_MODE)
    }

    pub fn is_promiscuous_mode(&self) -> bool {
        self.inner.lock().has(FLAG_PROMISCUOUS)
    }

    pub fn is_timeout_queued(&self) -> bool {
        self.inner.lock().timeout_at.is_some()
    }

    /// Seconds until the next scheduled announce: `None` while inactive or
    /// while a non-scrape request is in flight.
    pub fn seconds_to_next_timeout(&self) -> Option<u64> {
        let inner = self.inner.lock();
        if !inner.has(FLAG_ACTIVE) && !inner.has(FLAG_SEND_STOP) {
            return None;
        }
        if inner.list.iter().any(|t| t.is_busy_non_scrape()) {
            return None;
        }
        inner
            .timeout_at
            .map(|t| t.saturating_duration_since(Instant::now()).as_secs())
    }

    pub fn seconds_to_next_scrape(&self) -> Option<u64> {
        self.inner
            .lock()
            .scrape_at
            .map(|t| t.saturating_duration_since(Instant::now()).as_secs())
    }

    pub fn with_trackers<R>(&self, f: impl FnOnce(&TrackerList) -> R) -> R {
        f(&self.inner.lock().list)
    }

    // --- Lifecycle and events -------------------------------------------

    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        inner.set(FLAG_ACTIVE);
        // Wake trackers a previous run disabled, otherwise a lone working
        // tracker may never be retried.
        for t in inner.list.iter() {
            t.enable();
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.clear(FLAG_ACTIVE | FLAG_REQUESTING | FLAG_PROMISCUOUS);
        inner.timeout_at = None;
        inner.scrape_at = None;
        drop(inner);
        self.notify.notify_one();
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.flags = 0;
        inner.timeout_at = None;
        inner.scrape_at = None;
        inner.list.close_all();
        drop(inner);
        self.notify.notify_one();
    }

    /// Queues the required first announce. With promiscuous mode configured,
    /// the event goes to every tracker in parallel.
    pub fn send_start_event(&self) {
        let mut inner = self.inner.lock();
        inner.clear(MASK_SEND);
        inner.set(FLAG_ACTIVE | FLAG_SEND_START);
        if self.config.promiscuous_on_start {
            inner.set(FLAG_PROMISCUOUS);
        }
        inner.focus = 0;
        inner.timeout_at = Some(Instant::now());
        drop(inner);
        self.notify.notify_one();
    }

    /// Best-effort single attempt, sent to the tracker that accepted
    /// `started`. Never retried.
    pub fn send_stop_event(&self) {
        let mut inner = self.inner.lock();
        if inner.started.is_none() {
            trace!("no tracker received start; nothing to stop");
            return;
        }
        inner.clear(MASK_SEND);
        inner.set(FLAG_SEND_STOP);
        inner.timeout_at = Some(Instant::now());
        drop(inner);
        self.notify.notify_one();
    }

    /// Sent exactly once, at the transition to seeding. Supersedes any
    /// queued update.
    pub fn send_completed_event(&self) {
        let mut inner = self.inner.lock();
        if inner.completed_sent {
            return;
        }
        inner.clear(FLAG_SEND_UPDATE);
        inner.set(FLAG_SEND_COMPLETED);
        inner.timeout_at = Some(Instant::now());
        drop(inner);
        self.notify.notify_one();
    }

    /// Coalescing update, not sooner than the tracker's `min_interval`.
    pub fn send_update_event(&self) {
        let mut inner = self.inner.lock();
        if inner.has(MASK_SEND & !FLAG_SEND_UPDATE) {
            // A stronger event is already queued.
            return;
        }
        inner.set(FLAG_SEND_UPDATE);
        let now = Instant::now();
        let min_interval = inner
            .list
            .get(0)
            .map(|t| t.state().min_interval())
            .unwrap_or(600);
        let earliest = inner
            .last_success_at
            .map(|t| t + Duration::from_secs(min_interval as u64))
            .unwrap_or(now);
        let at = earliest.max(now);
        inner.timeout_at = Some(match inner.timeout_at {
            Some(t) => t.min(at),
            None => at,
        });
        drop(inner);
        self.notify.notify_one();
    }

    /// Temporary high-rate polling of the preferred tier.
    pub fn start_requesting(&self) {
        let mut inner = self.inner.lock();
        if inner.has(FLAG_REQUESTING) {
            return;
        }
        inner.set(FLAG_REQUESTING);
        inner.requesting_attempts = 0;
        inner.timeout_at = Some(Instant::now());
        drop(inner);
        self.notify.notify_one();
    }

    pub fn stop_requesting(&self) {
        let mut inner = self.inner.lock();
        inner.clear(FLAG_REQUESTING);
        drop(inner);
        self.notify.notify_one();
    }

    /// Schedules a one-shot scrape of all scrapable trackers.
    pub fn scrape_request(&self, delay: Duration) {
        let mut inner = self.inner.lock();
        inner.scrape_at = Some(Instant::now() + delay);
        drop(inner);
        self.notify.notify_one();
    }

    // --- Resume ----------------------------------------------------------

    pub fn apply_resume(&self, saved: &[TrackerResume]) {
        let inner = self.inner.lock();
        for t in inner.list.iter() {
            let Some(r) = saved.iter().find(|r| r.url == t.url().as_str()) else {
                continue;
            };
            if !r.enabled {
                t.disable();
            }
            t.with_state(|s| {
                s.success_counter = r.success_counter;
                s.failed_counter = r.failed_counter;
                s.set_intervals(r.normal_interval, r.min_interval);
            });
        }
    }

    pub fn resume_state(&self) -> Vec<TrackerResume> {
        let now_unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let inner = self.inner.lock();
        inner
            .list
            .iter()
            .map(|t| {
                let s = t.state();
                let last_activity_time = s
                    .last_activity
                    .map(|at| now_unix.saturating_sub(at.elapsed().as_secs()))
                    .unwrap_or(0);
                TrackerResume {
                    url: t.url().as_str().to_owned(),
                    enabled: s.enabled,
                    success_counter: s.success_counter,
                    failed_counter: s.failed_counter,
                    last_activity_time,
                    normal_interval: s.normal_interval,
                    min_interval: s.min_interval,
                }
            })
            .collect()
    }

    // --- Scheduling core -------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        match (inner.timeout_at, inner.scrape_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Pops all work whose deadline has passed, marking the chosen trackers
    /// busy. Deterministic; drives both the async loop and the tests.
    pub fn pop_due_work(&self, now: Instant) -> Vec<Work> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();

        if inner.timeout_at.is_some_and(|t| t <= now) {
            inner.timeout_at = None;
            self.announce_work(&mut inner, now, &mut out);
        }

        if inner.scrape_at.is_some_and(|t| t <= now) {
            inner.scrape_at = None;
            let mut jobs = Vec::new();
            for t in inner.list.iter() {
                // Scrape never preempts an in-flight announce.
                if t.is_enabled() && t.can_scrape() && !t.is_busy() {
                    t.with_state(|s| s.busy_scrape = true);
                    jobs.push(Work::Scrape(t.clone()));
                }
            }
            out.extend(jobs);
        }

        out
    }

    fn announce_work(&self, inner: &mut Inner, now: Instant, out: &mut Vec<Work>) {
        if inner.has(FLAG_SEND_STOP) {
            if let Some(t) = inner.started.clone()
                && !t.is_busy_non_scrape()
            {
                t.with_state(|s| s.busy = true);
                out.push(Work::Announce {
                    tracker: t,
                    event: AnnounceEvent::Stopped,
                });
            } else {
                inner.clear(FLAG_SEND_STOP);
            }
            return;
        }

        if !inner.has(FLAG_ACTIVE) {
            return;
        }

        if inner.has(FLAG_SEND_START) && inner.has(FLAG_PROMISCUOUS) {
            let mut jobs = Vec::new();
            for t in inner.list.iter() {
                if t.is_enabled() && !t.is_busy_non_scrape() {
                    t.with_state(|s| s.busy = true);
                    jobs.push(Work::Announce {
                        tracker: t.clone(),
                        event: AnnounceEvent::Started,
                    });
                }
            }
            out.extend(jobs);
            return;
        }

        if inner.has(FLAG_REQUESTING) && !inner.has(MASK_SEND) {
            let Some(tier) = inner.list.preferred_tier() else {
                return;
            };
            let mut jobs = Vec::new();
            for i in inner.list.tier_range(tier) {
                let t = inner.list.get(i).cloned();
                let Some(t) = t else { continue };
                if !t.is_enabled() || t.is_busy_non_scrape() {
                    continue;
                }
                // One announce per tracker per min_interval window.
                let s = t.state();
                let window_open = s.last_activity.is_none_or(|at| {
                    now.saturating_duration_since(at).as_secs() >= s.min_interval() as u64
                });
                if window_open {
                    t.with_state(|st| st.busy = true);
                    jobs.push(Work::Announce {
                        tracker: t,
                        event: AnnounceEvent::None,
                    });
                }
            }
            out.extend(jobs);
            if out.is_empty() {
                // Window still closed everywhere; check back shortly.
                inner.timeout_at = Some(now + Duration::from_secs(5));
            }
            return;
        }

        let event = if inner.has(FLAG_SEND_START) {
            AnnounceEvent::Started
        } else if inner.has(FLAG_SEND_COMPLETED) {
            AnnounceEvent::Completed
        } else {
            AnnounceEvent::None
        };

        let Some(index) = inner.list.find_enabled(inner.focus).or_else(|| {
            inner.focus = 0;
            inner.list.find_enabled(0)
        }) else {
            warn!("no enabled trackers to announce to");
            return;
        };
        inner.focus = index;
        let tracker = inner.list.get(index).cloned();
        if let Some(t) = tracker {
            if t.is_busy_non_scrape() {
                return;
            }
            t.with_state(|s| s.busy = true);
            out.push(Work::Announce { tracker: t, event });
        }
    }

    pub fn build_request(&self, tracker: &Tracker, event: AnnounceEvent) -> AnnounceRequest {
        let stats = self.stats.get();
        AnnounceRequest {
            info_hash: self.config.info_hash,
            peer_id: self.config.peer_id,
            port: self.config.port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            key: Some(self.key),
            tracker_id: tracker.state().tracker_id.clone(),
            numwant: self.config.numwant,
        }
    }

    pub fn complete_announce(
        &self,
        tracker: &Arc<Tracker>,
        event: AnnounceEvent,
        result: Result<AnnounceResponse, TrackerError>,
    ) {
        let now = Instant::now();
        tracker.with_state(|s| s.busy = false);

        match result {
            Ok(resp) => self.announce_succeeded(tracker, event, resp, now),
            Err(e) => self.announce_failed(tracker, event, e, now),
        }
        self.notify.notify_one();
    }

    fn announce_succeeded(
        &self,
        tracker: &Arc<Tracker>,
        event: AnnounceEvent,
        resp: AnnounceResponse,
        now: Instant,
    ) {
        debug!(
            tracker = %tracker.url(),
            peers = resp.peers.len(),
            ?event,
            "announce ok"
        );
        tracker.with_state(|s| {
            s.success_counter += 1;
            s.failed_counter = 0;
            s.set_intervals(resp.interval, resp.min_interval);
            s.latest_event = event;
            s.latest_new_peers = resp.peers.len() as u32;
            s.last_activity = Some(now);
            if let Some(id) = resp.tracker_id {
                s.tracker_id = Some(id);
            }
        });

        for addr in resp.peers {
            if self.peers_tx.send(addr).is_err() {
                break;
            }
        }

        let mut inner = self.inner.lock();
        if let Some(index) = inner.list.position(tracker) {
            inner.list.promote(index);
        }
        inner.focus = 0;
        inner.consecutive_failures = 0;
        inner.clear(FLAG_FAILURE_MODE);
        inner.last_success_at = Some(now);

        match event {
            AnnounceEvent::Started => {
                inner.clear(FLAG_SEND_START | FLAG_PROMISCUOUS);
                inner.started = Some(tracker.clone());
            }
            AnnounceEvent::Stopped => {
                inner.clear(FLAG_SEND_STOP);
                inner.started = None;
            }
            AnnounceEvent::Completed => {
                inner.clear(FLAG_SEND_COMPLETED);
                inner.completed_sent = true;
            }
            AnnounceEvent::None => {
                inner.clear(FLAG_SEND_UPDATE);
            }
        }

        if inner.has(FLAG_REQUESTING) {
            inner.requesting_attempts += 1;
            if inner.requesting_attempts >= self.config.requesting_attempt_cap {
                inner.clear(FLAG_REQUESTING);
                inner.requesting_attempts = 0;
            }
        }

        self.reschedule(&mut inner, tracker, now);
    }

    fn announce_failed(
        &self,
        tracker: &Arc<Tracker>,
        event: AnnounceEvent,
        error: TrackerError,
        now: Instant,
    ) {
        debug!(tracker = %tracker.url(), ?event, "announce failed: {error}");
        tracker.with_state(|s| {
            s.failed_counter += 1;
            s.last_activity = Some(now);
        });

        let mut inner = self.inner.lock();

        if matches!(event, AnnounceEvent::Stopped) {
            // Best effort only; never retried.
            inner.clear(FLAG_SEND_STOP);
            return;
        }

        inner.consecutive_failures += 1;

        if inner.has(FLAG_REQUESTING) {
            inner.requesting_attempts += 1;
            if inner.requesting_attempts >= self.config.requesting_attempt_cap {
                inner.clear(FLAG_REQUESTING);
                inner.requesting_attempts = 0;
            } else {
                inner.timeout_at = Some(now + Duration::from_secs(5));
                return;
            }
        }

        // Walk to the next enabled tracker; failing as many times in a row
        // as the preferred tier has enabled members means the whole tier
        // failed this round.
        if let Some(index) = inner.list.position(tracker) {
            inner.focus = index + 1;
        }
        if let Some(tier) = inner.list.preferred_tier() {
            let enabled_in_tier = inner
                .list
                .tier_range(tier)
                .filter(|&i| inner.list.get(i).is_some_and(|t| t.is_enabled()))
                .count() as u32;
            if inner.consecutive_failures >= enabled_in_tier.max(1) && !inner.has(FLAG_FAILURE_MODE)
            {
                debug!(tier, "preferred tier exhausted, entering failure mode");
                inner.set(FLAG_FAILURE_MODE);
            }
        }
        if inner.list.find_enabled(inner.focus).is_none() {
            inner.focus = 0;
        }

        if inner.has(FLAG_ACTIVE) {
            let delay = backoff_seconds(inner.consecutive_failures);
            inner.timeout_at = Some(now + Duration::from_secs(delay));
        }
    }

    pub fn complete_scrape(
        &self,
        tracker: &Arc<Tracker>,
        result: Result<ScrapeResponse, TrackerError>,
    ) {
        tracker.with_state(|s| {
            s.busy_scrape = false;
            match &result {
                Ok(_) => s.scrape_counter += 1,
                Err(_) => s.failed_counter += 1,
            }
        });
        match result {
            Ok(resp) => {
                debug!(
                    tracker = %tracker.url(),
                    complete = resp.complete,
                    incomplete = resp.incomplete,
                    "scrape ok"
                );
            }
            Err(e) => debug!(tracker = %tracker.url(), "scrape failed: {e}"),
        }
    }

    /// After a successful announce: the next periodic announce lands one
    /// normal interval after it, unless another event is already queued.
    fn reschedule(&self, inner: &mut Inner, tracker: &Arc<Tracker>, now: Instant) {
        if !inner.has(FLAG_ACTIVE) {
            inner.timeout_at = None;
            return;
        }
        if inner.has(MASK_SEND) {
            inner.timeout_at = Some(now);
            return;
        }
        if inner.has(FLAG_REQUESTING) {
            let min = tracker.state().min_interval() as u64;
            inner.timeout_at = Some(now + Duration::from_secs(min));
            return;
        }
        let normal = tracker.state().normal_interval() as u64;
        inner.timeout_at = Some(now + Duration::from_secs(normal));
    }

    // --- Async driver ----------------------------------------------------

    /// Runs the controller until cancelled: sleeps to the next deadline,
    /// pops due work and performs the transport round trips on spawned
    /// tasks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close();
                    return;
                }
                _ = self.notify.notified() => continue,
                _ = sleep_until_or_forever(deadline) => {}
            }

            for work in self.pop_due_work(Instant::now()) {
                let this = self.clone();
                match work {
                    Work::Announce { tracker, event } => {
                        tokio::spawn(async move {
                            let request = this.build_request(&tracker, event);
                            let result = this.transport.announce(tracker.url(), &request).await;
                            this.complete_announce(&tracker, event, result);
                        });
                    }
                    Work::Scrape(tracker) => {
                        let info_hash = self.config.info_hash;
                        tokio::spawn(async move {
                            // Scrapable trackers always have a scrape URL.
                            let url = tracker.scrape_url().cloned();
                            let Some(url) = url else { return };
                            let result = this.transport.scrape(&url, info_hash).await;
                            this.complete_scrape(&tracker, result);
                        });
                    }
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    struct NullTransport;

    #[async_trait::async_trait]
    impl TrackerTransport for NullTransport {
        async fn announce(
            &self,
            _url: &url::Url,
            _request: &AnnounceRequest,
        ) -> Result<AnnounceResponse, TrackerError> {
            Err(TrackerError::Failure("unused".into()))
        }

        async fn scrape(
            &self,
            _url: &url::Url,
            _info_hash: Id20,
        ) -> Result<ScrapeResponse, TrackerError> {
            Err(TrackerError::Failure("unused".into()))
        }
    }

    fn controller(
        tiers: &[Vec<&str>],
        promiscuous: bool,
    ) -> (Arc<TrackerController>, UnboundedReceiver<std::net::SocketAddr>) {
        let mut config = TrackerConfig::new(Id20::new([1; 20]), Id20::new([2; 20]), 6881);
        config.promiscuous_on_start = promiscuous;
        let (tx, rx) = unbounded_channel();
        let list = TrackerList::from_tiers(tiers);
        let ctrl = TrackerController::new(config, list, Arc::new(NullTransport), Arc::new(()), tx);
        (ctrl, rx)
    }

    fn response(interval: u32, min_interval: u32, peers: usize) -> AnnounceResponse {
        AnnounceResponse {
            interval: Some(interval),
            min_interval: Some(min_interval),
            peers: (0..peers)
                .map(|i| format!("10.0.0.{}:6881", i + 1).parse().unwrap())
                .collect(),
            complete: Some(1),
            incomplete: Some(2),
            tracker_id: None,
        }
    }

    fn single_announce(work: Vec<Work>) -> (Arc<Tracker>, AnnounceEvent) {
        assert_eq!(work.len(), 1, "expected exactly one announce job");
        match work.into_iter().next().unwrap() {
            Work::Announce { tracker, event } => (tracker, event),
            Work::Scrape(_) => panic!("expected announce, got scrape"),
        }
    }

    #[test]
    fn backoff_ladder() {
        let ladder: Vec<u64> = (1..=8).map(backoff_seconds).collect();
        assert_eq!(ladder, [5, 10, 20, 40, 80, 160, 299, 299]);
    }

    #[tokio::test(start_paused = true)]
    async fn failover_promotes_working_tracker() {
        let (ctrl, _rx) = controller(
            &[vec!["http://a.example/announce", "http://b.example/announce"]],
            false,
        );
        ctrl.send_start_event();
        assert!(ctrl.is_active());

        let (a, event) = single_announce(ctrl.pop_due_work(Instant::now()));
        assert_eq!(a.url().as_str(), "http://a.example/announce");
        assert_eq!(event, AnnounceEvent::Started);

        ctrl.complete_announce(&a, event, Err(TrackerError::Failure("down".into())));
        assert_eq!(ctrl.seconds_to_next_timeout(), Some(5));
        assert!(!ctrl.is_failure_mode());

        tokio::time::advance(Duration::from_secs(5)).await;
        let (b, event) = single_announce(ctrl.pop_due_work(Instant::now()));
        assert_eq!(b.url().as_str(), "http://b.example/announce");
        assert_eq!(event, AnnounceEvent::Started);

        ctrl.complete_announce(&b, event, Ok(response(1800, 600, 3)));

        // B is promoted to the tier head and schedules the next periodic
        // announce one normal interval out.
        ctrl.with_trackers(|list| {
            assert_eq!(list.get(0).unwrap().url().as_str(), "http://b.example/announce");
            assert_eq!(list.get(1).unwrap().url().as_str(), "http://a.example/announce");
        });
        assert_eq!(ctrl.seconds_to_next_timeout(), Some(1800));
        assert_eq!(ctrl.flags() & MASK_SEND, 0);
        assert_eq!(b.state().success_counter, 1);
        assert_eq!(a.state().failed_counter, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn preferred_tier_exhaustion_sets_failure_mode() {
        let (ctrl, _rx) = controller(
            &[
                vec!["http://a.example/announce", "http://b.example/announce"],
                vec!["http://c.example/announce"],
            ],
            false,
        );
        ctrl.send_start_event();

        let (a, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        ctrl.complete_announce(&a, ev, Err(TrackerError::Failure("x".into())));
        assert!(!ctrl.is_failure_mode());

        tokio::time::advance(Duration::from_secs(5)).await;
        let (b, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        assert_eq!(b.url().as_str(), "http://b.example/announce");
        ctrl.complete_announce(&b, ev, Err(TrackerError::Failure("x".into())));

        assert!(ctrl.is_failure_mode());
        assert_eq!(ctrl.seconds_to_next_timeout(), Some(backoff_seconds(2)));

        // Failover continues into the next tier; success anywhere clears
        // failure mode.
        tokio::time::advance(Duration::from_secs(10)).await;
        let (c, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        assert_eq!(c.url().as_str(), "http://c.example/announce");
        ctrl.complete_announce(&c, ev, Ok(response(1800, 300, 0)));
        assert!(!ctrl.is_failure_mode());
        assert_eq!(ctrl.seconds_to_next_timeout(), Some(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn promiscuous_start_announces_everywhere() {
        let (ctrl, _rx) = controller(
            &[
                vec!["http://a.example/announce", "http://b.example/announce"],
                vec!["http://c.example/announce"],
            ],
            true,
        );
        ctrl.send_start_event();
        assert!(ctrl.is_promiscuous_mode());

        let work = ctrl.pop_due_work(Instant::now());
        let trackers: Vec<Arc<Tracker>> = work
            .into_iter()
            .map(|w| match w {
                Work::Announce { tracker, event } => {
                    assert_eq!(event, AnnounceEvent::Started);
                    tracker
                }
                Work::Scrape(_) => panic!("unexpected scrape"),
            })
            .collect();
        assert_eq!(trackers.len(), 3);

        // First success clears the flag; stragglers only update counters.
        ctrl.complete_announce(&trackers[1], AnnounceEvent::Started, Ok(response(1800, 600, 1)));
        assert!(!ctrl.is_promiscuous_mode());
        assert_eq!(ctrl.flags() & FLAG_SEND_START, 0);
        ctrl.complete_announce(
            &trackers[0],
            AnnounceEvent::Started,
            Err(TrackerError::Failure("x".into())),
        );
        assert!(!ctrl.is_promiscuous_mode());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_sent_exactly_once_and_supersedes_update() {
        let (ctrl, _rx) = controller(&[vec!["http://a.example/announce"]], false);
        ctrl.send_start_event();
        let (a, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        ctrl.complete_announce(&a, ev, Ok(response(1800, 600, 0)));

        ctrl.send_update_event();
        ctrl.send_completed_event();
        assert_eq!(ctrl.flags() & MASK_SEND, FLAG_SEND_COMPLETED);

        let (a, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        assert_eq!(ev, AnnounceEvent::Completed);
        ctrl.complete_announce(&a, ev, Ok(response(1800, 600, 0)));

        // Once sent, later requests are ignored.
        ctrl.send_completed_event();
        assert_eq!(ctrl.flags() & MASK_SEND, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_respects_min_interval() {
        let (ctrl, _rx) = controller(&[vec!["http://a.example/announce"]], false);
        ctrl.send_start_event();
        let (a, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        ctrl.complete_announce(&a, ev, Ok(response(1800, 600, 0)));

        tokio::time::advance(Duration::from_secs(10)).await;
        ctrl.send_update_event();
        // 600 s min interval, 10 s elapsed.
        assert_eq!(ctrl.seconds_to_next_timeout(), Some(590));
        assert!(ctrl.pop_due_work(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(590)).await;
        let (_, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        assert_eq!(ev, AnnounceEvent::None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_best_effort_from_the_started_tracker() {
        let (ctrl, _rx) = controller(
            &[vec!["http://a.example/announce", "http://b.example/announce"]],
            false,
        );
        // Without a successful start there is nothing to stop.
        ctrl.send_stop_event();
        assert_eq!(ctrl.flags() & FLAG_SEND_STOP, 0);

        ctrl.send_start_event();
        let (a, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        ctrl.complete_announce(&a, ev, Ok(response(1800, 600, 0)));

        ctrl.send_stop_event();
        let (t, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        assert_eq!(ev, AnnounceEvent::Stopped);
        assert_eq!(t.url().as_str(), "http://a.example/announce");

        // Failure clears the flag; no retry is scheduled.
        ctrl.complete_announce(&t, ev, Err(TrackerError::Failure("x".into())));
        assert_eq!(ctrl.flags() & FLAG_SEND_STOP, 0);
        assert!(!ctrl.is_timeout_queued());
    }

    #[tokio::test(start_paused = true)]
    async fn requesting_mode_polls_the_tier_and_caps() {
        let (ctrl, _rx) = controller(
            &[vec!["http://a.example/announce", "http://b.example/announce"]],
            false,
        );
        ctrl.send_start_event();
        let (a, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        ctrl.complete_announce(&a, ev, Ok(response(1800, 300, 0)));

        tokio::time::advance(Duration::from_secs(300)).await;
        ctrl.start_requesting();
        assert!(ctrl.is_requesting());

        let work = ctrl.pop_due_work(Instant::now());
        // Both tier members' windows are open: a announced 300 s ago, b never.
        assert_eq!(work.len(), 2);
        for w in work {
            match w {
                Work::Announce { tracker, event } => {
                    ctrl.complete_announce(&tracker, event, Ok(response(1800, 300, 0)));
                }
                Work::Scrape(_) => panic!("unexpected scrape"),
            }
        }
        // Cap is 4: two successes counted, still requesting.
        assert!(ctrl.is_requesting());

        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(300)).await;
            for w in ctrl.pop_due_work(Instant::now()) {
                if let Work::Announce { tracker, event } = w {
                    ctrl.complete_announce(&tracker, event, Ok(response(1800, 300, 0)));
                }
            }
            if !ctrl.is_requesting() {
                break;
            }
        }
        assert!(!ctrl.is_requesting());
    }

    #[tokio::test(start_paused = true)]
    async fn scrape_skips_busy_and_unscrapable() {
        let (ctrl, _rx) = controller(
            &[vec![
                "http://a.example/announce",
                "http://b.example/announce",
                "http://c.example/other",
            ]],
            false,
        );
        ctrl.send_start_event();
        // a is busy with the start announce when the scrape fires.
        let (a, _ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        assert_eq!(a.url().as_str(), "http://a.example/announce");

        ctrl.scrape_request(Duration::from_secs(0));
        let scrapes: Vec<Arc<Tracker>> = ctrl
            .pop_due_work(Instant::now())
            .into_iter()
            .map(|w| match w {
                Work::Scrape(t) => t,
                Work::Announce { .. } => panic!("unexpected announce"),
            })
            .collect();
        assert_eq!(scrapes.len(), 1);
        assert_eq!(scrapes[0].url().as_str(), "http://b.example/announce");

        ctrl.complete_scrape(&scrapes[0], Ok(ScrapeResponse::default()));
        assert_eq!(scrapes[0].state().scrape_counter, 1);
        assert!(!scrapes[0].is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn discovered_peers_flow_to_the_channel() {
        let (ctrl, mut rx) = controller(&[vec!["http://a.example/announce"]], false);
        ctrl.send_start_event();
        let (a, ev) = single_announce(ctrl.pop_due_work(Instant::now()));
        ctrl.complete_announce(&a, ev, Ok(response(1800, 600, 2)));
        assert_eq!(rx.recv().await.unwrap(), "10.0.0.1:6881".parse().unwrap());
        assert_eq!(rx.recv().await.unwrap(), "10.0.0.2:6881".parse().unwrap());
        assert_eq!(a.state().latest_new_peers, 2);
    }
}
