use parking_lot::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::announce::AnnounceEvent;

// Interval clamps applied to whatever the tracker reports.
const NORMAL_INTERVAL_MIN: u32 = 600;
const NORMAL_INTERVAL_MAX: u32 = 8 * 3600;
const MIN_INTERVAL_MIN: u32 = 300;
const MIN_INTERVAL_MAX: u32 = 4 * 3600;

const DEFAULT_NORMAL_INTERVAL: u32 = 1800;
const DEFAULT_MIN_INTERVAL: u32 = 600;

/// Mutable tracker bookkeeping. Written by the tracker task, read by the
/// main thread; everything goes through the owning [`Tracker`]'s lock and is
/// copied out.
#[derive(Debug, Clone)]
pub struct TrackerState {
    pub enabled: bool,

    // A non-scrape request is outstanding.
    pub busy: bool,
    pub busy_scrape: bool,

    pub success_counter: u32,
    pub failed_counter: u32,
    pub scrape_counter: u32,

    pub normal_interval: Option<u32>,
    pub min_interval: Option<u32>,

    pub latest_event: AnnounceEvent,
    pub latest_new_peers: u32,
    pub last_activity: Option<Instant>,
    pub tracker_id: Option<String>,
}

impl Default for TrackerState {
    fn default() -> Self {
        TrackerState {
            enabled: true,
            busy: false,
            busy_scrape: false,
            success_counter: 0,
            failed_counter: 0,
            scrape_counter: 0,
            normal_interval: None,
            min_interval: None,
            latest_event: AnnounceEvent::None,
            latest_new_peers: 0,
            last_activity: None,
            tracker_id: None,
        }
    }
}

impl TrackerState {
    pub fn normal_interval(&self) -> u32 {
        self.normal_interval.unwrap_or(DEFAULT_NORMAL_INTERVAL)
    }

    pub fn min_interval(&self) -> u32 {
        self.min_interval.unwrap_or(DEFAULT_MIN_INTERVAL)
    }

    pub(crate) fn set_intervals(&mut self, normal: Option<u32>, min: Option<u32>) {
        if let Some(n) = normal {
            self.normal_interval = Some(n.clamp(NORMAL_INTERVAL_MIN, NORMAL_INTERVAL_MAX));
        }
        if let Some(m) = min {
            self.min_interval = Some(m.clamp(MIN_INTERVAL_MIN, MIN_INTERVAL_MAX));
        }
    }
}

/// One announce URL within a tier.
pub struct Tracker {
    url: Url,
    scrape_url: Option<Url>,
    tier: u32,
    state: Mutex<TrackerState>,
}

impl Tracker {
    pub fn new(tier: u32, url: Url) -> Self {
        let scrape_url = derive_scrape_url(&url);
        Tracker {
            url,
            scrape_url,
            tier,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn tier(&self) -> u32 {
        self.tier
    }

    pub fn can_scrape(&self) -> bool {
        self.scrape_url.is_some()
    }

    pub fn scrape_url(&self) -> Option<&Url> {
        self.scrape_url.as_ref()
    }

    pub fn state(&self) -> TrackerState {
        self.state.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn is_busy(&self) -> bool {
        let s = self.state.lock();
        s.busy || s.busy_scrape
    }

    pub fn is_busy_non_scrape(&self) -> bool {
        self.state.lock().busy
    }

    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }

    pub fn disable(&self) {
        self.state.lock().enabled = false;
    }

    /// Drops in-flight bookkeeping; any late transport result is ignored by
    /// the controller once busy is cleared.
    pub fn close(&self) {
        let mut s = self.state.lock();
        s.busy = false;
        s.busy_scrape = false;
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut TrackerState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tracker(tier={}, {})", self.tier, self.url)
    }
}

/// By convention a tracker supports scrape iff the last path segment of the
/// announce URL starts with "announce".
fn derive_scrape_url(url: &Url) -> Option<Url> {
    let last = url.path_segments()?.next_back()?;
    if !last.starts_with("announce") {
        return None;
    }
    let scrape_last = last.replacen("announce", "scrape", 1);
    let mut out = url.clone();
    {
        let mut segments = out.path_segments_mut().ok()?;
        segments.pop();
        segments.push(&scrape_last);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_clamping() {
        let mut s = TrackerState::default();
        s.set_intervals(Some(10), Some(10));
        assert_eq!(s.normal_interval(), NORMAL_INTERVAL_MIN);
        assert_eq!(s.min_interval(), MIN_INTERVAL_MIN);
        s.set_intervals(Some(100 * 3600), Some(100 * 3600));
        assert_eq!(s.normal_interval(), NORMAL_INTERVAL_MAX);
        assert_eq!(s.min_interval(), MIN_INTERVAL_MAX);
        s.set_intervals(Some(1800), None);
        assert_eq!(s.normal_interval(), 1800);
    }

    #[test]
    fn defaults_without_announce() {
        let s = TrackerState::default();
        assert_eq!(s.normal_interval(), DEFAULT_NORMAL_INTERVAL);
        assert_eq!(s.min_interval(), DEFAULT_MIN_INTERVAL);
    }

    #[test]
    fn scrape_url_convention() {
        let t = Tracker::new(0, "http://t.example/announce".parse().unwrap());
        assert_eq!(t.scrape_url().unwrap().as_str(), "http://t.example/scrape");

        let t = Tracker::new(0, "http://t.example/announce.php".parse().unwrap());
        assert_eq!(
            t.scrape_url().unwrap().as_str(),
            "http://t.example/scrape.php"
        );

        let t = Tracker::new(0, "http://t.example/a/b".parse().unwrap());
        assert!(!t.can_scrape());
    }
}
