use std::sync::Arc;

use url::Url;

use crate::tracker::Tracker;

/// Trackers grouped into tiers. The vector is ordered by tier; order within
/// a tier changes as trackers succeed (promotion) or fail (cycling), so the
/// working tracker of the preferred tier is tried first.
#[derive(Default)]
pub struct TrackerList {
    trackers: Vec<Arc<Tracker>>,
}

impl TrackerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from metainfo announce tiers, skipping URLs that do not
    /// parse.
    pub fn from_tiers<S: AsRef<str>>(tiers: &[Vec<S>]) -> Self {
        let mut list = TrackerList::new();
        for (tier, urls) in tiers.iter().enumerate() {
            for url in urls {
                match url.as_ref().parse::<Url>() {
                    Ok(u) => {
                        list.insert(tier as u32, u);
                    }
                    Err(e) => {
                        tracing::debug!(url = url.as_ref(), "skipping unparsable tracker: {e}")
                    }
                }
            }
        }
        list
    }

    pub fn insert(&mut self, tier: u32, url: Url) -> Arc<Tracker> {
        let tracker = Arc::new(Tracker::new(tier, url));
        let pos = self
            .trackers
            .iter()
            .position(|t| t.tier() > tier)
            .unwrap_or(self.trackers.len());
        self.trackers.insert(pos, tracker.clone());
        tracker
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Tracker>> {
        self.trackers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tracker>> {
        self.trackers.iter()
    }

    pub fn has_active(&self) -> bool {
        self.trackers.iter().any(|t| t.is_busy())
    }

    pub fn has_enabled(&self) -> bool {
        self.trackers.iter().any(|t| t.is_enabled())
    }

    pub fn close_all(&self) {
        for t in &self.trackers {
            t.close();
        }
    }

    /// Index range of a tier within the flattened order.
    pub fn tier_range(&self, tier: u32) -> std::ops::Range<usize> {
        let start = self
            .trackers
            .iter()
            .position(|t| t.tier() >= tier)
            .unwrap_or(self.trackers.len());
        let end = self
            .trackers
            .iter()
            .position(|t| t.tier() > tier)
            .unwrap_or(self.trackers.len());
        start..end
    }

    /// The tier of the first enabled tracker; the tier failover prefers it.
    pub fn preferred_tier(&self) -> Option<u32> {
        self.trackers
            .iter()
            .find(|t| t.is_enabled())
            .map(|t| t.tier())
    }

    /// First enabled tracker at or after `from`.
    pub fn find_enabled(&self, from: usize) -> Option<usize> {
        (from..self.trackers.len()).find(|&i| self.trackers[i].is_enabled())
    }

    /// Moves a successful tracker to the head of its tier. Returns the new
    /// index of the tracker.
    pub fn promote(&mut self, index: usize) -> usize {
        let tier = match self.trackers.get(index) {
            Some(t) => t.tier(),
            None => return index,
        };
        let head = self.tier_range(tier).start;
        if head != index {
            let t = self.trackers.remove(index);
            self.trackers.insert(head, t);
        }
        head
    }

    /// Rotates the head of a tier to its back. Used when the head keeps
    /// failing and the caller wants a fresh round order.
    pub fn cycle_tier(&mut self, tier: u32) {
        let range = self.tier_range(tier);
        if range.len() > 1 {
            let t = self.trackers.remove(range.start);
            self.trackers.insert(range.end - 1, t);
        }
    }

    pub fn position(&self, tracker: &Arc<Tracker>) -> Option<usize> {
        self.trackers.iter().position(|t| Arc::ptr_eq(t, tracker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    #[test]
    fn tiers_stay_ordered() {
        let mut list = TrackerList::new();
        list.insert(1, url("http://b0.example/announce"));
        list.insert(0, url("http://a0.example/announce"));
        list.insert(1, url("http://b1.example/announce"));
        list.insert(0, url("http://a1.example/announce"));

        let tiers: Vec<u32> = list.iter().map(|t| t.tier()).collect();
        assert_eq!(tiers, [0, 0, 1, 1]);
        assert_eq!(list.tier_range(0), 0..2);
        assert_eq!(list.tier_range(1), 2..4);
        assert_eq!(list.tier_range(2), 4..4);
    }

    #[test]
    fn promote_moves_to_tier_head() {
        let mut list = TrackerList::from_tiers(&[
            vec!["http://a.example/announce", "http://b.example/announce"],
            vec!["http://c.example/announce"],
        ]);
        // b succeeds, moves to the head of tier 0; c stays put.
        assert_eq!(list.promote(1), 0);
        let urls: Vec<String> = list.iter().map(|t| t.url().to_string()).collect();
        assert_eq!(
            urls,
            [
                "http://b.example/announce",
                "http://a.example/announce",
                "http://c.example/announce"
            ]
        );
        assert_eq!(list.promote(2), 2);
    }

    #[test]
    fn cycle_rotates_within_tier() {
        let mut list = TrackerList::from_tiers(&[vec![
            "http://a.example/announce",
            "http://b.example/announce",
            "http://c.example/announce",
        ]]);
        list.cycle_tier(0);
        let urls: Vec<String> = list.iter().map(|t| t.url().to_string()).collect();
        assert_eq!(
            urls,
            [
                "http://b.example/announce",
                "http://c.example/announce",
                "http://a.example/announce"
            ]
        );
    }

    #[test]
    fn find_enabled_skips_disabled() {
        let list = TrackerList::from_tiers(&[vec![
            "http://a.example/announce",
            "http://b.example/announce",
        ]]);
        list.get(0).unwrap().disable();
        assert_eq!(list.find_enabled(0), Some(1));
        assert_eq!(list.find_enabled(2), None);
        assert_eq!(list.preferred_tier(), Some(0));
    }
}
