use std::net::SocketAddr;

use riptide_core::Id20;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    /// A periodic update; the `event` parameter is omitted.
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: Id20,
    pub peer_id: Id20,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub key: Option<u32>,
    pub tracker_id: Option<String>,
    pub numwant: Option<u32>,
}

impl AnnounceRequest {
    /// Builds the announce query string. `info_hash` and `peer_id` are the
    /// raw 20 bytes, percent-encoded.
    pub fn as_query_string(&self) -> String {
        use std::fmt::Write;
        use urlencoding as u;
        let mut s = String::new();
        s.push_str("info_hash=");
        s.push_str(u::encode_binary(self.info_hash.as_bytes()).as_ref());
        s.push_str("&peer_id=");
        s.push_str(u::encode_binary(self.peer_id.as_bytes()).as_ref());
        let _ = write!(s, "&port={}", self.port);
        let _ = write!(s, "&uploaded={}", self.uploaded);
        let _ = write!(s, "&downloaded={}", self.downloaded);
        let _ = write!(s, "&left={}", self.left);
        s.push_str("&compact=1");
        if let Some(event) = self.event.as_str() {
            let _ = write!(s, "&event={event}");
        }
        if let Some(key) = self.key {
            let _ = write!(s, "&key={key:08x}");
        }
        if let Some(tracker_id) = &self.tracker_id {
            let _ = write!(s, "&trackerid={}", u::encode(tracker_id));
        }
        if let Some(numwant) = self.numwant {
            let _ = write!(s, "&numwant={numwant}");
        }
        s
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    /// Seconds until the next periodic announce, per the tracker.
    pub interval: Option<u32>,
    pub min_interval: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub tracker_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeResponse {
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    /// The tracker itself reported `failure reason`.
    #[error("tracker failure: {0}")]
    Failure(String),
    #[error("transport error: {0:#}")]
    Transport(#[source] anyhow::Error),
}

/// The announce/scrape round trip. HTTP, UDP and test transports all live
/// behind this seam; the controller never does I/O itself.
#[async_trait::async_trait]
pub trait TrackerTransport: Send + Sync {
    async fn announce(
        &self,
        url: &Url,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError>;

    async fn scrape(&self, url: &Url, info_hash: Id20) -> Result<ScrapeResponse, TrackerError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Snapshot of transfer counters at announce time, provided by the download.
pub trait AnnounceStatsProvider: Send + Sync {
    fn get(&self) -> AnnounceStats;
}

impl AnnounceStatsProvider for () {
    fn get(&self) -> AnnounceStats {
        AnnounceStats::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_encodes_raw_bytes() {
        let req = AnnounceRequest {
            info_hash: Id20::new([0xab; 20]),
            peer_id: Id20::new([b'a'; 20]),
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: AnnounceEvent::Started,
            key: Some(0xdeadbeef),
            tracker_id: None,
            numwant: Some(50),
        };
        let q = req.as_query_string();
        assert!(q.starts_with("info_hash=%AB%AB"));
        assert!(q.contains("&peer_id=aaaaaaaaaaaaaaaaaaaa"));
        assert!(q.contains("&compact=1"));
        assert!(q.contains("&event=started"));
        assert!(q.contains("&key=deadbeef"));
        assert!(q.contains("&numwant=50"));
    }

    #[test]
    fn update_omits_event() {
        let req = AnnounceRequest {
            info_hash: Id20::new([0; 20]),
            peer_id: Id20::new([0; 20]),
            port: 1,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: AnnounceEvent::None,
            key: None,
            tracker_id: None,
            numwant: None,
        };
        assert!(!req.as_query_string().contains("event="));
    }
}
