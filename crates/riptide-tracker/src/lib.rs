// Tracker controller: a per-torrent scheduler over a tiered tracker list.
//
// The controller decides *what* to announce and *when*; the actual HTTP (or
// UDP) round trip is behind the injected `TrackerTransport`. All scheduling
// state is deterministic and driven either by the async `run` task or, in
// tests, by calling the event methods directly.

mod announce;
mod controller;
mod list;
mod tracker;

pub use announce::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, AnnounceStats, AnnounceStatsProvider,
    ScrapeResponse, TrackerError, TrackerTransport,
};
pub use controller::{TrackerConfig, TrackerController, Work, backoff_seconds};
pub use list::TrackerList;
pub use tracker::{Tracker, TrackerState};
