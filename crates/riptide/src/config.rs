use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine tunables. Durations are stored in seconds so the struct stays
/// trivially serializable in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hard cap on concurrent peer connections.
    pub max_connections: usize,

    /// Keep initiating outbound connections until this many are up.
    pub min_connections: usize,

    /// At most this many peers are unchoked at a time.
    pub unchoke_slots: usize,

    /// Forced rotation of the weakest unchoked peer.
    pub choke_cycle_secs: u64,

    /// A freshly unchoked peer is protected from re-choking this long.
    pub choke_grace_period_secs: u64,

    pub keep_alive_interval_secs: u64,
    pub stall_timeout_secs: u64,

    /// Peers that send nothing at all for this long get dropped.
    pub peer_idle_timeout_secs: u64,

    pub tick_interval_secs: u64,
    pub cull_interval_secs: u64,

    /// Recent HAVE broadcasts are remembered this long for late joiners.
    pub have_queue_window_secs: u64,

    /// Hash failures tolerated per chunk before all captured transfers are
    /// invalidated and their peers dropped.
    pub hash_fail_attempts: u32,

    /// Endgame begins when at most `max(1, total_chunks / endgame_divisor)`
    /// chunks are still outstanding.
    pub endgame_divisor: u32,

    /// In endgame, stalled peers are only re-requested below this download
    /// rate (bytes/s).
    pub endgame_rate: u64,

    /// Memory budget for mapped chunk buffers.
    pub chunk_budget_bytes: u64,

    /// Per-tick download/upload budgets; `None` means unthrottled.
    pub download_rate_limit: Option<u64>,
    pub upload_rate_limit: Option<u64>,

    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_connections: 100,
            min_connections: 40,
            unchoke_slots: 4,
            choke_cycle_secs: 30,
            choke_grace_period_secs: 55,
            keep_alive_interval_secs: 120,
            stall_timeout_secs: 60,
            peer_idle_timeout_secs: 240,
            tick_interval_secs: 30,
            cull_interval_secs: 3600,
            have_queue_window_secs: 600,
            hash_fail_attempts: 3,
            endgame_divisor: 100,
            endgame_rate: 10 * 1024,
            chunk_budget_bytes: 128 * 1024 * 1024,
            download_rate_limit: None,
            upload_rate_limit: None,
            listen_port: 6881,
        }
    }
}

impl Config {
    pub fn choke_cycle(&self) -> Duration {
        Duration::from_secs(self.choke_cycle_secs)
    }

    pub fn choke_grace_period(&self) -> Duration {
        Duration::from_secs(self.choke_grace_period_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn peer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_idle_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn cull_interval(&self) -> Duration {
        Duration::from_secs(self.cull_interval_secs)
    }

    pub fn have_queue_window(&self) -> Duration {
        Duration::from_secs(self.have_queue_window_secs)
    }

    pub fn endgame_threshold(&self, total_chunks: u32) -> u32 {
        (total_chunks / self.endgame_divisor.max(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endgame_threshold_floors_at_one() {
        let c = Config::default();
        assert_eq!(c.endgame_threshold(1), 1);
        assert_eq!(c.endgame_threshold(99), 1);
        assert_eq!(c.endgame_threshold(100), 1);
        assert_eq!(c.endgame_threshold(1000), 10);
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let c: Config = serde_json::from_str(r#"{"unchoke_slots": 8}"#).unwrap();
        assert_eq!(c.unchoke_slots, 8);
        assert_eq!(c.choke_cycle_secs, 30);
    }
}
