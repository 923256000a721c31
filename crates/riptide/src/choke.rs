use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

/// Snapshot of one connection fed into the balancer.
#[derive(Debug, Clone, Copy)]
pub struct ChokeCandidate {
    pub peer: SocketAddr,

    /// The peer wants data from us.
    pub interested: bool,

    /// We currently do not choke the peer.
    pub unchoked: bool,
    pub snubbed: bool,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub unchoked_at: Option<Instant>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokeDecision {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

/// Picks which interested peers deserve the unchoke slots.
///
/// Ranking is by what the peer gives us (download rate), ties broken by
/// what we give them; snubbed peers sort behind everyone. A fresh unchoke
/// is protected by the grace period, and `cycle` forcibly rotates the
/// weakest slot holder once per cycle interval when the slots are full.
pub struct ChokeManager {
    slots: usize,
    grace_period: Duration,
    cycle_interval: Duration,
    last_cycle: Instant,
}

impl ChokeManager {
    pub fn new(slots: usize, grace_period: Duration, cycle_interval: Duration) -> Self {
        ChokeManager {
            slots,
            grace_period,
            cycle_interval,
            last_cycle: Instant::now(),
        }
    }

    fn rank(c: &ChokeCandidate) -> (bool, std::cmp::Reverse<u64>, std::cmp::Reverse<u64>) {
        (
            c.snubbed,
            std::cmp::Reverse(c.download_rate),
            std::cmp::Reverse(c.upload_rate),
        )
    }

    /// Selects at most `slots` interested peers to unchoke and chokes the
    /// rest, honoring the grace period.
    pub fn balance(&mut self, candidates: &[ChokeCandidate], now: Instant) -> ChokeDecision {
        let mut interested: Vec<&ChokeCandidate> =
            candidates.iter().filter(|c| c.interested).collect();
        interested.sort_by_key(|c| Self::rank(c));

        let keep: Vec<SocketAddr> = interested
            .iter()
            .take(self.slots)
            .map(|c| c.peer)
            .collect();

        let mut decision = ChokeDecision::default();
        for c in candidates {
            let selected = keep.contains(&c.peer);
            if selected && !c.unchoked {
                decision.unchoke.push(c.peer);
            } else if !selected && c.unchoked {
                let in_grace = c
                    .unchoked_at
                    .is_some_and(|at| now.saturating_duration_since(at) < self.grace_period);
                if !in_grace {
                    decision.choke.push(c.peer);
                }
            }
        }
        decision
    }

    /// When the slots are saturated, periodically rotates the weakest
    /// unchoked peer out for the best waiting candidate, grace permitting.
    pub fn cycle(&mut self, candidates: &[ChokeCandidate], now: Instant) -> Option<ChokeDecision> {
        if now.saturating_duration_since(self.last_cycle) < self.cycle_interval {
            return None;
        }
        let unchoked: Vec<&ChokeCandidate> = candidates.iter().filter(|c| c.unchoked).collect();
        if unchoked.len() < self.slots {
            return None;
        }
        let victim = unchoked
            .iter()
            .filter(|c| {
                c.unchoked_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.grace_period)
            })
            .max_by_key(|c| Self::rank(c))?;
        let replacement = candidates
            .iter()
            .filter(|c| c.interested && !c.unchoked)
            .min_by_key(|c| Self::rank(c))?;

        self.last_cycle = now;
        Some(ChokeDecision {
            unchoke: vec![replacement.peer],
            choke: vec![victim.peer],
        })
    }
}
