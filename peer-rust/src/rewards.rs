//! Turns a round's reward totals into the integer the coordinator receives.

use std::collections::VecDeque;
use swarm_protocol::AgentTotals;

pub const ZERO_REWARD_CACHE_CAPACITY: usize = 3;

/// Recent rounds in which this peer earned nothing, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZeroRewardCache {
    rounds: VecDeque<u64>,
}

impl ZeroRewardCache {
    /// Remember `round` unless it is already there, evicting the oldest entry
    /// at capacity.
    pub fn record(&mut self, round: u64) {
        if self.rounds.contains(&round) {
            return;
        }
        if self.rounds.len() >= ZERO_REWARD_CACHE_CAPACITY {
            self.rounds.pop_front();
        }
        self.rounds.push_back(round);
    }

    pub fn clear(&mut self) {
        self.rounds.clear();
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn rounds(&self) -> impl Iterator<Item = u64> + '_ {
        self.rounds.iter().copied()
    }
}

#[derive(Debug, Default)]
pub struct RewardAggregator {
    cache: ZeroRewardCache,
}

impl RewardAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &ZeroRewardCache {
        &self.cache
    }

    /// Value for `round`: a positive local total is bumped by one plus the
    /// number of empty rounds still owed, which are then forgotten. An empty
    /// round is worth the count of earlier empty rounds and joins the cache.
    pub fn aggregate(&mut self, totals: &AgentTotals, peer_id: &str, round: u64) -> u64 {
        let total = totals.get(peer_id);
        let value = if total > 0.0 {
            let value = total + 1.0 + self.cache.len() as f64;
            self.cache.clear();
            value
        } else {
            let value = self.cache.len() as f64;
            self.cache.record(round);
            value
        };
        value.max(0.0) as u64
    }
}
