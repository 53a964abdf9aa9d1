//! Per-round reward ledger.
//!
//! `stage -> agent -> batch -> [generation rewards]`, filled by the trainer as
//! stages complete. Agents keep the order in which they first appeared, which
//! is what breaks ties when picking a round's winner.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{BatchId, PeerId};

/// Rewards of every generation sampled for one batch item
pub type BatchRewards = BTreeMap<BatchId, Vec<Vec<f64>>>;

/// Rewards of every agent for one stage, in first-seen agent order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageRewards {
    agents: Vec<(PeerId, BatchRewards)>,
}

impl StageRewards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Batches of `agent`, created at the end of the agent order if missing.
    pub fn entry(&mut self, agent: &str) -> &mut BatchRewards {
        let idx = match self.agents.iter().position(|(id, _)| id == agent) {
            Some(idx) => idx,
            None => {
                self.agents.push((agent.to_string(), BatchRewards::new()));
                self.agents.len() - 1
            }
        };
        &mut self.agents[idx].1
    }

    /// Append generation rewards for `(agent, batch)`.
    pub fn push(&mut self, agent: &str, batch: BatchId, generations: Vec<Vec<f64>>) {
        self.entry(agent).entry(batch).or_default().extend(generations);
    }

    pub fn get(&self, agent: &str) -> Option<&BatchRewards> {
        self.agents
            .iter()
            .find(|(id, _)| id == agent)
            .map(|(_, batches)| batches)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &BatchRewards)> {
        self.agents.iter().map(|(id, batches)| (id, batches))
    }

    fn absorb(&mut self, other: StageRewards) {
        for (agent, batches) in other.agents {
            for (batch, generations) in batches {
                self.push(&agent, batch, generations);
            }
        }
    }
}

impl Serialize for StageRewards {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.agents.len()))?;
        for (agent, batches) in &self.agents {
            map.serialize_entry(agent, batches)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StageRewards {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StageVisitor;

        impl<'de> Visitor<'de> for StageVisitor {
            type Value = StageRewards;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of agent -> batch -> generation rewards")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut stage = StageRewards::new();
                while let Some((agent, batches)) = access.next_entry::<PeerId, BatchRewards>()? {
                    for (batch, generations) in batches {
                        stage.push(&agent, batch, generations);
                    }
                }
                Ok(stage)
            }
        }

        deserializer.deserialize_map(StageVisitor)
    }
}

/// The whole round's rewards, stage by stage. Append-only until the round ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardLedger {
    stages: BTreeMap<u64, StageRewards>,
}

impl RewardLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage's rewards; a repeated stage extends what is there.
    pub fn record_stage(&mut self, stage: u64, rewards: StageRewards) {
        self.stages.entry(stage).or_default().absorb(rewards);
    }

    pub fn stage(&self, stage: u64) -> Option<&StageRewards> {
        self.stages.get(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.values().all(StageRewards::is_empty)
    }

    /// Start a fresh round.
    pub fn clear(&mut self) {
        self.stages.clear();
    }

    /// Sum of every generation reward per agent over stages `0..completed_stages`.
    pub fn totals_by_agent(&self, completed_stages: u64) -> AgentTotals {
        let mut totals = AgentTotals::default();
        for (_, rewards) in self.stages.range(..completed_stages) {
            for (agent, batches) in rewards.iter() {
                let total: f64 = batches
                    .values()
                    .flat_map(|generations| generations.iter())
                    .map(|rewards| rewards.iter().sum::<f64>())
                    .sum();
                totals.add(agent, total);
            }
        }
        totals
    }
}

/// Per-agent reward totals in first-seen order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentTotals {
    entries: Vec<(PeerId, f64)>,
}

impl AgentTotals {
    pub fn add(&mut self, agent: &str, amount: f64) {
        match self.entries.iter_mut().find(|(id, _)| id == agent) {
            Some((_, total)) => *total += amount,
            None => self.entries.push((agent.to_string(), amount)),
        }
    }

    /// Total for `agent`, zero when it produced nothing.
    pub fn get(&self, agent: &str) -> f64 {
        self.entries
            .iter()
            .find(|(id, _)| id == agent)
            .map(|(_, total)| *total)
            .unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(id, total)| (id.as_str(), *total))
    }

    /// Highest total; on a tie the agent seen first keeps the lead.
    pub fn winner(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (agent, total) in self.iter() {
            match best {
                Some((_, best_total)) if total <= best_total => {}
                _ => best = Some((agent, total)),
            }
        }
        best
    }
}

impl FromIterator<(PeerId, f64)> for AgentTotals {
    fn from_iter<I: IntoIterator<Item = (PeerId, f64)>>(iter: I) -> Self {
        let mut totals = AgentTotals::default();
        for (agent, amount) in iter {
            totals.add(&agent, amount);
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: u128) -> BatchId {
        BatchId(n)
    }

    #[test]
    fn test_totals_sum_completed_stages_only() {
        let mut ledger = RewardLedger::new();
        let mut s0 = StageRewards::new();
        s0.push("alice", batch(1), vec![vec![1.0, 0.5], vec![0.5]]);
        s0.push("bob", batch(1), vec![vec![0.0]]);
        s0.push("alice", batch(2), vec![vec![1.0]]);
        ledger.record_stage(0, s0);
        let mut s1 = StageRewards::new();
        s1.push("bob", batch(3), vec![vec![4.0]]);
        ledger.record_stage(1, s1);

        let totals = ledger.totals_by_agent(1);
        assert_eq!(totals.get("alice"), 3.0);
        assert_eq!(totals.get("bob"), 0.0);
        assert_eq!(totals.get("carol"), 0.0);

        let totals = ledger.totals_by_agent(2);
        assert_eq!(totals.get("bob"), 4.0);
        assert_eq!(totals.len(), 2);
    }

    #[test]
    fn test_winner_prefers_first_seen_on_tie() {
        let totals: AgentTotals = vec![
            ("A".to_string(), 5.0),
            ("B".to_string(), 5.0),
            ("C".to_string(), 3.0),
        ]
        .into_iter()
        .collect();
        assert_eq!(totals.winner(), Some(("A", 5.0)));

        let totals: AgentTotals = vec![("C".to_string(), 3.0), ("B".to_string(), 6.0)]
            .into_iter()
            .collect();
        assert_eq!(totals.winner(), Some(("B", 6.0)));
        assert_eq!(AgentTotals::default().winner(), None);
    }

    #[test]
    fn test_stage_rewards_keep_agent_order_over_json() {
        let json = r#"{"zed": {"7": [[1.0]]}, "amy": {"7": [[1.0]]}}"#;
        let stage: StageRewards = serde_json::from_str(json).unwrap();
        let agents: Vec<&str> = stage.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(agents, vec!["zed", "amy"]);

        let mut ledger = RewardLedger::new();
        ledger.record_stage(0, stage);
        assert_eq!(ledger.totals_by_agent(1).winner(), Some(("zed", 1.0)));
        let back = serde_json::to_string(ledger.stage(0).unwrap()).unwrap();
        assert!(back.find("zed").unwrap() < back.find("amy").unwrap());
    }

    #[test]
    fn test_record_stage_appends() {
        let mut ledger = RewardLedger::new();
        let mut first = StageRewards::new();
        first.push("alice", batch(1), vec![vec![1.0]]);
        ledger.record_stage(0, first);
        let mut second = StageRewards::new();
        second.push("alice", batch(1), vec![vec![2.0]]);
        ledger.record_stage(0, second);

        let generations = &ledger.stage(0).unwrap().get("alice").unwrap()[&batch(1)];
        assert_eq!(generations, &vec![vec![1.0], vec![2.0]]);
        ledger.clear();
        assert!(ledger.is_empty());
    }
}
