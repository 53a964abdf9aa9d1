//! Adopting other peers' rollouts into the local game trees.
//!
//! Swarm state is untrusted input: anything that does not look exactly like a
//! rollout is passed over, and a rollout whose question does not hash to the
//! batch it was filed under is reported rather than merged.

use std::collections::BTreeSet;
use swarm_protocol::{
    is_valid_peer_id, BatchId, GameTree, GameTrees, PeerId, SwarmStates, TransplantPayload,
};
use thiserror::Error;

use crate::config::TransplantConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransplantError {
    #[error("rollout from {agent} filed under batch {batch_id} hashes to {computed}")]
    BatchIdMismatch {
        agent: PeerId,
        batch_id: BatchId,
        computed: BatchId,
    },
}

/// A rollout picked for transplanting
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub agent: PeerId,
    pub batch_id: BatchId,
    pub payload: TransplantPayload,
}

#[derive(Debug, Default, PartialEq)]
pub struct MergeReport {
    pub merged: BTreeSet<(PeerId, BatchId)>,
    pub skipped_existing: usize,
    pub violations: Vec<TransplantError>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct TreeTransplantMerger {
    config: TransplantConfig,
}

impl TreeTransplantMerger {
    pub fn new(config: TransplantConfig) -> Self {
        Self { config }
    }

    /// Walk the swarm in arrival order and pick at most `max_transplants`
    /// rollouts from peers we hold no trees for.
    pub fn select(&self, trees: &GameTrees, swarm: &SwarmStates) -> Vec<Candidate> {
        let Some(expected) = self.config.expected_generations else {
            return Vec::new();
        };
        let limit = self.config.max_transplants;
        let mut picked: Vec<Candidate> = Vec::new();
        if limit == 0 {
            return picked;
        }

        for (agent, batches) in swarm {
            if !is_valid_peer_id(agent) || trees.has_agent(agent) {
                continue;
            }
            let Some(batches) = batches.as_object() else {
                continue;
            };

            for (key, artifacts) in batches {
                let Ok(batch_id) = key.parse::<BatchId>() else {
                    continue;
                };
                let Some(artifacts) = artifacts.as_array() else {
                    continue;
                };
                if picked.iter().any(|c| c.agent == *agent && c.batch_id == batch_id) {
                    continue;
                }

                let accepted = artifacts.iter().find_map(|artifact| {
                    serde_json::from_value::<TransplantPayload>(artifact.clone())
                        .ok()
                        .filter(|payload| payload.actions.len() == expected)
                });

                if let Some(payload) = accepted {
                    picked.push(Candidate {
                        agent: agent.clone(),
                        batch_id,
                        payload,
                    });
                    if picked.len() >= limit {
                        return picked;
                    }
                }
            }
        }
        picked
    }

    /// Root a new tree at `stage` for every selected rollout that checks out.
    pub fn merge(&self, trees: &mut GameTrees, swarm: &SwarmStates, stage: u64) -> MergeReport {
        let mut report = MergeReport::default();

        for Candidate {
            agent,
            batch_id,
            payload,
        } in self.select(trees, swarm)
        {
            let computed = payload.batch_id();
            if computed != batch_id {
                tracing::error!(
                    agent = %agent,
                    batch = %batch_id,
                    computed = %computed,
                    "Dropping transplant with mismatched batch id"
                );
                report.violations.push(TransplantError::BatchIdMismatch {
                    agent,
                    batch_id,
                    computed,
                });
                continue;
            }

            let mut tree = GameTree::rooted_at(payload.world_state.clone(), stage);
            tree.record_rollout(stage, &payload);
            if trees.insert_new(&agent, batch_id, tree) {
                tracing::info!(agent = %agent, batch = %batch_id, stage, "🌿 Transplanted rollout");
                report.merged.insert((agent, batch_id));
            } else {
                report.skipped_existing += 1;
            }
        }

        report
    }
}
