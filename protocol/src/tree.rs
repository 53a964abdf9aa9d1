use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{BatchId, PeerId, TransplantPayload, WorldState};

/// One node of a game tree: the state a generation started from and what the
/// model answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub world_state: WorldState,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl TreeNode {
    fn new(world_state: WorldState) -> Self {
        Self {
            world_state,
            actions: Vec::new(),
            metadata: None,
        }
    }
}

/// Stage-indexed node lists for a single `(agent, batch)` pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GameTree {
    stages: BTreeMap<u64, Vec<TreeNode>>,
}

impl GameTree {
    /// A tree whose only node is `root` at `stage`.
    pub fn rooted_at(root: WorldState, stage: u64) -> Self {
        let mut stages = BTreeMap::new();
        stages.insert(stage, vec![TreeNode::new(root)]);
        Self { stages }
    }

    pub fn node(&self, stage: u64, node: usize) -> Option<&TreeNode> {
        self.stages.get(&stage).and_then(|nodes| nodes.get(node))
    }

    pub fn stage_nodes(&self, stage: u64) -> &[TreeNode] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Attach a rollout's actions and metadata to the first node of `stage`,
    /// opening that node from the rollout's world state if the stage is new.
    pub fn record_rollout(&mut self, stage: u64, payload: &TransplantPayload) {
        let nodes = self.stages.entry(stage).or_default();
        if nodes.is_empty() {
            nodes.push(TreeNode::new(payload.world_state.clone()));
        }
        let node = &mut nodes[0];
        node.actions.extend(payload.actions.iter().cloned());
        if payload.metadata.is_some() {
            node.metadata = payload.metadata.clone();
        }
    }
}

/// All game trees a peer holds, `agent -> batch -> tree`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameTrees {
    trees: BTreeMap<PeerId, BTreeMap<BatchId, GameTree>>,
}

impl GameTrees {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any tree exists for `agent`.
    pub fn has_agent(&self, agent: &str) -> bool {
        self.trees.contains_key(agent)
    }

    pub fn contains(&self, agent: &str, batch: BatchId) -> bool {
        self.get(agent, batch).is_some()
    }

    pub fn get(&self, agent: &str, batch: BatchId) -> Option<&GameTree> {
        self.trees.get(agent).and_then(|batches| batches.get(&batch))
    }

    /// Insert a tree for a pair that has none. Returns false and leaves the
    /// existing tree alone otherwise.
    pub fn insert_new(&mut self, agent: &str, batch: BatchId, tree: GameTree) -> bool {
        let batches = self.trees.entry(agent.to_string()).or_default();
        if batches.contains_key(&batch) {
            return false;
        }
        batches.insert(batch, tree);
        true
    }

    /// Record one of our own rollouts. The tree is created on the first
    /// stage-0 rollout for the pair; later stages extend it.
    pub fn record_local(
        &mut self,
        agent: &str,
        batch: BatchId,
        stage: u64,
        payload: &TransplantPayload,
    ) -> bool {
        if let Some(tree) = self.trees.get_mut(agent).and_then(|b| b.get_mut(&batch)) {
            tree.record_rollout(stage, payload);
            return true;
        }
        if stage != 0 {
            return false;
        }
        let mut tree = GameTree::rooted_at(payload.world_state.clone(), stage);
        tree.record_rollout(stage, payload);
        self.insert_new(agent, batch, tree)
    }

    /// Number of `(agent, batch)` pairs.
    pub fn len(&self) -> usize {
        self.trees.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every tree; batches do not outlive their round.
    pub fn clear(&mut self) {
        self.trees.clear();
    }
}
