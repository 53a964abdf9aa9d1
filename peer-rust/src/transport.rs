use std::sync::Arc;
use swarm_protocol::{GossipNode, PeerId, Rollouts, SwarmStates};

/// What the coordination loop needs from the peer-to-peer layer.
pub trait Transport {
    fn peer_id(&self) -> PeerId;
    /// Liveness probe; refreshes routing state when `latest` is set.
    async fn visible_addresses(&self, latest: bool) -> Vec<String>;
    async fn set_step(&self, step: u64);
    async fn publish_rollouts(&self, round: u64, stage: u64, rollouts: Rollouts) -> usize;
    async fn swarm_states(&self) -> SwarmStates;
}

impl Transport for GossipNode {
    fn peer_id(&self) -> PeerId {
        GossipNode::peer_id(self).to_string()
    }

    async fn visible_addresses(&self, latest: bool) -> Vec<String> {
        GossipNode::visible_addresses(self, latest).await
    }

    async fn set_step(&self, step: u64) {
        GossipNode::set_step(self, step).await
    }

    async fn publish_rollouts(&self, round: u64, stage: u64, rollouts: Rollouts) -> usize {
        GossipNode::publish_rollouts(self, round, stage, rollouts).await
    }

    async fn swarm_states(&self) -> SwarmStates {
        GossipNode::swarm_states(self).await
    }
}

impl<T: Transport> Transport for Arc<T> {
    fn peer_id(&self) -> PeerId {
        (**self).peer_id()
    }

    async fn visible_addresses(&self, latest: bool) -> Vec<String> {
        (**self).visible_addresses(latest).await
    }

    async fn set_step(&self, step: u64) {
        (**self).set_step(step).await
    }

    async fn publish_rollouts(&self, round: u64, stage: u64, rollouts: Rollouts) -> usize {
        (**self).publish_rollouts(round, stage, rollouts).await
    }

    async fn swarm_states(&self) -> SwarmStates {
        (**self).swarm_states().await
    }
}
