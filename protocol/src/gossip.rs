use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::peer::{PeerInfo, PeerRegistry};
use crate::types::*;

/// Peers synced with per gossip tick
pub const GOSSIP_FANOUT: usize = 3;

/// Latest rollouts shared by one peer
#[derive(Debug, Clone)]
struct RolloutRecord {
    round: u64,
    stage: u64,
    rollouts: Rollouts,
}

/// The peer-to-peer side of a swarm peer.
///
/// Keeps a membership view fresh by fan-out gossip, pushes our rollouts to
/// every alive peer and holds on to what others pushed to us. Only shares
/// tagged with the round in `step` are handed to the trainer.
pub struct GossipNode {
    pub config: GossipConfig,
    pub peers: PeerRegistry,
    /// Latest rollout share per peer, in arrival order
    shares: Arc<RwLock<Vec<(PeerId, RolloutRecord)>>>,
    /// Round the local peer is working on
    step: AtomicU64,
    http: reqwest::Client,
}

impl GossipNode {
    pub fn new(config: GossipConfig) -> Self {
        let peers = PeerRegistry::new(config.node_id.clone(), config.peer_timeout_secs);

        Self {
            config,
            peers,
            shares: Arc::new(RwLock::new(Vec::new())),
            step: AtomicU64::new(0),
            http: reqwest::Client::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn step(&self) -> u64 {
        self.step.load(Ordering::SeqCst)
    }

    /// Move the round cursor. Shares from earlier rounds are dropped.
    pub async fn set_step(&self, step: u64) {
        self.step.store(step, Ordering::SeqCst);
        let mut shares = self.shares.write().await;
        let before = shares.len();
        shares.retain(|(_, record)| record.round >= step);
        if shares.len() < before {
            tracing::debug!(step, evicted = before - shares.len(), "Dropped stale rollout shares");
        }
    }

    async fn forget_shares(&self, gone: &[PeerId]) {
        if gone.is_empty() {
            return;
        }
        self.shares.write().await.retain(|(id, _)| !gone.contains(id));
    }

    fn self_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            node_id: self.config.node_id.clone(),
            address: self.config.public_addr.clone(),
            step: self.step(),
            last_seen: Utc::now(),
        }
    }

    /// Exchange peer lists with every seed. Unreachable seeds are logged and
    /// skipped; the gossip loop retries them while the view is empty.
    pub async fn bootstrap(&self) -> Result<()> {
        tracing::info!(
            node_id = %self.config.node_id,
            seeds = ?self.config.seed_peers,
            "🌱 Joining the swarm"
        );

        for seed in &self.config.seed_peers {
            match self.sync_with_peer(seed).await {
                Ok(new_peers) => tracing::info!(seed = %seed, new_peers, "Synced with seed"),
                Err(e) => tracing::warn!(seed = %seed, error = %e, "Seed unreachable"),
            }
        }

        let peers = self.peers.len().await;
        tracing::info!(peers, "Bootstrap complete");
        Ok(())
    }

    async fn post(&self, peer_addr: &str, msg: &GossipMessage) -> Result<GossipResponse> {
        let url = format!("http://{}/gossip", peer_addr);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.auth_token)
            .json(msg)
            .send()
            .await
            .context("Failed to reach peer")?;

        if !resp.status().is_success() {
            anyhow::bail!("Peer returned HTTP {}", resp.status());
        }
        resp.json().await.context("Failed to parse peer response")
    }

    /// Push our view to `peer_addr` and fold its view into ours.
    /// Returns how many peers we learned about.
    async fn sync_with_peer(&self, peer_addr: &str) -> Result<usize> {
        let mut view = self.peers.announcements().await;
        view.push(self.self_announcement());

        let msg = GossipMessage::PeerSync {
            sender: self.config.node_id.clone(),
            peers: view,
        };
        let response = self.post(peer_addr, &msg).await?;
        self.peers.heard_from(&response.node_id, None).await;
        Ok(self.peers.observe(&response.peers).await)
    }

    /// Every gossip interval: drop dead peers, then sync with up to
    /// `GOSSIP_FANOUT` random ones (or the seeds when nobody is left).
    pub async fn run_gossip_loop(&self) {
        let period = Duration::from_secs(self.config.gossip_interval_secs.max(1));
        let mut timer = tokio::time::interval(period);

        loop {
            timer.tick().await;
            let gone = self.peers.prune().await;
            self.forget_shares(&gone).await;

            let targets = self.peers.sample(GOSSIP_FANOUT).await;
            if targets.is_empty() {
                for seed in &self.config.seed_peers {
                    if let Err(e) = self.sync_with_peer(seed).await {
                        tracing::debug!(seed = %seed, error = %e, "Seed still unreachable");
                    }
                }
                continue;
            }

            for peer in targets {
                if let Err(e) = self.sync_with_peer(&peer.address).await {
                    tracing::debug!(peer = %peer.node_id, error = %e, "Gossip sync failed");
                    self.peers.unreachable(&peer.node_id).await;
                }
            }
            let peers = self.peers.len().await;
            tracing::debug!(peers, "Gossip round complete");
        }
    }

    fn reply(
        &self,
        peers: Vec<PeerAnnouncement>,
        data: Option<serde_json::Value>,
    ) -> GossipResponse {
        GossipResponse {
            node_id: self.config.node_id.clone(),
            peers,
            data,
        }
    }

    /// Answer one message posted to our gossip endpoint.
    pub async fn handle_message(&self, msg: GossipMessage) -> GossipResponse {
        match msg {
            GossipMessage::PeerSync { sender, peers } => {
                self.peers.observe(&peers).await;
                self.peers.heard_from(&sender, None).await;

                let mut view = self.peers.announcements().await;
                view.push(self.self_announcement());
                self.reply(view, None)
            }

            GossipMessage::RolloutShare {
                sender,
                round,
                stage,
                rollouts,
            } => {
                let stale = round < self.step();
                if sender == self.config.node_id || !is_valid_peer_id(&sender) || stale {
                    tracing::debug!(from = %sender, round, "Ignoring rollout share");
                    return self.reply(vec![], None);
                }
                tracing::debug!(
                    from = %sender,
                    round,
                    stage,
                    batches = rollouts.len(),
                    "📦 Rollouts received"
                );
                self.peers.heard_from(&sender, Some(round)).await;
                self.record_share(sender, round, stage, rollouts).await;
                self.reply(vec![], None)
            }

            GossipMessage::Ping { sender, nonce } => {
                self.peers.heard_from(&sender, None).await;
                let pong = GossipMessage::Pong {
                    sender: self.config.node_id.clone(),
                    nonce,
                };
                self.reply(vec![], serde_json::to_value(pong).ok())
            }

            GossipMessage::Pong { sender, .. } => {
                self.peers.heard_from(&sender, None).await;
                self.reply(vec![], None)
            }
        }
    }

    async fn record_share(&self, sender: PeerId, round: u64, stage: u64, rollouts: Rollouts) {
        let mut shares = self.shares.write().await;
        let previous = shares
            .iter()
            .position(|(id, _)| *id == sender)
            .map(|idx| shares.remove(idx).1);

        let record = match previous {
            // Later stages of the same round add to what the peer already shared
            Some(mut record) if record.round == round => {
                record.stage = record.stage.max(stage);
                record.rollouts.extend(rollouts);
                record
            }
            _ => RolloutRecord {
                round,
                stage,
                rollouts,
            },
        };
        shares.push((sender, record));
    }

    /// Rollouts of every other peer for the current round, in arrival order.
    pub async fn swarm_states(&self) -> SwarmStates {
        let step = self.step();
        let shares = self.shares.read().await;
        let mut states = SwarmStates::new();
        for (peer, record) in shares.iter().filter(|(_, r)| r.round == step) {
            match serde_json::to_value(&record.rollouts) {
                Ok(value) => {
                    states.insert(peer.clone(), value);
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Could not encode peer rollouts");
                }
            }
        }
        states
    }

    /// Addresses this node can currently see, itself included. With `latest`
    /// dead peers are pruned first.
    pub async fn visible_addresses(&self, latest: bool) -> Vec<String> {
        if latest {
            let gone = self.peers.prune().await;
            self.forget_shares(&gone).await;
        }
        let mut addresses: Vec<String> =
            self.peers.alive().await.into_iter().map(|p| p.address).collect();
        addresses.push(self.config.public_addr.clone());
        addresses
    }

    /// Share our rollouts for a stage with every alive peer.
    /// Returns how many peers accepted them.
    pub async fn publish_rollouts(&self, round: u64, stage: u64, rollouts: Rollouts) -> usize {
        let msg = GossipMessage::RolloutShare {
            sender: self.config.node_id.clone(),
            round,
            stage,
            rollouts,
        };

        let peers = self.peers.alive().await;
        tracing::info!(peers = peers.len(), round, stage, "📡 Sharing rollouts");

        let mut delivered = 0;
        for peer in peers {
            match self.post(&peer.address, &msg).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    tracing::debug!(peer = %peer.node_id, error = %e, "Rollout share failed");
                    self.peers.unreachable(&peer.node_id).await;
                }
            }
        }
        delivered
    }

    pub async fn network_status(&self) -> NetworkStatus {
        let peers = self.peers.alive().await;
        let shares = self.shares.read().await;
        let step = self.step();

        NetworkStatus {
            node_id: self.config.node_id.clone(),
            step,
            peer_count: peers.len(),
            peers_sharing_this_round: shares.iter().filter(|(_, r)| r.round == step).count(),
            peers: peers.iter().map(PeerInfo::to_announcement).collect(),
        }
    }
}

/// Answer to a posted gossip message
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GossipResponse {
    pub node_id: PeerId,
    pub peers: Vec<PeerAnnouncement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// What `GET /api/status` reports about the swarm
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NetworkStatus {
    pub node_id: PeerId,
    pub step: u64,
    pub peer_count: usize,
    pub peers_sharing_this_round: usize,
    pub peers: Vec<PeerAnnouncement>,
}
