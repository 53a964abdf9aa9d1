//! Membership view of the swarm.
//!
//! A peer is dropped once it has not been heard from within the peer timeout,
//! or once it failed to answer `MAX_FAILED_CONTACTS` times in a row.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::*;

pub const MAX_FAILED_CONTACTS: u32 = 3;

/// What we know about another peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: PeerId,
    pub address: String,
    /// Last round the peer reported working on
    pub step: u64,
    pub last_seen: DateTime<Utc>,
    pub failed_contacts: u32,
}

impl PeerInfo {
    fn from_announcement(announcement: &PeerAnnouncement) -> Self {
        Self {
            node_id: announcement.node_id.clone(),
            address: announcement.address.clone(),
            step: announcement.step,
            last_seen: announcement.last_seen,
            failed_contacts: 0,
        }
    }

    pub fn is_alive(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.failed_contacts < MAX_FAILED_CONTACTS && now - self.last_seen < timeout
    }

    pub fn to_announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            step: self.step,
            last_seen: self.last_seen,
        }
    }
}

/// Known peers, shared between the gossip endpoint and the gossip loop
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerId, PeerInfo>>>,
    self_id: PeerId,
    timeout: Duration,
}

impl PeerRegistry {
    pub fn new(self_id: PeerId, peer_timeout_secs: u64) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            self_id,
            timeout: Duration::seconds(peer_timeout_secs.min(i64::MAX as u64) as i64),
        }
    }

    /// Fold announcements into the view. Fresher information replaces older;
    /// our own entry and malformed ids are ignored. Returns how many peers
    /// were new to us.
    pub async fn observe(&self, announcements: &[PeerAnnouncement]) -> usize {
        let mut peers = self.peers.write().await;
        let mut discovered = 0;

        for announcement in announcements {
            let id = &announcement.node_id;
            if *id == self.self_id || !is_valid_peer_id(id) {
                continue;
            }
            match peers.get_mut(id) {
                Some(known) if announcement.last_seen > known.last_seen => {
                    known.address = announcement.address.clone();
                    known.step = announcement.step;
                    known.last_seen = announcement.last_seen;
                }
                Some(_) => {}
                None => {
                    tracing::info!(
                        peer = %id,
                        addr = %announcement.address,
                        "🌐 Discovered new peer"
                    );
                    peers.insert(id.clone(), PeerInfo::from_announcement(announcement));
                    discovered += 1;
                }
            }
        }
        discovered
    }

    /// A peer talked to us or answered; `step` updates its round if known.
    pub async fn heard_from(&self, node_id: &str, step: Option<u64>) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.last_seen = Utc::now();
            peer.failed_contacts = 0;
            if let Some(step) = step {
                peer.step = step;
            }
        }
    }

    pub async fn unreachable(&self, node_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.failed_contacts += 1;
        }
    }

    /// Forget peers that are no longer alive. Returns their ids.
    pub async fn prune(&self) -> Vec<PeerId> {
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        let mut removed = Vec::new();
        peers.retain(|id, peer| {
            let keep = peer.is_alive(self.timeout, now);
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        if !removed.is_empty() {
            tracing::info!(
                removed = ?removed,
                remaining = peers.len(),
                "💀 Dropped unresponsive peers"
            );
        }
        removed
    }

    /// Alive peers ordered by id
    pub async fn alive(&self) -> Vec<PeerInfo> {
        let now = Utc::now();
        let peers = self.peers.read().await;
        let mut alive: Vec<PeerInfo> = peers
            .values()
            .filter(|p| p.is_alive(self.timeout, now))
            .cloned()
            .collect();
        alive.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        alive
    }

    pub async fn announcements(&self) -> Vec<PeerAnnouncement> {
        self.alive().await.iter().map(PeerInfo::to_announcement).collect()
    }

    /// Up to `n` alive peers chosen at random, for fan-out.
    pub async fn sample(&self, n: usize) -> Vec<PeerInfo> {
        use rand::seq::SliceRandom;
        let alive = self.alive().await;
        let mut rng = rand::thread_rng();
        alive.choose_multiple(&mut rng, n).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.alive().await.len()
    }

    pub async fn get(&self, node_id: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(node_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(id: &str, age_secs: i64, step: u64) -> PeerAnnouncement {
        PeerAnnouncement {
            node_id: id.into(),
            address: format!("{id}.local:7435"),
            step,
            last_seen: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_observe_skips_self_and_invalid_ids() {
        let registry = PeerRegistry::new("self0".into(), 120);
        let new = registry
            .observe(&[
                announcement("self0", 0, 3),
                announcement("not a peer", 0, 3),
                announcement("peer1", 0, 3),
            ])
            .await;
        assert_eq!(new, 1);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("peer1").await.unwrap().step, 3);
    }

    #[tokio::test]
    async fn test_only_fresher_announcements_win() {
        let registry = PeerRegistry::new("self0".into(), 120);
        registry.observe(&[announcement("peer1", 10, 4)]).await;
        registry.observe(&[announcement("peer1", 60, 1)]).await;
        assert_eq!(registry.get("peer1").await.unwrap().step, 4);
        assert_eq!(registry.observe(&[announcement("peer1", 0, 5)]).await, 0);
        assert_eq!(registry.get("peer1").await.unwrap().step, 5);
    }

    #[tokio::test]
    async fn test_prune_drops_stale_and_unreachable_peers() {
        let registry = PeerRegistry::new("self0".into(), 60);
        registry
            .observe(&[
                announcement("fresh", 0, 1),
                announcement("stale", 600, 1),
                announcement("flaky", 0, 1),
            ])
            .await;
        for _ in 0..MAX_FAILED_CONTACTS {
            registry.unreachable("flaky").await;
        }

        let mut removed = registry.prune().await;
        removed.sort();
        assert_eq!(removed, vec!["flaky".to_string(), "stale".to_string()]);
        let alive: Vec<PeerId> = registry.alive().await.into_iter().map(|p| p.node_id).collect();
        assert_eq!(alive, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_heard_from_resets_failures() {
        let registry = PeerRegistry::new("self0".into(), 60);
        registry.observe(&[announcement("peer1", 0, 1)]).await;
        registry.unreachable("peer1").await;
        registry.heard_from("peer1", Some(9)).await;
        let peer = registry.get("peer1").await.unwrap();
        assert_eq!(peer.failed_contacts, 0);
        assert_eq!(peer.step, 9);
        assert_eq!(registry.sample(5).await.len(), 1);
    }
}
