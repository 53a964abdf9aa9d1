use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Unique peer identifier
pub type PeerId = String;

/// Longest peer identifier accepted from the swarm
pub const MAX_PEER_ID_LEN: usize = 128;

/// Swarm-wide rollouts as gathered from gossip: `peer -> batch key -> [artifact]`.
///
/// Untrusted. Iteration follows arrival order.
pub type SwarmStates = serde_json::Map<String, serde_json::Value>;

/// Whether a string received from the swarm can name a peer.
pub fn is_valid_peer_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= MAX_PEER_ID_LEN
        && candidate.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Content-derived identifier of a batch item: MD5 of the question text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub u128);

impl BatchId {
    pub fn from_question(question: &str) -> Self {
        let digest = Md5::digest(question.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        Self(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u128>().map(BatchId)
    }
}

// JSON object keys are strings, and u128 does not survive every JSON reader,
// so batch ids always travel as decimal strings.
impl Serialize for BatchId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BatchId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The peer's view of global progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState {
    pub round: u64,
    pub stage: u64,
    pub max_round: u64,
    pub max_stage: u64,
}

impl RoundState {
    pub fn new(round: u64, max_round: u64, max_stage: u64) -> Self {
        Self {
            round,
            stage: 0,
            max_round,
            max_stage,
        }
    }

    /// Local end-of-round bump; the coordinator confirms it later.
    pub fn advance_round(&mut self) {
        self.round += 1;
        self.stage = 0;
    }

    /// Adopt the coordinator's round if it is not behind ours.
    pub fn catch_up(&mut self, remote_round: u64) -> bool {
        if remote_round >= self.round {
            self.round = remote_round;
            true
        } else {
            false
        }
    }

    /// The last round the coordinator will ever announce.
    pub fn is_final_round(&self, round: u64) -> bool {
        self.max_round > 0 && round == self.max_round - 1
    }

    pub fn is_finished(&self) -> bool {
        self.round >= self.max_round
    }
}

/// Reward report sent to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(rename = "roundNumber")]
    pub round: u64,
    #[serde(rename = "stageNumber")]
    pub stage_index: u64,
    #[serde(rename = "reward")]
    pub amount: u64,
    pub peer_id: PeerId,
}

impl Submission {
    pub fn new(round: u64, amount: u64, peer_id: impl Into<PeerId>) -> Self {
        Self {
            round,
            stage_index: 0,
            amount,
            peer_id: peer_id.into(),
        }
    }
}

/// Winner vote sent to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerAnnouncement {
    #[serde(rename = "roundNumber")]
    pub round: u64,
    pub winners: Vec<PeerId>,
    pub peer_id: PeerId,
}

impl WinnerAnnouncement {
    pub fn single(round: u64, winner: impl Into<PeerId>, peer_id: impl Into<PeerId>) -> Self {
        Self {
            round,
            winners: vec![winner.into()],
            peer_id: peer_id.into(),
        }
    }
}

/// Question/answer pair a batch item is built from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentStates {
    pub question: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Everything a peer knows about one batch item when it starts a stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub environment_states: EnvironmentStates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent_states: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_states: Option<serde_json::Value>,
}

/// One peer's rollout for a batch item, as shared over gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransplantPayload {
    pub world_state: WorldState,
    pub actions: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl TransplantPayload {
    /// Batch id recomputed from the payload's own question text.
    pub fn batch_id(&self) -> BatchId {
        BatchId::from_question(&self.world_state.environment_states.question)
    }
}

/// Rollouts a peer produced in one stage, keyed by batch
pub type Rollouts = BTreeMap<BatchId, Vec<TransplantPayload>>;

/// A gossip message exchanged between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GossipMessage {
    /// "Here are the peers I know about"
    PeerSync {
        sender: PeerId,
        peers: Vec<PeerAnnouncement>,
    },
    /// "Here is what I produced this stage"
    RolloutShare {
        sender: PeerId,
        round: u64,
        stage: u64,
        rollouts: Rollouts,
    },
    /// Ping/Pong for liveness
    Ping { sender: PeerId, nonce: u64 },
    Pong { sender: PeerId, nonce: u64 },
}

/// Announcement of a peer's existence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub node_id: PeerId,
    /// The address where this peer's gossip HTTP endpoint lives
    pub address: String,
    /// The round the peer is working on
    #[serde(default)]
    pub step: u64,
    pub last_seen: DateTime<Utc>,
}

/// Configuration for the gossip protocol
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// This node's peer id
    pub node_id: PeerId,
    /// Address this node listens on for gossip (e.g. "0.0.0.0:7435")
    pub listen_addr: String,
    /// Public address other nodes can reach us at (e.g. "myhost.com:7435")
    pub public_addr: String,
    /// Initial seed peers to bootstrap from
    pub seed_peers: Vec<String>,
    /// How often to gossip (seconds)
    pub gossip_interval_secs: u64,
    /// How long before a peer is considered dead (seconds)
    pub peer_timeout_secs: u64,
    /// Auth token for the network
    pub auth_token: String,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().simple().to_string(),
            listen_addr: "0.0.0.0:7435".into(),
            public_addr: "127.0.0.1:7435".into(),
            seed_peers: vec![],
            gossip_interval_secs: 30,
            peer_timeout_secs: 120,
            auth_token: String::new(),
        }
    }
}
