//! Swarm coordination protocol
//!
//! Shared vocabulary for every peer taking part in a swarm training run.
//! Peers train independently, report rewards to an external coordinator and
//! swap their rollouts with each other over gossip.
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────┐
//!        rewards  │ Coordinator │  round / stage
//!     ┌──────────►│  (chain)    │◄──────────┐
//!     │           └─────────────┘           │
//!  ┌──────┐  gossip (rollouts)   ┌──────┐   │
//!  │Peer A│◄────────────────────►│Peer B│───┘
//!  └──────┘                      └──────┘
//! ```
//!
//! ## Rounds
//! - The coordinator is the authority of record for the current round
//! - A peer that finishes a round blocks until the coordinator shows it
//!
//! ## Rollouts
//! - Each peer shares the rollouts it produced for the current round
//! - Other peers may transplant them into their own game trees, keyed by a
//!   batch id derived from the question text

pub mod gossip;
pub mod ledger;
pub mod peer;
pub mod tree;
pub mod types;

pub use gossip::GossipNode;
pub use ledger::{AgentTotals, RewardLedger, StageRewards};
pub use peer::PeerInfo;
pub use tree::{GameTree, GameTrees, TreeNode};
pub use types::*;
