//! The round loop.
//!
//! ```text
//!  start ─► register ─► read round
//!    │
//!    ▼
//!  ┌─ for stage in 0..max_stage ───────────────────────────┐
//!  │   stage 0: transplant swarm rollouts into our trees    │
//!  │   train ─► ledger ─► local trees ─► publish rollouts   │
//!  └────────────────────────────────────────────────────────┘
//!    │
//!    ▼
//!  rewards hook (submission gate) ─► advance round
//!    │
//!    ▼
//!  round-advanced hook: fallback flush ─► round barrier ─► next round
//! ```
//!
//! Hooks report through `HookError`; a failing hook is logged and the loop
//! moves on. Only a round barrier timeout ends the run.

use anyhow::{Context, Result};
use swarm_protocol::{GameTrees, PeerId, RewardLedger, RoundState};
use thiserror::Error;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::health::HealthNotifier;
use crate::names;
use crate::round_sync::{RoundSyncController, SyncError, SyncOutcome};
use crate::submission::{Clock, GateDecision, SubmissionError, SubmissionGate, SystemClock};
use crate::trainer::{StageRequest, Trainer};
use crate::transplant::{TransplantError, TreeTransplantMerger};
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("{rejected} transplanted rollout(s) rejected, first: {first}")]
    Transplant {
        rejected: usize,
        first: TransplantError,
    },
    #[error("trainer failed: {0:#}")]
    Trainer(anyhow::Error),
}

fn supervise<T>(hook: &'static str, round: u64, result: Result<T, HookError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(hook, round, reason = %e, "Hook failed");
            None
        }
    }
}

pub struct SwarmManager<C, T, R, K: Clock = SystemClock> {
    coordinator: C,
    transport: T,
    trainer: R,
    peer_id: PeerId,
    display_name: String,
    state: RoundState,
    ledger: RewardLedger,
    trees: GameTrees,
    gate: SubmissionGate<K>,
    sync: RoundSyncController,
    merger: TreeTransplantMerger,
}

impl<C, T, R> SwarmManager<C, T, R>
where
    C: Coordinator,
    T: Transport,
    R: Trainer,
{
    pub fn new(
        config: &Config,
        coordinator: C,
        transport: T,
        trainer: R,
        notifier: HealthNotifier,
    ) -> Self {
        let gate = SubmissionGate::new(transport.peer_id(), config.submission, notifier);
        Self::with_gate(config, coordinator, transport, trainer, gate)
    }
}

impl<C, T, R, K> SwarmManager<C, T, R, K>
where
    C: Coordinator,
    T: Transport,
    R: Trainer,
    K: Clock,
{
    pub fn with_gate(
        config: &Config,
        coordinator: C,
        transport: T,
        trainer: R,
        gate: SubmissionGate<K>,
    ) -> Self {
        let peer_id = transport.peer_id();
        Self {
            coordinator,
            trainer,
            display_name: names::display_name(&peer_id),
            peer_id,
            transport,
            state: RoundState::new(0, config.max_round, config.max_stage),
            ledger: RewardLedger::new(),
            trees: GameTrees::new(),
            gate,
            sync: RoundSyncController::new(config.round_sync),
            merger: TreeTransplantMerger::new(config.transplant),
        }
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn ledger(&self) -> &RewardLedger {
        &self.ledger
    }

    pub fn trees(&self) -> &GameTrees {
        &self.trees
    }

    pub fn gate(&self) -> &SubmissionGate<K> {
        &self.gate
    }

    /// Register with the coordinator and adopt its current round.
    pub async fn start(&mut self) -> Result<()> {
        self.coordinator
            .register_peer(&self.peer_id)
            .await
            .context("Failed to register with the coordinator")?;

        let current = self
            .coordinator
            .round_and_stage()
            .await
            .context("Failed to read the coordinator round")?;
        self.state.round = current.round;
        self.state.stage = 0;
        self.transport.set_step(current.round).await;

        tracing::info!(
            peer = %self.peer_id,
            round = current.round,
            "🐱 Hello 🐈 [{}] 🦮 [{}]!",
            self.display_name,
            self.peer_id
        );
        Ok(())
    }

    /// Train round after round until `max_round` or a barrier timeout.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        while !self.state.is_finished() {
            let round = self.state.round;
            self.run_stages().await;

            if let Some(decision) = supervise("rewards", round, self.on_rewards_updated().await) {
                tracing::debug!(round, ?decision, "Rewards hook done");
            }

            self.state.advance_round();
            match self.on_round_advanced().await {
                Ok(outcome) => {
                    tracing::debug!(round = self.state.round, ?outcome, "Round barrier passed")
                }
                Err(HookError::Sync(e)) => {
                    tracing::info!(round = self.state.round, reason = %e, "Stopping training");
                    break;
                }
                Err(e) => {
                    supervise::<()>("round_advanced", self.state.round, Err(e));
                }
            }
        }

        tracing::info!(peer = %self.peer_id, round = self.state.round, "Training finished");
        Ok(())
    }

    /// Run every stage of the current round. A failing stage ends the round's
    /// training; `state.stage` is left at the number of completed stages.
    async fn run_stages(&mut self) {
        let round = self.state.round;
        for stage in 0..self.state.max_stage {
            self.state.stage = stage;
            if stage == 0 {
                supervise("transplant", round, self.transplant(stage).await);
            }
            if supervise("train", round, self.train_stage(stage).await).is_none() {
                return;
            }
            self.state.stage = stage + 1;
        }
    }

    async fn transplant(&mut self, stage: u64) -> Result<(), HookError> {
        let swarm = self.transport.swarm_states().await;
        let report = self.merger.merge(&mut self.trees, &swarm, stage);
        if !report.merged.is_empty() {
            tracing::info!(
                round = self.state.round,
                merged = report.merged.len(),
                "Transplants merged"
            );
        }
        match report.violations.first() {
            Some(first) => Err(HookError::Transplant {
                rejected: report.violations.len(),
                first: first.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn train_stage(&mut self, stage: u64) -> Result<(), HookError> {
        let round = self.state.round;
        let swarm = self.transport.swarm_states().await;
        let request = StageRequest {
            round,
            stage,
            peer_id: &self.peer_id,
            trees: &self.trees,
            swarm_states: &swarm,
        };
        let output = self
            .trainer
            .train_stage(&request)
            .await
            .map_err(HookError::Trainer)?;

        self.ledger.record_stage(stage, output.rewards);
        for (batch, payloads) in &output.rollouts {
            for payload in payloads {
                self.trees.record_local(&self.peer_id, *batch, stage, payload);
            }
        }

        let batches = output.rollouts.len();
        let delivered = self.transport.publish_rollouts(round, stage, output.rollouts).await;
        tracing::info!(round, stage, batches, delivered, "Stage complete");
        Ok(())
    }

    async fn on_rewards_updated(&mut self) -> Result<GateDecision, HookError> {
        Ok(self
            .gate
            .on_rewards_updated(&self.coordinator, &self.ledger, &self.state)
            .await?)
    }

    async fn on_round_advanced(&mut self) -> Result<SyncOutcome, HookError> {
        self.gate
            .try_flush_if_not_yet_submitted(&self.coordinator, &self.ledger, &self.state)
            .await;

        let outcome = self
            .sync
            .await_round(&self.coordinator, &self.transport, &mut self.state)
            .await?;

        self.gate.start_round();
        self.ledger.clear();
        self.trees.clear();
        Ok(outcome)
    }
}
