//! Round barrier: block until the coordinator shows the round we are about to
//! work on.

use std::time::Duration;
use swarm_protocol::RoundState;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::config::RoundSyncConfig;
use crate::coordinator::Coordinator;
use crate::transport::Transport;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("round {local_round} not reached within {elapsed:?}")]
    Timeout { local_round: u64, elapsed: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The coordinator is at (or past) our round; we adopted its round.
    Joined(u64),
    /// The coordinator sits on its last round and will not move further.
    FinalRound(u64),
}

/// Doubling delay with a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// The delay to wait now; the following one doubles, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub struct RoundSyncController {
    config: RoundSyncConfig,
    backoff: Backoff,
}

impl RoundSyncController {
    pub fn new(config: RoundSyncConfig) -> Self {
        Self {
            config,
            backoff: Backoff::new(config.check_interval, config.max_check_interval),
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Poll the coordinator until it reaches `state.round`.
    pub async fn await_round<C, T>(
        &mut self,
        coordinator: &C,
        transport: &T,
        state: &mut RoundState,
    ) -> Result<SyncOutcome, SyncError>
    where
        C: Coordinator,
        T: Transport,
    {
        let start = Instant::now();
        let mut fetch_log_time = start;

        while start.elapsed() < self.config.train_timeout {
            let now = Instant::now();
            let _ = transport.visible_addresses(true).await;

            let remote = match coordinator.round_and_stage().await {
                Ok(remote) => remote,
                Err(e) => {
                    if now.duration_since(fetch_log_time) > self.config.log_timeout {
                        tracing::debug!(
                            error = %e,
                            next_check = ?self.config.check_interval,
                            "Could not fetch round and stage"
                        );
                        fetch_log_time = now;
                    }
                    sleep(self.config.check_interval).await;
                    continue;
                }
            };

            if state.catch_up(remote.round) {
                tracing::info!(round = remote.round, "🐝 Joining round");
                self.backoff.reset();
                transport.set_step(remote.round).await;
                return Ok(SyncOutcome::Joined(remote.round));
            }

            let delay = self.backoff.next_delay();
            tracing::info!(
                remote_round = remote.round,
                local_round = state.round,
                next_check = ?delay,
                "Already finished round"
            );
            sleep(delay).await;

            if state.is_final_round(remote.round) {
                tracing::info!(round = remote.round, "Coordinator is on its final round");
                return Ok(SyncOutcome::FinalRound(remote.round));
            }
        }

        tracing::info!("Training timed out!");
        Err(SyncError::Timeout {
            local_round: state.round,
            elapsed: start.elapsed(),
        })
    }
}
