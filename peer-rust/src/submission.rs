//! Batched reward submission.
//!
//! Every round's value is queued; the queue is flushed to the coordinator at
//! most once per `submit_frequency`, counted from the last flush that went
//! through. A flush is one reward report carrying the sum of the queue plus a
//! winner vote for the round.

use chrono::{DateTime, Utc};
use std::time::Duration;
use swarm_protocol::{PeerId, RewardLedger, RoundState, Submission, WinnerAnnouncement};
use thiserror::Error;

use crate::config::SubmissionConfig;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::health::HealthNotifier;
use crate::rewards::RewardAggregator;

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("{call} failed after {attempts} attempts")]
    RetriesExhausted {
        call: &'static str,
        attempts: u32,
        #[source]
        source: CoordinatorError,
    },
}

/// Wall-clock source for the flush timer
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

enum Call<'a> {
    Reward(&'a Submission),
    Winners(&'a WinnerAnnouncement),
}

impl Call<'_> {
    fn name(&self) -> &'static str {
        match self {
            Call::Reward(_) => "submit_reward",
            Call::Winners(_) => "submit_winners",
        }
    }

    async fn send<C: Coordinator>(&self, coordinator: &C) -> Result<(), CoordinatorError> {
        match self {
            Call::Reward(submission) => coordinator.submit_reward(submission).await,
            Call::Winners(announcement) => coordinator.submit_winners(announcement).await,
        }
    }
}

async fn with_retries<C: Coordinator>(
    coordinator: &C,
    call: Call<'_>,
    max_attempts: u32,
) -> Result<(), SubmissionError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call.send(coordinator).await {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= max_attempts => {
                tracing::error!(
                    call = call.name(),
                    attempts = attempt,
                    error = %source,
                    "Coordinator call failed, giving up on this flush"
                );
                return Err(SubmissionError::RetriesExhausted {
                    call: call.name(),
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                tracing::warn!(call = call.name(), attempt, error = %e, "Coordinator call failed");
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// No agent produced rewards this round; nothing was queued.
    NoRewards,
    /// Queued, waiting for the submit window.
    Deferred { queued: u64, pending_total: u64 },
    Flushed { amount: u64, winner: PeerId },
}

pub struct SubmissionGate<K: Clock = SystemClock> {
    peer_id: PeerId,
    config: SubmissionConfig,
    aggregator: RewardAggregator,
    pending: Vec<u64>,
    batched_signal: u64,
    last_flush: DateTime<Utc>,
    submitted_this_round: bool,
    notifier: HealthNotifier,
    clock: K,
}

impl SubmissionGate<SystemClock> {
    pub fn new(
        peer_id: impl Into<PeerId>,
        config: SubmissionConfig,
        notifier: HealthNotifier,
    ) -> Self {
        Self::with_clock(peer_id, config, notifier, SystemClock)
    }
}

impl<K: Clock> SubmissionGate<K> {
    /// The flush window opens `submit_frequency` after construction.
    pub fn with_clock(
        peer_id: impl Into<PeerId>,
        config: SubmissionConfig,
        notifier: HealthNotifier,
        clock: K,
    ) -> Self {
        let last_flush = clock.now();
        Self {
            peer_id: peer_id.into(),
            config,
            aggregator: RewardAggregator::new(),
            pending: Vec::new(),
            batched_signal: 0,
            last_flush,
            submitted_this_round: false,
            notifier,
            clock,
        }
    }

    pub fn pending(&self) -> &[u64] {
        &self.pending
    }

    pub fn batched_signal(&self) -> u64 {
        self.batched_signal
    }

    pub fn last_flush(&self) -> DateTime<Utc> {
        self.last_flush
    }

    pub fn submitted_this_round(&self) -> bool {
        self.submitted_this_round
    }

    pub fn aggregator(&self) -> &RewardAggregator {
        &self.aggregator
    }

    fn since_last_flush(&self) -> Duration {
        (self.clock.now() - self.last_flush)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn flushed(&mut self) {
        self.last_flush = self.clock.now();
        self.pending.clear();
        self.batched_signal = 0;
        self.submitted_this_round = true;
    }

    /// Queue this round's value and flush the queue if the window is open.
    pub async fn on_rewards_updated<C: Coordinator>(
        &mut self,
        coordinator: &C,
        ledger: &RewardLedger,
        state: &RoundState,
    ) -> Result<GateDecision, SubmissionError> {
        let totals = ledger.totals_by_agent(state.stage);
        if totals.is_empty() {
            tracing::warn!(round = state.round, "No rewards recorded this round");
            return Ok(GateDecision::NoRewards);
        }

        let value = self.aggregator.aggregate(&totals, &self.peer_id, state.round);
        self.pending.push(value);
        self.batched_signal = self.batched_signal.saturating_add(value);

        let pending_total = self.pending.iter().fold(0u64, |acc, v| acc.saturating_add(*v));
        if self.since_last_flush() < self.config.submit_frequency {
            tracing::info!(
                round = state.round,
                queued = value,
                pending = pending_total,
                "Reward queued until the next submit window"
            );
            return Ok(GateDecision::Deferred {
                queued: value,
                pending_total,
            });
        }

        let winner = totals
            .winner()
            .map(|(agent, _)| agent.to_string())
            .unwrap_or_else(|| self.peer_id.clone());

        let submission = Submission::new(state.round, pending_total, self.peer_id.as_str());
        with_retries(coordinator, Call::Reward(&submission), self.config.max_attempts).await?;

        let announcement =
            WinnerAnnouncement::single(state.round, winner.as_str(), self.peer_id.as_str());
        with_retries(coordinator, Call::Winners(&announcement), self.config.max_attempts).await?;

        self.flushed();
        self.notifier.notify();
        tracing::info!(
            round = state.round,
            amount = pending_total,
            winner = %winner,
            "🏆 Rewards submitted"
        );

        Ok(GateDecision::Flushed {
            amount: pending_total,
            winner,
        })
    }

    /// Last-chance flush once the round has advanced. Single attempts;
    /// returns whether anything was submitted.
    pub async fn try_flush_if_not_yet_submitted<C: Coordinator>(
        &mut self,
        coordinator: &C,
        ledger: &RewardLedger,
        state: &RoundState,
    ) -> bool {
        if self.submitted_this_round || self.since_last_flush() <= self.config.submit_frequency {
            return false;
        }

        let winner = ledger
            .totals_by_agent(state.max_stage)
            .winner()
            .map(|(agent, _)| agent.to_string())
            .unwrap_or_else(|| self.peer_id.clone());

        let submission = Submission::new(state.round, self.batched_signal, self.peer_id.as_str());
        if let Err(e) = coordinator.submit_reward(&submission).await {
            tracing::debug!(round = state.round, error = %e, "Fallback reward submission failed");
            return false;
        }

        let announcement =
            WinnerAnnouncement::single(state.round, winner.as_str(), self.peer_id.as_str());
        if let Err(e) = coordinator.submit_winners(&announcement).await {
            tracing::debug!(round = state.round, error = %e, "Fallback winner submission failed");
            return false;
        }

        tracing::info!(
            round = state.round,
            amount = submission.amount,
            winner = %winner,
            "Rewards submitted on round change"
        );
        self.flushed();
        true
    }

    /// Forget the submitted mark once the next round has been joined.
    pub fn start_round(&mut self) {
        self.submitted_this_round = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::hours;
    use crate::coordinator::testing::MockCoordinator;
    use axum::{http::StatusCode, routing::post, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use swarm_protocol::{BatchId, StageRewards};

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Utc::now())))
        }

        fn advance(&self, h: f64) {
            let step = chrono::Duration::from_std(hours(h)).unwrap();
            *self.0.lock().unwrap() += step;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn gate(clock: &ManualClock) -> SubmissionGate<ManualClock> {
        SubmissionGate::with_clock(
            "me",
            SubmissionConfig::default(),
            HealthNotifier::disabled(),
            clock.clone(),
        )
    }

    fn ledger(entries: &[(&str, f64)]) -> RewardLedger {
        let mut stage = StageRewards::new();
        for (agent, reward) in entries {
            stage.push(agent, BatchId(1), vec![vec![*reward]]);
        }
        let mut ledger = RewardLedger::new();
        ledger.record_stage(0, stage);
        ledger
    }

    fn state(round: u64) -> RoundState {
        RoundState {
            round,
            stage: 1,
            max_round: 100,
            max_stage: 1,
        }
    }

    #[tokio::test]
    async fn test_queue_flushes_after_window() {
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = gate(&clock);

        let d = gate
            .on_rewards_updated(&coordinator, &ledger(&[("me", 9.0)]), &state(1))
            .await
            .unwrap();
        assert_eq!(d, GateDecision::Deferred { queued: 10, pending_total: 10 });

        clock.advance(1.0);
        let d = gate
            .on_rewards_updated(&coordinator, &ledger(&[("me", 3.0)]), &state(2))
            .await
            .unwrap();
        assert_eq!(d, GateDecision::Deferred { queued: 4, pending_total: 14 });

        let bob_only = ledger(&[("me", 0.0), ("bob", 2.0)]);
        clock.advance(1.0);
        let d = gate.on_rewards_updated(&coordinator, &bob_only, &state(3)).await.unwrap();
        assert_eq!(d, GateDecision::Deferred { queued: 0, pending_total: 14 });
        assert_eq!(gate.aggregator().cache().len(), 1);

        clock.advance(1.1);
        let d = gate.on_rewards_updated(&coordinator, &bob_only, &state(4)).await.unwrap();
        assert_eq!(
            d,
            GateDecision::Flushed { amount: 15, winner: "bob".into() }
        );

        assert_eq!(coordinator.submitted_amounts(), vec![15]);
        let winners = coordinator.winners.lock().unwrap();
        assert_eq!(winners[0], WinnerAnnouncement::single(4, "bob", "me"));
        assert!(gate.pending().is_empty());
        assert_eq!(gate.batched_signal(), 0);
        assert_eq!(gate.last_flush(), clock.now());
        assert!(gate.submitted_this_round());
    }

    #[tokio::test]
    async fn test_at_most_one_flush_per_window() {
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = gate(&clock);

        clock.advance(3.0);
        let d = gate
            .on_rewards_updated(&coordinator, &ledger(&[("me", 1.0)]), &state(1))
            .await
            .unwrap();
        assert!(matches!(d, GateDecision::Flushed { amount: 2, .. }));

        clock.advance(2.9);
        let d = gate
            .on_rewards_updated(&coordinator, &ledger(&[("me", 1.0)]), &state(2))
            .await
            .unwrap();
        assert!(matches!(d, GateDecision::Deferred { .. }));
        assert_eq!(coordinator.submitted_amounts(), vec![2]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_queue_and_timer() {
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = gate(&clock);
        let started = gate.last_flush();

        clock.advance(4.0);
        coordinator.fail_rewards(3);
        let err = gate
            .on_rewards_updated(&coordinator, &ledger(&[("me", 4.0)]), &state(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::RetriesExhausted { call: "submit_reward", attempts: 3, .. }
        ));
        assert_eq!(*coordinator.reward_calls.lock().unwrap(), 3);
        assert_eq!(gate.pending(), &[5]);
        assert_eq!(gate.last_flush(), started);
        assert!(coordinator.winners.lock().unwrap().is_empty());

        // window is still open, so the next round flushes both values
        let d = gate
            .on_rewards_updated(&coordinator, &ledger(&[("me", 1.0)]), &state(2))
            .await
            .unwrap();
        assert!(matches!(d, GateDecision::Flushed { amount: 7, .. }));
    }

    #[tokio::test]
    async fn test_winner_retried_until_success() {
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = gate(&clock);

        clock.advance(3.5);
        coordinator.fail_winners(2);
        let d = gate
            .on_rewards_updated(&coordinator, &ledger(&[("amy", 5.0), ("me", 5.0)]), &state(8))
            .await
            .unwrap();
        assert_eq!(d, GateDecision::Flushed { amount: 6, winner: "amy".into() });
        assert_eq!(coordinator.winners.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_ledger_queues_nothing() {
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = gate(&clock);

        clock.advance(5.0);
        let d = gate
            .on_rewards_updated(&coordinator, &RewardLedger::new(), &state(1))
            .await
            .unwrap();
        assert_eq!(d, GateDecision::NoRewards);
        assert!(gate.pending().is_empty());
        assert!(gate.aggregator().cache().is_empty());
        assert_eq!(*coordinator.reward_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fallback_flushes_batched_signal() {
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = gate(&clock);

        gate.on_rewards_updated(&coordinator, &ledger(&[("me", 2.0)]), &state(1)).await.unwrap();
        let next = state(2);
        let empty = RewardLedger::new();

        // exactly at the window edge nothing happens
        clock.advance(3.0);
        assert!(!gate.try_flush_if_not_yet_submitted(&coordinator, &empty, &next).await);

        clock.advance(0.1);
        assert!(gate.try_flush_if_not_yet_submitted(&coordinator, &empty, &next).await);
        assert_eq!(coordinator.submitted_amounts(), vec![3]);
        assert_eq!(
            coordinator.winners.lock().unwrap()[0],
            WinnerAnnouncement::single(2, "me", "me")
        );
        assert!(gate.pending().is_empty());

        // already submitted this round
        clock.advance(4.0);
        assert!(!gate.try_flush_if_not_yet_submitted(&coordinator, &empty, &next).await);
        gate.start_round();
        assert!(gate.try_flush_if_not_yet_submitted(&coordinator, &empty, &next).await);
        assert_eq!(coordinator.submitted_amounts(), vec![3, 0]);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_single_attempt() {
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = gate(&clock);
        gate.on_rewards_updated(&coordinator, &ledger(&[("me", 2.0)]), &state(1)).await.unwrap();

        clock.advance(3.5);
        coordinator.fail_rewards(1);
        let empty = RewardLedger::new();
        assert!(!gate.try_flush_if_not_yet_submitted(&coordinator, &empty, &state(2)).await);
        assert_eq!(*coordinator.reward_calls.lock().unwrap(), 1);
        assert_eq!(gate.batched_signal(), 3);
        assert!(!gate.submitted_this_round());
    }

    #[tokio::test]
    async fn test_huge_rewards_saturate_instead_of_overflowing() {
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = gate(&clock);
        let jackpot = ledger(&[("me", 1e300)]);

        let d = gate.on_rewards_updated(&coordinator, &jackpot, &state(0)).await.unwrap();
        assert_eq!(d, GateDecision::Deferred { queued: u64::MAX, pending_total: u64::MAX });

        let d = gate.on_rewards_updated(&coordinator, &jackpot, &state(1)).await.unwrap();
        assert_eq!(d, GateDecision::Deferred { queued: u64::MAX, pending_total: u64::MAX });
        assert_eq!(gate.batched_signal(), u64::MAX);

        clock.advance(3.5);
        let d = gate.on_rewards_updated(&coordinator, &jackpot, &state(2)).await.unwrap();
        assert!(matches!(d, GateDecision::Flushed { amount: u64::MAX, .. }));
        assert_eq!(coordinator.submitted_amounts(), vec![u64::MAX]);
    }

    async fn spawn_health() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/health-check",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/api/health-check"), hits)
    }

    async fn wait_for_hits(hits: &AtomicUsize, want: usize) -> usize {
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) >= want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        hits.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_only_successful_flush_pings_health() {
        let (url, hits) = spawn_health().await;
        let clock = ManualClock::new();
        let coordinator = MockCoordinator::default();
        let mut gate = SubmissionGate::with_clock(
            "me",
            SubmissionConfig::default(),
            HealthNotifier::new(Some(url)),
            clock.clone(),
        );

        clock.advance(3.5);
        coordinator.fail_rewards(3);
        let failed = gate
            .on_rewards_updated(&coordinator, &ledger(&[("me", 1.0)]), &state(1))
            .await;
        assert!(failed.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let d = gate
            .on_rewards_updated(&coordinator, &ledger(&[("me", 1.0)]), &state(2))
            .await
            .unwrap();
        assert!(matches!(d, GateDecision::Flushed { .. }));
        assert_eq!(wait_for_hits(&hits, 1).await, 1);

        // fallback flushes stay quiet
        gate.start_round();
        clock.advance(3.5);
        let empty = RewardLedger::new();
        assert!(gate.try_flush_if_not_yet_submitted(&coordinator, &empty, &state(3)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
