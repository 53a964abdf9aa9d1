use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub coordinator_url: String,
    pub log_dir: PathBuf,
    pub health_url: Option<String>,
    pub max_round: u64,
    pub max_stage: u64,
    pub round_sync: RoundSyncConfig,
    pub submission: SubmissionConfig,
    pub transplant: TransplantConfig,
    pub trainer: TrainerConfig,
}

/// Polling behaviour while waiting for the coordinator to open a round
#[derive(Debug, Clone, Copy)]
pub struct RoundSyncConfig {
    pub check_interval: Duration,
    pub log_timeout: Duration,
    pub max_check_interval: Duration,
    pub train_timeout: Duration,
}

impl Default for RoundSyncConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            log_timeout: Duration::from_secs(10),
            max_check_interval: Duration::from_secs(5 * 60),
            train_timeout: Duration::from_secs(60 * 60 * 24 * 31),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubmissionConfig {
    /// Minimum wall-clock time between successful flushes
    pub submit_frequency: Duration,
    /// Attempts per coordinator call before a flush is abandoned
    pub max_attempts: u32,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            submit_frequency: hours(3.0),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransplantConfig {
    /// Generations every rollout must carry; transplants are off when unset
    pub expected_generations: Option<usize>,
    pub max_transplants: usize,
}

impl Default for TransplantConfig {
    fn default() -> Self {
        Self {
            expected_generations: None,
            max_transplants: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stage_timeout: Duration,
}

pub fn hours(h: f64) -> Duration {
    Duration::from_secs_f64((h * 3600.0).max(0.0))
}

/// Read the peer id stored at `path`, or mint one and store it there.
pub fn load_or_create_peer_id(path: &Path) -> Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let id = existing.trim();
        if swarm_protocol::is_valid_peer_id(id) {
            return Ok(id.to_string());
        }
        anyhow::bail!("Identity file {} holds an invalid peer id", path.display());
    }

    let id = uuid::Uuid::new_v4().simple().to_string();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    std::fs::write(path, &id).with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(id)
}
