use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use swarm_protocol::{GameTrees, Rollouts, StageRewards, SwarmStates};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::TrainerConfig;

/// Everything the model side needs to run one stage
#[derive(Debug, Serialize)]
pub struct StageRequest<'a> {
    pub round: u64,
    pub stage: u64,
    pub peer_id: &'a str,
    pub trees: &'a GameTrees,
    pub swarm_states: &'a SwarmStates,
}

#[derive(Debug, Default, Deserialize)]
pub struct StageOutput {
    #[serde(default)]
    pub rewards: StageRewards,
    #[serde(default)]
    pub rollouts: Rollouts,
}

/// Runs generation, evaluation and the policy update for a stage.
pub trait Trainer {
    async fn train_stage(&self, request: &StageRequest<'_>) -> Result<StageOutput>;
}

/// Trainer living in an external program, one process per stage.
///
/// The request goes to stdin as a single JSON line; the last stdout line that
/// parses as a JSON object is the stage output.
pub struct CommandTrainer {
    config: TrainerConfig,
}

impl CommandTrainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }
}

impl Trainer for CommandTrainer {
    async fn train_stage(&self, request: &StageRequest<'_>) -> Result<StageOutput> {
        let mut body = serde_json::to_vec(request).context("Failed to encode stage request")?;
        body.push(b'\n');

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(
            round = request.round,
            stage = request.stage,
            program = %self.config.program,
            "Spawning trainer"
        );
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn trainer {}", self.config.program))?;

        let mut stdin = child.stdin.take().context("Trainer stdin unavailable")?;
        let stdout = child.stdout.take().context("Trainer stdout unavailable")?;
        let stderr = child.stderr.take().context("Trainer stderr unavailable")?;

        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&body).await {
                tracing::debug!(error = %e, "Trainer closed stdin early");
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut lines = Vec::new();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!("trainer: {line}");
                lines.push(line);
            }
            lines
        });

        let run = async {
            let mut last_object = None;
            let mut reader = BufReader::new(stdout).lines();
            while let Some(line) = reader.next_line().await? {
                if line.contains("Round") || line.contains("Stage") || line.contains("reward") {
                    tracing::info!("{line}");
                }
                if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(&line) {
                    last_object = Some(value);
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, last_object))
        };

        let outcome = tokio::time::timeout(self.config.stage_timeout, run).await;
        let (status, last_object) = match outcome {
            Ok(result) => result.context("Failed to read trainer output")?,
            Err(_) => {
                tracing::warn!(
                    round = request.round,
                    stage = request.stage,
                    "Stage timed out, killing trainer"
                );
                let _ = child.kill().await;
                anyhow::bail!(
                    "Stage {} timed out after {:?}",
                    request.stage,
                    self.config.stage_timeout
                );
            }
        };

        let stderr_lines = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let tail: Vec<_> = stderr_lines.iter().rev().take(5).rev().cloned().collect();
            anyhow::bail!("Trainer exited with {status}: {}", tail.join("\n"));
        }

        let output = last_object.context("Trainer printed no stage output")?;
        serde_json::from_value(output).context("Malformed stage output")
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out scripted stage outputs; `None` entries fail the stage.
    /// Requests are kept as `(round, stage, trees held)`.
    #[derive(Default)]
    pub struct ScriptedTrainer {
        pub outputs: Mutex<VecDeque<Option<StageOutput>>>,
        pub requests: Mutex<Vec<(u64, u64, usize)>>,
    }

    impl ScriptedTrainer {
        pub fn new(outputs: impl IntoIterator<Item = Option<StageOutput>>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into_iter().collect()),
                ..Default::default()
            }
        }
    }

    impl Trainer for ScriptedTrainer {
        async fn train_stage(&self, request: &StageRequest<'_>) -> Result<StageOutput> {
            self.requests
                .lock()
                .unwrap()
                .push((request.round, request.stage, request.trees.len()));
            match self.outputs.lock().unwrap().pop_front() {
                Some(Some(output)) => Ok(output),
                _ => anyhow::bail!("scripted stage failure"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use swarm_protocol::BatchId;

    fn shell(script: &str, timeout: Duration) -> CommandTrainer {
        CommandTrainer::new(TrainerConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: None,
            stage_timeout: timeout,
        })
    }

    async fn run(trainer: &CommandTrainer) -> Result<StageOutput> {
        let trees = GameTrees::new();
        let swarm = SwarmStates::new();
        trainer
            .train_stage(&StageRequest {
                round: 4,
                stage: 0,
                peer_id: "me",
                trees: &trees,
                swarm_states: &swarm,
            })
            .await
    }

    #[tokio::test]
    async fn test_last_json_line_is_the_output() {
        let trainer = shell(
            r#"read -r req
echo "Round 4 Stage 0 starting"
echo '{"rewards": {"nobody": {}}}'
echo "$req" | grep -q '"peer_id":"me"' && echo '{"rewards": {"me": {"7": [[1.5, 0.5]]}}, "rollouts": {}}'"#,
            Duration::from_secs(10),
        );
        let output = run(&trainer).await.unwrap();
        let mine = output.rewards.get("me").unwrap();
        assert_eq!(mine[&BatchId(7)], vec![vec![1.5, 0.5]]);
        assert!(output.rollouts.is_empty());
    }

    #[tokio::test]
    async fn test_failed_exit_carries_stderr() {
        let trainer = shell("echo 'CUDA out of memory' >&2; exit 3", Duration::from_secs(10));
        let err = run(&trainer).await.unwrap_err().to_string();
        assert!(err.contains("CUDA out of memory"), "{err}");
    }

    #[tokio::test]
    async fn test_missing_output_is_an_error() {
        let trainer = shell("echo 'Stage finished without a summary'", Duration::from_secs(10));
        assert!(run(&trainer).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_stage_is_killed() {
        let trainer = shell("sleep 30", Duration::from_millis(200));
        let err = run(&trainer).await.unwrap_err().to_string();
        assert!(err.contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_program_fails_to_spawn() {
        let trainer = CommandTrainer::new(TrainerConfig {
            program: "definitely-not-a-trainer-binary".into(),
            args: vec![],
            working_dir: None,
            stage_timeout: Duration::from_secs(1),
        });
        assert!(run(&trainer).await.is_err());
    }
}
