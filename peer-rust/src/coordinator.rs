use serde::{Deserialize, Deserializer, Serialize};
use swarm_protocol::{Submission, WinnerAnnouncement};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("coordinator rejected {endpoint}: HTTP {status}")]
    Rejected {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("coordinator sent a malformed {endpoint} response: {source}")]
    Malformed {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Round and stage as announced by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAndStage {
    #[serde(deserialize_with = "canonical_u64")]
    pub round: u64,
    #[serde(deserialize_with = "canonical_u64")]
    pub stage: u64,
}

// Contract reads come back as numbers or decimal strings depending on the
// bridge in front of the chain; both collapse to u64 here and nowhere else.
fn canonical_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// The external authority of record for rounds, rewards and winners.
///
/// Calls are single attempts; retry policy belongs to the caller.
pub trait Coordinator {
    async fn register_peer(&self, peer_id: &str) -> Result<(), CoordinatorError>;
    async fn round_and_stage(&self) -> Result<RoundAndStage, CoordinatorError>;
    async fn submit_reward(&self, submission: &Submission) -> Result<(), CoordinatorError>;
    async fn submit_winners(
        &self,
        announcement: &WinnerAnnouncement,
    ) -> Result<(), CoordinatorError>;
}

/// Coordinator reached through its HTTP bridge
pub struct HttpCoordinator {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPeer<'a> {
    peer_id: &'a str,
}

impl HttpCoordinator {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<B: Serialize>(
        &self,
        endpoint: &'static str,
        body: &B,
    ) -> Result<(), CoordinatorError> {
        let url = format!("{}/api/{}", self.base_url, endpoint);
        let resp = self.http.post(&url).json(body).send().await?;
        if !resp.status().is_success() {
            return Err(CoordinatorError::Rejected {
                endpoint,
                status: resp.status(),
            });
        }
        Ok(())
    }
}

impl Coordinator for HttpCoordinator {
    async fn register_peer(&self, peer_id: &str) -> Result<(), CoordinatorError> {
        self.post("register-peer", &RegisterPeer { peer_id }).await
    }

    async fn round_and_stage(&self) -> Result<RoundAndStage, CoordinatorError> {
        let url = format!("{}/api/round-and-stage", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(CoordinatorError::Rejected {
                endpoint: "round-and-stage",
                status: resp.status(),
            });
        }
        resp.json().await.map_err(|source| CoordinatorError::Malformed {
            endpoint: "round-and-stage",
            source,
        })
    }

    async fn submit_reward(&self, submission: &Submission) -> Result<(), CoordinatorError> {
        self.post("submit-reward", submission).await
    }

    async fn submit_winners(
        &self,
        announcement: &WinnerAnnouncement,
    ) -> Result<(), CoordinatorError> {
        self.post("submit-winner", announcement).await
    }
}
