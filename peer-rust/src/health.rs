use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_HEALTH_URL: &str = "http://localhost:3000/api/health-check";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(15);

/// Tells a local supervisor that a reward flush went through.
#[derive(Debug, Clone)]
pub struct HealthNotifier {
    url: Option<String>,
    http: reqwest::Client,
}

impl HealthNotifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url: url.filter(|u| !u.trim().is_empty()),
            http: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Fire one POST in the background. Nothing waits on it and nothing is
    /// retried; the handle is only handed out for tests.
    pub fn notify(&self) -> Option<JoinHandle<()>> {
        let url = self.url.clone()?;
        let http = self.http.clone();

        Some(tokio::spawn(async move {
            match http.post(&url).timeout(HEALTH_TIMEOUT).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    tracing::info!(url = %url, "💓 Health check acknowledged");
                }
                Ok(resp) => {
                    tracing::warn!(url = %url, status = %resp.status(), "Health check rejected");
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Health check failed");
                }
            }
        }))
    }
}
