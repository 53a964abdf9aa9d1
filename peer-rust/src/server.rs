use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use swarm_protocol::gossip::GossipResponse;
use swarm_protocol::{GossipMessage, GossipNode};
use tower_http::limit::RequestBodyLimitLayer;

pub struct ServerState {
    pub node: Arc<GossipNode>,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
}

pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/gossip", post(gossip_handler))
        .route("/api/status", get(status_handler))
        .route("/api/ping", post(ping_handler))
        .layer(RequestBodyLimitLayer::new(32 * 1024 * 1024)) // rollout shares can be large
        .with_state(state)
}

fn check_auth(state: &ServerState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let expected = &state.node.config.auth_token;
    if expected.is_empty() {
        return Ok(());
    }
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn gossip_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(msg): Json<GossipMessage>,
) -> Result<Json<GossipResponse>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.node.handle_message(msg).await))
}

async fn status_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    let network = state.node.network_status().await;
    let uptime = Utc::now() - state.started_at;

    Ok(Json(json!({
        "name": state.display_name,
        "uptime_secs": uptime.num_seconds(),
        "network": network,
    })))
}

async fn ping_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(json!({
        "status": "ok",
        "peer": state.node.peer_id(),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_protocol::{GossipConfig, Rollouts};

    async fn spawn_server(token: &str) -> (String, Arc<GossipNode>) {
        let node = Arc::new(GossipNode::new(GossipConfig {
            node_id: "local".into(),
            auth_token: token.into(),
            ..Default::default()
        }));
        let state = Arc::new(ServerState {
            node: node.clone(),
            display_name: "calm-quick-otter".into(),
            started_at: Utc::now(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });
        (format!("http://{addr}"), node)
    }

    #[tokio::test]
    async fn test_gossip_requires_token() {
        let (url, _node) = spawn_server("secret").await;
        let http = reqwest::Client::new();
        let ping = json!({ "type": "Ping", "sender": "remote", "nonce": 7 });

        let resp = http.post(format!("{url}/gossip")).json(&ping).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

        let resp = http
            .post(format!("{url}/gossip"))
            .bearer_auth("secret")
            .json(&ping)
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["nonce"], 7);
    }

    #[tokio::test]
    async fn test_rollout_share_reaches_swarm_states() {
        let (url, node) = spawn_server("").await;
        node.set_step(3).await;
        let msg = GossipMessage::RolloutShare {
            sender: "remote".into(),
            round: 3,
            stage: 0,
            rollouts: Rollouts::new(),
        };

        let resp = reqwest::Client::new()
            .post(format!("{url}/gossip"))
            .json(&msg)
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(node.swarm_states().await.contains_key("remote"));

        let status: Value = reqwest::get(format!("{url}/api/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["name"], "calm-quick-otter");
        assert_eq!(status["network"]["peers_sharing_this_round"], 1);
    }
}
