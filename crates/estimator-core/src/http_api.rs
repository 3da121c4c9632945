// HTTP front end for the request API.
//
// Every action is `POST /api/{action}` with a JSON body. The handler is a
// thin shim over `RequestApi::handle`, so the HTTP and WebSocket transports
// share one repository and one broadcaster.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::api::RequestApi;

pub fn router(api: RequestApi) -> Router {
    Router::new()
        .route("/api/{action}", post(dispatch))
        .route("/healthz", get(health))
        .with_state(api)
}

/// Serve the request API on `listener` until the task is cancelled.
pub async fn serve(listener: TcpListener, api: RequestApi) -> anyhow::Result<()> {
    info!("HTTP API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(api)).await?;
    Ok(())
}

async fn dispatch(
    State(api): State<RequestApi>,
    Path(action): Path<String>,
    body: String,
) -> (StatusCode, Json<Value>) {
    let resp = api.handle(&action, &body).await;
    debug!(action = %action, status = resp.status, "api response");
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(resp.body))
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use serde_json::json;

    use crate::broadcaster::Broadcaster;
    use crate::config::HeartbeatConfig;
    use crate::membership::Membership;
    use crate::store::{RetryPolicy, RoomRepository, SqliteRoomStore};

    async fn spawn_api() -> SocketAddr {
        let store = Arc::new(SqliteRoomStore::open(":memory:").unwrap());
        let repo = Arc::new(RoomRepository::new(store, RetryPolicy::default()));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&repo), HeartbeatConfig::default()));
        let api = RequestApi::new(Membership::new(repo), broadcaster);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, api));
        addr
    }

    async fn post(addr: SocketAddr, action: &str, body: Value) -> (u16, Value) {
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/api/{action}"))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    #[tokio::test]
    async fn login_then_flip_over_http() {
        let addr = spawn_api().await;

        let (status, alice) = post(addr, "login", json!({"room": "abc123", "name": "alice"})).await;
        assert_eq!(status, 200);
        assert_eq!(alice["user"]["isAdmin"], json!(true));

        let (status, _) = post(addr, "flip", json!({"room": "abc123"})).await;
        assert_eq!(status, 200);
        let (_, state) = post(addr, "flipstate", json!({"room": "abc123"})).await;
        assert_eq!(state["revealed"], json!(true));
    }

    #[tokio::test]
    async fn failures_keep_their_status_code() {
        let addr = spawn_api().await;

        let (status, body) = post(addr, "login", json!({"room": "abc123"})).await;
        assert_eq!(status, 400);
        assert_eq!(body["success"], json!(false));

        let (status, _) = post(addr, "vote", json!({"room": "abc123", "id": "user_nope", "vote": 3})).await;
        assert_eq!(status, 404);

        let (status, _) = post(addr, "dance", json!({})).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn health_check_answers() {
        let addr = spawn_api().await;
        let text = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text, "ok");
    }
}
