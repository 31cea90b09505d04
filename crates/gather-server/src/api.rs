use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::Method,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use gather_shared::constants::{CHAT_WS_PATH, HISTORY_PATH, USERS_PATH};
use gather_shared::{ClientFrame, Message, ServerFrame, UserIdentity, UserProfile};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{ChatHub, SocketId};

/// Per-socket outbound queue depth.
const SOCKET_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ChatHub>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let hub = ChatHub::new(config.seed_users.iter().cloned(), config.max_message_len);
        Self {
            hub: Arc::new(hub),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route(USERS_PATH, get(list_users))
        .route(&format!("{HISTORY_PATH}/:a/:b"), get(conversation_history))
        .route(CHAT_WS_PATH, get(chat_socket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online: usize,
    max_message_len: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online: state.hub.online().await.len(),
        max_message_len: state.config.max_message_len,
    })
}

async fn list_users(State(state): State<AppState>) -> Json<Vec<UserProfile>> {
    Json(state.hub.users().await)
}

async fn conversation_history(
    State(state): State<AppState>,
    Path((a, b)): Path<(String, String)>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let a = UserIdentity::parse(&a)?;
    let b = UserIdentity::parse(&b)?;
    Ok(Json(state.hub.history_between(&a, &b).await))
}

async fn chat_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<ChatHub>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(SOCKET_BUFFER);
    let id = hub.register(tx.clone()).await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(socket = id, error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(socket = id, error = %e, "WebSocket receive failed");
                break;
            }
        };

        match ClientFrame::from_json(&text) {
            Ok(frame) => handle_frame(&hub, id, &tx, frame).await,
            Err(e) => warn!(socket = id, error = %e, "Ignoring malformed client frame"),
        }
    }

    hub.leave(id).await;
    writer.abort();
}

async fn handle_frame(
    hub: &ChatHub,
    id: SocketId,
    tx: &mpsc::Sender<ServerFrame>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Join { identity } => hub.join(id, identity).await,
        ClientFrame::SendMessage {
            correlation_id,
            sender_id,
            receiver_id,
            content,
        } => {
            if let Err(e) = hub
                .send_message(id, correlation_id, sender_id, receiver_id, &content)
                .await
            {
                debug!(socket = id, correlation_id, error = %e, "Rejected message");
                let nack = ServerFrame::Nack {
                    correlation_id,
                    reason: e.to_string(),
                };
                let _ = tx.send(nack).await;
            }
        }
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use gather_client::{
        BackendApi, ChatClient, ChatSession, ClientConfig, ClientError, HttpBackend, Phase,
    };

    fn user(name: &str) -> UserIdentity {
        UserIdentity::parse(name).unwrap()
    }

    async fn spawn_server(config: ServerConfig) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(AppState::new(config));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client_config(addr: SocketAddr, name: &str) -> ClientConfig {
        ClientConfig {
            server_url: format!("http://{addr}"),
            username: Some(user(name)),
            ack_timeout: Duration::from_secs(2),
            http_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    async fn until(client: &ChatClient, check: impl Fn(&ChatSession) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.with_session(&check) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session never reached the expected state");
    }

    #[tokio::test]
    async fn test_rest_endpoints() {
        let addr = spawn_server(ServerConfig {
            seed_users: vec![user("alice"), user("bob")],
            ..ServerConfig::default()
        })
        .await;
        let backend = HttpBackend::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();

        let users: Vec<String> = backend
            .fetch_users()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.username.to_string())
            .collect();
        assert_eq!(users, vec!["alice", "bob"]);

        let history = backend
            .fetch_history(&user("alice"), &user("bob"))
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_chat_between_two_clients() {
        let addr = spawn_server(ServerConfig::default()).await;

        let u2 = ChatClient::from_config(&client_config(addr, "u2")).unwrap();
        u2.connect().await.unwrap();
        assert_eq!(u2.phase(), Phase::Connected);

        let u1 = ChatClient::from_config(&client_config(addr, "u1")).unwrap();
        u1.connect().await.unwrap();
        until(&u1, |s| s.is_online(&user("u2"))).await;
        until(&u2, |s| s.is_online(&user("u1"))).await;

        assert_eq!(u1.load_directory().await.unwrap(), 1);
        u1.select_peer(user("u2")).await.unwrap();
        let sent = u1.send("hello").await.unwrap();
        assert!(sent.id.is_some());

        until(&u2, |s| s.unread_count(&user("u1")) == 1).await;
        u2.with_session(|s| {
            let last = s.last_message(&user("u1")).unwrap();
            assert_eq!(last.content, "hello");
            assert_eq!(last.id, sent.id);
        });
        u1.with_session(|s| {
            assert_eq!(s.transcript(), &[sent.clone()]);
            assert_eq!(s.unread_count(&user("u2")), 0);
        });

        // History reload sees the same single message.
        u2.select_peer(user("u1")).await.unwrap();
        u2.with_session(|s| {
            assert_eq!(s.transcript().len(), 1);
            assert_eq!(s.unread_count(&user("u1")), 0);
        });

        u2.disconnect();
        until(&u1, |s| !s.is_online(&user("u2"))).await;
    }

    #[tokio::test]
    async fn test_rejected_send_surfaces_as_error() {
        let addr = spawn_server(ServerConfig {
            max_message_len: 3,
            ..ServerConfig::default()
        })
        .await;

        // Client allows longer messages than the relay does.
        let u1 = ChatClient::from_config(&client_config(addr, "u1")).unwrap();
        u1.connect().await.unwrap();
        u1.select_peer(user("u2")).await.unwrap();

        let err = u1.send("too long").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
        u1.with_session(|s| {
            assert!(s.transcript().is_empty());
            assert_eq!(s.pending_sends().len(), 1);
        });
    }
}
