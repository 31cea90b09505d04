//! Async driver around [`ChatSession`].
//!
//! `ChatClient` owns the connection manager and the backend API. A pump
//! task feeds every connection event into the session; user-facing calls
//! perform the network half of each operation and hand the result back.
//! The session mutex is never held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gather_shared::{ClientFrame, Message, UserIdentity, UserProfile};

use crate::backend::{BackendApi, HttpBackend};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, Subscription};
use crate::error::Result;
use crate::events::EventKind;
use crate::session::{ChatSession, HistoryRequest, Phase};
use crate::transport::{Connector, WsConnector};

pub struct ChatClient {
    local: UserIdentity,
    connection: Arc<ConnectionManager>,
    backend: Arc<dyn BackendApi>,
    session: Arc<Mutex<ChatSession>>,
    phase: watch::Sender<Phase>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn lock(session: &Mutex<ChatSession>) -> MutexGuard<'_, ChatSession> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChatClient {
    pub fn new(
        local: UserIdentity,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn BackendApi>,
        config: &ClientConfig,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(
            connector,
            config.ack_timeout,
            config.event_buffer,
        ));
        let session = ChatSession::new(local.clone(), config.max_content_len);
        let (phase, _) = watch::channel(session.phase());
        Self {
            local,
            connection,
            backend,
            session: Arc::new(Mutex::new(session)),
            phase,
            pump: Mutex::new(None),
        }
    }

    /// WebSocket transport and HTTP backend for the configured server.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let local = config.require_username()?;
        let connector = Arc::new(WsConnector::new(config.ws_url()?));
        let backend = Arc::new(HttpBackend::new(
            config.server_url.clone(),
            config.http_timeout,
        )?);
        Ok(Self::new(local, connector, backend, config))
    }

    pub fn local_user(&self) -> &UserIdentity {
        &self.local
    }

    /// Read-only access to the session state.
    pub fn with_session<R>(&self, f: impl FnOnce(&ChatSession) -> R) -> R {
        f(&lock(&self.session))
    }

    fn session_mut<R>(&self, f: impl FnOnce(&mut ChatSession) -> R) -> R {
        f(&mut lock(&self.session))
    }

    /// Connect and announce the local user.
    ///
    /// Returns once the session has left `Connecting`. After a drop, every
    /// known conversation and the directory are fetched again so pushes
    /// missed in between show up.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_pump();
        let identity = self.session_mut(|s| s.begin_connect());
        self.phase.send_replace(Phase::Connecting);
        let mut phase = self.phase.subscribe();

        self.connection.connect(identity).await?;

        let connection = self.connection.clone();
        let _ = phase
            .wait_for(|p| match p {
                Phase::Connected => true,
                // A teardown of the previous link can be applied after the
                // new one came up; only a dead link ends the wait.
                Phase::Disconnected => !connection.is_connected(),
                Phase::Connecting => false,
            })
            .await;

        let resync = self.session_mut(|s| s.is_connected() && s.take_resync());
        if resync {
            self.resync().await;
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Start the event pump once; it lives as long as the client.
    fn ensure_pump(&self) {
        let mut pump = self.pump.lock().unwrap_or_else(|p| p.into_inner());
        if pump.is_some() {
            return;
        }
        let subscription = self.connection.subscribe_all();
        *pump = Some(tokio::spawn(event_pump(
            subscription,
            self.connection.clone(),
            self.session.clone(),
            self.phase.clone(),
        )));
    }

    /// Open a conversation and load its history.
    ///
    /// A fetch error leaves the locally cached transcript in place.
    pub async fn select_peer(&self, peer: UserIdentity) -> Result<()> {
        let request = self.session_mut(|s| s.select_peer(peer))?;
        let messages = self.fetch_history(&request).await?;
        self.session_mut(|s| s.apply_history(request, messages));
        Ok(())
    }

    /// Send `text` to the selected peer and wait for the server's ack.
    pub async fn send(&self, text: &str) -> Result<Message> {
        let echo = self.session_mut(|s| s.begin_send(text))?;
        let outgoing = echo.message.clone();

        let result = self
            .connection
            .emit_with_ack(move |correlation_id| ClientFrame::SendMessage {
                correlation_id,
                sender_id: outgoing.sender_id,
                receiver_id: outgoing.receiver_id,
                content: outgoing.content,
            })
            .await;

        match result {
            Ok(ack) => Ok(self.session_mut(|s| s.confirm_send(&echo, &ack))),
            Err(e) => {
                warn!(local_id = echo.local_id, error = %e, "Send failed");
                self.session_mut(|s| s.fail_send(echo.local_id));
                Err(e)
            }
        }
    }

    /// Fetch the user list and prefetch every listed conversation.
    ///
    /// Returns the number of users in the directory. Individual history
    /// failures are logged and skipped.
    pub async fn load_directory(&self) -> Result<usize> {
        let users = self.backend.fetch_users().await?;
        let requests = self.session_mut(|s| s.apply_directory(users));
        let count = requests.len();
        self.fetch_all(requests).await;

        info!(users = count, "Loaded user directory");
        Ok(count)
    }

    /// Forget failed sends; returns how many were dropped.
    pub fn clear_failed(&self) -> usize {
        self.session_mut(|s| s.clear_failed())
    }

    /// Refresh the directory and every known conversation.
    async fn resync(&self) {
        match self.backend.fetch_users().await {
            Ok(users) => {
                self.session_mut(|s| s.apply_directory(users));
            }
            Err(e) => warn!(error = %e, "Directory refresh failed"),
        }
        let requests = self.session_mut(|s| s.resync_requests());
        info!(conversations = requests.len(), "Resynchronizing conversations");
        self.fetch_all(requests).await;
    }

    /// Run history fetches concurrently. Failures are logged and skipped.
    async fn fetch_all(&self, requests: Vec<HistoryRequest>) {
        let fetches = requests.into_iter().map(|request| async move {
            let result = self.fetch_history(&request).await;
            (request, result)
        });
        for (request, result) in join_all(fetches).await {
            match result {
                Ok(messages) => self.session_mut(|s| s.apply_history(request, messages)),
                Err(e) => warn!(peer = %request.peer, error = %e, "History fetch failed"),
            }
        }
    }

    /// Directory entries matching `term` (case-insensitive).
    pub fn search_users(&self, term: &str) -> Vec<UserProfile> {
        self.with_session(|s| s.directory().search(term).into_iter().cloned().collect())
    }

    /// Raw connection events, for front-ends that render them as they come.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.connection.subscribe(kinds)
    }

    pub fn phase(&self) -> Phase {
        self.with_session(|s| s.phase())
    }

    async fn fetch_history(&self, request: &HistoryRequest) -> Result<Vec<Message>> {
        debug!(peer = %request.peer, "Requesting history");
        self.backend.fetch_history(&self.local, &request.peer).await
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            pump.abort();
        }
    }
}

/// Feeds connection events into the session.
///
/// If the pump falls behind and events are dropped, the link is torn down
/// and the session marked out of sync; the next `connect` refetches state.
async fn event_pump(
    mut subscription: Subscription,
    connection: Arc<ConnectionManager>,
    session: Arc<Mutex<ChatSession>>,
    phase: watch::Sender<Phase>,
) {
    debug!("Session event pump started");

    loop {
        let current = match subscription.next_event().await {
            Ok(Some(event)) => {
                let mut guard = lock(&session);
                guard.handle_event(event);
                guard.phase()
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Session missed connection events, dropping link");
                connection.drop_link("event stream lagged");
                let mut guard = lock(&session);
                guard.mark_out_of_sync("event stream lagged");
                guard.phase()
            }
        };
        phase.send_replace(current);
    }

    debug!("Session event pump stopped");
}
