//! Connection manager: one live chat link per session.
//!
//! The manager owns the link returned by a [`Connector`], announces the
//! local identity with a `join` frame, fans inbound server frames out to
//! subscribers as [`ConnectionEvent`]s, and correlates send requests with
//! their acknowledgments. Failures of any kind end in a single
//! `Disconnected` event; there is no automatic reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use gather_shared::{ClientFrame, SendAck, ServerFrame, UserIdentity};

use crate::error::{ClientError, Result};
use crate::events::{ConnectionEvent, EventKind};
use crate::transport::Connector;

enum AckOutcome {
    Accepted(SendAck),
    Rejected(String),
}

struct LiveLink {
    epoch: u64,
    identity: UserIdentity,
    outbound: mpsc::Sender<ClientFrame>,
    tasks: Vec<AbortHandle>,
}

#[derive(Default)]
struct Shared {
    live: Option<LiveLink>,
    epoch: u64,
    next_correlation: u64,
    pending_acks: HashMap<u64, oneshot::Sender<AckOutcome>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the persistent connection to the chat server.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<ConnectionEvent>,
    shared: Arc<Mutex<Shared>>,
    // Held for the whole of `connect` so two callers never both announce.
    connecting: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, ack_timeout: Duration, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            connector,
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
            connecting: tokio::sync::Mutex::new(()),
            ack_timeout,
        }
    }

    /// Open the transport and announce `identity`.
    ///
    /// A link that is already live is torn down first, so the server never
    /// sees two presence announcements from the same session. Concurrent
    /// calls run one after the other.
    pub async fn connect(&self, identity: UserIdentity) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        teardown(&self.shared, &self.events, None, "reconnecting");

        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Failed to open chat connection");
                let _ = self.events.send(ConnectionEvent::Disconnected {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let (outbound, inbound, tasks) = link.into_parts();

        if outbound
            .send(ClientFrame::Join {
                identity: identity.clone(),
            })
            .await
            .is_err()
        {
            for task in tasks {
                task.abort();
            }
            let reason = "link closed before join".to_string();
            let _ = self.events.send(ConnectionEvent::Disconnected {
                reason: reason.clone(),
            });
            return Err(ClientError::Transport(reason));
        }

        let epoch = {
            let mut shared = lock(&self.shared);
            shared.epoch += 1;
            let epoch = shared.epoch;
            shared.live = Some(LiveLink {
                epoch,
                identity: identity.clone(),
                outbound,
                tasks,
            });
            epoch
        };

        info!(identity = %identity, epoch, "Connected to chat server");
        let _ = self.events.send(ConnectionEvent::Connected);

        let reader = tokio::spawn(read_loop(
            inbound,
            self.shared.clone(),
            self.events.clone(),
            epoch,
        ));

        let mut shared = lock(&self.shared);
        match shared.live.as_mut() {
            Some(live) if live.epoch == epoch => live.tasks.push(reader.abort_handle()),
            _ => reader.abort(),
        }

        Ok(())
    }

    /// Tear down the transport. Calling this without a live link is a no-op.
    pub fn disconnect(&self) {
        self.drop_link("disconnect requested");
    }

    /// Tear down the transport, reporting `reason` in the `Disconnected` event.
    pub fn drop_link(&self, reason: &str) {
        teardown(&self.shared, &self.events, None, reason);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).live.is_some()
    }

    /// Identity announced on the live link, if any.
    pub fn identity(&self) -> Option<UserIdentity> {
        lock(&self.shared)
            .live
            .as_ref()
            .map(|live| live.identity.clone())
    }

    /// Send a frame that expects no answer.
    pub async fn emit(&self, frame: ClientFrame) -> Result<()> {
        let outbound = self.outbound()?;
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Send a frame built around a fresh correlation id and wait for the
    /// server's acknowledgment.
    ///
    /// If no answer arrives within the ack timeout the link is considered
    /// dead and torn down.
    pub async fn emit_with_ack(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<SendAck> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let (epoch, outbound, correlation_id) = {
            let mut shared = lock(&self.shared);
            let (epoch, outbound) = match shared.live.as_ref() {
                Some(live) => (live.epoch, live.outbound.clone()),
                None => return Err(ClientError::NotConnected),
            };
            shared.next_correlation += 1;
            let correlation_id = shared.next_correlation;
            shared.pending_acks.insert(correlation_id, reply_tx);
            (epoch, outbound, correlation_id)
        };

        if outbound.send(build(correlation_id)).await.is_err() {
            lock(&self.shared).pending_acks.remove(&correlation_id);
            return Err(ClientError::ConnectionClosed);
        }

        match tokio::time::timeout(self.ack_timeout, reply_rx).await {
            Ok(Ok(AckOutcome::Accepted(ack))) => Ok(ack),
            Ok(Ok(AckOutcome::Rejected(reason))) => Err(ClientError::Rejected(reason)),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                lock(&self.shared).pending_acks.remove(&correlation_id);
                warn!(correlation_id, "No acknowledgment from server, dropping link");
                teardown(
                    &self.shared,
                    &self.events,
                    Some(epoch),
                    "acknowledgment timed out",
                );
                Err(ClientError::AckTimeout(self.ack_timeout.as_secs()))
            }
        }
    }

    /// Subscribe to the given event kinds. Dropping the subscription cancels it.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        Subscription {
            rx: self.events.subscribe(),
            kinds: kinds.to_vec(),
        }
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&EventKind::ALL)
    }

    fn outbound(&self) -> Result<mpsc::Sender<ClientFrame>> {
        lock(&self.shared)
            .live
            .as_ref()
            .map(|live| live.outbound.clone())
            .ok_or(ClientError::NotConnected)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        teardown(&self.shared, &self.events, None, "connection manager dropped");
    }
}

/// A filtered view of the connection's event stream.
pub struct Subscription {
    rx: broadcast::Receiver<ConnectionEvent>,
    kinds: Vec<EventKind>,
}

impl Subscription {
    /// Next matching event, or `None` once the manager is gone.
    ///
    /// Events skipped because this subscriber fell behind are logged and
    /// passed over. Consumers that must see every event use
    /// [`Subscription::next_event`].
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        loop {
            match self.next_event().await {
                Ok(event) => return event,
                Err(e) => warn!(error = %e, "Subscriber fell behind"),
            }
        }
    }

    /// Next matching event, or `None` once the manager is gone.
    ///
    /// Fails with [`ClientError::EventsLagged`] when the broadcast buffer
    /// overran this subscriber; the skipped events are gone and the
    /// subscription resumes at the oldest event still buffered.
    pub async fn next_event(&mut self) -> Result<Option<ConnectionEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.kinds.contains(&event.kind()) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(ClientError::EventsLagged(skipped))
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Explicit cancellation; equivalent to dropping the subscription.
    pub fn cancel(self) {}
}

async fn read_loop(
    mut inbound: mpsc::Receiver<ServerFrame>,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<ConnectionEvent>,
    epoch: u64,
) {
    while let Some(frame) = inbound.recv().await {
        let event = match frame {
            ServerFrame::Ack {
                correlation_id,
                id,
                created_at,
            } => {
                resolve_ack(
                    &shared,
                    correlation_id,
                    AckOutcome::Accepted(SendAck { id, created_at }),
                );
                continue;
            }
            ServerFrame::Nack {
                correlation_id,
                reason,
            } => {
                resolve_ack(&shared, correlation_id, AckOutcome::Rejected(reason));
                continue;
            }
            ServerFrame::PresenceSnapshot { identities } => {
                ConnectionEvent::PresenceSnapshot(identities)
            }
            ServerFrame::PeerOnline { identity } => ConnectionEvent::PeerOnline(identity),
            ServerFrame::PeerOffline { identity } => ConnectionEvent::PeerOffline(identity),
            ServerFrame::MessageReceived { message } => ConnectionEvent::MessageReceived(message),
        };
        let _ = events.send(event);
    }

    teardown(&shared, &events, Some(epoch), "server closed the connection");
}

fn resolve_ack(shared: &Mutex<Shared>, correlation_id: u64, outcome: AckOutcome) {
    let waiter = lock(shared).pending_acks.remove(&correlation_id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => debug!(correlation_id, "Acknowledgment for unknown or expired request"),
    }
}

/// Drop the live link if it matches `epoch` (any link when `None`).
/// Emits `Disconnected` only when a link was actually removed.
fn teardown(
    shared: &Mutex<Shared>,
    events: &broadcast::Sender<ConnectionEvent>,
    epoch: Option<u64>,
    reason: &str,
) -> bool {
    let live = {
        let mut guard = lock(shared);
        let matches = match (&guard.live, epoch) {
            (Some(live), Some(expected)) => live.epoch == expected,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        // Dropping the senders wakes every waiter with ConnectionClosed.
        guard.pending_acks.clear();
        guard.live.take()
    };

    if let Some(live) = live {
        for task in live.tasks {
            task.abort();
        }
        info!(identity = %live.identity, epoch = live.epoch, reason, "Disconnected from chat server");
        let _ = events.send(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
    true
}
