//! # Connection Manager
//!
//! Owns every live session, the peer registry and the negotiation table
//! behind one mutex.
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  connect(endpoint)              accept(channel)                         │
//! │       │ Transport::open              │ (server upgrade)                 │
//! │       ▼ within connect_timeout       │                                  │
//! │  ┌─────────────────────────────────────────────┐                        │
//! │  │ handshake: send register, await register    │ within                 │
//! │  │            (self / org mismatch rejected)   │ handshake_timeout      │
//! │  └──────────────────────┬──────────────────────┘                        │
//! │          failure ───────┤───► channel closed, nothing recorded          │
//! │                         ▼                                               │
//! │  ┌─────────────────────────────────────────────┐                        │
//! │  │ LOCK                                        │                        │
//! │  │  replace + close previous session for peer  │                        │
//! │  │  spawn receive task + heartbeat task        │                        │
//! │  │  registry.upsert → recompute leader         │                        │
//! │  │  push peerList to every member              │                        │
//! │  └─────────────────────────────────────────────┘                        │
//! │                                                                         │
//! │  receive task: every message ──► liveness touch                         │
//! │                peerList      ──► reported view                          │
//! │                targeted else ──► relay (or drop if target unknown)      │
//! │                negotiation   ──► NegotiationTable                       │
//! │                anything else ──► SyncEvent::Message                     │
//! │                stream end    ──► remove (same session only), recompute  │
//! │                silent for idle_timeout ──► same as stream end           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes inside the lock only enqueue onto bounded channels; the socket
//! work happens in each channel's pump. Nothing here reconnects on its own.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use stagelink_core::validation::validate_peer_id;
use stagelink_core::{DisplayClass, LeaderStatus, PeerId, PeerIdentity, PeerInfo, PeerRole};

use crate::error::{SyncError, SyncResult};
use crate::event::{SyncEvent, EVENT_CHANNEL_CAPACITY};
use crate::liveness::{spawn_heartbeat, LivenessMonitor};
use crate::protocol::{ControlMessage, PeerListPayload, RegisterPayload};
use crate::registry::PeerRegistry;
use crate::signaling::{NegotiationSnapshot, NegotiationTable, Resolution};
use crate::transport::{Channel, ChannelHandle, ConnectionState, Transport};

// =============================================================================
// Settings
// =============================================================================

/// Tunables of the connection manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Sessions that deliver nothing for this long are dropped. Must exceed
    /// the remote heartbeat interval.
    pub idle_timeout: Duration,
    /// Announced in `register` by display nodes.
    pub display_class: Option<DisplayClass>,
    /// Announced in `register`; sessions from another organization are
    /// refused.
    pub org_id: Option<String>,
    /// Port of our own server, announced in `register`.
    pub listen_port: Option<u16>,
    /// Endpoints offered to peers during negotiation.
    pub local_candidates: Vec<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        ManagerSettings {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            display_class: None,
            org_id: None,
            listen_port: None,
            local_candidates: Vec::new(),
        }
    }
}

// =============================================================================
// Peer Connection
// =============================================================================

/// One session with a remote peer. Replaced, never mutated, on reconnect.
#[derive(Debug)]
struct PeerConnection {
    session: u64,
    identity: PeerIdentity,
    display_class: Option<DisplayClass>,
    state: ConnectionState,
    handle: ChannelHandle,
    remote_addr: Option<SocketAddr>,
    endpoint: Option<String>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    receive_task: AbortHandle,
    heartbeat_task: AbortHandle,
}

impl PeerConnection {
    fn is_live(&self) -> bool {
        self.state == ConnectionState::Connected && !self.handle.is_closed()
    }

    /// Closes the channel and stops the session's tasks. The receive task
    /// is left alone when it is the caller.
    fn close(mut self, abort_receiver: bool) {
        self.state = ConnectionState::Disconnected;
        self.handle.close();
        self.heartbeat_task.abort();
        if abort_receiver {
            self.receive_task.abort();
        }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer_id: self.identity.id().to_string(),
            role: self.identity.role(),
            display_name: self.identity.display_name().to_string(),
            display_class: self.display_class,
            state: self.state,
            remote_addr: self.remote_addr,
            endpoint: self.endpoint.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub role: PeerRole,
    pub display_name: String,
    pub display_class: Option<DisplayClass>,
    pub state: ConnectionState,
    pub remote_addr: Option<SocketAddr>,
    /// Endpoint we dialed, for outbound sessions.
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

// =============================================================================
// Shared State
// =============================================================================

struct ManagerState {
    connections: HashMap<PeerId, PeerConnection>,
    registry: PeerRegistry,
    negotiations: NegotiationTable,
    shutting_down: bool,
}

struct Shared {
    identity: PeerIdentity,
    settings: ManagerSettings,
    transport: Arc<dyn Transport>,
    liveness: Option<LivenessMonitor>,
    events: broadcast::Sender<SyncEvent>,
    next_session: AtomicU64,
    state: Mutex<ManagerState>,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Handle to the connection manager. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_id", &self.shared.identity.id())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        identity: PeerIdentity,
        settings: ManagerSettings,
        transport: Arc<dyn Transport>,
        liveness: Option<LivenessMonitor>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = ManagerState {
            connections: HashMap::new(),
            registry: PeerRegistry::new(identity.clone()),
            negotiations: NegotiationTable::new(
                identity.clone(),
                settings.local_candidates.clone(),
            ),
            shutting_down: false,
        };

        ConnectionManager {
            shared: Arc::new(Shared {
                identity,
                settings,
                transport,
                liveness,
                events,
                next_session: AtomicU64::new(1),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.shared.identity
    }

    pub fn local_id(&self) -> &str {
        self.shared.identity.id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    // =========================================================================
    // Opening Sessions
    // =========================================================================

    /// Opens a session to `endpoint` and registers it.
    ///
    /// On any failure no entry is left behind.
    pub async fn connect(&self, endpoint: &str) -> SyncResult<PeerId> {
        self.ensure_running().await?;

        let connect_timeout = self.shared.settings.connect_timeout;
        let mut channel = match timeout(connect_timeout, self.shared.transport.open(endpoint)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint, error = %e, "Connect failed");
                return Err(e);
            }
            Err(_) => {
                warn!(endpoint = %endpoint, "Connect timed out");
                return Err(SyncError::timeout(
                    format!("connect to {}", endpoint),
                    connect_timeout,
                ));
            }
        };

        let register = match self.handshake(&mut channel).await {
            Ok(register) => register,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Handshake failed");
                channel.handle.close();
                return Err(e);
            }
        };

        self.install(channel, register, Some(endpoint.to_string()))
            .await
    }

    /// Registers an inbound session, e.g. from the WebSocket server.
    pub async fn accept(&self, mut channel: Channel) -> SyncResult<PeerId> {
        if let Err(e) = self.ensure_running().await {
            channel.handle.close();
            return Err(e);
        }

        let register = match self.handshake(&mut channel).await {
            Ok(register) => register,
            Err(e) => {
                warn!(addr = ?channel.remote_addr, error = %e, "Inbound handshake failed");
                channel.handle.close();
                return Err(e);
            }
        };

        self.install(channel, register, None).await
    }

    async fn ensure_running(&self) -> SyncResult<()> {
        if self.shared.state.lock().await.shutting_down {
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    /// Exchanges `register` messages. Both sides send first, so neither
    /// waits on the other.
    async fn handshake(&self, channel: &mut Channel) -> SyncResult<RegisterPayload> {
        let settings = &self.shared.settings;
        channel.handle.send(ControlMessage::register(
            &self.shared.identity,
            settings.display_class,
            settings.org_id.clone(),
            settings.listen_port,
        ))?;

        let first = match timeout(settings.handshake_timeout, channel.incoming.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(SyncError::HandshakeFailed(
                    "Channel closed before register".into(),
                ))
            }
            Err(_) => {
                return Err(SyncError::timeout(
                    "register handshake",
                    settings.handshake_timeout,
                ))
            }
        };

        let register = match first {
            ControlMessage::Register(register) => register,
            other => {
                return Err(SyncError::UnexpectedMessageType {
                    expected: "register".into(),
                    actual: other.type_name().into(),
                })
            }
        };

        validate_peer_id(&register.sender_id)?;
        if register.sender_id == self.shared.identity.id() {
            return Err(SyncError::SelfConnection);
        }
        if let (Some(ours), Some(theirs)) = (&settings.org_id, &register.org_id) {
            if ours != theirs {
                return Err(SyncError::HandshakeFailed(format!(
                    "Peer {} belongs to organization {}",
                    register.sender_id, theirs
                )));
            }
        }

        Ok(register)
    }

    async fn install(
        &self,
        channel: Channel,
        register: RegisterPayload,
        endpoint: Option<String>,
    ) -> SyncResult<PeerId> {
        let identity = register.identity();
        let peer_id = identity.id().to_string();
        let Channel {
            handle,
            incoming,
            remote_addr,
        } = channel;

        {
            let mut state = self.shared.state.lock().await;
            if state.shutting_down {
                handle.close();
                return Err(SyncError::ShuttingDown);
            }

            let session = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
            let receive_task = tokio::spawn(receive_loop(
                self.clone(),
                peer_id.clone(),
                session,
                incoming,
                self.shared.settings.idle_timeout,
            ))
            .abort_handle();
            let heartbeat_task = spawn_heartbeat(
                handle.clone(),
                self.local_id().to_string(),
                self.shared.settings.heartbeat_interval,
            )
            .abort_handle();

            let now = Utc::now();
            let connection = PeerConnection {
                session,
                identity: identity.clone(),
                display_class: register.display_class,
                state: ConnectionState::Connected,
                handle,
                remote_addr,
                endpoint,
                created_at: now,
                last_activity: now,
                receive_task,
                heartbeat_task,
            };

            if let Some(previous) = state.connections.insert(peer_id.clone(), connection) {
                info!(peer_id = %peer_id, "Replacing existing session");
                previous.close(true);
            }
            state.registry.upsert(identity);
            state.negotiations.complete(&peer_id);

            info!(
                peer_id = %peer_id,
                role = %register.role,
                name = %register.display_name,
                session,
                "Peer connected"
            );

            self.emit(SyncEvent::ConnectionStateChanged {
                peer_id: peer_id.clone(),
                state: ConnectionState::Connected,
            });
            self.membership_changed(&mut state);
        }

        if let (Some(liveness), Some(addr), Some(port)) =
            (&self.shared.liveness, remote_addr, register.listen_port)
        {
            if let Err(e) = liveness
                .on_address(&peer_id, &addr.ip().to_string(), port)
                .await
            {
                warn!(peer_id = %peer_id, error = %e, "Failed to record display address");
            }
        }

        Ok(peer_id)
    }

    // =========================================================================
    // Tearing Down
    // =========================================================================

    /// Closes the session with `peer_id` and forgets the peer.
    pub async fn disconnect(&self, peer_id: &str) -> SyncResult<()> {
        let mut state = self.shared.state.lock().await;
        let connection = state
            .connections
            .remove(peer_id)
            .ok_or_else(|| SyncError::PeerNotConnected(peer_id.to_string()))?;
        connection.close(true);
        state.registry.remove(peer_id);

        info!(peer_id = %peer_id, "Peer disconnected");
        self.emit(SyncEvent::ConnectionStateChanged {
            peer_id: peer_id.to_string(),
            state: ConnectionState::Disconnected,
        });
        self.membership_changed(&mut state);
        Ok(())
    }

    /// Closes every session and refuses new ones.
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.lock().await;
        let count = self.close_all(&mut state);
        info!(count, "Connection manager shut down");
    }

    /// [`ConnectionManager::shutdown`] for paths that cannot await, such as
    /// `Drop`. When the lock is busy the shutdown is spawned instead.
    pub fn shutdown_now(&self) {
        match self.shared.state.try_lock() {
            Ok(mut state) => {
                let count = self.close_all(&mut state);
                if count > 0 {
                    info!(count, "Connection manager closed on drop");
                }
            }
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let manager = self.clone();
                    runtime.spawn(async move { manager.shutdown().await });
                }
                Err(_) => warn!("Connection manager busy and no runtime to finish shutdown"),
            },
        }
    }

    fn close_all(&self, state: &mut ManagerState) -> usize {
        state.shutting_down = true;

        let connections: Vec<_> = state.connections.drain().collect();
        let count = connections.len();
        for (peer_id, connection) in connections {
            connection.close(true);
            self.emit(SyncEvent::ConnectionStateChanged {
                peer_id,
                state: ConnectionState::Disconnected,
            });
        }
        state.negotiations.clear();
        state.registry.clear();
        count
    }

    async fn on_channel_closed(&self, peer_id: &str, session: u64) {
        let mut state = self.shared.state.lock().await;
        let is_current = state
            .connections
            .get(peer_id)
            .is_some_and(|c| c.session == session);
        if !is_current {
            return;
        }

        if let Some(connection) = state.connections.remove(peer_id) {
            connection.close(false);
        }
        state.registry.mark_disconnected(peer_id);

        info!(peer_id = %peer_id, session, "Session ended");
        self.emit(SyncEvent::ConnectionStateChanged {
            peer_id: peer_id.to_string(),
            state: ConnectionState::Disconnected,
        });
        self.membership_changed(&mut state);
    }

    /// Recomputes the leader, pushes `peerList` and notifies subscribers.
    /// Called with the lock held.
    fn membership_changed(&self, state: &mut ManagerState) {
        let leader_changed = state.registry.recompute();

        let list = state.registry.peer_list_message();
        for (peer_id, connection) in &state.connections {
            if !connection.is_live() {
                continue;
            }
            if let Err(e) = connection.handle.send(list.clone()) {
                debug!(peer_id = %peer_id, error = %e, "peerList not delivered");
            }
        }

        self.emit(SyncEvent::PeersChanged(state.registry.snapshot()));
        if leader_changed {
            let status = state.registry.leader_status();
            info!(
                leader_id = ?status.leader_id,
                am_i_leader = status.am_i_leader,
                "Leader changed"
            );
            self.emit(SyncEvent::LeaderChanged(status));
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Delivers to one connected peer. Returns false, after logging, when
    /// the peer is gone or backed up; nothing is queued for later.
    pub async fn send_to(&self, peer_id: &str, message: ControlMessage) -> bool {
        let state = self.shared.state.lock().await;
        match state.connections.get(peer_id) {
            Some(connection) if connection.is_live() => match connection.handle.send(message) {
                Ok(()) => true,
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "Message not delivered");
                    false
                }
            },
            _ => {
                debug!(
                    peer_id = %peer_id,
                    msg_type = %message.type_name(),
                    "Dropping message for peer that is not connected"
                );
                false
            }
        }
    }

    /// Delivers to every connected peer and returns how many accepted the
    /// message. Peers that are gone or backed up are skipped.
    pub async fn broadcast(&self, message: ControlMessage) -> usize {
        let state = self.shared.state.lock().await;
        let mut delivered = 0;

        for (peer_id, connection) in &state.connections {
            if !connection.is_live() {
                debug!(peer_id = %peer_id, "Skipping peer that is not connected");
                continue;
            }
            match connection.handle.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Broadcast not delivered"),
            }
        }

        debug!(
            msg_type = %message.type_name(),
            delivered,
            total = state.connections.len(),
            "Broadcast"
        );
        delivered
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn handle_inbound(&self, peer_id: &str, session: u64, message: ControlMessage) {
        if let Some(liveness) = &self.shared.liveness {
            if let Err(e) = liveness.on_heartbeat(peer_id).await {
                warn!(peer_id = %peer_id, error = %e, "Failed to record liveness");
            }
        }

        let mut state = self.shared.state.lock().await;
        match state.connections.get_mut(peer_id) {
            Some(connection) if connection.session == session => {
                connection.last_activity = Utc::now();
            }
            _ => return,
        }

        match message {
            ControlMessage::Heartbeat(_) => {
                debug!(peer_id = %peer_id, "Heartbeat");
            }
            ControlMessage::Register(_) => {
                debug!(peer_id = %peer_id, "Ignoring register on established session");
            }
            ControlMessage::PeerList(list) => {
                self.apply_peer_list(&mut state, list);
            }
            message => {
                let local_id = self.local_id();
                if let Some(target) = message.target_id().filter(|t| *t != local_id) {
                    let target = target.to_string();
                    Self::relay(&state, peer_id, &target, message);
                } else if message.is_negotiation() {
                    let replies = state.negotiations.handle(&message);
                    if let Some(connection) = state.connections.get(peer_id) {
                        for reply in replies {
                            if let Err(e) = connection.handle.send(reply) {
                                warn!(peer_id = %peer_id, error = %e, "Negotiation reply not sent");
                            }
                        }
                    }
                } else {
                    debug!(peer_id = %peer_id, msg_type = %message.type_name(), "Message");
                    self.emit(SyncEvent::Message {
                        from: message.sender_id().to_string(),
                        message,
                    });
                }
            }
        }
    }

    fn apply_peer_list(&self, state: &mut ManagerState, list: PeerListPayload) {
        debug!(
            sender = %list.sender_id,
            peers = list.peers.len(),
            leader_id = ?list.leader_id,
            "Reported peer list"
        );
        let peers = list.peers.clone();
        state.registry.apply_reported(list);
        self.emit(SyncEvent::PeersChanged(peers));
    }

    /// Forwards a message addressed to another peer we hold a session with.
    fn relay(state: &ManagerState, from: &str, target: &str, message: ControlMessage) {
        match state.connections.get(target) {
            Some(connection) if connection.is_live() => {
                debug!(from = %from, target = %target, msg_type = %message.type_name(), "Relaying");
                if let Err(e) = connection.handle.send(message) {
                    warn!(target = %target, error = %e, "Relay failed");
                }
            }
            _ => {
                warn!(
                    from = %from,
                    target = %target,
                    msg_type = %message.type_name(),
                    "Dropping message for unknown target"
                );
            }
        }
    }

    // =========================================================================
    // Negotiation
    // =========================================================================

    /// Negotiates a direct session with `target` through a rendezvous peer
    /// (the given one, else the leader, else any connected peer) and
    /// connects to it.
    ///
    /// Resolves to the connected peer id within `within`, or fails with
    /// `NegotiationFailed` / `Timeout`.
    pub async fn negotiate(
        &self,
        target: &str,
        rendezvous: Option<&str>,
        within: Duration,
    ) -> SyncResult<PeerId> {
        let deadline = Instant::now() + within;
        let mut events = self.subscribe();

        let (receiver, session_id) = {
            let mut state = self.shared.state.lock().await;
            if state.shutting_down {
                return Err(SyncError::ShuttingDown);
            }
            if target == self.local_id() {
                return Err(SyncError::SelfConnection);
            }
            if state.connections.get(target).is_some_and(PeerConnection::is_live) {
                return Ok(target.to_string());
            }

            let via = Self::pick_rendezvous(&state, self.local_id(), target, rendezvous)?;
            let handle = state.connections[&via].handle.clone();

            let (messages, receiver) = state.negotiations.begin(target);
            let session_id = state.negotiations.get(target).map(|n| n.session_id);
            for message in messages {
                if let Err(e) = handle.send(message) {
                    state.negotiations.cancel(target);
                    return Err(SyncError::negotiation(
                        target,
                        format!("rendezvous {} unreachable: {}", via, e),
                    ));
                }
            }

            info!(peer_id = %target, via = %via, "Negotiating");
            self.emit(SyncEvent::ConnectionStateChanged {
                peer_id: target.to_string(),
                state: ConnectionState::Negotiating,
            });
            (receiver, session_id)
        };

        let result = self
            .finish_negotiation(target, receiver, &mut events, deadline, within)
            .await;

        if let Err(e) = &result {
            warn!(peer_id = %target, error = %e, "Negotiation failed");
            let mut state = self.shared.state.lock().await;
            let same_session = state
                .negotiations
                .get(target)
                .map(|n| n.session_id)
                .is_some_and(|s| Some(s) == session_id);
            if same_session {
                state.negotiations.cancel(target);
            }
            self.emit(SyncEvent::ConnectionStateChanged {
                peer_id: target.to_string(),
                state: ConnectionState::Failed,
            });
        }
        result
    }

    fn pick_rendezvous(
        state: &ManagerState,
        local_id: &str,
        target: &str,
        requested: Option<&str>,
    ) -> SyncResult<PeerId> {
        let live = |id: &str| state.connections.get(id).is_some_and(PeerConnection::is_live);

        if let Some(requested) = requested {
            return if live(requested) {
                Ok(requested.to_string())
            } else {
                Err(SyncError::PeerNotConnected(requested.to_string()))
            };
        }

        if let Some(leader) = state.registry.leader_id() {
            if leader != local_id && leader != target && live(leader) {
                return Ok(leader.to_string());
            }
        }

        let mut candidates: Vec<&PeerId> = state
            .connections
            .iter()
            .filter(|(id, c)| id.as_str() != target && c.is_live())
            .map(|(id, _)| id)
            .collect();
        candidates.sort();
        candidates
            .first()
            .map(|id| id.to_string())
            .ok_or(SyncError::NoRendezvous)
    }

    async fn finish_negotiation(
        &self,
        target: &str,
        receiver: tokio::sync::oneshot::Receiver<Resolution>,
        events: &mut broadcast::Receiver<SyncEvent>,
        deadline: Instant,
        within: Duration,
    ) -> SyncResult<PeerId> {
        let resolution = match timeout_at(deadline, receiver).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => {
                return Err(SyncError::negotiation(
                    target,
                    "superseded by another negotiation",
                ))
            }
            Err(_) => {
                return Err(SyncError::timeout(
                    format!("negotiation with {}", target),
                    within,
                ))
            }
        };

        match resolution {
            Resolution::Candidates(candidates) => {
                if candidates.is_empty() {
                    return Err(SyncError::negotiation(target, "peer offered no candidates"));
                }
                for candidate in candidates {
                    if Instant::now() >= deadline {
                        break;
                    }
                    match timeout_at(deadline, self.connect(&candidate)).await {
                        Ok(Ok(peer_id)) if peer_id == target => return Ok(peer_id),
                        Ok(Ok(other)) => {
                            warn!(candidate = %candidate, peer_id = %other, "Candidate led to another peer");
                        }
                        Ok(Err(e)) => {
                            debug!(candidate = %candidate, error = %e, "Candidate unreachable");
                        }
                        Err(_) => break,
                    }
                }
                Err(SyncError::negotiation(target, "no candidate reachable"))
            }
            Resolution::Yielded => {
                // The remote side won the glare and will connect to us
                loop {
                    if self.is_connected(target).await {
                        return Ok(target.to_string());
                    }
                    match timeout_at(deadline, events.recv()).await {
                        Ok(Ok(SyncEvent::ConnectionStateChanged { peer_id, state }))
                            if peer_id == target && state == ConnectionState::Connected =>
                        {
                            return Ok(peer_id);
                        }
                        Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                        Ok(Err(broadcast::error::RecvError::Closed)) => {
                            return Err(SyncError::ShuttingDown)
                        }
                        Err(_) => {
                            return Err(SyncError::timeout(
                                format!("negotiation with {}", target),
                                within,
                            ))
                        }
                    }
                }
            }
        }
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.shared
            .state
            .lock()
            .await
            .connections
            .get(peer_id)
            .is_some_and(PeerConnection::is_live)
    }

    pub async fn connection_state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.shared
            .state
            .lock()
            .await
            .connections
            .get(peer_id)
            .map(|c| c.state)
    }

    pub async fn connection(&self, peer_id: &str) -> Option<ConnectionInfo> {
        self.shared
            .state
            .lock()
            .await
            .connections
            .get(peer_id)
            .map(PeerConnection::info)
    }

    /// Every session, sorted by peer id.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.state.lock().await;
        let mut list: Vec<_> = state.connections.values().map(PeerConnection::info).collect();
        list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        list
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.connections()
            .await
            .into_iter()
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.peer_id)
            .collect()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.shared.state.lock().await.registry.snapshot()
    }

    pub async fn leader_status(&self) -> LeaderStatus {
        self.shared.state.lock().await.registry.leader_status()
    }

    /// Last `peerList` received from a peer.
    pub async fn reported_peers(&self) -> Option<PeerListPayload> {
        self.shared.state.lock().await.registry.reported().cloned()
    }

    pub async fn negotiation(&self, peer_id: &str) -> Option<NegotiationSnapshot> {
        self.shared.state.lock().await.negotiations.get(peer_id)
    }
}

/// Feeds inbound messages to the manager until the channel ends or the peer
/// stays silent for `idle_timeout`. A half-open socket never ends its
/// stream, so silence is treated the same as a close.
async fn receive_loop(
    manager: ConnectionManager,
    peer_id: PeerId,
    session: u64,
    mut incoming: mpsc::Receiver<ControlMessage>,
    idle_timeout: Duration,
) {
    loop {
        match timeout(idle_timeout, incoming.recv()).await {
            Ok(Some(message)) => manager.handle_inbound(&peer_id, session, message).await,
            Ok(None) => break,
            Err(_) => {
                warn!(
                    peer_id = %peer_id,
                    session,
                    silent_for = ?idle_timeout,
                    "No heartbeat from peer, dropping session"
                );
                break;
            }
        }
    }
    manager.on_channel_closed(&peer_id, session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DataPayload;
    use async_trait::async_trait;
    use stagelink_core::Priority;

    struct NoTransport;

    #[async_trait]
    impl Transport for NoTransport {
        async fn open(&self, endpoint: &str) -> SyncResult<Channel> {
            Err(SyncError::ConnectionFailed(endpoint.to_string()))
        }
    }

    fn manager(id: &str, role: PeerRole, start: i64) -> ConnectionManager {
        ConnectionManager::new(
            PeerIdentity::from_parts(id, role, id, Priority::new(role, start)),
            ManagerSettings::default(),
            Arc::new(NoTransport),
            None,
        )
    }

    async fn link(a: &ConnectionManager, b: &ConnectionManager) {
        let (ca, cb) = Channel::pair(64);
        let (ra, rb) = tokio::join!(a.accept(ca), b.accept(cb));
        assert_eq!(ra.unwrap(), b.local_id());
        assert_eq!(rb.unwrap(), a.local_id());
    }

    async fn next_message(events: &mut broadcast::Receiver<SyncEvent>) -> (PeerId, ControlMessage) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(SyncEvent::Message { from, message })) => return (from, message),
                Ok(Ok(_)) => continue,
                other => panic!("no message event: {other:?}"),
            }
        }
    }

    async fn wait_disconnected(events: &mut broadcast::Receiver<SyncEvent>, peer: &str) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(SyncEvent::ConnectionStateChanged { peer_id, state }))
                    if peer_id == peer && state == ConnectionState::Disconnected =>
                {
                    return
                }
                Ok(Ok(_)) => continue,
                other => panic!("no disconnect event: {other:?}"),
            }
        }
    }

    fn data(from: &str, target: Option<&str>) -> ControlMessage {
        ControlMessage::Data(DataPayload {
            sender_id: from.into(),
            target_id: target.map(str::to_string),
            payload: serde_json::json!({ "hello": true }),
        })
    }

    #[tokio::test]
    async fn test_handshake_registers_both_sides() {
        let console = manager("console", PeerRole::Controller, 100);
        let display = manager("display-1", PeerRole::Display, 50);
        link(&console, &display).await;

        assert_eq!(console.connected_peers().await, vec!["display-1".to_string()]);
        let status = display.leader_status().await;
        assert_eq!(status.leader_id.as_deref(), Some("console"));
        assert!(!status.am_i_leader);
        assert_eq!(status.peer_count, 2);
        assert!(console.leader_status().await.am_i_leader);
    }

    #[tokio::test]
    async fn test_broadcast_skips_gone_peers() {
        let console = manager("console", PeerRole::Controller, 1);
        let displays: Vec<_> = (1..=3)
            .map(|i| manager(&format!("display-{i}"), PeerRole::Display, i))
            .collect();
        for display in &displays {
            link(&console, display).await;
        }

        let mut events = console.subscribe();
        displays[1].shutdown().await;
        wait_disconnected(&mut events, "display-2").await;

        let delivered = console.broadcast(ControlMessage::heartbeat("console")).await;
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let console = manager("console", PeerRole::Controller, 1);
        let display = manager("display-1", PeerRole::Display, 1);
        link(&console, &display).await;
        let first = console.connection("display-1").await.unwrap();

        // The display restarts and connects again
        let display_again = manager("display-1", PeerRole::Display, 2);
        link(&console, &display_again).await;

        let connections = console.connections().await;
        assert_eq!(connections.len(), 1);
        assert!(connections[0].created_at >= first.created_at);
        assert_eq!(console.broadcast(ControlMessage::heartbeat("console")).await, 1);
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let a = manager("same", PeerRole::Display, 1);
        let b = manager("same", PeerRole::Display, 2);
        let (ca, cb) = Channel::pair(8);
        let (ra, rb) = tokio::join!(a.accept(ca), b.accept(cb));

        assert!(matches!(ra, Err(SyncError::SelfConnection)));
        assert!(matches!(rb, Err(SyncError::SelfConnection)));
        assert!(a.connections().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out_without_entry() {
        let console = manager("console", PeerRole::Controller, 1);
        let (ours, _silent) = Channel::pair(8);

        let err = console.accept(ours).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
        assert!(console.connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_nothing() {
        let console = manager("console", PeerRole::Controller, 1);
        assert!(console.connect("ws://10.255.255.1:3010/ws").await.is_err());
        assert!(console.connections().await.is_empty());
        assert!(matches!(
            console.disconnect("display-1").await,
            Err(SyncError::PeerNotConnected(_))
        ));
        assert!(
            !console
                .send_to("display-1", ControlMessage::heartbeat("console"))
                .await
        );
    }

    #[tokio::test]
    async fn test_targeted_messages_are_relayed() {
        let hub = manager("console", PeerRole::Controller, 1);
        let left = manager("display-1", PeerRole::Display, 1);
        let right = manager("display-2", PeerRole::Display, 1);
        link(&hub, &left).await;
        link(&hub, &right).await;

        let mut right_events = right.subscribe();
        assert!(left.send_to("console", data("display-1", Some("display-2"))).await);

        let (from, message) = next_message(&mut right_events).await;
        assert_eq!(from, "display-1");
        assert_eq!(message.type_name(), "data");

        // Unknown target: dropped, and the hub keeps working
        let mut hub_events = hub.subscribe();
        assert!(left.send_to("console", data("display-1", Some("display-9"))).await);
        assert!(left.send_to("console", data("display-1", None)).await);
        let (from, message) = next_message(&mut hub_events).await;
        assert_eq!(from, "display-1");
        assert_eq!(message.target_id(), None);
    }

    #[tokio::test]
    async fn test_disconnect_recomputes_leader() {
        let console = manager("console", PeerRole::Controller, 1);
        let display = manager("display-1", PeerRole::Display, 1);
        link(&console, &display).await;

        let mut events = display.subscribe();
        console.disconnect("display-1").await.unwrap();
        wait_disconnected(&mut events, "console").await;

        let status = display.leader_status().await;
        assert!(status.am_i_leader);
        assert_eq!(status.peer_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_dropped_after_idle_timeout() {
        let display = manager("display-1", PeerRole::Display, 1);
        let (ours, ghost) = Channel::pair(64);
        let ghost_identity = PeerIdentity::from_parts(
            "ghost-controller",
            PeerRole::Controller,
            "Ghost",
            Priority::new(PeerRole::Controller, 1),
        );
        ghost
            .handle
            .send(ControlMessage::register(&ghost_identity, None, None, None))
            .unwrap();

        assert_eq!(display.accept(ours).await.unwrap(), "ghost-controller");
        assert_eq!(
            display.leader_status().await.leader_id.as_deref(),
            Some("ghost-controller")
        );

        // Registered, then never another word
        let mut events = display.subscribe();
        tokio::time::sleep(Duration::from_secs(600)).await;
        wait_disconnected(&mut events, "ghost-controller").await;

        assert!(!display.is_connected("ghost-controller").await);
        assert!(display.leader_status().await.am_i_leader);
        assert_eq!(display.broadcast(ControlMessage::heartbeat("display-1")).await, 0);
        drop(ghost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_session_alive() {
        let console = manager("console", PeerRole::Controller, 1);
        let display = manager("display-1", PeerRole::Display, 1);
        link(&console, &display).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(console.is_connected("display-1").await);
        assert!(display.is_connected("console").await);
    }

    #[tokio::test]
    async fn test_shutdown_now_closes_sessions() {
        let console = manager("console", PeerRole::Controller, 1);
        let display = manager("display-1", PeerRole::Display, 1);
        link(&console, &display).await;

        let mut events = display.subscribe();
        console.shutdown_now();
        assert!(console.connections().await.is_empty());
        wait_disconnected(&mut events, "console").await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_sessions() {
        let console = manager("console", PeerRole::Controller, 1);
        let display = manager("display-1", PeerRole::Display, 1);
        link(&console, &display).await;

        console.shutdown().await;
        assert!(console.connections().await.is_empty());

        let (ca, _cb) = Channel::pair(8);
        assert!(matches!(console.accept(ca).await, Err(SyncError::ShuttingDown)));
    }
}
