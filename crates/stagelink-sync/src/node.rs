//! # Sync Node
//!
//! Main orchestrator. Starts the server, the connection manager, liveness,
//! discovery advertisement and the broadcast coordinator, and exposes the
//! operations the operator UI calls.
//!
//! ## Node Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncNode Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                            SyncNode                              │  │
//! │  │                                                                  │  │
//! │  │  • discover / connect / negotiate / disconnect                   │  │
//! │  │  • broadcast_lyrics / broadcast_slide / broadcast_precache       │  │
//! │  │  • begin_pairing / confirm_pairing / registered_displays         │  │
//! │  │  • subscribe() → SyncEvent stream                                │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │     ┌──────────────┬──────────┼────────────┬─────────────────┐         │
//! │     ▼              ▼          ▼            ▼                 ▼         │
//! │  ┌────────┐  ┌──────────┐ ┌────────┐ ┌───────────┐ ┌─────────────┐    │
//! │  │ Server │  │Connection│ │Liveness│ │ Broadcast │ │Advertisement│    │
//! │  │ (axum) │─►│ Manager  │ │ sweep  │ │Coordinator│ │ (displays)  │    │
//! │  └────────┘  └──────────┘ └────────┘ └───────────┘ └─────────────┘    │
//! │                                                                         │
//! │  BACKGROUND TASKS:                                                      │
//! │  ─────────────────                                                      │
//! │  server, stale sweep, resync-on-connect (controllers),                 │
//! │  pairing responder (displays)                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stagelink_core::{
    DeviceDescriptor, DiscoveredDisplay, DisplayClass, LeaderStatus, PairingRecord, PeerId,
    PeerIdentity, PeerInfo, PeerRole, RegisteredDisplay,
};

use crate::broadcast::{
    BroadcastCoordinator, LyricsUpdate, PrecacheReport, PresentationState, SlideUpdate,
};
use crate::config::SyncConfig;
use crate::connection::{ConnectionInfo, ConnectionManager, ManagerSettings};
use crate::content::{ContentSource, NoContent};
use crate::discovery::{self, Advertisement};
use crate::error::{SyncError, SyncResult};
use crate::event::SyncEvent;
use crate::liveness::LivenessMonitor;
use crate::pairing::{spawn_pairing_responder, PairingService};
use crate::server::{self, ServerHandle};
use crate::store::DisplayStore;
use crate::transport::{ConnectionState, Transport, TransportConfig, WebSocketTransport};

// =============================================================================
// Sync Node
// =============================================================================

/// A running StageLink peer.
pub struct SyncNode {
    config: Arc<SyncConfig>,
    store: Arc<dyn DisplayStore>,
    manager: ConnectionManager,
    coordinator: BroadcastCoordinator,
    pairing: PairingService,
    liveness: LivenessMonitor,
    advertise_host: String,
    listen_port: u16,
    server: Mutex<Option<ServerHandle>>,
    advertisement: Mutex<Option<Advertisement>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncNode")
            .field("peer_id", &self.manager.local_id())
            .field("endpoint", &self.local_endpoint())
            .finish_non_exhaustive()
    }
}

impl SyncNode {
    /// Starts a node with every background task running.
    pub async fn start(
        config: SyncConfig,
        store: Arc<dyn DisplayStore>,
        content: Arc<dyn ContentSource>,
        transport: Arc<dyn Transport>,
    ) -> SyncResult<SyncNode> {
        config.validate()?;
        let config = Arc::new(config);
        let identity = config.identity(Utc::now());
        let role = identity.role();

        let listener = server::bind(&config.server.bind_address()).await?;
        let listen_port = listener.local_addr()?.port();
        let advertise_host = resolve_advertise_host(&config);
        let endpoint = format!("ws://{}:{}/ws", advertise_host, listen_port);

        let liveness = LivenessMonitor::new(
            store.clone(),
            config.org_id(),
            config.liveness.stale_window(),
        );

        let settings = ManagerSettings {
            connect_timeout: config.connection.connect_timeout(),
            handshake_timeout: config.connection.handshake_timeout(),
            heartbeat_interval: config.liveness.heartbeat_interval(role),
            idle_timeout: config.liveness.stale_window(),
            display_class: (role == PeerRole::Display).then_some(config.node.display_class),
            org_id: Some(config.org_id().to_string()),
            listen_port: Some(listen_port),
            local_candidates: vec![endpoint.clone()],
        };
        let manager = ConnectionManager::new(identity.clone(), settings, transport, Some(liveness.clone()));

        let server = server::serve(listener, manager.clone(), config.connection.channel_buffer)?;

        let coordinator = BroadcastCoordinator::new(
            manager.clone(),
            content,
            config.content.media_url_ttl(),
        );
        let pairing = PairingService::new(
            store.clone(),
            config.pairing.code_ttl(),
            config.pairing.max_attempts,
        );

        let advertisement = if role == PeerRole::Display && config.discovery.advertise {
            let device = config.device_descriptor(advertise_host.clone(), listen_port);
            match discovery::advertise(&config.discovery, &device, role).await {
                Ok(advertisement) => Some(advertisement),
                Err(e) => {
                    warn!(error = %e, "Display will not be discoverable");
                    None
                }
            }
        } else {
            None
        };

        let mut tasks = vec![liveness.spawn_sweeper(config.liveness.sweep_interval())];
        match role {
            PeerRole::Controller => {
                tasks.push(spawn_resync_on_connect(manager.clone(), coordinator.clone()));
            }
            PeerRole::Display => {
                tasks.push(spawn_pairing_responder(
                    manager.clone(),
                    pairing.clone(),
                    config.org_id().to_string(),
                ));
            }
        }

        info!(
            peer_id = %identity.id(),
            role = %role,
            org_id = %config.org_id(),
            endpoint = %endpoint,
            "Sync node started"
        );

        Ok(SyncNode {
            config,
            store,
            manager,
            coordinator,
            pairing,
            liveness,
            advertise_host,
            listen_port,
            server: Mutex::new(Some(server)),
            advertisement: Mutex::new(advertisement),
            tasks: Mutex::new(tasks),
        })
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn identity(&self) -> &PeerIdentity {
        self.manager.identity()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Endpoint other peers dial to reach this node.
    pub fn local_endpoint(&self) -> String {
        format!("ws://{}:{}/ws", self.advertise_host, self.listen_port)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// This node described as a display at its advertised endpoint.
    pub fn device_descriptor(&self) -> DeviceDescriptor {
        self.config
            .device_descriptor(self.advertise_host.clone(), self.listen_port)
    }

    // =========================================================================
    // Discovery and Sessions
    // =========================================================================

    /// Scans for displays. Uses the configured timeout when none is given.
    pub async fn discover(&self, within: Option<Duration>) -> SyncResult<Vec<DiscoveredDisplay>> {
        let within = within.unwrap_or_else(|| self.config.discovery.timeout());
        discovery::scan(&self.config.discovery, within).await
    }

    pub async fn connect(&self, endpoint: &str) -> SyncResult<PeerId> {
        self.manager.connect(endpoint).await
    }

    pub async fn connect_display(&self, display: &DiscoveredDisplay) -> SyncResult<PeerId> {
        self.manager.connect(&display.ws_url()).await
    }

    pub async fn disconnect(&self, peer_id: &str) -> SyncResult<()> {
        self.manager.disconnect(peer_id).await
    }

    /// Negotiates a direct session with `peer_id` through the leader (or
    /// any connected peer).
    pub async fn negotiate(&self, peer_id: &str, within: Option<Duration>) -> SyncResult<PeerId> {
        let within = within.unwrap_or_else(|| self.config.connection.negotiation_timeout());
        self.manager.negotiate(peer_id, None, within).await
    }

    pub async fn negotiate_via(
        &self,
        peer_id: &str,
        rendezvous: &str,
        within: Option<Duration>,
    ) -> SyncResult<PeerId> {
        let within = within.unwrap_or_else(|| self.config.connection.negotiation_timeout());
        self.manager.negotiate(peer_id, Some(rendezvous), within).await
    }

    // =========================================================================
    // Broadcast
    // =========================================================================

    pub async fn broadcast_lyrics(&self, update: LyricsUpdate) -> SyncResult<usize> {
        self.coordinator.broadcast_lyrics(update).await
    }

    pub async fn broadcast_slide(&self, update: SlideUpdate) -> SyncResult<usize> {
        self.coordinator.broadcast_slide(update).await
    }

    /// Precaches `event_id` of this node's organization.
    pub async fn broadcast_precache(&self, event_id: &str) -> SyncResult<PrecacheReport> {
        self.coordinator
            .broadcast_precache(self.config.org_id(), event_id)
            .await
    }

    pub async fn resync(&self, peer_id: &str) -> SyncResult<usize> {
        self.coordinator.resync(peer_id).await
    }

    pub async fn presentation_state(&self) -> PresentationState {
        self.coordinator.state().await
    }

    // =========================================================================
    // Pairing and Registry
    // =========================================================================

    /// Enters pairing mode for this node as a display.
    pub async fn begin_pairing(&self) -> SyncResult<PairingRecord> {
        self.begin_pairing_for(&self.device_descriptor()).await
    }

    /// Enters pairing mode on behalf of `device`.
    pub async fn begin_pairing_for(&self, device: &DeviceDescriptor) -> SyncResult<PairingRecord> {
        self.pairing.begin(self.config.org_id(), device).await
    }

    /// Confirms a code shown on a display. Codes this node issued are
    /// redeemed locally; any other is asked of the connected displays.
    pub async fn confirm_pairing(
        &self,
        code: &str,
        class: DisplayClass,
        name: Option<String>,
    ) -> SyncResult<RegisteredDisplay> {
        let org_id = self.config.org_id();
        match self.pairing.confirm(org_id, code, class, name.clone()).await {
            Err(SyncError::PairingCodeNotFound(_)) => {
                self.pairing
                    .confirm_remote(
                        &self.manager,
                        org_id,
                        code,
                        class,
                        name,
                        self.config.pairing.confirm_timeout(),
                    )
                    .await
            }
            result => result,
        }
    }

    pub async fn cancel_pairing(&self, code: &str) -> SyncResult<bool> {
        self.pairing.cancel(self.config.org_id(), code).await
    }

    pub async fn registered_displays(&self) -> SyncResult<Vec<RegisteredDisplay>> {
        self.store.get_registered_displays(self.config.org_id()).await
    }

    pub async fn remove_display(&self, display_id: &str) -> SyncResult<bool> {
        let removed = self
            .store
            .remove_registered_display(self.config.org_id(), display_id)
            .await?;
        if removed {
            info!(display_id = %display_id, "Display removed");
        }
        Ok(removed)
    }

    /// Runs one stale sweep now.
    pub async fn sweep(&self) -> SyncResult<u64> {
        self.liveness.sweep().await
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn leader_status(&self) -> LeaderStatus {
        self.manager.leader_status().await
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.manager.peers().await
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.manager.connections().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.manager.subscribe()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Closes every session, stops background tasks, withdraws the
    /// advertisement and stops the server.
    pub async fn shutdown(&self) {
        info!("Sync node shutting down");
        self.manager.shutdown().await;

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(mut advertisement) = self.advertisement.lock().await.take() {
            advertisement.shutdown();
        }
        if let Some(server) = self.server.lock().await.take() {
            server.shutdown().await;
        }
        info!("Sync node stopped");
    }
}

impl Drop for SyncNode {
    /// Releases everything [`SyncNode::shutdown`] would when the node goes
    /// away without it. The advertisement and server stop on their own drop.
    fn drop(&mut self) {
        self.manager.shutdown_now();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Controllers push the current state to every display that (re)connects.
fn spawn_resync_on_connect(manager: ConnectionManager, coordinator: BroadcastCoordinator) -> JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            let peer_id = match events.recv().await {
                Ok(SyncEvent::ConnectionStateChanged {
                    peer_id,
                    state: ConnectionState::Connected,
                }) => peer_id,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Resync task lagged behind events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let is_display = manager
                .connection(&peer_id)
                .await
                .is_some_and(|c| c.role == PeerRole::Display);
            if !is_display {
                continue;
            }
            match coordinator.resync(&peer_id).await {
                Ok(sent) => debug!(peer_id = %peer_id, sent, "Resync on connect"),
                Err(e) => warn!(peer_id = %peer_id, error = %e, "Resync on connect failed"),
            }
        }
    })
}

fn resolve_advertise_host(config: &SyncConfig) -> String {
    if let Some(host) = &config.server.advertise_host {
        return host.clone();
    }
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            warn!(error = %e, "Could not detect local address, advertising loopback");
            IpAddr::from([127, 0, 0, 1]).to_string()
        }
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for starting a SyncNode with optional collaborators.
pub struct SyncNodeBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn DisplayStore>>,
    content: Option<Arc<dyn ContentSource>>,
    transport: Option<Arc<dyn Transport>>,
}

impl SyncNodeBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncNodeBuilder {
            config,
            store: None,
            content: None,
            transport: None,
        }
    }

    /// Sets the display registry.
    pub fn with_store(mut self, store: Arc<dyn DisplayStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the content source. Defaults to [`NoContent`].
    pub fn with_content(mut self, content: Arc<dyn ContentSource>) -> Self {
        self.content = Some(content);
        self
    }

    /// Sets the transport. Defaults to [`WebSocketTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Starts the node.
    pub async fn start(self) -> SyncResult<SyncNode> {
        let store = self
            .store
            .ok_or_else(|| SyncError::InvalidConfig("Display store required".into()))?;
        let content = self.content.unwrap_or_else(|| Arc::new(NoContent));
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(WebSocketTransport::new(TransportConfig {
                connect_timeout: self.config.connection.connect_timeout(),
                buffer: self.config.connection.channel_buffer,
            }))
        });

        SyncNode::start(self.config, store, content, transport).await
    }
}
