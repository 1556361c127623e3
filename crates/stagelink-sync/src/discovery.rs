//! # Discovery Module
//!
//! Finds displays on the local network with mDNS and a UDP broadcast
//! fallback, and advertises the local display to controllers.
//!
//! ## Discovery Protocol Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Discovery Protocol                                 │
//! │                                                                         │
//! │  DISPLAY (advertise):                                                   │
//! │  ────────────────────                                                   │
//! │  1. Register mDNS service: _stagelink-display._tcp.local.               │
//! │     TXT: display_id, device_id, name, platform, resolution, role        │
//! │  2. Listen on UDP port 48488, answer scan requests with an announce     │
//! │                                                                         │
//! │  CONTROLLER (scan):                                                     │
//! │  ──────────────────                                                     │
//! │  mDNS browse and UDP broadcast run concurrently, both bounded by the    │
//! │  scan timeout. Results are merged by display id (host:port for          │
//! │  responders that announce none), newest wins.                           │
//! │                                                                         │
//! │  ┌─────────────┐        mDNS Query         ┌─────────────┐              │
//! │  │ CONTROLLER  │ ──────────────────────▶   │   DISPLAY   │              │
//! │  │             │        mDNS Response      │             │              │
//! │  │             │ ◀──────────────────────   │             │              │
//! │  └─────────────┘                           └─────────────┘              │
//! │                                                                         │
//! │  ┌─────────────┐      UDP Broadcast        ┌─────────────┐              │
//! │  │ CONTROLLER  │ ══════════════════════▶   │   DISPLAY   │              │
//! │  │             │      UDP Unicast Reply    │             │              │
//! │  │             │ ◀──────────────────────   │             │              │
//! │  └─────────────┘                           └─────────────┘              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## UDP Wire Format
//! ```text
//! ┌──────────┬─────────┬──────┬──────────────────────────────────────────┐
//! │ "STLK"   │ version │ type │ payload                                  │
//! │ 4 bytes  │ u8 = 1  │ u8   │ announce: port u16 BE, then u8-length    │
//! │          │         │      │ prefixed UTF-8: display_id, device_id,   │
//! │          │         │      │ name, platform, resolution               │
//! └──────────┴─────────┴──────┴──────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, warn};

use stagelink_core::{DeviceDescriptor, DiscoveredDisplay, DiscoverySource, PeerRole};

use crate::config::DiscoverySettings;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Constants
// =============================================================================

/// mDNS service type of StageLink displays.
pub const MDNS_SERVICE_TYPE: &str = "_stagelink-display._tcp.local.";

/// Discovery message magic bytes for validation.
const DISCOVERY_MAGIC: &[u8; 4] = b"STLK";

/// Protocol version for discovery messages.
const DISCOVERY_PROTOCOL_VERSION: u8 = 1;

const HEADER_LEN: usize = 6;

// =============================================================================
// Discovery Messages
// =============================================================================

/// Discovery message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoveryMessageType {
    /// Controller looking for displays.
    ScanRequest = 1,
    /// Display answering a scan.
    Announce = 2,
}

impl TryFrom<u8> for DiscoveryMessageType {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DiscoveryMessageType::ScanRequest),
            2 => Ok(DiscoveryMessageType::Announce),
            _ => Err(SyncError::InvalidMessage(format!(
                "Unknown discovery message type: {}",
                value
            ))),
        }
    }
}

fn header(msg_type: DiscoveryMessageType) -> Vec<u8> {
    let mut msg = Vec::with_capacity(64);
    msg.extend_from_slice(DISCOVERY_MAGIC);
    msg.push(DISCOVERY_PROTOCOL_VERSION);
    msg.push(msg_type as u8);
    msg
}

/// Builds a scan request datagram.
pub fn build_scan_request() -> Vec<u8> {
    header(DiscoveryMessageType::ScanRequest)
}

/// Builds the announce datagram for `device`. Strings longer than 255 bytes
/// are cut at a character boundary.
pub fn build_announce(device: &DeviceDescriptor) -> Vec<u8> {
    let mut msg = header(DiscoveryMessageType::Announce);
    msg.extend_from_slice(&device.port.to_be_bytes());
    push_str(&mut msg, &device.display_id);
    push_str(&mut msg, &device.device_id);
    push_str(&mut msg, &device.name);
    push_str(&mut msg, &device.platform);
    push_str(&mut msg, device.resolution.as_deref().unwrap_or(""));
    msg
}

fn push_str(msg: &mut Vec<u8>, value: &str) {
    let mut end = value.len().min(u8::MAX as usize);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    msg.push(end as u8);
    msg.extend_from_slice(&value.as_bytes()[..end]);
}

/// Validates magic and version, returning the message type and payload.
pub fn parse_header(data: &[u8]) -> SyncResult<(DiscoveryMessageType, &[u8])> {
    if data.len() < HEADER_LEN || &data[0..4] != DISCOVERY_MAGIC {
        return Err(SyncError::InvalidMessage("Invalid discovery magic".into()));
    }

    let version = data[4];
    if version != DISCOVERY_PROTOCOL_VERSION {
        return Err(SyncError::InvalidMessage(format!(
            "Unsupported discovery protocol version: {}",
            version
        )));
    }

    let msg_type = DiscoveryMessageType::try_from(data[5])?;
    Ok((msg_type, &data[HEADER_LEN..]))
}

/// Parses an announce payload received from `from_ip`.
pub fn parse_announce(payload: &[u8], from_ip: IpAddr) -> SyncResult<DiscoveredDisplay> {
    let mut reader = Reader::new(payload);
    let port = reader.u16("port")?;
    let display_id = reader.string("display_id")?;
    let device_id = reader.string("device_id")?;
    let name = reader.string("name")?;
    let platform = reader.string("platform")?;
    let resolution = reader.string("resolution")?;

    Ok(DiscoveredDisplay {
        display_id: non_empty(display_id),
        device_id,
        name,
        host: from_ip.to_string(),
        port,
        platform,
        resolution: non_empty(resolution),
        source: DiscoverySource::Udp,
        seen_at: Utc::now(),
    })
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, offset: 0 }
    }

    fn take(&mut self, len: usize, field: &str) -> SyncResult<&'a [u8]> {
        let end = self.offset + len;
        if end > self.data.len() {
            return Err(SyncError::InvalidMessage(format!("{} truncated", field)));
        }
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn u16(&mut self, field: &str) -> SyncResult<u16> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self, field: &str) -> SyncResult<String> {
        let len = self.take(1, field)?[0] as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SyncError::InvalidMessage(format!("Invalid {} UTF-8", field)))
    }
}

// =============================================================================
// Advertisement
// =============================================================================

struct MdnsRegistration {
    daemon: ServiceDaemon,
    fullname: String,
}

/// Keeps the local display discoverable until shut down or dropped.
pub struct Advertisement {
    mdns: Option<MdnsRegistration>,
    responder: Option<JoinHandle<()>>,
    udp_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advertisement")
            .field("mdns", &self.mdns.as_ref().map(|r| &r.fullname))
            .field("udp_addr", &self.udp_addr)
            .finish()
    }
}

impl Advertisement {
    /// Local address of the UDP responder, if it runs.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn is_active(&self) -> bool {
        self.mdns.is_some() || self.responder.is_some()
    }

    /// Unregisters the mDNS service and stops the responder. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(registration) = self.mdns.take() {
            if let Err(e) = registration.daemon.unregister(&registration.fullname) {
                debug!(error = %e, "mDNS unregister failed");
            }
            if let Err(e) = registration.daemon.shutdown() {
                debug!(error = %e, "mDNS daemon shutdown failed");
            }
            info!(service = %registration.fullname, "mDNS advertisement withdrawn");
        }
        if let Some(responder) = self.responder.take() {
            responder.abort();
            debug!("UDP responder stopped");
        }
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Advertises `device` with every enabled mechanism.
///
/// Fails with `AdvertiseFailed` only when every enabled mechanism fails.
pub async fn advertise(
    settings: &DiscoverySettings,
    device: &DeviceDescriptor,
    role: PeerRole,
) -> SyncResult<Advertisement> {
    let mut advertisement = Advertisement {
        mdns: None,
        responder: None,
        udp_addr: None,
    };
    let mut errors = Vec::new();

    if settings.mdns_enabled {
        match register_mdns(device, role) {
            Ok(registration) => {
                info!(service = %registration.fullname, port = device.port, "mDNS advertisement registered");
                advertisement.mdns = Some(registration);
            }
            Err(e) => {
                warn!(error = %e, "mDNS advertisement failed");
                errors.push(format!("mdns: {}", e));
            }
        }
    }

    if settings.udp_enabled {
        match UdpSocket::bind(("0.0.0.0", settings.udp_port)).await {
            Ok(socket) => {
                let local = socket.local_addr().ok();
                info!(addr = ?local, "UDP discovery responder started");
                advertisement.udp_addr = local;
                advertisement.responder =
                    Some(tokio::spawn(run_responder(socket, build_announce(device))));
            }
            Err(e) => {
                warn!(port = settings.udp_port, error = %e, "UDP responder failed to bind");
                errors.push(format!("udp: {}", e));
            }
        }
    }

    if !advertisement.is_active() && !errors.is_empty() {
        return Err(SyncError::AdvertiseFailed(errors.join("; ")));
    }
    Ok(advertisement)
}

fn register_mdns(device: &DeviceDescriptor, role: PeerRole) -> SyncResult<MdnsRegistration> {
    let daemon = ServiceDaemon::new()?;

    let mut properties = HashMap::new();
    properties.insert("display_id".to_string(), device.display_id.clone());
    properties.insert("device_id".to_string(), device.device_id.clone());
    properties.insert("name".to_string(), device.name.clone());
    properties.insert("platform".to_string(), device.platform.clone());
    properties.insert(
        "resolution".to_string(),
        device.resolution.clone().unwrap_or_default(),
    );
    properties.insert("role".to_string(), role.to_string());

    let host_name = format!("{}.local.", device.device_id);
    let service = ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        &device.display_id,
        &host_name,
        "",
        device.port,
        properties,
    )?
    .enable_addr_auto();

    let fullname = service.get_fullname().to_string();
    daemon.register(service)?;
    Ok(MdnsRegistration { daemon, fullname })
}

const RESPONDER_MAX_PAUSE: Duration = Duration::from_secs(2);

/// Pause between consecutive receive errors: 50ms doubling up to 2s.
fn responder_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: RESPONDER_MAX_PAUSE,
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

async fn run_responder(socket: UdpSocket, announce: Vec<u8>) {
    let mut buf = [0u8; 1024];
    let mut backoff = responder_backoff();

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                backoff.reset();
                match parse_header(&buf[..len]) {
                    Ok((DiscoveryMessageType::ScanRequest, _)) => {
                        debug!(from = %from, "Answering scan request");
                        if let Err(e) = socket.send_to(&announce, from).await {
                            warn!(from = %from, error = %e, "Failed to send announce");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(from = %from, error = %e, "Ignoring datagram"),
                }
            }
            Err(e) => {
                let pause = backoff.next_backoff().unwrap_or(RESPONDER_MAX_PAUSE);
                warn!(?e, ?pause, "Error receiving discovery datagram");
                tokio::time::sleep(pause).await;
            }
        }
    }
}

// =============================================================================
// Scan
// =============================================================================

/// Performs a one-shot scan with every enabled mechanism.
///
/// ## Timeline
/// ```text
/// T+0                                                     T+timeout
/// │ mDNS browse ──── resolved ── resolved ──────────────────│ stop
/// │ UDP request ──── announce ───────── announce ───────────│ stop
/// │                                                         ▼
/// │                                          merge by coalesce key
/// ```
///
/// Zero displays is `Ok(vec![])`.
pub async fn scan(settings: &DiscoverySettings, within: Duration) -> SyncResult<Vec<DiscoveredDisplay>> {
    info!(timeout = ?within, "Starting display scan");

    let (mdns, udp) = tokio::join!(
        async {
            if settings.mdns_enabled {
                Some(scan_mdns(within).await)
            } else {
                None
            }
        },
        async {
            if settings.udp_enabled {
                Some(scan_udp(settings, within).await)
            } else {
                None
            }
        },
    );

    let mut found: HashMap<String, DiscoveredDisplay> = HashMap::new();
    let mut started = 0;
    let mut errors = Vec::new();

    for outcome in [mdns, udp].into_iter().flatten() {
        match outcome {
            Ok(displays) => {
                started += 1;
                for display in displays {
                    merge(&mut found, display);
                }
            }
            Err(e) => {
                warn!(error = %e, "Discovery mechanism failed");
                errors.push(e.to_string());
            }
        }
    }

    if started == 0 && !errors.is_empty() {
        return Err(SyncError::DiscoveryFailed(errors.join("; ")));
    }

    let mut result: Vec<DiscoveredDisplay> = found.into_values().collect();
    result.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.coalesce_key().cmp(&b.coalesce_key())));
    info!(count = result.len(), "Display scan complete");
    Ok(result)
}

/// Keeps the most recently seen record per coalesce key.
fn merge(found: &mut HashMap<String, DiscoveredDisplay>, display: DiscoveredDisplay) {
    let key = display.coalesce_key();
    match found.get(&key) {
        Some(existing) if existing.seen_at > display.seen_at => {}
        _ => {
            found.insert(key, display);
        }
    }
}

async fn scan_mdns(within: Duration) -> SyncResult<Vec<DiscoveredDisplay>> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(MDNS_SERVICE_TYPE)?;
    let deadline = Instant::now() + within;
    let mut found = Vec::new();

    loop {
        match timeout_at(deadline, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(service))) => {
                if let Some(resolved) = display_from_service(&service) {
                    debug!(
                        display_id = ?resolved.display_id,
                        host = %resolved.host,
                        port = resolved.port,
                        "Found display via mDNS"
                    );
                    found.push(resolved);
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }

    if let Err(e) = daemon.stop_browse(MDNS_SERVICE_TYPE) {
        debug!(error = %e, "mDNS stop_browse failed");
    }
    if let Err(e) = daemon.shutdown() {
        debug!(error = %e, "mDNS daemon shutdown failed");
    }
    Ok(found)
}

fn display_from_service(service: &ServiceInfo) -> Option<DiscoveredDisplay> {
    let host = preferred_address(service.get_addresses().iter().copied())?;
    let property = |key: &str| service.get_property_val_str(key).map(str::to_string);

    Some(DiscoveredDisplay {
        display_id: property("display_id").and_then(non_empty),
        device_id: property("device_id").unwrap_or_default(),
        name: property("name").unwrap_or_else(|| {
            service
                .get_fullname()
                .trim_end_matches(MDNS_SERVICE_TYPE)
                .trim_end_matches('.')
                .to_string()
        }),
        host: host.to_string(),
        port: service.get_port(),
        platform: property("platform").unwrap_or_default(),
        resolution: property("resolution").and_then(non_empty),
        source: DiscoverySource::Mdns,
        seen_at: Utc::now(),
    })
}

/// Non-loopback IPv4 first, then other IPv4, then IPv6.
fn preferred_address<I>(addrs: I) -> Option<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    let rank = |addr: &IpAddr| match addr {
        IpAddr::V4(v4) if !v4.is_loopback() => 0,
        IpAddr::V4(_) => 1,
        IpAddr::V6(v6) if !v6.is_loopback() => 2,
        IpAddr::V6(_) => 3,
    };
    addrs.into_iter().min_by_key(|addr| (rank(addr), *addr))
}

async fn scan_udp(settings: &DiscoverySettings, within: Duration) -> SyncResult<Vec<DiscoveredDisplay>> {
    let target: SocketAddr = format!("{}:{}", settings.broadcast_addr, settings.udp_port)
        .parse()
        .map_err(|e| SyncError::InvalidConfig(format!("broadcast_addr: {}", e)))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
        SyncError::DiscoveryFailed(format!("Failed to bind discovery socket: {}", e))
    })?;

    socket.set_broadcast(true).map_err(|e| {
        SyncError::DiscoveryFailed(format!("Failed to enable broadcast: {}", e))
    })?;

    socket
        .send_to(&build_scan_request(), target)
        .await
        .map_err(|e| SyncError::DiscoveryFailed(format!("Failed to send scan request: {}", e)))?;

    debug!(target = %target, "Sent scan request, waiting for announces");

    let mut found = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = Instant::now() + within;

    loop {
        match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                let parsed = parse_header(&buf[..len]).and_then(|(msg_type, payload)| {
                    match msg_type {
                        DiscoveryMessageType::Announce => parse_announce(payload, from.ip()).map(Some),
                        DiscoveryMessageType::ScanRequest => Ok(None),
                    }
                });
                match parsed {
                    Ok(Some(announced)) => {
                        debug!(
                            display_id = ?announced.display_id,
                            host = %announced.host,
                            port = announced.port,
                            "Found display via UDP"
                        );
                        found.push(announced);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(from = %from, error = %e, "Ignoring datagram"),
                }
            }
            Ok(Err(e)) => {
                debug!(?e, "Error receiving discovery response");
            }
            Err(_) => break,
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_responder_backoff_grows_and_caps() {
        let mut backoff = responder_backoff();
        let pauses: Vec<u64> = (0..8)
            .map(|_| backoff.next_backoff().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(pauses, vec![50, 100, 200, 400, 800, 1_600, 2_000, 2_000]);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(50)));
    }

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            display_id: "display-1".into(),
            device_id: "device-1".into(),
            name: "Stage Left".into(),
            host: "0.0.0.0".into(),
            port: 3010,
            platform: "linux".into(),
            resolution: Some("1920x1080".into()),
        }
    }

    #[test]
    fn test_discovery_message_type() {
        assert_eq!(
            DiscoveryMessageType::try_from(1).unwrap(),
            DiscoveryMessageType::ScanRequest
        );
        assert_eq!(
            DiscoveryMessageType::try_from(2).unwrap(),
            DiscoveryMessageType::Announce
        );
        assert!(DiscoveryMessageType::try_from(99).is_err());
    }

    #[test]
    fn test_announce_layout() {
        let msg = build_announce(&device());
        assert_eq!(&msg[0..4], DISCOVERY_MAGIC);
        assert_eq!(msg[4], DISCOVERY_PROTOCOL_VERSION);
        assert_eq!(msg[5], DiscoveryMessageType::Announce as u8);
        assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 3010);
        assert_eq!(msg[8] as usize, "display-1".len());

        let (msg_type, payload) = parse_header(&msg).unwrap();
        assert_eq!(msg_type, DiscoveryMessageType::Announce);
        let found = parse_announce(payload, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))).unwrap();
        assert_eq!(found.display_id.as_deref(), Some("display-1"));
        assert_eq!(found.host, "192.168.1.20");
        assert_eq!(found.ws_url(), "ws://192.168.1.20:3010/ws");
        assert_eq!(found.source, DiscoverySource::Udp);
    }

    #[test]
    fn test_malformed_datagrams_rejected() {
        assert!(parse_header(b"STL").is_err());
        assert!(parse_header(b"XXXX\x01\x01").is_err());
        assert!(parse_header(b"STLK\x09\x01").is_err());

        let mut truncated = build_announce(&device());
        truncated.truncate(12);
        let (_, payload) = parse_header(&truncated).unwrap();
        assert!(parse_announce(payload, IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err());
    }

    #[test]
    fn test_long_strings_are_cut_on_char_boundary() {
        let mut long = device();
        long.name = "é".repeat(200);
        let msg = build_announce(&long);
        let (_, payload) = parse_header(&msg).unwrap();
        let found = parse_announce(payload, IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(found.name.chars().count(), 127);
    }

    #[test]
    fn test_merge_keeps_newest() {
        let mut found = HashMap::new();
        let older = parse_announce(
            parse_header(&build_announce(&device())).unwrap().1,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        )
        .unwrap();
        let mut newer = older.clone();
        newer.host = "10.0.0.2".into();
        newer.source = DiscoverySource::Mdns;
        newer.seen_at = older.seen_at + chrono::Duration::seconds(1);

        merge(&mut found, newer.clone());
        merge(&mut found, older);
        assert_eq!(found.len(), 1);
        assert_eq!(found["display-1"].host, "10.0.0.2");
    }

    #[test]
    fn test_preferred_address() {
        let addrs = [
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)),
        ];
        assert_eq!(
            preferred_address(addrs),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9)))
        );
        assert_eq!(
            preferred_address([IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::LOCALHOST)]),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(preferred_address(std::iter::empty()), None);
    }
}
