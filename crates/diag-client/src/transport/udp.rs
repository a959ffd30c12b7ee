//! DoIP vehicle discovery over UDP

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::codec::{Codec, LogicalAddress, Payload, VehicleAnnouncement, VehicleIdentificationRequest};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::timer::{SyncTimer, TimerOutcome};

const VIN_LEN: usize = 17;
const MAX_DATAGRAM_SIZE: usize = 1500;

/// Preselection applied by the DoIP entities before they answer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VehicleIdentificationFilter {
    #[default]
    Any,
    Vin(String),
    Eid([u8; 6]),
}

impl VehicleIdentificationFilter {
    /// Parse an EID written as `00:02:36:31:00:1c` (`-` separators and plain hex also accepted)
    pub fn eid(text: &str) -> Result<Self, DiscoveryError> {
        let digits: String = text.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&digits)
            .map_err(|e| DiscoveryError::InvalidFilter(format!("EID {}: {}", text, e)))?;
        let eid: [u8; 6] = bytes.try_into().map_err(|_| {
            DiscoveryError::InvalidFilter(format!("EID {} must be 6 bytes", text))
        })?;
        Ok(Self::Eid(eid))
    }

    fn to_request(&self) -> Result<VehicleIdentificationRequest, DiscoveryError> {
        match self {
            Self::Any => Ok(VehicleIdentificationRequest::Any),
            Self::Vin(vin) => {
                let vin: [u8; VIN_LEN] = vin.as_bytes().try_into().map_err(|_| {
                    DiscoveryError::InvalidFilter(format!(
                        "VIN must be {} characters, got {:?}",
                        VIN_LEN, vin
                    ))
                })?;
                Ok(VehicleIdentificationRequest::Vin(vin))
            }
            Self::Eid(eid) => Ok(VehicleIdentificationRequest::Eid(*eid)),
        }
    }
}

/// Reachable diagnostic server learned from a vehicle announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehicleInfo {
    pub logical_address: LogicalAddress,
    /// Empty when the entity does not know its VIN yet
    pub vin: String,
    #[serde(serialize_with = "serialize_mac")]
    pub eid: [u8; 6],
    #[serde(serialize_with = "serialize_mac")]
    pub gid: [u8; 6],
    pub ip_address: IpAddr,
}

impl VehicleInfo {
    fn from_announcement(vam: &VehicleAnnouncement, ip_address: IpAddr) -> Self {
        // 0x00 and 0xFF fill both mean "VIN not configured"
        let vin = if vam.vin.iter().all(|b| *b == 0x00 || *b == 0xFF) {
            String::new()
        } else {
            String::from_utf8_lossy(&vam.vin)
                .trim_matches(char::from(0))
                .to_string()
        };
        Self {
            logical_address: vam.logical_address,
            vin,
            eid: vam.eid,
            gid: vam.gid,
            ip_address,
        }
    }

    pub fn eid_string(&self) -> String {
        format_mac(&self.eid)
    }

    pub fn gid_string(&self) -> String {
        format_mac(&self.gid)
    }
}

fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn serialize_mac<S: Serializer>(bytes: &[u8; 6], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_mac(bytes))
}

/// Broadcast identification request sender and announcement collector
pub struct UdpDiscoveryChannel {
    config: DiscoveryConfig,
    codec: Codec,
    timer: Arc<SyncTimer>,
}

impl UdpDiscoveryChannel {
    pub fn new(config: DiscoveryConfig, codec: Codec, timer: Arc<SyncTimer>) -> Self {
        Self {
            config,
            codec,
            timer,
        }
    }

    /// Send one identification request and collect the answers
    ///
    /// Results keep arrival order; later announcements from an already seen
    /// logical address are dropped.
    pub async fn discover(
        &self,
        filter: &VehicleIdentificationFilter,
        timeout_override: Option<Duration>,
    ) -> Result<Vec<VehicleInfo>, DiscoveryError> {
        let request = filter.to_request()?;
        let window = timeout_override.unwrap_or_else(|| self.config.timeout());

        let socket = UdpSocket::bind(SocketAddr::new(self.config.local_address, 0))
            .await
            .map_err(|e| DiscoveryError::Send(e.to_string()))?;
        if self.config.broadcast_address.is_ipv4() {
            if let Err(e) = socket.set_broadcast(true) {
                debug!(%e, "Failed to enable SO_BROADCAST");
            }
        }

        let destination = SocketAddr::new(self.config.broadcast_address, self.config.port);
        let frame = self.codec.encode_payload(&request);
        socket
            .send_to(&frame, destination)
            .await
            .map_err(|e| DiscoveryError::Send(e.to_string()))?;
        info!(%destination, ?filter, "Sent vehicle identification request");

        let mut vehicles: Vec<VehicleInfo> = Vec::new();
        let collect = async {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => break e,
                };
                let vam = match self.codec.decode(&buf[..len]).and_then(|m| Payload::parse(&m)) {
                    Ok(Payload::VehicleAnnouncement(vam)) => vam,
                    Ok(other) => {
                        debug!(%from, ?other, "Ignoring non-announcement datagram");
                        continue;
                    }
                    Err(e) => {
                        debug!(%from, %e, "Discarding malformed announcement");
                        continue;
                    }
                };
                if vehicles
                    .iter()
                    .any(|v| v.logical_address == vam.logical_address)
                {
                    debug!(
                        logical_address = format!("0x{:04X}", vam.logical_address),
                        "Duplicate announcement"
                    );
                    continue;
                }
                debug!(
                    %from,
                    logical_address = format!("0x{:04X}", vam.logical_address),
                    "Received vehicle announcement"
                );
                vehicles.push(VehicleInfo::from_announcement(&vam, from.ip()));
            }
        };

        match self.timer.wait(window, collect).await {
            Err(TimerOutcome::TimedOut) => {}
            Err(TimerOutcome::Cancelled) => return Err(DiscoveryError::Cancelled),
            Ok(e) => warn!(%e, "Discovery receive failed, returning partial result"),
        }

        info!(count = vehicles.len(), "Discovery complete");
        Ok(vehicles)
    }
}
