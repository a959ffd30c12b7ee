//! DoIP transports: TCP diagnostic sessions and UDP vehicle discovery

pub mod tcp;
pub mod udp;

pub use tcp::{Acknowledgement, ConnectionSettings, ConnectionState, TcpConnection};
pub use udp::{UdpDiscoveryChannel, VehicleIdentificationFilter, VehicleInfo};
