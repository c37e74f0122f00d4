// Transport module for the SFU
//
// This module describes the WebRTC transports handed to clients: their
// direction, the settings they are created with and the options the client
// needs to build its side of the connection.

pub mod adaptation;

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{
        DtlsParameters, IceCandidate, IceParameters, IceServer, ListenIp, WebRtcTransport,
        WebRtcTransportOptions,
    },
    media::TransportId,
};

pub use adaptation::BitrateMonitor;

/// Media direction of a transport, seen from the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client sends media (produce)
    #[default]
    Send,
    /// Client receives media (consume)
    Recv,
}

/// Settings every WebRTC transport is created with
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Local bind address
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Initial outgoing bitrate estimate (bps)
    pub initial_available_outgoing_bitrate: u32,
    /// STUN/TURN servers handed to clients
    pub ice_servers: Vec<IceServer>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            ice_servers: Vec::new(),
        }
    }
}

impl TransportSettings {
    /// Engine options for a new transport
    pub fn webrtc_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: self.listen_ip,
                announced_ip: self.announced_ip,
            }],
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }
}

/// What a client needs to connect to a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServer>,
}

impl TransportInfo {
    /// Describe `transport`
    pub fn from_transport(transport: &dyn WebRtcTransport, ice_servers: &[IceServer]) -> Self {
        Self {
            id: transport.id(),
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
            ice_servers: ice_servers.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_defaults_to_send() {
        assert_eq!(TransportDirection::default(), TransportDirection::Send);
        let recv: TransportDirection = serde_json::from_str("\"recv\"").unwrap();
        assert_eq!(recv, TransportDirection::Recv);
    }

    #[test]
    fn options_carry_announced_ip() {
        let options = TransportSettings::default().webrtc_options();
        assert_eq!(options.listen_ips.len(), 1);
        assert_eq!(
            options.listen_ips[0].announced_ip,
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(options.initial_available_outgoing_bitrate, 1_000_000);
    }
}
