//! SFU configuration

use serde::{Deserialize, Serialize};

/// One ICE candidate advertised in every answer SDP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateConfig {
    /// Address published to clients
    pub ip: String,
    /// Port published to clients
    pub port: u16,
    /// Transport, normally "udp"
    pub net_type: String,
}

/// Inter-instance relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Local address the relay UDP sockets bind to
    pub bind_ip: String,
    /// Lower bound of the relay port range (0 = OS-assigned)
    pub port_min: u16,
    /// Upper bound of the relay port range (inclusive)
    pub port_max: u16,
    /// Drop this percentage of inbound relay datagrams (loss testing)
    pub recv_discard_percent: u8,
    /// Drop this percentage of outbound relay datagrams (loss testing)
    pub send_discard_percent: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            port_min: 0,
            port_max: 0,
            recv_discard_percent: 0,
            send_discard_percent: 0,
        }
    }
}

/// SFU configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SfuConfig {
    /// ICE candidates grafted into every generated answer
    pub candidates: Vec<IceCandidateConfig>,
    /// Inter-instance relay settings
    pub relay: RelayConfig,
}
