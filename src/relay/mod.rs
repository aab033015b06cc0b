//! Inter-instance UDP relays
//!
//! Peer instances exchange plain RTP/RTCP over UDP: an `RtcRecvRelay`
//! listens for one remote publishing user's streams and feeds them into the
//! room as if they came from a local pusher; an `RtcSendRelay` forwards one
//! local publisher's streams toward the instance that holds the subscriber.

mod port;
mod recv;
mod send;

pub use port::PortAllocator;
pub use recv::RtcRecvRelay;
pub use send::RtcSendRelay;

use crate::error::{Error, Result};
use crate::transport::MediaTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

const BIND_ATTEMPTS: usize = 16;

/// Bind a relay socket, walking the allocator range past ports that are
/// already taken. Must run inside a Tokio runtime.
pub(crate) fn bind_relay_socket(
    bind_ip: &str,
    ports: &PortAllocator,
) -> Result<(Arc<UdpSocket>, u16)> {
    let mut last_err: Option<std::io::Error> = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = ports.allocate();
        match std::net::UdpSocket::bind((bind_ip, port)) {
            Ok(socket) => {
                socket.set_nonblocking(true)?;
                let socket = UdpSocket::from_std(socket)?;
                let local_port = socket.local_addr()?.port();
                return Ok((Arc::new(socket), local_port));
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(Error::Io(e)),
        None => Err(Error::Relay("no relay port available".to_string())),
    }
}

/// `MediaTransport` over a relay's UDP socket toward a fixed peer address.
/// Sends are best-effort; a full socket buffer drops the datagram.
pub(crate) struct UdpRelayTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpRelayTransport {
    pub(crate) fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        Self { socket, remote }
    }
}

impl MediaTransport for UdpRelayTransport {
    fn is_connected(&self) -> bool {
        true
    }

    fn send_rtp(&self, data: &[u8]) {
        if let Err(e) = self.socket.try_send_to(data, self.remote) {
            debug!(remote = %self.remote, error = %e, "relay RTP send failed");
        }
    }

    fn send_rtcp(&self, data: &[u8]) {
        if let Err(e) = self.socket.try_send_to(data, self.remote) {
            debug!(remote = %self.remote, error = %e, "relay RTCP send failed");
        }
    }
}

/// The configured drop-percentage test hook.
pub(crate) fn discard_by_percent(percent: u8) -> bool {
    percent > 0 && rand::random::<u8>() % 100 < percent
}
