//! UDP client forwarding one local publisher's streams to a peer instance
//!
//! The pilot announces where the subscribing instance listens; every packet
//! the publisher produces is run through a send session (retransmit cache,
//! statistics, periodic SR) and pushed to that endpoint. The peer answers
//! with RTCP only: RR, NACK, PLI and AFB.

use crate::error::{Error, Result};
use crate::events::{stamped, EventSink};
use crate::param::PushInfo;
use crate::relay::{bind_relay_socket, discard_by_percent, PortAllocator, UdpRelayTransport};
use crate::room::WeakRoom;
use crate::rtp::rtcp::{self, RtcpItem};
use crate::rtp::{RtpPacket, RtpSendSession};
use crate::types::{PusherId, RoomId, UserId};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ALIVE_TIMEOUT_MS: i64 = 40_000;
const TIMER_INTERVAL_MS: u64 = 300;
const STATS_INTERVAL_MS: i64 = 5000;

/// Placeholder puller user id reported with relayed key-frame requests;
/// the real subscriber identity lives on the peer instance.
const REMOTE_PULLER_USER_ID: &str = "remote_user_id";

struct SendRelayState {
    push_infos: HashMap<PusherId, PushInfo>,
    sessions: HashMap<u32, RtpSendSession>,
    rtx2primary: HashMap<u32, u32>,
    last_stats_ms: i64,
}

pub struct RtcSendRelay {
    room_id: RoomId,
    pusher_user_id: UserId,
    remote_addr: SocketAddr,
    local_port: u16,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<SendRelayState>>,
    last_alive_ms: Arc<AtomicI64>,
    send_discard_percent: u8,
    tasks: Vec<JoinHandle<()>>,
}

impl RtcSendRelay {
    /// Bind the client socket and start the RTCP reader and housekeeping
    /// tasks. Must run inside a Tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        room_id: RoomId,
        pusher_user_id: UserId,
        remote_ip: &str,
        remote_port: u16,
        bind_ip: &str,
        ports: &PortAllocator,
        send_discard_percent: u8,
        room: WeakRoom,
        events: Arc<dyn EventSink>,
        now_ms: i64,
    ) -> Result<Arc<Self>> {
        let remote_ip: IpAddr = remote_ip
            .parse()
            .map_err(|_| Error::Relay(format!("bad relay peer address: {remote_ip}")))?;
        let remote_addr = SocketAddr::new(remote_ip, remote_port);
        let (socket, local_port) = bind_relay_socket(bind_ip, ports)?;
        let state = Arc::new(Mutex::new(SendRelayState {
            push_infos: HashMap::new(),
            sessions: HashMap::new(),
            rtx2primary: HashMap::new(),
            last_stats_ms: -1,
        }));
        let last_alive_ms = Arc::new(AtomicI64::new(now_ms));

        info!(
            room_id = %room_id,
            pusher_user_id = %pusher_user_id,
            remote = %remote_addr,
            listen_ip = bind_ip,
            listen_port = local_port,
            "RtcSendRelay started"
        );

        let reader = {
            let socket = Arc::clone(&socket);
            let state = Arc::clone(&state);
            let room_id = room_id.clone();
            let pusher_user_id = pusher_user_id.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, _addr)) => {
                            on_datagram(&buf[..len], &state, &room, &room_id, &pusher_user_id);
                        }
                        Err(e) => {
                            error!(
                                room_id = %room_id,
                                pusher_user_id = %pusher_user_id,
                                error = %e,
                                "send relay socket read failed"
                            );
                            break;
                        }
                    }
                }
            })
        };

        let housekeeping = {
            let state = Arc::clone(&state);
            let events = Arc::clone(&events);
            let room_id = room_id.clone();
            let pusher_user_id = pusher_user_id.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_millis(TIMER_INTERVAL_MS));
                loop {
                    ticker.tick().await;
                    on_housekeeping(&state, &room_id, &pusher_user_id, &events);
                }
            })
        };

        Ok(Arc::new(Self {
            room_id,
            pusher_user_id,
            remote_addr,
            local_port,
            socket,
            state,
            last_alive_ms,
            send_discard_percent,
            tasks: vec![reader, housekeeping],
        }))
    }

    /// Register one of the publisher's streams for forwarding.
    pub fn add_push_info(&self, info: PushInfo) {
        let mut state = self.state.lock();
        let transport = Arc::new(UdpRelayTransport::new(
            Arc::clone(&self.socket),
            self.remote_addr,
        ));
        let session = RtpSendSession::new(
            info.rtp_param.clone(),
            self.room_id.clone(),
            None,
            self.pusher_user_id.clone(),
            transport,
        );
        state.sessions.insert(info.rtp_param.ssrc, session);
        if info.rtp_param.rtx_ssrc != 0 {
            state
                .rtx2primary
                .insert(info.rtp_param.rtx_ssrc, info.rtp_param.ssrc);
        }
        info!(
            room_id = %self.room_id,
            pusher_user_id = %self.pusher_user_id,
            pusher_id = %info.pusher_id,
            ssrc = info.rtp_param.ssrc,
            "push info registered on send relay"
        );
        state.push_infos.insert(info.pusher_id.clone(), info);
    }

    /// Forward one of the publisher's packets to the peer instance.
    /// Packets whose SSRC no session claims are dropped.
    pub fn send_rtp_packet(&self, pkt: &RtpPacket, now_ms: i64) {
        let claimed = {
            let mut state = self.state.lock();
            let ssrc = pkt.ssrc();
            let primary = if state.sessions.contains_key(&ssrc) {
                ssrc
            } else {
                match state.rtx2primary.get(&ssrc) {
                    Some(&primary) => primary,
                    None => return,
                }
            };
            match state.sessions.get_mut(&primary) {
                Some(session) => session.send_rtp(pkt, now_ms),
                None => false,
            }
        };
        if !claimed {
            error!(
                room_id = %self.room_id,
                pusher_user_id = %self.pusher_user_id,
                ssrc = pkt.ssrc(),
                "send relay session refused packet"
            );
            return;
        }
        if discard_by_percent(self.send_discard_percent) {
            return;
        }
        self.last_alive_ms.store(now_ms, Ordering::Relaxed);
        if let Err(e) = self.socket.try_send_to(pkt.data(), self.remote_addr) {
            debug!(remote = %self.remote_addr, error = %e, "relay RTP send failed");
        }
    }

    /// Last successful outbound send within the 40 s window.
    #[must_use]
    pub fn is_alive(&self, now_ms: i64) -> bool {
        now_ms - self.last_alive_ms.load(Ordering::Relaxed) <= ALIVE_TIMEOUT_MS
    }

    #[must_use]
    pub fn push_user_id(&self) -> &UserId {
        &self.pusher_user_id
    }

    #[must_use]
    pub fn pusher_ids(&self) -> Vec<PusherId> {
        self.state.lock().push_infos.keys().cloned().collect()
    }

    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl Drop for RtcSendRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(
            room_id = %self.room_id,
            pusher_user_id = %self.pusher_user_id,
            "RtcSendRelay stopped"
        );
    }
}

fn on_datagram(
    data: &[u8],
    state: &Arc<Mutex<SendRelayState>>,
    room: &WeakRoom,
    room_id: &RoomId,
    pusher_user_id: &UserId,
) {
    if data.is_empty() {
        return;
    }
    if rtcp::is_rtp(data) {
        error!(
            room_id = %room_id,
            pusher_user_id = %pusher_user_id,
            len = data.len(),
            "send relay received RTP from peer"
        );
        return;
    }
    if !rtcp::is_rtcp(data) {
        error!(
            room_id = %room_id,
            pusher_user_id = %pusher_user_id,
            len = data.len(),
            "send relay datagram is neither RTP nor RTCP"
        );
        return;
    }

    let now_ms = crate::now_millis();
    // key-frame requests need the room lock, so they are collected under
    // the relay lock and dispatched after it is released
    let mut key_frame_requests: Vec<(PusherId, u32)> = Vec::new();
    {
        let mut state = state.lock();
        for item in rtcp::scan_compound(data) {
            match item {
                RtcpItem::Rr(rr) => {
                    for block in &rr.blocks {
                        match state.sessions.get_mut(&block.ssrc) {
                            Some(session) => session.handle_rr_block(block),
                            None => {
                                error!(
                                    room_id = %room_id,
                                    pusher_user_id = %pusher_user_id,
                                    ssrc = block.ssrc,
                                    "RR block for unknown ssrc on send relay"
                                );
                            }
                        }
                    }
                }
                RtcpItem::Nack(nack) => {
                    match state.sessions.get_mut(&nack.media_ssrc) {
                        Some(session) => {
                            let resent = session.handle_nack(&nack, now_ms);
                            debug!(
                                room_id = %room_id,
                                pusher_user_id = %pusher_user_id,
                                ssrc = nack.media_ssrc,
                                resent,
                                "NACK handled on send relay"
                            );
                        }
                        None => {
                            error!(
                                room_id = %room_id,
                                pusher_user_id = %pusher_user_id,
                                ssrc = nack.media_ssrc,
                                "NACK for unknown ssrc on send relay"
                            );
                        }
                    }
                }
                RtcpItem::Pli(pli) => {
                    let pusher_id = state
                        .push_infos
                        .values()
                        .find(|info| info.rtp_param.ssrc == pli.media_ssrc)
                        .map(|info| info.pusher_id.clone());
                    match pusher_id {
                        Some(pusher_id) => {
                            key_frame_requests.push((pusher_id, pli.media_ssrc));
                        }
                        None => {
                            error!(
                                room_id = %room_id,
                                pusher_user_id = %pusher_user_id,
                                ssrc = pli.media_ssrc,
                                "PLI for unknown ssrc on send relay"
                            );
                        }
                    }
                }
                RtcpItem::Afb { media_ssrc, .. } => {
                    debug!(
                        room_id = %room_id,
                        pusher_user_id = %pusher_user_id,
                        ssrc = media_ssrc,
                        "AFB acknowledged on send relay"
                    );
                }
                other => {
                    warn!(
                        room_id = %room_id,
                        pusher_user_id = %pusher_user_id,
                        item = ?other,
                        "send relay ignoring RTCP item"
                    );
                }
            }
        }
    }

    if key_frame_requests.is_empty() {
        return;
    }
    if let Some(room) = room.upgrade() {
        let mut room = room.lock();
        for (pusher_id, ssrc) in key_frame_requests {
            room.on_key_frame_request(
                &pusher_id,
                &UserId::new(REMOTE_PULLER_USER_ID),
                pusher_user_id,
                ssrc,
            );
        }
    }
}

fn on_housekeeping(
    state: &Arc<Mutex<SendRelayState>>,
    room_id: &RoomId,
    pusher_user_id: &UserId,
    events: &Arc<dyn EventSink>,
) {
    let now_ms = crate::now_millis();
    let mut state = state.lock();
    for session in state.sessions.values_mut() {
        session.on_timer(now_ms);
    }
    if state.last_stats_ms < 0 {
        state.last_stats_ms = now_ms;
        return;
    }
    if now_ms - state.last_stats_ms < STATS_INTERVAL_MS {
        return;
    }
    state.last_stats_ms = now_ms;

    for (ssrc, session) in &mut state.sessions {
        let av_type = session.param().av_type;
        let total_bytes = session.stats().bytes();
        let total_packets = session.stats().packets();
        let rate = session.stats_mut().rate(now_ms);
        events.log(
            "relay_send",
            stamped(
                "relay_send",
                json!({
                    "room_id": room_id,
                    "pusher_user_id": pusher_user_id,
                    "ssrc": ssrc,
                    "av_type": av_type.as_str(),
                    "bytes_sent": total_bytes,
                    "packets_sent": total_packets,
                    "kbps": rate.kbits_per_sec(),
                    "pps": rate.packets_per_sec,
                }),
            ),
        );
    }
}
