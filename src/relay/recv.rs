//! UDP listener acting as a synthetic local pusher for one remote
//! publishing user
//!
//! The upstream instance sends plain RTP/RTCP to this relay's listen port.
//! Accepted RTP is run through a receive session and fanned into the room
//! through a weak room handle; the sender address of the first accepted
//! datagram becomes the destination for outbound RTCP (PLI).

use crate::error::{Error, Result};
use crate::events::{stamped, EventSink};
use crate::param::PushInfo;
use crate::relay::{bind_relay_socket, discard_by_percent, PortAllocator};
use crate::room::WeakRoom;
use crate::rtp::rtcp::{self, RtcpItem};
use crate::rtp::{RtpPacket, RtpRecvSession, RtxOutcome};
use crate::types::{PusherId, RoomId, UserId};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ALIVE_TIMEOUT_MS: i64 = 40_000;
const TIMER_INTERVAL_MS: u64 = 500;
const STATS_INTERVAL_MS: i64 = 5000;

struct RecvRelayState {
    push_infos: HashMap<PusherId, PushInfo>,
    ssrc2push: HashMap<u32, PushInfo>,
    sessions: HashMap<u32, RtpRecvSession>,
    rtx2primary: HashMap<u32, u32>,
    remote_addr: Option<SocketAddr>,
    last_stats_ms: i64,
}

pub struct RtcRecvRelay {
    room_id: RoomId,
    pusher_user_id: UserId,
    listen_ip: String,
    listen_port: u16,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<RecvRelayState>>,
    last_alive_ms: Arc<AtomicI64>,
    tasks: Vec<JoinHandle<()>>,
}

impl RtcRecvRelay {
    /// Bind the listen socket and start the reader and statistics tasks.
    /// Must run inside a Tokio runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        room_id: RoomId,
        pusher_user_id: UserId,
        bind_ip: &str,
        ports: &PortAllocator,
        recv_discard_percent: u8,
        room: WeakRoom,
        events: Arc<dyn EventSink>,
        now_ms: i64,
    ) -> Result<Arc<Self>> {
        let (socket, listen_port) = bind_relay_socket(bind_ip, ports)?;
        let state = Arc::new(Mutex::new(RecvRelayState {
            push_infos: HashMap::new(),
            ssrc2push: HashMap::new(),
            sessions: HashMap::new(),
            rtx2primary: HashMap::new(),
            remote_addr: None,
            last_stats_ms: -1,
        }));
        let last_alive_ms = Arc::new(AtomicI64::new(now_ms));

        info!(
            room_id = %room_id,
            pusher_user_id = %pusher_user_id,
            listen_ip = bind_ip,
            listen_port,
            "RtcRecvRelay started"
        );

        let reader = {
            let socket = Arc::clone(&socket);
            let state = Arc::clone(&state);
            let last_alive_ms = Arc::clone(&last_alive_ms);
            let room_id = room_id.clone();
            let pusher_user_id = pusher_user_id.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, addr)) => on_datagram(
                            &buf[..len],
                            addr,
                            recv_discard_percent,
                            &state,
                            &last_alive_ms,
                            &room,
                            &room_id,
                            &pusher_user_id,
                        ),
                        Err(e) => {
                            error!(
                                room_id = %room_id,
                                pusher_user_id = %pusher_user_id,
                                error = %e,
                                "recv relay socket read failed"
                            );
                            break;
                        }
                    }
                }
            })
        };

        let stats = {
            let state = Arc::clone(&state);
            let room_id = room_id.clone();
            let pusher_user_id = pusher_user_id.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_millis(TIMER_INTERVAL_MS));
                loop {
                    ticker.tick().await;
                    emit_stats(&state, &room_id, &pusher_user_id, &events);
                }
            })
        };

        Ok(Arc::new(Self {
            room_id,
            pusher_user_id,
            listen_ip: bind_ip.to_string(),
            listen_port,
            socket,
            state,
            last_alive_ms,
            tasks: vec![reader, stats],
        }))
    }

    /// Register one of the remote user's streams on this relay.
    pub fn add_virtual_pusher(&self, info: PushInfo) {
        let mut state = self.state.lock();
        info!(
            room_id = %self.room_id,
            pusher_user_id = %self.pusher_user_id,
            pusher_id = %info.pusher_id,
            ssrc = info.rtp_param.ssrc,
            rtx_ssrc = info.rtp_param.rtx_ssrc,
            registered = state.ssrc2push.len() + 1,
            "virtual pusher registered on recv relay"
        );
        let session = RtpRecvSession::new(
            info.rtp_param.clone(),
            self.room_id.clone(),
            self.pusher_user_id.clone(),
        );
        state.sessions.insert(info.rtp_param.ssrc, session);
        if info.rtp_param.rtx_ssrc != 0 {
            state
                .rtx2primary
                .insert(info.rtp_param.rtx_ssrc, info.rtp_param.ssrc);
        }
        state.ssrc2push.insert(info.rtp_param.ssrc, info.clone());
        state.push_infos.insert(info.pusher_id.clone(), info);
    }

    #[must_use]
    pub fn get_push_info(&self, pusher_id: &PusherId) -> Option<PushInfo> {
        self.state.lock().push_infos.get(pusher_id).cloned()
    }

    #[must_use]
    pub fn pusher_ids(&self) -> Vec<PusherId> {
        self.state.lock().push_infos.keys().cloned().collect()
    }

    /// Ask the upstream instance for a key frame on `ssrc`.
    pub fn request_key_frame(&self, ssrc: u32) -> Result<()> {
        let (pusher_id, remote) = {
            let state = self.state.lock();
            let Some(info) = state.ssrc2push.get(&ssrc) else {
                error!(
                    room_id = %self.room_id,
                    pusher_user_id = %self.pusher_user_id,
                    ssrc,
                    "key-frame request for unregistered ssrc"
                );
                return Err(Error::UnknownSsrc(ssrc));
            };
            (info.pusher_id.clone(), state.remote_addr)
        };
        let Some(remote) = remote else {
            return Err(Error::Relay("no remote address yet".to_string()));
        };
        // sender_ssrc 0 identifies the server
        let pli = rtcp::Pli {
            sender_ssrc: 0,
            media_ssrc: ssrc,
        };
        info!(
            room_id = %self.room_id,
            pusher_user_id = %self.pusher_user_id,
            pusher_id = %pusher_id,
            ssrc,
            "relaying key-frame request upstream"
        );
        if let Err(e) = self.socket.try_send_to(&pli.to_bytes(), remote) {
            debug!(remote = %remote, error = %e, "PLI send failed");
        }
        Ok(())
    }

    /// Last successfully parsed RTP within the 40 s window.
    #[must_use]
    pub fn is_alive(&self, now_ms: i64) -> bool {
        now_ms - self.last_alive_ms.load(Ordering::Relaxed) <= ALIVE_TIMEOUT_MS
    }

    #[must_use]
    pub fn push_user_id(&self) -> &UserId {
        &self.pusher_user_id
    }

    #[must_use]
    pub fn listen_udp_ip(&self) -> &str {
        &self.listen_ip
    }

    #[must_use]
    pub fn listen_udp_port(&self) -> u16 {
        self.listen_port
    }
}

impl Drop for RtcRecvRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(
            room_id = %self.room_id,
            pusher_user_id = %self.pusher_user_id,
            "RtcRecvRelay stopped"
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn on_datagram(
    data: &[u8],
    addr: SocketAddr,
    recv_discard_percent: u8,
    state: &Arc<Mutex<RecvRelayState>>,
    last_alive_ms: &AtomicI64,
    room: &WeakRoom,
    room_id: &RoomId,
    pusher_user_id: &UserId,
) {
    if discard_by_percent(recv_discard_percent) {
        return;
    }
    if data.is_empty() {
        return;
    }

    if rtcp::is_rtcp(data) {
        state.lock().remote_addr.get_or_insert(addr);
        on_rtcp(data, state, room_id, pusher_user_id);
    } else if rtcp::is_rtp(data) {
        state.lock().remote_addr.get_or_insert(addr);
        on_rtp(data, state, last_alive_ms, room, room_id, pusher_user_id);
    } else {
        error!(
            room_id = %room_id,
            pusher_user_id = %pusher_user_id,
            len = data.len(),
            "recv relay datagram is neither RTP nor RTCP"
        );
    }
}

fn on_rtp(
    data: &[u8],
    state: &Arc<Mutex<RecvRelayState>>,
    last_alive_ms: &AtomicI64,
    room: &WeakRoom,
    room_id: &RoomId,
    pusher_user_id: &UserId,
) {
    let mut pkt = match RtpPacket::parse(data) {
        Ok(pkt) => pkt,
        Err(e) => {
            error!(
                room_id = %room_id,
                pusher_user_id = %pusher_user_id,
                error = %e,
                "recv relay failed to parse RTP"
            );
            return;
        }
    };
    let now_ms = crate::now_millis();
    last_alive_ms.store(now_ms, Ordering::Relaxed);

    // session processing happens under the relay lock; the room lock is
    // only taken afterwards, with the relay lock released
    let pusher_id = {
        let mut state = state.lock();
        let ssrc = pkt.ssrc();
        if state.sessions.contains_key(&ssrc) {
            let Some(session) = state.sessions.get_mut(&ssrc) else {
                return;
            };
            if !session.receive_rtp(&pkt, now_ms) {
                error!(
                    room_id = %room_id,
                    pusher_user_id = %pusher_user_id,
                    ssrc,
                    "recv relay session rejected packet"
                );
                return;
            }
        } else if let Some(&primary) = state.rtx2primary.get(&ssrc) {
            let Some(session) = state.sessions.get_mut(&primary) else {
                return;
            };
            match session.receive_rtx(&mut pkt, now_ms) {
                Ok(RtxOutcome::Demuxed) => {}
                Ok(RtxOutcome::Repeat) => return,
                Err(e) => {
                    error!(
                        room_id = %room_id,
                        pusher_user_id = %pusher_user_id,
                        ssrc,
                        error = %e,
                        "recv relay RTX demux failed"
                    );
                    return;
                }
            }
        } else {
            error!(
                room_id = %room_id,
                pusher_user_id = %pusher_user_id,
                ssrc,
                "recv relay RTP with unmapped ssrc"
            );
            return;
        }

        if pkt.payload_len() == 0 {
            return;
        }
        let effective_ssrc = pkt.ssrc();
        match state.ssrc2push.get(&effective_ssrc) {
            Some(info) => info.pusher_id.clone(),
            None => {
                error!(
                    room_id = %room_id,
                    pusher_user_id = %pusher_user_id,
                    ssrc = effective_ssrc,
                    registered = state.ssrc2push.len(),
                    "no push info for ssrc"
                );
                return;
            }
        }
    };

    if let Some(room) = room.upgrade() {
        room.lock()
            .on_rtp_packet_from_remote_rtc_pusher(pusher_user_id, &pusher_id, &mut pkt);
    }
}

fn on_rtcp(
    data: &[u8],
    state: &Arc<Mutex<RecvRelayState>>,
    room_id: &RoomId,
    pusher_user_id: &UserId,
) {
    for item in rtcp::scan_compound(data) {
        match item {
            RtcpItem::Sr(sr) => {
                let mut state = state.lock();
                match state.sessions.get_mut(&sr.ssrc) {
                    Some(session) => session.handle_sr(&sr),
                    None => {
                        error!(
                            room_id = %room_id,
                            pusher_user_id = %pusher_user_id,
                            ssrc = sr.ssrc,
                            "SR for unknown ssrc on recv relay"
                        );
                    }
                }
            }
            other => {
                warn!(
                    room_id = %room_id,
                    pusher_user_id = %pusher_user_id,
                    item = ?other,
                    "recv relay ignoring RTCP item"
                );
            }
        }
    }
}

fn emit_stats(
    state: &Arc<Mutex<RecvRelayState>>,
    room_id: &RoomId,
    pusher_user_id: &UserId,
    events: &Arc<dyn EventSink>,
) {
    let now_ms = crate::now_millis();
    let mut state = state.lock();
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
        debug!(
            room_id = %room_id,
            pusher_user_id = %pusher_user_id,
            ssrc,
            media_type = %av_type,
            kbps = rate.kbits_per_sec(),
            pps = rate.packets_per_sec,
            total_bytes,
            total_packets,
            "recv relay statistics"
        );
        events.log(
            "relay_recv",
            stamped(
                "relay_recv",
                json!({
                    "room_id": room_id,
                    "pusher_user_id": pusher_user_id,
                    "ssrc": ssrc,
                    "media_type": av_type.as_str(),
                    "kbps": rate.kbits_per_sec(),
                    "pps": rate.packets_per_sec,
                    "total_bytes": total_bytes,
                    "total_pkts": total_packets,
                }),
            ),
        );
    }
}
