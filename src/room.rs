//! Room controller
//!
//! A `Room` is the state machine for one logical conference: local and
//! remote participants, their published streams, every subscription, and
//! the UDP relays that bridge to peer instances. All operations are
//! synchronous and run serialized under the `SharedRoom` lock, so
//! components observe each other's state without any further locking and
//! RTP fan-out happens inline on the tick that received the packet.
//!
//! Every signaling operation is total: it returns a `Result` the front-end
//! maps onto the `{code, message}` envelope, and never panics or leaves
//! partial state behind on failure.

use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::events::{stamped, EventSink};
use crate::param::{PullRequestInfo, PushInfo, RtpSessionParam};
use crate::pilot::{
    PilotJoinRequest, PilotJoinResponse, PilotNewPusherNotification, PilotNewUserNotification,
    PilotPushNotification, PilotReconnectNotification, PilotTextMessageNotification,
    PilotUserGoneInbound, PilotUserGoneNotification, PullRemoteStreamNotification, SharedPilot,
};
use crate::puller::MediaPuller;
use crate::pusher::{MediaPusher, PusherIngress};
use crate::relay::{PortAllocator, RtcRecvRelay, RtcSendRelay};
use crate::rtp::rtcp::{RtcpItem, SenderReport};
use crate::rtp::RtpPacket;
use crate::sdp::{AnswerOptions, Direction, RtcSdp, Setup};
use crate::signal::{
    NewPusherNotification, SharedSignal, SignalResponse, TextMessageNotification,
    UserGoneNotification, UserReconnectNotification,
};
use crate::transport::{NegotiatedTransport, SharedTransportFactory, TransportRole};
use crate::types::{PullerId, PusherId, RoomId, SessionId, UserId};
use crate::user::RtcUser;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ROOM_TIMEOUT_MS: i64 = 90_000;
const TIMER_INTERVAL_MS: u64 = 1000;

/// Handle through which every room operation runs
pub type SharedRoom = Arc<Mutex<Room>>;
/// Back-reference handed to relays and timers; never keeps a room alive
pub type WeakRoom = Weak<Mutex<Room>>;

pub struct Room {
    room_id: RoomId,
    config: Arc<SfuConfig>,
    pilot: SharedPilot,
    transports: SharedTransportFactory,
    ports: Arc<PortAllocator>,
    events: Arc<dyn EventSink>,

    users: BTreeMap<UserId, RtcUser>,
    pushers: HashMap<PusherId, MediaPusher>,
    /// Primary and RTX SSRCs of every local pusher
    ssrc2pusher: HashMap<u32, PusherId>,
    /// SSRCs of remote pushers served through recv relays
    remote_ssrc2pusher: HashMap<u32, PusherId>,
    pusher2pullers: HashMap<PusherId, BTreeMap<PullerId, MediaPuller>>,
    send_relays: HashMap<UserId, Arc<RtcSendRelay>>,
    recv_relays_by_pusher: HashMap<PusherId, Arc<RtcRecvRelay>>,
    recv_relays_by_user: HashMap<UserId, Arc<RtcRecvRelay>>,

    last_alive_ms: i64,
    closed: bool,
    weak_self: WeakRoom,
    timer: Option<JoinHandle<()>>,
}

impl Room {
    /// Create the room and start its liveness timer. Must run inside a
    /// Tokio runtime.
    pub fn create(
        room_id: RoomId,
        config: Arc<SfuConfig>,
        pilot: SharedPilot,
        transports: SharedTransportFactory,
        ports: Arc<PortAllocator>,
        events: Arc<dyn EventSink>,
    ) -> SharedRoom {
        info!(room_id = %room_id, "room created");
        let room = Arc::new(Mutex::new(Self {
            room_id,
            config,
            pilot,
            transports,
            ports,
            events,
            users: BTreeMap::new(),
            pushers: HashMap::new(),
            ssrc2pusher: HashMap::new(),
            remote_ssrc2pusher: HashMap::new(),
            pusher2pullers: HashMap::new(),
            send_relays: HashMap::new(),
            recv_relays_by_pusher: HashMap::new(),
            recv_relays_by_user: HashMap::new(),
            last_alive_ms: crate::now_millis(),
            closed: false,
            weak_self: Weak::new(),
            timer: None,
        }));
        let weak = Arc::downgrade(&room);
        {
            let mut guard = room.lock();
            guard.weak_self = weak.clone();
            guard.timer = Some(tokio::spawn(timer_loop(weak)));
        }
        room
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// No local-participant activity for 90 s means the room is dead.
    #[must_use]
    pub fn is_alive(&self, now_ms: i64) -> bool {
        !self.closed && now_ms - self.last_alive_ms < ROOM_TIMEOUT_MS
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        info!(room_id = %self.room_id, "room closed");
    }

    // ---- signaling operations -------------------------------------------

    pub fn user_join(
        &mut self,
        user_id: UserId,
        user_name: String,
        req_id: u64,
        signal: SharedSignal,
    ) -> Result<()> {
        if self.closed {
            error!(room_id = %self.room_id, user_id = %user_id, "join rejected, room is closed");
            return Err(Error::RoomClosed(self.room_id.clone()));
        }
        let now_ms = crate::now_millis();
        self.last_alive_ms = now_ms;

        if self.users.contains_key(&user_id) {
            warn!(
                room_id = %self.room_id,
                user_id = %user_id,
                "user already in room, treating join as reconnect"
            );
            self.log_event(
                "join",
                json!({"room_id": self.room_id, "user_id": user_id, "reconnect": true}),
            );
            return self.reconnect(&user_id, req_id, signal);
        }

        let user = RtcUser::new(
            self.room_id.clone(),
            user_id.clone(),
            user_name.clone(),
            Some(Arc::clone(&signal)),
            now_ms,
        );
        self.users.insert(user_id.clone(), user);
        self.log_event(
            "join",
            json!({"room_id": self.room_id, "user_id": user_id, "reconnect": false}),
        );
        info!(
            room_id = %self.room_id,
            user_id = %user_id,
            user_name = %user_name,
            "user joined room"
        );

        self.pilot.request(
            "join",
            to_json(&PilotJoinRequest {
                room_id: self.room_id.clone(),
                user_id: user_id.clone(),
                user_name,
            }),
        );

        signal.respond(req_id, self.join_response(&user_id));
        self.notify_new_user(&user_id);
        Ok(())
    }

    pub fn user_leave(&mut self, user_id: &UserId) -> Result<()> {
        let Some(user) = self.users.get_mut(user_id) else {
            error!(
                room_id = %self.room_id,
                user_id = %user_id,
                "cannot leave, user not in room"
            );
            return Err(Error::UnknownUser(user_id.clone()));
        };
        user.set_signal(None);
        info!(room_id = %self.room_id, user_id = %user_id, "user left room");
        self.log_event(
            "userLeave",
            json!({"room_id": self.room_id, "user_id": user_id}),
        );

        let notify = to_json(&UserGoneNotification {
            user_id: user_id.clone(),
            room_id: self.room_id.clone(),
        });
        self.notify_local_users(Some(user_id), "userLeave", &notify);
        self.pilot.notify(
            "userLeave",
            to_json(&PilotUserGoneNotification {
                room_id: self.room_id.clone(),
                user_id: user_id.clone(),
            }),
        );
        Ok(())
    }

    pub fn disconnect_user(&mut self, user_id: &UserId) -> Result<()> {
        let Some(user) = self.users.get_mut(user_id) else {
            error!(
                room_id = %self.room_id,
                user_id = %user_id,
                "cannot disconnect, user not in room"
            );
            return Err(Error::UnknownUser(user_id.clone()));
        };
        user.set_signal(None);
        info!(room_id = %self.room_id, user_id = %user_id, "user disconnected");
        self.log_event(
            "userDisconnect",
            json!({"room_id": self.room_id, "user_id": user_id}),
        );

        let notify = to_json(&UserGoneNotification {
            user_id: user_id.clone(),
            room_id: self.room_id.clone(),
        });
        self.notify_local_users(Some(user_id), "userDisconnect", &notify);
        self.pilot.notify(
            "userDisconnect",
            to_json(&PilotUserGoneNotification {
                room_id: self.room_id.clone(),
                user_id: user_id.clone(),
            }),
        );
        Ok(())
    }

    /// Answer a publisher's offer: set up a receive transport, register one
    /// `MediaPusher` per negotiated stream and advertise the new pushers to
    /// local peers and the pilot.
    pub fn handle_push_sdp(
        &mut self,
        user_id: &UserId,
        sdp_type: &str,
        sdp_str: &str,
        req_id: u64,
        signal: SharedSignal,
    ) -> Result<()> {
        let now_ms = crate::now_millis();
        self.last_alive_ms = now_ms;
        if !self.users.contains_key(user_id) {
            error!(
                room_id = %self.room_id,
                user_id = %user_id,
                "push from unknown user"
            );
            return Err(Error::UnknownUser(user_id.clone()));
        }

        let offer = RtcSdp::parse(sdp_type, sdp_str)?;
        debug!(
            room_id = %self.room_id,
            user_id = %user_id,
            media_sections = offer.media.len(),
            "handling push offer"
        );
        self.log_event(
            "pushSdp",
            json!({"room_id": self.room_id, "user_id": user_id}),
        );

        let negotiated = self.transports.create_transport(
            TransportRole::Recv,
            &self.room_id,
            user_id,
            offer.fingerprint.as_deref(),
        )?;
        let mut answer = offer.answer(&AnswerOptions {
            setup: Setup::Passive,
            direction: Direction::RecvOnly,
            ice_ufrag: negotiated.ice_ufrag.clone(),
            ice_pwd: negotiated.ice_pwd.clone(),
            fingerprint: negotiated.fingerprint.clone(),
        });
        answer.add_candidates(&self.config.candidates);

        let params = answer.rtp_session_params();
        if params.is_empty() {
            error!(
                room_id = %self.room_id,
                user_id = %user_id,
                "no usable RTP session params in offer"
            );
            return Err(Error::Sdp("no usable media sections".to_string()));
        }
        for param in &params {
            if self.ssrc_in_use(param.ssrc) {
                return Err(Error::SsrcInUse(param.ssrc));
            }
            if param.rtx_ssrc != 0 && self.ssrc_in_use(param.rtx_ssrc) {
                return Err(Error::SsrcInUse(param.rtx_ssrc));
            }
        }

        for param in &params {
            let pusher = MediaPusher::new(
                param.clone(),
                self.room_id.clone(),
                user_id.clone(),
                negotiated.session_id.clone(),
                Arc::clone(&negotiated.transport),
                Arc::clone(&self.events),
            );
            let pusher_id = pusher.pusher_id().clone();
            info!(
                room_id = %self.room_id,
                user_id = %user_id,
                pusher_id = %pusher_id,
                ssrc = param.ssrc,
                media_type = %param.av_type,
                "registered pusher"
            );
            if let Some(user) = self.users.get_mut(user_id) {
                user.update_heartbeat(now_ms);
                user.add_pusher(
                    pusher_id.clone(),
                    PushInfo {
                        pusher_id: pusher_id.clone(),
                        rtp_param: param.clone(),
                    },
                );
            }
            self.ssrc2pusher.insert(param.ssrc, pusher_id.clone());
            if param.rtx_ssrc != 0 {
                self.ssrc2pusher.insert(param.rtx_ssrc, pusher_id.clone());
            }
            self.pushers.insert(pusher_id, pusher);
        }

        let mut data = Map::new();
        data.insert("sdp".to_string(), Value::from(answer.to_sdp_string()));
        signal.respond(req_id, SignalResponse::ok("push success", data));

        let (user_name, push_infos) = match self.users.get(user_id) {
            Some(user) => (
                user.user_name().to_string(),
                user.pushers().values().cloned().collect::<Vec<_>>(),
            ),
            None => return Err(Error::UnknownUser(user_id.clone())),
        };
        self.notify_new_pusher(user_id, &user_name, &push_infos);
        self.pilot.notify(
            "push",
            to_json(&PilotPushNotification {
                room_id: self.room_id.clone(),
                user_id: user_id.clone(),
                user_name,
                publishers: push_infos,
            }),
        );
        Ok(())
    }

    /// Answer a subscriber's offer for locally published streams.
    pub fn handle_pull_sdp(
        &mut self,
        pull_info: &PullRequestInfo,
        sdp_type: &str,
        sdp_str: &str,
        req_id: u64,
        signal: SharedSignal,
    ) -> Result<()> {
        let now_ms = crate::now_millis();
        self.last_alive_ms = now_ms;
        info!(
            room_id = %self.room_id,
            target_user_id = %pull_info.target_user_id,
            src_user_id = %pull_info.src_user_id,
            pushers = pull_info.pushers.len(),
            "handling pull offer"
        );
        self.log_event(
            "pullSdp",
            json!({"room_id": self.room_id, "pull_info": to_json(pull_info)}),
        );
        if !self.users.contains_key(&pull_info.target_user_id) {
            error!(
                room_id = %self.room_id,
                user_id = %pull_info.target_user_id,
                "pull target user not in room"
            );
            return Err(Error::UnknownUser(pull_info.target_user_id.clone()));
        }

        let (mut answer, negotiated) = self.build_pull_answer(&pull_info.src_user_id, sdp_type, sdp_str)?;

        let mut pullers = Vec::new();
        for push_ref in &pull_info.pushers {
            let Some(pusher) = self.pushers.get(&push_ref.pusher_id) else {
                error!(
                    room_id = %self.room_id,
                    pusher_id = %push_ref.pusher_id,
                    src_user_id = %pull_info.src_user_id,
                    "pusher not found for pull request"
                );
                continue;
            };
            let param = subscriber_param(pusher.param(), &answer);
            pullers.push(MediaPuller::new(
                param,
                self.room_id.clone(),
                pull_info.src_user_id.clone(),
                pull_info.target_user_id.clone(),
                pusher.pusher_id().clone(),
                negotiated.session_id.clone(),
                Arc::clone(&negotiated.transport),
                Arc::clone(&self.events),
            ));
        }

        self.finish_pull(answer.as_mut(), pullers, req_id, &signal)
    }

    /// Answer a subscriber's offer for a remote user's streams: make sure a
    /// recv relay serves each referenced pusher (announcing our endpoint via
    /// the pilot), then subscribe against the relay's stream metadata.
    /// Relay setup is best-effort per pusher.
    pub fn handle_remote_pull_sdp(
        &mut self,
        pusher_user_id: &UserId,
        pull_info: &PullRequestInfo,
        sdp_type: &str,
        sdp_str: &str,
        req_id: u64,
        signal: SharedSignal,
    ) -> Result<()> {
        let now_ms = crate::now_millis();
        self.last_alive_ms = now_ms;
        info!(
            room_id = %self.room_id,
            pusher_user_id = %pusher_user_id,
            src_user_id = %pull_info.src_user_id,
            pushers = pull_info.pushers.len(),
            "handling remote pull offer"
        );
        self.log_event(
            "remotePullSdp",
            json!({
                "room_id": self.room_id,
                "pusher_user_id": pusher_user_id,
                "pull_info": to_json(pull_info),
            }),
        );

        for push_ref in &pull_info.pushers {
            let full_info = match self.users.get(pusher_user_id) {
                Some(user) => user.get_pusher(&push_ref.pusher_id).cloned(),
                None => {
                    error!(
                        room_id = %self.room_id,
                        user_id = %pusher_user_id,
                        "remote pull target user not in room"
                    );
                    continue;
                }
            };
            let Some(full_info) = full_info else {
                error!(
                    room_id = %self.room_id,
                    user_id = %pusher_user_id,
                    pusher_id = %push_ref.pusher_id,
                    "pusher not advertised by remote user"
                );
                continue;
            };
            if let Err(e) = self.pull_remote_pusher(pusher_user_id, &full_info) {
                error!(
                    room_id = %self.room_id,
                    user_id = %pusher_user_id,
                    pusher_id = %full_info.pusher_id,
                    error = %e,
                    "relay setup for remote pusher failed"
                );
            }
        }

        let (mut answer, negotiated) = self.build_pull_answer(&pull_info.src_user_id, sdp_type, sdp_str)?;

        let mut pullers = Vec::new();
        for push_ref in &pull_info.pushers {
            let Some(relay) = self.recv_relays_by_pusher.get(&push_ref.pusher_id) else {
                error!(
                    room_id = %self.room_id,
                    pusher_id = %push_ref.pusher_id,
                    src_user_id = %pull_info.src_user_id,
                    "no recv relay for remote pull"
                );
                continue;
            };
            let Some(info) = relay.get_push_info(&push_ref.pusher_id) else {
                error!(
                    room_id = %self.room_id,
                    pusher_id = %push_ref.pusher_id,
                    src_user_id = %pull_info.src_user_id,
                    "recv relay has no push info for pusher"
                );
                continue;
            };
            let param = subscriber_param(&info.rtp_param, &answer);
            pullers.push(MediaPuller::new(
                param,
                self.room_id.clone(),
                pull_info.src_user_id.clone(),
                pusher_user_id.clone(),
                info.pusher_id.clone(),
                negotiated.session_id.clone(),
                Arc::clone(&negotiated.transport),
                Arc::clone(&self.events),
            ));
        }

        self.finish_pull(answer.as_mut(), pullers, req_id, &signal)
    }

    pub fn handle_ws_heartbeat(&mut self, user_id: &UserId) -> Result<()> {
        let now_ms = crate::now_millis();
        self.last_alive_ms = now_ms;
        let Some(user) = self.users.get_mut(user_id) else {
            error!(
                room_id = %self.room_id,
                user_id = %user_id,
                "heartbeat from unknown user"
            );
            return Err(Error::UnknownUser(user_id.clone()));
        };
        debug!(room_id = %self.room_id, user_id = %user_id, "heartbeat");
        user.update_heartbeat(now_ms);
        Ok(())
    }

    /// Fan a chat message out to the other local users and to the pilot.
    pub fn handle_text_message(&mut self, from_user_id: &UserId, message: &str) -> Result<()> {
        self.last_alive_ms = crate::now_millis();
        let Some(user) = self.users.get(from_user_id) else {
            error!(
                room_id = %self.room_id,
                user_id = %from_user_id,
                "text message from unknown user"
            );
            return Err(Error::UnknownUser(from_user_id.clone()));
        };
        let user_name = user.user_name().to_string();
        let notify = to_json(&TextMessageNotification {
            user_id: from_user_id.clone(),
            user_name: user_name.clone(),
            room_id: self.room_id.clone(),
            message: message.to_string(),
        });
        self.notify_local_users(Some(from_user_id), "textMessage", &notify);
        self.pilot.notify(
            "textMessage",
            to_json(&PilotTextMessageNotification {
                room_id: self.room_id.clone(),
                user_id: from_user_id.clone(),
                user_name,
                message: message.to_string(),
            }),
        );
        Ok(())
    }

    // ---- media-plane ingress --------------------------------------------

    /// Entry point for RTP arriving on a publisher's WebRTC transport.
    pub fn handle_publisher_rtp(&mut self, pkt: &mut RtpPacket) -> Result<()> {
        let ssrc = pkt.ssrc();
        let Some(pusher_id) = self.ssrc2pusher.get(&ssrc).cloned() else {
            error!(
                room_id = %self.room_id,
                ssrc,
                "RTP from publisher with unknown ssrc"
            );
            return Err(Error::UnknownSsrc(ssrc));
        };
        let now_ms = crate::now_millis();
        let (ingress, user_id, session_id) = {
            let Some(pusher) = self.pushers.get_mut(&pusher_id) else {
                return Err(Error::UnknownPusher(pusher_id));
            };
            (
                pusher.handle_rtp_packet(pkt, now_ms)?,
                pusher.user_id().clone(),
                pusher.session_id().clone(),
            )
        };
        if ingress == PusherIngress::Forward {
            self.on_rtp_packet_from_rtc_pusher(&user_id, &session_id, &pusher_id, pkt);
        }
        Ok(())
    }

    /// Entry point for a sender report arriving on a publisher's transport.
    pub fn handle_publisher_rtcp_sr(&mut self, sr: &SenderReport) -> Result<()> {
        let Some(pusher_id) = self.ssrc2pusher.get(&sr.ssrc).cloned() else {
            error!(room_id = %self.room_id, ssrc = sr.ssrc, "SR with unknown ssrc");
            return Err(Error::UnknownSsrc(sr.ssrc));
        };
        match self.pushers.get_mut(&pusher_id) {
            Some(pusher) => pusher.handle_rtcp_sr(sr),
            None => Err(Error::UnknownPusher(pusher_id)),
        }
    }

    /// Entry point for RTCP arriving on a subscriber's WebRTC transport:
    /// RR and NACK go to the matching puller, PLI turns into a key-frame
    /// request toward the publisher.
    pub fn handle_subscriber_rtcp(&mut self, puller_user_id: &UserId, data: &[u8]) {
        let now_ms = crate::now_millis();
        for item in crate::rtp::rtcp::scan_compound(data) {
            match item {
                RtcpItem::Rr(rr) => {
                    for block in &rr.blocks {
                        if let Some(puller) =
                            self.find_puller_mut(puller_user_id, block.ssrc)
                        {
                            puller.handle_rtcp_rr_block(block);
                        }
                    }
                }
                RtcpItem::Nack(nack) => {
                    match self.find_puller_mut(puller_user_id, nack.media_ssrc) {
                        Some(puller) => {
                            puller.handle_rtcp_fb_nack(&nack, now_ms);
                        }
                        None => {
                            error!(
                                room_id = %self.room_id,
                                user_id = %puller_user_id,
                                ssrc = nack.media_ssrc,
                                "NACK for unknown subscription"
                            );
                        }
                    }
                }
                RtcpItem::Pli(pli) => {
                    let local = self
                        .ssrc2pusher
                        .get(&pli.media_ssrc)
                        .cloned()
                        .map(|pusher_id| {
                            let user = self
                                .pushers
                                .get(&pusher_id)
                                .map(|p| p.user_id().clone());
                            (pusher_id, user)
                        });
                    let resolved = match local {
                        Some((pusher_id, Some(user))) => Some((pusher_id, user)),
                        _ => self
                            .remote_ssrc2pusher
                            .get(&pli.media_ssrc)
                            .cloned()
                            .and_then(|pusher_id| {
                                self.recv_relays_by_pusher
                                    .get(&pusher_id)
                                    .map(|relay| (pusher_id, relay.push_user_id().clone()))
                            }),
                    };
                    match resolved {
                        Some((pusher_id, pusher_user_id)) => {
                            let pusher_user_id = pusher_user_id.clone();
                            self.on_key_frame_request(
                                &pusher_id,
                                puller_user_id,
                                &pusher_user_id,
                                pli.media_ssrc,
                            );
                        }
                        None => {
                            error!(
                                room_id = %self.room_id,
                                user_id = %puller_user_id,
                                ssrc = pli.media_ssrc,
                                "PLI for unknown ssrc"
                            );
                        }
                    }
                }
                other => {
                    debug!(
                        room_id = %self.room_id,
                        user_id = %puller_user_id,
                        item = ?other,
                        "ignoring subscriber RTCP item"
                    );
                }
            }
        }
    }

    /// Fan one local publisher's packet out to every subscriber and, when a
    /// peer instance subscribed through the pilot, to the send relay.
    pub fn on_rtp_packet_from_rtc_pusher(
        &mut self,
        user_id: &UserId,
        session_id: &SessionId,
        pusher_id: &PusherId,
        pkt: &mut RtpPacket,
    ) {
        debug!(
            room_id = %self.room_id,
            user_id = %user_id,
            session_id = %session_id,
            pusher_id = %pusher_id,
            len = pkt.len(),
            ssrc = pkt.ssrc(),
            seq = pkt.seq(),
            "RTP from local pusher"
        );
        let now_ms = crate::now_millis();
        self.last_alive_ms = now_ms;
        if let Some(user) = self.users.get_mut(user_id) {
            user.update_heartbeat(now_ms);
        }

        let mut puller_users = Vec::new();
        if let Some(pullers) = self.pusher2pullers.get_mut(pusher_id) {
            for puller in pullers.values_mut() {
                puller.on_transport_send_rtp(pkt, now_ms);
                puller_users.push(puller.puller_user_id().clone());
            }
        }
        for puller_user in puller_users {
            if let Some(user) = self.users.get_mut(&puller_user) {
                user.update_heartbeat(now_ms);
            }
        }

        if let Some(relay) = self.send_relays.get(user_id) {
            relay.send_rtp_packet(pkt, now_ms);
        }
    }

    /// Fan one remote publisher's packet (arriving over a recv relay) out
    /// to the local subscribers.
    pub fn on_rtp_packet_from_remote_rtc_pusher(
        &mut self,
        pusher_user_id: &UserId,
        pusher_id: &PusherId,
        pkt: &mut RtpPacket,
    ) {
        let now_ms = crate::now_millis();
        self.last_alive_ms = now_ms;
        if let Some(user) = self.users.get_mut(pusher_user_id) {
            user.update_heartbeat(now_ms);
        }
        debug!(
            room_id = %self.room_id,
            pusher_user_id = %pusher_user_id,
            pusher_id = %pusher_id,
            len = pkt.len(),
            ssrc = pkt.ssrc(),
            seq = pkt.seq(),
            "RTP from remote pusher"
        );

        let mut puller_users = Vec::new();
        match self.pusher2pullers.get_mut(pusher_id) {
            Some(pullers) => {
                for puller in pullers.values_mut() {
                    puller.on_transport_send_rtp(pkt, now_ms);
                    puller_users.push(puller.puller_user_id().clone());
                }
            }
            None => {
                error!(
                    room_id = %self.room_id,
                    pusher_user_id = %pusher_user_id,
                    pusher_id = %pusher_id,
                    "no pullers for remote pusher"
                );
            }
        }
        for puller_user in puller_users {
            if let Some(user) = self.users.get_mut(&puller_user) {
                user.update_heartbeat(now_ms);
            }
        }
    }

    pub fn on_push_close(&mut self, pusher_id: &PusherId) {
        info!(room_id = %self.room_id, pusher_id = %pusher_id, "push closed");
        if let Some(pusher) = self.pushers.remove(pusher_id) {
            self.ssrc2pusher.remove(&pusher.param().ssrc);
            if pusher.param().rtx_ssrc != 0 {
                self.ssrc2pusher.remove(&pusher.param().rtx_ssrc);
            }
        }
    }

    pub fn on_pull_close(&mut self, puller_id: &PullerId) {
        info!(room_id = %self.room_id, puller_id = %puller_id, "pull closed");
        for pullers in self.pusher2pullers.values_mut() {
            if pullers.remove(puller_id).is_some() {
                break;
            }
        }
    }

    /// Route a key-frame request to the publisher: through the recv relay
    /// for a remote publisher, directly to the pusher otherwise.
    pub fn on_key_frame_request(
        &mut self,
        pusher_id: &PusherId,
        puller_user_id: &UserId,
        pusher_user_id: &UserId,
        ssrc: u32,
    ) {
        info!(
            room_id = %self.room_id,
            pusher_id = %pusher_id,
            puller_user_id = %puller_user_id,
            pusher_user_id = %pusher_user_id,
            ssrc,
            "key-frame request"
        );
        let Some(user) = self.users.get(pusher_user_id) else {
            error!(
                room_id = %self.room_id,
                user_id = %pusher_user_id,
                "key-frame request for unknown publisher user"
            );
            return;
        };
        if user.is_remote() {
            match self.recv_relays_by_user.get(pusher_user_id) {
                Some(relay) => {
                    if let Err(e) = relay.request_key_frame(ssrc) {
                        error!(
                            room_id = %self.room_id,
                            user_id = %pusher_user_id,
                            ssrc,
                            error = %e,
                            "relayed key-frame request failed"
                        );
                    }
                }
                None => {
                    error!(
                        room_id = %self.room_id,
                        user_id = %pusher_user_id,
                        "no recv relay for remote key-frame request"
                    );
                }
            }
            return;
        }
        let now_ms = crate::now_millis();
        match self.pushers.get_mut(pusher_id) {
            Some(pusher) => {
                if let Err(e) = pusher.request_key_frame(ssrc, now_ms) {
                    error!(
                        room_id = %self.room_id,
                        pusher_id = %pusher_id,
                        ssrc,
                        error = %e,
                        "key-frame request failed"
                    );
                }
            }
            None => {
                error!(
                    room_id = %self.room_id,
                    pusher_id = %pusher_id,
                    "no pusher for key-frame request"
                );
            }
        }
    }

    // ---- pilot inbound ---------------------------------------------------

    /// A remote user entered the room on another instance.
    pub fn handle_new_user_notification_from_center(&mut self, data: Value) {
        self.last_alive_ms = crate::now_millis();
        let notification: PilotNewUserNotification = match serde_json::from_value(data) {
            Ok(n) => n,
            Err(e) => {
                error!(room_id = %self.room_id, error = %e, "malformed newUser notification");
                return;
            }
        };
        if self.users.contains_key(&notification.user_id) {
            error!(
                room_id = %self.room_id,
                user_id = %notification.user_id,
                "newUser notification for existing user"
            );
            return;
        }
        self.log_event(
            "newUserFromCenter",
            json!({
                "room_id": self.room_id,
                "user_id": notification.user_id,
                "user_name": notification.user_name,
            }),
        );
        self.insert_remote_user(notification.user_id.clone(), notification.user_name);
        self.notify_new_user(&notification.user_id);
    }

    /// A remote user published new streams on another instance.
    pub fn handle_new_pusher_notification_from_center(&mut self, data: Value) {
        self.last_alive_ms = crate::now_millis();
        info!(room_id = %self.room_id, "newPusher notification from pilot");
        let notification: PilotNewPusherNotification = match serde_json::from_value(data) {
            Ok(n) => n,
            Err(e) => {
                error!(room_id = %self.room_id, error = %e, "malformed newPusher notification");
                return;
            }
        };
        let Some(user) = self.users.get_mut(&notification.user_id) else {
            error!(
                room_id = %self.room_id,
                user_id = %notification.user_id,
                "newPusher notification for unknown user"
            );
            return;
        };
        user.set_remote(true);
        let user_name = user.user_name().to_string();

        let mut push_infos = Vec::new();
        for pusher_json in notification.pushers {
            match serde_json::from_value::<PushInfo>(pusher_json) {
                Ok(info) => {
                    user.add_pusher(info.pusher_id.clone(), info.clone());
                    push_infos.push(info);
                }
                Err(e) => {
                    error!(
                        room_id = %self.room_id,
                        user_id = %notification.user_id,
                        error = %e,
                        "skipping malformed pusher entry"
                    );
                }
            }
        }

        self.log_event(
            "newPusherFromCenter",
            json!({
                "room_id": self.room_id,
                "user_id": notification.user_id,
                "user_name": user_name,
                "pushers": to_json(&push_infos),
            }),
        );
        self.notify_new_pusher(&notification.user_id, &user_name, &push_infos);
    }

    /// A peer instance wants one of our local pushers: start (or extend)
    /// the send relay toward its announced UDP endpoint.
    pub fn handle_pull_remote_stream_notification_from_center(
        &mut self,
        data: Value,
    ) -> Result<()> {
        let now_ms = crate::now_millis();
        self.last_alive_ms = now_ms;
        let notification: PullRemoteStreamNotification = serde_json::from_value(data)
            .map_err(|e| Error::Payload(format!("malformed pullRemoteStream: {e}")))?;
        self.log_event(
            "pullFromCenter",
            json!({
                "room_id": self.room_id,
                "pusher_user_id": notification.pusher_user_id,
                "push_info": to_json(&notification.push_info),
            }),
        );

        let relay = match self.send_relays.get(&notification.pusher_user_id) {
            Some(relay) => Arc::clone(relay),
            None => {
                let relay = RtcSendRelay::spawn(
                    self.room_id.clone(),
                    notification.pusher_user_id.clone(),
                    &notification.udp_ip,
                    notification.udp_port,
                    &self.config.relay.bind_ip,
                    &self.ports,
                    self.config.relay.send_discard_percent,
                    self.weak_self.clone(),
                    Arc::clone(&self.events),
                    now_ms,
                )?;
                self.send_relays
                    .insert(notification.pusher_user_id.clone(), Arc::clone(&relay));
                relay
            }
        };
        relay.add_push_info(notification.push_info);
        Ok(())
    }

    /// A remote user disconnected on its home instance.
    pub fn handle_user_disconnect_notification_from_center(&mut self, data: Value) {
        self.handle_remote_user_gone(data, "userDisconnect");
    }

    /// A remote user left on its home instance.
    pub fn handle_user_leave_notification_from_center(&mut self, data: Value) {
        self.handle_remote_user_gone(data, "userLeave");
    }

    /// Chat relayed from another instance.
    pub fn handle_text_message_notification_from_center(&mut self, data: Value) {
        let notification: PilotTextMessageNotification = match serde_json::from_value(data) {
            Ok(n) => n,
            Err(e) => {
                error!(room_id = %self.room_id, error = %e, "malformed textMessage notification");
                return;
            }
        };
        info!(
            room_id = %self.room_id,
            from_user_id = %notification.user_id,
            "text message from pilot"
        );
        let notify = to_json(&TextMessageNotification {
            user_id: notification.user_id.clone(),
            user_name: notification.user_name,
            room_id: self.room_id.clone(),
            message: notification.message,
        });
        self.notify_local_users(Some(&notification.user_id), "textMessage", &notify);
    }

    /// Response to an earlier pilot request. Responses arriving after close
    /// are dropped.
    pub fn on_pilot_response(&mut self, req_id: u64, method: &str, data: Value) {
        if self.closed {
            debug!(
                room_id = %self.room_id,
                req_id,
                method,
                "dropping pilot response, room is closed"
            );
            return;
        }
        info!(room_id = %self.room_id, req_id, method, "pilot response");
        match method {
            "join" => self.handle_join_response(data),
            _ => {
                error!(
                    room_id = %self.room_id,
                    method,
                    "pilot response for unknown method"
                );
            }
        }
    }

    // ---- timer -----------------------------------------------------------

    /// One liveness tick: evict dead local users and dead recv relays, then
    /// drive the per-stream statistics/PLI timers.
    pub fn on_timer(&mut self, now_ms: i64) {
        if !self.users.is_empty() {
            self.last_alive_ms = now_ms;
        }

        let expired: Vec<UserId> = self
            .users
            .iter()
            .filter(|(_, user)| !user.is_remote() && !user.is_alive(now_ms))
            .map(|(id, _)| id.clone())
            .collect();
        for user_id in expired {
            warn!(
                room_id = %self.room_id,
                user_id = %user_id,
                "user heartbeat timeout, releasing"
            );
            self.release_user_resources(&user_id);
        }

        let dead_relays: Vec<(UserId, Vec<PusherId>)> = self
            .recv_relays_by_user
            .iter()
            .filter(|(_, relay)| !relay.is_alive(now_ms))
            .map(|(user_id, relay)| (user_id.clone(), relay.pusher_ids()))
            .collect();
        for (user_id, pusher_ids) in dead_relays {
            warn!(
                room_id = %self.room_id,
                pusher_user_id = %user_id,
                "recv relay timeout, removing"
            );
            self.recv_relays_by_user.remove(&user_id);
            for pusher_id in pusher_ids {
                self.recv_relays_by_pusher.remove(&pusher_id);
                self.pusher2pullers.remove(&pusher_id);
                self.remote_ssrc2pusher.retain(|_, id| id != &pusher_id);
            }
        }

        for pusher in self.pushers.values_mut() {
            pusher.on_timer(now_ms);
        }
        for pullers in self.pusher2pullers.values_mut() {
            for puller in pullers.values_mut() {
                puller.on_timer(now_ms);
            }
        }
    }

    // ---- internals -------------------------------------------------------

    fn reconnect(&mut self, user_id: &UserId, req_id: u64, signal: SharedSignal) -> Result<()> {
        let now_ms = crate::now_millis();
        let user_name = {
            let Some(user) = self.users.get_mut(user_id) else {
                return Err(Error::UnknownUser(user_id.clone()));
            };
            user.set_signal(Some(Arc::clone(&signal)));
            user.update_heartbeat(now_ms);
            user.user_name().to_string()
        };

        let notify = to_json(&UserReconnectNotification {
            user_id: user_id.clone(),
            user_name: user_name.clone(),
            room_id: self.room_id.clone(),
        });
        self.notify_local_users(Some(user_id), "userReConnect", &notify);

        info!(room_id = %self.room_id, user_id = %user_id, "user reconnected");
        self.pilot.notify(
            "userReConnect",
            to_json(&PilotReconnectNotification {
                room_id: self.room_id.clone(),
                user_id: user_id.clone(),
                user_name,
            }),
        );

        signal.respond(req_id, self.join_response(user_id));
        Ok(())
    }

    /// Snapshot of every other participant, each with their pushers.
    fn join_response(&self, joining_user_id: &UserId) -> SignalResponse {
        let users: Vec<_> = self
            .users
            .iter()
            .filter(|(id, _)| *id != joining_user_id)
            .map(|(_, user)| user.snapshot())
            .collect();
        let mut data = Map::new();
        data.insert("users".to_string(), to_json(&users));
        SignalResponse::ok("join success", data)
    }

    fn notify_local_users(&self, exclude: Option<&UserId>, method: &str, data: &Value) {
        for (user_id, user) in &self.users {
            if exclude == Some(user_id) {
                continue;
            }
            if user.is_remote() {
                continue;
            }
            if let Some(signal) = user.signal() {
                signal.notify(method, data.clone());
            }
        }
    }

    fn notify_new_user(&mut self, user_id: &UserId) {
        let Some(user) = self.users.get(user_id) else {
            error!(
                room_id = %self.room_id,
                user_id = %user_id,
                "cannot announce unknown user"
            );
            return;
        };
        self.last_alive_ms = crate::now_millis();
        let payload = Value::Array(vec![to_json(&user.snapshot())]);
        self.log_event(
            "newUser",
            json!({"room_id": self.room_id, "new_user_id": user_id}),
        );
        self.notify_local_users(Some(user_id), "newUser", &payload);
    }

    fn notify_new_pusher(&mut self, pusher_user_id: &UserId, user_name: &str, push_infos: &[PushInfo]) {
        self.last_alive_ms = crate::now_millis();
        let payload = to_json(&NewPusherNotification {
            user_id: pusher_user_id.clone(),
            user_name: user_name.to_string(),
            room_id: self.room_id.clone(),
            pushers: push_infos.to_vec(),
        });
        self.log_event(
            "newPusher",
            json!({
                "room_id": self.room_id,
                "pusher_user_id": pusher_user_id,
                "push_info": to_json(&push_infos),
            }),
        );
        self.notify_local_users(Some(pusher_user_id), "newPusher", &payload);
    }

    fn build_pull_answer(
        &mut self,
        src_user_id: &UserId,
        sdp_type: &str,
        sdp_str: &str,
    ) -> Result<(Box<RtcSdp>, NegotiatedTransport)> {
        let offer = RtcSdp::parse(sdp_type, sdp_str)?;
        let negotiated = self.transports.create_transport(
            TransportRole::Send,
            &self.room_id,
            src_user_id,
            offer.fingerprint.as_deref(),
        )?;
        let mut answer = offer.answer(&AnswerOptions {
            setup: Setup::Passive,
            direction: Direction::SendOnly,
            ice_ufrag: negotiated.ice_ufrag.clone(),
            ice_pwd: negotiated.ice_pwd.clone(),
            fingerprint: negotiated.fingerprint.clone(),
        });
        answer.add_candidates(&self.config.candidates);
        Ok((Box::new(answer), negotiated))
    }

    fn finish_pull(
        &mut self,
        answer: &mut RtcSdp,
        pullers: Vec<MediaPuller>,
        req_id: u64,
        signal: &SharedSignal,
    ) -> Result<()> {
        let params: Vec<RtpSessionParam> =
            pullers.iter().map(|puller| puller.param().clone()).collect();
        answer.apply_puller_params(&params);

        for puller in pullers {
            self.pusher2pullers
                .entry(puller.pusher_id().clone())
                .or_default()
                .insert(puller.puller_id().clone(), puller);
        }

        let mut data = Map::new();
        data.insert("sdp".to_string(), Value::from(answer.to_sdp_string()));
        signal.respond(req_id, SignalResponse::ok("pull success", data));
        Ok(())
    }

    /// Make sure a recv relay serves `push_info` for the remote publisher
    /// and tell the pilot where it listens.
    fn pull_remote_pusher(&mut self, pusher_user_id: &UserId, push_info: &PushInfo) -> Result<()> {
        self.last_alive_ms = crate::now_millis();
        let relay = self.create_or_get_recv_relay(pusher_user_id, &push_info.pusher_id)?;
        relay.add_virtual_pusher(push_info.clone());
        self.remote_ssrc2pusher
            .insert(push_info.rtp_param.ssrc, push_info.pusher_id.clone());
        if push_info.rtp_param.rtx_ssrc != 0 {
            self.remote_ssrc2pusher
                .insert(push_info.rtp_param.rtx_ssrc, push_info.pusher_id.clone());
        }

        let notification = PullRemoteStreamNotification {
            room_id: self.room_id.clone(),
            pusher_user_id: pusher_user_id.clone(),
            udp_ip: relay.listen_udp_ip().to_string(),
            udp_port: relay.listen_udp_port(),
            media_type: push_info.rtp_param.av_type.as_str().to_string(),
            push_info: push_info.clone(),
        };
        self.log_event(
            "pullRemoteStream",
            json!({
                "room_id": self.room_id,
                "pusher_user_id": pusher_user_id,
                "pull_request": to_json(&notification.push_info),
            }),
        );
        self.pilot.notify("pullRemoteStream", to_json(&notification));
        Ok(())
    }

    fn create_or_get_recv_relay(
        &mut self,
        pusher_user_id: &UserId,
        pusher_id: &PusherId,
    ) -> Result<Arc<RtcRecvRelay>> {
        let relay = match self.recv_relays_by_user.get(pusher_user_id) {
            Some(relay) => Arc::clone(relay),
            None => {
                let relay = RtcRecvRelay::spawn(
                    self.room_id.clone(),
                    pusher_user_id.clone(),
                    &self.config.relay.bind_ip,
                    &self.ports,
                    self.config.relay.recv_discard_percent,
                    self.weak_self.clone(),
                    Arc::clone(&self.events),
                    crate::now_millis(),
                )?;
                self.recv_relays_by_user
                    .insert(pusher_user_id.clone(), Arc::clone(&relay));
                relay
            }
        };
        self.recv_relays_by_pusher
            .insert(pusher_id.clone(), Arc::clone(&relay));
        Ok(relay)
    }

    fn handle_join_response(&mut self, data: Value) {
        let response: PilotJoinResponse = match serde_json::from_value(data) {
            Ok(r) => r,
            Err(e) => {
                error!(room_id = %self.room_id, error = %e, "malformed join response");
                return;
            }
        };
        if response.room_id != self.room_id {
            error!(
                room_id = %self.room_id,
                response_room_id = %response.room_id,
                "join response for a different room"
            );
            return;
        }
        for snapshot in response.users {
            // a preceding newUser notification may have inserted the user
            // already; the join response is idempotent over the roster
            if self.users.contains_key(&snapshot.user_id) {
                continue;
            }
            info!(
                room_id = %self.room_id,
                user_id = %snapshot.user_id,
                pushers = snapshot.pushers.len(),
                "remote user from join response"
            );
            self.insert_remote_user(snapshot.user_id.clone(), snapshot.user_name);
            if let Some(user) = self.users.get_mut(&snapshot.user_id) {
                for info in snapshot.pushers {
                    user.add_pusher(info.pusher_id.clone(), info);
                }
            }
            self.notify_new_user(&snapshot.user_id);
        }
    }

    fn insert_remote_user(&mut self, user_id: UserId, user_name: String) {
        let mut user = RtcUser::new(
            self.room_id.clone(),
            user_id.clone(),
            user_name,
            None,
            crate::now_millis(),
        );
        user.set_remote(true);
        info!(
            room_id = %self.room_id,
            user_id = %user_id,
            "remote user added"
        );
        self.users.insert(user_id, user);
    }

    fn handle_remote_user_gone(&mut self, data: Value, method: &str) {
        let notification: PilotUserGoneInbound = match serde_json::from_value(data) {
            Ok(n) => n,
            Err(e) => {
                error!(room_id = %self.room_id, error = %e, method, "malformed notification");
                return;
            }
        };
        let user_id = notification.user_id;
        info!(room_id = %self.room_id, user_id = %user_id, method, "remote user gone");
        match self.users.get(&user_id) {
            None => {
                error!(
                    room_id = %self.room_id,
                    user_id = %user_id,
                    method,
                    "notification for unknown user"
                );
                return;
            }
            Some(user) if !user.is_remote() => {
                error!(
                    room_id = %self.room_id,
                    user_id = %user_id,
                    method,
                    "pilot reported a local user as gone"
                );
                return;
            }
            Some(_) => {}
        }
        self.log_event(
            &format!("{method}FromCenter"),
            json!({"room_id": self.room_id, "user_id": user_id}),
        );
        let notify = to_json(&UserGoneNotification {
            user_id: user_id.clone(),
            room_id: self.room_id.clone(),
        });
        self.notify_local_users(Some(&user_id), method, &notify);
        self.release_remote_user(&user_id);
    }

    /// Tear down everything owned by an evicted local user.
    fn release_user_resources(&mut self, user_id: &UserId) {
        if let Err(e) = self.user_leave(user_id) {
            debug!(
                room_id = %self.room_id,
                user_id = %user_id,
                error = %e,
                "leave during release failed"
            );
        }
        if self.users.remove(user_id).is_none() {
            return;
        }
        info!(room_id = %self.room_id, user_id = %user_id, "released user");

        let owned: Vec<PusherId> = self
            .pushers
            .iter()
            .filter(|(_, pusher)| pusher.user_id() == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        for pusher_id in owned {
            info!(
                room_id = %self.room_id,
                user_id = %user_id,
                pusher_id = %pusher_id,
                "removing pusher of released user"
            );
            if let Some(pusher) = self.pushers.remove(&pusher_id) {
                self.ssrc2pusher.remove(&pusher.param().ssrc);
                if pusher.param().rtx_ssrc != 0 {
                    self.ssrc2pusher.remove(&pusher.param().rtx_ssrc);
                }
            }
            self.pusher2pullers.remove(&pusher_id);
        }

        if self.send_relays.remove(user_id).is_some() {
            info!(
                room_id = %self.room_id,
                user_id = %user_id,
                "removed send relay of released user"
            );
        }

        for pullers in self.pusher2pullers.values_mut() {
            pullers.retain(|puller_id, puller| {
                let keep = puller.puller_user_id() != user_id;
                if !keep {
                    info!(
                        room_id = %self.room_id,
                        user_id = %user_id,
                        puller_id = %puller_id,
                        "removing puller of released user"
                    );
                }
                keep
            });
        }
    }

    /// Tear down a remote user's shadow state: relays and subscriptions.
    fn release_remote_user(&mut self, user_id: &UserId) {
        let Some(user) = self.users.remove(user_id) else {
            return;
        };
        info!(room_id = %self.room_id, user_id = %user_id, "released remote user");
        for pusher_id in user.pushers().keys() {
            self.recv_relays_by_pusher.remove(pusher_id);
            self.pusher2pullers.remove(pusher_id);
            self.remote_ssrc2pusher.retain(|_, id| id != pusher_id);
        }
        self.recv_relays_by_user.remove(user_id);
    }

    fn find_puller_mut(&mut self, puller_user_id: &UserId, ssrc: u32) -> Option<&mut MediaPuller> {
        self.pusher2pullers.values_mut().find_map(|pullers| {
            pullers.values_mut().find(|puller| {
                puller.puller_user_id() == puller_user_id && puller.param().ssrc == ssrc
            })
        })
    }

    fn ssrc_in_use(&self, ssrc: u32) -> bool {
        self.ssrc2pusher.contains_key(&ssrc) || self.remote_ssrc2pusher.contains_key(&ssrc)
    }

    fn log_event(&self, event: &str, data: Value) {
        self.events.log(event, stamped(event, data));
    }

    // test-facing introspection

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn has_user(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    #[must_use]
    pub fn pusher_count(&self) -> usize {
        self.pushers.len()
    }

    #[must_use]
    pub fn puller_count(&self, pusher_id: &PusherId) -> usize {
        self.pusher2pullers
            .get(pusher_id)
            .map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn send_relay_count(&self) -> usize {
        self.send_relays.len()
    }

    #[must_use]
    pub fn recv_relay_count(&self) -> usize {
        self.recv_relays_by_user.len()
    }

    #[must_use]
    pub fn recv_relay_endpoint(&self, pusher_user_id: &UserId) -> Option<(String, u16)> {
        self.recv_relays_by_user
            .get(pusher_user_id)
            .map(|relay| (relay.listen_udp_ip().to_string(), relay.listen_udp_port()))
    }

    #[must_use]
    pub fn pusher_ids_of(&self, user_id: &UserId) -> Vec<PusherId> {
        self.users
            .get(user_id)
            .map(|user| user.pushers().keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

async fn timer_loop(weak: WeakRoom) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(TIMER_INTERVAL_MS));
    loop {
        ticker.tick().await;
        let Some(room) = weak.upgrade() else {
            break;
        };
        let mut room = room.lock();
        if room.is_closed() {
            break;
        }
        room.on_timer(crate::now_millis());
    }
}

/// Subscriber-side copy of a publisher's param: the stream identity stays
/// the publisher's, the mid and extension ids come from the subscriber's
/// negotiated answer.
fn subscriber_param(publisher: &RtpSessionParam, answer: &RtcSdp) -> RtpSessionParam {
    let mut param = publisher.clone();
    if let Some(section) = answer
        .media
        .iter()
        .find(|section| section.av_type == publisher.av_type)
    {
        param.mid = section.mid.as_deref().and_then(|mid| mid.parse().ok());
        param.mid_ext_id = section.mid_ext_id();
        param.tcc_ext_id = section.tcc_ext_id();
        param.abs_send_time_ext_id = section.abs_send_time_ext_id();
    }
    param
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
