//! End-to-end room flows with fake signaling, pilot and transports.
//! Relay scenarios exercise real UDP sockets on loopback.

use chorus_sfu::error::Result;
use chorus_sfu::param::{AvType, PullRequestInfo, PushInfo, RtpSessionParam};
use chorus_sfu::pilot::PilotClient;
use chorus_sfu::room::{Room, SharedRoom};
use chorus_sfu::rtp::rtcp::Pli;
use chorus_sfu::rtp::RtpPacket;
use chorus_sfu::signal::{SignalResponse, SignalSender};
use chorus_sfu::transport::{
    MediaTransport, NegotiatedTransport, TransportFactory, TransportRole,
};
use chorus_sfu::{
    IceCandidateConfig, NoopEventSink, PusherId, RelayConfig, RoomId, SessionId, SfuConfig, UserId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

const VIDEO_OFFER_A: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:pubA\r\n\
a=ice-pwd:pubApwd\r\n\
a=fingerprint:sha-256 AA:BB:CC\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=extmap:1 urn:ietf:params:rtp-hdrext:sdes:mid\r\n\
a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 H264/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtcp-fb:96 nack pli\r\n\
a=fmtp:96 profile-level-id=42e01f;packetization-mode=1\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=ssrc-group:FID 100 101\r\n\
a=ssrc:100 cname:alice\r\n\
a=ssrc:100 msid:streamA trackA\r\n\
a=ssrc:101 cname:alice\r\n";

// subscriber offer: no ssrcs, its own extmap ids
const SUB_OFFER_B: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:subB\r\n\
a=ice-pwd:subBpwd\r\n\
a=fingerprint:sha-256 DD:EE:FF\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=extmap:2 urn:ietf:params:rtp-hdrext:sdes:mid\r\n\
a=extmap:7 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01\r\n\
a=recvonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 H264/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtcp-fb:96 nack pli\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n";

#[derive(Default)]
struct FakeSignal {
    responses: Mutex<Vec<(u64, SignalResponse)>>,
    notifications: Mutex<Vec<(String, Value)>>,
}

impl FakeSignal {
    fn response(&self, req_id: u64) -> Option<SignalResponse> {
        self.responses
            .lock()
            .iter()
            .find(|(id, _)| *id == req_id)
            .map(|(_, resp)| resp.clone())
    }

    fn notifications_named(&self, method: &str) -> Vec<Value> {
        self.notifications
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl SignalSender for FakeSignal {
    fn respond(&self, req_id: u64, response: SignalResponse) {
        self.responses.lock().push((req_id, response));
    }
    fn notify(&self, method: &str, data: Value) {
        self.notifications.lock().push((method.to_string(), data));
    }
}

#[derive(Default)]
struct FakePilot {
    next_id: AtomicU64,
    requests: Mutex<Vec<(u64, String, Value)>>,
    notifications: Mutex<Vec<(String, Value)>>,
}

impl FakePilot {
    fn notifications_named(&self, method: &str) -> Vec<Value> {
        self.notifications
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

impl PilotClient for FakePilot {
    fn request(&self, method: &str, data: Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.requests.lock().push((id, method.to_string(), data));
        id
    }
    fn notify(&self, method: &str, data: Value) {
        self.notifications
            .lock()
            .push((method.to_string(), data));
    }
}

#[derive(Default)]
struct FakeTransport {
    connected: AtomicBool,
    rtp: Mutex<Vec<Vec<u8>>>,
    rtcp: Mutex<Vec<Vec<u8>>>,
}

impl FakeTransport {
    fn rtp_count(&self) -> usize {
        self.rtp.lock().len()
    }
}

impl MediaTransport for FakeTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
    fn send_rtp(&self, data: &[u8]) {
        self.rtp.lock().push(data.to_vec());
    }
    fn send_rtcp(&self, data: &[u8]) {
        self.rtcp.lock().push(data.to_vec());
    }
}

#[derive(Default)]
struct FakeTransportFactory {
    created: Mutex<Vec<(TransportRole, UserId, Arc<FakeTransport>)>>,
}

impl FakeTransportFactory {
    fn last_for(&self, role: TransportRole, user_id: &UserId) -> Arc<FakeTransport> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(r, u, _)| *r == role && u == user_id)
            .map(|(_, _, t)| Arc::clone(t))
            .expect("no transport created for user")
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create_transport(
        &self,
        role: TransportRole,
        _room_id: &RoomId,
        user_id: &UserId,
        _remote_fingerprint: Option<&str>,
    ) -> Result<NegotiatedTransport> {
        let transport = Arc::new(FakeTransport::default());
        transport.connected.store(true, Ordering::Relaxed);
        self.created
            .lock()
            .push((role, user_id.clone(), Arc::clone(&transport)));
        Ok(NegotiatedTransport {
            session_id: SessionId::generate(),
            ice_ufrag: "srv-ufrag".to_string(),
            ice_pwd: "srv-pwd".to_string(),
            fingerprint: "sha-256 11:22:33".to_string(),
            transport,
        })
    }
}

struct TestRig {
    room: SharedRoom,
    pilot: Arc<FakePilot>,
    transports: Arc<FakeTransportFactory>,
}

fn rig() -> TestRig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let config = SfuConfig {
        candidates: vec![IceCandidateConfig {
            ip: "127.0.0.1".to_string(),
            port: 4444,
            net_type: "udp".to_string(),
        }],
        relay: RelayConfig {
            bind_ip: "127.0.0.1".to_string(),
            ..Default::default()
        },
    };
    let pilot = Arc::new(FakePilot::default());
    let transports = Arc::new(FakeTransportFactory::default());
    let room = Room::create(
        RoomId::new("room-1"),
        Arc::new(config),
        pilot.clone(),
        transports.clone(),
        Arc::new(chorus_sfu::relay::PortAllocator::new(0, 0)),
        Arc::new(NoopEventSink),
    );
    TestRig {
        room,
        pilot,
        transports,
    }
}

fn join(rig: &TestRig, user: &str, name: &str, req_id: u64) -> Arc<FakeSignal> {
    let signal = Arc::new(FakeSignal::default());
    rig.room
        .lock()
        .user_join(UserId::new(user), name.to_string(), req_id, signal.clone())
        .expect("join failed");
    signal
}

fn push_video(rig: &TestRig, user: &str, req_id: u64, signal: &Arc<FakeSignal>) -> PusherId {
    rig.room
        .lock()
        .handle_push_sdp(
            &UserId::new(user),
            "offer",
            VIDEO_OFFER_A,
            req_id,
            signal.clone(),
        )
        .expect("push failed");
    let ids = rig.room.lock().pusher_ids_of(&UserId::new(user));
    assert_eq!(ids.len(), 1);
    ids[0].clone()
}

fn pull(
    rig: &TestRig,
    target: &str,
    src: &str,
    pusher_id: &PusherId,
    req_id: u64,
    signal: &Arc<FakeSignal>,
) {
    let pull_info = PullRequestInfo {
        target_user_id: UserId::new(target),
        src_user_id: UserId::new(src),
        room_id: RoomId::new("room-1"),
        pushers: vec![PushInfo {
            pusher_id: pusher_id.clone(),
            rtp_param: RtpSessionParam::default(),
        }],
    };
    rig.room
        .lock()
        .handle_pull_sdp(&pull_info, "offer", SUB_OFFER_B, req_id, signal.clone())
        .expect("pull failed");
}

fn video_packet(seq: u16, payload: &[u8]) -> RtpPacket {
    RtpPacket::build_with_extensions(
        100,
        96,
        seq,
        u32::from(seq) * 3000,
        payload,
        &[(1, b"0"), (3, &[0, 1])],
    )
    .unwrap()
}

fn remote_video_param(ssrc: u32) -> Value {
    json!({
        "av_type": "video",
        "codec": "H264",
        "fmtp_param": "profile-level-id=42e01f",
        "rtcp_features": ["nack", "nack pli"],
        "ssrc": ssrc,
        "payload_type": 96u8,
        "clock_rate": 90000u32,
        "rtx_ssrc": 0u32,
        "rtx_payload_type": 0u8,
        "use_nack": true,
        "key_request": true
    })
}

// scenario 1: local push + local pull, one packet fans out exactly once
// with the subscriber's extension ids
#[tokio::test]
async fn local_push_local_pull_forwards_one_packet() {
    let rig = rig();
    let a = join(&rig, "A", "alice", 1);
    let pusher_id = push_video(&rig, "A", 2, &a);

    // the join triggered a pilot join request
    assert!(rig
        .pilot
        .requests
        .lock()
        .iter()
        .any(|(_, method, _)| method == "join"));

    let b = join(&rig, "B", "bob", 3);
    // B's join snapshot lists A with its pusher
    let resp = b.response(3).unwrap();
    assert_eq!(resp.code, 0);
    let users = resp.data.get("users").unwrap().as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["userId"], "A");
    assert_eq!(users[0]["pushers"].as_array().unwrap().len(), 1);

    pull(&rig, "A", "B", &pusher_id, 4, &b);
    let resp = b.response(4).unwrap();
    assert_eq!(resp.code, 0);
    let sdp = resp.data.get("sdp").unwrap().as_str().unwrap();
    assert!(sdp.contains("a=sendonly"));
    assert!(sdp.contains("a=ssrc:100"));
    assert!(sdp.contains("a=candidate:"));

    let b_transport = rig
        .transports
        .last_for(TransportRole::Send, &UserId::new("B"));
    let mut pkt = video_packet(1, &[9u8; 16]);
    rig.room.lock().handle_publisher_rtp(&mut pkt).unwrap();

    let sent = b_transport.rtp.lock();
    assert_eq!(sent.len(), 1);
    let forwarded = RtpPacket::parse(&sent[0]).unwrap();
    assert_eq!(forwarded.ssrc(), 100);
    assert_eq!(forwarded.seq(), 1);
    // extension ids rewritten to B's extmap (mid 1->2, tcc 3->7)
    assert_eq!(forwarded.data()[16] >> 4, 2);
    assert_eq!(forwarded.data()[18] >> 4, 7);
}

// boundary: empty payloads are never forwarded to subscribers
#[tokio::test]
async fn empty_payload_not_forwarded() {
    let rig = rig();
    let a = join(&rig, "A", "alice", 1);
    let pusher_id = push_video(&rig, "A", 2, &a);
    let b = join(&rig, "B", "bob", 3);
    pull(&rig, "A", "B", &pusher_id, 4, &b);

    let b_transport = rig
        .transports
        .last_for(TransportRole::Send, &UserId::new("B"));
    let mut pkt = RtpPacket::build(100, 96, 1, 0, &[]).unwrap();
    rig.room.lock().handle_publisher_rtp(&mut pkt).unwrap();
    assert_eq!(b_transport.rtp_count(), 0);
}

// boundary: unknown ingress SSRCs are rejected and create no state
#[tokio::test]
async fn unknown_ssrc_rejected() {
    let rig = rig();
    let a = join(&rig, "A", "alice", 1);
    push_video(&rig, "A", 2, &a);

    let mut pkt = RtpPacket::build(999, 96, 1, 0, &[1]).unwrap();
    assert!(rig.room.lock().handle_publisher_rtp(&mut pkt).is_err());
    assert_eq!(rig.room.lock().pusher_count(), 1);
}

// a second publisher colliding on an active SSRC is rejected at setup
#[tokio::test]
async fn ssrc_collision_rejected() {
    let rig = rig();
    let a = join(&rig, "A", "alice", 1);
    push_video(&rig, "A", 2, &a);

    let z = join(&rig, "Z", "zoe", 3);
    let err = rig.room.lock().handle_push_sdp(
        &UserId::new("Z"),
        "offer",
        VIDEO_OFFER_A,
        4,
        z.clone(),
    );
    assert!(err.is_err());
    assert_eq!(rig.room.lock().pusher_count(), 1);
}

// scenario 2: a subscriber PLI reaches the publisher within the same tick
#[tokio::test]
async fn subscriber_pli_fans_in_to_publisher() {
    let rig = rig();
    let a = join(&rig, "A", "alice", 1);
    let pusher_id = push_video(&rig, "A", 2, &a);
    let b = join(&rig, "B", "bob", 3);
    pull(&rig, "A", "B", &pusher_id, 4, &b);

    let a_transport = rig
        .transports
        .last_for(TransportRole::Recv, &UserId::new("A"));
    let pli = Pli {
        sender_ssrc: 7,
        media_ssrc: 100,
    };
    rig.room
        .lock()
        .handle_subscriber_rtcp(&UserId::new("B"), &pli.to_bytes());

    let rtcp = a_transport.rtcp.lock();
    assert_eq!(rtcp.len(), 1);
    let forwarded = Pli::parse(&rtcp[0]).unwrap();
    assert_eq!(forwarded.media_ssrc, 100);
    assert_eq!(forwarded.sender_ssrc, 0);
}

// scenario 3: pulling a remote user's stream creates exactly one recv
// relay, announces its endpoint to the pilot, and RTP hitting that UDP
// port reaches the local subscriber
#[tokio::test]
async fn remote_pull_bridges_udp_to_subscriber() {
    let rig = rig();
    let b = join(&rig, "B", "bob", 1);

    rig.room
        .lock()
        .handle_new_user_notification_from_center(json!({
            "userId": "C",
            "userName": "carol",
        }));
    rig.room
        .lock()
        .handle_new_pusher_notification_from_center(json!({
            "userId": "C",
            "pushers": [{"pusherId": "p-c", "rtpParam": remote_video_param(200)}],
        }));
    // B was told about the remote pusher
    assert_eq!(b.notifications_named("newPusher").len(), 1);

    let pull_info = PullRequestInfo {
        target_user_id: UserId::new("C"),
        src_user_id: UserId::new("B"),
        room_id: RoomId::new("room-1"),
        pushers: vec![PushInfo {
            pusher_id: PusherId::new("p-c"),
            rtp_param: RtpSessionParam::default(),
        }],
    };
    rig.room
        .lock()
        .handle_remote_pull_sdp(
            &UserId::new("C"),
            &pull_info,
            "offer",
            SUB_OFFER_B,
            2,
            b.clone(),
        )
        .unwrap();

    assert_eq!(rig.room.lock().recv_relay_count(), 1);
    let announcements = rig.pilot.notifications_named("pullRemoteStream");
    assert_eq!(announcements.len(), 1);
    assert_eq!(announcements[0]["roomId"], "room-1");
    assert_eq!(announcements[0]["pusher_user_id"], "C");
    let udp_ip = announcements[0]["udp_ip"].as_str().unwrap().to_string();
    let udp_port = announcements[0]["udp_port"].as_u64().unwrap() as u16;
    assert_eq!(udp_ip, "127.0.0.1");

    let b_transport = rig
        .transports
        .last_for(TransportRole::Send, &UserId::new("B"));
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pkt = RtpPacket::build(200, 96, 1, 3000, &[5u8; 24]).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut seq = 1u16;
    loop {
        let pkt = RtpPacket::build(200, 96, seq, 3000, pkt.payload()).unwrap();
        sender
            .send_to(pkt.data(), (udp_ip.as_str(), udp_port))
            .await
            .unwrap();
        seq = seq.wrapping_add(1);
        sleep(Duration::from_millis(25)).await;
        if b_transport.rtp_count() > 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "relayed packet never reached the subscriber"
        );
    }
    let sent = b_transport.rtp.lock();
    let forwarded = RtpPacket::parse(&sent[0]).unwrap();
    assert_eq!(forwarded.ssrc(), 200);
}

// scenario 4: a pilot pull demand creates a send relay that forwards the
// local publisher's packets to the announced endpoint
#[tokio::test]
async fn pilot_pull_demand_relays_rtp_to_peer() -> anyhow::Result<()> {
    let rig = rig();
    let a = join(&rig, "A", "alice", 1);
    let pusher_id = push_video(&rig, "A", 2, &a);

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_port = peer.local_addr()?.port();

    let pusher_param = json!({
        "av_type": "video",
        "codec": "H264",
        "fmtp_param": "profile-level-id=42e01f;packetization-mode=1",
        "rtcp_features": ["nack", "nack pli"],
        "ssrc": 100u32,
        "payload_type": 96u8,
        "clock_rate": 90000u32,
        "rtx_ssrc": 101u32,
        "rtx_payload_type": 97u8,
        "use_nack": true
    });
    rig.room
        .lock()
        .handle_pull_remote_stream_notification_from_center(json!({
            "roomId": "room-1",
            "pusher_user_id": "A",
            "udp_ip": "127.0.0.1",
            "udp_port": peer_port,
            "mediaType": "video",
            "pushInfo": {"pusherId": pusher_id.as_str(), "rtpParam": pusher_param},
        }))?;
    assert_eq!(rig.room.lock().send_relay_count(), 1);

    let mut pkt = video_packet(1, &[7u8; 32]);
    rig.room.lock().handle_publisher_rtp(&mut pkt)?;

    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
        .await
        .expect("relay never sent")?;
    let relayed = RtpPacket::parse(&buf[..len])?;
    assert_eq!(relayed.ssrc(), 100);
    assert_eq!(relayed.seq(), 1);
    Ok(())
}

// scenario 5: rejoin within the liveness window is a reconnect; peers get
// userReConnect and the old pusher keeps forwarding
#[tokio::test]
async fn reconnect_preserves_pushers() {
    let rig = rig();
    let a = join(&rig, "A", "alice", 1);
    let pusher_id = push_video(&rig, "A", 2, &a);
    let b = join(&rig, "B", "bob", 3);
    pull(&rig, "A", "B", &pusher_id, 4, &b);

    rig.room.lock().user_leave(&UserId::new("A")).unwrap();
    assert_eq!(b.notifications_named("userLeave").len(), 1);

    let a2 = Arc::new(FakeSignal::default());
    rig.room
        .lock()
        .user_join(UserId::new("A"), "alice".to_string(), 5, a2.clone())
        .unwrap();
    assert_eq!(b.notifications_named("userReConnect").len(), 1);
    let resp = a2.response(5).unwrap();
    assert_eq!(resp.code, 0);
    // pilot saw the reconnect
    assert_eq!(rig.pilot.notifications_named("userReConnect").len(), 1);

    // the pre-existing subscription still works
    let b_transport = rig
        .transports
        .last_for(TransportRole::Send, &UserId::new("B"));
    let mut pkt = video_packet(2, &[3u8; 8]);
    rig.room.lock().handle_publisher_rtp(&mut pkt).unwrap();
    assert_eq!(b_transport.rtp_count(), 1);
}

// scenario 6: a silent user is evicted on the first tick past the 40 s
// window together with everything keyed by it
#[tokio::test]
async fn liveness_eviction_tears_down_user_state() {
    let rig = rig();
    let a = join(&rig, "D", "dan", 1);
    let pusher_id = push_video(&rig, "D", 2, &a);
    let b = join(&rig, "B", "bob", 3);
    pull(&rig, "D", "B", &pusher_id, 4, &b);

    // a send relay keyed by D
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let pusher_param = json!({
        "av_type": "video",
        "codec": "H264",
        "fmtp_param": "",
        "rtcp_features": ["nack"],
        "ssrc": 100u32,
        "payload_type": 96u8,
        "clock_rate": 90000u32,
        "rtx_ssrc": 101u32,
        "rtx_payload_type": 97u8,
        "use_nack": true
    });
    rig.room
        .lock()
        .handle_pull_remote_stream_notification_from_center(json!({
            "roomId": "room-1",
            "pusher_user_id": "D",
            "udp_ip": "127.0.0.1",
            "udp_port": peer.local_addr().unwrap().port(),
            "mediaType": "video",
            "pushInfo": {"pusherId": pusher_id.as_str(), "rtpParam": pusher_param},
        }))
        .unwrap();

    // the tick lands past everyone's 40 s window: both silent users go,
    // and with them D's pusher, send relay and B's subscription
    let now = chorus_sfu::now_millis();
    {
        let mut room = rig.room.lock();
        room.on_timer(now + 41_000);
        assert!(!room.has_user(&UserId::new("D")));
        assert_eq!(room.pusher_count(), 0);
        assert_eq!(room.send_relay_count(), 0);
        assert_eq!(room.puller_count(&pusher_id), 0);
    }

    // no further packets reach the old subscription
    let b_transport = rig
        .transports
        .last_for(TransportRole::Send, &UserId::new("B"));
    let mut pkt = video_packet(5, &[1u8; 8]);
    assert!(rig.room.lock().handle_publisher_rtp(&mut pkt).is_err());
    assert_eq!(b_transport.rtp_count(), 0);
}

// the pilot join response inserts remote users idempotently
#[tokio::test]
async fn join_response_is_idempotent() {
    let rig = rig();
    join(&rig, "A", "alice", 1);

    let response = json!({
        "roomId": "room-1",
        "users": [
            {"userId": "E", "userName": "eve",
             "pushers": [{"pusherId": "p-e", "rtpParam": remote_video_param(300)}]}
        ]
    });
    rig.room
        .lock()
        .on_pilot_response(1, "join", response.clone());
    assert!(rig.room.lock().has_user(&UserId::new("E")));
    assert_eq!(rig.room.lock().user_count(), 2);

    // delivering the same roster again changes nothing
    rig.room.lock().on_pilot_response(1, "join", response);
    assert_eq!(rig.room.lock().user_count(), 2);

    // a mismatched room id is rejected
    rig.room.lock().on_pilot_response(2, "join", json!({
        "roomId": "other-room",
        "users": [{"userId": "F", "userName": "fred", "pushers": []}]
    }));
    assert!(!rig.room.lock().has_user(&UserId::new("F")));
}

// a remote user's pilot-announced departure evicts the shadow user
#[tokio::test]
async fn remote_user_leave_evicts_shadow_state() {
    let rig = rig();
    let b = join(&rig, "B", "bob", 1);
    rig.room
        .lock()
        .handle_new_user_notification_from_center(json!({
            "userId": "C",
            "userName": "carol",
        }));
    assert_eq!(b.notifications_named("newUser").len(), 1);
    assert!(rig.room.lock().has_user(&UserId::new("C")));

    rig.room
        .lock()
        .handle_user_leave_notification_from_center(json!({"userId": "C"}));
    assert!(!rig.room.lock().has_user(&UserId::new("C")));
    assert_eq!(b.notifications_named("userLeave").len(), 1);
}

// text messages fan out to the other local users and to the pilot
#[tokio::test]
async fn text_message_fan_out() {
    let rig = rig();
    let a = join(&rig, "A", "alice", 1);
    let b = join(&rig, "B", "bob", 2);

    rig.room
        .lock()
        .handle_text_message(&UserId::new("A"), "hello")
        .unwrap();
    assert!(a.notifications_named("textMessage").is_empty());
    let to_b = b.notifications_named("textMessage");
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_b[0]["message"], "hello");
    assert_eq!(rig.pilot.notifications_named("textMessage").len(), 1);

    rig.room
        .lock()
        .handle_text_message_notification_from_center(json!({
            "roomId": "room-1",
            "userId": "X",
            "userName": "xavier",
            "message": "from far away",
        }));
    assert_eq!(b.notifications_named("textMessage").len(), 2);
}

// closed rooms reject joins and drop late pilot responses
#[tokio::test]
async fn closed_room_rejects_operations() {
    let rig = rig();
    join(&rig, "A", "alice", 1);
    rig.room.lock().close();

    let signal = Arc::new(FakeSignal::default());
    let err = rig.room.lock().user_join(
        UserId::new("B"),
        "bob".to_string(),
        2,
        signal.clone(),
    );
    assert!(err.is_err());

    rig.room.lock().on_pilot_response(1, "join", json!({
        "roomId": "room-1",
        "users": [{"userId": "G", "userName": "gia", "pushers": []}]
    }));
    assert!(!rig.room.lock().has_user(&UserId::new("G")));
}
