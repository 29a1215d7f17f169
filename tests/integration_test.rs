//! Integration tests for gramtun
//!
//! Runs the real engine loops against the in-memory backend and TUN
//! device: packet capture in direct and batched mode, inbound payload
//! delivery, peer addressing, authorization and history cleanup.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use gramtun::app::clean_chat;
use gramtun::backend::mock::MockBackend;
use gramtun::backend::{
    Backend, Inbound, MessageSummary, PushEvent, Request, Response, SessionParameters,
};
use gramtun::cache::PacketCache;
use gramtun::codec::{self, PayloadKind};
use gramtun::dispatch::Dispatcher;
use gramtun::engine::{Engine, EngineConfig};
use gramtun::session::{AuthPhase, SessionDriver, StaticCredentials};
use gramtun::stats::Stats;
use gramtun::tun::MockTun;

const CHAT_ID: i64 = 100;
const PEER_ID: i64 = 200;

struct Harness {
    engine: Arc<Engine>,
    backend: Arc<MockBackend>,
    tun: MockTun,
    cache: Arc<PacketCache>,
    stats: Arc<Stats>,
}

fn build(cache_flush_rate: f32) -> Harness {
    let backend = Arc::new(MockBackend::new());
    let stats = Arc::new(Stats::new());
    let cache = Arc::new(PacketCache::new());
    let dispatcher = Arc::new(Dispatcher::new(
        backend.clone() as Arc<dyn Backend>,
        stats.clone(),
    ));
    let session = Arc::new(SessionDriver::new(
        dispatcher.clone(),
        Box::new(StaticCredentials {
            phone_number: "+15550100".into(),
            code: "12345".into(),
            password: "hunter2".into(),
        }),
        SessionParameters::default(),
    ));
    let tun = MockTun::new("tun0", 1500);
    let engine = Engine::new(
        EngineConfig {
            send_to_chat_id: CHAT_ID,
            receive_from_user_id: PEER_ID,
            cache_flush_rate,
            mtu: 1500,
            tun_name: "tun0".into(),
            tun_ip: "10.8.0.1".into(),
        },
        dispatcher,
        cache.clone(),
        stats.clone(),
        session,
        Box::new(tun.clone()),
    );
    Harness {
        engine,
        backend,
        tun,
        cache,
        stats,
    }
}

/// Payloads sent to the peer chat, welcome announcements excluded.
fn tunnel_payloads(backend: &MockBackend) -> Vec<String> {
    backend
        .sent_texts()
        .into_iter()
        .filter(|(chat_id, text)| {
            *chat_id == CHAT_ID && !text.starts_with(codec::HEADER_WELCOME)
        })
        .map(|(_, text)| text)
        .collect()
}

#[tokio::test]
async fn test_direct_mode_single_packet() {
    let h = build(0.0);
    h.engine.start().await;

    let packet: Vec<u8> = (0..40).collect();
    h.tun.inject(packet.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.stop().await;

    let payloads = tunnel_payloads(&h.backend);
    assert_eq!(payloads.len(), 1);
    let (kind, body) = PayloadKind::classify(&payloads[0]).unwrap();
    assert_eq!(kind, PayloadKind::Single);
    assert_eq!(codec::decode_single(body).unwrap(), &packet[..]);

    assert_eq!(h.stats.get("out_tun_read_ok"), 1);
    assert_eq!(h.stats.get("out_cache_inserted"), 0);
}

#[tokio::test]
async fn test_batched_mode_multiple_packets() {
    let h = build(2.0);
    h.engine.start().await;

    let packets = [vec![1u8; 10], vec![2u8; 20], vec![3u8; 30]];
    for packet in &packets {
        h.tun.inject(packet.clone());
    }
    // one flush period at 2 Hz is 500 ms
    tokio::time::sleep(Duration::from_millis(700)).await;
    h.engine.stop().await;

    let payloads = tunnel_payloads(&h.backend);
    assert_eq!(payloads.len(), 1);
    let (kind, body) = PayloadKind::classify(&payloads[0]).unwrap();
    assert_eq!(kind, PayloadKind::Multiple);
    let decoded = codec::decode_batch(body).unwrap();
    assert!(decoded.corruption.is_none());
    let expected: Vec<Bytes> = packets.iter().map(|p| Bytes::from(p.clone())).collect();
    assert_eq!(decoded.packets, expected);

    assert_eq!(h.stats.get("out_cache_inserted"), 3);
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn test_inbound_payloads_reach_tun() {
    let h = build(0.0);
    h.engine.start().await;

    h.backend.push(Inbound::Push(PushEvent::NewMessage {
        chat_id: PEER_ID,
        sender_id: PEER_ID,
        text: codec::encode_single(&[0x45, 0, 0, 40]),
    }));
    let batch = codec::encode_batch(&[Bytes::from(vec![7u8; 5]), Bytes::from(vec![8u8; 6])]);
    h.backend.push(Inbound::Push(PushEvent::NewMessage {
        chat_id: PEER_ID,
        sender_id: PEER_ID,
        text: batch,
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.stop().await;

    assert_eq!(
        h.tun.written(),
        vec![vec![0x45, 0, 0, 40], vec![7u8; 5], vec![8u8; 6]]
    );
    assert_eq!(h.stats.get("in_receive"), 2);
    assert_eq!(h.stats.get("in_write_ok"), 3);
}

#[tokio::test]
async fn test_messages_from_other_chats_are_ignored() {
    let h = build(0.0);
    h.engine.start().await;

    let payload = codec::encode_single(&[1, 2, 3]);
    // wrong sender, wrong chat, then a non-payload from the right peer
    h.backend.push(Inbound::Push(PushEvent::NewMessage {
        chat_id: PEER_ID,
        sender_id: 999,
        text: payload.clone(),
    }));
    h.backend.push(Inbound::Push(PushEvent::NewMessage {
        chat_id: 999,
        sender_id: PEER_ID,
        text: payload,
    }));
    h.backend.push(Inbound::Push(PushEvent::NewMessage {
        chat_id: PEER_ID,
        sender_id: PEER_ID,
        text: "hello there".into(),
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.stop().await;

    assert!(h.tun.written().is_empty());
    assert_eq!(h.stats.get("in_receive"), 3);
    assert_eq!(h.stats.get("in_write_ok"), 0);
}

#[tokio::test]
async fn test_send_outcomes_counted() {
    let h = build(0.0);
    h.backend.ack_sends();
    h.engine.start().await;

    h.tun.inject(vec![9u8; 16]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.stop().await;

    // welcome announcement plus the packet payload, both acknowledged
    assert_eq!(h.stats.get("out_send_ok"), 2);
}

#[tokio::test]
async fn test_authorization_flow_reaches_ready() {
    let h = build(0.0);
    h.engine.start().await;

    for phase in [
        AuthPhase::WaitParameters,
        AuthPhase::WaitPhoneNumber,
        AuthPhase::WaitCode,
        AuthPhase::Ready,
    ] {
        h.backend
            .push(Inbound::Push(PushEvent::AuthState { phase }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.stop().await;

    let requests: Vec<Request> = h.backend.sent().into_iter().map(|(_, r)| r).collect();
    assert!(requests
        .iter()
        .any(|r| matches!(r, Request::SetSessionParameters(_))));
    assert!(requests.iter().any(|r| matches!(
        r,
        Request::SetPhoneNumber { phone_number } if phone_number == "+15550100"
    )));
    assert!(requests
        .iter()
        .any(|r| matches!(r, Request::CheckCode { code } if code == "12345")));
}

#[tokio::test]
async fn test_clean_chat_deletes_payload_messages() {
    let backend = Arc::new(MockBackend::new());
    let stats = Arc::new(Stats::new());
    let dispatcher = Arc::new(Dispatcher::new(
        backend.clone() as Arc<dyn Backend>,
        stats,
    ));

    backend.set_responder(|query_id, request| {
        let response = match request {
            Request::GetChatHistory {
                from_message_id, ..
            } => {
                // one short page: two payload messages and one chat message
                if *from_message_id == 0 {
                    Response::Messages {
                        messages: vec![
                            MessageSummary {
                                id: 30,
                                chat_id: CHAT_ID,
                                sender_id: PEER_ID,
                                text: Some(codec::encode_single(&[1, 2, 3])),
                            },
                            MessageSummary {
                                id: 20,
                                chat_id: CHAT_ID,
                                sender_id: PEER_ID,
                                text: Some("lunch?".into()),
                            },
                            MessageSummary {
                                id: 10,
                                chat_id: CHAT_ID,
                                sender_id: PEER_ID,
                                text: Some(
                                    "#iot myhost started tun device: 10.8.0.1 dev tun0".into(),
                                ),
                            },
                        ],
                    }
                } else {
                    Response::Messages { messages: vec![] }
                }
            }
            Request::DeleteMessages { message_ids, .. } => {
                assert_eq!(message_ids, &vec![30, 10]);
                Response::Ok
            }
            _ => return None,
        };
        Some(Inbound::Reply { query_id, response })
    });

    let pump_dispatcher = dispatcher.clone();
    let pump = tokio::spawn(async move {
        while let Some(inbound) = pump_dispatcher.receive(Duration::from_millis(50)).await {
            pump_dispatcher.dispatch(inbound);
        }
    });

    let cleaned = clean_chat(&dispatcher, CHAT_ID).await.unwrap();
    assert_eq!(cleaned, 2);
    pump.await.unwrap();
}

#[tokio::test]
async fn test_listen_pause_stops_capture() {
    let h = build(0.0);
    h.engine.start().await;
    h.engine.set_listen(false);
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.tun.inject(vec![5u8; 8]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tunnel_payloads(&h.backend).is_empty());

    // resuming picks the queued packet up
    h.engine.set_listen(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.stop().await;
    assert_eq!(tunnel_payloads(&h.backend).len(), 1);
}
