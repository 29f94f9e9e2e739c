//! Live hub session tests: a real WebSocket agent against a listening hub.
//!
//! Exercises the handshake, monitor assignment push, heartbeat ingest
//! (round trip preserves the monitor id), agent disconnect handling, and
//! session replacement.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use chrono::Utc;
use wd_auth::AgentAuth;
use wd_crypto::{SecretBox, generate_api_secret};
use wd_hub::{AGENT_WS_PATH, Hub};
use wd_incident::IncidentEngine;
use wd_monitor::{MonitorService, NewMonitor};
use wd_proto::{
    Agent, AgentStatus, Envelope, HeartbeatPayload, HeartbeatStatus, Monitor, MonitorStatus,
    MonitorType, Plan, User, frame,
};
use wd_store::{AgentRepo, HeartbeatStore, IncidentRepo, MemoryStore, MonitorRepo};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct World {
    store: Arc<MemoryStore>,
    service: Arc<MonitorService>,
    hub: Arc<Hub>,
    addr: std::net::SocketAddr,
    user: User,
    agent_id: Uuid,
    api_key: String,
}

async fn world() -> World {
    let store = Arc::new(MemoryStore::in_memory());
    let secrets = SecretBox::new(&[9u8; 32]).expect("key");

    let user = User {
        id: Uuid::new_v4(),
        tenant_id: "t-1".to_string(),
        email: "ops@example.com".to_string(),
        username: "ops".to_string(),
        password_hash: "$argon2id$stub".to_string(),
        plan: Plan::Pro,
        is_admin: false,
        created_at: Utc::now(),
    };
    let secret = generate_api_secret();
    let agent = Agent {
        id: Uuid::new_v4(),
        user_id: user.id,
        tenant_id: "t-1".to_string(),
        name: "edge-1".to_string(),
        api_key_encrypted: secrets
            .seal(&hex::decode(&secret).expect("hex"))
            .expect("seal"),
        api_key_expires_at: None,
        status: AgentStatus::Offline,
        last_seen_at: None,
        created_at: Utc::now(),
    };
    let agent_id = agent.id;
    let api_key = format!("{agent_id}:{secret}");
    store.create_agent(agent).await.expect("create agent");

    let incidents = Arc::new(IncidentEngine::new(
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let service = Arc::new(MonitorService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        incidents,
    ));
    let auth = Arc::new(AgentAuth::new(store.clone(), secrets));
    let hub = Hub::new(auth, service.clone());
    service.set_push(hub.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(hub.clone().serve(listener));

    World {
        store,
        service,
        hub,
        addr,
        user,
        agent_id,
        api_key,
    }
}

async fn make_monitor(w: &World, name: &str, threshold: u32) -> Monitor {
    w.service
        .create_monitor(
            &w.user,
            w.agent_id,
            NewMonitor {
                name: name.to_string(),
                kind: MonitorType::Tcp,
                target: "db.internal:5432".to_string(),
                interval_seconds: Some(30),
                timeout_seconds: Some(10),
                failure_threshold: Some(threshold),
            },
        )
        .await
        .expect("create monitor")
}

async fn connect(w: &World) -> WsClient {
    let url = format!("ws://{}{}", w.addr, AGENT_WS_PATH);
    let (mut ws, _) = connect_async(&url).await.expect("connect");
    let auth = serde_json::to_string(&Envelope::auth(&w.api_key)).expect("encode");
    ws.send(Message::Text(auth)).await.expect("send auth");
    ws
}

/// Read frames until the next protocol envelope, skipping transport pings.
async fn next_envelope(ws: &mut WsClient) -> Envelope {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("read timed out")
            .expect("stream ended")
            .expect("transport error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("parse envelope");
        }
    }
}

#[tokio::test]
async fn handshake_pushes_enabled_monitor_set() {
    let w = world().await;
    let m1 = make_monitor(&w, "db", 3).await;
    let m2 = make_monitor(&w, "cache", 3).await;

    let mut ws = connect(&w).await;
    let mut assigned = Vec::new();
    for _ in 0..2 {
        let env = next_envelope(&mut ws).await;
        assert_eq!(env.kind, frame::MONITOR_ASSIGN);
        let monitor: Monitor = env.decode().expect("decode monitor");
        assigned.push(monitor.id);
    }
    assert!(assigned.contains(&m1.id));
    assert!(assigned.contains(&m2.id));

    // The session also flips the agent online.
    for _ in 0..50 {
        let agent = w
            .store
            .get_agent(w.agent_id)
            .await
            .expect("get")
            .expect("some");
        if agent.status == AgentStatus::Online {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("agent never went online");
}

#[tokio::test]
async fn heartbeat_round_trip_preserves_monitor_id() {
    let w = world().await;
    let monitor = make_monitor(&w, "db", 3).await;

    let mut ws = connect(&w).await;
    // Drain the assignment push.
    let env = next_envelope(&mut ws).await;
    let assigned: Monitor = env.decode().expect("decode");
    assert_eq!(assigned.id, monitor.id);

    // Report the assigned monitor as up, exactly as an agent would.
    let hb = Envelope::heartbeat(&HeartbeatPayload {
        monitor_id: assigned.id,
        status: HeartbeatStatus::Up,
        latency_ms: Some(4),
        error_message: None,
    })
    .expect("encode");
    ws.send(Message::Text(serde_json::to_string(&hb).expect("encode")))
        .await
        .expect("send heartbeat");

    for _ in 0..50 {
        let recent = w
            .store
            .recent_heartbeats(monitor.id, 1)
            .await
            .expect("recent");
        if let Some(latest) = recent.first() {
            assert_eq!(latest.monitor_id, monitor.id);
            assert_eq!(latest.status, HeartbeatStatus::Up);
            assert_eq!(latest.agent_id, w.agent_id);
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("heartbeat never reached the store");
}

#[tokio::test]
async fn bad_credentials_close_the_session() {
    let w = world().await;
    let url = format!("ws://{}{}", w.addr, AGENT_WS_PATH);
    let (mut ws, _) = connect_async(&url).await.expect("connect");

    let bogus = format!("{}:{}", Uuid::new_v4(), "ee".repeat(32));
    let auth = serde_json::to_string(&Envelope::auth(&bogus)).expect("encode");
    ws.send(Message::Text(auth)).await.expect("send auth");

    let msg = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("read timed out")
        .expect("stream ended")
        .expect("transport error");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.reason, "unauthorized");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_upgrade_path_is_rejected() {
    let w = world().await;
    let url = format!("ws://{}/ws/other", w.addr);
    assert!(
        connect_async(&url).await.is_err(),
        "only /ws/agent upgrades"
    );
}

#[tokio::test]
async fn disconnect_marks_monitors_down_with_synthetic_heartbeats() {
    let w = world().await;
    // Threshold 1 opens immediately on the synthetic strike; threshold 3
    // needs more history and must not.
    let quick = make_monitor(&w, "quick", 1).await;
    let slow = make_monitor(&w, "slow", 3).await;

    let mut ws = connect(&w).await;
    next_envelope(&mut ws).await;
    next_envelope(&mut ws).await;

    // Both report up first.
    for monitor in [&quick, &slow] {
        let hb = Envelope::heartbeat(&HeartbeatPayload {
            monitor_id: monitor.id,
            status: HeartbeatStatus::Up,
            latency_ms: Some(3),
            error_message: None,
        })
        .expect("encode");
        ws.send(Message::Text(serde_json::to_string(&hb).expect("encode")))
            .await
            .expect("send");
    }
    for _ in 0..50 {
        if w
            .store
            .recent_heartbeats(slow.id, 1)
            .await
            .expect("recent")
            .len()
            == 1
        {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    ws.close(None).await.expect("close");
    drop(ws);

    for _ in 0..100 {
        let q = w
            .store
            .get_monitor(quick.id)
            .await
            .expect("get")
            .expect("some");
        let s = w
            .store
            .get_monitor(slow.id)
            .await
            .expect("get")
            .expect("some");
        if q.status == MonitorStatus::Down && s.status == MonitorStatus::Down {
            for monitor in [&quick, &slow] {
                let latest = w
                    .store
                    .recent_heartbeats(monitor.id, 1)
                    .await
                    .expect("recent");
                assert_eq!(latest[0].status, HeartbeatStatus::Down);
                assert_eq!(
                    latest[0].error_message.as_deref(),
                    Some("agent disconnected")
                );
            }
            assert!(
                w.store
                    .open_incident_for_monitor(quick.id)
                    .await
                    .expect("lookup")
                    .is_some(),
                "threshold-1 monitor opens on the synthetic strike"
            );
            assert!(
                w.store
                    .open_incident_for_monitor(slow.id)
                    .await
                    .expect("lookup")
                    .is_none(),
                "threshold-3 monitor stays below the threshold"
            );
            let agent = w
                .store
                .get_agent(w.agent_id)
                .await
                .expect("get")
                .expect("some");
            assert_eq!(agent.status, AgentStatus::Offline);
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("monitors never marked down after disconnect");
}

#[tokio::test]
async fn second_session_replaces_first() {
    let w = world().await;
    make_monitor(&w, "db", 3).await;

    let mut first = connect(&w).await;
    next_envelope(&mut first).await;

    let mut second = connect(&w).await;
    next_envelope(&mut second).await;

    // The first session is told to go away with a normal close.
    let mut first_closed = false;
    for _ in 0..50 {
        match timeout(Duration::from_secs(5), first.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                first_closed = true;
                break;
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    assert!(first_closed, "replaced session must be closed");
    drop(first);

    for _ in 0..50 {
        if w.hub.connected_count() == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(w.hub.connected_count(), 1);
    assert_eq!(w.hub.metrics.sessions_replaced.get(), 1);

    // Replacement is not a disconnect: monitors keep their status.
    sleep(Duration::from_millis(100)).await;
    let monitors = w
        .store
        .list_monitors_by_agent(w.agent_id, true)
        .await
        .expect("list");
    assert!(
        monitors.iter().all(|m| m.status == MonitorStatus::Pending),
        "replacement must not mark monitors down"
    );
}
