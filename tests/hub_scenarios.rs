use std::sync::Arc;
use std::time::Duration;

use form_collab::config::Config;
use form_collab::models::{server_events, Envelope};
use form_collab::services::auth_service::{Claims, JwtVerifier};
use form_collab::store::{MemoryStore, StateStore};
use form_collab::ws::{CloseReason, CollabHub, ConnCtx, DeviceInfo};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn config(instance_id: &str) -> Config {
    Config {
        instance_id: Some(instance_id.to_string()),
        auth_jwt_secret: Some("test-secret".to_string()),
        enforce_form_permissions: false,
        ..Config::default()
    }
}

async fn start_hub(store: &MemoryStore, config: Config) -> Arc<CollabHub> {
    let verifier = Arc::new(JwtVerifier::new(config.auth_jwt_secret.as_deref(), Duration::from_secs(60)));
    let hub = CollabHub::new(config, Arc::new(store.clone()), verifier);
    hub.spawn_relay().await;
    hub
}

fn claims(user_id: &str) -> Claims {
    Claims {
        sub: user_id.to_string(),
        email: None,
        name: Some(format!("User {}", user_id)),
        role: None,
        permissions: vec![],
        session_id: None,
        exp: chrono::Utc::now().timestamp() + 3600,
    }
}

struct Client {
    hub: Arc<CollabHub>,
    conn: Arc<ConnCtx>,
    rx: mpsc::Receiver<Arc<Envelope>>,
}

impl Client {
    async fn connect(hub: &Arc<CollabHub>, user_id: &str) -> Self {
        let (conn, rx) = hub.connect(claims(user_id), DeviceInfo::default()).await.unwrap();
        Self { hub: hub.clone(), conn, rx }
    }

    async fn send(&self, kind: &str, payload: Value) {
        let raw = json!({
            "type": kind,
            "payload": payload,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        })
        .to_string();
        self.hub.handle_frame(&self.conn, &raw).await;
    }

    async fn send_raw(&self, raw: &str) {
        self.hub.handle_frame(&self.conn, raw).await;
    }

    async fn next(&mut self) -> Arc<Envelope> {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("outbound queue closed")
    }

    /// Next message of the given type, skipping everything else
    async fn next_of(&mut self, kind: &str) -> Arc<Envelope> {
        loop {
            let envelope = self.next().await;
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    async fn join(&mut self, form_id: &str) -> Arc<Envelope> {
        self.send("join:form", json!({ "form_id": form_id })).await;
        self.next_of(server_events::JOINED_FORM).await
    }

    async fn assert_quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(envelope) = self.rx.try_recv() {
            panic!("unexpected message: {}", envelope.to_json());
        }
    }

    fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

fn user_ids(envelope: &Envelope) -> Vec<String> {
    let mut ids: Vec<String> = envelope.payload["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn two_instances_share_presence_and_cursors() {
    let store = MemoryStore::new();
    let hub_1 = start_hub(&store, config("instance-1")).await;
    let hub_2 = start_hub(&store, config("instance-2")).await;

    let mut alice = Client::connect(&hub_1, "alice").await;
    let mut bob = Client::connect(&hub_2, "bob").await;

    let joined = alice.join("form_1").await;
    assert_eq!(user_ids(&joined), vec!["alice"]);

    let joined = bob.join("form_1").await;
    assert_eq!(user_ids(&joined), vec!["alice", "bob"]);
    assert_eq!(joined.payload["connection_id"], bob.conn.id.to_string());

    let announced = alice.next_of(server_events::USER_JOINED).await;
    assert_eq!(announced.payload["user"]["id"], "bob");
    assert_eq!(announced.payload["user"]["name"], "User bob");

    alice.send("cursor:move", json!({ "form_id": "form_1", "x": 10.0, "y": 20.0 })).await;
    let cursor = bob.next().await;
    assert_eq!(cursor.kind, server_events::CURSOR_UPDATE);
    assert_eq!(cursor.payload["user_id"], "alice");
    assert_eq!(cursor.payload["x"], 10.0);
    assert_eq!(cursor.user_id.as_deref(), Some("alice"));

    // One delivery per recipient, none back to the sender
    bob.assert_quiet().await;
    alice.assert_quiet().await;

    hub_2.disconnect(&bob.conn).await;
    let left = alice.next_of(server_events::USER_LEFT).await;
    assert_eq!(left.payload["user_id"], "bob");
    assert_eq!(left.payload["reason"], "disconnected");
    assert_eq!(store.list_room_members("form_1").await.unwrap(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn question_updates_arrive_in_send_order() {
    let store = MemoryStore::new();
    let hub_1 = start_hub(&store, config("instance-1")).await;
    let hub_2 = start_hub(&store, config("instance-2")).await;

    let mut alice = Client::connect(&hub_1, "alice").await;
    let mut bob = Client::connect(&hub_2, "bob").await;
    alice.join("form_1").await;
    bob.join("form_1").await;
    alice.drain();

    for content in ["M1", "M2"] {
        alice
            .send("question:update", json!({ "question_id": "q1", "content": { "text": content } }))
            .await;
    }

    for expected in ["M1", "M2"] {
        let update = bob.next_of(server_events::QUESTION_UPDATED).await;
        assert_eq!(update.payload["content"]["text"], expected);
        assert_eq!(update.payload["question_id"], "q1");
    }
    // The sender sees its own edits in the same order
    for expected in ["M1", "M2"] {
        let update = alice.next_of(server_events::QUESTION_UPDATED).await;
        assert_eq!(update.payload["content"]["text"], expected);
    }

    let history = store.list_question_updates("form_1", "q1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content["text"], "M2");

    for x in [1.0, 2.0] {
        alice.send("cursor:move", json!({ "x": x, "y": 0.0 })).await;
    }
    for expected in [1.0, 2.0] {
        let cursor = bob.next_of(server_events::CURSOR_UPDATE).await;
        assert_eq!(cursor.payload["x"], expected);
    }
}

#[tokio::test]
async fn rooms_are_isolated() {
    let store = MemoryStore::new();
    let hub = start_hub(&store, config("instance-1")).await;

    let mut alice = Client::connect(&hub, "alice").await;
    let mut bob = Client::connect(&hub, "bob").await;
    let mut carol = Client::connect(&hub, "carol").await;
    alice.join("form_1").await;
    bob.join("form_1").await;
    carol.join("form_2").await;
    alice.drain();

    alice.send("user:typing", json!({ "element_id": "q1" })).await;
    let typing = bob.next().await;
    assert_eq!(typing.kind, server_events::USER_TYPING);
    assert_eq!(typing.payload["form_id"], "form_1");

    carol.assert_quiet().await;
}

#[tokio::test]
async fn disconnect_leaves_every_room() {
    let store = MemoryStore::new();
    let hub_1 = start_hub(&store, config("instance-1")).await;
    let hub_2 = start_hub(&store, config("instance-2")).await;

    let mut alice = Client::connect(&hub_1, "alice").await;
    let mut bob = Client::connect(&hub_2, "bob").await;
    let mut carol = Client::connect(&hub_2, "carol").await;
    alice.join("form_1").await;
    alice.join("form_2").await;
    bob.join("form_1").await;
    carol.join("form_2").await;

    hub_1.disconnect(&alice.conn).await;

    let left = bob.next_of(server_events::USER_LEFT).await;
    assert_eq!(left.payload["form_id"], "form_1");
    assert_eq!(left.payload["user_id"], "alice");
    let left = carol.next_of(server_events::USER_LEFT).await;
    assert_eq!(left.payload["form_id"], "form_2");

    for form_id in ["form_1", "form_2"] {
        let members = store.list_room_members(form_id).await.unwrap();
        assert!(!members.contains(&"alice".to_string()));
    }
    assert!(store.get_connection(&alice.conn.id.to_string()).await.unwrap().is_none());
    assert!(store.get_session("alice").await.unwrap().is_none());
    assert_eq!(hub_1.registry().connection_count(), 0);
}

#[tokio::test]
async fn second_connection_keeps_the_user_present() {
    let store = MemoryStore::new();
    let hub = start_hub(&store, config("instance-1")).await;

    let mut observer = Client::connect(&hub, "observer").await;
    let mut laptop = Client::connect(&hub, "alice").await;
    let mut phone = Client::connect(&hub, "alice").await;
    observer.join("form_1").await;
    laptop.join("form_1").await;
    phone.join("form_1").await;

    // Only the first connection of a user is announced
    observer.next_of(server_events::USER_JOINED).await;
    observer.assert_quiet().await;
    assert_eq!(store.get_session("alice").await.unwrap().unwrap().connection_ids.len(), 2);

    hub.disconnect(&laptop.conn).await;
    observer.assert_quiet().await;

    hub.disconnect(&phone.conn).await;
    let left = observer.next_of(server_events::USER_LEFT).await;
    assert_eq!(left.payload["user_id"], "alice");
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let store = MemoryStore::new();
    let hub = start_hub(&store, config("instance-1")).await;

    let mut alice = Client::connect(&hub, "alice").await;
    let mut bob = Client::connect(&hub, "bob").await;
    alice.join("form_1").await;
    bob.join("form_1").await;

    hub.disconnect(&bob.conn).await;
    hub.disconnect(&bob.conn).await;

    alice.next_of(server_events::USER_LEFT).await;
    alice.assert_quiet().await;
    assert_eq!(hub.metrics().active_connections(), 1);
}

#[tokio::test]
async fn leave_is_confirmed_and_announced() {
    let store = MemoryStore::new();
    let hub = start_hub(&store, config("instance-1")).await;

    let mut alice = Client::connect(&hub, "alice").await;
    let mut bob = Client::connect(&hub, "bob").await;
    alice.join("form_1").await;
    bob.join("form_1").await;

    bob.send("leave:form", json!({})).await;
    let confirmed = bob.next_of(server_events::LEFT_FORM).await;
    assert_eq!(confirmed.payload["form_id"], "form_1");
    let left = alice.next_of(server_events::USER_LEFT).await;
    assert_eq!(left.payload["reason"], "left");

    bob.send("leave:form", json!({ "form_id": "form_1" })).await;
    let error = bob.next_of(server_events::ERROR).await;
    assert_eq!(error.payload["code"], "NOT_IN_ROOM");
}

#[tokio::test]
async fn joined_form_carries_existing_cursors() {
    let store = MemoryStore::new();
    let hub = start_hub(&store, config("instance-1")).await;

    let mut alice = Client::connect(&hub, "alice").await;
    let mut bob = Client::connect(&hub, "bob").await;
    alice.join("form_1").await;
    alice.send("cursor:move", json!({ "x": 1.0, "y": 2.0, "element_id": "q3" })).await;

    let joined = bob.join("form_1").await;
    let cursors = joined.payload["cursors"].as_array().unwrap();
    assert_eq!(cursors.len(), 1);
    assert_eq!(cursors[0]["user_id"], "alice");
    assert_eq!(cursors[0]["element_id"], "q3");
}

#[tokio::test(start_paused = true)]
async fn cursors_expire_after_their_ttl() {
    let store = MemoryStore::new();
    let hub = start_hub(&store, config("instance-1")).await;

    let mut alice = Client::connect(&hub, "alice").await;
    alice.join("form_1").await;
    alice.send("cursor:move", json!({ "x": 1.0, "y": 2.0 })).await;
    assert_eq!(store.list_room_cursors("form_1").await.unwrap().len(), 1);

    tokio::time::advance(hub.config().cursor_ttl() + Duration::from_secs(1)).await;
    assert!(store.list_room_cursors("form_1").await.unwrap().is_empty());
}

#[tokio::test]
async fn rate_limited_messages_do_not_close_the_connection() {
    let store = MemoryStore::new();
    let hub = start_hub(
        &store,
        Config {
            rate_limit_cursor: 2,
            ..config("instance-1")
        },
    )
    .await;

    let mut alice = Client::connect(&hub, "alice").await;
    alice.join("form_1").await;
    for x in 0..3 {
        alice.send("cursor:move", json!({ "x": x as f64, "y": 0.0 })).await;
    }

    let error = alice.next().await;
    assert_eq!(error.kind, server_events::ERROR);
    assert_eq!(error.payload["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(error.payload["details"]["class"], "cursor");
    assert_eq!(error.payload["details"]["limit"], 2);

    // Other classes keep working
    alice.send("heartbeat", json!({})).await;
    assert_eq!(alice.next().await.kind, server_events::HEARTBEAT_ACK);
    assert!(!alice.conn.is_cancelled());
    assert_eq!(hub.metrics_snapshot().await.rate_limited, 1);
}

#[tokio::test]
async fn bad_frames_are_answered_with_errors() {
    let store = MemoryStore::new();
    let hub = start_hub(
        &store,
        Config {
            max_message_size: 256,
            ..config("instance-1")
        },
    )
    .await;

    let mut alice = Client::connect(&hub, "alice").await;

    alice.send("form:delete", json!({})).await;
    let error = alice.next().await;
    assert_eq!(error.payload["code"], "INVALID_MESSAGE_FORMAT");
    assert_eq!(error.payload["details"]["type"], "form:delete");

    alice.send_raw("{not json").await;
    assert_eq!(alice.next().await.payload["code"], "INVALID_MESSAGE_FORMAT");

    alice.send("join:form", json!({ "form": "form_1" })).await;
    assert_eq!(alice.next().await.payload["code"], "INVALID_MESSAGE_FORMAT");

    alice.send("join:form", json!({ "form_id": "form 1" })).await;
    assert_eq!(alice.next().await.payload["code"], "INVALID_FORM_ID");

    alice.send("cursor:move", json!({ "x": 1.0, "y": 1.0 })).await;
    assert_eq!(alice.next().await.payload["code"], "INVALID_FORM_ID");

    alice.send("question:update", json!({ "question_id": "q1", "content": "x".repeat(300) })).await;
    let error = alice.next().await;
    assert_eq!(error.payload["code"], "MESSAGE_TOO_LARGE");
    assert_eq!(error.payload["details"]["limit"], 256);

    alice.send("heartbeat", json!({ "timestamp": 1 })).await;
    let ack = alice.next().await;
    assert_eq!(ack.kind, server_events::HEARTBEAT_ACK);
    assert!(ack.payload["latency_ms"].as_i64().unwrap() > 0);
    assert!(!alice.conn.is_cancelled());
}

#[tokio::test]
async fn slow_consumer_is_evicted_alone() {
    let store = MemoryStore::new();
    let hub = start_hub(
        &store,
        Config {
            outbound_queue_capacity: 2,
            ..config("instance-1")
        },
    )
    .await;

    let mut alice = Client::connect(&hub, "alice").await;
    let mut bob = Client::connect(&hub, "bob").await;
    alice.join("form_1").await;
    bob.join("form_1").await;
    alice.drain();

    // Bob never reads his queue
    for x in 0..5 {
        alice.send("cursor:move", json!({ "x": x as f64, "y": 0.0 })).await;
    }

    let left = alice.next_of(server_events::USER_LEFT).await;
    assert_eq!(left.payload["user_id"], "bob");
    assert!(bob.conn.is_closed());
    assert_eq!(bob.conn.close_reason(), Some(CloseReason::SlowConsumer));
    assert!(!alice.conn.is_cancelled());

    let metrics = hub.metrics_snapshot().await;
    assert_eq!(metrics.slow_consumer_evictions, 1);
    assert!(metrics.messages_dropped >= 1);
}

#[tokio::test]
async fn sweeper_removes_orphaned_members() {
    let store = MemoryStore::new();
    let hub = start_hub(&store, config("instance-1")).await;

    let mut alice = Client::connect(&hub, "alice").await;
    alice.join("form_1").await;

    // A member whose instance died without cleaning up
    store.add_room_member("form_1", "ghost", "conn-x").await.unwrap();

    hub.sweep_once().await;

    let left = alice.next_of(server_events::USER_LEFT).await;
    assert_eq!(left.payload["user_id"], "ghost");
    assert_eq!(left.payload["reason"], "expired");
    assert_eq!(store.list_room_members("form_1").await.unwrap(), vec!["alice".to_string()]);
    assert!(store.get_room("form_1").await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn store_outage_is_reported_to_the_sender() {
    let store = MemoryStore::new();
    let hub = start_hub(&store, config("instance-1")).await;

    let mut alice = Client::connect(&hub, "alice").await;
    alice.join("form_1").await;

    store.set_unavailable(true);
    alice.send("cursor:move", json!({ "x": 1.0, "y": 1.0 })).await;
    let error = alice.next().await;
    assert_eq!(error.payload["code"], "STORE_UNAVAILABLE");
    assert!(hub.metrics().is_store_degraded());

    store.set_unavailable(false);
    alice.send("heartbeat", json!({})).await;
    assert_eq!(alice.next().await.kind, server_events::HEARTBEAT_ACK);
    assert!(!hub.metrics().is_store_degraded());
}

#[tokio::test]
async fn edits_require_permission_when_enforced() {
    let store = MemoryStore::new();
    let hub = start_hub(
        &store,
        Config {
            enforce_form_permissions: true,
            ..config("instance-1")
        },
    )
    .await;

    let (conn, rx) = hub
        .connect(
            Claims {
                permissions: vec!["form:form_1:view".to_string()],
                ..claims("viewer")
            },
            DeviceInfo::default(),
        )
        .await
        .unwrap();
    let mut viewer = Client { hub: hub.clone(), conn, rx };

    viewer.join("form_1").await;
    viewer.send("question:update", json!({ "question_id": "q1", "content": "x" })).await;
    assert_eq!(viewer.next().await.payload["code"], "PERMISSION_DENIED");

    viewer.send("join:form", json!({ "form_id": "form_2" })).await;
    let error = viewer.next().await;
    assert_eq!(error.payload["code"], "PERMISSION_DENIED");
    assert_eq!(error.payload["details"]["form_id"], "form_2");
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_memberships_past_their_ttl() {
    let ttl = Duration::from_secs(60);
    let store = MemoryStore::with_membership_ttl(ttl);
    let hub = start_hub(
        &store,
        Config {
            room_ttl_secs: ttl.as_secs(),
            ..config("instance-1")
        },
    )
    .await;

    let mut alice = Client::connect(&hub, "alice").await;
    let bob = Client::connect(&hub, "bob").await;
    alice.join("form_1").await;
    bob.send("join:form", json!({ "form_id": "form_1" })).await;
    alice.next_of(server_events::USER_JOINED).await;

    // Well past the membership TTL, kept alive by heartbeats and sweeps
    for _ in 0..6 {
        tokio::time::advance(Duration::from_secs(25)).await;
        hub.touch_connection(&alice.conn).await.unwrap();
        hub.touch_connection(&bob.conn).await.unwrap();
        hub.sweep_once().await;
    }
    assert_eq!(store.list_room_members("form_1").await.unwrap(), vec!["alice", "bob"]);
    alice.drain();

    hub.disconnect(&bob.conn).await;
    let left = alice.next_of(server_events::USER_LEFT).await;
    assert_eq!(left.payload["user_id"], "bob");
    assert_eq!(left.payload["reason"], "disconnected");
}

#[tokio::test(start_paused = true)]
async fn unrefreshed_memberships_expire() {
    let ttl = Duration::from_secs(60);
    let store = MemoryStore::with_membership_ttl(ttl);
    let hub = start_hub(&store, config("instance-1")).await;

    let mut alice = Client::connect(&hub, "alice").await;
    alice.join("form_1").await;
    // A member left behind by an instance that died
    store.add_room_member("form_1", "ghost", "conn-x").await.unwrap();

    tokio::time::advance(Duration::from_secs(40)).await;
    hub.touch_connection(&alice.conn).await.unwrap();
    tokio::time::advance(Duration::from_secs(21)).await;
    assert_eq!(store.list_room_members("form_1").await.unwrap(), vec!["alice"]);
}

#[tokio::test]
async fn sweeper_deletes_idle_rooms_but_not_rejoined_ones() {
    let store = MemoryStore::new();
    let hub = start_hub(
        &store,
        Config {
            room_cleanup_after_secs: 0,
            ..config("instance-1")
        },
    )
    .await;

    let mut alice = Client::connect(&hub, "alice").await;
    alice.join("form_1").await;
    alice.join("form_2").await;
    alice.send("leave:form", json!({ "form_id": "form_1" })).await;
    alice.next_of(server_events::LEFT_FORM).await;
    assert!(!store.get_room("form_1").await.unwrap().unwrap().is_active);

    hub.sweep_once().await;
    assert!(store.get_room("form_1").await.unwrap().is_none());
    assert!(store.get_room("form_2").await.unwrap().unwrap().is_active);

    alice.join("form_1").await;
    hub.sweep_once().await;
    assert!(store.get_room("form_1").await.unwrap().unwrap().is_active);
    assert_eq!(store.list_room_members("form_1").await.unwrap(), vec!["alice"]);
}
