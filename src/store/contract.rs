//! Behaviour every `StateStore` must share. Each check namespaces its keys under `scope`
//! so it can run against a Redis that other tests or instances are using.

use std::time::Duration;

use futures_util::StreamExt;

use super::{Exclude, RelayMessage, RelayScope, StateStore};
use crate::models::{Cursor, Envelope, Room};

fn cursor(form_id: &str, user_id: &str) -> Cursor {
    Cursor {
        form_id: form_id.to_string(),
        user_id: user_id.to_string(),
        x: 1.0,
        y: 2.0,
        element_id: None,
        color: "#000075".to_string(),
        updated_at: 0,
    }
}

pub async fn membership_is_counted_per_connection(store: &dyn StateStore, scope: &str) {
    let form = format!("{}-form", scope);
    assert!(store.add_room_member(&form, "a", "c1").await.unwrap());
    assert!(!store.add_room_member(&form, "a", "c2").await.unwrap());
    assert!(store.add_room_member(&form, "b", "c3").await.unwrap());
    assert_eq!(store.list_room_members(&form).await.unwrap(), vec!["a", "b"]);

    let mut connections = store.list_member_connections(&form, "a").await.unwrap();
    connections.sort();
    assert_eq!(connections, vec!["c1", "c2"]);

    assert!(!store.remove_room_member(&form, "a", "c1").await.unwrap());
    assert!(store.remove_room_member(&form, "a", "c2").await.unwrap());
    // Removing twice never reports a second departure
    assert!(!store.remove_room_member(&form, "a", "c2").await.unwrap());
    assert_eq!(store.list_room_members(&form).await.unwrap(), vec!["b"]);
}

/// `ttl` must be the store's membership TTL, a whole number of seconds
pub async fn refreshed_membership_outlives_its_ttl(store: &dyn StateStore, scope: &str, ttl: Duration) {
    let form = format!("{}-form", scope);
    store.add_room_member(&form, "a", "c1").await.unwrap();

    tokio::time::sleep(ttl * 3 / 5).await;
    store.refresh_room_member(&form, "a").await.unwrap();
    tokio::time::sleep(ttl * 3 / 5).await;
    assert_eq!(store.list_room_members(&form).await.unwrap(), vec!["a"]);
    assert_eq!(store.list_member_connections(&form, "a").await.unwrap(), vec!["c1"]);

    tokio::time::sleep(ttl + ttl / 2).await;
    assert!(store.list_room_members(&form).await.unwrap().is_empty());
    assert!(store.list_member_connections(&form, "a").await.unwrap().is_empty());
}

pub async fn rate_limit_blocks_after_limit_and_resets(store: &dyn StateStore, scope: &str) {
    let key = format!("{}-ratelimit", scope);
    let window = Duration::from_secs(1);
    for n in 1..=3 {
        let info = store.check_rate_limit(&key, 3, window).await.unwrap();
        assert_eq!(info.count, n);
        assert!(!info.blocked);
    }
    let info = store.check_rate_limit(&key, 3, window).await.unwrap();
    assert!(info.blocked);
    assert_eq!(info.window_ms, 1000);
    assert!(info.reset_at > 0);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let info = store.check_rate_limit(&key, 3, window).await.unwrap();
    assert_eq!(info.count, 1);
    assert!(!info.blocked);
}

pub async fn cursors_are_indexed_per_room(store: &dyn StateStore, scope: &str) {
    let form = format!("{}-form", scope);
    let other = format!("{}-other", scope);
    let ttl = Duration::from_secs(60);
    store.save_cursor(&cursor(&form, "a"), ttl).await.unwrap();
    store.save_cursor(&cursor(&form, "b"), ttl).await.unwrap();
    store.save_cursor(&cursor(&other, "a"), ttl).await.unwrap();

    let users: Vec<_> = store
        .list_room_cursors(&form)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.user_id)
        .collect();
    assert_eq!(users, vec!["a", "b"]);

    store.delete_cursor(&form, "a").await.unwrap();
    assert!(store.get_cursor(&form, "a").await.unwrap().is_none());
    let remaining = store.list_room_cursors(&form).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].user_id, "b");
    assert_eq!(store.list_room_cursors(&other).await.unwrap().len(), 1);
}

pub async fn cursor_expires_after_ttl(store: &dyn StateStore, scope: &str) {
    let form = format!("{}-form", scope);
    store.save_cursor(&cursor(&form, "a"), Duration::from_secs(1)).await.unwrap();
    assert!(store.get_cursor(&form, "a").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(store.get_cursor(&form, "a").await.unwrap().is_none());
    assert!(store.list_room_cursors(&form).await.unwrap().is_empty());
}

pub async fn relay_reaches_subscribers(store: &dyn StateStore, scope: &str) {
    let form = format!("{}-form", scope);
    let mut stream = store.subscribe().await.unwrap();
    let message = RelayMessage {
        origin: scope.to_string(),
        scope: RelayScope::Room(form.clone()),
        exclude: Exclude::User("a".to_string()),
        envelope: Envelope::new("cursor:update", &serde_json::json!({ "x": 1 })),
    };
    store.publish(&message).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        // The channel may carry traffic from other publishers
        while let Some(received) = stream.next().await {
            if received.origin == scope {
                return received;
            }
        }
        panic!("relay stream ended");
    })
    .await
    .expect("relayed message never arrived");
    assert_eq!(received.scope, RelayScope::Room(form));
    assert_eq!(received.exclude, Exclude::User("a".to_string()));
    assert_eq!(received.envelope.kind, "cursor:update");
}

pub async fn idle_room_is_deleted_only_when_empty(store: &dyn StateStore, scope: &str) {
    let form = format!("{}-form", scope);
    let ttl = Duration::from_secs(60);
    let mut room = Room::new(&form, 10, 1_000);
    room.is_active = false;
    store.save_room(&room, ttl).await.unwrap();
    store.save_cursor(&cursor(&form, "a"), ttl).await.unwrap();

    // A join that landed after the sweep looked at the room
    store.add_room_member(&form, "a", "c1").await.unwrap();
    assert!(!store.delete_room_if_idle(&form, 5_000).await.unwrap());
    assert!(store.get_room(&form).await.unwrap().is_some());
    store.remove_room_member(&form, "a", "c1").await.unwrap();

    // Reactivated by a join that has not linked its member yet
    room.is_active = true;
    store.save_room(&room, ttl).await.unwrap();
    assert!(!store.delete_room_if_idle(&form, 5_000).await.unwrap());

    // Used again more recently than the cutoff
    room.is_active = false;
    room.updated_at = 6_000;
    store.save_room(&room, ttl).await.unwrap();
    assert!(!store.delete_room_if_idle(&form, 5_000).await.unwrap());

    assert!(store.delete_room_if_idle(&form, 6_000).await.unwrap());
    assert!(store.get_room(&form).await.unwrap().is_none());
    assert!(store.list_room_cursors(&form).await.unwrap().is_empty());
    assert!(!store.list_rooms().await.unwrap().iter().any(|r| r.form_id == form));

    // Nothing left to delete is still idle
    assert!(store.delete_room_if_idle(&form, 6_000).await.unwrap());
}
