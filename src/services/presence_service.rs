use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CollabError, StoreError};
use crate::models::{
    server_events, Cursor, CursorHiddenMessage, CursorMovePayload, Envelope, JoinedFormMessage, Room,
    UserDescriptor, UserJoinedMessage, UserLeftMessage,
};
use crate::store::{now_ms, Exclude, StateStore};
use crate::ws::connctx::ConnCtx;
use crate::ws::dispatcher::Dispatcher;
use crate::ws::registry::LocalRegistry;

const MAX_FORM_ID_LEN: usize = 128;

/// Reasons carried by `user:left`
pub const LEFT: &str = "left";
pub const DISCONNECTED: &str = "disconnected";
pub const EXPIRED: &str = "expired";

/// Form ids are 1-128 characters of `[A-Za-z0-9_.:-]`
pub fn validate_form_id(form_id: &str) -> Result<(), CollabError> {
    let valid = !form_id.is_empty()
        && form_id.len() <= MAX_FORM_ID_LEN
        && form_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(CollabError::InvalidFormId(form_id.to_string()))
    }
}

/// Outcome of one sweep over the store
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub rooms_checked: usize,
    pub orphans_removed: usize,
    pub rooms_deactivated: usize,
    pub rooms_deleted: usize,
}

/// Room membership and cursor state, kept in the store and announced through the dispatcher
pub struct PresenceService {
    store: Arc<dyn StateStore>,
    registry: Arc<LocalRegistry>,
    dispatcher: Arc<Dispatcher>,
    instance_id: String,
    max_users_per_room: usize,
    max_rooms_per_connection: usize,
    enforce_permissions: bool,
    room_ttl: Duration,
    connection_ttl: Duration,
    cursor_ttl: Duration,
    room_cleanup_after_ms: i64,
}

impl PresenceService {
    pub fn new(
        config: &Config,
        instance_id: &str,
        store: Arc<dyn StateStore>,
        registry: Arc<LocalRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            instance_id: instance_id.to_string(),
            max_users_per_room: config.max_users_per_room,
            max_rooms_per_connection: config.max_rooms_per_connection,
            enforce_permissions: config.enforce_form_permissions,
            room_ttl: config.room_ttl(),
            connection_ttl: config.connection_ttl(),
            cursor_ttl: config.cursor_ttl(),
            room_cleanup_after_ms: (config.room_cleanup_after_secs * 1000) as i64,
        }
    }

    /// `form_id` when given, else the connection's only room
    pub fn resolve_room(&self, conn: &ConnCtx, form_id: Option<&str>) -> Result<String, CollabError> {
        match form_id {
            Some(form_id) => {
                validate_form_id(form_id)?;
                if !conn.in_room(form_id) {
                    return Err(CollabError::NotInRoom(form_id.to_string()));
                }
                Ok(form_id.to_string())
            }
            None => conn
                .single_room()
                .ok_or_else(|| CollabError::InvalidFormId("form_id is required".to_string())),
        }
    }

    pub fn can_edit(&self, conn: &ConnCtx, form_id: &str) -> bool {
        !self.enforce_permissions || conn.claims.can_edit_form(form_id)
    }

    /// Persist the connection record, including its joined rooms
    pub async fn save_connection(&self, conn: &ConnCtx) -> Result<(), StoreError> {
        self.store
            .save_connection(&conn.to_record(&self.instance_id), self.connection_ttl)
            .await
    }

    /// Join a room. Returns the confirmation for the joining connection.
    pub async fn join(&self, conn: &ConnCtx, form_id: &str) -> Result<JoinedFormMessage, CollabError> {
        // 1. Validate the form id and permissions
        validate_form_id(form_id)?;
        if self.enforce_permissions && !conn.claims.can_access_form(form_id) {
            return Err(CollabError::PermissionDenied(form_id.to_string()));
        }

        // 2. Enforce the room limits
        let rejoin = conn.in_room(form_id);
        if !rejoin && conn.room_count() >= self.max_rooms_per_connection {
            return Err(CollabError::TooManyRooms(self.max_rooms_per_connection));
        }
        let members = self.store.list_room_members(form_id).await?;
        let present = members.iter().any(|m| m == conn.user_id());
        if !present && members.len() >= self.max_users_per_room {
            return Err(CollabError::RoomFull(form_id.to_string()));
        }

        // 3. Create or refresh the room
        let now = now_ms();
        let room = match self.store.get_room(form_id).await? {
            Some(mut room) => {
                room.is_active = true;
                room.updated_at = now;
                room
            }
            None => {
                info!("Creating room for form {}", form_id);
                Room::new(form_id, self.max_users_per_room, now)
            }
        };
        self.store.save_room(&room, self.room_ttl).await?;

        // 4. Link the room to the connection before publishing the membership,
        //    so the sweeper never sees a member without a matching record
        conn.add_room(form_id);
        let first = match self.link_member(conn, form_id).await {
            Ok(first) => first,
            Err(e) => {
                if !rejoin {
                    conn.remove_room(form_id);
                }
                return Err(e.into());
            }
        };
        self.registry.attach(form_id, conn.id);

        // 5. Announce the user to the rest of the room
        if first {
            let envelope = Envelope::from_user(
                server_events::USER_JOINED,
                &UserJoinedMessage {
                    form_id: form_id.to_string(),
                    user: conn.user.clone(),
                },
                conn.user_id(),
            );
            self.dispatcher
                .broadcast_to_room(form_id, envelope, Exclude::Connection(conn.id))
                .await?;
        }
        debug!(user_id = conn.user_id(), form_id, first, "User joined room");

        // 6. Confirmation with the current presence
        Ok(JoinedFormMessage {
            form_id: form_id.to_string(),
            connection_id: conn.id.to_string(),
            user: conn.user.clone(),
            users: self.room_users(form_id).await?,
            cursors: self.store.list_room_cursors(form_id).await?,
        })
    }

    async fn link_member(&self, conn: &ConnCtx, form_id: &str) -> Result<bool, StoreError> {
        self.save_connection(conn).await?;
        self.store
            .add_room_member(form_id, conn.user_id(), &conn.id.to_string())
            .await
    }

    /// Leave a room the connection explicitly joined
    pub async fn leave(&self, conn: &ConnCtx, form_id: &str) -> Result<(), CollabError> {
        if !conn.remove_room(form_id) {
            return Err(CollabError::NotInRoom(form_id.to_string()));
        }
        self.registry.detach(form_id, &conn.id);
        self.save_connection(conn).await?;
        self.remove_member(conn, form_id, LEFT).await?;
        Ok(())
    }

    /// Leave every joined room. Used by the disconnect cascade, keeps going on errors.
    pub async fn leave_all(&self, conn: &ConnCtx, reason: &str) -> Result<(), StoreError> {
        let mut result = Ok(());
        for form_id in conn.rooms() {
            conn.remove_room(&form_id);
            self.registry.detach(&form_id, &conn.id);
            if let Err(e) = self.remove_member(conn, &form_id, reason).await {
                warn!("Failed to remove {} from room {}: {}", conn.id, form_id, e);
                result = Err(e);
            }
        }
        result
    }

    // Drops the connection from the room membership. When it was the user's last
    // connection there the cursor goes too and the room hears `user:left`.
    async fn remove_member(&self, conn: &ConnCtx, form_id: &str, reason: &str) -> Result<(), StoreError> {
        let fully_left = self
            .store
            .remove_room_member(form_id, conn.user_id(), &conn.id.to_string())
            .await?;
        if fully_left {
            self.announce_departure(form_id, conn.user_id(), reason, Exclude::Connection(conn.id))
                .await?;
        }
        Ok(())
    }

    async fn announce_departure(&self, form_id: &str, user_id: &str, reason: &str, exclude: Exclude) -> Result<(), StoreError> {
        self.store.delete_cursor(form_id, user_id).await?;
        let envelope = Envelope::from_user(
            server_events::USER_LEFT,
            &UserLeftMessage {
                form_id: form_id.to_string(),
                user_id: user_id.to_string(),
                reason: reason.to_string(),
            },
            user_id,
        );
        self.dispatcher.broadcast_to_room(form_id, envelope, exclude).await?;
        self.deactivate_if_empty(form_id).await?;
        debug!(user_id, form_id, reason, "User left room");
        Ok(())
    }

    async fn deactivate_if_empty(&self, form_id: &str) -> Result<bool, StoreError> {
        if !self.store.list_room_members(form_id).await?.is_empty() {
            return Ok(false);
        }
        if let Some(mut room) = self.store.get_room(form_id).await? {
            if room.is_active {
                room.is_active = false;
                room.updated_at = now_ms();
                self.store.save_room(&room, self.room_ttl).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Descriptors of the users present in a room
    pub async fn room_users(&self, form_id: &str) -> Result<Vec<UserDescriptor>, StoreError> {
        let members = self.store.list_room_members(form_id).await?;
        let mut users = Vec::with_capacity(members.len());
        for user_id in members {
            let name = self
                .store
                .get_session(&user_id)
                .await?
                .and_then(|session| session.name);
            users.push(UserDescriptor::new(&user_id, name.as_deref()));
        }
        Ok(users)
    }

    /// Overwrite the user's cursor in the room and announce it to the other users
    pub async fn move_cursor(&self, conn: &ConnCtx, form_id: &str, payload: &CursorMovePayload) -> Result<Cursor, CollabError> {
        let cursor = Cursor {
            form_id: form_id.to_string(),
            user_id: conn.user_id().to_string(),
            x: payload.x,
            y: payload.y,
            element_id: payload.element_id.clone(),
            color: conn.user.color.clone(),
            updated_at: now_ms(),
        };
        self.store.save_cursor(&cursor, self.cursor_ttl).await?;
        let envelope = Envelope::from_user(server_events::CURSOR_UPDATE, &cursor, conn.user_id());
        self.dispatcher
            .broadcast_to_room(form_id, envelope, Exclude::User(conn.user_id().to_string()))
            .await?;
        Ok(cursor)
    }

    pub async fn hide_cursor(&self, conn: &ConnCtx, form_id: &str) -> Result<(), CollabError> {
        self.store.delete_cursor(form_id, conn.user_id()).await?;
        let envelope = Envelope::from_user(
            server_events::CURSOR_HIDDEN,
            &CursorHiddenMessage {
                form_id: form_id.to_string(),
                user_id: conn.user_id().to_string(),
            },
            conn.user_id(),
        );
        self.dispatcher
            .broadcast_to_room(form_id, envelope, Exclude::User(conn.user_id().to_string()))
            .await?;
        Ok(())
    }

    /// Extend the membership of every room the connection is in. Heartbeats call this
    /// so memberships in the store expire only once their connection stops talking.
    pub async fn refresh_memberships(&self, conn: &ConnCtx) -> Result<(), StoreError> {
        for form_id in conn.rooms() {
            self.store.refresh_room_member(&form_id, conn.user_id()).await?;
        }
        Ok(())
    }

    /// Remove memberships whose connection record expired or no longer lists the room,
    /// then retire rooms that stayed empty past the cleanup threshold.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let now = now_ms();

        for mut room in self.store.list_rooms().await? {
            report.rooms_checked += 1;
            let form_id = room.form_id.clone();

            for user_id in self.store.list_room_members(&form_id).await? {
                let connections = self.store.list_member_connections(&form_id, &user_id).await?;
                if connections.is_empty() {
                    // The user's connection set expired on its own
                    report.orphans_removed += 1;
                    if self.store.remove_room_member(&form_id, &user_id, "").await? {
                        warn!("Removing member {} without connections from room {}", user_id, form_id);
                        self.announce_departure(&form_id, &user_id, EXPIRED, Exclude::Nobody).await?;
                    }
                    continue;
                }

                let mut any_live = false;
                for connection_id in connections {
                    let live = match self.store.get_connection(&connection_id).await? {
                        Some(record) => record.rooms.contains(&form_id),
                        None => false,
                    };
                    if live {
                        any_live = true;
                        continue;
                    }
                    report.orphans_removed += 1;
                    if self.store.remove_room_member(&form_id, &user_id, &connection_id).await? {
                        warn!("Removing orphaned member {} from room {}", user_id, form_id);
                        self.announce_departure(&form_id, &user_id, EXPIRED, Exclude::Nobody).await?;
                    }
                }
                if any_live {
                    self.store.refresh_room_member(&form_id, &user_id).await?;
                }
            }

            if !self.store.list_room_members(&form_id).await?.is_empty() {
                // Rooms in use stay active and do not expire
                room.is_active = true;
                self.store.save_room(&room, self.room_ttl).await?;
                continue;
            }
            if room.is_active {
                room.is_active = false;
                room.updated_at = now;
                self.store.save_room(&room, self.room_ttl).await?;
                report.rooms_deactivated += 1;
            } else if now - room.updated_at >= self.room_cleanup_after_ms {
                // Rechecked atomically by the store, a join since the listing keeps the room
                if self
                    .store
                    .delete_room_if_idle(&form_id, now - self.room_cleanup_after_ms)
                    .await?
                {
                    info!("Deleted room {} after {} ms without members", form_id, now - room.updated_at);
                    report.rooms_deleted += 1;
                } else {
                    debug!("Room {} is in use again, keeping it", form_id);
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_id_validation() {
        assert!(validate_form_id("form_1").is_ok());
        assert!(validate_form_id("org:form-2.v1").is_ok());
        assert!(validate_form_id("").is_err());
        assert!(validate_form_id("form 1").is_err());
        assert!(validate_form_id("form/1").is_err());
        assert!(validate_form_id(&"x".repeat(129)).is_err());
    }
}
