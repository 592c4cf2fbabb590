//! Key layout shared by every instance. All keys live under the `collab:` prefix.

pub const PREFIX: &str = "collab";

/// Set of known room ids
pub fn rooms_index() -> String {
    format!("{}:rooms", PREFIX)
}

/// Key format: collab:room:{form_id}
pub fn room(form_id: &str) -> String {
    format!("{}:room:{}", PREFIX, form_id)
}

/// Set of user ids present in a room
pub fn room_members(form_id: &str) -> String {
    format!("{}:room:{}:members", PREFIX, form_id)
}

/// Set of connection ids a user holds in a room
pub fn member_connections(form_id: &str, user_id: &str) -> String {
    format!("{}:room:{}:member:{}", PREFIX, form_id, user_id)
}

/// Set of user ids with a cursor in a room
pub fn room_cursors(form_id: &str) -> String {
    format!("{}:room:{}:cursors", PREFIX, form_id)
}

pub fn session(user_id: &str) -> String {
    format!("{}:session:{}", PREFIX, user_id)
}

pub fn connection(connection_id: &str) -> String {
    format!("{}:connection:{}", PREFIX, connection_id)
}

pub fn cursor(form_id: &str, user_id: &str) -> String {
    format!("{}:cursor:{}:{}", PREFIX, form_id, user_id)
}

pub fn rate_limit(user_id: &str, class: &str) -> String {
    format!("{}:ratelimit:{}:{}", PREFIX, user_id, class)
}

pub fn question_history(form_id: &str, question_id: &str) -> String {
    format!("{}:question:{}:{}", PREFIX, form_id, question_id)
}

pub fn room_channel(form_id: &str) -> String {
    format!("{}:channel:room:{}", PREFIX, form_id)
}

pub fn user_channel(user_id: &str) -> String {
    format!("{}:channel:user:{}", PREFIX, user_id)
}

/// Pattern matching every room and user channel
pub const CHANNEL_PATTERN: &str = "collab:channel:*";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_match_the_subscription_pattern() {
        let prefix = CHANNEL_PATTERN.trim_end_matches('*');
        assert!(room_channel("form_1").starts_with(prefix));
        assert!(user_channel("u1").starts_with(prefix));
    }

    #[test]
    fn rate_limit_key_is_per_user_and_class() {
        assert_eq!(rate_limit("u1", "cursor"), "collab:ratelimit:u1:cursor");
    }
}
