use chrono::Utc;

use crate::server::message::{MessageError, NewMessage, PostEvent};

/// Longest accepted username, in characters, after trimming.
pub const MAX_USERNAME_CHARS: usize = 50;
/// Longest accepted message body, in characters, after trimming.
pub const MAX_CONTENT_CHARS: usize = 1000;
/// Longest accepted room name, in characters.
pub const MAX_ROOM_CHARS: usize = 100;

/// Trims a username and checks it is 1 to 50 characters.
pub fn validate_username(username: &str) -> Result<String, MessageError> {
    bounded("username", username, MAX_USERNAME_CHARS)
}

/// Checks a decoded room name: 1 to 100 characters, no `/`.
pub fn validate_room(room: &str) -> Result<(), MessageError> {
    if room.is_empty() {
        return Err(MessageError::EmptyField("room"));
    }
    if room.chars().count() > MAX_ROOM_CHARS {
        return Err(MessageError::FieldTooLong {
            field: "room",
            max: MAX_ROOM_CHARS,
        });
    }
    if room.contains('/') {
        return Err(MessageError::InvalidFormat);
    }
    Ok(())
}

/// Validates a client post and turns it into a message for `room`.
///
/// # Returns
///
/// * `Ok(NewMessage)` with trimmed fields and the creation instant set to now.
/// * `Err(MessageError::EmptyField)` if username or content is blank after trimming.
/// * `Err(MessageError::FieldTooLong)` if username exceeds 50 or content 1000 characters.
pub fn validate_post(room: &str, post: &PostEvent) -> Result<NewMessage, MessageError> {
    let username = validate_username(&post.username)?;
    let content = bounded("content", &post.content, MAX_CONTENT_CHARS)?;
    let avatar = post
        .avatar
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);

    Ok(NewMessage {
        room: room.to_string(),
        username,
        content,
        avatar,
        created_at: Utc::now(),
    })
}

fn bounded(field: &'static str, value: &str, max: usize) -> Result<String, MessageError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MessageError::EmptyField(field));
    }
    if trimmed.chars().count() > max {
        return Err(MessageError::FieldTooLong { field, max });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(username: &str, content: &str) -> PostEvent {
        PostEvent {
            username: username.into(),
            content: content.into(),
            avatar: Some("  ".into()),
        }
    }

    #[test]
    fn trims_fields_and_drops_blank_avatar() {
        let msg = validate_post("lobby", &post("  alice ", " hi there ")).unwrap();
        assert_eq!(msg.room, "lobby");
        assert_eq!(msg.username, "alice");
        assert_eq!(msg.content, "hi there");
        assert_eq!(msg.avatar, None);
    }

    #[test]
    fn whitespace_content_is_empty() {
        assert!(matches!(
            validate_post("lobby", &post("alice", "   ")),
            Err(MessageError::EmptyField("content"))
        ));
        assert!(matches!(
            validate_post("lobby", &post(" ", "hi")),
            Err(MessageError::EmptyField("username"))
        ));
    }

    #[test]
    fn limits_count_characters_not_bytes() {
        let name = "é".repeat(MAX_USERNAME_CHARS);
        assert!(validate_post("lobby", &post(&name, "ok")).is_ok());

        let long_name = "a".repeat(MAX_USERNAME_CHARS + 1);
        assert!(matches!(
            validate_post("lobby", &post(&long_name, "ok")),
            Err(MessageError::FieldTooLong { field: "username", .. })
        ));

        let body = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(validate_post("lobby", &post("alice", &body)).is_err());
        assert!(validate_post("lobby", &post("alice", &body[1..])).is_ok());
    }
}
