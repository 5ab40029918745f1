use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::error::{InvalidMessageSnafu, InvariantViolationSnafu, StorageResult};
use super::ids::{MessageId, SessionId};

/// Name shown for sessions whose stored user name is blank.
pub const ANONYMOUS_USER_NAME: &str = "Anonymous";

/// One of the two parties in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    /// The site visitor. Stored as `"user"`.
    #[serde(rename = "user")]
    Visitor,
    Admin,
}

impl Sender {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Visitor => "user",
            Self::Admin => "admin",
        }
    }

    pub fn from_wire(raw: &str) -> StorageResult<Self> {
        match raw {
            "user" => Ok(Self::Visitor),
            "admin" => Ok(Self::Admin),
            _ => InvariantViolationSnafu {
                stage: "sender-from-wire",
                details: format!("unknown message sender '{raw}'"),
            }
            .fail(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub user_name: String,
    pub user_email: String,
    pub created_at_ms: u64,
    /// `None` until the first message lands (or after a re-registration).
    pub last_message_at_ms: Option<u64>,
    pub unread_count: u32,
}

impl SessionRecord {
    pub fn display_name(&self) -> &str {
        self.display_name_or(ANONYMOUS_USER_NAME)
    }

    pub fn display_name_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        let trimmed = self.user_name.trim();
        if trimmed.is_empty() { fallback } else { trimmed }
    }

    pub fn activity_key(&self) -> u64 {
        self.last_message_at_ms.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub id: SessionId,
    pub user_name: String,
    pub user_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub session_id: SessionId,
    /// Store-assigned insertion position within the session, starting at 1.
    pub seq: u64,
    pub sender: Sender,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub reply_to: Option<MessageId>,
    pub timestamp_ms: u64,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: Sender,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    pub fn text(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: Some(text.into()),
            image_url: None,
            reply_to: None,
        }
    }

    pub fn image(sender: Sender, image_url: impl Into<String>) -> Self {
        Self {
            sender,
            text: None,
            image_url: Some(image_url.into()),
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: MessageId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Trims both bodies and drops blank ones. Returns `None` when nothing is left to send.
    pub fn normalized(mut self) -> Option<Self> {
        self.text = normalize_body(self.text);
        self.image_url = normalize_body(self.image_url);

        if self.text.is_none() && self.image_url.is_none() {
            return None;
        }

        Some(self)
    }

    pub(crate) fn validated(self, stage: &'static str) -> StorageResult<Self> {
        match self.normalized() {
            Some(message) => Ok(message),
            None => InvalidMessageSnafu {
                stage,
                details: "message needs text or an image URL".to_string(),
            }
            .fail(),
        }
    }
}

/// A session together with its full ordered message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: SessionRecord,
    pub messages: Vec<MessageRecord>,
}

impl SessionSnapshot {
    pub fn id(&self) -> &SessionId {
        &self.session.id
    }
}

/// Ordering used for every message list handed to subscribers.
pub fn message_order(left: &MessageRecord, right: &MessageRecord) -> Ordering {
    left.timestamp_ms
        .cmp(&right.timestamp_ms)
        .then_with(|| left.seq.cmp(&right.seq))
        .then_with(|| left.id.cmp(&right.id))
}

/// Most recently active conversation first.
pub fn session_order(left: &SessionRecord, right: &SessionRecord) -> Ordering {
    right
        .activity_key()
        .cmp(&left.activity_key())
        .then_with(|| right.created_at_ms.cmp(&left.created_at_ms))
        .then_with(|| left.id.cmp(&right.id))
}

fn normalize_body(body: Option<String>) -> Option<String> {
    body.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, last_message_at_ms: Option<u64>, created_at_ms: u64) -> SessionRecord {
        SessionRecord {
            id: SessionId::parse(id).unwrap(),
            user_name: String::new(),
            user_email: String::new(),
            created_at_ms,
            last_message_at_ms,
            unread_count: 0,
        }
    }

    #[test]
    fn blank_bodies_are_not_sendable() {
        let blank = NewMessage {
            sender: Sender::Visitor,
            text: Some("   ".to_string()),
            image_url: Some(String::new()),
            reply_to: None,
        };
        assert!(blank.normalized().is_none());

        let image_only = NewMessage::image(Sender::Admin, " https://cdn/x.jpg ")
            .normalized()
            .unwrap();
        assert_eq!(image_only.image_url.as_deref(), Some("https://cdn/x.jpg"));
        assert_eq!(image_only.text, None);
    }

    #[test]
    fn sessions_sort_by_latest_activity_then_creation() {
        let mut sessions = vec![
            session("quiet", None, 50),
            session("older", Some(100), 10),
            session("newer", Some(200), 5),
            session("fresh", None, 60),
        ];
        sessions.sort_by(session_order);

        let ids = sessions
            .iter()
            .map(|session| session.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["newer", "older", "fresh", "quiet"]);
    }

    #[test]
    fn blank_names_render_as_anonymous() {
        let record = session("s1", None, 0);
        assert_eq!(record.display_name(), ANONYMOUS_USER_NAME);
    }

    #[test]
    fn sender_wire_names_match_document_shape() {
        assert_eq!(Sender::Visitor.as_wire(), "user");
        assert_eq!(Sender::from_wire("admin").unwrap(), Sender::Admin);
        assert!(Sender::from_wire("bot").is_err());
    }
}
