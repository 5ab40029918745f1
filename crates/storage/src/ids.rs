use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{InvalidIdSnafu, MalformedSessionIdSnafu, StorageError, StorageResult};

/// Prefix carried by every visitor-generated session id.
pub const SESSION_ID_PREFIX: &str = "session_";

const SESSION_ID_MAX_LEN: usize = 128;

/// Opaque per-visitor conversation key.
///
/// The value is minted on the visitor side and used verbatim as the path
/// segment under `chats/`, so it must not contain separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let trimmed = raw.trim();
        ensure!(
            !trimmed.is_empty(),
            MalformedSessionIdSnafu {
                stage: "parse-session-id-empty",
                raw: raw.to_string(),
                reason: "session id is empty",
            }
        );
        ensure!(
            trimmed.len() <= SESSION_ID_MAX_LEN,
            MalformedSessionIdSnafu {
                stage: "parse-session-id-length",
                raw: raw.to_string(),
                reason: "session id is too long",
            }
        );
        ensure!(
            trimmed.chars().all(|character| {
                character.is_ascii_alphanumeric() || matches!(character, '_' | '-')
            }),
            MalformedSessionIdSnafu {
                stage: "parse-session-id-charset",
                raw: raw.to_string(),
                reason: "session id may only contain ASCII letters, digits, '_' and '-'",
            }
        );

        Ok(Self(trimmed.to_string()))
    }

    /// Mints a fresh id from two independent random components.
    pub fn generate() -> Self {
        let first = Uuid::new_v4().as_u64_pair().0;
        let second = Uuid::new_v4().as_u64_pair().1;
        Self(format!(
            "{SESSION_ID_PREFIX}{}{}",
            to_base36(first),
            to_base36(second)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for SessionId {
    type Error = StorageError;

    fn try_from(value: String) -> StorageResult<Self> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

/// Store-generated message key. UUIDv7 keys sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-message-id",
            id_type: "message-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl FromStr for MessageId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut encoded = Vec::with_capacity(13);
    while value > 0 {
        encoded.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    encoded.reverse();

    // Every byte comes from DIGITS, which is ASCII.
    encoded.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_session_ids_parse_back_unchanged() {
        let generated = SessionId::generate();
        assert!(generated.as_str().starts_with(SESSION_ID_PREFIX));
        assert_eq!(SessionId::parse(generated.as_str()).unwrap(), generated);
    }

    #[test]
    fn generated_session_ids_do_not_collide() {
        let ids = (0..2_000)
            .map(|_| SessionId::generate())
            .collect::<HashSet<_>>();
        assert_eq!(ids.len(), 2_000);
    }

    #[test]
    fn session_id_rejects_path_separators_and_blank_input() {
        assert!(SessionId::parse("   ").is_err());
        assert!(SessionId::parse("chats/other").is_err());
        assert!(SessionId::parse(&"a".repeat(SESSION_ID_MAX_LEN + 1)).is_err());
        assert_eq!(SessionId::parse(" session_ab ").unwrap().as_str(), "session_ab");
    }

    #[test]
    fn base36_matches_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(u64::MAX), "3w5e11264sgsf");
    }

    #[test]
    fn message_id_rejects_non_uuid() {
        let error = MessageId::parse("not-a-uuid").unwrap_err();
        assert!(matches!(error, StorageError::InvalidId { .. }));
    }
}
