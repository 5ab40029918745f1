use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, StorageResult,
};
use super::error::{InvalidMessageSnafu, NotFoundSnafu, SqliteQuerySnafu, StorageError};
use super::feed::{ChangeFeed, SubscriptionHandle, snapshot_subscription};
use super::ids::{MessageId, SessionId};
use super::types::{
    MessageRecord, NewMessage, NewSession, Sender, SessionRecord, SessionSnapshot, message_order,
    session_order,
};
use super::{BoxFuture, ChatStore};

/// Chat store backed by a single SQLite database.
///
/// All writes run through one pooled connection, so each transaction below is
/// serialized against every other writer.
#[derive(Debug, Clone)]
pub struct SqliteChatStore {
    pool: SqlitePool,
    database_url: String,
    feed: ChangeFeed,
}

impl SqliteChatStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // An in-memory database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(
            database_url = %database_url,
            journal_mode = %journal_mode,
            "opened chat store"
        );

        Ok(Self {
            pool,
            database_url,
            feed: ChangeFeed::default(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    async fn create_session_tx(&self, input: NewSession) -> StorageResult<SessionRecord> {
        let now = unix_timestamp_millis();

        // Re-registering overwrites the session document; its messages stay.
        sqlx::query(
            "INSERT INTO chat_sessions (id, user_name, user_email, created_at, last_message_at, unread_count) VALUES (?, ?, ?, ?, NULL, 0)
             ON CONFLICT (id) DO UPDATE SET user_name = excluded.user_name, user_email = excluded.user_email, created_at = excluded.created_at, last_message_at = NULL, unread_count = 0",
        )
        .bind(input.id.as_str())
        .bind(&input.user_name)
        .bind(&input.user_email)
        .bind(u64_to_i64(now, "session-create-created-at")?)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-create-upsert",
        })?;

        self.feed.publish(&input.id);

        Ok(SessionRecord {
            id: input.id,
            user_name: input.user_name,
            user_email: input.user_email,
            created_at_ms: now,
            last_message_at_ms: None,
            unread_count: 0,
        })
    }

    async fn append_message_tx(
        &self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let input = input.validated("message-append-validate")?;
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-append-begin",
        })?;

        // Touching the session row first takes the write lock before anything is read.
        let counter_sql = match input.sender {
            Sender::Visitor => {
                "UPDATE chat_sessions SET unread_count = unread_count + 1 WHERE id = ?"
            }
            Sender::Admin => "UPDATE chat_sessions SET unread_count = 0 WHERE id = ?",
        };
        let touched = sqlx::query(counter_sql)
            .bind(session_id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-unread-count",
            })?;
        ensure!(
            touched.rows_affected() == 1,
            NotFoundSnafu {
                stage: "message-append-missing-session",
                entity: "session",
                id: session_id.to_string(),
            }
        );

        if let Some(reply_to) = input.reply_to {
            ensure!(
                message_in_session(&mut tx, &session_id, reply_to).await?,
                InvalidMessageSnafu {
                    stage: "message-append-reply-target",
                    details: format!("reply target '{reply_to}' is not in this session"),
                }
            );
        }

        let (max_seq, max_timestamp) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(MAX(seq), 0), COALESCE(MAX(timestamp_ms), 0) FROM chat_messages WHERE session_id = ?",
        )
        .bind(session_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-next-seq",
        })?;

        // The store clock never runs backwards within a session.
        let timestamp_ms =
            unix_timestamp_millis().max(i64_to_u64(max_timestamp, "message-append-max-timestamp")?);
        let seq = max_seq + 1;
        let message_id = MessageId::new_v7();

        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, seq, sender, text, image_url, reply_to, timestamp_ms, is_read) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(message_id.to_string())
        .bind(session_id.as_str())
        .bind(seq)
        .bind(input.sender.as_wire())
        .bind(input.text.as_deref())
        .bind(input.image_url.as_deref())
        .bind(input.reply_to.map(|id| id.to_string()))
        .bind(u64_to_i64(timestamp_ms, "message-append-timestamp")?)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-insert",
        })?;

        sqlx::query("UPDATE chat_sessions SET last_message_at = ? WHERE id = ?")
            .bind(u64_to_i64(timestamp_ms, "message-append-last-message-at")?)
            .bind(session_id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-last-message-at",
            })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-append-commit",
        })?;

        self.feed.publish(&session_id);

        Ok(MessageRecord {
            id: message_id,
            session_id,
            seq: i64_to_u64(seq, "message-append-seq")?,
            sender: input.sender,
            text: input.text,
            image_url: input.image_url,
            reply_to: input.reply_to,
            timestamp_ms,
            read: false,
        })
    }

    async fn mark_read_tx(&self, session_id: SessionId, reader: Sender) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "mark-read-begin",
        })?;

        let session_sql = match reader {
            Sender::Admin => "UPDATE chat_sessions SET unread_count = 0 WHERE id = ?",
            Sender::Visitor => "UPDATE chat_sessions SET unread_count = unread_count WHERE id = ?",
        };
        let touched = sqlx::query(session_sql)
            .bind(session_id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "mark-read-session",
            })?;
        ensure!(
            touched.rows_affected() == 1,
            NotFoundSnafu {
                stage: "mark-read-missing-session",
                entity: "session",
                id: session_id.to_string(),
            }
        );

        // A reader acknowledges what the other party wrote.
        let author = match reader {
            Sender::Admin => Sender::Visitor,
            Sender::Visitor => Sender::Admin,
        };
        let flipped = sqlx::query(
            "UPDATE chat_messages SET is_read = 1 WHERE session_id = ? AND sender = ? AND is_read = 0",
        )
        .bind(session_id.as_str())
        .bind(author.as_wire())
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "mark-read-messages",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "mark-read-commit",
        })?;

        tracing::debug!(
            session_id = %session_id,
            reader = reader.as_wire(),
            flipped = flipped.rows_affected(),
            "acknowledged chat messages"
        );
        self.feed.publish(&session_id);
        Ok(())
    }
}

impl ChatStore for SqliteChatStore {
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        Box::pin(self.create_session_tx(input))
    }

    fn get_session(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'_, StorageResult<Option<SessionRecord>>> {
        let session_id = session_id.clone();
        Box::pin(async move { load_session(&self.pool, &session_id).await })
    }

    fn append_message(
        &self,
        session_id: &SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(self.append_message_tx(session_id.clone(), input))
    }

    fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        let session_id = session_id.clone();
        Box::pin(async move { load_messages(&self.pool, &session_id).await })
    }

    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionSnapshot>>> {
        Box::pin(load_sessions(&self.pool))
    }

    fn mark_read(&self, session_id: &SessionId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.mark_read_tx(session_id.clone(), Sender::Admin))
    }

    fn mark_replies_read(&self, session_id: &SessionId) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.mark_read_tx(session_id.clone(), Sender::Visitor))
    }

    fn subscribe_messages(&self, session_id: &SessionId) -> SubscriptionHandle<Vec<MessageRecord>> {
        let pool = self.pool.clone();
        let scoped = session_id.clone();
        snapshot_subscription(
            "sqlite-messages",
            &self.feed,
            Some(session_id.clone()),
            move || {
                let pool = pool.clone();
                let scoped = scoped.clone();
                async move { load_messages(&pool, &scoped).await }
            },
        )
    }

    fn subscribe_all_sessions(&self) -> SubscriptionHandle<Vec<SessionSnapshot>> {
        let pool = self.pool.clone();
        snapshot_subscription("sqlite-sessions", &self.feed, None, move || {
            let pool = pool.clone();
            async move { load_sessions(&pool).await }
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    user_name: String,
    user_email: String,
    created_at: i64,
    last_message_at: Option<i64>,
    unread_count: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    seq: i64,
    sender: String,
    text: Option<String>,
    image_url: Option<String>,
    reply_to: Option<String>,
    timestamp_ms: i64,
    is_read: i64,
}

const SESSION_COLUMNS: &str =
    "SELECT id, user_name, user_email, created_at, last_message_at, unread_count FROM chat_sessions";

const MESSAGE_COLUMNS: &str =
    "SELECT id, session_id, seq, sender, text, image_url, reply_to, timestamp_ms, is_read FROM chat_messages";

fn session_row_to_record(row: SessionRow) -> StorageResult<SessionRecord> {
    Ok(SessionRecord {
        id: SessionId::parse(&row.id)?,
        user_name: row.user_name,
        user_email: row.user_email,
        created_at_ms: i64_to_u64(row.created_at, "session-row-created-at")?,
        last_message_at_ms: row
            .last_message_at
            .map(|value| i64_to_u64(value, "session-row-last-message-at"))
            .transpose()?,
        unread_count: i64_to_u32(row.unread_count, "session-row-unread-count")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        session_id: SessionId::parse(&row.session_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        sender: Sender::from_wire(&row.sender)?,
        text: row.text,
        image_url: row.image_url,
        reply_to: row
            .reply_to
            .as_deref()
            .map(MessageId::parse)
            .transpose()?,
        timestamp_ms: i64_to_u64(row.timestamp_ms, "message-row-timestamp")?,
        read: row.is_read != 0,
    })
}

async fn load_session(
    pool: &SqlitePool,
    session_id: &SessionId,
) -> StorageResult<Option<SessionRecord>> {
    let row = sqlx::query_as::<_, SessionRow>(&format!("{SESSION_COLUMNS} WHERE id = ?"))
        .bind(session_id.as_str())
        .fetch_optional(pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-get-query",
        })?;

    row.map(session_row_to_record).transpose()
}

async fn load_messages(
    pool: &SqlitePool,
    session_id: &SessionId,
) -> StorageResult<Vec<MessageRecord>> {
    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "{MESSAGE_COLUMNS} WHERE session_id = ? ORDER BY timestamp_ms ASC, seq ASC, id ASC"
    ))
    .bind(session_id.as_str())
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-list-query",
    })?;

    rows.into_iter().map(message_row_to_record).collect()
}

async fn load_sessions(pool: &SqlitePool) -> StorageResult<Vec<SessionSnapshot>> {
    // One read transaction so sessions and messages come from the same state.
    let mut tx = pool.begin().await.context(SqliteQuerySnafu {
        stage: "session-list-begin",
    })?;

    let session_rows = sqlx::query_as::<_, SessionRow>(SESSION_COLUMNS)
        .fetch_all(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-list-sessions",
        })?;
    let message_rows = sqlx::query_as::<_, MessageRow>(MESSAGE_COLUMNS)
        .fetch_all(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "session-list-messages",
        })?;

    tx.commit().await.context(SqliteQuerySnafu {
        stage: "session-list-commit",
    })?;

    let mut messages_by_session: HashMap<SessionId, Vec<MessageRecord>> = HashMap::new();
    for row in message_rows {
        let message = message_row_to_record(row)?;
        messages_by_session
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
    }

    let mut snapshots = session_rows
        .into_iter()
        .map(|row| {
            let session = session_row_to_record(row)?;
            let mut messages = messages_by_session.remove(&session.id).unwrap_or_default();
            messages.sort_by(message_order);
            Ok(SessionSnapshot { session, messages })
        })
        .collect::<StorageResult<Vec<_>>>()?;
    snapshots.sort_by(|left, right| session_order(&left.session, &right.session));

    Ok(snapshots)
}

async fn message_in_session(
    connection: &mut SqliteConnection,
    session_id: &SessionId,
    message_id: MessageId,
) -> StorageResult<bool> {
    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM chat_messages WHERE id = ? AND session_id = ? LIMIT 1",
    )
    .bind(message_id.to_string())
    .bind(session_id.as_str())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-in-session-query",
    })?;

    Ok(existing.is_some())
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to u32"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
