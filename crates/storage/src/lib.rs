use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod feed;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use feed::{ChangeFeed, Subscription, SubscriptionHandle, SubscriptionWorker};
pub use ids::{MessageId, SESSION_ID_PREFIX, SessionId};
pub use memory::MemoryChatStore;
pub use sqlite::SqliteChatStore;
pub use types::{
    ANONYMOUS_USER_NAME, MessageRecord, NewMessage, NewSession, Sender, SessionRecord,
    SessionSnapshot, message_order, session_order,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type MessagesSubscription = Subscription<Vec<MessageRecord>>;
pub type SessionsSubscription = Subscription<Vec<SessionSnapshot>>;

/// Shared document store holding every chat session and its messages.
///
/// Every write publishes a change notification; subscriptions re-read the affected
/// state and push a full snapshot. Timestamps are taken from the store clock.
pub trait ChatStore: Send + Sync {
    /// Writes the session document with `unread_count = 0`, replacing any previous
    /// document under the same id. Existing messages are kept.
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>>;

    fn get_session(&self, session_id: &SessionId)
    -> BoxFuture<'_, StorageResult<Option<SessionRecord>>>;

    /// Inserts under a store-generated, order-preserving key. The same transaction
    /// advances `last_message_at` and bumps (visitor) or clears (admin) `unread_count`.
    fn append_message(
        &self,
        session_id: &SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;

    fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;

    /// All sessions with their messages, most recently active first.
    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionSnapshot>>>;

    /// Clears `unread_count` and marks visitor-authored messages as read. Idempotent.
    fn mark_read(&self, session_id: &SessionId) -> BoxFuture<'_, StorageResult<()>>;

    /// Marks admin-authored messages as read. Leaves `unread_count` untouched.
    fn mark_replies_read(&self, session_id: &SessionId) -> BoxFuture<'_, StorageResult<()>>;

    fn subscribe_messages(&self, session_id: &SessionId) -> SubscriptionHandle<Vec<MessageRecord>>;

    fn subscribe_all_sessions(&self) -> SubscriptionHandle<Vec<SessionSnapshot>>;
}

impl<T> ChatStore for std::sync::Arc<T>
where
    T: ChatStore + ?Sized,
{
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        (**self).create_session(input)
    }

    fn get_session(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'_, StorageResult<Option<SessionRecord>>> {
        (**self).get_session(session_id)
    }

    fn append_message(
        &self,
        session_id: &SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        (**self).append_message(session_id, input)
    }

    fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        (**self).list_messages(session_id)
    }

    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionSnapshot>>> {
        (**self).list_sessions()
    }

    fn mark_read(&self, session_id: &SessionId) -> BoxFuture<'_, StorageResult<()>> {
        (**self).mark_read(session_id)
    }

    fn mark_replies_read(&self, session_id: &SessionId) -> BoxFuture<'_, StorageResult<()>> {
        (**self).mark_replies_read(session_id)
    }

    fn subscribe_messages(&self, session_id: &SessionId) -> SubscriptionHandle<Vec<MessageRecord>> {
        (**self).subscribe_messages(session_id)
    }

    fn subscribe_all_sessions(&self) -> SubscriptionHandle<Vec<SessionSnapshot>> {
        (**self).subscribe_all_sessions()
    }
}
