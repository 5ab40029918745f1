use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ensure};

use super::error::{
    InvalidMessageSnafu, InvariantViolationSnafu, NotFoundSnafu, StorageResult,
    StoreUnavailableSnafu,
};
use super::feed::{ChangeFeed, SubscriptionHandle, snapshot_subscription};
use super::ids::{MessageId, SessionId};
use super::types::{
    MessageRecord, NewMessage, NewSession, Sender, SessionRecord, SessionSnapshot, message_order,
    session_order,
};
use super::{BoxFuture, ChatStore};

/// Process-local chat store with the same semantics as the SQLite adapter.
///
/// Used as the fake store in tests: it counts append calls and can be switched
/// offline to simulate rejected writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryChatStore {
    state: Arc<Mutex<MemoryState>>,
    feed: ChangeFeed,
    append_calls: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: BTreeMap<SessionId, MemorySession>,
    /// Last timestamp handed out, so the store clock never runs backwards.
    clock_ms: u64,
}

#[derive(Debug)]
struct MemorySession {
    record: SessionRecord,
    messages: Vec<MessageRecord>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `append_message` calls that reached the store, accepted or not.
    pub fn append_call_count(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// While offline every write is rejected with `StoreUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    fn ensure_online(&self, stage: &'static str) -> StorageResult<()> {
        ensure!(!self.offline.load(Ordering::SeqCst), StoreUnavailableSnafu { stage });
        Ok(())
    }

    fn create_session_now(&self, input: NewSession) -> StorageResult<SessionRecord> {
        self.ensure_online("memory-session-create")?;

        let record = {
            let mut state = lock_state(&self.state, "memory-session-create-lock")?;
            let now = state.tick();
            let record = SessionRecord {
                id: input.id.clone(),
                user_name: input.user_name,
                user_email: input.user_email,
                created_at_ms: now,
                last_message_at_ms: None,
                unread_count: 0,
            };

            // Overwrites the document but keeps the message sub-collection.
            match state.sessions.get_mut(&input.id) {
                Some(existing) => existing.record = record.clone(),
                None => {
                    state.sessions.insert(
                        input.id.clone(),
                        MemorySession {
                            record: record.clone(),
                            messages: Vec::new(),
                        },
                    );
                }
            }

            record
        };

        self.feed.publish(&record.id);
        Ok(record)
    }

    fn append_message_now(
        &self,
        session_id: &SessionId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online("memory-message-append")?;
        let input = input.validated("memory-message-append-validate")?;

        let message = {
            let mut state = lock_state(&self.state, "memory-message-append-lock")?;
            let now = state.tick();
            let session = state
                .sessions
                .get_mut(session_id)
                .context(NotFoundSnafu {
                    stage: "memory-message-append-missing-session",
                    entity: "session",
                    id: session_id.to_string(),
                })?;

            if let Some(reply_to) = input.reply_to {
                ensure!(
                    session.messages.iter().any(|message| message.id == reply_to),
                    InvalidMessageSnafu {
                        stage: "memory-message-append-reply-target",
                        details: format!("reply target '{reply_to}' is not in this session"),
                    }
                );
            }

            let latest = session
                .messages
                .iter()
                .map(|message| message.timestamp_ms)
                .max()
                .unwrap_or(0);
            let timestamp_ms = now.max(latest);

            let message = MessageRecord {
                id: MessageId::new_v7(),
                session_id: session_id.clone(),
                seq: session.messages.len() as u64 + 1,
                sender: input.sender,
                text: input.text,
                image_url: input.image_url,
                reply_to: input.reply_to,
                timestamp_ms,
                read: false,
            };

            session.messages.push(message.clone());
            session.record.last_message_at_ms = Some(timestamp_ms);
            session.record.unread_count = match input.sender {
                Sender::Visitor => session.record.unread_count.saturating_add(1),
                Sender::Admin => 0,
            };

            message
        };

        self.feed.publish(session_id);
        Ok(message)
    }

    fn mark_read_now(&self, session_id: &SessionId, reader: Sender) -> StorageResult<()> {
        self.ensure_online("memory-mark-read")?;

        {
            let mut state = lock_state(&self.state, "memory-mark-read-lock")?;
            let session = state
                .sessions
                .get_mut(session_id)
                .context(NotFoundSnafu {
                    stage: "memory-mark-read-missing-session",
                    entity: "session",
                    id: session_id.to_string(),
                })?;

            // A reader acknowledges what the other party wrote.
            let author = match reader {
                Sender::Admin => {
                    session.record.unread_count = 0;
                    Sender::Visitor
                }
                Sender::Visitor => Sender::Admin,
            };
            for message in session
                .messages
                .iter_mut()
                .filter(|message| message.sender == author)
            {
                message.read = true;
            }
        }

        self.feed.publish(session_id);
        Ok(())
    }
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        self.clock_ms = self.clock_ms.max(unix_timestamp_millis());
        self.clock_ms
    }
}

impl ChatStore for MemoryChatStore {
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, StorageResult<SessionRecord>> {
        let result = self.create_session_now(input);
        Box::pin(async move { result })
    }

    fn get_session(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'_, StorageResult<Option<SessionRecord>>> {
        let result = load_session(&self.state, session_id);
        Box::pin(async move { result })
    }

    fn append_message(
        &self,
        session_id: &SessionId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        let result = self.append_message_now(session_id, input);
        Box::pin(async move { result })
    }

    fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        let result = load_messages(&self.state, session_id);
        Box::pin(async move { result })
    }

    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionSnapshot>>> {
        let result = load_sessions(&self.state);
        Box::pin(async move { result })
    }

    fn mark_read(&self, session_id: &SessionId) -> BoxFuture<'_, StorageResult<()>> {
        let result = self.mark_read_now(session_id, Sender::Admin);
        Box::pin(async move { result })
    }

    fn mark_replies_read(&self, session_id: &SessionId) -> BoxFuture<'_, StorageResult<()>> {
        let result = self.mark_read_now(session_id, Sender::Visitor);
        Box::pin(async move { result })
    }

    fn subscribe_messages(&self, session_id: &SessionId) -> SubscriptionHandle<Vec<MessageRecord>> {
        let state = self.state.clone();
        let scoped = session_id.clone();
        snapshot_subscription(
            "memory-messages",
            &self.feed,
            Some(session_id.clone()),
            move || {
                let result = load_messages(&state, &scoped);
                async move { result }
            },
        )
    }

    fn subscribe_all_sessions(&self) -> SubscriptionHandle<Vec<SessionSnapshot>> {
        let state = self.state.clone();
        snapshot_subscription("memory-sessions", &self.feed, None, move || {
            let result = load_sessions(&state);
            async move { result }
        })
    }
}

fn lock_state<'a>(
    state: &'a Mutex<MemoryState>,
    stage: &'static str,
) -> StorageResult<MutexGuard<'a, MemoryState>> {
    state.lock().map_err(|_| {
        InvariantViolationSnafu {
            stage,
            details: "memory chat store lock was poisoned".to_string(),
        }
        .build()
    })
}

fn load_session(
    state: &Mutex<MemoryState>,
    session_id: &SessionId,
) -> StorageResult<Option<SessionRecord>> {
    let state = lock_state(state, "memory-session-get-lock")?;
    Ok(state
        .sessions
        .get(session_id)
        .map(|session| session.record.clone()))
}

fn load_messages(
    state: &Mutex<MemoryState>,
    session_id: &SessionId,
) -> StorageResult<Vec<MessageRecord>> {
    let state = lock_state(state, "memory-message-list-lock")?;
    let mut messages = state
        .sessions
        .get(session_id)
        .map(|session| session.messages.clone())
        .unwrap_or_default();
    messages.sort_by(message_order);
    Ok(messages)
}

fn load_sessions(state: &Mutex<MemoryState>) -> StorageResult<Vec<SessionSnapshot>> {
    let state = lock_state(state, "memory-session-list-lock")?;
    let mut snapshots = state
        .sessions
        .values()
        .map(|session| {
            let mut messages = session.messages.clone();
            messages.sort_by(message_order);
            SessionSnapshot {
                session: session.record.clone(),
                messages,
            }
        })
        .collect::<Vec<_>>();
    snapshots.sort_by(|left, right| session_order(&left.session, &right.session));
    Ok(snapshots)
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn session_id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    async fn registered(store: &MemoryChatStore, raw: &str) -> SessionId {
        let id = session_id(raw);
        store
            .create_session(NewSession {
                id: id.clone(),
                user_name: "Asha".to_string(),
                user_email: "asha@example.com".to_string(),
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn append_keeps_last_message_at_equal_to_newest_timestamp() {
        let store = MemoryChatStore::new();
        let id = registered(&store, "session_clock").await;

        let mut previous = 0;
        for index in 0..5 {
            let message = store
                .append_message(&id, NewMessage::text(Sender::Visitor, format!("m{index}")))
                .await
                .unwrap();
            assert!(message.timestamp_ms >= previous);
            assert_eq!(message.seq, index + 1);
            previous = message.timestamp_ms;
        }

        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.last_message_at_ms, Some(previous));
        assert_eq!(session.unread_count, 5);
    }

    #[tokio::test]
    async fn append_to_unknown_session_is_not_found() {
        let store = MemoryChatStore::new();
        let error = store
            .append_message(&session_id("session_ghost"), NewMessage::text(Sender::Visitor, "hi"))
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn reply_target_must_exist_in_the_same_session() {
        let store = MemoryChatStore::new();
        let first = registered(&store, "session_one").await;
        let second = registered(&store, "session_two").await;
        let original = store
            .append_message(&first, NewMessage::text(Sender::Visitor, "question"))
            .await
            .unwrap();

        let reply = store
            .append_message(
                &first,
                NewMessage::text(Sender::Admin, "answer").with_reply_to(original.id),
            )
            .await
            .unwrap();
        assert_eq!(reply.reply_to, Some(original.id));

        let cross_session = store
            .append_message(
                &second,
                NewMessage::text(Sender::Admin, "wrong thread").with_reply_to(original.id),
            )
            .await;
        assert!(cross_session.is_err());
    }

    #[tokio::test]
    async fn read_acknowledgments_flip_the_other_partys_messages() {
        let store = MemoryChatStore::new();
        let id = registered(&store, "session_ticks").await;
        store
            .append_message(&id, NewMessage::text(Sender::Visitor, "hello"))
            .await
            .unwrap();
        store
            .append_message(&id, NewMessage::text(Sender::Admin, "hi"))
            .await
            .unwrap();
        store
            .append_message(&id, NewMessage::text(Sender::Visitor, "question"))
            .await
            .unwrap();

        store.mark_replies_read(&id).await.unwrap();
        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.unread_count, 1);
        let messages = store.list_messages(&id).await.unwrap();
        assert!(messages.iter().filter(|m| m.sender == Sender::Admin).all(|m| m.read));
        assert!(messages.iter().filter(|m| m.sender == Sender::Visitor).all(|m| !m.read));

        store.mark_read(&id).await.unwrap();
        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.unread_count, 0);
        let messages = store.list_messages(&id).await.unwrap();
        assert!(messages.iter().all(|m| m.read));
    }

    #[tokio::test]
    async fn offline_store_rejects_writes_but_counts_appends() {
        let store = MemoryChatStore::new();
        let id = registered(&store, "session_offline").await;
        store.set_offline(true);

        let error = store
            .create_session(NewSession {
                id: id.clone(),
                user_name: "Asha".to_string(),
                user_email: "asha@example.com".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(error, crate::StorageError::StoreUnavailable { .. }));

        assert!(
            store
                .append_message(&id, NewMessage::text(Sender::Visitor, "lost"))
                .await
                .is_err()
        );
        assert_eq!(store.append_call_count(), 1);
    }

    #[tokio::test]
    async fn session_subscription_sees_every_session_change() {
        let store = MemoryChatStore::new();
        let handle = store.subscribe_all_sessions();
        let mut sessions = handle.subscription;
        tokio::spawn(handle.worker);

        assert_eq!(sessions.recv().await, Some(Vec::new()));

        let id = registered(&store, "session_live").await;
        let after_register = timeout(Duration::from_secs(1), sessions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_register.len(), 1);
        assert_eq!(after_register[0].id(), &id);
    }

    #[tokio::test]
    async fn session_list_does_not_pile_up_behind_an_idle_subscriber() {
        let store = MemoryChatStore::new();
        let id = registered(&store, "session_chatty").await;
        let handle = store.subscribe_all_sessions();
        let mut sessions = handle.subscription;
        tokio::spawn(handle.worker);

        for index in 0..200 {
            store
                .append_message(&id, NewMessage::text(Sender::Visitor, format!("m{index}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let latest = sessions.try_latest().unwrap();
        assert_eq!(latest[0].messages.len(), 200);
        assert_eq!(sessions.try_latest(), None);
    }
}
