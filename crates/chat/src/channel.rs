use std::sync::Arc;

use sahr_storage::{
    ChatStore, MessageRecord, MessagesSubscription, NewMessage, NewSession, SessionId,
    SessionRecord, SessionsSubscription, SubscriptionHandle,
};
use snafu::{ResultExt, ensure};

use crate::error::{ChatResult, InvalidRegistrationSnafu, StoreSnafu};

/// Chat domain operations over an injected store client.
#[derive(Clone)]
pub struct MessageChannel {
    store: Arc<dyn ChatStore>,
}

impl MessageChannel {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Writes the session document for `session_id`.
    ///
    /// Calling this again for the same id overwrites name, email, unread count and
    /// last activity. Earlier messages stay in place.
    pub async fn register(
        &self,
        session_id: &SessionId,
        user_name: &str,
        user_email: &str,
    ) -> ChatResult<SessionRecord> {
        let user_name = user_name.trim();
        let user_email = user_email.trim();
        ensure!(
            !user_name.is_empty(),
            InvalidRegistrationSnafu {
                stage: "channel-register-validate",
                field: "name",
            }
        );
        ensure!(
            !user_email.is_empty(),
            InvalidRegistrationSnafu {
                stage: "channel-register-validate",
                field: "email",
            }
        );

        let session = self
            .store
            .create_session(NewSession {
                id: session_id.clone(),
                user_name: user_name.to_string(),
                user_email: user_email.to_string(),
            })
            .await
            .context(StoreSnafu {
                stage: "channel-register-create-session",
            })?;

        tracing::info!(session_id = %session_id, "registered chat session");
        Ok(session)
    }

    /// Appends a message. Returns `Ok(None)` without touching the store when both
    /// bodies are blank.
    pub async fn send(
        &self,
        session_id: &SessionId,
        message: NewMessage,
    ) -> ChatResult<Option<MessageRecord>> {
        let Some(message) = message.normalized() else {
            tracing::debug!(session_id = %session_id, "ignored empty chat message");
            return Ok(None);
        };

        let sender = message.sender;
        let record = self
            .store
            .append_message(session_id, message)
            .await
            .context(StoreSnafu {
                stage: "channel-send-append",
            })?;

        tracing::debug!(
            session_id = %session_id,
            sender = sender.as_wire(),
            seq = record.seq,
            "sent chat message"
        );
        Ok(Some(record))
    }

    /// Full ordered message list for one session, re-delivered after every change.
    ///
    /// Must be called inside a tokio runtime.
    pub fn watch(&self, session_id: &SessionId) -> MessagesSubscription {
        spawn_subscription(self.store.subscribe_messages(session_id))
    }

    /// Every session with its messages, most recently active first.
    ///
    /// Must be called inside a tokio runtime.
    pub fn watch_all(&self) -> SessionsSubscription {
        spawn_subscription(self.store.subscribe_all_sessions())
    }

    /// Admin opened the conversation: zeroes the unread count.
    pub async fn acknowledge_read(&self, session_id: &SessionId) -> ChatResult<()> {
        self.store
            .mark_read(session_id)
            .await
            .context(StoreSnafu {
                stage: "channel-acknowledge-read",
            })
    }

    /// Visitor saw the admin's replies.
    pub async fn acknowledge_replies(&self, session_id: &SessionId) -> ChatResult<()> {
        self.store
            .mark_replies_read(session_id)
            .await
            .context(StoreSnafu {
                stage: "channel-acknowledge-replies",
            })
    }
}

fn spawn_subscription<T>(handle: SubscriptionHandle<T>) -> sahr_storage::Subscription<T> {
    let SubscriptionHandle {
        subscription,
        worker,
    } = handle;
    tokio::spawn(worker);
    subscription
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sahr_storage::{MemoryChatStore, Sender};
    use tokio::time::timeout;

    use super::*;
    use crate::error::ChatError;

    fn channel() -> (MessageChannel, Arc<MemoryChatStore>) {
        let store = Arc::new(MemoryChatStore::new());
        (MessageChannel::new(store.clone()), store)
    }

    fn session(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    async fn unread(store: &MemoryChatStore, id: &SessionId) -> u32 {
        store.get_session(id).await.unwrap().unwrap().unread_count
    }

    #[tokio::test]
    async fn register_rejects_blank_fields() {
        let (channel, store) = channel();
        let id = session("session_blank");

        let error = channel.register(&id, "   ", "a@b.c").await.unwrap_err();
        assert!(matches!(error, ChatError::InvalidRegistration { field: "name", .. }));
        let error = channel.register(&id, "Asha", "").await.unwrap_err();
        assert!(matches!(error, ChatError::InvalidRegistration { field: "email", .. }));
        assert!(store.get_session(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn register_trims_the_submitted_fields() {
        let (channel, _) = channel();
        let session = channel
            .register(&session("session_trim"), "  Asha ", " asha@example.com ")
            .await
            .unwrap();
        assert_eq!(session.user_name, "Asha");
        assert_eq!(session.user_email, "asha@example.com");
        assert_eq!(session.unread_count, 0);
    }

    #[tokio::test]
    async fn empty_send_never_reaches_the_store() {
        let (channel, store) = channel();
        let id = session("session_empty");
        channel.register(&id, "Asha", "asha@example.com").await.unwrap();

        let sent = channel
            .send(
                &id,
                NewMessage {
                    sender: Sender::Visitor,
                    text: Some("  ".to_string()),
                    image_url: None,
                    reply_to: None,
                },
            )
            .await
            .unwrap();

        assert!(sent.is_none());
        assert_eq!(store.append_call_count(), 0);
    }

    #[tokio::test]
    async fn unread_accounting_follows_the_last_sender() {
        let (channel, store) = channel();
        let id = session("session_unread");
        channel.register(&id, "Asha", "asha@example.com").await.unwrap();

        for text in ["one", "two", "three"] {
            channel
                .send(&id, NewMessage::text(Sender::Visitor, text))
                .await
                .unwrap();
        }
        assert_eq!(unread(&store, &id).await, 3);

        channel
            .send(&id, NewMessage::text(Sender::Admin, "hello"))
            .await
            .unwrap();
        assert_eq!(unread(&store, &id).await, 0);

        channel
            .send(&id, NewMessage::text(Sender::Visitor, "four"))
            .await
            .unwrap();
        channel.acknowledge_read(&id).await.unwrap();
        channel.acknowledge_read(&id).await.unwrap();
        assert_eq!(unread(&store, &id).await, 0);
    }

    #[tokio::test]
    async fn re_registration_overwrites_identity_but_keeps_messages() {
        let (channel, store) = channel();
        let id = session("session_twice");
        channel.register(&id, "Asha", "asha@example.com").await.unwrap();
        channel
            .send(&id, NewMessage::text(Sender::Visitor, "first"))
            .await
            .unwrap();

        channel.register(&id, "Ravi", "ravi@example.com").await.unwrap();

        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.user_name, "Ravi");
        assert_eq!(session.user_email, "ravi@example.com");
        assert_eq!(store.list_messages(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watch_delivers_messages_in_send_order() {
        let (channel, _) = channel();
        let id = session("session_order");
        channel.register(&id, "Asha", "asha@example.com").await.unwrap();
        let mut watch = channel.watch(&id);
        assert_eq!(watch.recv().await, Some(Vec::new()));

        for text in ["A", "B", "C"] {
            channel
                .send(&id, NewMessage::text(Sender::Visitor, text))
                .await
                .unwrap();
        }

        let mut latest = Vec::new();
        while latest.len() < 3 {
            latest = timeout(Duration::from_secs(1), watch.recv())
                .await
                .unwrap()
                .unwrap();
        }
        let texts = latest
            .iter()
            .filter_map(|message| message.text.as_deref())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn store_failures_are_retryable() {
        let (channel, store) = channel();
        store.set_offline(true);

        let error = channel
            .register(&session("session_down"), "Asha", "asha@example.com")
            .await
            .unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(error.stage(), "channel-register-create-session");
    }
}
