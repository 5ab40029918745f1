use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sahr_storage::{MessageId, MessageRecord, MessagesSubscription, NewMessage, Sender, SessionId};
use snafu::ensure;

use crate::channel::MessageChannel;
use crate::contact::{ContactInbox, ContactMessage, NewContactMessage};
use crate::error::{
    AlreadyRegisteredSnafu, ChatError, ChatResult, InvalidRegistrationSnafu, NotRegisteredSnafu,
};
use crate::identity::{LocalStorage, SessionIdentity};
use crate::settings::{DEFAULT_TYPING_INDICATOR_MS, TransportMode};

/// Where visitor messages go.
#[derive(Clone)]
pub enum VisitorTransport {
    /// Live conversation through the shared chat store.
    Realtime(MessageChannel),
    /// Fire-and-forget contact form kept in local storage.
    ContactForm(ContactInbox),
}

impl VisitorTransport {
    pub fn for_mode(
        mode: TransportMode,
        channel: MessageChannel,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        match mode {
            TransportMode::Realtime => Self::Realtime(channel),
            TransportMode::ContactForm => Self::ContactForm(ContactInbox::new(storage)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetPhase {
    Unregistered,
    Registering,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PanelState {
    pub open: bool,
    pub minimized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComposeDraft {
    pub text: String,
    pub image_url: String,
    pub reply_to: Option<MessageId>,
}

impl ComposeDraft {
    fn to_message(&self) -> Option<NewMessage> {
        NewMessage {
            sender: Sender::Visitor,
            text: Some(self.text.clone()),
            image_url: Some(self.image_url.clone()),
            reply_to: self.reply_to,
        }
        .normalized()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub user_name: String,
    pub user_email: String,
}

/// A send that was cleared from the compose box but never reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSend {
    pub message: NewMessage,
    pub stage: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing to send. The draft is left untouched.
    Ignored,
    Sent(MessageRecord),
    Submitted(ContactMessage),
    /// Recorded in [`VisitorWidget::failed_sends`].
    Failed,
}

/// Visitor-side chat client bound to exactly one session.
pub struct VisitorWidget {
    transport: VisitorTransport,
    identity: SessionIdentity,
    phase: WidgetPhase,
    panel: PanelState,
    draft: ComposeDraft,
    registration: Option<Registration>,
    messages: Vec<MessageRecord>,
    subscription: Option<MessagesSubscription>,
    failed_sends: Vec<FailedSend>,
    last_error: Option<String>,
    typing_window_ms: u64,
}

impl VisitorWidget {
    pub fn new(transport: VisitorTransport, identity: SessionIdentity) -> Self {
        Self {
            transport,
            identity,
            phase: WidgetPhase::Unregistered,
            panel: PanelState::default(),
            draft: ComposeDraft::default(),
            registration: None,
            messages: Vec::new(),
            subscription: None,
            failed_sends: Vec::new(),
            last_error: None,
            typing_window_ms: DEFAULT_TYPING_INDICATOR_MS,
        }
    }

    pub fn with_typing_window_ms(mut self, typing_window_ms: u64) -> Self {
        self.typing_window_ms = typing_window_ms;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.identity.id
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn phase(&self) -> WidgetPhase {
        self.phase
    }

    pub fn is_registered(&self) -> bool {
        self.phase == WidgetPhase::Registered
    }

    pub fn panel(&self) -> PanelState {
        self.panel
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn draft(&self) -> &ComposeDraft {
        &self.draft
    }

    pub fn draft_mut(&mut self) -> &mut ComposeDraft {
        &mut self.draft
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn failed_sends(&self) -> &[FailedSend] {
        &self.failed_sends
    }

    pub fn clear_failed_sends(&mut self) {
        self.failed_sends.clear();
    }

    /// Last registration failure, shown next to the form until the next attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Submits the name/email form.
    ///
    /// On failure the widget returns to `Unregistered` and keeps its session id, so
    /// the visitor can retry.
    pub async fn register(&mut self, user_name: &str, user_email: &str) -> ChatResult<()> {
        ensure!(
            self.phase == WidgetPhase::Unregistered,
            AlreadyRegisteredSnafu {
                stage: "widget-register-phase",
                session_id: self.identity.id.to_string(),
            }
        );

        self.phase = WidgetPhase::Registering;
        self.last_error = None;

        let result = match &self.transport {
            VisitorTransport::Realtime(channel) => channel
                .register(&self.identity.id, user_name, user_email)
                .await
                .map(|session| Registration {
                    user_name: session.user_name,
                    user_email: session.user_email,
                }),
            VisitorTransport::ContactForm(_) => local_registration(user_name, user_email),
        };

        match result {
            Ok(registration) => {
                if let VisitorTransport::Realtime(channel) = &self.transport {
                    self.subscription = Some(channel.watch(&self.identity.id));
                }
                self.registration = Some(registration);
                self.phase = WidgetPhase::Registered;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %self.identity.id,
                    stage = error.stage(),
                    "chat registration failed: {error}"
                );
                self.last_error = Some(error.to_string());
                self.phase = WidgetPhase::Unregistered;
                Err(error)
            }
        }
    }

    /// Sends the current draft.
    ///
    /// The compose box is cleared as soon as the send is issued. A store failure is
    /// logged and recorded as a failed send instead of being returned.
    pub async fn send(&mut self) -> ChatResult<SendOutcome> {
        ensure!(
            self.is_registered(),
            NotRegisteredSnafu {
                stage: "widget-send-phase",
            }
        );

        let Some(message) = self.draft.to_message() else {
            return Ok(SendOutcome::Ignored);
        };
        self.draft = ComposeDraft::default();

        match &self.transport {
            VisitorTransport::Realtime(channel) => {
                match channel.send(&self.identity.id, message.clone()).await {
                    Ok(Some(record)) => Ok(SendOutcome::Sent(record)),
                    Ok(None) => Ok(SendOutcome::Ignored),
                    Err(error) => {
                        self.record_failed_send(message, &error);
                        Ok(SendOutcome::Failed)
                    }
                }
            }
            VisitorTransport::ContactForm(inbox) => {
                let Some(registration) = self.registration.as_ref() else {
                    return NotRegisteredSnafu {
                        stage: "widget-send-contact-registration",
                    }
                    .fail();
                };
                let submitted = inbox.add_message(NewContactMessage {
                    name: registration.user_name.clone(),
                    email: registration.user_email.clone(),
                    message: message.text.clone().unwrap_or_default(),
                    image_url: message.image_url.clone(),
                });
                match submitted {
                    Ok(contact) => Ok(SendOutcome::Submitted(contact)),
                    Err(error) => {
                        self.record_failed_send(message, &error);
                        Ok(SendOutcome::Failed)
                    }
                }
            }
        }
    }

    pub async fn open(&mut self) {
        self.panel.open = true;
        self.panel.minimized = false;
        if self.is_registered() {
            self.acknowledge_replies().await;
        }
    }

    pub fn close(&mut self) {
        self.panel.open = false;
    }

    pub async fn toggle_open(&mut self) {
        if self.panel.open {
            self.close();
        } else {
            self.open().await;
        }
    }

    pub fn set_minimized(&mut self, minimized: bool) {
        self.panel.minimized = minimized;
    }

    /// Applies the newest queued snapshot, if any. Returns true when the list changed.
    pub async fn sync(&mut self) -> bool {
        let latest = self
            .subscription
            .as_mut()
            .and_then(|subscription| subscription.try_latest());
        match latest {
            Some(messages) => self.apply_snapshot(messages).await,
            None => false,
        }
    }

    /// Waits for the next snapshot. Returns false when the widget has no live watch.
    pub async fn next_update(&mut self) -> bool {
        let Some(subscription) = self.subscription.as_mut() else {
            return false;
        };
        match subscription.recv().await {
            Some(messages) => {
                self.apply_snapshot(messages).await;
                true
            }
            None => false,
        }
    }

    /// Admin messages the visitor has not seen yet.
    pub fn admin_reply_badge(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.sender == Sender::Admin && !message.read)
            .count()
    }

    /// True within the typing window after the visitor's own latest message.
    pub fn typing_indicator_active(&self, now_ms: u64) -> bool {
        self.messages.last().is_some_and(|message| {
            message.sender == Sender::Visitor
                && now_ms < message.timestamp_ms.saturating_add(self.typing_window_ms)
        })
    }

    pub fn typing_indicator_active_now(&self) -> bool {
        self.typing_indicator_active(unix_timestamp_millis())
    }

    async fn apply_snapshot(&mut self, messages: Vec<MessageRecord>) -> bool {
        let changed = self.messages != messages;
        self.messages = messages;

        if self.panel.open && self.admin_reply_badge() > 0 {
            self.acknowledge_replies().await;
        }

        changed
    }

    async fn acknowledge_replies(&self) {
        let VisitorTransport::Realtime(channel) = &self.transport else {
            return;
        };
        if let Err(error) = channel.acknowledge_replies(&self.identity.id).await {
            tracing::warn!(
                session_id = %self.identity.id,
                stage = error.stage(),
                "failed to acknowledge admin replies: {error}"
            );
        }
    }

    fn record_failed_send(&mut self, message: NewMessage, error: &ChatError) {
        tracing::warn!(
            session_id = %self.identity.id,
            stage = error.stage(),
            "chat message was not delivered: {error}"
        );
        self.failed_sends.push(FailedSend {
            message,
            stage: error.stage(),
            reason: error.to_string(),
        });
    }
}

fn local_registration(user_name: &str, user_email: &str) -> ChatResult<Registration> {
    let user_name = user_name.trim();
    let user_email = user_email.trim();
    ensure!(
        !user_name.is_empty(),
        InvalidRegistrationSnafu {
            stage: "widget-register-local-validate",
            field: "name",
        }
    );
    ensure!(
        !user_email.is_empty(),
        InvalidRegistrationSnafu {
            stage: "widget-register-local-validate",
            field: "email",
        }
    );

    Ok(Registration {
        user_name: user_name.to_string(),
        user_email: user_email.to_string(),
    })
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sahr_storage::{ChatStore, MemoryChatStore};
    use tokio::time::timeout;

    use super::*;
    use crate::identity::MemoryLocalStorage;

    fn identity(raw: &str) -> SessionIdentity {
        SessionIdentity {
            id: SessionId::parse(raw).unwrap(),
            persisted: true,
        }
    }

    fn realtime_widget(raw: &str) -> (VisitorWidget, Arc<MemoryChatStore>, MessageChannel) {
        let store = Arc::new(MemoryChatStore::new());
        let channel = MessageChannel::new(store.clone());
        let widget = VisitorWidget::new(VisitorTransport::Realtime(channel.clone()), identity(raw));
        (widget, store, channel)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn wait_for_messages(widget: &mut VisitorWidget, count: usize) {
        while widget.messages().len() < count {
            let updated = timeout(Duration::from_secs(1), widget.next_update())
                .await
                .unwrap();
            assert!(updated);
        }
    }

    #[tokio::test]
    async fn failed_registration_returns_to_unregistered_and_can_retry() {
        let (mut widget, store, _) = realtime_widget("session_retry");
        store.set_offline(true);

        let error = widget.register("Asha", "asha@example.com").await.unwrap_err();
        assert!(error.is_retryable());
        assert_eq!(widget.phase(), WidgetPhase::Unregistered);
        assert!(widget.last_error().is_some());

        store.set_offline(false);
        widget.register("Asha", "asha@example.com").await.unwrap();
        assert_eq!(widget.phase(), WidgetPhase::Registered);
        assert_eq!(widget.session_id().as_str(), "session_retry");
        assert!(widget.last_error().is_none());
    }

    #[tokio::test]
    async fn registered_widget_refuses_a_second_registration() {
        let (mut widget, store, _) = realtime_widget("session_once");
        widget.register("Asha", "asha@example.com").await.unwrap();
        widget.draft_mut().text.push_str("keep my thread");
        widget.send().await.unwrap();

        let error = widget.register("Ravi", "ravi@example.com").await.unwrap_err();
        assert!(matches!(error, ChatError::AlreadyRegistered { .. }));
        let session = store.get_session(widget.session_id()).await.unwrap().unwrap();
        assert_eq!(session.user_name, "Asha");
        assert_eq!(session.unread_count, 1);
    }

    #[tokio::test]
    async fn sending_requires_registration() {
        let (mut widget, store, _) = realtime_widget("session_early");
        widget.draft_mut().text = "hello?".to_string();

        let error = widget.send().await.unwrap_err();
        assert!(matches!(error, ChatError::NotRegistered { .. }));
        assert_eq!(store.append_call_count(), 0);
    }

    #[tokio::test]
    async fn empty_draft_is_ignored_without_a_store_call() {
        let (mut widget, store, _) = realtime_widget("session_quiet");
        widget.register("Asha", "asha@example.com").await.unwrap();
        widget.draft_mut().text = "   ".to_string();

        assert_eq!(widget.send().await.unwrap(), SendOutcome::Ignored);
        assert_eq!(store.append_call_count(), 0);
    }

    #[tokio::test]
    async fn compose_clears_even_when_the_store_rejects_the_send() {
        let (mut widget, store, _) = realtime_widget("session_flaky");
        widget.register("Asha", "asha@example.com").await.unwrap();
        store.set_offline(true);

        widget.draft_mut().text = "will this arrive?".to_string();
        widget.draft_mut().image_url = "https://cdn/dune.jpg".to_string();
        assert_eq!(widget.send().await.unwrap(), SendOutcome::Failed);

        assert_eq!(widget.draft(), &ComposeDraft::default());
        assert_eq!(widget.failed_sends().len(), 1);
        assert_eq!(
            widget.failed_sends()[0].message.text.as_deref(),
            Some("will this arrive?")
        );
        assert_eq!(store.append_call_count(), 1);
    }

    #[tokio::test]
    async fn opening_the_panel_clears_the_reply_badge() {
        let (mut widget, _, channel) = realtime_widget("session_badge");
        widget.register("Asha", "asha@example.com").await.unwrap();
        let id = widget.session_id().clone();

        channel
            .send(&id, NewMessage::text(Sender::Admin, "welcome"))
            .await
            .unwrap();
        wait_for_messages(&mut widget, 1).await;
        assert_eq!(widget.admin_reply_badge(), 1);

        widget.open().await;
        while widget.admin_reply_badge() > 0 {
            timeout(Duration::from_secs(1), widget.next_update())
                .await
                .unwrap();
        }
        assert!(widget.panel().open);
    }

    #[tokio::test]
    async fn sync_applies_the_newest_thread_and_acknowledges_while_open() {
        let (mut widget, store, channel) = realtime_widget("session_frame");
        widget.register("Asha", "asha@example.com").await.unwrap();
        widget.open().await;
        settle().await;
        widget.sync().await;

        let id = widget.session_id().clone();
        for text in ["one", "two", "three"] {
            channel
                .send(&id, NewMessage::text(Sender::Admin, text))
                .await
                .unwrap();
        }
        settle().await;

        assert!(widget.sync().await);
        assert_eq!(widget.messages().len(), 3);
        let stored = store.list_messages(&id).await.unwrap();
        assert!(stored.iter().all(|message| message.read));

        settle().await;
        assert!(widget.sync().await);
        assert_eq!(widget.admin_reply_badge(), 0);
        assert!(!widget.sync().await);
    }

    #[tokio::test]
    async fn typing_indicator_follows_the_visitors_last_message() {
        let (mut widget, _, channel) = realtime_widget("session_typing");
        widget.register("Asha", "asha@example.com").await.unwrap();
        widget.draft_mut().text = "anyone there?".to_string();
        let SendOutcome::Sent(sent) = widget.send().await.unwrap() else {
            panic!("expected the message to be stored");
        };
        wait_for_messages(&mut widget, 1).await;

        assert!(widget.typing_indicator_active(sent.timestamp_ms + 2_999));
        assert!(!widget.typing_indicator_active(sent.timestamp_ms + 3_000));

        channel
            .send(widget.session_id(), NewMessage::text(Sender::Admin, "yes"))
            .await
            .unwrap();
        wait_for_messages(&mut widget, 2).await;
        assert!(!widget.typing_indicator_active(sent.timestamp_ms));
    }

    #[tokio::test]
    async fn contact_form_mode_writes_to_local_storage() {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
        let channel = MessageChannel::new(Arc::new(MemoryChatStore::new()));
        let transport =
            VisitorTransport::for_mode(TransportMode::ContactForm, channel, storage.clone());
        let inbox = ContactInbox::new(storage);
        let mut widget = VisitorWidget::new(transport, identity("session_contact"));

        assert!(widget.register(" ", "asha@example.com").await.is_err());
        widget.register("Asha", "asha@example.com").await.unwrap();
        widget.draft_mut().text = "Do you sell prints?".to_string();

        let SendOutcome::Submitted(contact) = widget.send().await.unwrap() else {
            panic!("expected a contact submission");
        };
        assert_eq!(contact.name, "Asha");
        assert_eq!(inbox.unread_count().unwrap(), 1);
        assert!(!widget.next_update().await);
    }
}
