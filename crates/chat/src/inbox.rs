use sahr_storage::{
    ANONYMOUS_USER_NAME, MessageId, MessageRecord, NewMessage, Sender, SessionId, SessionRecord,
    SessionSnapshot, SessionsSubscription, session_order,
};
use snafu::{OptionExt, ensure};

use crate::channel::MessageChannel;
use crate::error::{AdminAccessDeniedSnafu, ChatResult, NoSessionSelectedSnafu};

const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

/// Answers whether the current user may open the admin inbox.
pub trait AdminGate: Send + Sync {
    fn is_admin(&self) -> bool;
}

impl<F> AdminGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_admin(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InboxSelection {
    #[default]
    NoSessionSelected,
    SessionSelected(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAgeGroup {
    Today,
    Yesterday,
    Older,
}

impl SessionAgeGroup {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::Yesterday => "Yesterday",
            Self::Older => "Older",
        }
    }
}

/// Admin-side client over every chat session.
///
/// The session list comes from a single `watch_all` subscription that lives as
/// long as the inbox. The selected conversation is read from that same payload.
pub struct AdminInbox {
    channel: MessageChannel,
    subscription: SessionsSubscription,
    sessions: Vec<SessionSnapshot>,
    selection: InboxSelection,
    search_query: String,
    anonymous_name: String,
}

impl AdminInbox {
    /// Opens the inbox and starts its session list subscription.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime. The subscription worker is spawned onto the
    /// current one.
    pub fn mount(channel: MessageChannel, gate: &dyn AdminGate) -> ChatResult<Self> {
        ensure!(
            gate.is_admin(),
            AdminAccessDeniedSnafu {
                stage: "inbox-mount-gate",
            }
        );

        let subscription = channel.watch_all();
        tracing::info!("mounted admin chat inbox");

        Ok(Self {
            channel,
            subscription,
            sessions: Vec::new(),
            selection: InboxSelection::NoSessionSelected,
            search_query: String::new(),
            anonymous_name: ANONYMOUS_USER_NAME.to_string(),
        })
    }

    pub fn with_anonymous_name(mut self, anonymous_name: impl Into<String>) -> Self {
        self.anonymous_name = anonymous_name.into();
        self
    }

    /// Name shown in the session list; blank names fall back to the anonymous label.
    pub fn display_name<'a>(&'a self, session: &'a SessionRecord) -> &'a str {
        session.display_name_or(&self.anonymous_name)
    }

    pub fn sessions(&self) -> &[SessionSnapshot] {
        &self.sessions
    }

    pub fn selection(&self) -> &InboxSelection {
        &self.selection
    }

    pub fn selected_session_id(&self) -> Option<&SessionId> {
        match &self.selection {
            InboxSelection::SessionSelected(session_id) => Some(session_id),
            InboxSelection::NoSessionSelected => None,
        }
    }

    pub fn selected_session(&self) -> Option<&SessionSnapshot> {
        let selected = self.selected_session_id()?;
        self.sessions.iter().find(|snapshot| snapshot.id() == selected)
    }

    pub fn selected_messages(&self) -> &[MessageRecord] {
        self.selected_session()
            .map(|snapshot| snapshot.messages.as_slice())
            .unwrap_or_default()
    }

    /// Sum of unread counts across every session, for the header badge.
    pub fn total_unread(&self) -> u64 {
        self.sessions
            .iter()
            .map(|snapshot| u64::from(snapshot.session.unread_count))
            .sum()
    }

    pub fn search_query(&self) -> &str {
        &self.search_query
    }

    pub fn set_search_query(&mut self, query: impl Into<String>) {
        self.search_query = query.into();
    }

    /// Sessions matching the search box. Never touches the subscription.
    pub fn filtered_sessions(&self) -> Vec<&SessionSnapshot> {
        let query = self.search_query.trim().to_lowercase();
        self.sessions
            .iter()
            .filter(|snapshot| matches_query(&snapshot.session, &query, &self.anonymous_name))
            .collect()
    }

    /// Filtered sessions bucketed by last activity, empty buckets omitted.
    pub fn grouped_sessions(&self, now_ms: u64) -> Vec<(SessionAgeGroup, Vec<&SessionSnapshot>)> {
        let mut groups: Vec<(SessionAgeGroup, Vec<&SessionSnapshot>)> = vec![
            (SessionAgeGroup::Today, Vec::new()),
            (SessionAgeGroup::Yesterday, Vec::new()),
            (SessionAgeGroup::Older, Vec::new()),
        ];
        for snapshot in self.filtered_sessions() {
            let group = classify_group(snapshot.session.activity_key(), now_ms);
            if let Some((_, members)) = groups.iter_mut().find(|(candidate, _)| *candidate == group)
            {
                members.push(snapshot);
            }
        }
        groups.retain(|(_, members)| !members.is_empty());
        groups
    }

    /// Opens a conversation and acknowledges its unread messages.
    ///
    /// The selection only changes once the acknowledgment succeeds.
    pub async fn select(&mut self, session_id: &SessionId) -> ChatResult<()> {
        self.channel.acknowledge_read(session_id).await?;
        self.selection = InboxSelection::SessionSelected(session_id.clone());
        Ok(())
    }

    pub fn deselect(&mut self) {
        self.selection = InboxSelection::NoSessionSelected;
    }

    pub async fn reply(&self, text: &str) -> ChatResult<Option<MessageRecord>> {
        self.reply_with(NewMessage::text(Sender::Admin, text)).await
    }

    pub async fn reply_to(
        &self,
        message_id: MessageId,
        text: &str,
    ) -> ChatResult<Option<MessageRecord>> {
        self.reply_with(NewMessage::text(Sender::Admin, text).with_reply_to(message_id))
            .await
    }

    /// Sends as admin into the selected conversation, which zeroes its unread count.
    pub async fn reply_with(&self, mut message: NewMessage) -> ChatResult<Option<MessageRecord>> {
        let session_id = self.selected_session_id().context(NoSessionSelectedSnafu {
            stage: "inbox-reply-selection",
        })?;
        message.sender = Sender::Admin;
        self.channel.send(session_id, message).await
    }

    /// Applies the newest queued session list, if any. Returns true when one was applied.
    pub async fn sync(&mut self) -> bool {
        match self.subscription.try_latest() {
            Some(sessions) => {
                self.apply_sessions(sessions).await;
                true
            }
            None => false,
        }
    }

    /// Waits for the next session list. Returns false once the feed has ended.
    pub async fn next_update(&mut self) -> bool {
        match self.subscription.recv().await {
            Some(sessions) => {
                self.apply_sessions(sessions).await;
                true
            }
            None => false,
        }
    }

    async fn apply_sessions(&mut self, mut sessions: Vec<SessionSnapshot>) {
        sessions.sort_by(|left, right| session_order(&left.session, &right.session));
        self.sessions = sessions;

        let Some(selected) = self.selected_session_id().cloned() else {
            return;
        };
        let Some(unread) = self
            .selected_session()
            .map(|snapshot| snapshot.session.unread_count)
        else {
            tracing::debug!(session_id = %selected, "selected chat session disappeared");
            self.selection = InboxSelection::NoSessionSelected;
            return;
        };

        // New visitor messages in the open conversation are read on arrival.
        if unread > 0
            && let Err(error) = self.channel.acknowledge_read(&selected).await
        {
            tracing::warn!(
                session_id = %selected,
                stage = error.stage(),
                "failed to acknowledge open conversation: {error}"
            );
        }
    }
}

/// Case-insensitive substring match over display name and email. `query` must be
/// lowercased already.
pub fn matches_query(session: &SessionRecord, query: &str, anonymous_name: &str) -> bool {
    if query.is_empty() {
        return true;
    }

    session
        .display_name_or(anonymous_name)
        .to_lowercase()
        .contains(query)
        || session.user_email.to_lowercase().contains(query)
}

/// Buckets by calendar day in UTC, so 23:59 yesterday is `Yesterday`.
pub fn classify_group(last_activity_ms: u64, now_ms: u64) -> SessionAgeGroup {
    let days_ago = (now_ms / DAY_MS).saturating_sub(last_activity_ms / DAY_MS);

    match days_ago {
        0 => SessionAgeGroup::Today,
        1 => SessionAgeGroup::Yesterday,
        _ => SessionAgeGroup::Older,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use sahr_storage::{ChatStore, MemoryChatStore};
    use tokio::time::timeout;

    use super::*;
    use crate::error::ChatError;

    fn session_record(name: &str, email: &str) -> SessionRecord {
        SessionRecord {
            id: SessionId::parse("session_search").unwrap(),
            user_name: name.to_string(),
            user_email: email.to_string(),
            created_at_ms: 0,
            last_message_at_ms: None,
            unread_count: 0,
        }
    }

    async fn mounted() -> (AdminInbox, MessageChannel, Arc<MemoryChatStore>) {
        let store = Arc::new(MemoryChatStore::new());
        let channel = MessageChannel::new(store.clone());
        let inbox = AdminInbox::mount(channel.clone(), &|| true).unwrap();
        (inbox, channel, store)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn wait_until(inbox: &mut AdminInbox, ready: impl Fn(&AdminInbox) -> bool) {
        while !ready(&*inbox) {
            let updated = timeout(Duration::from_secs(1), inbox.next_update())
                .await
                .unwrap();
            assert!(updated);
        }
    }

    #[test]
    fn search_matches_name_or_email_case_insensitively() {
        let record = session_record("Asha Verma", "ASHA@Example.com");
        assert!(matches_query(&record, "", ANONYMOUS_USER_NAME));
        assert!(matches_query(&record, "verma", ANONYMOUS_USER_NAME));
        assert!(matches_query(&record, "example.com", ANONYMOUS_USER_NAME));
        assert!(!matches_query(&record, "ravi", ANONYMOUS_USER_NAME));

        let anonymous = session_record("  ", "");
        assert!(matches_query(&anonymous, "anon", ANONYMOUS_USER_NAME));
        assert!(matches_query(&anonymous, "guest", "Guest"));
    }

    #[test]
    fn classify_group_compares_calendar_days() {
        let midnight = 10 * DAY_MS;
        let now = midnight + 60_000;
        assert_eq!(classify_group(midnight, now), SessionAgeGroup::Today);
        assert_eq!(classify_group(midnight - 60_000, now), SessionAgeGroup::Yesterday);
        assert_eq!(classify_group(midnight - DAY_MS, now), SessionAgeGroup::Yesterday);
        assert_eq!(classify_group(midnight - DAY_MS - 1, now), SessionAgeGroup::Older);
        assert_eq!(classify_group(now + 5, now), SessionAgeGroup::Today);
    }

    #[test]
    #[should_panic]
    fn mount_outside_a_runtime_panics() {
        let channel = MessageChannel::new(Arc::new(MemoryChatStore::new()));
        let _ = AdminInbox::mount(channel, &|| true);
    }

    #[tokio::test]
    async fn mount_requires_an_admin() {
        let store = Arc::new(MemoryChatStore::new());
        let channel = MessageChannel::new(store.clone());
        let error = AdminInbox::mount(channel, &|| false).err().unwrap();
        assert!(matches!(error, ChatError::AdminAccessDenied { .. }));
        assert_eq!(store.feed().listener_count(), 0);
    }

    #[tokio::test]
    async fn reply_needs_a_selected_session() {
        let (inbox, _, store) = mounted().await;
        let error = inbox.reply("hello").await.unwrap_err();
        assert!(matches!(error, ChatError::NoSessionSelected { .. }));
        assert_eq!(store.append_call_count(), 0);
    }

    #[tokio::test]
    async fn selecting_acknowledges_and_new_messages_stay_read() {
        let (mut inbox, channel, store) = mounted().await;
        let id = SessionId::parse("session_open").unwrap();
        channel.register(&id, "Asha", "asha@example.com").await.unwrap();
        for text in ["one", "two"] {
            channel
                .send(&id, NewMessage::text(Sender::Visitor, text))
                .await
                .unwrap();
        }
        wait_until(&mut inbox, |inbox| inbox.total_unread() == 2).await;

        inbox.select(&id).await.unwrap();
        wait_until(&mut inbox, |inbox| inbox.total_unread() == 0).await;
        assert_eq!(inbox.selected_messages().len(), 2);

        channel
            .send(&id, NewMessage::text(Sender::Visitor, "three"))
            .await
            .unwrap();
        wait_until(&mut inbox, |inbox| inbox.selected_messages().len() == 3).await;
        wait_until(&mut inbox, |inbox| inbox.total_unread() == 0).await;
        assert_eq!(store.get_session(&id).await.unwrap().unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn totals_and_groups_cover_every_session() {
        let (mut inbox, channel, _) = mounted().await;
        for (raw, name, sends) in [("session_a", "Asha", 2), ("session_b", "Ravi", 1)] {
            let id = SessionId::parse(raw).unwrap();
            channel
                .register(&id, name, &format!("{}@example.com", name.to_lowercase()))
                .await
                .unwrap();
            for index in 0..sends {
                channel
                    .send(&id, NewMessage::text(Sender::Visitor, format!("m{index}")))
                    .await
                    .unwrap();
            }
        }
        wait_until(&mut inbox, |inbox| inbox.total_unread() == 3).await;

        inbox.set_search_query("RAVI");
        let filtered = inbox.filtered_sessions();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].session.user_name, "Ravi");

        inbox.set_search_query("");
        let now = inbox.sessions()[0].session.activity_key();
        let groups = inbox.grouped_sessions(now);
        assert_eq!(groups[0].0, SessionAgeGroup::Today);
        let grouped = groups
            .iter()
            .map(|(_, members)| members.len())
            .sum::<usize>();
        assert_eq!(grouped, 2);
    }

    #[tokio::test]
    async fn failed_select_leaves_the_selection_unchanged() {
        let (mut inbox, _, _) = mounted().await;
        let missing = SessionId::parse("session_missing").unwrap();

        let error = inbox.select(&missing).await.unwrap_err();
        assert!(matches!(error, ChatError::Store { ref source, .. } if source.is_not_found()));
        assert_eq!(inbox.selection(), &InboxSelection::NoSessionSelected);
    }

    #[tokio::test]
    async fn sync_applies_only_the_newest_session_list() {
        let (mut inbox, channel, store) = mounted().await;
        let id = SessionId::parse("session_frame").unwrap();
        channel.register(&id, "Asha", "asha@example.com").await.unwrap();
        settle().await;
        assert!(inbox.sync().await);
        inbox.select(&id).await.unwrap();
        settle().await;
        inbox.sync().await;

        for text in ["one", "two", "three"] {
            channel
                .send(&id, NewMessage::text(Sender::Visitor, text))
                .await
                .unwrap();
        }
        settle().await;

        assert!(inbox.sync().await);
        assert_eq!(inbox.selected_messages().len(), 3);
        assert_eq!(store.get_session(&id).await.unwrap().unwrap().unread_count, 0);

        settle().await;
        assert!(inbox.sync().await);
        assert_eq!(inbox.total_unread(), 0);
        assert!(!inbox.sync().await);
    }

    #[tokio::test]
    async fn vanished_selection_falls_back_to_no_session() {
        let (mut inbox, _, _) = mounted().await;
        inbox.selection =
            InboxSelection::SessionSelected(SessionId::parse("session_gone").unwrap());

        inbox.apply_sessions(Vec::new()).await;
        assert_eq!(inbox.selection(), &InboxSelection::NoSessionSelected);
    }
}
