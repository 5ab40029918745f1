use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};
use uuid::Uuid;

use crate::error::{
    ChatResult, ContactMessageMissingSnafu, InvalidRegistrationSnafu, LocalStorageCodecSnafu,
};
use crate::identity::LocalStorage;

/// Local storage key holding the contact-form inbox.
pub const CONTACT_STORE_KEY: &str = "message-store";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactMessage {
    pub id: String,
    pub name: String,
    pub email: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContactMessage {
    pub name: String,
    pub email: String,
    pub message: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContactDocument {
    #[serde(default)]
    messages: Vec<ContactMessage>,
}

/// Contact messages kept in local storage, newest first.
///
/// Stands in for the realtime store when the widget runs in contact-form mode.
#[derive(Clone)]
pub struct ContactInbox {
    storage: Arc<dyn LocalStorage>,
    guard: Arc<Mutex<()>>,
}

impl ContactInbox {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn messages(&self) -> ChatResult<Vec<ContactMessage>> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.messages)
    }

    pub fn add_message(&self, input: NewContactMessage) -> ChatResult<ContactMessage> {
        let name = input.name.trim();
        let email = input.email.trim();
        let body = input.message.trim();
        let image_url = input
            .image_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        ensure!(
            !name.is_empty(),
            InvalidRegistrationSnafu {
                stage: "contact-add-validate",
                field: "name",
            }
        );
        ensure!(
            !email.is_empty(),
            InvalidRegistrationSnafu {
                stage: "contact-add-validate",
                field: "email",
            }
        );
        ensure!(
            !body.is_empty() || image_url.is_some(),
            InvalidRegistrationSnafu {
                stage: "contact-add-validate",
                field: "message",
            }
        );

        let message = ContactMessage {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            email: email.to_string(),
            message: body.to_string(),
            image_url,
            is_read: false,
            reply: None,
            created_at_ms: unix_timestamp_millis(),
        };

        self.modify("contact-add", |document| {
            document.messages.insert(0, message.clone());
            Ok(())
        })?;

        tracing::info!(contact_id = %message.id, "stored contact message");
        Ok(message)
    }

    pub fn mark_as_read(&self, id: &str) -> ChatResult<()> {
        self.modify("contact-mark-read", |document| {
            find_message(document, id, "contact-mark-read-missing")?.is_read = true;
            Ok(())
        })
    }

    pub fn reply_to_message(&self, id: &str, reply: &str) -> ChatResult<()> {
        let reply = reply.trim().to_string();
        self.modify("contact-reply", |document| {
            find_message(document, id, "contact-reply-missing")?.reply = Some(reply);
            Ok(())
        })
    }

    pub fn delete_message(&self, id: &str) -> ChatResult<()> {
        self.modify("contact-delete", |document| {
            let before = document.messages.len();
            document.messages.retain(|message| message.id != id);
            ensure!(
                document.messages.len() < before,
                ContactMessageMissingSnafu {
                    stage: "contact-delete-missing",
                    id: id.to_string(),
                }
            );
            Ok(())
        })
    }

    pub fn unread_count(&self) -> ChatResult<usize> {
        Ok(self
            .messages()?
            .iter()
            .filter(|message| !message.is_read)
            .count())
    }

    fn load(&self) -> ChatResult<ContactDocument> {
        let Some(raw) = self.storage.get_item(CONTACT_STORE_KEY)? else {
            return Ok(ContactDocument::default());
        };

        serde_json::from_str(&raw).context(LocalStorageCodecSnafu {
            stage: "contact-decode",
            key: CONTACT_STORE_KEY,
        })
    }

    fn modify(
        &self,
        stage: &'static str,
        apply: impl FnOnce(&mut ContactDocument) -> ChatResult<()>,
    ) -> ChatResult<()> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.load()?;
        apply(&mut document)?;

        let raw = serde_json::to_string(&document).context(LocalStorageCodecSnafu {
            stage,
            key: CONTACT_STORE_KEY,
        })?;
        self.storage.set_item(CONTACT_STORE_KEY, &raw)
    }
}

fn find_message<'a>(
    document: &'a mut ContactDocument,
    id: &str,
    stage: &'static str,
) -> ChatResult<&'a mut ContactMessage> {
    document
        .messages
        .iter_mut()
        .find(|message| message.id == id)
        .context(ContactMessageMissingSnafu {
            stage,
            id: id.to_string(),
        })
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::identity::MemoryLocalStorage;

    fn inbox() -> (ContactInbox, Arc<dyn LocalStorage>) {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryLocalStorage::new());
        (ContactInbox::new(storage.clone()), storage)
    }

    fn contact(message: &str) -> NewContactMessage {
        NewContactMessage {
            name: "Asha".to_string(),
            email: "asha@example.com".to_string(),
            message: message.to_string(),
            image_url: None,
        }
    }

    #[test]
    fn newest_message_comes_first_and_persists() {
        let (inbox, storage) = inbox();
        inbox.add_message(contact("first")).unwrap();
        inbox.add_message(contact("second")).unwrap();

        let reopened = ContactInbox::new(storage);
        let bodies = reopened
            .messages()
            .unwrap()
            .into_iter()
            .map(|message| message.message)
            .collect::<Vec<_>>();
        assert_eq!(bodies, vec!["second", "first"]);
        assert_eq!(reopened.unread_count().unwrap(), 2);
    }

    #[test]
    fn admin_operations_update_the_stored_message() {
        let (inbox, _) = inbox();
        let message = inbox.add_message(contact("is the print signed?")).unwrap();
        let other = inbox.add_message(contact("thanks")).unwrap();

        inbox.mark_as_read(&message.id).unwrap();
        inbox.reply_to_message(&message.id, " Yes, by hand. ").unwrap();
        assert_eq!(inbox.unread_count().unwrap(), 1);

        let stored = inbox
            .messages()
            .unwrap()
            .into_iter()
            .find(|candidate| candidate.id == message.id)
            .unwrap();
        assert!(stored.is_read);
        assert_eq!(stored.reply.as_deref(), Some("Yes, by hand."));

        inbox.delete_message(&other.id).unwrap();
        assert_eq!(inbox.messages().unwrap().len(), 1);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let (inbox, _) = inbox();
        let error = inbox.delete_message("missing").unwrap_err();
        assert!(matches!(error, ChatError::ContactMessageMissing { .. }));
        assert!(inbox.mark_as_read("missing").is_err());
    }

    #[test]
    fn image_only_contact_is_accepted_but_empty_is_not() {
        let (inbox, _) = inbox();
        let mut image_only = contact("  ");
        image_only.image_url = Some("https://cdn/print.jpg".to_string());
        assert!(inbox.add_message(image_only).is_ok());
        assert!(inbox.add_message(contact(" ")).is_err());
    }
}
