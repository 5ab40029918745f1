pub mod channel;
pub mod contact;
pub mod error;
pub mod identity;
pub mod inbox;
pub mod settings;
pub mod widget;

pub use channel::MessageChannel;
pub use contact::{CONTACT_STORE_KEY, ContactInbox, ContactMessage, NewContactMessage};
pub use error::{ChatError, ChatResult};
pub use identity::{
    FileLocalStorage, LocalStorage, MemoryLocalStorage, SESSION_ID_STORAGE_KEY, SessionIdentity,
    SessionIdentityManager,
};
pub use inbox::{
    AdminGate, AdminInbox, InboxSelection, SessionAgeGroup, classify_group, matches_query,
};
pub use settings::{ChatSettings, ChatSettingsStore, SettingsError, TransportMode};
pub use widget::{
    ComposeDraft, FailedSend, PanelState, Registration, SendOutcome, VisitorTransport,
    VisitorWidget, WidgetPhase,
};
