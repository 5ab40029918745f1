use std::path::PathBuf;

use sahr_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("registration rejected on `{stage}`: {field} must not be empty"))]
    InvalidRegistration {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("chat store call failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("visitor is not registered on `{stage}`"))]
    NotRegistered { stage: &'static str },
    #[snafu(display("session '{session_id}' is already registered on `{stage}`"))]
    AlreadyRegistered {
        stage: &'static str,
        session_id: String,
    },
    #[snafu(display("no conversation is selected on `{stage}`"))]
    NoSessionSelected { stage: &'static str },
    #[snafu(display("admin inbox requires an admin identity on `{stage}`"))]
    AdminAccessDenied { stage: &'static str },
    #[snafu(display("local storage at {path:?} failed on `{stage}`: {source}"))]
    LocalStorageIo {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("local storage entry '{key}' could not be encoded on `{stage}`: {source}"))]
    LocalStorageCodec {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("local storage is unavailable on `{stage}`"))]
    LocalStorageUnavailable { stage: &'static str },
    #[snafu(display("contact message '{id}' was not found on `{stage}`"))]
    ContactMessageMissing { stage: &'static str, id: String },
}

impl ChatError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidRegistration { stage, .. }
            | Self::Store { stage, .. }
            | Self::NotRegistered { stage }
            | Self::AlreadyRegistered { stage, .. }
            | Self::NoSessionSelected { stage }
            | Self::AdminAccessDenied { stage }
            | Self::LocalStorageIo { stage, .. }
            | Self::LocalStorageCodec { stage, .. }
            | Self::LocalStorageUnavailable { stage }
            | Self::ContactMessageMissing { stage, .. } => stage,
        }
    }

    /// Store and local storage failures can succeed on a later attempt; input errors cannot.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::LocalStorageIo { .. } | Self::LocalStorageUnavailable { .. }
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
