use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use sahr_storage::SessionId;
use snafu::ResultExt;

use crate::error::{ChatResult, LocalStorageCodecSnafu, LocalStorageIoSnafu};

/// Local storage key holding the visitor's session id.
pub const SESSION_ID_STORAGE_KEY: &str = "chat_session_id";

/// Visitor-local string key/value storage that survives page reloads.
pub trait LocalStorage: Send + Sync {
    fn get_item(&self, key: &str) -> ChatResult<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> ChatResult<()>;

    fn remove_item(&self, key: &str) -> ChatResult<()>;
}

/// Process-local storage scope. Two instances never share entries.
#[derive(Debug, Default)]
pub struct MemoryLocalStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryLocalStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryLocalStorage {
    fn get_item(&self, key: &str) -> ChatResult<Option<String>> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> ChatResult<()> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> ChatResult<()> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }
}

/// Storage scope persisted as one JSON object on disk.
///
/// Writes go to a temporary file first and replace the target with a rename.
#[derive(Debug)]
pub struct FileLocalStorage {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileLocalStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_items(&self) -> ChatResult<BTreeMap<String, String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(source) => {
                return Err(source).context(LocalStorageIoSnafu {
                    stage: "local-storage-read",
                    path: self.path.clone(),
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&content).context(LocalStorageCodecSnafu {
            stage: "local-storage-decode",
            key: "*",
        })
    }

    fn write_items(&self, items: &BTreeMap<String, String>) -> ChatResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(LocalStorageIoSnafu {
                stage: "local-storage-create-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(items).context(LocalStorageCodecSnafu {
            stage: "local-storage-encode",
            key: "*",
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(LocalStorageIoSnafu {
            stage: "local-storage-write-temporary",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &self.path).context(LocalStorageIoSnafu {
            stage: "local-storage-rename-temporary",
            path: self.path.clone(),
        })?;

        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> ChatResult<()> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = self.read_items()?;
        apply(&mut items);
        self.write_items(&items)
    }
}

impl LocalStorage for FileLocalStorage {
    fn get_item(&self, key: &str) -> ChatResult<Option<String>> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_items()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> ChatResult<()> {
        self.update(|items| {
            items.insert(key.to_string(), value.to_string());
        })
    }

    fn remove_item(&self, key: &str) -> ChatResult<()> {
        self.update(|items| {
            items.remove(key);
        })
    }
}

/// The visitor's session id and whether it will survive a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub id: SessionId,
    pub persisted: bool,
}

/// Hands out one stable session id per local storage scope.
pub struct SessionIdentityManager {
    storage: Arc<dyn LocalStorage>,
    ephemeral: OnceLock<SessionId>,
}

impl SessionIdentityManager {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage,
            ephemeral: OnceLock::new(),
        }
    }

    /// Returns the stored id, minting and persisting one on first use.
    ///
    /// When local storage cannot be read or written the id lives only as long
    /// as this manager and `persisted` is false.
    pub fn get_or_create_session_id(&self) -> SessionIdentity {
        if let Some(id) = self.ephemeral.get() {
            return SessionIdentity {
                id: id.clone(),
                persisted: false,
            };
        }

        match self.storage.get_item(SESSION_ID_STORAGE_KEY) {
            Ok(Some(raw)) => match SessionId::parse(&raw) {
                Ok(id) => {
                    return SessionIdentity {
                        id,
                        persisted: true,
                    };
                }
                Err(error) => {
                    tracing::warn!(
                        stage = error.stage(),
                        "discarding malformed stored session id: {error}"
                    );
                }
            },
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    stage = error.stage(),
                    "local storage unreadable, using ephemeral session id: {error}"
                );
                return self.ephemeral_identity();
            }
        }

        let id = SessionId::generate();
        match self.storage.set_item(SESSION_ID_STORAGE_KEY, id.as_str()) {
            Ok(()) => {
                tracing::info!(session_id = %id, "created visitor session id");
                SessionIdentity {
                    id,
                    persisted: true,
                }
            }
            Err(error) => {
                tracing::warn!(
                    stage = error.stage(),
                    "local storage unwritable, using ephemeral session id: {error}"
                );
                let id = self.ephemeral.get_or_init(|| id).clone();
                SessionIdentity {
                    id,
                    persisted: false,
                }
            }
        }
    }

    fn ephemeral_identity(&self) -> SessionIdentity {
        SessionIdentity {
            id: self.ephemeral.get_or_init(SessionId::generate).clone(),
            persisted: false,
        }
    }
}
