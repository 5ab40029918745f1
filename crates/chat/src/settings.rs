use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use sahr_storage::SqliteChatStore;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::error::{ChatResult, StoreSnafu};
use crate::identity::FileLocalStorage;

pub const SETTINGS_DIRECTORY_NAME: &str = "sahr";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "SAHR_";
pub const DEFAULT_DATABASE_URL: &str = ".sahr/chat.db";
pub const DEFAULT_LOCAL_STORAGE_PATH: &str = ".sahr/local_storage.json";
pub const DEFAULT_TYPING_INDICATOR_MS: u64 = 3_000;

/// How the visitor widget delivers messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Realtime,
    ContactForm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub transport: TransportMode,
    #[serde(default = "default_typing_indicator_ms")]
    pub typing_indicator_ms: u64,
    #[serde(default = "default_local_storage_path")]
    pub local_storage_path: String,
    #[serde(default = "default_anonymous_name")]
    pub anonymous_name: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            transport: TransportMode::default(),
            typing_indicator_ms: default_typing_indicator_ms(),
            local_storage_path: default_local_storage_path(),
            anonymous_name: default_anonymous_name(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.database_url = non_blank_or(self.database_url, default_database_url);
        self.local_storage_path = non_blank_or(self.local_storage_path, default_local_storage_path);
        self.anonymous_name = non_blank_or(self.anonymous_name, default_anonymous_name);
        self
    }

    /// Opens the configured SQLite chat store, creating it when missing.
    pub async fn open_store(&self) -> ChatResult<SqliteChatStore> {
        SqliteChatStore::open(&self.database_url)
            .await
            .context(StoreSnafu {
                stage: "settings-open-store",
            })
    }

    pub fn local_storage(&self) -> FileLocalStorage {
        FileLocalStorage::new(&self.local_storage_path)
    }
}

pub struct ChatSettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl ChatSettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".sahr"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &PathBuf) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_typing_indicator_ms() -> u64 {
    DEFAULT_TYPING_INDICATOR_MS
}

fn default_local_storage_path() -> String {
    DEFAULT_LOCAL_STORAGE_PATH.to_string()
}

fn default_anonymous_name() -> String {
    sahr_storage::ANONYMOUS_USER_NAME.to_string()
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(label: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("sahr-settings-{label}-{}", uuid::Uuid::now_v7()))
            .join(SETTINGS_FILE_NAME)
    }

    fn cleanup(path: &PathBuf) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = temp_config_path("missing");
        let store = ChatSettingsStore::new(path);
        let settings = store.settings();

        assert_eq!(settings.typing_indicator_ms, DEFAULT_TYPING_INDICATOR_MS);
        assert_eq!(settings.anonymous_name, "Anonymous");
    }

    #[test]
    fn update_persists_and_reloads() {
        let path = temp_config_path("update");
        let store = ChatSettingsStore::new(path.clone());
        store
            .update(ChatSettings {
                transport: TransportMode::ContactForm,
                database_url: "  ".to_string(),
                ..ChatSettings::default()
            })
            .unwrap();

        assert_eq!(store.settings().database_url, DEFAULT_DATABASE_URL);

        let reloaded = ChatSettingsStore::new(path.clone());
        assert_eq!(reloaded.settings().transport, TransportMode::ContactForm);
        cleanup(&path);
    }

    #[tokio::test]
    async fn configured_store_and_local_storage_open() {
        let path = temp_config_path("open");
        let settings = ChatSettings {
            database_url: ":memory:".to_string(),
            local_storage_path: path.to_string_lossy().into_owned(),
            ..ChatSettings::default()
        };

        let store = settings.open_store().await.unwrap();
        assert_eq!(store.database_url(), "sqlite::memory:");

        let local = settings.local_storage();
        assert_eq!(local.path(), path.as_path());
        cleanup(&path);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let path = temp_config_path("malformed");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, "{ \"typing_indicator_ms\": \"soon\" }").unwrap();

        let store = ChatSettingsStore::new(path.clone());
        assert_eq!(*store.settings(), ChatSettings::default());
        cleanup(&path);
    }
}
