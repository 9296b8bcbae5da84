use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bestie_llm::{
    DEFAULT_GEMINI_MODEL, GenerationConfig, ProviderConfig, ProviderError, RIG_GEMINI_PROVIDER_ID,
};
use bestie_storage::DEFAULT_OWNER_ID;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "bestie";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "BESTIE_";
pub const DEFAULT_STORE_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";
pub const FALLBACK_FILE_NAME: &str = "local-conversations.json";
pub const DATABASE_FILE_NAME: &str = "conversations.db";

const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Blank means the provider's public endpoint.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: String::new(),
            model_id: default_model_id(),
            generation: GenerationConfig::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(
            ProviderConfig::new(&self.provider_id, &self.api_key, &self.model_id)
                .with_endpoint(&self.endpoint)
                .with_generation(self.generation)
                .with_request_timeout(Duration::from_secs(self.request_timeout_secs)),
        )
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model_id = non_blank_or(self.model_id, default_model_id);
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
    /// Root of the conversation REST API. Blank keeps conversations in
    /// process memory, with the local cache as the only durable copy.
    #[serde(default = "default_store_url")]
    pub store_url: String,
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    /// Local fallback cache file; blank means the settings directory.
    #[serde(default)]
    pub fallback_path: String,
    /// SQLite database used by `serve`; blank means the settings directory.
    #[serde(default)]
    pub database_path: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub provider: ProviderSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            owner_id: default_owner_id(),
            store_url: default_store_url(),
            store_timeout_secs: default_store_timeout_secs(),
            fallback_path: String::new(),
            database_path: String::new(),
            listen_addr: default_listen_addr(),
            provider: ProviderSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn fallback_path(&self) -> PathBuf {
        path_or_default(&self.fallback_path, FALLBACK_FILE_NAME)
    }

    pub fn database_path(&self) -> PathBuf {
        path_or_default(&self.database_path, DATABASE_FILE_NAME)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.provider
            .generation
            .validate()
            .context(InvalidGenerationSnafu {
                stage: "validate-generation-config",
            })
    }

    pub fn normalized(mut self) -> Self {
        self.owner_id = non_blank_or(self.owner_id, default_owner_id);
        self.store_url = self.store_url.trim().trim_end_matches('/').to_string();
        if self.store_timeout_secs == 0 {
            self.store_timeout_secs = default_store_timeout_secs();
        }
        self.fallback_path = self.fallback_path.trim().to_string();
        self.database_path = self.database_path.trim().to_string();
        self.listen_addr = non_blank_or(self.listen_addr, default_listen_addr);
        self.provider = self.provider.normalized();
        self
    }
}

/// Layered settings: built-in defaults, then the JSON file, then `BESTIE_*`
/// environment variables (`__` separates nested keys, e.g.
/// `BESTIE_PROVIDER__API_KEY`).
pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".bestie"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    /// Validates, persists and publishes `settings`.
    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        normalized_settings.validate()?;
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_layers(path: &Path) -> AppSettings {
        let mut figment = Figment::from(Serialized::defaults(AppSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => {
                let settings = settings.normalized();
                if let Err(error) = settings.validate() {
                    tracing::warn!(
                        path = %path.display(),
                        error = %error,
                        "generation config rejected, using defaults"
                    );
                    return AppSettings {
                        provider: ProviderSettings {
                            generation: GenerationConfig::default(),
                            ..settings.provider
                        },
                        ..settings
                    };
                }
                settings
            }
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
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

        tracing::info!(path = %self.config_path.display(), "saved settings");
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
    #[snafu(display("invalid settings on `{stage}`: {source}"))]
    InvalidGeneration {
        stage: &'static str,
        source: ProviderError,
    },
}

fn non_blank_or(value: String, default: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default()
    } else {
        trimmed.to_string()
    }
}

fn path_or_default(configured: &str, file_name: &str) -> PathBuf {
    if configured.trim().is_empty() {
        SettingsStore::default_config_dir().join(file_name)
    } else {
        PathBuf::from(configured.trim())
    }
}

fn default_owner_id() -> String {
    DEFAULT_OWNER_ID.to_string()
}

fn default_store_url() -> String {
    DEFAULT_STORE_URL.to_string()
}

fn default_store_timeout_secs() -> u64 {
    DEFAULT_STORE_TIMEOUT_SECS
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_provider_id() -> String {
    RIG_GEMINI_PROVIDER_ID.to_string()
}

fn default_model_id() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();
            assert_eq!(settings.owner_id, DEFAULT_OWNER_ID);
            assert_eq!(settings.store_url, DEFAULT_STORE_URL);
            assert_eq!(settings.provider.model_id, DEFAULT_GEMINI_MODEL);
            assert!(!settings.provider.is_valid());
            assert!(settings.provider.to_provider_config().is_none());
            Ok(())
        });
    }

    #[test]
    fn file_then_environment_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{
                    "owner_id": "ada",
                    "store_url": "http://example.test/api/",
                    "provider": { "api_key": "from-file", "generation": { "temperature": 0.3 } }
                }"#,
            )?;
            jail.set_env("BESTIE_PROVIDER__API_KEY", "from-env");
            jail.set_env("BESTIE_LISTEN_ADDR", "0.0.0.0:8080");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();
            assert_eq!(settings.owner_id, "ada");
            assert_eq!(settings.store_url, "http://example.test/api");
            assert_eq!(settings.listen_addr, "0.0.0.0:8080");
            assert_eq!(settings.provider.api_key, "from-env");
            assert_eq!(settings.provider.generation.temperature, 0.3);
            assert_eq!(settings.provider.generation.top_k, 40);

            let config = settings.provider.to_provider_config().unwrap();
            assert_eq!(config.request_timeout, Duration::from_secs(60));
            Ok(())
        });
    }

    #[test]
    fn invalid_generation_config_is_replaced_on_load_and_rejected_on_update() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{ "provider": { "generation": { "top_p": 3.0 } } }"#,
            )?;
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(store.settings().provider.generation, GenerationConfig::default());

            let mut invalid = (*store.settings()).clone();
            invalid.provider.generation.temperature = 9.0;
            assert!(matches!(
                store.update(invalid),
                Err(SettingsError::InvalidGeneration { .. })
            ));
            Ok(())
        });
    }

    #[test]
    fn update_persists_and_reloads() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        let mut settings = (*store.settings()).clone();
        settings.owner_id = "  grace  ".to_string();
        settings.provider.api_key = "secret".to_string();
        store.update(settings).unwrap();

        assert_eq!(store.settings().owner_id, "grace");
        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().owner_id, "grace");
        assert!(reloaded.settings().provider.is_valid());
    }
}
