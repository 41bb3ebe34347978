use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    #[default]
    Groq,
}

impl ProviderId {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::OpenAi => "openai",
            ProviderId::Groq => "groq",
        }
    }

    pub fn parse(s: &str) -> Option<ProviderId> {
        if s.eq_ignore_ascii_case("openai") {
            Some(ProviderId::OpenAi)
        } else if s.eq_ignore_ascii_case("groq") {
            Some(ProviderId::Groq)
        } else {
            None
        }
    }
}

/// Provider choice and per-provider credentials. Callers must fetch a fresh
/// copy from the store for every provider call; nothing caches this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderId,
    #[serde(default, rename = "openaiKey", skip_serializing_if = "Option::is_none")]
    pub openai_key: Option<String>,
    #[serde(default, rename = "groqKey", skip_serializing_if = "Option::is_none")]
    pub groq_key: Option<String>,
}

impl Settings {
    /// The credential for the active provider.
    pub fn credential(&self) -> Result<&str> {
        let (key, missing) = match self.provider {
            ProviderId::OpenAi => (
                self.openai_key.as_deref(),
                "OpenAI API key not configured. Set it in settings or the OPENAI_API_KEY environment variable",
            ),
            ProviderId::Groq => (
                self.groq_key.as_deref(),
                "Groq API key not configured. Set it in settings or the GROQ_API_KEY environment variable",
            ),
        };
        key.filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Configuration(missing.into()))
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings>;
    async fn save(&self, settings: &Settings) -> Result<()>;
}

/// Settings persisted as pretty JSON under the user config directory, with
/// environment variables filling any gaps the file leaves.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> Result<PathBuf> {
        config_file("settings.json")
    }
}

#[async_trait]
impl SettingsStore for FileStore {
    async fn load(&self) -> Result<Settings> {
        let mut settings = if self.path.exists() {
            let file = std::fs::File::open(&self.path)
                .map_err(|e| Error::Configuration(format!("failed to open settings: {e}")))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| Error::Configuration(format!("failed to parse settings: {e}")))?
        } else {
            let mut fresh = Settings::default();
            if let Ok(name) = std::env::var("AUTOPAGE_PROVIDER")
                && let Some(id) = ProviderId::parse(&name)
            {
                fresh.provider = id;
            }
            fresh
        };

        if settings.openai_key.is_none() {
            settings.openai_key = non_empty_env("OPENAI_API_KEY");
        }
        if settings.groq_key.is_none() {
            settings.groq_key = non_empty_env("GROQ_API_KEY");
        }
        Ok(settings)
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Configuration(format!("failed to create {parent:?}: {e}")))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| Error::Configuration(format!("failed to write settings: {e}")))?;
        serde_json::to_writer_pretty(file, settings)
            .map_err(|e| Error::Configuration(format!("failed to write settings: {e}")))?;
        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn config_file(name: &str) -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("autopage").join(name))
        .ok_or_else(|| Error::Configuration("no user config directory available".into()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub prompt: String,
    pub outcome: String,
    pub timestamp: DateTime<Utc>,
}

/// Rolling log of finished automation requests, newest first, capped at
/// [`MAX_HISTORY`] entries. Stored beside the settings file.
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> Result<PathBuf> {
        config_file("history.json")
    }

    pub fn load(&self) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .map_err(|e| Error::Configuration(format!("failed to open history: {e}")))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Configuration(format!("failed to parse history: {e}")))
    }

    pub fn append(&self, prompt: &str, outcome: &str) -> Result<()> {
        let mut entries = self.load()?;
        entries.insert(
            0,
            HistoryEntry {
                prompt: prompt.to_string(),
                outcome: outcome.to_string(),
                timestamp: Utc::now(),
            },
        );
        entries.truncate(MAX_HISTORY);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Configuration(format!("failed to create {parent:?}: {e}")))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| Error::Configuration(format!("failed to write history: {e}")))?;
        serde_json::to_writer_pretty(file, &entries)
            .map_err(|e| Error::Configuration(format!("failed to write history: {e}")))?;
        Ok(())
    }
}
