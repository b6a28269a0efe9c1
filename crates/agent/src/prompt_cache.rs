//! Persona and tool-doc text for system prompts, cached per bot.
//!
//! Loading the files is someone else's job ([`PersonaSource`]); this module
//! caches what was loaded for a short TTL and cuts each file down to the
//! character budget of the prompt mode.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use skein_config::{CharBudget, PromptCacheConfig};
use tokio::time::Instant;
use tracing::{debug, warn};

const HEAD_RATIO: f64 = 0.7;
const TAIL_RATIO: f64 = 0.2;
const TRUNCATION_MARKER: &str =
    "\n\n[...truncated, read the full file with the `read` tool for complete content...]\n\n";

/// How much persona text a prompt carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMode {
    /// Interactive chat.
    Full,
    /// Scheduled tasks.
    Minimal,
    /// Heartbeats.
    Micro,
}

/// Keep the first 70% and last 20% of the budget, with a marker between.
///
/// A zero budget or empty content yields an empty string.
pub fn truncate_head_tail(content: &str, max_chars: usize) -> String {
    if max_chars == 0 || content.is_empty() {
        return String::new();
    }
    let len = content.chars().count();
    if len <= max_chars {
        return content.to_string();
    }
    let head_chars = (max_chars as f64 * HEAD_RATIO).floor() as usize;
    let tail_chars = (max_chars as f64 * TAIL_RATIO).floor() as usize;
    let head: String = content.chars().take(head_chars).collect();
    let tail: String = content.chars().skip(len - tail_chars).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// The three persona files a system prompt is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonaFiles {
    pub identity: String,
    pub soul: String,
    pub tools: String,
}

/// Reads persona files for a bot (from its container, a database, ...).
#[async_trait]
pub trait PersonaSource: Send + Sync {
    async fn read(&self, bot_id: &str) -> Result<PersonaFiles, skein_core::Error>;
}

/// A source that always returns the same files.
#[derive(Debug, Clone, Default)]
pub struct StaticPersona(pub PersonaFiles);

#[async_trait]
impl PersonaSource for StaticPersona {
    async fn read(&self, _bot_id: &str) -> Result<PersonaFiles, skein_core::Error> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptCacheSettings {
    pub ttl: Duration,
    pub size_warn_chars: usize,
    pub full: CharBudget,
    pub minimal: CharBudget,
    pub micro: CharBudget,
}

impl Default for PromptCacheSettings {
    fn default() -> Self {
        Self::from(&PromptCacheConfig::default())
    }
}

impl From<&PromptCacheConfig> for PromptCacheSettings {
    fn from(config: &PromptCacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_secs),
            size_warn_chars: config.size_warn_chars,
            full: config.full,
            minimal: config.minimal,
            micro: config.micro,
        }
    }
}

impl PromptCacheSettings {
    pub fn budget(&self, mode: SystemMode) -> CharBudget {
        match mode {
            SystemMode::Full => self.full,
            SystemMode::Minimal => self.minimal,
            SystemMode::Micro => self.micro,
        }
    }
}

struct CacheEntry {
    key: String,
    files: PersonaFiles,
    expires: Instant,
}

/// TTL cache over a [`PersonaSource`], keyed by `bot_id:identity:soul`.
pub struct SystemFileCache {
    settings: PromptCacheSettings,
    source: Arc<dyn PersonaSource>,
    entry: Mutex<Option<CacheEntry>>,
}

impl SystemFileCache {
    pub fn new(settings: PromptCacheSettings, source: Arc<dyn PersonaSource>) -> Self {
        Self {
            settings,
            source,
            entry: Mutex::new(None),
        }
    }

    /// Persona files for `bot_id`. `identity` and `soul` are the values the
    /// caller already has; the source only fills in what is empty.
    pub async fn load(&self, bot_id: &str, identity: &str, soul: &str) -> PersonaFiles {
        let key = format!("{bot_id}:{identity}:{soul}");
        {
            let entry = self.entry.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = entry.as_ref() {
                if cached.key == key && Instant::now() < cached.expires {
                    return cached.files.clone();
                }
            }
        }

        let loaded = match self.source.read(bot_id).await {
            Ok(files) => files,
            Err(e) => {
                warn!(bot_id, error = %e, "Failed to read persona files");
                PersonaFiles::default()
            }
        };
        let files = PersonaFiles {
            identity: non_empty_or(identity, loaded.identity),
            soul: non_empty_or(soul, loaded.soul),
            tools: loaded.tools,
        };

        for (name, text) in [("SOUL.md", &files.soul), ("TOOLS.md", &files.tools)] {
            let chars = text.chars().count();
            if chars > self.settings.size_warn_chars {
                warn!(bot_id, file = name, chars, "Persona file is large; consider distilling it");
            }
        }

        debug!(bot_id, "Persona files cached");
        *self.entry.lock().unwrap_or_else(|e| e.into_inner()) = Some(CacheEntry {
            key,
            files: files.clone(),
            expires: Instant::now() + self.settings.ttl,
        });
        files
    }

    /// Like [`load`](Self::load), with soul and tool docs cut to the mode's budget.
    pub async fn for_mode(
        &self,
        mode: SystemMode,
        bot_id: &str,
        identity: &str,
        soul: &str,
    ) -> PersonaFiles {
        let files = self.load(bot_id, identity, soul).await;
        let budget = self.settings.budget(mode);
        PersonaFiles {
            identity: files.identity,
            soul: truncate_head_tail(&files.soul, budget.soul),
            tools: truncate_head_tail(&files.tools, budget.tools),
        }
    }
}

impl std::fmt::Debug for SystemFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemFileCache")
            .field("settings", &self.settings)
            .finish()
    }
}

fn non_empty_or(preferred: &str, fallback: String) -> String {
    if preferred.is_empty() {
        fallback
    } else {
        preferred.to_string()
    }
}
