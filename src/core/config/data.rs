use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::language::Language;

pub const DEFAULT_MAX_PANEL_PERSONAS: usize = 5;
pub const DEFAULT_PANEL_RETRIES: u32 = 1;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8501";

/// Backend family a model is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Hosted model-as-a-service; a model name is enough to address it.
    #[serde(rename = "openai")]
    OpenAi,
    /// Inference hosting; models are addressed by owner, name and version.
    #[serde(rename = "replicate")]
    Replicate,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::OpenAi, ProviderKind::Replicate];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Replicate => "replicate",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Replicate => "Replicate",
        }
    }

    /// Where a user can obtain a key for this provider.
    pub fn key_help_url(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://platform.openai.com/account/api-keys",
            ProviderKind::Replicate => "https://replicate.com/account/api-tokens",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Persona {
    pub id: String,
    /// Name substituted into the impersonation template.
    pub name: String,
    /// Avatar asset path relative to the static asset root.
    pub avatar: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub display_name: Option<String>,
    pub provider: ProviderKind,
    /// Replicate model owner (e.g. "meta").
    pub owner: Option<String>,
    /// Replicate model version hash.
    pub version: Option<String>,
    /// Output token budget forwarded to providers that accept one.
    pub max_length: Option<u32>,
}

impl ModelSpec {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub base_url: String,
    /// Environment variable holding the key used when the user opts for the
    /// default credential.
    pub default_key_env: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderTable {
    #[serde(default = "default_openai_settings")]
    pub openai: ProviderSettings,
    #[serde(default = "default_replicate_settings")]
    pub replicate: ProviderSettings,
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self {
            openai: default_openai_settings(),
            replicate: default_replicate_settings(),
        }
    }
}

impl ProviderTable {
    pub fn settings(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Replicate => &self.replicate,
        }
    }
}

fn default_openai_settings() -> ProviderSettings {
    ProviderSettings {
        base_url: "https://api.openai.com/v1".to_string(),
        default_key_env: Some("OPENAI_API_KEY".to_string()),
    }
}

fn default_replicate_settings() -> ProviderSettings {
    ProviderSettings {
        base_url: "https://api.replicate.com/v1".to_string(),
        default_key_env: Some("REPLICATE_API_TOKEN".to_string()),
    }
}

/// Prompt-injection screening in front of every dispatch.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GuardSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_guard_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_guard_key_env")]
    pub key_env: String,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_guard_endpoint(),
            key_env: default_guard_key_env(),
        }
    }
}

fn default_guard_endpoint() -> String {
    "https://api.lakera.ai/v1/prompt_injection".to_string()
}

fn default_guard_key_env() -> String {
    "LAKERA_GUARD_API_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory persona avatar paths are relative to. Unset means the
    /// working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            assets_dir: None,
        }
    }
}

impl ServerSettings {
    pub fn asset_path(&self, relative: &str) -> PathBuf {
        match &self.assets_dir {
            Some(dir) => dir.join(relative),
            None => PathBuf::from(relative),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_max_panel_personas() -> usize {
    DEFAULT_MAX_PANEL_PERSONAS
}

fn default_panel_retries() -> u32 {
    DEFAULT_PANEL_RETRIES
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    /// Model selected for new sessions; the first listed model otherwise.
    pub default_model: Option<String>,
    #[serde(default)]
    pub default_language: Language,
    /// Upper bound on personas in one multi-mode panel.
    #[serde(default = "default_max_panel_personas")]
    pub max_panel_personas: usize,
    /// Extra attempts per persona before a panel member is marked failed.
    #[serde(default = "default_panel_retries")]
    pub panel_retries: u32,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub providers: ProviderTable,
    #[serde(default)]
    pub guard: GuardSettings,
    #[serde(default)]
    pub personas: Vec<Persona>,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_model: None,
            default_language: Language::default(),
            max_panel_personas: DEFAULT_MAX_PANEL_PERSONAS,
            panel_retries: DEFAULT_PANEL_RETRIES,
            server: ServerSettings::default(),
            providers: ProviderTable::default(),
            guard: GuardSettings::default(),
            personas: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl Config {
    pub fn find_model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn find_persona(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id.eq_ignore_ascii_case(id))
    }

    /// Model a fresh session starts with.
    pub fn initial_model(&self) -> Option<&ModelSpec> {
        match self.default_model.as_deref() {
            Some(id) => self.find_model(id),
            None => self.models.first(),
        }
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths under the home directory to `~` notation on
/// Unix-like systems, e.g. `/home/ada/.config/chatosophy/config.toml` becomes
/// `~/.config/chatosophy/config.toml`.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
