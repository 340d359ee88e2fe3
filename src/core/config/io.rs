use crate::core::config::data::{path_display, Config, ProviderKind};
use directories::ProjectDirs;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const BUILTIN_CATALOG: &str = include_str!("../../builtin_catalog.toml");

/// Errors that can occur when loading the persona/model catalog.
///
/// All of them are fatal at startup: no conversation can proceed without a
/// catalog.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file named on the command line does not exist.
    Missing {
        /// Path that was requested.
        path: PathBuf,
    },

    /// Failed to read the configuration file from disk.
    Read {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        /// Where the TOML came from (a path, or the embedded catalog).
        origin: String,
        /// The TOML deserialization error.
        source: toml::de::Error,
    },

    /// The file parsed but describes an unusable catalog.
    Invalid {
        /// Where the TOML came from.
        origin: String,
        /// Human-readable description of the problem.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing { path } => {
                write!(f, "Config file not found at {}", path_display(path))
            }
            ConfigError::Read { path, source } => {
                write!(
                    f,
                    "Failed to read config at {}: {}",
                    path_display(path),
                    source
                )
            }
            ConfigError::Parse { origin, source } => {
                write!(f, "Failed to parse config at {}: {}", origin, source)
            }
            ConfigError::Invalid { origin, reason } => {
                write!(f, "Invalid config at {}: {}", origin, reason)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Missing { .. } | ConfigError::Invalid { .. } => None,
        }
    }
}

impl Config {
    /// Resolve the catalog for this process.
    ///
    /// An explicit path must exist. Without one, the user's config file is
    /// used when present and the embedded catalog otherwise.
    pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }

        match Self::get_config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path),
            _ => Self::builtin(),
        }
    }

    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::Missing {
                path: config_path.to_path_buf(),
            });
        }

        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents, &path_display(config_path))
    }

    /// The catalog shipped inside the binary.
    pub fn builtin() -> Result<Config, ConfigError> {
        Self::from_toml(BUILTIN_CATALOG, "<builtin catalog>")
    }

    pub fn from_toml(contents: &str, origin: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        config.validate().map_err(|reason| ConfigError::Invalid {
            origin: origin.to_string(),
            reason,
        })?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.personas.is_empty() {
            return Err("at least one [[personas]] entry is required".to_string());
        }
        if self.models.is_empty() {
            return Err("at least one [[models]] entry is required".to_string());
        }
        if self.max_panel_personas == 0 {
            return Err("max_panel_personas must be at least 1".to_string());
        }

        let mut seen = HashSet::new();
        for persona in &self.personas {
            if persona.id.trim().is_empty() || persona.name.trim().is_empty() {
                return Err("personas need a non-empty id and name".to_string());
            }
            if !seen.insert(persona.id.to_lowercase()) {
                return Err(format!("duplicate persona id '{}'", persona.id));
            }
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.id.as_str()) {
                return Err(format!("duplicate model id '{}'", model.id));
            }
            if model.provider == ProviderKind::Replicate
                && (model.owner.is_none() || model.version.is_none())
            {
                return Err(format!(
                    "replicate model '{}' needs both owner and version",
                    model.id
                ));
            }
        }

        if let Some(default_model) = self.default_model.as_deref() {
            if self.find_model(default_model).is_none() {
                return Err(format!("default_model '{}' is not listed", default_model));
            }
        }

        Ok(())
    }

    pub(crate) fn get_config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "chatosophy", "chatosophy")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
