use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::config::data::{Config, ModelSpec, ProviderKind};
use crate::core::config::io::ConfigError;
use crate::core::conversation::{ChatError, ConversationSession, TurnContext, TurnInterrupt};
use crate::core::credentials::{
    AuthStatus, CredentialGate, CredentialSource, ValidationOutcome, ValidationTicket,
};
use crate::core::guard::PromptGuard;
use crate::core::language::Language;
use crate::core::message::Message;
use crate::core::panel::Panel;
use crate::core::persona::PersonaRegistry;
use crate::core::providers::{BackendError, ChatBackend, ProviderRegistry};

#[derive(Debug)]
pub enum SessionError {
    UnknownPersona(String),
    UnknownModel(String),
    EmptySelection,
    TooManyPersonas { max: usize, requested: usize },
    DuplicatePersona(String),
    Backend(BackendError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::UnknownPersona(message) => write!(f, "{message}"),
            SessionError::UnknownModel(id) => write!(f, "Unknown model '{id}'"),
            SessionError::EmptySelection => write!(f, "Select at least one persona"),
            SessionError::TooManyPersonas { max, requested } => write!(
                f,
                "Too many personas selected ({requested}); the limit is {max}"
            ),
            SessionError::DuplicatePersona(id) => write!(f, "Persona '{id}' selected twice"),
            SessionError::Backend(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SessionError {}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        SessionError::Backend(err)
    }
}

/// Process-wide collaborators shared by every session.
pub struct Services {
    pub config: Arc<Config>,
    pub personas: PersonaRegistry,
    pub providers: ProviderRegistry,
    pub guard: Option<Arc<PromptGuard>>,
    initial_model: ModelSpec,
}

impl Services {
    pub fn new(config: Config, client: reqwest::Client) -> Result<Self, ConfigError> {
        let providers = ProviderRegistry::from_config(&config, client.clone());
        let guard = PromptGuard::from_settings(&config.guard, client)
            .map_err(|reason| ConfigError::Invalid {
                origin: "[guard]".to_string(),
                reason,
            })?
            .map(Arc::new);
        Self::with_providers(config, providers, guard)
    }

    pub fn with_providers(
        config: Config,
        providers: ProviderRegistry,
        guard: Option<Arc<PromptGuard>>,
    ) -> Result<Self, ConfigError> {
        let initial_model = config
            .initial_model()
            .cloned()
            .ok_or_else(|| ConfigError::Invalid {
                origin: "catalog".to_string(),
                reason: "no model to start with".to_string(),
            })?;
        Ok(Self {
            personas: PersonaRegistry::from_config(&config),
            config: Arc::new(config),
            providers,
            guard,
            initial_model,
        })
    }
}

/// One persona's conversation, lockable per turn, with its interrupt.
#[derive(Clone)]
pub struct PersonaSlot {
    pub conversation: Arc<Mutex<ConversationSession>>,
    pub interrupt: TurnInterrupt,
}

#[derive(Clone)]
pub struct PanelSlot {
    pub persona_ids: Vec<String>,
    pub panel: Arc<Mutex<Panel>>,
    pub interrupt: TurnInterrupt,
}

/// Everything that belongs to one user: language, credentials, and the
/// conversations they have opened.
pub struct SessionContext {
    services: Arc<Services>,
    language: Language,
    gate: CredentialGate,
    personas: HashMap<String, PersonaSlot>,
    panel: Option<PanelSlot>,
    backend: Option<Arc<dyn ChatBackend>>,
    created_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(services: Arc<Services>) -> Self {
        let gate = CredentialGate::new(
            services.initial_model.clone(),
            services.config.providers.clone(),
        );
        Self {
            language: services.config.default_language,
            gate,
            personas: HashMap::new(),
            panel: None,
            backend: None,
            created_at: Utc::now(),
            services,
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Applies to the next turn only; existing logs are left as they are.
    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    pub fn gate(&self) -> &CredentialGate {
        &self.gate
    }

    pub fn auth_status(&self) -> &AuthStatus {
        self.gate.status()
    }

    pub fn select_model(&mut self, model_id: &str) -> Result<(), SessionError> {
        let model = self
            .services
            .config
            .find_model(model_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownModel(model_id.to_string()))?;

        if model.provider != self.gate.provider() {
            debug!(from = %self.gate.provider(), to = %model.provider, "provider changed");
            self.backend = None;
        }
        self.gate.set_provider_and_model(model);
        Ok(())
    }

    pub fn set_credential(&mut self, source: CredentialSource, secret: Option<String>) {
        self.gate.set_credential(source, secret);
    }

    /// Backend for the selected provider, resolved once and kept until the
    /// provider changes.
    pub fn backend(&mut self) -> Result<Arc<dyn ChatBackend>, BackendError> {
        let provider = self.gate.provider();
        if let Some(backend) = self.backend.as_ref().filter(|b| b.kind() == provider) {
            return Ok(backend.clone());
        }
        let backend = self.services.providers.get(provider)?;
        self.backend = Some(backend.clone());
        Ok(backend)
    }

    pub fn begin_validation(
        &mut self,
    ) -> Result<(ValidationTicket, Arc<dyn ChatBackend>), SessionError> {
        let backend = self.backend()?;
        Ok((self.gate.begin_validation(), backend))
    }

    pub fn apply_validation(&mut self, ticket: ValidationTicket, outcome: ValidationOutcome) -> bool {
        self.gate.apply_validation(ticket, outcome)
    }

    /// Validate while holding the session, for callers that own it outright.
    pub async fn validate(&mut self) -> Result<&AuthStatus, SessionError> {
        let backend = self.backend()?;
        Ok(self.gate.validate(backend.as_ref()).await)
    }

    /// Snapshot of what a turn needs. Fails unless the gate is authenticated.
    pub fn turn_context(&mut self) -> Result<TurnContext, ChatError> {
        let credential = self.gate.authorized()?;
        let backend = self.backend()?;
        Ok(TurnContext {
            backend,
            credential,
            language: self.language,
            guard: self.services.guard.clone(),
        })
    }

    /// The conversation with `persona_id`, created empty on first use.
    pub fn persona_slot(&mut self, persona_id: &str) -> Result<PersonaSlot, SessionError> {
        let persona = self
            .services
            .personas
            .find(persona_id)
            .map_err(SessionError::UnknownPersona)?
            .clone();

        let slot = self
            .personas
            .entry(persona.id.clone())
            .or_insert_with(|| PersonaSlot {
                conversation: Arc::new(Mutex::new(ConversationSession::new(persona))),
                interrupt: TurnInterrupt::new(),
            });
        Ok(slot.clone())
    }

    /// The panel for `persona_ids`. The same selection keeps its panel; a
    /// different one cancels the old panel and starts fresh.
    pub fn select_panel(&mut self, persona_ids: &[String]) -> Result<PanelSlot, SessionError> {
        let personas = persona_ids
            .iter()
            .map(|id| {
                self.services
                    .personas
                    .find(id)
                    .cloned()
                    .map_err(SessionError::UnknownPersona)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<String> = personas.iter().map(|p| p.id.clone()).collect();

        if let Some(slot) = self.panel.as_ref().filter(|slot| slot.persona_ids == ids) {
            return Ok(slot.clone());
        }

        let config = &self.services.config;
        let panel = Panel::select(personas, config.max_panel_personas, config.panel_retries)?;
        if let Some(old) = self.panel.take() {
            old.interrupt.cancel();
        }

        let slot = PanelSlot {
            persona_ids: ids,
            panel: Arc::new(Mutex::new(panel)),
            interrupt: TurnInterrupt::new(),
        };
        self.panel = Some(slot.clone());
        Ok(slot)
    }

    /// Collect the handles needed for a snapshot without waiting on any
    /// conversation. Resolve the result after releasing the session.
    pub fn snapshot(&self) -> PendingSnapshot {
        let conversations = self
            .services
            .personas
            .list_personas()
            .iter()
            .filter_map(|p| self.personas.get(&p.id))
            .map(|slot| slot.conversation.clone())
            .collect();

        PendingSnapshot {
            created_at: self.created_at,
            language: self.language,
            model: self.gate.model().id.clone(),
            provider: self.gate.provider(),
            credential_source: self.gate.source(),
            auth: self.gate.status().clone(),
            conversations,
            panel: self.panel.as_ref().map(|slot| slot.panel.clone()),
        }
    }
}

pub struct PendingSnapshot {
    created_at: DateTime<Utc>,
    language: Language,
    model: String,
    provider: ProviderKind,
    credential_source: CredentialSource,
    auth: AuthStatus,
    conversations: Vec<Arc<Mutex<ConversationSession>>>,
    panel: Option<Arc<Mutex<Panel>>>,
}

impl PendingSnapshot {
    pub async fn resolve(self) -> SessionSnapshot {
        let mut conversations = Vec::with_capacity(self.conversations.len());
        for conversation in &self.conversations {
            conversations.push(ConversationView::of(&*conversation.lock().await));
        }

        let panel = match &self.panel {
            Some(panel) => Some(
                panel
                    .lock()
                    .await
                    .conversations()
                    .iter()
                    .map(ConversationView::of)
                    .collect(),
            ),
            None => None,
        };

        SessionSnapshot {
            created_at: self.created_at,
            language: self.language,
            model: self.model,
            provider: self.provider,
            credential_source: self.credential_source,
            auth: self.auth,
            conversations,
            panel,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub persona_id: String,
    pub persona_name: String,
    pub messages: Vec<Message>,
}

impl ConversationView {
    pub fn of(conversation: &ConversationSession) -> Self {
        Self {
            persona_id: conversation.persona().id.clone(),
            persona_name: conversation.persona().name.clone(),
            messages: conversation.log().to_vec(),
        }
    }
}

/// Serializable view of a session for the logs page.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub created_at: DateTime<Utc>,
    pub language: Language,
    pub model: String,
    pub provider: ProviderKind,
    pub credential_source: CredentialSource,
    pub auth: AuthStatus,
    pub conversations: Vec<ConversationView>,
    pub panel: Option<Vec<ConversationView>>,
}
