//! Session-wide credential state.
//!
//! The gate owns which model is selected, which key is used for it, and
//! whether that pair has been accepted by the provider. Validation is split
//! in two halves so the network check can run without holding the session:
//! [`CredentialGate::begin_validation`] hands out a ticket stamped with the
//! current generation, and [`CredentialGate::apply_validation`] drops results
//! whose generation has moved on.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::config::data::{ModelSpec, ProviderKind, ProviderTable};
use crate::core::conversation::ChatError;
use crate::core::providers::ChatBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Key read from the provider's environment variable.
    Default,
    UserSupplied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum AuthStatus {
    Unauthenticated,
    Validating,
    Authenticated,
    Rejected(String),
}

/// Model and key that were accepted together. Dispatches copy this, so a
/// later change to the gate cannot leak into a call already under way.
#[derive(Clone, PartialEq, Eq)]
pub struct ValidatedCredential {
    pub model: ModelSpec,
    pub secret: String,
    pub source: CredentialSource,
}

impl fmt::Debug for ValidatedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedCredential")
            .field("model", &self.model.id)
            .field("secret", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted,
    /// The provider refused the key for this model.
    Rejected(String),
    /// No definitive answer (network failure, server error, missing key).
    Unreachable(String),
}

/// A (provider, model, key) triple that got a definitive answer. Memo
/// entries live as long as the session, in memory only.
#[derive(Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    provider: ProviderKind,
    model: String,
    secret: String,
}

impl fmt::Debug for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoKey")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl MemoKey {
    fn new(model: &ModelSpec, secret: &str) -> Self {
        Self {
            provider: model.provider,
            model: model.id.clone(),
            secret: secret.to_string(),
        }
    }
}

/// One pending validation. Carries everything the check needs so it can run
/// detached from the gate.
pub struct ValidationTicket {
    generation: u64,
    model: ModelSpec,
    secret: Option<String>,
    source: CredentialSource,
    known: Option<ValidationOutcome>,
}

impl ValidationTicket {
    pub async fn check(&self, backend: &dyn ChatBackend) -> ValidationOutcome {
        if let Some(known) = &self.known {
            return known.clone();
        }
        let Some(secret) = self.secret.as_deref() else {
            return ValidationOutcome::Unreachable("No API key available".to_string());
        };

        match backend.check_credential(&self.model, secret).await {
            Ok(()) => ValidationOutcome::Accepted,
            Err(err) if err.is_rejection() => ValidationOutcome::Rejected(format!(
                "{} rejected this key for model '{}'. Get a key at {}\n{}",
                self.model.provider,
                self.model.id,
                self.model.provider.key_help_url(),
                err
            )),
            Err(err) => ValidationOutcome::Unreachable(format!(
                "Could not reach {}: {}",
                self.model.provider, err
            )),
        }
    }
}

#[derive(Debug)]
pub struct CredentialGate {
    model: ModelSpec,
    source: CredentialSource,
    user_secret: Option<String>,
    providers: ProviderTable,
    status: AuthStatus,
    validated: Option<ValidatedCredential>,
    generation: u64,
    memo: HashMap<MemoKey, ValidationOutcome>,
}

impl CredentialGate {
    pub fn new(model: ModelSpec, providers: ProviderTable) -> Self {
        Self {
            model,
            source: CredentialSource::Default,
            user_secret: None,
            providers,
            status: AuthStatus::Unauthenticated,
            validated: None,
            generation: 0,
            memo: HashMap::new(),
        }
    }

    pub fn status(&self) -> &AuthStatus {
        &self.status
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    pub fn provider(&self) -> ProviderKind {
        self.model.provider
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == AuthStatus::Authenticated
    }

    /// Select a model, and with it a provider.
    pub fn set_provider_and_model(&mut self, model: ModelSpec) {
        debug!(model = %model.id, provider = %model.provider, "model selected");
        self.model = model;
        self.reset();
    }

    /// Switch between the default key and a user-supplied one. A `None`
    /// secret keeps the previously entered user key.
    pub fn set_credential(&mut self, source: CredentialSource, secret: Option<String>) {
        self.source = source;
        if let Some(secret) = secret {
            let trimmed = secret.trim();
            self.user_secret = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.status = AuthStatus::Unauthenticated;
        self.validated = None;
    }

    fn resolve_secret(&self) -> Result<String, String> {
        match self.source {
            CredentialSource::UserSupplied => self
                .user_secret
                .clone()
                .ok_or_else(|| "No API key entered".to_string()),
            CredentialSource::Default => {
                let settings = self.providers.settings(self.model.provider);
                let env_name = settings.default_key_env.as_deref().ok_or_else(|| {
                    format!("{} has no default key configured", self.model.provider)
                })?;
                std::env::var(env_name)
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .ok_or_else(|| format!("Default key not available: {env_name} is not set"))
            }
        }
    }

    pub fn begin_validation(&mut self) -> ValidationTicket {
        self.status = AuthStatus::Validating;

        let (secret, known) = match self.resolve_secret() {
            Ok(secret) => {
                let known = self.memo.get(&MemoKey::new(&self.model, &secret)).cloned();
                (Some(secret), known)
            }
            Err(reason) => (None, Some(ValidationOutcome::Unreachable(reason))),
        };

        ValidationTicket {
            generation: self.generation,
            model: self.model.clone(),
            secret,
            source: self.source,
            known,
        }
    }

    /// Record the result of a check. Returns `false` when the ticket is
    /// stale and the result was ignored.
    pub fn apply_validation(&mut self, ticket: ValidationTicket, outcome: ValidationOutcome) -> bool {
        if ticket.generation != self.generation {
            debug!(
                ticket = ticket.generation,
                current = self.generation,
                "ignoring stale validation result"
            );
            return false;
        }

        if let Some(secret) = ticket.secret.as_deref() {
            if matches!(
                outcome,
                ValidationOutcome::Accepted | ValidationOutcome::Rejected(_)
            ) {
                self.memo
                    .insert(MemoKey::new(&ticket.model, secret), outcome.clone());
            }
        }

        match outcome {
            ValidationOutcome::Accepted => {
                info!(model = %ticket.model.id, provider = %ticket.model.provider, "credential accepted");
                self.status = AuthStatus::Authenticated;
                self.validated = ticket.secret.map(|secret| ValidatedCredential {
                    model: ticket.model,
                    secret,
                    source: ticket.source,
                });
            }
            ValidationOutcome::Rejected(reason) | ValidationOutcome::Unreachable(reason) => {
                info!(model = %ticket.model.id, %reason, "credential not accepted");
                self.status = AuthStatus::Rejected(reason);
                self.validated = None;
            }
        }
        true
    }

    /// Validate in one go; for callers that own the gate for the duration.
    pub async fn validate(&mut self, backend: &dyn ChatBackend) -> &AuthStatus {
        let ticket = self.begin_validation();
        let outcome = ticket.check(backend).await;
        self.apply_validation(ticket, outcome);
        &self.status
    }

    pub fn authorized(&self) -> Result<ValidatedCredential, ChatError> {
        match (&self.status, &self.validated) {
            (AuthStatus::Authenticated, Some(credential)) => Ok(credential.clone()),
            _ => Err(ChatError::NotAuthenticated),
        }
    }
}
