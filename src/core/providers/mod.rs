//! Chat backends and the registry that selects one per provider family.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::ChatMessage;
use crate::core::chat_stream::{format_api_error, FragmentSender};
use crate::core::config::data::{Config, ModelSpec, ProviderKind};

pub mod openai;
pub mod replicate;

pub use openai::OpenAiBackend;
pub use replicate::ReplicateBackend;

/// Everything a backend needs for one turn. Built from a validated
/// credential snapshot, so it never changes while the call runs.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub model: ModelSpec,
    pub secret: String,
    pub messages: Vec<ChatMessage>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Ask the provider whether `model` is reachable with `secret`.
    async fn check_credential(&self, model: &ModelSpec, secret: &str) -> Result<(), BackendError>;

    /// Run one chat completion, reporting partial output through `fragments`
    /// and returning the final text.
    async fn stream_chat(
        &self,
        request: BackendRequest,
        fragments: &FragmentSender,
    ) -> Result<String, BackendError>;
}

#[derive(Debug)]
pub enum BackendError {
    /// The request never got an HTTP answer.
    Transport(String),
    /// The provider answered with a non-success status.
    Status { status: u16, message: String },
    /// The provider answered but the payload made no sense.
    Protocol(String),
    /// No backend is registered for this provider.
    Unsupported(ProviderKind),
}

impl BackendError {
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        BackendError::Status {
            status,
            message: format_api_error(&body),
        }
    }

    /// A definitive refusal from the provider, as opposed to a failure that
    /// might go away on its own.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BackendError::Status { status, .. } if (400..500).contains(status))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(message) => write!(f, "Connection error: {message}"),
            BackendError::Status { status, message } => write!(f, "HTTP {status}: {message}"),
            BackendError::Protocol(message) => write!(f, "{message}"),
            BackendError::Unsupported(kind) => write!(f, "No backend available for {kind}"),
        }
    }
}

impl Error for BackendError {}

/// Backends keyed by provider family.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    backends: HashMap<ProviderKind, Arc<dyn ChatBackend>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config, client: reqwest::Client) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(OpenAiBackend::new(
            client.clone(),
            &config.providers.settings(ProviderKind::OpenAi).base_url,
        )));
        registry.register(Arc::new(ReplicateBackend::new(
            client,
            &config.providers.settings(ProviderKind::Replicate).base_url,
        )));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn ChatBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ChatBackend>, BackendError> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or(BackendError::Unsupported(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_both_families_from_config() {
        let config = Config::builtin().expect("builtin catalog");
        let registry = ProviderRegistry::from_config(&config, reqwest::Client::new());

        for kind in ProviderKind::ALL {
            assert_eq!(registry.get(kind).expect("backend").kind(), kind);
        }
    }

    #[test]
    fn empty_registry_reports_unsupported_provider() {
        let registry = ProviderRegistry::default();
        match registry.get(ProviderKind::Replicate) {
            Err(BackendError::Unsupported(ProviderKind::Replicate)) => {}
            other => panic!("unexpected lookup result: {:?}", other.map(|b| b.kind())),
        }
    }

    #[test]
    fn only_client_errors_count_as_rejections() {
        let unauthorized = BackendError::Status {
            status: 401,
            message: "nope".into(),
        };
        let overloaded = BackendError::Status {
            status: 503,
            message: "later".into(),
        };
        assert!(unauthorized.is_rejection());
        assert!(!overloaded.is_rejection());
        assert!(!BackendError::Transport("reset".into()).is_rejection());
    }
}
