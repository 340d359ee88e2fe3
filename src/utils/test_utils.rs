use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::ChatMessage;
use crate::core::chat_stream::FragmentSender;
use crate::core::config::data::{Config, ModelSpec, ProviderKind};
use crate::core::providers::{BackendError, BackendRequest, ChatBackend};

/// What the fake backend does for one call.
#[derive(Debug, Clone)]
pub enum Step {
    Reply {
        chunks: Vec<String>,
        final_text: String,
    },
    Fail {
        status: u16,
        message: String,
    },
    /// Never finishes; only cancellation ends the call.
    Hang,
}

impl Step {
    pub fn reply(text: &str) -> Self {
        Step::Reply {
            chunks: vec![text.to_string()],
            final_text: text.to_string(),
        }
    }

    pub fn reply_in_chunks(chunks: &[&str], final_text: &str) -> Self {
        Step::Reply {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            final_text: final_text.to_string(),
        }
    }

    pub fn fail(message: &str) -> Self {
        Step::Fail {
            status: 500,
            message: message.to_string(),
        }
    }

    pub fn hang() -> Self {
        Step::Hang
    }
}

/// Outcome of `check_credential` on the fake backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
    Unreachable,
}

type Responder = Box<dyn Fn(&BackendRequest) -> Step + Send + Sync>;

/// In-process `ChatBackend` that plays back scripted steps and records every
/// request it receives.
pub struct ScriptedBackend {
    kind: ProviderKind,
    script: Mutex<VecDeque<Step>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<BackendRequest>>,
    verdict: Mutex<Verdict>,
    credential_checks: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self::build(ProviderKind::OpenAi, steps.into(), None))
    }

    pub fn for_provider(kind: ProviderKind, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self::build(kind, steps.into(), None))
    }

    /// Decide each reply from the request, for calls whose order is not fixed.
    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&BackendRequest) -> Step + Send + Sync + 'static,
    {
        Arc::new(Self::build(
            ProviderKind::OpenAi,
            VecDeque::new(),
            Some(Box::new(responder)),
        ))
    }

    fn build(kind: ProviderKind, script: VecDeque<Step>, responder: Option<Responder>) -> Self {
        Self {
            kind,
            script: Mutex::new(script),
            responder,
            requests: Mutex::new(Vec::new()),
            verdict: Mutex::new(Verdict::Accept),
            credential_checks: AtomicUsize::new(0),
        }
    }

    pub fn set_verdict(&self, verdict: Verdict) {
        *self.verdict.lock().unwrap() = verdict;
    }

    pub fn credential_checks(&self) -> usize {
        self.credential_checks.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> BackendRequest {
        self.requests().pop().expect("no request recorded")
    }

    pub async fn wait_for_requests(&self, count: usize) {
        for _ in 0..500 {
            if self.requests.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("backend never received {count} requests");
    }

    fn next_step(&self, request: &BackendRequest) -> Step {
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Step::fail("script exhausted"))
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn check_credential(&self, _model: &ModelSpec, _secret: &str) -> Result<(), BackendError> {
        self.credential_checks.fetch_add(1, Ordering::SeqCst);
        let verdict = *self.verdict.lock().unwrap();
        match verdict {
            Verdict::Accept => Ok(()),
            Verdict::Reject => Err(BackendError::Status {
                status: 401,
                message: "API Error: Incorrect API key provided".to_string(),
            }),
            Verdict::Unreachable => Err(BackendError::Transport("connection refused".to_string())),
        }
    }

    async fn stream_chat(
        &self,
        request: BackendRequest,
        fragments: &FragmentSender,
    ) -> Result<String, BackendError> {
        let step = self.next_step(&request);
        self.requests.lock().unwrap().push(request);

        match step {
            Step::Reply { chunks, final_text } => {
                for chunk in &chunks {
                    fragments.send(chunk);
                    tokio::task::yield_now().await;
                }
                Ok(final_text)
            }
            Step::Fail { status, message } => Err(BackendError::Status { status, message }),
            Step::Hang => std::future::pending().await,
        }
    }
}

pub fn openai_model() -> ModelSpec {
    ModelSpec {
        id: "gpt-3.5-turbo".to_string(),
        display_name: None,
        provider: ProviderKind::OpenAi,
        owner: None,
        version: None,
        max_length: None,
    }
}

pub fn request_for(prompt: &str) -> BackendRequest {
    BackendRequest {
        model: openai_model(),
        secret: "test-key".to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }],
    }
}

pub fn test_config() -> Config {
    Config::builtin().expect("builtin catalog")
}

/// Content of the last user-role message of a request.
pub fn last_user_content(request: &BackendRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}

/// Content of the first system message of a request.
pub fn system_prompt(request: &BackendRequest) -> &str {
    request
        .messages
        .first()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .unwrap_or_default()
}
