use async_trait::async_trait;
use tracing::debug;

use crate::api::{ChatMessage, PredictionInput, PredictionRequest, PredictionResponse};
use crate::core::chat_stream::{for_each_line, format_api_error, sse_field, FragmentSender, LineControl};
use crate::core::config::data::{ModelSpec, ProviderKind};
use crate::core::providers::{BackendError, BackendRequest, ChatBackend};
use crate::utils::auth::add_auth_headers;
use crate::utils::url::{construct_api_url, construct_segmented_url};

/// Inference hosting addressed by owner, model name and version. Models are
/// completion-style, so the chat is flattened into a single transcript.
pub struct ReplicateBackend {
    client: reqwest::Client,
    base_url: String,
}

impl ReplicateBackend {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }

    async fn create_prediction(
        &self,
        model: &ModelSpec,
        secret: &str,
        prompt: String,
    ) -> Result<PredictionResponse, BackendError> {
        let version = model.version.clone().ok_or_else(|| {
            BackendError::Protocol(format!("Model '{}' has no version configured", model.id))
        })?;

        let body = PredictionRequest {
            version,
            input: PredictionInput {
                prompt,
                max_length: model.max_length,
            },
            stream: true,
        };

        let url = construct_api_url(&self.base_url, "predictions");
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        let response = add_auth_headers(request, self.kind(), secret)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        response
            .json::<PredictionResponse>()
            .await
            .map_err(|e| BackendError::Protocol(format!("Unexpected prediction payload: {e}")))
    }
}

#[async_trait]
impl ChatBackend for ReplicateBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Replicate
    }

    async fn check_credential(&self, model: &ModelSpec, secret: &str) -> Result<(), BackendError> {
        let owner = model.owner.as_deref().unwrap_or_default();
        let url = construct_segmented_url(&self.base_url, &["models", owner, &model.id]);
        let request = add_auth_headers(self.client.get(url), self.kind(), secret);

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::from_response(response).await)
        }
    }

    async fn stream_chat(
        &self,
        request: BackendRequest,
        fragments: &FragmentSender,
    ) -> Result<String, BackendError> {
        let prompt = flatten_transcript(&request.messages);
        let prediction = self
            .create_prediction(&request.model, &request.secret, prompt)
            .await?;
        debug!(prediction = %prediction.id, "replicate prediction created");

        let stream_url = prediction.urls.stream.ok_or_else(|| {
            BackendError::Protocol("Prediction did not return a stream URL".to_string())
        })?;

        let stream_request = self
            .client
            .get(stream_url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-store");
        let response = add_auth_headers(stream_request, self.kind(), &request.secret)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        read_prediction_stream(response, fragments).await
    }
}

/// Concatenate `output` events until `done`, trimming the surrounding
/// whitespace the models emit.
async fn read_prediction_stream(
    response: reqwest::Response,
    fragments: &FragmentSender,
) -> Result<String, BackendError> {
    let mut events = EventAssembler::default();
    let mut output = String::new();
    for_each_line(response, |line| match events.feed(line) {
        Some(event) => handle_event(event, &mut output, fragments),
        None => Ok(LineControl::Continue),
    })
    .await?;

    Ok(output.trim().to_string())
}

/// Render chat messages as `System: ...\nHuman: ...\nAI: ...`.
pub fn flatten_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| {
            let speaker = match message.role.as_str() {
                "system" => "System",
                "assistant" => "AI",
                "user" => "Human",
                other => other,
            };
            format!("{speaker}: {}", message.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, PartialEq, Eq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Collects `event:` and `data:` lines until the blank line ending an event.
#[derive(Default)]
struct EventAssembler {
    name: Option<String>,
    data: Vec<String>,
}

impl EventAssembler {
    fn feed(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.name.is_none() && self.data.is_empty() {
                return None;
            }
            let name = self.name.take().unwrap_or_else(|| "message".to_string());
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseEvent { name, data });
        }

        if let Some(name) = sse_field(line, "event") {
            self.name = Some(name.to_string());
        } else if let Some(data) = sse_field(line, "data") {
            self.data.push(data.to_string());
        }
        None
    }
}

fn handle_event(
    event: SseEvent,
    output: &mut String,
    fragments: &FragmentSender,
) -> Result<LineControl, BackendError> {
    match event.name.as_str() {
        "output" => {
            output.push_str(&event.data);
            fragments.send(&event.data);
            Ok(LineControl::Continue)
        }
        "error" => Err(BackendError::Protocol(format_api_error(&event.data))),
        "done" => Ok(LineControl::Stop),
        _ => Ok(LineControl::Continue),
    }
}
