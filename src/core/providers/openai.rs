use async_trait::async_trait;
use tracing::debug;

use crate::api::{ChatRequest, ChatResponse};
use crate::core::chat_stream::{for_each_line, format_api_error, sse_field, FragmentSender, LineControl};
use crate::core::config::data::{ModelSpec, ProviderKind};
use crate::core::providers::{BackendError, BackendRequest, ChatBackend};
use crate::utils::auth::add_auth_headers;
use crate::utils::url::{construct_api_url, construct_segmented_url};

/// Chat-completions API addressed by model name alone.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiBackend {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn check_credential(&self, model: &ModelSpec, secret: &str) -> Result<(), BackendError> {
        let url = construct_segmented_url(&self.base_url, &["models", &model.id]);
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
        let BackendRequest {
            model,
            secret,
            messages,
        } = request;

        let body = ChatRequest {
            model: model.id,
            messages,
            stream: true,
        };

        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        let http_request = self
            .client
            .post(chat_url)
            .header("Content-Type", "application/json");
        let http_request = add_auth_headers(http_request, self.kind(), &secret);

        let response = http_request.json(&body).send().await?;
        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        read_completion(response, fragments).await
    }
}

/// Concatenate the deltas of a completion stream. The stream must end with
/// `[DONE]`.
async fn read_completion(
    response: reqwest::Response,
    fragments: &FragmentSender,
) -> Result<String, BackendError> {
    let mut final_text = String::new();
    for_each_line(response, |line| {
        handle_stream_line(line.trim(), &mut final_text, fragments)
    })
    .await?;

    debug!(chars = final_text.len(), "openai stream finished");
    Ok(final_text)
}

fn handle_stream_line(
    line: &str,
    final_text: &mut String,
    fragments: &FragmentSender,
) -> Result<LineControl, BackendError> {
    let Some(payload) = sse_field(line, "data").map(str::trim_start) else {
        return Ok(LineControl::Continue);
    };

    if payload == "[DONE]" {
        return Ok(LineControl::Stop);
    }
    if payload.trim().is_empty() {
        return Ok(LineControl::Continue);
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if let Some(content) = response
                .choices
                .first()
                .and_then(|choice| choice.delta.content.as_deref())
            {
                final_text.push_str(content);
                fragments.send(content);
            }
            Ok(LineControl::Continue)
        }
        Err(_) => Err(BackendError::Protocol(format_api_error(payload))),
    }
}
