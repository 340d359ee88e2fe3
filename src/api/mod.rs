//! Wire payloads exchanged with the chat providers.
//!
//! Only the fields the crate reads or writes are modelled; everything else in
//! the provider responses is ignored by serde.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Deserialize)]
pub struct ChatResponseDelta {
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct ChatResponseChoice {
    pub delta: ChatResponseDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatResponseChoice>,
}

#[derive(Serialize)]
pub struct PredictionInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

#[derive(Serialize)]
pub struct PredictionRequest {
    pub version: String,
    pub input: PredictionInput,
    pub stream: bool,
}

#[derive(Deserialize)]
pub struct PredictionUrls {
    pub stream: Option<String>,
}

#[derive(Deserialize)]
pub struct PredictionResponse {
    pub id: String,
    pub urls: PredictionUrls,
}

#[derive(Serialize)]
pub struct GuardRequest<'a> {
    pub input: &'a str,
}

#[derive(Deserialize)]
pub struct GuardResult {
    pub flagged: bool,
}

#[derive(Deserialize)]
pub struct GuardResponse {
    pub results: Vec<GuardResult>,
}
