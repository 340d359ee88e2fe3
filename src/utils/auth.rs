//! Authentication utilities for API requests
//!
//! Each provider family expects its key in a different header scheme.

use crate::core::config::data::ProviderKind;

/// Add provider-specific authentication headers to an HTTP request
///
/// - OpenAI: `Authorization: Bearer <key>`
/// - Replicate: `Authorization: Token <key>`
pub fn add_auth_headers(
    request: reqwest::RequestBuilder,
    provider: ProviderKind,
    api_key: &str,
) -> reqwest::RequestBuilder {
    request.header("Authorization", authorization_value(provider, api_key))
}

fn authorization_value(provider: ProviderKind, api_key: &str) -> String {
    match provider {
        ProviderKind::OpenAi => format!("Bearer {api_key}"),
        ProviderKind::Replicate => format!("Token {api_key}"),
    }
}
