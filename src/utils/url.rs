//! URL helpers for provider endpoints
//!
//! Base URLs come from configuration and may or may not carry trailing
//! slashes; endpoint paths are assembled from segments (model ids, owners)
//! that must not introduce doubled separators.

/// Strip trailing slashes from a configured base URL.
///
/// ```
/// use chatosophy::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Append an endpoint path to a base URL with exactly one separator.
///
/// ```
/// use chatosophy::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.replicate.com/v1/", "/predictions"),
///     "https://api.replicate.com/v1/predictions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalize_base_url(base_url), endpoint)
}

/// Build an endpoint from individual path segments, skipping empty ones.
///
/// Segments are trimmed of surrounding slashes so identifiers such as
/// `meta/llama-2-7b-chat` can be passed either whole or split.
pub fn construct_segmented_url(base_url: &str, segments: &[&str]) -> String {
    let path = segments
        .iter()
        .map(|segment| segment.trim_matches('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    construct_api_url(base_url, &path)
}
