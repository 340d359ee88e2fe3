//! Browser surface: a JSON API for catalogs and session settings, and
//! server-sent event streams for every chat turn.

pub mod error;
pub mod events;
pub mod handlers;
pub mod state;

use std::error::Error;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::core::session::Services;
use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/api/personas", get(handlers::list_personas))
        .route("/api/personas/:persona/avatar", get(handlers::persona_avatar))
        .route("/api/models", get(handlers::list_models))
        .route("/api/languages", get(handlers::list_languages))
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions/:id", get(handlers::get_session))
        .route("/api/sessions/:id/language", put(handlers::set_language))
        .route("/api/sessions/:id/model", put(handlers::set_model))
        .route("/api/sessions/:id/credential", put(handlers::set_credential))
        .route(
            "/api/sessions/:id/personas/:persona/messages",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route(
            "/api/sessions/:id/personas/:persona/open",
            post(handlers::open_conversation),
        )
        .route(
            "/api/sessions/:id/personas/:persona/retry",
            post(handlers::retry_message),
        )
        .route("/api/sessions/:id/ask", post(handlers::ask_panel))
        .with_state(state)
}

/// Bind `address` and serve until the process is stopped.
pub async fn serve(services: Arc<Services>, address: &str) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "listening");
    axum::serve(listener, router(AppState::new(services))).await?;
    Ok(())
}
