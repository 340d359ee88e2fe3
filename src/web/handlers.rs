use std::path::Path as FsPath;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response, Sse};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::core::config::data::{Persona, ProviderKind};
use crate::core::conversation::{ChatError, TurnContext};
use crate::core::credentials::{AuthStatus, CredentialSource};
use crate::core::language::Language;
use crate::core::session::{ConversationView, PanelSlot, PersonaSlot, SessionSnapshot};
use crate::web::error::ApiError;
use crate::web::events::{
    sse_response, ChannelObserver, ChannelSink, EventSender, EventStream, Target, WireEvent,
};
use crate::web::state::{AppState, SharedSession};

const INDEX_HTML: &str = include_str!("index.html");

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn list_personas(State(state): State<AppState>) -> Json<Vec<Persona>> {
    Json(state.services.personas.list_personas().to_vec())
}

/// The persona's avatar image, read from the configured assets directory.
pub async fn persona_avatar(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Result<Response, ApiError> {
    let persona = state
        .services
        .personas
        .find(&persona_id)
        .map_err(ApiError::not_found)?;
    let path = state.services.config.server.asset_path(&persona.avatar);
    let bytes = tokio::fs::read(&path).await.map_err(|err| {
        debug!(path = %path.display(), error = %err, "avatar not readable");
        ApiError::not_found(format!("No avatar for '{}'", persona.id))
    })?;
    Ok(([(header::CONTENT_TYPE, image_content_type(&path))], bytes).into_response())
}

fn image_content_type(path: &FsPath) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub label: String,
    pub provider: ProviderKind,
    pub key_help_url: &'static str,
}

pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    let models = state
        .services
        .config
        .models
        .iter()
        .map(|model| ModelEntry {
            id: model.id.clone(),
            label: model.label().to_string(),
            provider: model.provider,
            key_help_url: model.provider.key_help_url(),
        })
        .collect();
    Json(models)
}

pub async fn list_languages() -> Json<Vec<Language>> {
    Json(Language::ALL.to_vec())
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub id: Uuid,
}

pub async fn create_session(State(state): State<AppState>) -> Json<SessionCreated> {
    Json(SessionCreated {
        id: state.create_session().await,
    })
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = state.session(id).await?;
    let pending = session.lock().await.snapshot();
    Ok(Json(pending.resolve().await))
}

#[derive(Debug, Deserialize)]
pub struct LanguageBody {
    pub language: String,
}

pub async fn set_language(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<LanguageBody>,
) -> Result<Json<Language>, ApiError> {
    let language: Language = body.language.parse().map_err(ApiError::bad_request)?;
    let session = state.session(id).await?;
    session.lock().await.set_language(language);
    Ok(Json(language))
}

#[derive(Debug, Serialize)]
pub struct AuthReport {
    pub status: AuthStatus,
    pub model: String,
    pub provider: ProviderKind,
    /// False when a newer change made this result irrelevant.
    pub applied: bool,
}

#[derive(Debug, Deserialize)]
pub struct ModelBody {
    pub model: String,
}

/// Switch model, and with it possibly the provider, then validate the
/// credential against the new selection.
pub async fn set_model(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ModelBody>,
) -> Result<Json<AuthReport>, ApiError> {
    let session = state.session(id).await?;
    session.lock().await.select_model(&body.model)?;
    revalidate(&session).await.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct CredentialBody {
    pub source: CredentialSource,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Store the credential choice and validate it.
pub async fn set_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CredentialBody>,
) -> Result<Json<AuthReport>, ApiError> {
    let session = state.session(id).await?;
    session
        .lock()
        .await
        .set_credential(body.source, body.api_key);
    revalidate(&session).await.map(Json)
}

/// Check the session's current model and key with the provider. The session
/// is released while the provider is consulted.
async fn revalidate(session: &SharedSession) -> Result<AuthReport, ApiError> {
    let (ticket, backend) = session.lock().await.begin_validation()?;

    let outcome = ticket.check(backend.as_ref()).await;

    let mut session = session.lock().await;
    let applied = session.apply_validation(ticket, outcome);
    Ok(AuthReport {
        status: session.auth_status().clone(),
        model: session.gate().model().id.clone(),
        provider: session.gate().provider(),
        applied,
    })
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path((id, persona)): Path<(Uuid, String)>,
) -> Result<Json<ConversationView>, ApiError> {
    let session = state.session(id).await?;
    let slot = session.lock().await.persona_slot(&persona)?;
    let conversation = slot.conversation.lock().await;
    Ok(Json(ConversationView::of(&conversation)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleTurn {
    Open,
    Send,
    Retry,
}

/// Resolve the persona conversation and a turn context, failing fast on
/// anything that would stop the turn from starting.
async fn prepare_single(
    state: &AppState,
    id: Uuid,
    persona: &str,
) -> Result<(PersonaSlot, TurnContext), ApiError> {
    let session = state.session(id).await?;
    let mut session = session.lock().await;
    let slot = session.persona_slot(persona)?;
    let ctx = session.turn_context()?;
    Ok((slot, ctx))
}

fn stream_single(
    slot: PersonaSlot,
    ctx: TurnContext,
    kind: SingleTurn,
    prompt: String,
) -> Sse<EventStream> {
    let token = slot.interrupt.supersede();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_single_turn(slot, ctx, kind, prompt, tx, token.clone()));
    sse_response(rx, token)
}

pub async fn open_conversation(
    State(state): State<AppState>,
    Path((id, persona)): Path<(Uuid, String)>,
) -> Result<Sse<EventStream>, ApiError> {
    let (slot, ctx) = prepare_single(&state, id, &persona).await?;
    Ok(stream_single(slot, ctx, SingleTurn::Open, String::new()))
}

#[derive(Debug, Deserialize)]
pub struct PromptBody {
    pub prompt: String,
}

pub async fn send_message(
    State(state): State<AppState>,
    Path((id, persona)): Path<(Uuid, String)>,
    Json(body): Json<PromptBody>,
) -> Result<Sse<EventStream>, ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ChatError::EmptyPrompt.into());
    }
    let (slot, ctx) = prepare_single(&state, id, &persona).await?;
    Ok(stream_single(slot, ctx, SingleTurn::Send, body.prompt))
}

pub async fn retry_message(
    State(state): State<AppState>,
    Path((id, persona)): Path<(Uuid, String)>,
) -> Result<Sse<EventStream>, ApiError> {
    let (slot, ctx) = prepare_single(&state, id, &persona).await?;
    Ok(stream_single(slot, ctx, SingleTurn::Retry, String::new()))
}

/// Run one single-mode turn and report it on `tx`, ending with `done`.
pub async fn run_single_turn(
    slot: PersonaSlot,
    ctx: TurnContext,
    kind: SingleTurn,
    prompt: String,
    tx: EventSender,
    token: CancellationToken,
) {
    let mut conversation = slot.conversation.lock().await;
    let target = Target::Persona {
        index: 0,
        id: conversation.persona().id.clone(),
    };
    let mut sink = ChannelSink::new(tx.clone(), target, token.clone());

    let result = match kind {
        SingleTurn::Open => conversation.open(&ctx, &mut sink, &token).await.map(|_| ()),
        SingleTurn::Send => conversation
            .send(&ctx, &prompt, &mut sink, &token)
            .await
            .map(|_| ()),
        SingleTurn::Retry => conversation
            .retry_last(&ctx, &mut sink, &token)
            .await
            .map(|_| ()),
    };
    finish(&tx, result);
}

fn finish(tx: &EventSender, result: Result<(), ChatError>) {
    match result {
        Ok(()) => {}
        Err(ChatError::Superseded) => debug!("turn superseded"),
        // Already reported to the pane by the sink.
        Err(ChatError::Backend(_)) => {}
        Err(err) => {
            let _ = tx.send(WireEvent::Failed {
                message: err.to_string(),
            });
        }
    }
    let _ = tx.send(WireEvent::Done {});
}

#[derive(Debug, Deserialize)]
pub struct AskBody {
    pub question: String,
    pub personas: Vec<String>,
}

pub async fn ask_panel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AskBody>,
) -> Result<Sse<EventStream>, ApiError> {
    if body.question.trim().is_empty() {
        return Err(ChatError::EmptyPrompt.into());
    }
    let (slot, ctx) = {
        let session = state.session(id).await?;
        let mut session = session.lock().await;
        let slot = session.select_panel(&body.personas)?;
        let ctx = session.turn_context()?;
        (slot, ctx)
    };

    let token = slot.interrupt.supersede();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_panel_turn(slot, ctx, body.question, tx, token.clone()));
    Ok(sse_response(rx, token))
}

/// Run one multi-mode question and report it on `tx`, ending with `done`.
pub async fn run_panel_turn(
    slot: PanelSlot,
    ctx: TurnContext,
    question: String,
    tx: EventSender,
    token: CancellationToken,
) {
    let mut panel = slot.panel.lock().await;
    let mut observer = ChannelObserver::new(tx.clone(), token.clone());

    let result = panel.ask(&ctx, &question, &mut observer, &token).await;
    let result = result.map(|report| {
        let table = report
            .synthesis
            .and_then(|synthesis| synthesis.table.ok())
            .and_then(|answer| answer.table);
        if let Some(table) = table {
            let _ = tx.send(WireEvent::Table { table });
        }
    });
    finish(&tx, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::data::Config;
    use crate::core::providers::ProviderRegistry;
    use crate::core::session::Services;
    use crate::utils::test_utils::{test_config, ScriptedBackend, Step, Verdict};
    use axum::http::StatusCode;
    use std::sync::Arc;

    fn app_with(backend: Arc<ScriptedBackend>, config: Config) -> AppState {
        let mut providers = ProviderRegistry::default();
        providers.register(backend);
        let services = Services::with_providers(config, providers, None).expect("services");
        AppState::new(Arc::new(services))
    }

    async fn authenticated_session(state: &AppState) -> Uuid {
        let Json(created) = create_session(State(state.clone())).await;
        let Json(report) = set_credential(
            State(state.clone()),
            Path(created.id),
            Json(CredentialBody {
                source: CredentialSource::UserSupplied,
                api_key: Some("sk-test".into()),
            }),
        )
        .await
        .expect("credential");
        assert_eq!(report.status, AuthStatus::Authenticated);
        assert!(report.applied);
        created.id
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<WireEvent>) -> Vec<WireEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, WireEvent::Done {});
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn catalog_endpoints_list_configured_entries() {
        let state = app_with(ScriptedBackend::new(vec![]), test_config());

        let Json(personas) = list_personas(State(state.clone())).await;
        assert_eq!(personas[0].id, "plato");
        let Json(models) = list_models(State(state.clone())).await;
        assert!(models.iter().any(|m| m.provider == ProviderKind::Replicate));
        let Json(languages) = list_languages().await;
        assert_eq!(languages.len(), 4);
    }

    #[tokio::test]
    async fn avatars_are_served_from_the_assets_dir() {
        let assets = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(assets.path().join("avatars")).unwrap();
        std::fs::write(assets.path().join("avatars/plato.jpeg"), b"jpeg bytes").unwrap();

        let mut config = test_config();
        config.server.assets_dir = Some(assets.path().to_path_buf());
        let state = app_with(ScriptedBackend::new(vec![]), config);

        let response = persona_avatar(State(state.clone()), Path("plato".to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");

        let missing = persona_avatar(State(state.clone()), Path("kant".to_string()))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        let unknown = persona_avatar(State(state), Path("zeno".to_string()))
            .await
            .unwrap_err();
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = app_with(ScriptedBackend::new(vec![]), test_config());
        let err = get_session(State(state), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chatting_before_authentication_is_refused() {
        let state = app_with(ScriptedBackend::new(vec![]), test_config());
        let Json(created) = create_session(State(state.clone())).await;

        let err = send_message(
            State(state),
            Path((created.id, "plato".to_string())),
            Json(PromptBody {
                prompt: "Hello".into(),
            }),
        )
        .await
        .err()
        .expect("refused");
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_language_is_a_bad_request() {
        let state = app_with(ScriptedBackend::new(vec![]), test_config());
        let Json(created) = create_session(State(state.clone())).await;

        let err = set_language(
            State(state.clone()),
            Path(created.id),
            Json(LanguageBody {
                language: "Klingon".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let Json(language) = set_language(
            State(state),
            Path(created.id),
            Json(LanguageBody {
                language: "german".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(language, Language::German);
    }

    fn app_with_both_providers(replicate: Arc<ScriptedBackend>) -> AppState {
        let mut providers = ProviderRegistry::default();
        providers.register(ScriptedBackend::new(vec![]));
        providers.register(replicate);
        let services = Services::with_providers(test_config(), providers, None).expect("services");
        AppState::new(Arc::new(services))
    }

    #[tokio::test]
    async fn model_switch_validates_against_the_new_provider() {
        let replicate = ScriptedBackend::for_provider(ProviderKind::Replicate, vec![]);
        let state = app_with_both_providers(replicate.clone());
        let id = authenticated_session(&state).await;

        let Json(report) = set_model(
            State(state.clone()),
            Path(id),
            Json(ModelBody {
                model: "llama-2-7b-chat".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(report.status, AuthStatus::Authenticated);
        assert_eq!(report.provider, ProviderKind::Replicate);
        assert!(report.applied);
        assert_eq!(replicate.credential_checks(), 1);
    }

    #[tokio::test]
    async fn model_switch_to_a_refusing_provider_is_rejected() {
        let replicate = ScriptedBackend::for_provider(ProviderKind::Replicate, vec![]);
        replicate.set_verdict(Verdict::Reject);
        let state = app_with_both_providers(replicate);
        let id = authenticated_session(&state).await;

        let Json(report) = set_model(
            State(state.clone()),
            Path(id),
            Json(ModelBody {
                model: "llama-2-7b-chat".into(),
            }),
        )
        .await
        .unwrap();
        assert!(matches!(report.status, AuthStatus::Rejected(_)));

        let err = send_message(
            State(state),
            Path((id, "plato".to_string())),
            Json(PromptBody {
                prompt: "Hello".into(),
            }),
        )
        .await
        .err()
        .expect("refused");
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn send_without_open_greets_first() {
        let backend = ScriptedBackend::new(vec![Step::reply("Greetings."), Step::reply("Yes.")]);
        let state = app_with(backend, test_config());
        let id = authenticated_session(&state).await;

        let (slot, ctx) = prepare_single(&state, id, "socrates").await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = slot.interrupt.supersede();
        run_single_turn(slot, ctx, SingleTurn::Send, "Is it?".into(), tx, token).await;
        drain(rx).await;

        let Json(view) = get_messages(State(state), Path((id, "socrates".to_string())))
            .await
            .unwrap();
        let contents: Vec<&str> = view.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Greetings.", "Is it?", "Yes."]);
    }

    #[tokio::test]
    async fn single_turn_streams_fragments_then_final() {
        let backend = ScriptedBackend::new(vec![
            Step::reply("Greetings."),
            Step::reply_in_chunks(&["Virtue ", "is knowledge"], "Virtue is knowledge."),
        ]);
        let state = app_with(backend, test_config());
        let id = authenticated_session(&state).await;

        for (kind, prompt) in [(SingleTurn::Open, ""), (SingleTurn::Send, "What is virtue?")] {
            let (slot, ctx) = prepare_single(&state, id, "plato").await.unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let token = slot.interrupt.supersede();
            run_single_turn(slot, ctx, kind, prompt.to_string(), tx, token).await;
            let events = drain(rx).await;
            assert!(matches!(events.last(), Some(WireEvent::Done {})));
            assert!(events.iter().any(|e| matches!(e, WireEvent::Final { .. })));
        }

        let Json(view) = get_messages(State(state.clone()), Path((id, "plato".to_string())))
            .await
            .unwrap();
        let contents: Vec<&str> = view.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Greetings.", "What is virtue?", "Virtue is knowledge."]);

        let Json(snapshot) = get_session(State(state), Path(id)).await.unwrap();
        assert_eq!(snapshot.conversations.len(), 1);
    }

    #[tokio::test]
    async fn backend_failure_is_reported_in_the_pane() {
        let state = app_with(ScriptedBackend::new(vec![Step::fail("overloaded")]), test_config());
        let id = authenticated_session(&state).await;

        let (slot, ctx) = prepare_single(&state, id, "kant").await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = slot.interrupt.supersede();
        run_single_turn(slot, ctx, SingleTurn::Send, "Why?".into(), tx, token).await;

        let events = drain(rx).await;
        assert!(matches!(&events[0], WireEvent::Error { message, .. } if message.contains("overloaded")));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn panel_turn_emits_settled_events_and_table() {
        let backend = ScriptedBackend::with_responder(|request| {
            let system = crate::utils::test_utils::system_prompt(request);
            if system.starts_with("You are an assistant") {
                if crate::utils::test_utils::last_user_content(request)
                    == crate::core::persona::TABLE_PROMPT
                {
                    Step::reply("| A | B |\n|---|---|\n| 1 | 2 |\n")
                } else {
                    Step::reply("Summary")
                }
            } else {
                Step::reply("An answer.")
            }
        });
        let state = app_with(backend, test_config());
        let id = authenticated_session(&state).await;

        let session = state.session(id).await.unwrap();
        let (slot, ctx) = {
            let mut session = session.lock().await;
            let ids = vec!["plato".to_string(), "nietzsche".to_string()];
            (session.select_panel(&ids).unwrap(), session.turn_context().unwrap())
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let token = slot.interrupt.supersede();
        run_panel_turn(slot, ctx, "Is God dead?".into(), tx, token).await;

        let events = drain(rx).await;
        let settled = events
            .iter()
            .filter(|e| matches!(e, WireEvent::Settled { ok: true, .. }))
            .count();
        assert_eq!(settled, 2);
        assert!(events.iter().any(|e| matches!(e, WireEvent::Table { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            WireEvent::Final { target: Target::Summary, text } if text == "Summary"
        )));
    }
}
