use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::ChatMessage;
use crate::core::chat_stream::{dispatch, StreamMessage};
use crate::core::config::data::Persona;
use crate::core::credentials::ValidatedCredential;
use crate::core::guard::PromptGuard;
use crate::core::language::Language;
use crate::core::message::Message;
use crate::core::persona::{answer_language_instruction, philosopher_template, GREETING_PROMPT};
use crate::core::providers::{BackendError, BackendRequest, ChatBackend};
use crate::core::render::RenderSink;

#[derive(Debug)]
pub enum ChatError {
    /// The credential gate has not accepted the current key.
    NotAuthenticated,
    EmptyPrompt,
    /// The prompt guard flagged the prompt as an injection attempt.
    Flagged,
    /// The prompt guard itself could not be consulted.
    Guard(String),
    /// A newer turn took over before this one finished.
    Superseded,
    NothingToRetry,
    Backend(BackendError),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::NotAuthenticated => {
                write!(f, "Not authenticated: validate an API key before chatting")
            }
            ChatError::EmptyPrompt => write!(f, "Prompt is empty"),
            ChatError::Flagged => write!(
                f,
                "Prompt injection detected. Please rephrase your question."
            ),
            ChatError::Guard(message) => write!(f, "Prompt guard unavailable: {message}"),
            ChatError::Superseded => write!(f, "Turn superseded by a newer prompt"),
            ChatError::NothingToRetry => write!(f, "No unanswered prompt to retry"),
            ChatError::Backend(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ChatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ChatError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackendError> for ChatError {
    fn from(err: BackendError) -> Self {
        ChatError::Backend(err)
    }
}

/// Everything one turn reads from the session, captured up front.
#[derive(Clone)]
pub struct TurnContext {
    pub backend: Arc<dyn ChatBackend>,
    pub credential: ValidatedCredential,
    pub language: Language,
    pub guard: Option<Arc<PromptGuard>>,
}

/// Cancels the in-flight turn of one conversation. Lives outside the
/// conversation's lock so a new prompt can stop a turn that holds it.
#[derive(Clone, Default)]
pub struct TurnInterrupt {
    current: Arc<StdMutex<CancellationToken>>,
}

impl TurnInterrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the running turn, if any, and return the token for the next one.
    pub fn supersede(&self) -> CancellationToken {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        current.cancel();
        *current = CancellationToken::new();
        current.clone()
    }

    pub fn cancel(&self) {
        match self.current.lock() {
            Ok(guard) => guard.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }
}

/// Conversation log between the user and one persona.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    persona: Persona,
    log: Vec<Message>,
    /// Greeting request sent before the first log entry. Part of the model's
    /// context, never shown.
    bootstrap: Option<String>,
    /// Persona id stamped on messages in multi mode.
    tag: Option<String>,
}

impl ConversationSession {
    pub fn new(persona: Persona) -> Self {
        Self {
            persona,
            log: Vec::new(),
            bootstrap: None,
            tag: None,
        }
    }

    /// Conversation that is part of a multi-persona panel.
    pub fn tagged(persona: Persona) -> Self {
        let tag = Some(persona.id.clone());
        Self {
            tag,
            ..Self::new(persona)
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn log(&self) -> &[Message] {
        &self.log
    }

    pub fn has_unanswered_prompt(&self) -> bool {
        self.log.last().is_some_and(Message::is_user)
    }

    /// Greet the user if nothing has been said yet. Returns the greeting, or
    /// `None` when the conversation was already under way.
    pub async fn open(
        &mut self,
        ctx: &TurnContext,
        sink: &mut dyn RenderSink,
        interrupt: &CancellationToken,
    ) -> Result<Option<String>, ChatError> {
        if !self.log.is_empty() {
            return Ok(None);
        }

        let mut messages = vec![self.system_message(ctx.language)];
        messages.push(chat_message("user", GREETING_PROMPT));
        messages.push(chat_message("system", &answer_language_instruction(ctx.language)));

        let greeting = self.run_turn(ctx, messages, sink, interrupt).await?;
        self.bootstrap = Some(GREETING_PROMPT.to_string());
        self.push_response(&greeting);
        info!(persona = %self.persona.id, "conversation opened");
        Ok(Some(greeting))
    }

    /// Answer `prompt`. A one-on-one conversation that has not been greeted
    /// yet (never opened, or its greeting was superseded or failed) greets
    /// first, so the log always starts with the persona.
    pub async fn send(
        &mut self,
        ctx: &TurnContext,
        prompt: &str,
        sink: &mut dyn RenderSink,
        interrupt: &CancellationToken,
    ) -> Result<String, ChatError> {
        if interrupt.is_cancelled() {
            return Err(ChatError::Superseded);
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        if let Some(guard) = &ctx.guard {
            guard.screen(prompt).await?;
        }
        if self.log.is_empty() && self.tag.is_none() {
            self.open(ctx, sink, interrupt).await?;
        }

        self.log
            .push(Message::user(prompt).tagged(self.tag.as_deref()));
        self.answer_pending(ctx, sink, interrupt).await
    }

    /// Dispatch the trailing user message again without re-appending it.
    pub async fn retry_last(
        &mut self,
        ctx: &TurnContext,
        sink: &mut dyn RenderSink,
        interrupt: &CancellationToken,
    ) -> Result<String, ChatError> {
        if !self.has_unanswered_prompt() {
            return Err(ChatError::NothingToRetry);
        }
        debug!(persona = %self.persona.id, "retrying last prompt");
        self.answer_pending(ctx, sink, interrupt).await
    }

    async fn answer_pending(
        &mut self,
        ctx: &TurnContext,
        sink: &mut dyn RenderSink,
        interrupt: &CancellationToken,
    ) -> Result<String, ChatError> {
        let messages = self.build_messages(ctx.language);
        let response = self.run_turn(ctx, messages, sink, interrupt).await?;
        self.push_response(&response);
        Ok(response)
    }

    /// `[system, bootstrap?, history..., user(prompt), system(language)]`,
    /// where the prompt is the trailing user message of the log.
    fn build_messages(&self, language: Language) -> Vec<ChatMessage> {
        let mut messages = vec![self.system_message(language)];
        if let Some(bootstrap) = &self.bootstrap {
            messages.push(chat_message("user", bootstrap));
        }
        messages.extend(
            self.log
                .iter()
                .map(|m| chat_message(m.role.to_api_role(), &m.content)),
        );
        messages.push(chat_message("system", &answer_language_instruction(language)));
        messages
    }

    fn system_message(&self, language: Language) -> ChatMessage {
        chat_message("system", &philosopher_template(&self.persona.name, language))
    }

    fn push_response(&mut self, text: &str) {
        self.log
            .push(Message::persona_response(text).tagged(self.tag.as_deref()));
    }

    async fn run_turn(
        &self,
        ctx: &TurnContext,
        messages: Vec<ChatMessage>,
        sink: &mut dyn RenderSink,
        interrupt: &CancellationToken,
    ) -> Result<String, ChatError> {
        let request = BackendRequest {
            model: ctx.credential.model.clone(),
            secret: ctx.credential.secret.clone(),
            messages,
        };
        run_request(ctx.backend.clone(), request, sink, interrupt).await
    }
}

/// Dispatch one request and pump its events into `sink` until it ends or
/// `interrupt` fires.
pub async fn run_request(
    backend: Arc<dyn ChatBackend>,
    request: BackendRequest,
    sink: &mut dyn RenderSink,
    interrupt: &CancellationToken,
) -> Result<String, ChatError> {
    let mut handle = dispatch(backend, request);

    loop {
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => {
                handle.cancel();
                return Err(ChatError::Superseded);
            }
            message = handle.next() => match message {
                Some(StreamMessage::Chunk(fragment)) => sink.on_fragment(&fragment),
                Some(StreamMessage::Done(text)) => {
                    sink.on_final(&text);
                    return Ok(text);
                }
                Some(StreamMessage::Error(err)) => {
                    sink.on_error(&err.to_string());
                    return Err(ChatError::Backend(err));
                }
                None => {
                    let err = BackendError::Protocol("Stream ended without a result".to_string());
                    sink.on_error(&err.to_string());
                    return Err(ChatError::Backend(err));
                }
            }
        }
    }
}

pub(crate) fn chat_message(role: &str, content: &str) -> ChatMessage {
    ChatMessage {
        role: role.to_string(),
        content: content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::credentials::CredentialSource;
    use crate::core::message::TranscriptRole;
    use crate::core::render::StreamingRender;
    use crate::utils::test_utils::{
        last_user_content, openai_model, system_prompt, test_config, ScriptedBackend, Step,
    };

    fn plato() -> Persona {
        test_config().find_persona("plato").cloned().expect("plato")
    }

    fn context(backend: Arc<ScriptedBackend>, language: Language) -> TurnContext {
        TurnContext {
            backend,
            credential: ValidatedCredential {
                model: openai_model(),
                secret: "sk-test".into(),
                source: CredentialSource::UserSupplied,
            },
            language,
            guard: None,
        }
    }

    fn idle() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn open_greets_once() {
        let backend = ScriptedBackend::new(vec![Step::reply("Greetings, I am Plato.")]);
        let ctx = context(backend.clone(), Language::English);
        let mut conversation = ConversationSession::new(plato());

        let greeting = conversation
            .open(&ctx, &mut StreamingRender::new(), &idle())
            .await
            .unwrap();
        assert_eq!(greeting.as_deref(), Some("Greetings, I am Plato."));
        assert_eq!(conversation.log().len(), 1);
        assert_eq!(conversation.log()[0].role, TranscriptRole::Persona);

        let again = conversation
            .open(&ctx, &mut StreamingRender::new(), &idle())
            .await
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(conversation.log().len(), 1);
        assert_eq!(backend.requests().len(), 1);

        let request = backend.last_request();
        assert_eq!(last_user_content(&request), GREETING_PROMPT);
        assert!(system_prompt(&request).contains("philosopher called Plato"));
    }

    #[tokio::test]
    async fn failed_greeting_leaves_log_empty_for_a_later_open() {
        let backend = ScriptedBackend::new(vec![Step::fail("overloaded"), Step::reply("Hello.")]);
        let ctx = context(backend, Language::English);
        let mut conversation = ConversationSession::new(plato());

        assert!(conversation
            .open(&ctx, &mut StreamingRender::new(), &idle())
            .await
            .is_err());
        assert!(conversation.log().is_empty());

        conversation
            .open(&ctx, &mut StreamingRender::new(), &idle())
            .await
            .unwrap();
        assert_eq!(conversation.log().len(), 1);
    }

    #[tokio::test]
    async fn plato_scenario_builds_history_in_order() {
        let backend = ScriptedBackend::new(vec![
            Step::reply("Greetings, I am Plato."),
            Step::reply_in_chunks(&["Virtue is ", "knowledge."], "Virtue is knowledge."),
        ]);
        let ctx = context(backend.clone(), Language::English);
        let mut conversation = ConversationSession::new(plato());

        conversation
            .open(&ctx, &mut StreamingRender::new(), &idle())
            .await
            .unwrap();
        let mut render = StreamingRender::new();
        let answer = conversation
            .send(&ctx, "What is virtue?", &mut render, &idle())
            .await
            .unwrap();

        assert_eq!(answer, "Virtue is knowledge.");
        assert_eq!(render.displayed(), "Virtue is knowledge.");
        let contents: Vec<&str> = conversation.log().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Greetings, I am Plato.", "What is virtue?", "Virtue is knowledge."]
        );

        let request = backend.last_request();
        let roles: Vec<&str> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user", "system"]);
        assert_eq!(request.messages[1].content, GREETING_PROMPT);
        assert_eq!(request.messages[3].content, "What is virtue?");
        assert_eq!(request.messages[4].content, "Your answer in English:");
    }

    #[tokio::test]
    async fn failed_send_keeps_only_the_user_message() {
        let backend = ScriptedBackend::new(vec![Step::reply("Greetings."), Step::fail("boom")]);
        let ctx = context(backend, Language::English);
        let mut conversation = ConversationSession::new(plato());

        let err = conversation
            .send(&ctx, "Hello?", &mut StreamingRender::new(), &idle())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Backend(_)));
        assert_eq!(conversation.log().len(), 2);
        assert!(conversation.has_unanswered_prompt());
    }

    #[tokio::test]
    async fn retry_answers_the_pending_prompt_without_duplicating_it() {
        let backend = ScriptedBackend::new(vec![
            Step::reply("Greetings."),
            Step::fail("boom"),
            Step::reply("Here I am."),
        ]);
        let ctx = context(backend, Language::English);
        let mut conversation = ConversationSession::new(plato());

        let _ = conversation
            .send(&ctx, "Hello?", &mut StreamingRender::new(), &idle())
            .await;
        let answer = conversation
            .retry_last(&ctx, &mut StreamingRender::new(), &idle())
            .await
            .unwrap();

        assert_eq!(answer, "Here I am.");
        assert_eq!(conversation.log().len(), 3);
        assert!(matches!(
            conversation
                .retry_last(&ctx, &mut StreamingRender::new(), &idle())
                .await,
            Err(ChatError::NothingToRetry)
        ));
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_before_logging() {
        let backend = ScriptedBackend::new(vec![]);
        let ctx = context(backend.clone(), Language::English);
        let mut conversation = ConversationSession::new(plato());

        let err = conversation
            .send(&ctx, "   ", &mut StreamingRender::new(), &idle())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::EmptyPrompt));
        assert!(conversation.log().is_empty());
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn language_switch_does_not_touch_history() {
        let backend = ScriptedBackend::new(vec![
            Step::reply("Greetings."),
            Step::reply("Justice is harmony."),
            Step::reply("Oui."),
        ]);
        let mut conversation = ConversationSession::new(plato());

        let english = context(backend.clone(), Language::English);
        conversation
            .send(&english, "What is justice?", &mut StreamingRender::new(), &idle())
            .await
            .unwrap();
        let before = conversation.log().to_vec();

        let french = context(backend.clone(), Language::French);
        conversation
            .send(&french, "Et la vertu ?", &mut StreamingRender::new(), &idle())
            .await
            .unwrap();

        assert_eq!(&conversation.log()[..3], before.as_slice());
        let request = backend.last_request();
        assert!(system_prompt(&request).ends_with("only speak in French."));
        assert_eq!(request.messages[3].content, "What is justice?");
        assert_eq!(request.messages[4].content, "Justice is harmony.");
        assert_eq!(
            request.messages.last().map(|m| m.content.as_str()),
            Some("Your answer in French:")
        );
    }

    #[tokio::test]
    async fn superseded_turn_appends_no_response() {
        let backend = ScriptedBackend::new(vec![Step::reply("Greetings."), Step::hang()]);
        let ctx = context(backend.clone(), Language::English);
        let mut conversation = ConversationSession::new(plato());
        let interrupt = TurnInterrupt::new();

        let token = interrupt.supersede();
        let mut render = StreamingRender::new();
        let turn = conversation.send(&ctx, "First?", &mut render, &token);
        let stop = async {
            backend.wait_for_requests(2).await;
            interrupt.supersede();
        };
        let (result, _) = tokio::join!(turn, stop);

        assert!(matches!(result, Err(ChatError::Superseded)));
        assert_eq!(conversation.log().len(), 2);
        assert!(conversation.log()[1].is_user());
    }

    #[tokio::test]
    async fn send_greets_first_when_never_opened() {
        let backend = ScriptedBackend::new(vec![
            Step::reply("Greetings, I am Plato."),
            Step::reply("Virtue is knowledge."),
        ]);
        let ctx = context(backend.clone(), Language::English);
        let mut conversation = ConversationSession::new(plato());

        let answer = conversation
            .send(&ctx, "What is virtue?", &mut StreamingRender::new(), &idle())
            .await
            .unwrap();

        assert_eq!(answer, "Virtue is knowledge.");
        let roles: Vec<TranscriptRole> = conversation.log().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![TranscriptRole::Persona, TranscriptRole::User, TranscriptRole::Persona]
        );
        assert_eq!(
            last_user_content(&backend.requests()[0]),
            GREETING_PROMPT
        );
    }

    #[tokio::test]
    async fn send_after_superseded_greeting_greets_before_answering() {
        let backend = ScriptedBackend::new(vec![
            Step::hang(),
            Step::reply("Greetings."),
            Step::reply("Answer."),
        ]);
        let ctx = context(backend.clone(), Language::English);
        let mut conversation = ConversationSession::new(plato());
        let interrupt = TurnInterrupt::new();

        let opening = interrupt.supersede();
        let mut render = StreamingRender::new();
        let open = conversation.open(&ctx, &mut render, &opening);
        let stop = async {
            backend.wait_for_requests(1).await;
            interrupt.supersede()
        };
        let (opened, token) = tokio::join!(open, stop);
        assert!(matches!(opened, Err(ChatError::Superseded)));
        assert!(conversation.log().is_empty());

        conversation
            .send(&ctx, "Hi", &mut StreamingRender::new(), &token)
            .await
            .unwrap();

        let entries: Vec<(TranscriptRole, &str)> = conversation
            .log()
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            entries,
            vec![
                (TranscriptRole::Persona, "Greetings."),
                (TranscriptRole::User, "Hi"),
                (TranscriptRole::Persona, "Answer."),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_token_refuses_to_start() {
        let backend = ScriptedBackend::new(vec![Step::reply("unused")]);
        let ctx = context(backend.clone(), Language::English);
        let mut conversation = ConversationSession::new(plato());
        let token = CancellationToken::new();
        token.cancel();

        let result = conversation
            .send(&ctx, "Hi", &mut StreamingRender::new(), &token)
            .await;
        assert!(matches!(result, Err(ChatError::Superseded)));
        assert!(conversation.log().is_empty());
    }

    #[tokio::test]
    async fn panel_conversations_tag_messages_with_persona() {
        let backend = ScriptedBackend::new(vec![Step::reply("Indeed.")]);
        let ctx = context(backend, Language::English);
        let mut conversation = ConversationSession::tagged(plato());

        conversation
            .send(&ctx, "Is it so?", &mut StreamingRender::new(), &idle())
            .await
            .unwrap();
        assert!(conversation
            .log()
            .iter()
            .all(|m| m.persona.as_deref() == Some("plato")));
    }
}
