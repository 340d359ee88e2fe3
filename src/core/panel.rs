use std::collections::HashSet;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::data::Persona;
use crate::core::conversation::{ChatError, ConversationSession, TurnContext};
use crate::core::render::RenderSink;
use crate::core::session::SessionError;
use crate::core::synthesis::{PanelAnswer, Synthesis, Synthesizer};

/// Receives the progress of one panel question.
///
/// Sinks are requested up front, one per persona. `persona_settled` is then
/// called as each persona finishes, in completion order, with the persona's
/// index in the panel.
pub trait PanelObserver: Send {
    fn persona_sink(&mut self, index: usize, persona: &Persona) -> Box<dyn RenderSink>;
    fn persona_settled(&mut self, index: usize, persona: &Persona, outcome: &Result<String, String>);
    fn summary_sink(&mut self) -> Box<dyn RenderSink>;
    fn table_sink(&mut self) -> Box<dyn RenderSink>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaOutcome {
    pub persona: Persona,
    /// Final answer, or the error shown in place of it.
    pub result: Result<String, String>,
}

#[derive(Debug)]
pub struct PanelReport {
    /// In panel order.
    pub outcomes: Vec<PersonaOutcome>,
    /// Absent when no persona answered.
    pub synthesis: Option<Synthesis>,
}

/// The conversations built for one multi-mode selection.
#[derive(Debug, Clone)]
pub struct Panel {
    members: Vec<ConversationSession>,
    retries: u32,
}

impl Panel {
    pub fn select(personas: Vec<Persona>, max_personas: usize, retries: u32) -> Result<Self, SessionError> {
        if personas.is_empty() {
            return Err(SessionError::EmptySelection);
        }
        if personas.len() > max_personas {
            return Err(SessionError::TooManyPersonas {
                max: max_personas,
                requested: personas.len(),
            });
        }
        let mut seen = HashSet::new();
        for persona in &personas {
            if !seen.insert(persona.id.to_lowercase()) {
                return Err(SessionError::DuplicatePersona(persona.id.clone()));
            }
        }

        Ok(Self {
            members: personas.into_iter().map(ConversationSession::tagged).collect(),
            retries,
        })
    }

    pub fn conversations(&self) -> &[ConversationSession] {
        &self.members
    }

    /// Ask every persona the same question, then synthesize the answers.
    pub async fn ask(
        &mut self,
        ctx: &TurnContext,
        question: &str,
        observer: &mut dyn PanelObserver,
        interrupt: &CancellationToken,
    ) -> Result<PanelReport, ChatError> {
        if interrupt.is_cancelled() {
            return Err(ChatError::Superseded);
        }
        let question = question.trim();
        if question.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        if let Some(guard) = &ctx.guard {
            guard.screen(question).await?;
        }

        let member_ctx = TurnContext {
            guard: None,
            ..ctx.clone()
        };
        let retries = self.retries;
        let count = self.members.len();
        info!(personas = count, "panel question dispatched");

        let mut pending = FuturesUnordered::new();
        for (index, member) in self.members.iter_mut().enumerate() {
            let sink = observer.persona_sink(index, member.persona());
            let member_ctx = &member_ctx;
            pending.push(async move {
                let result = ask_member(member, member_ctx, question, sink, retries, interrupt).await;
                (index, member.persona().clone(), result)
            });
        }

        let mut outcomes: Vec<Option<PersonaOutcome>> = vec![None; count];
        while let Some((index, persona, result)) = pending.next().await {
            let result = result.map_err(|err| err.to_string());
            if let Err(reason) = &result {
                warn!(persona = %persona.id, %reason, "panel member failed");
            }
            observer.persona_settled(index, &persona, &result);
            outcomes[index] = Some(PersonaOutcome { persona, result });
        }
        drop(pending);

        if interrupt.is_cancelled() {
            return Err(ChatError::Superseded);
        }

        let outcomes: Vec<PersonaOutcome> = outcomes.into_iter().flatten().collect();
        let answers: Vec<PanelAnswer> = outcomes
            .iter()
            .filter_map(|outcome| {
                outcome.result.as_ref().ok().map(|text| PanelAnswer {
                    persona_name: outcome.persona.name.clone(),
                    text: text.clone(),
                })
            })
            .collect();

        let synthesis = if answers.is_empty() {
            None
        } else {
            let mut summary_sink = observer.summary_sink();
            let mut table_sink = observer.table_sink();
            let synthesizer = Synthesizer::new(ctx.backend.clone(), ctx.credential.clone(), ctx.language);
            Some(
                synthesizer
                    .synthesize(
                        question,
                        &answers,
                        summary_sink.as_mut(),
                        table_sink.as_mut(),
                        interrupt,
                    )
                    .await,
            )
        };

        Ok(PanelReport {
            outcomes,
            synthesis,
        })
    }
}

async fn ask_member(
    member: &mut ConversationSession,
    ctx: &TurnContext,
    question: &str,
    mut sink: Box<dyn RenderSink>,
    retries: u32,
    interrupt: &CancellationToken,
) -> Result<String, ChatError> {
    let mut result = member.send(ctx, question, sink.as_mut(), interrupt).await;
    let mut attempt = 0;
    while attempt < retries && matches!(result, Err(ChatError::Backend(_))) {
        attempt += 1;
        warn!(persona = %member.persona().id, attempt, "retrying panel member");
        result = member.retry_last(ctx, sink.as_mut(), interrupt).await;
    }
    result
}
