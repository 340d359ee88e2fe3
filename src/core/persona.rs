use crate::core::config::data::{Config, Persona};
use crate::core::language::Language;

/// Prompt that opens every one-on-one conversation. It is sent to the model
/// but never shown in the log.
pub const GREETING_PROMPT: &str = "I am your guest. Please present yourself, and greet me. \
Please give me a brief description of your work, and your topics of interest, in the list format.";

/// Instruction appended to the synthesizer context to get the comparison table.
pub const TABLE_PROMPT: &str = "Synthesize all of this in Markdown table format, with the main \
philosophers' views. Just give the Markdown table output, nothing else. Keep it concise, as this \
will be displayed in a table.";

/// Ordered, immutable view over the personas of the loaded catalog.
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    personas: Vec<Persona>,
}

impl PersonaRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            personas: config.personas.clone(),
        }
    }

    pub fn list_personas(&self) -> &[Persona] {
        &self.personas
    }

    /// Look up a persona by id, ignoring case.
    pub fn find(&self, id: &str) -> Result<&Persona, String> {
        self.personas
            .iter()
            .find(|p| p.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| {
                let available_ids: Vec<&str> = self.personas.iter().map(|p| p.id.as_str()).collect();
                format!(
                    "Persona '{}' not found. Available personas: {}",
                    id,
                    available_ids.join(", ")
                )
            })
    }
}

/// System prompt impersonating a philosopher.
pub fn philosopher_template(philosopher: &str, language: Language) -> String {
    format!(
        "From now on, you are not an AI anymore. You are in fact the famous philosopher called \
{philosopher}. You will have a discussion with a user, which needs your philosopher's perspective. \
Your purpose is to enlighten them. Please chat with the user, impersonating {philosopher}. \
Always answer their questions, without asking anything yourself. Do not ask any questions. \
You will strictly only speak in {language}."
    )
}

/// System prompt for the assistant that compares panel answers.
pub fn assistant_template(language: Language) -> String {
    format!(
        "You are an assistant, of whom the purpose will be to summarize some philosophers' \
responses to a user question. You will write a short synthesis on the question topic, opposing \
philosophers' views. You will use markdown syntax and formatting, with numbered multi-level \
headings. The title will consist in the reformulated question. You will strictly only speak in \
{language}."
    )
}

/// Trailing system instruction sent after the user prompt.
pub fn answer_language_instruction(language: Language) -> String {
    format!("Your answer in {language}:")
}
