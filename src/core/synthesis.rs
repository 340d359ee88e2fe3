//! Cross-persona synthesis of a panel's answers: one prose summary and one
//! comparison table, requested independently.

use std::sync::Arc;

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::conversation::{chat_message, run_request, ChatError};
use crate::core::credentials::ValidatedCredential;
use crate::core::language::Language;
use crate::core::persona::{answer_language_instruction, assistant_template, TABLE_PROMPT};
use crate::core::providers::{BackendRequest, ChatBackend};
use crate::core::render::RenderSink;

/// One persona's contribution to the synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelAnswer {
    pub persona_name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Table answer as returned by the model, plus its structured form when the
/// markdown could be read as a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableAnswer {
    pub raw: String,
    pub table: Option<SummaryTable>,
}

#[derive(Debug)]
pub struct Synthesis {
    pub summary: Result<String, ChatError>,
    pub table: Result<TableAnswer, ChatError>,
}

/// `Question: ...` followed by one tab-indented block per answer, with the
/// answers' own line breaks flattened to spaces.
pub fn synthesis_input(question: &str, answers: &[PanelAnswer]) -> String {
    let mut input = format!("Question: {question}\n\n");
    let blocks: Vec<String> = answers
        .iter()
        .map(|answer| {
            format!("\t{}'s response: {}", answer.persona_name, answer.text).replace('\n', " ")
        })
        .collect();
    input.push_str(&blocks.join("\n\n"));
    input
}

pub struct Synthesizer {
    backend: Arc<dyn ChatBackend>,
    credential: ValidatedCredential,
    language: Language,
}

impl Synthesizer {
    pub fn new(backend: Arc<dyn ChatBackend>, credential: ValidatedCredential, language: Language) -> Self {
        Self {
            backend,
            credential,
            language,
        }
    }

    /// Run the summary and table requests concurrently.
    pub async fn synthesize(
        &self,
        question: &str,
        answers: &[PanelAnswer],
        summary_sink: &mut dyn RenderSink,
        table_sink: &mut dyn RenderSink,
        interrupt: &CancellationToken,
    ) -> Synthesis {
        let input = synthesis_input(question, answers);
        debug!(answers = answers.len(), "synthesizing panel answers");

        let summary_request = self.request(vec![chat_message("user", &input)]);
        let table_request = self.request(vec![
            chat_message("user", &input),
            chat_message("user", TABLE_PROMPT),
        ]);

        let (summary, table_raw) = tokio::join!(
            run_request(self.backend.clone(), summary_request, summary_sink, interrupt),
            run_request(self.backend.clone(), table_request, table_sink, interrupt),
        );

        let table = table_raw.map(|raw| {
            let table = parse_markdown_table(&raw);
            if table.is_none() {
                warn!("synthesizer table could not be parsed; keeping raw text");
            }
            TableAnswer { raw, table }
        });

        Synthesis { summary, table }
    }

    fn request(&self, body: Vec<crate::api::ChatMessage>) -> BackendRequest {
        let mut messages = vec![chat_message("system", &assistant_template(self.language))];
        messages.extend(body);
        messages.push(chat_message(
            "system",
            &answer_language_instruction(self.language),
        ));
        BackendRequest {
            model: self.credential.model.clone(),
            secret: self.credential.secret.clone(),
            messages,
        }
    }
}

/// Collects markdown table events into rows of plain-text cells.
#[derive(Default)]
struct TableCollector {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    current_row: Vec<String>,
    current_cell: Option<String>,
    in_header: bool,
}

impl TableCollector {
    fn start_header(&mut self) {
        self.in_header = true;
        self.current_row.clear();
    }

    fn end_header(&mut self) {
        self.in_header = false;
        self.header = std::mem::take(&mut self.current_row);
    }

    fn start_row(&mut self) {
        self.current_row.clear();
    }

    fn end_row(&mut self) {
        if !self.current_row.is_empty() {
            self.rows.push(std::mem::take(&mut self.current_row));
        }
    }

    fn start_cell(&mut self) {
        self.current_cell = Some(String::new());
    }

    fn end_cell(&mut self) {
        if let Some(cell) = self.current_cell.take() {
            self.current_row.push(cell.trim().to_string());
        }
    }

    fn add_text(&mut self, text: &str) {
        if let Some(cell) = self.current_cell.as_mut() {
            cell.push_str(text);
        }
    }

    fn finish(self) -> Option<SummaryTable> {
        if self.header.is_empty() {
            return None;
        }
        Some(SummaryTable {
            headers: self.header,
            rows: self.rows,
        })
    }
}

/// Parse the first markdown table in `text`.
pub fn parse_markdown_table(text: &str) -> Option<SummaryTable> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);

    let mut collector: Option<TableCollector> = None;
    for event in Parser::new_ext(text, options) {
        match event {
            Event::Start(Tag::Table(_)) => collector = Some(TableCollector::default()),
            Event::End(TagEnd::Table) => break,
            _ => {}
        }
        let Some(table) = collector.as_mut() else {
            continue;
        };
        match event {
            Event::Start(Tag::TableHead) => table.start_header(),
            Event::End(TagEnd::TableHead) => table.end_header(),
            Event::Start(Tag::TableRow) => table.start_row(),
            Event::End(TagEnd::TableRow) => table.end_row(),
            Event::Start(Tag::TableCell) => table.start_cell(),
            Event::End(TagEnd::TableCell) => table.end_cell(),
            Event::Text(text) | Event::Code(text) => table.add_text(&text),
            Event::SoftBreak | Event::HardBreak => table.add_text(" "),
            _ => {}
        }
    }

    collector.and_then(TableCollector::finish)
}
