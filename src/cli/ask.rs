//! Terminal multi mode: one question, several philosophers, one synthesis

use std::error::Error;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::cli::table::render_table;
use crate::core::config::data::Persona;
use crate::core::panel::{PanelObserver, PanelReport};
use crate::core::render::{NullSink, RenderSink};
use crate::core::session::SessionContext;

const MAX_CELL_WIDTH: usize = 40;

type SharedOut = Arc<Mutex<Box<dyn Write + Send>>>;

/// Collects one answer and prints it as a block once it is complete, so
/// concurrent answers never interleave.
struct BlockSink {
    title: String,
    buffer: String,
    out: SharedOut,
}

impl BlockSink {
    fn print(&self, body: &str) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "── {} ──", self.title);
            let _ = writeln!(out, "{body}");
            let _ = writeln!(out);
            let _ = out.flush();
        }
    }
}

impl RenderSink for BlockSink {
    fn on_fragment(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
    }

    fn on_final(&mut self, text: &str) {
        self.buffer = text.to_string();
        self.print(&self.buffer);
    }

    fn on_error(&mut self, message: &str) {
        self.print(&format!("❌ {message}"));
    }
}

/// Prints each philosopher as soon as they finish, then the synthesis.
pub struct TerminalObserver {
    out: SharedOut,
}

impl TerminalObserver {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    fn block(&self, title: &str) -> Box<dyn RenderSink> {
        Box::new(BlockSink {
            title: title.to_string(),
            buffer: String::new(),
            out: self.out.clone(),
        })
    }
}

impl PanelObserver for TerminalObserver {
    fn persona_sink(&mut self, _index: usize, persona: &Persona) -> Box<dyn RenderSink> {
        self.block(&persona.name)
    }

    fn persona_settled(&mut self, _index: usize, _persona: &Persona, _outcome: &Result<String, String>) {}

    fn summary_sink(&mut self) -> Box<dyn RenderSink> {
        self.block("Synthesis")
    }

    // Printed after parsing; see `print_table`.
    fn table_sink(&mut self) -> Box<dyn RenderSink> {
        Box::new(NullSink)
    }
}

pub async fn run_ask(
    mut session: SessionContext,
    question: &str,
    persona_ids: &[String],
) -> Result<(), Box<dyn Error>> {
    let slot = session.select_panel(persona_ids)?;
    let ctx = session.turn_context()?;
    let token = slot.interrupt.supersede();

    println!("❓ {question}");
    println!();

    let mut observer = TerminalObserver::new(Box::new(io::stdout()));
    let report = slot
        .panel
        .lock()
        .await
        .ask(&ctx, question, &mut observer, &token)
        .await?;

    print_table(&report, &mut io::stdout())?;
    Ok(())
}

pub fn print_table(report: &PanelReport, out: &mut dyn Write) -> io::Result<()> {
    let Some(synthesis) = &report.synthesis else {
        writeln!(out, "⚠️  No philosopher answered; nothing to synthesize.")?;
        return Ok(());
    };
    match &synthesis.table {
        Ok(answer) => {
            writeln!(out, "── Comparison ──")?;
            match &answer.table {
                Some(table) => {
                    for line in render_table(table, MAX_CELL_WIDTH) {
                        writeln!(out, "{line}")?;
                    }
                }
                None => writeln!(out, "{}", answer.raw)?,
            }
        }
        Err(err) => writeln!(out, "❌ Comparison table failed: {err}")?,
    }
    Ok(())
}
