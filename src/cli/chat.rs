//! Terminal single mode: one philosopher, read prompts from stdin

use std::error::Error;
use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::core::conversation::ChatError;
use crate::core::language::Language;
use crate::core::render::RenderSink;
use crate::core::session::SessionContext;

/// Writes a persona's reply as it streams. The final text is authoritative:
/// when it differs from what was streamed it is printed again in full under
/// a rule, and when nothing was streamed it is printed whole.
pub struct TerminalPrinter<W: Write + Send> {
    out: W,
    streamed: String,
}

impl<W: Write + Send> TerminalPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            streamed: String::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> RenderSink for TerminalPrinter<W> {
    fn on_fragment(&mut self, fragment: &str) {
        self.streamed.push_str(fragment);
        let _ = write!(self.out, "{fragment}");
        let _ = self.out.flush();
    }

    fn on_final(&mut self, text: &str) {
        if self.streamed.is_empty() {
            let _ = write!(self.out, "{text}");
        } else if self.streamed.trim() != text.trim() {
            let _ = writeln!(self.out);
            let _ = writeln!(self.out, "───── final answer ─────");
            let _ = write!(self.out, "{text}");
        }
        let _ = writeln!(self.out);
        let _ = writeln!(self.out);
        let _ = self.out.flush();
        self.streamed.clear();
    }

    fn on_error(&mut self, message: &str) {
        if !self.streamed.is_empty() {
            let _ = writeln!(self.out);
        }
        let _ = self.out.flush();
        eprintln!("❌ {message}");
        eprintln!("💡 Type /retry to ask again");
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChatInput {
    Prompt(String),
    Retry,
    Language(String),
    Quit,
    Help,
    Empty,
}

pub fn parse_input(line: &str) -> ChatInput {
    let line = line.trim();
    if line.is_empty() {
        return ChatInput::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ChatInput::Prompt(line.to_string());
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));
    match name {
        "quit" | "exit" => ChatInput::Quit,
        "retry" => ChatInput::Retry,
        "language" | "lang" => ChatInput::Language(rest.to_string()),
        "help" => ChatInput::Help,
        _ => ChatInput::Prompt(line.to_string()),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /retry            Ask the last question again");
    println!("  /language NAME    Answer in another language from now on");
    println!("  /quit             Leave the conversation");
}

pub async fn run_chat(mut session: SessionContext, persona_id: &str) -> Result<(), Box<dyn Error>> {
    let slot = session.persona_slot(persona_id)?;
    let persona_name = slot.conversation.lock().await.persona().name.clone();

    println!("🏛  {persona_name} ({})", session.gate().model().label());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("💡 Type /help for commands");
    println!();

    {
        let ctx = session.turn_context()?;
        let token = slot.interrupt.supersede();
        let mut printer = TerminalPrinter::new(io::stdout());
        let mut conversation = slot.conversation.lock().await;
        match conversation.open(&ctx, &mut printer, &token).await {
            Ok(_) | Err(ChatError::Backend(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let ctx = session.turn_context()?;
        let token = slot.interrupt.supersede();
        let mut printer = TerminalPrinter::new(io::stdout());
        let mut conversation = slot.conversation.lock().await;

        let result = match parse_input(&line) {
            ChatInput::Empty => continue,
            ChatInput::Quit => break,
            ChatInput::Help => {
                print_help();
                continue;
            }
            ChatInput::Language(name) => {
                match name.parse::<Language>() {
                    Ok(language) => {
                        session.set_language(language);
                        println!("🌐 Answers will be in {language}");
                    }
                    Err(err) => eprintln!("❌ {err}"),
                }
                continue;
            }
            ChatInput::Retry => {
                if !conversation.has_unanswered_prompt() {
                    // A persona reply closed the last turn; nothing to redo.
                    eprintln!("⚠️  Nothing to retry");
                    continue;
                }
                conversation.retry_last(&ctx, &mut printer, &token).await
            }
            ChatInput::Prompt(prompt) => {
                println!();
                conversation.send(&ctx, &prompt, &mut printer, &token).await
            }
        };

        match result {
            Ok(_) | Err(ChatError::Backend(_)) => {}
            Err(ChatError::Flagged) => eprintln!("🛑 {}", ChatError::Flagged),
            Err(err) => eprintln!("❌ {err}"),
        }
    }

    Ok(())
}
