//! Server-sent event plumbing: render sinks that forward to a channel, and
//! the SSE response that drains it.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::config::data::Persona;
use crate::core::panel::PanelObserver;
use crate::core::render::RenderSink;
use crate::core::synthesis::SummaryTable;

pub type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// Which pane of the page an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Persona { index: usize, id: String },
    Summary,
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WireEvent {
    Fragment {
        target: Target,
        text: String,
    },
    Final {
        target: Target,
        text: String,
    },
    Error {
        target: Target,
        message: String,
    },
    /// A panel member reached a terminal state.
    Settled {
        index: usize,
        persona_id: String,
        ok: bool,
    },
    Table {
        table: SummaryTable,
    },
    /// The whole request failed before or outside any pane.
    Failed {
        message: String,
    },
    Done {},
}

impl WireEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WireEvent::Fragment { .. } => "fragment",
            WireEvent::Final { .. } => "final",
            WireEvent::Error { .. } => "error",
            WireEvent::Settled { .. } => "settled",
            WireEvent::Table { .. } => "table",
            WireEvent::Failed { .. } => "failed",
            WireEvent::Done {} => "done",
        }
    }

    fn into_sse(self) -> Event {
        let event = Event::default().event(self.name());
        match serde_json::to_string(&self) {
            Ok(data) => event.data(data),
            Err(_) => event.data("{}"),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<WireEvent>;

/// Render sink that forwards a turn's progress to an SSE stream. When the
/// stream is gone the turn is cancelled.
pub struct ChannelSink {
    tx: EventSender,
    target: Target,
    cancel: CancellationToken,
}

impl ChannelSink {
    pub fn new(tx: EventSender, target: Target, cancel: CancellationToken) -> Self {
        Self { tx, target, cancel }
    }

    fn forward(&self, event: WireEvent) {
        if self.tx.send(event).is_err() {
            self.cancel.cancel();
        }
    }
}

impl RenderSink for ChannelSink {
    fn on_fragment(&mut self, fragment: &str) {
        self.forward(WireEvent::Fragment {
            target: self.target.clone(),
            text: fragment.to_string(),
        });
    }

    fn on_final(&mut self, text: &str) {
        self.forward(WireEvent::Final {
            target: self.target.clone(),
            text: text.to_string(),
        });
    }

    fn on_error(&mut self, message: &str) {
        self.forward(WireEvent::Error {
            target: self.target.clone(),
            message: message.to_string(),
        });
    }
}

/// Panel observer that streams every persona into its own pane.
pub struct ChannelObserver {
    tx: EventSender,
    cancel: CancellationToken,
}

impl ChannelObserver {
    pub fn new(tx: EventSender, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    fn sink(&self, target: Target) -> Box<dyn RenderSink> {
        Box::new(ChannelSink::new(self.tx.clone(), target, self.cancel.clone()))
    }
}

impl PanelObserver for ChannelObserver {
    fn persona_sink(&mut self, index: usize, persona: &Persona) -> Box<dyn RenderSink> {
        self.sink(Target::Persona {
            index,
            id: persona.id.clone(),
        })
    }

    fn persona_settled(&mut self, index: usize, persona: &Persona, outcome: &Result<String, String>) {
        let _ = self.tx.send(WireEvent::Settled {
            index,
            persona_id: persona.id.clone(),
            ok: outcome.is_ok(),
        });
    }

    fn summary_sink(&mut self) -> Box<dyn RenderSink> {
        self.sink(Target::Summary)
    }

    fn table_sink(&mut self) -> Box<dyn RenderSink> {
        self.sink(Target::Table)
    }
}

/// Stream the channel as SSE. Dropping the response (client disconnect)
/// cancels `turn`.
pub fn sse_response(
    rx: mpsc::UnboundedReceiver<WireEvent>,
    turn: CancellationToken,
) -> Sse<EventStream> {
    let guard = turn.drop_guard();
    let events = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(event.into_sse()), (rx, guard)))
    })
    .boxed();

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
