/// Receives the progress of one turn.
///
/// Fragments arrive in order and may be zero or many. `on_final` carries the
/// authoritative text and replaces whatever the fragments painted.
pub trait RenderSink: Send {
    fn on_fragment(&mut self, fragment: &str);
    fn on_final(&mut self, text: &str);
    fn on_error(&mut self, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderState {
    Streaming,
    Final,
    Failed(String),
}

/// In-memory display buffer for a streaming answer.
#[derive(Debug, Clone)]
pub struct StreamingRender {
    displayed: String,
    fragments: usize,
    state: RenderState,
}

impl Default for StreamingRender {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingRender {
    pub fn new() -> Self {
        Self {
            displayed: String::new(),
            fragments: 0,
            state: RenderState::Streaming,
        }
    }

    pub fn displayed(&self) -> &str {
        &self.displayed
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }
}

impl RenderSink for StreamingRender {
    fn on_fragment(&mut self, fragment: &str) {
        if self.state != RenderState::Streaming {
            return;
        }
        self.displayed.push_str(fragment);
        self.fragments += 1;
    }

    fn on_final(&mut self, text: &str) {
        self.displayed.clear();
        self.displayed.push_str(text);
        self.state = RenderState::Final;
    }

    fn on_error(&mut self, message: &str) {
        self.state = RenderState::Failed(message.to_string());
    }
}

/// Sink that ignores everything; for callers that only want the final text.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RenderSink for NullSink {
    fn on_fragment(&mut self, _fragment: &str) {}
    fn on_final(&mut self, _text: &str) {}
    fn on_error(&mut self, _message: &str) {}
}
