//! Incremental server-sent event parser
//!
//! Bytes are fed in whatever chunks the network delivers. Lines end with
//! `\n`, `\r\n` or `\r`, and a terminator may be split across chunks. An event
//! is dispatched on a blank line; `data:` lines are joined with `\n`.

/// A dispatched event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// `None` means the default `message` type
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Stream sentinel used by OpenAI-compatible APIs
pub const DONE_SENTINEL: &str = "[DONE]";

impl SseEvent {
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

#[derive(Debug, Default)]
pub struct SseAssembler {
    line: Vec<u8>,
    /// Last byte seen was `\r`; a following `\n` belongs to the same terminator
    after_cr: bool,
    data: Vec<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    dispatched: Vec<SseEvent>,
}

impl SseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns how many events it completed
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        let before = self.dispatched.len();
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => {
                    self.after_cr = false;
                }
                b'\n' => self.end_line(),
                b'\r' => {
                    self.end_line();
                    self.after_cr = true;
                }
                other => {
                    self.after_cr = false;
                    self.line.push(other);
                }
            }
        }
        self.dispatched.len() - before
    }

    /// Events dispatched so far
    pub fn events(&self) -> &[SseEvent] {
        &self.dispatched
    }

    /// An event that has fields but no terminating blank line yet
    pub fn pending(&self) -> Option<SseEvent> {
        let mut data = self.data.clone();
        let mut event = self.event.clone();
        let mut id = self.id.clone();
        let mut retry = self.retry;

        // An unterminated last line still counts toward the partial event
        if !self.line.is_empty() {
            let line = String::from_utf8_lossy(&self.line);
            apply_field(&line, &mut data, &mut event, &mut id, &mut retry);
        }

        (!data.is_empty()).then(|| SseEvent {
            event,
            data: data.join("\n"),
            id,
            retry,
        })
    }

    /// True when nothing is buffered beyond dispatched events
    pub fn is_idle(&self) -> bool {
        self.line.is_empty() && self.data.is_empty()
    }

    /// Consume the assembler, returning dispatched events and any partial one
    pub fn finish(self) -> (Vec<SseEvent>, Option<SseEvent>) {
        let pending = self.pending();
        (self.dispatched, pending)
    }

    fn end_line(&mut self) {
        if self.line.is_empty() {
            self.dispatch();
            return;
        }

        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        apply_field(
            &line,
            &mut self.data,
            &mut self.event,
            &mut self.id,
            &mut self.retry,
        );
    }

    fn dispatch(&mut self) {
        let event = self.event.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        self.dispatched.push(SseEvent {
            event,
            data,
            // Last event id persists across events
            id: self.id.clone(),
            retry,
        });
    }
}

fn apply_field(
    line: &str,
    data: &mut Vec<String>,
    event: &mut Option<String>,
    id: &mut Option<String>,
    retry: &mut Option<u64>,
) {
    if line.starts_with(':') {
        return;
    }

    let (field, value) = match line.split_once(':') {
        Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
    };

    match field {
        "data" => data.push(value.to_string()),
        "event" => *event = Some(value.to_string()),
        "id" if !value.contains('\0') => *id = Some(value.to_string()),
        "retry" => {
            if let Ok(ms) = value.parse() {
                *retry = Some(ms);
            }
        }
        _ => {}
    }
}
