//! Server-Sent-Events framing for streamed answers.
//!
//! Events are separated by `\r\n\r\n`. Each event holds an optional
//! `event:` line and any number of `data:` lines, joined with `\n`.

const DELIMITER: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder. Bytes are buffered until a full event is available,
/// so multi-byte characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = find(&self.buf, DELIMITER) {
            let raw: Vec<u8> = self.buf.drain(..pos + DELIMITER.len()).collect();
            if let Some(event) = parse_event(&raw[..pos]) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event the server did not terminate.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.buf);
        parse_event(&raw)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn parse_event(raw: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        // blank lines and `:` comments carry nothing
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(name) = field(line, "event") {
            if !name.is_empty() {
                event = Some(name.to_string());
            }
        } else if let Some(value) = field(line, "data") {
            data.push(value);
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}
