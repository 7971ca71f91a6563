use bytes::Bytes;

/// One parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Providers signal in-band failures with an `error` event name or an
    /// `{"error": ...}` data object; either one fails the attempt.
    pub fn is_error(&self) -> bool {
        if self.event.as_deref() == Some("error") {
            return true;
        }
        serde_json::from_str::<serde_json::Value>(&self.data)
            .ok()
            .is_some_and(|value| value.get("error").is_some_and(|e| !e.is_null()))
    }
}

/// Incremental SSE splitter fed with arbitrary byte chunks.
///
/// Chunk boundaries never align with event boundaries upstream, so the parser
/// buffers partial lines between calls. Comment lines and unknown fields are
/// skipped per the SSE grammar.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    pending: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        // Non-UTF8 chunks cannot carry an SSE frame boundary we care about.
        match std::str::from_utf8(chunk) {
            Ok(text) => self.feed_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if line.is_empty() {
                self.flush_event(&mut out);
            } else {
                self.consume_line(line);
            }
        }
        out
    }

    /// Drain whatever is buffered when the upstream closes without a final
    /// blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                self.consume_line(line);
            }
        }
        let mut out = Vec::new();
        self.flush_event(&mut out);
        out
    }

    fn consume_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_event(&mut self, out: &mut Vec<SseEvent>) {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return;
        }
        out.push(SseEvent {
            event: self.event_name.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_events_across_chunk_boundaries() {
        let mut parser = SseStreamParser::new();
        let first = parser.feed_str("event: message_delta\ndata: {\"de");
        assert!(first.is_empty());
        let second = parser.feed_str("lta\":1}\n\n");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].event.as_deref(), Some("message_delta"));
        assert_eq!(second[0].data, "{\"delta\":1}");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseStreamParser::new();
        let events = parser.feed_str("data: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn skips_comments_and_handles_crlf() {
        let mut parser = SseStreamParser::new();
        let events = parser.feed_str(": keepalive\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseStreamParser::new();
        assert!(parser.feed_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn error_event_detected_by_name_and_payload() {
        let named = SseEvent {
            event: Some("error".to_string()),
            data: "{}".to_string(),
        };
        assert!(named.is_error());

        let payload = SseEvent {
            event: Some("message_stop".to_string()),
            data: "{\"error\":{\"type\":\"overloaded_error\"}}".to_string(),
        };
        assert!(payload.is_error());

        let ok = SseEvent {
            event: Some("message_delta".to_string()),
            data: "{\"delta\":{}}".to_string(),
        };
        assert!(!ok.is_error());
    }
}
