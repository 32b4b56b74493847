/// Reassembles `data:` payloads of a server-sent event stream from arbitrary
/// byte chunks. Lines are decoded only once complete, so multi-byte
/// characters split across chunks survive.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        events
    }

    /// Emits a final event left without its terminating blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            if let Some(data) = rest.trim_end_matches('\r').strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        if self.data_lines.is_empty() {
            return None;
        }
        let event = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_events_split_across_chunks() {
        let mut sse = SseAccumulator::new();
        assert!(sse.push(b"event: response.created\ndata: {\"a\"").is_empty());
        assert_eq!(sse.push(b":1}\n\ndata: [DONE]\n\n"), vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn survives_split_utf8_and_crlf() {
        let mut sse = SseAccumulator::new();
        let bytes = "data: caf\u{e9}\r\n\r\n".as_bytes();
        let (head, tail) = bytes.split_at(10);
        assert!(sse.push(head).is_empty());
        assert_eq!(sse.push(tail), vec!["caf\u{e9}"]);
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut sse = SseAccumulator::new();
        assert!(sse.push(b"data: tail").is_empty());
        assert_eq!(sse.finish().as_deref(), Some("tail"));
        assert_eq!(sse.finish(), None);
    }
}
