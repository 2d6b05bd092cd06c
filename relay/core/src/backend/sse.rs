//! Incremental Server-Sent Events Decoder
//!
//! Turns an arbitrary sequence of byte reads into complete SSE records.
//! Reads may split a multi-byte character or a record anywhere, so both the
//! undecoded UTF-8 tail and the partial record text carry over between
//! calls to [`SseDecoder::push`].
//!
//! # Record Format
//!
//! ```text
//! : keep-alive comment            (ignored)
//! event: message                  (ignored field)
//! data: {"choices":[...]}         (payload, one optional space stripped)
//! <blank line>                    (record separator)
//!
//! data: [DONE]                    (end sentinel, terminates decoding)
//! ```
//!
//! The decoder is used for the upstream provider stream and for the
//! client-side reader of the SSE send endpoint.

/// Payload that marks the end of a provider stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// A complete record extracted from the byte stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseRecord {
    /// The joined `data:` lines of one record
    Data(String),
    /// The end sentinel; nothing follows
    Done,
}

/// Decoder state machine for streaming SSE parsing
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes not yet decoded (an incomplete UTF-8 sequence)
    undecoded: Vec<u8>,
    /// Decoded text not yet terminated by a record separator
    text: String,
    /// Set once the sentinel was seen
    finished: bool,
}

impl SseDecoder {
    /// Create a new decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the end sentinel has been decoded
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of buffered bytes/chars waiting for more input
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.undecoded.len() + self.text.len()
    }

    /// Feed one read and return every record it completed
    ///
    /// After the sentinel all further input is ignored.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseRecord> {
        if self.finished {
            return Vec::new();
        }

        self.decode_utf8(bytes);

        let mut records = Vec::new();
        while let Some(pos) = self.text.find("\n\n") {
            let block: String = self.text.drain(..pos + 2).collect();
            match parse_record(&block[..pos]) {
                Some(SseRecord::Done) => {
                    self.finish_now();
                    records.push(SseRecord::Done);
                    return records;
                }
                Some(record) => records.push(record),
                None => {}
            }
        }
        records
    }

    /// Flush a trailing record at end of stream
    ///
    /// Some servers close the connection without a final blank line.
    pub fn finish(&mut self) -> Option<SseRecord> {
        if self.finished {
            return None;
        }
        if !self.undecoded.is_empty() {
            let tail = std::mem::take(&mut self.undecoded);
            self.text.push_str(&String::from_utf8_lossy(&tail));
        }
        self.normalize_line_endings(true);
        let block = std::mem::take(&mut self.text);
        self.finished = true;
        parse_record(block.trim_end_matches('\n'))
    }

    fn finish_now(&mut self) {
        self.finished = true;
        self.text.clear();
        self.undecoded.clear();
    }

    /// Decode as much of the pending bytes as possible
    fn decode_utf8(&mut self, bytes: &[u8]) {
        self.undecoded.extend_from_slice(bytes);

        let mut start = 0;
        while start < self.undecoded.len() {
            match std::str::from_utf8(&self.undecoded[start..]) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    start = self.undecoded.len();
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.undecoded[start..valid_end]));
                    start = valid_end;
                    match e.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            start += len;
                        }
                        // Incomplete sequence at the end: wait for the next read
                        None => break,
                    }
                }
            }
        }
        self.undecoded.drain(..start);
        self.normalize_line_endings(false);
    }

    /// Rewrite CRLF and lone CR line endings as LF
    ///
    /// Unless `at_end`, a trailing CR is kept as-is: the LF completing it
    /// may arrive with the next read.
    fn normalize_line_endings(&mut self, at_end: bool) {
        if !self.text.contains('\r') {
            return;
        }
        let held = !at_end && self.text.ends_with('\r');
        let body = if held {
            &self.text[..self.text.len() - 1]
        } else {
            self.text.as_str()
        };
        let mut normalized = body.replace("\r\n", "\n").replace('\r', "\n");
        if held {
            normalized.push('\r');
        }
        self.text = normalized;
    }
}

/// Parse one record (without its trailing separator)
///
/// Returns `None` for comment-only or data-less records (keep-alives).
fn parse_record(block: &str) -> Option<SseRecord> {
    let mut data: Option<String> = None;

    for line in block.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field != "data" {
            continue;
        }
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }

    let data = data?;
    if data.trim() == DONE_SENTINEL {
        Some(SseRecord::Done)
    } else if data.is_empty() {
        None
    } else {
        Some(SseRecord::Data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> SseRecord {
        SseRecord::Data(s.to_string())
    }

    #[test]
    fn test_single_record() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(b"data: hello\n\n"), vec![data("hello")]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_record_is_buffered() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: hel").is_empty());
        assert!(decoder.push(b"lo\n").is_empty());
        assert_eq!(decoder.push(b"\ndata: x\n\n"), vec![data("hello"), data("x")]);
    }

    #[test]
    fn test_split_multibyte_character() {
        let payload = "data: héllo ✓\n\n".as_bytes();
        // Split inside the three-byte check mark
        let split = payload.len() - 4;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&payload[..split]).is_empty());
        assert_eq!(decoder.push(&payload[split..]), vec![data("héllo ✓")]);
    }

    #[test]
    fn test_comments_and_other_fields_ignored() {
        let mut decoder = SseDecoder::new();
        let records = decoder.push(b": keep-alive\n\nevent: message\nid: 7\ndata: a\n\n");
        assert_eq!(records, vec![data("a")]);
    }

    #[test]
    fn test_multiple_data_lines_are_joined() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(b"data: a\ndata: b\n\n"), vec![data("a\nb")]);
    }

    #[test]
    fn test_crlf_separators() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: a\r\n\r").is_empty());
        assert_eq!(decoder.push(b"\n"), vec![data("a")]);
    }

    #[test]
    fn test_lone_cr_line_endings() {
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.push(b": ping\r\rdata: a\rdata: b\r\rdata: c\r"),
            vec![data("a\nb")]
        );
        // The held CR turns out to be a line ending of its own
        assert_eq!(decoder.push(b"\rdata: d"), vec![data("c")]);
        assert_eq!(decoder.finish(), Some(data("d")));
    }

    #[test]
    fn test_sentinel_terminates_even_with_trailing_bytes() {
        let mut decoder = SseDecoder::new();
        let records = decoder.push(b"data: a\n\ndata: [DONE]\n\ndata: late\n\n");
        assert_eq!(records, vec![data("a"), SseRecord::Done]);
        assert!(decoder.is_finished());
        assert!(decoder.push(b"data: later\n\n").is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_fatal() {
        let mut decoder = SseDecoder::new();
        let records = decoder.push(b"data: a\xffb\n\n");
        assert_eq!(records, vec![data("a\u{FFFD}b")]);
    }

    #[test]
    fn test_finish_flushes_unterminated_record() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some(data("tail")));
    }

    #[test]
    fn test_data_without_space() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(b"data:{}\n\n"), vec![data("{}")]);
    }
}
