//! Incremental scanner that pulls the top-level `model` (and `stream`)
//! fields out of an OpenAI-style JSON request body without requiring the
//! whole document to be buffered first (section 9: "a streaming JSON
//! scanner that reads only enough of the request body to extract `model`
//! ... and splices the already-consumed prefix back onto the stream for
//! forwarding"). Has no teacher counterpart (`gglib-proxy` fully
//! deserializes into a typed request struct); built new as a small
//! hand-rolled SAX-style pass rather than reaching for a pull-parser crate
//! the rest of the workspace doesn't otherwise need.
//!
//! Tracks just enough JSON structure -- object/array nesting depth and
//! string/escape state -- to walk past nested values at the top level. It
//! never validates or reconstructs the document.

/// Upper bound on how many body bytes the scanner will buffer while
/// hunting for `model`/`stream` before giving up. Keeps a multi-megabyte
/// image-generation or audio payload from ever being fully materialized
/// just to read a model name that (in every real client) appears near the
/// front of the document.
pub const SCAN_LOOKAHEAD_CAP: usize = 64 * 1024;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Model,
    Stream,
    Other,
}

impl Field {
    fn from_key(key: &[u8]) -> Self {
        match key {
            b"model" => Field::Model,
            b"stream" => Field::Stream,
            _ => Field::Other,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TopState {
    ExpectKeyOrEnd,
    ExpectColon(Field),
    ExpectValue(Field),
    InLiteralValue(Field),
    ExpectCommaOrEnd,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StringRole {
    None,
    Key,
    Value(Field),
}

/// Persisted across chunks so the scan can resume where the previous
/// chunk's bytes left off.
pub struct Scanner {
    buf: Vec<u8>,
    depth: u32,
    in_string: bool,
    escape: bool,
    string_start: usize,
    string_role: StringRole,
    literal_start: usize,
    top_state: TopState,
    pub model: Option<String>,
    /// Byte range of the `model` field's string value within
    /// [`Scanner::buffer`] (the slice between its quotes), so the caller
    /// can splice in a replacement without re-serializing anything.
    pub model_value_range: Option<(usize, usize)>,
    pub stream: bool,
    done: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            depth: 0,
            in_string: false,
            escape: false,
            string_start: 0,
            string_role: StringRole::None,
            literal_start: 0,
            top_state: TopState::ExpectKeyOrEnd,
            model: None,
            model_value_range: None,
            stream: false,
            done: false,
        }
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Whether scanning is complete: the top-level object has closed, the
    /// document ended, or the lookahead cap was hit.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds the next chunk, updating `model`/`stream` as they're found.
    /// Returns `true` once scanning is complete; the caller should stop
    /// feeding and move on to splicing (or the full-buffer fallback).
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.done {
            return true;
        }
        for &byte in chunk {
            let idx = self.buf.len();
            self.buf.push(byte);

            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if byte == b'\\' {
                    self.escape = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    self.on_string_end(idx);
                }
            } else {
                self.on_byte(byte, idx);
            }

            if self.done {
                return true;
            }
            if self.buf.len() >= SCAN_LOOKAHEAD_CAP {
                self.done = true;
                return true;
            }
        }
        false
    }

    fn on_byte(&mut self, byte: u8, idx: usize) {
        if self.depth == 1
            && matches!(self.top_state, TopState::InLiteralValue(_))
            && matches!(byte, b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r')
        {
            self.close_literal(idx);
            if byte == b',' {
                self.top_state = TopState::ExpectKeyOrEnd;
                return;
            }
            // fall through: `}`/`]` still needs the structural handling below.
        }

        match byte {
            b'"' => {
                self.in_string = true;
                self.string_start = idx + 1;
                self.string_role = if self.depth == 1 {
                    match self.top_state {
                        TopState::ExpectKeyOrEnd => StringRole::Key,
                        TopState::ExpectValue(field) => StringRole::Value(field),
                        _ => StringRole::None,
                    }
                } else {
                    StringRole::None
                };
            }
            b'{' | b'[' => self.depth += 1,
            b'}' | b']' => {
                let was_depth = self.depth;
                self.depth = self.depth.saturating_sub(1);
                if was_depth == 1 {
                    self.done = true;
                } else if self.depth == 1 && matches!(self.top_state, TopState::ExpectValue(_)) {
                    self.top_state = TopState::ExpectCommaOrEnd;
                }
            }
            b':' if self.depth == 1 => {
                if let TopState::ExpectColon(field) = self.top_state {
                    self.top_state = TopState::ExpectValue(field);
                }
            }
            b',' if self.depth == 1 && self.top_state == TopState::ExpectCommaOrEnd => {
                self.top_state = TopState::ExpectKeyOrEnd;
            }
            b't' | b'f' | b'n' | b'-' | b'0'..=b'9'
                if self.depth == 1 && matches!(self.top_state, TopState::ExpectValue(_)) =>
            {
                if let TopState::ExpectValue(field) = self.top_state {
                    self.literal_start = idx;
                    self.top_state = TopState::InLiteralValue(field);
                }
            }
            _ => {}
        }
    }

    fn on_string_end(&mut self, idx: usize) {
        match self.string_role {
            StringRole::Key => {
                let key = Field::from_key(&self.buf[self.string_start..idx]);
                self.top_state = TopState::ExpectColon(key);
            }
            StringRole::Value(field) => {
                if field == Field::Model && self.model.is_none() {
                    let value = String::from_utf8_lossy(&self.buf[self.string_start..idx]).into_owned();
                    self.model = Some(value);
                    self.model_value_range = Some((self.string_start, idx));
                }
                self.top_state = TopState::ExpectCommaOrEnd;
            }
            StringRole::None => {}
        }
        self.string_role = StringRole::None;
    }

    fn close_literal(&mut self, idx: usize) {
        if let TopState::InLiteralValue(field) = self.top_state {
            let literal = &self.buf[self.literal_start..idx];
            if field == Field::Stream {
                self.stream = literal == b"true";
            }
        }
        self.top_state = TopState::ExpectCommaOrEnd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_model_regardless_of_field_order() {
        let mut scanner = Scanner::new();
        let body = br#"{"stream":true,"messages":[{"role":"user","content":"hi"}],"model":"gpt-4"}"#;
        scanner.feed(body);
        assert_eq!(scanner.model.as_deref(), Some("gpt-4"));
        assert!(scanner.stream);
    }

    #[test]
    fn splices_model_value_range_for_rewriting() {
        let mut scanner = Scanner::new();
        let body = br#"{"model":"alias-a","n":1}"#;
        scanner.feed(body);
        let (start, end) = scanner.model_value_range.unwrap();
        assert_eq!(&body[start..end], b"alias-a");
    }

    #[test]
    fn stops_at_lookahead_cap_without_finding_model() {
        let mut scanner = Scanner::new();
        let mut body = br#"{"messages":["#.to_vec();
        body.extend(std::iter::repeat(b'a').take(SCAN_LOOKAHEAD_CAP + 10));
        let done = scanner.feed(&body);
        assert!(done);
        assert!(scanner.model.is_none());
    }

    #[test]
    fn missing_model_field_leaves_model_none() {
        let mut scanner = Scanner::new();
        let done = scanner.feed(br#"{"messages":[]}"#);
        assert!(done);
        assert!(scanner.model.is_none());
    }

    #[test]
    fn resumes_across_chunk_boundaries() {
        let mut scanner = Scanner::new();
        let body = br#"{"mo"#;
        assert!(!scanner.feed(body));
        let rest = br#"del":"split-across-chunks"}"#;
        assert!(scanner.feed(rest));
        assert_eq!(scanner.model.as_deref(), Some("split-across-chunks"));
    }
}
