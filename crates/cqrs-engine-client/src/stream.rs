//! Newline-delimited JSON frame decoding for streaming responses.
//!
//! Response bodies arrive as a byte stream. Bytes are buffered until a line
//! separator completes a frame; each complete line is decoded from the
//! response charset and parsed as a `{type, payload}` envelope. Partial
//! trailing lines are carried over between chunks.

use serde::Deserialize;

use crate::error::{ClientError, ClientResult};

/// Charset taken from the response `Content-Type`; UTF-8 when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Charset {
    Utf8,
    Latin1,
}

impl Charset {
    pub(crate) fn from_content_type(header: Option<&str>) -> Self {
        let Some(header) = header else {
            return Charset::Utf8;
        };
        let charset = header
            .split(';')
            .filter_map(|part| part.trim().strip_prefix("charset="))
            .next()
            .map(|cs| cs.trim_matches('"').to_ascii_lowercase());
        match charset.as_deref() {
            Some("iso-8859-1") | Some("latin1") => Charset::Latin1,
            _ => Charset::Utf8,
        }
    }

    fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Accumulates body chunks and yields complete lines.
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
    charset: Charset,
}

impl LineBuffer {
    pub(crate) fn new(charset: Charset) -> Self {
        Self {
            buf: Vec::new(),
            charset,
        }
    }

    /// Feed a chunk; returns the lines it completed, in order.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(self.charset.decode(&line));
            }
        }
        lines
    }

    /// Drain whatever is left after the body ended without a final
    /// separator.
    pub(crate) fn finish(mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            let line = self.charset.decode(&self.buf);
            self.buf.clear();
            Some(line)
        }
    }
}

/// One `{type, payload}` frame of a streaming response.
#[derive(Debug, Deserialize)]
pub(crate) struct StreamFrame {
    #[serde(rename = "type")]
    pub(crate) frame_type: String,
    #[serde(default)]
    pub(crate) payload: serde_json::Value,
}

impl StreamFrame {
    pub(crate) fn parse(line: &str) -> ClientResult<Self> {
        serde_json::from_str(line).map_err(|e| ClientError::Marshalling {
            message: format!("malformed stream frame: {e}"),
        })
    }

    /// The error message carried by an `error` frame.
    pub(crate) fn error_message(&self) -> String {
        self.payload
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("stream reported an error")
            .to_string()
    }
}
