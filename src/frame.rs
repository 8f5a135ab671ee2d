//! Text wire framing.
//!
//! A frame is a command line, zero or more `name:value` header lines, a blank
//! line, and a body terminated by a NUL byte. A bare newline between frames is
//! a heartbeat and carries no frame. When a `content-length` header is
//! present the body is read to exactly that many bytes, which allows NUL
//! bytes inside the body; without it the body runs to the first NUL.
//!
//! Responsibilities:
//! - Encode frames bit-exactly: `COMMAND\n` headers `\n` body `\0`.
//! - Decode frames incrementally from a byte stream via [`FrameAccumulator`].
//! - Preserve header insertion order; later writes to an existing header
//!   name overwrite the value in place.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A single heartbeat on the wire.
pub const HEARTBEAT: &[u8] = b"\n";

/// Well-known header names.
pub mod headers {
    pub const DESTINATION: &str = "destination";
    pub const ID: &str = "id";
    pub const REPLY_TO: &str = "reply-to";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const ACK: &str = "ack";
    pub const TRANSACTION: &str = "transaction";
}

/// Frame command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
}

impl Command {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "CONNECT" => Ok(Command::Connect),
            "CONNECTED" => Ok(Command::Connected),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            "ACK" => Ok(Command::Ack),
            "NACK" => Ok(Command::Nack),
            "BEGIN" => Ok(Command::Begin),
            "COMMIT" => Ok(Command::Commit),
            "ABORT" => Ok(Command::Abort),
            "DISCONNECT" => Ok(Command::Disconnect),
            other => Err(Error::Protocol(format!("unknown command: {other:?}"))),
        }
    }
}

/// Ordered header map. Duplicate inserts overwrite the value in place so the
/// encoded position of a header is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Charset declared in the `content-type` header, if any.
    #[must_use]
    pub fn body_charset(&self) -> Option<&str> {
        let ct = self.headers.get(headers::CONTENT_TYPE)?;
        ct.split(';')
            .filter_map(|part| part.trim().strip_prefix("charset="))
            .next()
    }

    /// Encodes the frame. A `content-length` header is appended (after all
    /// other headers) whenever the body is non-empty and the caller did not
    /// set one.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        if !self.body.is_empty() && !self.headers.contains(headers::CONTENT_LENGTH) {
            out.extend_from_slice(headers::CONTENT_LENGTH.as_bytes());
            out.push(b':');
            out.extend_from_slice(self.body.len().to_string().as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Decodes a complete frame from `data`.
    ///
    /// Returns `Ok(None)` if `data` holds only heartbeats (bare newlines)
    /// or stops before the blank line ending the head section.
    /// The body is sized by `content-length` when present; otherwise it runs
    /// to the end of `data`, with a single trailing NUL stripped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an unknown command, a non-UTF-8 head
    /// section, or a malformed header line.
    pub fn decode(data: &[u8]) -> Result<Option<Frame>, Error> {
        let mut start = 0;
        while start < data.len() && data[start] == b'\n' {
            start += 1;
        }
        if start == data.len() {
            return Ok(None);
        }
        let data = &data[start..];

        // No blank-line separator yet: not enough of a frame to decode.
        let Some(head_end) = find_blank_line(data) else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|_| Error::Protocol("frame head is not valid utf-8".into()))?;

        let mut lines = head.split('\n');
        let command: Command = lines
            .next()
            .ok_or_else(|| Error::Protocol("empty frame".into()))?
            .trim_end_matches('\r')
            .parse()?;

        let mut headers = Headers::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("malformed header line: {line:?}")))?;
            headers.insert(name, value);
        }

        let body_start = head_end + 2;
        let raw_body = if body_start <= data.len() {
            &data[body_start..]
        } else {
            &[]
        };

        let body = match headers.get(headers::CONTENT_LENGTH) {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad content-length: {len:?}")))?;
                if raw_body.len() < len {
                    return Err(Error::Protocol("body shorter than content-length".into()));
                }
                raw_body[..len].to_vec()
            }
            None => {
                let mut body = raw_body;
                if body.last() == Some(&0) {
                    body = &body[..body.len() - 1];
                }
                body.to_vec()
            }
        };

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\n\n")
}

/// Incremental frame decoder over a byte stream.
///
/// Feed raw socket reads with [`push`](FrameAccumulator::push) and drain
/// complete frames with [`next_frame`](FrameAccumulator::next_frame).
/// Heartbeats are consumed silently.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
}

impl FrameAccumulator {
    #[must_use]
    pub fn new() -> Self {
        FrameAccumulator { buf: Vec::new() }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete frame out of the buffer, or `Ok(None)` if more
    /// bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for malformed frames; the consumed bytes
    /// are discarded so decoding can resume at the next frame boundary.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        // Leading newlines are heartbeats.
        let skip = self.buf.iter().take_while(|&&b| b == b'\n').count();
        if skip > 0 {
            self.buf.drain(..skip);
        }
        if self.buf.is_empty() {
            return Ok(None);
        }

        let Some(head_end) = find_blank_line(&self.buf) else {
            return Ok(None);
        };
        let body_start = head_end + 2;

        let frame_end = match content_length(&self.buf[..head_end])? {
            Some(len) => {
                // body plus the trailing NUL
                let end = body_start + len + 1;
                if self.buf.len() < end {
                    return Ok(None);
                }
                if self.buf[end - 1] != 0 {
                    self.buf.clear();
                    return Err(Error::Protocol("frame body not NUL-terminated".into()));
                }
                end
            }
            None => {
                let Some(nul) = self.buf[body_start..].iter().position(|&b| b == 0) else {
                    return Ok(None);
                };
                body_start + nul + 1
            }
        };

        let raw: Vec<u8> = self.buf.drain(..frame_end).collect();
        Frame::decode(&raw)
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Scans header lines for a `content-length` header.
fn content_length(head: &[u8]) -> Result<Option<usize>, Error> {
    let head =
        std::str::from_utf8(head).map_err(|_| Error::Protocol("frame head is not valid utf-8".into()))?;
    for line in head.split('\n').skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name == headers::CONTENT_LENGTH {
            let len = value
                .trim()
                .parse()
                .map_err(|_| Error::Protocol(format!("bad content-length: {value:?}")))?;
            return Ok(Some(len));
        }
    }
    Ok(None)
}
