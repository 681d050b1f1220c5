//! STOMP 1.2 frame model and codec.
//!
//! Frames travel as WebSocket text messages. One message may carry several
//! frames or a bare EOL heart-beat, so decoding goes through [`FrameDecoder`],
//! which buffers partial input and yields complete items in order.

use crate::error::FrameError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame. Header order is preserved; on lookup the first
/// occurrence of a repeated header wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Build the CONNECT frame opening a session.
    ///
    /// # Arguments
    ///
    /// * `host` - Virtual host name sent in the `host` header
    /// * `token` - Bearer token forwarded as `Authorization`, if any
    /// * `heartbeat` - `(outgoing, incoming)` intervals we can honour, in ms
    pub fn connect(host: &str, token: Option<&str>, heartbeat: (u64, u64)) -> Self {
        let mut frame = Self::new(Command::Connect)
            .header("accept-version", crate::constants::STOMP_ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1));
        if let Some(token) = token {
            frame = frame.header("Authorization", format!("Bearer {token}"));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Serialize to wire form, NUL terminator included.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');

        let mut has_length = false;
        for (key, value) in &self.headers {
            if key == "content-length" {
                has_length = true;
            }
            if escape {
                out.push_str(&escape_header(key));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(key);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !has_length && !self.body.is_empty() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one complete frame (without its trailing NUL).
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let mut decoder = FrameDecoder::new();
        decoder.push(raw);
        decoder.push("\0");
        loop {
            match decoder.next_item() {
                Some(Ok(Decoded::Heartbeat)) => continue,
                Some(Ok(Decoded::Frame(frame))) => return Ok(frame),
                Some(Err(e)) => return Err(e),
                None => return Err(FrameError::Empty),
            }
        }
    }
}

/// One item pulled from the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    Heartbeat,
}

/// Incremental decoder over a stream of text chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, chunk: &str) {
        self.buf.extend_from_slice(chunk.as_bytes());
    }

    /// Number of buffered bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete item, or `None` if more input is needed.
    ///
    /// A malformed frame is dropped up to its NUL terminator so decoding can
    /// resume with the next frame.
    pub fn next_item(&mut self) -> Option<Result<Decoded, FrameError>> {
        if self.buf.starts_with(b"\r\n") {
            self.buf.drain(..2);
            return Some(Ok(Decoded::Heartbeat));
        }
        if self.buf.first() == Some(&b'\n') {
            self.buf.drain(..1);
            return Some(Ok(Decoded::Heartbeat));
        }
        if self.buf.is_empty() {
            return None;
        }

        let nul = self.buf.iter().position(|b| *b == 0);
        let (head_end, body_start) = match find_blank_line(&self.buf) {
            Some(found) if nul.map_or(true, |n| found.0 < n) => found,
            _ => {
                // A NUL before any blank line means the frame has no header terminator.
                return nul.map(|n| {
                    self.buf.drain(..=n);
                    Err(FrameError::MissingBody)
                });
            }
        };

        let head = match std::str::from_utf8(&self.buf[..head_end]) {
            Ok(h) => h.to_string(),
            Err(_) => return Some(Err(self.discard(FrameError::InvalidUtf8))),
        };

        let (command, headers) = match parse_head(&head) {
            Ok(parsed) => parsed,
            Err(e) => return Some(Err(self.discard(e))),
        };

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| v.clone());

        let body_end = match content_length {
            Some(len) => {
                let len: usize = match len.trim().parse() {
                    Ok(n) => n,
                    Err(_) => {
                        return Some(Err(self.discard(FrameError::InvalidContentLength(len))))
                    }
                };
                let end = body_start + len;
                if self.buf.len() <= end {
                    return None;
                }
                if self.buf[end] != 0 {
                    return Some(Err(self.discard(FrameError::InvalidContentLength(
                        len.to_string(),
                    ))));
                }
                end
            }
            None => match self.buf[body_start..].iter().position(|b| *b == 0) {
                Some(offset) => body_start + offset,
                None => return None,
            },
        };

        let body = match std::str::from_utf8(&self.buf[body_start..body_end]) {
            Ok(b) => b.to_string(),
            Err(_) => {
                self.buf.drain(..=body_end);
                return Some(Err(FrameError::InvalidUtf8));
            }
        };
        self.buf.drain(..=body_end);

        Some(Ok(Decoded::Frame(Frame {
            command,
            headers,
            body,
        })))
    }

    fn discard(&mut self, err: FrameError) -> FrameError {
        match self.buf.iter().position(|b| *b == 0) {
            Some(n) => {
                self.buf.drain(..=n);
            }
            None => self.buf.clear(),
        }
        err
    }
}

/// Locate the empty line ending the header block.
/// Returns `(end_of_headers, start_of_body)`.
fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, b) in buf.iter().enumerate() {
        if *b != b'\n' {
            continue;
        }
        let rest = &buf[i + 1..];
        if rest.first() == Some(&b'\n') {
            return Some((i, i + 2));
        }
        if rest.starts_with(b"\r\n") {
            return Some((i, i + 3));
        }
    }
    None
}

fn parse_head(head: &str) -> Result<(Command, Vec<(String, String)>), FrameError> {
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let command = match lines.next() {
        Some(line) if !line.is_empty() => Command::parse(line)?,
        _ => return Err(FrameError::Empty),
    };

    let escaped = command.escapes_headers();
    let mut headers = Vec::new();
    for line in lines {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(key)?, unescape_header(value)?));
        } else {
            headers.push((key.to_string(), value.to_string()));
        }
    }
    Ok((command, headers))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(s.to_string())),
        }
    }
    Ok(out)
}

/// Parse a `heart-beat:cx,cy` header value.
pub fn parse_heartbeat(value: &str) -> Option<(u64, u64)> {
    let (x, y) = value.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// Negotiate heart-beat intervals.
///
/// Returns `(outgoing, incoming)` in milliseconds as seen by the client;
/// zero disables that direction.
pub fn negotiate_heartbeat(ours: (u64, u64), theirs: (u64, u64)) -> (u64, u64) {
    let outgoing = if ours.0 == 0 || theirs.1 == 0 {
        0
    } else {
        ours.0.max(theirs.1)
    };
    let incoming = if ours.1 == 0 || theirs.0 == 0 {
        0
    } else {
        ours.1.max(theirs.0)
    };
    (outgoing, incoming)
}
