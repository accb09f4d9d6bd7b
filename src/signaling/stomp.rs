//! STOMP 1.2 Frames über WebSocket
//!
//! Der Signaling-Server spricht STOMP: Envelopes gehen als SEND-Frame an
//! eine Applikations-Destination und kommen als MESSAGE-Frame aus der
//! privaten Queue des Benutzers zurück.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StompError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown STOMP command: {0}")]
    UnknownCommand(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    #[error("Frame has no header terminator")]
    Incomplete,
}

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl StompCommand {
    fn as_str(&self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Send => "SEND",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
            StompCommand::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Result<Self, StompError> {
        Ok(match s {
            "CONNECT" | "STOMP" => StompCommand::Connect,
            "CONNECTED" => StompCommand::Connected,
            "SEND" => StompCommand::Send,
            "SUBSCRIBE" => StompCommand::Subscribe,
            "UNSUBSCRIBE" => StompCommand::Unsubscribe,
            "MESSAGE" => StompCommand::Message,
            "RECEIPT" => StompCommand::Receipt,
            "ERROR" => StompCommand::Error,
            "DISCONNECT" => StompCommand::Disconnect,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT/CONNECTED Header werden nicht escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// FRAME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Erster Wert eines Headers (wiederholte Header werden ignoriert)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT-Frame mit Benutzername und Heart-Beat in Millisekunden
    pub fn connect(host: &str, login: &str, heartbeat_ms: u64) -> Self {
        Self::new(StompCommand::Connect)
            .with_header("accept-version", "1.2,1.1")
            .with_header("host", host)
            .with_header("login", login)
            .with_header("username", login)
            .with_header("heart-beat", format!("{},{}", heartbeat_ms, heartbeat_ms))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(StompCommand::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn send(destination: &str, json_body: String) -> Self {
        Self::new(StompCommand::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_header("content-length", json_body.len().to_string())
            .with_body(json_body)
    }

    pub fn disconnect() -> Self {
        Self::new(StompCommand::Disconnect)
    }

    /// Serialisiert den Frame inkl. abschließendem NUL
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parst einen Frame. `Ok(None)` bedeutet Heart-Beat (nur Zeilenumbrüche).
    pub fn parse(raw: &str) -> Result<Option<Self>, StompError> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        if raw.is_empty() {
            return Ok(None);
        }

        let (head, rest) = split_head(raw).ok_or(StompError::Incomplete)?;

        let mut lines = head.lines().map(|l| l.strip_suffix('\r').unwrap_or(l));
        let command = StompCommand::parse(lines.next().ok_or(StompError::Empty)?)?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Self {
            command,
            headers,
            body: String::new(),
        };

        let content_length = frame
            .header("content-length")
            .and_then(|l| l.parse::<usize>().ok());
        frame.body = match content_length {
            Some(len) if rest.is_char_boundary(len.min(rest.len())) => {
                rest[..len.min(rest.len())].to_string()
            }
            _ => rest.split('\0').next().unwrap_or_default().to_string(),
        };

        Ok(Some(frame))
    }
}

fn split_head(raw: &str) -> Option<(&str, &str)> {
    let lf = raw.find("\n\n").map(|i| (i, 2));
    let crlf = raw.find("\r\n\r\n").map(|i| (i, 4));
    let (idx, len) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 < b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&raw[..idx], &raw[idx + len..]))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
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
            _ => return Err(StompError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================
