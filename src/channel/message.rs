//! Channel message framing
//!
//! Every message posted on a channel is a self-delimiting text record:
//!
//! ```text
//! @@<marker>#<seq>/<key>|<sec>.<usec>|<sender>|<field>|<field>...
//! <body lines>
//! @@
//! ```
//!
//! The key is the destination host, `*` addresses every peer of a fanout
//! worker. Fields never contain `|` or newlines; free text that may is
//! passed through [`crate::util::nlencode`] first.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{BoardError, BoardResult};

/// Largest sequence number before wrapping back to 1
pub const MAX_SEQ: u32 = 999_999;

/// Markers that carry commands rather than status data
const CONTROL_MARKERS: &[&str] = &[
    "drophost",
    "droptest",
    "renamehost",
    "renametest",
    "dropstate",
    "shutdown",
    "reload",
    "logrotate",
    "idle",
];

pub fn next_seq(seq: u32) -> u32 {
    if seq >= MAX_SEQ { 1 } else { seq + 1 }
}

/// An outgoing message before it is stamped with a sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub marker: String,
    pub key: String,
    pub sender: String,
    pub fields: Vec<String>,
    pub body: String,
}

impl Envelope {
    pub fn new(marker: impl Into<String>, key: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            key: key.into(),
            sender: sender.into(),
            fields: Vec::new(),
            body: String::new(),
        }
    }

    pub fn field(mut self, value: impl ToString) -> Self {
        self.fields.push(value.to_string());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn encode(&self, seq: u32, sec: i64, usec: u32) -> String {
        let mut out = format!(
            "@@{}#{}/{}|{}.{:06}|{}",
            self.marker, seq, self.key, sec, usec, self.sender
        );
        for field in &self.fields {
            out.push('|');
            out.push_str(field);
        }
        out.push('\n');
        if !self.body.is_empty() {
            out.push_str(&self.body);
            if !self.body.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str("@@\n");
        out
    }
}

/// A message as seen by a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub marker: String,
    pub seq: u32,
    pub key: String,
    pub sec: i64,
    pub usec: u32,
    pub sender: String,
    pub fields: Vec<String>,
    pub body: String,
}

impl ChannelMessage {
    pub fn decode(text: &str) -> BoardResult<Self> {
        let trimmed = text.strip_suffix('\n').unwrap_or(text);
        let trimmed = trimmed
            .strip_suffix("@@")
            .ok_or_else(|| BoardError::Protocol("message is not terminated by @@".into()))?;
        let (header, body) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
        let body = body.strip_suffix('\n').unwrap_or(body);

        let header = header
            .strip_prefix("@@")
            .ok_or_else(|| BoardError::Protocol(format!("bad message header '{header}'")))?;
        let (marker, rest) = header
            .split_once('#')
            .ok_or_else(|| BoardError::Protocol(format!("no sequence in '{header}'")))?;
        let (seq, rest) = rest
            .split_once('/')
            .ok_or_else(|| BoardError::Protocol(format!("no key in '{header}'")))?;
        let seq = seq
            .parse()
            .map_err(|_| BoardError::Protocol(format!("bad sequence number '{seq}'")))?;

        let mut parts = rest.split('|');
        let key = parts.next().unwrap_or_default().to_string();
        let timestamp = parts
            .next()
            .ok_or_else(|| BoardError::Protocol(format!("no timestamp in '{header}'")))?;
        let (sec, usec) = timestamp.split_once('.').unwrap_or((timestamp, "0"));
        let sec = sec
            .parse()
            .map_err(|_| BoardError::Protocol(format!("bad timestamp '{timestamp}'")))?;
        let usec = usec.parse().unwrap_or(0);
        let sender = parts.next().unwrap_or_default().to_string();
        let fields = parts.map(str::to_string).collect();

        Ok(Self {
            marker: marker.to_string(),
            seq,
            key,
            sec,
            usec,
            sender,
            fields,
            body: body.to_string(),
        })
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn is_control(&self) -> bool {
        CONTROL_MARKERS.contains(&self.marker.as_str())
    }
}

/// The destination key of an encoded message, without decoding the rest.
pub fn destination_key(text: &str) -> Option<&str> {
    let header = text.lines().next()?;
    let start = header.find(['/', '|'])?;
    if !header[start..].starts_with('/') {
        return None;
    }
    let key = &header[start + 1..];
    let end = key.find('|')?;
    Some(&key[..end])
}

/// Result of checking a sequence number against the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    First,
    InOrder,
    Gap(u32),
    Repeated,
}

/// Tracks sequence numbers seen by a reader to spot lost or repeated messages.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
}

impl SequenceTracker {
    pub fn observe(&mut self, seq: u32) -> SeqCheck {
        let check = match self.last {
            None => SeqCheck::First,
            Some(last) if last == seq => SeqCheck::Repeated,
            Some(last) if next_seq(last) == seq => SeqCheck::InOrder,
            Some(last) if seq > last => SeqCheck::Gap(seq - last - 1),
            Some(last) => SeqCheck::Gap(MAX_SEQ - last + seq - 1),
        };
        self.last = Some(seq);
        check
    }
}

/// Read one `@@`-terminated message from a line-oriented stream.
///
/// Returns `Ok(None)` at end of input. A partial message cut off by EOF is
/// discarded.
pub async fn read_message<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut message = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let is_terminator = line.trim_end_matches(['\r', '\n']) == "@@";
        if message.is_empty() && (is_terminator || !line.starts_with("@@")) {
            // noise between messages
            continue;
        }
        message.push_str(&line);
        if is_terminator {
            return Ok(Some(message));
        }
    }
}
