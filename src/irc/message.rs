//! The message classifier (C2): tags a raw line with one of the commands
//! this crate cares about, and extracts the handful of fields the rest of
//! the fleet needs without building a full parse tree for every line.

use parking_lot::Mutex;

use crate::errors::Error;

/// The classifier's verdict for a raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ping,
    Reconnect,
    Join,
    Part,
    PrivMsg,
    Cap,
    Notice,
    Unknown,
}

fn classify_token(token: &str) -> MessageType {
    match token {
        "PING" => MessageType::Ping,
        "RECONNECT" => MessageType::Reconnect,
        "JOIN" => MessageType::Join,
        "PART" => MessageType::Part,
        "PRIVMSG" => MessageType::PrivMsg,
        "CAP" => MessageType::Cap,
        "NOTICE" => MessageType::Notice,
        _ => MessageType::Unknown,
    }
}

/// Scan space-separated tokens, skipping a leading `@tags` token and an
/// optional `:prefix` token, and classify the next token as the command
/// keyword. Mirrors the original `pkg/irc/message.go` `parseMessageType`
/// algorithm exactly (including which input shapes count as partial).
fn classify_line(raw: &str) -> Result<MessageType, Error> {
    let mut tokens = raw.split(' ');
    let mut next = tokens.next();
    if let Some(tok) = next {
        if tok.starts_with('@') {
            next = tokens.next();
        }
    }
    let next = match next {
        Some(tok) => tok,
        None => return Err(Error::PartialMessage),
    };
    let command_tok = if next.starts_with(':') {
        match tokens.next() {
            Some(tok) => tok,
            None => return Err(Error::PartialMessage),
        }
    } else {
        next
    };
    Ok(classify_token(command_tok))
}

/// An unparsed IRC line, with lazily-computed classification. The lazy cell
/// amortizes classification cost across callers who never ask for `kind()`
/// (e.g. code that only cares about a handful of message types).
#[derive(Debug)]
pub struct RawMessage {
    raw: String,
    kind: Mutex<Option<MessageType>>,
}

impl RawMessage {
    pub fn new(raw: impl Into<String>) -> Self {
        RawMessage {
            raw: raw.into(),
            kind: Mutex::new(None),
        }
    }

    /// The unparsed line, exactly as received (no trailing CRLF).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Classify the line, filling the lazy cache on first read. Returns
    /// `MessageType::Unknown` on a partial/malformed line; callers that
    /// need to know *why* should call [`RawMessage::classify`] instead.
    pub fn kind(&self) -> MessageType {
        let mut cache = self.kind.lock();
        if let Some(kind) = *cache {
            return kind;
        }
        let kind = classify_line(&self.raw).unwrap_or(MessageType::Unknown);
        *cache = Some(kind);
        kind
    }

    /// Classify the line, surfacing the partial-message error instead of
    /// collapsing it into `Unknown`.
    pub fn classify(&self) -> Result<MessageType, Error> {
        let result = classify_line(&self.raw);
        let mut cache = self.kind.lock();
        *cache = Some(*result.as_ref().unwrap_or(&MessageType::Unknown));
        result
    }

    /// Full IRCv3 grammar parse (tags map, prefix, command, params), for
    /// callers that need more than the handful of fields the classifier
    /// extracts directly -- e.g. reading an arbitrary tag off a PRIVMSG
    /// rather than just `id`. `None` on a line the grammar can't parse at
    /// all; a line that classifies fine may still fail here if it has
    /// trailing garbage the strict grammar doesn't accept.
    pub fn parsed(&self) -> Option<super::IrcLine<'_>> {
        super::IrcLine::parse(&self.raw).ok().map(|(_, line)| line)
    }
}

impl Clone for RawMessage {
    fn clone(&self) -> Self {
        RawMessage {
            raw: self.raw.clone(),
            kind: Mutex::new(*self.kind.lock()),
        }
    }
}

impl std::fmt::Display for RawMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Extract the channel list from a JOIN/PART echo: take the final
/// space-separated token, split on `,`, keep only tokens prefixed `#`, and
/// return them lowercased with the `#` stripped.
pub fn parse_channel_list(raw: &str) -> Vec<String> {
    let last = match raw.rsplit(' ').next() {
        Some(last) => last,
        None => return Vec::new(),
    };
    last.split(',')
        .filter_map(|tok| tok.strip_prefix('#'))
        .map(|name| name.to_ascii_lowercase())
        .collect()
}

/// Extract the PING payload: the suffix of the line after the `PING` verb,
/// including the leading space, so the PONG reply is a byte-identical echo
/// with the verb swapped.
pub fn parse_ping_payload(raw: &str) -> &str {
    raw.strip_prefix("PING").unwrap_or(raw)
}

/// Extract the channel a PRIVMSG was sent to: the token immediately
/// following the `PRIVMSG ` verb.
pub fn parse_privmsg_channel(raw: &str) -> Option<&str> {
    let idx = raw.find("PRIVMSG ")?;
    raw[idx + "PRIVMSG ".len()..].split(' ').next()
}

/// Extract the `id=` tag value from a tagged line: the text between `;id=`
/// and the next `;`. Returns `None` if the line has no tags or no `id` tag.
pub fn parse_message_id(raw: &str) -> Option<&str> {
    if !raw.starts_with('@') {
        return None;
    }
    let marker = ";id=";
    let start = if raw.starts_with("@id=") {
        "@id=".len()
    } else {
        let idx = raw.find(marker)?;
        idx + marker.len()
    };
    let rest = &raw[start..];
    let end = rest.find(';').unwrap_or_else(|| rest.find(' ').unwrap_or(rest.len()));
    Some(&rest[..end])
}
