//! Outgoing IRC verbs the fleet sends. Moderation commands (`/ban`,
//! `/timeout`, ...) are out of scope — this crate is read-only chat
//! ingestion, not a bot framework.

use std::fmt;

/// Capabilities requested via `CAP REQ` on connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// `twitch.tv/tags` — adds `@key=value;...` prefixes to messages.
    Tags,
    /// `twitch.tv/commands` — Twitch-specific IRC messages and commands.
    Commands,
    /// `twitch.tv/membership` — JOIN/PART/NAMES events for other users.
    Membership,
}

impl Capability {
    fn as_str(self) -> &'static str {
        match self {
            Capability::Tags => "twitch.tv/tags",
            Capability::Commands => "twitch.tv/commands",
            Capability::Membership => "twitch.tv/membership",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A line to be sent to the server, CRLF appended by the Line Client's
/// writer.
#[derive(Clone, Debug)]
pub enum ClientMessage {
    CapRequest(Vec<Capability>),
    Pass(String),
    Nick(String),
    Join(Vec<String>),
    Part(Vec<String>),
    Pong(String),
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMessage::CapRequest(caps) => write!(
                f,
                "CAP REQ :{}",
                caps.iter()
                    .map(Capability::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
            ClientMessage::Pass(token) => write!(f, "PASS {}", token),
            ClientMessage::Nick(user) => write!(f, "NICK {}", user),
            ClientMessage::Join(channels) => write!(f, "JOIN {}", join_channel_list(channels)),
            ClientMessage::Part(channels) => write!(f, "PART {}", join_channel_list(channels)),
            ClientMessage::Pong(payload) => write!(f, "PONG{}", payload),
        }
    }
}

fn join_channel_list(channels: &[String]) -> String {
    channels
        .iter()
        .map(|c| format!("#{}", c))
        .collect::<Vec<_>>()
        .join(",")
}
