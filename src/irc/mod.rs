//! IRC wire format: parsing incoming lines (C2) and formatting outgoing
//! ones.

pub mod client_messages;
pub mod message;
mod parser;

pub use client_messages::{Capability, ClientMessage};
pub use message::{
    parse_channel_list, parse_message_id, parse_ping_payload, parse_privmsg_channel, MessageType,
    RawMessage,
};
pub use parser::{IrcLine, IrcPrefix};
