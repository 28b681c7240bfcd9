//! A connection fleet and multiplexer for ingesting Twitch IRC chat at
//! scale: many channels spread across a bounded pool of IRC connections,
//! each kept under its JOIN weight capacity, with channels that lose their
//! connection surfaced for re-Join rather than silently dropped.
//!
//! The entry point is [`manager::Manager`]; [`config::FleetConfig`]
//! configures it, and [`controller`] defines the seam a deployment uses to
//! drive it from an external channel registry.

#[macro_use]
extern crate log;

pub mod channel;
pub mod closer;
pub mod config;
pub mod connection;
pub mod controller;
pub mod errors;
pub mod irc;
pub mod line_client;
pub mod manager;
pub mod rate_limiter;
#[cfg(feature = "redis-store")]
pub mod redis_store;
#[cfg(test)]
mod test_support;
mod tls;

pub use channel::{ChannelSubscription, ConnectionKey};
pub use config::{FleetConfig, FleetConfigBuilder};
pub use connection::Connection;
pub use errors::{DisconnectReason, Error};
pub use irc::{Capability, ClientMessage, MessageType, RawMessage};
pub use manager::{Manager, WorkerGroup};
pub use rate_limiter::{NoopStore, RateLimitStore, RateLimiter};
