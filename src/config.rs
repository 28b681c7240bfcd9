//! Process-wide tunables, taken once at Manager construction.
//!
//! These used to be mutable package-level vars (`irc.Address`,
//! `irc.ConnectionCapacity`, ...) in the system this crate replaces. Here
//! they're an immutable struct built once with `derive_builder`, matching
//! `TwitchClientConfigBuilder`'s pattern.

use std::time::Duration;

use derive_builder::Builder;
use smallvec::SmallVec;

use crate::irc::Capability;

/// Default capacity (in JOIN weight units) of a single IRC connection.
pub const DEFAULT_CONNECTION_CAPACITY: u32 = 50;

/// Plaintext IRC address Twitch listens on.
pub const DEFAULT_ADDRESS: &str = "irc.chat.twitch.tv:6667";

/// TLS IRC address Twitch listens on.
pub const DEFAULT_ADDRESS_TLS: &str = "irc.chat.twitch.tv:6697";

/// Well-known rate limit store keys, shared by every Manager instance.
pub const JOIN_RATELIMIT_KEY: &str = "twitch-irc-join-ratelimit";
pub const AUTH_RATELIMIT_KEY: &str = "twitch-irc-auth-ratelimit";

/// Configuration consumed by the fleet, built once and shared (`Arc`) across
/// every Connection the Manager spawns.
#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct FleetConfig {
    /// Twitch username used to authenticate new connections.
    pub user: String,

    /// OAuth token used to authenticate new connections. Replaced via
    /// `Manager::update_oauth`, which only affects subsequently-created
    /// connections; connections already dialed keep authenticating with
    /// the token they were spawned with until they're replaced.
    pub oauth: String,

    /// Connect over TLS. Default: true.
    #[builder(default = "true")]
    pub use_tls: bool,

    /// Plaintext address, used when `use_tls` is false.
    #[builder(default = "DEFAULT_ADDRESS.to_owned()")]
    pub address: String,

    /// TLS address, used when `use_tls` is true.
    #[builder(default = "DEFAULT_ADDRESS_TLS.to_owned()")]
    pub address_tls: String,

    /// Maximum JOIN weight a single connection may carry.
    #[builder(default = "DEFAULT_CONNECTION_CAPACITY")]
    pub connection_capacity: u32,

    /// Size of the reader's internal line buffer, in lines.
    #[builder(default = "32")]
    pub read_buffer: usize,

    /// Size of the writer's internal queue, in lines. `0` is coerced up to a
    /// single slot (a genuinely zero-capacity channel can't be constructed),
    /// so in practice `0` just means the least buffering available -- every
    /// `Send` past the first in flight back-pressures on the writer.
    #[builder(default = "0")]
    pub write_buffer: usize,

    /// TCP keep-alive interval.
    #[builder(default = "Duration::from_secs(10)")]
    pub tcp_keepalive: Duration,

    /// Join rate limit: number of JOINs allowed per `rate_limit_reset`.
    #[builder(default = "20")]
    pub rate_limit_join: u32,

    /// Auth rate limit: number of new connections allowed per
    /// `rate_limit_reset`.
    #[builder(default = "20")]
    pub rate_limit_auth: u32,

    /// Shared reset window for both rate limit counters.
    #[builder(default = "Duration::from_secs(60)")]
    pub rate_limit_reset: Duration,

    /// Capabilities requested via `CAP REQ` on every new connection.
    /// Default: `twitch.tv/tags` only, matching spec.md §6 ("Capabilities
    /// requested by default: twitch.tv/tags. Others... are available via
    /// builder for future use"). Pass `twitch.tv/commands`/`membership`
    /// here explicitly to request them too.
    #[builder(default = "smallvec::smallvec![Capability::Tags]")]
    pub capabilities: SmallVec<[Capability; 3]>,
}

impl FleetConfigBuilder {
    /// Convenience constructor mirroring the
    /// `TwitchClientConfigBuilder::default().username(..).token(..)` idiom.
    pub fn for_user(user: impl Into<String>, oauth: impl Into<String>) -> Self {
        FleetConfigBuilder::default()
            .user(user.into())
            .oauth(oauth.into())
    }
}
