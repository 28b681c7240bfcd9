//! Connection (C3): one Line Client plus the channel bookkeeping and
//! PING/PONG middleware that make it fit for the Manager's bin-packing.
//! Grounded in `pkg/manager/connection.go`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::channel::{ChannelSubscription, ConnectionKey};
use crate::config::FleetConfig;
use crate::errors::{DisconnectReason, Error};
use crate::irc::{parse_channel_list, parse_ping_payload, ClientMessage, MessageType, RawMessage};
use crate::line_client::LineClient;

/// Callback invoked for every line this connection's Line Client receives,
/// after PING/PONG middleware has had a chance to intercept it.
pub type MessageHandler = Arc<dyn Fn(ConnectionKey, RawMessage) + Send + Sync>;

struct ConnectionState {
    channels: HashMap<String, ChannelSubscription>,
    capacity_used: u32,
}

/// A single IRC socket and the channels assigned to it. `capacity_remaining`
/// only changes on a confirmed JOIN/PART echo, never speculatively — a
/// channel that's been admitted but not yet echoed still counts against
/// capacity: admission is pessimistic.
pub struct Connection {
    key: ConnectionKey,
    config: Arc<FleetConfig>,
    line_client: Arc<LineClient>,
    state: Mutex<ConnectionState>,
    parted_out: mpsc::UnboundedSender<String>,
}

impl Connection {
    /// `parted_out` is the Manager's `partedIn` sink: every channel this
    /// connection confirms a PART echo for is sent here so the Manager's GC
    /// worker can drop it from the channel index. Capacity is still freed
    /// locally the instant the echo lands, regardless of whether anyone is
    /// listening on the other end.
    pub fn new(
        key: ConnectionKey,
        config: Arc<FleetConfig>,
        on_message: MessageHandler,
        parted_out: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let line_client =
            Arc::new(LineClient::new(config.write_buffer).with_capabilities(config.capabilities.clone()));

        let conn = Arc::new(Connection {
            key,
            config,
            line_client,
            state: Mutex::new(ConnectionState {
                channels: HashMap::new(),
                capacity_used: 0,
            }),
            parted_out,
        });

        let weak_self = Arc::downgrade(&conn);
        conn.line_client.on_message(move |msg: RawMessage| {
            if let Some(conn) = weak_self.upgrade() {
                conn.handle_incoming(msg, &on_message);
            }
        });

        conn
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Resolves once the Line Client's handshake has completed.
    pub fn connected(&self) -> crate::closer::Closer {
        self.line_client.connected()
    }

    /// Drive the socket until it closes. Returns once both the reader and
    /// writer workers have stopped.
    pub async fn run(&self) -> Result<DisconnectReason, Error> {
        let host = self
            .config
            .address_tls
            .split(':')
            .next()
            .unwrap_or(&self.config.address_tls)
            .to_owned();
        let address = if self.config.use_tls {
            &self.config.address_tls
        } else {
            &self.config.address
        };
        self.line_client
            .connect(
                &host,
                address,
                self.config.use_tls,
                self.config.tcp_keepalive,
                &self.config.user,
                &self.config.oauth,
            )
            .await
    }

    pub fn disconnect(&self) {
        self.line_client.disconnect();
    }

    /// Drive the connection over an already-established stream instead of
    /// dialing one, so tests can hand it an in-memory duplex half.
    pub async fn run_with_stream<S>(&self, stream: S) -> Result<DisconnectReason, Error>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        self.line_client.run(stream, &self.config.user, &self.config.oauth).await
    }

    /// Remaining weight this connection can admit before it's full.
    pub fn capacity_remaining(&self) -> u32 {
        let state = self.state.lock();
        self.config.connection_capacity.saturating_sub(state.capacity_used)
    }

    pub fn has_capacity(&self, weight: u32) -> bool {
        self.capacity_remaining() >= weight
    }

    /// Admit `name` at `weight`, send the JOIN line, and return the
    /// subscription record. Admission is pessimistic: capacity is taken
    /// immediately, before the server has echoed the JOIN.
    pub async fn join(&self, name: &str, weight: u32) -> Result<(), Error> {
        let lowered = name.to_ascii_lowercase();
        {
            let mut state = self.state.lock();
            if state.channels.contains_key(&lowered) {
                return Err(Error::AlreadyJoined);
            }
            let sub = ChannelSubscription::new(&lowered, weight, self.config.connection_capacity, self.key);
            state.capacity_used += sub.weight;
            state.channels.insert(lowered.clone(), sub);
        }
        if let Err(e) = self
            .line_client
            .send(&ClientMessage::Join(vec![lowered.clone()]))
            .await
        {
            let mut state = self.state.lock();
            if let Some(sub) = state.channels.remove(&lowered) {
                state.capacity_used = state.capacity_used.saturating_sub(sub.weight);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Send PART. Capacity is only released once the PART echo arrives
    /// (see `handle_incoming`); this just asks the server to leave.
    pub async fn part(&self, name: &str) -> Result<(), Error> {
        let lowered = name.to_ascii_lowercase();
        {
            let state = self.state.lock();
            if !state.channels.contains_key(&lowered) {
                return Err(Error::NotFound);
            }
        }
        self.line_client.send(&ClientMessage::Part(vec![lowered])).await
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.state.lock().channels.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().channels.is_empty()
    }

    fn handle_incoming(&self, msg: RawMessage, on_message: &MessageHandler) {
        match msg.kind() {
            MessageType::Ping => {
                // Enqueued synchronously, before `on_message` below runs, so the
                // PONG is handed to the writer ahead of anything the forwarded
                // callback might itself trigger (spec.md §5: "A PONG for a given
                // PING is written before the forwarded callback runs").
                let payload = parse_ping_payload(msg.raw()).to_owned();
                if let Err(e) = self.line_client.try_send(&ClientMessage::Pong(payload)) {
                    warn!("failed to queue PONG for connection {}: {}", self.key, e);
                }
            }
            MessageType::Join => {
                for name in parse_channel_list(msg.raw()) {
                    let mut state = self.state.lock();
                    if let Some(sub) = state.channels.get_mut(&name) {
                        sub.set_joined(true);
                    }
                }
            }
            MessageType::Part => {
                for name in parse_channel_list(msg.raw()) {
                    let removed = {
                        let mut state = self.state.lock();
                        if let Some(sub) = state.channels.remove(&name) {
                            state.capacity_used = state.capacity_used.saturating_sub(sub.weight);
                            true
                        } else {
                            false
                        }
                    };
                    if removed {
                        let _ = self.parted_out.send(name);
                    }
                }
            }
            _ => {}
        }
        on_message(self.key, msg);
    }
}

/// Best-effort keepalive: send a PING of our own on an idle timer so a dead
/// peer that isn't actively closing the socket is still detected promptly.
/// Twitch doesn't require this (it PINGs first), but it bounds the worst
/// case for a half-open connection.
pub async fn idle_ping_loop(conn: Arc<Connection>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if conn.line_client.send_string("PING :tmi.twitch.tv").await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfigBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> Arc<FleetConfig> {
        Arc::new(
            FleetConfigBuilder::for_user("bot", "oauth:x")
                .connection_capacity(2)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn join_is_rejected_when_already_present() {
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let (parted_tx, _parted_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            ConnectionKey::new(1),
            test_config(),
            Arc::new(move |_key, _msg| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }),
            parted_tx,
        );
        // Directly exercise the bookkeeping without a live socket: insert
        // via the internal state the same way `join` would, bypassing the
        // network send so the test doesn't need a live peer.
        {
            let mut state = conn.state.lock();
            let sub = ChannelSubscription::new("forsen", 1, 2, conn.key());
            state.capacity_used += sub.weight;
            state.channels.insert("forsen".to_owned(), sub);
        }
        assert_eq!(conn.capacity_remaining(), 1);
        assert!(!conn.has_capacity(2));
        assert!(conn.has_capacity(1));
    }

    #[test]
    fn part_echo_releases_capacity() {
        let (parted_tx, mut parted_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(ConnectionKey::new(1), test_config(), Arc::new(|_, _| {}), parted_tx);
        {
            let mut state = conn.state.lock();
            let sub = ChannelSubscription::new("forsen", 2, 2, conn.key());
            state.capacity_used += sub.weight;
            state.channels.insert("forsen".to_owned(), sub);
        }
        assert_eq!(conn.capacity_remaining(), 0);
        conn.handle_incoming(
            RawMessage::new(":bot!bot@bot.tmi.twitch.tv PART #forsen"),
            &(Arc::new(|_, _| {}) as MessageHandler),
        );
        assert_eq!(conn.capacity_remaining(), 2);
        assert!(conn.is_empty());
        assert_eq!(parted_rx.try_recv().unwrap(), "forsen");
    }

    /// Scenario 4 from spec.md §8, end to end over an in-memory socket: a
    /// PING must be answered with a byte-identical PONG on the same
    /// connection, written before the unified callback observes the PING
    /// frame.
    #[tokio::test]
    async fn ping_is_answered_before_the_callback_sees_it() {
        use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

        let (client_side, mut server_side) = crate::test_support::duplex(4096);
        let (parted_tx, _parted_rx) = mpsc::unbounded_channel();
        let seen_ping_first = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_ping_first_clone = seen_ping_first.clone();
        let conn = Connection::new(
            ConnectionKey::new(1),
            test_config(),
            Arc::new(move |_key, msg| {
                if msg.kind() == MessageType::Ping {
                    seen_ping_first_clone.store(true, Ordering::SeqCst);
                }
            }),
            parted_tx,
        );

        let run_conn = conn.clone();
        tokio::spawn(async move {
            let _ = run_conn.run_with_stream(client_side).await;
        });

        // Drain the CAP/PASS/NICK handshake lines.
        {
            let mut reader = BufReader::new(&mut server_side);
            for _ in 0..3 {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
            }
        }

        server_side.write_all(b"PING :tmi.twitch.tv\r\n").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), server_side.read(&mut buf))
            .await
            .expect("no PONG observed in time")
            .unwrap();
        assert_eq!(&buf[..n], b"PONG :tmi.twitch.tv\r\n");
        assert!(seen_ping_first.load(Ordering::SeqCst));

        conn.disconnect();
    }
}
