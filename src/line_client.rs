//! The Line Client (C1): a single CRLF-framed TCP/TLS connection to Twitch
//! IRC, grounded in `pkg/irc/client.go`. Knows nothing about channels,
//! capacity or rate limits — a Connection wraps one of these and adds that
//! bookkeeping.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::closer::{Closer, CloserHandle};
use crate::errors::{DisconnectReason, Error};
use crate::irc::{Capability, ClientMessage, RawMessage};
use crate::tls;

type OnMessage = Arc<dyn Fn(RawMessage) + Send + Sync>;

/// A raw line-oriented IRC connection. One instance is good for exactly one
/// `connect()` call; Connection discards it and builds a fresh one rather
/// than reusing it across reconnects.
pub struct LineClient {
    capabilities: SmallVec<[Capability; 3]>,
    write_tx: mpsc::Sender<String>,
    write_rx: Mutex<Option<mpsc::Receiver<String>>>,
    on_message: Mutex<Option<OnMessage>>,
    connected: Mutex<Closer>,
    connected_handle: Mutex<Option<CloserHandle>>,
    disconnect: Mutex<(CloserHandle, Closer)>,
}

impl LineClient {
    pub fn new(write_buffer: usize) -> Self {
        let (write_tx, write_rx) = mpsc::channel(write_buffer.max(1));
        let (connected_handle, connected) = Closer::new();
        let disconnect_pair = Closer::new();
        LineClient {
            capabilities: SmallVec::new(),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            on_message: Mutex::new(None),
            connected: Mutex::new(connected),
            connected_handle: Mutex::new(Some(connected_handle)),
            disconnect: Mutex::new(disconnect_pair),
        }
    }

    /// Request capabilities on connect. Must be called before `connect()`.
    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = caps.into_iter().collect();
        self
    }

    /// Register the callback invoked once per line the reader receives.
    /// Must be called before `connect()`.
    pub fn on_message(&self, cb: impl Fn(RawMessage) + Send + Sync + 'static) {
        *self.on_message.lock() = Some(Arc::new(cb));
    }

    /// Resolves once the handshake has completed and the reader loop is
    /// live. Edge-triggered: a caller that subscribes after the edge has
    /// already passed still resolves immediately.
    pub fn connected(&self) -> Closer {
        self.connected.lock().clone()
    }

    /// Queue a line to be sent, CRLF appended by the writer task. Blocks
    /// (applying back-pressure) once `write_buffer` lines are in flight.
    pub async fn send_string(&self, line: impl Into<String>) -> Result<(), Error> {
        self.write_tx
            .clone()
            .send(line.into())
            .await
            .map_err(|_| Error::SendError)
    }

    pub async fn send(&self, message: &ClientMessage) -> Result<(), Error> {
        self.send_string(message.to_string()).await
    }

    /// Non-blocking enqueue, for callers that cannot `.await` (the reader's
    /// synchronous message middleware). Grounded in `pkg/irc/client.go`'s
    /// `sendString`, which hands a line straight to the write channel inline
    /// rather than spawning a goroutine for it -- the enqueue itself is what
    /// has to happen before the caller's next step, not the eventual write.
    /// Fails if the writer's queue is full rather than blocking.
    pub fn try_send_string(&self, line: impl Into<String>) -> Result<(), Error> {
        self.write_tx.clone().try_send(line.into()).map_err(|_| Error::SendError)
    }

    pub fn try_send(&self, message: &ClientMessage) -> Result<(), Error> {
        self.try_send_string(message.to_string())
    }

    /// Idempotent: closes the socket and causes a concurrent `connect()` to
    /// return `Ok(DisconnectReason::ClientInitiated)`.
    pub fn disconnect(&self) {
        self.disconnect.lock().0.fire();
    }

    /// Dial `address` (TLS if `use_tls`), run the handshake, and drive the
    /// connection until it closes for any reason. A handshake I/O failure
    /// returns `Err` directly; once the steady-state reader/writer loop is
    /// running, every termination is reported as an `Ok(DisconnectReason)`.
    pub async fn connect(
        &self,
        host: &str,
        address: &str,
        use_tls: bool,
        keepalive: std::time::Duration,
        user: &str,
        oauth: &str,
    ) -> Result<DisconnectReason, Error> {
        if use_tls {
            let connector = tls::connector();
            let stream = tls::connect_tls(&connector, host, address, keepalive).await?;
            self.run(stream, user, oauth).await
        } else {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true).ok();
            stream.set_keepalive(Some(keepalive)).ok();
            self.run(stream, user, oauth).await
        }
    }

    /// Drive an already-established stream through the handshake and
    /// steady-state loop. Split out from `connect()` so tests can supply a
    /// an in-memory duplex half in place of a real TCP/TLS socket.
    pub(crate) async fn run<S>(&self, stream: S, user: &str, oauth: &str) -> Result<DisconnectReason, Error>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);

        if !self.capabilities.is_empty() {
            let line = ClientMessage::CapRequest(self.capabilities.to_vec()).to_string();
            write_line(&mut write_half, &line).await?;
        }
        write_line(&mut write_half, &ClientMessage::Pass(oauth.to_owned()).to_string()).await?;
        write_line(&mut write_half, &ClientMessage::Nick(user.to_owned()).to_string()).await?;

        if let Some(handle) = self.connected_handle.lock().take() {
            handle.fire();
        }

        let write_rx = self
            .write_rx
            .lock()
            .take()
            .expect("LineClient::connect called twice");
        let on_message = self.on_message.lock().clone();
        let disconnect_signal = self.disconnect.lock().1.clone();

        let outcome: Arc<Mutex<Option<DisconnectReason>>> = Arc::new(Mutex::new(None));

        let reader_outcome = outcome.clone();
        let reader_disconnect = disconnect_signal.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                tokio::select! {
                    _ = reader_disconnect.wait() => {
                        reader_outcome.lock().get_or_insert(DisconnectReason::ClientInitiated);
                        break;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(raw)) => {
                                if let Some(cb) = &on_message {
                                    cb(RawMessage::new(raw));
                                }
                            }
                            Ok(None) | Err(_) => {
                                reader_outcome.lock().get_or_insert(DisconnectReason::ServerInitiated);
                                break;
                            }
                        }
                    }
                }
            }
        });

        let writer_outcome = outcome.clone();
        let writer = tokio::spawn(async move {
            let mut write_rx = write_rx;
            let mut write_half = write_half;
            loop {
                tokio::select! {
                    _ = disconnect_signal.wait() => {
                        writer_outcome.lock().get_or_insert(DisconnectReason::ClientInitiated);
                        break;
                    }
                    line = write_rx.recv() => {
                        match line {
                            Some(line) => {
                                if write_line(&mut write_half, &line).await.is_err() {
                                    writer_outcome.lock().get_or_insert(DisconnectReason::ServerInitiated);
                                    break;
                                }
                            }
                            None => {
                                writer_outcome.lock().get_or_insert(DisconnectReason::ClientInitiated);
                                break;
                            }
                        }
                    }
                }
            }
        });

        let _ = tokio::join!(reader, writer);
        Ok(outcome.lock().unwrap_or(DisconnectReason::ServerInitiated))
    }
}

async fn write_line<W: AsyncWriteExt + Unpin>(w: &mut W, line: &str) -> Result<(), Error> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\r\n").await?;
    w.flush().await?;
    Ok(())
}
