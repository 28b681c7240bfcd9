//! The Manager (C5): owns the connection pool, assigns channels to
//! connections by bin-packing weight against capacity, and re-surfaces
//! channels that lost their connection so a caller can re-Join them.
//! Grounded in `pkg/manager/manager.go`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::channel::ConnectionKey;
use crate::closer::{Closer, CloserHandle};
use crate::config::FleetConfig;
use crate::connection::{idle_ping_loop, Connection, MessageHandler};
use crate::errors::{DisconnectReason, Error};
use crate::rate_limiter::RateLimiter;

/// How often the GC sweep looks for connections left with zero channels
/// after a PART echo, and tears them down.
const GC_INTERVAL: Duration = Duration::from_secs(30);

struct ManagerState {
    config: Arc<FleetConfig>,
    connections: HashMap<ConnectionKey, Arc<Connection>>,
    channel_index: HashMap<String, ConnectionKey>,
}

/// Owns every live Connection, and is the only thing that knows which
/// connection a channel currently lives on.
pub struct Manager {
    state: Mutex<ManagerState>,
    next_key: AtomicU64,
    rate_limiter: Arc<RateLimiter>,
    on_message: MessageHandler,
    closing: Mutex<Closer>,
    closing_handle: Mutex<Option<CloserHandle>>,
    orphan_tx: mpsc::UnboundedSender<String>,
    orphan_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    parted_tx: mpsc::UnboundedSender<String>,
    /// One handle per spawned Connection run-task, so `shutdown()` can hand
    /// back something a caller can wait on (spec.md §4.5: "returns the
    /// worker group so callers can wait for all Connection workers to
    /// finish"). Drained (not just read) by `shutdown()`.
    run_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Returned by [`Manager::shutdown`]: every Connection run-task that was
/// live at the moment of shutdown, joinable so a caller can block until the
/// whole fleet has actually stopped rather than just requested to stop.
pub struct WorkerGroup {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerGroup {
    /// Resolves once every Connection worker this group was built from has
    /// finished (spec.md §8 testable property 6: "`wait()` on the worker
    /// group completes in finite time").
    pub async fn wait(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl Manager {
    pub fn new(config: FleetConfig, rate_limiter: Arc<RateLimiter>, on_message: MessageHandler) -> Arc<Self> {
        let (closing_handle, closing) = Closer::new();
        let (orphan_tx, orphan_rx) = mpsc::unbounded_channel();
        let (parted_tx, parted_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Manager {
            state: Mutex::new(ManagerState {
                config: Arc::new(config),
                connections: HashMap::new(),
                channel_index: HashMap::new(),
            }),
            next_key: AtomicU64::new(0),
            rate_limiter,
            on_message,
            closing: Mutex::new(closing),
            closing_handle: Mutex::new(Some(closing_handle)),
            orphan_tx,
            orphan_rx: Mutex::new(Some(orphan_rx)),
            parted_tx,
            run_handles: Mutex::new(Vec::new()),
        });
        tokio::spawn(manager.clone().run_parted_gc(parted_rx));
        tokio::spawn(manager.clone().run_rate_limit_keepalive());
        manager
    }

    /// Idle keep-alive for the rate limiter's shared store (spec.md §4.4).
    /// A ping failure is logged and surfaced as a warning; it never cancels
    /// a pending Join/Part — those are only cancelled by `shutdown()`.
    async fn run_rate_limit_keepalive(self: Arc<Self>) {
        let cancel = self.closing.lock().clone();
        self.rate_limiter
            .run_keepalive(&cancel, |e| warn!("rate limit store keepalive failed: {}", e))
            .await;
    }

    /// The single long-lived GC worker: drains
    /// confirmed-PART notifications from every Connection and drops the
    /// corresponding entry from the channel index. This is the only place
    /// that removes a channel from `channel_index` for a deliberate Part —
    /// a Part() call itself only forwards the request to the Connection.
    async fn run_parted_gc(self: Arc<Self>, mut parted_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(name) = parted_rx.recv().await {
            self.state.lock().channel_index.remove(&name);
        }
    }

    fn allocate_key(&self) -> ConnectionKey {
        ConnectionKey::new(self.next_key.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn is_closing(&self) -> bool {
        self.closing.lock().is_fired()
    }

    /// Stream of channel names that lost their connection to a
    /// server-initiated disconnect and need to be re-Joined by the caller.
    /// Channels parted deliberately, or dropped by `shutdown()`, never
    /// appear here.
    pub fn orphan_receiver(self: &Arc<Self>) -> mpsc::UnboundedReceiver<String> {
        self.orphan_rx
            .lock()
            .take()
            .expect("orphan_receiver already taken")
    }

    /// Join `name` at `weight`, picking an existing connection with enough
    /// remaining capacity or spawning a new one if none fits.
    pub async fn join(self: &Arc<Self>, name: &str, weight: u32) -> Result<(), Error> {
        if self.is_closing() {
            return Err(Error::Closing);
        }
        let lowered = name.to_ascii_lowercase();
        // Clamped once, up front, so both the capacity search and the
        // eventual admission use the same bounded value (spec.md §8:
        // "Weight 0 or negative is clamped to 1; weight > ConnectionCapacity
        // is clamped to ConnectionCapacity") -- a raw weight of 0 must never
        // reach `has_capacity`/`find_connection_with_capacity`, or a full
        // connection looks like it still has room for a "0-weight" channel
        // that actually admits at weight 1.
        let capacity = self.state.lock().config.connection_capacity;
        let weight = crate::channel::clamp_weight(weight, capacity);
        {
            let state = self.state.lock();
            if state.channel_index.contains_key(&lowered) {
                return Err(Error::AlreadyJoined);
            }
        }

        let cancel = self.closing.lock().clone();
        self.rate_limiter.wait_to_join(&cancel).await?;

        let connection = self.connection_for_weight(weight).await?;

        // Reserve the name under the manager lock before releasing it and
        // calling into the connection, matching spec.md §4.5 steps 6-7
        // ("Construct the Channel subscription... insert into M.channels...
        // Release the manager lock. Call connection.join"). Re-checking
        // here (not just at the top of this function) is what actually
        // closes the race: two concurrent Joins for the same name can both
        // pass the check above before either reserves it, but only one can
        // win this second check, since it runs while holding the lock right
        // next to the insert.
        {
            let mut state = self.state.lock();
            if state.channel_index.contains_key(&lowered) {
                return Err(Error::AlreadyJoined);
            }
            state.channel_index.insert(lowered.clone(), connection.key());
        }

        if let Err(e) = connection.join(&lowered, weight).await {
            self.state.lock().channel_index.remove(&lowered);
            return Err(e);
        }
        Ok(())
    }

    /// Part `name`. Neither capacity nor the channel index entry are
    /// released here — both wait for the server's PART echo, which the
    /// Connection reports back through `parted_tx` to the GC worker.
    pub async fn part(self: &Arc<Self>, name: &str) -> Result<(), Error> {
        if self.is_closing() {
            return Err(Error::Closing);
        }
        let lowered = name.to_ascii_lowercase();
        let connection = {
            let state = self.state.lock();
            let key = state.channel_index.get(&lowered).copied().ok_or(Error::NotFound)?;
            state.connections.get(&key).cloned()
        };
        match connection {
            Some(conn) => conn.part(&lowered).await,
            None => Err(Error::NotFound),
        }
    }

    /// Find a connection with enough capacity, or spawn a new one. Bin-
    /// packing strategy: first existing connection (by key order) with
    /// enough remaining capacity wins, so channels accumulate on early
    /// connections before a new one is opened.
    ///
    /// Per spec.md §4.5 step 5, the scan is repeated after `WaitToAuth`
    /// before spawning: another Join that was racing this one may have
    /// created or freed a slot while this caller was waiting out the auth
    /// rate limit, and re-checking avoids spawning a connection nobody ends
    /// up needing.
    async fn connection_for_weight(self: &Arc<Self>, weight: u32) -> Result<Arc<Connection>, Error> {
        if let Some(conn) = self.find_connection_with_capacity(weight) {
            return Ok(conn);
        }
        let cancel = self.closing.lock().clone();
        self.rate_limiter.wait_to_auth(&cancel).await?;
        if let Some(conn) = self.find_connection_with_capacity(weight) {
            return Ok(conn);
        }
        self.spawn_connection().await
    }

    fn find_connection_with_capacity(&self, weight: u32) -> Option<Arc<Connection>> {
        let state = self.state.lock();
        let mut keys: Vec<_> = state.connections.keys().copied().collect();
        keys.sort();
        for key in keys {
            if let Some(conn) = state.connections.get(&key) {
                if conn.has_capacity(weight) {
                    return Some(conn.clone());
                }
            }
        }
        None
    }

    async fn spawn_connection(self: &Arc<Self>) -> Result<Arc<Connection>, Error> {
        let (connection, keepalive) = self.register_connection();
        let run_conn = connection.clone();
        self.spawn_run_task(connection.key(), async move { run_conn.run().await });
        tokio::spawn(idle_ping_loop(connection.clone(), keepalive));
        connection.connected().wait().await;
        Ok(connection)
    }

    /// Test-only seam: register a connection the same way `spawn_connection`
    /// does, but drive it over a caller-supplied stream (e.g. an in-memory
    /// duplex half) instead of dialing the real network, so
    /// Manager-level scenarios can be driven deterministically.
    #[cfg(test)]
    pub(crate) async fn spawn_connection_with_stream<S>(self: &Arc<Self>, stream: S) -> Arc<Connection>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, _keepalive) = self.register_connection();
        let run_conn = connection.clone();
        self.spawn_run_task(connection.key(), async move { run_conn.run_with_stream(stream).await });
        connection.connected().wait().await;
        connection
    }

    /// Allocate a key, build the Connection, and insert it into the pool.
    /// Shared by the real dialer path and the test stream-injection path.
    fn register_connection(self: &Arc<Self>) -> (Arc<Connection>, Duration) {
        let (config, key) = {
            let state = self.state.lock();
            (state.config.clone(), self.allocate_key())
        };
        let on_message = self.on_message.clone();
        let connection = Connection::new(key, config.clone(), on_message, self.parted_tx.clone());
        self.state.lock().connections.insert(key, connection.clone());
        debug!("spawned connection {}", key);
        (connection, config.tcp_keepalive)
    }

    /// Spawn the task that drives `run` to completion and retires the
    /// connection from the pool once it does. The task's handle is kept in
    /// `run_handles` so `shutdown()` has something to hand back for callers
    /// to wait on.
    fn spawn_run_task(
        self: &Arc<Self>,
        key: ConnectionKey,
        run: impl std::future::Future<Output = Result<DisconnectReason, Error>> + Send + 'static,
    ) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let reason = run.await;
            manager.retire(key, reason).await;
        });
        self.run_handles.lock().push(handle);
    }

    /// Called once a Connection's socket loop has returned. Removes it from
    /// the pool and, unless the Manager itself is shutting down, re-emits
    /// its channels as orphans.
    async fn retire(self: Arc<Self>, key: ConnectionKey, reason: Result<DisconnectReason, Error>) {
        let channel_names = {
            let mut state = self.state.lock();
            let conn = match state.connections.remove(&key) {
                Some(conn) => conn,
                None => return,
            };
            let names = conn.channel_names();
            for name in &names {
                state.channel_index.remove(name);
            }
            names
        };

        let closing = self.is_closing();
        let server_initiated = matches!(reason, Ok(DisconnectReason::ServerInitiated) | Err(_));
        if !closing && server_initiated {
            warn!("connection {} lost, orphaning {} channels", key, channel_names.len());
            for name in channel_names {
                let _ = self.orphan_tx.send(name);
            }
        } else {
            debug!("connection {} retired ({:?})", key, reason);
        }
    }

    /// Replace the credentials used to authenticate future connections.
    /// Connections already open keep using whatever they authenticated
    /// with; only connections spawned after this call see the new value.
    pub fn update_oauth(&self, oauth: impl Into<String>) {
        let mut state = self.state.lock();
        let mut next = (*state.config).clone();
        next.oauth = oauth.into();
        state.config = Arc::new(next);
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channel_index.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Background sweep: disconnect any connection left with zero channels
    /// after a PART echo, so an idle connection doesn't sit open forever.
    pub async fn run_gc(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(GC_INTERVAL);
        loop {
            ticker.tick().await;
            if self.is_closing() {
                return;
            }
            let empties: Vec<Arc<Connection>> = {
                let state = self.state.lock();
                state
                    .connections
                    .values()
                    .filter(|c| c.is_empty())
                    .cloned()
                    .collect()
            };
            for conn in empties {
                conn.disconnect();
            }
        }
    }

    /// Disconnect every connection and stop admitting new Joins. Orphans
    /// are not emitted for connections torn down this way. Returns the
    /// worker group for every Connection run-task live at this moment
    /// (spec.md §4.5); callers that need `Shutdown` to fully complete
    /// before proceeding should call `.wait()` on it.
    pub async fn shutdown(self: &Arc<Self>) -> WorkerGroup {
        if let Some(handle) = self.closing_handle.lock().take() {
            handle.fire();
        }
        let connections: Vec<Arc<Connection>> = self.state.lock().connections.values().cloned().collect();
        for conn in connections {
            conn.disconnect();
        }
        let handles = std::mem::take(&mut *self.run_handles.lock());
        WorkerGroup { handles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfigBuilder;
    use crate::rate_limiter::{NoopStore, RateLimiter};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::{delay_for, timeout};

    fn test_manager(capacity: u32) -> Arc<Manager> {
        let config = FleetConfigBuilder::for_user("bot", "oauth:x")
            .connection_capacity(capacity)
            .build()
            .unwrap();
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::new(NoopStore::default()),
            "test-join",
            "test-auth",
            1000,
            1000,
            Duration::from_secs(60),
        ));
        Manager::new(config, rate_limiter, Arc::new(|_key, _msg| {}))
    }

    /// Drains the three handshake lines (`CAP REQ`, `PASS`, `NICK`) a newly
    /// connected Connection writes, so later reads on the server half see
    /// only what the test itself injects.
    async fn drain_handshake<S: tokio::io::AsyncRead + Unpin>(server: &mut S) {
        let mut reader = BufReader::new(server);
        for _ in 0..3 {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            delay_for(Duration::from_millis(10)).await;
        }
        panic!("condition did not become true in time");
    }

    #[tokio::test]
    async fn already_joined_is_rejected_without_a_new_connection() {
        let manager = test_manager(50);
        let (client_side, mut server_side) = crate::test_support::duplex(4096);
        manager.spawn_connection_with_stream(client_side).await;
        drain_handshake(&mut server_side).await;

        manager.join("forsen", 1).await.unwrap();
        assert_eq!(manager.channel_count(), 1);

        let err = manager.join("Forsen", 1).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyJoined));
        assert_eq!(manager.channel_count(), 1);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_subsequent_join_and_part() {
        let manager = test_manager(50);
        manager.shutdown().await.wait().await;
        assert!(matches!(manager.join("forsen", 1).await.unwrap_err(), Error::Closing));
        assert!(matches!(manager.part("forsen").await.unwrap_err(), Error::Closing));
    }

    /// Spec.md §8 testable property 6: `wait()` on the worker group
    /// returned by `shutdown()` completes in finite time, and it only
    /// resolves once every Connection run-task that was live at shutdown
    /// has actually finished.
    #[tokio::test]
    async fn shutdown_worker_group_waits_for_every_connection_to_finish() {
        let manager = test_manager(50);
        let (client_side, mut server_side) = crate::test_support::duplex(4096);
        manager.spawn_connection_with_stream(client_side).await;
        drain_handshake(&mut server_side).await;

        let group = timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .expect("shutdown did not return in time");
        timeout(Duration::from_secs(2), group.wait())
            .await
            .expect("worker group did not finish in time");
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn bin_packing_fills_existing_connections_before_spilling_over() {
        let manager = test_manager(2);
        let (client_a, mut server_a) = crate::test_support::duplex(4096);
        let (client_b, mut server_b) = crate::test_support::duplex(4096);
        let conn_a = manager.spawn_connection_with_stream(client_a).await;
        let conn_b = manager.spawn_connection_with_stream(client_b).await;
        drain_handshake(&mut server_a).await;
        drain_handshake(&mut server_b).await;

        // Fill conn_a's capacity exactly, so the next Join can't fit there.
        manager.join("x", 2).await.unwrap();
        manager.join("y", 1).await.unwrap();

        let state = manager.state.lock();
        assert_eq!(state.channel_index["x"], conn_a.key());
        assert_eq!(state.channel_index["y"], conn_b.key());
    }

    #[tokio::test]
    async fn server_initiated_disconnect_emits_orphans_and_clears_index() {
        let manager = test_manager(50);
        let (client_side, mut server_side) = crate::test_support::duplex(4096);
        manager.spawn_connection_with_stream(client_side).await;
        drain_handshake(&mut server_side).await;

        manager.join("x", 1).await.unwrap();
        manager.join("y", 1).await.unwrap();
        assert_eq!(manager.channel_count(), 2);

        let mut orphans = manager.orphan_receiver();
        drop(server_side); // simulate the peer closing the socket

        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let name = timeout(Duration::from_secs(2), orphans.recv())
                .await
                .expect("orphan not emitted in time")
                .expect("orphan channel closed early");
            seen.insert(name);
        }
        let expected: std::collections::HashSet<String> = vec!["x".to_owned(), "y".to_owned()].into_iter().collect();
        assert_eq!(seen, expected);

        wait_until(|| manager.channel_count() == 0).await;
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn part_does_not_free_the_channel_until_the_echo_arrives() {
        let manager = test_manager(50);
        let (client_side, mut server_side) = crate::test_support::duplex(4096);
        manager.spawn_connection_with_stream(client_side).await;
        drain_handshake(&mut server_side).await;

        manager.join("z", 1).await.unwrap();
        manager.part("z").await.unwrap();
        // No echo yet: still tracked.
        assert_eq!(manager.channel_count(), 1);

        server_side
            .write_all(b":bot!bot@bot.tmi.twitch.tv PART #z\r\n")
            .await
            .unwrap();

        wait_until(|| manager.channel_count() == 0).await;
    }
}
