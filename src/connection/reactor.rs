//! Connection reactor
//!
//! Owns the TCP socket for one connection attempt and drives it from a
//! single tokio task:
//!
//! ```text
//!   start() ──spawn──► run()
//!                       │  connect (cancellable, bounded by connect_timeout)
//!                       ▼
//!                ┌── wait for readiness (read always, write while pending)
//!                │      or a wake-up (output queued / close requested)
//!                │      │
//!                │      ├─ readable ──► Reader::read
//!                │      └─ writable ──► Writer::write
//!                └──────┘
//!                       │ error / close requested / task dropped
//!                       ▼
//!              Closing ──► socket released ──► Closed | Failed
//! ```
//!
//! All socket I/O happens on the reactor task. Higher layers plug in through
//! the [`Reader`] and [`Writer`] traits and wake the loop with
//! [`Connection::set_write_pending`].

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::listener::{deliver, lock, ConnectionListener, ListenerSet};
use super::{ConnectionDetails, ConnectionState};
use crate::error::{Error, Result};

/// Non-blocking socket operations handed to readers and writers
///
/// Both calls return `WouldBlock` when the socket is not ready.
pub trait SocketIo {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl SocketIo for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// Consumes bytes when the socket becomes readable
pub trait Reader: Send + Sync {
    /// Read what is available. An error fails the connection.
    fn read(&self, socket: &dyn SocketIo) -> Result<()>;
}

/// Produces bytes when the socket becomes writable
pub trait Writer: Send + Sync {
    /// Whether output is queued; write interest is registered only while true
    fn has_pending_data(&self) -> bool;

    /// Write as much queued output as the socket accepts. An error fails the
    /// connection.
    fn write(&self, socket: &dyn SocketIo) -> Result<()>;
}

/// Reactor tuning
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on DNS resolution plus TCP connect
    pub connect_timeout: Duration,
    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }
}

/// Traffic counters for the current and past sockets of one connection
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    connects: AtomicU64,
}

impl ConnectionStats {
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Decoded frames
    pub fn messages_in(&self) -> u64 {
        self.messages_in.load(Ordering::Relaxed)
    }

    /// Frames queued for sending
    pub fn messages_out(&self) -> u64 {
        self.messages_out.load(Ordering::Relaxed)
    }

    /// Number of successful TCP connects
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub(crate) fn record_message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }
}

/// Socket wrapper that feeds [`ConnectionStats`]
struct CountingSocket<'a> {
    stream: &'a TcpStream,
    stats: &'a ConnectionStats,
}

impl SocketIo for CountingSocket<'_> {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.try_read(buf)?;
        self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = self.stream.try_write(buf)?;
        self.stats.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

struct Inner {
    state: ConnectionState,
    /// Terminal state requested by whoever moved us to `Closing`
    close_to: ConnectionState,
    /// A reactor task currently owns the socket
    running: bool,
    /// State changes not yet delivered to listeners
    queued: VecDeque<ConnectionState>,
    /// Some thread is delivering `queued`
    notifying: bool,
}

impl Inner {
    fn set(&mut self, state: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(state),
            "illegal transition {} -> {}",
            self.state,
            state
        );
        self.state = state;
        self.queued.push_back(state);
    }
}

/// One HTSP connection and its reactor task
pub struct Connection {
    details: Arc<ConnectionDetails>,
    config: ReactorConfig,
    reader: Arc<dyn Reader>,
    writer: Arc<dyn Writer>,
    inner: Mutex<Inner>,
    wakeup: Notify,
    listeners: ListenerSet<dyn ConnectionListener>,
    stats: ConnectionStats,
}

impl Connection {
    pub fn new(
        details: Arc<ConnectionDetails>,
        config: ReactorConfig,
        reader: Arc<dyn Reader>,
        writer: Arc<dyn Writer>,
    ) -> Self {
        Self {
            details,
            config,
            reader,
            writer,
            inner: Mutex::new(Inner {
                state: ConnectionState::Closed,
                close_to: ConnectionState::Closed,
                running: false,
                queued: VecDeque::new(),
                notifying: false,
            }),
            wakeup: Notify::new(),
            listeners: ListenerSet::new("connection"),
            stats: ConnectionStats::default(),
        }
    }

    pub fn details(&self) -> &Arc<ConnectionDetails> {
        &self.details
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn is_failed(&self) -> bool {
        self.state() == ConnectionState::Failed
    }

    pub fn is_closed_or_closing(&self) -> bool {
        self.state().is_closed_or_closing()
    }

    pub fn is_closed_or_closing_or_failed(&self) -> bool {
        self.state().is_closed_or_closing_or_failed()
    }

    /// Register a state listener (held weakly)
    pub fn add_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
    }

    /// Open a fresh socket on a new reactor task
    ///
    /// Fails with [`Error::AlreadyRunning`] unless the connection is closed
    /// or failed.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let handle = self.launch()?;
        self.deliver_queued();
        Ok(handle)
    }

    /// [`start`](Self::start) without delivering the queued state changes
    ///
    /// The caller must call [`flush_notifications`](Self::flush_notifications)
    /// once it holds no lock a listener might take.
    pub(crate) fn launch(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::ConnectFailure(e.to_string()))?;
        {
            let mut inner = lock(&self.inner);
            if !inner.state.is_terminal() || inner.running {
                tracing::warn!(state = %inner.state, "Attempted to start a running connection");
                return Err(Error::AlreadyRunning);
            }
            inner.set(ConnectionState::Connecting);
            inner.close_to = ConnectionState::Closed;
            inner.running = true;
        }

        let conn = Arc::clone(self);
        Ok(runtime.spawn(async move { conn.run().await }))
    }

    /// Deliver state changes queued by [`launch`](Self::launch)
    pub(crate) fn flush_notifications(&self) {
        self.deliver_queued();
    }

    /// Close gracefully; ends in `Closed`
    pub fn close_connection(&self) {
        self.close_with(ConnectionState::Closed);
    }

    /// Close abnormally; ends in `Failed`
    pub fn fail(&self, reason: &str) {
        tracing::error!(reason = reason, "Failing HTSP connection");
        self.close_with(ConnectionState::Failed);
    }

    /// Ask the reactor to register write interest
    pub fn set_write_pending(&self) {
        if self.is_closed_or_closing_or_failed() {
            tracing::warn!("Attempting to write while closed, closing or failed - discarding");
            return;
        }
        self.wakeup.notify_one();
    }

    /// `Connected` -> `Authenticating`
    pub(crate) fn begin_authentication(&self) -> bool {
        self.transition(ConnectionState::Connected, ConnectionState::Authenticating)
    }

    /// `Authenticating` -> `Ready`
    pub(crate) fn mark_ready(&self) -> bool {
        self.transition(ConnectionState::Authenticating, ConnectionState::Ready)
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.state != from {
                tracing::debug!(state = %inner.state, expected = %from, target = %to, "Skipping state transition");
                return false;
            }
            inner.set(to);
        }
        self.deliver_queued();
        true
    }

    /// Move to `Closing`, remembering the terminal state to end in
    ///
    /// Returns `false` if already closed, closing or failed. When no reactor
    /// task owns a socket the terminal state is applied immediately.
    fn begin_close(&self, close_to: ConnectionState) -> bool {
        let finish_now = {
            let mut inner = lock(&self.inner);
            if inner.state.is_closed_or_closing_or_failed() {
                return false;
            }
            inner.set(ConnectionState::Closing);
            inner.close_to = close_to;
            !inner.running
        };

        tracing::info!("Closing HTSP connection");
        self.deliver_queued();

        if finish_now {
            self.finish_close();
        } else {
            self.wakeup.notify_one();
        }
        true
    }

    fn close_with(&self, close_to: ConnectionState) {
        if !self.begin_close(close_to) {
            tracing::warn!("Attempting to close while already closed, closing or failed");
        }
    }

    /// `Closing` -> requested terminal state; idempotent
    fn finish_close(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.running = false;
            if inner.state != ConnectionState::Closing {
                return;
            }
            let terminal = inner.close_to;
            inner.set(terminal);
        }
        self.deliver_queued();
    }

    /// Deliver queued state changes in order
    ///
    /// Only one thread delivers at a time. A transition made by another
    /// thread (or by a listener) while delivery is in progress is queued and
    /// delivered by the thread already draining, so every listener sees
    /// states in transition order.
    fn deliver_queued(&self) {
        let mut state = {
            let mut inner = lock(&self.inner);
            if inner.notifying {
                return;
            }
            match inner.queued.pop_front() {
                Some(state) => {
                    inner.notifying = true;
                    state
                }
                None => return,
            }
        };

        loop {
            tracing::debug!(state = %state, "Connection state changed");
            for listener in self.listeners.snapshot() {
                let context = listener.callback_context();
                deliver(listener, context, move |l| l.on_connection_state_change(state));
            }

            let mut inner = lock(&self.inner);
            match inner.queued.pop_front() {
                Some(next) => state = next,
                None => {
                    inner.notifying = false;
                    return;
                }
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut guard = RunGuard {
            conn: &self,
            done: false,
        };
        let mut socket: Option<TcpStream> = None;

        let outcome = self.drive(&mut socket).await;
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "HTSP connection failed");
            self.begin_close(ConnectionState::Failed);
        } else {
            // Loop only returns Ok once a close was requested
            self.begin_close(ConnectionState::Closed);
        }

        drop(socket.take());
        self.finish_close();
        guard.done = true;

        match self.state() {
            ConnectionState::Closed => tracing::info!("HTSP connection task wrapped up cleanly"),
            ConnectionState::Failed => tracing::warn!("HTSP connection task wrapped up upon failure"),
            other => tracing::error!(state = %other, "HTSP connection task wrapped up in an unexpected state"),
        }
    }

    async fn drive(&self, socket: &mut Option<TcpStream>) -> Result<()> {
        let address = self.details.address();
        tracing::info!(address = %address, "Opening HTSP connection");

        let connect = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address));
        tokio::pin!(connect);

        let stream = loop {
            tokio::select! {
                res = &mut connect => match res {
                    Ok(Ok(stream)) => break stream,
                    Ok(Err(e)) => return Err(Error::ConnectFailure(e.to_string())),
                    Err(_) => {
                        return Err(Error::ConnectFailure(format!(
                            "timed out after {:?}",
                            self.config.connect_timeout
                        )))
                    }
                },
                _ = self.wakeup.notified() => {
                    if self.is_closed_or_closing_or_failed() {
                        return Ok(());
                    }
                }
            }
        };

        if self.config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        let stream = socket.insert(stream);
        self.stats.connects.fetch_add(1, Ordering::Relaxed);

        if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
            // Closed while the connect was completing
            return Ok(());
        }
        tracing::info!("HTSP connected");

        let io = CountingSocket {
            stream,
            stats: &self.stats,
        };

        loop {
            if self.is_closed_or_closing_or_failed() {
                return Ok(());
            }

            let interest = if self.writer.has_pending_data() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            let ready = tokio::select! {
                ready = io.stream.ready(interest) => ready?,
                _ = self.wakeup.notified() => continue,
            };

            if ready.is_readable() || ready.is_read_closed() {
                self.reader.read(&io)?;
            }

            if ready.is_writable() && !self.is_closed_or_closing_or_failed() {
                self.writer.write(&io)?;
            }
        }
    }
}

/// Forces a terminal state if the reactor task is dropped mid-flight
struct RunGuard<'a> {
    conn: &'a Connection,
    done: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::error!(error = %Error::Interrupted, "HTSP connection task interrupted");
        self.conn.begin_close(ConnectionState::Failed);
        self.conn.finish_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Collects everything read; writes one queued buffer
    #[derive(Default)]
    struct Loopback {
        received: Mutex<Vec<u8>>,
        outgoing: Mutex<Vec<u8>>,
        fail_reads: AtomicBool,
    }

    impl Reader for Loopback {
        fn read(&self, socket: &dyn SocketIo) -> Result<()> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Error::Protocol("bad frame".into()));
            }
            let mut buf = [0u8; 1024];
            match socket.try_read(&mut buf) {
                Ok(0) => Err(Error::Io(io::ErrorKind::UnexpectedEof.into())),
                Ok(n) => {
                    self.received.lock().unwrap().extend_from_slice(&buf[..n]);
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }

    impl Writer for Loopback {
        fn has_pending_data(&self) -> bool {
            !self.outgoing.lock().unwrap().is_empty()
        }

        fn write(&self, socket: &dyn SocketIo) -> Result<()> {
            let mut out = self.outgoing.lock().unwrap();
            match socket.try_write(&out) {
                Ok(n) => {
                    out.drain(..n);
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }

    struct StateLog(mpsc::UnboundedSender<ConnectionState>);

    impl ConnectionListener for StateLog {
        fn on_connection_state_change(&self, state: ConnectionState) {
            let _ = self.0.send(state);
        }
    }

    fn connection(port: u16, io: Arc<Loopback>) -> Arc<Connection> {
        let details = Arc::new(ConnectionDetails::new("127.0.0.1", port, "u", "p", "test", "0"));
        Arc::new(Connection::new(details, ReactorConfig::default(), io.clone(), io))
    }

    async fn expect_states(rx: &mut mpsc::UnboundedReceiver<ConnectionState>, states: &[ConnectionState]) {
        for expected in states {
            let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("state change")
                .expect("listener alive");
            assert_eq!(got, *expected);
        }
    }

    #[tokio::test]
    async fn test_connect_write_read_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let io = Arc::new(Loopback::default());
        let conn = connection(port, io.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log: Arc<dyn ConnectionListener> = Arc::new(StateLog(tx));
        conn.add_connection_listener(&log);

        let handle = conn.start().unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        expect_states(&mut rx, &[ConnectionState::Connecting, ConnectionState::Connected]).await;

        io.outgoing.lock().unwrap().extend_from_slice(b"ping");
        conn.set_write_pending();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while io.received.lock().unwrap().as_slice() != b"pong" {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        conn.close_connection();
        handle.await.unwrap();
        expect_states(&mut rx, &[ConnectionState::Closing, ConnectionState::Closed]).await;
        assert!(conn.is_closed());
        assert!(conn.stats().bytes_written() >= 4);
        assert_eq!(conn.stats().connects(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = connection(port, Arc::new(Loopback::default()));

        let handle = conn.start().unwrap();
        assert!(matches!(conn.start(), Err(Error::AlreadyRunning)));

        conn.close_connection();
        handle.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_refused_connect_fails() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let conn = connection(port, Arc::new(Loopback::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log: Arc<dyn ConnectionListener> = Arc::new(StateLog(tx));
        conn.add_connection_listener(&log);

        conn.start().unwrap().await.unwrap();
        expect_states(
            &mut rx,
            &[ConnectionState::Connecting, ConnectionState::Closing, ConnectionState::Failed],
        )
        .await;
    }

    #[tokio::test]
    async fn test_peer_close_fails_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = connection(port, Arc::new(Loopback::default()));

        let handle = conn.start().unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        handle.await.unwrap();
        assert!(conn.is_failed());
    }

    #[tokio::test]
    async fn test_reader_error_fails_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let io = Arc::new(Loopback::default());
        io.fail_reads.store(true, Ordering::SeqCst);
        let conn = connection(port, io);

        let handle = conn.start().unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"garbage").await.unwrap();

        handle.await.unwrap();
        assert!(conn.is_failed());

        // Failed is restartable
        let handle = conn.start().unwrap();
        let _peer = listener.accept().await.unwrap();
        conn.close_connection();
        handle.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_aborted_task_reaches_terminal_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = connection(port, Arc::new(Loopback::default()));

        let handle = conn.start().unwrap();
        let _peer = listener.accept().await.unwrap();
        handle.abort();
        let _ = handle.await;

        assert!(conn.is_failed());
    }

    struct PanicOn(ConnectionState);

    impl ConnectionListener for PanicOn {
        fn on_connection_state_change(&self, state: ConnectionState) {
            if state == self.0 {
                panic!("listener failed on {}", state);
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stall_notifications() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = connection(port, Arc::new(Loopback::default()));

        let bad: Arc<dyn ConnectionListener> = Arc::new(PanicOn(ConnectionState::Connected));
        conn.add_connection_listener(&bad);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log: Arc<dyn ConnectionListener> = Arc::new(StateLog(tx));
        conn.add_connection_listener(&log);

        let handle = conn.start().unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        expect_states(&mut rx, &[ConnectionState::Connecting, ConnectionState::Connected]).await;

        drop(peer);
        handle.await.unwrap();
        expect_states(&mut rx, &[ConnectionState::Closing, ConnectionState::Failed]).await;

        // Still restartable and still notifying
        let handle = conn.start().unwrap();
        expect_states(&mut rx, &[ConnectionState::Connecting]).await;
        let _peer = listener.accept().await.unwrap();
        conn.close_connection();
        handle.await.unwrap();
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let conn = connection(1, Arc::new(Loopback::default()));
        conn.close_connection();
        conn.fail("test");
        assert!(conn.is_closed());
    }
}
