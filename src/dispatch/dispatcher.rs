//! Message dispatcher
//!
//! Sits between the reactor and everything above it. As the connection's
//! [`Reader`] it reassembles frames and routes each message either to the
//! request waiting on its `seq` or to the registered [`MessageListener`]s.
//! As the [`Writer`] it drains a FIFO of encoded frames into the socket.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::oneshot;

use super::pending::PendingRequests;
use crate::codec::{self, HtsmsgDecoder};
use crate::connection::{
    deliver, lock, CallbackContext, Connection, ConnectionListener, ConnectionState,
    ListenerSet, Reader, SocketIo, Writer,
};
use crate::error::{Error, Result};
use crate::message::HtspMessage;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reads per readiness event; the reactor comes back if more is buffered
const MAX_READS_PER_PASS: usize = 16;

/// Observer of messages not claimed by a pending request
pub trait MessageListener: Send + Sync {
    /// Context to deliver callbacks on; `None` means inline on the reactor
    fn callback_context(&self) -> Option<CallbackContext> {
        None
    }

    fn on_message(&self, message: &HtspMessage);
}

/// Which connection states allow a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendGate {
    /// General traffic: `Ready` only
    Ready,
    /// Handshake traffic: `Connected`, `Authenticating` or `Ready`
    Handshake,
}

impl SendGate {
    fn allows(self, state: ConnectionState) -> bool {
        match self {
            SendGate::Ready => state.is_ready(),
            SendGate::Handshake => state.is_connected(),
        }
    }
}

struct Input {
    buffer: BytesMut,
    decoder: HtsmsgDecoder,
    scratch: Box<[u8]>,
}

pub struct MessageDispatcher {
    connection: OnceLock<Weak<Connection>>,
    input: Mutex<Input>,
    output: Mutex<VecDeque<Bytes>>,
    pending: PendingRequests,
    listeners: ListenerSet<dyn MessageListener>,
    next_seq: AtomicU32,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            connection: OnceLock::new(),
            input: Mutex::new(Input {
                buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
                decoder: HtsmsgDecoder::new(),
                scratch: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            }),
            output: Mutex::new(VecDeque::new()),
            pending: PendingRequests::default(),
            listeners: ListenerSet::new("message"),
            next_seq: AtomicU32::new(1),
        }
    }

    /// Bind to the connection this dispatcher reads and writes for
    ///
    /// Also registers the dispatcher as a connection listener so pending
    /// requests fail as soon as the connection closes. Only the first call
    /// has an effect.
    pub fn attach(self: &Arc<Self>, connection: &Arc<Connection>) {
        if self.connection.set(Arc::downgrade(connection)).is_err() {
            tracing::warn!("Dispatcher already attached to a connection");
            return;
        }
        let listener: Arc<dyn ConnectionListener> = self.clone();
        connection.add_connection_listener(&listener);
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.get().and_then(Weak::upgrade)
    }

    pub fn add_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.listeners.remove(listener);
    }

    pub fn has_message_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.listeners.contains(listener)
    }

    /// Requests still awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Queue `message` without waiting for a reply; returns the assigned `seq`
    pub fn send_message(&self, message: HtspMessage) -> Result<u32> {
        let connection = self.gated_connection(SendGate::Ready)?;
        let seq = self.allocate_seq();
        self.enqueue(&connection, message, seq)?;
        Ok(seq)
    }

    /// Send `message` and wait for the response carrying the same `seq`
    ///
    /// Returns `Ok(None)` if nothing arrived within `timeout`, and
    /// `Err(Error::NotConnected)` if the connection is not ready or closes
    /// while waiting.
    pub async fn send_request(
        &self,
        message: HtspMessage,
        timeout: Duration,
    ) -> Result<Option<HtspMessage>> {
        self.request(message, timeout, SendGate::Ready).await
    }

    /// Like [`send_request`](Self::send_request) but a missing reply is an
    /// [`Error::Timeout`]
    pub async fn send_request_or_timeout(
        &self,
        message: HtspMessage,
        timeout: Duration,
    ) -> Result<HtspMessage> {
        self.send_request(message, timeout)
            .await?
            .ok_or(Error::Timeout(timeout))
    }

    /// Request allowed while the handshake is still in progress
    pub(crate) async fn send_handshake_request(
        &self,
        message: HtspMessage,
        timeout: Duration,
    ) -> Result<Option<HtspMessage>> {
        self.request(message, timeout, SendGate::Handshake).await
    }

    async fn request(
        &self,
        message: HtspMessage,
        timeout: Duration,
        gate: SendGate,
    ) -> Result<Option<HtspMessage>> {
        let connection = self.gated_connection(gate)?;
        let seq = self.allocate_seq();

        // Registered before the frame can hit the wire
        let mut rx = self.pending.add(seq);
        if let Err(e) = self.enqueue(&connection, message, seq) {
            self.pending.remove(seq);
            return Err(e);
        }
        drop(connection);

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => response.map(Some),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                self.finish_timed_out(seq, rx, timeout_ms).await
            }
        }
    }

    /// Settle a request whose deadline passed
    ///
    /// If the entry is already gone the reader claimed it and is about to
    /// send the reply (or a close is failing it), so wait for that outcome.
    async fn finish_timed_out(
        &self,
        seq: u32,
        rx: oneshot::Receiver<Result<HtspMessage>>,
        timeout_ms: u64,
    ) -> Result<Option<HtspMessage>> {
        if self.pending.remove(seq) {
            tracing::debug!(seq = seq, timeout_ms = timeout_ms, "Request timed out");
            return Ok(None);
        }
        match rx.await {
            Ok(response) => response.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn gated_connection(&self, gate: SendGate) -> Result<Arc<Connection>> {
        let connection = self.connection().ok_or(Error::NotConnected)?;
        let state = connection.state();
        if !gate.allows(state) {
            tracing::debug!(state = %state, "Refusing to send while not ready");
            return Err(Error::NotConnected);
        }
        Ok(connection)
    }

    fn allocate_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, connection: &Connection, mut message: HtspMessage, seq: u32) -> Result<()> {
        message.put("seq", seq);
        let frame = codec::encode(&message)?;

        tracing::trace!(
            seq = seq,
            method = message.method().unwrap_or(""),
            size = frame.len(),
            "Queueing message"
        );

        lock(&self.output).push_back(frame);
        connection.stats().record_message_out();
        connection.set_write_pending();
        Ok(())
    }

    fn route(&self, message: HtspMessage) {
        if let Some(seq) = message.seq() {
            if self.pending.resolve(seq, message.clone()) {
                return;
            }
        }

        let message = Arc::new(message);
        for listener in self.listeners.snapshot() {
            let context = listener.callback_context();
            let message = Arc::clone(&message);
            deliver(listener, context, move |l| l.on_message(&message));
        }
    }

    fn reset(&self) {
        {
            let mut input = lock(&self.input);
            input.buffer.clear();
            input.decoder = HtsmsgDecoder::new();
        }
        lock(&self.output).clear();
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader for MessageDispatcher {
    /// Read and route up to `MAX_READS_PER_PASS` chunks
    ///
    /// Frames are decoded after every chunk, so the input buffer never holds
    /// more than one partial frame between chunks.
    fn read(&self, socket: &dyn SocketIo) -> Result<()> {
        for _ in 0..MAX_READS_PER_PASS {
            let mut messages = Vec::new();
            {
                let mut input = lock(&self.input);
                let Input {
                    buffer,
                    decoder,
                    scratch,
                } = &mut *input;

                let n = match socket.try_read(scratch) {
                    Ok(0) => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "server closed the connection",
                        )))
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                buffer.extend_from_slice(&scratch[..n]);

                while let Some(message) = decoder.decode_frame(buffer)? {
                    messages.push(message);
                }
            }

            self.route_all(messages);
        }
        Ok(())
    }
}

impl MessageDispatcher {
    fn route_all(&self, messages: Vec<HtspMessage>) {
        if messages.is_empty() {
            return;
        }
        if let Some(connection) = self.connection() {
            for _ in &messages {
                connection.stats().record_message_in();
            }
        }
        for message in messages {
            self.route(message);
        }
    }
}

impl Writer for MessageDispatcher {
    fn has_pending_data(&self) -> bool {
        !lock(&self.output).is_empty()
    }

    fn write(&self, socket: &dyn SocketIo) -> Result<()> {
        let mut output = lock(&self.output);
        while let Some(frame) = output.front_mut() {
            match socket.try_write(frame) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    )))
                }
                Ok(n) => {
                    frame.advance(n);
                    if frame.is_empty() {
                        output.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl ConnectionListener for MessageDispatcher {
    fn on_connection_state_change(&self, state: ConnectionState) {
        match state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                let failed = self.pending.fail_all();
                if failed > 0 {
                    tracing::debug!(count = failed, state = %state, "Failed pending requests");
                }
                self.reset();
            }
            ConnectionState::Connecting => self.reset(),
            _ => {}
        }
    }
}
