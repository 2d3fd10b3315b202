//! In-process HTSP server for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use htsp_rs::auth::compute_digest;
use htsp_rs::codec::{encode, HtsmsgDecoder};
use htsp_rs::{ClientConfig, ConnectionDetails, HtspMessage};

pub const USERNAME: &str = "user";
pub const PASSWORD: &str = "secret";
pub const FILE_NAME: &str = "imagecache/42";
/// Same contents as [`FILE_NAME`] but the server claims it is `i64::MAX` bytes
pub const OVERSIZED_FILE_NAME: &str = "imagecache/43";
/// `subscribe` for this channel is never answered
pub const SILENT_CHANNEL: i64 = 999;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn file_contents() -> Vec<u8> {
    (0..10_000u32).map(|i| (i % 251) as u8).collect()
}

#[derive(Debug, Clone)]
enum Command {
    Push(HtspMessage),
    Kill,
}

struct Shared {
    received: Mutex<Vec<HtspMessage>>,
    accepted: AtomicUsize,
    reject_login: AtomicBool,
}

pub struct MockServer {
    port: u16,
    shared: Arc<Shared>,
    commands: broadcast::Sender<Command>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::bind(false).await
    }

    /// Answers `hello` but rejects every login
    pub async fn rejecting() -> Self {
        Self::bind(true).await
    }

    async fn bind(reject_login: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            received: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            reject_login: AtomicBool::new(reject_login),
        });
        let (commands, _) = broadcast::channel(64);

        let accept_shared = shared.clone();
        let accept_commands = commands.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let rx = accept_commands.subscribe();
                tokio::spawn(serve(socket, accept_shared.clone(), rx));
            }
        });

        Self {
            port,
            shared,
            commands,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(ConnectionDetails::new(
            "127.0.0.1",
            self.port,
            USERNAME,
            PASSWORD,
            "htsp-rs-tests",
            "0.1",
        ))
        .request_timeout(Duration::from_secs(2))
        .backoff(Duration::from_millis(100), Duration::from_millis(500))
    }

    /// Send `message` to every open connection
    pub fn push(&self, message: HtspMessage) {
        let _ = self.commands.send(Command::Push(message));
    }

    /// Drop every open connection
    pub fn kill(&self) {
        let _ = self.commands.send(Command::Kill);
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn set_reject_login(&self, reject: bool) {
        self.shared.reject_login.store(reject, Ordering::SeqCst);
    }

    /// Every message received with the given method, in arrival order
    pub fn received(&self, method: &str) -> Vec<HtspMessage> {
        self.shared
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.method() == Some(method))
            .cloned()
            .collect()
    }
}

/// Poll `check` until it holds or `timeout` expires
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("operation timed out")
}

struct Session {
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<HtspMessage>,
    challenge: Bytes,
    file: Vec<u8>,
    file_pos: usize,
}

async fn serve(socket: TcpStream, shared: Arc<Shared>, mut commands: broadcast::Receiver<Command>) {
    let (mut rd, mut wr) = socket.into_split();
    let (out, mut out_rx) = mpsc::unbounded_channel::<HtspMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let frame = encode(&message).unwrap();
            if wr.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        shared,
        out,
        challenge: Bytes::from_static(&[7u8; 32]),
        file: file_contents(),
        file_pos: 0,
    };
    let mut decoder = HtsmsgDecoder::new();
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            n = rd.read_buf(&mut buf) => {
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                while let Some(message) = decoder.decode_frame(&mut buf).unwrap() {
                    session.shared.received.lock().unwrap().push(message.clone());
                    session.handle(message);
                }
            }
            command = commands.recv() => match command {
                Ok(Command::Push(message)) => {
                    let _ = session.out.send(message);
                }
                Ok(Command::Kill) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }

    writer.abort();
}

impl Session {
    fn reply(&self, request: &HtspMessage, response: HtspMessage) {
        if let Some(seq) = request.seq() {
            let _ = self.out.send(response.field("seq", seq));
        }
    }

    fn handle(&mut self, message: HtspMessage) {
        match message.method().unwrap_or("") {
            "hello" => self.reply(
                &message,
                HtspMessage::new()
                    .field("htspversion", 26)
                    .field("servername", "mock")
                    .field("serverversion", "1.0")
                    .field("challenge", self.challenge.clone()),
            ),
            "authenticate" => {
                let expected = compute_digest(PASSWORD, &self.challenge);
                let accepted = !self.shared.reject_login.load(Ordering::SeqCst)
                    && message.get_str("username") == Some(USERNAME)
                    && message.get_bin("digest").as_deref() == Some(&expected[..]);
                let response = if accepted {
                    HtspMessage::new()
                } else {
                    HtspMessage::new().field("noaccess", 1)
                };
                self.reply(&message, response);
            }
            "subscribe" if message.get_i64("channelId") == Some(SILENT_CHANNEL) => {}
            "subscribe" => {
                let id = message.get_u32("subscriptionId").unwrap_or(0);
                self.reply(
                    &message,
                    HtspMessage::new().field("timeshiftPeriod", message.get_i64_or("timeshiftPeriod", 0)),
                );
                let _ = self
                    .out
                    .send(HtspMessage::with_method("subscriptionStart").field("subscriptionId", id));
            }
            "delayed" => {
                let delay = Duration::from_millis(message.get_i64_or("delay", 0) as u64);
                let tag = message.get_i64_or("tag", -1);
                let seq = message.seq();
                let out = self.out.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(seq) = seq {
                        let _ = out.send(HtspMessage::new().field("seq", seq).field("tag", tag));
                    }
                });
            }
            "fileOpen" => {
                let response = if message.get_str("file") == Some(FILE_NAME) {
                    self.file_pos = 0;
                    HtspMessage::new()
                        .field("id", 1)
                        .field("size", self.file.len() as i64)
                } else if message.get_str("file") == Some(OVERSIZED_FILE_NAME) {
                    self.file_pos = 0;
                    HtspMessage::new().field("id", 2).field("size", i64::MAX)
                } else {
                    HtspMessage::new().field("error", "File not found")
                };
                self.reply(&message, response);
            }
            "fileRead" => {
                let offset = message
                    .get_i64("offset")
                    .map(|o| o as usize)
                    .unwrap_or(self.file_pos)
                    .min(self.file.len());
                let size = message.get_i64_or("size", 0) as usize;
                let end = (offset + size).min(self.file.len());
                self.file_pos = end;
                let data = Bytes::copy_from_slice(&self.file[offset..end]);
                self.reply(&message, HtspMessage::new().field("data", data));
            }
            // No reply expected (or deliberately withheld)
            _ => {}
        }
    }
}
