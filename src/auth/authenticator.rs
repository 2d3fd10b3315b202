//! Login handshake
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |-- hello {htspversion, clientname} --->|
//!   |<------ {challenge, servername, ...} --|
//!   |                                        |
//!   |-- authenticate {username, digest} --->|
//!   |<------ {} | {noaccess: 1} ------------|
//! ```
//!
//! Runs on every fresh `Connected` transition. Success promotes the
//! connection to `Ready` before `Authenticated` is broadcast, so listeners
//! reacting to it can send immediately.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;

use super::state::{compute_digest, AuthenticationState, ServerInfo};
use crate::connection::{
    deliver, lock, CallbackContext, Connection, ConnectionDetails, ConnectionListener,
    ConnectionState, ListenerSet,
};
use crate::dispatch::MessageDispatcher;
use crate::error::{Error, Result};
use crate::message::HtspMessage;
use crate::protocol::{methods, HTSP_VERSION};

/// Observer of authentication state changes
pub trait AuthenticationListener: Send + Sync {
    /// Context to deliver callbacks on; `None` means inline
    fn callback_context(&self) -> Option<CallbackContext> {
        None
    }

    fn on_authentication_state_change(&self, state: AuthenticationState);
}

pub struct Authenticator {
    me: Weak<Authenticator>,
    dispatcher: Arc<MessageDispatcher>,
    details: Arc<ConnectionDetails>,
    timeout: Duration,
    state: Mutex<AuthenticationState>,
    server_info: Mutex<Option<ServerInfo>>,
    listeners: ListenerSet<dyn AuthenticationListener>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Authenticator {
    /// `timeout` bounds each of the two handshake round trips
    pub fn new(
        dispatcher: Arc<MessageDispatcher>,
        details: Arc<ConnectionDetails>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            dispatcher,
            details,
            timeout,
            state: Mutex::new(AuthenticationState::NotAuthenticating),
            server_info: Mutex::new(None),
            listeners: ListenerSet::new("authentication"),
            task: Mutex::new(None),
        })
    }

    /// Start listening to `connection` for `Connected` transitions
    pub fn attach(self: &Arc<Self>, connection: &Arc<Connection>) {
        let listener: Arc<dyn ConnectionListener> = self.clone();
        connection.add_connection_listener(&listener);
    }

    pub fn state(&self) -> AuthenticationState {
        *lock(&self.state)
    }

    /// Server identity from the last successful `hello`
    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.server_info).clone()
    }

    pub fn add_authentication_listener(&self, listener: &Arc<dyn AuthenticationListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_authentication_listener(&self, listener: &Arc<dyn AuthenticationListener>) {
        self.listeners.remove(listener);
    }

    fn set_state(&self, state: AuthenticationState) {
        {
            let mut current = lock(&self.state);
            if *current == state {
                return;
            }
            *current = state;
        }

        tracing::debug!(state = %state, "Authentication state changed");
        for listener in self.listeners.snapshot() {
            let context = listener.callback_context();
            deliver(listener, context, move |l| l.on_authentication_state_change(state));
        }
    }

    fn spawn_handshake(&self) {
        let (Some(me), Some(connection)) = (self.me.upgrade(), self.dispatcher.connection()) else {
            return;
        };

        let handle = tokio::spawn(async move { me.run_handshake(connection).await });
        if let Some(previous) = lock(&self.task).replace(handle) {
            previous.abort();
        }
    }

    fn cancel_handshake(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }

    async fn run_handshake(self: Arc<Self>, connection: Arc<Connection>) {
        if !connection.begin_authentication() {
            return;
        }
        self.set_state(AuthenticationState::Authenticating);

        match self.handshake().await {
            Ok(info) => {
                tracing::info!(
                    server = %info.server_name,
                    version = %info.server_version,
                    htsp_version = info.htsp_version,
                    "HTSP authenticated"
                );
                *lock(&self.server_info) = Some(info);
                if connection.mark_ready() {
                    self.set_state(AuthenticationState::Authenticated);
                }
            }
            Err(Error::NotConnected) => {
                tracing::debug!("Connection went away during authentication");
            }
            Err(e) => {
                tracing::error!(error = %e, "HTSP authentication failed");
                self.set_state(AuthenticationState::Failed);
                connection.fail(&e.to_string());
            }
        }
    }

    async fn handshake(&self) -> Result<ServerInfo> {
        let hello = HtspMessage::with_method(methods::HELLO)
            .field("htspversion", HTSP_VERSION)
            .field("clientname", self.details.client_name())
            .field("clientversion", self.details.client_version());

        let reply = self
            .dispatcher
            .send_handshake_request(hello, self.timeout)
            .await?
            .ok_or_else(|| Error::AuthFailure("no reply to hello".into()))?;

        let info = ServerInfo::from_hello(&reply);
        let challenge = reply.get_bin("challenge").unwrap_or_default();
        if challenge.is_empty() {
            tracing::warn!("Server sent no authentication challenge");
        }

        let digest = compute_digest(self.details.password(), &challenge);
        let authenticate = HtspMessage::with_method(methods::AUTHENTICATE)
            .field("username", self.details.username())
            .field("digest", Bytes::copy_from_slice(&digest));

        let reply = self
            .dispatcher
            .send_handshake_request(authenticate, self.timeout)
            .await?
            .ok_or_else(|| Error::AuthFailure("no reply to authenticate".into()))?;

        if reply.get_i64_or("noaccess", 0) != 0 {
            return Err(Error::AuthFailure(format!(
                "access denied for user {}",
                self.details.username()
            )));
        }

        Ok(info)
    }
}

impl ConnectionListener for Authenticator {
    fn on_connection_state_change(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => self.spawn_handshake(),
            ConnectionState::Authenticating | ConnectionState::Ready => {}
            _ => {
                self.cancel_handshake();
                self.set_state(AuthenticationState::NotAuthenticating);
            }
        }
    }
}
