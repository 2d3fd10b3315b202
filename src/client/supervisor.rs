//! Reconnecting HTSP client
//!
//! [`HtspClient`] wires one [`Connection`], [`MessageDispatcher`] and
//! [`Authenticator`] together and restarts the connection every time it
//! fails, until [`HtspClient::stop`] is called.
//!
//! ```text
//!   start ──► Connecting ──► Connected ──► Authenticating ──► Ready
//!                 ▲                                             │
//!                 │ sleep(backoff)                              │ error
//!                 └──────────── Failed ◄──── Closing ◄──────────┘
//! ```

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::backoff::Backoff;
use super::config::ClientConfig;
use super::file::HtspFileReader;
use crate::auth::{AuthenticationListener, AuthenticationState, Authenticator, ServerInfo};
use crate::connection::{
    lock, Connection, ConnectionDetails, ConnectionListener, ConnectionState, ConnectionStats,
};
use crate::dispatch::{MessageDispatcher, MessageListener};
use crate::error::{Error, Result};
use crate::message::HtspMessage;
use crate::subscription::Subscriber;

struct Lifecycle {
    reconnect: bool,
    reactors: Vec<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

/// Turns `Failed` into a delayed restart
struct Supervisor {
    me: Weak<Supervisor>,
    connection: Weak<Connection>,
    lifecycle: Mutex<Lifecycle>,
    backoff: Mutex<Backoff>,
}

impl Supervisor {
    /// Spawn the reactor while holding the lifecycle lock, so a concurrent
    /// `stop` either sees the new task or prevents it
    ///
    /// State changes are not delivered here: this listener takes the
    /// lifecycle lock itself. Call `Connection::flush_notifications` on the
    /// returned connection after releasing it.
    fn launch(&self, lifecycle: &mut Lifecycle) -> Result<Arc<Connection>> {
        let connection = self.connection.upgrade().ok_or(Error::NotConnected)?;
        let handle = connection.launch()?;
        lifecycle.reactors.retain(|h| !h.is_finished());
        lifecycle.reactors.push(handle);
        Ok(connection)
    }

    fn schedule_retry(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("No runtime available, not reconnecting");
                return;
            }
        };

        let mut lifecycle = lock(&self.lifecycle);
        if !lifecycle.reconnect {
            return;
        }
        // A stale `Failed` delivered after a restart already began
        if !self.connection.upgrade().is_some_and(|c| c.is_failed()) {
            tracing::debug!("Connection no longer failed, not scheduling reconnect");
            return;
        }

        let (delay, retries) = {
            let mut backoff = lock(&self.backoff);
            let delay = backoff.next();
            (delay, backoff.retries())
        };
        tracing::info!(
            retries = retries,
            delay_ms = delay.as_millis() as u64,
            "Connection failed, scheduling reconnect"
        );

        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            me.restart();
        });
        if let Some(previous) = lifecycle.retry.replace(handle) {
            previous.abort();
        }
    }

    fn restart(&self) {
        let launched = {
            let mut lifecycle = lock(&self.lifecycle);
            if !lifecycle.reconnect {
                return;
            }
            lifecycle.retry = None;
            self.launch(&mut lifecycle)
        };

        match launched {
            Ok(connection) => connection.flush_notifications(),
            Err(e) => tracing::warn!(error = %e, "Reconnect skipped"),
        }
    }
}

impl ConnectionListener for Supervisor {
    fn on_connection_state_change(&self, state: ConnectionState) {
        match state {
            ConnectionState::Ready => lock(&self.backoff).reset(),
            ConnectionState::Failed => self.schedule_retry(),
            _ => {}
        }
    }
}

/// Reconnecting HTSP client facade
pub struct HtspClient {
    config: ClientConfig,
    connection: Arc<Connection>,
    dispatcher: Arc<MessageDispatcher>,
    authenticator: Arc<Authenticator>,
    supervisor: Arc<Supervisor>,
}

impl HtspClient {
    pub fn new(config: ClientConfig) -> Self {
        let details = Arc::new(config.details.clone());

        let dispatcher = Arc::new(MessageDispatcher::new());
        let connection = Arc::new(Connection::new(
            Arc::clone(&details),
            config.reactor_config(),
            dispatcher.clone(),
            dispatcher.clone(),
        ));
        dispatcher.attach(&connection);

        let authenticator =
            Authenticator::new(dispatcher.clone(), details, config.request_timeout);
        authenticator.attach(&connection);

        let supervisor = Arc::new_cyclic(|me| Supervisor {
            me: me.clone(),
            connection: Arc::downgrade(&connection),
            lifecycle: Mutex::new(Lifecycle {
                reconnect: false,
                reactors: Vec::new(),
                retry: None,
            }),
            backoff: Mutex::new(Backoff::new(config.backoff_step, config.backoff_ceiling)),
        });
        let listener: Arc<dyn ConnectionListener> = supervisor.clone();
        connection.add_connection_listener(&listener);

        Self {
            config,
            connection,
            dispatcher,
            authenticator,
            supervisor,
        }
    }

    /// Connect and keep reconnecting until [`stop`](Self::stop)
    ///
    /// Calling it again while running only logs a warning.
    pub fn start(&self) -> Result<()> {
        let connection = {
            let mut lifecycle = lock(&self.supervisor.lifecycle);
            if lifecycle.reconnect {
                tracing::warn!("Attempted to start a running client");
                return Ok(());
            }

            lock(&self.supervisor.backoff).reset();
            let connection = self.supervisor.launch(&mut lifecycle)?;
            lifecycle.reconnect = true;
            connection
        };

        // May deliver a `Failed` left over from the previous run, which
        // schedules a retry under the lifecycle lock
        connection.flush_notifications();
        tracing::info!(address = %self.details().address(), "HTSP client started");
        Ok(())
    }

    /// Disable reconnects, close the connection and wait for the reactor
    /// task to finish
    pub async fn stop(&self) {
        let reactors = {
            let mut lifecycle = lock(&self.supervisor.lifecycle);
            if !lifecycle.reconnect && lifecycle.reactors.is_empty() {
                tracing::debug!("Client already stopped");
                return;
            }
            lifecycle.reconnect = false;
            if let Some(retry) = lifecycle.retry.take() {
                retry.abort();
            }
            std::mem::take(&mut lifecycle.reactors)
        };

        if !self.connection.is_closed_or_closing_or_failed() {
            self.connection.close_connection();
        }

        for reactor in reactors {
            if let Err(e) = reactor.await {
                tracing::error!(error = %e, "Connection task did not finish cleanly");
            }
        }
        tracing::info!("HTSP client stopped");
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn details(&self) -> &ConnectionDetails {
        self.connection.details()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_ready(&self) -> bool {
        self.connection.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn is_closed_or_closing(&self) -> bool {
        self.connection.is_closed_or_closing()
    }

    pub fn authentication_state(&self) -> AuthenticationState {
        self.authenticator.state()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.authenticator.server_info()
    }

    pub fn stats(&self) -> &ConnectionStats {
        self.connection.stats()
    }

    /// Consecutive failed attempts since the last `Ready`
    pub fn retries(&self) -> u32 {
        lock(&self.supervisor.backoff).retries()
    }

    /// Delay the next reconnect will wait
    pub fn retry_delay(&self) -> Duration {
        lock(&self.supervisor.backoff).delay()
    }

    pub fn send_message(&self, message: HtspMessage) -> Result<u32> {
        self.dispatcher.send_message(message)
    }

    pub async fn send_request(
        &self,
        message: HtspMessage,
        timeout: Duration,
    ) -> Result<Option<HtspMessage>> {
        self.dispatcher.send_request(message, timeout).await
    }

    pub async fn send_request_or_timeout(
        &self,
        message: HtspMessage,
        timeout: Duration,
    ) -> Result<HtspMessage> {
        self.dispatcher.send_request_or_timeout(message, timeout).await
    }

    pub fn add_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.dispatcher.add_message_listener(listener);
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.dispatcher.remove_message_listener(listener);
    }

    pub fn add_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.connection.add_connection_listener(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.connection.remove_connection_listener(listener);
    }

    pub fn add_authentication_listener(&self, listener: &Arc<dyn AuthenticationListener>) {
        self.authenticator.add_authentication_listener(listener);
    }

    pub fn remove_authentication_listener(&self, listener: &Arc<dyn AuthenticationListener>) {
        self.authenticator.remove_authentication_listener(listener);
    }

    /// A subscriber that resumes across reconnects of this client
    pub fn subscriber(&self) -> Arc<Subscriber> {
        let subscriber = Subscriber::with_timeouts(
            self.dispatcher.clone(),
            self.config.request_timeout,
            self.config.stats_interval,
        );
        subscriber.attach(&self.authenticator);
        subscriber
    }

    /// Open a file on the server for reading
    pub async fn open_file(&self, name: &str) -> Result<HtspFileReader> {
        HtspFileReader::open_with_timeout(self.dispatcher.clone(), name, self.config.request_timeout)
            .await
    }
}

impl Drop for HtspClient {
    fn drop(&mut self) {
        {
            let mut lifecycle = lock(&self.supervisor.lifecycle);
            lifecycle.reconnect = false;
            if let Some(retry) = lifecycle.retry.take() {
                retry.abort();
            }
        }

        if !self.connection.is_closed_or_closing_or_failed() {
            self.connection.close_connection();
        }
    }
}
