//! Live subscription lifecycle
//!
//! A [`Subscriber`] owns at most one subscription at a time. While active it
//! listens to the dispatcher for notifications carrying its subscription id
//! and re-issues `subscribe` every time authentication succeeds again, so a
//! reconnect is invisible to the caller apart from the gap in `muxpkt`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use super::stats::{QueueStatus, SignalStatus, SubscriptionStats, TimeshiftStatus};
use crate::auth::{AuthenticationListener, AuthenticationState, Authenticator};
use crate::connection::{deliver, lock, CallbackContext, ListenerSet};
use crate::dispatch::{MessageDispatcher, MessageListener};
use crate::error::{Error, Result};
use crate::message::HtspMessage;
use crate::protocol::{
    methods, notifications, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STATS_INTERVAL, SPEED_NORMAL,
    SPEED_PAUSED,
};

/// Process-wide; ids are never reused while the process lives
static NEXT_SUBSCRIPTION_ID: AtomicU32 = AtomicU32::new(1);

fn allocate_subscription_id() -> u32 {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Observer of one subscription's notifications
///
/// Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait SubscriptionListener: Send + Sync {
    /// Context to deliver callbacks on; `None` means inline on the reactor
    fn callback_context(&self) -> Option<CallbackContext> {
        None
    }

    fn on_subscription_start(&self, message: &HtspMessage) {}
    fn on_subscription_status(&self, message: &HtspMessage) {}
    fn on_subscription_stop(&self, message: &HtspMessage) {}
    fn on_subscription_skip(&self, message: &HtspMessage) {}
    fn on_subscription_speed(&self, message: &HtspMessage) {}
    fn on_queue_status(&self, message: &HtspMessage) {}
    fn on_signal_status(&self, message: &HtspMessage) {}
    fn on_timeshift_status(&self, message: &HtspMessage) {}
    fn on_muxpkt(&self, message: &HtspMessage) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notification {
    Start,
    Status,
    Stop,
    Skip,
    Speed,
    QueueStatus,
    SignalStatus,
    TimeshiftStatus,
    Muxpkt,
}

impl Notification {
    fn from_method(method: &str) -> Option<Self> {
        let n = match method {
            notifications::SUBSCRIPTION_START => Notification::Start,
            notifications::SUBSCRIPTION_STATUS => Notification::Status,
            notifications::SUBSCRIPTION_STOP => Notification::Stop,
            notifications::SUBSCRIPTION_SKIP => Notification::Skip,
            notifications::SUBSCRIPTION_SPEED => Notification::Speed,
            notifications::QUEUE_STATUS => Notification::QueueStatus,
            notifications::SIGNAL_STATUS => Notification::SignalStatus,
            notifications::TIMESHIFT_STATUS => Notification::TimeshiftStatus,
            notifications::MUXPKT => Notification::Muxpkt,
            _ => return None,
        };
        Some(n)
    }

    fn forward(self, listener: &dyn SubscriptionListener, message: &HtspMessage) {
        match self {
            Notification::Start => listener.on_subscription_start(message),
            Notification::Status => listener.on_subscription_status(message),
            Notification::Stop => listener.on_subscription_stop(message),
            Notification::Skip => listener.on_subscription_skip(message),
            Notification::Speed => listener.on_subscription_speed(message),
            Notification::QueueStatus => listener.on_queue_status(message),
            Notification::SignalStatus => listener.on_signal_status(message),
            Notification::TimeshiftStatus => listener.on_timeshift_status(message),
            Notification::Muxpkt => listener.on_muxpkt(message),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Subscription {
    /// 0 until the first subscribe
    id: u32,
    channel_id: i64,
    profile: Option<String>,
    requested_timeshift: i64,
    granted_timeshift: i64,
    active: bool,
    /// Wall clock at `subscriptionStart`, microseconds since the epoch
    start_time_us: Option<i64>,
}

pub struct Subscriber {
    me: Weak<Subscriber>,
    dispatcher: Arc<MessageDispatcher>,
    request_timeout: Duration,
    stats_interval: Duration,
    subscription: Mutex<Subscription>,
    stats: Mutex<SubscriptionStats>,
    listeners: ListenerSet<dyn SubscriptionListener>,
    timer: Mutex<Option<JoinHandle<()>>>,
    resume: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(dispatcher: Arc<MessageDispatcher>) -> Arc<Self> {
        Self::with_timeouts(dispatcher, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STATS_INTERVAL)
    }

    pub fn with_timeouts(
        dispatcher: Arc<MessageDispatcher>,
        request_timeout: Duration,
        stats_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            dispatcher,
            request_timeout,
            stats_interval,
            subscription: Mutex::new(Subscription::default()),
            stats: Mutex::new(SubscriptionStats::new()),
            listeners: ListenerSet::new("subscription"),
            timer: Mutex::new(None),
            resume: Mutex::new(None),
        })
    }

    /// Resume the subscription whenever `authenticator` succeeds again
    pub fn attach(self: &Arc<Self>, authenticator: &Authenticator) {
        let listener: Arc<dyn AuthenticationListener> = self.clone();
        authenticator.add_authentication_listener(&listener);
    }

    pub fn add_subscription_listener(&self, listener: &Arc<dyn SubscriptionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_subscription_listener(&self, listener: &Arc<dyn SubscriptionListener>) {
        self.listeners.remove(listener);
    }

    /// Current subscription id, if `subscribe` was ever called
    pub fn subscription_id(&self) -> Option<u32> {
        let id = lock(&self.subscription).id;
        (id != 0).then_some(id)
    }

    pub fn channel_id(&self) -> i64 {
        lock(&self.subscription).channel_id
    }

    pub fn profile(&self) -> Option<String> {
        lock(&self.subscription).profile.clone()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.subscription).active
    }

    /// Timeshift period the server granted, in seconds
    pub fn timeshift_period(&self) -> i64 {
        lock(&self.subscription).granted_timeshift
    }

    pub fn stats(&self) -> SubscriptionStats {
        lock(&self.stats).clone()
    }

    pub fn queue_status(&self) -> Option<QueueStatus> {
        lock(&self.stats).queue.clone()
    }

    pub fn signal_status(&self) -> Option<SignalStatus> {
        lock(&self.stats).signal.clone()
    }

    pub fn timeshift_status(&self) -> Option<TimeshiftStatus> {
        lock(&self.stats).timeshift.clone()
    }

    /// How far behind live playback is, as a (negative) PTS offset
    pub fn timeshift_offset_pts(&self) -> Option<i64> {
        lock(&self.stats).timeshift.as_ref().map(|t| -t.shift)
    }

    /// PTS of the oldest packet in the timeshift buffer
    pub fn timeshift_start_pts(&self) -> Option<i64> {
        lock(&self.stats).timeshift.as_ref().and_then(|t| t.start)
    }

    /// Wall clock time of the oldest packet in the timeshift buffer,
    /// microseconds since the epoch
    pub fn timeshift_start_time(&self) -> Option<i64> {
        let start_pts = self.timeshift_start_pts()?;
        let start_time = lock(&self.subscription).start_time_us?;
        Some(start_time + start_pts)
    }

    /// Whether the periodic stats report is running
    pub fn is_reporting_stats(&self) -> bool {
        lock(&self.timer).as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Subscribe to `channel_id`
    ///
    /// Always allocates a new subscription id. An active subscription is
    /// unsubscribed first. The subscription counts as active from the moment
    /// the request is issued and is rolled back if it fails.
    pub async fn subscribe(
        &self,
        channel_id: i64,
        profile: Option<&str>,
        timeshift_period: i64,
    ) -> Result<()> {
        let (previous, id) = {
            let mut sub = lock(&self.subscription);
            let previous = sub.active.then_some(sub.id);
            *sub = Subscription {
                id: allocate_subscription_id(),
                channel_id,
                profile: profile.map(str::to_owned),
                requested_timeshift: timeshift_period,
                granted_timeshift: 0,
                active: true,
                start_time_us: None,
            };
            (previous, sub.id)
        };

        if let Some(old_id) = previous {
            self.stop_timer();
            self.send_unsubscribe(old_id);
        }
        *lock(&self.stats) = SubscriptionStats::new();

        self.register();
        match self.send_subscribe().await {
            Ok(()) => {
                self.start_timer();
                Ok(())
            }
            Err(e) => {
                tracing::error!(channel_id = channel_id, error = %e, "Subscribe failed");
                let mut sub = lock(&self.subscription);
                if sub.id == id {
                    sub.active = false;
                    drop(sub);
                    self.deregister();
                }
                Err(e)
            }
        }
    }

    /// Stop the subscription; the `unsubscribe` request is best-effort
    pub fn unsubscribe(&self) {
        let id = {
            let mut sub = lock(&self.subscription);
            if !sub.active {
                tracing::debug!(subscription_id = sub.id, "Unsubscribe while not subscribed");
            }
            sub.active = false;
            sub.id
        };

        tracing::info!(subscription_id = id, "Unsubscribing");
        self.stop_timer();
        if let Some(task) = lock(&self.resume).take() {
            task.abort();
        }
        self.deregister();

        if id != 0 {
            self.send_unsubscribe(id);
        }
    }

    /// Playback speed in percent; 100 is normal, 0 pauses
    pub fn set_speed(&self, speed: i64) -> Result<()> {
        let id = self.active_id()?;
        tracing::info!(subscription_id = id, speed = speed, "Requesting speed");
        self.dispatcher.send_message(
            HtspMessage::with_method(methods::SUBSCRIPTION_SPEED)
                .field("subscriptionId", id)
                .field("speed", speed),
        )?;
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.set_speed(SPEED_PAUSED)
    }

    pub fn resume(&self) -> Result<()> {
        self.set_speed(SPEED_NORMAL)
    }

    /// Jump to an absolute position in the timeshift buffer
    pub fn skip(&self, time: i64) -> Result<()> {
        let id = self.active_id()?;
        tracing::info!(subscription_id = id, time = time, "Requesting skip");
        self.dispatcher.send_message(
            HtspMessage::with_method(methods::SUBSCRIPTION_SKIP)
                .field("subscriptionId", id)
                .field("time", time)
                .field("absolute", 1),
        )?;
        Ok(())
    }

    /// Return to live playback
    pub fn live(&self) -> Result<()> {
        let id = self.active_id()?;
        tracing::info!(subscription_id = id, "Requesting live");
        self.dispatcher.send_message(
            HtspMessage::with_method(methods::SUBSCRIPTION_LIVE).field("subscriptionId", id),
        )?;
        Ok(())
    }

    fn active_id(&self) -> Result<u32> {
        let sub = lock(&self.subscription);
        if !sub.active {
            return Err(Error::Protocol("no active subscription".into()));
        }
        Ok(sub.id)
    }

    fn register(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let listener: Arc<dyn MessageListener> = me;
        if !self.dispatcher.has_message_listener(&listener) {
            self.dispatcher.add_message_listener(&listener);
        }
    }

    fn deregister(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let listener: Arc<dyn MessageListener> = me;
        if self.dispatcher.has_message_listener(&listener) {
            self.dispatcher.remove_message_listener(&listener);
        }
    }

    /// Send `subscribe` for the current id and wait for the reply
    async fn send_subscribe(&self) -> Result<()> {
        let sub = lock(&self.subscription).clone();
        tracing::info!(
            subscription_id = sub.id,
            channel_id = sub.channel_id,
            profile = sub.profile.as_deref().unwrap_or(""),
            "Requesting subscription"
        );

        let mut request = HtspMessage::with_method(methods::SUBSCRIBE)
            .field("subscriptionId", sub.id)
            .field("channelId", sub.channel_id)
            .field("timeshiftPeriod", sub.requested_timeshift);
        if let Some(profile) = &sub.profile {
            request.put("profile", profile.as_str());
        }

        let reply = self
            .dispatcher
            .send_request_or_timeout(request, self.request_timeout)
            .await?;

        let granted = reply.get_i64_or("timeshiftPeriod", 0);
        tracing::info!(subscription_id = sub.id, timeshift_period = granted, "Subscribed");

        let mut current = lock(&self.subscription);
        if current.id == sub.id {
            current.granted_timeshift = granted;
            current.active = true;
        }
        Ok(())
    }

    fn send_unsubscribe(&self, id: u32) {
        let request = HtspMessage::with_method(methods::UNSUBSCRIBE).field("subscriptionId", id);
        if let Err(e) = self.dispatcher.send_message(request) {
            // Server drops subscriptions on disconnect anyway
            tracing::debug!(subscription_id = id, error = %e, "Unsubscribe not sent");
        }
    }

    fn start_timer(&self) {
        let me = self.me.clone();
        let interval = self.stats_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(subscriber) = me.upgrade() else {
                    break;
                };
                let id = lock(&subscriber.subscription).id;
                lock(&subscriber.stats).log(id);
            }
        });

        if let Some(previous) = lock(&self.timer).replace(handle) {
            previous.abort();
        }
    }

    fn stop_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
    }

    fn handle_internally(&self, kind: Notification, message: &HtspMessage) {
        match kind {
            Notification::Start => {
                let now_us = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_micros() as i64)
                    .unwrap_or_default();
                lock(&self.subscription).start_time_us = Some(now_us);
                lock(&self.stats).started_at = Some(Instant::now());
            }
            Notification::Status => {
                let status = message.get_str("status");
                let error = message.get_str("subscriptionError");
                if status.is_some() || error.is_some() {
                    tracing::warn!(
                        subscription_id = message.get_u32("subscriptionId").unwrap_or(0),
                        status = status.unwrap_or(""),
                        error = error.unwrap_or(""),
                        "Subscription status"
                    );
                }
            }
            Notification::Stop => {
                tracing::info!(
                    subscription_id = message.get_u32("subscriptionId").unwrap_or(0),
                    status = message.get_str_or("status", ""),
                    "Subscription stopped by server"
                );
                self.stop_timer();
            }
            Notification::QueueStatus => {
                lock(&self.stats).queue = Some(QueueStatus::from_message(message));
            }
            Notification::SignalStatus => {
                lock(&self.stats).signal = Some(SignalStatus::from_message(message));
            }
            Notification::TimeshiftStatus => {
                lock(&self.stats).timeshift = Some(TimeshiftStatus::from_message(message));
            }
            Notification::Muxpkt => {
                lock(&self.stats).packets += 1;
            }
            Notification::Skip | Notification::Speed => {}
        }
    }
}

impl MessageListener for Subscriber {
    fn on_message(&self, message: &HtspMessage) {
        let Some(kind) = message.method().and_then(Notification::from_method) else {
            return;
        };

        let current = lock(&self.subscription).id;
        if current == 0 || message.get_u32("subscriptionId") != Some(current) {
            return;
        }

        self.handle_internally(kind, message);

        let listeners = self.listeners.snapshot();
        if listeners.is_empty() {
            return;
        }
        let message = Arc::new(message.clone());
        for listener in listeners {
            let context = listener.callback_context();
            let message = Arc::clone(&message);
            deliver(listener, context, move |l| kind.forward(l, &message));
        }
    }
}

impl AuthenticationListener for Subscriber {
    fn on_authentication_state_change(&self, state: AuthenticationState) {
        if state != AuthenticationState::Authenticated || !self.is_active() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let (id, channel_id) = {
            let sub = lock(&self.subscription);
            (sub.id, sub.channel_id)
        };
        tracing::warn!(
            subscription_id = id,
            channel_id = channel_id,
            "Resubscribing after reconnect"
        );
        let handle = tokio::spawn(async move {
            me.register();
            match me.send_subscribe().await {
                Ok(()) => me.start_timer(),
                Err(e) => tracing::error!(error = %e, "Resubscribe failed"),
            }
        });

        if let Some(previous) = lock(&self.resume).replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop_timer();
        if let Some(task) = lock(&self.resume).take() {
            task.abort();
        }

        let (id, active) = {
            let sub = lock(&self.subscription);
            (sub.id, sub.active)
        };
        if active {
            tracing::info!(subscription_id = id, "Subscriber dropped, unsubscribing");
            self.send_unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counts {
        starts: AtomicUsize,
        packets: AtomicUsize,
    }

    impl SubscriptionListener for Counts {
        fn on_subscription_start(&self, _message: &HtspMessage) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_muxpkt(&self, _message: &HtspMessage) {
            self.packets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn subscriber_with_id(id: u32) -> Arc<Subscriber> {
        let subscriber = Subscriber::new(Arc::new(MessageDispatcher::new()));
        {
            let mut sub = lock(&subscriber.subscription);
            sub.id = id;
            sub.active = true;
        }
        subscriber
    }

    #[test]
    fn test_ids_are_unique() {
        let a = allocate_subscription_id();
        let b = allocate_subscription_id();
        assert!(b > a);
    }

    #[test]
    fn test_filters_by_subscription_id() {
        let subscriber = subscriber_with_id(5);
        let counts = Arc::new(Counts::default());
        let l: Arc<dyn SubscriptionListener> = counts.clone();
        subscriber.add_subscription_listener(&l);

        subscriber.on_message(&HtspMessage::with_method("muxpkt").field("subscriptionId", 5));
        subscriber.on_message(&HtspMessage::with_method("muxpkt").field("subscriptionId", 6));
        subscriber.on_message(&HtspMessage::with_method("muxpkt"));
        subscriber.on_message(&HtspMessage::with_method("channelAdd").field("subscriptionId", 5));

        assert_eq!(counts.packets.load(Ordering::SeqCst), 1);
        assert_eq!(subscriber.stats().packets, 1);
    }

    #[test]
    fn test_snapshots_and_timeshift_helpers() {
        let subscriber = subscriber_with_id(9);
        assert_eq!(subscriber.timeshift_offset_pts(), None);

        subscriber.on_message(&HtspMessage::with_method("subscriptionStart").field("subscriptionId", 9));
        subscriber.on_message(
            &HtspMessage::with_method("timeshiftStatus")
                .field("subscriptionId", 9)
                .field("shift", 2_000_000)
                .field("start", 1_000),
        );
        subscriber.on_message(
            &HtspMessage::with_method("queueStatus")
                .field("subscriptionId", 9)
                .field("packets", 3),
        );

        assert_eq!(subscriber.timeshift_offset_pts(), Some(-2_000_000));
        assert_eq!(subscriber.timeshift_start_pts(), Some(1_000));
        assert!(subscriber.timeshift_start_time().is_some());
        assert_eq!(subscriber.queue_status().map(|q| q.packets), Some(3));
        assert!(subscriber.stats().started_at.is_some());
    }

    #[tokio::test]
    async fn test_queued_listener_delivery() {
        let subscriber = subscriber_with_id(11);
        let (ctx, mut queue) = CallbackContext::channel();

        struct Queued(CallbackContext, AtomicUsize);
        impl SubscriptionListener for Queued {
            fn callback_context(&self) -> Option<CallbackContext> {
                Some(self.0.clone())
            }
            fn on_subscription_start(&self, _message: &HtspMessage) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let listener = Arc::new(Queued(ctx, AtomicUsize::new(0)));
        let l: Arc<dyn SubscriptionListener> = listener.clone();
        subscriber.add_subscription_listener(&l);

        subscriber.on_message(&HtspMessage::with_method("subscriptionStart").field("subscriptionId", 11));
        assert_eq!(listener.1.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(listener.1.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_without_connection_fails_and_deregisters() {
        let dispatcher = Arc::new(MessageDispatcher::new());
        let subscriber = Subscriber::new(dispatcher.clone());

        let result = subscriber.subscribe(1, None, 0).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert!(!subscriber.is_active());

        let l: Arc<dyn MessageListener> = subscriber.clone();
        assert!(!dispatcher.has_message_listener(&l));
    }

    #[tokio::test]
    async fn test_drop_aborts_background_tasks() {
        let subscriber = subscriber_with_id(13);

        let (timer_tx, timer_rx) = tokio::sync::oneshot::channel::<()>();
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();
        *lock(&subscriber.timer) = Some(tokio::spawn(async move {
            let _held = timer_tx;
            std::future::pending::<()>().await
        }));
        *lock(&subscriber.resume) = Some(tokio::spawn(async move {
            let _held = resume_tx;
            std::future::pending::<()>().await
        }));
        assert!(subscriber.is_reporting_stats());

        drop(subscriber);

        // Senders only go away when the tasks are torn down
        assert!(timer_rx.await.is_err());
        assert!(resume_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_server_stop_halts_stats_report() {
        let subscriber = subscriber_with_id(15);
        subscriber.start_timer();
        assert!(subscriber.is_reporting_stats());

        subscriber.on_message(&HtspMessage::with_method("subscriptionStop").field("subscriptionId", 15));
        assert!(!subscriber.is_reporting_stats());
    }

    #[test]
    fn test_controls_require_active_subscription() {
        let subscriber = Subscriber::new(Arc::new(MessageDispatcher::new()));
        assert!(subscriber.pause().is_err());
        assert!(subscriber.skip(0).is_err());
        assert!(subscriber.live().is_err());
        // Never subscribed: nothing to send
        subscriber.unsubscribe();
        assert!(subscriber.subscription_id().is_none());
    }
}
