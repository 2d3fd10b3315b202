//! HTSP protocol constants

use std::time::Duration;

/// HTSP protocol version announced in `hello`
pub const HTSP_VERSION: i64 = 26;

/// Default TVHeadend HTSP port
pub const DEFAULT_PORT: u16 = 9982;

/// Default deadline for correlated requests issued by this crate
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between subscription health log lines
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Reconnect delay added per consecutive failure
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Upper bound on the reconnect delay
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_millis(3000);

/// Subscription speed for normal playback
pub const SPEED_NORMAL: i64 = 100;

/// Subscription speed for pause
pub const SPEED_PAUSED: i64 = 0;

/// Control methods (client to server)
pub mod methods {
    pub const HELLO: &str = "hello";
    pub const AUTHENTICATE: &str = "authenticate";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const SUBSCRIPTION_SPEED: &str = "subscriptionSpeed";
    pub const SUBSCRIPTION_SKIP: &str = "subscriptionSkip";
    pub const SUBSCRIPTION_LIVE: &str = "subscriptionLive";
    pub const FILE_OPEN: &str = "fileOpen";
    pub const FILE_READ: &str = "fileRead";
    pub const FILE_CLOSE: &str = "fileClose";
}

/// Unsolicited notifications (server to client)
pub mod notifications {
    pub const SUBSCRIPTION_START: &str = "subscriptionStart";
    pub const SUBSCRIPTION_STATUS: &str = "subscriptionStatus";
    pub const SUBSCRIPTION_STOP: &str = "subscriptionStop";
    pub const SUBSCRIPTION_SKIP: &str = "subscriptionSkip";
    pub const SUBSCRIPTION_SPEED: &str = "subscriptionSpeed";
    pub const QUEUE_STATUS: &str = "queueStatus";
    pub const SIGNAL_STATUS: &str = "signalStatus";
    pub const TIMESHIFT_STATUS: &str = "timeshiftStatus";
    pub const MUXPKT: &str = "muxpkt";
}
