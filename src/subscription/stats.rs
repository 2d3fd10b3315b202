//! Subscription health snapshots
//!
//! Parsed forms of the `queueStatus`, `signalStatus` and `timeshiftStatus`
//! notifications. Fields the server omits stay `None` or zero.

use std::time::{Duration, Instant};

use crate::message::HtspMessage;

/// Server-side packet queue for one subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Packets currently queued
    pub packets: i64,
    /// Bytes currently queued
    pub bytes: i64,
    /// Queue delay in microseconds
    pub delay: i64,
    /// B-frames dropped
    pub b_drops: i64,
    /// P-frames dropped
    pub p_drops: i64,
    /// I-frames dropped
    pub i_drops: i64,
}

impl QueueStatus {
    pub fn from_message(msg: &HtspMessage) -> Self {
        Self {
            packets: msg.get_i64_or("packets", 0),
            bytes: msg.get_i64_or("bytes", 0),
            delay: msg.get_i64_or("delay", 0),
            b_drops: msg.get_i64_or("Bdrops", 0),
            p_drops: msg.get_i64_or("Pdrops", 0),
            i_drops: msg.get_i64_or("Idrops", 0),
        }
    }

    /// Total dropped frames
    pub fn drops(&self) -> i64 {
        self.b_drops + self.p_drops + self.i_drops
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay.max(0) as u64)
    }
}

/// Tuner front-end health
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalStatus {
    /// Front-end status text, e.g. `GOOD`
    pub status: String,
    pub snr: Option<i64>,
    pub signal: Option<i64>,
    /// Bit error rate
    pub ber: Option<i64>,
    /// Uncorrected blocks
    pub unc: Option<i64>,
}

impl SignalStatus {
    pub fn from_message(msg: &HtspMessage) -> Self {
        Self {
            status: msg.get_str_or("feStatus", "").to_owned(),
            snr: msg.get_i64("feSNR"),
            signal: msg.get_i64("feSignal"),
            ber: msg.get_i64("feBER"),
            unc: msg.get_i64("feUNC"),
        }
    }
}

/// Timeshift buffer position
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeshiftStatus {
    /// Buffer is full
    pub full: bool,
    /// Distance behind live, microseconds
    pub shift: i64,
    /// PTS of the oldest buffered packet
    pub start: Option<i64>,
    /// PTS of the newest buffered packet
    pub end: Option<i64>,
}

impl TimeshiftStatus {
    pub fn from_message(msg: &HtspMessage) -> Self {
        Self {
            full: msg.get_i64_or("full", 0) != 0,
            shift: msg.get_i64_or("shift", 0),
            start: msg.get_i64("start"),
            end: msg.get_i64("end"),
        }
    }
}

/// Last snapshots received for one subscription
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStats {
    pub queue: Option<QueueStatus>,
    pub signal: Option<SignalStatus>,
    pub timeshift: Option<TimeshiftStatus>,
    /// Set on `subscriptionStart`
    pub started_at: Option<Instant>,
    /// `muxpkt` messages seen
    pub packets: u64,
}

impl SubscriptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time since `subscriptionStart`
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Emit one health line at info level
    pub fn log(&self, subscription_id: u32) {
        match &self.queue {
            Some(q) => tracing::info!(
                subscription_id = subscription_id,
                packets = q.packets,
                bytes = q.bytes,
                delay_us = q.delay,
                drops = q.drops(),
                "Subscription queue status"
            ),
            None => tracing::info!(subscription_id = subscription_id, "No queue status received"),
        }

        match &self.signal {
            Some(s) => tracing::info!(
                subscription_id = subscription_id,
                status = %s.status,
                snr = ?s.snr,
                signal = ?s.signal,
                ber = ?s.ber,
                unc = ?s.unc,
                "Subscription signal status"
            ),
            None => tracing::info!(subscription_id = subscription_id, "No signal status received"),
        }

        if let Some(t) = &self.timeshift {
            tracing::info!(
                subscription_id = subscription_id,
                full = t.full,
                shift = t.shift,
                "Subscription timeshift status"
            );
        }
    }
}
