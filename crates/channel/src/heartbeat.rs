//! Application-level keep-alive for a registered listener.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::messages::PingRequest;
use crate::transport::OutboundEvent;

/// Interval between application pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest period a ticker will run with.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// At most one ticker per channel. Starting replaces the previous one.
pub struct HeartbeatMonitor {
    period: Duration,
    ticker: Option<Interval>,
}

impl HeartbeatMonitor {
    /// Periods below [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    pub fn new(period: Duration) -> Self {
        if period < MIN_HEARTBEAT_INTERVAL {
            tracing::warn!(
                requested_ms = period.as_millis() as u64,
                "Heartbeat period too short, using the minimum"
            );
        }
        Self {
            period: period.max(MIN_HEARTBEAT_INTERVAL),
            ticker: None,
        }
    }

    pub fn start(&mut self) {
        self.stop();
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        tracing::debug!(period_secs = self.period.as_secs(), "Heartbeat started");
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if self.ticker.take().is_some() {
            tracing::debug!("Heartbeat stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Resolves on the next tick; never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    pub fn ping(client_id: &str) -> OutboundEvent {
        PingRequest::new(client_id).into()
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_tick_after_one_period() {
        let mut heartbeat = HeartbeatMonitor::default();
        heartbeat.start();
        let started = Instant::now();
        heartbeat.tick().await;
        assert_eq!(started.elapsed(), DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_ticker() {
        let mut heartbeat = HeartbeatMonitor::default();
        heartbeat.start();
        tokio::time::advance(Duration::from_secs(20)).await;
        heartbeat.start();
        let restarted = Instant::now();
        heartbeat.tick().await;
        assert_eq!(restarted.elapsed(), DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_never_ticks() {
        let mut heartbeat = HeartbeatMonitor::default();
        heartbeat.start();
        heartbeat.stop();
        heartbeat.stop();
        assert!(!heartbeat.is_running());
        let ticked = tokio::time::timeout(Duration::from_secs(300), heartbeat.tick()).await;
        assert!(ticked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_raised_to_minimum() {
        let mut heartbeat = HeartbeatMonitor::new(Duration::ZERO);
        heartbeat.start();
        assert!(heartbeat.is_running());
        let started = Instant::now();
        heartbeat.tick().await;
        assert_eq!(started.elapsed(), MIN_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn ping_payload() {
        let ping = HeartbeatMonitor::ping("abc");
        assert_eq!(ping.event, "ping");
        assert_eq!(ping.payload["client_id"], "abc");
    }
}
