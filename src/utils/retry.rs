//! Reconnect backoff.
//!
//! Uses `backon` for exponential backoff. Delays start at the configured
//! initial value, grow by the configured factor after each consecutive
//! failure and stay at the maximum once reached. No jitter, so schedules are
//! reproducible under paused time.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::config::ReconnectConfig;

/// Backoff for session reconnects. Never gives up; build a fresh iterator to
/// reset it after a successful connection.
fn reconnect_backoff(config: &ReconnectConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.initial_delay())
        .with_max_delay(config.max_delay())
        .with_factor(config.factor.max(1.0))
        .with_max_times(usize::MAX)
}

/// Reconnect delays, rounded to whole milliseconds. backon grows delays in
/// `f32` seconds, which drifts by a few nanoseconds per step.
pub fn reconnect_delays(config: &ReconnectConfig) -> impl Iterator<Item = Duration> + Send {
    reconnect_backoff(config).build().map(whole_millis)
}

fn whole_millis(delay: Duration) -> Duration {
    Duration::from_millis((delay.as_secs_f64() * 1_000.0).round() as u64)
}
