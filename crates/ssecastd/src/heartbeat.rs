//! Periodic heartbeat messages.
//!
//! Publishes `heartbeat #<n> at <RFC 3339 time>` through the broadcaster on a
//! fixed period, whether or not anyone is subscribed. Stops when the shutdown
//! token fires.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed tick is logged and the next tick proceeds on schedule

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broadcaster::Broadcaster;

/// Default time between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Text of the `counter`-th heartbeat.
pub fn heartbeat_payload(counter: u64, at: DateTime<Utc>) -> String {
    format!(
        "heartbeat #{counter} at {}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Spawns the heartbeat task.
///
/// The first heartbeat is published one `period` after the call. The task
/// resolves to the number of heartbeats published.
pub fn spawn_heartbeat(
    broadcaster: Arc<Broadcaster>,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = period.as_millis() as u64, "Heartbeat started");

        let mut counter = 0u64;
        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!("Heartbeat shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    match broadcaster.publish(heartbeat_payload(counter, Utc::now())).await {
                        Ok(message) => {
                            trace!(message_id = %message.id(), counter, "Heartbeat published");
                            counter += 1;
                        }
                        Err(e) => {
                            warn!(counter, error = %e, "Heartbeat tick skipped");
                        }
                    }
                }
            }
        }

        info!(published = counter, "Heartbeat stopped");
        counter
    })
}
