//! Periodic `keepalive` liveness check

use super::command_queue::CommandSender;
use super::session::SessionFailure;
use crate::protocol::commands::KEEPALIVE;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Send `keepalive` every `period` and wait for the header to come back.
///
/// `seen` is bumped by the receive loop for every keepalive header.
/// `max_missed` consecutive misses end the session.
pub async fn run_keepalive_loop(
    sender: CommandSender,
    mut seen: watch::Receiver<u64>,
    period: Duration,
    timeout: Duration,
    max_missed: u32,
    cancel: CancellationToken,
) -> Option<SessionFailure> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = ticker.tick() => {}
        }

        seen.borrow_and_update();
        if let Err(e) = sender.send(KEEPALIVE, false).await {
            debug!("Keepalive not queued: {e}");
            return None;
        }

        let answered = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = tokio::time::timeout(timeout, seen.changed()) => match result {
                Ok(Ok(())) => true,
                // receive loop gone; it reports its own failure
                Ok(Err(_)) => return None,
                Err(_) => false,
            },
        };

        if answered {
            missed = 0;
            continue;
        }

        missed += 1;
        warn!(missed, max_missed, "Keepalive not answered within {timeout:?}");
        if missed >= max_missed {
            return Some(SessionFailure::KeepaliveTimeout);
        }
    }
}
