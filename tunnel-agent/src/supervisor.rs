//! Connection supervisor (C5): owns the reconnect loop around one tunnel
//! session, applying exponential backoff to failed attempts and handing
//! off to the idle notifier when the relay asks the agent to park.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::idle::IdleWatch;
use crate::session::{self, SessionExit};
use crate::status::{self, Status};

/// Above this, a connection is considered to have "settled": the session
/// reports `Status::Connected` and a subsequent drop no longer counts
/// against the backoff streak.
pub(crate) const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling on the backoff delay, regardless of how many attempts failed.
const MAX_BACKOFF_SECONDS: f64 = 600.0;

/// `min(600, round(1.8^(n-1)))` seconds for the n-th consecutive failure.
fn backoff_delay(attempt: u32) -> Duration {
    let seconds = 1.8f64.powi(attempt as i32 - 1).round();
    Duration::from_secs(seconds.min(MAX_BACKOFF_SECONDS) as u64)
}

/// Run the supervisor forever: connect, serve, reconnect. Never returns on
/// its own; the caller drives it alongside a cancellation signal.
pub async fn run(
    config: Arc<SessionConfig>,
    idle_watch: Arc<dyn IdleWatch>,
    status_tx: watch::Sender<Status>,
) {
    let mut attempt: u32 = 0;

    loop {
        match session::run(config.clone(), status_tx.clone()).await {
            Ok((SessionExit::GoIdle(descriptor), _)) => {
                status::set(&status_tx, Status::Idle);
                debug!(db_key = %descriptor.db_key, "parking in idle mode");
                let remote_names: Vec<String> =
                    config.tunnels.iter().map(|t| t.remote_name.clone()).collect();
                idle_watch.wait(&descriptor, &remote_names).await;
                attempt = 0;
                continue;
            }
            Ok((SessionExit::Disconnected, connected_for)) => {
                attempt = next_attempt(attempt, connected_for);
            }
            Err(err) => {
                warn!(error = %err, "tunnel session failed to start");
                attempt = next_attempt(attempt, Duration::ZERO);
            }
        }

        status::set(&status_tx, Status::Disconnected);
        let delay = backoff_delay(attempt);
        debug!(attempt, delay_secs = delay.as_secs(), "reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
}

/// A connection that stayed up past the settle delay resets the streak;
/// anything shorter (including an immediate handshake failure) extends it.
fn next_attempt(attempt: u32, connected_for: Duration) -> u32 {
    if connected_for >= SETTLE_DELAY {
        1
    } else {
        attempt.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps_at_ten_minutes() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(3));
        assert!(backoff_delay(20) <= Duration::from_secs(600));
        assert_eq!(backoff_delay(40), Duration::from_secs(600));
    }

    #[test]
    fn test_settled_connection_resets_the_streak() {
        assert_eq!(next_attempt(5, Duration::from_millis(501)), 1);
        assert_eq!(next_attempt(5, Duration::from_millis(100)), 6);
    }
}
