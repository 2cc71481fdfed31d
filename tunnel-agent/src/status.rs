//! Connection status surfaced by the supervisor, for anything embedding
//! this agent as a library to watch without polling.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Connected,
    Disconnected,
    Idle,
}

/// A `watch` channel carrying the supervisor's current state. Cloned
/// freely; every clone observes the latest value, never a backlog.
pub fn channel() -> (watch::Sender<Status>, watch::Receiver<Status>) {
    watch::channel(Status::Connecting)
}

/// Publish a new status, skipping the send entirely when it matches the
/// current value so watchers never see duplicate transitions.
pub fn set(tx: &watch::Sender<Status>, status: Status) {
    tx.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_status_does_not_mark_changed() {
        let (tx, mut rx) = channel();
        set(&tx, Status::Connecting);
        assert!(!rx.has_changed().unwrap());

        set(&tx, Status::Connected);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        set(&tx, Status::Connected);
        assert!(!rx.has_changed().unwrap());
    }
}
