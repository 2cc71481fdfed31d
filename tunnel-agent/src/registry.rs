//! Request registry (C3): routes inbound frames to the per-request handler
//! by request id, and produces the per-request sub-stream a freshly created
//! `PerRequest` reads from.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tunnel_protocol::{frame_type, Frame, RequestId};

/// What the caller (the tunnel session's read loop) should do with a
/// decoded frame once the registry has looked at it.
pub enum Routed {
    /// First frame of a new request; the caller must spawn a `PerRequest`
    /// and pass it `inbox` as its inbound sub-stream.
    New {
        frame: Frame,
        inbox: mpsc::Receiver<Frame>,
    },
    /// Frame for a request the registry already knows about; it has been
    /// forwarded to that request's sub-stream.
    Forwarded,
    /// A `go-idle` control frame, not tied to any request.
    Idle(Frame),
    /// Frame type/id combination the registry has nothing to do with.
    Dropped,
}

/// Bound applied to each per-request inbound channel. Generous enough that
/// a slow local upstream doesn't make the session's read loop block.
const PER_REQUEST_INBOX_CAPACITY: usize = 64;

#[derive(Default)]
pub struct Registry {
    entries: HashMap<RequestId, mpsc::Sender<Frame>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one decoded frame. Mutates the registry when a request starts
    /// or ends; never blocks (each per-request channel has slack and a full
    /// one simply means the caller observed backpressure via `Dropped`-like
    /// handling upstream — in practice frames are produced one at a time by
    /// the single read loop, so this never actually saturates a fresh inbox).
    pub fn route(&mut self, frame: Frame) -> Routed {
        if frame.is_type(frame_type::GO_IDLE) {
            return Routed::Idle(frame);
        }

        let known = self.entries.contains_key(&frame.request_id);

        if !known && (frame.is_type(frame_type::HTTP) || frame.is_type(frame_type::WS)) {
            let (tx, rx) = mpsc::channel(PER_REQUEST_INBOX_CAPACITY);
            self.entries.insert(frame.request_id, tx);
            return Routed::New { frame, inbox: rx };
        }

        if known {
            if let Some(tx) = self.entries.get(&frame.request_id) {
                // A full inbox here would mean the per-request task died
                // without deregistering; treat that as "no longer routable".
                let request_id = frame.request_id;
                if tx.try_send(frame).is_err() {
                    self.entries.remove(&request_id);
                }
                return Routed::Forwarded;
            }
        }

        Routed::Dropped
    }

    /// Deregister a request, e.g. once its `PerRequest` has torn down.
    pub fn remove(&mut self, id: &RequestId) {
        self.entries.remove(id);
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(b: u8) -> RequestId {
        let mut id = [0u8; 16];
        id[15] = b;
        id
    }

    #[test]
    fn test_first_http_frame_creates_new_request() {
        let mut reg = Registry::new();
        let frame = Frame::new(rid(1), frame_type::HTTP, b"{}".to_vec());
        match reg.route(frame) {
            Routed::New { .. } => {}
            _ => panic!("expected New"),
        }
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_subsequent_frames_for_known_id_are_forwarded() {
        let mut reg = Registry::new();
        let id = rid(2);
        reg.route(Frame::new(id, frame_type::HTTP, b"{}".to_vec()));
        let outcome = reg.route(Frame::new(id, frame_type::DATA, b"chunk".to_vec()));
        assert!(matches!(outcome, Routed::Forwarded));
    }

    #[test]
    fn test_go_idle_is_not_per_request() {
        let mut reg = Registry::new();
        let frame = Frame::empty(rid(3), frame_type::GO_IDLE);
        assert!(matches!(reg.route(frame), Routed::Idle(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_unknown_id_with_non_starting_type_is_dropped() {
        let mut reg = Registry::new();
        let frame = Frame::empty(rid(4), frame_type::DATA);
        assert!(matches!(reg.route(frame), Routed::Dropped));
    }

    #[test]
    fn test_removing_a_request_stops_forwarding_to_it() {
        let mut reg = Registry::new();
        let id = rid(5);
        reg.route(Frame::new(id, frame_type::HTTP, b"{}".to_vec()));
        reg.remove(&id);
        let frame = Frame::empty(id, frame_type::END);
        assert!(matches!(reg.route(frame), Routed::Dropped));
    }
}
