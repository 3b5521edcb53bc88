//! Notifications emitted by connections.
//!
//! The protocol layer never takes policy decisions such as banning a peer.
//! It reports what happened through an [`AlertSink`] and leaves the rest to
//! whoever consumes the alerts.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::peer::PeerRequest;

const ALERT_CHANNEL_CAPACITY: usize = 256;
const ALERT_QUEUE_LIMIT: usize = 1000;

/// An event reported by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// The peer violated the protocol and was disconnected.
    PeerError { peer: String, message: String },
    /// The connection was closed.
    PeerDisconnected { peer: String, reason: String },
    /// The peer was detected as not answering requests in time.
    PeerSnubbed { peer: String },
    /// The peer sent a request we refused.
    InvalidRequest { peer: String, request: PeerRequest },
    /// A block was handed to the picker as being downloaded from a peer.
    BlockDownloading { peer: String, piece: u32, block: u32 },
    /// A block was written to disk.
    BlockFinished { peer: String, piece: u32, block: u32 },
    /// A piece passed its hash check.
    PieceFinished { piece: u32 },
    /// A piece failed its hash check.
    HashFailed { piece: u32 },
    /// A web seed reported an error or asked us to come back later.
    UrlSeed { url: String, message: String },
    /// A web seed redirected us to another location.
    Redirected { from: String, to: String },
    /// The disk collaborator failed.
    FileError { message: String },
}

/// Receiver of connection notifications.
pub trait AlertSink: Send + Sync {
    fn post_alert(&self, alert: Alert);
}

/// Alert queue with broadcast subscription.
///
/// Alerts are buffered (the oldest dropped past a limit) for polling with
/// [`pop_alerts`](Self::pop_alerts), and broadcast to any live subscribers.
pub struct AlertQueue {
    pending: Mutex<VecDeque<Alert>>,
    tx: broadcast::Sender<Alert>,
}

impl AlertQueue {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            pending: Mutex::new(VecDeque::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Takes every buffered alert.
    pub fn pop_alerts(&self) -> Vec<Alert> {
        self.pending.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for AlertQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink for AlertQueue {
    fn post_alert(&self, alert: Alert) {
        {
            let mut pending = self.pending.lock();
            if pending.len() >= ALERT_QUEUE_LIMIT {
                pending.pop_front();
            }
            pending.push_back(alert.clone());
        }
        // no subscribers is fine
        let _ = self.tx.send(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_alerts_drains_in_order() {
        let queue = AlertQueue::new();
        queue.post_alert(Alert::PieceFinished { piece: 1 });
        queue.post_alert(Alert::HashFailed { piece: 2 });

        assert_eq!(
            queue.pop_alerts(),
            vec![Alert::PieceFinished { piece: 1 }, Alert::HashFailed { piece: 2 }]
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_alerts() {
        let queue = AlertQueue::new();
        let mut rx = queue.subscribe();
        queue.post_alert(Alert::PieceFinished { piece: 7 });
        assert_eq!(rx.recv().await.unwrap(), Alert::PieceFinished { piece: 7 });
    }
}
