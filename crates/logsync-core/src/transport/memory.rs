//! In-process transport.
//!
//! Frames sent on one side are published as `Received` events straight into
//! the other side's event channel. Readiness is toggled by hand, which makes
//! it easy to model a link that comes up late.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;

use super::{Transport, TransportEvent, TransportEventSender};
use crate::error::{SyncError, SyncResult};

pub struct MemoryTransport {
    name: String,
    /// Address the remote side sees us as
    local_addr: String,
    remote: TransportEventSender,
    ready: AtomicBool,
    sent: AtomicU64,
}

impl MemoryTransport {
    pub fn new(
        name: impl Into<String>,
        local_addr: impl Into<String>,
        remote: TransportEventSender,
        ready: bool,
    ) -> Self {
        Self {
            name: name.into(),
            local_addr: local_addr.into(),
            remote,
            ready: AtomicBool::new(ready),
            sent: AtomicU64::new(0),
        }
    }

    /// Two connected ends. `a_events` receives what `b` sends and vice versa.
    pub fn pair(
        name: &str,
        a_addr: &str,
        a_events: TransportEventSender,
        b_addr: &str,
        b_events: TransportEventSender,
        ready: bool,
    ) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new(name, a_addr, b_events, ready));
        let b = Arc::new(Self::new(name, b_addr, a_events, ready));
        (a, b)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Frames accepted so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Bytes, _target: Option<&str>) -> SyncResult<()> {
        if !self.is_ready() {
            return Err(SyncError::Transport(format!("{} is not ready", self.name)));
        }
        let event = TransportEvent::Received {
            transport: self.name.clone(),
            from: Some(self.local_addr.clone()),
            bytes: frame,
        };
        match self.remote.try_send(event) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                Err(SyncError::Transport(format!("{} peer channel full", self.name)))
            }
            Err(TrySendError::Closed(_)) => {
                Err(SyncError::Transport(format!("{} peer gone", self.name)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_pair_delivers_to_other_side() {
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        let (a, b) = MemoryTransport::pair("mesh", "alice", a_tx, "bob", b_tx, true);

        a.send(Bytes::from_static(b"to bob"), None).unwrap();
        b.send(Bytes::from_static(b"to alice"), None).unwrap();

        assert_eq!(
            b_rx.recv().await,
            Some(TransportEvent::Received {
                transport: "mesh".into(),
                from: Some("alice".into()),
                bytes: Bytes::from_static(b"to bob"),
            })
        );
        assert!(matches!(
            a_rx.recv().await,
            Some(TransportEvent::Received { from: Some(f), .. }) if f == "bob"
        ));
        assert_eq!(a.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_refuses() {
        let (tx, _rx) = mpsc::channel(8);
        let t = MemoryTransport::new("link", "me", tx, false);
        assert!(!t.is_ready());
        assert!(t.send(Bytes::from_static(b"x"), None).is_err());
        t.set_ready(true);
        assert!(t.send(Bytes::from_static(b"x"), None).is_ok());
    }

    #[tokio::test]
    async fn test_full_channel_is_a_send_failure() {
        let (tx, _rx) = mpsc::channel(1);
        let t = MemoryTransport::new("link", "me", tx, true);
        assert!(t.send(Bytes::from_static(b"1"), None).is_ok());
        assert!(matches!(
            t.send(Bytes::from_static(b"2"), None),
            Err(SyncError::Transport(_))
        ));
    }
}
