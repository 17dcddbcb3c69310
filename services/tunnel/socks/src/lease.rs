//! Single-use leases on a session's data channel.
//!
//! While a lease is outstanding the manager does not process any other
//! request, so the session it points at cannot be closed underneath the
//! holder. The lease is released when it is consumed by [`ChannelLease::send`],
//! released explicitly, or dropped.

use crate::{Seq, SocksError};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Borrowed sending end of a session's data channel
#[derive(Debug)]
pub struct ChannelLease {
    seq: Seq,
    tx: mpsc::Sender<Bytes>,
    send_timeout: Duration,
    _release: oneshot::Sender<()>,
}

impl ChannelLease {
    /// Create a lease and the receiver the manager waits on for its release
    pub(crate) fn new(
        seq: Seq,
        tx: mpsc::Sender<Bytes>,
        send_timeout: Duration,
    ) -> (Self, oneshot::Receiver<()>) {
        let (release, released) = oneshot::channel();
        let lease = Self {
            seq,
            tx,
            send_timeout,
            _release: release,
        };
        (lease, released)
    }

    /// Sequence number of the leased session
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Deliver one payload to the session's consumer, then release the lease
    pub async fn send(self, data: Bytes) -> Result<(), SocksError> {
        let len = data.len();
        match tokio::time::timeout(self.send_timeout, self.tx.send(data)).await {
            Ok(Ok(())) => {
                trace!("Delivered {} bytes to session {}", len, self.seq);
                Ok(())
            }
            Ok(Err(_)) => Err(SocksError::ChannelClosed(self.seq)),
            Err(_) => Err(SocksError::LeaseTimeout(self.seq)),
        }
    }

    /// Give the lease back without using it
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_releases() {
        let (tx, mut rx) = mpsc::channel(1);
        let (lease, released) = ChannelLease::new(4, tx, Duration::from_secs(1));
        assert_eq!(lease.seq(), 4);

        lease.send(Bytes::from_static(b"ping")).await.unwrap();
        assert!(released.await.is_err());
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_explicit_release() {
        let (tx, _rx) = mpsc::channel(1);
        let (lease, released) = ChannelLease::new(1, tx, Duration::from_secs(1));
        lease.release();
        assert!(released.await.is_err());
    }

    #[tokio::test]
    async fn test_closed_consumer() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (lease, _released) = ChannelLease::new(2, tx, Duration::from_secs(1));
        assert_eq!(
            lease.send(Bytes::from_static(b"x")).await,
            Err(SocksError::ChannelClosed(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_consumer_times_out() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(Bytes::from_static(b"full")).await.unwrap();

        let (lease, _released) = ChannelLease::new(3, tx, Duration::from_millis(50));
        assert_eq!(
            lease.send(Bytes::from_static(b"blocked")).await,
            Err(SocksError::LeaseTimeout(3))
        );
    }
}
