use tokio::sync::mpsc;

use crate::error::TransportError;

/// Sending half of a [`MessageConnection`].
#[derive(Debug)]
pub struct ConnectionSender<T> {
    tx: mpsc::Sender<Result<T, TransportError>>,
}

impl<T> Clone for ConnectionSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> ConnectionSender<T> {
    pub(crate) fn new(tx: mpsc::Sender<Result<T, TransportError>>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, item: T) -> Result<(), TransportError> {
        self.tx
            .send(Ok(item))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Delivers `err` to the receiving side as a link failure.
    pub async fn fail(&self, err: TransportError) {
        let _ = self.tx.send(Err(err)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reliable, ordered, bidirectional message link.
///
/// The receiver yields `Err` when the link fails and `None` once the peer has
/// gone away.
#[derive(Debug)]
pub struct MessageConnection<T> {
    pub peer: String,
    pub sender: ConnectionSender<T>,
    pub receiver: mpsc::Receiver<Result<T, TransportError>>,
}

impl<T> MessageConnection<T> {
    pub fn new(
        peer: impl Into<String>,
        sender: ConnectionSender<T>,
        receiver: mpsc::Receiver<Result<T, TransportError>>,
    ) -> Self {
        Self {
            peer: peer.into(),
            sender,
            receiver,
        }
    }
}

/// Two connected in-process endpoints. `a.peer` is `b_name` and vice versa.
pub fn in_memory_pair<T>(
    capacity: usize,
    a_name: &str,
    b_name: &str,
) -> (MessageConnection<T>, MessageConnection<T>) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        MessageConnection::new(b_name, ConnectionSender::new(a_tx), a_rx),
        MessageConnection::new(a_name, ConnectionSender::new(b_tx), b_rx),
    )
}

#[cfg(test)]
mod tests {
    use super::in_memory_pair;
    use crate::error::TransportError;

    #[tokio::test]
    async fn pair_delivers_in_order_both_ways() {
        let (mut a, mut b) = in_memory_pair::<u32>(8, "a", "b");
        assert_eq!(a.peer, "b");
        assert_eq!(b.peer, "a");
        for i in 0..3 {
            a.sender.send(i).await.expect("send");
        }
        b.sender.send(9).await.expect("send");
        for i in 0..3 {
            assert_eq!(b.receiver.recv().await, Some(Ok(i)));
        }
        assert_eq!(a.receiver.recv().await, Some(Ok(9)));
    }

    #[tokio::test]
    async fn dropping_one_side_ends_the_other() {
        let (a, mut b) = in_memory_pair::<u32>(8, "a", "b");
        a.sender.fail(TransportError::Io("reset".into())).await;
        drop(a);
        assert_eq!(
            b.receiver.recv().await,
            Some(Err(TransportError::Io("reset".into())))
        );
        assert_eq!(b.receiver.recv().await, None);
        assert!(b.sender.send(1).await.is_err());
    }
}
