use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use roster_codec::ReplicationFrame;
use roster_transport::{in_memory_pair, tcp, MessageConnection, TransportError};
use tokio::sync::mpsc;

/// Opens replication connections to peer addresses.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        address: &str,
    ) -> BoxFuture<'static, Result<MessageConnection<ReplicationFrame>, TransportError>>;
}

/// Dials peers over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        address: &str,
    ) -> BoxFuture<'static, Result<MessageConnection<ReplicationFrame>, TransportError>> {
        let address = address.to_string();
        Box::pin(async move { tcp::connect(&address).await })
    }
}

type Listener = mpsc::UnboundedSender<MessageConnection<ReplicationFrame>>;

/// In-process network of named listeners, for tests and embedded clusters.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, Listener>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts connections dialed to `address`. A second call for the same
    /// address replaces the first listener.
    pub fn listen(
        &self,
        address: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<MessageConnection<ReplicationFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(address.into(), tx);
        rx
    }

    pub fn unlisten(&self, address: &str) {
        self.listeners.lock().remove(address);
    }
}

impl Connector for InMemoryNetwork {
    fn connect(
        &self,
        address: &str,
    ) -> BoxFuture<'static, Result<MessageConnection<ReplicationFrame>, TransportError>> {
        let listener = self.listeners.lock().get(address).cloned();
        let address = address.to_string();
        Box::pin(async move {
            let refused = || TransportError::Io(format!("connection refused: {address}"));
            let listener = listener.ok_or_else(refused)?;
            let (local, remote) = in_memory_pair(64, "dialer", &address);
            listener.send(remote).map_err(|_| refused())?;
            Ok(local)
        })
    }
}

#[cfg(test)]
mod tests {
    use roster_codec::Frame;
    use roster_transport::TransportError;

    use super::{Connector, InMemoryNetwork};

    #[tokio::test]
    async fn dial_reaches_the_listener() {
        let network = InMemoryNetwork::new();
        let mut accepted = network.listen("node-b");

        let mut dialed = network.connect("node-b").await.expect("connect");
        let mut remote = accepted.recv().await.expect("accepted");
        assert_eq!(dialed.peer, "node-b");
        assert_eq!(remote.peer, "dialer");

        dialed.sender.send(Frame::Heartbeat).await.expect("send");
        assert_eq!(remote.receiver.recv().await, Some(Ok(Frame::Heartbeat)));
        remote.sender.send(Frame::Acknowledgement).await.expect("send");
        assert_eq!(dialed.receiver.recv().await, Some(Ok(Frame::Acknowledgement)));
    }

    #[tokio::test]
    async fn unknown_address_is_refused() {
        let network = InMemoryNetwork::new();
        let _accepted = network.listen("node-b");
        network.unlisten("node-b");
        let err = network.connect("node-b").await.expect_err("refused");
        assert_eq!(err, TransportError::Io("connection refused: node-b".into()));
    }
}
