use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ReplicationConfig;
use crate::connector::Connector;
use crate::error::ServiceError;
use crate::sender::ReplicationSender;
use crate::SharedRegistry;

/// Change in the set of replication peer addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Added(String),
    Removed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Running,
    Closed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Idle => "idle",
            ServiceState::Running => "running",
            ServiceState::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct ServiceInner {
    registry: SharedRegistry,
    connector: Arc<dyn Connector>,
    config: ReplicationConfig,
    runtime: Handle,
    state: Mutex<ServiceState>,
    senders: Mutex<HashMap<String, ReplicationSender>>,
    cancel: CancellationToken,
    follower: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one replication sender per known peer address.
#[derive(Clone)]
pub struct ReplicationService {
    inner: Arc<ServiceInner>,
}

impl ReplicationService {
    pub fn new(
        config: ReplicationConfig,
        registry: SharedRegistry,
        connector: Arc<dyn Connector>,
        runtime: &Handle,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry,
                connector,
                config,
                runtime: runtime.clone(),
                state: Mutex::new(ServiceState::Idle),
                senders: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                follower: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock()
    }

    /// Starts following `peers`. Only valid once, from `Idle`.
    pub fn start<S>(&self, peers: S) -> Result<(), ServiceError>
    where
        S: Stream<Item = PeerEvent> + Send + Unpin + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ServiceState::Idle => *state = ServiceState::Running,
                ServiceState::Running => return Err(ServiceError::AlreadyStarted),
                ServiceState::Closed => return Err(ServiceError::Closed),
            }
        }
        info!(self_id = %self.inner.config.self_id, "replication service started");
        let task = self.inner.runtime.spawn(follow(self.inner.clone(), peers));
        *self.inner.follower.lock() = Some(task);
        Ok(())
    }

    /// Addresses with a sender, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.senders.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Whether the sender for `address` has given up or stopped.
    pub fn is_peer_finished(&self, address: &str) -> Option<bool> {
        self.inner
            .senders
            .lock()
            .get(address)
            .map(ReplicationSender::is_finished)
    }

    /// Stops every sender. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ServiceState::Closed {
                return;
            }
            *state = ServiceState::Closed;
        }
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.follower.lock().take() {
            task.abort();
        }
        let senders: Vec<ReplicationSender> =
            self.inner.senders.lock().drain().map(|(_, s)| s).collect();
        for sender in &senders {
            sender.stop();
        }
        info!(stopped = senders.len(), "replication service closed");
    }
}

async fn follow<S>(inner: Arc<ServiceInner>, mut peers: S)
where
    S: Stream<Item = PeerEvent> + Unpin,
{
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            event = peers.next() => event,
        };
        match event {
            Some(PeerEvent::Added(address)) => add_peer(&inner, address),
            Some(PeerEvent::Removed(address)) => remove_peer(&inner, &address),
            None => {
                debug!("peer stream ended, keeping current senders");
                return;
            }
        }
    }
}

fn add_peer(inner: &ServiceInner, address: String) {
    let mut senders = inner.senders.lock();
    if senders.contains_key(&address) {
        return;
    }
    info!(%address, "replication peer added");
    let sender = ReplicationSender::spawn(
        address.clone(),
        inner.registry.clone(),
        inner.connector.clone(),
        inner.config.clone(),
        &inner.runtime,
    );
    senders.insert(address, sender);
}

fn remove_peer(inner: &ServiceInner, address: &str) {
    if let Some(sender) = inner.senders.lock().remove(address) {
        info!(%address, "replication peer removed");
        sender.stop();
    }
}
