use std::sync::Arc;

use parking_lot::Mutex;
use roster_codec::{ReplicationHandshake, ReplicationHello, ReplicationMessage};
use roster_core::{Change, Interest, Origin, Source, SourceMatcher};
use roster_transport::{
    ChannelBuilder, ChannelError, ChannelEvents, ChannelHandle, ChannelState, ConnectOnce, Inbound,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::connector::Connector;
use crate::error::ReplicationError;
use crate::SharedRegistry;

type ReplicationChannel = ChannelHandle<ReplicationHandshake, ReplicationMessage>;
type ReplicationEvents = ChannelEvents<ReplicationHandshake, ReplicationMessage>;

/// How a sender finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderExit {
    /// Stopped locally, or the registry shut down.
    Stopped,
    /// The address led back to this node; it will not be dialed again.
    SelfConnection,
}

/// Channel produced by one connect attempt. Events are claimed once by the
/// replication session; other holders only observe the handle.
#[derive(Clone)]
struct ReplicationLink {
    channel: ReplicationChannel,
    events: Arc<Mutex<Option<ReplicationEvents>>>,
}

type LinkGate = Arc<ConnectOnce<ReplicationLink>>;

/// Pushes this node's own registrations to one peer address, reconnecting
/// after `retry_delay` whenever the channel fails.
pub struct ReplicationSender {
    address: String,
    cancel: CancellationToken,
    current: Arc<Mutex<Option<LinkGate>>>,
    task: JoinHandle<SenderExit>,
}

impl ReplicationSender {
    pub fn spawn(
        address: impl Into<String>,
        registry: SharedRegistry,
        connector: Arc<dyn Connector>,
        config: ReplicationConfig,
        runtime: &Handle,
    ) -> Self {
        let address = address.into();
        let cancel = CancellationToken::new();
        let current = Arc::new(Mutex::new(None));
        let worker = SenderLoop {
            address: address.clone(),
            registry,
            connector,
            config,
            runtime: runtime.clone(),
            cancel: cancel.clone(),
            current: current.clone(),
        };
        let task = runtime.spawn(worker.run());
        Self {
            address,
            cancel,
            current,
            task,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// State of the channel from the latest completed connect attempt.
    pub fn channel_state(&self) -> Option<ChannelState> {
        let gate = self.current.lock().clone()?;
        match gate.peek()? {
            Ok(link) => Some(link.channel.state()),
            Err(_) => None,
        }
    }

    /// Attaches to the current connect attempt and waits for its handshake
    /// to settle. `None` when no attempt is under way or it failed to connect.
    pub async fn connected(&self) -> Option<ChannelState> {
        let gate = self.current.lock().clone()?;
        let link = gate.wait().await.ok()?;
        Some(link.channel.ready().await)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> SenderExit {
        self.task.await.unwrap_or(SenderExit::Stopped)
    }
}

struct SenderLoop {
    address: String,
    registry: SharedRegistry,
    connector: Arc<dyn Connector>,
    config: ReplicationConfig,
    runtime: Handle,
    cancel: CancellationToken,
    current: Arc<Mutex<Option<LinkGate>>>,
}

impl SenderLoop {
    async fn run(self) -> SenderExit {
        let mut generation: u64 = rand::random();
        let exit = loop {
            generation = generation.wrapping_add(1);
            let source = Source::replicated(self.config.self_id.as_str()).with_generation(generation);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break SenderExit::Stopped,
                outcome = self.attempt(source) => outcome,
            };
            match outcome {
                Ok(()) => break SenderExit::Stopped,
                Err(ReplicationError::SelfConnection) => {
                    info!(address = %self.address, "replication address is this node, giving up on it");
                    break SenderExit::SelfConnection;
                }
                Err(err) => {
                    info!(
                        address = %self.address,
                        error = %err,
                        retry_in = ?self.config.retry_delay,
                        "replication channel down, reconnecting"
                    );
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break SenderExit::Stopped,
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        };
        self.close_current();
        debug!(address = %self.address, ?exit, "replication sender finished");
        exit
    }

    fn close_current(&self) {
        let Some(gate) = self.current.lock().take() else {
            return;
        };
        if let Some(Ok(link)) = gate.peek() {
            link.channel.shutdown();
        }
    }

    async fn attempt(&self, source: Source) -> Result<(), ReplicationError> {
        let gate: LinkGate = Arc::new(ConnectOnce::new(self.runtime.clone()));
        *self.current.lock() = Some(gate.clone());

        let hello = ReplicationHandshake::Hello(ReplicationHello {
            source,
            registry_size: self.registry.size() as u64,
        });
        let connector = self.connector.clone();
        let address = self.address.clone();
        let channel_config = self.config.channel.clone();
        let runtime = self.runtime.clone();
        let link = gate
            .get_or_connect(move || async move {
                let connection = connector.connect(&address).await?;
                let (channel, events) =
                    ChannelBuilder::initiator(format!("replication:{address}"), channel_config, hello)
                        .spawn(connection, &runtime);
                Ok(ReplicationLink {
                    channel,
                    events: Arc::new(Mutex::new(Some(events))),
                })
            })
            .await?;

        let Some(mut events) = link.events.lock().take() else {
            return Err(ReplicationError::HandshakeIncomplete);
        };
        let result = self.session(&link.channel, &mut events).await;
        link.channel.shutdown();
        result
    }

    async fn session(
        &self,
        channel: &ReplicationChannel,
        events: &mut ReplicationEvents,
    ) -> Result<(), ReplicationError> {
        let reply = match events.recv().await {
            Some(Inbound::Hello(ReplicationHandshake::Reply(reply))) => reply,
            Some(Inbound::Hello(ReplicationHandshake::Hello(_))) => {
                return Err(ReplicationError::UnexpectedHandshake("hello"));
            }
            Some(Inbound::Data { .. }) => return Err(ReplicationError::UnexpectedHandshake("data")),
            None => return Err(closed_reason(channel).await),
        };
        if reply.is_self || reply.source.name == self.config.self_id {
            warn!(address = %self.address, peer = %reply.source.name, "replication loop detected, closing channel");
            return Err(ReplicationError::SelfConnection);
        }
        info!(address = %self.address, peer = %reply.source.name, "replication channel open");

        let mut changes = self
            .registry
            .for_interest_matching(Interest::FullRegistry, SourceMatcher::Origin(Origin::Local))?;
        loop {
            tokio::select! {
                inbound = events.recv() => {
                    if inbound.is_none() {
                        return Err(closed_reason(channel).await);
                    }
                }
                notification = changes.recv() => {
                    let Some(notification) = notification else {
                        if !self.registry.is_shut_down() {
                            return Err(ReplicationError::SubscriptionLost);
                        }
                        debug!(address = %self.address, "registry closed, ending replication");
                        return Ok(());
                    };
                    channel.send(replication_message(&notification.change)).await?;
                }
            }
        }
    }
}

async fn closed_reason(channel: &ReplicationChannel) -> ReplicationError {
    match channel.closed().await {
        Ok(()) => ReplicationError::Channel(ChannelError::AlreadyClosed),
        Err(err) => err.into(),
    }
}

/// Replication message for a registry change of this node's own data.
pub fn replication_message(change: &Change) -> ReplicationMessage {
    match change {
        Change::Add(info) => ReplicationMessage::RegisterCopy(info.as_ref().clone()),
        Change::Modify { info, .. } => ReplicationMessage::UpdateCopy(info.as_ref().clone()),
        Change::Delete(info) => ReplicationMessage::UnregisterCopy(info.id.clone()),
        Change::BufferStart(_) => ReplicationMessage::BufferStart,
        Change::BufferEnd(_) => ReplicationMessage::BufferEnd,
    }
}
