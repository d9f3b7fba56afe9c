use std::time::Duration;

use roster_codec::{ReplicationFrame, ReplicationHandshake, ReplicationHelloReply, ReplicationMessage};
use roster_core::{BufferState, Source};
use roster_registry::RegistryError;
use roster_transport::{
    ChannelBuilder, ChannelConfig, ChannelEvents, ChannelHandle, Inbound, MessageConnection,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReplicationConfig;
use crate::error::ReplicationError;
use crate::SharedRegistry;

/// How long a looped-back channel stays up for its reply to reach the sender.
const LOOP_CLOSE_GRACE: Duration = Duration::from_secs(5);

type ReplicationChannel = ChannelHandle<ReplicationHandshake, ReplicationMessage>;
type ReplicationEvents = ChannelEvents<ReplicationHandshake, ReplicationMessage>;

/// Accepts replication channels from peers and applies their copies.
#[derive(Clone)]
pub struct ReplicationServer {
    self_id: String,
    registry: SharedRegistry,
    config: ChannelConfig,
}

impl ReplicationServer {
    pub fn new(config: &ReplicationConfig, registry: SharedRegistry) -> Self {
        Self {
            self_id: config.self_id.clone(),
            registry,
            config: config.channel.clone(),
        }
    }

    pub fn accept(
        &self,
        connection: MessageConnection<ReplicationFrame>,
        runtime: &Handle,
    ) -> JoinHandle<Result<(), ReplicationError>> {
        let name = format!("replication:{}", connection.peer);
        let (channel, events) =
            ChannelBuilder::acceptor(name, self.config.clone()).spawn(connection, runtime);
        let session = ReceiverSession {
            self_id: self.self_id.clone(),
            registry: self.registry.clone(),
            channel,
            batch_open: false,
        };
        runtime.spawn(session.run(events))
    }
}

struct ReceiverSession {
    self_id: String,
    registry: SharedRegistry,
    channel: ReplicationChannel,
    /// The peer sent `BufferStart` without the matching `BufferEnd` yet.
    batch_open: bool,
}

impl ReceiverSession {
    async fn run(mut self, mut events: ReplicationEvents) -> Result<(), ReplicationError> {
        let hello = match events.recv().await {
            Some(Inbound::Hello(ReplicationHandshake::Hello(hello))) => hello,
            Some(Inbound::Hello(ReplicationHandshake::Reply(_))) => {
                self.channel.shutdown();
                return Err(ReplicationError::UnexpectedHandshake("reply"));
            }
            Some(Inbound::Data { .. }) => {
                self.channel.shutdown();
                return Err(ReplicationError::UnexpectedHandshake("data"));
            }
            None => return self.closed().await.and(Err(ReplicationError::HandshakeIncomplete)),
        };

        if hello.source.name == self.self_id {
            warn!(channel = %self.channel.name(), "replication loop detected, closing channel");
            let _ = self.channel.reply_hello(self.reply(true)).await;
            let _ = tokio::time::timeout(LOOP_CLOSE_GRACE, self.channel.closed()).await;
            self.channel.shutdown();
            return Err(ReplicationError::SelfConnection);
        }

        let peer = Source::replicated(hello.source.name).with_generation(hello.source.generation);
        self.channel.reply_hello(self.reply(false)).await?;
        let stale = self.registry.evict_stale_generations(&peer);
        info!(%peer, registry_size = hello.registry_size, stale, "replication peer connected");

        let served = self.serve(&peer, &mut events).await;
        if self.batch_open {
            debug!(%peer, "closing batch left open by the peer");
            let _ = self.registry.mark_batch(&peer, BufferState::End);
        }
        let queued = self.registry.evict_source(&peer);
        info!(%peer, queued, "replication peer disconnected");
        served?;
        self.closed().await
    }

    fn reply(&self, is_self: bool) -> ReplicationHandshake {
        ReplicationHandshake::Reply(ReplicationHelloReply {
            source: Source::replicated(self.self_id.as_str()),
            is_self,
        })
    }

    async fn serve(&mut self, peer: &Source, events: &mut ReplicationEvents) -> Result<(), ReplicationError> {
        while let Some(inbound) = events.recv().await {
            let Inbound::Data {
                body,
                ack_requested,
            } = inbound
            else {
                continue;
            };
            match self.apply(peer, body) {
                Ok(()) => {}
                Err(RegistryError::ShutDown) => {
                    self.channel.shutdown();
                    return Err(RegistryError::ShutDown.into());
                }
                Err(err) => {
                    warn!(%peer, error = %err, "dropping replicated message");
                    continue;
                }
            }
            if ack_requested {
                self.channel.acknowledge().await?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, peer: &Source, message: ReplicationMessage) -> Result<(), RegistryError> {
        match message {
            ReplicationMessage::RegisterCopy(info) | ReplicationMessage::UpdateCopy(info) => {
                self.registry.register(info, peer)?;
            }
            ReplicationMessage::UnregisterCopy(id) => {
                let removed = self.registry.unregister(&id, peer)?;
                if !removed {
                    debug!(%peer, %id, "unregister for unknown copy");
                }
            }
            ReplicationMessage::BufferStart => {
                self.registry.mark_batch(peer, BufferState::Start)?;
                self.batch_open = true;
            }
            ReplicationMessage::BufferEnd => {
                self.registry.mark_batch(peer, BufferState::End)?;
                self.batch_open = false;
            }
        }
        Ok(())
    }

    async fn closed(&self) -> Result<(), ReplicationError> {
        self.channel.closed().await.map_err(ReplicationError::from)
    }
}
