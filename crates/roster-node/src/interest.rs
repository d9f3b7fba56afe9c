use futures_util::StreamExt;
use roster_codec::{ClientHandshake, InterestFrame, InterestMessage, ServerHello, WireDelta};
use roster_core::{Change, ChangeNotification};
use roster_registry::InterestStream;
use roster_transport::{
    ChannelBuilder, ChannelConfig, ChannelError, ChannelEvents, ChannelHandle, Inbound,
    MessageConnection,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::SharedRegistry;

/// Accepts client interest channels and streams registry changes back.
#[derive(Clone)]
pub struct InterestServer {
    server_id: String,
    registry: SharedRegistry,
    config: ChannelConfig,
}

impl InterestServer {
    pub fn new(server_id: impl Into<String>, registry: SharedRegistry, config: ChannelConfig) -> Self {
        Self {
            server_id: server_id.into(),
            registry,
            config,
        }
    }

    pub fn accept(
        &self,
        connection: MessageConnection<InterestFrame>,
        runtime: &Handle,
    ) -> JoinHandle<Result<(), ChannelError>> {
        let name = format!("interest:{}", connection.peer);
        let (channel, events) =
            ChannelBuilder::acceptor(name, self.config.clone()).spawn(connection, runtime);
        let session = InterestSession {
            server_id: self.server_id.clone(),
            registry: self.registry.clone(),
            channel,
            subscription: None,
        };
        runtime.spawn(session.run(events))
    }
}

struct InterestSession {
    server_id: String,
    registry: SharedRegistry,
    channel: ChannelHandle<ClientHandshake, InterestMessage>,
    subscription: Option<InterestStream>,
}

impl InterestSession {
    async fn run(
        mut self,
        mut events: ChannelEvents<ClientHandshake, InterestMessage>,
    ) -> Result<(), ChannelError> {
        self.serve(&mut events).await;
        self.subscription = None;
        self.channel.closed().await
    }

    async fn serve(&mut self, events: &mut ChannelEvents<ClientHandshake, InterestMessage>) {
        loop {
            tokio::select! {
                inbound = events.recv() => {
                    let Some(inbound) = inbound else {
                        return;
                    };
                    if let Err(err) = self.on_inbound(inbound).await {
                        debug!(channel = %self.channel.name(), error = %err, "interest session ended");
                        self.channel.shutdown();
                        return;
                    }
                }
                change = next_change(&mut self.subscription) => match change {
                    Some(notification) => {
                        if self.relay(&notification).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        debug!(channel = %self.channel.name(), "interest stream completed");
                        self.channel.shutdown();
                        return;
                    }
                },
            }
        }
    }

    async fn on_inbound(
        &mut self,
        inbound: Inbound<ClientHandshake, InterestMessage>,
    ) -> Result<(), ChannelError> {
        let (body, ack_requested) = match inbound {
            Inbound::Hello(ClientHandshake::Hello(hello)) => {
                debug!(client = %hello.client_id, "interest client connected");
                let reply = ClientHandshake::Reply(ServerHello {
                    server_id: self.server_id.clone(),
                });
                return self.channel.reply_hello(reply).await;
            }
            Inbound::Hello(ClientHandshake::Reply(_)) => {
                return Err(ChannelError::Rejected("server hello from client".into()));
            }
            Inbound::Data {
                body,
                ack_requested,
            } => (body, ack_requested),
        };

        match body {
            InterestMessage::InterestRegistration(interest) => {
                debug!(%interest, "interest registered");
                let stream = self
                    .registry
                    .for_interest(interest)
                    .map_err(|err| ChannelError::Rejected(err.to_string()))?;
                self.subscription = Some(stream);
            }
            InterestMessage::UnregisterInterestSet => {
                self.subscription = None;
            }
            InterestMessage::SnapshotRegistration(interest) => {
                let mut snapshot = self
                    .registry
                    .for_snapshot(&interest)
                    .map_err(|err| ChannelError::Rejected(err.to_string()))?;
                while let Some(info) = snapshot.next().await {
                    self.channel
                        .send(InterestMessage::AddInstance(info.as_ref().clone()))
                        .await?;
                }
                self.channel.send(InterestMessage::SnapshotComplete).await?;
            }
            other => {
                warn!(channel = %self.channel.name(), received = ?other, "ignoring server-bound message from client");
            }
        }
        if ack_requested {
            self.channel.acknowledge().await?;
        }
        Ok(())
    }

    async fn relay(&self, notification: &ChangeNotification) -> Result<(), ChannelError> {
        for message in interest_messages(&notification.change) {
            self.channel.send(message).await?;
        }
        Ok(())
    }
}

/// Next notification of the active subscription; pends forever without one.
async fn next_change(subscription: &mut Option<InterestStream>) -> Option<ChangeNotification> {
    match subscription {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

/// Client-facing messages for one registry change.
///
/// Modifications travel as one delta per changed field; a modification
/// without encodable deltas resends the whole record.
pub fn interest_messages(change: &Change) -> Vec<InterestMessage> {
    match change {
        Change::Add(info) => vec![InterestMessage::AddInstance(info.as_ref().clone())],
        Change::Modify { info, deltas } => {
            let wire: Vec<InterestMessage> = deltas
                .iter()
                .filter_map(|delta| match WireDelta::from_delta(delta) {
                    Ok(wire) => Some(InterestMessage::UpdateInstanceInfo(wire)),
                    Err(err) => {
                        warn!(id = %delta.id, error = %err, "delta not encodable, sending full record");
                        None
                    }
                })
                .collect();
            if wire.is_empty() || wire.len() != deltas.len() {
                vec![InterestMessage::AddInstance(info.as_ref().clone())]
            } else {
                wire
            }
        }
        Change::Delete(info) => vec![InterestMessage::DeleteInstance(info.id.clone())],
        Change::BufferStart(interest) => vec![InterestMessage::BufferStart(interest.clone())],
        Change::BufferEnd(interest) => vec![InterestMessage::BufferEnd(interest.clone())],
    }
}
