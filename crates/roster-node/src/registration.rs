use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use roster_codec::{ClientHandshake, RegistrationFrame, RegistrationMessage, ServerHello};
use roster_core::Source;
use roster_registry::RegistryError;
use roster_transport::{
    ChannelBuilder, ChannelConfig, ChannelError, ChannelEvents, ChannelHandle, Inbound,
    MessageConnection,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::SharedRegistry;

type RegistrationChannel = ChannelHandle<ClientHandshake, RegistrationMessage>;

/// Accepts client registration channels.
///
/// Each client registers one instance as a `Local` source named after its
/// client id. Every accepted connection gets a fresh generation, so an
/// eviction left over from a dropped connection never removes the record a
/// reconnected client has already re-sent.
#[derive(Clone)]
pub struct RegistrationServer {
    server_id: String,
    registry: SharedRegistry,
    config: ChannelConfig,
    generations: Arc<AtomicU64>,
}

impl RegistrationServer {
    pub fn new(server_id: impl Into<String>, registry: SharedRegistry, config: ChannelConfig) -> Self {
        Self {
            server_id: server_id.into(),
            registry,
            config,
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Serves `connection` until it closes. The task resolves to the reason
    /// the channel closed.
    pub fn accept(
        &self,
        connection: MessageConnection<RegistrationFrame>,
        runtime: &Handle,
    ) -> JoinHandle<Result<(), ChannelError>> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("registration:{}", connection.peer);
        let (channel, events) =
            ChannelBuilder::acceptor(name, self.config.clone()).spawn(connection, runtime);
        let session = RegistrationSession {
            server_id: self.server_id.clone(),
            registry: self.registry.clone(),
            channel,
            generation,
            source: None,
            instance_id: None,
            unregistered: false,
        };
        runtime.spawn(session.run(events))
    }
}

struct RegistrationSession {
    server_id: String,
    registry: SharedRegistry,
    channel: RegistrationChannel,
    generation: u64,
    source: Option<Source>,
    instance_id: Option<String>,
    unregistered: bool,
}

impl RegistrationSession {
    async fn run(
        mut self,
        mut events: ChannelEvents<ClientHandshake, RegistrationMessage>,
    ) -> Result<(), ChannelError> {
        self.serve(&mut events).await;
        self.lapse();
        self.channel.closed().await
    }

    async fn serve(&mut self, events: &mut ChannelEvents<ClientHandshake, RegistrationMessage>) {
        while let Some(inbound) = events.recv().await {
            match inbound {
                Inbound::Hello(ClientHandshake::Hello(hello)) => {
                    debug!(client = %hello.client_id, generation = self.generation, "registration client connected");
                    self.source = Some(Source::local(hello.client_id).with_generation(self.generation));
                    let reply = ClientHandshake::Reply(ServerHello {
                        server_id: self.server_id.clone(),
                    });
                    if self.channel.reply_hello(reply).await.is_err() {
                        return;
                    }
                }
                Inbound::Hello(ClientHandshake::Reply(_)) => {
                    warn!(channel = %self.channel.name(), "client answered with a server hello");
                    self.channel.shutdown();
                    return;
                }
                Inbound::Data {
                    body,
                    ack_requested,
                } => {
                    match self.handle(body) {
                        Ok(()) => {}
                        Err(RegistryError::ShutDown) => {
                            self.channel.shutdown();
                            return;
                        }
                        Err(err) => {
                            warn!(channel = %self.channel.name(), error = %err, "registration rejected");
                            continue;
                        }
                    }
                    if ack_requested && self.channel.acknowledge().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn handle(&mut self, message: RegistrationMessage) -> Result<(), RegistryError> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        match message {
            RegistrationMessage::Register(info) | RegistrationMessage::Update(info) => {
                let id = self.instance_id.get_or_insert_with(|| info.id.clone());
                if *id != info.id {
                    warn!(expected = %id, actual = %info.id, "ignoring record for another instance");
                    return Ok(());
                }
                self.registry.register(info, source)?;
                self.unregistered = false;
            }
            RegistrationMessage::UpdateDelta(wire) => {
                let Some(id) = &self.instance_id else {
                    warn!(%source, "delta before registration");
                    return Ok(());
                };
                let Some(delta) = wire.into_delta_or_warn() else {
                    return Ok(());
                };
                if delta.id != *id {
                    warn!(expected = %id, actual = %delta.id, "ignoring delta for another instance");
                    return Ok(());
                }
                self.registry.update(id, &[delta], source)?;
            }
            RegistrationMessage::Unregister => {
                if let Some(id) = &self.instance_id {
                    self.registry.unregister(id, source)?;
                    self.unregistered = true;
                }
            }
        }
        Ok(())
    }

    /// Hands a registration left behind by a vanished client to eviction.
    fn lapse(&self) {
        let (Some(source), Some(id)) = (&self.source, &self.instance_id) else {
            return;
        };
        if self.unregistered {
            return;
        }
        let queued = self.registry.evict_source(source);
        info!(%id, %source, queued, "client disconnected without unregistering");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use roster_codec::{
        ClientHandshake, ClientHello, RegistrationFrame, RegistrationMessage, ServerHello,
        WireDelta,
    };
    use roster_core::{Change, Delta, DeltaField, InstanceInfo, Interest, Status};
    use roster_registry::Registry;
    use roster_transport::{
        in_memory_pair, ChannelBuilder, ChannelConfig, ChannelEvents, ChannelHandle, Inbound,
    };
    use tokio::runtime::Handle;

    use super::RegistrationServer;

    type Client = ChannelHandle<ClientHandshake, RegistrationMessage>;

    fn config() -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: Duration::from_secs(1),
            ..ChannelConfig::default()
        }
    }

    async fn connect(
        server: &RegistrationServer,
        client_id: &str,
    ) -> (Client, ChannelEvents<ClientHandshake, RegistrationMessage>) {
        let (client_conn, server_conn) =
            in_memory_pair::<RegistrationFrame>(16, client_id, "server");
        server.accept(server_conn, &Handle::current());
        let hello = ClientHandshake::Hello(ClientHello {
            client_id: client_id.to_string(),
        });
        let (client, mut events) =
            ChannelBuilder::initiator(client_id, config(), hello).spawn(client_conn, &Handle::current());
        assert_eq!(
            events.recv().await,
            Some(Inbound::Hello(ClientHandshake::Reply(ServerHello {
                server_id: "s-1".into()
            })))
        );
        (client, events)
    }

    fn instance() -> InstanceInfo {
        InstanceInfo::new("i-1", "billing").with_status(Status::Starting)
    }

    #[tokio::test]
    async fn register_update_and_unregister_reach_the_registry() {
        let registry = Registry::new();
        let server = RegistrationServer::new("s-1", Arc::new(registry.clone()), config());
        let (client, _events) = connect(&server, "c-1").await;

        client
            .send_with_ack(RegistrationMessage::Register(instance()))
            .await
            .expect("register");
        assert_eq!(registry.get("i-1").map(|i| i.status), Some(Status::Starting));

        let delta = WireDelta::from_delta(&Delta::new("i-1", 2, DeltaField::Status(Status::Up)))
            .expect("encode delta");
        client
            .send_with_ack(RegistrationMessage::UpdateDelta(delta))
            .await
            .expect("update");
        assert_eq!(registry.get("i-1").map(|i| i.status), Some(Status::Up));

        client
            .send_with_ack(RegistrationMessage::Unregister)
            .await
            .expect("unregister");
        assert!(registry.get("i-1").is_none());
        client.shutdown();
    }

    #[tokio::test]
    async fn records_for_another_instance_are_ignored() {
        let registry = Registry::new();
        let server = RegistrationServer::new("s-1", Arc::new(registry.clone()), config());
        let (client, _events) = connect(&server, "c-1").await;

        client
            .send_with_ack(RegistrationMessage::Register(instance()))
            .await
            .expect("register");
        client
            .send(RegistrationMessage::Update(InstanceInfo::new("i-2", "billing")))
            .await
            .expect("update");
        client
            .send_with_ack(RegistrationMessage::Update(instance().with_status(Status::Up)))
            .await
            .expect("update");

        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get("i-1").map(|i| i.status), Some(Status::Up));
        client.shutdown();
    }

    #[tokio::test]
    async fn vanished_client_is_evicted() {
        let registry = Registry::new();
        let server = RegistrationServer::new("s-1", Arc::new(registry.clone()), config());
        let (client, _events) = connect(&server, "c-1").await;
        client
            .send_with_ack(RegistrationMessage::Register(instance()))
            .await
            .expect("register");

        let mut stream = registry.for_interest(Interest::FullRegistry).expect("subscribe");
        client.shutdown();

        loop {
            let n = stream.recv().await.expect("stream open");
            if let Change::Delete(info) = n.change {
                assert_eq!(info.id, "i-1");
                break;
            }
        }
        assert_eq!(registry.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_timeout_closes_the_client_channel() {
        let registry = Registry::new();
        let server = RegistrationServer::new(
            "s-1",
            Arc::new(registry.clone()),
            ChannelConfig {
                auto_timeout: Some(Duration::from_secs(60)),
                ..config()
            },
        );
        let (client, _events) = connect(&server, "c-1").await;
        client
            .send_with_ack(RegistrationMessage::Register(instance()))
            .await
            .expect("register");

        assert!(client.closed().await.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.size(), 0);
    }
}
