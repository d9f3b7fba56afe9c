mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use roster_codec::{InterestFrame, RegistrationFrame, ReplicationFrame};
use roster_node::{
    InterestServer, PeerEvent, RegistrationServer, ReplicationServer, ReplicationService,
    SharedRegistry, TcpConnector,
};
use roster_registry::{PreservableRegistry, Registry, SourcedRegistry};
use roster_transport::tcp::TcpAcceptor;
use roster_transport::MessageConnection;

use crate::config::ServerConfig;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a configuration file (TOML, YAML or JSON).
    #[arg(long, short, env = "ROSTER_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured server id.
    #[arg(long)]
    server_id: Option<String>,

    /// Replication peer address; repeat for several peers.
    #[arg(long = "peer")]
    peers: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(server_id) = &self.server_id {
            config.server_id = server_id.clone();
        }
        if !self.peers.is_empty() {
            config.peers = self.peers.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = ServerConfig::new(cli.config.clone())?;
    cli.apply(&mut config);
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(server_id = %config.server_id, peers = config.peers.len(), "starting roster server");

    let runtime = Handle::current();
    let registry = PreservableRegistry::new(Registry::new(), &config.registry_config(), &runtime);
    let shared: SharedRegistry = Arc::new(registry.clone());
    let replication_config = config.replication_config();

    let registration = RegistrationServer::new(
        config.server_id.clone(),
        shared.clone(),
        config.client_channel_config(),
    );
    let interest = InterestServer::new(
        config.server_id.clone(),
        shared.clone(),
        config.client_channel_config(),
    );
    let receiver = ReplicationServer::new(&replication_config, shared.clone());

    let cancel = CancellationToken::new();
    let mut listeners = Vec::new();

    let acceptor = TcpAcceptor::bind(&config.registration_bind).await?;
    info!(addr = %acceptor.local_addr()?, "registration listener ready");
    let handle = runtime.clone();
    listeners.push(spawn_listener(
        "registration",
        acceptor,
        cancel.clone(),
        move |conn: MessageConnection<RegistrationFrame>| {
            registration.accept(conn, &handle);
        },
    ));

    let acceptor = TcpAcceptor::bind(&config.interest_bind).await?;
    info!(addr = %acceptor.local_addr()?, "interest listener ready");
    let handle = runtime.clone();
    listeners.push(spawn_listener(
        "interest",
        acceptor,
        cancel.clone(),
        move |conn: MessageConnection<InterestFrame>| {
            interest.accept(conn, &handle);
        },
    ));

    let acceptor = TcpAcceptor::bind(&config.replication_bind).await?;
    info!(addr = %acceptor.local_addr()?, "replication listener ready");
    let handle = runtime.clone();
    listeners.push(spawn_listener(
        "replication",
        acceptor,
        cancel.clone(),
        move |conn: MessageConnection<ReplicationFrame>| {
            receiver.accept(conn, &handle);
        },
    ));

    let service = ReplicationService::new(
        replication_config,
        shared,
        Arc::new(TcpConnector),
        &runtime,
    );
    // Peers are static; the pending tail keeps the follower alive until close.
    let peers = stream::iter(config.peers.clone().into_iter().map(PeerEvent::Added))
        .chain(stream::pending());
    service.start(Box::pin(peers))?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    cancel.cancel();
    for listener in listeners {
        if let Err(err) = listener.await {
            warn!(error = %err, "listener task failed");
        }
    }
    service.close();
    registry.shutdown();
    Ok(())
}

/// Accepts connections on `acceptor` until `cancel` fires.
fn spawn_listener<T, F>(
    name: &'static str,
    acceptor: TcpAcceptor,
    cancel: CancellationToken,
    mut on_connection: F,
) -> JoinHandle<()>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnMut(MessageConnection<T>) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = acceptor.accept::<T>() => accepted,
            };
            match accepted {
                Ok(connection) => on_connection(connection),
                Err(err) => {
                    warn!(listener = name, error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    })
}
