//! Wiring for the `storj-node` binary.
//!
//! Parses process-level flags ([`cli::NodeArgs`]), loads [`storj_config::StorjConfig`],
//! builds an identity, a storage backend, and every protocol/tunnel component, then
//! runs the RPC and data-channel TCP servers and joins the overlay until interrupted.
//! The transport, pub/sub and mirror-source seams (`transport.rs`, `pubsub.rs`,
//! `mirror.rs`) are minimal concrete stand-ins for what a real deployment would back
//! with `libp2p`; everything above those seams is the genuine protocol stack.

mod cli;
mod mirror;
mod pubsub;
mod transport;

use std::fs::File;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Command, Parser};
use storj_config::{load_and_process_config, ConfigError, SerializeConfig, StorjConfig};
use storj_crypto::{KeyPair, ProtocolVersion};
use storj_datachannel::TokenRegistry;
use storj_network::{NetworkError, NetworkFacade};
use storj_protocol::farmer::{AuditHandler, ConsignHandler, FarmerState, MirrorHandler, RetrieveHandler};
use storj_protocol::offer::OfferHandler;
use storj_protocol::opcode::OpcodeTopic;
use storj_protocol::probe::ProbeHandler;
use storj_protocol::publication::PublicationRegistry;
use storj_rpc::{Contact, Dispatcher, Handler, Method, RpcClient, RpcError, StandardChain};
use storj_shard_manager::ShardManager;
use storj_storage::embedded::EmbeddedAdapter;
use storj_storage::filesystem::FilesystemAdapter;
use storj_storage::memory::MemoryAdapter;
use storj_storage::StorageAdapter;
use storj_tunnel::{BucketSubscriber, FindTunnelHandler, OpenTunnelHandler, PubSub, RelaySlots, TunnelerBucket};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use mirror::TcpShardSource;
use pubsub::LocalPubSub;
use transport::TcpTransport;

/// Capacity of this node's own bucket of known tunneler contacts, learned from
/// `TUNNELER_AVAILABILITY` announcements. No config field names this value (the
/// `RateLimiterConfig`/`TunnelConfig` knobs cover unrelated capacities, and the
/// routing table's own bucket size is a separate, hardcoded constant in
/// `storj_network::facade`); left as a local constant rather than adding a config
/// field for a single fixed-size FIFO.
const TUNNELER_BUCKET_CAPACITY: usize = 64;

#[derive(Debug, Error)]
enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed --node-key-hex: {0}")]
    KeyHex(#[from] hex::FromHexError),
    #[error("invalid --node-key-hex: {0}")]
    Key(String),
    #[error("storage backend error: {0}")]
    Storage(#[from] storj_storage::StorageError),
    #[error("network join error: {0}")]
    Network(#[from] NetworkError),
}

struct PingHandler;

#[async_trait::async_trait]
impl Handler for PingHandler {
    async fn handle(&self, _sender: storj_crypto::NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        Ok(params)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "storj-node exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), NodeError> {
    let args = cli::NodeArgs::parse();

    if let Some(path) = &args.dump_config {
        StorjConfig::default().dump_to_file(path)?;
        tracing::info!(path = %path.display(), "wrote default config schema");
        return Ok(());
    }

    // `load_and_process_config` wants a real schema file on disk; when the operator
    // didn't point us at one, dump the default schema to a throwaway path rather than
    // reimplementing its CLI-layering logic against an in-memory schema.
    let schema_path = match &args.config_file {
        Some(path) => path.clone(),
        None => {
            let path = std::env::temp_dir().join(format!("storj-node-default-schema-{}.json", std::process::id()));
            StorjConfig::default().dump_to_file(&path)?;
            path
        }
    };
    let config: StorjConfig = load_and_process_config(
        File::open(&schema_path)?,
        Command::new("storj-node"),
        vec!["storj-node".to_owned()],
    )?;

    let keypair = match &args.node_key_hex {
        Some(hex_str) => {
            let bytes = hex::decode(hex_str)?;
            KeyPair::from_bytes(&bytes).map_err(|e| NodeError::Key(e.to_string()))?
        }
        None => {
            tracing::warn!("no --node-key-hex supplied, running with a freshly generated, ephemeral identity");
            KeyPair::generate()
        }
    };
    let self_node_id = keypair.node_id();
    tracing::info!(node_id = %self_node_id.to_hex(), "node identity established");

    let storage: Arc<dyn StorageAdapter> = match args.storage_backend {
        cli::StorageBackend::Memory => Arc::new(MemoryAdapter::new()),
        cli::StorageBackend::Filesystem => Arc::new(FilesystemAdapter::open(args.storage_dir.clone()).await?),
        cli::StorageBackend::Embedded => Arc::new(EmbeddedAdapter::open(args.storage_dir.clone()).await?),
    };

    let shard_manager = Arc::new(ShardManager::new(storage.clone(), args.storage_capacity_bytes));
    let tokens = Arc::new(TokenRegistry::new());
    let farmer_state = Arc::new(FarmerState::new(shard_manager.clone(), tokens.clone(), config.timeouts.token_ttl));
    let publications = Arc::new(PublicationRegistry::new());
    let tunneler_bucket = Arc::new(TunnelerBucket::new(TUNNELER_BUCKET_CAPACITY));

    let data_channel_port = args.data_channel_port.unwrap_or(args.listen_port + 1);
    let public_address = args.public_address.clone().unwrap_or_else(|| args.listen_address.clone());
    let public_port = args.public_port.unwrap_or(args.listen_port);
    let self_version = ProtocolVersion::new(1, 0, 0, None);
    let self_contact = Contact::new(public_address, public_port, self_node_id, self_version);

    let relay_slots = Arc::new(RelaySlots::new(config.tunnel.max_tunnels, self_contact.clone()));
    let local_pubsub = LocalPubSub::new(self_node_id);
    let pubsub_dyn: Arc<dyn PubSub> = local_pubsub.clone();

    let tcp_transport = TcpTransport::new(self_node_id);
    let rpc_client = RpcClient::new(keypair.clone(), tcp_transport.clone(), config.timeouts.nonce_expire);

    let chain = StandardChain::new(config.timeouts.nonce_expire, config.rate_limiter.bucket_capacity, config.rate_limiter.refill_per_second);
    let mut dispatcher = Dispatcher::new(keypair.clone(), chain);
    dispatcher.register(Method::Ping, Box::new(PingHandler));
    dispatcher.register(Method::Probe, Box::new(ProbeHandler::new(rpc_client.clone())));
    dispatcher.register(Method::FindTunnel, Box::new(FindTunnelHandler::new(tunneler_bucket.clone(), config.tunnel.find_tunnel_k as usize)));
    dispatcher.register(Method::OpenTunnel, Box::new(OpenTunnelHandler::new(relay_slots.clone())));

    let wants_renter = matches!(args.role, cli::NodeRole::Renter | cli::NodeRole::Both);
    let wants_farmer = matches!(args.role, cli::NodeRole::Farmer | cli::NodeRole::Both);
    if wants_renter {
        dispatcher.register(Method::Offer, Box::new(OfferHandler::new(keypair.clone(), publications.clone())));
    }
    if wants_farmer {
        dispatcher.register(Method::Consign, Box::new(ConsignHandler::new(farmer_state.clone())));
        dispatcher.register(Method::Retrieve, Box::new(RetrieveHandler::new(farmer_state.clone())));
        dispatcher.register(Method::Audit, Box::new(AuditHandler::new(farmer_state.clone())));
        dispatcher.register(Method::Mirror, Box::new(MirrorHandler::new(farmer_state.clone(), Arc::new(TcpShardSource))));
    }
    let dispatcher = Arc::new(dispatcher);

    local_pubsub
        .subscribe(OpcodeTopic::tunneler_availability(true), Arc::new(BucketSubscriber::new(tunneler_bucket.clone(), true)))
        .await
        .ok();
    local_pubsub
        .subscribe(OpcodeTopic::tunneler_availability(false), Arc::new(BucketSubscriber::new(tunneler_bucket.clone(), false)))
        .await
        .ok();

    let rpc_listener = TcpListener::bind((args.listen_address.as_str(), args.listen_port)).await?;
    let data_channel_listener = TcpListener::bind((args.listen_address.as_str(), data_channel_port)).await?;
    tracing::info!(rpc_port = args.listen_port, data_channel_port, "listening");

    let rpc_shutdown = Arc::new(Notify::new());
    let data_channel_shutdown = Arc::new(Notify::new());

    let rpc_server = tokio::spawn(transport::run_rpc_server(rpc_listener, dispatcher.clone(), rpc_shutdown.clone()));

    let data_channel_server = {
        let tokens = tokens.clone();
        let storage = storage.clone();
        let shutdown = data_channel_shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = data_channel_listener.accept() => {
                        let Ok((stream, peer_addr)) = accepted else { continue };
                        let tokens = tokens.clone();
                        let storage = storage.clone();
                        tokio::spawn(async move {
                            if let Err(err) = storj_datachannel::serve_connection(stream, &tokens, storage.as_ref()).await {
                                tracing::warn!(%peer_addr, %err, "data channel connection failed");
                            }
                        });
                    }
                    _ = shutdown.notified() => break,
                }
            }
        })
    };

    let facade = NetworkFacade::new(config.clone(), self_contact, rpc_client, relay_slots, pubsub_dyn);
    let outcome = facade.join().await?;
    tracing::info!(
        effective_contact = %outcome.effective_contact.to_uri(),
        tunneled = outcome.tunneled,
        "joined the overlay"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("received ctrl-c, shutting down");

    facade.leave().await;
    rpc_shutdown.notify_one();
    data_channel_shutdown.notify_one();
    let _ = rpc_server.await;
    let _ = data_channel_server.await;

    Ok(())
}
