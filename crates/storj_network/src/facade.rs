//! The network facade (§4.9): `join` brings a node onto the overlay (open the
//! background loops, dial seeds in series, fall back to a tunnel if unreachable,
//! announce as a tunneler if public) and `leave` tears them back down. Per the design
//! notes' "Cyclic references" fix, the facade never hands a back-reference to the
//! tunnel/announce machinery it spawns — it only holds the shutdown signal each loop
//! listens on.

use std::sync::Arc;

use async_trait::async_trait;
use storj_config::StorjConfig;
use storj_crypto::ProtocolVersion;
use storj_rpc::{Contact, Method, RpcClient};
use storj_tunnel::{PubSub, RelaySlots, TunnelClient, TunnelOutcome};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::cleaner::run_cleaner_loop;
use crate::error::NetworkError;
use crate::reentry::{run_reentry_loop, ActivityTracker, RejoinCallback};
use crate::router::RoutingTable;

/// Contacts-per-bucket cap. Not config-exposed: it's a structural constant of the
/// routing table's shape, not an operational knob a deployment would tune.
const BUCKET_CAPACITY: usize = 20;

/// The result of a successful [`NetworkFacade::join`].
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// The contact this node should now advertise to others — its own address if
    /// directly reachable, or a tunnel alias otherwise.
    pub effective_contact: Contact,
    pub tunneled: bool,
}

pub struct NetworkFacade {
    router: Arc<RoutingTable>,
    activity: Arc<ActivityTracker>,
    relay_slots: Arc<RelaySlots>,
    pubsub: Arc<dyn PubSub>,
    rpc_client: RpcClient,
    self_contact: Mutex<Contact>,
    self_version: ProtocolVersion,
    config: StorjConfig,
    cleaner_shutdown: Arc<Notify>,
    reentry_shutdown: Arc<Notify>,
    announce_shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkFacade {
    pub fn new(
        config: StorjConfig,
        self_contact: Contact,
        rpc_client: RpcClient,
        relay_slots: Arc<RelaySlots>,
        pubsub: Arc<dyn PubSub>,
    ) -> Arc<Self> {
        let router = Arc::new(RoutingTable::new(self_contact.node_id, BUCKET_CAPACITY));
        let self_version = self_contact.protocol_version.clone();
        Arc::new(Self {
            router,
            activity: Arc::new(ActivityTracker::new()),
            relay_slots,
            pubsub,
            rpc_client,
            self_contact: Mutex::new(self_contact),
            self_version,
            config,
            cleaner_shutdown: Arc::new(Notify::new()),
            reentry_shutdown: Arc::new(Notify::new()),
            announce_shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn router(&self) -> &Arc<RoutingTable> {
        &self.router
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub async fn effective_contact(&self) -> Contact {
        self.self_contact.lock().await.clone()
    }

    /// Dials each configured seed's PING in series, stopping at the first that
    /// answers and inserting it into the routing table (§4.9: "seed connection
    /// attempts in series, success on first"). An empty seed list (a bootstrap node
    /// with nobody to join yet) is not an error.
    async fn dial_seeds_in_series(&self) -> Result<Option<Contact>, NetworkError> {
        let seeds = &self.config.network.seeds;
        for uri in seeds {
            let contact = Contact::parse(uri)?;
            match self.rpc_client.call_contact(&contact, Method::Ping, serde_json::json!({})).await {
                Ok(_) => {
                    self.router.insert(contact.clone()).await;
                    self.activity.touch().await;
                    return Ok(Some(contact));
                }
                Err(err) => {
                    tracing::warn!(seed = %contact, %err, "seed did not respond, trying the next one");
                }
            }
        }
        if seeds.is_empty() {
            Ok(None)
        } else {
            Err(NetworkError::NoSeedReachable { attempted: seeds.len() })
        }
    }

    /// Runs the full lifecycle from §4.9: open the housekeeping loops, dial seeds,
    /// set up a tunnel if this node turns out to be unreachable, then announce as a
    /// tunneler if it's public and configured to relay for others.
    pub async fn join(self: &Arc<Self>) -> Result<JoinOutcome, NetworkError> {
        self.spawn_cleaner_loop().await;
        self.spawn_reentry_loop().await;

        let seed = self.dial_seeds_in_series().await?;

        let mut tunneled = false;
        if let Some(seed_contact) = &seed {
            let snapshot = self.effective_contact().await;
            let tunnel_client = TunnelClient::new(self.rpc_client.clone());
            match tunnel_client.establish(seed_contact, &snapshot).await {
                Ok(TunnelOutcome::DirectlyReachable) => {}
                Ok(TunnelOutcome::Tunneled { alias, .. }) => {
                    *self.self_contact.lock().await = alias;
                    tunneled = true;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !tunneled && self.relay_slots.max_tunnels() > 0 {
            self.spawn_announce_loop().await;
        }

        Ok(JoinOutcome { effective_contact: self.effective_contact().await, tunneled })
    }

    /// `manager.close` plus node disconnect (§4.9): signals every background loop to
    /// stop and waits for them to actually finish.
    pub async fn leave(&self) {
        self.cleaner_shutdown.notify_one();
        self.reentry_shutdown.notify_one();
        self.announce_shutdown.notify_one();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    async fn spawn_cleaner_loop(self: &Arc<Self>) {
        let handle = tokio::spawn(run_cleaner_loop(
            self.router.clone(),
            self.self_version.clone(),
            self.config.network.allow_loopback,
            self.config.timeouts.router_clean_interval,
            self.cleaner_shutdown.clone(),
        ));
        self.tasks.lock().await.push(handle);
    }

    async fn spawn_reentry_loop(self: &Arc<Self>) {
        let rejoin: Arc<dyn RejoinCallback> = Arc::new(FacadeRejoin { facade: self.clone() });
        let handle = tokio::spawn(run_reentry_loop(
            self.activity.clone(),
            rejoin,
            self.config.timeouts.reentry_idle,
            self.reentry_shutdown.clone(),
        ));
        self.tasks.lock().await.push(handle);
    }

    async fn spawn_announce_loop(self: &Arc<Self>) {
        let contact = self.effective_contact().await;
        let handle = tokio::spawn(storj_tunnel::announce::run_announce_loop(
            self.pubsub.clone(),
            contact,
            self.relay_slots.clone(),
            self.config.timeouts.tunnel_announce_interval,
            self.announce_shutdown.clone(),
        ));
        self.tasks.lock().await.push(handle);
    }
}

/// Bridges the reentry loop back onto the facade's own seed-dialing, without handing
/// the loop anything beyond this narrow callback.
struct FacadeRejoin {
    facade: Arc<NetworkFacade>,
}

#[async_trait]
impl RejoinCallback for FacadeRejoin {
    async fn rejoin(&self) {
        if let Err(err) = self.facade.dial_seeds_in_series().await {
            tracing::warn!(%err, "inactivity reentry failed to reconnect to any seed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use storj_crypto::{KeyPair, NodeId};
    use storj_rpc::{Body, Envelope, Transport, TransportError};
    use storj_tunnel::{PubSubError, TopicHandler};

    use super::*;

    struct SeedTransport {
        seed_id: NodeId,
        seed_keys: KeyPair,
    }

    #[async_trait]
    impl Transport for SeedTransport {
        async fn request(&self, peer: NodeId, _envelope: Envelope) -> Result<Envelope, TransportError> {
            Err(TransportError::Unreachable(peer))
        }

        async fn dial(&self, contact: &Contact, envelope: Envelope) -> Result<Envelope, TransportError> {
            if contact.node_id != self.seed_id {
                return Err(TransportError::Unreachable(contact.node_id));
            }
            let result = match envelope.method {
                Method::Probe => serde_json::json!({"reachable": true}),
                _ => serde_json::json!({}),
            };
            Ok(Envelope::sign(envelope.method, Body::Result(result), &self.seed_keys))
        }
    }

    struct NullPubSub;

    #[async_trait]
    impl PubSub for NullPubSub {
        async fn publish(&self, _topic: storj_protocol::opcode::OpcodeTopic, _payload: serde_json::Value) -> Result<(), PubSubError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: storj_protocol::opcode::OpcodeTopic,
            _handler: Arc<dyn TopicHandler>,
        ) -> Result<(), PubSubError> {
            Ok(())
        }
    }

    fn slow_config(seeds: Vec<String>) -> StorjConfig {
        let mut config = StorjConfig::default();
        config.network.seeds = seeds;
        // Long enough that the cleaner/reentry loops' recurring ticks never fire
        // during the test; only their harmless immediate first tick runs.
        config.timeouts.router_clean_interval = Duration::from_secs(3600);
        config.timeouts.reentry_idle = Duration::from_secs(3600);
        config.timeouts.tunnel_announce_interval = Duration::from_secs(3600);
        config
    }

    #[tokio::test]
    async fn joining_with_a_reachable_seed_connects_without_tunneling() {
        let own_keys = KeyPair::generate();
        let seed_keys = KeyPair::generate();
        let seed_contact = Contact::new("198.51.100.20", 4000, seed_keys.node_id(), ProtocolVersion::new(1, 0, 0, None));

        let transport = Arc::new(SeedTransport { seed_id: seed_keys.node_id(), seed_keys: seed_keys.clone() });
        let rpc_client = RpcClient::new(own_keys.clone(), transport, Duration::from_secs(300));

        let self_contact = Contact::new("203.0.113.9", 5000, own_keys.node_id(), ProtocolVersion::new(1, 0, 0, None));
        let relay_slots = Arc::new(RelaySlots::new(0, self_contact.clone()));
        let pubsub = Arc::new(NullPubSub);

        let config = slow_config(vec![seed_contact.to_uri()]);
        let facade = NetworkFacade::new(config, self_contact.clone(), rpc_client, relay_slots, pubsub);

        let outcome = facade.join().await.unwrap();
        assert!(!outcome.tunneled);
        assert_eq!(outcome.effective_contact, self_contact);
        assert_eq!(facade.router().len().await, 1);

        facade.leave().await;
    }

    #[tokio::test]
    async fn joining_with_no_configured_seeds_succeeds_as_a_bootstrap_node() {
        let own_keys = KeyPair::generate();
        let unused_seed = KeyPair::generate();
        let transport =
            Arc::new(SeedTransport { seed_id: unused_seed.node_id(), seed_keys: unused_seed.clone() });
        let rpc_client = RpcClient::new(own_keys.clone(), transport, Duration::from_secs(300));

        let self_contact = Contact::new("203.0.113.9", 5000, own_keys.node_id(), ProtocolVersion::new(1, 0, 0, None));
        let relay_slots = Arc::new(RelaySlots::new(0, self_contact.clone()));
        let pubsub = Arc::new(NullPubSub);

        let config = slow_config(Vec::new());
        let facade = NetworkFacade::new(config, self_contact.clone(), rpc_client, relay_slots, pubsub);

        let outcome = facade.join().await.unwrap();
        assert!(!outcome.tunneled);
        assert_eq!(facade.router().len().await, 0);

        facade.leave().await;
    }
}
