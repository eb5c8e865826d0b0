use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use anyhow::Result;
use parking_lot::{Mutex, RwLock};

use codec::{
    Body, Envelope, KeyType, PayloadType,
    records,
    types::{
        AssetGroupId, DomainId, MessageType, NodeId, NodeInfo, ResourceId, ResourceKind,
        TransactionId, UserId,
    },
};
use ticker::{Nonce, Query, QueryData, Ticker};

use crate::{
    NUM_CROSS_REF_COPY,
    config::Config,
    domain::{Domain, DomainOptions},
    ledger::{AssetStorage, LedgerCore, StorageKind},
    overlay::OverlayRegistry,
    router::Router,
    transport::Transport,
};

/// How long a domain probe keeps trying before giving up.
const DOMAIN_PROBE_GIVEUP: Duration = Duration::from_secs(10);
const DOMAIN_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const DOMAIN_PROBE_RETRIES: u32 = 3;

pub struct HubOptions {
    pub config: Config,
    /// Where to persist configuration changes; in-memory only when
    /// absent.
    pub config_path: Option<String>,
    pub ledger: Arc<dyn LedgerCore>,
    pub storage: Arc<dyn AssetStorage>,
    /// Whether this node participates in the global overlay.
    pub use_global: bool,
    /// Overrides the configured port when set.
    pub p2p_port: Option<u16>,
}

/// Top-level lifecycle of the networking core.
///
/// Owns the transport, the query ticker and the domains map; boots the
/// configured domains and implements the operations higher layers call.
pub struct NetworkHub {
    config: Mutex<Config>,
    config_path: Option<String>,
    transport: Arc<Transport>,
    ticker: Ticker,
    ledger: Arc<dyn LedgerCore>,
    storage: Arc<dyn AssetStorage>,
    router: Router,
    registry: Mutex<OverlayRegistry>,
    domains: RwLock<HashMap<DomainId, Arc<Domain>>>,
    advertised: Mutex<HashSet<AssetGroupId>>,
    use_global: bool,
}

impl NetworkHub {
    /// Bind the transport, start the receive loops and join every
    /// configured domain.
    pub async fn start(mut options: HubOptions) -> Result<Arc<Self>> {
        if let Some(port) = options.p2p_port {
            options.config.network.p2p_port = port;
        }

        let transport = Arc::new(Transport::new(
            options.config.network.p2p_port,
            options.config.network.max_connections,
        )?);

        let ticker = Ticker::new();
        let hub = Arc::new(Self {
            router: Router::new(ticker.clone(), options.ledger.clone()),
            config: Mutex::new(options.config),
            config_path: options.config_path,
            transport: transport.clone(),
            ticker,
            ledger: options.ledger,
            storage: options.storage,
            registry: Mutex::new(OverlayRegistry::default()),
            domains: RwLock::new(HashMap::new()),
            advertised: Mutex::new(HashSet::new()),
            use_global: options.use_global,
        });

        transport.start(Arc::downgrade(&hub)).await?;
        hub.boot_from_config();
        Ok(hub)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    pub fn domain(&self, domain_id: &DomainId) -> Option<Arc<Domain>> {
        self.domains.read().get(domain_id).cloned()
    }

    /// Make an overlay implementation available under a module name for
    /// subsequently created domains.
    pub fn register_overlay(&self, name: &str, factory: crate::overlay::OverlayFactory) {
        self.registry.lock().register(name, factory);
    }

    pub fn local_node_id(&self, domain_id: &DomainId) -> Option<NodeId> {
        Some(self.domain(domain_id)?.node_id)
    }

    fn boot_from_config(self: &Arc<Self>) {
        let domains = self.config.lock().domains.clone();

        for (domain_hex, conf) in domains {
            let Some(domain_id) = DomainId::from_hex(&domain_hex) else {
                log::warn!("malformed domain id in configuration: {domain_hex}");
                continue;
            };

            if domain_id == DomainId::GLOBAL && !self.use_global {
                continue;
            }

            self.create_domain(domain_id, &conf.module, false);
            let Some(domain) = self.domain(&domain_id) else {
                continue;
            };

            if !conf.special_domain {
                for group_hex in conf.asset_group_ids.keys() {
                    let Some(asset_group_id) = AssetGroupId::from_hex(group_hex) else {
                        log::warn!("malformed asset group id in configuration: {group_hex}");
                        continue;
                    };

                    self.storage.setup_asset_group(
                        domain_id,
                        asset_group_id,
                        conf.storage_type.unwrap_or(StorageKind::Filesystem),
                        conf.storage_path.as_deref(),
                        conf.advertise_in_domain0,
                    );

                    if conf.advertise_in_domain0 {
                        self.advertised.lock().insert(asset_group_id);
                    }
                }
            }

            for (node_hex, (ipv4, ipv6, port)) in &conf.static_nodes {
                if let Some(node_id) = NodeId::from_hex(node_hex) {
                    self.add_static_node_to_domain(
                        domain_id,
                        node_id,
                        parse_addr(ipv4),
                        parse_addr(ipv6),
                        *port,
                    );
                }
            }

            for (node_hex, (ipv4, ipv6, port)) in &conf.peer_list {
                if let Some(node_id) = NodeId::from_hex(node_hex) {
                    domain.add_peer_full(node_id, parse_addr(ipv4), parse_addr(ipv6), *port);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Domain lifecycle
    // ------------------------------------------------------------------

    /// Join a domain driven by the named overlay module. Returns `false`
    /// when the domain already exists or the module is unknown.
    pub fn create_domain(
        self: &Arc<Self>,
        domain_id: DomainId,
        module: &str,
        renew_node_id: bool,
    ) -> bool {
        if self.domains.read().contains_key(&domain_id) {
            return false;
        }

        let Some(overlay) = self.registry.lock().build(module) else {
            log::error!("unknown overlay module: {module}");
            return false;
        };

        let node_id = {
            let mut config = self.config.lock();
            let entry = config.domain_mut(&domain_id.to_hex());
            entry.module = module.to_string();

            let existing = entry
                .node_id
                .as_deref()
                .and_then(NodeId::from_hex)
                .filter(|_| !renew_node_id);

            match existing {
                Some(node_id) => node_id,
                None => {
                    let node_id = NodeId::from(rand::random::<[u8; 32]>());
                    entry.node_id = Some(node_id.to_hex());
                    node_id
                }
            }
        };

        let domain = Domain::new(DomainOptions {
            domain_id,
            node_id,
            transport: self.transport.clone(),
            ticker: self.ticker.clone(),
            ledger: self.ledger.clone(),
            overlay,
        });

        domain.set_refresh_timer();
        self.domains.write().insert(domain_id, domain);

        log::info!("domain created: domain={domain_id}, node={node_id}, module={module}");
        true
    }

    /// Leave a domain: notify every peer, drop the state and, when the
    /// global overlay is up, re-advertise what is left.
    pub fn remove_domain(&self, domain_id: &DomainId) {
        let Some(domain) = self.domains.write().remove(domain_id) else {
            return;
        };

        domain.leave();
        log::info!("domain removed: domain={domain_id}");

        if self.use_global {
            if let Some(global) = self.domain(&DomainId::GLOBAL) {
                let groups: Vec<AssetGroupId> = self.advertised.lock().iter().copied().collect();
                global.overlay().advertise_asset_group_info(&global, &groups);
            }
        }
    }

    /// Join a peer unconditionally and remember it as static in the
    /// domain's configuration.
    pub fn add_static_node_to_domain(
        &self,
        domain_id: DomainId,
        node_id: NodeId,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
        port: u16,
    ) {
        let Some(domain) = self.domain(&domain_id) else {
            return;
        };

        domain.add_peer_full(node_id, ipv4, ipv6, port);

        let mut config = self.config.lock();
        config
            .domain_mut(&domain_id.to_hex())
            .static_nodes
            .entry(node_id.to_hex())
            .or_insert_with(|| {
                (
                    ipv4.map(|ip| ip.to_string()).unwrap_or_default(),
                    ipv6.map(|ip| ip.to_string()).unwrap_or_default(),
                    port,
                )
            });
    }

    /// Write every live peer table back into the configuration and
    /// persist it.
    pub fn save_all_peer_lists(&self) -> Result<()> {
        log::info!("saving the current peer lists");

        let mut config = self.config.lock();
        for (domain_id, domain) in self.domains.read().iter() {
            let entry = config.domain_mut(&domain_id.to_hex());
            entry.peer_list.clear();
            for info in domain.peer_snapshot() {
                entry.peer_list.insert(
                    info.node_id.to_hex(),
                    (
                        info.ipv4.map(|ip| ip.to_string()).unwrap_or_default(),
                        info.ipv6.map(|ip| ip.to_string()).unwrap_or_default(),
                        info.port,
                    ),
                );
            }
        }

        if let Some(path) = &self.config_path {
            config.save(path)?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Users & routing
    // ------------------------------------------------------------------

    pub fn register_user_id(
        &self,
        domain_id: &DomainId,
        asset_group_id: AssetGroupId,
        user_id: UserId,
    ) -> bool {
        let Some(domain) = self.domain(domain_id) else {
            return false;
        };

        domain.register_user(asset_group_id, user_id);
        true
    }

    /// Remove a user from every domain it may be registered in.
    pub fn remove_user_id(&self, asset_group_id: &AssetGroupId, user_id: &UserId) {
        for domain in self.domains.read().values() {
            domain.unregister_user(asset_group_id, user_id);
        }
    }

    /// Deliver locally or forward one hop towards the peer hosting the
    /// destination user.
    pub fn route_message(
        &self,
        domain_id: &DomainId,
        asset_group_id: AssetGroupId,
        source_user_id: UserId,
        destination_user_id: UserId,
        message: Vec<u8>,
        payload_type: PayloadType,
    ) -> bool {
        let Some(domain) = self.domain(domain_id) else {
            return false;
        };

        self.router.route_message(
            &domain,
            asset_group_id,
            source_user_id,
            destination_user_id,
            message,
            payload_type,
        )
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Place a resource into the domain's overlay.
    pub fn put(
        &self,
        domain_id: &DomainId,
        asset_group_id: AssetGroupId,
        resource_id: ResourceId,
        resource_kind: ResourceKind,
        resource: &[u8],
    ) -> bool {
        let Some(domain) = self.domain(domain_id) else {
            return false;
        };

        log::debug!("[{}] put: resource={resource_id}", domain.node_id);
        domain
            .overlay()
            .put_resource(&domain, asset_group_id, resource_id, resource_kind, resource);
        true
    }

    /// Advance a resource lookup owned by a caller-created query entry;
    /// the caller's callbacks see the outcome.
    pub fn get(&self, nonce: &Nonce) {
        let Some(Some(domain_id)) = self.ticker.with_entry(nonce, |entry| {
            if let QueryData::Find { domain_id, .. } = &entry.data {
                Some(*domain_id)
            } else {
                None
            }
        }) else {
            return;
        };

        if let Some(domain) = self.domain(&domain_id) {
            domain.overlay().get_resource(&domain, *nonce);
        }
    }

    // ------------------------------------------------------------------
    // Cross-refs
    // ------------------------------------------------------------------

    /// Gossip a cross-ref into the global overlay, or record it locally
    /// when no global overlay is joined.
    pub fn disseminate_cross_ref(&self, tx_id: TransactionId, asset_group_id: AssetGroupId) {
        if self.use_global {
            if let Some(global) = self.domain(&DomainId::GLOBAL) {
                let mut body = global.make_message(None, None, MessageType::NotifyCrossRef);
                body.put_bytes(
                    KeyType::CrossRefs,
                    records::encode_cross_refs(&[(asset_group_id, tx_id)]),
                );

                global
                    .overlay()
                    .random_send(&global, body, NUM_CROSS_REF_COPY);
                return;
            }
        }

        self.ledger.record_cross_ref(asset_group_id, tx_id);
    }

    // ------------------------------------------------------------------
    // Domain probe
    // ------------------------------------------------------------------

    /// Bootstrap a domain across the wire: probe an address that is not
    /// a member yet; a matching answer registers the responder as a
    /// static peer.
    pub fn send_domain_probe(
        &self,
        domain_id: &DomainId,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
        port: u16,
    ) -> bool {
        let Some(domain) = self.domain(domain_id) else {
            return false;
        };

        let transport = self.transport.clone();
        let nonce = self.ticker.insert(
            Query::new(
                QueryData::RawPing {
                    domain_id: *domain_id,
                    node_id: domain.node_id,
                    peer: NodeInfo::new(NodeId::ZERO, ipv4, ipv6, port),
                },
                DOMAIN_PROBE_GIVEUP,
            )
            .interval(DOMAIN_PROBE_INTERVAL)
            .retries(DOMAIN_PROBE_RETRIES)
            .on_retry(move |entry| {
                entry.update();
                let QueryData::RawPing {
                    domain_id,
                    node_id,
                    peer,
                } = &entry.data
                else {
                    return;
                };

                log::debug!("send domain_ping: domain={domain_id}, port={}", peer.port);

                let mut body = Body::new();
                body.put_bytes(KeyType::DomainId, domain_id.as_bytes().to_vec())
                    .put_bytes(KeyType::NodeId, node_id.as_bytes().to_vec())
                    .put_uint(KeyType::DomainPing, 0)
                    .put_bytes(KeyType::Nonce, entry.nonce.to_vec());
                transport.send_body(peer, &body);
            }),
        );

        self.ticker.kick(&nonce);
        true
    }

    /// The only exchange handled before domain membership: answer probes
    /// for hosted domains and adopt nodes whose answers prove they host
    /// ours.
    fn receive_domain_ping(&self, from: SocketAddr, body: &Body) {
        let (Some(domain_id), Some(node_id)) =
            (body.domain_id(), body.id::<NodeId>(KeyType::NodeId))
        else {
            return;
        };

        log::debug!("receive domain_ping: domain={domain_id}, from={from}");
        let Some(domain) = self.domain(&domain_id) else {
            return;
        };

        if domain.node_id == node_id {
            return;
        }

        let (ipv4, ipv6) = match from.ip() {
            std::net::IpAddr::V4(ip) => (Some(ip), None),
            std::net::IpAddr::V6(ip) => (None, Some(ip)),
        };

        if body.uint(KeyType::DomainPing) == Some(1) {
            if let Some(nonce) = body.nonce() {
                self.ticker.deactivate(&nonce);
            }

            self.add_static_node_to_domain(domain_id, node_id, ipv4, ipv6, from.port());
            domain.overlay().alive_check(&domain);
        } else {
            let mut reply = Body::new();
            reply
                .put_bytes(KeyType::DomainId, domain_id.as_bytes().to_vec())
                .put_bytes(KeyType::NodeId, domain.node_id.as_bytes().to_vec())
                .put_uint(KeyType::DomainPing, 1);
            if let Some(nonce) = body.nonce() {
                reply.put_bytes(KeyType::Nonce, nonce.to_vec());
            }

            let peer = NodeInfo::new(node_id, ipv4, ipv6, from.port());
            self.transport.send_body(&peer, &reply);
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Entry point of the datagram receive loops.
    pub fn dispatch_datagram(&self, is_v4: bool, from: SocketAddr, envelope: Envelope) {
        if envelope.payload_type != PayloadType::MsgPack {
            log::trace!("non-msgpack datagram dropped: addr={from}");
            return;
        }

        let body = match envelope.body_map() {
            Ok(body) => body,
            Err(e) => {
                log::warn!("datagram body decode failed: addr={from}, err={e}");
                return;
            }
        };

        if body.contains(KeyType::DomainPing) {
            self.receive_domain_ping(from, &body);
            return;
        }

        self.dispatch_body(is_v4, Some(from), body);
    }

    /// Entry point of the stream readers; the source address is
    /// deliberately withheld from the domain.
    pub fn dispatch_stream(&self, envelope: Envelope) {
        if envelope.payload_type != PayloadType::MsgPack {
            log::trace!("non-msgpack stream frame dropped");
            return;
        }

        match envelope.body_map() {
            Ok(body) => self.dispatch_body(true, None, body),
            Err(e) => {
                log::warn!("stream body decode failed: err={e}");
            }
        }
    }

    fn dispatch_body(&self, is_v4: bool, from: Option<SocketAddr>, body: Body) {
        // Frames lacking either addressing key, or naming an unknown
        // domain, change no state at all.
        if body.destination_node_id().is_none() {
            return;
        }

        let Some(domain_id) = body.domain_id() else {
            return;
        };

        let Some(domain) = self.domain(&domain_id) else {
            log::trace!("message for unknown domain dropped: domain={domain_id}");
            return;
        };

        domain.process_message_base(is_v4, from, &body);
    }
}

fn parse_addr<T: std::str::FromStr>(value: &str) -> Option<T> {
    if value.is_empty() {
        return None;
    }

    value.parse().ok()
}
