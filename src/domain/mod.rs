use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use rand::Rng;

use codec::{
    Body, KeyType, records,
    types::{
        AssetGroupId, DomainId, MessageType, NodeId, NodeInfo, ResourceId, ResourceKind, UserId,
    },
};
use ticker::{Nonce, Query, QueryData, Ticker};

use crate::{
    ALIVE_CHECK_PING_WAIT, REFRESH_INTERVAL,
    ledger::LedgerCore,
    overlay::Overlay,
    transport::Transport,
};

/// A refresh round further away than this gets pulled closer when the
/// membership changes.
const REFRESH_PULL_THRESHOLD: Duration = Duration::from_secs(10);
const REFRESH_PULL_TO: Duration = Duration::from_secs(5);

pub struct DomainOptions {
    pub domain_id: DomainId,
    pub node_id: NodeId,
    pub transport: Arc<Transport>,
    pub ticker: Ticker,
    pub ledger: Arc<dyn LedgerCore>,
    pub overlay: Box<dyn Overlay>,
}

/// One logically isolated overlay this node is a member of.
///
/// Holds the peer table and the registered local users, runs the
/// liveness/refresh protocol, dispatches inbound messages and delegates
/// everything overlay-specific to the configured module.
pub struct Domain {
    pub domain_id: DomainId,
    pub node_id: NodeId,
    transport: Arc<Transport>,
    ticker: Ticker,
    ledger: Arc<dyn LedgerCore>,
    overlay: Box<dyn Overlay>,
    peers: Mutex<HashMap<NodeId, NodeInfo>>,
    users: Mutex<HashMap<AssetGroupId, HashMap<UserId, SystemTime>>>,
    refresh: Mutex<Option<Nonce>>,
}

impl Domain {
    pub fn new(options: DomainOptions) -> Arc<Self> {
        Arc::new(Self {
            domain_id: options.domain_id,
            node_id: options.node_id,
            transport: options.transport,
            ticker: options.ticker,
            ledger: options.ledger,
            overlay: options.overlay,
            peers: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            refresh: Mutex::new(None),
        })
    }

    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerCore> {
        &self.ledger
    }

    pub fn overlay(&self) -> &dyn Overlay {
        self.overlay.as_ref()
    }

    // ------------------------------------------------------------------
    // Peer table
    // ------------------------------------------------------------------

    pub fn peer(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.peers.lock().get(node_id).cloned()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.lock().keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer_snapshot(&self) -> Vec<NodeInfo> {
        self.peers.lock().values().cloned().collect()
    }

    /// Record a peer from an observed source address; one family at a
    /// time. Returns `true` iff the node was newly inserted.
    ///
    /// Stream-delivered messages carry no usable source address and
    /// leave the table untouched.
    pub fn add_peer(&self, node_id: NodeId, is_v4: bool, from: Option<SocketAddr>) -> bool {
        if node_id == self.node_id {
            return false;
        }

        let Some(from) = from else {
            return false;
        };

        let (ipv4, ipv6) = match (is_v4, from.ip()) {
            (true, std::net::IpAddr::V4(ip)) => (Some(ip), None),
            (false, std::net::IpAddr::V6(ip)) => (None, Some(ip)),
            _ => (None, None),
        };

        let newly_inserted = {
            let mut peers = self.peers.lock();
            match peers.get_mut(&node_id) {
                Some(info) => {
                    info.update(ipv4, ipv6, from.port());
                    info.touch();
                    false
                }
                None => {
                    log::debug!("[{}] add_peer: new node={node_id}, port={}", self.node_id, from.port());
                    let mut info = NodeInfo::new(node_id, ipv4, ipv6, from.port());
                    info.touch();
                    peers.insert(node_id, info);
                    true
                }
            }
        };

        if newly_inserted {
            // Fresh topology should propagate before the regular round.
            self.pull_refresh_closer();
        }

        newly_inserted
    }

    /// Record a peer with both address families known up front and probe
    /// it; the probe's expiry evicts the node if it never answered.
    pub fn add_peer_full(
        self: &Arc<Self>,
        node_id: NodeId,
        ipv4: Option<std::net::Ipv4Addr>,
        ipv6: Option<std::net::Ipv6Addr>,
        port: u16,
    ) {
        if node_id == self.node_id {
            return;
        }

        log::debug!("[{}] add_peer_full: node={node_id}, port={port}", self.node_id);
        self.peers
            .lock()
            .insert(node_id, NodeInfo::new(node_id, ipv4, ipv6, port));
        self.ping_with_retry(node_id, 3);
    }

    pub fn remove_peer(&self, node_id: &NodeId) {
        self.peers.lock().remove(node_id);
    }

    /// Replace the whole table from a received peer list, dropping any
    /// entry naming this node, then ping every new entry.
    pub fn renew_peerlist(self: &Arc<Self>, bytes: &[u8]) {
        let entries = match records::decode_peer_list(bytes) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("[{}] malformed peer list: err={e}", self.node_id);
                return;
            }
        };

        let mut mapping = HashMap::with_capacity(entries.len());
        for info in entries {
            if info.node_id == self.node_id {
                continue;
            }

            mapping.insert(info.node_id, info);
        }

        let ids: Vec<NodeId> = mapping.keys().copied().collect();
        *self.peers.lock() = mapping;
        for node_id in ids {
            self.send_ping(node_id, None);
        }
    }

    /// Binary peer list: this node first, then every table entry.
    pub fn make_peer_list(&self) -> Vec<u8> {
        let mut entries = vec![self.transport.self_node_info(self.node_id)];
        entries.extend(self.peers.lock().values().cloned());
        records::encode_peer_list(&entries)
    }

    /// Clear every peer's liveness flag; answered pings set it back.
    pub fn clear_liveness(&self) {
        for info in self.peers.lock().values_mut() {
            info.is_alive = false;
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Probe a peer, re-sending until the response arrives or the
    /// retries run out; an unanswered probe evicts the peer.
    pub fn ping_with_retry(self: &Arc<Self>, node_id: NodeId, retries: u32) {
        let nonce = self.ticker.insert(
            Query::new(
                QueryData::Ping {
                    domain_id: self.domain_id,
                    node_id,
                },
                ALIVE_CHECK_PING_WAIT,
            )
            .interval(Duration::from_secs(1))
            .retries(retries)
            .on_retry({
                let domain = self.clone();
                move |entry| {
                    entry.update();
                    if let QueryData::Ping { node_id, .. } = &entry.data {
                        domain.send_ping(*node_id, Some(entry.nonce));
                    }
                }
            })
            .on_expire({
                let domain = self.clone();
                move |entry| {
                    if let QueryData::Ping { node_id, .. } = &entry.data {
                        domain.ping_response_check(node_id);
                    }
                }
            }),
        );

        self.ticker.kick(&nonce);
    }

    fn ping_response_check(&self, node_id: &NodeId) {
        let mut peers = self.peers.lock();
        if peers.get(node_id).is_some_and(|info| !info.is_alive) {
            log::info!("[{}] peer unreachable, removing: node={node_id}", self.node_id);
            peers.remove(node_id);
        }
    }

    // ------------------------------------------------------------------
    // Refresh rounds
    // ------------------------------------------------------------------

    /// Arm the next refresh round at a randomized phase, so that peers
    /// that synchronize on START_TO_REFRESH do not thundering-herd.
    pub fn set_refresh_timer(self: &Arc<Self>) {
        let seconds = REFRESH_INTERVAL.as_secs();
        let delay = Duration::from_secs(rand::rng().random_range(seconds / 2..=seconds * 3 / 2));

        let domain = self.clone();
        let nonce = self.ticker.exec_after(
            delay,
            QueryData::Refresh {
                domain_id: self.domain_id,
            },
            move |_| domain.refresh_peer_list(),
        );

        *self.refresh.lock() = Some(nonce);
    }

    fn refresh_peer_list(self: &Arc<Self>) {
        log::debug!("[{}] refresh round starting", self.node_id);
        for node_id in self.peer_ids() {
            self.send_start_refresh(node_id);
        }

        self.overlay.alive_check(self);
        self.set_refresh_timer();
    }

    /// A peer announced its own refresh round: drop ours and re-arm, so
    /// the overlay churns roughly in phase.
    fn reset_refresh_timer(self: &Arc<Self>) {
        if let Some(nonce) = self.refresh.lock().take() {
            self.ticker.deactivate(&nonce);
        }

        self.set_refresh_timer();
    }

    fn pull_refresh_closer(&self) {
        let refresh = self.refresh.lock();
        if let Some(nonce) = refresh.as_ref() {
            if self
                .ticker
                .remaining(nonce)
                .is_some_and(|rest| rest > REFRESH_PULL_THRESHOLD)
            {
                self.ticker.expire_within(nonce, REFRESH_PULL_TO);
            }
        }
    }

    // ------------------------------------------------------------------
    // Registered users
    // ------------------------------------------------------------------

    pub fn register_user(&self, asset_group_id: AssetGroupId, user_id: UserId) {
        self.users
            .lock()
            .entry(asset_group_id)
            .or_default()
            .insert(user_id, SystemTime::now());
    }

    /// Remove a user; absent asset groups are a no-op. An emptied group
    /// bucket is dropped entirely.
    pub fn unregister_user(&self, asset_group_id: &AssetGroupId, user_id: &UserId) {
        let mut users = self.users.lock();
        if let Some(group) = users.get_mut(asset_group_id) {
            group.remove(user_id);
            if group.is_empty() {
                users.remove(asset_group_id);
            }
        }
    }

    pub fn is_registered_user(&self, asset_group_id: &AssetGroupId, user_id: &UserId) -> bool {
        self.users
            .lock()
            .get(asset_group_id)
            .is_some_and(|group| group.contains_key(user_id))
    }

    pub fn registered_asset_groups(&self) -> Vec<AssetGroupId> {
        self.users.lock().keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// A message skeleton with the addressing fields every frame carries.
    pub fn make_message(
        &self,
        destination: Option<NodeId>,
        nonce: Option<Nonce>,
        msg_type: MessageType,
    ) -> Body {
        let mut body = Body::new();
        body.put_bytes(KeyType::SourceNodeId, self.node_id.as_bytes().to_vec())
            .put_bytes(KeyType::DomainId, self.domain_id.as_bytes().to_vec())
            .put_bytes(KeyType::P2pMsgType, msg_type.to_bytes());

        if let Some(destination) = destination {
            body.put_bytes(KeyType::DestinationNodeId, destination.as_bytes().to_vec());
        }

        if let Some(nonce) = nonce {
            body.put_bytes(KeyType::Nonce, nonce.to_vec());
        }

        body
    }

    /// Resolve the destination in the peer table and hand the frame to
    /// the transport. Unknown destinations are logged, never raised.
    pub fn send_message_to_peer(&self, body: &Body) -> bool {
        let Some(target) = body.destination_node_id() else {
            log::warn!("[{}] outbound message without destination", self.node_id);
            return false;
        };

        let Some(info) = self.peer(&target) else {
            log::info!("[{}] fail to send message: no such node: node={target}", self.node_id);
            return false;
        };

        self.transport.send_body(&info, body)
    }

    pub fn send_ping(&self, target: NodeId, nonce: Option<Nonce>) -> bool {
        let body = self.make_message(Some(target), nonce, MessageType::RequestPing);
        self.send_message_to_peer(&body)
    }

    pub fn respond_ping(&self, target: NodeId, nonce: Option<Nonce>) -> bool {
        let body = self.make_message(Some(target), nonce, MessageType::ResponsePing);
        self.send_message_to_peer(&body)
    }

    pub fn send_store(
        &self,
        target: NodeId,
        nonce: Nonce,
        asset_group_id: AssetGroupId,
        resource_id: ResourceId,
        resource_kind: ResourceKind,
        resource: &[u8],
    ) -> bool {
        let mut body = self.make_message(Some(target), Some(nonce), MessageType::RequestStore);
        body.put_bytes(KeyType::AssetGroupId, asset_group_id.as_bytes().to_vec())
            .put_bytes(KeyType::ResourceId, resource_id.as_bytes().to_vec())
            .put_bytes(KeyType::Resource, resource.to_vec())
            .put_uint(KeyType::ResourceType, u8::from(resource_kind) as u64);
        self.send_message_to_peer(&body)
    }

    pub fn respond_store(&self, target: NodeId, nonce: Nonce) -> bool {
        let body = self.make_message(Some(target), Some(nonce), MessageType::ResponseStore);
        self.send_message_to_peer(&body)
    }

    pub fn send_start_refresh(&self, target: NodeId) -> bool {
        let body = self.make_message(Some(target), None, MessageType::StartToRefresh);
        self.send_message_to_peer(&body)
    }

    /// Announce departure to every current peer and cancel the refresh
    /// round.
    pub fn leave(&self) {
        if let Some(nonce) = self.refresh.lock().take() {
            self.ticker.deactivate(&nonce);
        }

        for node_id in self.peer_ids() {
            let body = self.make_message(Some(node_id), None, MessageType::NotifyLeave);
            self.send_message_to_peer(&body);
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Common dispatch for every inbound message of this domain; types
    /// without a built-in handler go to the overlay module.
    pub fn process_message_base(
        self: &Arc<Self>,
        is_v4: bool,
        from: Option<SocketAddr>,
        body: &Body,
    ) {
        let Some(msg_type) = body.msg_type() else {
            log::debug!("[{}] message without a known type, dropped", self.node_id);
            return;
        };

        let source = body.source_node_id();
        log::debug!(
            "[{}] process_message: type={msg_type:?}, source={:?}",
            self.node_id,
            source
        );

        match msg_type {
            MessageType::MessageToUser => {
                if let Some(message) = body.bytes(KeyType::Message) {
                    self.ledger.deliver_to_user(message);
                }
            }

            MessageType::RequestPing => {
                if let Some(source) = source {
                    self.add_peer(source, is_v4, from);
                    self.respond_ping(source, body.nonce());
                }
            }

            MessageType::ResponsePing => {
                if let Some(source) = source {
                    self.add_peer(source, is_v4, from);
                }

                if let Some(nonce) = body.nonce() {
                    self.ticker.resolve(&nonce);
                }
            }

            MessageType::ResponseStore => {
                if let Some(source) = source {
                    self.add_peer(source, is_v4, from);
                }

                if let Some(nonce) = body.nonce() {
                    self.ticker.deactivate(&nonce);
                }
            }

            MessageType::NotifyCrossRef => {
                if self.domain_id != DomainId::GLOBAL {
                    log::debug!("[{}] cross-ref outside the global domain, dropped", self.node_id);
                    return;
                }

                if let Some(source) = source {
                    self.add_peer(source, is_v4, from);
                }

                if let Some(blob) = body.bytes(KeyType::CrossRefs) {
                    match records::decode_cross_refs(blob) {
                        Ok(refs) => {
                            for (asset_group_id, tx_id) in refs {
                                self.ledger.record_cross_ref(asset_group_id, tx_id);
                            }
                        }
                        Err(e) => {
                            log::warn!("[{}] malformed cross-ref blob: err={e}", self.node_id);
                        }
                    }
                }
            }

            MessageType::NotifyPeerlist => {
                if let Some(list) = body.bytes(KeyType::PeerList) {
                    self.renew_peerlist(list);
                }
            }

            MessageType::StartToRefresh => {
                if let Some(source) = source {
                    self.add_peer(source, is_v4, from);
                }

                self.reset_refresh_timer();
            }

            MessageType::NotifyLeave => {
                if let Some(source) = source {
                    self.remove_peer(&source);
                }
            }

            _ => self.overlay.process_message(self, is_v4, from, body),
        }
    }
}

/// Read a uint body field back into a resource kind.
pub fn resource_kind_of(body: &Body) -> Option<ResourceKind> {
    let raw = body.uint(KeyType::ResourceType)?;
    ResourceKind::try_from(u8::try_from(raw).ok()?).ok()
}
