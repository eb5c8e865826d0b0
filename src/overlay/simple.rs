//! The default overlay module: no routing structure, just the neighbor
//! set. Lookups and placement broadcast to every known peer and the
//! first answer wins, which is plenty for small domains and keeps the
//! module free of topology state.

use std::{net::SocketAddr, sync::Arc};

use ahash::HashMap;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;

use codec::{
    Body, KeyType, records,
    types::{AssetGroupId, MessageType, NodeId, NodeInfo, ResourceId, ResourceKind, UserId},
};
use ticker::{Nonce, Query, QueryData, QueryEntry};

use crate::{
    ALIVE_CHECK_PING_WAIT, DURATION_GIVEUP_PUT, GET_RETRY_COUNT, INTERVAL_RETRY,
    domain::{Domain, resource_kind_of},
    overlay::Overlay,
};

struct StoredResource {
    asset_group_id: AssetGroupId,
    kind: ResourceKind,
    data: Vec<u8>,
}

#[derive(Default)]
pub struct SimpleOverlay {
    resources: Mutex<HashMap<ResourceId, StoredResource>>,
    // Which peer advertised which asset group on the global overlay.
    advertised: Mutex<HashMap<AssetGroupId, NodeId>>,
}

impl SimpleOverlay {
    /// Resolve the responder of a lookup into addressing information.
    fn responder_info(domain: &Arc<Domain>, source: Option<NodeId>) -> Option<NodeInfo> {
        domain.peer(&source?)
    }

    fn broadcast(&self, domain: &Arc<Domain>, make: impl Fn(NodeId) -> Body) {
        for node_id in domain.peer_ids() {
            domain.send_message_to_peer(&make(node_id));
        }
    }
}

impl Overlay for SimpleOverlay {
    fn alive_check(&self, domain: &Arc<Domain>) {
        domain.clear_liveness();
        for node_id in domain.peer_ids() {
            domain.ping_with_retry(node_id, 3);
        }

        // Give the probes a chance to come back, then share the surviving
        // table with everyone in it.
        let broadcast_in = ALIVE_CHECK_PING_WAIT * 2;
        let domain_ = domain.clone();
        domain.ticker().exec_after(
            broadcast_in,
            QueryData::Refresh {
                domain_id: domain.domain_id,
            },
            move |_| {
                let alive: Vec<NodeInfo> = domain_
                    .peer_snapshot()
                    .into_iter()
                    .filter(|info| info.is_alive)
                    .collect();

                let mut entries = vec![domain_.transport().self_node_info(domain_.node_id)];
                entries.extend(alive.iter().cloned());
                let list = records::encode_peer_list(&entries);

                for info in &alive {
                    let mut body = domain_.make_message(
                        Some(info.node_id),
                        None,
                        MessageType::NotifyPeerlist,
                    );
                    body.put_bytes(KeyType::PeerList, list.clone());
                    domain_.send_message_to_peer(&body);
                }
            },
        );
    }

    fn process_message(
        &self,
        domain: &Arc<Domain>,
        is_v4: bool,
        from: Option<SocketAddr>,
        body: &Body,
    ) {
        let Some(msg_type) = body.msg_type() else {
            return;
        };

        let source = body.source_node_id();
        if let Some(source) = source {
            domain.add_peer(source, is_v4, from);
        }

        match msg_type {
            MessageType::RequestStore => {
                let (Some(asset_group_id), Some(resource_id), Some(resource), Some(kind)) = (
                    body.id::<AssetGroupId>(KeyType::AssetGroupId),
                    body.id::<ResourceId>(KeyType::ResourceId),
                    body.bytes(KeyType::Resource),
                    resource_kind_of(body),
                ) else {
                    return;
                };

                log::debug!("[{}] store resource: id={resource_id}", domain.node_id);
                self.resources.lock().insert(
                    resource_id,
                    StoredResource {
                        asset_group_id,
                        kind,
                        data: resource.to_vec(),
                    },
                );

                if let (Some(source), Some(nonce)) = (source, body.nonce()) {
                    domain.respond_store(source, nonce);
                }
            }

            MessageType::ResponseStoreCopy => {
                if let Some(nonce) = body.nonce() {
                    domain.ticker().deactivate(&nonce);
                }
            }

            MessageType::RequestFindUser => {
                let (Some(source), Some(nonce), Some(asset_group_id), Some(user_id)) = (
                    source,
                    body.nonce(),
                    body.id::<AssetGroupId>(KeyType::AssetGroupId),
                    body.id::<UserId>(KeyType::ResourceId),
                ) else {
                    return;
                };

                if domain.is_registered_user(&asset_group_id, &user_id) {
                    let mut reply = domain.make_message(
                        Some(source),
                        Some(nonce),
                        MessageType::ResponseFindUser,
                    );
                    reply
                        .put_bytes(KeyType::AssetGroupId, asset_group_id.as_bytes().to_vec())
                        .put_bytes(KeyType::ResourceId, user_id.as_bytes().to_vec());
                    domain.send_message_to_peer(&reply);
                }
            }

            MessageType::ResponseFindUser => {
                let (Some(nonce), Some(info)) =
                    (body.nonce(), Self::responder_info(domain, source))
                else {
                    return;
                };

                let updated = domain
                    .ticker()
                    .with_entry(&nonce, |entry| {
                        if let QueryData::Route { peer, .. } = &mut entry.data {
                            *peer = Some(info.clone());
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);

                if updated {
                    domain.ticker().resolve(&nonce);
                }
            }

            MessageType::RequestFindValue => {
                let (Some(source), Some(nonce), Some(resource_id)) = (
                    source,
                    body.nonce(),
                    body.id::<ResourceId>(KeyType::ResourceId),
                ) else {
                    return;
                };

                let resources = self.resources.lock();
                if let Some(stored) = resources.get(&resource_id) {
                    let mut reply = domain.make_message(
                        Some(source),
                        Some(nonce),
                        MessageType::ResponseFindValue,
                    );
                    reply
                        .put_bytes(KeyType::AssetGroupId, stored.asset_group_id.as_bytes().to_vec())
                        .put_bytes(KeyType::ResourceId, resource_id.as_bytes().to_vec())
                        .put_bytes(KeyType::Resource, stored.data.clone())
                        .put_uint(KeyType::ResourceType, u8::from(stored.kind) as u64);
                    drop(resources);
                    domain.send_message_to_peer(&reply);
                }
            }

            MessageType::ResponseFindValue => {
                let (Some(nonce), Some(resource)) = (body.nonce(), body.bytes(KeyType::Resource))
                else {
                    return;
                };

                let updated = domain
                    .ticker()
                    .with_entry(&nonce, |entry| {
                        if let QueryData::Find { resource: slot, .. } = &mut entry.data {
                            *slot = Some(resource.to_vec());
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);

                if updated {
                    domain.ticker().resolve(&nonce);
                }
            }

            MessageType::AdvertiseAssetGroup => {
                let (Some(source), Some(blob)) = (source, body.bytes(KeyType::AssetGroupId))
                else {
                    return;
                };

                let mut advertised = self.advertised.lock();
                for chunk in blob.chunks_exact(AssetGroupId::SIZE) {
                    if let Some(asset_group_id) = AssetGroupId::from_bytes(chunk) {
                        advertised.insert(asset_group_id, source);
                    }
                }
            }

            _ => {
                log::debug!("[{}] unhandled message type: {msg_type:?}", domain.node_id);
            }
        }
    }

    fn get_resource(&self, domain: &Arc<Domain>, nonce: Nonce) {
        let Some(Some(resource_id)) = domain.ticker().with_entry(&nonce, |entry| {
            if let QueryData::Find { resource_id, .. } = &entry.data {
                Some(*resource_id)
            } else {
                None
            }
        }) else {
            return;
        };

        let local = self
            .resources
            .lock()
            .get(&resource_id)
            .map(|stored| stored.data.clone());
        if let Some(data) = local {
            domain.ticker().with_entry(&nonce, |entry| {
                if let QueryData::Find { resource, .. } = &mut entry.data {
                    *resource = Some(data.clone());
                }
            });
            domain.ticker().resolve(&nonce);
            return;
        }

        self.broadcast(domain, |node_id| {
            let mut body =
                domain.make_message(Some(node_id), Some(nonce), MessageType::RequestFindValue);
            body.put_bytes(KeyType::ResourceId, resource_id.as_bytes().to_vec());
            body
        });
    }

    fn put_resource(
        &self,
        domain: &Arc<Domain>,
        asset_group_id: AssetGroupId,
        resource_id: ResourceId,
        resource_kind: ResourceKind,
        resource: &[u8],
    ) {
        self.resources.lock().insert(
            resource_id,
            StoredResource {
                asset_group_id,
                kind: resource_kind,
                data: resource.to_vec(),
            },
        );

        for node_id in domain.peer_ids() {
            let nonce = domain.ticker().insert(
                Query::new(
                    QueryData::Store {
                        domain_id: domain.domain_id,
                        node_id,
                        asset_group_id,
                        resource_id,
                        resource_kind,
                        resource: resource.to_vec(),
                    },
                    DURATION_GIVEUP_PUT,
                )
                .interval(INTERVAL_RETRY)
                .retries(GET_RETRY_COUNT)
                .on_retry({
                    let domain = domain.clone();
                    move |entry| {
                        entry.update();
                        if let QueryData::Store {
                            node_id,
                            asset_group_id,
                            resource_id,
                            resource_kind,
                            resource,
                            ..
                        } = &entry.data
                        {
                            domain.send_store(
                                *node_id,
                                entry.nonce,
                                *asset_group_id,
                                *resource_id,
                                *resource_kind,
                                resource,
                            );
                        }
                    }
                }),
            );

            domain.ticker().kick(&nonce);
        }
    }

    fn send_p2p_message(&self, domain: &Arc<Domain>, entry: &mut QueryEntry) {
        entry.update();
        let QueryData::Route {
            asset_group_id,
            destination_user_id,
            ..
        } = &entry.data
        else {
            return;
        };

        let (asset_group_id, destination_user_id) = (*asset_group_id, *destination_user_id);
        let nonce = entry.nonce;
        self.broadcast(domain, |node_id| {
            let mut body =
                domain.make_message(Some(node_id), Some(nonce), MessageType::RequestFindUser);
            body.put_bytes(KeyType::AssetGroupId, asset_group_id.as_bytes().to_vec())
                .put_bytes(KeyType::ResourceId, destination_user_id.as_bytes().to_vec());
            body
        });
    }

    fn random_send(&self, domain: &Arc<Domain>, body: Body, count: usize) -> usize {
        let peers = domain.peer_snapshot();
        let chosen: Vec<NodeInfo> = peers
            .choose_multiple(&mut rand::rng(), count.min(peers.len()))
            .cloned()
            .collect();

        let mut sent = 0;
        for info in chosen {
            let mut body = body.clone();
            body.put_bytes(KeyType::DestinationNodeId, info.node_id.as_bytes().to_vec());
            if domain.transport().send_body(&info, &body) {
                sent += 1;
            }
        }

        sent
    }

    fn advertise_asset_group_info(&self, domain: &Arc<Domain>, groups: &[AssetGroupId]) {
        let mut blob = Vec::with_capacity(groups.len() * AssetGroupId::SIZE);
        for asset_group_id in groups {
            blob.extend_from_slice(asset_group_id.as_bytes());
        }

        self.broadcast(domain, |node_id| {
            let mut body =
                domain.make_message(Some(node_id), None, MessageType::AdvertiseAssetGroup);
            body.put_bytes(KeyType::AssetGroupId, blob.clone());
            body
        });
    }
}
