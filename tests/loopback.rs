//! Two-node scenarios over real sockets on 127.0.0.1.
//!
//! Each test starts full hubs on distinct ports with a recording ledger
//! mock, so the whole path — codec, transport, dispatch, domain, query
//! table — is exercised end to end.

use std::{
    net::{Ipv4Addr, UdpSocket},
    sync::{Arc, Mutex},
    time::Duration,
};

use mesh_node::{
    NUM_CROSS_REF_COPY,
    codec::{
        Decoder, Envelope, KeyType, PayloadType,
        records,
        types::{
            AssetGroupId, DomainId, MessageType, NodeId, NodeInfo, ResourceId, ResourceKind,
            TransactionId, UserId,
        },
    },
    config::Config,
    hub::{HubOptions, NetworkHub},
    ledger::{AssetStorage, ENODESTINATION, ErrorReply, LedgerCore, StorageKind},
    ticker::{Query, QueryData},
    transport::TCP_THRESHOLD_SIZE,
};

#[derive(Default)]
struct MockLedger {
    delivered: Mutex<Vec<Vec<u8>>>,
    errors: Mutex<Vec<(ErrorReply, i32, String)>>,
    cross_refs: Mutex<Vec<(AssetGroupId, TransactionId)>>,
}

impl LedgerCore for MockLedger {
    fn deliver_to_user(&self, message: &[u8]) {
        self.delivered.lock().unwrap().push(message.to_vec());
    }

    fn reply_error(&self, reply: ErrorReply, code: i32, text: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((reply, code, text.to_string()));
    }

    fn record_cross_ref(&self, asset_group_id: AssetGroupId, tx_id: TransactionId) {
        self.cross_refs.lock().unwrap().push((asset_group_id, tx_id));
    }
}

impl AssetStorage for MockLedger {
    fn setup_asset_group(
        &self,
        _domain_id: DomainId,
        _asset_group_id: AssetGroupId,
        _storage: StorageKind,
        _path: Option<&str>,
        _advertise: bool,
    ) {
    }
}

async fn start_node(port: u16) -> (Arc<NetworkHub>, Arc<MockLedger>) {
    let ledger = Arc::new(MockLedger::default());
    let mut config = Config::default();
    config.network.p2p_port = port;

    let hub = NetworkHub::start(HubOptions {
        config,
        config_path: None,
        ledger: ledger.clone(),
        storage: ledger.clone(),
        use_global: true,
        p2p_port: None,
    })
    .await
    .expect("node startup");

    (hub, ledger)
}

async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn test_domain() -> DomainId {
    DomainId::from([0x11u8; 32])
}

/// Two nodes, one static peer entry: both peer tables converge through
/// the ping exchange.
#[tokio::test(flavor = "multi_thread")]
async fn loopback_ping_builds_mutual_membership() {
    let domain_id = test_domain();
    let (a, _) = start_node(28461).await;
    let (b, _) = start_node(28462).await;

    assert!(a.create_domain(domain_id, "simple", false));
    assert!(b.create_domain(domain_id, "simple", false));

    let a_node = a.local_node_id(&domain_id).unwrap();
    let b_node = b.local_node_id(&domain_id).unwrap();
    a.add_static_node_to_domain(domain_id, b_node, Some(Ipv4Addr::LOCALHOST), None, 28462);

    let a_domain = a.domain(&domain_id).unwrap();
    let b_domain = b.domain(&domain_id).unwrap();
    assert!(
        wait_for(
            || {
                b_domain.peer_ids().contains(&a_node) && a_domain.peer_ids().contains(&b_node)
            },
            Duration::from_secs(3),
        )
        .await
    );
}

/// A 2 KiB MESSAGE_TO_USER exceeds the datagram threshold, crosses via a
/// short-lived stream and is delivered exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn oversize_message_crosses_via_stream() {
    let domain_id = test_domain();
    let (a, _) = start_node(28463).await;
    let (b, b_ledger) = start_node(28464).await;

    a.create_domain(domain_id, "simple", false);
    b.create_domain(domain_id, "simple", false);
    let b_node = b.local_node_id(&domain_id).unwrap();
    a.add_static_node_to_domain(domain_id, b_node, Some(Ipv4Addr::LOCALHOST), None, 28464);

    let a_domain = a.domain(&domain_id).unwrap();
    assert!(
        wait_for(|| a_domain.peer_ids().contains(&b_node), Duration::from_secs(3)).await
    );

    let payload = vec![0x5au8; 2048];
    let mut body = a_domain.make_message(Some(b_node), None, MessageType::MessageToUser);
    body.put_bytes(KeyType::Message, payload.clone());

    // The size law: this frame must leave through the stream path.
    let framed = Envelope::msgpack(&body).unwrap().to_bytes();
    assert!(framed.len() > TCP_THRESHOLD_SIZE);

    assert!(a_domain.send_message_to_peer(&body));
    assert!(
        wait_for(
            || b_ledger.delivered.lock().unwrap().as_slice() == [payload.clone()],
            Duration::from_secs(3),
        )
        .await
    );
}

/// A small frame stays under the datagram threshold.
#[test]
fn ping_frames_fit_in_a_datagram() {
    let mut body = mesh_node::codec::Body::new();
    body.put_bytes(KeyType::SourceNodeId, vec![1u8; 32])
        .put_bytes(KeyType::DestinationNodeId, vec![2u8; 32])
        .put_bytes(KeyType::DomainId, vec![3u8; 32])
        .put_bytes(KeyType::P2pMsgType, MessageType::RequestPing.to_bytes())
        .put_bytes(KeyType::Nonce, vec![4u8; 16]);

    assert!(Envelope::msgpack(&body).unwrap().to_bytes().len() <= TCP_THRESHOLD_SIZE);
}

/// Routing towards a user registered on a peer: one overlay lookup, one
/// forwarded hop, one local delivery on the peer.
#[tokio::test(flavor = "multi_thread")]
async fn route_message_forwards_one_hop() {
    let domain_id = test_domain();
    let asset_group = AssetGroupId::from([0x22u8; 32]);
    let (a, a_ledger) = start_node(28465).await;
    let (b, b_ledger) = start_node(28466).await;

    a.create_domain(domain_id, "simple", false);
    b.create_domain(domain_id, "simple", false);
    let a_node = a.local_node_id(&domain_id).unwrap();
    let b_node = b.local_node_id(&domain_id).unwrap();
    a.add_static_node_to_domain(domain_id, b_node, Some(Ipv4Addr::LOCALHOST), None, 28466);

    let a_domain = a.domain(&domain_id).unwrap();
    let b_domain = b.domain(&domain_id).unwrap();
    assert!(
        wait_for(
            || a_domain.peer_ids().contains(&b_node) && b_domain.peer_ids().contains(&a_node),
            Duration::from_secs(3),
        )
        .await
    );

    let destination = UserId::from([0x33u8; 32]);
    let source = UserId::from([0x44u8; 32]);
    b.register_user_id(&domain_id, asset_group, destination);

    let message = b"ledger transaction for u1".to_vec();
    assert!(a.route_message(
        &domain_id,
        asset_group,
        source,
        destination,
        message.clone(),
        PayloadType::MsgPack,
    ));

    assert!(
        wait_for(
            || b_ledger.delivered.lock().unwrap().as_slice() == [message.clone()],
            Duration::from_secs(5),
        )
        .await
    );
    assert!(a_ledger.delivered.lock().unwrap().is_empty());
}

/// With nobody hosting the destination, the route query expires and the
/// caller gets a structured ENODESTINATION reply.
#[tokio::test(flavor = "multi_thread")]
async fn route_exhaustion_reports_enodestination() {
    let domain_id = test_domain();
    let asset_group = AssetGroupId::from([0x22u8; 32]);
    let (a, a_ledger) = start_node(28467).await;
    let (b, _) = start_node(28468).await;

    a.create_domain(domain_id, "simple", false);
    b.create_domain(domain_id, "simple", false);
    let b_node = b.local_node_id(&domain_id).unwrap();
    a.add_static_node_to_domain(domain_id, b_node, Some(Ipv4Addr::LOCALHOST), None, 28468);

    let source = UserId::from([0x44u8; 32]);
    let unknown = UserId::from([0x55u8; 32]);
    assert!(a.route_message(
        &domain_id,
        asset_group,
        source,
        unknown,
        b"nobody hosts this".to_vec(),
        PayloadType::MsgPack,
    ));

    // The deadline re-arms once per retry, so exhaustion lands shortly
    // after the configured give-up window.
    assert!(
        wait_for(
            || !a_ledger.errors.lock().unwrap().is_empty(),
            Duration::from_secs(40),
        )
        .await
    );

    let errors = a_ledger.errors.lock().unwrap();
    let (reply, code, text) = &errors[0];
    assert_eq!(*code, ENODESTINATION);
    assert_eq!(text, "cannot find core node");
    assert_eq!(reply.destination_user_id, source);
    assert_eq!(reply.asset_group_id, asset_group);
}

/// NOTIFY_PEERLIST wholesale-replaces the receiver's table, minus the
/// receiver itself, and every new entry gets pinged.
#[tokio::test(flavor = "multi_thread")]
async fn peerlist_replacement_drops_self_and_pings_new_peers() {
    let domain_id = test_domain();
    let (a, _) = start_node(28469).await;
    let (b, _) = start_node(28470).await;

    a.create_domain(domain_id, "simple", false);
    b.create_domain(domain_id, "simple", false);
    let a_node = a.local_node_id(&domain_id).unwrap();
    let b_node = b.local_node_id(&domain_id).unwrap();
    a.add_static_node_to_domain(domain_id, b_node, Some(Ipv4Addr::LOCALHOST), None, 28470);

    let a_domain = a.domain(&domain_id).unwrap();
    let b_domain = b.domain(&domain_id).unwrap();
    assert!(
        wait_for(
            || a_domain.peer_ids().contains(&b_node) && b_domain.peer_ids().contains(&a_node),
            Duration::from_secs(3),
        )
        .await
    );

    // A third node that only exists as a socket.
    let z_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    z_socket
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    let z_node = NodeId::from([0x66u8; 32]);
    let z_port = z_socket.local_addr().unwrap().port();

    let list = records::encode_peer_list(&[
        NodeInfo::new(b_node, Some(Ipv4Addr::LOCALHOST), None, 28470),
        NodeInfo::new(z_node, Some(Ipv4Addr::LOCALHOST), None, z_port),
    ]);

    let mut body = a_domain.make_message(Some(b_node), None, MessageType::NotifyPeerlist);
    body.put_bytes(KeyType::PeerList, list);
    assert!(a_domain.send_message_to_peer(&body));

    assert!(
        wait_for(|| b_domain.peer_ids() == [z_node], Duration::from_secs(3)).await
    );

    // The replacement ping reaches Z.
    let mut buffer = [0u8; 1500];
    let mut decoder = Decoder::default();
    let mut pinged = false;
    while let Ok((size, _)) = z_socket.recv_from(&mut buffer) {
        decoder.feed(&buffer[..size]);
        while let Ok(Some(envelope)) = decoder.next() {
            let body = envelope.body_map().unwrap();
            if body.msg_type() == Some(MessageType::RequestPing) {
                assert_eq!(body.domain_id(), Some(domain_id));
                assert_eq!(body.source_node_id(), Some(b_node));
                pinged = true;
            }
        }

        decoder.reset();
        if pinged {
            break;
        }
    }

    assert!(pinged);
}

/// Cross-ref dissemination fans out to exactly NUM_CROSS_REF_COPY random
/// peers of the global overlay.
#[tokio::test(flavor = "multi_thread")]
async fn cross_ref_fanout_hits_the_configured_copy_count() {
    let (a, _) = start_node(28471).await;
    a.create_domain(DomainId::GLOBAL, "simple", false);
    let global = a.domain(&DomainId::GLOBAL).unwrap();

    let mut sockets = Vec::new();
    for i in 0..5u8 {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(400)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        global.add_peer_full(
            NodeId::from([i + 1; 32]),
            Some(Ipv4Addr::LOCALHOST),
            None,
            port,
        );
        sockets.push(socket);
    }

    assert_eq!(global.peer_count(), 5);

    let asset_group = AssetGroupId::from([0x77u8; 32]);
    let tx_id = TransactionId::from([0x88u8; 32]);
    a.disseminate_cross_ref(tx_id, asset_group);

    // Count NOTIFY_CROSS_REF frames across all fake peers, ignoring the
    // liveness probes they also receive.
    let mut copies = 0;
    let mut buffer = [0u8; 1500];
    for socket in &sockets {
        let mut decoder = Decoder::default();
        for _ in 0..8 {
            let Ok((size, _)) = socket.recv_from(&mut buffer) else {
                break;
            };

            decoder.feed(&buffer[..size]);
            while let Ok(Some(envelope)) = decoder.next() {
                let body = envelope.body_map().unwrap();
                if body.msg_type() == Some(MessageType::NotifyCrossRef) {
                    let refs =
                        records::decode_cross_refs(body.bytes(KeyType::CrossRefs).unwrap())
                            .unwrap();
                    assert_eq!(refs, vec![(asset_group, tx_id)]);
                    copies += 1;
                }
            }

            decoder.reset();
        }
    }

    assert_eq!(copies, NUM_CROSS_REF_COPY);
}

/// put replicates to the peer; a lookup on the peer then answers from
/// its own store.
#[tokio::test(flavor = "multi_thread")]
async fn put_replicates_and_get_answers_locally() {
    let domain_id = test_domain();
    let asset_group = AssetGroupId::from([0x22u8; 32]);
    let (a, _) = start_node(28472).await;
    let (b, _) = start_node(28473).await;

    a.create_domain(domain_id, "simple", false);
    b.create_domain(domain_id, "simple", false);
    let b_node = b.local_node_id(&domain_id).unwrap();
    a.add_static_node_to_domain(domain_id, b_node, Some(Ipv4Addr::LOCALHOST), None, 28473);

    let a_domain = a.domain(&domain_id).unwrap();
    assert!(
        wait_for(|| a_domain.peer_ids().contains(&b_node), Duration::from_secs(3)).await
    );

    let resource_id = ResourceId::from([0x99u8; 32]);
    let resource = b"stored transaction bytes".to_vec();
    assert!(a.put(
        &domain_id,
        asset_group,
        resource_id,
        ResourceKind::TransactionData,
        &resource,
    ));

    // Wait for the replication to land, then ask B for the resource
    // through a caller-owned query.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let found = Arc::new(Mutex::new(None::<Vec<u8>>));
    let nonce = b.ticker().insert(
        Query::new(
            QueryData::Find {
                domain_id,
                resource_id,
                resource_kind: ResourceKind::TransactionData,
                resource: None,
            },
            Duration::from_secs(5),
        )
        .on_success({
            let found = found.clone();
            move |entry| {
                if let QueryData::Find { resource, .. } = &entry.data {
                    *found.lock().unwrap() = resource.clone();
                }
            }
        }),
    );
    b.get(&nonce);

    assert!(
        wait_for(
            || found.lock().unwrap().as_deref() == Some(resource.as_slice()),
            Duration::from_secs(3),
        )
        .await
    );
}
