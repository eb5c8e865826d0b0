use codec::{
    PayloadType,
    types::{AssetGroupId, DomainId, NodeId, NodeInfo, ResourceId, ResourceKind, UserId},
};

/// Typed payload of an outstanding query.
///
/// Every in-flight protocol step on the wire is one of these; the
/// callbacks attached to the entry know which variant they carry.
#[derive(Debug, Clone)]
pub enum QueryData {
    /// Domain bootstrap probe towards a node that is not a member yet.
    RawPing {
        domain_id: DomainId,
        node_id: NodeId,
        peer: NodeInfo,
    },

    /// Liveness probe for a known peer.
    Ping { domain_id: DomainId, node_id: NodeId },

    /// An outstanding store request towards one peer.
    Store {
        domain_id: DomainId,
        node_id: NodeId,
        asset_group_id: AssetGroupId,
        resource_id: ResourceId,
        resource_kind: ResourceKind,
        resource: Vec<u8>,
    },

    /// An outstanding resource lookup; `resource` is filled by the
    /// response before the entry resolves.
    Find {
        domain_id: DomainId,
        resource_id: ResourceId,
        resource_kind: ResourceKind,
        resource: Option<Vec<u8>>,
    },

    /// A user-addressed message waiting for a next hop; `peer` is filled
    /// by the overlay lookup before the entry resolves.
    Route {
        domain_id: DomainId,
        asset_group_id: AssetGroupId,
        source_user_id: UserId,
        destination_user_id: UserId,
        payload_type: PayloadType,
        message: Vec<u8>,
        peer: Option<NodeInfo>,
    },

    /// A pending refresh round for one domain.
    Refresh { domain_id: DomainId },
}
