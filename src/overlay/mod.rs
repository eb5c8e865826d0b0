pub mod simple;

use std::{net::SocketAddr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use codec::{
    Body,
    types::{AssetGroupId, ResourceId, ResourceKind},
};
use ticker::{Nonce, QueryEntry};

use crate::domain::Domain;

/// The overlay-specific half of a domain.
///
/// The base domain handles membership, liveness and user bookkeeping;
/// everything that depends on how the overlay routes — resource
/// placement, user lookup, fan-out — is delegated through this trait.
/// One instance is constructed per domain.
pub trait Overlay: Send + Sync {
    /// Sweep the peer table for liveness and propagate the outcome.
    fn alive_check(&self, domain: &Arc<Domain>);

    /// Handle a message type the base dispatch does not know.
    fn process_message(
        &self,
        domain: &Arc<Domain>,
        is_v4: bool,
        from: Option<SocketAddr>,
        body: &Body,
    );

    /// Try to satisfy the resource lookup owned by the given query.
    fn get_resource(&self, domain: &Arc<Domain>, nonce: Nonce);

    /// Place a resource in the overlay.
    fn put_resource(
        &self,
        domain: &Arc<Domain>,
        asset_group_id: AssetGroupId,
        resource_id: ResourceId,
        resource_kind: ResourceKind,
        resource: &[u8],
    );

    /// Advance the user lookup owned by the given route query; called
    /// once on creation and again on every retry.
    fn send_p2p_message(&self, domain: &Arc<Domain>, entry: &mut QueryEntry);

    /// Send a message to `count` uniformly-random peers (or all of them,
    /// when fewer are known). Returns how many were addressed.
    fn random_send(&self, domain: &Arc<Domain>, body: Body, count: usize) -> usize;

    /// Announce which asset groups this node advertises (global domain).
    fn advertise_asset_group_info(&self, domain: &Arc<Domain>, groups: &[AssetGroupId]);
}

pub type OverlayFactory = fn() -> Box<dyn Overlay>;

/// Maps configured module names to overlay constructors.
pub struct OverlayRegistry {
    factories: HashMap<String, OverlayFactory>,
}

impl Default for OverlayRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };

        registry.register("simple", || Box::new(simple::SimpleOverlay::default()));
        registry
    }
}

impl OverlayRegistry {
    pub fn register(&mut self, name: &str, factory: OverlayFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn build(&self, name: &str) -> Option<Box<dyn Overlay>> {
        Some(self.factories.get(name)?())
    }
}
