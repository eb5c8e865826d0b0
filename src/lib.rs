pub mod config;
pub mod domain;
pub mod hub;
pub mod ledger;
pub mod overlay;
pub mod router;
pub mod transport;

pub use codec;
pub use ticker;

use std::{sync::Arc, time::Duration};

use self::{
    config::Config,
    hub::{HubOptions, NetworkHub},
    ledger::{AssetStorage, LedgerCore},
};

/// Copies sent per cross-ref dissemination.
pub const NUM_CROSS_REF_COPY: usize = 2;

/// How long route and put queries keep trying before giving up.
pub const DURATION_GIVEUP_PUT: Duration = Duration::from_secs(30);

/// Delay between retries of route and put queries.
pub const INTERVAL_RETRY: Duration = Duration::from_secs(3);

/// Retries of a resource lookup.
pub const GET_RETRY_COUNT: u32 = 5;

/// Retries of a route lookup.
pub const ROUTE_RETRY_COUNT: u32 = 1;

/// Nominal delay between refresh rounds; the actual phase is randomized
/// around it.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1800);

/// How long an unanswered liveness probe waits after its last send.
pub const ALIVE_CHECK_PING_WAIT: Duration = Duration::from_secs(2);

/// Start a node from its configuration, with the global overlay enabled.
///
/// Opened up so that integration tests and embedders can run the whole
/// core without going through the binary.
pub async fn startup(
    config: Config,
    config_path: Option<String>,
    ledger: Arc<dyn LedgerCore>,
    storage: Arc<dyn AssetStorage>,
) -> anyhow::Result<Arc<NetworkHub>> {
    NetworkHub::start(HubOptions {
        config,
        config_path,
        ledger,
        storage,
        use_global: true,
        p2p_port: None,
    })
    .await
}
