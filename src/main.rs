#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use mesh_node::{
    codec::types::{AssetGroupId, DomainId, TransactionId},
    config::Config,
    ledger::{AssetStorage, ErrorReply, LedgerCore, StorageKind},
};

/// Ledger stand-in for running the networking core on its own: every
/// hand-off is logged and dropped.
struct StandaloneLedger;

impl LedgerCore for StandaloneLedger {
    fn deliver_to_user(&self, message: &[u8]) {
        log::info!("message to local user: size={}", message.len());
    }

    fn reply_error(&self, reply: ErrorReply, code: i32, text: &str) {
        log::warn!(
            "error reply to user {}: code={code}, text={text}",
            reply.destination_user_id
        );
    }

    fn record_cross_ref(&self, asset_group_id: AssetGroupId, tx_id: TransactionId) {
        log::info!("cross-ref recorded: asset_group={asset_group_id}, tx={tx_id}");
    }
}

impl AssetStorage for StandaloneLedger {
    fn setup_asset_group(
        &self,
        domain_id: DomainId,
        asset_group_id: AssetGroupId,
        storage: StorageKind,
        _path: Option<&str>,
        _advertise: bool,
    ) {
        log::info!(
            "asset group set up: domain={domain_id}, asset_group={asset_group_id}, storage={storage:?}"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, path) = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let collaborators = Arc::new(StandaloneLedger);
    let _hub = mesh_node::startup(config, Some(path), collaborators.clone(), collaborators).await?;

    // The node serves from its background workers; hold the process
    // (and the hub they answer to) open.
    std::future::pending::<()>().await;
    Ok(())
}
