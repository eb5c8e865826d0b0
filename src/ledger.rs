//! Contracts of the external collaborators.
//!
//! The networking core never persists transactions or talks to
//! applications itself; it hands both off through these traits. The node
//! binary wires in the real implementations, tests use recording mocks.

use serde::{Deserialize, Serialize};

use codec::types::{AssetGroupId, DomainId, TransactionId, UserId};

/// Outcome codes surfaced to application users through the reply channel.
pub const ESUCCESS: i32 = 0;
pub const ENODESTINATION: i32 = -2;
pub const ENORESOURCE: i32 = -3;

/// How an asset group's resources are persisted.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    None,
    Filesystem,
}

/// A structured error reply towards the user that issued a request.
///
/// `command` and `query_id` mirror the original request so the caller can
/// correlate the failure.
#[derive(Debug, Clone)]
pub struct ErrorReply {
    pub command: Option<u64>,
    pub query_id: Option<Vec<u8>>,
    pub asset_group_id: AssetGroupId,
    pub destination_user_id: UserId,
}

/// The ledger side of the node: local delivery, error replies and
/// cross-ref bookkeeping.
pub trait LedgerCore: Send + Sync {
    /// Hand an application message to a locally connected user.
    fn deliver_to_user(&self, message: &[u8]);

    /// Send a structured error back on the existing reply channel.
    fn reply_error(&self, reply: ErrorReply, code: i32, text: &str);

    /// Record a cross-ref received from (or kept out of) the global
    /// overlay.
    fn record_cross_ref(&self, asset_group_id: AssetGroupId, tx_id: TransactionId);
}

/// Storage bootstrap: invoked once per configured asset group at startup.
pub trait AssetStorage: Send + Sync {
    fn setup_asset_group(
        &self,
        domain_id: DomainId,
        asset_group_id: AssetGroupId,
        storage: StorageKind,
        path: Option<&str>,
        advertise: bool,
    );
}
