use std::sync::Arc;

use codec::{Body, KeyType, PayloadType, types::{AssetGroupId, MessageType, UserId}};
use ticker::{Query, QueryData, QueryEntry, Ticker};

use crate::{
    DURATION_GIVEUP_PUT, INTERVAL_RETRY, ROUTE_RETRY_COUNT,
    domain::Domain,
    ledger::{ENODESTINATION, ErrorReply, LedgerCore},
};

/// Routes user-addressed application messages.
///
/// A destination registered on this node is delivered straight to the
/// ledger. Anything else becomes a query: the overlay lookup runs as the
/// retry hook, a discovered next hop triggers exactly one forwarded
/// MESSAGE_TO_USER, and exhaustion surfaces as a structured error on the
/// caller's reply channel.
pub struct Router {
    ticker: Ticker,
    ledger: Arc<dyn LedgerCore>,
}

impl Router {
    pub fn new(ticker: Ticker, ledger: Arc<dyn LedgerCore>) -> Self {
        Self { ticker, ledger }
    }

    pub fn route_message(
        &self,
        domain: &Arc<Domain>,
        asset_group_id: AssetGroupId,
        source_user_id: UserId,
        destination_user_id: UserId,
        message: Vec<u8>,
        payload_type: PayloadType,
    ) -> bool {
        log::debug!(
            "[{}] route_message: dst_user={destination_user_id}",
            domain.node_id
        );

        if domain.is_registered_user(&asset_group_id, &destination_user_id) {
            log::debug!("[{}] route_message: destination is local", domain.node_id);
            self.ledger.deliver_to_user(&message);
            return true;
        }

        let nonce = self.ticker.insert(
            Query::new(
                QueryData::Route {
                    domain_id: domain.domain_id,
                    asset_group_id,
                    source_user_id,
                    destination_user_id,
                    payload_type,
                    message,
                    peer: None,
                },
                DURATION_GIVEUP_PUT,
            )
            .interval(INTERVAL_RETRY)
            .retries(ROUTE_RETRY_COUNT)
            .on_retry({
                let domain = domain.clone();
                move |entry| domain.overlay().send_p2p_message(&domain, entry)
            })
            .on_success({
                let domain = domain.clone();
                let ledger = self.ledger.clone();
                move |entry| forward_once(&domain, &ledger, entry)
            })
            .on_expire({
                let ledger = self.ledger.clone();
                move |entry| route_failure(&ledger, entry)
            }),
        );

        self.ticker.kick(&nonce);
        true
    }
}

/// The lookup found a next hop (or concluded the user is local after
/// all): send the one forwarded hop, or deliver.
fn forward_once(domain: &Arc<Domain>, ledger: &Arc<dyn LedgerCore>, entry: &mut QueryEntry) {
    let QueryData::Route { message, peer, .. } = &entry.data else {
        return;
    };

    let Some(peer) = peer else {
        log::debug!("[{}] forward_message: deliver to local app", domain.node_id);
        ledger.deliver_to_user(message);
        return;
    };

    log::debug!(
        "[{}] forward_message: next_hop={}",
        domain.node_id,
        peer.node_id
    );

    let mut body = domain.make_message(Some(peer.node_id), None, MessageType::MessageToUser);
    body.put_bytes(KeyType::Message, message.clone());
    domain.transport().send_body(peer, &body);
}

/// Nobody claimed the destination before the deadline: synthesize an
/// error reply that mirrors the original request's correlation fields.
fn route_failure(ledger: &Arc<dyn LedgerCore>, entry: &mut QueryEntry) {
    let QueryData::Route {
        asset_group_id,
        source_user_id,
        message,
        ..
    } = &entry.data
    else {
        return;
    };

    let (command, query_id) = match Body::decode(message) {
        Ok(original) => (
            original.get(KeyType::Command).and_then(|value| value.as_u64()),
            original.bytes(KeyType::QueryId).map(|id| id.to_vec()),
        ),
        Err(_) => (None, None),
    };

    ledger.reply_error(
        ErrorReply {
            command,
            query_id,
            asset_group_id: *asset_group_id,
            destination_user_id: *source_user_id,
        },
        ENODESTINATION,
        "cannot find core node",
    );
}
