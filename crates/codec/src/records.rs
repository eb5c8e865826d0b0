//! Binary record blobs carried inside message bodies.
//!
//! The endianness here is part of the wire contract and intentionally
//! mixed: peer list counts and ports are little-endian, cross-ref counts
//! are big-endian.

use crate::{
    Error,
    types::{AssetGroupId, NodeInfo, TransactionId},
};

/// Serialize a peer list: `count(4 LE) || entries`.
///
/// The caller puts the node itself first, followed by every table entry.
pub fn encode_peer_list(entries: &[NodeInfo]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + entries.len() * NodeInfo::WIRE_SIZE);
    bytes.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        bytes.extend_from_slice(&entry.to_bytes());
    }

    bytes
}

/// Parse a peer list blob into its entries.
pub fn decode_peer_list(bytes: &[u8]) -> Result<Vec<NodeInfo>, Error> {
    if bytes.len() < 4 {
        return Err(Error::InvalidRecord);
    }

    let count = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut rest = &bytes[4..];
    for _ in 0..count {
        let entry = NodeInfo::from_bytes(rest).ok_or(Error::InvalidRecord)?;
        rest = &rest[NodeInfo::WIRE_SIZE..];
        entries.push(entry);
    }

    Ok(entries)
}

/// Serialize cross-refs: `count(2 BE) || { asset_group_id(32) || tx_id(32) }*`.
pub fn encode_cross_refs(refs: &[(AssetGroupId, TransactionId)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + refs.len() * 64);
    bytes.extend_from_slice(&(refs.len() as u16).to_be_bytes());
    for (asset_group_id, tx_id) in refs {
        bytes.extend_from_slice(asset_group_id.as_bytes());
        bytes.extend_from_slice(tx_id.as_bytes());
    }

    bytes
}

/// Parse a cross-ref blob.
pub fn decode_cross_refs(bytes: &[u8]) -> Result<Vec<(AssetGroupId, TransactionId)>, Error> {
    if bytes.len() < 2 {
        return Err(Error::InvalidRecord);
    }

    let count = u16::from_be_bytes(bytes[..2].try_into().unwrap()) as usize;
    let mut refs = Vec::with_capacity(count);
    let mut rest = &bytes[2..];
    for _ in 0..count {
        if rest.len() < 64 {
            return Err(Error::InvalidRecord);
        }

        refs.push((
            AssetGroupId::from_bytes(&rest[..32]).ok_or(Error::InvalidRecord)?,
            TransactionId::from_bytes(&rest[32..64]).ok_or(Error::InvalidRecord)?,
        ));
        rest = &rest[64..];
    }

    Ok(refs)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::types::NodeId;

    #[test]
    fn peer_list_round_trip() {
        let entries = vec![
            NodeInfo::new(
                NodeId::from([1u8; 32]),
                Some(Ipv4Addr::LOCALHOST),
                None,
                6641,
            ),
            NodeInfo::new(NodeId::from([2u8; 32]), None, None, 6642),
        ];

        let bytes = encode_peer_list(&entries);
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);

        let parsed = decode_peer_list(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].node_id, entries[0].node_id);
        assert_eq!(parsed[0].ipv4, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(parsed[1].ipv4, None);
    }

    #[test]
    fn truncated_peer_list_is_rejected() {
        let entries = vec![NodeInfo::new(NodeId::from([1u8; 32]), None, None, 1)];
        let mut bytes = encode_peer_list(&entries);
        bytes.truncate(bytes.len() - 1);

        assert!(decode_peer_list(&bytes).is_err());
    }

    #[test]
    fn cross_refs_count_is_big_endian() {
        let refs = vec![(AssetGroupId::from([5u8; 32]), TransactionId::from([6u8; 32]))];
        let bytes = encode_cross_refs(&refs);
        assert_eq!(&bytes[..2], &[0, 1]);
        assert_eq!(decode_cross_refs(&bytes).unwrap(), refs);
    }
}
