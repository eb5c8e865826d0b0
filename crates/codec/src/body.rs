use num_enum::{IntoPrimitive, TryFromPrimitive};
use rmpv::Value;

use crate::{
    Error,
    types::{DomainId, MessageType, NodeId},
};

/// Keys of the typed message body.
///
/// The body of a MsgPack envelope is a map keyed by these small integers.
/// Unknown keys received from other nodes are preserved but never acted
/// upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum KeyType {
    Command = 0,
    QueryId = 1,

    DomainId = 8,
    SourceNodeId = 9,
    DestinationNodeId = 10,
    NodeId = 11,
    P2pMsgType = 12,
    DomainPing = 13,
    Nonce = 14,
    Message = 15,
    PeerList = 16,
    CrossRefs = 17,
    AssetGroupId = 18,
    ResourceId = 19,
    Resource = 20,
    ResourceType = 21,
}

/// A MsgPack message body: an ordered map from integer keys to values.
///
/// Insertion order is preserved so that an encode of a decoded body
/// reproduces the original bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    entries: Vec<(u8, Value)>,
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value under the given key.
    pub fn insert(&mut self, key: KeyType, value: Value) -> &mut Self {
        self.insert_raw(u8::from(key), value)
    }

    fn insert_raw(&mut self, key: u8, value: Value) -> &mut Self {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }

        self
    }

    pub fn get(&self, key: KeyType) -> Option<&Value> {
        let key = u8::from(key);
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: KeyType) -> bool {
        self.get(key).is_some()
    }

    pub fn bytes(&self, key: KeyType) -> Option<&[u8]> {
        self.get(key)?.as_slice()
    }

    pub fn uint(&self, key: KeyType) -> Option<u64> {
        self.get(key)?.as_u64()
    }

    pub fn put_bytes(&mut self, key: KeyType, value: impl Into<Vec<u8>>) -> &mut Self {
        self.insert(key, Value::Binary(value.into()))
    }

    pub fn put_uint(&mut self, key: KeyType, value: u64) -> &mut Self {
        self.insert(key, Value::from(value))
    }

    /// Typed accessor for 32-byte identifier values.
    pub fn id<T: From<[u8; 32]>>(&self, key: KeyType) -> Option<T> {
        let raw: [u8; 32] = self.bytes(key)?.try_into().ok()?;
        Some(T::from(raw))
    }

    pub fn source_node_id(&self) -> Option<NodeId> {
        self.id(KeyType::SourceNodeId)
    }

    pub fn destination_node_id(&self) -> Option<NodeId> {
        self.id(KeyType::DestinationNodeId)
    }

    pub fn domain_id(&self) -> Option<DomainId> {
        self.id(KeyType::DomainId)
    }

    pub fn msg_type(&self) -> Option<MessageType> {
        MessageType::from_bytes(self.bytes(KeyType::P2pMsgType)?)
    }

    pub fn nonce(&self) -> Option<[u8; 16]> {
        self.bytes(KeyType::Nonce)?.try_into().ok()
    }

    /// Serialize as a MsgPack map with integer keys.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let map = Value::Map(
            self.entries
                .iter()
                .map(|(k, v)| (Value::from(*k), v.clone()))
                .collect(),
        );

        let mut buffer = Vec::with_capacity(64);
        rmpv::encode::write_value(&mut buffer, &map).map_err(|_| Error::InvalidBody)?;
        Ok(buffer)
    }

    /// Parse a MsgPack map with integer keys.
    ///
    /// Entries whose key is not a small integer are rejected; values are
    /// kept as-is, whether the key is recognized or not.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        let value = rmpv::decode::read_value(&mut bytes).map_err(|_| Error::InvalidBody)?;
        let Value::Map(pairs) = value else {
            return Err(Error::InvalidBody);
        };

        let mut body = Self::new();
        for (key, value) in pairs {
            let key = key
                .as_u64()
                .and_then(|k| u8::try_from(k).ok())
                .ok_or(Error::InvalidBody)?;
            body.insert_raw(key, value);
        }

        Ok(body)
    }
}
