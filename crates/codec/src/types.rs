use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Instant,
};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Defines an opaque 32-byte identifier.
///
/// All identifiers in the overlay (nodes, domains, asset groups, users,
/// transactions, resources) share the same shape but must never be mixed
/// up, so each gets its own newtype.
macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const SIZE: usize = 32;

            /// The reserved all-zeros identifier.
            pub const ZERO: Self = Self([0u8; Self::SIZE]);

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Parse from a raw byte slice, which must be exactly 32 bytes.
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                Some(Self(bytes.try_into().ok()?))
            }

            pub fn to_hex(&self) -> String {
                self.0.iter().map(|b| format!("{b:02x}")).collect()
            }

            pub fn from_hex(value: &str) -> Option<Self> {
                if value.len() != Self::SIZE * 2 {
                    return None;
                }

                let mut bytes = [0u8; Self::SIZE];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = u8::from_str_radix(value.get(i * 2..i * 2 + 2)?, 16).ok()?;
                }

                Some(Self(bytes))
            }

            /// First two bytes in hex, for log lines only.
            pub fn short_id(&self) -> String {
                format!("{:02x}{:02x}", self.0[0], self.0[1])
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.short_id())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.short_id())
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(value: [u8; 32]) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Identifier of a node in an overlay.
    NodeId
);

define_id!(
    /// Identifier of a logically isolated overlay.
    ///
    /// [`DomainId::GLOBAL`] (= [`DomainId::ZERO`]) denotes the optional
    /// global overlay used for cross-domain advertisement and cross
    /// reference dissemination.
    DomainId
);

define_id!(
    /// Application-level namespace inside a domain.
    AssetGroupId
);

define_id!(
    /// Identifier of an application user registered under an asset group.
    UserId
);

define_id!(
    /// Identifier of a transaction referenced by a cross-ref.
    TransactionId
);

define_id!(
    /// Identifier of a resource stored in the overlay.
    ResourceId
);

impl DomainId {
    /// The reserved global overlay.
    pub const GLOBAL: Self = Self::ZERO;
}

/// A message type on the wire: the first byte is the category, the second
/// the opcode inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MessageType {
    DomainPing = 0x0000,
    NotifyLeave = 0x0001,
    NotifyPeerlist = 0x0002,
    StartToRefresh = 0x0003,
    RequestPing = 0x0004,
    ResponsePing = 0x0005,

    // Only used in the global domain.
    NotifyCrossRef = 0x1000,
    AdvertiseAssetGroup = 0x1001,

    RequestStore = 0x4000,
    ResponseStore = 0x4001,
    ResponseStoreCopy = 0x4002,
    RequestFindUser = 0x4003,
    ResponseFindUser = 0x4004,
    RequestFindValue = 0x4005,
    ResponseFindValue = 0x4006,
    MessageToUser = 0x4007,
}

impl MessageType {
    /// Wire form: 2 bytes, category first.
    pub fn to_bytes(self) -> [u8; 2] {
        u16::from(self).to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 2] = bytes.try_into().ok()?;
        Self::try_from(u16::from_be_bytes(raw)).ok()
    }
}

/// Kind of a resource stored in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResourceKind {
    TransactionData = 0,
    AssetInfo = 1,
    AssetFile = 2,
}

/// Addressing and liveness information for one peer.
///
/// At least one of the two address families is known once the node has
/// been heard from. The wire form is
/// `node_id(32) || ipv4(4) || ipv6(16) || port(2 LE)`, with the all-zeros
/// sentinel standing in for an unknown family.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
    pub last_seen: Instant,
    pub is_alive: bool,
}

impl NodeInfo {
    /// Serialized size of one entry.
    pub const WIRE_SIZE: usize = 32 + 4 + 16 + 2;

    pub fn new(node_id: NodeId, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>, port: u16) -> Self {
        Self {
            node_id,
            ipv4,
            ipv6,
            port,
            last_seen: Instant::now(),
            is_alive: false,
        }
    }

    /// Replace the given fields, leaving the others untouched.
    pub fn update(&mut self, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>, port: u16) {
        if ipv4.is_some() {
            self.ipv4 = ipv4;
        }

        if ipv6.is_some() {
            self.ipv6 = ipv6;
        }

        self.port = port;
    }

    /// Mark the node as heard from right now.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.is_alive = true;
    }

    /// Preferred socket address, IPv4 first.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if let Some(ipv4) = self.ipv4 {
            return Some(SocketAddr::from((ipv4, self.port)));
        }

        self.ipv6.map(|ipv6| SocketAddr::from((ipv6, self.port)))
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut bytes = [0u8; Self::WIRE_SIZE];
        bytes[..32].copy_from_slice(self.node_id.as_bytes());
        bytes[32..36].copy_from_slice(&self.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED).octets());
        bytes[36..52].copy_from_slice(&self.ipv6.unwrap_or(Ipv6Addr::UNSPECIFIED).octets());
        bytes[52..54].copy_from_slice(&self.port.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }

        let ipv4 = Ipv4Addr::from(<[u8; 4]>::try_from(&bytes[32..36]).ok()?);
        let ipv6 = Ipv6Addr::from(<[u8; 16]>::try_from(&bytes[36..52]).ok()?);
        Some(Self {
            node_id: NodeId::from_bytes(&bytes[..32])?,
            ipv4: (!ipv4.is_unspecified()).then_some(ipv4),
            ipv6: (!ipv6.is_unspecified()).then_some(ipv6),
            port: u16::from_le_bytes(bytes[52..54].try_into().ok()?),
            last_seen: Instant::now(),
            is_alive: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_hex_round_trip() {
        let id = NodeId::from([0xab; 32]);
        assert_eq!(NodeId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(NodeId::from_hex("ab"), None);
        assert_eq!(id.short_id(), "abab");
    }

    #[test]
    fn message_type_wire_form() {
        assert_eq!(MessageType::NotifyCrossRef.to_bytes(), [0x10, 0x00]);
        assert_eq!(MessageType::MessageToUser.to_bytes(), [0x40, 0x07]);
        assert_eq!(
            MessageType::from_bytes(&[0x00, 0x04]),
            Some(MessageType::RequestPing)
        );
        assert_eq!(MessageType::from_bytes(&[0x77, 0x00]), None);
    }

    #[test]
    fn node_info_wire_round_trip() {
        let info = NodeInfo::new(
            NodeId::from([3u8; 32]),
            Some(Ipv4Addr::new(192, 0, 2, 7)),
            None,
            0x1234,
        );

        let bytes = info.to_bytes();
        assert_eq!(&bytes[52..54], &[0x34, 0x12]);

        let parsed = NodeInfo::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.node_id, info.node_id);
        assert_eq!(parsed.ipv4, info.ipv4);
        assert_eq!(parsed.ipv6, None);
        assert_eq!(parsed.port, info.port);
    }
}
