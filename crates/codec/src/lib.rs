//! Typed envelope codec for the overlay wire protocol.
//!
//! Every message, whether carried in a datagram or on a stream, is a
//! length-prefixed frame:
//!
//! ```text
//! magic(2) = 0x50 0x4D || payload_type(2 LE) || length(4 LE) || body
//! ```
//!
//! The body of a MsgPack frame is a map keyed by the small [`KeyType`]
//! enumeration; a Binary frame is an opaque blob passed through. The
//! same [`Decoder`] serves both transports: streams feed it arbitrary
//! chunks and partial frames stay buffered, datagram loops drain every
//! complete frame out of one datagram and then [`Decoder::reset`] the
//! residue.

pub mod body;
pub mod records;
pub mod types;

pub use self::body::{Body, KeyType};
pub use rmpv;

use bytes::{Buf, Bytes, BytesMut};

/// Leading bytes of every frame.
pub const MAGIC: [u8; 2] = [0x50, 0x4D];

/// Frame header size: magic + payload type + body length.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single body, to keep a malformed length prefix from
/// ballooning the receive buffer.
pub const MAX_BODY_SIZE: usize = 1 << 22;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    BadMagic,
    OversizedFrame,
    InvalidBody,
    InvalidRecord,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Serialization format of a frame body.
///
/// Values other than the two known formats are carried through so the
/// caller can decide what to do with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    MsgPack,
    Binary,
    Other(u16),
}

impl From<u16> for PayloadType {
    fn from(value: u16) -> Self {
        match value {
            1 => Self::MsgPack,
            2 => Self::Binary,
            other => Self::Other(other),
        }
    }
}

impl From<PayloadType> for u16 {
    fn from(value: PayloadType) -> Self {
        match value {
            PayloadType::MsgPack => 1,
            PayloadType::Binary => 2,
            PayloadType::Other(other) => other,
        }
    }
}

/// One decoded frame: the payload type and the raw body bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload_type: PayloadType,
    pub body: Bytes,
}

impl Envelope {
    /// Build a MsgPack envelope from a typed body.
    pub fn msgpack(body: &Body) -> Result<Self, Error> {
        Ok(Self {
            payload_type: PayloadType::MsgPack,
            body: body.encode()?.into(),
        })
    }

    /// Parse the body as a typed MsgPack map.
    pub fn body_map(&self) -> Result<Body, Error> {
        Body::decode(&self.body)
    }

    /// Serialize the whole frame, header included.
    ///
    /// # Test
    ///
    /// ```
    /// use mesh_node_codec::{Body, Envelope, KeyType};
    ///
    /// let mut body = Body::new();
    /// body.put_uint(KeyType::DomainPing, 0);
    ///
    /// let frame = Envelope::msgpack(&body).unwrap().to_bytes();
    ///
    /// assert_eq!(&frame[..2], &[0x50, 0x4D]);
    /// assert_eq!(&frame[2..4], &[1, 0]);
    /// assert_eq!(frame.len() - 8, frame[4] as usize);
    /// ```
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&u16::from(self.payload_type).to_le_bytes());
        bytes.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.body);
        bytes.freeze()
    }
}

/// Incremental frame decoder.
///
/// # Test
///
/// ```
/// use mesh_node_codec::{Body, Decoder, Envelope, KeyType};
///
/// let mut body = Body::new();
/// body.put_uint(KeyType::Command, 7);
/// let frame = Envelope::msgpack(&body).unwrap().to_bytes();
///
/// // Feed the frame one byte at a time, as a stream might deliver it.
/// let mut decoder = Decoder::default();
/// let mut frames = 0;
/// for byte in frame.iter() {
///     decoder.feed(&[*byte]);
///     while let Some(envelope) = decoder.next().unwrap() {
///         assert_eq!(envelope.body_map().unwrap(), body);
///         frames += 1;
///     }
/// }
///
/// assert_eq!(frames, 1);
/// ```
#[derive(Default)]
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if any.
    ///
    /// A header that cannot belong to a valid frame poisons the whole
    /// buffer: the buffered bytes are dropped and an error is returned,
    /// but the decoder stays usable for subsequent input.
    pub fn next(&mut self) -> Result<Option<Envelope>, Error> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        if self.buffer[..2] != MAGIC {
            self.buffer.clear();
            return Err(Error::BadMagic);
        }

        let payload_type = u16::from_le_bytes(self.buffer[2..4].try_into().unwrap());
        let length = u32::from_le_bytes(self.buffer[4..8].try_into().unwrap()) as usize;
        if length > MAX_BODY_SIZE {
            self.buffer.clear();
            return Err(Error::OversizedFrame);
        }

        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(HEADER_SIZE + length);
        frame.advance(HEADER_SIZE);
        Ok(Some(Envelope {
            payload_type: PayloadType::from(payload_type),
            body: frame.freeze(),
        }))
    }

    /// Discard any buffered partial frame.
    ///
    /// Datagram receivers call this after draining a datagram: a partial
    /// frame can never be completed by the next datagram.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_body() -> Body {
        let mut body = Body::new();
        body.put_bytes(KeyType::DomainId, vec![1u8; 32])
            .put_bytes(
                KeyType::P2pMsgType,
                types::MessageType::RequestPing.to_bytes(),
            )
            .put_bytes(KeyType::Nonce, vec![2u8; 16]);
        body
    }

    #[test]
    fn two_frames_in_one_datagram() {
        let frame = Envelope::msgpack(&ping_body()).unwrap().to_bytes();
        let mut datagram = frame.to_vec();
        datagram.extend_from_slice(&frame);

        let mut decoder = Decoder::default();
        decoder.feed(&datagram);
        assert!(decoder.next().unwrap().is_some());
        assert!(decoder.next().unwrap().is_some());
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn reset_discards_partial_frame() {
        let frame = Envelope::msgpack(&ping_body()).unwrap().to_bytes();

        let mut decoder = Decoder::default();
        decoder.feed(&frame[..frame.len() - 3]);
        assert!(decoder.next().unwrap().is_none());
        decoder.reset();

        decoder.feed(&frame);
        let envelope = decoder.next().unwrap().unwrap();
        assert_eq!(envelope.payload_type, PayloadType::MsgPack);
        assert_eq!(envelope.body_map().unwrap(), ping_body());
    }

    #[test]
    fn bad_magic_is_reported_once() {
        let mut decoder = Decoder::default();
        decoder.feed(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]);
        assert_eq!(decoder.next(), Err(Error::BadMagic));
        assert_eq!(decoder.next(), Ok(None));
    }

    #[test]
    fn unknown_payload_type_is_returned() {
        let envelope = Envelope {
            payload_type: PayloadType::Other(9),
            body: Bytes::from_static(b"blob"),
        };

        let mut decoder = Decoder::default();
        decoder.feed(&envelope.to_bytes());
        assert_eq!(decoder.next().unwrap().unwrap(), envelope);
    }

    #[test]
    fn binary_body_passes_through() {
        let envelope = Envelope {
            payload_type: PayloadType::Binary,
            body: Bytes::from(vec![0u8; 2048]),
        };

        let mut decoder = Decoder::default();
        let frame = envelope.to_bytes();
        decoder.feed(&frame[..100]);
        assert!(decoder.next().unwrap().is_none());
        decoder.feed(&frame[100..]);
        assert_eq!(decoder.next().unwrap().unwrap(), envelope);
    }
}
