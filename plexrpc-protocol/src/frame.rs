//! Binary frame format for PXP.
//!
//! Every transport that moves bytes (socket, queue, cluster group) carries the
//! same frame. The header extension holds the sender's node address, which is
//! how capability responses are correlated without a request token.
//!
//! ```text
//! +--------+---------+--------+------------+-------------+--------+
//! | magic  | version | flags  | origin_len | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |  2 bytes   |   4 bytes   | 4 bytes|
//! +--------+---------+--------+------------+-------------+--------+
//! | [origin]     | payload                                        |
//! | origin_len   | payload_len bytes                              |
//! +--------------+------------------------------------------------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying PXP frames: "PLXR"
pub const MAGIC: [u8; 4] = *b"PLXR";

/// Size of the fixed frame header in bytes (4+2+2+2+4+4 = 18).
pub const FRAME_HEADER_SIZE: usize = 18;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// Sender does not expect a reply.
    pub const ONE_WAY: u16 = 1 << 1;
    /// Frame travelled over the cluster group transport.
    pub const CLUSTER: u16 = 1 << 2;

    const VALID_V1_MASK: u16 = 0x0007;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn with_one_way(mut self) -> Self {
        self.0 |= Self::ONE_WAY;
        self
    }

    pub fn with_cluster(mut self) -> Self {
        self.0 |= Self::CLUSTER;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn is_one_way(&self) -> bool {
        self.0 & Self::ONE_WAY != 0
    }

    pub fn is_cluster(&self) -> bool {
        self.0 & Self::CLUSTER != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed PXP frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    /// Sender node address (UTF-8), empty when not supplied.
    pub origin: Bytes,
    /// JSON payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            origin: Bytes::new(),
            payload,
        }
    }

    /// Creates a new frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(payload)))
    }

    /// Attaches the sender's node address as out-of-band metadata.
    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Bytes::copy_from_slice(origin.as_bytes());
        self
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns the sender's node address, if present.
    pub fn origin(&self) -> Result<Option<&str>, ProtocolError> {
        if self.origin.is_empty() {
            return Ok(None);
        }
        std::str::from_utf8(&self.origin)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Deserializes the payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let payload = std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(payload)?)
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len() as u32;
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if self.origin.len() > u16::MAX as usize {
            return Err(ProtocolError::OriginTooLong(self.origin.len()));
        }

        let origin_len = self.origin.len() as u16;
        let total_size = FRAME_HEADER_SIZE + self.origin.len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(total_size);

        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u16(origin_len);
        buf.put_u32(payload_len);

        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);

        buf.put_slice(&self.origin);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from bytes.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;
        let origin_len = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        let payload_len = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]) as usize;

        if payload_len > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len as u32,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let crc_expected = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);

        if buf.len() < FRAME_HEADER_SIZE + origin_len + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let origin = buf.split_to(origin_len).freeze();
        let payload = buf.split_to(payload_len).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            origin,
            payload,
        }))
    }
}
