//! Encoder and decoder for PXP frames and messages.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameFlags};
use crate::message::{NodeAddress, Operation, Request, Response};
use bytes::{Bytes, BytesMut};

/// Encodes requests and responses into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request into a frame.
    ///
    /// The request's `meta.origin` is mirrored into the frame header so
    /// receivers can read the sender without parsing the payload, and NOTIFY
    /// requests are flagged one-way.
    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        let mut frame = Frame::from_json(request)?;
        if let Some(origin) = &request.meta.origin {
            frame = frame.with_origin(origin.as_str());
        }
        if request.op == Operation::Notify {
            let flags = frame.flags.with_one_way();
            frame = frame.with_flags(flags);
        }
        frame.encode()
    }

    /// Encodes a response into a frame.
    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::from_json(response)?;
        frame.encode()
    }

    /// Encodes any JSON-serializable value into a frame.
    pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::from_json(value)?;
        frame.encode()
    }

    /// Encodes a value into a one-way frame stamped with the sender address.
    pub fn encode_from<T: serde::Serialize>(
        value: &T,
        origin: &NodeAddress,
        flags: FrameFlags,
    ) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(value)?
            .with_origin(origin.as_str())
            .with_flags(flags.with_crc())
            .encode()
    }
}

/// Decodes frames into requests and responses.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next request from the buffer.
    ///
    /// A frame origin header fills `meta.origin` when the payload omits it.
    pub fn decode_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        let Some(frame) = self.decode_frame()? else {
            return Ok(None);
        };
        let mut request: Request = frame.json()?;
        if request.meta.origin.is_none() {
            request.meta.origin = frame.origin()?.map(NodeAddress::from);
        }
        Ok(Some(request))
    }

    /// Attempts to decode the next response from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(frame.json()?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Line-delimited JSON codec for debug mode.
pub mod jsonl {
    use super::*;

    /// Encodes a value as a JSON line (no framing).
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Line-delimited JSON decoder.
    pub struct LineDecoder {
        buffer: Vec<u8>,
    }

    impl LineDecoder {
        pub fn new() -> Self {
            Self {
                buffer: Vec::with_capacity(4096),
            }
        }

        pub fn extend(&mut self, data: &[u8]) {
            self.buffer.extend_from_slice(data);
        }

        /// Attempts to decode the next JSON line. Blank lines are skipped.
        pub fn decode_line<T: serde::de::DeserializeOwned>(
            &mut self,
        ) -> Result<Option<T>, ProtocolError> {
            while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
                let json = std::str::from_utf8(&line[..line.len() - 1])
                    .map_err(|_| ProtocolError::InvalidUtf8)?;
                if json.trim().is_empty() {
                    continue;
                }
                return Ok(Some(serde_json::from_str(json)?));
            }
            Ok(None)
        }
    }

    impl Default for LineDecoder {
        fn default() -> Self {
            Self::new()
        }
    }
}
