// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message header and transmit frames.
//!
//! # Wire Format
//!
//! Base header, used as is on direct sockets:
//!
//! ```text
//! +-----------+-----------+-----------+-----------+--------------+
//! | magic 4B  | type 4B   | seq 4B    | sender 4B | payload 4B   |
//! +-----------+-----------+-----------+-----------+--------------+
//! ```
//!
//! Indirect (control-plane) messages prepend an envelope:
//!
//! ```text
//! +----------------+-------------+-------------+---------+
//! | total len 4B   | rport 2B    | base header | payload |
//! +----------------+-------------+-------------+---------+
//! ```
//!
//! `total len` counts every byte of the indirect message including itself.
//! `rport` is non-zero only while the sender advertises its direct listener.
//! All integers are big-endian.

use std::borrow::Cow;
use std::sync::Arc;

use crate::context::NodeId;
use crate::error::{Error, Result};

/// Header magic ("TFNC").
pub const HEADER_MAGIC: u32 = 0x5446_4E43;

/// Size of the base header.
pub const BASE_HEADER_SIZE: usize = 20;

/// Size of the indirect envelope (outer length + reverse port).
pub const ENVELOPE_SIZE: usize = 6;

/// Largest header any transport prepends; reserved at the front of every buffer.
pub const MAX_HEADER_SIZE: usize = ENVELOPE_SIZE + BASE_HEADER_SIZE;

/// Message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    /// Contribution travelling to the parent
    FanIn = 1,
    /// Aggregate travelling to the children
    FanOut = 2,
    /// Direct modex exchange (recognised, not served)
    DirectModex = 3,
    /// First frame on a freshly dialled direct socket
    DirectHello = 4,
}

impl MsgType {
    /// Decode the wire value.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(MsgType::FanIn),
            2 => Some(MsgType::FanOut),
            3 => Some(MsgType::DirectModex),
            4 => Some(MsgType::DirectHello),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            MsgType::FanIn => "FAN-IN",
            MsgType::FanOut => "FAN-OUT",
            MsgType::DirectModex => "DIRECT-MODEX",
            MsgType::DirectHello => "DIRECT-HELLO",
        }
    }
}

/// Decoded base header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type
    pub msg_type: MsgType,
    /// Generation the message belongs to
    pub seq: u32,
    /// Sending node
    pub sender: NodeId,
    /// Bytes following the header
    pub payload_size: u32,
}

impl MessageHeader {
    /// Build a header.
    pub fn new(msg_type: MsgType, seq: u32, sender: NodeId, payload_size: u32) -> Self {
        Self {
            msg_type,
            seq,
            sender,
            payload_size,
        }
    }

    /// Write the header into the first [`BASE_HEADER_SIZE`] bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&HEADER_MAGIC.to_be_bytes());
        out[4..8].copy_from_slice(&(self.msg_type as u32).to_be_bytes());
        out[8..12].copy_from_slice(&self.seq.to_be_bytes());
        out[12..16].copy_from_slice(&self.sender.0.to_be_bytes());
        out[16..20].copy_from_slice(&self.payload_size.to_be_bytes());
    }

    /// Encode to an owned array.
    pub fn to_bytes(&self) -> [u8; BASE_HEADER_SIZE] {
        let mut out = [0u8; BASE_HEADER_SIZE];
        self.encode_into(&mut out);
        out
    }

    /// Parse a base header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BASE_HEADER_SIZE {
            return Err(Error::Codec(format!(
                "header truncated: {} bytes",
                bytes.len()
            )));
        }
        let magic = read_u32(bytes, 0);
        if magic != HEADER_MAGIC {
            return Err(Error::Codec(format!("bad magic 0x{:08x}", magic)));
        }
        let raw_type = read_u32(bytes, 4);
        let msg_type = MsgType::from_u32(raw_type).ok_or(Error::UnsupportedMessage(raw_type))?;
        Ok(Self {
            msg_type,
            seq: read_u32(bytes, 8),
            sender: NodeId(read_u32(bytes, 12)),
            payload_size: read_u32(bytes, 16),
        })
    }
}

/// Decoded indirect message.
#[derive(Debug)]
pub struct IndirectMessage<'a> {
    /// Advertised direct listener port (0 when none)
    pub rport: u16,
    /// Base header
    pub header: MessageHeader,
    /// Payload (preamble + data)
    pub payload: &'a [u8],
}

/// Parse a full control-plane message.
pub fn decode_indirect(bytes: &[u8]) -> Result<IndirectMessage<'_>> {
    if bytes.len() < MAX_HEADER_SIZE {
        return Err(Error::Codec(format!(
            "indirect message truncated: {} bytes",
            bytes.len()
        )));
    }
    let total = read_u32(bytes, 0) as usize;
    if total != bytes.len() {
        return Err(Error::Codec(format!(
            "indirect length mismatch: header says {}, got {}",
            total,
            bytes.len()
        )));
    }
    let rport = u16::from_be_bytes([bytes[4], bytes[5]]);
    let header = MessageHeader::decode(&bytes[ENVELOPE_SIZE..])?;
    let payload = &bytes[MAX_HEADER_SIZE..];
    if payload.len() != header.payload_size as usize {
        return Err(Error::Codec(format!(
            "payload size mismatch: header says {}, got {}",
            header.payload_size,
            payload.len()
        )));
    }
    Ok(IndirectMessage {
        rport,
        header,
        payload,
    })
}

/// Stamped, immutable message ready for either transport.
///
/// Holds `[envelope][base header][payload]` with a zero reverse port; the
/// direct view skips the envelope. The storage is the stamped buffer itself,
/// shared between transports and handed back by [`Frame::into_vec`].
#[derive(Clone, Debug)]
pub struct Frame {
    bytes: Arc<Vec<u8>>,
}

impl Frame {
    /// Stamp `header` into the reserved front of `buf` and freeze it.
    ///
    /// `buf` must start with [`MAX_HEADER_SIZE`] reserved bytes followed by
    /// exactly `header.payload_size` payload bytes.
    pub fn stamp(mut buf: Vec<u8>, header: &MessageHeader) -> Self {
        let total = buf.len() as u32;
        buf[0..4].copy_from_slice(&total.to_be_bytes());
        buf[4..6].copy_from_slice(&0u16.to_be_bytes());
        header.encode_into(&mut buf[ENVELOPE_SIZE..MAX_HEADER_SIZE]);
        Self {
            bytes: Arc::new(buf),
        }
    }

    /// Build a frame from a header and a separate payload.
    pub fn build(header: &MessageHeader, payload: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(MAX_HEADER_SIZE + payload.len());
        buf.resize(MAX_HEADER_SIZE, 0);
        buf.extend_from_slice(payload);
        Self::stamp(buf, header)
    }

    /// Header-only frame (no payload), e.g. DIRECT-HELLO.
    pub fn header_only(msg_type: MsgType, seq: u32, sender: NodeId) -> Self {
        Self::build(&MessageHeader::new(msg_type, seq, sender, 0), &[])
    }

    /// Take the storage back when no other clone is alive.
    pub fn into_vec(self) -> core::result::Result<Vec<u8>, Frame> {
        Arc::try_unwrap(self.bytes).map_err(|bytes| Frame { bytes })
    }

    /// Whole stamped buffer, reserved region included.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Bytes for a direct socket: base header and payload.
    pub fn direct_bytes(&self) -> &[u8] {
        &self.bytes[ENVELOPE_SIZE..]
    }

    /// Bytes for the control plane, with `rport` advertised.
    pub fn indirect_bytes(&self, rport: u16) -> Cow<'_, [u8]> {
        if rport == 0 {
            return Cow::Borrowed(self.bytes.as_slice());
        }
        let mut owned = self.bytes.to_vec();
        owned[4..6].copy_from_slice(&rport.to_be_bytes());
        Cow::Owned(owned)
    }

    /// Decoded header.
    pub fn header(&self) -> Result<MessageHeader> {
        MessageHeader::decode(self.direct_bytes())
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[MAX_HEADER_SIZE..]
    }

    /// Length of the indirect encoding.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.bytes.len() == MAX_HEADER_SIZE
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let hdr = MessageHeader::new(MsgType::FanOut, 7, NodeId(3), 5);
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[0..4], &[0x54, 0x46, 0x4E, 0x43]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 7]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 3]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 5]);
        assert_eq!(MessageHeader::decode(&bytes).expect("decode"), hdr);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = MessageHeader::new(MsgType::FanIn, 0, NodeId(0), 0).to_bytes();
        bytes[0] = 0;
        assert!(matches!(MessageHeader::decode(&bytes), Err(Error::Codec(_))));
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let mut bytes = MessageHeader::new(MsgType::FanIn, 0, NodeId(0), 0).to_bytes();
        bytes[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(
            MessageHeader::decode(&bytes),
            Err(Error::UnsupportedMessage(99))
        ));
    }

    #[test]
    fn test_indirect_envelope_carries_rport() {
        let frame = Frame::build(&MessageHeader::new(MsgType::FanIn, 1, NodeId(2), 3), b"abc");
        let wire = frame.indirect_bytes(40123);
        let msg = decode_indirect(&wire).expect("decode");
        assert_eq!(msg.rport, 40123);
        assert_eq!(msg.header.sender, NodeId(2));
        assert_eq!(msg.payload, b"abc");

        let plain = frame.indirect_bytes(0);
        assert!(matches!(plain, Cow::Borrowed(_)));
        assert_eq!(decode_indirect(&plain).expect("decode").rport, 0);
    }

    #[test]
    fn test_direct_view_skips_envelope() {
        let frame = Frame::build(&MessageHeader::new(MsgType::FanOut, 4, NodeId(1), 2), b"xy");
        assert_eq!(frame.direct_bytes().len(), BASE_HEADER_SIZE + 2);
        assert_eq!(frame.header().expect("header").seq, 4);
        assert_eq!(frame.payload(), b"xy");
    }

    #[test]
    fn test_truncated_indirect_rejected() {
        let frame = Frame::build(&MessageHeader::new(MsgType::FanIn, 1, NodeId(2), 3), b"abc");
        let wire = frame.indirect_bytes(0);
        assert!(decode_indirect(&wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn test_frame_storage_returned_once_unshared() {
        let frame = Frame::build(&MessageHeader::new(MsgType::FanIn, 1, NodeId(2), 3), b"abc");
        let ptr = frame.as_bytes().as_ptr();
        let queued = frame.clone();

        let frame = frame.into_vec().expect_err("still shared with the send queue");
        drop(queued);
        let storage = frame.into_vec().expect("sole owner");
        assert_eq!(storage.as_ptr(), ptr, "same allocation, no copy");
        assert_eq!(&storage[MAX_HEADER_SIZE..], b"abc");
    }
}
