// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Contribution buffers and the participant-set preamble.
//!
//! Layout of a buffer:
//!
//! ```text
//! +---------------------------+-----------+-------------------+
//! | reserved MAX_HEADER_SIZE  | preamble  | contribution data |
//! +---------------------------+-----------+-------------------+
//! ```
//!
//! The reserved region is overwritten with the transport headers right
//! before transmission, so a payload is never moved to make room for them.
//!
//! Preamble encoding (big-endian):
//!
//! ```text
//! coll_type u32 | nprocs u32 | nprocs x (ns_len u32 | ns bytes | rank u32)
//! ```

use super::types::{CollKey, CollType, ParticipantSet, ProcId};
use crate::context::NodeId;
use crate::error::{Error, Result};
use crate::protocol::{Frame, MessageHeader, MsgType, MAX_HEADER_SIZE};

/// Encode the preamble identifying `key`.
pub fn encode_preamble(key: &CollKey, out: &mut Vec<u8>) {
    out.extend_from_slice(&(key.coll_type as u32).to_be_bytes());
    out.extend_from_slice(&(key.participants.len() as u32).to_be_bytes());
    for proc in key.participants.iter() {
        out.extend_from_slice(&(proc.namespace.len() as u32).to_be_bytes());
        out.extend_from_slice(proc.namespace.as_bytes());
        out.extend_from_slice(&proc.rank.to_be_bytes());
    }
}

/// Decode a preamble from the front of `bytes`.
///
/// Returns the key and the number of bytes consumed.
pub fn decode_preamble(bytes: &[u8]) -> Result<(CollKey, usize)> {
    let mut cur = Cursor { bytes, pos: 0 };
    let raw_type = cur.u32()?;
    let coll_type = CollType::from_u32(raw_type)
        .ok_or_else(|| Error::Codec(format!("unknown collective type {}", raw_type)))?;
    let nprocs = cur.u32()? as usize;
    // Each entry needs at least 8 bytes; reject counts the buffer cannot hold.
    if nprocs > cur.remaining() / 8 {
        return Err(Error::Codec(format!("preamble claims {} procs", nprocs)));
    }
    let mut procs = Vec::with_capacity(nprocs);
    for _ in 0..nprocs {
        let ns_len = cur.u32()? as usize;
        let ns = cur.take(ns_len)?;
        let namespace = std::str::from_utf8(ns)
            .map_err(|_| Error::Codec("namespace is not UTF-8".into()))?
            .to_string();
        let rank = cur.u32()?;
        procs.push(ProcId { namespace, rank });
    }
    Ok((
        CollKey {
            coll_type,
            participants: ParticipantSet::new(procs),
        },
        cur.pos,
    ))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::Codec(format!(
                "preamble truncated at offset {}",
                self.pos
            )));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Growable payload buffer with a reserved header region.
///
/// [`stamp`](Self::stamp) moves the storage into the returned [`Frame`]
/// without copying; the buffer reads through that frame until the next
/// [`reset`](Self::reset), which takes the allocation back if no transport
/// still holds it.
#[derive(Debug, Clone)]
pub struct ContributionBuffer {
    buf: Vec<u8>,
    frozen: Option<Frame>,
    preamble: Vec<u8>,
}

impl ContributionBuffer {
    /// Empty buffer holding only the preamble for `key`.
    pub fn new(key: &CollKey) -> Self {
        let mut preamble = Vec::new();
        encode_preamble(key, &mut preamble);
        let mut buf = Vec::with_capacity(MAX_HEADER_SIZE + preamble.len());
        buf.resize(MAX_HEADER_SIZE, 0);
        buf.extend_from_slice(&preamble);
        Self {
            buf,
            frozen: None,
            preamble,
        }
    }

    /// Drop all contribution data, keeping capacity when the storage is free.
    pub fn reset(&mut self) {
        if let Some(frame) = self.frozen.take() {
            self.buf = frame.into_vec().unwrap_or_default();
        }
        self.buf.clear();
        self.buf.resize(MAX_HEADER_SIZE, 0);
        self.buf.extend_from_slice(&self.preamble);
    }

    /// Grow capacity for `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.thaw();
        self.buf.reserve(additional);
    }

    /// Append contribution bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.thaw();
        self.buf.extend_from_slice(bytes);
    }

    /// Contribution data (after the preamble).
    pub fn data(&self) -> &[u8] {
        &self.as_bytes()[MAX_HEADER_SIZE + self.preamble.len()..]
    }

    /// Length of the contribution data.
    pub fn data_len(&self) -> usize {
        self.as_bytes().len() - MAX_HEADER_SIZE - self.preamble.len()
    }

    /// Preamble and data, as carried on the wire.
    pub fn payload(&self) -> &[u8] {
        &self.as_bytes()[MAX_HEADER_SIZE..]
    }

    /// Whole buffer including the reserved region.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.frozen {
            Some(frame) => frame.as_bytes(),
            None => &self.buf,
        }
    }

    /// Whether the storage currently belongs to a stamped frame.
    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Stamp the headers in place and freeze a transmit frame.
    pub fn stamp(&mut self, msg_type: MsgType, seq: u32, sender: NodeId) -> Frame {
        self.thaw();
        let size = (self.buf.len() - MAX_HEADER_SIZE) as u32;
        let header = MessageHeader::new(msg_type, seq, sender, size);
        let frame = Frame::stamp(std::mem::take(&mut self.buf), &header);
        self.frozen = Some(frame.clone());
        frame
    }

    /// Make the storage writable again, copying only if a transport still shares it.
    fn thaw(&mut self) {
        if let Some(frame) = self.frozen.take() {
            self.buf = frame
                .into_vec()
                .unwrap_or_else(|shared| shared.as_bytes().to_vec());
        }
    }
}
