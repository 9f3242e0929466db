// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental decoder for direct-socket streams.
//!
//! A direct socket carries back-to-back `[base header][payload]` messages.
//! The payload length comes from the header, so no extra length prefix is
//! needed. The decoder keeps partial-read state across `WouldBlock` so it can
//! be driven straight from readiness events.

use std::io::{self, Read};

use super::header::{MessageHeader, BASE_HEADER_SIZE};

/// One decoded direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    /// Base header
    pub header: MessageHeader,
    /// Payload bytes
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingHeader {
        bytes_read: usize,
    },
    ReadingBody {
        header: MessageHeader,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingHeader { bytes_read: 0 }
    }
}

/// Stream decoder for direct connections.
#[derive(Debug)]
pub struct DirectCodec {
    state: ReadState,
    header_buf: [u8; BASE_HEADER_SIZE],
    body: Vec<u8>,
    max_size: usize,
    messages_decoded: u64,
}

impl DirectCodec {
    /// Create a decoder rejecting payloads above `max_size`.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            header_buf: [0u8; BASE_HEADER_SIZE],
            body: Vec::new(),
            max_size,
            messages_decoded: 0,
        }
    }

    /// Messages decoded so far.
    pub fn messages_decoded(&self) -> u64 {
        self.messages_decoded
    }

    /// Whether a message is partially read.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingHeader { bytes_read } => bytes_read > 0,
            ReadState::ReadingBody { .. } => true,
        }
    }

    /// Try to decode one complete message from `reader`.
    ///
    /// Returns `Ok(None)` on `WouldBlock`. EOF, oversized payloads and
    /// malformed headers are errors; the connection should be closed.
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<DirectMessage>> {
        loop {
            match self.state {
                ReadState::ReadingHeader { bytes_read } => {
                    match reader.read(&mut self.header_buf[bytes_read..]) {
                        Ok(0) => {
                            let msg = if bytes_read == 0 {
                                "connection closed"
                            } else {
                                "incomplete message header"
                            };
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < BASE_HEADER_SIZE {
                                self.state = ReadState::ReadingHeader { bytes_read: total };
                                continue;
                            }

                            let header = MessageHeader::decode(&self.header_buf)
                                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                            let len = header.payload_size as usize;
                            if len > self.max_size {
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("message too large: {} bytes (max {})", len, self.max_size),
                                ));
                            }
                            if len == 0 {
                                self.state = ReadState::default();
                                self.messages_decoded += 1;
                                return Ok(Some(DirectMessage {
                                    header,
                                    payload: Vec::new(),
                                }));
                            }
                            self.body.clear();
                            self.body.resize(len, 0);
                            self.state = ReadState::ReadingBody {
                                header,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody { header, bytes_read } => {
                    let expected = header.payload_size as usize;
                    match reader.read(&mut self.body[bytes_read..expected]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "incomplete message body",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected {
                                self.state = ReadState::ReadingBody {
                                    header,
                                    bytes_read: total,
                                };
                                continue;
                            }
                            self.state = ReadState::default();
                            self.messages_decoded += 1;
                            return Ok(Some(DirectMessage {
                                header,
                                payload: std::mem::take(&mut self.body),
                            }));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NodeId;
    use crate::protocol::header::{Frame, MsgType};

    /// Reader handing out at most `chunk` bytes per call, then WouldBlock.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "drained"));
            }
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn wire(msgs: &[(MsgType, u32, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (ty, seq, payload) in msgs {
            let hdr = MessageHeader::new(*ty, *seq, NodeId(5), payload.len() as u32);
            out.extend_from_slice(Frame::build(&hdr, payload).direct_bytes());
        }
        out
    }

    #[test]
    fn test_decode_back_to_back_in_small_chunks() {
        let data = wire(&[
            (MsgType::DirectHello, 0, b""),
            (MsgType::FanIn, 3, b"hello"),
            (MsgType::FanOut, 3, b"world!"),
        ]);
        let mut reader = Trickle {
            data,
            pos: 0,
            chunk: 3,
        };
        let mut codec = DirectCodec::new(1024);
        let mut got = Vec::new();
        while let Some(msg) = codec.decode(&mut reader).expect("decode") {
            got.push(msg);
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].header.msg_type, MsgType::DirectHello);
        assert_eq!(got[1].payload, b"hello");
        assert_eq!(got[2].header.seq, 3);
        assert_eq!(got[2].payload, b"world!");
        assert!(!codec.is_partial());
    }

    #[test]
    fn test_partial_then_would_block() {
        let data = wire(&[(MsgType::FanIn, 1, b"abcdef")]);
        let mut reader = Trickle {
            data: data[..BASE_HEADER_SIZE + 2].to_vec(),
            pos: 0,
            chunk: 64,
        };
        let mut codec = DirectCodec::new(1024);
        assert!(codec.decode(&mut reader).expect("decode").is_none());
        assert!(codec.is_partial());
    }

    #[test]
    fn test_oversized_rejected() {
        let data = wire(&[(MsgType::FanIn, 1, &[0u8; 64])]);
        let mut codec = DirectCodec::new(16);
        let err = codec.decode(&mut &data[..]).expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_eof_is_error() {
        let mut codec = DirectCodec::new(16);
        let err = codec.decode(&mut &[][..]).expect_err("eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
