// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol: message header, indirect envelope, frames and the
//! direct-stream decoder.

pub mod codec;
pub mod header;

pub use codec::{DirectCodec, DirectMessage};
pub use header::{
    decode_indirect, Frame, IndirectMessage, MessageHeader, MsgType, BASE_HEADER_SIZE,
    ENVELOPE_SIZE, HEADER_MAGIC, MAX_HEADER_SIZE,
};
