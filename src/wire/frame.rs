// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Frame layout and the framing codec.
//!
//! Every message is one length-delimited frame:
//!
//! ```text
//! +-------------+-----------+------------+-----------+-----------------+
//! | control u16 | kind u16  | length u32 | msgid u32 | param_count u32 |
//! +-------------+-----------+------------+-----------+-----------------+
//! | param_count x ( type u16 | value_len u32 | value_len bytes )        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! All integers are little-endian. `length` counts the whole frame, header
//! included, which lets a reader size its buffer from the first 16 bytes.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
};

use crate::wire::{error::WireError, kind::MessageKind, value::{DataType, Value}};

/// Magic in the first header field; anything else is not protocol traffic.
pub const CONTROL_CODE: u16 = 0x0672;

/// Fixed frame header size.
pub const FRAME_HEADER_LEN: usize = 16;

/// Upper bound on a single frame; larger announcements terminate the client.
pub const MAX_FRAME: usize = 2 * 1024 * 1024;

/// Upper bound on parameters per frame. Requests are far narrower (the
/// per-kind tables top out at four), but name listings return one string
/// parameter per name.
pub const MAX_PARAMS: u32 = 1024;

/// The fixed 16-byte frame header.
#[repr(C)]
#[derive(Debug, Default, Clone, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    pub control: U16<LittleEndian>,
    pub kind: U16<LittleEndian>,
    pub length: U32<LittleEndian>,
    pub msgid: U32<LittleEndian>,
    pub param_count: U32<LittleEndian>,
}

/// A decoded frame: kind, correlation id and the typed parameter list.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: MessageKind,
    pub msgid: u32,
    pub params: Vec<Value>,
}

/// Peek the total size of the frame starting at `buf`.
///
/// Returns 0 while fewer than [`FRAME_HEADER_LEN`] bytes are available, and
/// 0 for a length field below the header size (the caller treats a non-zero
/// result that never arrives, or a zero result on a full header, as its cue
/// to reject the peer).
pub fn frame_size(buf: &[u8]) -> u32 {
    let Some(head) = buf.get(..FRAME_HEADER_LEN) else {
        return 0;
    };
    let header = FrameHeader::ref_from_bytes(head).expect("16-byte slice");
    let length = header.length.get();
    if (length as usize) < FRAME_HEADER_LEN {
        return 0;
    }
    length
}

/// Decode one complete frame from `buf`.
///
/// `buf` must hold exactly the frame announced by its own header; trailing
/// bytes are a framing bug in the caller and are rejected.
pub fn decode_frame(buf: &[u8]) -> Result<Frame, WireError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(WireError::ShortRead { need: FRAME_HEADER_LEN, have: buf.len() });
    }
    let (head, mut body) = buf.split_at(FRAME_HEADER_LEN);
    let header = FrameHeader::ref_from_bytes(head).expect("16-byte slice");

    if header.control.get() != CONTROL_CODE {
        return Err(WireError::MalformedFrame("bad control code"));
    }
    let length = header.length.get() as usize;
    if length < FRAME_HEADER_LEN || length > MAX_FRAME {
        return Err(WireError::MalformedFrame("frame length out of range"));
    }
    if buf.len() < length {
        return Err(WireError::ShortRead { need: length, have: buf.len() });
    }
    if buf.len() != length {
        return Err(WireError::MalformedFrame("trailing bytes after frame"));
    }

    let kind = MessageKind::from_u16(header.kind.get())?;
    let param_count = header.param_count.get();
    if param_count > MAX_PARAMS {
        return Err(WireError::MalformedFrame("too many parameters"));
    }

    let mut params = Vec::with_capacity(param_count as usize);
    for _ in 0..param_count {
        if body.len() < 6 {
            return Err(WireError::MalformedFrame("truncated parameter header"));
        }
        let ty = u16::from_le_bytes([body[0], body[1]]);
        let value_len =
            u32::from_le_bytes([body[2], body[3], body[4], body[5]]) as usize;
        body = &body[6..];

        let ty = DataType::from_u16(ty)?;
        if ty == DataType::Unset {
            return Err(WireError::MalformedFrame("unset-typed parameter"));
        }
        if value_len == 0 && ty != DataType::String {
            return Err(WireError::MalformedFrame("zero-length scalar parameter"));
        }
        if body.len() < value_len {
            return Err(WireError::MalformedFrame("parameter overruns frame"));
        }
        params.push(Value::decode(ty, &body[..value_len])?);
        body = &body[value_len..];
    }

    if !body.is_empty() {
        return Err(WireError::MalformedFrame("trailing bytes after parameters"));
    }

    Ok(Frame { kind, msgid: header.msgid.get(), params })
}

/// Encode a frame for `kind` with the given correlation id and parameters.
pub fn encode_frame(
    kind: MessageKind,
    msgid: u32,
    params: &[Value],
) -> Result<Bytes, WireError> {
    if params.len() as u32 > MAX_PARAMS {
        return Err(WireError::MalformedFrame("too many parameters"));
    }

    let body_len: usize = params.iter().map(|p| 6 + p.wire_len()).sum();
    let total = FRAME_HEADER_LEN + body_len;
    if total > MAX_FRAME {
        return Err(WireError::MalformedFrame("frame length out of range"));
    }

    let mut buf = BytesMut::with_capacity(total);
    let header = FrameHeader {
        control: CONTROL_CODE.into(),
        kind: (kind as u16).into(),
        length: (total as u32).into(),
        msgid: msgid.into(),
        param_count: (params.len() as u32).into(),
    };
    buf.put_slice(header.as_bytes());

    for param in params {
        buf.put_u16_le(param.data_type() as u16);
        buf.put_u32_le(param.wire_len() as u32);
        param.encode_into(&mut buf);
    }

    debug_assert_eq!(buf.len(), total);
    Ok(buf.freeze())
}
