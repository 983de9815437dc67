// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Errors produced while encoding or decoding protocol frames.
///
/// Only `ShortRead` is recoverable: the caller keeps buffering and retries
/// once more bytes arrived. Every other variant is a protocol violation and
/// the peer that produced the bytes gets its connection terminated.
#[derive(Debug, Error)]
pub enum WireError {
    /// Not enough bytes for a complete frame yet.
    #[error("short read: need {need} bytes, have {have}")]
    ShortRead { need: usize, have: usize },

    /// Structurally invalid frame (bad magic, bad lengths, garbage strings).
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The kind field does not name a known request or reply.
    #[error("unknown message kind {0:#06x}")]
    UnknownKind(u16),

    /// A request carried the wrong number of parameters for its kind.
    #[error("{kind}: bad parameter count {got}")]
    ParamArityMismatch { kind: &'static str, got: usize },

    /// A parameter carried a type its position does not allow.
    #[error("{kind}: bad parameter type at position {index}")]
    ParamTypeMismatch { kind: &'static str, index: usize },
}
