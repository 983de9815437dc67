// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Message kinds carried in the frame header.
//!
//! The numeric range is bounded by the `Min`/`Max` sentinels; anything at or
//! beyond a sentinel, and the retired list-keys slot at 7, is rejected as
//! [`WireError::UnknownKind`] and terminates the client.

use crate::wire::error::WireError;

/// All operations understood on the wire, plus the two reply kinds
/// (`Status`, `Changed`) the daemon emits.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Persist a typed value under (layer, group, name).
    Set = 1,
    /// Persist a privilege string on a group or key.
    SetLabel = 2,
    /// Create a group row in a layer.
    CreateGroup = 3,
    /// Remove a group row from a layer.
    RemoveGroup = 4,
    /// Read a value, either layer-scoped or resolved across layers.
    Get = 5,
    /// Remove a key from a layer.
    Unset = 6,
    /* 7 was list-keys; the handler never shipped and the slot stays dead */
    /// Reply: an i32 status, then kind-specific payload.
    Status = 8,
    /// Register a change subscription for (group, name).
    Notify = 9,
    /// Drop a change subscription for (group, name).
    Unnotify = 10,
    /// Unsolicited: a subscribed key changed.
    Changed = 11,
    /// Read the privilege string of a group or key.
    GetLabel = 12,
    /// List names in a layer, optionally scoped to a group and prefix.
    ListNames = 13,
}

/// Low sentinel of the kind range.
pub const KIND_MIN: u16 = 0;
/// High sentinel of the kind range.
pub const KIND_MAX: u16 = 14;

impl MessageKind {
    pub fn from_u16(v: u16) -> Result<Self, WireError> {
        Ok(match v {
            1 => Self::Set,
            2 => Self::SetLabel,
            3 => Self::CreateGroup,
            4 => Self::RemoveGroup,
            5 => Self::Get,
            6 => Self::Unset,
            8 => Self::Status,
            9 => Self::Notify,
            10 => Self::Unnotify,
            11 => Self::Changed,
            12 => Self::GetLabel,
            13 => Self::ListNames,
            other => return Err(WireError::UnknownKind(other)),
        })
    }

    /// Kinds a client may send; `Status` and `Changed` only travel
    /// daemon-to-client.
    pub fn is_request(self) -> bool {
        !matches!(self, Self::Status | Self::Changed)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::SetLabel => "set-label",
            Self::CreateGroup => "create-group",
            Self::RemoveGroup => "remove-group",
            Self::Get => "get",
            Self::Unset => "unset",
            Self::Status => "status",
            Self::Notify => "notify",
            Self::Unnotify => "unnotify",
            Self::Changed => "changed",
            Self::GetLabel => "get-label",
            Self::ListNames => "list-names",
        }
    }
}
