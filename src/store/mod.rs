// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Layered storage: the per-layer backend databases and the façade that
//! enforces the group and read-only invariants on top of them.

pub mod backend;
pub mod engine;
pub mod layer;

use thiserror::Error;

/// Storage and resolution failures.
///
/// All of these are reported to a client as a bare `-1` status; the variant
/// only reaches the daemon log.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such layer '{0}'")]
    NoSuchLayer(String),

    #[error("layer '{0}' is read-only")]
    ReadOnlyLayer(String),

    #[error("group '{group}' does not exist in layer '{layer}'")]
    NoSuchGroup { layer: String, group: String },

    #[error("group '{group}' already exists in layer '{layer}'")]
    GroupExists { layer: String, group: String },

    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("corrupt database record: {0}")]
    BadRecord(#[from] crate::wire::error::WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
