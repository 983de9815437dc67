// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The layer table: named, priority-ordered storage partitions discovered
//! from configuration at startup and immutable afterwards.

use std::path::PathBuf;

use crate::cfg::{config::LayerConfig, enums::LayerKind};

/// One configured layer.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    /// Resolution priority within the layer's kind; higher wins.
    pub priority: i32,
    /// Read-only layers reject every mutation.
    pub readonly: bool,
    /// Path of the single backing database for this layer.
    pub db_path: PathBuf,
    pub description: Option<String>,
}

impl Layer {
    pub fn from_config(cfg: &LayerConfig, db_dir: &std::path::Path) -> Self {
        Self {
            name: cfg.name.clone(),
            kind: cfg.kind,
            priority: cfg.priority,
            readonly: cfg.readonly,
            db_path: db_dir.join(format!("{}.db", cfg.name)),
            description: cfg.description.clone(),
        }
    }
}
