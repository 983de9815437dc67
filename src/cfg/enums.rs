// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Layer kind: during resolution every `System` layer outranks every `User`
/// layer, regardless of priority.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    #[serde(rename = "system", alias = "System", alias = "SYSTEM")]
    System,
    #[serde(rename = "user", alias = "User", alias = "USER")]
    User,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayerKind::System => "system",
            LayerKind::User => "user",
        })
    }
}
