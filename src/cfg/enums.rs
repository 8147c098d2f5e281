// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tri-state of an optional node feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeatureState {
    #[default]
    Disabled,
    Enabled,
    #[serde(rename = "notsupported")]
    NotSupported,
}

impl FeatureState {
    #[inline]
    pub fn is_enabled(self) -> bool {
        matches!(self, FeatureState::Enabled)
    }

    #[inline]
    pub fn is_supported(self) -> bool {
        !matches!(self, FeatureState::NotSupported)
    }
}

impl fmt::Display for FeatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureState::Disabled => "disabled",
            FeatureState::Enabled => "enabled",
            FeatureState::NotSupported => "notsupported",
        };
        f.write_str(s)
    }
}
