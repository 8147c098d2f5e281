// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolves a config path relative to the current working directory and
/// canonicalizes it, failing early on missing files.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

/// Picks the node config path: first CLI argument if present, otherwise the
/// given default.
pub fn config_path_from_args(default: &str) -> String {
    std::env::args().nth(1).unwrap_or_else(|| default.to_string())
}
