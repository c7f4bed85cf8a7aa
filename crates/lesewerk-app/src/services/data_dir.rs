// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "lesewerk";

/// Return the application data directory, creating it if needed.
///
/// `$XDG_DATA_HOME/lesewerk`, else `$HOME/.local/share/lesewerk`.
pub fn data_dir() -> PathBuf {
    let dir = base_dir().join(APP_DIR);
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Where artifacts go when neither the mission nor its sources name a
/// directory (buffer-only missions).
pub fn fallback_output_dir(data_dir: &Path) -> PathBuf {
    let dir = data_dir.join("output");
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn base_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg);
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_output_dir_is_created_inside_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = fallback_output_dir(dir.path());
        assert!(out.is_dir());
        assert!(out.starts_with(dir.path()));
    }
}
