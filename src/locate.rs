// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Developer checkout discovery.
//!
//! The `rebuild` binary is usually installed by symlinking it somewhere into
//! the user's `$PATH`, far away from the checkout it was built from. Locating
//! that checkout means resolving the real path of the entrypoint first, and
//! then walking upwards until a directory carries every expected marker.

use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// How far upwards the search goes before giving up.
pub const FIND_UPWARDS_LIMIT: usize = 8;

/// Files and directories that must exist for a directory to be considered the
/// root of the developer checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoMarkers {
    files: Vec<String>,
    dirs: Vec<String>,
}

impl RepoMarkers {
    /// Construct new marker set.
    pub fn new(
        files: impl IntoIterator<Item = impl Into<String>>,
        dirs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    /// Check if directory satisfies every marker.
    pub fn matches(&self, path: &Path) -> bool {
        self.files.iter().all(|file| path.join(file).is_file())
            && self.dirs.iter().all(|dir| path.join(dir).is_dir())
    }
}

impl Default for RepoMarkers {
    fn default() -> Self {
        Self::new(["flake.nix"], ["hosts"])
    }
}

/// Walk upwards from `start` until a directory matches `markers`.
///
/// The start directory itself counts as the first level, so parents are always
/// checked before grandparents. Stops at the filesystem root or after
/// [`FIND_UPWARDS_LIMIT`] levels, whichever comes first.
pub fn find_upwards(start: &Path, markers: &RepoMarkers) -> Option<PathBuf> {
    start
        .ancestors()
        .take(FIND_UPWARDS_LIMIT)
        .find(|candidate| markers.matches(candidate))
        .map(Path::to_path_buf)
}

/// Locate root of developer checkout from entrypoint path.
///
/// Resolves symbolic links in `entrypoint` before searching, so a symlink
/// placed in `~/.local/bin` still leads back to the real checkout. If the
/// entrypoint is a file, the search starts at its parent directory.
///
/// # Errors
///
/// - Return [`LocateError::Resolve`] if entrypoint cannot be canonicalized.
/// - Return [`LocateError::NotFound`] if no ancestor matches `markers`.
#[instrument(skip(markers), level = "debug")]
pub fn locate_repo_root(entrypoint: &Path, markers: &RepoMarkers) -> Result<PathBuf> {
    let resolved = entrypoint
        .canonicalize()
        .map_err(|err| LocateError::Resolve {
            source: err,
            path: entrypoint.into(),
        })?;
    debug!("resolved entrypoint to {}", resolved.display());

    let start = match resolved.is_dir() {
        true => resolved.as_path(),
        false => resolved.parent().unwrap_or(resolved.as_path()),
    };

    find_upwards(start, markers).ok_or_else(|| LocateError::NotFound {
        path: resolved.clone(),
        markers: markers.clone(),
    })
}

/// Developer checkout discovery error types.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    /// Entrypoint path cannot be resolved.
    #[error("failed to resolve real path of {:?}", path.display())]
    Resolve {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// No ancestor carries the expected markers.
    #[error(
        "could not locate repository root from {:?} (expected files {:?} and directories {:?})",
        path.display(),
        markers.files,
        markers.dirs
    )]
    NotFound { path: PathBuf, markers: RepoMarkers },
}

/// Friendly result alias :3
type Result<T, E = LocateError> = std::result::Result<T, E>;
