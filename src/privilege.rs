// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Privilege boundary.
//!
//! The invoking user holds the network credentials, while root owns the live
//! system checkout. Anything that must touch a root-owned path is routed
//! through an __escalation helper__ like sudo or doas, unless the process
//! already runs as root.
//!
//! Routing is pure argument vector construction. Deciding _whether_ a path
//! needs escalation is a separate question answered by [`Privilege::ownership`],
//! which every component touching privileged paths consults the same way.

use std::{
    ffi::OsString,
    fmt::{Display, Formatter, Result as FmtResult},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Escalation helper command.
///
/// Stored as a split argument vector, e.g., `sudo --` becomes `["sudo", "--"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationHelper(Vec<OsString>);

impl EscalationHelper {
    /// Construct escalation helper from whitespace separated command line.
    ///
    /// Returns `None` when there is nothing left after splitting.
    pub fn parse(helper: impl AsRef<str>) -> Option<Self> {
        let argv: Vec<OsString> = helper
            .as_ref()
            .split_whitespace()
            .map(OsString::from)
            .collect();
        (!argv.is_empty()).then_some(Self(argv))
    }
}

impl Display for EscalationHelper {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let parts: Vec<_> = self.0.iter().map(|arg| arg.to_string_lossy()).collect();
        fmt.write_str(&parts.join(" "))
    }
}

/// Who may mutate a given path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Current user owns it, or current user is root.
    Owned,

    /// Someone else owns it, and there is no way to escalate.
    ForeignReadonly,

    /// Someone else owns it, but the escalation helper can reach it.
    ForeignEscalatable,
}

/// Privilege capability of the current process.
///
/// The effective user id is injected rather than read ambiently, so anything
/// built on top of it can be exercised without real privilege changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privilege {
    euid: u32,
    helper: Option<EscalationHelper>,
}

impl Privilege {
    /// Construct privilege capability for a given effective user id.
    pub fn new(euid: u32, helper: Option<EscalationHelper>) -> Self {
        Self { euid, helper }
    }

    /// Construct privilege capability for the running process.
    pub fn current(helper: Option<EscalationHelper>) -> Self {
        Self::new(nix::unistd::geteuid().as_raw(), helper)
    }

    /// Effective user id this capability was constructed with.
    pub fn euid(&self) -> u32 {
        self.euid
    }

    /// Check if process runs with root privilege.
    pub fn is_root(&self) -> bool {
        self.euid == 0
    }

    /// Build argument vector for a possibly-privileged command.
    ///
    /// Returns `argv` untouched when already root. Otherwise `argv` is
    /// prefixed with the escalation helper.
    ///
    /// # Errors
    ///
    /// - Return [`PrivilegeError::NoHelper`] if not root and no escalation
    ///   helper is configured.
    pub fn command(
        &self,
        argv: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Result<Vec<OsString>> {
        let argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
        if self.is_root() {
            return Ok(argv);
        }

        let helper = self.helper.as_ref().ok_or_else(|| PrivilegeError::NoHelper {
            command: argv
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" "),
        })?;

        let mut escalated = helper.0.clone();
        escalated.extend(argv);

        Ok(escalated)
    }

    /// Classify who may mutate `path`.
    ///
    /// Ownership of a path that does not exist yet is taken from its nearest
    /// existing ancestor.
    ///
    /// # Errors
    ///
    /// - Return [`PrivilegeError::Inspect`] if no ancestor can be inspected.
    pub fn ownership(&self, path: impl AsRef<Path>) -> Result<Ownership> {
        let existing = nearest_existing_ancestor(path.as_ref());
        let owner = existing
            .symlink_metadata()
            .map_err(|err| PrivilegeError::Inspect {
                source: err,
                path: existing.to_path_buf(),
            })?
            .uid();
        debug!("{} owned by uid {owner}", existing.display());

        let ownership = if self.is_root() || owner == self.euid {
            Ownership::Owned
        } else if self.helper.is_some() {
            Ownership::ForeignEscalatable
        } else {
            Ownership::ForeignReadonly
        };

        Ok(ownership)
    }
}

/// Find nearest ancestor of `path` that exists, `path` included.
pub fn nearest_existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|candidate| candidate.symlink_metadata().is_ok())
        .unwrap_or(path)
}

/// Privilege boundary error types.
#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    /// Command needs root, but nothing can escalate.
    #[error("command {command:?} needs root privilege, but no escalation helper is configured")]
    NoHelper { command: String },

    /// Path ownership cannot be determined.
    #[error("failed to inspect ownership of {:?}", path.display())]
    Inspect {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PrivilegeError> = std::result::Result<T, E>;
