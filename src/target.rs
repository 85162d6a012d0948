// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! System checkout management.
//!
//! The __system checkout__ is the root-owned directory the system is built
//! from, `/etc/nixos` by default. It must be a proper Git checkout whose only
//! remote is the local mirror, so that anything root fetches never leaves the
//! machine.
//!
//! # Lifecycle
//!
//! ```text
//! Absent ──────────────────────► Cloned ──► Retargeted ──► FastForwarded
//! Foreign ──► BackedUp ────────► Cloned
//! AlreadyValid ───────────────────────────► Retargeted
//! Linked ──► refused
//! ```
//!
//! A foreign directory, i.e., one without Git metadata, is never deleted. It
//! is moved aside to `<target>.bak.<unix-timestamp>` before a fresh clone takes
//! its place. New clones are staged next to the target and renamed into place
//! once complete, so an interrupted clone never leaves a half-written tree at
//! the target path.
//!
//! A target that is a symlink or a linked worktree is never touched, since its
//! Git metadata belongs to another repository.
//!
//! Updates are fast-forward only. A dirty working tree, or history that has
//! diverged from the requested ref, is refused rather than resolved.

use crate::{
    privilege::{Ownership, Privilege, PrivilegeError},
    syscall::{display_argv, syscall_interactive, syscall_non_interactive, SyscallError},
};

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Remote name the system checkout uses for the mirror.
pub const MIRROR_REMOTE: &str = "origin";

/// Observed state of a system checkout directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutState {
    /// Nothing at target path.
    Absent,

    /// Git metadata and marker file both present.
    Valid,

    /// Git metadata present, marker file missing.
    Incomplete,

    /// Exists without Git metadata.
    Foreign,

    /// Symlink, or Git metadata kept outside of target, e.g., a linked
    /// worktree of the developer checkout.
    Linked,
}

impl CheckoutState {
    /// Inspect target path.
    pub fn inspect(target: &Path, marker: &str) -> Self {
        let Ok(meta) = target.symlink_metadata() else {
            return Self::Absent;
        };
        if meta.file_type().is_symlink() {
            return Self::Linked;
        }

        let git = target.join(".git").symlink_metadata();
        if matches!(&git, Ok(meta) if !meta.is_dir()) {
            return Self::Linked;
        }

        let marked = target.join(marker).is_file();
        match (git.is_ok(), marked) {
            (true, true) => Self::Valid,
            (true, false) => Self::Incomplete,
            (false, _) => Self::Foreign,
        }
    }
}

/// Outcome of ensuring a system checkout exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneOutcome {
    /// Checkout was already tracked, nothing done.
    AlreadyValid,

    /// Target path was empty, fresh clone made.
    Cloned,

    /// Foreign directory moved to `backup`, then fresh clone made.
    BackedUpAndCloned { backup: PathBuf },
}

/// Operations on the system checkout.
pub trait TargetCheckout {
    /// Observe current state of `target_dir`.
    fn state(&self, target_dir: &Path) -> CheckoutState;

    /// Make sure `target_dir` is a checkout cloned from `mirror_path`.
    fn ensure_clone(&self, mirror_path: &Path, target_dir: &Path) -> Result<CloneOutcome>;

    /// Point the checkout's remote at `mirror_path`. Returns whether anything
    /// had to change.
    fn retarget(&self, target_dir: &Path, mirror_path: &Path) -> Result<bool>;

    /// Fetch from mirror and fast-forward to `git_ref`.
    fn fast_forward(&self, target_dir: &Path, mirror_path: &Path, git_ref: &str) -> Result<()>;

    /// Fetch `source_ref` straight from a local repository and fast-forward to
    /// it.
    fn fast_forward_from(
        &self,
        target_dir: &Path,
        source_repo: &Path,
        source_ref: &str,
    ) -> Result<()>;
}

/// How a command reaches the tree it operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Direct,
    Escalated,
}

/// System checkout management through the Git binary.
///
/// Mutations are routed through the escalation helper whenever the path
/// involved belongs to someone else. Reads always run as the current user.
#[derive(Debug, Clone)]
pub struct GitTarget {
    privilege: Privilege,
    marker: String,
}

impl GitTarget {
    /// Construct new system checkout manager.
    ///
    /// The `marker` names the file that must exist at the top-level of a
    /// valid checkout, e.g., "flake.nix".
    pub fn new(privilege: Privilege, marker: impl Into<String>) -> Self {
        Self {
            privilege,
            marker: marker.into(),
        }
    }

    fn route(&self, path: &Path) -> Result<Route> {
        match self.privilege.ownership(path)? {
            Ownership::Owned => Ok(Route::Direct),
            Ownership::ForeignEscalatable => Ok(Route::Escalated),
            Ownership::ForeignReadonly => Err(TargetError::ReadOnly { path: path.into() }),
        }
    }

    fn run(&self, route: Route, argv: Vec<OsString>) -> Result<()> {
        let argv = match route {
            Route::Direct => argv,
            Route::Escalated => self.privilege.command(argv)?,
        };
        info!("run {}", display_argv(&argv));
        syscall_interactive(&argv)?;

        Ok(())
    }

    /// Refuse to touch a checkout whose Git metadata lives elsewhere.
    fn standalone(&self, target_dir: &Path) -> Result<()> {
        if self.state(target_dir) == CheckoutState::Linked {
            return Err(TargetError::Linked {
                path: target_dir.into(),
            });
        }

        Ok(())
    }

    fn dirty_check(&self, target_dir: &Path) -> Result<()> {
        let status = syscall_non_interactive(&git_in(
            target_dir,
            &[],
            ["status", "--porcelain=v1"],
        ))?;
        if !status.is_empty() {
            return Err(TargetError::Dirty {
                path: target_dir.into(),
                status,
            });
        }

        Ok(())
    }

    fn clone_into(&self, mirror_path: &Path, target_dir: &Path, stamp: i64) -> Result<()> {
        let parent = target_dir.parent().unwrap_or(Path::new("/"));
        let route = self.route(parent)?;
        let staging = sibling(target_dir, "clone", stamp);

        // INVARIANT: No hardlinks, so root's object store never shares inodes
        // with the user-owned mirror.
        let mut clone = safe_git(&[mirror_path]);
        clone.extend(os_args([
            "clone",
            "--no-hardlinks",
            "--origin",
            MIRROR_REMOTE,
        ]));
        clone.push(mirror_path.into());
        clone.push(staging.clone().into());

        if let Err(err) = self.run(route, clone) {
            if staging.exists() {
                warn!(
                    "partial clone left at {}, remove it by hand once inspected",
                    staging.display()
                );
            }

            return Err(TargetError::Clone {
                source: Box::new(err),
                mirror: mirror_path.into(),
                path: target_dir.into(),
            });
        }

        self.run(route, move_argv(&staging, target_dir))
    }
}

impl TargetCheckout for GitTarget {
    fn state(&self, target_dir: &Path) -> CheckoutState {
        CheckoutState::inspect(target_dir, &self.marker)
    }

    /// Make sure `target_dir` is a checkout cloned from `mirror_path`.
    ///
    /// # Errors
    ///
    /// - Return [`TargetError::ReadOnly`] if target belongs to someone else and
    ///   cannot be escalated to.
    /// - Return [`TargetError::Backup`] if foreign directory cannot be moved
    ///   aside.
    /// - Return [`TargetError::Clone`] if privileged clone fails.
    /// - Return [`TargetError::Linked`] if target is a symlink or a linked
    ///   worktree.
    #[instrument(skip(self), level = "debug")]
    fn ensure_clone(&self, mirror_path: &Path, target_dir: &Path) -> Result<CloneOutcome> {
        let stamp = chrono::Utc::now().timestamp();
        match self.state(target_dir) {
            CheckoutState::Linked => Err(TargetError::Linked {
                path: target_dir.into(),
            }),
            CheckoutState::Valid => {
                debug!("{} already a valid checkout", target_dir.display());
                Ok(CloneOutcome::AlreadyValid)
            }
            CheckoutState::Incomplete => {
                warn!(
                    "{} is tracked by Git but has no {}, continuing anyway",
                    target_dir.display(),
                    self.marker
                );
                Ok(CloneOutcome::AlreadyValid)
            }
            CheckoutState::Absent => {
                info!("clone mirror into {}", target_dir.display());
                self.clone_into(mirror_path, target_dir, stamp)?;
                Ok(CloneOutcome::Cloned)
            }
            CheckoutState::Foreign => {
                let backup = sibling(target_dir, "bak", stamp);
                if backup.symlink_metadata().is_ok() {
                    return Err(TargetError::BackupExists { backup });
                }

                warn!(
                    "{} is not a Git checkout, moving it aside to {}",
                    target_dir.display(),
                    backup.display()
                );
                let parent = target_dir.parent().unwrap_or(Path::new("/"));
                let route = self.route(parent)?;
                self.run(route, move_argv(target_dir, &backup))
                    .map_err(|err| TargetError::Backup {
                        source: Box::new(err),
                        path: target_dir.into(),
                    })?;

                self.clone_into(mirror_path, target_dir, stamp)?;
                Ok(CloneOutcome::BackedUpAndCloned { backup })
            }
        }
    }

    /// Point the checkout's remote at `mirror_path`.
    ///
    /// Reads the current remote URL first, and leaves it alone if it already
    /// names the mirror. Heals checkouts created against upstream directly,
    /// which would otherwise let root reach the network.
    ///
    /// # Errors
    ///
    /// - Return [`TargetError::Linked`] if target is a symlink or a linked
    ///   worktree.
    /// - Return [`TargetError::ReadOnly`] if checkout cannot be escalated to.
    /// - Return [`TargetError::Syscall`] if Git cannot read or update the
    ///   remote.
    #[instrument(skip(self), level = "debug")]
    fn retarget(&self, target_dir: &Path, mirror_path: &Path) -> Result<bool> {
        self.standalone(target_dir)?;
        let current =
            syscall_non_interactive(&git_in(target_dir, &[], ["remote", "get-url", MIRROR_REMOTE]));

        let action = match current {
            Ok(url) if same_location(&url, mirror_path) => {
                debug!("{} already points at {url}", target_dir.display());
                return Ok(false);
            }
            Ok(url) => {
                info!(
                    "retarget {} from {url} to {}",
                    target_dir.display(),
                    mirror_path.display()
                );
                "set-url"
            }
            Err(err) if is_missing_remote(&err) => {
                debug!("no {MIRROR_REMOTE} remote yet: {err}");
                info!("add remote {} to {}", mirror_path.display(), target_dir.display());
                "add"
            }
            Err(err) => return Err(err.into()),
        };

        let mut argv = git_in(target_dir, &[], ["remote", action, MIRROR_REMOTE]);
        argv.push(mirror_path.into());
        self.run(self.route(target_dir)?, argv)?;

        Ok(true)
    }

    /// Fetch from mirror and fast-forward to `git_ref`.
    ///
    /// The fetch never leaves the machine, because the checkout's remote is the
    /// mirror.
    ///
    /// # Errors
    ///
    /// - Return [`TargetError::Dirty`] if working tree has local changes.
    ///   Nothing is touched in that case.
    /// - Return [`TargetError::Syscall`] if fetch fails, or merge refuses
    ///   because `git_ref` is not a fast-forward.
    #[instrument(skip(self), level = "debug")]
    fn fast_forward(&self, target_dir: &Path, mirror_path: &Path, git_ref: &str) -> Result<()> {
        self.standalone(target_dir)?;
        self.dirty_check(target_dir)?;
        let route = self.route(target_dir)?;

        self.run(
            route,
            git_in(target_dir, &[mirror_path], ["fetch", "--prune", MIRROR_REMOTE]),
        )?;
        self.run(route, git_in(target_dir, &[], ["merge", "--ff-only", git_ref]))?;

        Ok(())
    }

    /// Fetch `source_ref` straight from a local repository and fast-forward to
    /// it.
    ///
    /// # Errors
    ///
    /// - Return [`TargetError::Dirty`] if working tree has local changes.
    /// - Return [`TargetError::Syscall`] if fetch fails, or merge refuses
    ///   because fetched commit is not a fast-forward.
    #[instrument(skip(self), level = "debug")]
    fn fast_forward_from(
        &self,
        target_dir: &Path,
        source_repo: &Path,
        source_ref: &str,
    ) -> Result<()> {
        self.standalone(target_dir)?;
        self.dirty_check(target_dir)?;
        let route = self.route(target_dir)?;

        let mut fetch = git_in(target_dir, &[source_repo], ["fetch"]);
        fetch.push(source_repo.into());
        fetch.push(source_ref.into());
        self.run(route, fetch)?;
        self.run(
            route,
            git_in(target_dir, &[], ["merge", "--ff-only", "FETCH_HEAD"]),
        )?;

        Ok(())
    }
}

/// Sibling path of `path` with a `.<label>.<stamp>` suffix.
pub fn sibling(path: &Path, label: &str, stamp: i64) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("checkout"));
    name.push(format!(".{label}.{stamp}"));
    path.with_file_name(name)
}

fn same_location(url: &str, path: &Path) -> bool {
    let url = Path::new(url.trim().trim_start_matches("file://"));
    if url == path {
        return true;
    }

    match (url.canonicalize(), path.canonicalize()) {
        (Ok(lhs), Ok(rhs)) => lhs == rhs,
        _ => false,
    }
}

/// Check if `git remote get-url` failed only because the remote is not there.
///
/// Git exits with code 2 for an unknown remote, and says so in its message.
fn is_missing_remote(err: &SyscallError) -> bool {
    match err {
        SyscallError::Failed { code, message, .. } => {
            *code == Some(2) || message.contains("No such remote")
        }
        _ => false,
    }
}

fn os_args<const N: usize>(args: [&str; N]) -> Vec<OsString> {
    args.into_iter().map(OsString::from).collect()
}

/// Git invocation trusting the given repositories regardless of their owner.
fn safe_git(trusted: &[&Path]) -> Vec<OsString> {
    let mut argv = vec![OsString::from("git")];
    for path in trusted {
        let mut value = OsString::from("safe.directory=");
        value.push(path.as_os_str());
        argv.push("-c".into());
        argv.push(value);
    }

    argv
}

/// Git invocation operating inside `target_dir`.
fn git_in<const N: usize>(target_dir: &Path, trusted: &[&Path], args: [&str; N]) -> Vec<OsString> {
    let mut all = vec![target_dir];
    all.extend_from_slice(trusted);
    let mut argv = safe_git(&all);
    argv.push("-C".into());
    argv.push(target_dir.into());
    argv.extend(os_args(args));

    argv
}

fn move_argv(from: &Path, to: &Path) -> Vec<OsString> {
    vec!["mv".into(), "-T".into(), from.into(), to.into()]
}

/// System checkout error types.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// Target belongs to someone else, and there is no way to escalate.
    #[error(
        "{:?} is owned by another user and no escalation helper is configured\n\
         hint: pass --root-helper, or run as root",
        path.display()
    )]
    ReadOnly { path: PathBuf },

    /// Foreign directory cannot be moved aside.
    #[error("failed to move {:?} aside", path.display())]
    Backup {
        #[source]
        source: Box<TargetError>,
        path: PathBuf,
    },

    /// Backup path is already taken.
    #[error("backup path {:?} already exists, refusing to overwrite it", backup.display())]
    BackupExists { backup: PathBuf },

    /// Privileged clone failed.
    #[error("failed to clone {:?} into {:?}", mirror.display(), path.display())]
    Clone {
        #[source]
        source: Box<TargetError>,
        mirror: PathBuf,
        path: PathBuf,
    },

    /// Target shares Git metadata with another repository.
    #[error(
        "refusing to sync {:?}: it is a symlink or a linked worktree of another repository\n\
         hint: move it aside so a standalone clone can take its place, or rerun with --no-sync",
        path.display()
    )]
    Linked { path: PathBuf },

    /// Working tree has local changes.
    #[error(
        "refusing to sync {:?}: working tree is dirty\n{status}\n\
         hint: commit or stash the changes, or rerun with --no-sync",
        path.display()
    )]
    Dirty { path: PathBuf, status: String },

    /// Escalation was needed but impossible.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// Git or a helper command failed.
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

impl TargetError {
    /// Exit code of the subprocess that caused this error, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Backup { source, .. } | Self::Clone { source, .. } => source.exit_code(),
            Self::Syscall(err) => err.exit_code(),
            _ => None,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = TargetError> = std::result::Result<T, E>;
