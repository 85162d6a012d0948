// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local mirror of upstream.
//!
//! The __mirror__ is a bare repository on the local machine that the invoking
//! user keeps current with upstream, using their own network credentials. Root
//! never talks to upstream. Root only ever reads from the mirror, which needs
//! no network access at all because the mirror is just another path on disk.
//!
//! # Mirror Layout
//!
//! A mirror is created the same way `git clone --mirror` would create one: a
//! bare repository whose "origin" remote fetches `+refs/*:refs/*` and is marked
//! with `remote.origin.mirror = true`. Every ref of upstream lands under the
//! same name in the mirror, so a checkout cloned from the mirror sees upstream
//! branches as if it had cloned upstream itself.
//!
//! # Offline Fallback
//!
//! When upstream cannot be reached, a branch of the developer checkout can be
//! pushed into the mirror instead. This is a plain ref update that refuses
//! anything but a fast-forward, so mirror history is never rewritten.

pub mod auth;

use crate::{
    mirror::auth::TransferPrompter,
    privilege::{Ownership, Privilege, PrivilegeError},
    syscall::{syscall_interactive, SyscallError},
};

use auth_git2::GitAuthenticator;
use git2::{
    BranchType, Config, ErrorClass, FetchOptions, FetchPrune, PushOptions, RemoteCallbacks,
    Repository,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    fs::{create_dir_all, remove_dir_all, rename},
    path::{Path, PathBuf},
    process,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// Fetch refspec that turns a bare repository into a mirror.
pub const MIRROR_REFSPEC: &str = "+refs/*:refs/*";

/// Outcome of ensuring a mirror exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    /// Mirror was already there.
    Existing,

    /// Mirror was freshly cloned from upstream.
    Created,
}

/// Operations on the local mirror, plus the user-side network operations that
/// feed it.
pub trait MirrorStore {
    /// Read URL of `remote` configured in developer checkout.
    fn upstream_url(&self, developer_repo: &Path, remote: &str) -> Result<String>;

    /// Make sure a mirror of `upstream_url` exists at `mirror_path`.
    fn ensure(&self, mirror_path: &Path, upstream_url: &str) -> Result<MirrorState>;

    /// Refresh mirror from its upstream, pruning stale refs.
    fn fetch(&self, mirror_path: &Path) -> Result<()>;

    /// Push local `branch` of developer checkout into mirror.
    fn push_from_developer_checkout(
        &self,
        developer_repo: &Path,
        mirror_path: &Path,
        branch: &str,
    ) -> Result<()>;

    /// Refresh developer checkout from `remote`, pruning stale refs.
    fn fetch_checkout(&self, developer_repo: &Path, remote: &str) -> Result<()>;
}

/// Mirror store through libgit2.
#[derive(Debug, Clone)]
pub struct Git2Mirror {
    privilege: Privilege,
}

impl Git2Mirror {
    /// Construct new mirror store.
    ///
    /// The privilege capability is only consulted when the parent directory of
    /// a new mirror is not writable by the current user.
    pub fn new(privilege: Privilege) -> Self {
        Self { privilege }
    }

    #[instrument(skip(self), level = "debug")]
    fn ensure_parent(&self, parent: &Path) -> Result<()> {
        if parent.is_dir() {
            return Ok(());
        }

        match self.privilege.ownership(parent)? {
            Ownership::Owned => {
                debug!("create {}", parent.display());
                create_dir_all(parent).map_err(|err| MirrorError::Parent {
                    source: err,
                    path: parent.into(),
                })?;
            }
            Ownership::ForeignEscalatable => {
                // INVARIANT: Hand new directory over to current user, so the mirror
                // can be populated without privilege.
                info!("create {} through escalation helper", parent.display());
                let uid = self.privilege.euid().to_string();
                let gid = nix::unistd::getegid().as_raw().to_string();
                let argv = self.privilege.command([
                    "install".into(),
                    "-d".into(),
                    "-o".into(),
                    uid,
                    "-g".into(),
                    gid,
                    parent.to_string_lossy().into_owned(),
                ])?;
                syscall_interactive(&argv)?;
            }
            Ownership::ForeignReadonly => {
                return Err(MirrorError::ParentReadOnly {
                    path: parent.into(),
                });
            }
        }

        Ok(())
    }
}

impl MirrorStore for Git2Mirror {
    /// Read URL of `remote` configured in developer checkout.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::Open`] if developer checkout cannot be opened.
    /// - Return [`MirrorError::NoUpstreamConfigured`] if remote is missing, or
    ///   its URL is empty.
    fn upstream_url(&self, developer_repo: &Path, remote: &str) -> Result<String> {
        let repository = Repository::open(developer_repo).map_err(|err| MirrorError::Open {
            source: err,
            path: developer_repo.into(),
        })?;

        let no_upstream = || MirrorError::NoUpstreamConfigured {
            remote: remote.into(),
            repo: developer_repo.into(),
        };
        let found = repository.find_remote(remote).map_err(|_| no_upstream())?;
        match found.url().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => Err(no_upstream()),
        }
    }

    /// Make sure a mirror of `upstream_url` exists at `mirror_path`.
    ///
    /// Does nothing if `mirror_path` already exists. Otherwise the mirror is
    /// cloned into a staging directory next to `mirror_path` and renamed into
    /// place once complete, so an interrupted clone never passes as a mirror.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::ParentReadOnly`] if parent directory cannot be
    ///   created by anyone.
    /// - Return [`MirrorError::Create`] if clone fails.
    /// - Return [`MirrorError::Stage`] if clone cannot be moved into place.
    #[instrument(skip(self), level = "debug")]
    fn ensure(&self, mirror_path: &Path, upstream_url: &str) -> Result<MirrorState> {
        if mirror_path.exists() {
            debug!("mirror {} already exists", mirror_path.display());
            return Ok(MirrorState::Existing);
        }

        let parent = mirror_path.parent().unwrap_or(Path::new("/"));
        self.ensure_parent(parent)?;

        let name = mirror_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mirror".into());
        let staging = parent.join(format!(".{name}.partial-{}", process::id()));

        info!("create mirror of {upstream_url} at {}", mirror_path.display());
        if let Err(err) = clone_mirror(upstream_url, &staging) {
            if staging.exists() {
                if let Err(cleanup) = remove_dir_all(&staging) {
                    warn!("failed to clean up {}: {cleanup}", staging.display());
                }
            }

            return Err(MirrorError::Create {
                source: err,
                url: upstream_url.into(),
                path: mirror_path.into(),
            });
        }

        rename(&staging, mirror_path).map_err(|err| MirrorError::Stage {
            source: err,
            path: mirror_path.into(),
        })?;

        Ok(MirrorState::Created)
    }

    /// Refresh mirror from its upstream, pruning stale refs.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::Open`] if mirror cannot be opened.
    /// - Return [`MirrorError::Fetch`] if fetch fails.
    #[instrument(skip(self), level = "debug")]
    fn fetch(&self, mirror_path: &Path) -> Result<()> {
        let repository = Repository::open_bare(mirror_path).map_err(|err| MirrorError::Open {
            source: err,
            path: mirror_path.into(),
        })?;

        info!("refresh mirror {}", mirror_path.display());
        fetch_remote(&repository, "origin").map_err(|err| MirrorError::Fetch {
            network: is_network_error(&err),
            source: err,
            path: mirror_path.into(),
        })
    }

    /// Push local `branch` of developer checkout into mirror.
    ///
    /// Needs no network access. Refuses anything but a fast-forward of the
    /// mirror's branch.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::Open`] if developer checkout cannot be opened.
    /// - Return [`MirrorError::BranchNotFound`] if `branch` does not exist
    ///   locally. Nothing is pushed in that case.
    /// - Return [`MirrorError::Push`] if push fails or is rejected.
    #[instrument(skip(self), level = "debug")]
    fn push_from_developer_checkout(
        &self,
        developer_repo: &Path,
        mirror_path: &Path,
        branch: &str,
    ) -> Result<()> {
        let repository = Repository::open(developer_repo).map_err(|err| MirrorError::Open {
            source: err,
            path: developer_repo.into(),
        })?;

        // INVARIANT: Verify branch before touching the mirror at all.
        repository
            .find_branch(branch, BranchType::Local)
            .map_err(|_| MirrorError::BranchNotFound {
                branch: branch.into(),
                repo: developer_repo.into(),
            })?;

        info!(
            "push {branch} from {} into mirror {}",
            developer_repo.display(),
            mirror_path.display()
        );
        let push_error = |err| MirrorError::Push {
            source: err,
            branch: branch.into(),
            path: mirror_path.into(),
        };
        let mut remote = repository
            .remote_anonymous(mirror_path.to_string_lossy().as_ref())
            .map_err(push_error)?;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.push_update_reference(|refname, status| match status {
            Some(message) => Err(git2::Error::from_str(&format!(
                "mirror rejected {refname}: {message}"
            ))),
            None => Ok(()),
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        // INVARIANT: Never force, i.e., no leading '+' in refspec.
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .map_err(push_error)?;

        Ok(())
    }

    /// Refresh developer checkout from `remote`, pruning stale refs.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::Open`] if developer checkout cannot be opened.
    /// - Return [`MirrorError::Fetch`] if fetch fails.
    #[instrument(skip(self), level = "debug")]
    fn fetch_checkout(&self, developer_repo: &Path, remote: &str) -> Result<()> {
        let repository = Repository::open(developer_repo).map_err(|err| MirrorError::Open {
            source: err,
            path: developer_repo.into(),
        })?;

        info!("fetch {remote} into {}", developer_repo.display());
        fetch_remote(&repository, remote).map_err(|err| MirrorError::Fetch {
            network: is_network_error(&err),
            source: err,
            path: developer_repo.into(),
        })
    }
}

fn clone_mirror(url: &str, path: &Path) -> std::result::Result<(), git2::Error> {
    let repository = Repository::init_bare(path)?;
    let mut remote = repository.remote_with_fetch("origin", url, MIRROR_REFSPEC)?;
    repository.config()?.set_bool("remote.origin.mirror", true)?;

    with_transfer(url, |options| {
        remote.fetch(&[] as &[&str], Some(options), Some("flakesync: create mirror"))
    })?;

    // INVARIANT: Point HEAD at upstream's default branch, so anything cloned
    // from the mirror checks out the same branch a clone of upstream would.
    let head = match remote.default_branch() {
        Ok(buf) => buf.as_str().map(ToString::to_string),
        Err(err) => {
            debug!("upstream did not advertise default branch: {err}");
            None
        }
    };
    match head {
        Some(head) => repository.set_head(&head)?,
        None if repository.find_reference("refs/heads/main").is_ok() => {
            repository.set_head("refs/heads/main")?
        }
        None => warn!("cannot determine default branch of {url}, leaving HEAD as is"),
    }

    Ok(())
}

fn fetch_remote(repository: &Repository, name: &str) -> std::result::Result<(), git2::Error> {
    let mut remote = repository.find_remote(name)?;
    let url = remote.url().unwrap_or(name).to_string();
    with_transfer(&url, |options| {
        options.prune(FetchPrune::On);
        remote.fetch(&[] as &[&str], Some(options), None)
    })
}

/// Run network operation with credential prompts and transfer progress.
///
/// If any credentials are required, the user is prompted for them. The
/// progress bar is drawn to standard error, and suspended while prompting.
fn with_transfer<T>(
    url: &str,
    operation: impl FnOnce(&mut FetchOptions<'_>) -> std::result::Result<T, git2::Error>,
) -> std::result::Result<T, git2::Error> {
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )
    .map(|style| style.progress_chars("-Cco."))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    let bar = ProgressBar::new(0);
    bar.set_style(style);
    bar.set_message(url.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));

    let prompter = TransferPrompter::new(bar.clone());
    let authenticator = GitAuthenticator::default().set_prompter(prompter);
    let config = Config::open_default()?;

    let progress = bar.clone();
    let mut throttle = Instant::now();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(authenticator.credentials(&config));
    callbacks.transfer_progress(move |stats| {
        if throttle.elapsed() > Duration::from_millis(10) {
            throttle = Instant::now();
            progress.set_length(stats.total_objects() as u64);
            progress.set_position(stats.received_objects() as u64);
        }
        true
    });

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    let result = operation(&mut options);
    bar.finish_and_clear();

    result
}

/// Check if libgit2 error smells like an unreachable network.
pub fn is_network_error(err: &git2::Error) -> bool {
    matches!(
        err.class(),
        ErrorClass::Net | ErrorClass::Ssh | ErrorClass::Http | ErrorClass::Ssl
    )
}

/// Mirror store error types.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Developer checkout has no usable upstream remote.
    #[error(
        "no upstream configured: remote {remote:?} of {:?} is missing or has no URL\n\
         hint: add one with `git remote add {remote} <url>`, \
         or set sync.upstream in the settings file",
        repo.display()
    )]
    NoUpstreamConfigured { remote: String, repo: PathBuf },

    /// Repository cannot be opened.
    #[error("failed to open repository at {:?}", path.display())]
    Open {
        #[source]
        source: git2::Error,
        path: PathBuf,
    },

    /// Parent directory of new mirror cannot be created.
    #[error("failed to create mirror parent directory {:?}", path.display())]
    Parent {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Parent directory of new mirror belongs to someone else.
    #[error(
        "cannot create mirror under {:?}: owned by another user \
         and no escalation helper configured",
        path.display()
    )]
    ParentReadOnly { path: PathBuf },

    /// Mirror clone failed.
    #[error("failed to create mirror of {url} at {:?}", path.display())]
    Create {
        #[source]
        source: git2::Error,
        url: String,
        path: PathBuf,
    },

    /// Finished clone cannot be moved into place.
    #[error("failed to move new mirror into place at {:?}", path.display())]
    Stage {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Refreshing from upstream failed.
    #[error(
        "failed to fetch into {:?}{}",
        path.display(),
        if *network { " (network unreachable?)" } else { "" }
    )]
    Fetch {
        #[source]
        source: git2::Error,
        path: PathBuf,
        network: bool,
    },

    /// Branch to push does not exist in developer checkout.
    #[error("branch {branch:?} does not exist in {:?}", repo.display())]
    BranchNotFound { branch: String, repo: PathBuf },

    /// Push into mirror failed or was rejected.
    #[error("failed to push {branch:?} into mirror {:?}", path.display())]
    Push {
        #[source]
        source: git2::Error,
        branch: String,
        path: PathBuf,
    },

    /// Escalation was needed but impossible.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// Escalated command failed.
    #[error(transparent)]
    Syscall(#[from] SyscallError),
}

impl MirrorError {
    /// Exit code of the escalated command that caused this error, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Syscall(err) => err.exit_code(),
            _ => None,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = MirrorError> = std::result::Result<T, E>;
