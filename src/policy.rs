// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Per-invocation plan resolution.
//!
//! Everything one `rebuild` invocation needs is decided up front, and frozen
//! into a [`RebuildPlan`]. Values come from the command line first, the
//! settings file second, and built-in defaults last.

use crate::{
    config::Settings,
    path::read_hostname,
    privilege::EscalationHelper,
    sync::{SyncMode, SyncPolicy},
};

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File that marks a directory as a flake.
pub const FLAKE_MARKER: &str = "flake.nix";

/// Exit code for an undeterminable host name, i.e., `EX_NOUSER`.
pub const EXIT_NO_HOST: i32 = 67;

/// Exit code for a flake directory without a flake, i.e., `EX_NOINPUT`.
pub const EXIT_NO_FLAKE: i32 = 66;

/// Options the user passed on the command line.
///
/// Every `None` defers to the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildOptions {
    /// Host to build for.
    pub hostname: Option<String>,

    /// Build from developer checkout.
    pub dev: bool,

    /// Explicit flake directory.
    pub flake: Option<PathBuf>,

    /// Force synchronization on or off.
    pub sync: Option<bool>,

    /// Force mirror mode on or off.
    pub mirror: Option<bool>,

    /// Mirror location override.
    pub mirror_dir: Option<PathBuf>,

    /// Ref to fast-forward to.
    pub sync_ref: Option<String>,

    /// Tolerate network failure.
    pub offline_ok: bool,

    /// Escalation helper command line.
    pub root_helper: Option<String>,
}

/// Frozen plan of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    /// Host to build for.
    pub hostname: String,

    /// Flake directory to build from.
    pub flake_dir: PathBuf,

    /// Escalation helper, if any.
    pub helper: Option<EscalationHelper>,

    /// How to synchronize the system checkout first.
    pub sync: SyncPolicy,

    /// Advice to attach when the flake turns out to be missing.
    pub flake_hint: Option<String>,
}

impl RebuildPlan {
    /// Resolve plan from command line options and settings.
    ///
    /// The `repo_root` is the developer checkout, if one could be located.
    ///
    /// # Errors
    ///
    /// - Return [`PolicyError::NoCheckout`] if `--dev` was given, but no
    ///   developer checkout was found.
    /// - Return [`PolicyError::MissingHost`] if no host name was given, and
    ///   none could be read from the host identity file.
    /// - Return [`PolicyError::MissingFlake`] if the flake directory has no
    ///   flake. In mirror mode the system checkout may not exist yet, so the
    ///   check is left to [`RebuildPlan::check_flake`] after synchronization.
    pub fn resolve(
        options: &RebuildOptions,
        settings: &Settings,
        repo_root: Option<&Path>,
    ) -> Result<Self> {
        let system_dir = settings.sync.flake_dir.as_path();
        if options.dev && repo_root.is_none() {
            return Err(PolicyError::NoCheckout);
        }

        let hostname = options
            .hostname
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(ToString::to_string)
            .or_else(|| read_hostname(&settings.repo.hostname_file))
            .ok_or_else(|| PolicyError::MissingHost {
                path: settings.repo.hostname_file.clone(),
            })?;

        let flake_dir = match (&options.flake, repo_root) {
            (Some(flake), _) => flake.clone(),
            (None, Some(root)) if options.dev => root.to_path_buf(),
            _ => system_dir.to_path_buf(),
        };
        debug!("build {hostname} from {}", flake_dir.display());

        let wants_sync = options
            .sync
            .unwrap_or(!options.dev && flake_dir == system_dir);
        let sync = wants_sync && flake_dir == system_dir;
        if wants_sync && !sync {
            warn!(
                "only {} is ever synchronized, building {} as is",
                system_dir.display(),
                flake_dir.display()
            );
        }

        let mode = match (sync, options.mirror.unwrap_or(settings.sync.mirror)) {
            (false, _) => SyncMode::Skip,
            (true, true) => SyncMode::Mirror,
            (true, false) => SyncMode::Direct,
        };

        let flake_hint = repo_root
            .filter(|root| !options.dev && root.join(FLAKE_MARKER).is_file())
            .map(|_| {
                format!(
                    "hint: either link your flake into {} or rerun with --dev\n\
                     hint: you can also set it explicitly with --flake PATH",
                    system_dir.display()
                )
            });

        let helper = EscalationHelper::parse(
            options
                .root_helper
                .as_deref()
                .unwrap_or(settings.privilege.helper.as_str()),
        );

        let plan = Self {
            hostname,
            flake_dir: flake_dir.clone(),
            helper,
            sync: SyncPolicy {
                mode,
                target_dir: flake_dir,
                mirror_dir: options
                    .mirror_dir
                    .clone()
                    .unwrap_or_else(|| settings.sync.mirror_dir.clone()),
                sync_ref: options
                    .sync_ref
                    .clone()
                    .unwrap_or_else(|| settings.sync.sync_ref.clone()),
                offline_ok: options.offline_ok || settings.sync.offline_ok,
                developer_repo: repo_root.map(Path::to_path_buf),
                remote: settings.sync.remote.clone(),
                upstream: settings.sync.upstream.clone(),
            },
            flake_hint,
        };

        if plan.sync.mode != SyncMode::Mirror {
            plan.check_flake()?;
        }

        Ok(plan)
    }

    /// Check that the flake directory holds a flake.
    ///
    /// # Errors
    ///
    /// - Return [`PolicyError::MissingFlake`] if it does not.
    pub fn check_flake(&self) -> Result<()> {
        if !self.flake_dir.join(FLAKE_MARKER).is_file() {
            return Err(PolicyError::MissingFlake {
                dir: self.flake_dir.clone(),
                hint: self.flake_hint.clone(),
            });
        }

        Ok(())
    }
}

/// Plan resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Host name cannot be determined.
    #[error(
        "host name is required and could not be inferred from {:?}",
        path.display()
    )]
    MissingHost { path: PathBuf },

    /// Flake directory has no flake.
    #[error(
        "could not find flake.nix in {:?}{}",
        dir.display(),
        hint.as_deref().map(|hint| format!("\n{hint}")).unwrap_or_default()
    )]
    MissingFlake { dir: PathBuf, hint: Option<String> },

    /// Developer checkout requested but not found.
    #[error(
        "--dev needs a developer checkout, but none was found\n\
         hint: run the binary from inside your checkout, or pass --flake PATH"
    )]
    NoCheckout,
}

impl PolicyError {
    /// Exit code this error maps to, if it has a dedicated one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::MissingHost { .. } => Some(EXIT_NO_HOST),
            Self::MissingFlake { .. } => Some(EXIT_NO_FLAKE),
            Self::NoCheckout => None,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = PolicyError> = std::result::Result<T, E>;
