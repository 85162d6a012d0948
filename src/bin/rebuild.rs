// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use flakesync::{
    apply::{Action, ApplyCommand},
    config::Settings,
    locate::{locate_repo_root, RepoMarkers},
    mirror::Git2Mirror,
    path::default_config_path,
    policy::{PolicyError, RebuildOptions, RebuildPlan, FLAKE_MARKER},
    privilege::Privilege,
    sync::{SyncError, Synchronizer},
    target::GitTarget,
};

use anyhow::{Context, Result};
use clap::Parser;
use std::{
    env::{current_dir, current_exe},
    ffi::OsString,
    path::PathBuf,
    process::exit,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "rebuild",
    about = "Run nixos-rebuild for a host, syncing the system flake first",
    long_about = "Run nixos-rebuild for the given host using the system flake.\n\
                  If HOSTNAME is omitted, the current host name from /etc/hostname is used.\n\n\
                  By default the flake lives in a root-owned system path, which is first\n\
                  fast-forwarded from a local mirror that you keep current with upstream.\n\
                  Everything after `--` is passed to nixos-rebuild untouched.",
    override_usage = "rebuild [options] [hostname] [-- <nixos-rebuild args>...]",
    version
)]
struct Cli {
    /// Target host, defaults to content of host identity file.
    #[arg(value_name = "hostname")]
    pub hostname: Option<String>,

    /// Use developer checkout as flake source.
    #[arg(long)]
    pub dev: bool,

    /// Override flake directory to use.
    #[arg(long, value_name = "path")]
    pub flake: Option<PathBuf>,

    /// Sync system flake checkout before rebuilding, fast-forward only.
    #[arg(long, overrides_with = "no_sync")]
    pub sync: bool,

    /// Do not sync system flake checkout before rebuilding.
    #[arg(long, overrides_with = "sync")]
    pub no_sync: bool,

    /// Sync through local mirror of upstream.
    #[arg(long, overrides_with = "no_mirror")]
    pub mirror: bool,

    /// Sync straight from developer checkout.
    #[arg(long, overrides_with = "mirror")]
    pub no_mirror: bool,

    /// Location of local mirror.
    #[arg(long, value_name = "path")]
    pub mirror_dir: Option<PathBuf>,

    /// Git ref to fast-forward system flake checkout to.
    #[arg(long, value_name = "ref")]
    pub sync_ref: Option<String>,

    /// Keep going with stale content when upstream is unreachable.
    #[arg(long)]
    pub offline_ok: bool,

    /// Command used to gain root, e.g., "sudo" or "doas".
    #[arg(long, value_name = "command")]
    pub root_helper: Option<String>,

    /// What nixos-rebuild should do.
    #[arg(long, value_enum, default_value_t = Action::Switch)]
    pub action: Action,

    /// Print final nixos-rebuild command instead of running it.
    #[arg(long)]
    pub print_command: bool,

    /// Path to settings file.
    #[arg(long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Arguments passed to nixos-rebuild.
    #[arg(last = true, value_name = "nixos-rebuild args")]
    pub passthrough: Vec<OsString>,
}

impl Cli {
    fn options(&self) -> RebuildOptions {
        RebuildOptions {
            hostname: self.hostname.clone(),
            dev: self.dev,
            flake: self.flake.clone(),
            sync: toggle(self.sync, self.no_sync),
            mirror: toggle(self.mirror, self.no_mirror),
            mirror_dir: self.mirror_dir.clone(),
            sync_ref: self.sync_ref.clone(),
            offline_ok: self.offline_ok,
            root_helper: self.root_helper.clone(),
        }
    }

    fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => path.clone(),
            None => default_config_path()?,
        };
        let settings = Settings::load(&config)
            .with_context(|| format!("failed to load settings from {:?}", config.display()))?;

        let repo_root = developer_checkout(&settings);
        let plan = RebuildPlan::resolve(&self.options(), &settings, repo_root.as_deref())?;
        let privilege = Privilege::current(plan.helper.clone());

        let synchronizer = Synchronizer::new(
            Git2Mirror::new(privilege.clone()),
            GitTarget::new(privilege.clone(), FLAKE_MARKER),
        );
        let report = synchronizer.run(&plan.sync)?;
        if report.is_degraded() {
            warn!(
                "continuing with possibly stale {} after {} tolerated failure(s)",
                plan.flake_dir.display(),
                report.tolerated.len()
            );
        }
        debug!("sync steps: {:?}", report.steps);
        plan.check_flake()?;

        let command = ApplyCommand::new(
            &privilege,
            self.action,
            &plan.flake_dir,
            &plan.hostname,
            &self.passthrough,
        )?;

        if self.print_command {
            println!("{command}");
            return Ok(());
        }

        Err(command.exec().into())
    }
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = Cli::parse().run() {
        error!("{error:?}");
        exit(exit_code(&error));
    }

    exit(0)
}

fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// Locate developer checkout, trying binary location first and working
/// directory second.
fn developer_checkout(settings: &Settings) -> Option<PathBuf> {
    let markers = RepoMarkers::new(
        settings.repo.marker_files.iter().cloned(),
        settings.repo.marker_dirs.iter().cloned(),
    );
    let entrypoints = [current_exe().ok(), current_dir().ok()];
    for entrypoint in entrypoints.into_iter().flatten() {
        match locate_repo_root(&entrypoint, &markers) {
            Ok(root) => {
                info!("developer checkout at {}", root.display());
                return Some(root);
            }
            Err(err) => debug!("{err}"),
        }
    }

    None
}

fn exit_code(error: &anyhow::Error) -> i32 {
    let code = if let Some(err) = error.downcast_ref::<PolicyError>() {
        err.exit_code()
    } else if let Some(err) = error.downcast_ref::<SyncError>() {
        err.exit_code()
    } else {
        None
    };

    code.unwrap_or(1)
}
