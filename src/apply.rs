// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Apply the system configuration.
//!
//! The last thing `rebuild` ever does is replace itself with `nixos-rebuild`.
//! There is no coming back from a successful apply, so [`ApplyCommand::exec`]
//! only ever returns an error.

use crate::privilege::{Privilege, PrivilegeError};

use std::{
    ffi::OsString,
    fmt::{Display, Formatter, Result as FmtResult},
    os::unix::process::CommandExt,
    path::Path,
    process::Command,
};
use tracing::info;

/// What `nixos-rebuild` should do with the built configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Action {
    /// Build, activate, and make it the boot default.
    #[default]
    Switch,

    /// Build, and make it the boot default without activating.
    Boot,

    /// Build and activate without making it the boot default.
    Test,

    /// Only build.
    Build,

    /// Show what activation would do.
    DryActivate,
}

impl Action {
    /// Check if action touches the running system.
    pub fn needs_root(&self) -> bool {
        !matches!(self, Self::Build)
    }
}

impl Display for Action {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Switch => "switch",
            Self::Boot => "boot",
            Self::Test => "test",
            Self::Build => "build",
            Self::DryActivate => "dry-activate",
        };
        fmt.write_str(name)
    }
}

/// Final `nixos-rebuild` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCommand {
    argv: Vec<OsString>,
}

impl ApplyCommand {
    /// Construct `nixos-rebuild <action> --flake <flake_dir>/.#<hostname>`.
    ///
    /// Anything in `passthrough` is appended untouched. Routed through the
    /// escalation helper unless the action does not need root.
    ///
    /// # Errors
    ///
    /// - Return [`ApplyError::Privilege`] if root is needed, but cannot be
    ///   reached.
    pub fn new(
        privilege: &Privilege,
        action: Action,
        flake_dir: &Path,
        hostname: &str,
        passthrough: &[OsString],
    ) -> Result<Self> {
        let mut flake = flake_dir.as_os_str().to_os_string();
        flake.push(format!("/.#{hostname}"));

        let mut argv: Vec<OsString> = vec![
            "nixos-rebuild".into(),
            action.to_string().into(),
            "--flake".into(),
            flake,
        ];
        argv.extend(passthrough.iter().cloned());

        let argv = if action.needs_root() {
            privilege.command(argv)?
        } else {
            argv
        };

        Ok(Self { argv })
    }

    /// Argument vector to be executed.
    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// Replace current process with the apply command.
    ///
    /// Never returns on success. Whatever this returns is the reason the
    /// process image could not be replaced.
    pub fn exec(self) -> ApplyError {
        info!("running: {self}");
        let Some((program, args)) = self.argv.split_first() else {
            return ApplyError::Empty;
        };

        let source = Command::new(program).args(args).exec();
        ApplyError::Exec {
            source,
            command: self.to_string(),
        }
    }
}

impl Display for ApplyCommand {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&crate::syscall::display_argv(&self.argv))
    }
}

/// Apply error types.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Nothing to execute.
    #[error("cannot execute empty apply command")]
    Empty,

    /// Process image could not be replaced.
    #[error("failed to execute {command:?}")]
    Exec {
        #[source]
        source: std::io::Error,
        command: String,
    },

    /// Root is needed but cannot be reached.
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),
}

/// Friendly result alias :3
pub type Result<T, E = ApplyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::EscalationHelper;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn root_runs_rebuild_directly() -> anyhow::Result<()> {
        let command = ApplyCommand::new(
            &Privilege::new(0, None),
            Action::Switch,
            Path::new("/etc/nixos"),
            "myhost",
            &argv(&["--show-trace", "-L"]),
        )?;

        assert_eq!(
            command.argv(),
            argv(&[
                "nixos-rebuild",
                "switch",
                "--flake",
                "/etc/nixos/.#myhost",
                "--show-trace",
                "-L"
            ])
        );

        Ok(())
    }

    #[test_case("sudo", &["sudo"]; "sudo")]
    #[test_case("doas", &["doas"]; "doas")]
    #[test_case("sudo --preserve-env", &["sudo", "--preserve-env"]; "custom helper")]
    #[test]
    fn user_goes_through_helper(helper: &str, prefix: &[&str]) {
        let command = ApplyCommand::new(
            &Privilege::new(1000, EscalationHelper::parse(helper)),
            Action::Boot,
            Path::new("/etc/nixos"),
            "myhost",
            &[],
        )
        .unwrap();

        let mut expect = argv(prefix);
        expect.extend(argv(&["nixos-rebuild", "boot", "--flake", "/etc/nixos/.#myhost"]));
        pretty_assertions::assert_eq!(command.argv(), expect);
    }

    #[test]
    fn build_never_escalates() -> anyhow::Result<()> {
        let command = ApplyCommand::new(
            &Privilege::new(1000, None),
            Action::Build,
            Path::new("/home/me/nixos"),
            "laptop",
            &[],
        )?;

        assert_eq!(command.to_string(), "nixos-rebuild build --flake /home/me/nixos/.#laptop");

        Ok(())
    }

    #[test]
    fn switch_without_helper_is_refused() {
        let result = ApplyCommand::new(
            &Privilege::new(1000, None),
            Action::DryActivate,
            Path::new("/etc/nixos"),
            "myhost",
            &[],
        );

        assert!(matches!(result, Err(ApplyError::Privilege(_))));
    }

    #[test]
    fn exec_missing_program_returns_error() {
        let command = ApplyCommand {
            argv: argv(&["flakesync-definitely-not-a-program"]),
        };

        assert!(matches!(command.exec(), ApplyError::Exec { .. }));
    }
}
