// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the optional settings file that flakesync reads at
//! startup. Every key is optional. Anything left out falls back to a built-in
//! default, and anything given on the command line wins over both.

use crate::path::{DEFAULT_HOSTNAME_FILE, DEFAULT_MIRROR_DIR, DEFAULT_SYSTEM_FLAKE_DIR};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Settings file layout.
///
/// # General Layout
///
/// Three tables make up the settings file: `[sync]` shapes how the system
/// flake checkout is kept current, `[privilege]` names the escalation helper,
/// and `[repo]` describes how the developer checkout and host identity are
/// discovered.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Synchronization defaults.
    pub sync: SyncSettings,

    /// Privilege escalation defaults.
    pub privilege: PrivilegeSettings,

    /// Repository discovery defaults.
    pub repo: RepoSettings,
}

impl Settings {
    /// Load settings from file.
    ///
    /// A missing file is not an error, it just yields the default settings.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match read_to_string(path) {
            Ok(content) => {
                debug!("load settings from {}", path.display());
                content.parse()
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(ConfigError::Read {
                source: err,
                path: path.into(),
            }),
        }
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        settings.sync.flake_dir = expand(&settings.sync.flake_dir)?;
        settings.sync.mirror_dir = expand(&settings.sync.mirror_dir)?;
        settings.repo.hostname_file = expand(&settings.repo.hostname_file)?;

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Synchronization settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Root-owned checkout that the system is built from.
    pub flake_dir: PathBuf,

    /// Go through the local mirror instead of syncing directly.
    pub mirror: bool,

    /// Location of the local mirror.
    pub mirror_dir: PathBuf,

    /// Ref to fast-forward the system checkout to.
    pub sync_ref: String,

    /// Keep going when the network is unreachable.
    pub offline_ok: bool,

    /// Name of the developer checkout's upstream remote.
    pub remote: String,

    /// Explicit upstream URL, used instead of the developer checkout's remote.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            flake_dir: DEFAULT_SYSTEM_FLAKE_DIR.into(),
            mirror: true,
            mirror_dir: DEFAULT_MIRROR_DIR.into(),
            sync_ref: "origin/main".into(),
            offline_ok: false,
            remote: "origin".into(),
            upstream: None,
        }
    }
}

/// Privilege escalation settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrivilegeSettings {
    /// Escalation helper command, e.g., "sudo", "doas", or "sudo --".
    pub helper: String,
}

impl Default for PrivilegeSettings {
    fn default() -> Self {
        Self {
            helper: "sudo".into(),
        }
    }
}

/// Repository discovery settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepoSettings {
    /// Files that must exist at the top-level of the developer checkout.
    pub marker_files: Vec<String>,

    /// Directories that must exist at the top-level of the developer checkout.
    pub marker_dirs: Vec<String>,

    /// File holding this machine's host name.
    pub hostname_file: PathBuf,
}

impl Default for RepoSettings {
    fn default() -> Self {
        Self {
            marker_files: vec!["flake.nix".into()],
            marker_dirs: vec!["hosts".into()],
            hostname_file: DEFAULT_HOSTNAME_FILE.into(),
        }
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(shellexpand::full(path.to_string_lossy().as_ref())
        .map_err(ConfigError::ShellExpansion)?
        .into_owned()
        .into())
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read settings file.
    #[error("failed to read settings from {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("BLAH", "/home/blah")])]
    fn deserialize_settings() -> anyhow::Result<()> {
        let result: Settings = r#"
            [sync]
            flake_dir = "$BLAH/nixos"
            mirror = false
            mirror_dir = "$BLAH/mirror.git"
            sync_ref = "origin/trunk"
            offline_ok = true
            upstream = "git@example.org:blah/nixos.git"

            [privilege]
            helper = "doas"

            [repo]
            marker_dirs = ["scripts"]
        "#
        .parse()?;

        let expect = Settings {
            sync: SyncSettings {
                flake_dir: "/home/blah/nixos".into(),
                mirror: false,
                mirror_dir: "/home/blah/mirror.git".into(),
                sync_ref: "origin/trunk".into(),
                offline_ok: true,
                remote: "origin".into(),
                upstream: Some("git@example.org:blah/nixos.git".into()),
            },
            privilege: PrivilegeSettings {
                helper: "doas".into(),
            },
            repo: RepoSettings {
                marker_files: vec!["flake.nix".into()],
                marker_dirs: vec!["scripts".into()],
                hostname_file: "/etc/hostname".into(),
            },
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn empty_settings_use_defaults() -> anyhow::Result<()> {
        let result: Settings = "".parse()?;
        assert_eq!(result, Settings::default());

        Ok(())
    }

    #[test]
    fn missing_settings_file_uses_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = Settings::load(dir.path().join("config.toml"))?;
        assert_eq!(result, Settings::default());

        Ok(())
    }

    #[test]
    fn malformed_settings_are_rejected() {
        let result = "[sync]\nmirror = \"yes please\"".parse::<Settings>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }

    #[test]
    fn serialize_settings() -> anyhow::Result<()> {
        let mut settings = Settings::default();
        settings.sync.upstream = Some("https://example.org/nixos.git".into());
        let result = settings.to_string();

        assert!(result.starts_with(indoc! {r#"
            [sync]
            flake_dir = "/etc/nixos"
            mirror = true
        "#}));
        assert_eq!(result.parse::<Settings>()?, settings);

        Ok(())
    }
}
