// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

/// Root-owned location of the live system flake checkout.
pub const DEFAULT_SYSTEM_FLAKE_DIR: &str = "/etc/nixos";

/// Default location of the local mirror shared between user and root.
pub const DEFAULT_MIRROR_DIR: &str = "/var/lib/nixos-setup/mirror.git";

/// Default host identity file.
pub const DEFAULT_HOSTNAME_FILE: &str = "/etc/hostname";

/// Determine default absolute path to configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/flakesync/config.toml` as
/// the default. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("flakesync").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Read host name from host identity file.
///
/// All whitespace is stripped from the file content. Returns `None` if the
/// file cannot be read, or nothing remains after stripping.
pub fn read_hostname(path: impl AsRef<Path>) -> Option<String> {
    let raw = read_to_string(path.as_ref()).ok()?;
    let host: String = raw.chars().filter(|ch| !ch.is_whitespace()).collect();
    (!host.is_empty()).then_some(host)
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
