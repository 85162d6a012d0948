// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Credential prompts for mirror transfers.
//!
//! Only the user-side network operations ever prompt. Without a terminal on
//! standard input nothing is asked at all, and the transfer fails with no
//! credentials, which offline tolerance can then absorb.

use auth_git2::Prompter;
use indicatif::ProgressBar;
use inquire::{Password, Text};
use std::{
    io::{stdin, IsTerminal},
    path::Path,
};
use tracing::{instrument, warn};

/// Credential prompter that draws around a transfer progress bar.
#[derive(Debug, Clone)]
pub struct TransferPrompter {
    bar: ProgressBar,
    interactive: bool,
}

impl TransferPrompter {
    /// Construct new prompter, asking only if standard input is a terminal.
    pub fn new(bar: ProgressBar) -> Self {
        Self::with_interactive(bar, stdin().is_terminal())
    }

    pub(crate) fn with_interactive(bar: ProgressBar, interactive: bool) -> Self {
        Self { bar, interactive }
    }

    /// Ask for a secret with the progress bar out of the way.
    fn secret(&self, label: &str, about: &str) -> Option<String> {
        if !self.interactive {
            warn!("{about}, but there is no terminal to ask on");
            return None;
        }

        self.bar.suspend(|| {
            Password::new(label)
                .with_help_message(about)
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

impl Prompter for TransferPrompter {
    #[instrument(skip(self, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        let about = format!("credentials required for {url}");
        if !self.interactive {
            warn!("{about}, but there is no terminal to ask on");
            return None;
        }

        let username = self.bar.suspend(|| {
            Text::new("username")
                .with_help_message(&about)
                .prompt()
                .ok()
        })?;
        let password = self.secret("password", &about)?;

        Some((username, password))
    }

    #[instrument(skip(self, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        self.secret("password", &format!("password of {username} required for {url}"))
    }

    #[instrument(skip(self, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        self.secret(
            "passphrase",
            &format!("passphrase of {} required", ssh_key_path.display()),
        )
    }
}
