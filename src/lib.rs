// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Rebuild NixOS from a root-owned flake checkout kept in sync with upstream.
//!
//! The system flake normally lives in a root-owned directory like
//! `/etc/nixos`, while the network credentials needed to reach upstream belong
//! to the invoking user. Root is never handed those credentials. Instead the
//! user keeps a local __mirror__ of upstream current, and root only ever
//! fast-forwards its checkout from that mirror:
//!
//! ```text
//! upstream ──(user, network)──► mirror ──(root, local only)──► /etc/nixos
//! ```
//!
//! Once the system checkout is current, the process replaces itself with
//! `nixos-rebuild`.

pub mod apply;
pub mod config;
pub mod locate;
pub mod mirror;
pub mod path;
pub mod policy;
pub mod privilege;
pub mod sync;
pub mod syscall;
pub mod target;
