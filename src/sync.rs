// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Synchronization of the system checkout.
//!
//! Sequences the mirror store and the system checkout manager under one
//! [`SyncPolicy`], and decides whether the invocation may go on to apply the
//! configuration. Nothing here talks to Git directly; every step goes through
//! the [`MirrorStore`] and [`TargetCheckout`] seams.
//!
//! # Mirror Mode
//!
//! 1. Resolve upstream URL, always fatal when missing.
//! 2. Ensure mirror exists, fatal on failure.
//! 3. Refresh mirror. Under offline tolerance a failure falls back to pushing
//!    the developer checkout's branch into the mirror, whatever the outcome.
//! 4. Ensure system checkout exists, always fatal on failure.
//! 5. Retarget and fast-forward system checkout. Under offline tolerance a
//!    failure leaves the existing content in place.
//!
//! # Direct Mode
//!
//! The developer checkout is fetched as the current user, and the system
//! checkout fast-forwards straight from it. No mirror is involved.

use crate::{
    mirror::{Git2Mirror, MirrorError, MirrorState, MirrorStore},
    target::{CheckoutState, CloneOutcome, GitTarget, TargetCheckout, TargetError},
};

use std::path::PathBuf;
use tracing::{info, instrument, warn};

/// How the system checkout is brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Leave system checkout alone.
    Skip,

    /// Go through the local mirror.
    Mirror,

    /// Fast-forward straight from the developer checkout.
    Direct,
}

/// Resolved synchronization policy of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// How to synchronize.
    pub mode: SyncMode,

    /// System checkout to bring up to date.
    pub target_dir: PathBuf,

    /// Location of local mirror.
    pub mirror_dir: PathBuf,

    /// Ref to fast-forward to, e.g., "origin/main".
    pub sync_ref: String,

    /// Tolerate network failure.
    pub offline_ok: bool,

    /// Developer checkout, if one could be located.
    pub developer_repo: Option<PathBuf>,

    /// Upstream remote name of developer checkout.
    pub remote: String,

    /// Explicit upstream URL overriding the developer checkout's remote.
    pub upstream: Option<String>,
}

impl SyncPolicy {
    /// Local branch name that [`SyncPolicy::sync_ref`] tracks.
    ///
    /// Strips a leading `refs/heads/`, `refs/remotes/<remote>/`, or
    /// `<remote>/`, so "origin/main" yields "main".
    pub fn branch(&self) -> &str {
        let full = format!("refs/remotes/{}/", self.remote);
        let short = format!("{}/", self.remote);
        let sync_ref = self.sync_ref.as_str();

        sync_ref
            .strip_prefix("refs/heads/")
            .or_else(|| sync_ref.strip_prefix(full.as_str()))
            .or_else(|| sync_ref.strip_prefix(short.as_str()))
            .unwrap_or(sync_ref)
    }
}

/// Something that happened during synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStep {
    /// Synchronization disabled.
    Skipped,

    /// Mirror freshly cloned from upstream.
    MirrorCreated,

    /// Mirror refreshed from upstream.
    MirrorFetched,

    /// Upstream unreachable, developer checkout pushed into mirror instead.
    MirrorPushedFromCheckout,

    /// Upstream unreachable, mirror left as is.
    MirrorStale,

    /// Developer checkout refreshed from upstream.
    CheckoutFetched,

    /// Developer checkout left as is.
    CheckoutStale,

    /// System checkout freshly cloned.
    TargetCloned,

    /// Foreign system checkout moved aside and freshly cloned.
    TargetBackedUp { backup: PathBuf },

    /// System checkout remote pointed at mirror.
    TargetRetargeted,

    /// System checkout fast-forwarded.
    TargetFastForwarded,

    /// System checkout left with its existing content.
    TargetStale,
}

/// Everything that happened during one synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Steps taken, in order.
    pub steps: Vec<SyncStep>,

    /// Failures that were tolerated under offline tolerance.
    pub tolerated: Vec<String>,
}

impl SyncReport {
    fn step(&mut self, step: SyncStep) {
        self.steps.push(step);
    }

    fn tolerate(&mut self, what: &str, error: &dyn std::error::Error) {
        warn!("{what} failed, continuing offline: {error}");
        self.tolerated.push(format!("{what}: {error}"));
    }

    /// Check if any failure was tolerated.
    pub fn is_degraded(&self) -> bool {
        !self.tolerated.is_empty()
    }
}

/// Synchronization orchestrator.
#[derive(Debug)]
pub struct Synchronizer<M = Git2Mirror, T = GitTarget>
where
    M: MirrorStore,
    T: TargetCheckout,
{
    mirror: M,
    target: T,
}

impl<M, T> Synchronizer<M, T>
where
    M: MirrorStore,
    T: TargetCheckout,
{
    /// Construct new synchronizer.
    pub fn new(mirror: M, target: T) -> Self {
        Self { mirror, target }
    }

    /// Bring system checkout up to date according to `policy`.
    ///
    /// Returns once it is safe to apply the configuration.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::NoUpstream`] if no upstream URL can be found.
    /// - Return [`SyncError::NoDeveloperCheckout`] if direct mode has no
    ///   developer checkout to sync from.
    /// - Return [`SyncError::NotACheckout`] if direct mode finds no tracked
    ///   system checkout.
    /// - Return [`SyncError::Mirror`] or [`SyncError::Target`] for any failure
    ///   that the policy does not tolerate.
    #[instrument(skip(self, policy), level = "debug")]
    pub fn run(&self, policy: &SyncPolicy) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        match policy.mode {
            SyncMode::Skip => {
                info!("sync disabled, using {} as is", policy.target_dir.display());
                report.step(SyncStep::Skipped);
            }
            SyncMode::Mirror => self.run_mirror(policy, &mut report)?,
            SyncMode::Direct => self.run_direct(policy, &mut report)?,
        }

        Ok(report)
    }

    fn upstream(&self, policy: &SyncPolicy) -> Result<String> {
        if let Some(url) = policy.upstream.as_deref().map(str::trim) {
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }

        let developer_repo = policy
            .developer_repo
            .as_deref()
            .ok_or(SyncError::NoUpstream)?;

        Ok(self.mirror.upstream_url(developer_repo, &policy.remote)?)
    }

    fn run_mirror(&self, policy: &SyncPolicy, report: &mut SyncReport) -> Result<()> {
        let mirror_dir = policy.mirror_dir.as_path();
        let target_dir = policy.target_dir.as_path();

        let upstream = self.upstream(policy)?;
        info!("sync {} through mirror {}", target_dir.display(), mirror_dir.display());

        match self.mirror.ensure(mirror_dir, &upstream)? {
            MirrorState::Created => report.step(SyncStep::MirrorCreated),
            MirrorState::Existing => match self.mirror.fetch(mirror_dir) {
                Ok(()) => report.step(SyncStep::MirrorFetched),
                Err(err) if policy.offline_ok => {
                    report.tolerate("mirror fetch", &err);
                    self.fall_back_to_checkout(policy, report);
                }
                Err(err) => return Err(err.into()),
            },
        }

        match self.target.ensure_clone(mirror_dir, target_dir)? {
            CloneOutcome::AlreadyValid => {}
            CloneOutcome::Cloned => report.step(SyncStep::TargetCloned),
            CloneOutcome::BackedUpAndCloned { backup } => {
                report.step(SyncStep::TargetBackedUp { backup })
            }
        }

        let updated = self
            .target
            .retarget(target_dir, mirror_dir)
            .and_then(|changed| {
                if changed {
                    report.step(SyncStep::TargetRetargeted);
                }
                self.target.fast_forward(target_dir, mirror_dir, &policy.sync_ref)
            });
        match updated {
            Ok(()) => report.step(SyncStep::TargetFastForwarded),
            Err(err) if policy.offline_ok => {
                report.tolerate("system checkout update", &err);
                report.step(SyncStep::TargetStale);
            }
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    fn fall_back_to_checkout(&self, policy: &SyncPolicy, report: &mut SyncReport) {
        let Some(developer_repo) = policy.developer_repo.as_deref() else {
            warn!("no developer checkout to fall back on, mirror stays as is");
            report.step(SyncStep::MirrorStale);
            return;
        };

        let branch = policy.branch();
        match self
            .mirror
            .push_from_developer_checkout(developer_repo, &policy.mirror_dir, branch)
        {
            Ok(()) => {
                info!("mirror updated from {} instead", developer_repo.display());
                report.step(SyncStep::MirrorPushedFromCheckout);
            }
            Err(err) => {
                report.tolerate("push from developer checkout", &err);
                report.step(SyncStep::MirrorStale);
            }
        }
    }

    fn run_direct(&self, policy: &SyncPolicy, report: &mut SyncReport) -> Result<()> {
        let target_dir = policy.target_dir.as_path();
        let developer_repo = policy
            .developer_repo
            .as_deref()
            .ok_or(SyncError::NoDeveloperCheckout)?;
        info!(
            "sync {} directly from {}",
            target_dir.display(),
            developer_repo.display()
        );

        match self.mirror.fetch_checkout(developer_repo, &policy.remote) {
            Ok(()) => report.step(SyncStep::CheckoutFetched),
            Err(err) if policy.offline_ok => {
                report.tolerate("developer checkout fetch", &err);
                report.step(SyncStep::CheckoutStale);
            }
            Err(err) => return Err(err.into()),
        }

        let state = self.target.state(target_dir);
        if !matches!(state, CheckoutState::Valid | CheckoutState::Incomplete) {
            return Err(SyncError::NotACheckout {
                path: target_dir.into(),
                state,
            });
        }

        match self
            .target
            .fast_forward_from(target_dir, developer_repo, &policy.sync_ref)
        {
            Ok(()) => report.step(SyncStep::TargetFastForwarded),
            Err(err) if policy.offline_ok => {
                report.tolerate("system checkout update", &err);
                report.step(SyncStep::TargetStale);
            }
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }
}

/// Synchronization error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No upstream URL, and no developer checkout to read one from.
    #[error(
        "no upstream configured: no developer checkout was found to read it from\n\
         hint: set sync.upstream in the settings file"
    )]
    NoUpstream,

    /// Direct sync without developer checkout.
    #[error(
        "direct sync needs a developer checkout, but none was found\n\
         hint: rerun with --mirror, or run the binary from inside your checkout"
    )]
    NoDeveloperCheckout,

    /// Direct sync target is not tracked by Git.
    #[error(
        "{:?} is not a Git checkout ({state:?}), cannot sync it directly\n\
         hint: rerun with --mirror to have it cloned",
        path.display()
    )]
    NotACheckout { path: PathBuf, state: CheckoutState },

    /// Mirror store failed.
    #[error(transparent)]
    Mirror(#[from] MirrorError),

    /// System checkout manager failed.
    #[error(transparent)]
    Target(#[from] TargetError),
}

impl SyncError {
    /// Exit code of the subprocess that caused this error, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Mirror(err) => err.exit_code(),
            Self::Target(err) => err.exit_code(),
            _ => None,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::syscall::SyscallError;
    use simple_test_case::test_case;
    use std::{cell::RefCell, path::Path};

    /// Scripted outcome of a fake operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Outcome {
        Pass,
        Fail,
    }

    use Outcome::*;

    #[derive(Debug)]
    struct FakeMirror {
        upstream: Option<&'static str>,
        existing: bool,
        ensure: Outcome,
        fetch: Outcome,
        push: Outcome,
        calls: RefCell<Vec<String>>,
    }

    impl Default for FakeMirror {
        fn default() -> Self {
            Self {
                upstream: Some("git@example.org:me/nixos.git"),
                existing: true,
                ensure: Pass,
                fetch: Pass,
                push: Pass,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    fn offline() -> git2::Error {
        git2::Error::new(git2::ErrorCode::GenericError, git2::ErrorClass::Net, "offline")
    }

    impl MirrorStore for FakeMirror {
        fn upstream_url(
            &self,
            developer_repo: &Path,
            remote: &str,
        ) -> crate::mirror::Result<String> {
            self.calls.borrow_mut().push("upstream_url".into());
            self.upstream
                .map(ToString::to_string)
                .ok_or(MirrorError::NoUpstreamConfigured {
                    remote: remote.into(),
                    repo: developer_repo.into(),
                })
        }

        fn ensure(
            &self,
            mirror_path: &Path,
            upstream_url: &str,
        ) -> crate::mirror::Result<MirrorState> {
            self.calls.borrow_mut().push(format!("ensure {upstream_url}"));
            match (self.ensure, self.existing) {
                (Fail, _) => Err(MirrorError::Create {
                    source: offline(),
                    url: upstream_url.into(),
                    path: mirror_path.into(),
                }),
                (Pass, true) => Ok(MirrorState::Existing),
                (Pass, false) => Ok(MirrorState::Created),
            }
        }

        fn fetch(&self, mirror_path: &Path) -> crate::mirror::Result<()> {
            self.calls.borrow_mut().push("fetch".into());
            match self.fetch {
                Pass => Ok(()),
                Fail => Err(MirrorError::Fetch {
                    source: offline(),
                    path: mirror_path.into(),
                    network: true,
                }),
            }
        }

        fn push_from_developer_checkout(
            &self,
            developer_repo: &Path,
            _mirror_path: &Path,
            branch: &str,
        ) -> crate::mirror::Result<()> {
            self.calls.borrow_mut().push(format!("push {branch}"));
            match self.push {
                Pass => Ok(()),
                Fail => Err(MirrorError::BranchNotFound {
                    branch: branch.into(),
                    repo: developer_repo.into(),
                }),
            }
        }

        fn fetch_checkout(
            &self,
            developer_repo: &Path,
            _remote: &str,
        ) -> crate::mirror::Result<()> {
            self.calls.borrow_mut().push("fetch_checkout".into());
            match self.fetch {
                Pass => Ok(()),
                Fail => Err(MirrorError::Fetch {
                    source: offline(),
                    path: developer_repo.into(),
                    network: true,
                }),
            }
        }
    }

    #[derive(Debug)]
    struct FakeTarget {
        state: CheckoutState,
        clone: Outcome,
        retargets: bool,
        fast_forward: Outcome,
        calls: RefCell<Vec<String>>,
    }

    impl Default for FakeTarget {
        fn default() -> Self {
            Self {
                state: CheckoutState::Valid,
                clone: Pass,
                retargets: false,
                fast_forward: Pass,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    fn dirty(path: &Path) -> TargetError {
        TargetError::Dirty {
            path: path.into(),
            status: " M flake.nix".into(),
        }
    }

    impl TargetCheckout for FakeTarget {
        fn state(&self, _target_dir: &Path) -> CheckoutState {
            self.state
        }

        fn ensure_clone(
            &self,
            _mirror_path: &Path,
            target_dir: &Path,
        ) -> crate::target::Result<CloneOutcome> {
            self.calls.borrow_mut().push("ensure_clone".into());
            match (self.clone, self.state) {
                (Fail, _) => Err(TargetError::ReadOnly {
                    path: target_dir.into(),
                }),
                (Pass, CheckoutState::Absent) => Ok(CloneOutcome::Cloned),
                (Pass, CheckoutState::Foreign) => Ok(CloneOutcome::BackedUpAndCloned {
                    backup: crate::target::sibling(target_dir, "bak", 1),
                }),
                (Pass, _) => Ok(CloneOutcome::AlreadyValid),
            }
        }

        fn retarget(&self, _target_dir: &Path, _mirror_path: &Path) -> crate::target::Result<bool> {
            self.calls.borrow_mut().push("retarget".into());
            Ok(self.retargets)
        }

        fn fast_forward(
            &self,
            target_dir: &Path,
            _mirror_path: &Path,
            git_ref: &str,
        ) -> crate::target::Result<()> {
            self.calls.borrow_mut().push(format!("fast_forward {git_ref}"));
            match self.fast_forward {
                Pass => Ok(()),
                Fail => Err(dirty(target_dir)),
            }
        }

        fn fast_forward_from(
            &self,
            target_dir: &Path,
            _source_repo: &Path,
            source_ref: &str,
        ) -> crate::target::Result<()> {
            self.calls.borrow_mut().push(format!("fast_forward_from {source_ref}"));
            match self.fast_forward {
                Pass => Ok(()),
                Fail => Err(dirty(target_dir)),
            }
        }
    }

    fn policy(mode: SyncMode, offline_ok: bool) -> SyncPolicy {
        SyncPolicy {
            mode,
            target_dir: "/etc/nixos".into(),
            mirror_dir: "/var/lib/nixos-setup/mirror.git".into(),
            sync_ref: "origin/main".into(),
            offline_ok,
            developer_repo: Some("/home/me/nixos".into()),
            remote: "origin".into(),
            upstream: None,
        }
    }

    fn calls(sync: &Synchronizer<FakeMirror, FakeTarget>) -> (Vec<String>, Vec<String>) {
        (
            sync.mirror.calls.borrow().clone(),
            sync.target.calls.borrow().clone(),
        )
    }

    #[test_case("origin/main", "main"; "short remote ref")]
    #[test_case("refs/remotes/origin/trunk", "trunk"; "full remote ref")]
    #[test_case("refs/heads/release", "release"; "local branch ref")]
    #[test_case("main", "main"; "bare branch")]
    #[test]
    fn policy_branch_from_sync_ref(sync_ref: &str, expect: &str) {
        let mut policy = policy(SyncMode::Mirror, false);
        policy.sync_ref = sync_ref.into();
        pretty_assertions::assert_eq!(policy.branch(), expect);
    }

    #[test]
    fn skip_touches_nothing() -> anyhow::Result<()> {
        let sync = Synchronizer::new(FakeMirror::default(), FakeTarget::default());
        let report = sync.run(&policy(SyncMode::Skip, false))?;

        assert_eq!(report.steps, vec![SyncStep::Skipped]);
        assert_eq!(calls(&sync), (vec![], vec![]));

        Ok(())
    }

    #[test]
    fn fresh_machine_creates_mirror_and_clones() -> anyhow::Result<()> {
        let mirror = FakeMirror {
            existing: false,
            ..Default::default()
        };
        let target = FakeTarget {
            state: CheckoutState::Absent,
            ..Default::default()
        };
        let sync = Synchronizer::new(mirror, target);
        let report = sync.run(&policy(SyncMode::Mirror, false))?;

        assert_eq!(
            report.steps,
            vec![
                SyncStep::MirrorCreated,
                SyncStep::TargetCloned,
                SyncStep::TargetFastForwarded
            ]
        );
        assert!(!report.is_degraded());
        assert_eq!(
            calls(&sync),
            (
                vec!["upstream_url".into(), "ensure git@example.org:me/nixos.git".into()],
                vec![
                    "ensure_clone".into(),
                    "retarget".into(),
                    "fast_forward origin/main".into()
                ]
            )
        );

        Ok(())
    }

    #[test]
    fn explicit_upstream_skips_developer_checkout() -> anyhow::Result<()> {
        let mut policy = policy(SyncMode::Mirror, false);
        policy.developer_repo = None;
        policy.upstream = Some("https://example.org/nixos.git".into());
        let sync = Synchronizer::new(FakeMirror::default(), FakeTarget::default());
        sync.run(&policy)?;

        let (mirror_calls, _) = calls(&sync);
        assert_eq!(mirror_calls[0], "ensure https://example.org/nixos.git");

        Ok(())
    }

    #[test]
    fn missing_upstream_is_fatal_even_offline() {
        let mirror = FakeMirror {
            upstream: None,
            ..Default::default()
        };
        let sync = Synchronizer::new(mirror, FakeTarget::default());
        let result = sync.run(&policy(SyncMode::Mirror, true));

        assert!(matches!(
            result,
            Err(SyncError::Mirror(MirrorError::NoUpstreamConfigured { .. }))
        ));
        assert_eq!(calls(&sync).1, Vec::<String>::new());
    }

    #[test]
    fn missing_developer_checkout_and_upstream_is_fatal() {
        let mut policy = policy(SyncMode::Mirror, true);
        policy.developer_repo = None;
        let sync = Synchronizer::new(FakeMirror::default(), FakeTarget::default());

        assert!(matches!(sync.run(&policy), Err(SyncError::NoUpstream)));
    }

    #[test]
    fn mirror_creation_failure_is_fatal_even_offline() {
        let mirror = FakeMirror {
            existing: false,
            ensure: Fail,
            ..Default::default()
        };
        let sync = Synchronizer::new(mirror, FakeTarget::default());
        let result = sync.run(&policy(SyncMode::Mirror, true));

        assert!(matches!(result, Err(SyncError::Mirror(MirrorError::Create { .. }))));
        assert_eq!(calls(&sync).1, Vec::<String>::new());
    }

    #[test]
    fn fetch_failure_is_fatal_when_online() {
        let mirror = FakeMirror {
            fetch: Fail,
            ..Default::default()
        };
        let sync = Synchronizer::new(mirror, FakeTarget::default());
        let result = sync.run(&policy(SyncMode::Mirror, false));

        assert!(matches!(result, Err(SyncError::Mirror(MirrorError::Fetch { .. }))));
        assert_eq!(calls(&sync).1, Vec::<String>::new());
    }

    #[test_case(Pass, SyncStep::MirrorPushedFromCheckout, 1; "push succeeds")]
    #[test_case(Fail, SyncStep::MirrorStale, 2; "push fails too")]
    #[test]
    fn fetch_failure_offline_falls_back_to_push(push: Outcome, step: SyncStep, tolerated: usize) {
        let mirror = FakeMirror {
            fetch: Fail,
            push,
            ..Default::default()
        };
        let sync = Synchronizer::new(mirror, FakeTarget::default());
        let report = sync.run(&policy(SyncMode::Mirror, true)).unwrap();

        pretty_assertions::assert_eq!(report.steps, vec![step, SyncStep::TargetFastForwarded]);
        pretty_assertions::assert_eq!(report.tolerated.len(), tolerated);
        assert!(calls(&sync).0.contains(&"push main".to_string()));
    }

    #[test]
    fn fetch_failure_offline_without_checkout_keeps_stale_mirror() -> anyhow::Result<()> {
        let mut policy = policy(SyncMode::Mirror, true);
        policy.developer_repo = None;
        policy.upstream = Some("https://example.org/nixos.git".into());
        let mirror = FakeMirror {
            fetch: Fail,
            ..Default::default()
        };
        let sync = Synchronizer::new(mirror, FakeTarget::default());
        let report = sync.run(&policy)?;

        assert_eq!(report.steps[0], SyncStep::MirrorStale);
        assert!(!calls(&sync).0.iter().any(|call| call.starts_with("push")));

        Ok(())
    }

    #[test]
    fn clone_failure_is_fatal_even_offline() {
        let target = FakeTarget {
            clone: Fail,
            ..Default::default()
        };
        let sync = Synchronizer::new(FakeMirror::default(), target);
        let result = sync.run(&policy(SyncMode::Mirror, true));

        assert!(matches!(result, Err(SyncError::Target(TargetError::ReadOnly { .. }))));
        assert_eq!(calls(&sync).1, vec!["ensure_clone".to_string()]);
    }

    #[test]
    fn foreign_target_is_backed_up() -> anyhow::Result<()> {
        let target = FakeTarget {
            state: CheckoutState::Foreign,
            retargets: true,
            ..Default::default()
        };
        let sync = Synchronizer::new(FakeMirror::default(), target);
        let report = sync.run(&policy(SyncMode::Mirror, false))?;

        assert_eq!(
            report.steps,
            vec![
                SyncStep::MirrorFetched,
                SyncStep::TargetBackedUp {
                    backup: "/etc/nixos.bak.1".into()
                },
                SyncStep::TargetRetargeted,
                SyncStep::TargetFastForwarded,
            ]
        );

        Ok(())
    }

    #[test]
    fn fast_forward_failure_is_fatal_when_online() {
        let target = FakeTarget {
            fast_forward: Fail,
            ..Default::default()
        };
        let sync = Synchronizer::new(FakeMirror::default(), target);
        let result = sync.run(&policy(SyncMode::Mirror, false));

        assert!(matches!(result, Err(SyncError::Target(TargetError::Dirty { .. }))));
    }

    #[test]
    fn fast_forward_failure_offline_keeps_stale_checkout() -> anyhow::Result<()> {
        let target = FakeTarget {
            fast_forward: Fail,
            ..Default::default()
        };
        let sync = Synchronizer::new(FakeMirror::default(), target);
        let report = sync.run(&policy(SyncMode::Mirror, true))?;

        assert_eq!(
            report.steps,
            vec![SyncStep::MirrorFetched, SyncStep::TargetStale]
        );
        assert!(report.is_degraded());

        Ok(())
    }

    #[test]
    fn direct_mode_fast_forwards_from_checkout() -> anyhow::Result<()> {
        let sync = Synchronizer::new(FakeMirror::default(), FakeTarget::default());
        let report = sync.run(&policy(SyncMode::Direct, false))?;

        assert_eq!(
            report.steps,
            vec![SyncStep::CheckoutFetched, SyncStep::TargetFastForwarded]
        );
        assert_eq!(
            calls(&sync),
            (
                vec!["fetch_checkout".into()],
                vec!["fast_forward_from origin/main".into()]
            )
        );

        Ok(())
    }

    #[test]
    fn direct_mode_refuses_untracked_target() {
        let target = FakeTarget {
            state: CheckoutState::Foreign,
            ..Default::default()
        };
        let sync = Synchronizer::new(FakeMirror::default(), target);
        let result = sync.run(&policy(SyncMode::Direct, false));

        assert!(matches!(
            result,
            Err(SyncError::NotACheckout {
                state: CheckoutState::Foreign,
                ..
            })
        ));
        assert_eq!(calls(&sync).1, Vec::<String>::new());
    }

    #[test]
    fn direct_mode_offline_tolerates_fetch_failure() -> anyhow::Result<()> {
        let mirror = FakeMirror {
            fetch: Fail,
            ..Default::default()
        };
        let sync = Synchronizer::new(mirror, FakeTarget::default());
        let report = sync.run(&policy(SyncMode::Direct, true))?;

        assert_eq!(
            report.steps,
            vec![SyncStep::CheckoutStale, SyncStep::TargetFastForwarded]
        );

        Ok(())
    }

    #[test]
    fn direct_mode_needs_developer_checkout() {
        let mut policy = policy(SyncMode::Direct, false);
        policy.developer_repo = None;
        let sync = Synchronizer::new(FakeMirror::default(), FakeTarget::default());

        assert!(matches!(sync.run(&policy), Err(SyncError::NoDeveloperCheckout)));
    }

    #[test]
    fn exit_code_of_failed_subprocess_is_kept() {
        let error = SyncError::Target(TargetError::Clone {
            source: Box::new(TargetError::Syscall(SyscallError::Failed {
                command: "sudo git clone".into(),
                code: Some(5),
                message: String::new(),
            })),
            mirror: "/var/lib/nixos-setup/mirror.git".into(),
            path: "/etc/nixos".into(),
        });
        assert_eq!(error.exit_code(), Some(5));

        let error = SyncError::Target(dirty(Path::new("/etc/nixos")));
        assert_eq!(error.exit_code(), None);
        assert_eq!(SyncError::NoUpstream.exit_code(), None);
    }
}
