// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control backends.
//!
//! The generation store only needs a narrow slice of what a version control
//! system offers: bare repositories with one branch per environment,
//! disposable working clones of a branch, commits, and pushes that either
//! fast-forward or get rejected. [`VersionControl`] captures exactly that
//! slice.
//!
//! # Repository Topology
//!
//! Each owner has one bare __generation repository__ on the local machine. It
//! may track an __upstream__ remote shared with other machines. Transactions
//! never touch the bare repository directly. Instead they clone the branch
//! they work on into a throwaway directory, commit there, and push back. The
//! push goes to the upstream first, then to the local bare repository, and is
//! fast-forward only unless a force push is explicitly requested.
//!
//! Two backends exist: [`Git2VersionControl`] backed by libgit2, and
//! [`MemoryVersionControl`] that keeps all history in memory for tests.

pub mod git;
pub mod memory;

pub use git::Git2VersionControl;
pub use memory::MemoryVersionControl;

use std::path::{Path, PathBuf};

/// Name of the upstream remote of a generation repository.
pub const UPSTREAM_REMOTE: &str = "upstream";

/// How a push treats a remote branch that moved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Reject the push unless it fast-forwards the remote branch.
    #[default]
    FastForward,

    /// Overwrite the remote branch, discarding its divergent history.
    Force,
}

/// Result of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    /// Remote branch now points at the pushed commit.
    Accepted,

    /// Remote branch has diverged and was left alone.
    Rejected(String),
}

/// Narrow interface to a version control system.
pub trait VersionControl {
    /// Create bare repository at path unless one already exists there.
    fn ensure_initialized(&self, repo: &Path) -> Result<()>;

    /// Check structural validity of repository at path.
    fn verify(&self, repo: &Path) -> Result<()>;

    /// Make branch exist and current.
    ///
    /// A missing branch is created as an orphan with a single empty commit.
    fn checkout(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Check if branch exists.
    fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool>;

    /// List local branches.
    fn list_branches(&self, repo: &Path) -> Result<Vec<String>>;

    /// Read a file from the tip of a branch without checking it out.
    ///
    /// Missing branches and files yield `None`.
    fn show_file(&self, repo: &Path, branch: &str, file: &Path) -> Result<Option<Vec<u8>>>;

    /// Configure upstream remote of repository.
    fn set_upstream(&self, repo: &Path, url: &str) -> Result<()>;

    /// Upstream remote URL of repository, if any.
    fn upstream(&self, repo: &Path) -> Result<Option<String>>;

    /// Fetch branch from upstream, fast-forwarding the local branch when
    /// possible. Without an upstream this does nothing.
    fn fetch(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Clone branch of repository into a fresh working directory.
    fn clone_branch(&self, repo: &Path, branch: &str, dest: &Path) -> Result<()>;

    /// Commit the whole working tree of a clone.
    fn commit_all(&self, worktree: &Path, message: &str) -> Result<()>;

    /// Push branch of a clone to the upstream, if any, then to the repository
    /// it was cloned from.
    fn push(&self, worktree: &Path, branch: &str, mode: PushMode) -> Result<PushStatus>;

    /// Push branch of repository to its upstream.
    fn push_upstream(&self, repo: &Path, branch: &str, mode: PushMode) -> Result<PushStatus>;
}

impl<V> VersionControl for &V
where
    V: VersionControl + ?Sized,
{
    fn ensure_initialized(&self, repo: &Path) -> Result<()> {
        (**self).ensure_initialized(repo)
    }

    fn verify(&self, repo: &Path) -> Result<()> {
        (**self).verify(repo)
    }

    fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        (**self).checkout(repo, branch)
    }

    fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        (**self).branch_exists(repo, branch)
    }

    fn list_branches(&self, repo: &Path) -> Result<Vec<String>> {
        (**self).list_branches(repo)
    }

    fn show_file(&self, repo: &Path, branch: &str, file: &Path) -> Result<Option<Vec<u8>>> {
        (**self).show_file(repo, branch, file)
    }

    fn set_upstream(&self, repo: &Path, url: &str) -> Result<()> {
        (**self).set_upstream(repo, url)
    }

    fn upstream(&self, repo: &Path) -> Result<Option<String>> {
        (**self).upstream(repo)
    }

    fn fetch(&self, repo: &Path, branch: &str) -> Result<()> {
        (**self).fetch(repo, branch)
    }

    fn clone_branch(&self, repo: &Path, branch: &str, dest: &Path) -> Result<()> {
        (**self).clone_branch(repo, branch, dest)
    }

    fn commit_all(&self, worktree: &Path, message: &str) -> Result<()> {
        (**self).commit_all(worktree, message)
    }

    fn push(&self, worktree: &Path, branch: &str, mode: PushMode) -> Result<PushStatus> {
        (**self).push(worktree, branch, mode)
    }

    fn push_upstream(&self, repo: &Path, branch: &str, mode: PushMode) -> Result<PushStatus> {
        (**self).push_upstream(repo, branch, mode)
    }
}

/// Version control error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Repository fails basic structural checks.
    #[error("repository at {:?} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Branch does not exist.
    #[error("branch {0:?} does not exist")]
    NoSuchBranch(String),

    /// Directory is not a working clone.
    #[error("{:?} is not a working clone", .0.display())]
    NotAClone(PathBuf),

    /// Working tree cannot be read or written.
    #[error("failed to access working tree at {:?}", path.display())]
    WorkTree {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;
