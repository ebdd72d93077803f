// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Generation repository management.
//!
//! Each owner has one __generation repository__: a bare repository under the
//! metadata directory whose branches hold the history of that owner's
//! environments.
//!
//! # Branch Layout
//!
//! Branch names encode system and environment name as `<system>.<name>`.
//! The tree of each branch looks like this:
//!
//! ```text
//! 1/env/manifest.toml
//! 1/env/manifest.json
//! 2/env/...
//! metadata.json
//! ```
//!
//! One directory per generation, immutable once committed, plus the
//! environment's registry document recording generation bookkeeping.

use crate::{
    context::{parse_branch, Context},
    registry::RegistryDocument,
    vcs::{self, PushMode, PushStatus, VersionControl},
};

use std::{
    fs::symlink_metadata,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Name of registry document at the root of every environment branch.
pub const METADATA_FILE: &str = "metadata.json";

/// Owner's generation repository.
#[derive(Debug)]
pub struct GenerationRepository<V>
where
    V: VersionControl,
{
    vcs: V,
    path: PathBuf,
}

impl<V> GenerationRepository<V>
where
    V: VersionControl,
{
    /// Construct handle to generation repository of owner in `meta_dir`.
    ///
    /// Nothing is touched on disk until [`GenerationRepository::ensure_initialized`]
    /// is called.
    pub fn new(vcs: V, meta_dir: impl AsRef<Path>, owner: &str) -> Self {
        Self {
            vcs,
            path: meta_dir.as_ref().join(owner),
        }
    }

    /// Path to bare repository.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Version control backend.
    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Create repository unless it already exists, then verify it.
    ///
    /// # Errors
    ///
    /// - Return [`Error::RepositoryCorrupt`] if the repository path exists
    ///   but is not usable.
    #[instrument(skip(self), level = "debug")]
    pub fn ensure_initialized(&self) -> Result<()> {
        // INVARIANT: A dangling symlink in place of the metadata directory
        // cannot be repaired by initializing over it.
        if let Ok(metadata) = symlink_metadata(&self.path) {
            if metadata.file_type().is_symlink() && !self.path.exists() {
                return Err(Error::RepositoryCorrupt {
                    path: self.path.clone(),
                    reason: "metadata directory is a dangling symlink".into(),
                });
            }
        }

        self.vcs
            .ensure_initialized(&self.path)
            .map_err(|err| self.corrupt(err))?;
        self.verify()
    }

    /// Check structural validity of repository.
    ///
    /// # Errors
    ///
    /// - Return [`Error::RepositoryCorrupt`] if the check fails.
    pub fn verify(&self) -> Result<()> {
        self.vcs.verify(&self.path).map_err(|err| self.corrupt(err))
    }

    /// Configure upstream remote of repository.
    pub fn set_upstream(&self, url: &str) -> Result<()> {
        debug!("set upstream of {:?} to {url}", self.path.display());
        Ok(self.vcs.set_upstream(&self.path, url)?)
    }

    /// Upstream remote URL, if any.
    pub fn upstream(&self) -> Result<Option<String>> {
        Ok(self.vcs.upstream(&self.path)?)
    }

    /// Make branch of environment exist and current.
    ///
    /// A missing branch is created as an orphan with a single empty commit so
    /// collaborators can see the environment before it has any generation.
    pub fn checkout(&self, context: &Context) -> Result<()> {
        let branch = context.branch();
        if !self.vcs.branch_exists(&self.path, &branch)? {
            info!("create environment {context}");
        }

        Ok(self.vcs.checkout(&self.path, &branch)?)
    }

    /// Check if environment has a branch.
    pub fn has_environment(&self, context: &Context) -> Result<bool> {
        Ok(self.vcs.branch_exists(&self.path, &context.branch())?)
    }

    /// Read file from tip of environment branch without checking it out.
    ///
    /// Missing branches and files yield `None`.
    pub fn show_file(&self, context: &Context, file: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
        Ok(self
            .vcs
            .show_file(&self.path, &context.branch(), file.as_ref())?)
    }

    /// Registry document at tip of environment branch.
    ///
    /// A branch without a registry document yields a fresh one for the
    /// schema version of the context.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Registry`] if the document cannot be parsed.
    pub fn metadata(&self, context: &Context) -> Result<RegistryDocument> {
        let content = self.show_file(context, METADATA_FILE)?.unwrap_or_default();
        Ok(RegistryDocument::from_slice(&content, context.schema_version)?)
    }

    /// Refresh environment branch from upstream.
    ///
    /// Best effort. Failures are logged and otherwise ignored, since a stale
    /// branch only widens the window in which a push can be rejected.
    pub fn fetch_remote(&self, context: &Context) {
        if let Err(err) = self.vcs.fetch(&self.path, &context.branch()) {
            warn!("failed to refresh {context} from upstream: {err}");
        }
    }

    /// Overwrite upstream branch of environment with local history.
    ///
    /// This discards whatever diverging history the upstream holds. It is
    /// never done implicitly.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NoUpstream`] if no upstream is configured.
    #[instrument(skip(self), level = "debug")]
    pub fn force_push(&self, context: &Context) -> Result<()> {
        if self.upstream()?.is_none() {
            return Err(Error::NoUpstream);
        }

        match self
            .vcs
            .push_upstream(&self.path, &context.branch(), PushMode::Force)?
        {
            PushStatus::Accepted => {
                info!("force pushed {context} to upstream");
                Ok(())
            }
            PushStatus::Rejected(reason) => Err(Error::PushRejected(reason)),
        }
    }

    /// List environments of owner as `(system, name)` pairs.
    ///
    /// Branches not named `<system>.<name>` are ignored.
    pub fn environments(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .vcs
            .list_branches(&self.path)?
            .iter()
            .filter_map(|branch| parse_branch(branch))
            .map(|(system, name)| (system.to_string(), name.to_string()))
            .collect())
    }

    fn corrupt(&self, err: vcs::Error) -> Error {
        match err {
            vcs::Error::Corrupt { path, reason } => Error::RepositoryCorrupt { path, reason },
            vcs::Error::Git2(err) => Error::RepositoryCorrupt {
                path: self.path.clone(),
                reason: err.message().to_string(),
            },
            err => Error::Vcs(err),
        }
    }
}

/// Generation repository error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Repository fails basic structural checks.
    #[error(
        "generation repository at {:?} is corrupt: {reason}\nremove it and re-clone from upstream",
        path.display()
    )]
    RepositoryCorrupt { path: PathBuf, reason: String },

    /// Force push requested without upstream.
    #[error("no upstream configured for generation repository")]
    NoUpstream,

    /// Upstream refused an update.
    #[error("upstream rejected push: {0}")]
    PushRejected(String),

    #[error(transparent)]
    Registry(#[from] crate::registry::Error),

    #[error(transparent)]
    Vcs(#[from] vcs::Error),
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::MemoryVersionControl;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn context(name: &str) -> Context {
        Context::named("alice", "x86_64-linux", name)
    }

    #[test]
    fn checkout_bootstraps_environment() -> anyhow::Result<()> {
        let repo = GenerationRepository::new(MemoryVersionControl::new(), "/meta", "alice");
        repo.ensure_initialized()?;
        repo.ensure_initialized()?;
        assert!(!repo.has_environment(&context("default"))?);

        repo.checkout(&context("default"))?;
        repo.checkout(&context("work"))?;
        assert!(repo.has_environment(&context("default"))?);
        assert_eq!(
            repo.environments()?,
            vec![
                ("x86_64-linux".to_string(), "default".to_string()),
                ("x86_64-linux".to_string(), "work".to_string()),
            ]
        );

        Ok(())
    }

    #[test]
    fn metadata_of_fresh_environment_is_bootstrapped() -> anyhow::Result<()> {
        let repo = GenerationRepository::new(MemoryVersionControl::new(), "/meta", "alice");
        repo.ensure_initialized()?;
        repo.checkout(&context("default"))?;

        let document = repo.metadata(&context("default"))?;
        assert_eq!(document.as_value(), &json!({ "version": 3 }));
        assert_eq!(repo.show_file(&context("default"), METADATA_FILE)?, None);

        Ok(())
    }

    #[test]
    fn force_push_requires_upstream() -> anyhow::Result<()> {
        let repo = GenerationRepository::new(MemoryVersionControl::new(), "/meta", "alice");
        repo.ensure_initialized()?;
        repo.checkout(&context("default"))?;

        assert!(matches!(
            repo.force_push(&context("default")),
            Err(Error::NoUpstream)
        ));

        Ok(())
    }

    #[test]
    fn unknown_repository_is_corrupt() {
        let repo = GenerationRepository::new(MemoryVersionControl::new(), "/meta", "bob");
        let result = repo.verify();
        assert!(matches!(result, Err(Error::RepositoryCorrupt { .. })));
        let message = result.err().map(|err| err.to_string()).unwrap_or_default();
        assert!(message.contains("re-clone"));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_corrupt() -> anyhow::Result<()> {
        let meta = tempfile::tempdir()?;
        std::os::unix::fs::symlink(meta.path().join("gone"), meta.path().join("alice"))?;

        let repo = GenerationRepository::new(MemoryVersionControl::new(), meta.path(), "alice");
        assert!(matches!(
            repo.ensure_initialized(),
            Err(Error::RepositoryCorrupt { .. })
        ));

        Ok(())
    }
}
