// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Transactional updates of environments.
//!
//! A [`Transaction`] is the only way to change an environment. It works on a
//! disposable clone of the environment branch, so nothing it does is visible
//! to anyone else until [`Transaction::commit`] pushes the result.
//!
//! # Lifecycle
//!
//! 1. [`TransactionManager::begin`] refreshes the branch from upstream,
//!    clones it into a temporary directory, and prepares the directory of the
//!    next generation as a copy of the current one.
//! 2. The caller stages changes inside [`Transaction::staging_dir`], or picks
//!    an existing generation with [`Transaction::switch_to`].
//! 3. [`Transaction::commit`] either reports that nothing changed, or records
//!    the new generation, commits, and pushes. A push that is not a
//!    fast-forward yields [`Outcome::Diverged`] and the caller has to start
//!    over with a fresh transaction.
//! 4. [`Transaction::abort`], or simply dropping the transaction, throws the
//!    clone away.
//!
//! There is no lock. Two writers racing on the same environment both stage
//! the same next generation number, and the second one to push loses.
//!
//! # Project Environments
//!
//! Project environments keep their state beside user source files instead of
//! in a generation repository. Their transactions simulate a single
//! generation 1 built from the project's `env` directory, and commit by
//! writing the staged `env` directory back into the project.

use crate::{
    builder::{BuildError, Builder},
    context::{Context, EnvironmentKind},
    generation::{
        self, current_gen_path, generation_field_path, generation_path, read_manifest,
        ArtifactRef, GenerationId, GenerationMetadata, Generations, PackageDiff, ENV_DIR,
    },
    link::{self, LinkManager},
    migrate::{self, Migrator},
    registry::{self, DocumentStore, FsDocumentStore, Registry, RegistryDocument},
    repository::{self, GenerationRepository, METADATA_FILE},
    vcs::{self, PushMode, PushStatus, VersionControl},
};

use chrono::Utc;
use serde_json::Value;
use std::{
    fs::{copy, create_dir_all, read_dir, remove_dir_all, rename},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

/// Directory inside a project holding its activation links.
pub const PROJECT_RUN_DIR: &str = "run";

/// What kind of change a transaction carries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Packages were added, removed, or upgraded.
    #[default]
    Packages,

    /// Declarative source was edited by hand.
    ///
    /// An edit is recorded even if it builds the same artifact, since the
    /// user-visible source changed.
    Edit,
}

/// Result of committing a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing changed. Nothing was written.
    NoOp,

    /// New generation was recorded and activated.
    Created(GenerationId),

    /// Previously recorded generation was re-activated.
    SwitchedTo(GenerationId),

    /// Registry document changed without a new generation.
    Updated,

    /// Upstream moved while the transaction was staging. Nothing was
    /// published. Retry with a fresh transaction, or force push.
    Diverged,
}

/// Entry point for transactions over environments of one owner.
#[derive(Debug)]
pub struct TransactionManager<V, B>
where
    V: VersionControl,
    B: Builder,
{
    repository: GenerationRepository<V>,
    builder: B,
    links: LinkManager,
    migrator: Migrator,
}

impl<V, B> TransactionManager<V, B>
where
    V: VersionControl,
    B: Builder,
{
    /// Construct new transaction manager.
    pub fn new(repository: GenerationRepository<V>, builder: B, links: LinkManager) -> Self {
        Self {
            repository,
            builder,
            links,
            migrator: Migrator::new(),
        }
    }

    /// Use custom migrator to decide whether migrations are pending.
    pub fn with_migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = migrator;
        self
    }

    /// Generation repository transactions work against.
    pub fn repository(&self) -> &GenerationRepository<V> {
        &self.repository
    }

    /// Migrator consulted when beginning transactions.
    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Activation links of environment.
    ///
    /// Project environments keep their links inside the project.
    pub fn links_for(&self, context: &Context) -> LinkManager {
        match &context.kind {
            EnvironmentKind::Named => self.links.clone(),
            EnvironmentKind::Project { dir } => LinkManager::new(dir.join(PROJECT_RUN_DIR)),
        }
    }

    /// Begin new transaction on environment.
    ///
    /// # Errors
    ///
    /// - Return [`Error::MigrationRequired`] if the environment branch still
    ///   uses an old layout.
    /// - Return [`Error::Registry`] with a schema mismatch if the registry
    ///   document has an unexpected version.
    #[instrument(skip(self), level = "debug")]
    pub fn begin(&self, context: &Context) -> Result<Transaction<'_, V, B>> {
        let workspace = tempfile::Builder::new()
            .prefix("genstore-")
            .tempdir()
            .map_err(|source| stage_error(source, &std::env::temp_dir()))?;

        let metadata = match &context.kind {
            EnvironmentKind::Named => self.clone_environment(context, workspace.path())?,
            EnvironmentKind::Project { dir } => {
                self.simulate_project(context, dir, workspace.path())?
            }
        };

        metadata.check_version(context.schema_version)?;
        let metadata_path = workspace.path().join(METADATA_FILE);
        let loaded_metadata = FsDocumentStore
            .load(&metadata_path)
            .map_err(|source| stage_error(source, &metadata_path))?;
        let generations = Generations::from_document(&metadata)?;
        let current_gen = generations.current();
        let next_gen = generations.next_id()?;

        let staging = workspace.path().join(next_gen.dir_name());
        create_dir_all(&staging).map_err(|source| stage_error(source, &staging))?;
        if let Some(current) = current_gen {
            copy_dir(&workspace.path().join(current.dir_name()), &staging)?;
        }
        debug!("staging generation {next_gen} of {context}");

        Ok(Transaction {
            manager: self,
            context: context.clone(),
            workspace,
            loaded_metadata,
            generations,
            current_gen,
            next_gen,
            target: next_gen,
        })
    }

    fn clone_environment(&self, context: &Context, worktree: &Path) -> Result<RegistryDocument> {
        self.repository.ensure_initialized()?;
        self.repository.fetch_remote(context);
        if !self.repository.has_environment(context)? {
            self.repository.checkout(context)?;
        }

        self.repository
            .vcs()
            .clone_branch(self.repository.path(), &context.branch(), worktree)?;

        let metadata = migrate::load_metadata(&worktree.join(METADATA_FILE), context.schema_version)?;
        let pending = self.migrator.pending(worktree, &metadata)?;
        if !pending.is_empty() {
            return Err(Error::MigrationRequired {
                pending: pending.iter().map(|step| step.name()).collect(),
            });
        }

        Ok(metadata)
    }

    fn simulate_project(
        &self,
        context: &Context,
        dir: &Path,
        worktree: &Path,
    ) -> Result<RegistryDocument> {
        let generation = GenerationId::new(1);
        copy_dir(
            &dir.join(ENV_DIR),
            &worktree.join(generation.dir_name()).join(ENV_DIR),
        )?;

        let artifact = self
            .links_for(context)
            .current(context)?
            .map(|link| link.artifact)
            .unwrap_or_default();
        let entry = GenerationMetadata::new(artifact, Vec::new(), 0, context.schema_version);

        let mut metadata = RegistryDocument::new(context.schema_version);
        metadata.set(&current_gen_path(), Value::from(generation.get()))?;
        metadata.set(
            &generation_path(generation),
            serde_json::to_value(entry).map_err(Error::Serialize)?,
        )?;
        write_metadata(&worktree.join(METADATA_FILE), &metadata)?;

        Ok(metadata)
    }
}

/// Isolated, uncommitted change to one environment.
#[derive(Debug)]
pub struct Transaction<'a, V, B>
where
    V: VersionControl,
    B: Builder,
{
    manager: &'a TransactionManager<V, B>,
    context: Context,
    workspace: TempDir,
    loaded_metadata: Option<Vec<u8>>,
    generations: Generations,
    current_gen: Option<GenerationId>,
    next_gen: GenerationId,
    target: GenerationId,
}

impl<V, B> Transaction<'_, V, B>
where
    V: VersionControl,
    B: Builder,
{
    /// Environment the transaction applies to.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Root of the disposable clone.
    pub fn worktree(&self) -> &Path {
        self.workspace.path()
    }

    /// Directory of the generation being staged.
    pub fn staging_dir(&self) -> PathBuf {
        self.worktree().join(self.target.dir_name())
    }

    /// Directory of an arbitrary generation inside the clone.
    pub fn generation_dir(&self, generation: GenerationId) -> PathBuf {
        self.worktree().join(generation.dir_name())
    }

    /// Active generation when the transaction began.
    pub fn current_gen(&self) -> Option<GenerationId> {
        self.current_gen
    }

    /// Number a newly created generation receives.
    pub fn next_gen(&self) -> GenerationId {
        self.next_gen
    }

    /// Generation bookkeeping as of when the transaction began.
    pub fn generations(&self) -> &Generations {
        &self.generations
    }

    /// Generation repository backing the environment.
    ///
    /// Project environments have none.
    pub fn environment_meta_dir(&self) -> Option<&Path> {
        match self.context.kind {
            EnvironmentKind::Named => Some(self.manager.repository.path()),
            EnvironmentKind::Project { .. } => None,
        }
    }

    /// Registry document of the clone.
    pub fn registry(&self) -> Registry<FsDocumentStore> {
        Registry::open_file(
            self.worktree().join(METADATA_FILE),
            self.context.schema_version,
        )
    }

    /// Re-activate a previously recorded generation instead of creating one.
    ///
    /// Returns the artifact recorded for that generation.
    ///
    /// # Errors
    ///
    /// - Return [`Error::GenerationNotFound`] if generation was never recorded.
    pub fn switch_to(&mut self, generation: GenerationId) -> Result<ArtifactRef> {
        let metadata = self
            .generations
            .get(generation)
            .ok_or(Error::GenerationNotFound(generation))?;

        let artifact = metadata.path.clone();
        if generation != self.next_gen {
            remove_if_exists(&self.generation_dir(self.next_gen))?;
        }

        self.target = generation;
        Ok(artifact)
    }

    /// Build the staged generation with the manager's builder.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Build`] if the builder fails. The transaction should
    ///   be aborted then.
    pub fn build(&self) -> Result<ArtifactRef> {
        Ok(self.manager.builder.build(&self.staging_dir())?)
    }

    /// Build then commit, aborting on build failure.
    pub fn build_and_commit(self, log_message: &str, kind: ChangeKind) -> Result<Outcome> {
        match self.build() {
            Ok(artifact) => self.commit(&artifact, log_message, kind),
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    /// Publish staged generation.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Vcs`] if committing or pushing fails for reasons other
    ///   than divergence. The generation repository is left untouched then.
    #[instrument(skip(self, artifact), fields(context = %self.context), level = "debug")]
    pub fn commit(self, artifact: &ArtifactRef, log_message: &str, kind: ChangeKind) -> Result<Outcome> {
        if self.is_unchanged(artifact, kind)? {
            info!("no changes to {}", self.context);
            self.abort();
            return Ok(Outcome::NoOp);
        }

        let target = self.target;
        let created = !self.generations.contains(target);
        self.record(artifact, log_message)?;

        if let EnvironmentKind::Project { dir } = &self.context.kind {
            self.write_back_project(dir)?;
        } else {
            let message = self.commit_message(log_message);
            let vcs = self.manager.repository.vcs();
            vcs.commit_all(self.worktree(), &message)?;
            if let PushStatus::Rejected(reason) =
                vcs.push(self.worktree(), &self.context.branch(), PushMode::FastForward)?
            {
                warn!("{} changed upstream while staging: {reason}", self.context);
                return Ok(Outcome::Diverged);
            }
        }

        // INVARIANT: Links only move once the generation is published, so a
        // losing writer never replaces the root of the winner's generation.
        let links = self.manager.links_for(&self.context);
        let link_generation = match self.context.kind {
            EnvironmentKind::Named => target,
            EnvironmentKind::Project { .. } => GenerationId::new(1),
        };
        let root = links.root(&self.context, link_generation, artifact)?;
        self.manager.builder.register_root(&root, artifact)?;
        links.activate(&self.context, link_generation)?;

        if created {
            info!("created generation {target} of {}", self.context);
            Ok(Outcome::Created(target))
        } else {
            info!("switched {} to generation {target}", self.context);
            Ok(Outcome::SwitchedTo(target))
        }
    }

    /// Publish changes made to the registry document alone.
    ///
    /// Nothing is pushed unless the document differs from the one loaded when
    /// the transaction began.
    ///
    /// # Errors
    ///
    /// - Return [`Error::ProjectRegistry`] for project environments, which
    ///   have no persistent registry document.
    pub fn publish(self, message: &str) -> Result<Outcome> {
        if self.context.is_project() {
            return Err(Error::ProjectRegistry);
        }

        let metadata = self.worktree().join(METADATA_FILE);
        let repository = &self.manager.repository;
        let after = FsDocumentStore
            .load(&metadata)
            .map_err(|source| stage_error(source, &metadata))?;
        if self.loaded_metadata == after {
            self.abort();
            return Ok(Outcome::NoOp);
        }

        remove_if_exists(&self.generation_dir(self.next_gen))?;
        let vcs = repository.vcs();
        vcs.commit_all(self.worktree(), message)?;
        match vcs.push(self.worktree(), &self.context.branch(), PushMode::FastForward)? {
            PushStatus::Accepted => Ok(Outcome::Updated),
            PushStatus::Rejected(reason) => {
                warn!("{} changed upstream while staging: {reason}", self.context);
                Ok(Outcome::Diverged)
            }
        }
    }

    /// Discard the clone. The generation repository is left untouched.
    pub fn abort(self) {
        debug!("abort transaction on {}", self.context);
        if let Err(err) = self.workspace.close() {
            warn!("failed to clean up transaction directory: {err}");
        }
    }

    fn is_unchanged(&self, artifact: &ArtifactRef, kind: ChangeKind) -> Result<bool> {
        let Some(current) = self.current_gen else {
            return Ok(false);
        };

        if self.target == current {
            return Ok(true);
        }

        if self.target != self.next_gen {
            return Ok(false);
        }

        let previous_dir = self.generation_dir(current);
        let staged_dir = self.staging_dir();
        let previous_artifact = self.generations.get(current).map(|metadata| &metadata.path);
        if !generation::equivalent(&previous_dir, previous_artifact, &staged_dir, artifact)? {
            return Ok(false);
        }

        Ok(match kind {
            ChangeKind::Packages => true,
            ChangeKind::Edit => !generation::source_changed(&previous_dir, &staged_dir)?,
        })
    }

    fn record(&self, artifact: &ArtifactRef, log_message: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let target = self.target;
        let schema_version = self.context.schema_version;
        let current = self.current_gen;
        let created = !self.generations.contains(target);

        self.registry().edit(|document| {
            if let Some(current) = current {
                if self.generations.contains(current) {
                    document.set(&generation_field_path(current, "lastActive"), Value::from(now))?;
                }
            }

            if created {
                let entry = GenerationMetadata::new(
                    artifact.clone(),
                    vec![log_message.to_string()],
                    now,
                    schema_version,
                );
                let entry = serde_json::to_value(entry).map_err(registry::Error::Serialize)?;
                document.set(&generation_path(target), entry)?;
            } else {
                document.set(&generation_field_path(target, "lastActive"), Value::from(now))?;
            }

            document.set(&current_gen_path(), Value::from(target.get()))
        })?;

        Ok(())
    }

    fn commit_message(&self, log_message: &str) -> String {
        let mut message = log_message.to_string();
        let Some(current) = self.current_gen else {
            return message;
        };

        let previous = read_manifest(&self.generation_dir(current)).ok().flatten();
        let staged = read_manifest(&self.staging_dir()).ok().flatten();
        if let (Some(previous), Some(staged)) = (previous, staged) {
            let diff = PackageDiff::between(&previous, &staged);
            if !diff.is_empty() {
                message.push_str("\n\n");
                message.push_str(diff.to_string().trim_end());
            }
        }

        message
    }

    fn write_back_project(&self, dir: &Path) -> Result<()> {
        let env_dir = dir.join(ENV_DIR);
        let incoming = dir.join(format!(".{ENV_DIR}.new"));
        let outgoing = dir.join(format!(".{ENV_DIR}.old"));

        remove_if_exists(&incoming)?;
        remove_if_exists(&outgoing)?;
        copy_dir(&self.staging_dir().join(ENV_DIR), &incoming)?;

        if env_dir.exists() {
            rename(&env_dir, &outgoing).map_err(|source| stage_error(source, &env_dir))?;
        }
        rename(&incoming, &env_dir).map_err(|source| stage_error(source, &incoming))?;
        remove_if_exists(&outgoing)?;

        Ok(())
    }
}

fn write_metadata(path: &Path, metadata: &RegistryDocument) -> Result<()> {
    FsDocumentStore
        .store(path, metadata.to_json()?.as_bytes())
        .map_err(|source| stage_error(source, path))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match remove_dir_all(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(stage_error(err, path)),
        _ => Ok(()),
    }
}

/// Recursively copy directory contents, skipping version control metadata.
///
/// A missing source is treated as empty, since empty directories do not
/// survive a round trip through version control.
pub(crate) fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    let entries = match read_dir(src) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(stage_error(source, src)),
    };

    create_dir_all(dst).map_err(|source| stage_error(source, dst))?;
    for entry in entries {
        let entry = entry.map_err(|source| stage_error(source, src))?;
        if entry.file_name() == ".git" {
            continue;
        }

        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|source| stage_error(source, &from))?;
        if file_type.is_dir() {
            copy_dir(&from, &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            copy(&from, &to).map_err(|source| stage_error(source, &from))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = std::fs::read_link(from).map_err(|source| stage_error(source, from))?;
    std::os::unix::fs::symlink(target, to).map_err(|source| stage_error(source, to))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    copy(from, to).map_err(|source| stage_error(source, from))?;
    Ok(())
}

fn stage_error(source: std::io::Error, path: &Path) -> Error {
    Error::Stage {
        source,
        path: path.to_path_buf(),
    }
}

/// Transaction error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Generation was never recorded.
    #[error("generation {0} does not exist")]
    GenerationNotFound(GenerationId),

    /// Environment branch uses an old layout.
    #[error("generation store needs migration ({}), run the migrator and retry", pending.join(", "))]
    MigrationRequired { pending: Vec<&'static str> },

    /// Project environments have no persistent registry document.
    #[error("project environments have no registry document to publish")]
    ProjectRegistry,

    /// External builder failed.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Clone cannot be read or written.
    #[error("failed to stage {:?}", path.display())]
    Stage {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Generation metadata cannot be serialized.
    #[error("failed to serialize generation metadata")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Generation(#[from] generation::Error),

    #[error(transparent)]
    Link(#[from] link::Error),

    #[error(transparent)]
    Migrate(#[from] migrate::Error),

    #[error(transparent)]
    Registry(#[from] registry::Error),

    #[error(transparent)]
    Repository(#[from] repository::Error),

    #[error(transparent)]
    Vcs(#[from] vcs::Error),
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;
