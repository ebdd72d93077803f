// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Schema migration of generation repositories.
//!
//! The on-disk layout of an environment branch has changed over time. Each
//! change is captured by a [`MigrationStep`] that can tell whether a working
//! clone still carries the old layout, and rewrite it to the new one. Steps
//! are kept in a fixed, total order by the [`Migrator`].
//!
//! # Running Migrations
//!
//! A migration never composes with the command that discovered it. The
//! migrator clones the environment branch, rewrites it, commits the rewrite
//! on its own, and pushes it. The triggering command is expected to abort and
//! be re-issued afterwards, so no business transaction ever observes a
//! partially migrated layout.
//!
//! Every step is idempotent. A crash before the push leaves the repository
//! untouched, and running the migrator on an up to date branch does nothing.

use crate::{
    context::Context,
    generation::{ENV_DIR, GENERATIONS_FIELD, MANIFEST_JSON},
    registry::{DocumentStore, FsDocumentStore, PathSegment, RegistryDocument},
    repository::{GenerationRepository, METADATA_FILE},
    vcs::{PushMode, PushStatus, VersionControl},
};

use inquire::Confirm;
use serde_json::Value;
use std::{
    fs::{create_dir_all, read_dir, rename},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Schema version assumed for documents that predate version fields.
pub const LEGACY_SCHEMA_VERSION: u64 = 1;

/// One idempotent rewrite of the on-disk layout.
pub trait MigrationStep {
    /// Stable identifier of the step, e.g. "001-nest-env-dir".
    fn name(&self) -> &'static str;

    /// Schema version the step upgrades from.
    fn from_version(&self) -> u64;

    /// Schema version the step upgrades to.
    fn to_version(&self) -> u64;

    /// Check if working clone still carries the layout this step replaces.
    fn detect(&self, worktree: &Path, metadata: &RegistryDocument) -> Result<bool>;

    /// Rewrite working clone to the new layout.
    ///
    /// Must be safe to call on a clone that is already partially or fully
    /// rewritten.
    fn rewrite(&self, worktree: &Path, metadata: &mut RegistryDocument) -> Result<()>;
}

/// Move `<gen>/manifest.json` to `<gen>/env/manifest.json`.
///
/// Early layouts stored the built manifest at the root of each generation
/// directory. Later layouts nest everything the builder consumes under `env`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NestEnvDir;

impl MigrationStep for NestEnvDir {
    fn name(&self) -> &'static str {
        "001-nest-env-dir"
    }

    fn from_version(&self) -> u64 {
        1
    }

    fn to_version(&self) -> u64 {
        2
    }

    fn detect(&self, worktree: &Path, _: &RegistryDocument) -> Result<bool> {
        Ok(!legacy_manifests(worktree)?.is_empty())
    }

    fn rewrite(&self, worktree: &Path, _: &mut RegistryDocument) -> Result<()> {
        for manifest in legacy_manifests(worktree)? {
            let Some(generation_dir) = manifest.parent() else {
                continue;
            };

            let env_dir = generation_dir.join(ENV_DIR);
            create_dir_all(&env_dir).map_err(|source| io_error(source, &env_dir))?;

            // INVARIANT: Rename is atomic, so the legacy marker either stays or
            // is fully replaced.
            let target = env_dir.join(MANIFEST_JSON);
            rename(&manifest, &target).map_err(|source| io_error(source, &manifest))?;
            debug!("moved {:?} to {:?}", manifest.display(), target.display());
        }

        Ok(())
    }
}

fn legacy_manifests(worktree: &Path) -> Result<Vec<PathBuf>> {
    let mut manifests = Vec::new();
    for entry in read_dir(worktree).map_err(|source| io_error(source, worktree))? {
        let entry = entry.map_err(|source| io_error(source, worktree))?;
        let is_generation = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.parse::<u64>().is_ok());

        let manifest = entry.path().join(MANIFEST_JSON);
        if is_generation && manifest.is_file() {
            manifests.push(manifest);
        }
    }

    manifests.sort();
    Ok(manifests)
}

/// Turn the single `description` of each generation into a `logMessage` list.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessageList;

const DESCRIPTION_FIELD: &str = "description";
const LOG_MESSAGE_FIELD: &str = "logMessage";

impl MigrationStep for LogMessageList {
    fn name(&self) -> &'static str {
        "002-log-message-list"
    }

    fn from_version(&self) -> u64 {
        2
    }

    fn to_version(&self) -> u64 {
        3
    }

    fn detect(&self, _: &Path, metadata: &RegistryDocument) -> Result<bool> {
        Ok(!described_generations(metadata).is_empty())
    }

    fn rewrite(&self, _: &Path, metadata: &mut RegistryDocument) -> Result<()> {
        for key in described_generations(metadata) {
            let generation = PathSegment::keys([GENERATIONS_FIELD, key.as_str()]);
            let mut description_path = generation.clone();
            description_path.push(DESCRIPTION_FIELD.into());
            let mut log_path = generation;
            log_path.push(LOG_MESSAGE_FIELD.into());

            let description = metadata.get(&description_path)?.clone();
            if !metadata.contains(&log_path) {
                let messages = match description {
                    Value::String(message) if message.is_empty() => Vec::new(),
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                metadata.set(&log_path, Value::Array(messages))?;
            }
            metadata.delete(&description_path)?;
        }

        Ok(())
    }
}

fn described_generations(metadata: &RegistryDocument) -> Vec<String> {
    let Ok(Value::Object(generations)) = metadata.get(&PathSegment::keys([GENERATIONS_FIELD]))
    else {
        return Vec::new();
    };

    generations
        .iter()
        .filter(|(_, entry)| entry.get(DESCRIPTION_FIELD).is_some())
        .map(|(key, _)| key.clone())
        .collect()
}

/// Decide whether pending migrations may run.
pub trait Approval {
    /// Ask for approval to run `steps` against environment.
    fn approve(&self, context: &Context, steps: &[&dyn MigrationStep]) -> Result<bool>;
}

/// Approve every migration without asking.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

impl Approval for AutoApprove {
    fn approve(&self, _: &Context, _: &[&dyn MigrationStep]) -> Result<bool> {
        Ok(true)
    }
}

/// Ask user on the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquireApproval;

impl Approval for InquireApproval {
    fn approve(&self, context: &Context, steps: &[&dyn MigrationStep]) -> Result<bool> {
        let names = steps
            .iter()
            .map(|step| step.name())
            .collect::<Vec<_>>()
            .join(", ");

        Confirm::new(&format!("Upgrade generation store of {context}?"))
            .with_default(true)
            .with_help_message(&format!("pending migrations: {names}"))
            .prompt()
            .map_err(Error::Prompt)
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Nothing to do.
    UpToDate,

    /// Rewrite committed and published.
    Migrated {
        from: u64,
        to: u64,
        steps: Vec<&'static str>,
    },

    /// Upstream moved while migrating. Nothing was published.
    Diverged,
}

/// Ordered registry of migration steps.
pub struct Migrator {
    steps: Vec<Box<dyn MigrationStep>>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::with_steps(vec![Box::new(NestEnvDir), Box::new(LogMessageList)])
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_list()
            .entries(self.steps.iter().map(|step| step.name()))
            .finish()
    }
}

impl Migrator {
    /// Construct migrator with every known step.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct migrator with custom steps.
    ///
    /// Steps are ordered by the version they upgrade from.
    pub fn with_steps(mut steps: Vec<Box<dyn MigrationStep>>) -> Self {
        steps.sort_by_key(|step| step.from_version());
        Self { steps }
    }

    /// Schema version a fully migrated document ends up with.
    pub fn target_version(&self) -> u64 {
        self.steps
            .last()
            .map_or(LEGACY_SCHEMA_VERSION, |step| step.to_version())
    }

    /// Steps that still need to run against a working clone.
    ///
    /// A step is pending if the document version is below what the step
    /// upgrades to, or if its legacy marker is still present.
    pub fn pending(
        &self,
        worktree: &Path,
        metadata: &RegistryDocument,
    ) -> Result<Vec<&dyn MigrationStep>> {
        let version = document_version(metadata);
        let mut pending = Vec::new();
        for step in &self.steps {
            if version < step.to_version() || step.detect(worktree, metadata)? {
                pending.push(step.as_ref());
            }
        }

        Ok(pending)
    }

    /// Apply pending steps to a working clone in order.
    ///
    /// Returns names of the steps applied. The document version is raised to
    /// the version each step upgrades to.
    pub fn apply(
        &self,
        worktree: &Path,
        metadata: &mut RegistryDocument,
    ) -> Result<Vec<&'static str>> {
        let mut applied = Vec::new();
        for step in self.pending(worktree, metadata)? {
            info!("apply migration {}", step.name());
            step.rewrite(worktree, metadata)?;
            if document_version(metadata) < step.to_version() {
                metadata.upgrade_version(step.to_version());
            }
            applied.push(step.name());
        }

        Ok(applied)
    }

    /// Migrate environment branch of repository.
    ///
    /// Clones the branch, applies every pending step, then commits and pushes
    /// the rewrite as a single commit. The caller is expected to re-issue
    /// whatever command discovered the need to migrate.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Declined`] if approval is refused.
    /// - Return [`Error::Vcs`] if the clone, commit, or push fails.
    #[instrument(skip(self, repository, approval), level = "debug")]
    pub fn run<V>(
        &self,
        repository: &GenerationRepository<V>,
        context: &Context,
        approval: &dyn Approval,
    ) -> Result<MigrationOutcome>
    where
        V: VersionControl,
    {
        repository.fetch_remote(context);
        if !repository.has_environment(context)? {
            return Ok(MigrationOutcome::UpToDate);
        }

        let workspace = tempfile::Builder::new()
            .prefix("genstore-migrate-")
            .tempdir()
            .map_err(|source| io_error(source, &std::env::temp_dir()))?;
        let worktree = workspace.path();
        let branch = context.branch();
        repository
            .vcs()
            .clone_branch(repository.path(), &branch, worktree)?;

        let metadata_path = worktree.join(METADATA_FILE);
        let mut metadata = load_metadata(&metadata_path, context.schema_version)?;
        let pending = self.pending(worktree, &metadata)?;
        if pending.is_empty() {
            debug!("{context} is up to date");
            return Ok(MigrationOutcome::UpToDate);
        }

        if !approval.approve(context, &pending)? {
            return Err(Error::Declined);
        }

        let from = document_version(&metadata);
        let steps = self.apply(worktree, &mut metadata)?;
        let to = document_version(&metadata);
        FsDocumentStore
            .store(&metadata_path, metadata.to_json()?.as_bytes())
            .map_err(|source| io_error(source, &metadata_path))?;

        let message = format!("Migrate generation store {from}→{to} ({})", steps.join(", "));
        repository.vcs().commit_all(worktree, &message)?;
        match repository
            .vcs()
            .push(worktree, &branch, PushMode::FastForward)?
        {
            PushStatus::Accepted => {
                info!("migrated {context} from schema {from} to {to}");
                Ok(MigrationOutcome::Migrated { from, to, steps })
            }
            PushStatus::Rejected(reason) => {
                debug!("migration push rejected: {reason}");
                Ok(MigrationOutcome::Diverged)
            }
        }
    }
}

/// Load registry document of a working clone without checking its version.
pub(crate) fn load_metadata(path: &Path, bootstrap_version: u64) -> Result<RegistryDocument> {
    let content = FsDocumentStore
        .load(path)
        .map_err(|source| io_error(source, path))?
        .unwrap_or_default();

    Ok(RegistryDocument::from_slice(&content, bootstrap_version)?)
}

fn document_version(metadata: &RegistryDocument) -> u64 {
    metadata.version().unwrap_or(LEGACY_SCHEMA_VERSION)
}

fn io_error(source: std::io::Error, path: &Path) -> Error {
    Error::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Migration error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// User refused to run pending migrations.
    #[error("migration declined")]
    Declined,

    /// Prompt for approval failed.
    #[error(transparent)]
    Prompt(#[from] inquire::InquireError),

    /// Working clone cannot be read or written.
    #[error("failed to rewrite {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Registry(#[from] crate::registry::Error),

    #[error(transparent)]
    Repository(#[from] crate::repository::Error),

    #[error(transparent)]
    Vcs(#[from] crate::vcs::Error),
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;
