// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Generation store management.
//!
//! The [`GenerationStore`] ties configuration, the generation repository, the
//! builder, and activation links together into the handful of operations the
//! command line exposes. Everything that changes an environment goes through
//! a [`Transaction`](crate::transaction::Transaction), everything that only
//! reads queries the generation repository directly.
//!
//! # Store Layout
//!
//! ```text
//! <meta_dir>/<owner>/                        # bare generation repository
//! <link_dir>/<owner>/<system>.<name>         # activation link
//! <link_dir>/<owner>/<system>.<name>-<gen>-link
//! ```
//!
//! Defaults live under `$XDG_DATA_HOME/genstore`.

use crate::{
    builder::{Builder, NixBuilder},
    config::StoreConfig,
    context::Context,
    generation::{GenerationId, Generations, ENV_DIR},
    link::{LinkManager, PrunePolicy},
    migrate::{Approval, AutoApprove, InquireApproval, MigrationOutcome, LEGACY_SCHEMA_VERSION},
    path::{default_link_dir, default_meta_dir, NoWayHome},
    registry::{PathSegment, Registry, RegistryDocument},
    repository::GenerationRepository,
    transaction::{self, copy_dir, ChangeKind, Outcome, Transaction, TransactionManager},
    vcs::{Git2VersionControl, VersionControl},
};

use serde_json::Value;
use std::{
    fs::remove_dir_all,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Generation store of one owner.
#[derive(Debug)]
pub struct GenerationStore<V, B>
where
    V: VersionControl,
    B: Builder,
{
    config: StoreConfig,
    manager: TransactionManager<V, B>,
}

impl GenerationStore<Git2VersionControl, NixBuilder> {
    /// Open generation store backed by libgit2 and Nix.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NoWayHome`] if default directories cannot be
    ///   determined.
    /// - Return [`Error::Repository`] if generation repository is corrupt.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::new(config, Git2VersionControl::new(), NixBuilder::new())
    }
}

impl<V, B> GenerationStore<V, B>
where
    V: VersionControl,
    B: Builder,
{
    /// Construct new generation store over custom backends.
    ///
    /// Creates the generation repository of the configured owner unless it
    /// exists, and points it at the configured upstream.
    pub fn new(config: StoreConfig, vcs: V, builder: B) -> Result<Self> {
        let meta_dir = match &config.store.meta_dir {
            Some(path) => path.clone(),
            None => default_meta_dir()?,
        };
        let link_dir = match &config.store.link_dir {
            Some(path) => path.clone(),
            None => default_link_dir()?,
        };

        let repository = GenerationRepository::new(vcs, meta_dir, &config.store.owner);
        repository.ensure_initialized()?;
        if let Some(url) = config.remote_url() {
            if repository.upstream()?.as_deref() != Some(url) {
                repository.set_upstream(url)?;
            }
        }

        let manager = TransactionManager::new(repository, builder, LinkManager::new(link_dir));
        Ok(Self { config, manager })
    }

    /// Configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Transaction manager of the store.
    pub fn manager(&self) -> &TransactionManager<V, B> {
        &self.manager
    }

    /// Context of environment, optionally living in a project directory.
    pub fn context(&self, name: &str, project: Option<PathBuf>) -> Context {
        let owner = self.config.store.owner.as_str();
        let system = self.config.system();
        match project {
            Some(dir) => Context::project(owner, system, name, dir),
            None => Context::named(owner, system, name),
        }
    }

    /// Make environment branch exist.
    pub fn init(&self, context: &Context) -> Result<()> {
        if context.is_project() {
            return Ok(());
        }

        let repository = self.manager.repository();
        repository.fetch_remote(context);
        repository.checkout(context)?;

        Ok(())
    }

    /// List environments of owner as `(system, name)` pairs.
    pub fn environments(&self) -> Result<Vec<(String, String)>> {
        Ok(self.manager.repository().environments()?)
    }

    /// Generation history of environment.
    pub fn generations(&self, context: &Context) -> Result<Generations> {
        if context.is_project() {
            let transaction = self.begin(context)?;
            let generations = transaction.generations().clone();
            transaction.abort();
            return Ok(generations);
        }

        let document = self.registry_dump(context)?;
        Ok(Generations::from_document(&document)?)
    }

    /// Stage contents of `source` as the next generation's `env` directory,
    /// build it, and commit it.
    #[instrument(skip(self), level = "debug")]
    pub fn commit_dir(
        &self,
        context: &Context,
        source: &Path,
        log_message: &str,
        kind: ChangeKind,
    ) -> Result<Outcome> {
        if !source.is_dir() {
            return Err(Error::NotADirectory(source.to_path_buf()));
        }

        let transaction = self.begin(context)?;
        let env_dir = transaction.staging_dir().join(ENV_DIR);
        match remove_dir_all(&env_dir) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                return Err(Error::Stage {
                    source: err,
                    path: env_dir,
                })
            }
            _ => {}
        }
        copy_dir(source, &env_dir)?;

        let outcome = transaction.build_and_commit(log_message, kind)?;
        report(context, outcome);
        Ok(outcome)
    }

    /// Re-activate the generation preceding the current one.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NoPreviousGeneration`] if there is nothing to roll
    ///   back to.
    pub fn rollback(&self, context: &Context) -> Result<Outcome> {
        let generations = self.generations(context)?;
        let previous = generations
            .current()
            .and_then(|current| generations.previous(current))
            .ok_or(Error::NoPreviousGeneration)?;

        self.switch(context, previous)
    }

    /// Re-activate a previously recorded generation.
    #[instrument(skip(self), level = "debug")]
    pub fn switch(&self, context: &Context, generation: GenerationId) -> Result<Outcome> {
        let mut transaction = self.begin(context)?;
        let artifact = transaction.switch_to(generation)?;
        let outcome = transaction.commit(
            &artifact,
            &format!("switch to generation {generation}"),
            ChangeKind::Packages,
        )?;
        report(context, outcome);

        Ok(outcome)
    }

    /// Run pending migrations of environment.
    ///
    /// Prompts for approval when the store is interactive, unless
    /// `assume_yes` is set.
    pub fn migrate(&self, context: &Context, assume_yes: bool) -> Result<MigrationOutcome> {
        let approval: &dyn Approval = if assume_yes || !self.config.store.interactive {
            &AutoApprove
        } else {
            &InquireApproval
        };

        Ok(self
            .manager
            .migrator()
            .run(self.manager.repository(), context, approval)?)
    }

    /// Overwrite upstream branch of environment with local history.
    pub fn force_push(&self, context: &Context) -> Result<()> {
        Ok(self.manager.repository().force_push(context)?)
    }

    /// Prune stale activation links of environment.
    ///
    /// `max_age_days` overrides the configured age limit.
    pub fn gc(&self, context: &Context, max_age_days: Option<u64>) -> Result<Vec<GenerationId>> {
        let mut policy = PrunePolicy::from(self.config.gc);
        if let Some(days) = max_age_days {
            policy.max_age_days = days;
        }

        let generations = self.generations(context)?;
        Ok(self
            .manager
            .links_for(context)
            .prune_stale(context, &generations, policy)?)
    }

    /// Whole registry document of environment.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Migrated`] if the branch used an older schema and was
    ///   migrated instead.
    pub fn registry_dump(&self, context: &Context) -> Result<RegistryDocument> {
        let document = self.manager.repository().metadata(context)?;
        let declared = document.version().unwrap_or(LEGACY_SCHEMA_VERSION);
        if declared < context.schema_version {
            warn!("generation store of {context} uses schema version {declared}");
            return Err(self.migrate_on_demand(context));
        }

        document.check_version(context.schema_version)?;
        Ok(document)
    }

    /// Value at path of environment's registry document.
    pub fn registry_get(&self, context: &Context, path: &[PathSegment]) -> Result<Value> {
        Ok(self.registry_dump(context)?.get(path)?.clone())
    }

    /// Declared schema version of environment's registry document.
    pub fn registry_version(&self, context: &Context) -> Result<u64> {
        let document = self.manager.repository().metadata(context)?;
        Ok(document.version().unwrap_or(context.schema_version))
    }

    /// Edit environment's registry document and publish the change.
    pub fn edit_registry<E>(&self, context: &Context, message: &str, editor: E) -> Result<Outcome>
    where
        E: FnOnce(&Registry) -> crate::registry::Result<()>,
    {
        let transaction = self.begin(context)?;
        editor(&transaction.registry())?;
        let outcome = transaction.publish(message)?;
        report(context, outcome);

        Ok(outcome)
    }

    fn begin(&self, context: &Context) -> Result<Transaction<'_, V, B>> {
        match self.manager.begin(context) {
            Ok(transaction) => Ok(transaction),
            Err(transaction::Error::MigrationRequired { pending }) => {
                warn!("generation store of {context} needs migration: {}", pending.join(", "));
                Err(self.migrate_on_demand(context))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn migrate_on_demand(&self, context: &Context) -> Error {
        match self.migrate(context, false) {
            Ok(MigrationOutcome::Migrated { steps, .. }) => Error::Migrated(steps),
            Ok(MigrationOutcome::Diverged) => Error::MigrationDiverged,
            Ok(MigrationOutcome::UpToDate) => Error::Migrated(Vec::new()),
            Err(err) => err,
        }
    }
}

fn report(context: &Context, outcome: Outcome) {
    match outcome {
        Outcome::NoOp => info!("{context} is unchanged"),
        Outcome::Created(id) => info!("{context} is now at new generation {id}"),
        Outcome::SwitchedTo(id) => info!("{context} switched to generation {id}"),
        Outcome::Updated => info!("{context} registry updated"),
        Outcome::Diverged => warn!(
            "{context} was changed elsewhere while this change was staged; \
             retry the command, or force push to discard the remote changes"
        ),
    }
}

/// Generation store error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Migration ran; the triggering command must be re-issued.
    #[error("generation store migrated ({}), re-run the command", .0.join(", "))]
    Migrated(Vec<&'static str>),

    /// Upstream moved while migrating.
    #[error("generation store changed upstream while migrating, retry")]
    MigrationDiverged,

    /// Rollback requested without earlier generation.
    #[error("no previous generation to roll back to")]
    NoPreviousGeneration,

    /// Staging source is not a directory.
    #[error("{:?} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// Staging directory cannot be prepared.
    #[error("failed to stage {:?}", path.display())]
    Stage {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),

    #[error(transparent)]
    Generation(#[from] crate::generation::Error),

    #[error(transparent)]
    Link(#[from] crate::link::Error),

    #[error(transparent)]
    Migrate(#[from] crate::migrate::Error),

    #[error(transparent)]
    Registry(#[from] crate::registry::Error),

    #[error(transparent)]
    Repository(#[from] crate::repository::Error),

    #[error(transparent)]
    Transaction(#[from] transaction::Error),
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        builder::BuildError,
        generation::{ArtifactRef, MANIFEST_JSON, MANIFEST_TOML},
        registry::parse_path,
        repository::METADATA_FILE,
        vcs::{MemoryVersionControl, PushMode},
    };
    use pretty_assertions::assert_eq;
    use std::fs::{create_dir_all, read_to_string, write};

    struct FakeBuilder;

    impl Builder for FakeBuilder {
        fn build(&self, generation_dir: &Path) -> crate::builder::Result<ArtifactRef> {
            let source = read_to_string(generation_dir.join(ENV_DIR).join(MANIFEST_TOML))
                .map_err(|err| BuildError::Other(err.to_string()))?;
            Ok(ArtifactRef::new(format!("/nix/store/{}-env", source.trim())))
        }
    }

    fn store(links: &Path) -> anyhow::Result<GenerationStore<MemoryVersionControl, FakeBuilder>> {
        let mut config = StoreConfig::default();
        config.store.meta_dir = Some("/meta".into());
        config.store.link_dir = Some(links.to_path_buf());
        config.store.owner = "alice".into();
        config.store.system = Some("x86_64-linux".into());
        config.store.interactive = false;

        Ok(GenerationStore::new(config, MemoryVersionControl::new(), FakeBuilder)?)
    }

    fn source(manifest: &str) -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        write(dir.path().join(MANIFEST_TOML), manifest)?;
        Ok(dir)
    }

    #[test]
    fn commit_rollback_and_switch() -> anyhow::Result<()> {
        let links = tempfile::tempdir()?;
        let store = store(links.path())?;
        let context = store.context("default", None);
        store.init(&context)?;
        assert_eq!(
            store.environments()?,
            vec![("x86_64-linux".to_string(), "default".to_string())]
        );

        let first = source("hello")?;
        let second = source("hello-cowsay")?;
        assert_eq!(
            store.commit_dir(&context, first.path(), "install hello", ChangeKind::Packages)?,
            Outcome::Created(GenerationId::new(1))
        );
        assert_eq!(
            store.commit_dir(&context, second.path(), "install cowsay", ChangeKind::Packages)?,
            Outcome::Created(GenerationId::new(2))
        );

        assert_eq!(
            store.rollback(&context)?,
            Outcome::SwitchedTo(GenerationId::new(1))
        );
        assert!(matches!(
            store.rollback(&context),
            Err(Error::NoPreviousGeneration)
        ));
        assert_eq!(
            store.switch(&context, GenerationId::new(2))?,
            Outcome::SwitchedTo(GenerationId::new(2))
        );

        let generations = store.generations(&context)?;
        assert_eq!(generations.len(), 2);
        assert_eq!(
            generations
                .get(GenerationId::new(1))
                .map(|gen| gen.log_message.clone()),
            Some(vec!["install hello".to_string()])
        );

        Ok(())
    }

    #[test]
    fn registry_access_goes_through_branch() -> anyhow::Result<()> {
        let links = tempfile::tempdir()?;
        let store = store(links.path())?;
        let context = store.context("default", None);
        store.init(&context)?;
        assert_eq!(store.registry_version(&context)?, 3);

        let path = parse_path("settings.colors")?;
        let outcome = store.edit_registry(&context, "enable colors", |registry| {
            registry.add_array(&path, "red".into())?;
            registry.add_array(&path, "red".into())
        })?;
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(
            store.registry_get(&context, &path)?,
            serde_json::json!(["red", "red"])
        );

        store.edit_registry(&context, "drop one", |registry| {
            registry.del_array(&path, &"red".into())
        })?;
        assert_eq!(
            store.registry_get(&context, &path)?,
            serde_json::json!(["red"])
        );

        Ok(())
    }

    #[test]
    fn reading_legacy_branch_migrates_it() -> anyhow::Result<()> {
        let links = tempfile::tempdir()?;
        let store = store(links.path())?;
        let context = store.context("default", None);
        store.init(&context)?;

        let repository = store.manager.repository();
        let vcs = repository.vcs();
        let clone = tempfile::tempdir()?;
        vcs.clone_branch(repository.path(), &context.branch(), clone.path())?;
        create_dir_all(clone.path().join("1"))?;
        write(clone.path().join("1").join(MANIFEST_JSON), r#"{"elements":[]}"#)?;
        write(
            clone.path().join(METADATA_FILE),
            serde_json::json!({
                "version": 1,
                "currentGen": 1,
                "generations": {
                    "1": { "path": "/nix/store/x", "description": "install hello", "created": 0, "lastActive": 0 }
                }
            })
            .to_string(),
        )?;
        vcs.commit_all(clone.path(), "legacy layout")?;
        vcs.push(clone.path(), &context.branch(), PushMode::FastForward)?;

        assert!(matches!(
            store.generations(&context),
            Err(Error::Migrated(steps)) if steps == ["001-nest-env-dir", "002-log-message-list"]
        ));
        assert_eq!(store.registry_version(&context)?, 3);

        let generations = store.generations(&context)?;
        assert_eq!(
            generations
                .get(GenerationId::new(1))
                .map(|gen| gen.log_message.clone()),
            Some(vec!["install hello".to_string()])
        );

        Ok(())
    }

    #[test]
    fn project_commit_keeps_state_in_project() -> anyhow::Result<()> {
        let links = tempfile::tempdir()?;
        let store = store(links.path())?;
        let project = tempfile::tempdir()?;
        create_dir_all(project.path().join(ENV_DIR))?;
        let context = store.context("project", Some(project.path().to_path_buf()));

        let manifest = source("hello")?;
        assert_eq!(
            store.commit_dir(&context, manifest.path(), "install hello", ChangeKind::Packages)?,
            Outcome::Created(GenerationId::new(2))
        );
        assert_eq!(
            read_to_string(project.path().join(ENV_DIR).join(MANIFEST_TOML))?,
            "hello"
        );
        assert!(store.environments()?.is_empty());

        Ok(())
    }
}
