// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Activation link management.
//!
//! Shells and the builder locate the active environment by dereferencing
//! symlinks under the link directory:
//!
//! ```text
//! <link_dir>/<owner>/<system>.<name>             -> <system>.<name>-<gen>-link
//! <link_dir>/<owner>/<system>.<name>-<gen>-link  -> <artifact>
//! ```
//!
//! The per-generation link doubles as garbage collection root of the
//! artifact. The top-level link always points at a per-generation link and
//! never directly at an artifact, so that switching generations is a single
//! symlink replacement.

use crate::{
    context::Context,
    generation::{ArtifactRef, GenerationId, Generations},
};

use chrono::Utc;
use std::{
    fs::{create_dir_all, read_dir, read_link, remove_file, rename, symlink_metadata},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use tracing::{debug, info, instrument};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Retention policy for per-generation links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunePolicy {
    /// Links inactive for longer than this are stale.
    pub max_age_days: u64,

    /// Number of most recently active generations always kept.
    pub keep_generations: usize,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            max_age_days: 90,
            keep_generations: 10,
        }
    }
}

/// Currently activated generation of an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLink {
    pub generation: GenerationId,
    pub artifact: ArtifactRef,
}

/// Manager of activation links under a link directory.
#[derive(Debug, Clone)]
pub struct LinkManager {
    link_dir: PathBuf,
}

impl LinkManager {
    /// Construct new link manager rooted at `link_dir`.
    pub fn new(link_dir: impl Into<PathBuf>) -> Self {
        Self {
            link_dir: link_dir.into(),
        }
    }

    /// Directory holding links of an owner.
    pub fn owner_dir(&self, context: &Context) -> PathBuf {
        self.link_dir.join(&context.owner)
    }

    /// Path of top-level link of environment.
    pub fn link_path(&self, context: &Context) -> PathBuf {
        self.owner_dir(context).join(context.link_name())
    }

    /// Path of per-generation link of environment.
    pub fn generation_link_path(&self, context: &Context, generation: GenerationId) -> PathBuf {
        self.owner_dir(context)
            .join(context.generation_link_name(generation.get()))
    }

    /// Register artifact as garbage collection root of generation.
    ///
    /// Leaves the top-level link alone.
    pub fn root(
        &self,
        context: &Context,
        generation: GenerationId,
        artifact: &ArtifactRef,
    ) -> Result<PathBuf> {
        let root = self.generation_link_path(context, generation);
        replace_symlink(artifact.as_path(), &root)?;
        debug!("rooted {artifact} at {:?}", root.display());

        Ok(root)
    }

    /// Point top-level link of environment at per-generation link.
    ///
    /// # Errors
    ///
    /// - Return [`Error::MissingRoot`] if generation has not been rooted.
    pub fn activate(&self, context: &Context, generation: GenerationId) -> Result<()> {
        let root = self.generation_link_path(context, generation);
        if symlink_metadata(&root).is_err() {
            return Err(Error::MissingRoot(root));
        }

        // INVARIANT: Relative target keeps link directory relocatable.
        let target = PathBuf::from(context.generation_link_name(generation.get()));
        replace_symlink(&target, &self.link_path(context))?;
        info!("activated generation {generation} of {context}");

        Ok(())
    }

    /// Root artifact for generation, then atomically activate it.
    #[instrument(skip(self), level = "debug")]
    pub fn root_and_link(
        &self,
        context: &Context,
        generation: GenerationId,
        artifact: &ArtifactRef,
    ) -> Result<PathBuf> {
        let root = self.root(context, generation, artifact)?;
        self.activate(context, generation)?;

        Ok(root)
    }

    /// Generation currently pointed at by the top-level link, if any.
    pub fn current(&self, context: &Context) -> Result<Option<ActiveLink>> {
        let link = self.link_path(context);
        let target = match read_link(&link) {
            Ok(target) => target,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::Io { source, path: link }),
        };

        let Some(generation) = target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| parse_generation_link(context, name))
        else {
            return Err(Error::Foreign(link));
        };

        let root = self.generation_link_path(context, generation);
        let artifact = read_link(&root).map_err(|source| Error::Io { source, path: root })?;

        Ok(Some(ActiveLink {
            generation,
            artifact: ArtifactRef::from(artifact),
        }))
    }

    /// Remove stale per-generation links of environment.
    ///
    /// A link is stale once its generation has been inactive for longer than
    /// the policy allows. The current generation and the most recently active
    /// generations are always kept. Returns the generations pruned.
    ///
    /// # Errors
    ///
    /// - Return [`Error::TimestampInFuture`] if a generation claims to have
    ///   been active after `now`.
    pub fn prune_stale(
        &self,
        context: &Context,
        generations: &Generations,
        policy: PrunePolicy,
    ) -> Result<Vec<GenerationId>> {
        self.prune_stale_at(context, generations, policy, Utc::now().timestamp())
    }

    /// Same as [`LinkManager::prune_stale`] with explicit current time.
    #[instrument(skip(self, generations), level = "debug")]
    pub fn prune_stale_at(
        &self,
        context: &Context,
        generations: &Generations,
        policy: PrunePolicy,
        now: i64,
    ) -> Result<Vec<GenerationId>> {
        let mut links = Vec::new();
        for (generation, path) in self.generation_links(context)? {
            let last_active = match generations.get(generation) {
                Some(metadata) => metadata.last_active,
                None => link_mtime(&path)?,
            };

            if last_active > now {
                return Err(Error::TimestampInFuture {
                    generation,
                    last_active,
                    now,
                });
            }

            links.push((generation, path, last_active));
        }

        // INVARIANT: Most recently active first, newest generation breaks ties.
        links.sort_by(|(a_gen, _, a_time), (b_gen, _, b_time)| {
            b_time.cmp(a_time).then(b_gen.cmp(a_gen))
        });

        let max_age = i64::try_from(policy.max_age_days)
            .unwrap_or(i64::MAX / SECONDS_PER_DAY)
            .saturating_mul(SECONDS_PER_DAY);
        let mut pruned = Vec::new();
        for (generation, path, last_active) in links.into_iter().skip(policy.keep_generations) {
            if Some(generation) == generations.current() || now - last_active <= max_age {
                continue;
            }

            remove_file(&path).map_err(|source| Error::Io { source, path })?;
            info!("pruned generation {generation} link of {context}");
            pruned.push(generation);
        }

        pruned.sort();
        Ok(pruned)
    }

    fn generation_links(&self, context: &Context) -> Result<Vec<(GenerationId, PathBuf)>> {
        let dir = self.owner_dir(context);
        let entries = match read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(Error::Io { source, path: dir }),
        };

        let mut links = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                source,
                path: dir.clone(),
            })?;
            let name = entry.file_name();
            if let Some(generation) = name
                .to_str()
                .and_then(|name| parse_generation_link(context, name))
            {
                links.push((generation, entry.path()));
            }
        }

        Ok(links)
    }
}

fn parse_generation_link(context: &Context, name: &str) -> Option<GenerationId> {
    name.strip_prefix(&context.branch())?
        .strip_prefix('-')?
        .strip_suffix("-link")?
        .parse()
        .ok()
}

fn link_mtime(path: &Path) -> Result<i64> {
    let modified = symlink_metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(|source| Error::Io {
            source,
            path: path.to_path_buf(),
        })?;

    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default())
}

/// Replace symlink at `link` by renaming a fresh one over it.
///
/// Readers observe either the old or the new target, never a missing link.
fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let io_error = |source| Error::Io {
        source,
        path: link.to_path_buf(),
    };

    let parent = link.parent().unwrap_or(Path::new("."));
    create_dir_all(parent).map_err(io_error)?;

    let name = link
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{name}.{}.tmp", std::process::id()));
    match remove_file(&staging) {
        Err(err) if err.kind() != ErrorKind::NotFound => return Err(io_error(err)),
        _ => {}
    }

    symlink(target, &staging).map_err(io_error)?;
    rename(&staging, link).map_err(io_error)?;

    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Activation link error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Generation has no garbage collection root to point at.
    #[error("no garbage collection root at {:?}", .0.display())]
    MissingRoot(PathBuf),

    /// Top-level link points somewhere unexpected.
    #[error("activation link {:?} does not point at a generation link", .0.display())]
    Foreign(PathBuf),

    /// Generation claims to have been active in the future.
    #[error("generation {generation} was last active at {last_active}, after now ({now})")]
    TimestampInFuture {
        generation: GenerationId,
        last_active: i64,
        now: i64,
    },

    /// Link cannot be read or written.
    #[error("failed to access activation link {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::RegistryDocument;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const DAY: i64 = SECONDS_PER_DAY;

    fn context() -> Context {
        Context::named("alice", "x86_64-linux", "default")
    }

    fn generations(current: u64, last_active: &[(u64, i64)]) -> anyhow::Result<Generations> {
        let mut entries = serde_json::Map::new();
        for (id, time) in last_active {
            entries.insert(
                id.to_string(),
                json!({ "path": format!("/nix/store/{id}"), "created": time, "lastActive": time }),
            );
        }

        let document = json!({ "version": 3, "currentGen": current, "generations": entries });
        Ok(Generations::from_document(&RegistryDocument::from_slice(
            document.to_string().as_bytes(),
            3,
        )?)?)
    }

    #[test]
    fn top_level_link_points_at_generation_link() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let links = LinkManager::new(dir.path());

        links.root_and_link(&context(), GenerationId::new(1), &"/nix/store/x".into())?;
        assert_eq!(
            read_link(links.link_path(&context()))?,
            PathBuf::from("x86_64-linux.default-1-link")
        );
        assert_eq!(
            links.current(&context())?,
            Some(ActiveLink {
                generation: GenerationId::new(1),
                artifact: "/nix/store/x".into(),
            })
        );

        links.root_and_link(&context(), GenerationId::new(2), &"/nix/store/y".into())?;
        links.activate(&context(), GenerationId::new(1))?;
        assert_eq!(
            links.current(&context())?.map(|link| link.artifact),
            Some("/nix/store/x".into())
        );

        Ok(())
    }

    #[test]
    fn activate_requires_root() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let links = LinkManager::new(dir.path());
        assert!(matches!(
            links.activate(&context(), GenerationId::new(4)),
            Err(Error::MissingRoot(_))
        ));
        assert_eq!(links.current(&context())?, None);

        Ok(())
    }

    #[test]
    fn prune_keeps_current_and_recent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let links = LinkManager::new(dir.path());
        let now = 1000 * DAY;
        for id in 1..=4 {
            links.root(&context(), GenerationId::new(id), &format!("/nix/store/{id}").as_str().into())?;
        }

        let history = generations(
            1,
            &[(1, now - 500 * DAY), (2, now - 400 * DAY), (3, now - 300 * DAY), (4, now - DAY)],
        )?;
        let policy = PrunePolicy {
            max_age_days: 90,
            keep_generations: 1,
        };

        let pruned = links.prune_stale_at(&context(), &history, policy, now)?;
        assert_eq!(pruned, vec![GenerationId::new(2), GenerationId::new(3)]);
        assert!(symlink_metadata(links.generation_link_path(&context(), GenerationId::new(1))).is_ok());
        assert!(symlink_metadata(links.generation_link_path(&context(), GenerationId::new(4))).is_ok());

        Ok(())
    }

    #[test]
    fn prune_rejects_future_timestamps() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let links = LinkManager::new(dir.path());
        links.root(&context(), GenerationId::new(1), &"/nix/store/x".into())?;

        let history = generations(1, &[(1, 10 * DAY)])?;
        let result = links.prune_stale_at(&context(), &history, PrunePolicy::default(), DAY);
        assert!(matches!(result, Err(Error::TimestampInFuture { .. })));

        Ok(())
    }
}
