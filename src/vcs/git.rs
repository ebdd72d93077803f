// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control through libgit2.

use crate::vcs::{Error, PushMode, PushStatus, Result, VersionControl, UPSTREAM_REMOTE};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::RepoBuilder, BranchType, Config, ErrorCode, FetchOptions, IndexAddOption, PushOptions,
    Remote, RemoteCallbacks, Repository, RepositoryInitOptions, Signature,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    fs::{create_dir_all, symlink_metadata},
    path::Path,
    time,
};
use tracing::{debug, info, instrument, warn};

/// Version control through libgit2.
///
/// Network operations against the upstream remote show a progress bar, and
/// prompt for credentials through it when the remote asks for them.
#[derive(Debug, Default, Clone)]
pub struct Git2VersionControl {
    quiet: bool,
}

impl Git2VersionControl {
    /// Construct new libgit2 backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct libgit2 backend that never draws progress bars.
    pub fn quiet() -> Self {
        Self { quiet: true }
    }

    fn progress_bar(&self, message: impl Into<String>) -> Result<ProgressBar> {
        let bar = if self.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };

        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(message.into());
        bar.enable_steady_tick(time::Duration::from_millis(100));

        Ok(bar)
    }

    fn open_bare(&self, repo: &Path) -> Result<Repository> {
        Repository::open_bare(repo).map_err(|err| Error::Corrupt {
            path: repo.to_path_buf(),
            reason: err.message().to_string(),
        })
    }
}

impl VersionControl for Git2VersionControl {
    #[instrument(skip(self), level = "debug")]
    fn ensure_initialized(&self, repo: &Path) -> Result<()> {
        if symlink_metadata(repo).is_ok() {
            return self.verify(repo);
        }

        info!("initialize generation repository: {:?}", repo.display());
        create_dir_all(repo).map_err(|source| Error::WorkTree {
            source,
            path: repo.to_path_buf(),
        })?;

        let mut opts = RepositoryInitOptions::new();
        opts.bare(true);
        opts.initial_head("main");
        Repository::init_opts(repo, &opts)?;

        Ok(())
    }

    fn verify(&self, repo: &Path) -> Result<()> {
        let corrupt = |reason: &str| Error::Corrupt {
            path: repo.to_path_buf(),
            reason: reason.into(),
        };

        let metadata = symlink_metadata(repo).map_err(|_| corrupt("path does not exist"))?;
        if metadata.file_type().is_symlink() && !repo.exists() {
            return Err(corrupt("path is a dangling symlink"));
        }

        let repository = self.open_bare(repo)?;
        if !repository.is_bare() {
            return Err(corrupt("repository is not bare"));
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        let repository = self.open_bare(repo)?;
        let refname = format!("refs/heads/{branch}");

        if repository.find_reference(&refname).is_err() {
            info!("create orphan branch {branch:?}");
            let tree_id = repository.treebuilder(None)?.write()?;
            let tree = repository.find_tree(tree_id)?;
            let signature = signature(&repository)?;
            repository.commit(
                Some(&refname),
                &signature,
                &signature,
                &format!("Initialize environment {branch}"),
                &tree,
                &[],
            )?;
        }

        repository.set_head(&refname)?;
        Ok(())
    }

    fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let repository = self.open_bare(repo)?;
        let exists = match repository.find_branch(branch, BranchType::Local) {
            Ok(_) => true,
            Err(err) if err.code() == ErrorCode::NotFound => false,
            Err(err) => return Err(err.into()),
        };

        Ok(exists)
    }

    fn list_branches(&self, repo: &Path) -> Result<Vec<String>> {
        let repository = self.open_bare(repo)?;
        let mut names = Vec::new();
        for entry in repository.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), level = "debug")]
    fn show_file(&self, repo: &Path, branch: &str, file: &Path) -> Result<Option<Vec<u8>>> {
        let repository = self.open_bare(repo)?;
        let reference = match repository.find_branch(branch, BranchType::Local) {
            Ok(branch) => branch.into_reference(),
            Err(err) if err.code() == ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let tree = reference.peel_to_tree()?;
        let entry = match tree.get_path(file) {
            Ok(entry) => entry,
            Err(err) if err.code() == ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let blob = entry.to_object(&repository)?.peel_to_blob()?;
        Ok(Some(blob.content().to_vec()))
    }

    fn set_upstream(&self, repo: &Path, url: &str) -> Result<()> {
        let repository = self.open_bare(repo)?;
        match repository.find_remote(UPSTREAM_REMOTE) {
            Ok(remote) if remote.url() == Some(url) => {}
            Ok(_) => repository.remote_set_url(UPSTREAM_REMOTE, url)?,
            Err(err) if err.code() == ErrorCode::NotFound => {
                repository.remote(UPSTREAM_REMOTE, url)?;
            }
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    fn upstream(&self, repo: &Path) -> Result<Option<String>> {
        let repository = self.open_bare(repo)?;
        let url = match repository.find_remote(UPSTREAM_REMOTE) {
            Ok(remote) => remote.url().map(str::to_owned),
            Err(err) if err.code() == ErrorCode::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        Ok(url)
    }

    #[instrument(skip(self), level = "debug")]
    fn fetch(&self, repo: &Path, branch: &str) -> Result<()> {
        let repository = self.open_bare(repo)?;
        let mut remote = match repository.find_remote(UPSTREAM_REMOTE) {
            Ok(remote) => remote,
            Err(err) if err.code() == ErrorCode::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let tracking = format!("refs/remotes/{UPSTREAM_REMOTE}/{branch}");
        let local = format!("refs/heads/{branch}");
        let bar = self.progress_bar(format!("fetch {branch}"))?;
        let config = Config::open_default().or_else(|_| Config::new())?;
        let prompter = IndicatifPrompter::new(bar.clone());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);

        let mut fo = FetchOptions::new();
        fo.remote_callbacks(remote_callbacks(&authenticator, &config, &bar));
        remote.fetch(
            &[format!("+refs/heads/{branch}:{tracking}")],
            Some(&mut fo),
            None,
        )?;
        bar.finish_and_clear();

        let Ok(upstream_oid) = repository.refname_to_id(&tracking) else {
            debug!("upstream has no branch {branch:?}");
            return Ok(());
        };

        match repository.refname_to_id(&local) {
            Ok(local_oid) if local_oid == upstream_oid => {}
            Ok(local_oid) if repository.graph_descendant_of(upstream_oid, local_oid)? => {
                info!("fast-forward {branch:?} to upstream");
                repository.reference_matching(
                    &local,
                    upstream_oid,
                    true,
                    local_oid,
                    "fetch: fast-forward",
                )?;
            }
            Ok(_) => warn!("branch {branch:?} has diverged from upstream"),
            Err(err) if err.code() == ErrorCode::NotFound => {
                repository.reference(&local, upstream_oid, false, "fetch: create from upstream")?;
            }
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn clone_branch(&self, repo: &Path, branch: &str, dest: &Path) -> Result<()> {
        debug!("clone {branch:?} into {:?}", dest.display());
        let source = repo.to_string_lossy().into_owned();
        match RepoBuilder::new().branch(branch).clone(&source, dest) {
            Ok(_) => Ok(()),
            Err(err) if err.code() == ErrorCode::NotFound => {
                Err(Error::NoSuchBranch(branch.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self, message), level = "debug")]
    fn commit_all(&self, worktree: &Path, message: &str) -> Result<()> {
        let repository =
            Repository::open(worktree).map_err(|_| Error::NotAClone(worktree.to_path_buf()))?;

        // INVARIANT: Stage additions and removals alike.
        let mut index = repository.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repository.find_tree(tree_id)?;
        let parent = repository.head()?.peel_to_commit()?;
        let signature = signature(&repository)?;
        repository.commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn push(&self, worktree: &Path, branch: &str, mode: PushMode) -> Result<PushStatus> {
        let repository =
            Repository::open(worktree).map_err(|_| Error::NotAClone(worktree.to_path_buf()))?;
        let refspec = refspec(branch, mode);

        let origin_url = repository
            .find_remote("origin")?
            .url()
            .map(str::to_owned)
            .ok_or_else(|| Error::NotAClone(worktree.to_path_buf()))?;

        if let Some(url) = self.upstream(Path::new(&origin_url))? {
            let mut remote = repository.remote_anonymous(&url)?;
            let status = self.push_refspec(&mut remote, &refspec, branch)?;
            if status != PushStatus::Accepted {
                return Ok(status);
            }
        }

        let mut origin = repository.find_remote("origin")?;
        self.push_refspec(&mut origin, &refspec, branch)
    }

    #[instrument(skip(self), level = "debug")]
    fn push_upstream(&self, repo: &Path, branch: &str, mode: PushMode) -> Result<PushStatus> {
        let repository = self.open_bare(repo)?;
        let mut remote = repository.find_remote(UPSTREAM_REMOTE)?;
        self.push_refspec(&mut remote, &refspec(branch, mode), branch)
    }
}

impl Git2VersionControl {
    fn push_refspec(&self, remote: &mut Remote, refspec: &str, branch: &str) -> Result<PushStatus> {
        let bar = self.progress_bar(format!("push {branch}"))?;
        let config = Config::open_default().or_else(|_| Config::new())?;
        let prompter = IndicatifPrompter::new(bar.clone());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);

        let mut rejection: Option<String> = None;
        let result = {
            let mut rc = remote_callbacks(&authenticator, &config, &bar);
            rc.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    rejection = Some(format!("{refname}: {message}"));
                }
                Ok(())
            });

            let mut po = PushOptions::new();
            po.remote_callbacks(rc);
            remote.push(&[refspec], Some(&mut po))
        };
        bar.finish_and_clear();

        match result {
            Ok(()) => {}
            Err(err) if err.code() == ErrorCode::NotFastForward => {
                return Ok(PushStatus::Rejected(err.message().to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        Ok(match rejection {
            Some(message) => PushStatus::Rejected(message),
            None => PushStatus::Accepted,
        })
    }
}

fn refspec(branch: &str, mode: PushMode) -> String {
    match mode {
        PushMode::FastForward => format!("refs/heads/{branch}:refs/heads/{branch}"),
        PushMode::Force => format!("+refs/heads/{branch}:refs/heads/{branch}"),
    }
}

fn signature(repository: &Repository) -> Result<Signature<'static>> {
    // INVARIANT: Commits must succeed even without a configured identity.
    match repository.signature() {
        Ok(signature) => Ok(signature.to_owned()),
        Err(_) => Ok(Signature::now("genstore", "genstore@localhost")?),
    }
}

fn remote_callbacks<'a>(
    authenticator: &'a GitAuthenticator,
    config: &'a Config,
    bar: &'a ProgressBar,
) -> RemoteCallbacks<'a> {
    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(config));
    rc.transfer_progress(move |progress| {
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            bar.set_length(progress.total_objects() as u64);
            bar.set_position(progress.received_objects() as u64);
        }
        true
    });

    rc
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}
