// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control kept entirely in memory.
//!
//! History lives in memory, working clones are real directories so that
//! callers can stage files into them as usual. Pushes follow the same
//! fast-forward rules as the libgit2 backend, which makes this backend good
//! enough to exercise concurrent writers without real repositories.

use crate::vcs::{Error, PushMode, PushStatus, Result, VersionControl};

use std::{
    collections::{BTreeMap, HashMap},
    fs::{create_dir_all, read, read_dir, write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, instrument};

type CommitId = usize;
type Files = BTreeMap<PathBuf, Vec<u8>>;

#[derive(Debug, Clone)]
struct Commit {
    parent: Option<CommitId>,
    files: Files,
    message: String,
}

#[derive(Debug, Default)]
struct Repo {
    branches: BTreeMap<String, CommitId>,
    head: Option<String>,
    upstream: Option<String>,
}

#[derive(Debug)]
struct WorkingClone {
    origin: PathBuf,
    branch: String,
    head: CommitId,
}

#[derive(Debug, Default)]
struct State {
    commits: Vec<Commit>,
    repos: HashMap<PathBuf, Repo>,
    clones: HashMap<PathBuf, WorkingClone>,
}

impl State {
    fn repo(&self, path: &Path) -> Result<&Repo> {
        self.repos.get(path).ok_or_else(|| not_a_repository(path))
    }

    fn repo_mut(&mut self, path: &Path) -> Result<&mut Repo> {
        self.repos.get_mut(path).ok_or_else(|| not_a_repository(path))
    }

    fn is_ancestor(&self, ancestor: CommitId, mut commit: CommitId) -> bool {
        loop {
            if commit == ancestor {
                return true;
            }

            match self.commits[commit].parent {
                Some(parent) => commit = parent,
                None => return false,
            }
        }
    }

    fn commit(&mut self, parent: Option<CommitId>, files: Files, message: &str) -> CommitId {
        self.commits.push(Commit {
            parent,
            files,
            message: message.to_string(),
        });
        self.commits.len() - 1
    }

    fn update(&mut self, repo: &Path, branch: &str, commit: CommitId, mode: PushMode) -> Result<PushStatus> {
        let current = self.repo(repo)?.branches.get(branch).copied();
        if let (Some(current), PushMode::FastForward) = (current, mode) {
            if !self.is_ancestor(current, commit) {
                return Ok(PushStatus::Rejected(format!(
                    "refs/heads/{branch}: non-fast-forward update rejected"
                )));
            }
        }

        self.repo_mut(repo)?.branches.insert(branch.to_string(), commit);
        Ok(PushStatus::Accepted)
    }
}

/// Version control kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryVersionControl {
    state: Mutex<State>,
}

impl MemoryVersionControl {
    /// Construct new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits reachable from the tip of a branch.
    pub fn history_len(&self, repo: &Path, branch: &str) -> Result<usize> {
        let state = self.lock();
        let mut next = state.repo(repo)?.branches.get(branch).copied();
        let mut len = 0;
        while let Some(commit) = next {
            len += 1;
            next = state.commits[commit].parent;
        }

        Ok(len)
    }

    /// Commit messages reachable from the tip of a branch, newest first.
    pub fn log(&self, repo: &Path, branch: &str) -> Result<Vec<String>> {
        let state = self.lock();
        let mut next = state.repo(repo)?.branches.get(branch).copied();
        let mut messages = Vec::new();
        while let Some(commit) = next {
            messages.push(state.commits[commit].message.clone());
            next = state.commits[commit].parent;
        }

        Ok(messages)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl VersionControl for MemoryVersionControl {
    fn ensure_initialized(&self, repo: &Path) -> Result<()> {
        let mut state = self.lock();
        state.repos.entry(repo.to_path_buf()).or_default();
        Ok(())
    }

    fn verify(&self, repo: &Path) -> Result<()> {
        self.lock().repo(repo).map(|_| ())
    }

    fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.repo(repo)?.branches.contains_key(branch) {
            let commit = state.commit(None, Files::new(), &format!("Initialize environment {branch}"));
            state.repo_mut(repo)?.branches.insert(branch.to_string(), commit);
        }

        state.repo_mut(repo)?.head = Some(branch.to_string());
        Ok(())
    }

    fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        Ok(self.lock().repo(repo)?.branches.contains_key(branch))
    }

    fn list_branches(&self, repo: &Path) -> Result<Vec<String>> {
        Ok(self.lock().repo(repo)?.branches.keys().cloned().collect())
    }

    fn show_file(&self, repo: &Path, branch: &str, file: &Path) -> Result<Option<Vec<u8>>> {
        let state = self.lock();
        let Some(commit) = state.repo(repo)?.branches.get(branch) else {
            return Ok(None);
        };

        Ok(state.commits[*commit].files.get(file).cloned())
    }

    fn set_upstream(&self, repo: &Path, url: &str) -> Result<()> {
        self.lock().repo_mut(repo)?.upstream = Some(url.to_string());
        Ok(())
    }

    fn upstream(&self, repo: &Path) -> Result<Option<String>> {
        Ok(self.lock().repo(repo)?.upstream.clone())
    }

    #[instrument(skip(self), level = "debug")]
    fn fetch(&self, repo: &Path, branch: &str) -> Result<()> {
        let mut state = self.lock();
        let Some(upstream) = state.repo(repo)?.upstream.clone() else {
            return Ok(());
        };

        let upstream = PathBuf::from(upstream);
        let Some(remote) = state.repo(&upstream)?.branches.get(branch).copied() else {
            return Ok(());
        };

        match state.repo(repo)?.branches.get(branch).copied() {
            Some(local) if !state.is_ancestor(local, remote) => {
                debug!("branch {branch:?} has diverged from upstream");
            }
            _ => {
                state.repo_mut(repo)?.branches.insert(branch.to_string(), remote);
            }
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn clone_branch(&self, repo: &Path, branch: &str, dest: &Path) -> Result<()> {
        let mut state = self.lock();
        let head = *state
            .repo(repo)?
            .branches
            .get(branch)
            .ok_or_else(|| Error::NoSuchBranch(branch.to_string()))?;

        for (path, content) in &state.commits[head].files {
            let full_path = dest.join(path);
            if let Some(parent) = full_path.parent() {
                create_dir_all(parent).map_err(|source| worktree_error(source, parent))?;
            }
            write(&full_path, content).map_err(|source| worktree_error(source, &full_path))?;
        }
        create_dir_all(dest).map_err(|source| worktree_error(source, dest))?;

        // INVARIANT: Forget clones whose working directory was removed.
        state.clones.retain(|path, _| path.exists());
        state.clones.insert(
            dest.to_path_buf(),
            WorkingClone {
                origin: repo.to_path_buf(),
                branch: branch.to_string(),
                head,
            },
        );

        Ok(())
    }

    fn commit_all(&self, worktree: &Path, message: &str) -> Result<()> {
        let files = snapshot(worktree)?;
        let mut state = self.lock();
        let parent = state
            .clones
            .get(worktree)
            .map(|clone| clone.head)
            .ok_or_else(|| Error::NotAClone(worktree.to_path_buf()))?;

        let commit = state.commit(Some(parent), files, message);
        if let Some(clone) = state.clones.get_mut(worktree) {
            clone.head = commit;
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn push(&self, worktree: &Path, branch: &str, mode: PushMode) -> Result<PushStatus> {
        let mut state = self.lock();
        let clone = state
            .clones
            .get(worktree)
            .ok_or_else(|| Error::NotAClone(worktree.to_path_buf()))?;
        if clone.branch != branch {
            return Err(Error::NoSuchBranch(branch.to_string()));
        }

        let (origin, head) = (clone.origin.clone(), clone.head);
        if let Some(upstream) = state.repo(&origin)?.upstream.clone() {
            let status = state.update(Path::new(&upstream), branch, head, mode)?;
            if status != PushStatus::Accepted {
                return Ok(status);
            }
        }

        state.update(&origin, branch, head, mode)
    }

    fn push_upstream(&self, repo: &Path, branch: &str, mode: PushMode) -> Result<PushStatus> {
        let mut state = self.lock();
        let upstream = state
            .repo(repo)?
            .upstream
            .clone()
            .ok_or_else(|| not_a_repository(repo))?;
        let head = *state
            .repo(repo)?
            .branches
            .get(branch)
            .ok_or_else(|| Error::NoSuchBranch(branch.to_string()))?;

        state.update(Path::new(&upstream), branch, head, mode)
    }
}

fn snapshot(worktree: &Path) -> Result<Files> {
    let mut files = Files::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let dir = worktree.join(&relative);
        for entry in read_dir(&dir).map_err(|source| worktree_error(source, &dir))? {
            let entry = entry.map_err(|source| worktree_error(source, &dir))?;
            let path = relative.join(entry.file_name());
            let file_type = entry
                .file_type()
                .map_err(|source| worktree_error(source, &entry.path()))?;

            if file_type.is_dir() {
                pending.push(path);
            } else {
                let content =
                    read(entry.path()).map_err(|source| worktree_error(source, &entry.path()))?;
                files.insert(path, content);
            }
        }
    }

    Ok(files)
}

fn not_a_repository(path: &Path) -> Error {
    Error::Corrupt {
        path: path.to_path_buf(),
        reason: "not a repository".into(),
    }
}

fn worktree_error(source: std::io::Error, path: &Path) -> Error {
    Error::WorkTree {
        source,
        path: path.to_path_buf(),
    }
}
