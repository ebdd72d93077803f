// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Explicit environment context.
//!
//! Every store operation is addressed through a [`Context`]. It names the
//! environment being worked on, who owns it, what system it was built for,
//! and which schema revision of the on-disk layout the caller understands.
//! Nothing about the environment is threaded through process globals.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};

/// Schema revision of the generation store layout this build understands.
pub const SCHEMA_VERSION: u64 = 3;

/// Which environment an operation applies to, and how it is backed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /// Owner of the environment, e.g. "local" or a remote account name.
    pub owner: String,

    /// Target system double, e.g. "x86_64-linux".
    pub system: String,

    /// Environment name.
    pub name: String,

    /// Schema version every registry access is checked against.
    pub schema_version: u64,

    /// Where the environment's history lives.
    pub kind: EnvironmentKind,
}

impl Context {
    /// Construct context for a named environment backed by a repository branch.
    pub fn named(
        owner: impl Into<String>,
        system: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            system: system.into(),
            name: name.into(),
            schema_version: SCHEMA_VERSION,
            kind: EnvironmentKind::Named,
        }
    }

    /// Construct context for a project environment living beside source files.
    pub fn project(
        owner: impl Into<String>,
        system: impl Into<String>,
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: EnvironmentKind::Project { dir: dir.into() },
            ..Self::named(owner, system, name)
        }
    }

    /// Branch of the generation repository holding this environment.
    ///
    /// Branch names encode the system and environment name as
    /// `<system>.<name>`.
    pub fn branch(&self) -> String {
        format!("{}.{}", self.system, self.name)
    }

    /// Name of top-level activation link.
    pub fn link_name(&self) -> String {
        self.branch()
    }

    /// Name of per-generation garbage collection root.
    pub fn generation_link_name(&self, generation: u64) -> String {
        format!("{}-{generation}-link", self.branch())
    }

    /// Project directory if this is a project environment.
    pub fn project_dir(&self) -> Option<&Path> {
        match &self.kind {
            EnvironmentKind::Project { dir } => Some(dir.as_path()),
            EnvironmentKind::Named => None,
        }
    }

    /// Check if environment is a project environment.
    pub fn is_project(&self) -> bool {
        matches!(self.kind, EnvironmentKind::Project { .. })
    }
}

impl Display for Context {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}/{}", self.owner, self.branch())
    }
}

/// Backing of an environment's generation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentKind {
    /// History kept on a branch of the owner's generation repository.
    Named,

    /// History collapses into one simulated generation held in an ephemeral
    /// directory. State lives in the project directory itself.
    Project { dir: PathBuf },
}

/// Split a branch name of the form `<system>.<name>`.
///
/// Returns `None` for names that do not look like environment branches.
pub fn parse_branch(branch: &str) -> Option<(&str, &str)> {
    let (system, name) = branch.split_once('.')?;
    if system.is_empty() || name.is_empty() {
        return None;
    }

    Some((system, name))
}

/// Detect system double of the running host, e.g. "aarch64-darwin".
pub fn host_system() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };

    format!("{}-{os}", std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    #[test]
    fn branch_and_link_names() {
        let context = Context::named("alice", "x86_64-linux", "default");
        pretty_assertions::assert_eq!(context.branch(), "x86_64-linux.default");
        pretty_assertions::assert_eq!(context.link_name(), "x86_64-linux.default");
        pretty_assertions::assert_eq!(
            context.generation_link_name(4),
            "x86_64-linux.default-4-link"
        );
        pretty_assertions::assert_eq!(context.to_string(), "alice/x86_64-linux.default");
        assert!(context.project_dir().is_none());
    }

    #[test]
    fn project_context_keeps_directory() {
        let context = Context::project("alice", "x86_64-linux", "proj", "/src/proj");
        assert!(context.is_project());
        pretty_assertions::assert_eq!(context.project_dir(), Some(Path::new("/src/proj")));
        pretty_assertions::assert_eq!(context.schema_version, SCHEMA_VERSION);
    }

    #[test_case("x86_64-linux.default", Some(("x86_64-linux", "default")); "regular")]
    #[test_case("aarch64-darwin.my.env", Some(("aarch64-darwin", "my.env")); "dotted name")]
    #[test_case("master", None; "no separator")]
    #[test_case(".default", None; "empty system")]
    #[test]
    fn branch_parsing(branch: &str, expect: Option<(&str, &str)>) {
        pretty_assertions::assert_eq!(parse_branch(branch), expect);
    }
}
