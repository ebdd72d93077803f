// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External builder interface.
//!
//! The generation store never builds anything itself. It hands a staged
//! generation directory to a [`Builder`] and records the artifact reference
//! that comes back. Artifact references are opaque and only compared for
//! equality.

use crate::generation::{ArtifactRef, ENV_DIR};

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::Command,
};
use tracing::debug;

/// Materialize generations into artifacts.
pub trait Builder {
    /// Build generation directory into an artifact.
    fn build(&self, generation_dir: &Path) -> Result<ArtifactRef>;

    /// Register `link` as garbage collection root of `artifact`.
    ///
    /// The link itself is managed by the caller. Builders without a garbage
    /// collector have nothing to do here.
    fn register_root(&self, _link: &Path, _artifact: &ArtifactRef) -> Result<()> {
        Ok(())
    }
}

impl<B> Builder for &B
where
    B: Builder + ?Sized,
{
    fn build(&self, generation_dir: &Path) -> Result<ArtifactRef> {
        (**self).build(generation_dir)
    }

    fn register_root(&self, link: &Path, artifact: &ArtifactRef) -> Result<()> {
        (**self).register_root(link, artifact)
    }
}

/// Builder that shells out to Nix.
///
/// The `env` directory of a generation is built as a flake, e.g.
/// `nix build --no-link --print-out-paths path:<gen>/env`.
#[derive(Debug, Clone)]
pub struct NixBuilder {
    program: OsString,
    extra_args: Vec<OsString>,
}

impl Default for NixBuilder {
    fn default() -> Self {
        Self {
            program: "nix".into(),
            extra_args: Vec::new(),
        }
    }
}

impl NixBuilder {
    /// Construct new builder calling `nix` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different Nix binary.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    /// Pass extra arguments to every Nix call, e.g. `--option`.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn nix(&self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Result<String> {
        let args = self
            .extra_args
            .iter()
            .cloned()
            .chain(args.into_iter().map(|arg| arg.as_ref().to_os_string()))
            .collect::<Vec<_>>();
        syscall_non_interactive(&self.program, args)
    }
}

impl Builder for NixBuilder {
    fn build(&self, generation_dir: &Path) -> Result<ArtifactRef> {
        let mut flake = OsString::from("path:");
        flake.push(generation_dir.join(ENV_DIR));

        let stdout = self.nix([
            OsStr::new("build"),
            OsStr::new("--no-link"),
            OsStr::new("--print-out-paths"),
            flake.as_os_str(),
        ])?;

        // INVARIANT: The environment has exactly one output, listed first.
        let artifact = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or(BuildError::NoOutput)?;
        debug!("built {:?} into {artifact}", generation_dir.display());

        Ok(ArtifactRef::new(artifact))
    }

    fn register_root(&self, link: &Path, artifact: &ArtifactRef) -> Result<()> {
        self.nix([
            OsStr::new("build"),
            OsStr::new(artifact.as_str()),
            OsStr::new("--out-link"),
            link.as_os_str(),
            OsStr::new("--offline"),
        ])?;

        Ok(())
    }
}

fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let output = Command::new(cmd.as_ref())
        .args(args)
        .output()
        .map_err(|source| BuildError::Spawn {
            source,
            program: cmd.as_ref().to_string_lossy().into_owned(),
        })?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    if !output.status.success() {
        // INVARIANT: Chomp trailing newlines.
        let stderr = stderr.trim_end_matches(['\r', '\n']).to_string();
        return Err(BuildError::Failed {
            program: cmd.as_ref().to_string_lossy().into_owned(),
            stderr,
        });
    }

    Ok(stdout)
}

/// External builder error types.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Builder could not be started.
    #[error("failed to run {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Builder exited unsuccessfully.
    #[error("command {program:?} failed:\n{stderr}")]
    Failed { program: String, stderr: String },

    /// Builder succeeded without naming an artifact.
    #[error("builder produced no output")]
    NoOutput,

    /// Builder-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Friendly result alias :3
pub type Result<T, E = BuildError> = std::result::Result<T, E>;
