// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Generation store for reproducible package environments.
//!
//! An __environment__ is a named, owned, per-system set of packages. Its
//! history is kept as a sequence of immutable, numbered __generations__, each
//! one a declarative manifest plus the artifact an external builder produced
//! from it. Rolling back is re-activating an older generation.
//!
//! # Backing Store
//!
//! History lives in a version control repository with one branch per
//! environment. Changes are staged in a disposable clone and published with
//! a fast-forward push, so concurrent writers on different machines never
//! silently overwrite each other. The loser of a race is told so and retries.
//!
//! # Activation
//!
//! Other processes find the active generation through symlinks maintained by
//! the [`link`] module.

pub mod builder;
pub mod config;
pub mod context;
pub mod generation;
pub mod link;
pub mod migrate;
pub mod path;
pub mod registry;
pub mod repository;
pub mod store;
pub mod transaction;
pub mod vcs;

pub use context::{Context, EnvironmentKind, SCHEMA_VERSION};
pub use generation::{ArtifactRef, GenerationId};
pub use store::GenerationStore;
pub use transaction::{ChangeKind, Outcome};
