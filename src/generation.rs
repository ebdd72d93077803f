// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Generation bookkeeping.
//!
//! A __generation__ is one immutable, numbered snapshot of an environment's
//! declared manifest together with the artifact produced by building it.
//! Generations are tracked in the environment's registry document:
//!
//! ```json
//! {
//!   "version": 3,
//!   "currentGen": 2,
//!   "generations": {
//!     "1": { "path": "/nix/store/...", "logMessage": ["..."], "created": 0, "lastActive": 0, "version": 3 },
//!     "2": { ... }
//!   }
//! }
//! ```
//!
//! The types here give a typed, read-only view over that layout, and decide
//! when two generations are equivalent builds.

use crate::registry::{self, PathSegment, RegistryDocument};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read,
    io::ErrorKind,
    num::ParseIntError,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Registry field naming the active generation. Zero means none.
pub const CURRENT_GEN_FIELD: &str = "currentGen";

/// Registry field mapping generation numbers to their metadata.
pub const GENERATIONS_FIELD: &str = "generations";

/// Directory inside a generation holding its declarative environment.
pub const ENV_DIR: &str = "env";

/// Built manifest of a generation, relative to the generation directory.
pub const MANIFEST_JSON: &str = "manifest.json";

/// Declarative source of a generation, relative to the generation directory.
pub const MANIFEST_TOML: &str = "manifest.toml";

/// Element fields only relevant at build time.
const BUILD_TIME_FIELDS: &[&str] = &["url", "originalUrl"];

/// Generation number.
///
/// Positive and strictly increasing per environment. Zero is reserved to mean
/// "no generation".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(u64);

impl GenerationId {
    /// Construct new generation number.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw generation number.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Generation number following this one.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Exhausted`] if no number follows this one.
    pub fn next(self) -> Result<Self> {
        self.0.checked_add(1).map(Self).ok_or(Error::Exhausted(self))
    }

    /// Directory of this generation relative to the repository root.
    pub fn dir_name(self) -> String {
        self.0.to_string()
    }
}

impl Display for GenerationId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}", self.0)
    }
}

impl FromStr for GenerationId {
    type Err = ParseIntError;

    fn from_str(data: &str) -> std::result::Result<Self, Self::Err> {
        data.parse().map(Self)
    }
}

impl From<u64> for GenerationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque reference to a built artifact, e.g. a content-addressed store path.
///
/// Only equality is meaningful.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Construct new artifact reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Treat artifact reference as a filesystem path.
    pub fn as_path(&self) -> &Path {
        Path::new(self.0.as_str())
    }

    /// Raw reference.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ArtifactRef {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.0)
    }
}

impl From<&str> for ArtifactRef {
    fn from(reference: &str) -> Self {
        Self(reference.into())
    }
}

impl From<PathBuf> for ArtifactRef {
    fn from(path: PathBuf) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

/// Metadata recorded for a single generation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMetadata {
    /// Built artifact of the generation.
    pub path: ArtifactRef,

    /// Human-readable change descriptions, in order.
    #[serde(default)]
    pub log_message: Vec<String>,

    /// Unix timestamp of creation.
    pub created: i64,

    /// Unix timestamp of the last time this generation was made current.
    pub last_active: i64,

    /// Schema revision the generation was written with.
    #[serde(default)]
    pub version: u64,

    /// Fields this build does not know about.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerationMetadata {
    /// Construct metadata for a generation created at `now`.
    pub fn new(path: ArtifactRef, log_message: Vec<String>, now: i64, version: u64) -> Self {
        Self {
            path,
            log_message,
            created: now,
            last_active: now,
            version,
            extra: Map::new(),
        }
    }
}

/// Typed view over all generations of an environment.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Generations {
    current: Option<GenerationId>,
    entries: BTreeMap<GenerationId, GenerationMetadata>,
}

impl Generations {
    /// Extract generation bookkeeping from registry document.
    ///
    /// A document without `currentGen` or `generations` describes an empty
    /// environment.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidCurrent`] if `currentGen` is not a
    ///   non-negative integer.
    /// - Return [`Error::InvalidKey`] if a generation key is not a number.
    /// - Return [`Error::Decode`] if generation metadata is malformed.
    pub fn from_document(document: &RegistryDocument) -> Result<Self> {
        let current = match document.get(&current_gen_path()) {
            Ok(value) => value.as_u64().ok_or(Error::InvalidCurrent)?,
            Err(registry::Error::NotFound { .. }) => 0,
            Err(err) => return Err(err.into()),
        };

        let mut entries = BTreeMap::new();
        if let Ok(Value::Object(map)) = document.get(&PathSegment::keys([GENERATIONS_FIELD])) {
            for (key, value) in map {
                let id: GenerationId = key
                    .parse()
                    .map_err(|_| Error::InvalidKey(key.clone()))?;
                let metadata = GenerationMetadata::deserialize(value).map_err(|source| {
                    Error::Decode {
                        generation: key.clone(),
                        source,
                    }
                })?;
                entries.insert(id, metadata);
            }
        }

        Ok(Self {
            current: (current != 0).then_some(GenerationId(current)),
            entries,
        })
    }

    /// Active generation, if any.
    pub fn current(&self) -> Option<GenerationId> {
        self.current
    }

    /// Metadata of active generation, if any.
    pub fn current_metadata(&self) -> Option<&GenerationMetadata> {
        self.current.and_then(|id| self.entries.get(&id))
    }

    /// Metadata of a generation.
    pub fn get(&self, id: GenerationId) -> Option<&GenerationMetadata> {
        self.entries.get(&id)
    }

    /// Check if generation has been recorded.
    pub fn contains(&self, id: GenerationId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Highest recorded generation number.
    pub fn latest(&self) -> Option<GenerationId> {
        self.entries.keys().next_back().copied()
    }

    /// Number for the next generation.
    ///
    /// Always one past the highest generation ever recorded, never one past
    /// the current generation, so numbers are not reused after rollbacks.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Exhausted`] if the highest generation number is
    ///   already the largest representable one.
    pub fn next_id(&self) -> Result<GenerationId> {
        self.latest().unwrap_or_default().next()
    }

    /// Highest recorded generation below `id`.
    pub fn previous(&self, id: GenerationId) -> Option<GenerationId> {
        self.entries.range(..id).next_back().map(|(id, _)| *id)
    }

    /// Iterate generations in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (GenerationId, &GenerationMetadata)> {
        self.entries.iter().map(|(id, metadata)| (*id, metadata))
    }

    /// Number of recorded generations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no generation has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry path of `currentGen`.
pub fn current_gen_path() -> Vec<PathSegment> {
    PathSegment::keys([CURRENT_GEN_FIELD])
}

/// Registry path of a generation's metadata.
pub fn generation_path(id: GenerationId) -> Vec<PathSegment> {
    PathSegment::keys([GENERATIONS_FIELD.to_string(), id.dir_name()])
}

/// Registry path of one field of a generation's metadata.
pub fn generation_field_path(id: GenerationId, field: &str) -> Vec<PathSegment> {
    let mut path = generation_path(id);
    path.push(PathSegment::Key(field.into()));
    path
}

/// Remove fields only relevant at build time from a built manifest.
///
/// Source URLs change whenever an input is re-locked, even if nothing that
/// ends up in the artifact changed.
pub fn strip_build_time_fields(manifest: &Value) -> Value {
    let mut manifest = manifest.clone();
    if let Some(Value::Array(elements)) = manifest.get_mut("elements") {
        for element in elements.iter_mut().filter_map(Value::as_object_mut) {
            for field in BUILD_TIME_FIELDS {
                element.shift_remove(*field);
            }
        }
    }

    manifest
}

/// Decide whether a staged generation builds the same thing as a previous one.
///
/// Artifacts must be identical. When the generations are manifest driven,
/// their built manifests must also agree once build-time fields are stripped.
///
/// # Errors
///
/// - Return [`Error::ReadManifest`] if a manifest exists but cannot be read.
/// - Return [`Error::ParseManifest`] if a manifest is not valid JSON.
pub fn equivalent(
    previous_dir: &Path,
    previous_artifact: Option<&ArtifactRef>,
    staged_dir: &Path,
    staged_artifact: &ArtifactRef,
) -> Result<bool> {
    if previous_artifact != Some(staged_artifact) {
        return Ok(false);
    }

    let previous = read_manifest(previous_dir)?;
    let staged = read_manifest(staged_dir)?;
    Ok(match (previous, staged) {
        (Some(previous), Some(staged)) => {
            strip_build_time_fields(&previous) == strip_build_time_fields(&staged)
        }
        (None, None) => true,
        _ => false,
    })
}

/// Check if declarative source of two generation directories differs.
///
/// # Errors
///
/// - Return [`Error::ReadManifest`] if a source file cannot be read.
pub fn source_changed(previous_dir: &Path, staged_dir: &Path) -> Result<bool> {
    let previous = read_optional(&previous_dir.join(ENV_DIR).join(MANIFEST_TOML))?;
    let staged = read_optional(&staged_dir.join(ENV_DIR).join(MANIFEST_TOML))?;
    Ok(previous != staged)
}

/// Built manifest of a generation directory, if it has one.
///
/// # Errors
///
/// - Return [`Error::ReadManifest`] if manifest exists but cannot be read.
/// - Return [`Error::ParseManifest`] if manifest is not valid JSON.
pub fn read_manifest(generation_dir: &Path) -> Result<Option<Value>> {
    let path = generation_dir.join(ENV_DIR).join(MANIFEST_JSON);
    match read_optional(&path)? {
        Some(content) => serde_json::from_slice(&content)
            .map(Some)
            .map_err(|source| Error::ParseManifest { source, path }),
        None => Ok(None),
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match read(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::ReadManifest {
            source,
            path: path.to_path_buf(),
        }),
    }
}

/// Package level difference between two built manifests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackageDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub upgraded: Vec<String>,
}

impl PackageDiff {
    /// Compare elements of two built manifests.
    ///
    /// Elements are identified by `attrPath`, falling back to their first
    /// store path, and compared by their `storePaths`.
    pub fn between(previous: &Value, staged: &Value) -> Self {
        let previous = elements_by_name(previous);
        let staged = elements_by_name(staged);

        let before: BTreeSet<_> = previous.keys().collect();
        let after: BTreeSet<_> = staged.keys().collect();

        Self {
            added: after.difference(&before).map(|name| name.to_string()).collect(),
            removed: before.difference(&after).map(|name| name.to_string()).collect(),
            upgraded: before
                .intersection(&after)
                .filter(|name| previous.get(**name) != staged.get(**name))
                .map(|name| name.to_string())
                .collect(),
        }
    }

    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.upgraded.is_empty()
    }
}

impl Display for PackageDiff {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let sections = [
            ("added", &self.added),
            ("removed", &self.removed),
            ("upgraded", &self.upgraded),
        ];
        for (label, names) in sections {
            for name in names {
                writeln!(fmt, "{label}: {name}")?;
            }
        }

        Ok(())
    }
}

fn elements_by_name(manifest: &Value) -> BTreeMap<String, Value> {
    let Some(elements) = manifest.get("elements").and_then(Value::as_array) else {
        return BTreeMap::new();
    };

    elements
        .iter()
        .filter_map(|element| {
            let store_paths = element.get("storePaths").cloned().unwrap_or(Value::Null);
            let name = element
                .get("attrPath")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| {
                    store_paths
                        .get(0)
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                })?;
            Some((name, store_paths))
        })
        .collect()
}

/// Generation bookkeeping error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] registry::Error),

    /// Field `currentGen` does not hold a generation number.
    #[error("registry field {CURRENT_GEN_FIELD:?} is not a generation number")]
    InvalidCurrent,

    /// Generation key is not a number.
    #[error("generation key {0:?} is not a number")]
    InvalidKey(String),

    /// Generation numbers ran out.
    #[error("no generation number follows {0}")]
    Exhausted(GenerationId),

    /// Generation metadata cannot be decoded.
    #[error("failed to decode metadata of generation {generation}")]
    Decode {
        #[source]
        source: serde_json::Error,
        generation: String,
    },

    /// Manifest cannot be read.
    #[error("failed to read manifest at {:?}", path.display())]
    ReadManifest {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Manifest is not valid JSON.
    #[error("failed to parse manifest at {:?}", path.display())]
    ParseManifest {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::fs::{create_dir_all, write};

    fn document(value: Value) -> RegistryDocument {
        RegistryDocument::from_slice(value.to_string().as_bytes(), 3).unwrap()
    }

    fn generation(path: &str) -> Value {
        json!({"path": path, "logMessage": ["msg"], "created": 1, "lastActive": 2, "version": 3})
    }

    fn write_manifest(dir: &Path, manifest: &Value) {
        create_dir_all(dir.join(ENV_DIR)).unwrap();
        write(dir.join(ENV_DIR).join(MANIFEST_JSON), manifest.to_string()).unwrap();
    }

    #[test]
    fn empty_document_has_no_generations() -> anyhow::Result<()> {
        let generations = Generations::from_document(&RegistryDocument::new(3))?;
        assert_eq!(generations.current(), None);
        assert!(generations.is_empty());
        assert_eq!(generations.next_id()?, GenerationId::new(1));

        Ok(())
    }

    #[test]
    fn next_id_refuses_to_wrap() -> anyhow::Result<()> {
        let generations = Generations::from_document(&document(json!({
            "version": 3,
            "currentGen": 1,
            "generations": {"1": generation("/x"), (u64::MAX.to_string()): generation("/y")}
        })))?;

        assert!(matches!(
            generations.next_id(),
            Err(Error::Exhausted(id)) if id == GenerationId::new(u64::MAX)
        ));

        Ok(())
    }

    #[test]
    fn next_id_follows_highest_not_current() -> anyhow::Result<()> {
        let generations = Generations::from_document(&document(json!({
            "version": 3,
            "currentGen": 1,
            "generations": {"1": generation("/x"), "2": generation("/y"), "10": generation("/z")}
        })))?;

        assert_eq!(generations.current(), Some(GenerationId::new(1)));
        assert_eq!(generations.latest(), Some(GenerationId::new(10)));
        assert_eq!(generations.next_id()?, GenerationId::new(11));
        assert_eq!(
            generations.previous(GenerationId::new(10)),
            Some(GenerationId::new(2))
        );
        assert_eq!(generations.previous(GenerationId::new(1)), None);
        assert_eq!(
            generations.current_metadata().map(|meta| meta.path.as_str()),
            Some("/x")
        );

        Ok(())
    }

    #[test]
    fn unknown_generation_fields_are_kept() -> anyhow::Result<()> {
        let mut entry = generation("/x");
        entry["pinned"] = json!(true);
        let generations = Generations::from_document(&document(json!({
            "version": 3,
            "currentGen": 1,
            "generations": {"1": entry.clone()}
        })))?;

        let metadata = generations.get(GenerationId::new(1)).unwrap();
        assert_eq!(metadata.extra.get("pinned"), Some(&json!(true)));
        assert_eq!(serde_json::to_value(metadata)?, entry);

        Ok(())
    }

    #[test]
    fn non_numeric_generation_key_is_rejected() {
        let result = Generations::from_document(&document(json!({
            "version": 3,
            "generations": {"latest": generation("/x")}
        })));
        assert!(matches!(result, Err(Error::InvalidKey(key)) if key == "latest"));
    }

    #[test]
    fn stripping_removes_source_urls_only() {
        let manifest = json!({
            "version": 2,
            "elements": [{
                "attrPath": "legacyPackages.x86_64-linux.hello",
                "url": "github:NixOS/nixpkgs/abc",
                "originalUrl": "flake:nixpkgs",
                "storePaths": ["/nix/store/aaa-hello"]
            }]
        });
        let expect = json!({
            "version": 2,
            "elements": [{
                "attrPath": "legacyPackages.x86_64-linux.hello",
                "storePaths": ["/nix/store/aaa-hello"]
            }]
        });
        assert_eq!(strip_build_time_fields(&manifest), expect);
    }

    #[test]
    fn cosmetic_manifest_differences_are_equivalent() -> anyhow::Result<()> {
        let previous = tempfile::tempdir()?;
        let staged = tempfile::tempdir()?;
        let artifact = ArtifactRef::new("/nix/store/xyz-env");

        write_manifest(
            previous.path(),
            &json!({"elements": [{"attrPath": "hello", "url": "github:a/b/1", "storePaths": ["/s/1"]}]}),
        );
        write_manifest(
            staged.path(),
            &json!({"elements": [{"attrPath": "hello", "url": "github:a/b/2", "storePaths": ["/s/1"]}]}),
        );
        assert!(equivalent(previous.path(), Some(&artifact), staged.path(), &artifact)?);

        write_manifest(
            staged.path(),
            &json!({"elements": [{"attrPath": "hello", "url": "github:a/b/2", "storePaths": ["/s/2"]}]}),
        );
        assert!(!equivalent(previous.path(), Some(&artifact), staged.path(), &artifact)?);

        Ok(())
    }

    #[test]
    fn different_artifacts_are_never_equivalent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let previous = ArtifactRef::new("/nix/store/a");
        let staged = ArtifactRef::new("/nix/store/b");
        assert!(!equivalent(dir.path(), Some(&previous), dir.path(), &staged)?);
        assert!(!equivalent(dir.path(), None, dir.path(), &staged)?);
        assert!(equivalent(dir.path(), Some(&staged), dir.path(), &staged)?);

        Ok(())
    }

    #[test]
    fn package_diff_reports_changes() {
        let previous = json!({"elements": [
            {"attrPath": "hello", "storePaths": ["/s/hello-1"]},
            {"attrPath": "curl", "storePaths": ["/s/curl-1"]},
            {"attrPath": "jq", "storePaths": ["/s/jq-1"]},
        ]});
        let staged = json!({"elements": [
            {"attrPath": "hello", "storePaths": ["/s/hello-2"]},
            {"attrPath": "jq", "storePaths": ["/s/jq-1"]},
            {"storePaths": ["/s/ripgrep-1"]},
        ]});

        let diff = PackageDiff::between(&previous, &staged);
        assert_eq!(
            diff,
            PackageDiff {
                added: vec!["/s/ripgrep-1".into()],
                removed: vec!["curl".into()],
                upgraded: vec!["hello".into()],
            }
        );
        assert_eq!(
            diff.to_string(),
            "added: /s/ripgrep-1\nremoved: curl\nupgraded: hello\n"
        );
    }
}
