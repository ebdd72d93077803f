// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Registry document handling.
//!
//! A __registry document__ is a JSON object that records persistent key/value
//! state for an environment, most importantly its generation bookkeeping. Every
//! document carries a mandatory top-level `version` field naming the schema
//! revision of its layout. Everything else is an open-ended tree of values.
//!
//! # Addressing
//!
//! Values are addressed by a path of [`PathSegment`]s. A segment is either an
//! object key or an array index. Generation numbers are object keys, e.g.
//! `generations.3.path`, because JSON objects cannot be keyed by integers.
//!
//! # Version Checks
//!
//! All access goes through a [`Registry`] handle that knows the schema version
//! the caller expects. Reading or writing a document whose `version` differs is
//! a hard failure. There is no silent upgrade or downgrade here, that is the
//! job of the [migrator](crate::migrate).
//!
//! # Round-trip Safety
//!
//! Unknown fields are never dropped. Documents are kept as raw JSON trees with
//! key order preserved, and are written back as compact, newline-free JSON.

use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{create_dir_all, read},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};
use tracing::{debug, instrument};

/// Field holding the schema version of a registry document.
pub const VERSION_FIELD: &str = "version";

/// One step of a path into a registry document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Field of an object.
    Key(String),

    /// Position in an array.
    Index(usize),
}

impl PathSegment {
    /// Build a path made only of object keys.
    pub fn keys(keys: impl IntoIterator<Item = impl Into<String>>) -> Vec<PathSegment> {
        keys.into_iter().map(|key| PathSegment::Key(key.into())).collect()
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.into())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Render path of segments in `key.key[index]` notation.
pub fn render_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            PathSegment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathSegment::Index(index) => out.push_str(&format!("[{index}]")),
        }
    }

    out
}

/// Parse path in `key.key[index]` notation.
///
/// Numeric components without brackets are object keys, so `generations.3`
/// addresses the key "3" of the `generations` object.
///
/// # Errors
///
/// - Return [`Error::InvalidPath`] if path is empty or has malformed brackets.
pub fn parse_path(input: &str) -> Result<Vec<PathSegment>> {
    let invalid = || Error::InvalidPath {
        path: input.to_string(),
    };

    if input.is_empty() {
        return Err(invalid());
    }

    let mut segments = Vec::new();
    for part in input.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(at) => part.split_at(at),
            None => (part, ""),
        };

        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string()));
        } else if rest.is_empty() {
            return Err(invalid());
        }

        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(invalid)?;
            let index = rest[1..close].parse::<usize>().map_err(|_| invalid())?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid());
            }
        }
    }

    Ok(segments)
}

/// In-memory registry document.
///
/// Pure tree operations over a JSON object. File I/O and version checks are
/// left to [`Registry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryDocument {
    root: Value,
    changed: bool,
}

impl RegistryDocument {
    /// Construct fresh document containing only a version field.
    pub fn new(version: u64) -> Self {
        let mut root = Map::new();
        root.insert(VERSION_FIELD.into(), Value::from(version));

        Self {
            root: Value::Object(root),
            changed: false,
        }
    }

    /// Parse document from raw bytes.
    ///
    /// Missing or whitespace-only content yields a fresh document for
    /// `bootstrap_version`, to support first use.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Parse`] if content is not valid JSON.
    /// - Return [`Error::Malformed`] if top-level value is not an object.
    pub fn from_slice(content: &[u8], bootstrap_version: u64) -> Result<Self> {
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::new(bootstrap_version));
        }

        let root: Value = serde_json::from_slice(content).map_err(Error::Parse)?;
        if !root.is_object() {
            return Err(Error::Malformed);
        }

        Ok(Self {
            root,
            changed: false,
        })
    }

    /// Declared schema version, if any.
    pub fn version(&self) -> Option<u64> {
        self.root.get(VERSION_FIELD).and_then(Value::as_u64)
    }

    /// Check declared schema version against expectation.
    ///
    /// # Errors
    ///
    /// - Return [`Error::SchemaMismatch`] if versions differ.
    pub fn check_version(&self, expected: u64) -> Result<()> {
        match self.version() {
            Some(found) if found == expected => Ok(()),
            found => Err(Error::SchemaMismatch { expected, found }),
        }
    }

    /// Rewrite declared schema version.
    ///
    /// The version field is otherwise immutable. Only schema migrations move
    /// a document from one revision to the next.
    pub fn upgrade_version(&mut self, version: u64) {
        if let Some(root) = self.root.as_object_mut() {
            root.insert(VERSION_FIELD.into(), Value::from(version));
            self.changed = true;
        }
    }

    /// Whole document as JSON value.
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Check if document has been modified since load.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Compact, newline-free JSON serialization.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.root).map_err(Error::Serialize)
    }

    /// Lookup value at path.
    ///
    /// Empty strings are returned as they are. Only a missing path is
    /// reported as not found.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if path does not exist.
    pub fn get(&self, path: &[PathSegment]) -> Result<&Value> {
        let mut current = &self.root;
        for segment in path {
            let next = match segment {
                PathSegment::Key(key) => current.as_object().and_then(|map| map.get(key)),
                PathSegment::Index(index) => current.as_array().and_then(|arr| arr.get(*index)),
            };

            current = next.ok_or_else(|| not_found(path))?;
        }

        Ok(current)
    }

    /// Check if path exists.
    pub fn contains(&self, path: &[PathSegment]) -> bool {
        self.get(path).is_ok()
    }

    /// Set value at path, creating intermediate objects as needed.
    ///
    /// An array index equal to the array length appends.
    ///
    /// # Errors
    ///
    /// - Return [`Error::InvalidPath`] if path is empty.
    /// - Return [`Error::ImmutableVersion`] if path addresses version field.
    /// - Return [`Error::TypeMismatch`] if path walks through a scalar.
    /// - Return [`Error::NotFound`] if an array index is out of bounds.
    pub fn set(&mut self, path: &[PathSegment], value: Value) -> Result<()> {
        let (last, parent) = split_last(path)?;
        guard_version(path)?;

        let container = self.walk_create(parent, path)?;
        match (last, container) {
            (PathSegment::Key(key), Value::Object(map)) => {
                map.insert(key.clone(), value);
            }
            (PathSegment::Index(index), Value::Array(arr)) if *index < arr.len() => {
                arr[*index] = value;
            }
            (PathSegment::Index(index), Value::Array(arr)) if *index == arr.len() => {
                arr.push(value);
            }
            (PathSegment::Index(_), Value::Array(_)) => return Err(not_found(path)),
            (PathSegment::Key(_), other) => return Err(type_mismatch(path, "object", other)),
            (PathSegment::Index(_), other) => return Err(type_mismatch(path, "array", other)),
        }

        self.changed = true;
        Ok(())
    }

    /// Delete value at path.
    ///
    /// Object key order of remaining fields is preserved.
    ///
    /// # Errors
    ///
    /// - Return [`Error::ImmutableVersion`] if path addresses version field.
    /// - Return [`Error::NotFound`] if path does not exist.
    pub fn delete(&mut self, path: &[PathSegment]) -> Result<()> {
        let (last, parent) = split_last(path)?;
        guard_version(path)?;

        let container = self.get_mut(parent).map_err(|_| not_found(path))?;
        let removed = match (last, container) {
            (PathSegment::Key(key), Value::Object(map)) => map.shift_remove(key).is_some(),
            (PathSegment::Index(index), Value::Array(arr)) if *index < arr.len() => {
                arr.remove(*index);
                true
            }
            _ => false,
        };

        if !removed {
            return Err(not_found(path));
        }

        self.changed = true;
        Ok(())
    }

    /// Append value to array at path.
    ///
    /// A missing array is created.
    ///
    /// # Errors
    ///
    /// - Return [`Error::TypeMismatch`] if path holds something other than an
    ///   array.
    pub fn add_array(&mut self, path: &[PathSegment], value: Value) -> Result<()> {
        match self.get_mut(path) {
            Ok(Value::Array(arr)) => arr.push(value),
            Ok(other) => return Err(type_mismatch(path, "array", other)),
            Err(Error::NotFound { .. }) => return self.set(path, Value::Array(vec![value])),
            Err(err) => return Err(err),
        }

        self.changed = true;
        Ok(())
    }

    /// Remove first element equal to value from array at path.
    ///
    /// Only the first match is removed, later duplicates stay in place.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if array or value does not exist.
    /// - Return [`Error::TypeMismatch`] if path holds something other than an
    ///   array.
    pub fn del_array(&mut self, path: &[PathSegment], value: &Value) -> Result<()> {
        let arr = match self.get_mut(path)? {
            Value::Array(arr) => arr,
            other => return Err(type_mismatch(path, "array", other)),
        };

        let position = arr
            .iter()
            .position(|item| item == value)
            .ok_or_else(|| not_found(path))?;
        arr.remove(position);

        self.changed = true;
        Ok(())
    }

    fn get_mut(&mut self, path: &[PathSegment]) -> Result<&mut Value> {
        let mut current = &mut self.root;
        for segment in path {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key),
                (PathSegment::Index(index), Value::Array(arr)) => arr.get_mut(*index),
                _ => None,
            }
            .ok_or_else(|| not_found(path))?;
        }

        Ok(current)
    }

    fn walk_create(&mut self, parent: &[PathSegment], full: &[PathSegment]) -> Result<&mut Value> {
        let mut current = &mut self.root;
        for segment in parent {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }

            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => {
                    map.entry(key.clone()).or_insert(Value::Null)
                }
                (PathSegment::Index(index), Value::Array(arr)) => {
                    arr.get_mut(*index).ok_or_else(|| not_found(full))?
                }
                (PathSegment::Key(_), other) => return Err(type_mismatch(full, "object", other)),
                (PathSegment::Index(_), other) => return Err(type_mismatch(full, "array", other)),
            };
        }

        // INVARIANT: A freshly created leaf container is always an object.
        if current.is_null() {
            *current = Value::Object(Map::new());
        }

        Ok(current)
    }
}

impl Display for RegistryDocument {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.to_json().map_err(|_| std::fmt::Error)?)
    }
}

/// Storage backend for registry documents.
pub trait DocumentStore {
    /// Load raw document content. Missing documents yield `None`.
    fn load(&self, path: &Path) -> std::io::Result<Option<Vec<u8>>>;

    /// Replace raw document content.
    fn store(&self, path: &Path, content: &[u8]) -> std::io::Result<()>;
}

/// Registry documents stored as plain files.
///
/// Writes go through a temporary file in the same directory that is renamed
/// into place, so readers never observe a half-written document.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsDocumentStore;

impl DocumentStore for FsDocumentStore {
    fn load(&self, path: &Path) -> std::io::Result<Option<Vec<u8>>> {
        match read(path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn store(&self, path: &Path, content: &[u8]) -> std::io::Result<()> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        create_dir_all(parent)?;

        let mut file = tempfile::NamedTempFile::new_in(parent)?;
        file.write_all(content)?;
        file.persist(path).map_err(|err| err.error)?;

        Ok(())
    }
}

/// Registry documents held in memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryDocumentStore {
    /// Construct new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn load(&self, path: &Path) -> std::io::Result<Option<Vec<u8>>> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(files.get(path).cloned())
    }

    fn store(&self, path: &Path, content: &[u8]) -> std::io::Result<()> {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        files.insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }
}

/// Handle to a registry document at a fixed location and expected version.
///
/// Each operation loads the document, checks its version, and for mutations
/// writes the result back. Use [`Registry::edit`] to batch several mutations
/// into one load and store.
#[derive(Debug)]
pub struct Registry<S = FsDocumentStore>
where
    S: DocumentStore,
{
    store: S,
    path: PathBuf,
    expected_version: u64,
}

impl Registry<FsDocumentStore> {
    /// Open registry document stored as a plain file.
    pub fn open_file(path: impl Into<PathBuf>, expected_version: u64) -> Self {
        Self::new(FsDocumentStore, path, expected_version)
    }
}

impl<S> Registry<S>
where
    S: DocumentStore,
{
    /// Construct new registry handle.
    pub fn new(store: S, path: impl Into<PathBuf>, expected_version: u64) -> Self {
        Self {
            store,
            path: path.into(),
            expected_version,
        }
    }

    /// Location of the document.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Schema version this handle expects.
    pub fn expected_version(&self) -> u64 {
        self.expected_version
    }

    /// Load and version-check the document.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Load`] if document cannot be read.
    /// - Return [`Error::Parse`] or [`Error::Malformed`] if it is not a JSON
    ///   object.
    /// - Return [`Error::SchemaMismatch`] if its version differs from the
    ///   expected one.
    #[instrument(skip(self), level = "debug")]
    pub fn dump(&self) -> Result<RegistryDocument> {
        let content = self
            .store
            .load(&self.path)
            .map_err(|source| Error::Load {
                source,
                path: self.path.clone(),
            })?
            .unwrap_or_default();

        let document = RegistryDocument::from_slice(&content, self.expected_version)?;
        document.check_version(self.expected_version)?;
        debug!("loaded registry {:?}", self.path.display());

        Ok(document)
    }

    /// Declared schema version of the document.
    ///
    /// # Errors
    ///
    /// - Same as [`Registry::dump`].
    pub fn version(&self) -> Result<u64> {
        Ok(self.dump()?.version().unwrap_or(self.expected_version))
    }

    /// Lookup value at path.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NotFound`] if path does not exist.
    pub fn get(&self, path: &[PathSegment]) -> Result<Value> {
        self.dump()?.get(path).cloned()
    }

    /// Set value at path.
    pub fn set(&self, path: &[PathSegment], value: Value) -> Result<()> {
        self.edit(|doc| doc.set(path, value))
    }

    /// Set numeric value at path.
    ///
    /// # Errors
    ///
    /// - Return [`Error::TypeMismatch`] if value is not a number.
    pub fn set_number(&self, path: &[PathSegment], value: Value) -> Result<()> {
        if !value.is_number() {
            return Err(type_mismatch(path, "number", &value));
        }

        self.set(path, value)
    }

    /// Set string value at path.
    ///
    /// # Errors
    ///
    /// - Return [`Error::TypeMismatch`] if value is not a string.
    pub fn set_string(&self, path: &[PathSegment], value: Value) -> Result<()> {
        if !value.is_string() {
            return Err(type_mismatch(path, "string", &value));
        }

        self.set(path, value)
    }

    /// Delete value at path.
    pub fn delete(&self, path: &[PathSegment]) -> Result<()> {
        self.edit(|doc| doc.delete(path))
    }

    /// Append value to array at path.
    pub fn add_array(&self, path: &[PathSegment], value: Value) -> Result<()> {
        self.edit(|doc| doc.add_array(path, value))
    }

    /// Remove first matching value from array at path.
    pub fn del_array(&self, path: &[PathSegment], value: &Value) -> Result<()> {
        self.edit(|doc| doc.del_array(path, value))
    }

    /// Edit document.
    ///
    /// Loads document, hands it to `editor`, and writes it back only if the
    /// editor succeeded and actually changed something.
    ///
    /// # Errors
    ///
    /// - Return any error produced by `editor`; nothing is written then.
    /// - Return [`Error::Store`] if document cannot be written.
    pub fn edit<E>(&self, editor: E) -> Result<()>
    where
        E: FnOnce(&mut RegistryDocument) -> Result<()>,
    {
        let mut document = self.dump()?;
        editor(&mut document)?;

        if !document.is_changed() {
            return Ok(());
        }

        self.store
            .store(&self.path, document.to_json()?.as_bytes())
            .map_err(|source| Error::Store {
                source,
                path: self.path.clone(),
            })?;
        debug!("wrote registry {:?}", self.path.display());

        Ok(())
    }
}

fn split_last(path: &[PathSegment]) -> Result<(&PathSegment, &[PathSegment])> {
    path.split_last().ok_or_else(|| Error::InvalidPath {
        path: String::new(),
    })
}

fn guard_version(path: &[PathSegment]) -> Result<()> {
    match path {
        [PathSegment::Key(key)] if key == VERSION_FIELD => Err(Error::ImmutableVersion),
        _ => Ok(()),
    }
}

fn not_found(path: &[PathSegment]) -> Error {
    Error::NotFound {
        path: render_path(path),
    }
}

fn type_mismatch(path: &[PathSegment], expected: &'static str, found: &Value) -> Error {
    Error::TypeMismatch {
        path: render_path(path),
        expected,
        found: json_type(found),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render_version(version: &Option<u64>) -> String {
    version.map_or_else(|| "none".into(), |version| version.to_string())
}

/// Registry document error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Document version disagrees with caller expectation.
    #[error("registry schema mismatch: expected version {expected}, found {}", render_version(.found))]
    SchemaMismatch { expected: u64, found: Option<u64> },

    /// Path does not exist in document.
    #[error("registry path {path:?} not found")]
    NotFound { path: String },

    /// Value at path has the wrong type for the operation.
    #[error("registry path {path:?} expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Attempt to rewrite or remove the version field.
    #[error("registry version field cannot be modified")]
    ImmutableVersion,

    /// Path cannot be interpreted.
    #[error("invalid registry path {path:?}")]
    InvalidPath { path: String },

    /// Top-level value is not an object.
    #[error("registry document is not a JSON object")]
    Malformed,

    /// Content is not valid JSON.
    #[error("failed to parse registry document")]
    Parse(#[source] serde_json::Error),

    /// Document cannot be serialized.
    #[error("failed to serialize registry document")]
    Serialize(#[source] serde_json::Error),

    /// Document cannot be read.
    #[error("failed to read registry document at {:?}", path.display())]
    Load {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Document cannot be written.
    #[error("failed to write registry document at {:?}", path.display())]
    Store {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use simple_test_case::test_case;

    fn registry() -> Registry<MemoryDocumentStore> {
        Registry::new(MemoryDocumentStore::new(), "metadata.json", 3)
    }

    fn keys(path: &str) -> Vec<PathSegment> {
        parse_path(path).unwrap()
    }

    #[test]
    fn missing_document_bootstraps_with_expected_version() -> anyhow::Result<()> {
        let registry = registry();
        pretty_assertions::assert_eq!(registry.version()?, 3);
        pretty_assertions::assert_eq!(registry.dump()?.to_json()?, r#"{"version":3}"#);
        assert!(matches!(
            registry.get(&keys("currentGen")),
            Err(Error::NotFound { .. })
        ));

        Ok(())
    }

    #[test]
    fn empty_file_bootstraps_with_expected_version() -> anyhow::Result<()> {
        let store = MemoryDocumentStore::new();
        store.store(Path::new("metadata.json"), b"  \n")?;
        let registry = Registry::new(store, "metadata.json", 7);
        pretty_assertions::assert_eq!(registry.version()?, 7);

        Ok(())
    }

    #[test]
    fn version_mismatch_is_fatal_for_every_operation() -> anyhow::Result<()> {
        let store = MemoryDocumentStore::new();
        store.store(Path::new("metadata.json"), br#"{"version":2,"a":1}"#)?;
        let registry = Registry::new(store, "metadata.json", 3);

        let mismatch = |result: Result<()>| {
            matches!(
                result,
                Err(Error::SchemaMismatch {
                    expected: 3,
                    found: Some(2)
                })
            )
        };
        assert!(mismatch(registry.get(&keys("a")).map(|_| ())));
        assert!(mismatch(registry.set(&keys("a"), json!(2))));
        assert!(mismatch(registry.delete(&keys("a"))));
        assert!(mismatch(registry.add_array(&keys("b"), json!(1))));
        assert!(mismatch(registry.version().map(|_| ())));

        Ok(())
    }

    #[test]
    fn document_without_version_is_mismatch() -> anyhow::Result<()> {
        let store = MemoryDocumentStore::new();
        store.store(Path::new("metadata.json"), br#"{"a":1}"#)?;
        let registry = Registry::new(store, "metadata.json", 3);
        assert!(matches!(
            registry.dump(),
            Err(Error::SchemaMismatch { found: None, .. })
        ));

        Ok(())
    }

    #[test]
    fn set_then_get_returns_value() -> anyhow::Result<()> {
        let registry = registry();
        let value = json!({"path": "/nix/store/abc-env", "logMessage": ["installed hello"]});
        registry.set(&keys("generations.1"), value.clone())?;
        pretty_assertions::assert_eq!(registry.get(&keys("generations.1"))?, value);
        pretty_assertions::assert_eq!(
            registry.get(&keys("generations.1.logMessage[0]"))?,
            json!("installed hello")
        );

        Ok(())
    }

    #[test]
    fn unknown_fields_survive_rewrite_byte_for_byte() -> anyhow::Result<()> {
        let original = r#"{"version":3,"zeta":{"nested":[1,2,{"x":null}]},"alpha":"keep me","currentGen":1}"#;
        let store = MemoryDocumentStore::new();
        store.store(Path::new("metadata.json"), original.as_bytes())?;
        let registry = Registry::new(store, "metadata.json", 3);

        registry.set(&keys("currentGen"), json!(2))?;
        registry.set(&keys("currentGen"), json!(1))?;
        pretty_assertions::assert_eq!(registry.dump()?.to_json()?, original);

        Ok(())
    }

    #[test]
    fn empty_string_and_absent_are_distinct() -> anyhow::Result<()> {
        let registry = registry();
        registry.set_string(&keys("floxhub"), json!(""))?;
        pretty_assertions::assert_eq!(registry.get(&keys("floxhub"))?, json!(""));
        assert!(matches!(
            registry.get(&keys("other")),
            Err(Error::NotFound { .. })
        ));

        Ok(())
    }

    #[test_case(json!("3"), "string"; "stringified number")]
    #[test_case(json!(true), "boolean"; "boolean")]
    #[test_case(json!(null), "null"; "null")]
    #[test]
    fn set_number_rejects_non_numbers(value: Value, found: &str) {
        let registry = registry();
        let result = registry.set_number(&keys("currentGen"), value);
        match result {
            Err(Error::TypeMismatch {
                expected, found: actual, ..
            }) => {
                pretty_assertions::assert_eq!(expected, "number");
                pretty_assertions::assert_eq!(actual, found);
            }
            other => panic!("expected type mismatch, got {other:?}"),
        }
    }

    #[test]
    fn set_string_rejects_numbers() {
        let registry = registry();
        assert!(matches!(
            registry.set_string(&keys("name"), json!(3)),
            Err(Error::TypeMismatch { expected: "string", .. })
        ));
        assert!(registry.set_string(&keys("name"), json!("3")).is_ok());
    }

    #[test]
    fn version_field_is_immutable() {
        let registry = registry();
        assert!(matches!(
            registry.set(&keys("version"), json!(4)),
            Err(Error::ImmutableVersion)
        ));
        assert!(matches!(
            registry.delete(&keys("version")),
            Err(Error::ImmutableVersion)
        ));
    }

    #[test]
    fn delete_preserves_key_order() -> anyhow::Result<()> {
        let mut document = RegistryDocument::from_slice(br#"{"version":3,"a":1,"b":2,"c":3}"#, 3)?;
        document.delete(&keys("a"))?;
        pretty_assertions::assert_eq!(document.to_json()?, r#"{"version":3,"b":2,"c":3}"#);
        assert!(matches!(
            document.delete(&keys("a")),
            Err(Error::NotFound { .. })
        ));

        Ok(())
    }

    #[test]
    fn rewrite_keeps_unknown_numbers_verbatim() -> anyhow::Result<()> {
        let original = r#"{"version":3,"big":123456789012345678901234567890,"f":1.10,"e":1e3}"#;
        let mut document = RegistryDocument::from_slice(original.as_bytes(), 3)?;
        document.set(&keys("x"), json!(1))?;
        document.delete(&keys("x"))?;
        pretty_assertions::assert_eq!(document.to_json()?, original);

        Ok(())
    }

    #[test]
    fn add_array_creates_and_appends() -> anyhow::Result<()> {
        let registry = registry();
        registry.add_array(&keys("channels"), json!("nixpkgs"))?;
        registry.add_array(&keys("channels"), json!("flox"))?;
        pretty_assertions::assert_eq!(registry.get(&keys("channels"))?, json!(["nixpkgs", "flox"]));

        registry.set(&keys("scalar"), json!(1))?;
        assert!(matches!(
            registry.add_array(&keys("scalar"), json!(2)),
            Err(Error::TypeMismatch { expected: "array", .. })
        ));

        Ok(())
    }

    #[test]
    fn del_array_removes_first_match_only() -> anyhow::Result<()> {
        let registry = registry();
        for item in ["a", "b", "a", "c"] {
            registry.add_array(&keys("list"), json!(item))?;
        }

        registry.del_array(&keys("list"), &json!("a"))?;
        pretty_assertions::assert_eq!(registry.get(&keys("list"))?, json!(["b", "a", "c"]));

        registry.del_array(&keys("list"), &json!("a"))?;
        pretty_assertions::assert_eq!(registry.get(&keys("list"))?, json!(["b", "c"]));

        assert!(matches!(
            registry.del_array(&keys("list"), &json!("a")),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            registry.del_array(&keys("missing"), &json!("a")),
            Err(Error::NotFound { .. })
        ));

        Ok(())
    }

    #[test]
    fn array_index_addressing() -> anyhow::Result<()> {
        let mut document = RegistryDocument::new(3);
        document.set(&keys("list"), json!([1, 2]))?;
        document.set(&keys("list[1]"), json!(5))?;
        document.set(&keys("list[2]"), json!(6))?;
        pretty_assertions::assert_eq!(document.get(&keys("list"))?, &json!([1, 5, 6]));
        assert!(matches!(
            document.set(&keys("list[9]"), json!(0)),
            Err(Error::NotFound { .. })
        ));
        document.delete(&keys("list[0]"))?;
        pretty_assertions::assert_eq!(document.get(&keys("list"))?, &json!([5, 6]));

        Ok(())
    }

    #[test]
    fn set_through_scalar_is_type_mismatch() -> anyhow::Result<()> {
        let mut document = RegistryDocument::new(3);
        document.set(&keys("a"), json!("leaf"))?;
        assert!(matches!(
            document.set(&keys("a.b"), json!(1)),
            Err(Error::TypeMismatch { expected: "object", .. })
        ));

        Ok(())
    }

    #[test]
    fn failed_edit_writes_nothing() -> anyhow::Result<()> {
        let registry = registry();
        registry.set(&keys("a"), json!(1))?;
        let result = registry.edit(|doc| {
            doc.set(&keys("a"), json!(2))?;
            doc.delete(&keys("missing"))
        });
        assert!(result.is_err());
        pretty_assertions::assert_eq!(registry.get(&keys("a"))?, json!(1));

        Ok(())
    }

    #[test]
    fn fs_store_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("metadata.json");
        let registry = Registry::open_file(&path, 3);
        registry.set(&keys("currentGen"), json!(0))?;

        let content = std::fs::read_to_string(&path)?;
        pretty_assertions::assert_eq!(content, r#"{"version":3,"currentGen":0}"#);
        assert!(!content.contains('\n'));

        Ok(())
    }

    #[test_case("generations.3.path", vec![PathSegment::from("generations"), "3".into(), "path".into()]; "numeric key")]
    #[test_case("list[0][2]", vec![PathSegment::from("list"), 0.into(), 2.into()]; "nested index")]
    #[test_case("a.b[1].c", vec![PathSegment::from("a"), "b".into(), 1.into(), "c".into()]; "mixed")]
    #[test]
    fn path_parsing(input: &str, expect: Vec<PathSegment>) {
        let result = parse_path(input).unwrap();
        pretty_assertions::assert_eq!(result, expect);
        pretty_assertions::assert_eq!(render_path(&result), input);
    }

    #[test_case(""; "empty")]
    #[test_case("a[x]"; "non numeric index")]
    #[test_case("a[1"; "unclosed")]
    #[test_case("a[1]b"; "trailing text")]
    #[test_case("a..b"; "empty key")]
    #[test]
    fn path_parsing_rejects(input: &str) {
        assert!(matches!(parse_path(input), Err(Error::InvalidPath { .. })));
    }
}
