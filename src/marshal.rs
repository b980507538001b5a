//! Object marshaling: buffers to structured objects and back.
//!
//! A registry of path-matched SerDes rules maps one-or-many buffers under a
//! path prefix to a deserialized object. Composite objects group a whole
//! directory subtree (directories whose name ends in `.bundle`) into one
//! logical object; every other path is 1:1 with its buffer.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Reserved extension marking a directory as one composite object.
pub const COMPOSITE_EXT: &str = ".bundle";

/// The structured in-memory representation of an object.
pub type Object = Value;

/// Buffers belonging to one object, keyed by path relative to the object
/// path. A plain (non-composite) object has a single entry under `""`.
pub type Buffers = BTreeMap<String, Vec<u8>>;

#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("no serialization rule matches {0}")]
    NoRule(String),

    #[error("malformed object data at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("composite object at {0} must serialize from a JSON map")]
    NotAMap(String),

    #[error("object data at {path} is not valid UTF-8 JSON")]
    NotJson { path: String },

    #[error(transparent)]
    Buffer(#[from] crate::buffer::BufferError),
}

/// A serialize/deserialize pair bound to a path pattern.
///
/// `match_strength` returns how specifically this rule matches the object
/// path (`None` = no match). The registry picks the strongest match;
/// registration order breaks ties.
pub trait SerDesRule: Send + Sync {
    fn match_strength(&self, object_path: &str) -> Option<usize>;

    fn deserialize(&self, object_path: &str, buffers: &Buffers) -> Result<Object, MarshalError>;

    fn serialize(&self, object_path: &str, object: &Object) -> Result<Buffers, MarshalError>;
}

/// Resolve the object path owning an arbitrary buffer path.
///
/// Pure path-string logic: if any ancestor directory component carries the
/// composite extension, the object path is the subtree rooted at the
/// outermost such component; otherwise the buffer path is the object path.
pub fn object_path_for(buffer_path: &str) -> String {
    let rel = crate::buffer::normalize_path(buffer_path);
    let components: Vec<&str> = rel.split('/').collect();
    // Only ancestors can be composite directories; the final component is
    // the buffer itself.
    for (i, component) in components[..components.len().saturating_sub(1)]
        .iter()
        .enumerate()
    {
        if component.ends_with(COMPOSITE_EXT) {
            return components[..=i].join("/");
        }
    }
    rel.to_owned()
}

/// Whether an object path denotes a composite object.
pub fn is_composite(object_path: &str) -> bool {
    crate::buffer::normalize_path(object_path)
        .rsplit('/')
        .next()
        .is_some_and(|last| last.ends_with(COMPOSITE_EXT))
}

/// Expand a rule's relative fragments to repo-relative buffer paths.
pub fn absolute_fragments(object_path: &str, fragments: Buffers) -> BTreeMap<String, Vec<u8>> {
    fragments
        .into_iter()
        .map(|(rel, bytes)| {
            let path = if rel.is_empty() {
                object_path.to_owned()
            } else {
                format!("{object_path}/{rel}")
            };
            (path, bytes)
        })
        .collect()
}

// =============================================================================
// Built-in rules
// =============================================================================

/// Catch-all rule: one buffer holding one JSON document.
pub struct JsonRule;

impl SerDesRule for JsonRule {
    fn match_strength(&self, _object_path: &str) -> Option<usize> {
        Some(0)
    }

    fn deserialize(&self, object_path: &str, buffers: &Buffers) -> Result<Object, MarshalError> {
        let bytes = buffers
            .get("")
            .ok_or_else(|| MarshalError::NotJson {
                path: object_path.to_owned(),
            })?;
        serde_json::from_slice(bytes).map_err(|e| MarshalError::Json {
            path: object_path.to_owned(),
            source: e,
        })
    }

    fn serialize(&self, _object_path: &str, object: &Object) -> Result<Buffers, MarshalError> {
        let mut buffers = Buffers::new();
        buffers.insert(String::new(), to_canonical_bytes(object));
        Ok(buffers)
    }
}

/// Composite rule: a `.bundle` directory subtree is one object whose keys
/// are the member paths relative to the bundle root.
pub struct CompositeRule;

impl SerDesRule for CompositeRule {
    fn match_strength(&self, object_path: &str) -> Option<usize> {
        is_composite(object_path).then(|| object_path.len())
    }

    fn deserialize(&self, object_path: &str, buffers: &Buffers) -> Result<Object, MarshalError> {
        let mut map = serde_json::Map::new();
        for (rel, bytes) in buffers {
            let value: Value =
                serde_json::from_slice(bytes).map_err(|e| MarshalError::Json {
                    path: format!("{object_path}/{rel}"),
                    source: e,
                })?;
            map.insert(rel.clone(), value);
        }
        Ok(Value::Object(map))
    }

    fn serialize(&self, object_path: &str, object: &Object) -> Result<Buffers, MarshalError> {
        let Value::Object(map) = object else {
            return Err(MarshalError::NotAMap(object_path.to_owned()));
        };
        let mut buffers = Buffers::new();
        for (rel, value) in map {
            buffers.insert(rel.clone(), to_canonical_bytes(value));
        }
        Ok(buffers)
    }
}

/// A rule scoped to a path prefix, wrapping a caller-supplied SerDes pair.
///
/// This is the seam extensions plug their object specs into: anything more
/// specific than the built-in rules registers through it.
pub struct PrefixRule {
    prefix: String,
    inner: Box<dyn SerDesRule>,
}

impl PrefixRule {
    pub fn new(prefix: impl Into<String>, inner: Box<dyn SerDesRule>) -> Self {
        PrefixRule {
            prefix: crate::buffer::normalize_path(&prefix.into()).to_owned(),
            inner,
        }
    }
}

impl SerDesRule for PrefixRule {
    fn match_strength(&self, object_path: &str) -> Option<usize> {
        let rest = object_path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(self.prefix.len().max(1))
        } else {
            None
        }
    }

    fn deserialize(&self, object_path: &str, buffers: &Buffers) -> Result<Object, MarshalError> {
        self.inner.deserialize(object_path, buffers)
    }

    fn serialize(&self, object_path: &str, object: &Object) -> Result<Buffers, MarshalError> {
        self.inner.serialize(object_path, object)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Ordered set of SerDes rules; exactly one rule resolves for any path.
pub struct SerDesRegistry {
    rules: Vec<Box<dyn SerDesRule>>,
}

impl SerDesRegistry {
    /// Registry with the built-in composite and JSON catch-all rules.
    pub fn with_defaults() -> Self {
        SerDesRegistry {
            rules: vec![Box::new(CompositeRule), Box::new(JsonRule)],
        }
    }

    /// Register an extension rule. Stronger matches win over the built-ins;
    /// among equal strengths the earliest registration wins.
    pub fn register(&mut self, rule: Box<dyn SerDesRule>) {
        self.rules.insert(0, rule);
    }

    /// The single rule governing `object_path`.
    ///
    /// Resolution is deterministic: strongest match wins, first-registered
    /// breaks ties.
    pub fn rule_for(&self, object_path: &str) -> Result<&dyn SerDesRule, MarshalError> {
        let mut best: Option<(usize, &dyn SerDesRule)> = None;
        for rule in &self.rules {
            if let Some(strength) = rule.match_strength(object_path) {
                match best {
                    Some((existing, _)) if existing >= strength => {}
                    _ => best = Some((strength, rule.as_ref())),
                }
            }
        }
        best.map(|(_, rule)| rule)
            .ok_or_else(|| MarshalError::NoRule(object_path.to_owned()))
    }
}

/// Read and deserialize the object at `object_path`, at a commit or HEAD.
///
/// Returns `None` when no buffers resolve to the object anymore (deleted,
/// or an empty composite directory).
pub fn read_object(
    repo: &git2::Repository,
    registry: &SerDesRegistry,
    object_path: &str,
    at_commit: Option<git2::Oid>,
) -> Result<Option<Object>, MarshalError> {
    let object_path = crate::buffer::normalize_path(object_path);
    let buffers = collect_buffers(repo, object_path, at_commit)?;
    let Some(buffers) = buffers else {
        return Ok(None);
    };
    let rule = registry.rule_for(object_path)?;
    Ok(Some(rule.deserialize(object_path, &buffers)?))
}

/// Gather the raw buffers backing an object, keyed relative to it.
fn collect_buffers(
    repo: &git2::Repository,
    object_path: &str,
    at_commit: Option<git2::Oid>,
) -> Result<Option<Buffers>, MarshalError> {
    let mut buffers = Buffers::new();
    if is_composite(object_path) {
        let blobs = crate::buffer::tree_blobs(repo, at_commit, object_path)?;
        for (path, oid) in blobs {
            let rel = path
                .strip_prefix(object_path)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(&path)
                .to_owned();
            let blob = repo
                .find_blob(oid)
                .map_err(crate::buffer::BufferError::from)?;
            buffers.insert(rel, blob.content().to_vec());
        }
        if buffers.is_empty() {
            return Ok(None);
        }
    } else {
        match crate::buffer::read_buffer(repo, object_path, at_commit)? {
            Some(bytes) => {
                buffers.insert(String::new(), bytes);
            }
            None => return Ok(None),
        }
    }
    Ok(Some(buffers))
}

fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(value).expect("JSON value serializes");
    bytes.push(b'\n');
    bytes
}
