//! Predicates: the capability interface filtered indexes are defined by.
//!
//! A predicate is supplied by extension code through this trait, never by
//! compiling source text at runtime. Its fingerprint is the stable
//! identity of the filtered index it defines: repeated identical queries
//! hash to the same index and reuse it.

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::marshal::Object;

pub trait Predicate: Send + Sync {
    /// Stable source-level identity of this predicate. Two predicates with
    /// equal fingerprints must evaluate identically.
    fn fingerprint(&self) -> String;

    fn evaluate(&self, path: &str, object: &Object) -> bool;
}

/// Filtered-index id: a content hash of the predicate fingerprint.
pub fn index_id(predicate: &dyn Predicate) -> String {
    let digest = Sha256::digest(predicate.fingerprint().as_bytes());
    hex::encode(digest)[..16].to_owned()
}

/// Matches objects whose value at a JSON pointer equals `expected`.
pub struct FieldEquals {
    pointer: String,
    expected: Value,
}

impl FieldEquals {
    pub fn new(pointer: impl Into<String>, expected: Value) -> Self {
        FieldEquals {
            pointer: pointer.into(),
            expected,
        }
    }
}

impl Predicate for FieldEquals {
    fn fingerprint(&self) -> String {
        format!("field-eq:{}={}", self.pointer, self.expected)
    }

    fn evaluate(&self, _path: &str, object: &Object) -> bool {
        object.pointer(&self.pointer) == Some(&self.expected)
    }
}

/// Matches objects by path prefix, ignoring the value.
pub struct PathPrefix {
    prefix: String,
}

impl PathPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        PathPrefix {
            prefix: crate::buffer::normalize_path(&prefix.into()).to_owned(),
        }
    }
}

impl Predicate for PathPrefix {
    fn fingerprint(&self) -> String {
        format!("path-prefix:{}", self.prefix)
    }

    fn evaluate(&self, path: &str, _object: &Object) -> bool {
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

/// An arbitrary compiled predicate, for extension code loaded through the
/// plugin boundary. The caller owns fingerprint stability.
pub struct FnPredicate {
    fingerprint: String,
    func: Arc<dyn Fn(&str, &Object) -> bool + Send + Sync>,
}

impl FnPredicate {
    pub fn new(
        fingerprint: impl Into<String>,
        func: impl Fn(&str, &Object) -> bool + Send + Sync + 'static,
    ) -> Self {
        FnPredicate {
            fingerprint: fingerprint.into(),
            func: Arc::new(func),
        }
    }
}

impl Predicate for FnPredicate {
    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    fn evaluate(&self, path: &str, object: &Object) -> bool {
        (self.func)(path, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_fingerprints_hash_to_equal_ids() {
        let a = FieldEquals::new("/tag", json!("A"));
        let b = FieldEquals::new("/tag", json!("A"));
        let c = FieldEquals::new("/tag", json!("B"));
        assert_eq!(index_id(&a), index_id(&b));
        assert_ne!(index_id(&a), index_id(&c));
        assert_eq!(index_id(&a).len(), 16);
    }

    #[test]
    fn field_equals_evaluates_by_pointer() {
        let p = FieldEquals::new("/tag", json!("A"));
        assert!(p.evaluate("x", &json!({"tag": "A"})));
        assert!(!p.evaluate("x", &json!({"tag": "B"})));
        assert!(!p.evaluate("x", &json!({})));
    }

    #[test]
    fn path_prefix_respects_component_boundaries() {
        let p = PathPrefix::new("notes");
        assert!(p.evaluate("notes/a.json", &json!(null)));
        assert!(p.evaluate("notes", &json!(null)));
        assert!(!p.evaluate("notes-extra/a.json", &json!(null)));
    }

    #[test]
    fn fn_predicate_delegates() {
        let p = FnPredicate::new("test:always", |_, _| true);
        assert!(p.evaluate("anything", &json!(null)));
        assert_eq!(p.fingerprint(), "test:always");
    }
}
