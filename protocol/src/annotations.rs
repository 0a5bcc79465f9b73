// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Annotations as reported by a single provider.  A key mapped to `None` is
/// a removal marker: merging it onto a dense set deletes the key.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    JsonSchema,
    Serialize,
)]
pub struct SparseAnnotations {
    entries: BTreeMap<String, Option<String>>,
}

impl SparseAnnotations {
    pub fn new() -> Self {
        SparseAnnotations::default()
    }

    /// Chainable setter, used to build up a set in place.
    pub fn set(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.entries.insert(key.to_string(), Some(value.to_string()));
        self
    }

    /// Chainable removal marker.
    pub fn remove(mut self, key: impl ToString) -> Self {
        self.entries.insert(key.to_string(), None);
        self
    }

    /// Returns the value for `key`, or `None` if the key is absent or
    /// marked as removed.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_deref())
    }

    pub fn is_removed(&self, key: &str) -> bool {
        matches!(self.entries.get(key), Some(None))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Combine two sparse sets.  Entries from `other`, including removal
    /// markers, take precedence over ours.
    pub fn union(&self, other: &SparseAnnotations) -> SparseAnnotations {
        let mut entries = self.entries.clone();
        for (k, v) in &other.entries {
            entries.insert(k.clone(), v.clone());
        }
        SparseAnnotations { entries }
    }
}

/// The dense annotation set carried by a composed device or port.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    JsonSchema,
    Serialize,
)]
pub struct Annotations {
    entries: BTreeMap<String, String>,
}

impl Annotations {
    pub fn new() -> Self {
        Annotations::default()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a sparse set on top of this one, returning the result.
    pub fn merge(&self, sparse: &SparseAnnotations) -> Annotations {
        let mut entries = self.entries.clone();
        for (k, v) in &sparse.entries {
            match v {
                Some(v) => {
                    entries.insert(k.clone(), v.clone());
                }
                None => {
                    entries.remove(k);
                }
            }
        }
        Annotations { entries }
    }
}

impl fmt::Display for Annotations {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pairs: Vec<String> =
            self.entries.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}

#[test]
fn test_union_prefers_newer() {
    let old = SparseAnnotations::new().set("rack", "A1").set("row", "3");
    let new = SparseAnnotations::new().set("rack", "B2").remove("row");
    let u = old.union(&new);
    assert_eq!(u.value("rack"), Some("B2"));
    assert!(u.is_removed("row"));
    assert_eq!(u.keys().count(), 2);
}

#[test]
fn test_merge_honours_removal() {
    let base = Annotations::new()
        .merge(&SparseAnnotations::new().set("rack", "A1").set("row", "3"));
    assert_eq!(base.len(), 2);

    let merged = base.merge(&SparseAnnotations::new().remove("row"));
    assert_eq!(merged.value("rack"), Some("A1"));
    assert_eq!(merged.value("row"), None);
    assert_eq!(merged.len(), 1);

    // Removing an absent key is harmless
    let merged = merged.merge(&SparseAnnotations::new().remove("nope"));
    assert_eq!(merged.to_string(), "{rack=A1}");
}
