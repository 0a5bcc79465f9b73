// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// A logical, per-device ordering token.  The mastership term is compared
/// first, then the sequence number issued within that term.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    JsonSchema,
    Serialize,
)]
pub struct Timestamp {
    pub term: u64,
    pub sequence: u64,
}

impl Timestamp {
    pub fn new(term: u64, sequence: u64) -> Self {
        Timestamp { term, sequence }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.sequence)
    }
}

/// A value paired with the timestamp at which it was issued.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct Timestamped<T> {
    pub value: T,
    pub timestamp: Timestamp,
}

impl<T> Timestamped<T> {
    pub fn new(value: T, timestamp: Timestamp) -> Self {
        Timestamped { value, timestamp }
    }

    /// Strictly newer than `other`.
    pub fn is_newer(&self, other: &Timestamped<T>) -> bool {
        self.timestamp > other.timestamp
    }

    pub fn is_newer_than(&self, timestamp: &Timestamp) -> bool {
        self.timestamp > *timestamp
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Timestamped<U> {
        Timestamped {
            value: f(self.value),
            timestamp: self.timestamp,
        }
    }
}

#[test]
fn verify_timestamp_order() {
    let a = Timestamp::new(1, 10);
    let b = Timestamp::new(1, 11);
    let c = Timestamp::new(2, 0);
    assert!(a < b);
    assert!(b < c);
    assert_eq!(c.to_string(), "2.0");

    let old = Timestamped::new("x", a);
    let new = Timestamped::new("x", c);
    assert!(new.is_newer(&old));
    assert!(!old.is_newer(&new));
    assert!(!old.is_newer(&old.clone()));
    assert!(new.is_newer_than(&b));
}
