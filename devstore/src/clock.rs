// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use protocol::DeviceId;
use protocol::Timestamp;

/// Source of timestamps for locally originated changes.
pub trait DeviceClock: Send + Sync {
    /// Issue a timestamp for a change to `device_id`.  Successive calls for
    /// the same device must return strictly increasing values.
    fn timestamp_for(&self, device_id: &DeviceId) -> Timestamp;
}

/// Timestamps derived from the mastership term this node holds for each
/// device.  The owner of mastership state calls set_term() whenever this
/// node becomes master of a device; the sequence number is shared across
/// all devices and only ever increases.
#[derive(Debug, Default)]
pub struct TermClock {
    terms: DashMap<DeviceId, u64>,
    sequence: AtomicU64,
}

impl TermClock {
    pub fn new() -> Self {
        TermClock::default()
    }

    pub fn set_term(&self, device_id: &DeviceId, term: u64) {
        self.terms.insert(device_id.clone(), term);
    }

    pub fn term(&self, device_id: &DeviceId) -> Option<u64> {
        self.terms.get(device_id).map(|t| *t)
    }
}

impl DeviceClock for TermClock {
    fn timestamp_for(&self, device_id: &DeviceId) -> Timestamp {
        let term = self.term(device_id).unwrap_or(0);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Timestamp::new(term, sequence)
    }
}

#[test]
fn test_term_clock() {
    let clock = TermClock::new();
    let d1 = DeviceId::new("d1");
    let d2 = DeviceId::new("d2");

    let a = clock.timestamp_for(&d1);
    let b = clock.timestamp_for(&d1);
    assert_eq!(a.term, 0);
    assert!(b > a);

    clock.set_term(&d2, 3);
    let c = clock.timestamp_for(&d2);
    assert_eq!(c.term, 3);
    // A new term dominates anything issued under an older one
    assert!(c > b);
    clock.set_term(&d1, 1);
    assert!(clock.timestamp_for(&d1) > b);
}
