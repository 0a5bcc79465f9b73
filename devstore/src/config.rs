// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use serde::Deserialize;
use serde::Serialize;

use crate::types::StoreResult;

pub const DEFAULT_RETRY_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// What to do with a delta that could not be broadcast to every peer.
/// Local state is never rolled back either way.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum GossipPolicy {
    /// Log the failure and move on.  Peers that missed the delta stay out
    /// of date until the device changes again.
    #[default]
    BestEffort,
    /// Queue the delta and re-broadcast it every `backoff_ms` (plus jitter)
    /// until it goes through or has been tried `max_attempts` times.  When
    /// the queue is full the oldest delta is dropped.
    Retry {
        queue_depth: usize,
        max_attempts: u32,
        backoff_ms: u64,
    },
}

impl GossipPolicy {
    pub fn retry() -> Self {
        GossipPolicy::Retry {
            queue_depth: DEFAULT_RETRY_QUEUE_DEPTH,
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub gossip: GossipPolicy,
}

impl StoreConfig {
    pub fn from_json(data: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

#[test]
fn test_config_parsing() {
    assert_eq!(StoreConfig::from_json("{}").unwrap(), StoreConfig::default());

    let cfg = StoreConfig::from_json(
        r#"{"gossip": {"policy": "retry", "queue_depth": 8,
            "max_attempts": 3, "backoff_ms": 100}}"#,
    )
    .unwrap();
    assert_eq!(
        cfg.gossip,
        GossipPolicy::Retry {
            queue_depth: 8,
            max_attempts: 3,
            backoff_ms: 100
        }
    );

    let cfg =
        StoreConfig::from_json(r#"{"gossip": {"policy": "best_effort"}}"#)
            .unwrap();
    assert_eq!(cfg.gossip, GossipPolicy::BestEffort);

    assert!(StoreConfig::from_json(r#"{"gossip": {"policy": "yolo"}}"#)
        .is_err());
}
