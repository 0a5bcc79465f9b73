// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::convert;

use protocol::DeviceId;
use protocol::NodeId;
use protocol::ProviderId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A port operation named a device this store has never composed.
    #[error("Device with ID {0} not found")]
    DeviceNotFound(DeviceId),
    /// A port operation came from a provider that has not yet described
    /// the device.
    #[error(
        "Device description for device {device} from provider {provider} \
         was not found"
    )]
    ProviderNotFound {
        device: DeviceId,
        provider: ProviderId,
    },
    /// The cluster fabric could not deliver a broadcast.
    #[error("transport error sending to {node}: {reason}")]
    Transport { node: NodeId, reason: String },
    /// A gossip payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
    #[error("error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn transport(node: &NodeId, reason: impl ToString) -> Self {
        StoreError::Transport {
            node: node.clone(),
            reason: reason.to_string(),
        }
    }
}

impl convert::From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

impl convert::From<String> for StoreError {
    fn from(err: String) -> Self {
        StoreError::Other(err)
    }
}

impl convert::From<&str> for StoreError {
    fn from(err: &str) -> Self {
        StoreError::Other(err.to_string())
    }
}

// The protocol crate reports its encode/decode failures through anyhow.
impl convert::From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Codec(format!("{err:#}"))
    }
}
