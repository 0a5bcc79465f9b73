// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Deltas exchanged between cluster members.  Each accepted local change is
//! broadcast exactly once by the node that originated it, tagged with the
//! subject that tells the receiver how to decode the payload.

use std::fmt;

use anyhow::Context;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::timestamp::Timestamp;
use crate::timestamp::Timestamped;
use crate::types::DeviceDescription;
use crate::types::DeviceId;
use crate::types::PortDescription;
use crate::types::ProviderId;
use crate::types::Result;

/// Identity of a cluster member.
#[derive(
    Clone,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    JsonSchema,
    Serialize,
)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl ToString) -> Self {
        NodeId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Deserialize,
    JsonSchema,
    Serialize,
)]
pub enum MessageSubject {
    DeviceUpdate,
    DeviceOffline,
    DeviceRemoved,
    PortUpdate,
    PortStatusUpdate,
}

impl MessageSubject {
    pub const ALL: [MessageSubject; 5] = [
        MessageSubject::DeviceUpdate,
        MessageSubject::DeviceOffline,
        MessageSubject::DeviceRemoved,
        MessageSubject::PortUpdate,
        MessageSubject::PortStatusUpdate,
    ];
}

impl fmt::Display for MessageSubject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            MessageSubject::DeviceUpdate => "device-update",
            MessageSubject::DeviceOffline => "device-offline",
            MessageSubject::DeviceRemoved => "device-removed",
            MessageSubject::PortUpdate => "port-update",
            MessageSubject::PortStatusUpdate => "port-status-update",
        };
        write!(f, "{s}")
    }
}

/// A serialized delta on its way to, or from, a peer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct ClusterMessage {
    pub sender: NodeId,
    pub subject: MessageSubject,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct DeviceUpdate {
    pub provider_id: ProviderId,
    pub device_id: DeviceId,
    pub device_description: Timestamped<DeviceDescription>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct DeviceOffline {
    pub device_id: DeviceId,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct DeviceRemoved {
    pub device_id: DeviceId,
    pub timestamp: Timestamp,
}

/// The complete set of ports reported by one provider at one moment.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct PortUpdate {
    pub provider_id: ProviderId,
    pub device_id: DeviceId,
    pub port_descriptions: Timestamped<Vec<PortDescription>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct PortStatusUpdate {
    pub provider_id: ProviderId,
    pub device_id: DeviceId,
    pub port_description: Timestamped<PortDescription>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipEvent {
    DeviceUpdate(DeviceUpdate),
    DeviceOffline(DeviceOffline),
    DeviceRemoved(DeviceRemoved),
    PortUpdate(PortUpdate),
    PortStatusUpdate(PortStatusUpdate),
}

impl GossipEvent {
    pub fn subject(&self) -> MessageSubject {
        match self {
            GossipEvent::DeviceUpdate(_) => MessageSubject::DeviceUpdate,
            GossipEvent::DeviceOffline(_) => MessageSubject::DeviceOffline,
            GossipEvent::DeviceRemoved(_) => MessageSubject::DeviceRemoved,
            GossipEvent::PortUpdate(_) => MessageSubject::PortUpdate,
            GossipEvent::PortStatusUpdate(_) => {
                MessageSubject::PortStatusUpdate
            }
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            GossipEvent::DeviceUpdate(e) => &e.device_id,
            GossipEvent::DeviceOffline(e) => &e.device_id,
            GossipEvent::DeviceRemoved(e) => &e.device_id,
            GossipEvent::PortUpdate(e) => &e.device_id,
            GossipEvent::PortStatusUpdate(e) => &e.device_id,
        }
    }

    /// Serialize the payload.  The subject travels alongside it, in the
    /// enclosing ClusterMessage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            GossipEvent::DeviceUpdate(e) => serde_json::to_vec(e),
            GossipEvent::DeviceOffline(e) => serde_json::to_vec(e),
            GossipEvent::DeviceRemoved(e) => serde_json::to_vec(e),
            GossipEvent::PortUpdate(e) => serde_json::to_vec(e),
            GossipEvent::PortStatusUpdate(e) => serde_json::to_vec(e),
        }
        .with_context(|| format!("encoding {} payload", self.subject()))?;
        Ok(bytes)
    }

    pub fn decode(subject: MessageSubject, payload: &[u8]) -> Result<Self> {
        Ok(match subject {
            MessageSubject::DeviceUpdate => {
                GossipEvent::DeviceUpdate(decode_payload(subject, payload)?)
            }
            MessageSubject::DeviceOffline => {
                GossipEvent::DeviceOffline(decode_payload(subject, payload)?)
            }
            MessageSubject::DeviceRemoved => {
                GossipEvent::DeviceRemoved(decode_payload(subject, payload)?)
            }
            MessageSubject::PortUpdate => {
                GossipEvent::PortUpdate(decode_payload(subject, payload)?)
            }
            MessageSubject::PortStatusUpdate => GossipEvent::PortStatusUpdate(
                decode_payload(subject, payload)?,
            ),
        })
    }

    /// Wrap this event for broadcast by `sender`.
    pub fn to_message(&self, sender: &NodeId) -> Result<ClusterMessage> {
        Ok(ClusterMessage {
            sender: sender.clone(),
            subject: self.subject(),
            payload: self.encode()?,
        })
    }
}

impl TryFrom<&ClusterMessage> for GossipEvent {
    type Error = crate::types::Error;

    fn try_from(msg: &ClusterMessage) -> Result<Self> {
        GossipEvent::decode(msg.subject, &msg.payload)
    }
}

fn decode_payload<T: DeserializeOwned>(
    subject: MessageSubject,
    payload: &[u8],
) -> Result<T> {
    serde_json::from_slice(payload)
        .with_context(|| format!("malformed {subject} payload"))
}
