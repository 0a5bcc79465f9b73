// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;

use chrono::DateTime;
use chrono::Utc;

use crate::errors;
use protocol::Device;
use protocol::Port;

pub type StoreResult<T> = Result<T, errors::StoreError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeviceEventType {
    DeviceAdded,
    DeviceUpdated,
    DeviceRemoved,
    DeviceAvailabilityChanged,
    PortAdded,
    PortUpdated,
    PortRemoved,
}

impl fmt::Display for DeviceEventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DeviceEventType::DeviceAdded => "DEVICE_ADDED",
            DeviceEventType::DeviceUpdated => "DEVICE_UPDATED",
            DeviceEventType::DeviceRemoved => "DEVICE_REMOVED",
            DeviceEventType::DeviceAvailabilityChanged => {
                "DEVICE_AVAILABILITY_CHANGED"
            }
            DeviceEventType::PortAdded => "PORT_ADDED",
            DeviceEventType::PortUpdated => "PORT_UPDATED",
            DeviceEventType::PortRemoved => "PORT_REMOVED",
        };
        write!(f, "{s}")
    }
}

/// A change to the composed inventory, as seen by downstream consumers.
#[derive(Clone, Debug)]
pub struct DeviceEvent {
    pub event_type: DeviceEventType,
    /// The device affected, as composed at the time of the event.  For
    /// removals this is the last composed version.
    pub device: Device,
    /// The port affected, for the PORT_* events.
    pub port: Option<Port>,
    /// When this node generated the event
    pub time: DateTime<Utc>,
}

impl DeviceEvent {
    pub fn device(event_type: DeviceEventType, device: Device) -> Self {
        DeviceEvent {
            event_type,
            device,
            port: None,
            time: Utc::now(),
        }
    }

    pub fn port(
        event_type: DeviceEventType,
        device: Device,
        port: Port,
    ) -> Self {
        DeviceEvent {
            event_type,
            device,
            port: Some(port),
            time: Utc::now(),
        }
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.event_type, self.device.id)?;
        if let Some(port) = &self.port {
            write!(f, " port {}", port.number)?;
        }
        Ok(())
    }
}
