// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::annotations::Annotations;
use crate::annotations::SparseAnnotations;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Opaque, cluster-wide unique identifier for a device, e.g. "of:0001".
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
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl ToString) -> Self {
        DeviceId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A port identifier, unique within a single device.
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
pub struct PortNumber(pub u64);

impl From<u64> for PortNumber {
    fn from(n: u64) -> Self {
        PortNumber(n)
    }
}

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a source of device and port information.  An ancillary
/// provider only supplements the data reported by a primary provider: it
/// never drives availability, and its base fields are only used when no
/// primary provider has reported the device.
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
pub struct ProviderId {
    pub scheme: String,
    pub id: String,
    pub ancillary: bool,
}

impl ProviderId {
    pub fn primary(scheme: impl ToString, id: impl ToString) -> Self {
        ProviderId {
            scheme: scheme.to_string(),
            id: id.to_string(),
            ancillary: false,
        }
    }

    pub fn ancillary(scheme: impl ToString, id: impl ToString) -> Self {
        ProviderId {
            scheme: scheme.to_string(),
            id: id.to_string(),
            ancillary: true,
        }
    }

    pub fn is_ancillary(&self) -> bool {
        self.ancillary
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.id)?;
        if self.ancillary {
            write!(f, " (ancillary)")?;
        }
        Ok(())
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Hash,
    PartialEq,
    Eq,
    Deserialize,
    JsonSchema,
    Serialize,
)]
pub enum DeviceType {
    Switch,
    Router,
    Roadm,
    Controller,
    VirtualDevice,
    Other,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            DeviceType::Switch => "switch",
            DeviceType::Router => "router",
            DeviceType::Roadm => "roadm",
            DeviceType::Controller => "controller",
            DeviceType::VirtualDevice => "virtual",
            DeviceType::Other => "other",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "switch" => Ok(DeviceType::Switch),
            "router" => Ok(DeviceType::Router),
            "roadm" => Ok(DeviceType::Roadm),
            "controller" => Ok(DeviceType::Controller),
            "virtual" => Ok(DeviceType::VirtualDevice),
            "other" => Ok(DeviceType::Other),
            x => Err(anyhow!("invalid device type: {x}")),
        }
    }
}

#[test]
fn verify_device_type_names() -> Result<()> {
    for t in [
        DeviceType::Switch,
        DeviceType::Router,
        DeviceType::Roadm,
        DeviceType::Controller,
        DeviceType::VirtualDevice,
        DeviceType::Other,
    ] {
        assert_eq!(DeviceType::from_str(&t.to_string())?, t);
    }
    assert!(DeviceType::from_str("toaster").is_err());
    Ok(())
}

/// A provider's view of a device at some moment.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct DeviceDescription {
    pub device_type: DeviceType,
    pub manufacturer: String,
    pub hw_version: String,
    pub sw_version: String,
    pub serial_number: String,
    pub annotations: SparseAnnotations,
}

impl DeviceDescription {
    /// Returns a copy of this description carrying a different annotation
    /// set.
    pub fn with_annotations(&self, annotations: SparseAnnotations) -> Self {
        DeviceDescription {
            annotations,
            ..self.clone()
        }
    }
}

/// A provider's view of a single port at some moment.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct PortDescription {
    pub port_number: PortNumber,
    pub enabled: bool,
    pub annotations: SparseAnnotations,
}

impl PortDescription {
    pub fn new(port_number: impl Into<PortNumber>, enabled: bool) -> Self {
        PortDescription {
            port_number: port_number.into(),
            enabled,
            annotations: SparseAnnotations::new(),
        }
    }

    pub fn with_annotations(&self, annotations: SparseAnnotations) -> Self {
        PortDescription {
            annotations,
            ..self.clone()
        }
    }
}

/// A device as served to readers: the merged view of every provider's
/// description.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct Device {
    /// The provider whose description supplied the base fields
    pub provider_id: ProviderId,
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub manufacturer: String,
    pub hw_version: String,
    pub sw_version: String,
    pub serial_number: String,
    pub annotations: Annotations,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Device ID: {}", self.id)?;
        writeln!(f, "Provider: {}", self.provider_id)?;
        writeln!(f, "Type: {}", self.device_type)?;
        writeln!(f, "Manufacturer: {}", self.manufacturer)?;
        writeln!(f, "Hardware version: {}", self.hw_version)?;
        writeln!(f, "Software version: {}", self.sw_version)?;
        writeln!(f, "Serial number: {}", self.serial_number)?;
        if !self.annotations.is_empty() {
            writeln!(f, "Annotations: {}", self.annotations)?;
        }
        Ok(())
    }
}

/// A port as served to readers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, JsonSchema, Serialize)]
pub struct Port {
    pub device_id: DeviceId,
    pub number: PortNumber,
    pub enabled: bool,
    pub annotations: Annotations,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = if self.enabled { "enabled" } else { "disabled" };
        write!(f, "{}/{} {state}", self.device_id, self.number)?;
        if !self.annotations.is_empty() {
            write!(f, " {}", self.annotations)?;
        }
        Ok(())
    }
}

#[test]
fn verify_provider_display() {
    let p = ProviderId::primary("of", "openflow");
    assert_eq!(p.to_string(), "of:openflow");
    let a = ProviderId::ancillary("lldp", "inventory");
    assert_eq!(a.to_string(), "lldp:inventory (ancillary)");
    assert!(a.is_ancillary());
    assert!(!p.is_ancillary());
}
