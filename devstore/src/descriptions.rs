// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::BTreeMap;

use protocol::DeviceDescription;
use protocol::PortDescription;
use protocol::PortNumber;
use protocol::ProviderId;
use protocol::Timestamp;
use protocol::Timestamped;

/// Returns true if `incoming` may replace `stored`: it is strictly newer, or
/// it is the exact value already stored (a replay of a delta we have already
/// applied).
pub fn supersedes<T: PartialEq>(
    stored: &Timestamped<T>,
    incoming: &Timestamped<T>,
) -> bool {
    incoming.is_newer(stored) || incoming == stored
}

/// Everything one provider has told us about one device and its ports.
#[derive(Clone, Debug)]
pub struct DeviceDescriptions {
    device_desc: Timestamped<DeviceDescription>,
    port_descs: BTreeMap<PortNumber, Timestamped<PortDescription>>,
    /// Timestamp of the last complete port list accepted from this provider
    ports_timestamp: Option<Timestamp>,
}

impl DeviceDescriptions {
    pub fn new(device_desc: Timestamped<DeviceDescription>) -> Self {
        DeviceDescriptions {
            device_desc,
            port_descs: BTreeMap::new(),
            ports_timestamp: None,
        }
    }

    pub fn device_desc(&self) -> &Timestamped<DeviceDescription> {
        &self.device_desc
    }

    pub fn port_desc(
        &self,
        number: &PortNumber,
    ) -> Option<&Timestamped<PortDescription>> {
        self.port_descs.get(number)
    }

    pub fn ports_timestamp(&self) -> Option<Timestamp> {
        self.ports_timestamp
    }

    /// Record that a complete port list stamped `ts` was accepted.  This
    /// only ever moves forward.
    pub fn set_ports_timestamp(&mut self, ts: Timestamp) {
        self.ports_timestamp =
            Some(self.ports_timestamp.map_or(ts, |t| t.max(ts)));
    }

    /// The most recent timestamp across the device description and all of
    /// the port descriptions.
    pub fn latest_timestamp(&self) -> Timestamp {
        self.port_descs
            .values()
            .map(|p| p.timestamp)
            .fold(self.device_desc.timestamp, std::cmp::max)
    }

    /// Store a new device description.  Annotations previously reported by
    /// this provider are carried forward unless the new description
    /// overrides or explicitly removes them.  Returns the old description.
    pub fn put_device_desc(
        &mut self,
        new: Timestamped<DeviceDescription>,
    ) -> Timestamped<DeviceDescription> {
        let merged = self
            .device_desc
            .value
            .annotations
            .union(&new.value.annotations);
        let new = new.map(|d| d.with_annotations(merged));
        std::mem::replace(&mut self.device_desc, new)
    }

    /// Store a new port description, carrying annotations forward as
    /// put_device_desc() does.
    pub fn put_port_desc(
        &mut self,
        new: Timestamped<PortDescription>,
    ) -> Option<Timestamped<PortDescription>> {
        let number = new.value.port_number;
        let new = match self.port_descs.get(&number) {
            Some(old) => {
                let merged =
                    old.value.annotations.union(&new.value.annotations);
                new.map(|p| p.with_annotations(merged))
            }
            None => new,
        };
        self.port_descs.insert(number, new)
    }
}

/// All of the providers' descriptions for a single device.  The instance
/// that guards these (see store.rs) is created once per device and never
/// replaced, so holding its lock serializes every change to that device.
#[derive(Debug, Default)]
pub struct ProviderDescriptions {
    descs: BTreeMap<ProviderId, DeviceDescriptions>,
}

impl ProviderDescriptions {
    pub fn get(&self, provider: &ProviderId) -> Option<&DeviceDescriptions> {
        self.descs.get(provider)
    }

    pub fn get_mut(
        &mut self,
        provider: &ProviderId,
    ) -> Option<&mut DeviceDescriptions> {
        self.descs.get_mut(provider)
    }

    /// Fetch this provider's descriptions, seeding them with `desc` if the
    /// provider hasn't reported this device before.
    pub fn get_or_insert(
        &mut self,
        provider: &ProviderId,
        desc: &Timestamped<DeviceDescription>,
    ) -> &mut DeviceDescriptions {
        self.descs
            .entry(provider.clone())
            .or_insert_with(|| DeviceDescriptions::new(desc.clone()))
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&ProviderId, &DeviceDescriptions)> {
        self.descs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn clear(&mut self) {
        self.descs.clear()
    }

    /// The first non-ancillary provider.  If every provider is ancillary,
    /// fall back to the first ancillary one.  Iteration follows ProviderId
    /// ordering, so the fallback is the lowest-ordered ancillary provider.
    pub fn primary(&self) -> Option<&ProviderId> {
        self.descs
            .keys()
            .find(|p| !p.is_ancillary())
            .or_else(|| self.descs.keys().next())
    }

    pub fn primary_descs(&self) -> Option<(&ProviderId, &DeviceDescriptions)> {
        let primary = self.primary()?;
        self.descs.get_key_value(primary)
    }
}
