// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The replicated device inventory.
//!
//! Every node keeps the raw descriptions each provider has reported for
//! each device, and composes the served Device and Port views out of them.
//! Changes that originate on this node are stamped by the DeviceClock,
//! applied locally, and then gossiped to the rest of the cluster as
//! deltas.  Deltas from peers go through exactly the same acceptance rules,
//! so every node that has seen the same set of deltas, in any order and
//! with any duplication, ends up with the same inventory.
//!
//! All changes to a single device are serialized by that device's
//! ProviderDescriptions lock.  The lock is created the first time the
//! device is mentioned and is never replaced.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dashmap::DashSet;
use parking_lot::Mutex;
use parking_lot::RwLock;
use protocol::messages::DeviceOffline;
use protocol::messages::DeviceRemoved;
use protocol::messages::DeviceUpdate;
use protocol::messages::PortStatusUpdate;
use protocol::messages::PortUpdate;
use protocol::ClusterMessage;
use protocol::Device;
use protocol::DeviceDescription;
use protocol::DeviceId;
use protocol::GossipEvent;
use protocol::MessageSubject;
use protocol::Port;
use protocol::PortDescription;
use protocol::PortNumber;
use protocol::ProviderId;
use protocol::Timestamp;
use protocol::Timestamped;
use slog::debug;
use slog::error;
use slog::info;
use slog::trace;

use crate::clock::DeviceClock;
use crate::cluster::ClusterCommunicator;
use crate::cluster::ClusterMessageHandler;
use crate::compose::compose_device;
use crate::compose::compose_port;
use crate::config::StoreConfig;
use crate::delegate::DeviceStoreDelegate;
use crate::descriptions::supersedes;
use crate::descriptions::ProviderDescriptions;
use crate::errors::StoreError;
use crate::gossip::Gossiper;
use crate::types::DeviceEvent;
use crate::types::DeviceEventType;
use crate::types::StoreResult;

type DeviceLock = Arc<Mutex<ProviderDescriptions>>;
type PortMap = Arc<DashMap<PortNumber, Port>>;

// An accepted delta: the provider's value as now stored, which is what
// peers are sent, and the events it produced.  None if it was stale.
type Accepted<T, E> = Option<(Timestamped<T>, E)>;

pub struct GossipDeviceStore {
    log: slog::Logger,
    clock: Arc<dyn DeviceClock>,
    gossiper: Arc<Gossiper>,
    delegate: RwLock<Option<Arc<dyn DeviceStoreDelegate>>>,

    /// Raw provider descriptions, one lock per device.
    device_descs: DashMap<DeviceId, DeviceLock>,
    /// Composed devices, as served to readers
    devices: DashMap<DeviceId, Device>,
    /// Composed ports, as served to readers
    device_ports: DashMap<DeviceId, PortMap>,
    /// When each device was last marked offline
    offline: DashMap<DeviceId, Timestamp>,
    /// Tombstones: when each device was last removed
    removal_requests: DashMap<DeviceId, Timestamp>,
    available: DashSet<DeviceId>,
}

// Registered with the communicator for each subject.  Holds a weak
// reference so a subscription doesn't keep a dropped store alive.
struct Subscriber {
    store: Weak<GossipDeviceStore>,
}

impl ClusterMessageHandler for Subscriber {
    fn handle(&self, message: &ClusterMessage) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        if let Err(e) = store.handle_message(message) {
            error!(store.log, "dropping {} event from peer", message.subject;
                "sender" => message.sender.to_string(),
                "err" => e.to_string());
        }
    }
}

impl GossipDeviceStore {
    pub fn new(
        log: &slog::Logger,
        config: &StoreConfig,
        clock: Arc<dyn DeviceClock>,
        communicator: Arc<dyn ClusterCommunicator>,
    ) -> Self {
        let log = log.new(slog::o!(
            "unit" => "device-store",
            "node" => communicator.local_node().to_string()));
        let gossiper =
            Arc::new(Gossiper::new(&log, communicator, config.gossip));
        GossipDeviceStore {
            log,
            clock,
            gossiper,
            delegate: RwLock::new(None),
            device_descs: DashMap::new(),
            devices: DashMap::new(),
            device_ports: DashMap::new(),
            offline: DashMap::new(),
            removal_requests: DashMap::new(),
            available: DashSet::new(),
        }
    }

    /// Start listening for deltas from peers.
    pub fn activate(self: &Arc<Self>) {
        let communicator = self.gossiper.communicator();
        for subject in MessageSubject::ALL {
            communicator.add_subscriber(
                subject,
                Arc::new(Subscriber {
                    store: Arc::downgrade(self),
                }),
            );
        }
        info!(self.log, "started");
    }

    /// Stop listening to peers and forget everything.  Each device is
    /// cleared under its own lock, and the lock itself is kept.
    pub fn deactivate(&self) {
        let communicator = self.gossiper.communicator();
        for subject in MessageSubject::ALL {
            communicator.remove_subscriber(subject);
        }

        let locks: Vec<(DeviceId, DeviceLock)> = self
            .device_descs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (device_id, lock) in locks {
            let mut descs = lock.lock();
            descs.clear();
            self.devices.remove(&device_id);
            self.device_ports.remove(&device_id);
            self.available.remove(&device_id);
            self.offline.remove(&device_id);
            self.removal_requests.remove(&device_id);
        }
        info!(self.log, "stopped");
    }

    pub fn set_delegate(&self, delegate: Arc<dyn DeviceStoreDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    pub fn unset_delegate(&self) {
        *self.delegate.write() = None;
    }

    pub fn gossiper(&self) -> &Arc<Gossiper> {
        &self.gossiper
    }

    fn notify_delegate(&self, event: &DeviceEvent) {
        // Clone the delegate out so the lock isn't held while it runs
        let delegate = self.delegate.read().clone();
        if let Some(d) = delegate {
            d.notify(event.clone());
        }
    }

    fn notify_all(&self, events: &[DeviceEvent]) {
        for event in events {
            self.notify_delegate(event);
        }
    }

    // Returns the lock for a device, creating it if this is the first time
    // we've heard of the device.
    fn device_lock(&self, device_id: &DeviceId) -> DeviceLock {
        self.device_descs
            .entry(device_id.clone())
            .or_default()
            .value()
            .clone()
    }

    fn port_map(&self, device_id: &DeviceId) -> PortMap {
        self.device_ports
            .entry(device_id.clone())
            .or_default()
            .value()
            .clone()
    }

    // -- Readers --

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> =
            self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.value().clone())
    }

    pub fn ports(&self, device_id: &DeviceId) -> Vec<Port> {
        let Some(ports) =
            self.device_ports.get(device_id).map(|p| p.value().clone())
        else {
            return Vec::new();
        };
        let mut ports: Vec<Port> =
            ports.iter().map(|p| p.value().clone()).collect();
        ports.sort_by_key(|p| p.number);
        ports
    }

    pub fn port(
        &self,
        device_id: &DeviceId,
        number: PortNumber,
    ) -> Option<Port> {
        self.device_ports
            .get(device_id)
            .and_then(|ports| ports.get(&number).map(|p| p.value().clone()))
    }

    pub fn is_available(&self, device_id: &DeviceId) -> bool {
        self.available.contains(device_id)
    }

    // -- Changes originating on this node --

    /// Record a provider's description of a device.  Returns the resulting
    /// event, if the composed inventory changed.
    pub fn create_or_update_device(
        &self,
        provider_id: &ProviderId,
        device_id: &DeviceId,
        description: DeviceDescription,
    ) -> Option<DeviceEvent> {
        let timestamp = self.clock.timestamp_for(device_id);
        let delta = Timestamped::new(description, timestamp);
        let (stored, event) =
            self.apply_device_update(provider_id, device_id, &delta)?;
        if let Some(event) = &event {
            self.gossiper.send(&GossipEvent::DeviceUpdate(DeviceUpdate {
                provider_id: provider_id.clone(),
                device_id: device_id.clone(),
                device_description: stored,
            }));
            self.notify_delegate(event);
        }
        event
    }

    pub fn mark_offline(&self, device_id: &DeviceId) -> Option<DeviceEvent> {
        let timestamp = self.clock.timestamp_for(device_id);
        let (accepted, event) = self.apply_offline(device_id, timestamp);
        if accepted {
            self.gossiper.send(&GossipEvent::DeviceOffline(DeviceOffline {
                device_id: device_id.clone(),
                timestamp,
            }));
        }
        if let Some(event) = &event {
            self.notify_delegate(event);
        }
        event
    }

    /// Replace the complete set of ports one provider reports for a device.
    /// Cached ports missing from `ports` are removed.
    pub fn update_ports(
        &self,
        provider_id: &ProviderId,
        device_id: &DeviceId,
        ports: Vec<PortDescription>,
    ) -> StoreResult<Vec<DeviceEvent>> {
        let timestamp = self.clock.timestamp_for(device_id);
        let delta = Timestamped::new(ports, timestamp);
        let Some((stored, events)) =
            self.apply_port_update(provider_id, device_id, &delta)?
        else {
            return Ok(Vec::new());
        };
        if !events.is_empty() {
            self.gossiper.send(&GossipEvent::PortUpdate(PortUpdate {
                provider_id: provider_id.clone(),
                device_id: device_id.clone(),
                port_descriptions: stored,
            }));
            self.notify_all(&events);
        }
        Ok(events)
    }

    pub fn update_port_status(
        &self,
        provider_id: &ProviderId,
        device_id: &DeviceId,
        port: PortDescription,
    ) -> StoreResult<Option<DeviceEvent>> {
        let timestamp = self.clock.timestamp_for(device_id);
        let delta = Timestamped::new(port, timestamp);
        let Some((stored, event)) =
            self.apply_port_status(provider_id, device_id, &delta)?
        else {
            return Ok(None);
        };
        if let Some(event) = &event {
            self.gossiper.send(&GossipEvent::PortStatusUpdate(
                PortStatusUpdate {
                    provider_id: provider_id.clone(),
                    device_id: device_id.clone(),
                    port_description: stored,
                },
            ));
            self.notify_delegate(event);
        }
        Ok(event)
    }

    pub fn remove_device(&self, device_id: &DeviceId) -> Option<DeviceEvent> {
        let timestamp = self.clock.timestamp_for(device_id);
        let (accepted, event) = self.apply_removal(device_id, timestamp);
        if accepted {
            self.gossiper.send(&GossipEvent::DeviceRemoved(DeviceRemoved {
                device_id: device_id.clone(),
                timestamp,
            }));
        }
        if let Some(event) = &event {
            self.notify_delegate(event);
        }
        event
    }

    // -- Changes arriving from peers.  These are applied and reported to the
    // delegate, but never gossiped onward. --

    pub fn handle_message(&self, message: &ClusterMessage) -> StoreResult<()> {
        let event = GossipEvent::try_from(message)?;
        info!(self.log, "received {} event from peer", message.subject;
            "sender" => message.sender.to_string(),
            "device" => event.device_id().to_string());
        match event {
            GossipEvent::DeviceUpdate(u) => {
                self.apply_remote_device_update(&u);
            }
            GossipEvent::DeviceOffline(o) => {
                self.apply_remote_device_offline(&o);
            }
            GossipEvent::DeviceRemoved(r) => {
                self.apply_remote_device_removed(&r);
            }
            GossipEvent::PortUpdate(u) => {
                self.apply_remote_port_update(&u)?;
            }
            GossipEvent::PortStatusUpdate(u) => {
                self.apply_remote_port_status(&u)?;
            }
        }
        Ok(())
    }

    pub fn apply_remote_device_update(
        &self,
        update: &DeviceUpdate,
    ) -> Option<DeviceEvent> {
        let event = self
            .apply_device_update(
                &update.provider_id,
                &update.device_id,
                &update.device_description,
            )
            .and_then(|(_, event)| event);
        if let Some(event) = &event {
            self.notify_delegate(event);
        }
        event
    }

    pub fn apply_remote_device_offline(
        &self,
        offline: &DeviceOffline,
    ) -> Option<DeviceEvent> {
        let (_, event) =
            self.apply_offline(&offline.device_id, offline.timestamp);
        if let Some(event) = &event {
            self.notify_delegate(event);
        }
        event
    }

    pub fn apply_remote_device_removed(
        &self,
        removed: &DeviceRemoved,
    ) -> Option<DeviceEvent> {
        let (_, event) =
            self.apply_removal(&removed.device_id, removed.timestamp);
        if let Some(event) = &event {
            self.notify_delegate(event);
        }
        event
    }

    pub fn apply_remote_port_update(
        &self,
        update: &PortUpdate,
    ) -> StoreResult<Vec<DeviceEvent>> {
        let events = self
            .apply_port_update(
                &update.provider_id,
                &update.device_id,
                &update.port_descriptions,
            )?
            .map(|(_, events)| events)
            .unwrap_or_default();
        self.notify_all(&events);
        Ok(events)
    }

    pub fn apply_remote_port_status(
        &self,
        update: &PortStatusUpdate,
    ) -> StoreResult<Option<DeviceEvent>> {
        let event = self
            .apply_port_status(
                &update.provider_id,
                &update.device_id,
                &update.port_description,
            )?
            .and_then(|(_, event)| event);
        if let Some(event) = &event {
            self.notify_delegate(event);
        }
        Ok(event)
    }

    // -- Shared acceptance logic --

    fn is_device_removed(&self, device_id: &DeviceId, ts: &Timestamp) -> bool {
        self.removal_requests
            .get(device_id)
            .is_some_and(|removed| *removed >= *ts)
    }

    // Returns true, and logs, if a `what` stamped `ts` predates the
    // device's removal and must be dropped.
    fn predates_removal(
        &self,
        device_id: &DeviceId,
        ts: &Timestamp,
        what: &str,
    ) -> bool {
        if !self.is_device_removed(device_id, ts) {
            return false;
        }
        debug!(self.log, "ignoring {} for removed device", what;
            "device" => device_id.to_string(),
            "timestamp" => ts.to_string());
        true
    }

    fn apply_device_update(
        &self,
        provider_id: &ProviderId,
        device_id: &DeviceId,
        delta: &Timestamped<DeviceDescription>,
    ) -> Accepted<DeviceDescription, Option<DeviceEvent>> {
        let lock = self.device_lock(device_id);
        let mut descs = lock.lock();

        if self.predates_removal(device_id, &delta.timestamp, "update") {
            return None;
        }

        let provider_descs = descs.get_or_insert(provider_id, delta);
        if !supersedes(provider_descs.device_desc(), delta) {
            debug!(self.log, "ignoring stale device description";
                "device" => device_id.to_string(),
                "provider" => provider_id.to_string(),
                "timestamp" => delta.timestamp.to_string(),
                "stored" => provider_descs.device_desc().timestamp.to_string());
            return None;
        }
        provider_descs.put_device_desc(delta.clone());
        let stored = provider_descs.device_desc().clone();

        let device = compose_device(device_id, &descs)
            .expect("a description was just stored for this device");
        let event = match self.device(device_id) {
            None => Some(self.create_device(
                provider_id,
                device,
                delta.timestamp,
            )),
            Some(old) => {
                self.update_device(provider_id, &old, device, delta.timestamp)
            }
        };
        Some((stored, event))
    }

    // Called with the device lock held
    fn create_device(
        &self,
        provider_id: &ProviderId,
        device: Device,
        ts: Timestamp,
    ) -> DeviceEvent {
        match self.devices.entry(device.id.clone()) {
            Entry::Occupied(_) => panic!(
                "device {} appeared in the cache while its lock was held",
                device.id
            ),
            Entry::Vacant(v) => {
                v.insert(device.clone());
            }
        }
        if !provider_id.is_ancillary() {
            self.mark_online(&device.id, ts);
        }
        DeviceEvent::device(DeviceEventType::DeviceAdded, device)
    }

    // Called with the device lock held
    fn update_device(
        &self,
        provider_id: &ProviderId,
        old: &Device,
        new: Device,
        ts: Timestamp,
    ) -> Option<DeviceEvent> {
        let changed = old.hw_version != new.hw_version
            || old.sw_version != new.sw_version
            || old.annotations != new.annotations;

        if changed {
            match self.devices.get_mut(&new.id) {
                Some(mut cached) if *cached == *old => *cached = new.clone(),
                _ => panic!(
                    "device {} changed in the cache while its lock was held",
                    new.id
                ),
            }
            if !provider_id.is_ancillary() {
                self.mark_online(&new.id, ts);
            }
            return Some(DeviceEvent::device(
                DeviceEventType::DeviceUpdated,
                new,
            ));
        }

        if !provider_id.is_ancillary() && self.mark_online(&new.id, ts) {
            return Some(DeviceEvent::device(
                DeviceEventType::DeviceAvailabilityChanged,
                new,
            ));
        }
        None
    }

    // Returns true if the device went from unavailable to available.  A
    // change older than the last offline transition leaves it offline.
    fn mark_online(&self, device_id: &DeviceId, ts: Timestamp) -> bool {
        if let Some(offline) = self.offline.get(device_id).map(|t| *t) {
            if offline >= ts {
                trace!(self.log, "not marking device online";
                    "device" => device_id.to_string(),
                    "offline" => offline.to_string(),
                    "timestamp" => ts.to_string());
                return false;
            }
        }
        self.offline.remove(device_id);
        self.available.insert(device_id.clone())
    }

    // The offline ledger only moves forward.
    fn record_offline(&self, device_id: &DeviceId, ts: Timestamp) {
        self.offline
            .entry(device_id.clone())
            .and_modify(|t| *t = (*t).max(ts))
            .or_insert(ts);
    }

    // Returns whether the offline transition was accepted, along with the
    // availability event it generated, if any.
    fn apply_offline(
        &self,
        device_id: &DeviceId,
        ts: Timestamp,
    ) -> (bool, Option<DeviceEvent>) {
        let lock = self.device_lock(device_id);
        let descs = lock.lock();

        if let Some((_, primary)) = descs.primary_descs() {
            if ts <= primary.latest_timestamp() {
                debug!(self.log, "ignoring stale offline request";
                    "device" => device_id.to_string(),
                    "timestamp" => ts.to_string(),
                    "latest" => primary.latest_timestamp().to_string());
                return (false, None);
            }
        }

        self.record_offline(device_id, ts);
        let Some(device) = self.device(device_id) else {
            return (true, None);
        };
        if self.available.remove(device_id).is_some() {
            let event = DeviceEvent::device(
                DeviceEventType::DeviceAvailabilityChanged,
                device,
            );
            (true, Some(event))
        } else {
            (true, None)
        }
    }

    fn apply_removal(
        &self,
        device_id: &DeviceId,
        ts: Timestamp,
    ) -> (bool, Option<DeviceEvent>) {
        let lock = self.device_lock(device_id);
        let mut descs = lock.lock();

        if let Some((_, primary)) = descs.primary_descs() {
            if ts <= primary.latest_timestamp() {
                debug!(self.log, "ignoring stale removal request";
                    "device" => device_id.to_string(),
                    "timestamp" => ts.to_string(),
                    "latest" => primary.latest_timestamp().to_string());
                return (false, None);
            }
        }

        self.removal_requests
            .entry(device_id.clone())
            .and_modify(|t| *t = (*t).max(ts))
            .or_insert(ts);
        self.record_offline(device_id, ts);
        self.available.remove(device_id);
        self.device_ports.remove(device_id);
        descs.clear();

        let event = self
            .devices
            .remove(device_id)
            .map(|(_, d)| {
                DeviceEvent::device(DeviceEventType::DeviceRemoved, d)
            });
        (true, event)
    }

    // Find the lock for a device that must already exist.  Port changes
    // never bring a device into being.
    fn existing_device_lock(
        &self,
        device_id: &DeviceId,
    ) -> StoreResult<DeviceLock> {
        if !self.devices.contains_key(device_id) {
            return Err(StoreError::DeviceNotFound(device_id.clone()));
        }
        self.device_descs
            .get(device_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| StoreError::DeviceNotFound(device_id.clone()))
    }

    fn apply_port_update(
        &self,
        provider_id: &ProviderId,
        device_id: &DeviceId,
        delta: &Timestamped<Vec<PortDescription>>,
    ) -> StoreResult<Accepted<Vec<PortDescription>, Vec<DeviceEvent>>> {
        // A late delta for a removed device is stale, not an error, even
        // though the device itself is gone
        if self.predates_removal(device_id, &delta.timestamp, "port list") {
            return Ok(None);
        }
        let lock = self.existing_device_lock(device_id)?;
        let mut descs = lock.lock();

        if self.predates_removal(device_id, &delta.timestamp, "port list") {
            return Ok(None);
        }
        let device = self
            .device(device_id)
            .ok_or_else(|| StoreError::DeviceNotFound(device_id.clone()))?;
        let provider_descs = descs.get_mut(provider_id).ok_or_else(|| {
            StoreError::ProviderNotFound {
                device: device_id.clone(),
                provider: provider_id.clone(),
            }
        })?;

        // An older port list must not prune ports a newer one reported
        if provider_descs
            .ports_timestamp()
            .is_some_and(|t| t > delta.timestamp)
        {
            debug!(self.log, "ignoring stale port list";
                "device" => device_id.to_string(),
                "provider" => provider_id.to_string(),
                "timestamp" => delta.timestamp.to_string());
            return Ok(None);
        }
        provider_descs.set_ports_timestamp(delta.timestamp);

        let ports = self.port_map(device_id);
        let mut events = Vec::new();
        let mut processed = BTreeSet::new();
        for port_desc in &delta.value {
            let number = port_desc.port_number;
            processed.insert(number);

            let incoming = Timestamped::new(port_desc.clone(), delta.timestamp);
            let provider_descs = descs
                .get_mut(provider_id)
                .expect("provider descriptions checked above");
            let accepted = provider_descs
                .port_desc(&number)
                .map_or(true, |stored| supersedes(stored, &incoming));
            if !accepted {
                trace!(self.log, "ignoring stale port description";
                    "device" => device_id.to_string(),
                    "port" => number.to_string());
                continue;
            }
            provider_descs.put_port_desc(incoming);

            let port = compose_port(device_id, number, &descs);
            events.extend(self.apply_composed_port(&device, &ports, port));
        }
        events.extend(self.prune_old_ports(&device, &ports, &processed));

        let stored: Vec<PortDescription> = descs
            .get(provider_id)
            .map(|d| {
                processed
                    .iter()
                    .filter_map(|n| d.port_desc(n))
                    .map(|p| p.value.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some((Timestamped::new(stored, delta.timestamp), events)))
    }

    fn apply_port_status(
        &self,
        provider_id: &ProviderId,
        device_id: &DeviceId,
        delta: &Timestamped<PortDescription>,
    ) -> StoreResult<Accepted<PortDescription, Option<DeviceEvent>>> {
        if self.predates_removal(device_id, &delta.timestamp, "port status") {
            return Ok(None);
        }
        let lock = self.existing_device_lock(device_id)?;
        let mut descs = lock.lock();

        if self.predates_removal(device_id, &delta.timestamp, "port status") {
            return Ok(None);
        }
        let device = self
            .device(device_id)
            .ok_or_else(|| StoreError::DeviceNotFound(device_id.clone()))?;
        let provider_descs = descs.get_mut(provider_id).ok_or_else(|| {
            StoreError::ProviderNotFound {
                device: device_id.clone(),
                provider: provider_id.clone(),
            }
        })?;

        let number = delta.value.port_number;
        if let Some(stored) = provider_descs.port_desc(&number) {
            if !supersedes(stored, delta) {
                debug!(self.log, "ignoring stale port status";
                    "device" => device_id.to_string(),
                    "port" => number.to_string(),
                    "timestamp" => delta.timestamp.to_string(),
                    "stored" => stored.timestamp.to_string());
                return Ok(None);
            }
        }
        provider_descs.put_port_desc(delta.clone());
        let stored = provider_descs
            .port_desc(&number)
            .expect("port description was just stored")
            .clone();

        let ports = self.port_map(device_id);
        let port = compose_port(device_id, number, &descs);
        let event = self.apply_composed_port(&device, &ports, port);
        Ok(Some((stored, event)))
    }

    // Install a freshly composed port in the cache.  Called with the device
    // lock held.
    fn apply_composed_port(
        &self,
        device: &Device,
        ports: &PortMap,
        port: Port,
    ) -> Option<DeviceEvent> {
        let old = ports.get(&port.number).map(|p| p.value().clone());
        let event_type = match old {
            None => DeviceEventType::PortAdded,
            Some(old) => {
                if old.enabled == port.enabled
                    && old.annotations == port.annotations
                {
                    return None;
                }
                DeviceEventType::PortUpdated
            }
        };
        ports.insert(port.number, port.clone());
        Some(DeviceEvent::port(event_type, device.clone(), port))
    }

    fn prune_old_ports(
        &self,
        device: &Device,
        ports: &PortMap,
        keep: &BTreeSet<PortNumber>,
    ) -> Vec<DeviceEvent> {
        let stale: Vec<PortNumber> = ports
            .iter()
            .map(|p| *p.key())
            .filter(|n| !keep.contains(n))
            .collect();
        stale
            .into_iter()
            .filter_map(|n| ports.remove(&n))
            .map(|(_, port)| {
                DeviceEvent::port(
                    DeviceEventType::PortRemoved,
                    device.clone(),
                    port,
                )
            })
            .collect()
    }
}
