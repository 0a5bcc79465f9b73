// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! An eventually consistent, gossip-replicated inventory of network devices
//! and their ports.  See store.rs for the acceptance rules.

pub mod clock;
pub mod cluster;
pub mod compose;
pub mod config;
pub mod delegate;
pub mod descriptions;
pub mod errors;
pub mod gossip;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use clock::DeviceClock;
pub use clock::TermClock;
pub use cluster::ClusterCommunicator;
pub use cluster::ClusterMessageHandler;
pub use cluster::LocalCluster;
pub use cluster::LocalCommunicator;
pub use config::GossipPolicy;
pub use config::StoreConfig;
pub use delegate::DeviceStoreDelegate;
pub use errors::StoreError;
pub use store::GossipDeviceStore;
pub use types::DeviceEvent;
pub use types::DeviceEventType;
pub use types::StoreResult;
