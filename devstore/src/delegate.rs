// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use tokio::sync::mpsc;

use crate::types::DeviceEvent;

/// Receives every change the store makes to its composed inventory,
/// whether the change originated locally or arrived from a peer.
pub trait DeviceStoreDelegate: Send + Sync {
    fn notify(&self, event: DeviceEvent);
}

/// Forward events onto a channel.  If the receiver has gone away the event
/// is dropped.
impl DeviceStoreDelegate for mpsc::UnboundedSender<DeviceEvent> {
    fn notify(&self, event: DeviceEvent) {
        let _ = self.send(event);
    }
}
