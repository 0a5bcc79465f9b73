// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

pub mod annotations;
pub mod messages;
pub mod timestamp;
pub mod types;

pub use annotations::Annotations;
pub use annotations::SparseAnnotations;
pub use messages::ClusterMessage;
pub use messages::GossipEvent;
pub use messages::MessageSubject;
pub use messages::NodeId;
pub use timestamp::Timestamp;
pub use timestamp::Timestamped;
pub use types::*;
