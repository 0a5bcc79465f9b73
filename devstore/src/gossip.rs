// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use protocol::ClusterMessage;
use protocol::GossipEvent;
use protocol::NodeId;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cluster::ClusterCommunicator;
use crate::config::GossipPolicy;

// Percentage of random jitter added to each retry interval
const RETRY_JITTER_PCT: u32 = 20;

#[derive(Debug)]
struct Pending {
    message: ClusterMessage,
    attempts: u32,
}

/// Sends locally originated deltas to the rest of the cluster, applying the
/// configured policy when a broadcast fails.
pub struct Gossiper {
    log: slog::Logger,
    communicator: Arc<dyn ClusterCommunicator>,
    policy: GossipPolicy,
    pending: Mutex<VecDeque<Pending>>,
}

impl Gossiper {
    pub fn new(
        log: &slog::Logger,
        communicator: Arc<dyn ClusterCommunicator>,
        policy: GossipPolicy,
    ) -> Self {
        Gossiper {
            log: log.new(slog::o!("unit" => "gossip")),
            communicator,
            policy,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        self.communicator.local_node()
    }

    pub fn communicator(&self) -> &Arc<dyn ClusterCommunicator> {
        &self.communicator
    }

    pub fn policy(&self) -> GossipPolicy {
        self.policy
    }

    /// Broadcast a delta to every peer.  This never fails from the caller's
    /// point of view: the change has already been applied locally.
    pub fn send(&self, event: &GossipEvent) {
        let message = match event.to_message(self.local_node()) {
            Ok(m) => m,
            Err(e) => {
                error!(self.log, "failed to encode {} delta", event.subject();
                    "device" => event.device_id().to_string(),
                    "err" => format!("{e:#}"));
                return;
            }
        };

        info!(self.log, "notifying peers of {} event", message.subject;
            "device" => event.device_id().to_string());
        if let Err(e) = self.communicator.broadcast(&message) {
            warn!(self.log, "failed to notify peers of {} event",
                message.subject;
                "device" => event.device_id().to_string(),
                "err" => e.to_string());
            self.requeue(message, 1);
        }
    }

    fn requeue(&self, message: ClusterMessage, attempts: u32) {
        let GossipPolicy::Retry {
            queue_depth,
            max_attempts,
            ..
        } = self.policy
        else {
            return;
        };

        if attempts >= max_attempts || queue_depth == 0 {
            warn!(self.log, "giving up on {} delta", message.subject;
                "attempts" => attempts);
            return;
        }

        let mut pending = self.pending.lock();
        if pending.len() >= queue_depth {
            if let Some(dropped) = pending.pop_front() {
                warn!(self.log, "retry queue full, dropping {} delta",
                    dropped.message.subject;
                    "attempts" => dropped.attempts);
            }
        }
        pending.push_back(Pending { message, attempts });
    }

    /// Number of deltas waiting to be re-broadcast.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Make one attempt to re-broadcast every queued delta.  Returns how
    /// many went through.
    pub fn retry_pending(&self) -> usize {
        let batch: Vec<Pending> = self.pending.lock().drain(..).collect();
        let mut sent = 0;
        for p in batch {
            match self.communicator.broadcast(&p.message) {
                Ok(()) => {
                    debug!(self.log, "re-sent {} delta", p.message.subject;
                        "attempts" => p.attempts + 1);
                    sent += 1;
                }
                Err(e) => {
                    debug!(self.log, "retry of {} delta failed",
                        p.message.subject;
                        "err" => e.to_string());
                    self.requeue(p.message, p.attempts + 1);
                }
            }
        }
        sent
    }

    /// Start a task that drains the retry queue until `shutdown` fires or
    /// its sender is dropped.  Under the best-effort policy there is
    /// nothing to retry, and no task is started.
    pub fn spawn_retry_task(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        let GossipPolicy::Retry { backoff_ms, .. } = self.policy else {
            return None;
        };

        let g = self.clone();
        let base = Duration::from_millis(backoff_ms);
        Some(tokio::task::spawn(async move {
            debug!(g.log, "retry task started");
            loop {
                let delay = common::jittered(base, RETRY_JITTER_PCT);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {
                        if g.pending() > 0 {
                            g.retry_pending();
                        }
                    }
                }
            }
            debug!(g.log, "retry task exiting");
        }))
    }
}
