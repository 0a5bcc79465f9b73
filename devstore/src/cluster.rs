// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use protocol::ClusterMessage;
use protocol::MessageSubject;
use protocol::NodeId;

use crate::errors::StoreError;
use crate::types::StoreResult;

/// Consumer of messages arriving from peers on one subject.
pub trait ClusterMessageHandler: Send + Sync {
    fn handle(&self, message: &ClusterMessage);
}

/// The store's view of the cluster fabric: fire-and-forget broadcast to
/// every other member, plus per-subject dispatch of inbound messages.
pub trait ClusterCommunicator: Send + Sync {
    fn local_node(&self) -> &NodeId;

    /// Send `message` to every other member.  An error means at least one
    /// member may not have received it.
    fn broadcast(&self, message: &ClusterMessage) -> StoreResult<()>;

    fn add_subscriber(
        &self,
        subject: MessageSubject,
        handler: Arc<dyn ClusterMessageHandler>,
    );

    fn remove_subscriber(&self, subject: MessageSubject);
}

struct Member {
    reachable: AtomicBool,
    inbox: Mutex<VecDeque<ClusterMessage>>,
    subscribers: DashMap<MessageSubject, Arc<dyn ClusterMessageHandler>>,
}

impl Member {
    fn new() -> Self {
        Member {
            reachable: AtomicBool::new(true),
            inbox: Mutex::new(VecDeque::new()),
            subscribers: DashMap::new(),
        }
    }

    // Returns false if nobody was listening on the message's subject.
    fn dispatch(&self, message: &ClusterMessage) -> bool {
        // Clone the handler out so the map isn't locked while it runs
        let handler = self
            .subscribers
            .get(&message.subject)
            .map(|h| h.value().clone());
        match handler {
            Some(h) => {
                h.handle(message);
                true
            }
            None => false,
        }
    }
}

/// An in-process cluster.  Broadcasts are queued in each recipient's inbox
/// and only handed to the recipient's subscribers when deliver_all() (or
/// deliver()) is called, which lets callers control interleaving, drop
/// messages, or replay them out of order.
#[derive(Clone, Default)]
pub struct LocalCluster {
    members: Arc<DashMap<NodeId, Arc<Member>>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        LocalCluster::default()
    }

    /// Add a member to the cluster, returning its communicator.
    pub fn join(&self, node: NodeId) -> Arc<LocalCommunicator> {
        self.members
            .entry(node.clone())
            .or_insert_with(|| Arc::new(Member::new()));
        Arc::new(LocalCommunicator {
            node,
            members: self.members.clone(),
        })
    }

    fn member(&self, node: &NodeId) -> Option<Arc<Member>> {
        self.members.get(node).map(|m| m.value().clone())
    }

    /// Mark a member as (un)reachable.  Broadcasts that would reach an
    /// unreachable member fail for that member.
    pub fn set_reachable(&self, node: &NodeId, reachable: bool) {
        if let Some(m) = self.member(node) {
            m.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Number of messages waiting for `node`.
    pub fn pending(&self, node: &NodeId) -> usize {
        self.member(node).map(|m| m.inbox.lock().len()).unwrap_or(0)
    }

    /// Remove and return everything queued for `node` without delivering it.
    pub fn take_pending(&self, node: &NodeId) -> Vec<ClusterMessage> {
        self.member(node)
            .map(|m| m.inbox.lock().drain(..).collect())
            .unwrap_or_default()
    }

    /// Hand a single message straight to `node`'s subscribers.
    pub fn deliver(&self, node: &NodeId, message: &ClusterMessage) -> bool {
        self.member(node).is_some_and(|m| m.dispatch(message))
    }

    /// Deliver queued messages until every inbox is empty.  Returns the
    /// number of messages delivered.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        loop {
            let members: Vec<Arc<Member>> =
                self.members.iter().map(|m| m.value().clone()).collect();
            let mut progress = false;
            for member in members {
                loop {
                    let next = member.inbox.lock().pop_front();
                    let Some(message) = next else { break };
                    member.dispatch(&message);
                    delivered += 1;
                    progress = true;
                }
            }
            if !progress {
                return delivered;
            }
        }
    }
}

/// One member's handle on a LocalCluster.
pub struct LocalCommunicator {
    node: NodeId,
    members: Arc<DashMap<NodeId, Arc<Member>>>,
}

impl LocalCommunicator {
    fn me(&self) -> Option<Arc<Member>> {
        self.members.get(&self.node).map(|m| m.value().clone())
    }
}

impl ClusterCommunicator for LocalCommunicator {
    fn local_node(&self) -> &NodeId {
        &self.node
    }

    fn broadcast(&self, message: &ClusterMessage) -> StoreResult<()> {
        let peers: Vec<(NodeId, Arc<Member>)> = self
            .members
            .iter()
            .filter(|m| *m.key() != self.node)
            .map(|m| (m.key().clone(), m.value().clone()))
            .collect();

        let mut failed = None;
        for (node, member) in peers {
            if member.reachable.load(Ordering::SeqCst) {
                member.inbox.lock().push_back(message.clone());
            } else if failed.is_none() {
                failed = Some(node);
            }
        }
        match failed {
            Some(node) => Err(StoreError::transport(&node, "unreachable")),
            None => Ok(()),
        }
    }

    fn add_subscriber(
        &self,
        subject: MessageSubject,
        handler: Arc<dyn ClusterMessageHandler>,
    ) {
        if let Some(me) = self.me() {
            me.subscribers.insert(subject, handler);
        }
    }

    fn remove_subscriber(&self, subject: MessageSubject) {
        if let Some(me) = self.me() {
            me.subscribers.remove(&subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ClusterMessage>>,
    }

    impl ClusterMessageHandler for Recorder {
        fn handle(&self, message: &ClusterMessage) {
            self.seen.lock().push(message.clone());
        }
    }

    fn msg(sender: &NodeId, subject: MessageSubject) -> ClusterMessage {
        ClusterMessage {
            sender: sender.clone(),
            subject,
            payload: b"{}".to_vec(),
        }
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let cluster = LocalCluster::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let c = NodeId::new("c");
        let comm_a = cluster.join(a.clone());
        let comm_b = cluster.join(b.clone());
        let _comm_c = cluster.join(c.clone());

        let rec = Arc::new(Recorder::default());
        comm_b.add_subscriber(MessageSubject::DeviceUpdate, rec.clone());

        comm_a
            .broadcast(&msg(&a, MessageSubject::DeviceUpdate))
            .unwrap();
        assert_eq!(cluster.pending(&a), 0);
        assert_eq!(cluster.pending(&b), 1);
        assert_eq!(cluster.pending(&c), 1);

        // c has no subscriber: its copy is delivered into the void
        assert_eq!(cluster.deliver_all(), 2);
        assert_eq!(rec.seen.lock().len(), 1);
        assert_eq!(rec.seen.lock()[0].sender, a);
    }

    #[test]
    fn test_unreachable_peer_fails_broadcast() {
        let cluster = LocalCluster::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let c = NodeId::new("c");
        let comm_a = cluster.join(a.clone());
        cluster.join(b.clone());
        cluster.join(c.clone());

        cluster.set_reachable(&c, false);
        let err = comm_a
            .broadcast(&msg(&a, MessageSubject::PortUpdate))
            .unwrap_err();
        assert!(matches!(err, StoreError::Transport { node, .. } if node == c));
        // Reachable members still got their copy
        assert_eq!(cluster.pending(&b), 1);
        assert_eq!(cluster.pending(&c), 0);

        cluster.set_reachable(&c, true);
        comm_a
            .broadcast(&msg(&a, MessageSubject::PortUpdate))
            .unwrap();
        assert_eq!(cluster.take_pending(&b).len(), 2);
        assert_eq!(cluster.pending(&b), 0);
    }

    #[test]
    fn test_remove_subscriber() {
        let cluster = LocalCluster::new();
        let a = NodeId::new("a");
        let comm_a = cluster.join(a.clone());
        let rec = Arc::new(Recorder::default());
        comm_a.add_subscriber(MessageSubject::DeviceRemoved, rec.clone());
        assert!(cluster.deliver(&a, &msg(&a, MessageSubject::DeviceRemoved)));
        comm_a.remove_subscriber(MessageSubject::DeviceRemoved);
        assert!(!cluster.deliver(&a, &msg(&a, MessageSubject::DeviceRemoved)));
        assert_eq!(rec.seen.lock().len(), 1);
        assert_eq!(comm_a.local_node(), &a);
    }
}
