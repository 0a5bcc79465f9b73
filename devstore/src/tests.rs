// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

// Several stores gossiping over a LocalCluster.

use std::sync::Arc;
use std::thread;

use protocol::messages::DeviceUpdate;
use protocol::DeviceDescription;
use protocol::DeviceId;
use protocol::DeviceType;
use protocol::NodeId;
use protocol::PortDescription;
use protocol::ProviderId;
use protocol::SparseAnnotations;
use protocol::Timestamp;
use protocol::Timestamped;
use tokio::sync::mpsc;

use crate::DeviceEvent;
use crate::DeviceEventType;
use crate::GossipDeviceStore;
use crate::GossipPolicy;
use crate::LocalCluster;
use crate::StoreConfig;
use crate::StoreError;
use crate::TermClock;

struct Node {
    id: NodeId,
    clock: Arc<TermClock>,
    store: Arc<GossipDeviceStore>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl Node {
    fn drain_events(&mut self) -> Vec<DeviceEventType> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev.event_type);
        }
        out
    }
}

fn cluster(names: &[&str], policy: GossipPolicy) -> (LocalCluster, Vec<Node>) {
    let log = common::logging::discard();
    let cluster = LocalCluster::new();
    let config = StoreConfig { gossip: policy };
    let nodes = names
        .iter()
        .map(|name| {
            let id = NodeId::new(name);
            let clock = Arc::new(TermClock::new());
            let store = Arc::new(GossipDeviceStore::new(
                &log,
                &config,
                clock.clone(),
                cluster.join(id.clone()),
            ));
            store.activate();
            let (tx, events) = mpsc::unbounded_channel();
            store.set_delegate(Arc::new(tx));
            Node {
                id,
                clock,
                store,
                events,
            }
        })
        .collect();
    (cluster, nodes)
}

fn desc(hw: &str, annotations: SparseAnnotations) -> DeviceDescription {
    DeviceDescription {
        device_type: DeviceType::Switch,
        manufacturer: "acme".into(),
        hw_version: hw.into(),
        sw_version: "1.0".into(),
        serial_number: "sn-1".into(),
        annotations,
    }
}

fn primary() -> ProviderId {
    ProviderId::primary("of", "openflow")
}

fn ancillary() -> ProviderId {
    ProviderId::ancillary("netcfg", "config")
}

fn d1() -> DeviceId {
    DeviceId::new("of:0001")
}

fn assert_converged(nodes: &[Node]) {
    let (first, rest) = nodes.split_first().expect("at least one node");
    let devices = first.store.devices();
    for node in rest {
        assert_eq!(
            node.store.devices(),
            devices,
            "{} and {} disagree on devices",
            first.id,
            node.id
        );
        for device in &devices {
            assert_eq!(
                node.store.ports(&device.id),
                first.store.ports(&device.id)
            );
            assert_eq!(
                node.store.is_available(&device.id),
                first.store.is_available(&device.id)
            );
        }
    }
}

#[test]
fn test_nodes_converge() {
    let (cluster, mut nodes) =
        cluster(&["a", "b", "c"], GossipPolicy::BestEffort);

    nodes[0].store.create_or_update_device(
        &primary(),
        &d1(),
        desc("v1", SparseAnnotations::new().set("os", "x")),
    );
    nodes[0]
        .store
        .update_ports(
            &primary(),
            &d1(),
            vec![PortDescription::new(1, true), PortDescription::new(2, false)],
        )
        .unwrap();
    assert_eq!(cluster.deliver_all(), 4);

    // An ancillary provider on another node decorates the same device
    nodes[1].store.create_or_update_device(
        &ancillary(),
        &d1(),
        desc("ignored", SparseAnnotations::new().set("rack", "A1")),
    );
    assert_eq!(cluster.deliver_all(), 2);

    assert_converged(&nodes);
    let device = nodes[2].store.device(&d1()).unwrap();
    assert_eq!(device.hw_version, "v1");
    assert_eq!(device.provider_id, primary());
    assert_eq!(device.annotations.value("rack"), Some("A1"));
    assert_eq!(device.annotations.value("os"), Some("x"));
    assert!(nodes[2].store.is_available(&d1()));
    assert_eq!(nodes[2].store.ports(&d1()).len(), 2);

    // Remote changes reach the delegate on every node, local ones on the
    // originator
    for node in nodes.iter_mut() {
        assert_eq!(
            node.drain_events(),
            vec![
                DeviceEventType::DeviceAdded,
                DeviceEventType::PortAdded,
                DeviceEventType::PortAdded,
                DeviceEventType::DeviceUpdated,
            ]
        );
    }
}

#[test]
fn test_reordered_and_duplicated_delivery() {
    let (cluster, mut nodes) =
        cluster(&["a", "b", "c"], GossipPolicy::BestEffort);
    let a = &nodes[0].store;
    a.create_or_update_device(
        &primary(),
        &d1(),
        desc("v1", SparseAnnotations::new().set("a", "1")),
    );
    a.create_or_update_device(
        &primary(),
        &d1(),
        desc("v2", SparseAnnotations::new().set("b", "2")),
    );
    a.create_or_update_device(
        &primary(),
        &d1(),
        desc("v3", SparseAnnotations::new().set("c", "3")),
    );

    // b sees the newest delta first, then replays of everything
    let msgs = cluster.take_pending(&nodes[1].id);
    assert_eq!(msgs.len(), 3);
    for i in [2, 0, 2, 1, 0] {
        assert!(cluster.deliver(&nodes[1].id, &msgs[i]));
    }
    // c sees them in order
    cluster.deliver_all();

    assert_converged(&nodes);
    let device = nodes[1].store.device(&d1()).unwrap();
    assert_eq!(device.hw_version, "v3");
    assert_eq!(device.annotations.len(), 3);

    // b composed the device exactly once and never went backwards
    assert_eq!(nodes[1].drain_events(), vec![DeviceEventType::DeviceAdded]);
}

#[test]
fn test_removal_overtakes_creation() {
    let (cluster, nodes) = cluster(&["a", "b"], GossipPolicy::BestEffort);
    let a = &nodes[0].store;
    a.create_or_update_device(
        &primary(),
        &d1(),
        desc("v1", SparseAnnotations::new()),
    );
    a.remove_device(&d1()).unwrap();
    assert!(a.device(&d1()).is_none());

    let msgs = cluster.take_pending(&nodes[1].id);
    assert_eq!(msgs.len(), 2);
    cluster.deliver(&nodes[1].id, &msgs[1]);
    cluster.deliver(&nodes[1].id, &msgs[0]);

    assert_converged(&nodes);
    assert_eq!(nodes[1].store.device_count(), 0);
    assert!(!nodes[1].store.is_available(&d1()));

    // The device comes back once something newer than the removal arrives
    a.create_or_update_device(
        &primary(),
        &d1(),
        desc("v2", SparseAnnotations::new()),
    );
    cluster.deliver_all();
    assert_converged(&nodes);
    assert_eq!(nodes[1].store.device(&d1()).unwrap().hw_version, "v2");
}

#[test]
fn test_stale_port_list_after_reorder() {
    let (cluster, nodes) = cluster(&["a", "b"], GossipPolicy::BestEffort);
    let a = &nodes[0].store;
    a.create_or_update_device(
        &primary(),
        &d1(),
        desc("v1", SparseAnnotations::new()),
    );
    a.update_ports(
        &primary(),
        &d1(),
        vec![PortDescription::new(1, true), PortDescription::new(2, true)],
    )
    .unwrap();
    a.update_ports(
        &primary(),
        &d1(),
        vec![
            PortDescription::new(1, true),
            PortDescription::new(2, true),
            PortDescription::new(3, true),
        ],
    )
    .unwrap();

    let msgs = cluster.take_pending(&nodes[1].id);
    assert_eq!(msgs.len(), 3);
    for i in [0, 2, 1] {
        cluster.deliver(&nodes[1].id, &msgs[i]);
    }
    assert_converged(&nodes);
    assert_eq!(nodes[1].store.ports(&d1()).len(), 3);
}

#[test]
fn test_port_update_before_device_is_dropped() {
    let (cluster, nodes) = cluster(&["a", "b"], GossipPolicy::BestEffort);
    let a = &nodes[0].store;
    a.create_or_update_device(
        &primary(),
        &d1(),
        desc("v1", SparseAnnotations::new()),
    );
    a.update_ports(&primary(), &d1(), vec![PortDescription::new(1, true)])
        .unwrap();

    let msgs = cluster.take_pending(&nodes[1].id);
    // The handler reports the failure and carries on
    assert!(cluster.deliver(&nodes[1].id, &msgs[1]));
    assert!(cluster.deliver(&nodes[1].id, &msgs[0]));
    assert!(nodes[1].store.device(&d1()).is_some());
    assert!(nodes[1].store.ports(&d1()).is_empty());
}

#[test]
fn test_mastership_handoff() {
    let (cluster, nodes) = cluster(&["a", "b"], GossipPolicy::BestEffort);
    nodes[0].clock.set_term(&d1(), 1);
    nodes[0].store.create_or_update_device(
        &primary(),
        &d1(),
        desc("v1", SparseAnnotations::new()),
    );
    cluster.deliver_all();

    // b takes over, and a's late update from the old term loses everywhere
    nodes[1].clock.set_term(&d1(), 2);
    nodes[1].store.create_or_update_device(
        &primary(),
        &d1(),
        desc("v2", SparseAnnotations::new()),
    );
    nodes[0].store.create_or_update_device(
        &primary(),
        &d1(),
        desc("old", SparseAnnotations::new()),
    );
    cluster.deliver_all();

    assert_converged(&nodes);
    assert_eq!(nodes[0].store.device(&d1()).unwrap().hw_version, "v2");

    nodes[1].store.mark_offline(&d1()).unwrap();
    cluster.deliver_all();
    assert_converged(&nodes);
    assert!(!nodes[0].store.is_available(&d1()));
}

#[test]
fn test_partition_best_effort_misses_update() {
    let (cluster, nodes) = cluster(&["a", "b"], GossipPolicy::BestEffort);
    cluster.set_reachable(&nodes[1].id, false);
    nodes[0].store.create_or_update_device(
        &primary(),
        &d1(),
        desc("v1", SparseAnnotations::new()),
    );
    // Applied locally regardless
    assert!(nodes[0].store.device(&d1()).is_some());

    cluster.set_reachable(&nodes[1].id, true);
    assert_eq!(nodes[0].store.gossiper().retry_pending(), 0);
    cluster.deliver_all();
    assert!(nodes[1].store.device(&d1()).is_none());
}

#[test]
fn test_partition_heals_with_retry() {
    let policy = GossipPolicy::Retry {
        queue_depth: 16,
        max_attempts: 3,
        backoff_ms: 10,
    };
    let (cluster, nodes) = cluster(&["a", "b", "c"], policy);
    cluster.set_reachable(&nodes[2].id, false);
    nodes[0].store.create_or_update_device(
        &primary(),
        &d1(),
        desc("v1", SparseAnnotations::new()),
    );
    cluster.deliver_all();
    assert!(nodes[1].store.device(&d1()).is_some());
    assert!(nodes[2].store.device(&d1()).is_none());
    assert_eq!(nodes[0].store.gossiper().pending(), 1);

    cluster.set_reachable(&nodes[2].id, true);
    assert_eq!(nodes[0].store.gossiper().retry_pending(), 1);
    // b sees the delta a second time, which is harmless
    cluster.deliver_all();
    assert_converged(&nodes);
}

#[test]
fn test_concurrent_updates() {
    let (_cluster, nodes) = cluster(&["a"], GossipPolicy::BestEffort);
    let store = nodes[0].store.clone();

    // Many devices in parallel, plus every thread racing on one device
    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..25u64 {
                    let id = DeviceId::new(format!("of:{t}:{i}"));
                    store.create_or_update_device(
                        &primary(),
                        &id,
                        desc("v1", SparseAnnotations::new()),
                    );
                    store
                        .update_ports(
                            &primary(),
                            &id,
                            vec![PortDescription::new(i, true)],
                        )
                        .unwrap();

                    let seq = i * 8 + t + 1;
                    store.apply_remote_device_update(&DeviceUpdate {
                        provider_id: primary(),
                        device_id: d1(),
                        device_description: Timestamped::new(
                            desc(&format!("v{seq}"), SparseAnnotations::new()),
                            Timestamp::new(9, seq),
                        ),
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(store.device_count(), 8 * 25 + 1);
    assert_eq!(store.device(&d1()).unwrap().hw_version, "v200");
    assert_eq!(store.ports(&DeviceId::new("of:3:7")).len(), 1);
}

#[test]
fn test_deactivate_while_updating() {
    let (_cluster, nodes) = cluster(&["a"], GossipPolicy::BestEffort);
    let store = nodes[0].store.clone();

    let mut handles: Vec<_> = (0..4u64)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..200u64 {
                    let hw = format!("v{t}.{i}");
                    store.create_or_update_device(
                        &primary(),
                        &d1(),
                        desc(&hw, SparseAnnotations::new()),
                    );
                    // The device may have been wiped in between
                    match store.update_ports(
                        &primary(),
                        &d1(),
                        vec![PortDescription::new(i % 4, true)],
                    ) {
                        Ok(_) | Err(StoreError::DeviceNotFound(_)) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        })
        .collect();
    handles.push({
        let store = store.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                store.deactivate();
                thread::yield_now();
            }
        })
    });
    for h in handles {
        h.join().unwrap();
    }

    // Whatever survived is internally consistent
    store.deactivate();
    assert_eq!(store.device_count(), 0);
    assert!(store.ports(&d1()).is_empty());
    store.create_or_update_device(
        &primary(),
        &d1(),
        desc("final", SparseAnnotations::new()),
    );
    assert!(store.is_available(&d1()));
    assert_eq!(store.device(&d1()).unwrap().hw_version, "final");
}
