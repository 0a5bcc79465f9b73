// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Build the single merged view of a device, or of one of its ports, out of
//! the descriptions reported by every provider.
//!
//! Base fields come only from the primary provider.  Annotations are
//! collected from every provider: the primary's first, then the others in
//! provider order, with later providers winning any key they share.
//! Providers are not expected to report conflicting keys, so no attempt is
//! made to resolve such conflicts by timestamp.

use protocol::Annotations;
use protocol::Device;
use protocol::DeviceId;
use protocol::Port;
use protocol::PortNumber;

use crate::descriptions::ProviderDescriptions;

/// Compose a device from its providers' descriptions.  Returns None only if
/// no provider has described the device.
pub fn compose_device(
    device_id: &DeviceId,
    descs: &ProviderDescriptions,
) -> Option<Device> {
    let (primary, primary_descs) = descs.primary_descs()?;
    let base = &primary_descs.device_desc().value;

    let mut annotations = Annotations::new().merge(&base.annotations);
    for (provider, d) in descs.iter() {
        if provider == primary {
            continue;
        }
        annotations = annotations.merge(&d.device_desc().value.annotations);
    }

    Some(Device {
        provider_id: primary.clone(),
        id: device_id.clone(),
        device_type: base.device_type,
        manufacturer: base.manufacturer.clone(),
        hw_version: base.hw_version.clone(),
        sw_version: base.sw_version.clone(),
        serial_number: base.serial_number.clone(),
        annotations,
    })
}

/// Compose one port.  A port the primary provider hasn't described is
/// reported as disabled.
pub fn compose_port(
    device_id: &DeviceId,
    number: PortNumber,
    descs: &ProviderDescriptions,
) -> Port {
    let mut enabled = false;
    let mut annotations = Annotations::new();

    let primary = descs.primary_descs();
    if let Some(port_desc) = primary.and_then(|(_, d)| d.port_desc(&number)) {
        enabled = port_desc.value.enabled;
        annotations = annotations.merge(&port_desc.value.annotations);
    }

    for (provider, d) in descs.iter() {
        if primary.is_some_and(|(p, _)| p == provider) {
            continue;
        }
        if let Some(port_desc) = d.port_desc(&number) {
            annotations = annotations.merge(&port_desc.value.annotations);
        }
    }

    Port {
        device_id: device_id.clone(),
        number,
        enabled,
        annotations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DeviceDescription;
    use protocol::DeviceType;
    use protocol::PortDescription;
    use protocol::ProviderId;
    use protocol::SparseAnnotations;
    use protocol::Timestamp;
    use protocol::Timestamped;

    fn desc(
        hw: &str,
        annotations: SparseAnnotations,
    ) -> Timestamped<DeviceDescription> {
        Timestamped::new(
            DeviceDescription {
                device_type: DeviceType::Switch,
                manufacturer: "acme".into(),
                hw_version: hw.into(),
                sw_version: "1.0".into(),
                serial_number: "sn".into(),
                annotations,
            },
            Timestamp::new(1, 1),
        )
    }

    fn port(
        n: u64,
        enabled: bool,
        a: SparseAnnotations,
    ) -> Timestamped<PortDescription> {
        Timestamped::new(
            PortDescription::new(n, enabled).with_annotations(a),
            Timestamp::new(1, 2),
        )
    }

    #[test]
    fn test_empty_descriptions() {
        let descs = ProviderDescriptions::default();
        assert!(compose_device(&DeviceId::new("d1"), &descs).is_none());
    }

    #[test]
    fn test_device_takes_base_from_primary() {
        let id = DeviceId::new("d1");
        let primary = ProviderId::primary("of", "p1");
        let anc = ProviderId::ancillary("cfg", "p2");

        let mut descs = ProviderDescriptions::default();
        let rack = SparseAnnotations::new().set("rack", "A1");
        descs.get_or_insert(&anc, &desc("anc-hw", rack));
        let d = compose_device(&id, &descs).unwrap();
        // Only an ancillary provider so far: it is the fallback primary
        assert_eq!(d.hw_version, "anc-hw");
        assert_eq!(d.provider_id, anc);

        let os = SparseAnnotations::new().set("os", "x");
        descs.get_or_insert(&primary, &desc("v1", os));
        let d = compose_device(&id, &descs).unwrap();
        assert_eq!(d.hw_version, "v1");
        assert_eq!(d.provider_id, primary);
        assert_eq!(d.annotations.value("rack"), Some("A1"));
        assert_eq!(d.annotations.value("os"), Some("x"));
        assert_eq!(d.annotations.len(), 2);
    }

    #[test]
    fn test_overlapping_annotation_is_deterministic() {
        let id = DeviceId::new("d1");
        let primary = ProviderId::primary("of", "p1");
        let anc_a = ProviderId::ancillary("a", "a");
        let anc_b = ProviderId::ancillary("b", "b");

        let mut descs = ProviderDescriptions::default();
        let k = |v: &str| SparseAnnotations::new().set("k", v);
        descs.get_or_insert(&anc_b, &desc("x", k("from-b")));
        descs.get_or_insert(&primary, &desc("v1", k("from-primary")));
        descs.get_or_insert(&anc_a, &desc("x", k("from-a")));

        // Primary first, then the others in provider order: b sorts last
        for _ in 0..3 {
            let d = compose_device(&id, &descs).unwrap();
            assert_eq!(d.annotations.value("k"), Some("from-b"));
        }
    }

    #[test]
    fn test_ancillary_removal_marker_hides_primary_key() {
        let id = DeviceId::new("d1");
        let mut descs = ProviderDescriptions::default();
        descs.get_or_insert(
            &ProviderId::primary("of", "p1"),
            &desc("v1", SparseAnnotations::new().set("rack", "A1")),
        );
        descs.get_or_insert(
            &ProviderId::ancillary("cfg", "p2"),
            &desc("v1", SparseAnnotations::new().remove("rack")),
        );
        let d = compose_device(&id, &descs).unwrap();
        assert!(d.annotations.is_empty());
    }

    #[test]
    fn test_port_enabled_from_primary_only() {
        let id = DeviceId::new("d1");
        let primary = ProviderId::primary("of", "p1");
        let anc = ProviderId::ancillary("cfg", "p2");

        let mut descs = ProviderDescriptions::default();
        descs.get_or_insert(&primary, &desc("v1", SparseAnnotations::new()));
        descs.get_or_insert(&anc, &desc("v1", SparseAnnotations::new()));
        descs
            .get_mut(&anc)
            .unwrap()
            .put_port_desc(port(
                1,
                true,
                SparseAnnotations::new().set("label", "uplink"),
            ));

        // The ancillary provider says "enabled", but the primary hasn't
        // described the port yet.
        let p = compose_port(&id, PortNumber(1), &descs);
        assert!(!p.enabled);
        assert_eq!(p.annotations.value("label"), Some("uplink"));

        descs
            .get_mut(&primary)
            .unwrap()
            .put_port_desc(port(
                1,
                true,
                SparseAnnotations::new().set("speed", "10G"),
            ));
        let p = compose_port(&id, PortNumber(1), &descs);
        assert!(p.enabled);
        assert_eq!(p.annotations.len(), 2);
        assert_eq!(p.device_id, id);
        assert_eq!(p.number, PortNumber(1));
    }
}
