use models::labels::{HOSTNAME_LABEL, NO_PROVISIONER, ZONE_LABEL};
use models::pod::{Affinity, NodeAffinity, NodeSelectorTerm, Pod};
use models::requirements::Requirement;

use crate::registry::Registry;

#[derive(Debug, Clone, thiserror::Error)]
pub enum VolumeTopologyError {
    #[error("pod {pod} references missing persistent volume claim {claim}")]
    MissingClaim { pod: String, claim: String },
    #[error("claim {claim} is bound to missing volume {volume}")]
    MissingVolume { claim: String, volume: String },
    #[error("claim {claim} references missing storage class {class}")]
    MissingStorageClass { claim: String, class: String },
}

/// Rewrites a pod's node requirements to reflect the zones and hosts its
/// volumes can live in, before simulation.
pub struct VolumeTopology {
    registry: Registry,
}

impl VolumeTopology {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Injects volume-derived requirements into the pod in place. A
    /// malformed claim rejects this pod only, never the whole pass.
    pub fn inject(&self, pod: &mut Pod) -> Result<(), VolumeTopologyError> {
        let mut injected: Vec<Requirement> = Vec::new();
        for claim_name in pod.volume_claims.clone() {
            let claim = self
                .registry
                .get_claim(&pod.namespace, &claim_name)
                .ok_or_else(|| VolumeTopologyError::MissingClaim {
                    pod: pod.name.clone(),
                    claim: claim_name.clone(),
                })?;

            if claim.is_bound() {
                let volume_name = claim.volume_name.clone().unwrap_or_default();
                let volume = self.registry.get_volume(&volume_name).ok_or_else(|| {
                    VolumeTopologyError::MissingVolume {
                        claim: claim_name.clone(),
                        volume: volume_name.clone(),
                    }
                })?;
                // A bound volume with a vanished storage class is still
                // schedulable; the volume already exists.
                let drop_hostname = claim
                    .storage_class
                    .as_ref()
                    .and_then(|name| self.registry.get_storage_class(name))
                    .map(|class| class.provisioner == NO_PROVISIONER)
                    .unwrap_or(false)
                    && volume.source.is_node_local();
                for requirement in &volume.node_affinity {
                    if drop_hostname && requirement.key == HOSTNAME_LABEL {
                        // Any new node trivially provides "some hostname".
                        continue;
                    }
                    injected.push(requirement.clone());
                }
            } else {
                let Some(class_name) = claim.storage_class.clone() else {
                    continue;
                };
                let class = self.registry.get_storage_class(&class_name).ok_or_else(|| {
                    VolumeTopologyError::MissingStorageClass {
                        claim: claim_name.clone(),
                        class: class_name.clone(),
                    }
                })?;
                if let Some(zones) = &class.zones {
                    let zones: Vec<&str> = zones.iter().map(|z| z.as_str()).collect();
                    injected.push(Requirement::in_values(ZONE_LABEL, &zones));
                }
            }
        }

        if !injected.is_empty() {
            inject_into_every_term(pod, &injected);
        }
        Ok(())
    }
}

/// ANDs the requirements into each OR-branch of the pod's required node
/// affinity so term relaxation can never drop them.
fn inject_into_every_term(pod: &mut Pod, requirements: &[Requirement]) {
    let affinity = pod.affinity.get_or_insert_with(Affinity::default);
    let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);
    if node_affinity.required.is_empty() {
        node_affinity.required.push(NodeSelectorTerm::default());
    }
    for term in &mut node_affinity.required {
        term.match_expressions.extend(requirements.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::resources::Resources;
    use models::volume::{ClaimPhase, PersistentVolume, PersistentVolumeClaim, StorageClass, VolumeSource};

    fn registry_with_bound_volume(provisioner: &str, source: VolumeSource) -> Registry {
        let registry = Registry::new();
        registry.upsert_storage_class(StorageClass {
            name: "standard".to_string(),
            provisioner: provisioner.to_string(),
            zones: None,
        });
        registry.upsert_volume(PersistentVolume {
            name: "pv-1".to_string(),
            node_affinity: vec![
                Requirement::in_values(ZONE_LABEL, &["test-zone-3"]),
                Requirement::in_values(HOSTNAME_LABEL, &["host-7"]),
            ],
            source,
        });
        registry.upsert_claim(PersistentVolumeClaim {
            name: "data".to_string(),
            namespace: "default".to_string(),
            storage_class: Some("standard".to_string()),
            volume_name: Some("pv-1".to_string()),
            phase: ClaimPhase::Bound,
        });
        registry
    }

    fn pod_with_claim() -> Pod {
        let mut pod = Pod::new("web", "default", Resources::new(100, 1 << 20));
        pod.volume_claims = vec!["data".to_string()];
        pod
    }

    #[test]
    fn test_bound_volume_zone_is_injected() {
        let registry =
            registry_with_bound_volume("ebs.csi.aws.com", VolumeSource::Csi { driver: "ebs".into() });
        let mut pod = pod_with_claim();
        VolumeTopology::new(registry).inject(&mut pod).unwrap();

        let requirements = pod.scheduling_requirements();
        assert_eq!(
            requirements.label_value(ZONE_LABEL),
            Some("test-zone-3".to_string())
        );
        // CSI volumes keep their hostname affinity.
        assert_eq!(
            requirements.label_value(HOSTNAME_LABEL),
            Some("host-7".to_string())
        );
    }

    #[test]
    fn test_local_no_provisioner_drops_hostname() {
        let registry = registry_with_bound_volume(
            NO_PROVISIONER,
            VolumeSource::Local { path: "/mnt/disk".into() },
        );
        let mut pod = pod_with_claim();
        VolumeTopology::new(registry).inject(&mut pod).unwrap();

        let requirements = pod.scheduling_requirements();
        assert_eq!(
            requirements.label_value(ZONE_LABEL),
            Some("test-zone-3".to_string())
        );
        assert!(requirements.label_value(HOSTNAME_LABEL).is_none());
    }

    #[test]
    fn test_unbound_claim_uses_storage_class_zones() {
        let registry = Registry::new();
        registry.upsert_storage_class(StorageClass {
            name: "zonal".to_string(),
            provisioner: "ebs.csi.aws.com".to_string(),
            zones: Some(vec!["zone-1".to_string(), "zone-2".to_string()]),
        });
        registry.upsert_claim(PersistentVolumeClaim {
            name: "data".to_string(),
            namespace: "default".to_string(),
            storage_class: Some("zonal".to_string()),
            volume_name: None,
            phase: ClaimPhase::Pending,
        });
        let mut pod = pod_with_claim();
        pod.node_selector
            .insert(ZONE_LABEL.to_string(), "zone-2".to_string());
        VolumeTopology::new(registry).inject(&mut pod).unwrap();

        let requirements = pod.scheduling_requirements();
        assert_eq!(requirements.label_value(ZONE_LABEL), Some("zone-2".to_string()));
    }

    #[test]
    fn test_zone_requirement_lands_in_every_or_branch() {
        let registry = Registry::new();
        registry.upsert_storage_class(StorageClass {
            name: "zonal".to_string(),
            provisioner: "ebs.csi.aws.com".to_string(),
            zones: Some(vec!["zone-1".to_string()]),
        });
        registry.upsert_claim(PersistentVolumeClaim {
            name: "data".to_string(),
            namespace: "default".to_string(),
            storage_class: Some("zonal".to_string()),
            volume_name: None,
            phase: ClaimPhase::Pending,
        });
        let mut pod = pod_with_claim();
        pod.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required: vec![
                    NodeSelectorTerm {
                        match_expressions: vec![Requirement::in_values("disk", &["ssd"])],
                    },
                    NodeSelectorTerm {
                        match_expressions: vec![Requirement::in_values("disk", &["hdd"])],
                    },
                ],
                preferred: vec![],
            }),
            ..Default::default()
        });
        VolumeTopology::new(registry).inject(&mut pod).unwrap();

        let terms = &pod.affinity.as_ref().unwrap().node_affinity.as_ref().unwrap().required;
        for term in terms {
            assert!(term.match_expressions.iter().any(|r| r.key == ZONE_LABEL));
        }
    }

    #[test]
    fn test_missing_claim_rejects_pod() {
        let registry = Registry::new();
        let mut pod = pod_with_claim();
        let err = VolumeTopology::new(registry).inject(&mut pod).unwrap_err();
        assert!(matches!(err, VolumeTopologyError::MissingClaim { .. }));
    }

    #[test]
    fn test_unbound_claim_with_missing_class_rejects_pod() {
        let registry = Registry::new();
        registry.upsert_claim(PersistentVolumeClaim {
            name: "data".to_string(),
            namespace: "default".to_string(),
            storage_class: Some("gone".to_string()),
            volume_name: None,
            phase: ClaimPhase::Pending,
        });
        let mut pod = pod_with_claim();
        let err = VolumeTopology::new(registry).inject(&mut pod).unwrap_err();
        assert!(matches!(err, VolumeTopologyError::MissingStorageClass { .. }));
    }
}
