use serde::{Deserialize, Serialize};

use crate::requirements::Requirement;

/// The subset of the storage API the scheduler consults when deriving node
/// topology from a pod's volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageClass {
    pub name: String,
    pub provisioner: String,
    /// Zones the provisioner can create volumes in, when restricted.
    pub zones: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub name: String,
    /// Node affinity the volume demands of any node mounting it.
    pub node_affinity: Vec<Requirement>,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    Local { path: String },
    HostPath { path: String },
    Csi { driver: String },
}

impl VolumeSource {
    /// Local and host-path volumes are pinned to a machine; their hostname
    /// affinity cannot constrain a node that does not exist yet.
    pub fn is_node_local(&self) -> bool {
        matches!(self, VolumeSource::Local { .. } | VolumeSource::HostPath { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentVolumeClaim {
    pub name: String,
    pub namespace: String,
    pub storage_class: Option<String>,
    /// Set when the claim is bound to a volume.
    pub volume_name: Option<String>,
    pub phase: ClaimPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
}

impl PersistentVolumeClaim {
    pub fn is_bound(&self) -> bool {
        self.phase == ClaimPhase::Bound && self.volume_name.is_some()
    }
}
