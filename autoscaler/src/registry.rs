use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use models::condition::Condition;
use models::nodeclaim::NodeClaim;
use models::nodepool::NodePool;
use models::overlay::NodeOverlay;
use models::pod::{Pod, PodPhase};
use models::volume::{PersistentVolume, PersistentVolumeClaim, StorageClass};

/// In-memory registry of API objects, standing in for the informer cache a
/// controller would normally read through.
#[derive(Clone)]
pub struct Registry {
    pub pods: Arc<Mutex<HashMap<String, Pod>>>,
    pub nodepools: Arc<Mutex<HashMap<String, NodePool>>>,
    pub overlays: Arc<Mutex<HashMap<String, NodeOverlay>>>,
    pub node_claims: Arc<Mutex<HashMap<String, NodeClaim>>>,
    pub claims: Arc<Mutex<HashMap<String, PersistentVolumeClaim>>>,
    pub volumes: Arc<Mutex<HashMap<String, PersistentVolume>>>,
    pub storage_classes: Arc<Mutex<HashMap<String, StorageClass>>>,
    synced: Arc<AtomicBool>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            pods: Arc::new(Mutex::new(HashMap::new())),
            nodepools: Arc::new(Mutex::new(HashMap::new())),
            overlays: Arc::new(Mutex::new(HashMap::new())),
            node_claims: Arc::new(Mutex::new(HashMap::new())),
            claims: Arc::new(Mutex::new(HashMap::new())),
            volumes: Arc::new(Mutex::new(HashMap::new())),
            storage_classes: Arc::new(Mutex::new(HashMap::new())),
            synced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flipped once the initial object lists have been populated; gates the
    /// first provisioning pass.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn upsert_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(pod.uid.clone(), pod);
    }

    pub fn get_pod(&self, uid: &str) -> Option<Pod> {
        self.pods.lock().unwrap().get(uid).cloned()
    }

    pub fn delete_pod(&self, uid: &str) {
        self.pods.lock().unwrap().remove(uid);
    }

    /// Pods that want a node: pending, unbound, and not daemonset-owned.
    pub fn list_provisionable_pods(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|p| {
                p.phase == PodPhase::Pending && p.node_name.is_none() && !p.owner_daemonset
            })
            .cloned()
            .collect();
        pods.sort_by(|a, b| a.uid.cmp(&b.uid));
        pods
    }

    pub fn list_daemon_pods(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.owner_daemonset)
            .cloned()
            .collect();
        pods.sort_by(|a, b| a.uid.cmp(&b.uid));
        pods
    }

    /// Running pods bound to one of the given nodes.
    pub fn list_pods_on_nodes(&self, node_names: &[String]) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|p| {
                p.node_name
                    .as_ref()
                    .map(|n| node_names.contains(n))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        pods.sort_by(|a, b| a.uid.cmp(&b.uid));
        pods
    }

    pub fn upsert_nodepool(&self, nodepool: NodePool) {
        self.nodepools
            .lock()
            .unwrap()
            .insert(nodepool.name.clone(), nodepool);
    }

    pub fn get_nodepool(&self, name: &str) -> Option<NodePool> {
        self.nodepools.lock().unwrap().get(name).cloned()
    }

    /// All node pools, heaviest first, ties broken by name for stability.
    pub fn list_nodepools(&self) -> Vec<NodePool> {
        let mut pools: Vec<NodePool> = self.nodepools.lock().unwrap().values().cloned().collect();
        pools.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));
        pools
    }

    pub fn upsert_overlay(&self, overlay: NodeOverlay) {
        self.overlays
            .lock()
            .unwrap()
            .insert(overlay.name.clone(), overlay);
    }

    pub fn get_overlay(&self, name: &str) -> Option<NodeOverlay> {
        self.overlays.lock().unwrap().get(name).cloned()
    }

    pub fn list_overlays(&self) -> Vec<NodeOverlay> {
        let mut overlays: Vec<NodeOverlay> = self.overlays.lock().unwrap().values().cloned().collect();
        overlays.sort_by(|a, b| a.name.cmp(&b.name));
        overlays
    }

    /// Writes an overlay status condition. Returns false when the overlay
    /// vanished underneath us, which callers treat as a request to requeue.
    pub fn set_overlay_condition(&self, name: &str, condition: Condition) -> bool {
        let mut overlays = self.overlays.lock().unwrap();
        match overlays.get_mut(name) {
            Some(overlay) => {
                models::condition::set_condition(&mut overlay.status.conditions, condition);
                true
            }
            None => false,
        }
    }

    pub fn upsert_node_claim(&self, claim: NodeClaim) {
        self.node_claims
            .lock()
            .unwrap()
            .insert(claim.name.clone(), claim);
    }

    pub fn list_node_claims(&self) -> Vec<NodeClaim> {
        let mut claims: Vec<NodeClaim> = self.node_claims.lock().unwrap().values().cloned().collect();
        claims.sort_by(|a, b| a.name.cmp(&b.name));
        claims
    }

    pub fn upsert_claim(&self, claim: PersistentVolumeClaim) {
        let key = format!("{}/{}", claim.namespace, claim.name);
        self.claims.lock().unwrap().insert(key, claim);
    }

    pub fn get_claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.claims
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    pub fn upsert_volume(&self, volume: PersistentVolume) {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.name.clone(), volume);
    }

    pub fn get_volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.lock().unwrap().get(name).cloned()
    }

    pub fn upsert_storage_class(&self, class: StorageClass) {
        self.storage_classes
            .lock()
            .unwrap()
            .insert(class.name.clone(), class);
    }

    pub fn get_storage_class(&self, name: &str) -> Option<StorageClass> {
        self.storage_classes.lock().unwrap().get(name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
