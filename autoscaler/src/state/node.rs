use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use models::labels::NODEPOOL_LABEL;
use models::nodeclaim::NodeClaim;
use models::pod::Taint;
use models::requirements::Requirements;
use models::resources::Resources;

/// In-memory projection of a live or pending node. Not an API object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateNode {
    pub name: String,
    pub nodepool: Option<String>,
    pub instance_type: Option<String>,
    pub labels: HashMap<String, String>,
    pub taints: Vec<Taint>,
    pub capacity: Resources,
    pub allocatable: Resources,
    /// Resources claimed by daemonset pods on this node.
    pub daemonset_requested: Resources,
    /// Resources claimed by regular pods on this node.
    pub pod_requested: Resources,
    pub pod_uids: HashSet<String>,
    /// Resources this node counts against its pool's limits: the claim's
    /// requests while pending, the node capacity once realized.
    pub provisioned: Resources,
    pub initialized: bool,
    pub marked_for_deletion: bool,
    pub cordoned: bool,
}

impl StateNode {
    pub fn new(name: &str, capacity: Resources, allocatable: Resources) -> Self {
        Self {
            name: name.to_string(),
            nodepool: None,
            instance_type: None,
            labels: HashMap::new(),
            taints: Vec::new(),
            provisioned: capacity.clone(),
            capacity,
            allocatable,
            daemonset_requested: Resources::default(),
            pod_requested: Resources::default(),
            pod_uids: HashSet::new(),
            initialized: true,
            marked_for_deletion: false,
            cordoned: false,
        }
    }

    /// Projects a freshly created claim. Pending claims count their
    /// aggregated requests against pool limits and accept no further pods
    /// until the real node registers.
    pub fn from_claim(claim: &NodeClaim) -> Self {
        let mut labels = claim.labels.clone();
        labels.insert(NODEPOOL_LABEL.to_string(), claim.nodepool.clone());
        // Requirements pinned to a single value become labels the node is
        // guaranteed to carry.
        let requirements = Requirements::from_requirements(&claim.requirements);
        for (key, requirement) in requirements.iter() {
            if let Some(value) = requirement.single_value() {
                labels.entry(key.clone()).or_insert_with(|| value.to_string());
            }
        }
        Self {
            name: claim.name.clone(),
            nodepool: Some(claim.nodepool.clone()),
            instance_type: None,
            labels,
            taints: claim.taints.clone(),
            capacity: claim.resources.clone(),
            allocatable: claim.resources.clone(),
            daemonset_requested: Resources::default(),
            pod_requested: claim.resources.clone(),
            pod_uids: claim.pod_uids.iter().cloned().collect(),
            provisioned: claim.resources.clone(),
            initialized: false,
            marked_for_deletion: false,
            cordoned: false,
        }
    }

    /// What is left for new pods after daemonsets and bound pods.
    pub fn available(&self) -> Resources {
        let mut available = self.allocatable.clone();
        available.sub(&self.daemonset_requested);
        available.sub(&self.pod_requested);
        available
    }

    pub fn schedulable(&self) -> bool {
        self.initialized && !self.marked_for_deletion && !self.cordoned
    }

    pub fn add_pod(&mut self, uid: &str, requests: &Resources) {
        if self.pod_uids.insert(uid.to_string()) {
            self.pod_requested.add(requests);
        }
    }

    pub fn remove_pod(&mut self, uid: &str, requests: &Resources) {
        if self.pod_uids.remove(uid) {
            self.pod_requested.sub(requests);
        }
    }
}
