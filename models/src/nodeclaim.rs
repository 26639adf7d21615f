use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::nodepool::NodeClassRef;
use crate::pod::Taint;
use crate::requirements::Requirement;
use crate::resources::Resources;

/// A request for one future node, emitted by the provisioner. Creation is
/// the core's terminal step; external lifecycle controllers take over from
/// there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeClaim {
    pub uid: String,
    pub name: String,
    pub nodepool: String,
    pub nodepool_uid: String,
    pub node_class_ref: NodeClassRef,
    /// The intersected scheduling requirements, including an `In`
    /// requirement over the surviving compatible instance-type names.
    pub requirements: Vec<Requirement>,
    /// Aggregated requests of the bound pods plus daemonset overhead.
    pub resources: Resources,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    /// Pod uids this claim was created to host.
    pub pod_uids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl NodeClaim {
    pub fn new(nodepool: &str) -> Self {
        let uid = Uuid::new_v4().to_string();
        Self {
            name: format!("{}-{}", nodepool, &uid[..8]),
            uid,
            nodepool: nodepool.to_string(),
            nodepool_uid: String::new(),
            node_class_ref: NodeClassRef::default(),
            requirements: Vec::new(),
            resources: Resources::default(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            taints: Vec::new(),
            startup_taints: Vec::new(),
            pod_uids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn min_values_relaxed(&self) -> bool {
        self.annotations
            .get(crate::labels::MIN_VALUES_RELAXED_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}
