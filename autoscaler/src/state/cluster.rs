use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use models::nodeclaim::NodeClaim;
use models::resources::Resources;

use super::node::StateNode;

/// Immutable copy of the node tables, split by lifecycle.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Usable for placement.
    pub active: Vec<StateNode>,
    /// Being drained; their pods must be rescheduled.
    pub deleting: Vec<StateNode>,
}

/// Recorded outcome of a scheduling pass for one pod.
#[derive(Debug, Clone)]
pub struct PodDecision {
    pub decided_at: DateTime<Utc>,
    pub success_at: Option<DateTime<Utc>>,
    /// Set only when the pod was scheduled against a node pool whose
    /// registration-health condition was true at decision time.
    pub healthy_success_at: Option<DateTime<Utc>>,
    pub nodepool: Option<String>,
    pub node: Option<String>,
    pub error: Option<String>,
}

/// The one cross-pass shared mutable structure: an in-memory projection of
/// nodes, pending claims, pod ownership and per-pool accounting.
pub struct ClusterState {
    nodes: RwLock<HashMap<String, StateNode>>,
    pod_to_claim: RwLock<HashMap<String, String>>,
    acked_pods: RwLock<HashSet<String>>,
    decisions: RwLock<HashMap<String, PodDecision>>,
    /// Reservation counters for static node pools, keyed by pool name.
    reservations: DashMap<String, i64>,
    /// Consecutive launch failures per node pool.
    launch_failures: DashMap<String, u32>,
    synced: AtomicBool,
    consolidated: AtomicBool,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            pod_to_claim: RwLock::new(HashMap::new()),
            acked_pods: RwLock::new(HashSet::new()),
            decisions: RwLock::new(HashMap::new()),
            reservations: DashMap::new(),
            launch_failures: DashMap::new(),
            synced: AtomicBool::new(false),
            consolidated: AtomicBool::new(false),
        }
    }

    /// Gates scheduling until the informer layer has reported once.
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn snapshot_nodes(&self) -> Snapshot {
        let nodes = self.nodes.read().unwrap();
        let mut snapshot = Snapshot::default();
        for node in nodes.values() {
            if node.marked_for_deletion {
                snapshot.deleting.push(node.clone());
            } else {
                snapshot.active.push(node.clone());
            }
        }
        snapshot.active.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.deleting.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    pub fn update_node(&self, node: StateNode) {
        self.nodes.write().unwrap().insert(node.name.clone(), node);
    }

    /// Inserts a freshly created claim immediately so the next pass sees it
    /// without waiting for the informer cache.
    pub fn update_node_claim(&self, claim: &NodeClaim) {
        self.update_node(StateNode::from_claim(claim));
    }

    pub fn remove_node(&self, name: &str) {
        self.nodes.write().unwrap().remove(name);
    }

    pub fn get_node(&self, name: &str) -> Option<StateNode> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    pub fn update_pod_to_node_claim_mapping(&self, pod_uid: &str, claim_name: &str) {
        self.pod_to_claim
            .write()
            .unwrap()
            .insert(pod_uid.to_string(), claim_name.to_string());
    }

    /// The claim a pod is already destined for, when that claim still
    /// exists in the node tables.
    pub fn claim_for_pod(&self, pod_uid: &str) -> Option<String> {
        let mapping = self.pod_to_claim.read().unwrap();
        let claim = mapping.get(pod_uid)?;
        if self.nodes.read().unwrap().contains_key(claim) {
            Some(claim.clone())
        } else {
            None
        }
    }

    pub fn ack_pods(&self, pod_uids: &[String]) {
        let mut acked = self.acked_pods.write().unwrap();
        for uid in pod_uids {
            acked.insert(uid.clone());
        }
    }

    pub fn is_acked(&self, pod_uid: &str) -> bool {
        self.acked_pods.read().unwrap().contains(pod_uid)
    }

    /// Resources attributable to in-flight claims and live nodes of a pool,
    /// used for limit enforcement.
    pub fn nodepool_resources_for(&self, nodepool: &str) -> Resources {
        let nodes = self.nodes.read().unwrap();
        let mut total = Resources::default();
        for node in nodes.values() {
            if node.nodepool.as_deref() == Some(nodepool) {
                total.add(&node.provisioned);
            }
        }
        total
    }

    /// Records per-pod outcomes of one scheduling pass.
    ///
    /// `by_nodepool` lists (pod uid, pool name, pool registration-healthy)
    /// for pods placed on new claims; `by_existing_node` lists
    /// (pod uid, node name) for pods bound to live nodes.
    pub fn mark_pod_scheduling_decisions(
        &self,
        errors: &HashMap<String, String>,
        by_nodepool: &[(String, String, bool)],
        by_existing_node: &[(String, String)],
    ) {
        let now = Utc::now();
        let mut decisions = self.decisions.write().unwrap();
        for (uid, message) in errors {
            decisions.insert(
                uid.clone(),
                PodDecision {
                    decided_at: now,
                    success_at: None,
                    healthy_success_at: None,
                    nodepool: None,
                    node: None,
                    error: Some(message.clone()),
                },
            );
        }
        for (uid, nodepool, healthy) in by_nodepool {
            decisions.insert(
                uid.clone(),
                PodDecision {
                    decided_at: now,
                    success_at: Some(now),
                    healthy_success_at: if *healthy { Some(now) } else { None },
                    nodepool: Some(nodepool.clone()),
                    node: None,
                    error: None,
                },
            );
        }
        for (uid, node) in by_existing_node {
            decisions.insert(
                uid.clone(),
                PodDecision {
                    decided_at: now,
                    success_at: Some(now),
                    healthy_success_at: None,
                    nodepool: None,
                    node: Some(node.clone()),
                    error: None,
                },
            );
        }
    }

    pub fn pod_scheduling_decision_time(&self, pod_uid: &str) -> Option<DateTime<Utc>> {
        self.decisions
            .read()
            .unwrap()
            .get(pod_uid)
            .map(|d| d.decided_at)
    }

    pub fn pod_scheduling_success_time(&self, pod_uid: &str) -> Option<DateTime<Utc>> {
        self.decisions
            .read()
            .unwrap()
            .get(pod_uid)
            .and_then(|d| d.success_at)
    }

    pub fn pod_scheduling_success_time_registration_healthy(
        &self,
        pod_uid: &str,
    ) -> Option<DateTime<Utc>> {
        self.decisions
            .read()
            .unwrap()
            .get(pod_uid)
            .and_then(|d| d.healthy_success_at)
    }

    pub fn pod_decision(&self, pod_uid: &str) -> Option<PodDecision> {
        self.decisions.read().unwrap().get(pod_uid).cloned()
    }

    /// Reserves `count` future nodes for a static pool.
    pub fn reserve_node_count(&self, nodepool: &str, count: i64) {
        *self.reservations.entry(nodepool.to_string()).or_insert(0) += count;
    }

    /// Gives reservations back; called on both success and failure of a
    /// static-pool creation so retries stay possible.
    pub fn release_node_count(&self, nodepool: &str, count: i64) {
        let mut entry = self.reservations.entry(nodepool.to_string()).or_insert(0);
        *entry = (*entry - count).max(0);
    }

    pub fn reserved_node_count(&self, nodepool: &str) -> i64 {
        self.reservations.get(nodepool).map(|e| *e).unwrap_or(0)
    }

    pub fn record_launch_failure(&self, nodepool: &str) {
        *self.launch_failures.entry(nodepool.to_string()).or_insert(0) += 1;
    }

    pub fn record_launch_success(&self, nodepool: &str) {
        self.launch_failures.remove(nodepool);
    }

    pub fn consecutive_launch_failures(&self, nodepool: &str) -> u32 {
        self.launch_failures.get(nodepool).map(|e| *e).unwrap_or(0)
    }

    pub fn stats(&self) -> ClusterStateStats {
        let nodes = self.nodes.read().unwrap();
        let uninitialized = nodes.values().filter(|n| !n.initialized).count();
        let deleting = nodes.values().filter(|n| n.marked_for_deletion).count();
        ClusterStateStats {
            nodes: nodes.len(),
            uninitialized_nodes: uninitialized,
            deleting_nodes: deleting,
            tracked_decisions: self.decisions.read().unwrap().len(),
        }
    }

    /// Cleared by the overlay validator after republishing pricing so the
    /// disruption layer re-evaluates consolidation opportunities.
    pub fn mark_unconsolidated(&self) {
        self.consolidated.store(false, Ordering::SeqCst);
    }

    pub fn mark_consolidated(&self) {
        self.consolidated.store(true, Ordering::SeqCst);
    }

    pub fn is_consolidated(&self) -> bool {
        self.consolidated.load(Ordering::SeqCst)
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ClusterStateStats {
    pub nodes: usize,
    pub uninitialized_nodes: usize,
    pub deleting_nodes: usize,
    pub tracked_decisions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::requirements::Requirement;

    #[test]
    fn test_snapshot_splits_deleting_nodes() {
        let cluster = ClusterState::new();
        let mut draining = StateNode::new(
            "node-b",
            Resources::new(2000, 8 << 30),
            Resources::new(2000, 8 << 30),
        );
        draining.marked_for_deletion = true;
        cluster.update_node(StateNode::new(
            "node-a",
            Resources::new(2000, 8 << 30),
            Resources::new(2000, 8 << 30),
        ));
        cluster.update_node(draining);

        let snapshot = cluster.snapshot_nodes();
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.deleting.len(), 1);
        assert_eq!(snapshot.deleting[0].name, "node-b");
    }

    #[test]
    fn test_nodepool_resources_sum_claims_and_nodes() {
        let cluster = ClusterState::new();
        let mut claim = NodeClaim::new("default");
        claim.resources = Resources::new(1000, 4 << 30);
        claim.requirements = vec![Requirement::in_values(models::labels::ZONE_LABEL, &["zone-a"])];
        cluster.update_node_claim(&claim);

        let mut node = StateNode::new(
            "node-a",
            Resources::new(2000, 8 << 30),
            Resources::new(2000, 8 << 30),
        );
        node.nodepool = Some("default".to_string());
        cluster.update_node(node);

        let total = cluster.nodepool_resources_for("default");
        assert_eq!(total.cpu_millis, 3000);
        assert!(cluster.nodepool_resources_for("other").is_zero());
    }

    #[test]
    fn test_claim_mapping_requires_live_claim() {
        let cluster = ClusterState::new();
        let mut claim = NodeClaim::new("default");
        claim.resources = Resources::new(500, 1 << 30);
        cluster.update_node_claim(&claim);
        cluster.update_pod_to_node_claim_mapping("pod-1", &claim.name);
        assert_eq!(cluster.claim_for_pod("pod-1"), Some(claim.name.clone()));

        cluster.remove_node(&claim.name);
        assert_eq!(cluster.claim_for_pod("pod-1"), None);
    }

    #[test]
    fn test_reservation_counters_clamp_at_zero() {
        let cluster = ClusterState::new();
        cluster.reserve_node_count("static-pool", 2);
        cluster.release_node_count("static-pool", 5);
        assert_eq!(cluster.reserved_node_count("static-pool"), 0);
    }

    #[test]
    fn test_scheduling_decision_timestamps() {
        let cluster = ClusterState::new();
        let errors = HashMap::from([("pod-err".to_string(), "no capacity".to_string())]);
        cluster.mark_pod_scheduling_decisions(
            &errors,
            &[("pod-ok".to_string(), "default".to_string(), true)],
            &[("pod-existing".to_string(), "node-a".to_string())],
        );

        assert!(cluster.pod_scheduling_decision_time("pod-err").is_some());
        assert!(cluster.pod_scheduling_success_time("pod-err").is_none());
        assert!(cluster
            .pod_scheduling_success_time_registration_healthy("pod-ok")
            .is_some());
        assert!(cluster
            .pod_scheduling_success_time_registration_healthy("pod-existing")
            .is_none());
        assert!(cluster.pod_scheduling_success_time("pod-existing").is_some());
    }
}
