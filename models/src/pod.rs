use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub containers: Vec<Container>,
    pub init_containers: Vec<Container>,
    /// Pod-level resource requests; when present they override the
    /// container-derived aggregate outright.
    pub pod_level_requests: Option<Resources>,
    pub node_selector: HashMap<String, String>,
    pub affinity: Option<Affinity>,
    pub topology_spread: Vec<TopologySpreadConstraint>,
    pub tolerations: Vec<Toleration>,
    /// Names of referenced persistent volume claims in this namespace.
    pub volume_claims: Vec<String>,
    /// Set for pods owned by a daemonset; they contribute overhead instead
    /// of being scheduled themselves.
    pub owner_daemonset: bool,
    pub node_name: Option<String>,
    pub phase: PodPhase,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub requests: Resources,
    /// Sidecar init containers run for the pod's whole lifetime and count
    /// like regular containers.
    pub restart_always: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Affinity {
    pub node_affinity: Option<NodeAffinity>,
    pub pod_affinity: Option<PodAffinity>,
    pub pod_anti_affinity: Option<PodAffinity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeAffinity {
    /// OR-branches; the scheduler works on the last branch and relaxes by
    /// dropping branches from the end, never dropping the final one.
    pub required: Vec<NodeSelectorTerm>,
    pub preferred: Vec<WeightedNodeSelectorTerm>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSelectorTerm {
    pub match_expressions: Vec<Requirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedNodeSelectorTerm {
    pub weight: i32,
    pub term: NodeSelectorTerm,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodAffinity {
    pub required: Vec<PodAffinityTerm>,
    pub preferred: Vec<WeightedPodAffinityTerm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    pub label_selector: HashMap<String, String>,
    pub topology_key: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedPodAffinityTerm {
    pub weight: i32,
    pub term: PodAffinityTerm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    pub max_skew: i64,
    pub topology_key: String,
    pub when_unsatisfiable: UnsatisfiablePolicy,
    pub label_selector: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsatisfiablePolicy {
    DoNotSchedule,
    ScheduleAnyway,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toleration {
    pub key: Option<String>,
    pub operator: TolerationOperator,
    pub value: Option<String>,
    pub effect: Option<TaintEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    Exists,
    Equal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: Option<String>,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match &self.key {
            // Empty key with Exists tolerates everything.
            None => self.operator == TolerationOperator::Exists,
            Some(key) => {
                if key != &taint.key {
                    return false;
                }
                match self.operator {
                    TolerationOperator::Exists => true,
                    TolerationOperator::Equal => self.value == taint.value,
                }
            }
        }
    }
}

/// Whether a pod's tolerations cover every hard taint on a node. The
/// PreferNoSchedule effect never blocks placement.
pub fn tolerates_all(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .filter(|t| t.effect != TaintEffect::PreferNoSchedule)
        .all(|taint| tolerations.iter().any(|tol| tol.tolerates(taint)))
}

impl Pod {
    pub fn new(name: &str, namespace: &str, requests: Resources) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            containers: vec![Container {
                name: "main".to_string(),
                requests,
                restart_always: false,
            }],
            init_containers: Vec::new(),
            pod_level_requests: None,
            node_selector: HashMap::new(),
            affinity: None,
            topology_spread: Vec::new(),
            tolerations: Vec::new(),
            volume_claims: Vec::new(),
            owner_daemonset: false,
            node_name: None,
            phase: PodPhase::Pending,
            created_at: Utc::now(),
        }
    }

    /// Effective resource requests: pod-level requests when present,
    /// otherwise max(sum of long-running containers, largest one-shot init
    /// container), plus one pod slot.
    pub fn effective_requests(&self) -> Resources {
        let mut requests = match &self.pod_level_requests {
            Some(pod_level) => pod_level.clone(),
            None => {
                let mut running = Resources::sum(self.containers.iter().map(|c| &c.requests));
                for sidecar in self.init_containers.iter().filter(|c| c.restart_always) {
                    running.add(&sidecar.requests);
                }
                let mut peak = running;
                for init in self.init_containers.iter().filter(|c| !c.restart_always) {
                    peak = peak.max_parts(&init.requests);
                }
                peak
            }
        };
        requests.pods = requests.pods.max(1);
        requests
    }

    /// The node requirements currently in force for this pod: node selector
    /// plus the active (last) required node-affinity branch.
    pub fn scheduling_requirements(&self) -> Requirements {
        let mut reqs = Requirements::from_labels(&self.node_selector);
        if let Some(node_affinity) = self.affinity.as_ref().and_then(|a| a.node_affinity.as_ref()) {
            if let Some(term) = node_affinity.required.last() {
                for expr in &term.match_expressions {
                    reqs.add_requirement(expr);
                }
            }
        }
        reqs
    }

    /// Preferred node-affinity terms, heaviest first.
    pub fn preferred_requirements(&self) -> Vec<&WeightedNodeSelectorTerm> {
        let mut terms: Vec<&WeightedNodeSelectorTerm> = self
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .map(|na| na.preferred.iter().collect())
            .unwrap_or_default();
        terms.sort_by(|a, b| b.weight.cmp(&a.weight));
        terms
    }

    pub fn matches_selector(&self, selector: &HashMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_requests_init_container_peak() {
        let mut pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        pod.init_containers.push(Container {
            name: "migrate".to_string(),
            requests: Resources::new(2000, 256 << 20),
            restart_always: false,
        });
        let requests = pod.effective_requests();
        // Init CPU dominates, steady-state memory dominates.
        assert_eq!(requests.cpu_millis, 2000);
        assert_eq!(requests.memory_bytes, 1 << 30);
        assert_eq!(requests.pods, 1);
    }

    #[test]
    fn test_effective_requests_sidecar_counts_as_running() {
        let mut pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        pod.init_containers.push(Container {
            name: "proxy".to_string(),
            requests: Resources::new(100, 64 << 20),
            restart_always: true,
        });
        assert_eq!(pod.effective_requests().cpu_millis, 600);
    }

    #[test]
    fn test_pod_level_requests_override() {
        let mut pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        pod.pod_level_requests = Some(Resources::new(750, 2 << 30));
        assert_eq!(pod.effective_requests().cpu_millis, 750);
    }

    #[test]
    fn test_wildcard_toleration() {
        let tolerate_all = Toleration {
            key: None,
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        };
        let taint = Taint {
            key: "dedicated".to_string(),
            value: Some("infra".to_string()),
            effect: TaintEffect::NoSchedule,
        };
        assert!(tolerate_all.tolerates(&taint));
        assert!(tolerates_all(&[], &[]));
        assert!(!tolerates_all(&[], &[taint]));
    }

    #[test]
    fn test_prefer_no_schedule_never_blocks() {
        let soft = Taint {
            key: "flaky".to_string(),
            value: None,
            effect: TaintEffect::PreferNoSchedule,
        };
        assert!(tolerates_all(&[], &[soft]));
    }
}
