use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::{condition_is_true, Condition, CONDITION_NODE_CLASS_READY, CONDITION_NODE_REGISTRATION_HEALTHY, CONDITION_READY};
use crate::pod::Taint;
use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;

/// A template producing future nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePool {
    pub uid: String,
    pub name: String,
    /// Higher weight is considered first when scheduling.
    pub weight: i32,
    pub kind: NodePoolKind,
    pub requirements: Vec<Requirement>,
    pub template: NodeTemplate,
    /// Caps on the total resources of claims plus nodes owned by this pool.
    pub limits: Option<Resources>,
    pub status: NodePoolStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePoolKind {
    /// The provisioner may create nodes on demand.
    Dynamic,
    /// A fixed replica count managed by reservation counters; excluded from
    /// dynamic scheduling.
    Static { replicas: i32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    pub node_class_ref: NodeClassRef,
    pub expire_after_seconds: Option<i64>,
    pub termination_grace_period_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeClassRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePoolStatus {
    pub conditions: Vec<Condition>,
}

impl NodePool {
    pub fn new(name: &str, weight: i32) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            weight,
            kind: NodePoolKind::Dynamic,
            requirements: Vec::new(),
            template: NodeTemplate::default(),
            limits: None,
            status: NodePoolStatus::default(),
            created_at: Utc::now(),
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self.kind, NodePoolKind::Static { .. })
    }

    pub fn is_ready(&self) -> bool {
        condition_is_true(&self.status.conditions, CONDITION_READY)
            && condition_is_true(&self.status.conditions, CONDITION_NODE_CLASS_READY)
    }

    pub fn registration_healthy(&self) -> bool {
        condition_is_true(&self.status.conditions, CONDITION_NODE_REGISTRATION_HEALTHY)
    }

    /// The pool's scheduling requirements: authored requirements
    /// intersected with its template labels and identity label.
    pub fn scheduling_requirements(&self) -> Requirements {
        let mut reqs = Requirements::from_labels(&self.template.labels);
        for req in &self.requirements {
            reqs.add_requirement(req);
        }
        reqs.add_requirement(&Requirement::in_values(
            crate::labels::NODEPOOL_LABEL,
            &[self.name.as_str()],
        ));
        reqs
    }

    /// Whether the pool's template carries a PreferNoSchedule taint; such
    /// pools are only used once every other option is exhausted.
    pub fn prefers_no_schedule(&self) -> bool {
        self.template
            .taints
            .iter()
            .any(|t| t.effect == crate::pod::TaintEffect::PreferNoSchedule)
    }
}
