use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use models::condition::{
    Condition, ConditionStatus, CONDITION_VALIDATION_SUCCEEDED, REASON_CONFLICT,
    REASON_RUNTIME_VALIDATION,
};
use models::instance_type::InstanceType;
use models::labels::NODEPOOL_LABEL;
use models::nodepool::NodePool;
use models::overlay::NodeOverlay;
use models::requirements::{Operator, Requirement, Requirements};

use crate::providers::{CloudProvider, ProviderError};
use crate::registry::Registry;
use crate::state::cluster::ClusterState;

use super::store::{CapacityUpdate, InstanceTypeStore, OverlayTable, PriceUpdate};

/// Re-validate everything this often even when nothing changed; catches
/// silent cloud-side instance-type list changes.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Why an overlay was rejected this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rejection {
    RuntimeValidation(String),
    Conflict(String),
}

/// Reconciles the overlay universe into the instance-type store.
///
/// Overlays are processed in weight-descending order (names break ties) and
/// each overlay is applied in two passes: a validation pass across every
/// (node pool, instance type, offering) it selects, then a store pass only
/// if no target conflicted. An overlay is therefore reflected everywhere it
/// selects or nowhere.
pub struct OverlayValidator {
    registry: Registry,
    store: Arc<InstanceTypeStore>,
    cluster: Arc<ClusterState>,
    provider: Arc<dyn CloudProvider>,
}

impl OverlayValidator {
    pub fn new(
        registry: Registry,
        store: Arc<InstanceTypeStore>,
        cluster: Arc<ClusterState>,
        provider: Arc<dyn CloudProvider>,
    ) -> Self {
        Self {
            registry,
            store,
            cluster,
            provider,
        }
    }

    /// One full reconcile cycle. Returns the delay until the next one.
    pub async fn reconcile(&self) -> Result<Duration, OverlayError> {
        let mut overlays = self.registry.list_overlays();
        overlays.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.name.cmp(&b.name)));

        let nodepools = self.registry.list_nodepools();
        let mut pool_instance_types: Vec<(NodePool, Vec<InstanceType>)> = Vec::new();
        let mut table = OverlayTable::default();
        for pool in nodepools {
            let instance_types = self.provider.get_instance_types(&pool).await?;
            table.evaluated.insert(pool.name.clone());
            pool_instance_types.push((pool, instance_types));
        }

        let mut outcomes: Vec<(String, Option<Rejection>)> = Vec::new();
        for overlay in &overlays {
            let outcome = match validate_static(overlay) {
                Err(reason) => Some(Rejection::RuntimeValidation(reason)),
                Ok(()) => match find_conflict(overlay, &pool_instance_types, &table) {
                    Some(conflicting) => Some(Rejection::Conflict(conflicting)),
                    None => {
                        store_overlay(overlay, &pool_instance_types, &mut table);
                        None
                    }
                },
            };
            outcomes.push((overlay.name.clone(), outcome));
        }

        self.store.update_store(table);

        let mut requeue_now = false;
        for (name, outcome) in outcomes {
            let condition = match &outcome {
                None => Condition::new(CONDITION_VALIDATION_SUCCEEDED, ConditionStatus::True),
                Some(Rejection::RuntimeValidation(reason)) => {
                    warn!(overlay = %name, %reason, "overlay failed static validation");
                    Condition::new(CONDITION_VALIDATION_SUCCEEDED, ConditionStatus::False)
                        .with_reason(REASON_RUNTIME_VALIDATION, reason)
                }
                Some(Rejection::Conflict(other)) => {
                    warn!(overlay = %name, conflicts_with = %other, "overlay conflicts");
                    Condition::new(CONDITION_VALIDATION_SUCCEEDED, ConditionStatus::False)
                        .with_reason(
                            REASON_CONFLICT,
                            &format!("conflicts with overlay {}", other),
                        )
                }
            };
            if !self.registry.set_overlay_condition(&name, condition) {
                // The overlay vanished mid-cycle; a concurrent mutation
                // implies revalidation is needed anyway.
                requeue_now = true;
            }
        }

        // New pricing can open consolidation opportunities.
        self.cluster.mark_unconsolidated();

        if requeue_now {
            return Ok(Duration::ZERO);
        }
        info!(overlays = overlays.len(), "overlay validation cycle complete");
        Ok(RESYNC_INTERVAL)
    }

    /// Drives reconcile cycles forever; a single in-flight cycle at a time
    /// since each one revalidates the entire overlay universe.
    pub async fn run(&self) {
        loop {
            let delay = match self.reconcile().await {
                Ok(delay) => delay,
                Err(error) => {
                    warn!(%error, "overlay reconcile failed; retrying shortly");
                    Duration::from_secs(10)
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}

/// Field-level validation independent of the cluster.
fn validate_static(overlay: &NodeOverlay) -> Result<(), String> {
    if overlay.price.is_some() && overlay.price_adjustment.is_some() {
        return Err("price and priceAdjustment are mutually exclusive".to_string());
    }
    if !overlay.adjusts_price() && !overlay.adjusts_capacity() {
        return Err("overlay adjusts neither price nor capacity".to_string());
    }
    if let Some(price) = overlay.price {
        if !price.is_finite() || price < 0.0 {
            return Err(format!("price {} is not a non-negative number", price));
        }
    }
    if let Some(delta) = overlay.price_adjustment {
        if !delta.is_finite() {
            return Err(format!("priceAdjustment {} is not a number", delta));
        }
    }
    for (key, quantity) in &overlay.capacity {
        if *quantity <= 0 {
            return Err(format!("capacity {} must be positive", key));
        }
    }
    for req in &overlay.requirements {
        match req.operator {
            Operator::In => {
                if req.values.is_empty() {
                    return Err(format!("requirement {} has operator In with no values", req.key));
                }
            }
            Operator::NotIn => {}
            Operator::Exists | Operator::DoesNotExist => {
                if !req.values.is_empty() {
                    return Err(format!(
                        "requirement {} takes no values with its operator",
                        req.key
                    ));
                }
            }
            Operator::Gt | Operator::Lt => {
                if req.values.len() != 1 || req.values[0].parse::<i64>().is_err() {
                    return Err(format!(
                        "requirement {} needs exactly one integer value",
                        req.key
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Whether the overlay selects this (pool, instance type) at all, and if
/// so, which offering keys it covers. Node pool labels, the pool identity
/// label and the instance type's inherent requirements together must be
/// compatible with the overlay's requirements; offerings match on their own
/// requirement sets.
fn selected_offerings(
    overlay_reqs: &Requirements,
    pool: &NodePool,
    instance_type: &InstanceType,
) -> Vec<String> {
    let mut target = Requirements::from_labels(&pool.template.labels);
    target.add_requirement(&Requirement::in_values(NODEPOOL_LABEL, &[pool.name.as_str()]));
    for req in &instance_type.requirements {
        target.add_requirement(req);
    }
    if !target.compatible_with(overlay_reqs) {
        return Vec::new();
    }
    instance_type
        .offerings
        .iter()
        .filter(|offering| offering.requirements().compatible_with(overlay_reqs))
        .map(|offering| offering.key())
        .collect()
}

/// Validation pass: the name of a stored overlay this one collides with,
/// if any target would conflict.
fn find_conflict(
    overlay: &NodeOverlay,
    pools: &[(NodePool, Vec<InstanceType>)],
    table: &OverlayTable,
) -> Option<String> {
    let overlay_reqs = Requirements::from_requirements(&overlay.requirements);
    for (pool, instance_types) in pools {
        for instance_type in instance_types {
            let offerings = selected_offerings(&overlay_reqs, pool, instance_type);
            if offerings.is_empty() {
                continue;
            }
            let Some(update) = table.update_for(&pool.name, &instance_type.name) else {
                continue;
            };
            if overlay.adjusts_price() {
                for key in &offerings {
                    if let Some(existing) = update.price.get(key) {
                        if existing.lowest_weight == overlay.weight {
                            return Some(existing.overlay.clone());
                        }
                    }
                }
            }
            if overlay.adjusts_capacity() {
                if let Some(existing) = &update.capacity {
                    let shares_key = overlay
                        .capacity
                        .keys()
                        .any(|key| existing.resources.contains_key(key));
                    if existing.lowest_weight == overlay.weight && shares_key {
                        return Some(existing.overlay.clone());
                    }
                }
            }
        }
    }
    None
}

/// Store pass: reflect the overlay on every target it selects. Slots
/// already owned by a heavier overlay are left alone; the lighter overlay
/// is merely ineffective there.
fn store_overlay(
    overlay: &NodeOverlay,
    pools: &[(NodePool, Vec<InstanceType>)],
    table: &mut OverlayTable,
) {
    let overlay_reqs = Requirements::from_requirements(&overlay.requirements);
    for (pool, instance_types) in pools {
        for instance_type in instance_types {
            let offerings = selected_offerings(&overlay_reqs, pool, instance_type);
            if offerings.is_empty() {
                continue;
            }
            let update = table.entry(&pool.name, &instance_type.name);
            if overlay.adjusts_price() {
                for key in offerings {
                    update.price.entry(key).or_insert_with(|| PriceUpdate {
                        price: overlay.price,
                        adjustment: overlay.price_adjustment,
                        lowest_weight: overlay.weight,
                        overlay: overlay.name.clone(),
                    });
                }
            }
            if overlay.adjusts_capacity() {
                match &mut update.capacity {
                    None => {
                        update.capacity = Some(CapacityUpdate {
                            resources: overlay.capacity.clone(),
                            lowest_weight: overlay.weight,
                            overlay: overlay.name.clone(),
                        });
                    }
                    Some(existing) => {
                        // Merge keys not already claimed by heavier
                        // overlays.
                        let mut contributed = false;
                        for (key, quantity) in &overlay.capacity {
                            if !existing.resources.contains_key(key) {
                                existing.resources.insert(key.clone(), *quantity);
                                contributed = true;
                            }
                        }
                        if contributed {
                            existing.lowest_weight = existing.lowest_weight.min(overlay.weight);
                            existing.overlay = overlay.name.clone();
                        }
                    }
                }
            }
        }
    }
}
