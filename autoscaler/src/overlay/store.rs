use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;

use models::instance_type::InstanceType;

/// A price override for one offering, recorded by the validator.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    /// Absolute replacement price. Exactly one of `price` and `adjustment`
    /// is set.
    pub price: Option<f64>,
    /// Signed additive delta on the current offering price.
    pub adjustment: Option<f64>,
    /// Weight of the overlay that wrote this entry; equal-weight writers
    /// for the same offering key are conflicts.
    pub lowest_weight: i64,
    pub overlay: String,
}

/// Extended-resource additions for one instance type.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityUpdate {
    pub resources: BTreeMap<String, i64>,
    /// The lowest overlay weight that contributed a key to this update.
    pub lowest_weight: i64,
    pub overlay: String,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceTypeUpdate {
    /// Price overrides keyed by offering identity
    /// (capacity-type/zone/reservation).
    pub price: HashMap<String, PriceUpdate>,
    pub capacity: Option<CapacityUpdate>,
}

/// The table the validator publishes: per node pool, per instance type,
/// the effective updates, plus the set of node pools the validator has
/// evaluated at all.
#[derive(Debug, Clone, Default)]
pub struct OverlayTable {
    pub updates: HashMap<String, HashMap<String, InstanceTypeUpdate>>,
    pub evaluated: HashSet<String>,
}

impl OverlayTable {
    pub fn update_for(&self, nodepool: &str, instance_type: &str) -> Option<&InstanceTypeUpdate> {
        self.updates.get(nodepool).and_then(|m| m.get(instance_type))
    }

    pub fn entry(&mut self, nodepool: &str, instance_type: &str) -> &mut InstanceTypeUpdate {
        self.updates
            .entry(nodepool.to_string())
            .or_default()
            .entry(instance_type.to_string())
            .or_default()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("node pool {0} has not been evaluated by the overlay store yet")]
pub struct UnevaluatedNodePool(pub String);

/// Read-through table of instance-type adjustments.
///
/// Readers are wait-free: the whole table is swapped atomically after the
/// validator rebuilds it, so no reader ever observes a half-built table.
/// `apply` never mutates its input and is idempotent for identical inputs.
pub struct InstanceTypeStore {
    table: ArcSwap<OverlayTable>,
}

impl InstanceTypeStore {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(OverlayTable::default()),
        }
    }

    /// Publishes a freshly built table in one atomic swap.
    pub fn update_store(&self, table: OverlayTable) {
        self.table.store(Arc::new(table));
    }

    /// Empties the table; used at startup and in tests.
    pub fn reset(&self) {
        self.table.store(Arc::new(OverlayTable::default()));
    }

    /// Returns an adjusted copy of the instance type for the given node
    /// pool, or an error when the validator has not evaluated the pool yet
    /// so the caller can defer scheduling it.
    pub fn apply(
        &self,
        nodepool: &str,
        instance_type: &InstanceType,
    ) -> Result<InstanceType, UnevaluatedNodePool> {
        let table = self.table.load();
        if !table.evaluated.contains(nodepool) {
            return Err(UnevaluatedNodePool(nodepool.to_string()));
        }
        let mut adjusted = instance_type.clone();
        if let Some(update) = table.update_for(nodepool, &instance_type.name) {
            for offering in &mut adjusted.offerings {
                if let Some(price_update) = update.price.get(&offering.key()) {
                    offering.price = match price_update.price {
                        Some(absolute) => absolute,
                        None => {
                            (offering.price + price_update.adjustment.unwrap_or(0.0)).max(0.0)
                        }
                    };
                    adjusted.pricing_applied = true;
                }
            }
            if let Some(capacity_update) = &update.capacity {
                for (key, quantity) in &capacity_update.resources {
                    // Overlay wins on conflicting keys.
                    adjusted.capacity.extended.insert(key.clone(), *quantity);
                }
                adjusted.capacity_applied = true;
            }
        }
        Ok(adjusted)
    }

    pub fn apply_all(
        &self,
        nodepool: &str,
        instance_types: &[InstanceType],
    ) -> Result<Vec<InstanceType>, UnevaluatedNodePool> {
        instance_types
            .iter()
            .map(|it| self.apply(nodepool, it))
            .collect()
    }
}

impl Default for InstanceTypeStore {
    fn default() -> Self {
        Self::new()
    }
}
