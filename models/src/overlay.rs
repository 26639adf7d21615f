use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Condition;
use crate::requirements::Requirement;

/// A user-authored adjustment to instance-type pricing or capacity,
/// selected by requirements over (node pool, instance type, offering)
/// labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOverlay {
    pub uid: String,
    pub name: String,
    pub requirements: Vec<Requirement>,
    /// Absolute price replacing the offering price. Mutually exclusive with
    /// `price_adjustment`.
    pub price: Option<f64>,
    /// Signed additive delta applied to the offering price.
    pub price_adjustment: Option<f64>,
    /// Extended resources merged into matching instance types' capacity;
    /// overlay values win on conflicting keys.
    pub capacity: BTreeMap<String, i64>,
    pub weight: i64,
    pub status: NodeOverlayStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOverlayStatus {
    pub conditions: Vec<Condition>,
}

impl NodeOverlay {
    pub fn new(name: &str, weight: i64, requirements: Vec<Requirement>) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            requirements,
            price: None,
            price_adjustment: None,
            capacity: BTreeMap::new(),
            weight,
            status: NodeOverlayStatus::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_price_adjustment(mut self, delta: f64) -> Self {
        self.price_adjustment = Some(delta);
        self
    }

    pub fn with_capacity(mut self, key: &str, quantity: i64) -> Self {
        self.capacity.insert(key.to_string(), quantity);
        self
    }

    pub fn adjusts_price(&self) -> bool {
        self.price.is_some() || self.price_adjustment.is_some()
    }

    pub fn adjusts_capacity(&self) -> bool {
        !self.capacity.is_empty()
    }
}
