use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::labels::{CAPACITY_TYPE_LABEL, RESERVATION_ID_LABEL, ZONE_LABEL};
use crate::requirements::{Requirement, Requirements};
use crate::resources::Resources;

/// A purchasable machine shape reported by the cloud provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub capacity: Resources,
    /// Kubelet and system reservation; subtracted from capacity to get the
    /// schedulable allocatable.
    pub overhead: Resources,
    /// Labels the instance type inherently satisfies (arch, os, its own
    /// name label).
    pub requirements: Vec<Requirement>,
    pub offerings: Vec<Offering>,
    /// Set on copies returned by the overlay store so callers can tell an
    /// adjustment was applied.
    #[serde(default)]
    pub pricing_applied: bool,
    #[serde(default)]
    pub capacity_applied: bool,
}

/// A purchase option of an instance type: capacity type x zone
/// (x reservation), at a price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    pub requirements: Vec<Requirement>,
    pub price: f64,
    pub available: bool,
    /// For reserved offerings, how many claims the reservation can still
    /// absorb; consumed per scheduling pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_capacity: Option<u32>,
}

impl Offering {
    pub fn new(capacity_type: &str, zone: &str, price: f64) -> Self {
        Self {
            requirements: vec![
                Requirement::in_values(CAPACITY_TYPE_LABEL, &[capacity_type]),
                Requirement::in_values(ZONE_LABEL, &[zone]),
            ],
            price,
            available: true,
            reservation_capacity: None,
        }
    }

    pub fn reserved(zone: &str, reservation_id: &str, price: f64, capacity: u32) -> Self {
        Self {
            requirements: vec![
                Requirement::in_values(CAPACITY_TYPE_LABEL, &[crate::labels::CAPACITY_TYPE_RESERVED]),
                Requirement::in_values(ZONE_LABEL, &[zone]),
                Requirement::in_values(RESERVATION_ID_LABEL, &[reservation_id]),
            ],
            price,
            available: true,
            reservation_capacity: Some(capacity),
        }
    }

    pub fn requirements(&self) -> Requirements {
        Requirements::from_requirements(&self.requirements)
    }

    fn requirement_value(&self, key: &str) -> Option<String> {
        self.requirements().label_value(key)
    }

    pub fn capacity_type(&self) -> Option<String> {
        self.requirement_value(CAPACITY_TYPE_LABEL)
    }

    pub fn zone(&self) -> Option<String> {
        self.requirement_value(ZONE_LABEL)
    }

    pub fn reservation_id(&self) -> Option<String> {
        self.requirement_value(RESERVATION_ID_LABEL)
    }

    pub fn is_reserved(&self) -> bool {
        self.capacity_type().as_deref() == Some(crate::labels::CAPACITY_TYPE_RESERVED)
    }

    /// Canonical identity of the offering within its instance type, used to
    /// key price updates.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.capacity_type().unwrap_or_default(),
            self.zone().unwrap_or_default(),
            self.reservation_id().unwrap_or_default(),
        )
    }
}

impl InstanceType {
    pub fn new(name: &str, capacity: Resources, offerings: Vec<Offering>) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            overhead: Resources::default(),
            requirements: vec![Requirement::in_values(
                crate::labels::INSTANCE_TYPE_LABEL,
                &[name],
            )],
            offerings,
            pricing_applied: false,
            capacity_applied: false,
        }
    }

    pub fn allocatable(&self) -> Resources {
        let mut allocatable = self.capacity.clone();
        allocatable.sub(&self.overhead);
        allocatable
    }

    /// The instance type's inherent requirements widened with the zones and
    /// capacity types its offerings can provide.
    pub fn scheduling_requirements(&self) -> Requirements {
        let mut reqs = Requirements::from_requirements(&self.requirements);
        let mut zones = BTreeSet::new();
        let mut capacity_types = BTreeSet::new();
        for offering in self.offerings.iter().filter(|o| o.available) {
            if let Some(zone) = offering.zone() {
                zones.insert(zone);
            }
            if let Some(capacity_type) = offering.capacity_type() {
                capacity_types.insert(capacity_type);
            }
        }
        if !zones.is_empty() {
            let zones: Vec<&str> = zones.iter().map(|z| z.as_str()).collect();
            reqs.add_requirement(&Requirement::in_values(ZONE_LABEL, &zones));
        }
        if !capacity_types.is_empty() {
            let types: Vec<&str> = capacity_types.iter().map(|c| c.as_str()).collect();
            reqs.add_requirement(&Requirement::in_values(CAPACITY_TYPE_LABEL, &types));
        }
        reqs
    }

    /// All values this instance type exposes for a requirement key, across
    /// inherent requirements and offerings. Used for min-values counting.
    pub fn values_for_key(&self, key: &str) -> BTreeSet<String> {
        let mut values = BTreeSet::new();
        for req in &self.requirements {
            if req.key == key {
                values.extend(req.values.iter().cloned());
            }
        }
        for offering in self.offerings.iter().filter(|o| o.available) {
            for req in &offering.requirements {
                if req.key == key {
                    values.extend(req.values.iter().cloned());
                }
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{CAPACITY_TYPE_ON_DEMAND, CAPACITY_TYPE_SPOT};

    #[test]
    fn test_offering_key_is_stable() {
        let offering = Offering::new(CAPACITY_TYPE_ON_DEMAND, "zone-a", 0.25);
        assert_eq!(offering.key(), "on-demand/zone-a/");
        let reserved = Offering::reserved("zone-a", "r-1", 0.10, 4);
        assert_eq!(reserved.key(), "reserved/zone-a/r-1");
        assert!(reserved.is_reserved());
    }

    #[test]
    fn test_scheduling_requirements_widen_zones() {
        let it = InstanceType::new(
            "m5.large",
            Resources::new(2000, 8 << 30).with_pods(29),
            vec![
                Offering::new(CAPACITY_TYPE_ON_DEMAND, "zone-a", 0.10),
                Offering::new(CAPACITY_TYPE_SPOT, "zone-b", 0.03),
            ],
        );
        let reqs = it.scheduling_requirements();
        let zone = reqs.get(crate::labels::ZONE_LABEL).unwrap();
        assert!(zone.has("zone-a") && zone.has("zone-b"));
        assert!(!zone.has("zone-c"));
    }

    #[test]
    fn test_allocatable_subtracts_overhead() {
        let mut it = InstanceType::new(
            "m5.large",
            Resources::new(2000, 8 << 30).with_pods(29),
            vec![],
        );
        it.overhead = Resources::new(100, 1 << 30);
        assert_eq!(it.allocatable().cpu_millis, 1900);
    }
}
