use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resource quantities tracked by the scheduler.
///
/// CPU is kept in millicores and memory in bytes so that arithmetic stays
/// integral and comparisons stay exact. Anything that is not CPU, memory or
/// pod count (GPUs, hugepages, vendor devices) lives in the extended map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
    pub pods: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended: BTreeMap<String, i64>,
}

impl Resources {
    pub fn new(cpu_millis: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            pods: 0,
            extended: BTreeMap::new(),
        }
    }

    pub fn with_pods(mut self, pods: i64) -> Self {
        self.pods = pods;
        self
    }

    pub fn with_extended(mut self, key: &str, quantity: i64) -> Self {
        self.extended.insert(key.to_string(), quantity);
        self
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0
            && self.memory_bytes == 0
            && self.pods == 0
            && self.extended.values().all(|q| *q == 0)
    }

    /// True when any tracked quantity is non-zero.
    pub fn any(&self) -> bool {
        !self.is_zero()
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpu_millis += other.cpu_millis;
        self.memory_bytes += other.memory_bytes;
        self.pods += other.pods;
        for (key, quantity) in &other.extended {
            *self.extended.entry(key.clone()).or_insert(0) += quantity;
        }
    }

    /// Subtracts, clamping every quantity at zero.
    pub fn sub(&mut self, other: &Resources) {
        self.cpu_millis = (self.cpu_millis - other.cpu_millis).max(0);
        self.memory_bytes = (self.memory_bytes - other.memory_bytes).max(0);
        self.pods = (self.pods - other.pods).max(0);
        for (key, quantity) in &other.extended {
            let entry = self.extended.entry(key.clone()).or_insert(0);
            *entry = (*entry - quantity).max(0);
        }
    }

    pub fn sum<'a>(items: impl IntoIterator<Item = &'a Resources>) -> Resources {
        let mut total = Resources::default();
        for item in items {
            total.add(item);
        }
        total
    }

    /// Per-quantity maximum of the two sets.
    pub fn max_parts(&self, other: &Resources) -> Resources {
        let mut out = Resources {
            cpu_millis: self.cpu_millis.max(other.cpu_millis),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
            pods: self.pods.max(other.pods),
            extended: self.extended.clone(),
        };
        for (key, quantity) in &other.extended {
            let entry = out.extended.entry(key.clone()).or_insert(0);
            *entry = (*entry).max(*quantity);
        }
        out
    }

    /// True when `self` fits inside `capacity` on every quantity.
    pub fn fits(&self, capacity: &Resources) -> bool {
        if self.cpu_millis > capacity.cpu_millis
            || self.memory_bytes > capacity.memory_bytes
            || self.pods > capacity.pods
        {
            return false;
        }
        self.extended
            .iter()
            .all(|(key, quantity)| *quantity <= capacity.extended.get(key).copied().unwrap_or(0))
    }

    /// True when adding `extra` to `self` would exceed `limit` on any
    /// quantity that the limit actually constrains.
    pub fn exceeds_with(&self, extra: &Resources, limit: &Resources) -> bool {
        if limit.cpu_millis > 0 && self.cpu_millis + extra.cpu_millis > limit.cpu_millis {
            return true;
        }
        if limit.memory_bytes > 0 && self.memory_bytes + extra.memory_bytes > limit.memory_bytes {
            return true;
        }
        if limit.pods > 0 && self.pods + extra.pods > limit.pods {
            return true;
        }
        limit.extended.iter().any(|(key, cap)| {
            let used = self.extended.get(key).copied().unwrap_or(0);
            let added = extra.extended.get(key).copied().unwrap_or(0);
            used + added > *cap
        })
    }
}
