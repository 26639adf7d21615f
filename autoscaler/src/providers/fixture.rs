use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use models::instance_type::{InstanceType, Offering};
use models::nodeclaim::NodeClaim;
use models::nodepool::NodePool;

use super::{CloudProvider, ProviderError};

/// Deterministic in-process provider backing tests and the demo binary.
///
/// Instance types are shared across node pools unless a per-pool override
/// is registered; reserved offerings can be injected per pool the way a
/// real provider would surface live reservations.
pub struct FixtureProvider {
    instance_types: Mutex<Vec<InstanceType>>,
    per_pool: Mutex<HashMap<String, Vec<InstanceType>>>,
    /// (instance type name, offering) pairs appended for a given pool.
    reserved: Mutex<HashMap<String, Vec<(String, Offering)>>>,
    created: Mutex<Vec<NodeClaim>>,
    fail_next_creates: AtomicU32,
}

impl FixtureProvider {
    pub fn new(instance_types: Vec<InstanceType>) -> Self {
        Self {
            instance_types: Mutex::new(instance_types),
            per_pool: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            fail_next_creates: AtomicU32::new(0),
        }
    }

    pub fn set_instance_types(&self, instance_types: Vec<InstanceType>) {
        *self.instance_types.lock().unwrap() = instance_types;
    }

    pub fn set_pool_instance_types(&self, pool: &str, instance_types: Vec<InstanceType>) {
        self.per_pool
            .lock()
            .unwrap()
            .insert(pool.to_string(), instance_types);
    }

    pub fn inject_reserved_offering(&self, pool: &str, instance_type: &str, offering: Offering) {
        self.reserved
            .lock()
            .unwrap()
            .entry(pool.to_string())
            .or_default()
            .push((instance_type.to_string(), offering));
    }

    /// The next `count` create calls fail with a transient error.
    pub fn fail_creates(&self, count: u32) {
        self.fail_next_creates.store(count, Ordering::SeqCst);
    }

    pub fn created_claims(&self) -> Vec<NodeClaim> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudProvider for FixtureProvider {
    async fn get_instance_types(&self, nodepool: &NodePool) -> Result<Vec<InstanceType>, ProviderError> {
        let mut instance_types = {
            let per_pool = self.per_pool.lock().unwrap();
            match per_pool.get(&nodepool.name) {
                Some(overridden) => overridden.clone(),
                None => self.instance_types.lock().unwrap().clone(),
            }
        };
        if let Some(injected) = self.reserved.lock().unwrap().get(&nodepool.name) {
            for (name, offering) in injected {
                if let Some(it) = instance_types.iter_mut().find(|it| &it.name == name) {
                    it.offerings.push(offering.clone());
                }
            }
        }
        Ok(instance_types)
    }

    async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError> {
        let remaining = self.fail_next_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Transient("fixture create failure".to_string()));
        }
        let mut created = self.created.lock().unwrap();
        created.push(claim.clone());
        Ok(claim.clone())
    }

    async fn delete(&self, claim_name: &str) -> Result<(), ProviderError> {
        let mut created = self.created.lock().unwrap();
        let before = created.len();
        created.retain(|c| c.name != claim_name);
        if created.len() == before {
            return Err(ProviderError::NotFound(claim_name.to_string()));
        }
        Ok(())
    }

    fn supported_node_classes(&self) -> Vec<String> {
        vec!["FixtureNodeClass".to_string()]
    }
}
