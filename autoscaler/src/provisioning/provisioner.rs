use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{info, warn};

use models::instance_type::InstanceType;
use models::labels::NODEPOOL_LABEL;
use models::nodeclaim::NodeClaim;
use models::nodepool::NodePool;
use models::pod::Pod;
use models::requirements::Operator;
use models::resources::Resources;

use crate::batch::Batcher;
use crate::config::Options;
use crate::events::{EventObject, EventRecorder};
use crate::overlay::store::InstanceTypeStore;
use crate::providers::{CloudProvider, ProviderError};
use crate::registry::Registry;
use crate::scheduling::scheduler::{Results, Scheduler, SchedulerOptions, SchedulingError};
use crate::scheduling::volume_topology::VolumeTopology;
use crate::state::cluster::ClusterState;

/// Ceiling on one solve; past it the simulator returns a partial result.
const SOLVE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("node pool {0} not found")]
    NodePoolNotFound(String),
    #[error("node pool {0} resource limits exceeded")]
    LimitsExceeded(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// What a single pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The batching window closed with nothing pending.
    Idle,
    /// State has not synced yet; try again.
    NotSynced,
    /// Nothing left to do after validation.
    NoPendingPods,
    Provisioned { created: usize, failed: usize },
}

#[derive(Debug, Default)]
pub struct ProvisionerStats {
    pub passes: AtomicU64,
    pub claims_created: AtomicU64,
    pub claims_failed: AtomicU64,
    pub pods_deferred: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct ProvisionerStatsSnapshot {
    pub passes: u64,
    pub claims_created: u64,
    pub claims_failed: u64,
    pub pods_deferred: u64,
}

/// The singleton reconciler driving batch -> simulate -> create.
pub struct Provisioner {
    opts: Arc<Options>,
    registry: Registry,
    cluster: Arc<ClusterState>,
    store: Arc<InstanceTypeStore>,
    provider: Arc<dyn CloudProvider>,
    batcher: Arc<Batcher>,
    volume_topology: VolumeTopology,
    events: Arc<EventRecorder>,
    stats: ProvisionerStats,
}

impl Provisioner {
    pub fn new(
        opts: Arc<Options>,
        registry: Registry,
        cluster: Arc<ClusterState>,
        store: Arc<InstanceTypeStore>,
        provider: Arc<dyn CloudProvider>,
        batcher: Arc<Batcher>,
        events: Arc<EventRecorder>,
    ) -> Self {
        let volume_topology = VolumeTopology::new(registry.clone());
        Self {
            opts,
            registry,
            cluster,
            store,
            provider,
            batcher,
            volume_topology,
            events,
            stats: ProvisionerStats::default(),
        }
    }

    /// Runs provisioning passes forever. Pass-level single-flight: the next
    /// wait only starts once this pass has fully finished.
    pub async fn run(&self) {
        loop {
            let outcome = self.reconcile_once().await;
            if let PassOutcome::Provisioned { created, failed } = outcome {
                info!(created, failed, "provisioning pass complete");
            }
        }
    }

    /// One full pass of the provisioning pipeline.
    pub async fn reconcile_once(&self) -> PassOutcome {
        if !self.batcher.wait().await {
            return PassOutcome::Idle;
        }
        if !self.cluster.synced() {
            return PassOutcome::NotSynced;
        }
        self.stats.passes.fetch_add(1, Ordering::SeqCst);

        // Collect and validate the pods that want capacity.
        let mut validation_errors: HashMap<String, SchedulingError> = HashMap::new();
        let mut pods = self.pending_pods(&mut validation_errors);

        let snapshot = self.cluster.snapshot_nodes();
        let deleting_names: Vec<String> =
            snapshot.deleting.iter().map(|n| n.name.clone()).collect();
        for mut pod in self.registry.list_pods_on_nodes(&deleting_names) {
            if pods.iter().any(|p| p.uid == pod.uid) {
                continue;
            }
            match self.validate_pod(&mut pod) {
                Ok(()) => pods.push(pod),
                Err(error) => {
                    validation_errors.insert(pod.uid.clone(), error);
                }
            }
        }

        if pods.is_empty() && validation_errors.is_empty() {
            return PassOutcome::NoPendingPods;
        }

        let nodepools = self.registry.list_nodepools();
        if nodepools.is_empty() {
            // Terminal for this pass, not an error: mark every pod and let
            // the next trigger retry.
            let errors: HashMap<String, String> = pods
                .iter()
                .map(|p| (p.uid.clone(), SchedulingError::NoNodePools.to_string()))
                .chain(
                    validation_errors
                        .iter()
                        .map(|(uid, e)| (uid.clone(), e.to_string())),
                )
                .collect();
            self.cluster.mark_pod_scheduling_decisions(&errors, &[], &[]);
            return PassOutcome::NoPendingPods;
        }

        let scheduler_pools = self.gather_pools(nodepools).await;
        let placed = self.placed_pods();
        let mut scheduler = Scheduler::new(
            SchedulerOptions::from(self.opts.as_ref()),
            scheduler_pools,
            snapshot.active,
            self.registry.list_daemon_pods(),
            placed,
        );
        let results = scheduler.solve(pods, Instant::now() + SOLVE_TIMEOUT);

        self.record_decisions(&validation_errors, &results);

        // Deferred and undecided pods re-open the next batching window.
        for uid in results
            .reserved_offering_errors
            .keys()
            .chain(results.undecided.iter())
        {
            self.stats.pods_deferred.fetch_add(1, Ordering::SeqCst);
            self.batcher.trigger(uid);
        }

        let claims = results.new_node_claims.clone();
        let concurrency = claims
            .len()
            .min(self.opts.num_concurrent_reconciles())
            .max(1);
        let outcomes: Vec<Result<(), ProvisioningError>> = stream::iter(
            claims.into_iter().map(|claim| self.create_claim(claim)),
        )
        .buffer_unordered(concurrency)
        .collect()
        .await;

        let created = outcomes.iter().filter(|o| o.is_ok()).count();
        let failed = outcomes.len() - created;
        self.stats
            .claims_created
            .fetch_add(created as u64, Ordering::SeqCst);
        self.stats
            .claims_failed
            .fetch_add(failed as u64, Ordering::SeqCst);
        PassOutcome::Provisioned { created, failed }
    }

    /// Provisionable pods that survive validation; failures land in the
    /// error map instead.
    fn pending_pods(&self, errors: &mut HashMap<String, SchedulingError>) -> Vec<Pod> {
        let mut pods = Vec::new();
        for mut pod in self.registry.list_provisionable_pods() {
            // Pods already destined for a live claim wait for it.
            if self.cluster.claim_for_pod(&pod.uid).is_some() {
                continue;
            }
            match self.validate_pod(&mut pod) {
                Ok(()) => pods.push(pod),
                Err(error) => {
                    if !matches!(error, SchedulingError::ManagedLabelForbidden) {
                        self.events.record(
                            EventObject::Pod(pod.uid.clone()),
                            "FailedValidation",
                            &error.to_string(),
                        );
                    }
                    errors.insert(pod.uid.clone(), error);
                }
            }
        }
        pods
    }

    /// Rejects pods the simulator could never place, and injects
    /// volume-derived topology into the rest.
    fn validate_pod(&self, pod: &mut Pod) -> Result<(), SchedulingError> {
        for term in pod
            .affinity
            .iter()
            .flat_map(|a| a.node_affinity.iter())
            .flat_map(|na| na.required.iter())
        {
            for req in &term.match_expressions {
                match req.operator {
                    Operator::In if req.values.is_empty() => {
                        return Err(SchedulingError::InvalidNodeSelector(format!(
                            "requirement {} has operator In with no values",
                            req.key
                        )));
                    }
                    Operator::Gt | Operator::Lt => {
                        if req.values.len() != 1 || req.values[0].parse::<i64>().is_err() {
                            return Err(SchedulingError::InvalidNodeSelector(format!(
                                "requirement {} needs exactly one integer value",
                                req.key
                            )));
                        }
                    }
                    _ => {}
                }
                // A pod that explicitly requires the managed label to not
                // exist has opted out of provisioned capacity.
                if req.key == NODEPOOL_LABEL && req.operator == Operator::DoesNotExist {
                    return Err(SchedulingError::ManagedLabelForbidden);
                }
            }
        }
        self.volume_topology.inject(pod)?;
        Ok(())
    }

    /// Fetches and overlay-adjusts instance types per ready pool. Pools the
    /// overlay store has not evaluated yet are skipped this pass.
    async fn gather_pools(
        &self,
        nodepools: Vec<NodePool>,
    ) -> Vec<(NodePool, Vec<InstanceType>, Resources)> {
        let mut out = Vec::new();
        for pool in nodepools {
            if !pool.is_ready() {
                info!(nodepool = %pool.name, "skipping node pool that is not ready");
                continue;
            }
            let instance_types = match self.provider.get_instance_types(&pool).await {
                Ok(instance_types) => instance_types,
                Err(error) => {
                    warn!(nodepool = %pool.name, %error, "could not list instance types");
                    continue;
                }
            };
            let adjusted = match self.store.apply_all(&pool.name, &instance_types) {
                Ok(adjusted) => adjusted,
                Err(unevaluated) => {
                    info!(nodepool = %pool.name, %unevaluated, "deferring unevaluated node pool");
                    continue;
                }
            };
            let usage = self.cluster.nodepool_resources_for(&pool.name);
            out.push((pool, adjusted, usage));
        }
        out
    }

    /// Bound pods with their node labels, for topology seeding.
    fn placed_pods(&self) -> Vec<(Pod, HashMap<String, String>)> {
        let mut placed = Vec::new();
        let pods = self.registry.pods.lock().unwrap();
        for pod in pods.values() {
            if let Some(node_name) = &pod.node_name {
                if let Some(node) = self.cluster.get_node(node_name) {
                    placed.push((pod.clone(), node.labels));
                }
            }
        }
        placed.sort_by(|a, b| a.0.uid.cmp(&b.0.uid));
        placed
    }

    fn record_decisions(
        &self,
        validation_errors: &HashMap<String, SchedulingError>,
        results: &Results,
    ) {
        let mut errors: HashMap<String, String> = HashMap::new();
        for (uid, error) in validation_errors {
            errors.insert(uid.clone(), error.to_string());
        }
        for (uid, error) in &results.pod_errors {
            errors.insert(uid.clone(), error.to_string());
            self.events.record(
                EventObject::Pod(uid.clone()),
                "FailedScheduling",
                &error.to_string(),
            );
        }

        let mut by_nodepool = Vec::new();
        for claim in &results.new_node_claims {
            let healthy = self
                .registry
                .get_nodepool(&claim.nodepool)
                .map(|p| p.registration_healthy())
                .unwrap_or(false);
            for uid in &claim.pod_uids {
                by_nodepool.push((uid.clone(), claim.nodepool.clone(), healthy));
            }
        }
        let mut by_existing = Vec::new();
        for (node, uids) in &results.existing_node_pods {
            for uid in uids {
                by_existing.push((uid.clone(), node.clone()));
            }
        }
        self.cluster
            .mark_pod_scheduling_decisions(&errors, &by_nodepool, &by_existing);
    }

    /// Creates one claim through the cloud provider. Failures abort this
    /// claim only; the rest of the batch proceeds.
    pub async fn create_claim(&self, claim: NodeClaim) -> Result<(), ProvisioningError> {
        let result = self.try_create(&claim).await;
        // Static pools hand their reservation back on both paths: a
        // successful creation is counted by the running node, a failure
        // must free the slot for the next attempt.
        if let Some(pool) = self.registry.get_nodepool(&claim.nodepool) {
            if pool.is_static() {
                self.cluster.release_node_count(&pool.name, 1);
            }
        }
        match &result {
            Ok(()) => {
                self.cluster.record_launch_success(&claim.nodepool);
            }
            Err(error) => {
                self.cluster.record_launch_failure(&claim.nodepool);
                self.events.record(
                    EventObject::NodeClaim(claim.name.clone()),
                    "FailedCreate",
                    &error.to_string(),
                );
                warn!(claim = %claim.name, %error, "node claim creation failed");
            }
        }
        result
    }

    async fn try_create(&self, claim: &NodeClaim) -> Result<(), ProvisioningError> {
        // Re-read the pool; limits may have tightened since the simulator
        // ran.
        let pool = self
            .registry
            .get_nodepool(&claim.nodepool)
            .ok_or_else(|| ProvisioningError::NodePoolNotFound(claim.nodepool.clone()))?;
        if let Some(limits) = &pool.limits {
            let usage = self.cluster.nodepool_resources_for(&pool.name);
            if usage.exceeds_with(&claim.resources, limits) {
                self.events.record(
                    EventObject::NodePool(pool.name.clone()),
                    "LimitsExceeded",
                    &format!("creating node claim {} would exceed limits", claim.name),
                );
                return Err(ProvisioningError::LimitsExceeded(pool.name.clone()));
            }
        }

        let realized = self.provider.create(claim).await?;

        // Reflect the decision immediately rather than waiting for the
        // informer cache.
        self.registry.upsert_node_claim(realized.clone());
        self.cluster.update_node_claim(&realized);
        for uid in &realized.pod_uids {
            self.cluster
                .update_pod_to_node_claim_mapping(uid, &realized.name);
        }
        self.cluster.ack_pods(&realized.pod_uids);
        Ok(())
    }

    pub fn stats(&self) -> ProvisionerStatsSnapshot {
        ProvisionerStatsSnapshot {
            passes: self.stats.passes.load(Ordering::SeqCst),
            claims_created: self.stats.claims_created.load(Ordering::SeqCst),
            claims_failed: self.stats.claims_failed.load(Ordering::SeqCst),
            pods_deferred: self.stats.pods_deferred.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::store::OverlayTable;
    use crate::providers::fixture::FixtureProvider;
    use crate::state::node::StateNode;
    use models::condition::{set_condition, Condition, ConditionStatus, CONDITION_NODE_CLASS_READY, CONDITION_READY};
    use models::instance_type::Offering;
    use models::labels::CAPACITY_TYPE_ON_DEMAND;
    use models::nodepool::NodePoolKind;
    use models::pod::{Affinity, NodeAffinity, NodeSelectorTerm, PodPhase};
    use models::requirements::Requirement;

    struct Fixture {
        provisioner: Provisioner,
        registry: Registry,
        cluster: Arc<ClusterState>,
        store: Arc<InstanceTypeStore>,
        provider: Arc<FixtureProvider>,
        batcher: Arc<Batcher>,
        events: Arc<EventRecorder>,
    }

    fn ready_pool(name: &str) -> NodePool {
        let mut pool = NodePool::new(name, 0);
        set_condition(
            &mut pool.status.conditions,
            Condition::new(CONDITION_READY, ConditionStatus::True),
        );
        set_condition(
            &mut pool.status.conditions,
            Condition::new(CONDITION_NODE_CLASS_READY, ConditionStatus::True),
        );
        pool
    }

    fn default_instance_type() -> InstanceType {
        InstanceType::new(
            "m5.large",
            Resources::new(2000, 8 << 30).with_pods(110),
            vec![Offering::new(CAPACITY_TYPE_ON_DEMAND, "test-zone-1", 1.02)],
        )
    }

    fn evaluated_store(pools: &[&str]) -> Arc<InstanceTypeStore> {
        let store = Arc::new(InstanceTypeStore::new());
        let mut table = OverlayTable::default();
        for pool in pools {
            table.evaluated.insert(pool.to_string());
        }
        store.update_store(table);
        store
    }

    fn fixture_with_store(store: Arc<InstanceTypeStore>) -> Fixture {
        let mut opts = Options::default();
        opts.batch_idle_duration = Duration::from_millis(10);
        opts.batch_max_duration = Duration::from_millis(50);
        let opts = Arc::new(opts);
        let registry = Registry::new();
        let cluster = Arc::new(ClusterState::new());
        let provider = Arc::new(FixtureProvider::new(vec![default_instance_type()]));
        let batcher = Arc::new(Batcher::new(
            opts.batch_idle_duration,
            opts.batch_max_duration,
        ));
        let events = Arc::new(EventRecorder::default());
        let provisioner = Provisioner::new(
            Arc::clone(&opts),
            registry.clone(),
            Arc::clone(&cluster),
            Arc::clone(&store),
            Arc::clone(&provider) as Arc<dyn CloudProvider>,
            Arc::clone(&batcher),
            Arc::clone(&events),
        );
        Fixture {
            provisioner,
            registry,
            cluster,
            store,
            provider,
            batcher,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(evaluated_store(&["default"]))
    }

    #[tokio::test]
    async fn test_pass_creates_claim_and_updates_state() {
        let f = fixture();
        f.registry.upsert_nodepool(ready_pool("default"));
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        f.registry.upsert_pod(pod.clone());
        f.cluster.mark_synced();

        f.batcher.trigger(&pod.uid);
        let outcome = f.provisioner.reconcile_once().await;
        assert_eq!(outcome, PassOutcome::Provisioned { created: 1, failed: 0 });

        let created = f.provider.created_claims();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].nodepool, "default");
        assert_eq!(f.registry.list_node_claims().len(), 1);
        assert!(f.cluster.claim_for_pod(&pod.uid).is_some());
        assert!(f.cluster.pod_scheduling_success_time(&pod.uid).is_some());

        // The pod is owned by a live claim now; a retrigger finds nothing.
        f.batcher.trigger(&pod.uid);
        let outcome = f.provisioner.reconcile_once().await;
        assert_eq!(outcome, PassOutcome::NoPendingPods);
    }

    #[tokio::test]
    async fn test_pass_waits_for_sync() {
        let f = fixture();
        f.registry.upsert_nodepool(ready_pool("default"));
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        f.registry.upsert_pod(pod.clone());

        f.batcher.trigger(&pod.uid);
        assert_eq!(f.provisioner.reconcile_once().await, PassOutcome::NotSynced);
    }

    #[tokio::test]
    async fn test_unevaluated_pool_defers_pods() {
        let f = fixture_with_store(Arc::new(InstanceTypeStore::new()));
        f.registry.upsert_nodepool(ready_pool("default"));
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        f.registry.upsert_pod(pod.clone());
        f.cluster.mark_synced();

        f.batcher.trigger(&pod.uid);
        let outcome = f.provisioner.reconcile_once().await;
        assert_eq!(outcome, PassOutcome::Provisioned { created: 0, failed: 0 });
        let decision = f.cluster.pod_decision(&pod.uid).unwrap();
        assert!(decision.error.unwrap().contains("no node pools"));

        // Once the validator evaluates the pool, the pod schedules.
        let mut table = OverlayTable::default();
        table.evaluated.insert("default".to_string());
        f.store.update_store(table);
        f.batcher.trigger(&pod.uid);
        let outcome = f.provisioner.reconcile_once().await;
        assert_eq!(outcome, PassOutcome::Provisioned { created: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_opted_out_pod_is_silently_ignored() {
        let f = fixture();
        f.registry.upsert_nodepool(ready_pool("default"));
        let mut pod = Pod::new("opt-out", "default", Resources::new(100, 1 << 20));
        pod.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required: vec![NodeSelectorTerm {
                    match_expressions: vec![Requirement::new(
                        NODEPOOL_LABEL,
                        Operator::DoesNotExist,
                        &[],
                    )],
                }],
                preferred: vec![],
            }),
            ..Default::default()
        });
        f.registry.upsert_pod(pod.clone());
        f.cluster.mark_synced();

        f.batcher.trigger(&pod.uid);
        let outcome = f.provisioner.reconcile_once().await;
        assert_eq!(outcome, PassOutcome::Provisioned { created: 0, failed: 0 });
        // Decision recorded, but no event: the pod opted out.
        assert!(f.cluster.pod_decision(&pod.uid).is_some());
        assert!(f.events.events_for(&EventObject::Pod(pod.uid.clone())).is_empty());
        assert!(f.provider.created_claims().is_empty());
    }

    #[tokio::test]
    async fn test_pods_on_deleting_nodes_are_rescheduled() {
        let f = fixture();
        f.registry.upsert_nodepool(ready_pool("default"));
        let mut draining = StateNode::new(
            "old-node",
            Resources::new(2000, 8 << 30).with_pods(110),
            Resources::new(2000, 8 << 30).with_pods(110),
        );
        draining.marked_for_deletion = true;
        f.cluster.update_node(draining);

        let mut pod = Pod::new("displaced", "default", Resources::new(500, 1 << 30));
        pod.node_name = Some("old-node".to_string());
        pod.phase = PodPhase::Running;
        f.registry.upsert_pod(pod.clone());
        f.cluster.mark_synced();

        f.batcher.trigger("node-drain");
        let outcome = f.provisioner.reconcile_once().await;
        assert_eq!(outcome, PassOutcome::Provisioned { created: 1, failed: 0 });
        let created = f.provider.created_claims();
        assert_eq!(created[0].pod_uids, vec![pod.uid]);
    }

    #[tokio::test]
    async fn test_transient_create_failure_retries_next_pass() {
        let f = fixture();
        f.registry.upsert_nodepool(ready_pool("default"));
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        f.registry.upsert_pod(pod.clone());
        f.cluster.mark_synced();
        f.provider.fail_creates(1);

        f.batcher.trigger(&pod.uid);
        let outcome = f.provisioner.reconcile_once().await;
        assert_eq!(outcome, PassOutcome::Provisioned { created: 0, failed: 1 });
        assert_eq!(f.cluster.consecutive_launch_failures("default"), 1);
        assert!(f.cluster.claim_for_pod(&pod.uid).is_none());

        f.batcher.trigger(&pod.uid);
        let outcome = f.provisioner.reconcile_once().await;
        assert_eq!(outcome, PassOutcome::Provisioned { created: 1, failed: 0 });
        assert_eq!(f.cluster.consecutive_launch_failures("default"), 0);
    }

    #[tokio::test]
    async fn test_create_rechecks_limits() {
        let f = fixture();
        let mut pool = ready_pool("default");
        pool.limits = Some(Resources::new(1000, 0));
        f.registry.upsert_nodepool(pool);

        let mut claim = NodeClaim::new("default");
        claim.resources = Resources::new(1500, 1 << 30);
        let error = f.provisioner.create_claim(claim).await.unwrap_err();
        assert!(matches!(error, ProvisioningError::LimitsExceeded(_)));
        assert_eq!(
            f.events
                .events_for(&EventObject::NodePool("default".to_string()))
                .len(),
            1
        );
        assert!(f.provider.created_claims().is_empty());
    }

    #[tokio::test]
    async fn test_static_pool_reservation_released_on_both_paths() {
        let f = fixture();
        let mut pool = ready_pool("static-pool");
        pool.kind = NodePoolKind::Static { replicas: 3 };
        f.registry.upsert_nodepool(pool);

        f.cluster.reserve_node_count("static-pool", 1);
        let mut claim = NodeClaim::new("static-pool");
        claim.resources = Resources::new(500, 1 << 30);
        f.provisioner.create_claim(claim).await.unwrap();
        assert_eq!(f.cluster.reserved_node_count("static-pool"), 0);

        f.cluster.reserve_node_count("static-pool", 1);
        f.provider.fail_creates(1);
        let mut claim = NodeClaim::new("static-pool");
        claim.resources = Resources::new(500, 1 << 30);
        assert!(f.provisioner.create_claim(claim).await.is_err());
        assert_eq!(f.cluster.reserved_node_count("static-pool"), 0);
    }
}
