use std::collections::{BTreeMap, BTreeSet, HashMap};

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use models::instance_type::{InstanceType, Offering};
use models::labels::{
    HOSTNAME_LABEL, MIN_VALUES_RELAXED_ANNOTATION, NODEPOOL_HASH_ANNOTATION, NODEPOOL_LABEL,
    ZONE_LABEL,
};
use models::nodeclaim::NodeClaim;
use models::nodepool::NodePool;
use models::pod::{tolerates_all, Pod, UnsatisfiablePolicy};
use models::requirements::Requirements;
use models::resources::Resources;

use crate::config::{MinValuesPolicy, Options, PreferencePolicy};
use crate::state::node::StateNode;

use super::topology::Topology;
use super::volume_topology::VolumeTopologyError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulingError {
    /// The pod explicitly opted out of managed capacity; ignored without an
    /// event.
    #[error("pod requires the node pool label to not exist")]
    ManagedLabelForbidden,
    #[error("invalid node selector: {0}")]
    InvalidNodeSelector(String),
    #[error(transparent)]
    VolumeTopology(#[from] VolumeTopologyError),
    #[error("no node pools found")]
    NoNodePools,
    #[error("incompatible with all node pools: {0}")]
    Incompatible(String),
    #[error("min values for key {key} unsatisfied: requires {required}, only {available} available")]
    MinValuesUnsatisfied {
        key: String,
        required: usize,
        available: usize,
    },
    /// Defer to the next pass; reserved capacity was exhausted within this
    /// one. Does not mark the pod unschedulable.
    #[error("reserved capacity exhausted this scheduling pass")]
    ReservedOfferingLimited,
    #[error("no scheduling decision this pass")]
    NoDecision,
}

impl SchedulingError {
    pub fn is_reserved_deferral(&self) -> bool {
        matches!(self, SchedulingError::ReservedOfferingLimited)
    }
}

/// Scheduler-facing knobs, derived from the process options.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub preference_policy: PreferencePolicy,
    pub min_values_policy: MinValuesPolicy,
    pub disable_reserved_capacity_fallback: bool,
    pub max_instance_types: usize,
    /// Scales with available CPU; bounds parallel claim creation.
    pub num_concurrent_reconciles: usize,
}

impl From<&Options> for SchedulerOptions {
    fn from(opts: &Options) -> Self {
        Self {
            preference_policy: opts.preference_policy,
            min_values_policy: opts.min_values_policy,
            disable_reserved_capacity_fallback: opts.disable_reserved_capacity_fallback,
            max_instance_types: opts.max_instance_types,
            num_concurrent_reconciles: opts.num_concurrent_reconciles(),
        }
    }
}

/// An instance type retained for a claim, with the cheapest offering that
/// satisfies the claim's requirements.
#[derive(Debug, Clone)]
pub struct RankedInstance {
    pub instance_type: InstanceType,
    pub offering: Offering,
    pub price: f64,
}

/// The solver's working record of one tentative claim.
#[derive(Debug, Clone)]
pub struct ClaimDraft {
    pub name: String,
    pub nodepool: String,
    pub nodepool_uid: String,
    pub nodepool_weight: i32,
    pub node_class_ref: models::nodepool::NodeClassRef,
    pub template_labels: HashMap<String, String>,
    pub taints: Vec<models::pod::Taint>,
    pub startup_taints: Vec<models::pod::Taint>,
    pub requirements: Requirements,
    pub instances: Vec<RankedInstance>,
    pub pod_uids: Vec<String>,
    pub pod_requests: Resources,
    pub daemon_requests: Resources,
    pub nodepool_hash: String,
    pub registration_healthy: bool,
    /// (key, achieved) for every min-values constraint that best-effort
    /// mode had to relax.
    pub relaxed_keys: Vec<(String, usize)>,
    /// Capacity committed against the pool's limits for this draft.
    pub committed: Resources,
}

impl ClaimDraft {
    fn labels(&self) -> HashMap<String, String> {
        let mut labels = self.template_labels.clone();
        labels.insert(NODEPOOL_LABEL.to_string(), self.nodepool.clone());
        labels.insert(HOSTNAME_LABEL.to_string(), self.name.clone());
        labels
    }

    fn total_requests(&self) -> Resources {
        let mut total = self.pod_requests.clone();
        total.add(&self.daemon_requests);
        total
    }
}

/// Everything one solve produces.
#[derive(Debug, Default)]
pub struct Results {
    pub new_node_claims: Vec<NodeClaim>,
    pub pod_errors: HashMap<String, SchedulingError>,
    /// Pods deferred because in-pass reserved capacity ran out; retried
    /// next pass rather than reported unschedulable.
    pub reserved_offering_errors: HashMap<String, SchedulingError>,
    /// Existing node name -> pods bound to it this pass.
    pub existing_node_pods: HashMap<String, Vec<String>>,
    /// Pods the pass deadline cut off before a decision.
    pub undecided: Vec<String>,
}

struct PoolContext {
    pool: NodePool,
    instance_types: Vec<InstanceType>,
    daemon_overhead: Resources,
    /// Limits minus usage at pass start; None when the pool is unlimited.
    remaining: Option<Resources>,
    hash: String,
    /// Domains (by topology key) the pool's offerings can provide, for
    /// topology resolution on hypothetical nodes.
    fallback_domains: BTreeMap<String, BTreeSet<String>>,
}

enum Placement {
    Existing(String),
    Draft(usize),
}

struct PoolCandidate {
    pool_index: usize,
    requirements: Requirements,
    instances: Vec<RankedInstance>,
    relaxed_keys: Vec<(String, usize)>,
}

/// The scheduling simulator: given pending pods, candidate node pools and
/// the live cluster snapshot, decides which pods bind to which existing
/// nodes and which new claims to create.
pub struct Scheduler {
    opts: SchedulerOptions,
    pools: Vec<PoolContext>,
    existing: Vec<StateNode>,
    drafts: Vec<ClaimDraft>,
    topology: Topology,
    placed_pods: Vec<(Pod, HashMap<String, String>)>,
    /// Reservation id -> claims consuming it this pass.
    reserved_used: HashMap<String, u32>,
    /// Per-pool capacity committed by this pass's drafts.
    committed: HashMap<String, Resources>,
}

impl Scheduler {
    /// `nodepools` carries (pool, overlay-applied instance types, resources
    /// currently attributed to the pool). Pools that are not ready, static,
    /// or unevaluated by the overlay store must be filtered by the caller.
    pub fn new(
        opts: SchedulerOptions,
        nodepools: Vec<(NodePool, Vec<InstanceType>, Resources)>,
        existing: Vec<StateNode>,
        daemon_pods: Vec<Pod>,
        placed_pods: Vec<(Pod, HashMap<String, String>)>,
    ) -> Self {
        let mut pools: Vec<PoolContext> = nodepools
            .into_iter()
            .map(|(pool, instance_types, usage)| {
                let daemon_overhead = daemon_overhead(&pool, &daemon_pods);
                let remaining = pool.limits.clone().map(|limits| {
                    let mut remaining = limits;
                    remaining.sub(&usage);
                    remaining
                });
                let hash = template_hash(&pool);
                let fallback_domains = fallback_domains(&instance_types);
                PoolContext {
                    pool,
                    instance_types,
                    daemon_overhead,
                    remaining,
                    hash,
                    fallback_domains,
                }
            })
            .collect();
        pools.sort_by(|a, b| {
            b.pool
                .weight
                .cmp(&a.pool.weight)
                .then_with(|| a.pool.name.cmp(&b.pool.name))
        });
        let mut existing = existing;
        existing.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            opts,
            pools,
            existing,
            drafts: Vec::new(),
            topology: Topology::new(),
            placed_pods,
            reserved_used: HashMap::new(),
            committed: HashMap::new(),
        }
    }

    /// Solves placement for the given pods. Runs until done or `deadline`;
    /// pods not reached by the deadline are returned undecided, decisions
    /// already made are kept.
    pub fn solve(&mut self, pods: Vec<Pod>, deadline: Instant) -> Results {
        let mut results = Results::default();

        let mut pods = pods;
        if self.opts.preference_policy == PreferencePolicy::Ignore {
            for pod in &mut pods {
                strip_preferences(pod);
            }
        }

        for pod in &pods {
            self.topology.register_pod(pod);
        }
        let placed = std::mem::take(&mut self.placed_pods);
        for (pod, labels) in &placed {
            self.topology.seed(pod, labels);
        }
        let nodes: Vec<HashMap<String, String>> =
            self.existing.iter().map(|n| n.labels.clone()).collect();
        for labels in nodes {
            self.topology.register_domains(&labels);
        }

        // Deterministic total order: largest first, uid breaking ties.
        pods.sort_by(|a, b| {
            let (ra, rb) = (a.effective_requests(), b.effective_requests());
            rb.cpu_millis
                .cmp(&ra.cpu_millis)
                .then_with(|| rb.memory_bytes.cmp(&ra.memory_bytes))
                .then_with(|| a.uid.cmp(&b.uid))
        });

        for mut pod in pods {
            if Instant::now() >= deadline {
                results.undecided.push(pod.uid.clone());
                continue;
            }
            let uid = pod.uid.clone();
            match self.schedule_pod(&mut pod) {
                Ok(Placement::Existing(node)) => {
                    results.existing_node_pods.entry(node).or_default().push(uid);
                }
                Ok(Placement::Draft(_)) => {}
                Err(error) if error.is_reserved_deferral() => {
                    results.reserved_offering_errors.insert(uid, error);
                }
                Err(error) => {
                    results.pod_errors.insert(uid, error);
                }
            }
        }

        self.finalize_claims(&mut results);
        results
    }

    pub fn drafts(&self) -> &[ClaimDraft] {
        &self.drafts
    }

    fn schedule_pod(&mut self, pod: &mut Pod) -> Result<Placement, SchedulingError> {
        let mut last_error = None;
        loop {
            match self.try_place(pod, false) {
                Ok(placement) => return Ok(placement),
                Err(error) => {
                    // Deferrals win over further relaxation; the pod will
                    // be retried next pass with reservations reset.
                    if error.is_reserved_deferral() {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }
            if !relax(pod, self.opts.preference_policy) {
                break;
            }
        }
        // Fully relaxed and still nothing: pools tainted PreferNoSchedule
        // become the last resort.
        self.try_place(pod, true)
            .map_err(|error| if error.is_reserved_deferral() { error } else { last_error.unwrap_or(error) })
    }

    fn try_place(&mut self, pod: &Pod, include_pns: bool) -> Result<Placement, SchedulingError> {
        let requirements = self.effective_requirements(pod);
        if let Some(key) = requirements.impossible_key() {
            return Err(SchedulingError::Incompatible(format!(
                "requirement on {} allows no value",
                key
            )));
        }
        let pod_requests = pod.effective_requests();

        if let Some(placement) = self.try_existing(pod, &requirements, &pod_requests) {
            return Ok(placement);
        }
        if let Some(placement) = self.try_drafts(pod, &requirements, &pod_requests) {
            return Ok(placement);
        }
        self.try_new_claim(pod, &requirements, &pod_requests, include_pns)
    }

    fn try_existing(
        &mut self,
        pod: &Pod,
        requirements: &Requirements,
        pod_requests: &Resources,
    ) -> Option<Placement> {
        for index in 0..self.existing.len() {
            let ok = {
                let node = &self.existing[index];
                node.schedulable()
                    && requirements.satisfied_by_labels(&node.labels)
                    && tolerates_all(&pod.tolerations, &node.taints)
                    && pod_requests.fits(&node.available())
            };
            if !ok {
                continue;
            }
            let labels = self.existing[index].labels.clone();
            if !self.topology.check(pod, &labels) {
                continue;
            }
            self.topology.record(pod, |key| labels.get(key).cloned());
            self.existing[index].add_pod(&pod.uid, pod_requests);
            return Some(Placement::Existing(self.existing[index].name.clone()));
        }
        None
    }

    fn try_drafts(
        &mut self,
        pod: &Pod,
        requirements: &Requirements,
        pod_requests: &Resources,
    ) -> Option<Placement> {
        for index in 0..self.drafts.len() {
            if let Some(placement) = self.try_one_draft(pod, requirements, pod_requests, index) {
                return Some(placement);
            }
        }
        None
    }

    fn try_one_draft(
        &mut self,
        pod: &Pod,
        requirements: &Requirements,
        pod_requests: &Resources,
        index: usize,
    ) -> Option<Placement> {
        let (merged, instances, relaxed_keys, labels, pool_index) = {
            let draft = &self.drafts[index];
            if !tolerates_all(&pod.tolerations, &draft.taints) {
                return None;
            }
            if unprovidable_key(requirements, &draft.requirements).is_some() {
                return None;
            }
            let merged = draft.requirements.intersect(requirements);
            if merged.impossible_key().is_some() {
                return None;
            }
            let mut total = draft.total_requests();
            total.add(pod_requests);

            let pool_index = self
                .pools
                .iter()
                .position(|p| p.pool.name == draft.nodepool)?;
            let (instances, _) = self.rank_instances(
                &self.pools[pool_index].instance_types,
                &merged,
                &total,
                None,
            );
            if instances.is_empty() {
                return None;
            }
            let relaxed_keys = match self.check_min_values(&merged, &instances) {
                Ok(relaxed) => relaxed,
                Err(_) => return None,
            };
            (merged, instances, relaxed_keys, draft.labels(), pool_index)
        };

        let mut merged = merged;
        let fallback = self.pools[pool_index].fallback_domains.clone();
        if !self
            .topology
            .check_and_pin(pod, &mut merged, &labels, &fallback)
        {
            return None;
        }

        // Adjust the pool's committed capacity if the cheapest retained
        // instance changed.
        let new_committed = instances[0].instance_type.capacity.clone();
        let old_committed = self.drafts[index].committed.clone();
        if let Some(remaining) = &self.pools[pool_index].remaining {
            let mut usage = self.committed.get(&self.drafts[index].nodepool).cloned().unwrap_or_default();
            usage.sub(&old_committed);
            if usage.exceeds_with(&new_committed, remaining) {
                return None;
            }
        }
        self.swap_reservation(
            &self.drafts[index].instances[0].offering.clone(),
            &instances[0].offering.clone(),
        );
        let committed_entry = self
            .committed
            .entry(self.drafts[index].nodepool.clone())
            .or_default();
        committed_entry.sub(&old_committed);
        committed_entry.add(&new_committed);

        let merged_view = merged.clone();
        let draft = &mut self.drafts[index];
        draft.requirements = merged;
        draft.instances = instances;
        draft.relaxed_keys = relaxed_keys;
        draft.pod_uids.push(pod.uid.clone());
        draft.pod_requests.add(pod_requests);
        draft.committed = new_committed;
        let labels = draft.labels();
        self.topology.record(pod, |key| {
            merged_view
                .label_value(key)
                .or_else(|| labels.get(key).cloned())
        });
        Some(Placement::Draft(index))
    }

    fn try_new_claim(
        &mut self,
        pod: &Pod,
        requirements: &Requirements,
        pod_requests: &Resources,
        include_pns: bool,
    ) -> Result<Placement, SchedulingError> {
        if self.pools.is_empty() {
            return Err(SchedulingError::NoNodePools);
        }
        let mut best_relaxed: Option<PoolCandidate> = None;
        let mut min_values_error = None;
        let mut reserved_limited = false;
        let mut incompatible_reasons: Vec<String> = Vec::new();

        for pool_index in 0..self.pools.len() {
            let candidate = {
                let context = &self.pools[pool_index];
                if context.pool.is_static() || !context.pool.is_ready() {
                    continue;
                }
                if context.pool.prefers_no_schedule() && !include_pns {
                    continue;
                }
                if !tolerates_all(&pod.tolerations, &context.pool.template.taints) {
                    incompatible_reasons
                        .push(format!("{}: taints not tolerated", context.pool.name));
                    continue;
                }
                let pool_requirements = context.pool.scheduling_requirements();
                // A future node only carries template labels and the
                // well-known ones; a pod demanding anything else cannot be
                // satisfied by this pool.
                if let Some(key) = unprovidable_key(requirements, &pool_requirements) {
                    incompatible_reasons.push(format!(
                        "{}: does not provide label {}",
                        context.pool.name, key
                    ));
                    continue;
                }
                let merged = pool_requirements.intersect(requirements);
                if let Some(key) = merged.impossible_key() {
                    incompatible_reasons
                        .push(format!("{}: no allowed value for {}", context.pool.name, key));
                    continue;
                }
                Some((merged, pool_index))
            };
            let Some((mut merged, pool_index)) = candidate else { continue };

            // Resolve topology domains against this pool before filtering
            // instance types, so a pinned zone narrows the offerings.
            let labels = {
                let context = &self.pools[pool_index];
                let mut labels = context.pool.template.labels.clone();
                labels.insert(NODEPOOL_LABEL.to_string(), context.pool.name.clone());
                labels
            };
            let fallback = self.pools[pool_index].fallback_domains.clone();
            if !self
                .topology
                .check_and_pin(pod, &mut merged, &labels, &fallback)
            {
                incompatible_reasons.push(format!(
                    "{}: topology constraints unsatisfiable",
                    self.pools[pool_index].pool.name
                ));
                continue;
            }

            let mut total = pod_requests.clone();
            total.add(&self.pools[pool_index].daemon_overhead);
            let remaining = self.pools[pool_index].remaining.clone();
            let committed = self
                .committed
                .get(&self.pools[pool_index].pool.name)
                .cloned()
                .unwrap_or_default();
            let (instances, saw_exhausted_reserved) = self.rank_instances(
                &self.pools[pool_index].instance_types,
                &merged,
                &total,
                remaining.as_ref().map(|r| (r, &committed)),
            );

            if self.opts.disable_reserved_capacity_fallback && saw_exhausted_reserved {
                let cheapest_is_reserved = instances
                    .first()
                    .map(|r| r.offering.is_reserved())
                    .unwrap_or(false);
                if !cheapest_is_reserved {
                    reserved_limited = true;
                    continue;
                }
            }
            if instances.is_empty() {
                incompatible_reasons.push(format!(
                    "{}: no instance type fits",
                    self.pools[pool_index].pool.name
                ));
                continue;
            }

            match self.check_min_values(&merged, &instances) {
                Ok(relaxed_keys) if relaxed_keys.is_empty() => {
                    // No relaxation needed; highest-weight such pool wins
                    // outright.
                    return Ok(self.create_draft(PoolCandidate {
                        pool_index,
                        requirements: merged,
                        instances,
                        relaxed_keys,
                    }, pod, pod_requests));
                }
                Ok(relaxed_keys) => {
                    // Usable only by relaxing; keep looking for a pool that
                    // needs none, regardless of weight.
                    if best_relaxed.is_none() {
                        best_relaxed = Some(PoolCandidate {
                            pool_index,
                            requirements: merged,
                            instances,
                            relaxed_keys,
                        });
                    }
                }
                Err(error) => {
                    if min_values_error.is_none() {
                        min_values_error = Some(error);
                    }
                }
            }
        }

        if let Some(candidate) = best_relaxed {
            return Ok(self.create_draft(candidate, pod, pod_requests));
        }
        if reserved_limited {
            return Err(SchedulingError::ReservedOfferingLimited);
        }
        if let Some(error) = min_values_error {
            return Err(error);
        }
        Err(SchedulingError::Incompatible(if incompatible_reasons.is_empty() {
            "no candidate node pools".to_string()
        } else {
            incompatible_reasons.join("; ")
        }))
    }

    fn create_draft(
        &mut self,
        candidate: PoolCandidate,
        pod: &Pod,
        pod_requests: &Resources,
    ) -> Placement {
        let context = &self.pools[candidate.pool_index];
        let name = format!("{}-{}", context.pool.name, &Uuid::new_v4().to_string()[..8]);
        let committed = candidate.instances[0].instance_type.capacity.clone();

        if let Some(id) = candidate.instances[0].offering.reservation_id() {
            if candidate.instances[0].offering.is_reserved() {
                *self.reserved_used.entry(id).or_insert(0) += 1;
            }
        }
        self.committed
            .entry(context.pool.name.clone())
            .or_default()
            .add(&committed);

        let draft = ClaimDraft {
            name,
            nodepool: context.pool.name.clone(),
            nodepool_uid: context.pool.uid.clone(),
            nodepool_weight: context.pool.weight,
            node_class_ref: context.pool.template.node_class_ref.clone(),
            template_labels: context.pool.template.labels.clone(),
            taints: context.pool.template.taints.clone(),
            startup_taints: context.pool.template.startup_taints.clone(),
            requirements: candidate.requirements,
            instances: candidate.instances,
            pod_uids: vec![pod.uid.clone()],
            pod_requests: pod_requests.clone(),
            daemon_requests: context.daemon_overhead.clone(),
            nodepool_hash: context.hash.clone(),
            registration_healthy: context.pool.registration_healthy(),
            relaxed_keys: candidate.relaxed_keys,
            committed,
        };
        debug!(claim = %draft.name, nodepool = %draft.nodepool, pod = %pod.name, "opened tentative node claim");
        let labels = draft.labels();
        let requirements_view = draft.requirements.clone();
        self.drafts.push(draft);
        self.topology.record(pod, |key| {
            requirements_view
                .label_value(key)
                .or_else(|| labels.get(key).cloned())
        });
        Placement::Draft(self.drafts.len() - 1)
    }

    /// Filters instance types down to those compatible with the
    /// requirements that can hold the given total requests within the
    /// pool's remaining limits, each paired with its cheapest compatible
    /// offering, sorted by price then name. Also reports whether a reserved
    /// offering was skipped purely for in-pass exhaustion.
    fn rank_instances(
        &self,
        instance_types: &[InstanceType],
        requirements: &Requirements,
        total_requests: &Resources,
        limits: Option<(&Resources, &Resources)>,
    ) -> (Vec<RankedInstance>, bool) {
        let mut ranked = Vec::new();
        let mut saw_exhausted_reserved = false;
        for instance_type in instance_types {
            if !instance_type
                .scheduling_requirements()
                .compatible_with(requirements)
            {
                continue;
            }
            if !total_requests.fits(&instance_type.allocatable()) {
                continue;
            }
            if let Some((remaining, committed)) = limits {
                if committed.exceeds_with(&instance_type.capacity, remaining) {
                    continue;
                }
            }
            let (offering, exhausted) = self.cheapest_offering(instance_type, requirements);
            saw_exhausted_reserved |= exhausted;
            if let Some(offering) = offering {
                ranked.push(RankedInstance {
                    price: offering.price,
                    offering,
                    instance_type: instance_type.clone(),
                });
            }
        }
        ranked.sort_by(|a, b| {
            a.price
                .total_cmp(&b.price)
                .then_with(|| a.instance_type.name.cmp(&b.instance_type.name))
        });
        (ranked, saw_exhausted_reserved)
    }

    fn cheapest_offering(
        &self,
        instance_type: &InstanceType,
        requirements: &Requirements,
    ) -> (Option<Offering>, bool) {
        let mut cheapest: Option<Offering> = None;
        let mut saw_exhausted_reserved = false;
        for offering in &instance_type.offerings {
            if !offering.available {
                continue;
            }
            if !offering.requirements().compatible_with(requirements) {
                continue;
            }
            if offering.is_reserved() {
                let used = offering
                    .reservation_id()
                    .and_then(|id| self.reserved_used.get(&id).copied())
                    .unwrap_or(0);
                if used >= offering.reservation_capacity.unwrap_or(0) {
                    saw_exhausted_reserved = true;
                    continue;
                }
            }
            let cheaper = cheapest
                .as_ref()
                .map(|c| offering.price.total_cmp(&c.price).is_lt())
                .unwrap_or(true);
            if cheaper {
                cheapest = Some(offering.clone());
            }
        }
        (cheapest, saw_exhausted_reserved)
    }

    /// Verifies every min-values constraint against the retained instance
    /// set. Returns the relaxations applied (empty when all are satisfied);
    /// errors under the strict policy.
    fn check_min_values(
        &self,
        requirements: &Requirements,
        instances: &[RankedInstance],
    ) -> Result<Vec<(String, usize)>, SchedulingError> {
        let mut relaxed = Vec::new();
        for (key, required) in requirements.min_values() {
            let available = distinct_values(requirements, instances, &key);
            if available >= required {
                continue;
            }
            match self.opts.min_values_policy {
                MinValuesPolicy::Strict => {
                    return Err(SchedulingError::MinValuesUnsatisfied {
                        key,
                        required,
                        available,
                    });
                }
                MinValuesPolicy::BestEffort => {
                    if available == 0 {
                        // Nothing to relax down to.
                        return Err(SchedulingError::MinValuesUnsatisfied {
                            key,
                            required,
                            available,
                        });
                    }
                    relaxed.push((key, available));
                }
            }
        }
        Ok(relaxed)
    }

    fn swap_reservation(&mut self, old: &Offering, new: &Offering) {
        if old.is_reserved() {
            if let Some(id) = old.reservation_id() {
                if let Some(used) = self.reserved_used.get_mut(&id) {
                    *used = used.saturating_sub(1);
                }
            }
        }
        if new.is_reserved() {
            if let Some(id) = new.reservation_id() {
                *self.reserved_used.entry(id).or_insert(0) += 1;
            }
        }
    }

    fn effective_requirements(&self, pod: &Pod) -> Requirements {
        let mut requirements = pod.scheduling_requirements();
        if self.opts.preference_policy == PreferencePolicy::Respect {
            for weighted in pod.preferred_requirements() {
                for expr in &weighted.term.match_expressions {
                    requirements.add_requirement(expr);
                }
            }
        }
        requirements
    }

    /// Lowers drafts into node claims, truncating oversized instance-type
    /// lists by price while honoring min-values per policy.
    fn finalize_claims(&mut self, results: &mut Results) {
        let drafts = std::mem::take(&mut self.drafts);
        for draft in drafts {
            let mut draft = draft;
            if draft.instances.len() > self.opts.max_instance_types {
                draft.instances.truncate(self.opts.max_instance_types);
                match self.check_min_values(&draft.requirements, &draft.instances) {
                    Ok(relaxed) => {
                        for relaxation in relaxed {
                            if !draft.relaxed_keys.iter().any(|(k, _)| k == &relaxation.0) {
                                draft.relaxed_keys.push(relaxation);
                            }
                        }
                    }
                    Err(error) => {
                        // Strict policy: truncation broke a constraint, so
                        // the whole claim is unschedulable.
                        for uid in &draft.pod_uids {
                            results.pod_errors.insert(uid.clone(), error.clone());
                        }
                        continue;
                    }
                }
            }
            results.new_node_claims.push(finalize_claim(draft));
        }
    }
}

fn finalize_claim(draft: ClaimDraft) -> NodeClaim {
    let mut requirements = draft.requirements.clone();
    for (key, achieved) in &draft.relaxed_keys {
        requirements.set_min_values(key, Some(*achieved));
    }
    let names: Vec<String> = draft
        .instances
        .iter()
        .map(|r| r.instance_type.name.clone())
        .collect();
    let name_refs: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
    requirements.add_requirement(&models::requirements::Requirement::in_values(
        models::labels::INSTANCE_TYPE_LABEL,
        &name_refs,
    ));

    let mut claim = NodeClaim::new(&draft.nodepool);
    claim.name = draft.name.clone();
    claim.nodepool_uid = draft.nodepool_uid.clone();
    claim.node_class_ref = draft.node_class_ref.clone();
    claim.requirements = requirements.to_requirement_vec();
    claim.resources = draft.total_requests();
    claim.labels = draft.labels();
    claim
        .annotations
        .insert(NODEPOOL_HASH_ANNOTATION.to_string(), draft.nodepool_hash.clone());
    if !draft.relaxed_keys.is_empty() {
        claim.annotations.insert(
            MIN_VALUES_RELAXED_ANNOTATION.to_string(),
            "true".to_string(),
        );
    }
    claim.taints = draft.taints.clone();
    claim.startup_taints = draft.startup_taints.clone();
    claim.pod_uids = draft.pod_uids.clone();
    claim
}

/// The first pod requirement key demanding a label the target side can
/// never provide: not in the target's requirement set and not well-known.
fn unprovidable_key<'a>(
    pod_requirements: &'a Requirements,
    provided: &Requirements,
) -> Option<&'a str> {
    pod_requirements
        .iter()
        .find(|(key, requirement)| {
            requirement.requires_existence
                && provided.get(key).is_none()
                && !models::labels::is_well_known(key)
        })
        .map(|(key, _)| key.as_str())
}

/// Distinct values the retained instances expose for a key, counted under
/// the requirement's operator semantics.
fn distinct_values(requirements: &Requirements, instances: &[RankedInstance], key: &str) -> usize {
    let mut values: BTreeSet<String> = BTreeSet::new();
    for ranked in instances {
        values.extend(ranked.instance_type.values_for_key(key));
    }
    match requirements.get(key) {
        Some(requirement) => values.iter().filter(|v| requirement.has(v)).count(),
        None => values.len(),
    }
}

/// Sum of requests of daemonset pods that would land on this pool's nodes.
fn daemon_overhead(pool: &NodePool, daemon_pods: &[Pod]) -> Resources {
    let pool_requirements = pool.scheduling_requirements();
    let mut overhead = Resources::default();
    for pod in daemon_pods {
        if !tolerates_all(&pod.tolerations, &pool.template.taints) {
            continue;
        }
        if !pod
            .scheduling_requirements()
            .compatible_with(&pool_requirements)
        {
            continue;
        }
        overhead.add(&pod.effective_requests());
    }
    overhead
}

/// Topology domains a pool can provide, derived from its offerings.
fn fallback_domains(instance_types: &[InstanceType]) -> BTreeMap<String, BTreeSet<String>> {
    let mut domains: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for instance_type in instance_types {
        for offering in instance_type.offerings.iter().filter(|o| o.available) {
            if let Some(zone) = offering.zone() {
                domains.entry(ZONE_LABEL.to_string()).or_default().insert(zone);
            }
        }
    }
    domains
}

/// Content hash of the pool's template, stamped onto claims so the record
/// reflects the template the simulator saw.
pub fn template_hash(pool: &NodePool) -> String {
    let canonical = serde_json::to_string(&pool.template).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Removes every preference from the pod, for the Ignore policy.
fn strip_preferences(pod: &mut Pod) {
    pod.topology_spread
        .retain(|c| c.when_unsatisfiable != UnsatisfiablePolicy::ScheduleAnyway);
    if let Some(affinity) = &mut pod.affinity {
        if let Some(node_affinity) = &mut affinity.node_affinity {
            node_affinity.preferred.clear();
        }
        if let Some(pod_affinity) = &mut affinity.pod_affinity {
            pod_affinity.preferred.clear();
        }
        if let Some(anti) = &mut affinity.pod_anti_affinity {
            anti.preferred.clear();
        }
    }
}

/// One relaxation step: preferences first (lowest weight out first), then
/// required OR-branches dropped from the end, never the last one.
fn relax(pod: &mut Pod, policy: PreferencePolicy) -> bool {
    if policy == PreferencePolicy::Respect {
        if let Some(affinity) = &mut pod.affinity {
            if let Some(node_affinity) = &mut affinity.node_affinity {
                if !node_affinity.preferred.is_empty() {
                    let lightest = node_affinity
                        .preferred
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, term)| term.weight)
                        .map(|(index, _)| index);
                    if let Some(index) = lightest {
                        node_affinity.preferred.remove(index);
                        return true;
                    }
                }
            }
        }
        if pod
            .topology_spread
            .iter()
            .any(|c| c.when_unsatisfiable == UnsatisfiablePolicy::ScheduleAnyway)
        {
            let index = pod
                .topology_spread
                .iter()
                .position(|c| c.when_unsatisfiable == UnsatisfiablePolicy::ScheduleAnyway)
                .unwrap();
            pod.topology_spread.remove(index);
            return true;
        }
        if let Some(affinity) = &mut pod.affinity {
            for group in [&mut affinity.pod_affinity, &mut affinity.pod_anti_affinity] {
                if let Some(group) = group {
                    if !group.preferred.is_empty() {
                        let lightest = group
                            .preferred
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, term)| term.weight)
                            .map(|(index, _)| index);
                        if let Some(index) = lightest {
                            group.preferred.remove(index);
                            return true;
                        }
                    }
                }
            }
        }
    }
    if let Some(affinity) = &mut pod.affinity {
        if let Some(node_affinity) = &mut affinity.node_affinity {
            if node_affinity.required.len() > 1 {
                node_affinity.required.pop();
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::scheduling::volume_topology::VolumeTopology;
    use models::condition::{set_condition, Condition, ConditionStatus, CONDITION_NODE_CLASS_READY, CONDITION_READY};
    use models::labels::{CAPACITY_TYPE_ON_DEMAND, INSTANCE_TYPE_LABEL};
    use models::pod::{Affinity, NodeAffinity, NodeSelectorTerm};
    use models::requirements::{Operator, Requirement};
    use models::volume::{ClaimPhase, PersistentVolume, PersistentVolumeClaim, StorageClass, VolumeSource};
    use std::time::Duration;

    fn ready_pool(name: &str, weight: i32) -> NodePool {
        let mut pool = NodePool::new(name, weight);
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

    fn it(name: &str, cpu: i64, zone: &str, price: f64) -> InstanceType {
        InstanceType::new(
            name,
            Resources::new(cpu, 16 << 30).with_pods(110),
            vec![Offering::new(CAPACITY_TYPE_ON_DEMAND, zone, price)],
        )
    }

    fn opts() -> SchedulerOptions {
        SchedulerOptions::from(&Options::default())
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn solve_one(
        scheduler_opts: SchedulerOptions,
        pools: Vec<(NodePool, Vec<InstanceType>, Resources)>,
        pods: Vec<Pod>,
    ) -> Results {
        let mut scheduler = Scheduler::new(scheduler_opts, pools, vec![], vec![], vec![]);
        scheduler.solve(pods, far_deadline())
    }

    #[tokio::test]
    async fn test_single_pod_single_offering() {
        let pool = ready_pool("default", 0);
        let instance = it("m5.large", 2000, "test-zone-1", 1.02);
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        let results = solve_one(
            opts(),
            vec![(pool, vec![instance], Resources::default())],
            vec![pod.clone()],
        );

        assert!(results.pod_errors.is_empty());
        assert_eq!(results.new_node_claims.len(), 1);
        let claim = &results.new_node_claims[0];
        assert_eq!(claim.nodepool, "default");
        assert_eq!(claim.pod_uids, vec![pod.uid]);
        assert!(!claim.min_values_relaxed());
        assert!(claim.annotations.contains_key(NODEPOOL_HASH_ANNOTATION));
        let names: Vec<String> = claim
            .requirements
            .iter()
            .filter(|r| r.key == INSTANCE_TYPE_LABEL)
            .flat_map(|r| r.values.clone())
            .collect();
        assert_eq!(names, vec!["m5.large".to_string()]);
    }

    #[tokio::test]
    async fn test_compatible_pods_pack_onto_one_claim() {
        let pool = ready_pool("default", 0);
        let instance = it("m5.2xlarge", 8000, "test-zone-1", 0.40);
        let pods = vec![
            Pod::new("a", "default", Resources::new(1000, 1 << 30)),
            Pod::new("b", "default", Resources::new(1000, 1 << 30)),
        ];

        let results = solve_one(
            opts(),
            vec![(pool, vec![instance], Resources::default())],
            pods,
        );

        assert_eq!(results.new_node_claims.len(), 1);
        assert_eq!(results.new_node_claims[0].pod_uids.len(), 2);
        assert_eq!(results.new_node_claims[0].resources.cpu_millis, 2000);
    }

    #[tokio::test]
    async fn test_cheapest_compatible_instance_wins() {
        let pool = ready_pool("default", 0);
        let expensive = it("m5.metal", 16000, "test-zone-1", 3.00);
        let cheap = it("m5.large", 2000, "test-zone-1", 0.50);
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        let results = solve_one(
            opts(),
            vec![(pool, vec![expensive, cheap], Resources::default())],
            vec![pod],
        );

        let claim = &results.new_node_claims[0];
        let names: Vec<String> = claim
            .requirements
            .iter()
            .filter(|r| r.key == INSTANCE_TYPE_LABEL)
            .flat_map(|r| r.values.clone())
            .collect();
        // Both stay compatible, but the cheapest leads the retained list.
        assert!(names.contains(&"m5.large".to_string()));
        assert!(names.contains(&"m5.metal".to_string()));
    }

    #[tokio::test]
    async fn test_determinism_under_instance_shuffle() {
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        let instances = vec![
            it("a.large", 2000, "test-zone-1", 0.30),
            it("b.large", 2000, "test-zone-1", 0.10),
            it("c.large", 2000, "test-zone-1", 0.20),
        ];
        let mut shuffled = instances.clone();
        shuffled.reverse();

        let first = solve_one(
            opts(),
            vec![(ready_pool("default", 0), instances, Resources::default())],
            vec![pod.clone()],
        );
        let second = solve_one(
            opts(),
            vec![(ready_pool("default", 0), shuffled, Resources::default())],
            vec![pod],
        );

        let names = |results: &Results| -> Vec<Vec<String>> {
            results
                .new_node_claims
                .iter()
                .map(|c| {
                    c.requirements
                        .iter()
                        .filter(|r| r.key == INSTANCE_TYPE_LABEL)
                        .flat_map(|r| r.values.clone())
                        .collect()
                })
                .collect()
        };
        assert_eq!(names(&first), names(&second));
        assert_eq!(first.pod_errors.len(), second.pod_errors.len());
    }

    #[tokio::test]
    async fn test_binds_to_existing_node_first() {
        let mut node = StateNode::new(
            "node-a",
            Resources::new(4000, 16 << 30).with_pods(110),
            Resources::new(4000, 16 << 30).with_pods(110),
        );
        node.labels
            .insert("disk".to_string(), "ssd".to_string());
        let mut pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        pod.node_selector
            .insert("disk".to_string(), "ssd".to_string());

        let mut scheduler = Scheduler::new(
            opts(),
            vec![(
                ready_pool("default", 0),
                vec![it("m5.large", 2000, "test-zone-1", 1.0)],
                Resources::default(),
            )],
            vec![node],
            vec![],
            vec![],
        );
        let results = scheduler.solve(vec![pod.clone()], far_deadline());

        assert!(results.new_node_claims.is_empty());
        assert_eq!(results.existing_node_pods["node-a"], vec![pod.uid]);
    }

    #[tokio::test]
    async fn test_min_values_strict_rejects() {
        let mut pool = ready_pool("default", 0);
        pool.requirements =
            vec![Requirement::exists(INSTANCE_TYPE_LABEL).with_min_values(3)];
        let instances = vec![
            it("a.large", 2000, "test-zone-1", 0.10),
            it("b.large", 2000, "test-zone-1", 0.20),
        ];
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        let results = solve_one(
            opts(),
            vec![(pool, instances, Resources::default())],
            vec![pod.clone()],
        );

        assert!(results.new_node_claims.is_empty());
        assert!(matches!(
            results.pod_errors[&pod.uid],
            SchedulingError::MinValuesUnsatisfied { required: 3, available: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_min_values_best_effort_relaxes_and_annotates() {
        let mut pool = ready_pool("default", 0);
        pool.requirements =
            vec![Requirement::exists(INSTANCE_TYPE_LABEL).with_min_values(3)];
        let instances = vec![
            it("a.large", 2000, "test-zone-1", 0.10),
            it("b.large", 2000, "test-zone-1", 0.20),
        ];
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        let mut scheduler_opts = opts();
        scheduler_opts.min_values_policy = MinValuesPolicy::BestEffort;
        let results = solve_one(
            scheduler_opts,
            vec![(pool, instances, Resources::default())],
            vec![pod],
        );

        assert_eq!(results.new_node_claims.len(), 1);
        let claim = &results.new_node_claims[0];
        assert!(claim.min_values_relaxed());
        let stored = claim
            .requirements
            .iter()
            .find(|r| r.key == INSTANCE_TYPE_LABEL)
            .unwrap();
        assert_eq!(stored.min_values, Some(2));
    }

    #[tokio::test]
    async fn test_best_effort_prefers_pool_needing_no_relaxation() {
        let mut heavy = ready_pool("heavy", 100);
        heavy.requirements =
            vec![Requirement::exists(INSTANCE_TYPE_LABEL).with_min_values(3)];
        let light = ready_pool("light", 1);
        let instances = vec![
            it("a.large", 2000, "test-zone-1", 0.10),
            it("b.large", 2000, "test-zone-1", 0.20),
        ];
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        let mut scheduler_opts = opts();
        scheduler_opts.min_values_policy = MinValuesPolicy::BestEffort;
        let results = solve_one(
            scheduler_opts,
            vec![
                (heavy, instances.clone(), Resources::default()),
                (light, instances, Resources::default()),
            ],
            vec![pod],
        );

        let claim = &results.new_node_claims[0];
        // The lower-weight pool wins because it needs no relaxation.
        assert_eq!(claim.nodepool, "light");
        assert!(!claim.min_values_relaxed());
    }

    #[tokio::test]
    async fn test_bound_volume_zone_intersects_pod_selector() {
        let registry = Registry::new();
        registry.upsert_storage_class(StorageClass {
            name: "standard".to_string(),
            provisioner: "ebs.csi.aws.com".to_string(),
            zones: None,
        });
        registry.upsert_volume(PersistentVolume {
            name: "pv-1".to_string(),
            node_affinity: vec![Requirement::in_values(ZONE_LABEL, &["test-zone-3"])],
            source: VolumeSource::Csi { driver: "ebs".to_string() },
        });
        registry.upsert_claim(PersistentVolumeClaim {
            name: "data".to_string(),
            namespace: "default".to_string(),
            storage_class: Some("standard".to_string()),
            volume_name: Some("pv-1".to_string()),
            phase: ClaimPhase::Bound,
        });

        let mut pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        pod.volume_claims = vec!["data".to_string()];
        pod.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required: vec![NodeSelectorTerm {
                    match_expressions: vec![Requirement::in_values(
                        ZONE_LABEL,
                        &["test-zone-1", "test-zone-3"],
                    )],
                }],
                preferred: vec![],
            }),
            ..Default::default()
        });
        VolumeTopology::new(registry).inject(&mut pod).unwrap();

        let instances = vec![
            it("m5.large", 2000, "test-zone-1", 0.10),
            it("m5.large-z3", 2000, "test-zone-3", 0.20),
        ];
        let results = solve_one(
            opts(),
            vec![(ready_pool("default", 0), instances, Resources::default())],
            vec![pod],
        );

        assert_eq!(results.new_node_claims.len(), 1);
        let claim = &results.new_node_claims[0];
        let zone = claim
            .requirements
            .iter()
            .find(|r| r.key == ZONE_LABEL)
            .unwrap();
        assert_eq!(zone.values, vec!["test-zone-3".to_string()]);
        let names: Vec<String> = claim
            .requirements
            .iter()
            .filter(|r| r.key == INSTANCE_TYPE_LABEL)
            .flat_map(|r| r.values.clone())
            .collect();
        assert_eq!(names, vec!["m5.large-z3".to_string()]);
    }

    #[tokio::test]
    async fn test_reserved_exhaustion_defers_when_fallback_disabled() {
        let mut instance = it("m5.large", 2000, "test-zone-1", 1.00);
        instance
            .offerings
            .push(Offering::reserved("test-zone-1", "r-1", 0.10, 1));
        // Each pod fills a whole instance, forcing two claims.
        let pods = vec![
            Pod::new("a", "default", Resources::new(1800, 1 << 30)),
            Pod::new("b", "default", Resources::new(1800, 1 << 30)),
        ];

        let mut scheduler_opts = opts();
        scheduler_opts.disable_reserved_capacity_fallback = true;
        let results = solve_one(
            scheduler_opts,
            vec![(ready_pool("default", 0), vec![instance.clone()], Resources::default())],
            pods.clone(),
        );

        assert_eq!(results.new_node_claims.len(), 1);
        assert_eq!(results.reserved_offering_errors.len(), 1);
        assert!(results.pod_errors.is_empty());

        // With fallback allowed the second pod lands on-demand.
        let results = solve_one(
            opts(),
            vec![(ready_pool("default", 0), vec![instance], Resources::default())],
            pods,
        );
        assert_eq!(results.new_node_claims.len(), 2);
        assert!(results.reserved_offering_errors.is_empty());
    }

    #[tokio::test]
    async fn test_heavier_pool_wins() {
        let heavy = ready_pool("heavy", 50);
        let light = ready_pool("light", 1);
        let instances = vec![it("m5.large", 2000, "test-zone-1", 0.10)];
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        let results = solve_one(
            opts(),
            vec![
                (light, instances.clone(), Resources::default()),
                (heavy, instances, Resources::default()),
            ],
            vec![pod],
        );
        assert_eq!(results.new_node_claims[0].nodepool, "heavy");
    }

    #[tokio::test]
    async fn test_limits_cap_claim_creation() {
        let mut pool = ready_pool("default", 0);
        pool.limits = Some(Resources::new(2000, 0));
        let instances = vec![it("m5.large", 2000, "test-zone-1", 0.10)];
        let pods = vec![
            Pod::new("a", "default", Resources::new(1800, 1 << 30)),
            Pod::new("b", "default", Resources::new(1800, 1 << 30)),
        ];

        let results = solve_one(
            opts(),
            vec![(pool, instances, Resources::default())],
            pods,
        );

        assert_eq!(results.new_node_claims.len(), 1);
        assert_eq!(results.pod_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_truncation_keeps_cheapest() {
        let instances = vec![
            it("a.large", 2000, "test-zone-1", 0.30),
            it("b.large", 2000, "test-zone-1", 0.10),
            it("c.large", 2000, "test-zone-1", 0.20),
        ];
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        let mut scheduler_opts = opts();
        scheduler_opts.max_instance_types = 2;
        let results = solve_one(
            scheduler_opts,
            vec![(ready_pool("default", 0), instances, Resources::default())],
            vec![pod],
        );

        let names: Vec<String> = results.new_node_claims[0]
            .requirements
            .iter()
            .filter(|r| r.key == INSTANCE_TYPE_LABEL)
            .flat_map(|r| r.values.clone())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"b.large".to_string()));
        assert!(names.contains(&"c.large".to_string()));
        assert!(!names.contains(&"a.large".to_string()));
    }

    #[tokio::test]
    async fn test_prefer_no_schedule_pool_is_last_resort() {
        let mut soft_tainted = ready_pool("soft", 100);
        soft_tainted.template.taints.push(models::pod::Taint {
            key: "flaky".to_string(),
            value: None,
            effect: models::pod::TaintEffect::PreferNoSchedule,
        });
        let normal = ready_pool("normal", 1);
        let instances = vec![it("m5.large", 2000, "test-zone-1", 0.10)];
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        // Despite its weight, the PreferNoSchedule pool loses to a normal
        // pool that fits.
        let results = solve_one(
            opts(),
            vec![
                (soft_tainted.clone(), instances.clone(), Resources::default()),
                (normal, instances.clone(), Resources::default()),
            ],
            vec![pod.clone()],
        );
        assert_eq!(results.new_node_claims[0].nodepool, "normal");

        // With no other pool it is still usable.
        let results = solve_one(
            opts(),
            vec![(soft_tainted, instances, Resources::default())],
            vec![pod],
        );
        assert_eq!(results.new_node_claims[0].nodepool, "soft");
    }

    #[tokio::test]
    async fn test_daemon_overhead_is_added_to_claims() {
        let mut daemon = Pod::new("log-agent", "kube-system", Resources::new(200, 256 << 20));
        daemon.owner_daemonset = true;
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));

        let mut scheduler = Scheduler::new(
            opts(),
            vec![(
                ready_pool("default", 0),
                vec![it("m5.large", 2000, "test-zone-1", 0.10)],
                Resources::default(),
            )],
            vec![],
            vec![daemon],
            vec![],
        );
        let results = scheduler.solve(vec![pod], far_deadline());

        assert_eq!(results.new_node_claims[0].resources.cpu_millis, 700);
    }

    #[tokio::test]
    async fn test_required_term_relaxation_drops_from_the_end() {
        let mut pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        pod.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required: vec![
                    NodeSelectorTerm {
                        match_expressions: vec![Requirement::in_values("disk", &["ssd"])],
                    },
                    // The active (last) branch is unsatisfiable.
                    NodeSelectorTerm {
                        match_expressions: vec![Requirement::in_values("never", &["matches"])],
                    },
                ],
                preferred: vec![],
            }),
            ..Default::default()
        });
        let mut pool = ready_pool("default", 0);
        pool.template
            .labels
            .insert("disk".to_string(), "ssd".to_string());

        let results = solve_one(
            opts(),
            vec![(pool, vec![it("m5.large", 2000, "test-zone-1", 0.10)], Resources::default())],
            vec![pod],
        );

        // The unsatisfiable trailing branch is dropped; the first branch
        // matches the pool's template labels.
        assert_eq!(results.new_node_claims.len(), 1);
        assert!(results.pod_errors.is_empty());
    }

    #[tokio::test]
    async fn test_pod_requiring_label_absence_cannot_use_pools() {
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

        let results = solve_one(
            opts(),
            vec![(ready_pool("default", 0), vec![it("m5.large", 2000, "test-zone-1", 0.10)], Resources::default())],
            vec![pod.clone()],
        );
        assert!(matches!(
            results.pod_errors[&pod.uid],
            SchedulingError::Incompatible(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_leaves_pods_undecided() {
        let pod = Pod::new("web", "default", Resources::new(500, 1 << 30));
        let mut scheduler = Scheduler::new(
            opts(),
            vec![(
                ready_pool("default", 0),
                vec![it("m5.large", 2000, "test-zone-1", 0.10)],
                Resources::default(),
            )],
            vec![],
            vec![],
            vec![],
        );
        let results = scheduler.solve(vec![pod.clone()], Instant::now());
        assert_eq!(results.undecided, vec![pod.uid]);
        assert!(results.new_node_claims.is_empty());
    }
}
