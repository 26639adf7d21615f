use std::collections::{BTreeMap, BTreeSet, HashMap};

use models::pod::{Pod, PodAffinityTerm, TopologySpreadConstraint, UnsatisfiablePolicy};
use models::requirements::{KeyRequirement, Requirement, Requirements};

/// Identity of a counting group: every constraint over the same
/// (topology key, label selector) pair shares one set of domain counts.
fn group_id(topology_key: &str, selector: &HashMap<String, String>) -> String {
    let mut parts: Vec<String> = selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    parts.sort();
    format!("{}|{}", topology_key, parts.join(","))
}

#[derive(Debug, Default, Clone)]
struct DomainCounts {
    topology_key: String,
    selector: HashMap<String, String>,
    counts: BTreeMap<String, i64>,
}

impl DomainCounts {
    fn min_count(&self) -> i64 {
        self.counts.values().copied().min().unwrap_or(0)
    }
}

/// An undo record for one tentative placement; dropping the placed pod
/// rolls the counts back.
#[derive(Debug, Default)]
pub struct TopologyTicket {
    increments: Vec<(String, String)>,
}

/// Per-pass accounting of topology-spread and pod-(anti-)affinity domains.
///
/// The tracker is transactional: each tentative placement returns a ticket
/// that `rollback` undoes when that branch of the search fails. It is only
/// ever used single-threaded within one solve.
pub struct Topology {
    groups: HashMap<String, DomainCounts>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    /// Registers the counting groups a pod's constraints refer to. Must be
    /// called for every pod in the pass before seeding existing pods.
    pub fn register_pod(&mut self, pod: &Pod) {
        for constraint in &pod.topology_spread {
            self.ensure_group(&constraint.topology_key, &constraint.label_selector);
        }
        for term in self.affinity_terms(pod) {
            self.ensure_group(&term.topology_key, &term.label_selector);
        }
    }

    fn affinity_terms<'a>(&self, pod: &'a Pod) -> Vec<&'a PodAffinityTerm> {
        let mut terms = Vec::new();
        if let Some(affinity) = &pod.affinity {
            if let Some(pod_affinity) = &affinity.pod_affinity {
                terms.extend(pod_affinity.required.iter());
                terms.extend(pod_affinity.preferred.iter().map(|w| &w.term));
            }
            if let Some(anti) = &affinity.pod_anti_affinity {
                terms.extend(anti.required.iter());
                terms.extend(anti.preferred.iter().map(|w| &w.term));
            }
        }
        terms
    }

    fn ensure_group(&mut self, topology_key: &str, selector: &HashMap<String, String>) {
        let id = group_id(topology_key, selector);
        self.groups.entry(id).or_insert_with(|| DomainCounts {
            topology_key: topology_key.to_string(),
            selector: selector.clone(),
            counts: BTreeMap::new(),
        });
    }

    /// Counts an already-placed pod into every group whose selector it
    /// matches, and registers the node's domains so empty domains still
    /// participate in skew minimums.
    pub fn seed(&mut self, pod: &Pod, node_labels: &HashMap<String, String>) {
        for group in self.groups.values_mut() {
            if let Some(domain) = node_labels.get(&group.topology_key) {
                let entry = group.counts.entry(domain.clone()).or_insert(0);
                if pod.matches_selector(&group.selector) {
                    *entry += 1;
                }
            }
        }
    }

    /// Registers domains a node exposes without counting any pod.
    pub fn register_domains(&mut self, node_labels: &HashMap<String, String>) {
        for group in self.groups.values_mut() {
            if let Some(domain) = node_labels.get(&group.topology_key) {
                group.counts.entry(domain.clone()).or_insert(0);
            }
        }
    }

    /// Whether placing `pod` on a node with these concrete labels keeps
    /// every spread and (anti-)affinity constraint satisfiable.
    pub fn check(&mut self, pod: &Pod, node_labels: &HashMap<String, String>) -> bool {
        for constraint in &pod.topology_spread {
            if !self.check_spread(pod, constraint, node_labels.get(&constraint.topology_key)) {
                return false;
            }
        }
        self.check_affinities(pod, |key| node_labels.get(key).cloned())
    }

    /// Like `check`, but for a hypothetical node described by requirements.
    /// Domains are resolved from pinned requirements, then labels, then the
    /// allowed value sets, then `fallback_domains`; the chosen domain is
    /// pinned back into the requirements so the claim stays committed to it.
    pub fn check_and_pin(
        &mut self,
        pod: &Pod,
        requirements: &mut Requirements,
        node_labels: &HashMap<String, String>,
        fallback_domains: &BTreeMap<String, BTreeSet<String>>,
    ) -> bool {
        for constraint in &pod.topology_spread {
            let key = constraint.topology_key.clone();
            let candidates = self.candidate_domains(requirements, node_labels, fallback_domains, &key);
            let Some(candidates) = candidates else {
                // No way to know the domain of the future node.
                if constraint.when_unsatisfiable == UnsatisfiablePolicy::DoNotSchedule {
                    return false;
                }
                continue;
            };
            // Prefer the least-loaded domain that keeps the skew bound.
            let id = group_id(&key, &constraint.label_selector);
            let chosen = {
                let group = self.groups.get(&id).cloned().unwrap_or_default();
                let mut best: Option<(i64, String)> = None;
                for domain in &candidates {
                    let count = group.counts.get(domain).copied().unwrap_or(0);
                    if best.as_ref().map(|(c, _)| count < *c).unwrap_or(true) {
                        best = Some((count, domain.clone()));
                    }
                }
                best
            };
            let Some((_, domain)) = chosen else { return false };
            if !self.check_spread(pod, constraint, Some(&domain)) {
                if constraint.when_unsatisfiable == UnsatisfiablePolicy::DoNotSchedule {
                    return false;
                }
                continue;
            }
            requirements.add(KeyRequirement::from_requirement(&Requirement::in_values(
                &key,
                &[domain.as_str()],
            )));
        }
        let requirements_view = requirements.clone();
        self.check_affinities(pod, |key| {
            requirements_view
                .label_value(key)
                .or_else(|| node_labels.get(key).cloned())
        })
    }

    fn candidate_domains(
        &mut self,
        requirements: &Requirements,
        node_labels: &HashMap<String, String>,
        fallback_domains: &BTreeMap<String, BTreeSet<String>>,
        key: &str,
    ) -> Option<Vec<String>> {
        if let Some(pinned) = requirements.label_value(key) {
            return Some(vec![pinned]);
        }
        if let Some(label) = node_labels.get(key) {
            return Some(vec![label.clone()]);
        }
        if let Some(requirement) = requirements.get(key) {
            if let Some(allowed) = requirement.allowed_values() {
                if !allowed.is_empty() {
                    return Some(allowed);
                }
            }
        }
        fallback_domains
            .get(key)
            .filter(|domains| !domains.is_empty())
            .map(|domains| domains.iter().cloned().collect())
    }

    fn check_spread(
        &mut self,
        pod: &Pod,
        constraint: &TopologySpreadConstraint,
        domain: Option<&String>,
    ) -> bool {
        let Some(domain) = domain else {
            // A node without the topology key cannot honor a hard spread.
            return constraint.when_unsatisfiable != UnsatisfiablePolicy::DoNotSchedule;
        };
        if !pod.matches_selector(&constraint.label_selector) {
            return true;
        }
        let id = group_id(&constraint.topology_key, &constraint.label_selector);
        self.ensure_group(&constraint.topology_key, &constraint.label_selector);
        let group = self.groups.get_mut(&id).unwrap();
        group.counts.entry(domain.clone()).or_insert(0);
        let count = group.counts[domain];
        let skew = count + 1 - group.min_count();
        skew <= constraint.max_skew
    }

    fn check_affinities(
        &mut self,
        pod: &Pod,
        domain_of: impl Fn(&str) -> Option<String>,
    ) -> bool {
        let Some(affinity) = &pod.affinity else { return true };
        if let Some(pod_affinity) = &affinity.pod_affinity {
            let terms: Vec<&PodAffinityTerm> = pod_affinity
                .required
                .iter()
                .chain(pod_affinity.preferred.iter().map(|w| &w.term))
                .collect();
            for term in terms {
                let Some(domain) = domain_of(&term.topology_key) else {
                    return false;
                };
                let id = group_id(&term.topology_key, &term.label_selector);
                self.ensure_group(&term.topology_key, &term.label_selector);
                let group = &self.groups[&id];
                let count = group.counts.get(&domain).copied().unwrap_or(0);
                let group_empty: i64 = group.counts.values().sum();
                // A pod matching its own affinity selector may seed the
                // first domain.
                if count == 0 && !(group_empty == 0 && pod.matches_selector(&term.label_selector)) {
                    return false;
                }
            }
        }
        if let Some(anti) = &affinity.pod_anti_affinity {
            let terms: Vec<&PodAffinityTerm> = anti
                .required
                .iter()
                .chain(anti.preferred.iter().map(|w| &w.term))
                .collect();
            for term in terms {
                let Some(domain) = domain_of(&term.topology_key) else {
                    return false;
                };
                let id = group_id(&term.topology_key, &term.label_selector);
                self.ensure_group(&term.topology_key, &term.label_selector);
                let count = self.groups[&id].counts.get(&domain).copied().unwrap_or(0);
                if count > 0 {
                    return false;
                }
            }
        }
        true
    }

    /// Commits a tentative placement: counts the pod into every group its
    /// labels match, at the domain the landing node resolves for the
    /// group's key.
    pub fn record(
        &mut self,
        pod: &Pod,
        domain_of: impl Fn(&str) -> Option<String>,
    ) -> TopologyTicket {
        let mut ticket = TopologyTicket::default();
        for (id, group) in self.groups.iter_mut() {
            if !pod.matches_selector(&group.selector) {
                continue;
            }
            if let Some(domain) = domain_of(&group.topology_key) {
                *group.counts.entry(domain.clone()).or_insert(0) += 1;
                ticket.increments.push((id.clone(), domain));
            }
        }
        ticket
    }

    pub fn rollback(&mut self, ticket: TopologyTicket) {
        for (id, domain) in ticket.increments {
            if let Some(group) = self.groups.get_mut(&id) {
                if let Some(count) = group.counts.get_mut(&domain) {
                    *count = (*count - 1).max(0);
                }
            }
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}
