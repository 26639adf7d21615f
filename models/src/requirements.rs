use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Node-selector style operators, as used by pods, node pools and overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

/// A single labeled requirement as authored on an API object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
    /// Minimum number of distinct values for this key that must survive
    /// instance-type selection. Only meaningful on node pool requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<usize>,
}

impl Requirement {
    pub fn new(key: &str, operator: Operator, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
            min_values: None,
        }
    }

    pub fn in_values(key: &str, values: &[&str]) -> Self {
        Self::new(key, Operator::In, values)
    }

    pub fn exists(key: &str) -> Self {
        Self::new(key, Operator::Exists, &[])
    }

    pub fn with_min_values(mut self, min_values: usize) -> Self {
        self.min_values = Some(min_values);
        self
    }
}

/// The allowed-value set of a normalized requirement: either a finite set
/// of permitted values or the complement of a finite set of excluded ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueSet {
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
}

/// A requirement normalized for intersection and matching.
///
/// `Exists` is the complement of the empty set with existence required;
/// `DoesNotExist` is the empty allow-set with existence not required. `Gt`
/// and `Lt` keep their numeric bounds alongside the value set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRequirement {
    pub key: String,
    pub values: ValueSet,
    pub requires_existence: bool,
    pub greater_than: Option<i64>,
    pub less_than: Option<i64>,
    pub min_values: Option<usize>,
}

impl KeyRequirement {
    pub fn from_requirement(req: &Requirement) -> Self {
        let set: BTreeSet<String> = req.values.iter().cloned().collect();
        let (values, requires_existence, greater_than, less_than) = match req.operator {
            Operator::In => (ValueSet::In(set), true, None, None),
            Operator::NotIn => (ValueSet::NotIn(set), false, None, None),
            Operator::Exists => (ValueSet::NotIn(BTreeSet::new()), true, None, None),
            Operator::DoesNotExist => (ValueSet::In(BTreeSet::new()), false, None, None),
            Operator::Gt => (
                ValueSet::NotIn(BTreeSet::new()),
                true,
                req.values.first().and_then(|v| v.parse().ok()),
                None,
            ),
            Operator::Lt => (
                ValueSet::NotIn(BTreeSet::new()),
                true,
                None,
                req.values.first().and_then(|v| v.parse().ok()),
            ),
        };
        Self {
            key: req.key.clone(),
            values,
            requires_existence,
            greater_than,
            less_than,
            min_values: req.min_values,
        }
    }

    fn within_bounds(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        let Ok(number) = value.parse::<i64>() else {
            return false;
        };
        if let Some(gt) = self.greater_than {
            if number <= gt {
                return false;
            }
        }
        if let Some(lt) = self.less_than {
            if number >= lt {
                return false;
            }
        }
        true
    }

    /// Whether a concrete label value satisfies this requirement.
    pub fn has(&self, value: &str) -> bool {
        if !self.within_bounds(value) {
            return false;
        }
        match &self.values {
            ValueSet::In(set) => set.contains(value),
            ValueSet::NotIn(set) => !set.contains(value),
        }
    }

    /// Whether a node label (possibly absent) satisfies this requirement,
    /// with the standard treatment of absent keys: `NotIn` and
    /// `DoesNotExist` match, everything that requires existence does not.
    pub fn satisfied_by(&self, value: Option<&str>) -> bool {
        match value {
            Some(v) => self.has(v),
            None => !self.requires_existence,
        }
    }

    /// `DoesNotExist`: nothing may exist, and that is acceptable.
    pub fn forbids_existence(&self) -> bool {
        !self.requires_existence && matches!(&self.values, ValueSet::In(set) if set.is_empty())
    }

    /// Existence is demanded but no value can satisfy the requirement.
    pub fn is_impossible(&self) -> bool {
        if !self.requires_existence {
            return false;
        }
        match &self.values {
            ValueSet::In(set) => !set.iter().any(|v| self.within_bounds(v)),
            ValueSet::NotIn(_) => {
                matches!((self.greater_than, self.less_than), (Some(gt), Some(lt)) if lt <= gt + 1)
            }
        }
    }

    pub fn intersect(&self, other: &KeyRequirement) -> KeyRequirement {
        let greater_than = match (self.greater_than, other.greater_than) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let values = match (&self.values, &other.values) {
            (ValueSet::In(a), ValueSet::In(b)) => {
                ValueSet::In(a.intersection(b).cloned().collect())
            }
            (ValueSet::In(a), ValueSet::NotIn(b)) | (ValueSet::NotIn(b), ValueSet::In(a)) => {
                ValueSet::In(a.difference(b).cloned().collect())
            }
            (ValueSet::NotIn(a), ValueSet::NotIn(b)) => {
                ValueSet::NotIn(a.union(b).cloned().collect())
            }
        };
        let min_values = match (self.min_values, other.min_values) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        KeyRequirement {
            key: self.key.clone(),
            values,
            requires_existence: self.requires_existence || other.requires_existence,
            greater_than,
            less_than,
            min_values,
        }
    }

    /// Lowers the normalized form back to API requirements.
    pub fn to_requirements(&self) -> Vec<Requirement> {
        let mut out = Vec::new();
        match &self.values {
            ValueSet::In(set) if set.is_empty() && !self.requires_existence => {
                out.push(Requirement {
                    key: self.key.clone(),
                    operator: Operator::DoesNotExist,
                    values: Vec::new(),
                    min_values: self.min_values,
                });
                return out;
            }
            ValueSet::In(set) => {
                out.push(Requirement {
                    key: self.key.clone(),
                    operator: Operator::In,
                    values: set.iter().cloned().collect(),
                    min_values: self.min_values,
                });
            }
            ValueSet::NotIn(set) => {
                let operator = if set.is_empty() && self.requires_existence {
                    Operator::Exists
                } else {
                    Operator::NotIn
                };
                out.push(Requirement {
                    key: self.key.clone(),
                    operator,
                    values: set.iter().cloned().collect(),
                    min_values: self.min_values,
                });
            }
        }
        if let Some(gt) = self.greater_than {
            out.push(Requirement::new(&self.key, Operator::Gt, &[&gt.to_string()]));
        }
        if let Some(lt) = self.less_than {
            out.push(Requirement::new(&self.key, Operator::Lt, &[&lt.to_string()]));
        }
        out
    }

    /// The single allowed value, when the requirement pins exactly one.
    pub fn single_value(&self) -> Option<&str> {
        match &self.values {
            ValueSet::In(set) if set.len() == 1 => set.iter().next().map(|s| s.as_str()),
            _ => None,
        }
    }

    /// The allowed values, when finite.
    pub fn allowed_values(&self) -> Option<Vec<String>> {
        match &self.values {
            ValueSet::In(set) => Some(set.iter().filter(|v| self.within_bounds(v)).cloned().collect()),
            ValueSet::NotIn(_) => None,
        }
    }
}

/// A normalized, intersected set of requirements keyed by label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    map: BTreeMap<String, KeyRequirement>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_requirements(reqs: &[Requirement]) -> Self {
        let mut out = Self::new();
        for req in reqs {
            out.add(KeyRequirement::from_requirement(req));
        }
        out
    }

    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        let mut out = Self::new();
        for (key, value) in labels {
            out.add(KeyRequirement::from_requirement(&Requirement::in_values(
                key,
                &[value.as_str()],
            )));
        }
        out
    }

    /// Adds a requirement, intersecting with any existing one for the key.
    pub fn add(&mut self, req: KeyRequirement) {
        match self.map.remove(&req.key) {
            Some(existing) => {
                let merged = existing.intersect(&req);
                self.map.insert(req.key.clone(), merged);
            }
            None => {
                self.map.insert(req.key.clone(), req);
            }
        }
    }

    pub fn add_requirement(&mut self, req: &Requirement) {
        self.add(KeyRequirement::from_requirement(req));
    }

    pub fn get(&self, key: &str) -> Option<&KeyRequirement> {
        self.map.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &KeyRequirement)> {
        self.map.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn intersect(&self, other: &Requirements) -> Requirements {
        let mut out = self.clone();
        for req in other.map.values() {
            out.add(req.clone());
        }
        out
    }

    /// The first key whose intersected requirement cannot be satisfied by
    /// any label value, if any.
    pub fn impossible_key(&self) -> Option<&str> {
        self.map
            .values()
            .find(|req| req.is_impossible())
            .map(|req| req.key.as_str())
    }

    /// Whether the two requirement sets can both be satisfied by a single
    /// hypothetical node. Keys present on only one side are unconstrained
    /// on the other.
    pub fn compatible_with(&self, other: &Requirements) -> bool {
        for (key, mine) in &self.map {
            if let Some(theirs) = other.map.get(key) {
                // DoesNotExist against In collapses to an empty allow-set
                // with existence required, which is_impossible flags.
                if mine.intersect(theirs).is_impossible() {
                    return false;
                }
            }
        }
        true
    }

    /// Whether a concrete label map satisfies every requirement.
    pub fn satisfied_by_labels(&self, labels: &HashMap<String, String>) -> bool {
        self.map
            .values()
            .all(|req| req.satisfied_by(labels.get(&req.key).map(|v| v.as_str())))
    }

    /// The pinned value for a key, when the requirements allow exactly one.
    pub fn label_value(&self, key: &str) -> Option<String> {
        self.map
            .get(key)
            .and_then(|req| req.single_value().map(|s| s.to_string()))
    }

    /// Lowers the whole set back to API requirements.
    pub fn to_requirement_vec(&self) -> Vec<Requirement> {
        self.map.values().flat_map(|r| r.to_requirements()).collect()
    }

    /// Replaces the min-values constraint on a key, keeping the rest.
    pub fn set_min_values(&mut self, key: &str, min_values: Option<usize>) {
        if let Some(requirement) = self.map.get_mut(key) {
            requirement.min_values = min_values;
        }
    }

    /// All keys carrying a min-values constraint, with the effective
    /// (maximum) constraint per key.
    pub fn min_values(&self) -> BTreeMap<String, usize> {
        self.map
            .iter()
            .filter_map(|(key, req)| req.min_values.map(|m| (key.clone(), m)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_in_intersection() {
        let a = KeyRequirement::from_requirement(&Requirement::in_values("zone", &["a", "b"]));
        let b = KeyRequirement::from_requirement(&Requirement::in_values("zone", &["b", "c"]));
        let merged = a.intersect(&b);
        assert_eq!(merged.single_value(), Some("b"));
        assert!(!merged.is_impossible());

        let c = KeyRequirement::from_requirement(&Requirement::in_values("zone", &["d"]));
        assert!(a.intersect(&c).is_impossible());
    }

    #[test]
    fn test_not_in_and_exists() {
        let not_in =
            KeyRequirement::from_requirement(&Requirement::new("arch", Operator::NotIn, &["arm64"]));
        assert!(not_in.satisfied_by(None));
        assert!(not_in.satisfied_by(Some("amd64")));
        assert!(!not_in.satisfied_by(Some("arm64")));

        let exists = KeyRequirement::from_requirement(&Requirement::exists("arch"));
        assert!(!exists.satisfied_by(None));
        assert!(exists.satisfied_by(Some("amd64")));
    }

    #[test]
    fn test_does_not_exist_conflicts_with_in() {
        let mut a = Requirements::new();
        a.add_requirement(&Requirement::new("gantry.sh/nodepool", Operator::DoesNotExist, &[]));
        let mut b = Requirements::new();
        b.add_requirement(&Requirement::in_values("gantry.sh/nodepool", &["default"]));
        assert!(!a.compatible_with(&b));

        let mut c = Requirements::new();
        c.add_requirement(&Requirement::new("gantry.sh/nodepool", Operator::DoesNotExist, &[]));
        assert!(a.compatible_with(&c));
    }

    #[test]
    fn test_numeric_bounds() {
        let gt = KeyRequirement::from_requirement(&Requirement::new("cpu", Operator::Gt, &["4"]));
        assert!(gt.has("8"));
        assert!(!gt.has("4"));
        assert!(!gt.has("not-a-number"));

        let lt = KeyRequirement::from_requirement(&Requirement::new("cpu", Operator::Lt, &["6"]));
        let merged = gt.intersect(&lt);
        assert!(merged.has("5"));
        assert!(!merged.has("6"));
        assert!(!merged.is_impossible());

        let lt5 = KeyRequirement::from_requirement(&Requirement::new("cpu", Operator::Lt, &["5"]));
        assert!(gt.intersect(&lt5).is_impossible());
    }

    #[test]
    fn test_satisfied_by_labels() {
        let mut reqs = Requirements::new();
        reqs.add_requirement(&Requirement::in_values("zone", &["a", "b"]));
        reqs.add_requirement(&Requirement::new("spot", Operator::DoesNotExist, &[]));
        assert!(reqs.satisfied_by_labels(&labels(&[("zone", "a")])));
        assert!(!reqs.satisfied_by_labels(&labels(&[("zone", "c")])));
        assert!(!reqs.satisfied_by_labels(&labels(&[("zone", "a"), ("spot", "true")])));
    }

    #[test]
    fn test_requirement_wire_shape() {
        // The shape user-authored requirements arrive in.
        let req: Requirement = serde_json::from_str(
            r#"{"key":"kubernetes.io/arch","operator":"In","values":["arm64"]}"#,
        )
        .unwrap();
        assert_eq!(req.operator, Operator::In);
        assert_eq!(req.values, vec!["arm64".to_string()]);
        assert_eq!(req.min_values, None);
    }

    #[test]
    fn test_min_values_takes_maximum() {
        let mut reqs = Requirements::new();
        reqs.add_requirement(
            &Requirement::in_values("type", &["a", "b", "c"]).with_min_values(2),
        );
        reqs.add_requirement(&Requirement::exists("type").with_min_values(3));
        assert_eq!(reqs.min_values()["type"], 3);
    }
}
