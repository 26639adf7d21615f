use std::env;
use std::time::Duration;

/// How preferred affinities, preferred anti-affinities and ScheduleAnyway
/// spread constraints are treated during simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferencePolicy {
    /// Honor preferences, relaxing them one at a time when placement fails.
    Respect,
    /// Strip all preferences before simulation.
    Ignore,
}

/// How min-values constraints behave when the compatible instance-type set
/// cannot satisfy them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinValuesPolicy {
    /// The node pool is unusable for the pod.
    Strict,
    /// Relax downward to the largest achievable value >= 1 and flag the
    /// resulting claim.
    BestEffort,
}

/// Process-wide settings, loaded once from the environment and threaded
/// through constructors.
#[derive(Debug, Clone)]
pub struct Options {
    /// Silence window after which an open batch closes.
    pub batch_idle_duration: Duration,
    /// Hard ceiling on one batching window.
    pub batch_max_duration: Duration,
    pub preference_policy: PreferencePolicy,
    pub min_values_policy: MinValuesPolicy,
    /// When true, pods whose reserved capacity is exhausted within a pass
    /// are deferred instead of falling back to on-demand.
    pub disable_reserved_capacity_fallback: bool,
    /// Milli-CPU available to this process; scales reconcile concurrency.
    pub cpu_requests: i64,
    /// Per-claim ceiling on the instance-type list.
    pub max_instance_types: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            batch_idle_duration: Duration::from_secs(1),
            batch_max_duration: Duration::from_secs(10),
            preference_policy: PreferencePolicy::Respect,
            min_values_policy: MinValuesPolicy::Strict,
            disable_reserved_capacity_fallback: false,
            cpu_requests: num_cpus::get() as i64 * 1000,
            max_instance_types: 60,
        }
    }
}

impl Options {
    /// Builds options from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_idle_duration: env_millis("BATCH_IDLE_DURATION_MS")
                .unwrap_or(defaults.batch_idle_duration),
            batch_max_duration: env_millis("BATCH_MAX_DURATION_MS")
                .unwrap_or(defaults.batch_max_duration),
            preference_policy: match env::var("PREFERENCE_POLICY").as_deref() {
                Ok("Ignore") => PreferencePolicy::Ignore,
                _ => defaults.preference_policy,
            },
            min_values_policy: match env::var("MIN_VALUES_POLICY").as_deref() {
                Ok("BestEffort") => MinValuesPolicy::BestEffort,
                _ => defaults.min_values_policy,
            },
            disable_reserved_capacity_fallback: env::var("DISABLE_RESERVED_CAPACITY_FALLBACK")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.disable_reserved_capacity_fallback),
            cpu_requests: env::var("CPU_REQUESTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cpu_requests),
            max_instance_types: env::var("MAX_INSTANCE_TYPES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_instance_types),
        }
    }

    /// ceil(cpu_requests / 1000), never below one.
    pub fn num_concurrent_reconciles(&self) -> usize {
        (((self.cpu_requests + 999) / 1000).max(1)) as usize
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
