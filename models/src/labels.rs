//! Well-known label and annotation keys shared across the control plane.

/// Label placed on every node and node claim naming its owning node pool.
pub const NODEPOOL_LABEL: &str = "gantry.sh/nodepool";

/// Annotation carrying the content hash of the node pool template a claim
/// was created from.
pub const NODEPOOL_HASH_ANNOTATION: &str = "gantry.sh/nodepool-hash";

/// Annotation set to "true" when best-effort scheduling relaxed a
/// min-values constraint to admit the claim.
pub const MIN_VALUES_RELAXED_ANNOTATION: &str = "gantry.sh/min-values-relaxed";

/// Pod annotation preserved but never interpreted by the core.
pub const DO_NOT_DISRUPT_ANNOTATION: &str = "gantry.sh/do-not-disrupt";

/// Purchase-option label attached to offerings (on-demand, spot, reserved).
pub const CAPACITY_TYPE_LABEL: &str = "gantry.sh/capacity-type";

/// Reservation identifier label for reserved-capacity offerings.
pub const RESERVATION_ID_LABEL: &str = "gantry.sh/reservation-id";

pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
pub const ARCH_LABEL: &str = "kubernetes.io/arch";
pub const OS_LABEL: &str = "kubernetes.io/os";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";
pub const CAPACITY_TYPE_SPOT: &str = "spot";
pub const CAPACITY_TYPE_RESERVED: &str = "reserved";

/// Storage classes with this provisioner bind pre-created local volumes;
/// their hostname affinity is meaningless for nodes that do not exist yet.
pub const NO_PROVISIONER: &str = "kubernetes.io/no-provisioner";

/// Labels every provisioned node carries regardless of what the node pool
/// template declares; pods may require them even when a pool's template
/// does not mention them.
pub fn is_well_known(key: &str) -> bool {
    matches!(
        key,
        NODEPOOL_LABEL
            | CAPACITY_TYPE_LABEL
            | RESERVATION_ID_LABEL
            | ZONE_LABEL
            | HOSTNAME_LABEL
            | ARCH_LABEL
            | OS_LABEL
            | INSTANCE_TYPE_LABEL
    )
}
