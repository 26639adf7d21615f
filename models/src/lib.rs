pub mod condition;
pub mod instance_type;
pub mod labels;
pub mod nodeclaim;
pub mod nodepool;
pub mod overlay;
pub mod pod;
pub mod requirements;
pub mod resources;
pub mod volume;
