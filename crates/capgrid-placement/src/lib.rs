//! capgrid placement — tag constraints, affinity grouping, host selection.
//!
//! This crate narrows candidate capacity pools and picks concrete hosts.
//! It does NOT reserve capacity (that's the store's conditional commit,
//! driven by `capgrid-scheduler`). Everything here is pure and synchronous.
//!
//! # Components
//!
//! - **`constraints`**: Hard/soft tag condition evaluation and candidate ordering
//! - **`affinity`**: Topology partitioning and deterministic group selection
//! - **`scorer`**: Host scoring (bin-packing, affinity, balance)
//! - **`placer`**: Host selection (grouping, ranking, greedy assignment)
//! - **`convert`**: Type conversions from state store types

pub mod affinity;
pub mod constraints;
pub mod convert;
pub mod placer;
pub mod scorer;

pub use affinity::{
    AffinityConstraint, HostSelection, TopologyTags, correlation_hash, partition, select_group,
};
pub use constraints::{
    Evaluation, TagCondition, evaluate, extract_tag_conditions, filter_by_constraints,
};
pub use convert::{description_to_request, host_selection};
pub use placer::{PlacementError, PlacementRequest, select_hosts};
pub use scorer::{HostScore, PlacementRequirements, ScoringWeights, rank_hosts, score_host};
