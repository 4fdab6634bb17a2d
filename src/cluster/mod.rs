//! Cluster topology and the terse config served to legacy clients.
//!
//! - `topology`: snapshots and the `TopologyProvider` trait
//! - `config`: builds the `GET_CLUSTER_CONFIG` document

pub mod config;
pub mod topology;

pub use config::{ConfigError, ConfigSynthesizer, LegacyClusterConfig};
pub use topology::{
    BucketTopology, ClusterTopology, ServicePorts, StaticTopology, TopologyNode, TopologyProvider,
    VbucketAssignment,
};
