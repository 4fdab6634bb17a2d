//! Cluster topology snapshots and providers.
//!
//! The bridge does not watch cluster membership itself. A [`TopologyProvider`]
//! hands out the current snapshot; [`StaticTopology`] is a fixed snapshot used
//! when the bridge runs standalone.

use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;

/// Ports a node exposes, keyed by service. Absent services are omitted from
/// the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServicePorts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mgmt: Option<u16>,
    #[serde(rename = "mgmtSSL", skip_serializing_if = "Option::is_none")]
    pub mgmt_ssl: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv: Option<u16>,
    #[serde(rename = "kvSSL", skip_serializing_if = "Option::is_none")]
    pub kv_ssl: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capi: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n1ql: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cbas: Option<u16>,
}

impl ServicePorts {
    /// Ports of a node that serves management and key-value traffic.
    pub fn kv_node(mgmt: u16, kv: u16) -> Self {
        Self {
            mgmt: Some(mgmt),
            kv: Some(kv),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNode {
    /// Stable identifier referenced by vBucket assignments.
    pub id: String,
    pub hostname: String,
    pub services: ServicePorts,
}

/// Cluster-wide snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    pub rev: i64,
    pub rev_epoch: i64,
    pub nodes: Vec<TopologyNode>,
}

/// Owners of one vBucket. `None` marks a replica slot with no node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbucketAssignment {
    pub active: String,
    pub replicas: Vec<Option<String>>,
}

/// Per-bucket snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTopology {
    pub name: String,
    pub uuid: String,
    pub num_replicas: u32,
    pub vbuckets: Vec<VbucketAssignment>,
}

/// Supplies the current topology.
pub trait TopologyProvider: Send + Sync {
    fn cluster(&self) -> ClusterTopology;

    /// Returns `None` if the bucket is unknown.
    fn bucket(&self, name: &str) -> Option<BucketTopology>;
}

/// A fixed topology with vBuckets assigned round-robin across nodes.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    cluster: ClusterTopology,
    buckets: HashMap<String, BucketTopology>,
}

impl StaticTopology {
    pub fn new(
        nodes: Vec<TopologyNode>,
        buckets: &[String],
        num_vbuckets: usize,
        num_replicas: u32,
    ) -> Self {
        let buckets = buckets
            .iter()
            .map(|name| {
                let topology = BucketTopology {
                    name: name.clone(),
                    uuid: random_uuid(),
                    num_replicas,
                    vbuckets: assign_round_robin(&nodes, num_vbuckets, num_replicas),
                };
                (name.clone(), topology)
            })
            .collect();

        Self {
            cluster: ClusterTopology {
                rev: 1,
                rev_epoch: 1,
                nodes,
            },
            buckets,
        }
    }

    /// A one-node cluster, the bridge itself.
    pub fn single_node(
        hostname: impl Into<String>,
        services: ServicePorts,
        buckets: &[String],
        num_vbuckets: usize,
        num_replicas: u32,
    ) -> Self {
        let node = TopologyNode {
            id: "node-0".to_string(),
            hostname: hostname.into(),
            services,
        };
        Self::new(vec![node], buckets, num_vbuckets, num_replicas)
    }
}

impl TopologyProvider for StaticTopology {
    fn cluster(&self) -> ClusterTopology {
        self.cluster.clone()
    }

    fn bucket(&self, name: &str) -> Option<BucketTopology> {
        self.buckets.get(name).cloned()
    }
}

fn assign_round_robin(
    nodes: &[TopologyNode],
    num_vbuckets: usize,
    num_replicas: u32,
) -> Vec<VbucketAssignment> {
    if nodes.is_empty() {
        return Vec::new();
    }

    (0..num_vbuckets)
        .map(|vb| {
            let active = nodes[vb % nodes.len()].id.clone();
            let replicas = (1..=num_replicas as usize)
                .map(|r| (r < nodes.len()).then(|| nodes[(vb + r) % nodes.len()].id.clone()))
                .collect();
            VbucketAssignment { active, replicas }
        })
        .collect()
}

fn random_uuid() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}
