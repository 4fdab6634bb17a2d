//! Terse cluster configuration synthesis.
//!
//! Legacy clients bootstrap from a compact JSON document describing the
//! cluster nodes and, once a bucket is selected, which node owns each vBucket:
//!
//! ```text
//! nodesExt:   [ A(kv)  B(query only)  C(kv) ]
//! serverList: [ "A:11210", "C:11210" ]          KV nodes, nodesExt order
//! vBucketMap: [ [0, 1], [1, 0], [0, -1], ... ]   indices into serverList
//! ```
//!
//! `rev` and `revEpoch` come from the topology provider unchanged.

use super::topology::{BucketTopology, ClusterTopology, ServicePorts, TopologyProvider};
use crate::protocol::Status;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

const HASH_ALGORITHM: &str = "CRC";
const NODE_LOCATOR: &str = "vbucket";

const BUCKET_CAPABILITIES: &[&str] = &[
    "collections",
    "durableWrite",
    "cbhello",
    "touch",
    "cccp",
    "xdcrCheckpointing",
    "nodesExt",
    "xattr",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown bucket: {0}")]
    UnknownBucket(String),

    #[error("vbucket {vbucket} references unknown node {node}")]
    UnknownNode { vbucket: usize, node: String },

    #[error("vbucket {vbucket} references node {node} which has no kv service")]
    NodeWithoutKv { vbucket: usize, node: String },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn status(&self) -> Status {
        match self {
            ConfigError::UnknownBucket(_) => Status::NO_BUCKET,
            _ => Status::EINTERNAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeExt {
    pub hostname: String,
    pub services: ServicePorts,
    #[serde(rename = "thisNode", skip_serializing_if = "std::ops::Not::not")]
    pub this_node: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VbucketServerMap {
    pub hash_algorithm: String,
    pub num_replicas: u32,
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

/// The terse configuration document served by `GET_CLUSTER_CONFIG`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyClusterConfig {
    pub rev: i64,
    pub rev_epoch: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_locator: Option<String>,
    pub nodes_ext: Vec<NodeExt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_capabilities_ver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_capabilities: Option<Vec<String>>,
    #[serde(rename = "vBucketServerMap", skip_serializing_if = "Option::is_none")]
    pub vbucket_server_map: Option<VbucketServerMap>,
    pub cluster_capabilities_ver: [u32; 2],
    pub cluster_capabilities: BTreeMap<String, Vec<String>>,
}

impl LegacyClusterConfig {
    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Builds [`LegacyClusterConfig`] documents from a topology provider.
#[derive(Clone)]
pub struct ConfigSynthesizer {
    provider: Arc<dyn TopologyProvider>,
}

impl ConfigSynthesizer {
    pub fn new(provider: Arc<dyn TopologyProvider>) -> Self {
        Self { provider }
    }

    /// Builds the config for `bucket`, or the cluster-only config when no
    /// bucket is given. `this_host` marks the node the client connected to.
    pub fn build(
        &self,
        bucket: Option<&str>,
        this_host: Option<&str>,
    ) -> Result<LegacyClusterConfig, ConfigError> {
        let cluster = self.provider.cluster();
        let bucket = bucket
            .map(|name| {
                self.provider
                    .bucket(name)
                    .ok_or_else(|| ConfigError::UnknownBucket(name.to_string()))
            })
            .transpose()?;

        synthesize(&cluster, bucket.as_ref(), this_host)
    }
}

/// Builds a config document from explicit snapshots.
pub fn synthesize(
    cluster: &ClusterTopology,
    bucket: Option<&BucketTopology>,
    this_host: Option<&str>,
) -> Result<LegacyClusterConfig, ConfigError> {
    let nodes_ext = cluster
        .nodes
        .iter()
        .map(|node| NodeExt {
            hostname: node.hostname.clone(),
            services: node.services.clone(),
            this_node: this_host == Some(node.hostname.as_str()),
        })
        .collect();

    let mut config = LegacyClusterConfig {
        rev: cluster.rev,
        rev_epoch: cluster.rev_epoch,
        name: None,
        uuid: None,
        node_locator: None,
        nodes_ext,
        bucket_capabilities_ver: None,
        bucket_capabilities: None,
        vbucket_server_map: None,
        cluster_capabilities_ver: [1, 0],
        cluster_capabilities: BTreeMap::new(),
    };

    if let Some(bucket) = bucket {
        config.name = Some(bucket.name.clone());
        config.uuid = Some(bucket.uuid.clone());
        config.node_locator = Some(NODE_LOCATOR.to_string());
        config.bucket_capabilities_ver = Some(String::new());
        config.bucket_capabilities =
            Some(BUCKET_CAPABILITIES.iter().map(|c| c.to_string()).collect());
        config.vbucket_server_map = Some(server_map(cluster, bucket)?);
    }

    Ok(config)
}

fn server_map(
    cluster: &ClusterTopology,
    bucket: &BucketTopology,
) -> Result<VbucketServerMap, ConfigError> {
    // node id -> serverList index, or None for nodes without kv
    let mut index: HashMap<&str, Option<i32>> = HashMap::with_capacity(cluster.nodes.len());
    let mut server_list = Vec::new();
    for node in &cluster.nodes {
        let position = node.services.kv.map(|port| {
            server_list.push(format!("{}:{}", node.hostname, port));
            (server_list.len() - 1) as i32
        });
        index.insert(node.id.as_str(), position);
    }

    let lookup = |vbucket: usize, node: &str| -> Result<i32, ConfigError> {
        match index.get(node) {
            Some(Some(i)) => Ok(*i),
            Some(None) => Err(ConfigError::NodeWithoutKv {
                vbucket,
                node: node.to_string(),
            }),
            None => Err(ConfigError::UnknownNode {
                vbucket,
                node: node.to_string(),
            }),
        }
    };

    let vbucket_map = bucket
        .vbuckets
        .iter()
        .enumerate()
        .map(|(vb, assignment)| {
            let mut row = Vec::with_capacity(1 + bucket.num_replicas as usize);
            row.push(lookup(vb, &assignment.active)?);
            for r in 0..bucket.num_replicas as usize {
                let replica = match assignment.replicas.get(r) {
                    Some(Some(node)) => lookup(vb, node)?,
                    _ => -1,
                };
                row.push(replica);
            }
            Ok(row)
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    Ok(VbucketServerMap {
        hash_algorithm: HASH_ALGORITHM.to_string(),
        num_replicas: bucket.num_replicas,
        server_list,
        vbucket_map,
    })
}
