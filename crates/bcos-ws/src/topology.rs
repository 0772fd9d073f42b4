//! Which endpoints serve which group and node.
//!
//! Two maps, each behind its own lock:
//!
//! - `group -> node -> {endpoint}` answers routing queries
//! - `endpoint -> group -> GroupInfo` remembers what each endpoint reported
//!
//! Both are updated from handshakes and group notifications and pruned when
//! an endpoint disconnects. Empty node and group buckets are removed so an
//! unknown group always reads as `None`.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One group as reported by a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Chain the group belongs to.
    #[serde(rename = "chainID", default)]
    pub chain_id: String,
    /// Group name.
    #[serde(rename = "groupID")]
    pub group_id: String,
    /// Nodes in the group visible through the reporting endpoint.
    #[serde(rename = "nodeList", default)]
    pub node_list: Vec<GroupNodeInfo>,
}

/// One node inside a [`GroupInfo`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupNodeInfo {
    /// Node name (unique within the group).
    pub name: String,
    /// Node role as reported by the chain.
    #[serde(rename = "type", default)]
    pub node_type: i32,
}

/// Group/node routing maps.
#[derive(Debug, Default)]
pub struct Topology {
    group_nodes: RwLock<HashMap<String, HashMap<String, HashSet<String>>>>,
    endpoint_groups: RwLock<HashMap<String, HashMap<String, GroupInfo>>>,
}

impl Topology {
    /// Empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `endpoint`'s contribution to `info.group_id` with `info`.
    pub fn update(&self, endpoint: &str, info: GroupInfo) {
        {
            let mut group_nodes = self.group_nodes.write();
            let nodes = group_nodes.entry(info.group_id.clone()).or_default();
            for endpoints in nodes.values_mut() {
                let _ = endpoints.remove(endpoint);
            }
            for node in &info.node_list {
                let _ = nodes
                    .entry(node.name.clone())
                    .or_default()
                    .insert(endpoint.to_owned());
            }
            nodes.retain(|_, endpoints| !endpoints.is_empty());
            if nodes.is_empty() {
                let _ = group_nodes.remove(&info.group_id);
            }
        }

        let _ = self
            .endpoint_groups
            .write()
            .entry(endpoint.to_owned())
            .or_default()
            .insert(info.group_id.clone(), info);
    }

    /// Drop everything `endpoint` contributed.
    pub fn remove_endpoint(&self, endpoint: &str) {
        {
            let mut group_nodes = self.group_nodes.write();
            for nodes in group_nodes.values_mut() {
                for endpoints in nodes.values_mut() {
                    let _ = endpoints.remove(endpoint);
                }
                nodes.retain(|_, endpoints| !endpoints.is_empty());
            }
            group_nodes.retain(|_, nodes| !nodes.is_empty());
        }
        let _ = self.endpoint_groups.write().remove(endpoint);
    }

    /// Endpoints serving any node of `group`, or `None` if the group is unknown.
    pub fn endpoints_for_group(&self, group: &str) -> Option<HashSet<String>> {
        let group_nodes = self.group_nodes.read();
        let nodes = group_nodes.get(group)?;
        Some(nodes.values().flatten().cloned().collect())
    }

    /// Endpoints serving `node` in `group`, or `None` if either is unknown.
    pub fn endpoints_for_group_node(&self, group: &str, node: &str) -> Option<HashSet<String>> {
        self.group_nodes.read().get(group)?.get(node).cloned()
    }

    /// Known groups, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.group_nodes.read().keys().cloned().collect();
        groups.sort();
        groups
    }

    /// Node names known for `group`, sorted.
    pub fn nodes(&self, group: &str) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .group_nodes
            .read()
            .get(group)
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();
        nodes.sort();
        nodes
    }

    /// What `endpoint` last reported for `group`.
    pub fn group_info(&self, endpoint: &str, group: &str) -> Option<GroupInfo> {
        self.endpoint_groups.read().get(endpoint)?.get(group).cloned()
    }

    /// Groups `endpoint` reported, sorted.
    pub fn groups_for_endpoint(&self, endpoint: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .endpoint_groups
            .read()
            .get(endpoint)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Whether nothing is known.
    pub fn is_empty(&self) -> bool {
        self.group_nodes.read().is_empty() && self.endpoint_groups.read().is_empty()
    }
}
