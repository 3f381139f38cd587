// src/cluster/resources.rs

//! Composition of the `qsub -l` resource request string.

use serde::{Deserialize, Serialize};

/// Resource requests for one cluster job.
///
/// Unset fields are omitted from the request. `procs_per_node` only makes
/// sense attached to a node count; when it is set without `nodes`, a single
/// node is assumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResources {
    pub nodes: Option<u32>,
    pub procs_per_node: Option<u32>,
    pub vmem_megabytes: Option<u64>,
}

impl ClusterResources {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_none() && self.procs_per_node.is_none() && self.vmem_megabytes.is_none()
    }

    /// The `-l` argument, e.g. `nodes=2:ppn=4,vmem=8192m`, or `None` when no
    /// resource was requested. Fields appear in lexical order; vmem carries
    /// its `m` suffix.
    pub fn to_request_string(&self) -> Option<String> {
        let mut fields: Vec<String> = Vec::new();

        let nodes = match (self.nodes, self.procs_per_node) {
            (None, None) => None,
            (n, ppn) => Some((n.unwrap_or(1), ppn)),
        };
        if let Some((n, ppn)) = nodes {
            match ppn {
                Some(p) => fields.push(format!("nodes={n}:ppn={p}")),
                None => fields.push(format!("nodes={n}")),
            }
        }
        if let Some(vmem) = self.vmem_megabytes {
            fields.push(format!("vmem={vmem}m"));
        }

        if fields.is_empty() {
            return None;
        }
        fields.sort();
        Some(fields.join(","))
    }
}
