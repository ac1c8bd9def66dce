// SPDX-License-Identifier: Apache-2.0

//! Kubernetes identity derived from a container log path.
//!
//! Two directory layouts are recognised:
//! - flat: `/…/containers/{pod}_{namespace}_{container}-{container_id}.log`
//! - hierarchical: `/…/pods/{namespace}_{pod}_{pod_id}/{container}/{N}.log`
//!
//! Anything else yields empty metadata; such files are still tailed.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

static CONTAINERS_LAYOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^.*/containers/(?P<pod_name>[^_/]+)_(?P<namespace>[^_/]+)_(?P<container_name>[^_/]+)-(?P<container_id>[0-9a-f]{64})\.log$",
    )
    .expect("valid containers layout regex")
});

static PODS_LAYOUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^.*/pods/(?P<namespace>[^_/]+)_(?P<pod_name>[^_/]+)_(?P<pod_id>[^_/]+)/(?P<container_name>[^/]+)/\d+\.log$",
    )
    .expect("valid pods layout regex")
});

/// Identity attached to every event read from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty()
            && self.pod_name.is_empty()
            && self.container_name.is_empty()
            && self.pod_id.is_empty()
            && self.container_id.is_empty()
    }
}

/// Extracts metadata from `path`. Never fails.
pub fn extract(path: &Path) -> Metadata {
    let Some(path) = path.to_str() else {
        return Metadata::default();
    };

    if let Some(caps) = PODS_LAYOUT.captures(path) {
        return Metadata {
            namespace: caps["namespace"].to_string(),
            pod_name: caps["pod_name"].to_string(),
            container_name: caps["container_name"].to_string(),
            pod_id: caps["pod_id"].to_string(),
            container_id: String::new(),
        };
    }

    if let Some(caps) = CONTAINERS_LAYOUT.captures(path) {
        return Metadata {
            namespace: caps["namespace"].to_string(),
            pod_name: caps["pod_name"].to_string(),
            container_name: caps["container_name"].to_string(),
            pod_id: String::new(),
            container_id: caps["container_id"].to_string(),
        };
    }

    Metadata::default()
}
