//! Resource tags and the ownership guard
//!
//! Every resource this system creates carries a cluster-scoped ownership tag.
//! Deletion of anything that could have been supplied by a user is gated on
//! that tag: a resource without it is treated as user-owned and left alone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix shared by every tag key this system writes
pub const TAG_PREFIX: &str = "sigs.k8s.io_cluster-api-provider-azure_";

/// Tag key holding the role of the resource within the cluster
pub const ROLE_TAG_KEY: &str = "sigs.k8s.io_cluster-api-provider-azure_role";

/// Human-readable name tag
pub const NAME_TAG_KEY: &str = "Name";

pub const COMMON_ROLE: &str = "common";
pub const CONTROL_PLANE_ROLE: &str = "control-plane";
pub const NODE_ROLE: &str = "node";
pub const API_SERVER_ROLE: &str = "apiserver";

/// Ownership tag key for a specific cluster
pub fn cluster_tag_key(cluster_name: &str) -> String {
    format!("{}cluster_{}", TAG_PREFIX, cluster_name)
}

/// Lifecycle value stored under the ownership key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceLifecycle {
    /// Created and managed by this system; deleted with the cluster
    Owned,
    /// Used by the cluster but managed elsewhere
    Shared,
}

impl ResourceLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceLifecycle::Owned => "owned",
            ResourceLifecycle::Shared => "shared",
        }
    }
}

impl std::fmt::Display for ResourceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of resource tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the full tag set for a resource created by this system
    pub fn build(params: BuildParams<'_>) -> Self {
        let mut tags = Tags::new();
        tags.merge(params.additional);
        tags.insert(
            cluster_tag_key(params.cluster_name),
            params.lifecycle.as_str(),
        );
        if let Some(role) = params.role {
            tags.insert(ROLE_TAG_KEY, role);
        }
        if let Some(name) = params.name {
            tags.insert(NAME_TAG_KEY, name);
        }
        tags
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Copy every entry of `other` into this set, overwriting on conflict
    pub fn merge(&mut self, other: &Tags) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Whether the set marks the resource as owned by `cluster_name`
    pub fn has_owned(&self, cluster_name: &str) -> bool {
        self.get(&cluster_tag_key(cluster_name)) == Some(ResourceLifecycle::Owned.as_str())
    }

    /// Read tags from a provider JSON `tags` object, ignoring non-string values
    pub fn from_json(value: Option<&serde_json::Value>) -> Self {
        let mut tags = Tags::new();
        if let Some(map) = value.and_then(|v| v.as_object()) {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    tags.insert(k.clone(), s);
                }
            }
        }
        tags
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or_default()
    }

    /// Apply `changes` in place; returns whether any entry changed
    pub fn apply(&mut self, changes: &TagChanges) -> bool {
        let before = self.clone();
        self.merge(&changes.set);
        for key in &changes.remove {
            self.0.remove(key);
        }
        *self != before
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Tags(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Inputs for [`Tags::build`]
#[derive(Debug, Clone)]
pub struct BuildParams<'a> {
    pub cluster_name: &'a str,
    pub lifecycle: ResourceLifecycle,
    pub name: Option<&'a str>,
    pub role: Option<&'a str>,
    pub additional: &'a Tags,
}

/// Keys written by this system itself: ownership, role and name
pub fn is_system_key(key: &str) -> bool {
    key.starts_with(TAG_PREFIX) || key == NAME_TAG_KEY
}

/// User tag changes between the set applied last time and the desired one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagChanges {
    /// Added or changed entries
    pub set: Tags,
    /// Keys no longer wanted
    pub remove: Vec<String>,
}

impl TagChanges {
    /// System keys never show up in either direction
    pub fn between(last_applied: &Tags, desired: &Tags) -> Self {
        let set = desired
            .iter()
            .filter(|(k, v)| !is_system_key(k) && last_applied.get(k) != Some(v.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let remove = last_applied
            .iter()
            .filter(|(k, _)| !is_system_key(k) && desired.get(k).is_none())
            .map(|(k, _)| k.clone())
            .collect();
        Self { set, remove }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// Ownership guard: true only if the resource is owned by `cluster_name`
///
/// Callers deleting anything that might be user-supplied must check this
/// first and skip the deletion when it returns false.
pub fn is_managed(tags: &Tags, cluster_name: &str) -> bool {
    tags.has_owned(cluster_name)
}
