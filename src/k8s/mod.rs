pub mod client;

pub use client::{ClusterClient, ClusterEvent, EventStream, KubeClusterClient};

use std::collections::BTreeMap;

/// Renders a service selector map in the `k=v,k2=v2` form accepted by the
/// list and watch APIs. `BTreeMap` iteration keeps the output stable.
pub fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
