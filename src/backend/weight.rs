//! Backend weight algorithms

use std::collections::{HashMap, HashSet};

use crate::model::{Backend, BackendKey, TrafficPolicy, DEFAULT_SERVER_WEIGHT};

/// Assign weights and collapse per-pod entries into one backend per server
///
/// `backends` holds one entry per pod for the Local policy (a node hosting
/// three pods appears three times) and one entry per target otherwise.
/// Without `weight`, Local backends get one unit per pod and everything else
/// gets [`DEFAULT_SERVER_WEIGHT`]. Under Local an ENI target on a virtual node
/// is a single pod and so weighs 1, keeping it proportional to node backends
/// in the same group. With `weight`, the percentage is split
/// across pods (Local) or targets (ENI/Cluster), never dropping below 1
/// unless the percentage itself is 0.
pub fn assign_weights(
    policy: TrafficPolicy,
    backends: Vec<Backend>,
    weight: Option<i32>,
) -> Vec<Backend> {
    match policy {
        TrafficPolicy::Local => local_weights(backends, weight),
        TrafficPolicy::Eni | TrafficPolicy::Cluster => flat_weights(dedup(backends), weight),
    }
}

fn flat_weights(mut backends: Vec<Backend>, weight: Option<i32>) -> Vec<Backend> {
    let per_backend = match weight {
        None => DEFAULT_SERVER_WEIGHT,
        Some(0) => 0,
        Some(w) => (w / backends.len().max(1) as i32).max(1),
    };
    for b in &mut backends {
        b.weight = per_backend;
    }
    backends
}

fn local_weights(backends: Vec<Backend>, weight: Option<i32>) -> Vec<Backend> {
    let mut pods_per_server: HashMap<BackendKey, i32> = HashMap::new();
    for b in &backends {
        *pods_per_server.entry(b.key()).or_default() += 1;
    }

    let per_pod = match weight {
        None => 1,
        Some(0) => 0,
        Some(w) => (w / backends.len().max(1) as i32).max(1),
    };

    let mut deduped = dedup(backends);
    for b in &mut deduped {
        let pods = pods_per_server.get(&b.key()).copied().unwrap_or(1);
        b.weight = per_pod * pods;
    }
    deduped
}

/// First entry per backend key wins
fn dedup(backends: Vec<Backend>) -> Vec<Backend> {
    let mut seen = HashSet::new();
    backends.into_iter().filter(|b| seen.insert(b.key())).collect()
}
