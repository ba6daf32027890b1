// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sharded daemon supervisor.
//!
//! Keeps exactly N long-lived projection workers alive across a cluster,
//! each pinned to one contiguous slice range. Worker `i` owns
//! `slice_ranges(N)[i]`; because worker identity is unique cluster-wide and
//! the projection key derives from `(stream_id, slice_min, slice_max)`, no
//! two live projections can share a ProjectionId.
//!
//! # Placement and rebalance
//!
//! Membership arrives on a watch channel from the embedding cluster
//! runtime (a single-node deployment feeds a constant). Placement is
//! deterministic: worker `i` runs on `sorted_nodes[i % node_count]`. On a
//! membership change the supervisor stops departing workers fully,
//! including their final offset commit, before starting arrivals, so a
//! worker never runs in two places against one offset row. The membership
//! source must sequence epochs the same way across nodes.
//!
//! # Sizing
//!
//! Pick N well above the planned node count (think ~10x). Too few and some
//! nodes idle; more just means several workers per node.

use crate::envelope::{slice_ranges, SliceRange};
use crate::metrics;
use crate::projection::{Projection, ProjectionHandle};
use futures::future::join_all;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Cluster view used for worker placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMembership {
    self_node: String,
    nodes: Vec<String>,
}

impl ClusterMembership {
    /// Membership with an explicit node list; the list is sorted and
    /// deduplicated so every node computes the same placement.
    pub fn new(self_node: impl Into<String>, nodes: Vec<String>) -> Self {
        let mut nodes = nodes;
        nodes.sort();
        nodes.dedup();
        Self {
            self_node: self_node.into(),
            nodes,
        }
    }

    /// Single-node deployment: this node owns every worker.
    pub fn single_node(self_node: impl Into<String>) -> Self {
        let self_node = self_node.into();
        Self {
            self_node: self_node.clone(),
            nodes: vec![self_node],
        }
    }

    pub fn self_node(&self) -> &str {
        &self.self_node
    }

    /// Whether this node hosts the given worker.
    pub fn owns(&self, worker: usize) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        self.nodes[worker % self.nodes.len()] == self.self_node
    }
}

/// Builds worker `i`'s projection for its slice range.
pub type WorkerFactory = Box<dyn Fn(usize, SliceRange) -> Projection + Send + Sync>;

/// Supervisor holding exactly N projection workers over the cluster.
pub struct ShardedDaemon {
    name: String,
    number_of_instances: usize,
    factory: WorkerFactory,
}

impl ShardedDaemon {
    /// Create a daemon that will hold `number_of_instances` workers.
    ///
    /// Panics if `number_of_instances` is zero or exceeds the number of
    /// slices (via [`slice_ranges`]).
    pub fn new<F>(name: impl Into<String>, number_of_instances: usize, factory: F) -> Self
    where
        F: Fn(usize, SliceRange) -> Projection + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            number_of_instances,
            factory: Box::new(factory),
        }
    }

    /// Start supervising. Workers this node owns under the current
    /// membership start immediately; membership changes rebalance.
    pub fn start(self, membership_rx: watch::Receiver<ClusterMembership>) -> DaemonHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = self.name.clone();
        let span = tracing::info_span!("sharded_daemon", daemon = %name);
        let join = tokio::spawn(
            supervise(
                self.name,
                self.number_of_instances,
                self.factory,
                membership_rx,
                shutdown_rx,
            )
            .instrument(span),
        );
        DaemonHandle {
            name,
            shutdown_tx,
            join,
        }
    }
}

/// Control handle for a running daemon.
pub struct DaemonHandle {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl DaemonHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward a graceful stop to every live worker and wait for them to
    /// drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(daemon = %self.name, error = %e, "Daemon supervisor panicked on shutdown");
        }
    }
}

async fn supervise(
    name: String,
    number_of_instances: usize,
    factory: WorkerFactory,
    mut membership_rx: watch::Receiver<ClusterMembership>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ranges = slice_ranges(number_of_instances);
    let mut workers: HashMap<usize, ProjectionHandle> = HashMap::new();

    let initial = membership_rx.borrow_and_update().clone();
    info!(
        instances = number_of_instances,
        node = %initial.self_node(),
        "Starting sharded daemon"
    );
    rebalance(&name, &mut workers, &initial, &ranges, &factory).await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            changed = membership_rx.changed() => {
                if changed.is_err() {
                    // Membership source is gone; hold the current
                    // placement until shutdown.
                    debug!("Membership channel closed");
                    shutdown_rx.changed().await.ok();
                    break;
                }
                let membership = membership_rx.borrow_and_update().clone();
                info!(
                    node = %membership.self_node(),
                    nodes = membership.nodes.len(),
                    "Membership changed, rebalancing"
                );
                metrics::record_daemon_rebalance(&name);
                rebalance(&name, &mut workers, &membership, &ranges, &factory).await;
            }
        }
    }

    // Graceful stop for every live worker.
    let stopping: Vec<_> = workers.drain().map(|(_, handle)| handle.stop()).collect();
    let count = stopping.len();
    join_all(stopping).await;
    metrics::set_daemon_workers(&name, 0);
    info!(workers = count, "Sharded daemon stopped");
}

/// Align the local worker set with the membership's placement.
///
/// Departing workers stop fully (final offset commit included) before any
/// arrival starts.
async fn rebalance(
    name: &str,
    workers: &mut HashMap<usize, ProjectionHandle>,
    membership: &ClusterMembership,
    ranges: &[SliceRange],
    factory: &WorkerFactory,
) {
    let departing: Vec<usize> = workers
        .keys()
        .copied()
        .filter(|worker| !membership.owns(*worker))
        .collect();
    if !departing.is_empty() {
        info!(count = departing.len(), "Stopping departing workers");
        let stopping: Vec<_> = departing
            .into_iter()
            .filter_map(|worker| workers.remove(&worker))
            .map(|handle| handle.stop())
            .collect();
        join_all(stopping).await;
    }

    for (worker, range) in ranges.iter().enumerate() {
        if membership.owns(worker) && !workers.contains_key(&worker) {
            let projection = factory(worker, *range);
            debug!(worker, slice_range = %range, projection_id = %projection.id(), "Starting worker");
            workers.insert(worker, projection.run());
        }
    }

    metrics::set_daemon_workers(name, workers.len());
}
