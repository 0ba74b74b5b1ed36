//! Kubernetes controller for IamRoleServiceAccount resources
//!
//! [`cluster`] holds the typed cluster-API port the reconciler drives;
//! [`irsa`] holds the reconciliation logic itself.

mod cluster;
mod irsa;

pub use cluster::{ClusterClient, KubeClusterClient};
pub use irsa::{error_policy, reconcile, Context, REQUEUE_PERIOD};

#[cfg(test)]
pub use cluster::MockClusterClient;
