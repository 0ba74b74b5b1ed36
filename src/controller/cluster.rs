//! Cluster-API port
//!
//! The reconciler never talks to the Kubernetes API directly; it drives the
//! [`ClusterClient`] trait, which allows deterministic in-memory
//! implementations in tests while [`KubeClusterClient`] wraps the real client
//! in production.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::IamRoleServiceAccount;
use crate::error::Error;
use crate::Result;

/// Typed cluster operations the reconciler needs.
///
/// Create and update of service accounts take a dry-run flag so the
/// precheck phase can detect conflicts without mutating cluster state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches an IRSA by namespace and name, `None` when it is gone
    async fn get_irsa(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IamRoleServiceAccount>>;

    /// Writes back the IRSA object itself (finalizer edits)
    async fn update_irsa(&self, irsa: &IamRoleServiceAccount) -> Result<()>;

    /// Writes the IRSA status subresource
    async fn update_irsa_status(&self, irsa: &IamRoleServiceAccount) -> Result<()>;

    /// Fetches a service account, `None` when absent
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;

    /// Creates a service account
    async fn create_service_account(&self, sa: &ServiceAccount, dry_run: bool) -> Result<()>;

    /// Updates a service account
    async fn update_service_account(&self, sa: &ServiceAccount, dry_run: bool) -> Result<()>;

    /// Deletes a service account
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Real cluster client wrapping [`kube::Client`]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Creates a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn irsa_api(&self, namespace: &str) -> Api<IamRoleServiceAccount> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn sa_api(&self, namespace: &str) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(dry_run: bool) -> PostParams {
        PostParams {
            dry_run,
            ..Default::default()
        }
    }
}

fn object_keys(metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Result<(&str, &str)> {
    let namespace = metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    Ok((namespace, name))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_irsa(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<IamRoleServiceAccount>> {
        Ok(self.irsa_api(namespace).get_opt(name).await?)
    }

    async fn update_irsa(&self, irsa: &IamRoleServiceAccount) -> Result<()> {
        let (namespace, name) = object_keys(&irsa.metadata)?;
        self.irsa_api(namespace)
            .replace(name, &PostParams::default(), irsa)
            .await?;
        Ok(())
    }

    async fn update_irsa_status(&self, irsa: &IamRoleServiceAccount) -> Result<()> {
        let (namespace, name) = object_keys(&irsa.metadata)?;
        let patch = serde_json::json!({ "status": irsa.status });
        self.irsa_api(namespace)
            .patch_status(
                name,
                &PatchParams::apply("irsa-operator"),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        Ok(self.sa_api(namespace).get_opt(name).await?)
    }

    async fn create_service_account(&self, sa: &ServiceAccount, dry_run: bool) -> Result<()> {
        let (namespace, _) = object_keys(&sa.metadata)?;
        self.sa_api(namespace)
            .create(&Self::post_params(dry_run), sa)
            .await?;
        Ok(())
    }

    async fn update_service_account(&self, sa: &ServiceAccount, dry_run: bool) -> Result<()> {
        let (namespace, name) = object_keys(&sa.metadata)?;
        self.sa_api(namespace)
            .replace(name, &Self::post_params(dry_run), sa)
            .await?;
        Ok(())
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<()> {
        self.sa_api(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
