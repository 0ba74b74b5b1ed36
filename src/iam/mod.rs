//! IAM port: the narrow cloud-side interface the reconciler drives
//!
//! The [`RoleService`] trait is implemented by the real AWS SDK client
//! ([`IamClient`]) and by a deterministic in-memory fake
//! ([`FakeRoleService`]) used in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::IamRoleServiceAccount;
use crate::Result;

mod client;
mod fake;
mod types;

pub use client::IamClient;
pub use fake::FakeRoleService;
pub use types::{
    diff, inline_policy_name, role_name_by_arn, AssumeRoleDocument, IamRole, RoleDocument,
    RoleStatement, RoleUpdate, TrustCondition, TrustPrincipal, TrustStatement,
    ASSUME_ROLE_WITH_WEB_IDENTITY, POLICY_VERSION,
};

/// Cloud-side operations on IAM roles.
///
/// Every operation may fail; errors are classified through the predicates on
/// [`crate::Error`] (`is_not_found`, `is_already_exists`). Absence of a role
/// is a normal branch wherever the reconciler has a creation path.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoleService: Send + Sync {
    /// Returns the deterministic name of the role owned for this IRSA:
    /// `[prefix-]cluster-namespace-name`
    fn role_name(&self, irsa: &IamRoleServiceAccount) -> String;

    /// Creates the role for a self-managed IRSA: trust policy, ownership
    /// tags, inline policy (if declared) and managed-policy attachments.
    /// Returns the ARN of the created role.
    async fn create(
        &self,
        oidc_provider_arn: &str,
        irsa: &IamRoleServiceAccount,
    ) -> Result<String>;

    /// Fetches the full observed role: attached managed policies and the
    /// fixed-name inline policy included. A missing inline policy is not an
    /// error; a missing role is `is_not_found`.
    async fn get(&self, role_name: &str) -> Result<IamRole>;

    /// Deletes the role after detaching managed policies and deleting inline
    /// policies; the role itself goes last since the cloud refuses to delete
    /// non-empty roles.
    async fn delete(&self, role_arn: &str) -> Result<()>;

    /// Attaches the listed managed policies, skipping empty ARNs and failing
    /// fast on the first error
    async fn attach_role_policy(&self, role_name: &str, policy_arns: &[String]) -> Result<()>;

    /// Detaches the listed managed policies, skipping empty ARNs and failing
    /// fast on the first error
    async fn detach_role_policy(&self, role_name: &str, policy_arns: &[String]) -> Result<()>;

    /// Replaces the role's trust policy wholesale
    async fn update_assume_policy(
        &self,
        role_name: &str,
        document: &AssumeRoleDocument,
    ) -> Result<()>;

    /// Writes the inline policy under the fixed per-role name
    async fn update_inline_policy(&self, role_name: &str, document: &RoleDocument) -> Result<()>;

    /// Removes the fixed-name inline policy
    async fn delete_inline_policy(&self, role_name: &str) -> Result<()>;

    /// Replaces the role's tag set; the ownership tag is always forced in
    async fn update_tags(&self, role_name: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    /// Appends the trust-policy binding for `namespace/service_account` to
    /// the role's existing trust document and writes it back
    async fn allow_service_account_access(
        &self,
        role: &IamRole,
        oidc_provider_arn: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<()>;
}
