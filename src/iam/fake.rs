//! Deterministic in-memory implementation of the IAM port
//!
//! Backs role state with a plain map and enforces the NotFound /
//! AlreadyExists semantics the reconciler relies on. A mutation counter lets
//! tests assert that steady-state reconciles leave IAM untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::{role_name_by_arn, AssumeRoleDocument, IamRole, RoleDocument};
use super::RoleService;
use crate::crd::IamRoleServiceAccount;
use crate::error::Error;
use crate::utils::slices;
use crate::{Result, MANAGED_TAG_KEY, MANAGED_TAG_VALUE};

/// In-memory [`RoleService`] for tests
pub struct FakeRoleService {
    prefix: String,
    cluster_name: String,
    additional_tags: BTreeMap<String, String>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    roles: HashMap<String, IamRole>,
    mutations: u64,
}

impl FakeRoleService {
    /// Creates an empty fake account
    pub fn new(cluster_name: &str, prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            cluster_name: cluster_name.to_string(),
            additional_tags: BTreeMap::new(),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Sets the operator-wide tags merged into every created role
    pub fn with_additional_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.additional_tags = tags;
        self
    }

    /// Seeds a pre-existing role, e.g. an externally managed one
    pub fn insert_role(&self, role: IamRole) {
        let mut state = self.state.lock().unwrap();
        state.roles.insert(role.role_name.clone(), role);
    }

    /// Returns a snapshot of the named role, if present
    pub fn role(&self, role_name: &str) -> Option<IamRole> {
        self.state.lock().unwrap().roles.get(role_name).cloned()
    }

    /// Number of mutating IAM calls performed so far
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().unwrap().mutations
    }

    fn fake_arn(role_name: &str) -> String {
        format!("arn:aws:iam::000000000000:role/{role_name}")
    }
}

#[async_trait]
impl RoleService for FakeRoleService {
    fn role_name(&self, irsa: &IamRoleServiceAccount) -> String {
        irsa.aws_iam_role_name(&self.prefix, &self.cluster_name)
    }

    async fn create(
        &self,
        oidc_provider_arn: &str,
        irsa: &IamRoleServiceAccount,
    ) -> Result<String> {
        let role_name = self.role_name(irsa);
        let mut state = self.state.lock().unwrap();
        if state.roles.contains_key(&role_name) {
            return Err(Error::IamAlreadyExists(role_name));
        }

        let mut role = IamRole::desired(oidc_provider_arn, irsa, &self.additional_tags);
        role.role_arn = Self::fake_arn(&role_name);
        role.role_name = role_name.clone();

        let arn = role.role_arn.clone();
        state.roles.insert(role_name, role);
        state.mutations += 1;
        Ok(arn)
    }

    async fn get(&self, role_name: &str) -> Result<IamRole> {
        self.state
            .lock()
            .unwrap()
            .roles
            .get(role_name)
            .cloned()
            .ok_or_else(|| Error::IamNotFound(role_name.to_string()))
    }

    async fn delete(&self, role_arn: &str) -> Result<()> {
        let role_name = role_name_by_arn(role_arn);
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state
            .roles
            .remove(role_name)
            .map(|_| ())
            .ok_or_else(|| Error::IamNotFound(role_name.to_string()))
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arns: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::IamNotFound(role_name.to_string()))?;
        for arn in policy_arns {
            if arn.is_empty() {
                continue;
            }
            if !slices::contains(&role.managed_policies, arn) {
                role.managed_policies.push(arn.clone());
            }
        }
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arns: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::IamNotFound(role_name.to_string()))?;
        for arn in policy_arns {
            if arn.is_empty() {
                continue;
            }
            role.managed_policies = slices::remove(&role.managed_policies, arn);
        }
        Ok(())
    }

    async fn update_assume_policy(
        &self,
        role_name: &str,
        document: &AssumeRoleDocument,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::IamNotFound(role_name.to_string()))?;
        role.assume_role_policy = Some(document.clone());
        Ok(())
    }

    async fn update_inline_policy(&self, role_name: &str, document: &RoleDocument) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::IamNotFound(role_name.to_string()))?;
        role.inline_policy = Some(document.clone());
        Ok(())
    }

    async fn delete_inline_policy(&self, role_name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::IamNotFound(role_name.to_string()))?;
        role.inline_policy = None;
        Ok(())
    }

    async fn update_tags(&self, role_name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let role = state
            .roles
            .get_mut(role_name)
            .ok_or_else(|| Error::IamNotFound(role_name.to_string()))?;
        let mut tags = tags.clone();
        tags.insert(MANAGED_TAG_KEY.to_string(), MANAGED_TAG_VALUE.to_string());
        role.tags = tags;
        Ok(())
    }

    async fn allow_service_account_access(
        &self,
        role: &IamRole,
        oidc_provider_arn: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<()> {
        let mut document = role.assume_role_policy.clone().unwrap_or_default();
        if document.version.is_empty() {
            document.version = super::types::POLICY_VERSION.to_string();
        }
        document.statement.extend(
            AssumeRoleDocument::new_for(oidc_provider_arn, namespace, service_account).statement,
        );
        self.update_assume_policy(&role.role_name, &document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::crd::IamRoleServiceAccountSpec;

    const OIDC: &str = "arn:aws:iam::000000000000:oidc-provider/ISS";

    fn sample_irsa() -> IamRoleServiceAccount {
        IamRoleServiceAccount {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: IamRoleServiceAccountSpec::default(),
            status: None,
        }
    }

    #[tokio::test]
    async fn get_of_missing_role_is_not_found() {
        let fake = FakeRoleService::new("cls", "pre");
        let err = fake.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let fake = FakeRoleService::new("cls", "pre");
        let irsa = sample_irsa();

        let arn = fake.create(OIDC, &irsa).await.unwrap();
        assert_eq!(arn, "arn:aws:iam::000000000000:role/pre-cls-default-app");

        let err = fake.create(OIDC, &irsa).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn created_roles_carry_the_ownership_tag_and_trust_binding() {
        let fake = FakeRoleService::new("cls", "");
        fake.create(OIDC, &sample_irsa()).await.unwrap();

        let role = fake.get("cls-default-app").await.unwrap();
        assert!(role.is_managed_by_irsa_controller());
        assert!(role
            .assume_role_policy
            .as_ref()
            .unwrap()
            .is_allow_oidc(OIDC, "default", "app"));
    }

    #[tokio::test]
    async fn attach_skips_empty_arns_and_deduplicates() {
        let fake = FakeRoleService::new("cls", "");
        fake.create(OIDC, &sample_irsa()).await.unwrap();

        fake.attach_role_policy(
            "cls-default-app",
            &[String::new(), "arn:p".to_string(), "arn:p".to_string()],
        )
        .await
        .unwrap();

        let role = fake.role("cls-default-app").unwrap();
        assert_eq!(role.managed_policies, vec!["arn:p".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_the_role_and_errors_when_absent() {
        let fake = FakeRoleService::new("cls", "");
        let arn = fake.create(OIDC, &sample_irsa()).await.unwrap();

        fake.delete(&arn).await.unwrap();
        assert!(fake.role("cls-default-app").is_none());

        let err = fake.delete(&arn).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn allow_service_account_access_appends_to_existing_statements() {
        let fake = FakeRoleService::new("cls", "");
        let existing = IamRole {
            role_name: "ext".to_string(),
            role_arn: "arn:aws:iam::000000000000:role/ext".to_string(),
            assume_role_policy: Some(AssumeRoleDocument::new_for(OIDC, "other", "sa")),
            ..Default::default()
        };
        fake.insert_role(existing.clone());

        fake.allow_service_account_access(&existing, OIDC, "default", "app")
            .await
            .unwrap();

        let trust = fake.role("ext").unwrap().assume_role_policy.unwrap();
        assert_eq!(trust.statement.len(), 2);
        assert!(trust.is_allow_oidc(OIDC, "other", "sa"));
        assert!(trust.is_allow_oidc(OIDC, "default", "app"));
    }

    /// Applying the diff computed against the observed role yields a role
    /// deep-equal to the desired one.
    #[tokio::test]
    async fn applying_a_diff_converges_to_the_desired_role() {
        use super::super::types::{diff, RoleUpdate};
        use crate::crd::{InlinePolicySpec, PolicySpec, StatementEffect, StatementSpec};

        let fake = FakeRoleService::new("cls", "");
        let mut irsa = sample_irsa();
        irsa.spec.policy = Some(PolicySpec {
            managed_policies: vec!["arn:p1".to_string()],
            inline_policy: Some(InlinePolicySpec {
                version: "2012-10-17".to_string(),
                statement: vec![StatementSpec {
                    resource: vec!["*".to_string()],
                    action: vec!["s3:GetObject".to_string()],
                    effect: StatementEffect::Allow,
                    condition: Default::default(),
                }],
            }),
        });
        let arn = fake.create(OIDC, &irsa).await.unwrap();
        irsa.status = Some(crate::crd::IamRoleServiceAccountStatus {
            role_arn: arn,
            ..Default::default()
        });

        // drift: foreign policy attached, ours detached, tags scribbled on
        let mut drifted = fake.role("cls-default-app").unwrap();
        drifted.managed_policies = vec!["arn:foreign".to_string()];
        drifted.tags.insert("stray".to_string(), "tag".to_string());
        fake.insert_role(drifted.clone());

        let desired = IamRole::desired(OIDC, &irsa, &BTreeMap::new());
        let role_name = "cls-default-app";
        for update in diff(&drifted, &desired) {
            match update {
                RoleUpdate::AttachManagedPolicies(arns) => {
                    fake.attach_role_policy(role_name, &arns).await.unwrap()
                }
                RoleUpdate::DetachManagedPolicies(arns) => {
                    fake.detach_role_policy(role_name, &arns).await.unwrap()
                }
                RoleUpdate::PutInlinePolicy(document) => {
                    fake.update_inline_policy(role_name, &document).await.unwrap()
                }
                RoleUpdate::DeleteInlinePolicy => {
                    fake.delete_inline_policy(role_name).await.unwrap()
                }
                RoleUpdate::ReplaceAssumeRolePolicy(document) => {
                    fake.update_assume_policy(role_name, &document).await.unwrap()
                }
                RoleUpdate::ReplaceTags(tags) => {
                    fake.update_tags(role_name, &tags).await.unwrap()
                }
            }
        }

        let converged = fake.role(role_name).unwrap();
        assert_eq!(converged.managed_policies, desired.managed_policies);
        assert_eq!(converged.inline_policy, desired.inline_policy);
        assert_eq!(converged.assume_role_policy, desired.assume_role_policy);
        assert_eq!(converged.tags, desired.tags);
        // a second diff against the converged state is empty
        assert!(diff(&converged, &desired).is_empty());
    }

    #[tokio::test]
    async fn update_tags_forces_the_ownership_key() {
        let fake = FakeRoleService::new("cls", "");
        fake.create(OIDC, &sample_irsa()).await.unwrap();

        fake.update_tags(
            "cls-default-app",
            &BTreeMap::from([("team".to_string(), "storage".to_string())]),
        )
        .await
        .unwrap();

        let role = fake.role("cls-default-app").unwrap();
        assert_eq!(role.tags.get("team").unwrap(), "storage");
        assert!(role.is_managed_by_irsa_controller());
    }
}
