//! AWS SDK implementation of the IAM port

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_iam::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_iam::types::{Role, Tag};
use tracing::debug;

use super::types::{
    inline_policy_name, role_name_by_arn, AssumeRoleDocument, IamRole, RoleDocument,
    POLICY_VERSION,
};
use super::RoleService;
use crate::config::OperatorConfig;
use crate::crd::IamRoleServiceAccount;
use crate::error::Error;
use crate::{Result, MANAGED_TAG_KEY, MANAGED_TAG_VALUE};

/// IAM port implementation backed by the AWS SDK
pub struct IamClient {
    client: aws_sdk_iam::Client,
    prefix: String,
    cluster_name: String,
    additional_tags: BTreeMap<String, String>,
}

impl IamClient {
    /// Builds a client from the operator configuration.
    ///
    /// Without an `awsConfig` block the default credential chain and region
    /// resolution apply; with one, its endpoint/region/static credentials
    /// override the defaults (localstack-style setups).
    pub async fn new(config: &OperatorConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(aws) = &config.aws {
            loader = loader.region(Region::new(aws.region_or_default()));
            if !aws.access_key_id.is_empty() {
                loader = loader.credentials_provider(Credentials::new(
                    aws.access_key_id.clone(),
                    aws.secret_access_key.clone(),
                    None,
                    None,
                    "irsa-operator-config",
                ));
            }
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_iam::config::Builder::from(&shared);
        if let Some(endpoint) = config.aws.as_ref().and_then(|aws| aws.endpoint_url()) {
            builder = builder.endpoint_url(endpoint);
        }

        Self::with_sdk_client(
            aws_sdk_iam::Client::from_conf(builder.build()),
            &config.cluster_name,
            &config.iam_role_prefix,
            config.parsed_additional_tags(),
        )
    }

    /// Wraps an already-configured SDK client
    pub fn with_sdk_client(
        client: aws_sdk_iam::Client,
        cluster_name: &str,
        prefix: &str,
        additional_tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            cluster_name: cluster_name.to_string(),
            additional_tags,
        }
    }

    fn sdk_tags(tags: &BTreeMap<String, String>) -> Result<Vec<Tag>> {
        tags.iter()
            .map(|(key, value)| {
                let value = if key == MANAGED_TAG_KEY {
                    MANAGED_TAG_VALUE
                } else {
                    value.as_str()
                };
                Tag::builder()
                    .key(key)
                    .value(value)
                    .build()
                    .map_err(|err| Error::iam("TagRole", err.to_string()))
            })
            .collect()
    }
}

/// Normalizes SDK string members, which are modeled as plain `&str` or as
/// `Option<&str>` depending on the SDK generation
fn text<'a>(value: impl Into<Option<&'a str>>) -> &'a str {
    value.into().unwrap_or_default()
}

/// Maps an SDK failure onto the operator error classification
fn classify<E>(op: &'static str, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = err
        .message()
        .map(ToString::to_string)
        .unwrap_or_else(|| err.to_string());
    match err.code() {
        Some("NoSuchEntity") => Error::IamNotFound(message),
        Some("EntityAlreadyExists") => Error::IamAlreadyExists(message),
        _ => Error::Iam {
            op: op.to_string(),
            message,
        },
    }
}

#[async_trait]
impl RoleService for IamClient {
    fn role_name(&self, irsa: &IamRoleServiceAccount) -> String {
        irsa.aws_iam_role_name(&self.prefix, &self.cluster_name)
    }

    async fn create(
        &self,
        oidc_provider_arn: &str,
        irsa: &IamRoleServiceAccount,
    ) -> Result<String> {
        let desired = IamRole::desired(oidc_provider_arn, irsa, &self.additional_tags);
        let role_name = self.role_name(irsa);

        let trust = desired
            .assume_role_policy
            .as_ref()
            .map(AssumeRoleDocument::policy_document)
            .transpose()?
            .unwrap_or_default();

        let created = self
            .client
            .create_role()
            .role_name(&role_name)
            .assume_role_policy_document(trust)
            .set_tags(Some(Self::sdk_tags(&desired.tags)?))
            .send()
            .await
            .map_err(|err| classify("CreateRole", err))?;

        let role_arn = Option::<&Role>::from(created.role())
            .map(|role| text(role.arn()).to_string())
            .ok_or_else(|| Error::iam("CreateRole", "response carried no role"))?;
        debug!(role = %role_name, arn = %role_arn, "created iam role");

        if let Some(inline) = &desired.inline_policy {
            self.update_inline_policy(&role_name, inline).await?;
        }
        self.attach_role_policy(&role_name, &desired.managed_policies)
            .await?;

        Ok(role_arn)
    }

    async fn get(&self, role_name: &str) -> Result<IamRole> {
        let fetched = self
            .client
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(|err| classify("GetRole", err))?;
        let role = Option::<&Role>::from(fetched.role())
            .ok_or_else(|| Error::iam("GetRole", "response carried no role"))?;

        let attached = self
            .client
            .list_attached_role_policies()
            .role_name(role_name)
            .send()
            .await
            .map_err(|err| classify("ListAttachedRolePolicies", err))?;
        let managed_policies: Vec<String> = attached
            .attached_policies()
            .iter()
            .filter_map(|policy| policy.policy_arn().map(str::to_string))
            .collect();

        let inline_policy = match self
            .client
            .get_role_policy()
            .role_name(role_name)
            .policy_name(inline_policy_name(role_name))
            .send()
            .await
        {
            Ok(found) => {
                serde_json::from_str::<RoleDocument>(text(found.policy_document())).map(Some)?
            }
            Err(err) => {
                let err = classify("GetRolePolicy", err);
                if err.is_not_found() {
                    None
                } else {
                    return Err(err);
                }
            }
        };

        let assume_role_policy = role
            .assume_role_policy_document()
            .map(serde_json::from_str::<AssumeRoleDocument>)
            .transpose()?;

        let tags = role
            .tags()
            .iter()
            .map(|tag| (text(tag.key()).to_string(), text(tag.value()).to_string()))
            .collect();

        Ok(IamRole {
            role_arn: text(role.arn()).to_string(),
            role_name: text(role.role_name()).to_string(),
            inline_policy,
            managed_policies,
            assume_role_policy,
            tags,
        })
    }

    async fn delete(&self, role_arn: &str) -> Result<()> {
        let role_name = role_name_by_arn(role_arn);

        let attached = self
            .client
            .list_attached_role_policies()
            .role_name(role_name)
            .send()
            .await
            .map_err(|err| classify("ListAttachedRolePolicies", err))?;
        for policy in attached.attached_policies() {
            if let Some(policy_arn) = policy.policy_arn() {
                self.client
                    .detach_role_policy()
                    .role_name(role_name)
                    .policy_arn(policy_arn)
                    .send()
                    .await
                    .map_err(|err| classify("DetachRolePolicy", err))?;
            }
        }

        let inline = self
            .client
            .list_role_policies()
            .role_name(role_name)
            .send()
            .await
            .map_err(|err| classify("ListRolePolicies", err))?;
        for policy_name in inline.policy_names() {
            self.client
                .delete_role_policy()
                .role_name(role_name)
                .policy_name(policy_name)
                .send()
                .await
                .map_err(|err| classify("DeleteRolePolicy", err))?;
        }

        self.client
            .delete_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(|err| classify("DeleteRole", err))?;
        debug!(role = %role_name, "deleted iam role");
        Ok(())
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arns: &[String]) -> Result<()> {
        for policy_arn in policy_arns {
            if policy_arn.is_empty() {
                continue;
            }
            self.client
                .attach_role_policy()
                .role_name(role_name)
                .policy_arn(policy_arn)
                .send()
                .await
                .map_err(|err| classify("AttachRolePolicy", err))?;
        }
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arns: &[String]) -> Result<()> {
        for policy_arn in policy_arns {
            if policy_arn.is_empty() {
                continue;
            }
            self.client
                .detach_role_policy()
                .role_name(role_name)
                .policy_arn(policy_arn)
                .send()
                .await
                .map_err(|err| classify("DetachRolePolicy", err))?;
        }
        Ok(())
    }

    async fn update_assume_policy(
        &self,
        role_name: &str,
        document: &AssumeRoleDocument,
    ) -> Result<()> {
        self.client
            .update_assume_role_policy()
            .role_name(role_name)
            .policy_document(document.policy_document()?)
            .send()
            .await
            .map_err(|err| classify("UpdateAssumeRolePolicy", err))?;
        Ok(())
    }

    async fn update_inline_policy(&self, role_name: &str, document: &RoleDocument) -> Result<()> {
        self.client
            .put_role_policy()
            .role_name(role_name)
            .policy_name(inline_policy_name(role_name))
            .policy_document(document.policy_document()?)
            .send()
            .await
            .map_err(|err| classify("PutRolePolicy", err))?;
        Ok(())
    }

    async fn delete_inline_policy(&self, role_name: &str) -> Result<()> {
        self.client
            .delete_role_policy()
            .role_name(role_name)
            .policy_name(inline_policy_name(role_name))
            .send()
            .await
            .map_err(|err| classify("DeleteRolePolicy", err))?;
        Ok(())
    }

    async fn update_tags(&self, role_name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut desired = tags.clone();
        desired.insert(MANAGED_TAG_KEY.to_string(), MANAGED_TAG_VALUE.to_string());

        // Full replacement: drop tags that are no longer desired before
        // writing the new set.
        let current = self
            .client
            .list_role_tags()
            .role_name(role_name)
            .send()
            .await
            .map_err(|err| classify("ListRoleTags", err))?;
        let stale: Vec<String> = current
            .tags()
            .iter()
            .map(|tag| text(tag.key()).to_string())
            .filter(|key| !desired.contains_key(key))
            .collect();
        if !stale.is_empty() {
            self.client
                .untag_role()
                .role_name(role_name)
                .set_tag_keys(Some(stale))
                .send()
                .await
                .map_err(|err| classify("UntagRole", err))?;
        }

        self.client
            .tag_role()
            .role_name(role_name)
            .set_tags(Some(Self::sdk_tags(&desired)?))
            .send()
            .await
            .map_err(|err| classify("TagRole", err))?;
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
            document.version = POLICY_VERSION.to_string();
        }
        document.statement.extend(
            AssumeRoleDocument::new_for(oidc_provider_arn, namespace, service_account).statement,
        );
        self.update_assume_policy(&role.role_name, &document).await
    }
}
