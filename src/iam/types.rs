//! IAM policy model
//!
//! In-memory representation of IAM role documents (trust policy, inline
//! policy, managed-policy references, tags) with AWS-shaped JSON marshaling,
//! equality for diffing, and the pure three-way diff between an observed and a
//! desired role.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crd::{IamRoleServiceAccount, StatementConditionSpec, StatementEffect, StatementSpec};
use crate::utils::slices;
use crate::{MANAGED_TAG_KEY, MANAGED_TAG_VALUE};

/// Policy language version written into generated documents
pub const POLICY_VERSION: &str = "2012-10-17";

/// Action a workload asserts to exchange its token for role credentials
pub const ASSUME_ROLE_WITH_WEB_IDENTITY: &str = "sts:AssumeRoleWithWebIdentity";

/// Returns the name of the single inline policy the operator attaches to a
/// self-managed role. The diff relies on this contract to find it again.
pub fn inline_policy_name(role_name: &str) -> String {
    format!("{role_name}-inline-policy")
}

/// Returns the substring of `role_arn` after the final `/`
pub fn role_name_by_arn(role_arn: &str) -> &str {
    role_arn.rsplit('/').next().unwrap_or(role_arn)
}

/// Returns the issuer host path of an OIDC provider ARN: the substring after
/// the first `/`, or the full ARN when it contains no `/`
fn issuer_hostpath(oidc_provider_arn: &str) -> &str {
    oidc_provider_arn
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or(oidc_provider_arn)
}

/// Principal of a trust-policy statement
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TrustPrincipal {
    /// ARN of the federated identity provider
    #[serde(default)]
    pub federated: String,
}

/// Condition of a trust-policy statement
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TrustCondition {
    /// Exact-match conditions, keyed `<issuerHost>:sub` for IRSA bindings
    #[serde(rename = "StringEquals", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub string_equals: BTreeMap<String, String>,
}

/// A single statement of an IAM role trust policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct TrustStatement {
    /// Whether the statement allows or denies
    pub effect: StatementEffect,
    /// Principal permitted to assume the role
    #[serde(default)]
    pub principal: TrustPrincipal,
    /// The single action of the statement
    #[serde(default)]
    pub action: String,
    /// Conditions narrowing which identities match
    #[serde(default)]
    pub condition: TrustCondition,
}

/// Trust relationship (assume-role policy) of an IAM role
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct AssumeRoleDocument {
    /// Policy language version
    #[serde(default)]
    pub version: String,
    /// The trust statements
    #[serde(default)]
    pub statement: Vec<TrustStatement>,
}

impl AssumeRoleDocument {
    /// Builds the one-statement trust document permitting the service account
    /// `namespace/service_account` to assume a role through the given OIDC
    /// provider
    pub fn new_for(oidc_provider_arn: &str, namespace: &str, service_account: &str) -> Self {
        let sub_key = format!("{}:sub", issuer_hostpath(oidc_provider_arn));
        let sub_value = format!("system:serviceaccount:{namespace}:{service_account}");
        Self {
            version: POLICY_VERSION.to_string(),
            statement: vec![TrustStatement {
                effect: StatementEffect::Allow,
                principal: TrustPrincipal {
                    federated: oidc_provider_arn.to_string(),
                },
                action: ASSUME_ROLE_WITH_WEB_IDENTITY.to_string(),
                condition: TrustCondition {
                    string_equals: BTreeMap::from([(sub_key, sub_value)]),
                },
            }],
        }
    }

    /// Returns true if some statement of this document permits the given
    /// service account to assume the role through the given OIDC provider
    pub fn is_allow_oidc(
        &self,
        oidc_provider_arn: &str,
        namespace: &str,
        service_account: &str,
    ) -> bool {
        let sub_key = format!("{}:sub", issuer_hostpath(oidc_provider_arn));
        let sub_value = format!("system:serviceaccount:{namespace}:{service_account}");
        self.statement.iter().any(|statement| {
            statement.action == ASSUME_ROLE_WITH_WEB_IDENTITY
                && statement.principal.federated == oidc_provider_arn
                && statement.condition.string_equals.get(&sub_key) == Some(&sub_value)
        })
    }

    /// Serializes the document to its canonical JSON form
    pub fn policy_document(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A single statement of a permissions policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RoleStatement {
    /// Whether the statement allows or denies
    pub effect: StatementEffect,
    /// Actions covered by the statement
    #[serde(default)]
    pub action: Vec<String>,
    /// Resources covered by the statement
    #[serde(default)]
    pub resource: Vec<String>,
    /// Conditions narrowing when the statement applies
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: StatementConditionSpec,
}

impl From<&StatementSpec> for RoleStatement {
    fn from(spec: &StatementSpec) -> Self {
        Self {
            effect: spec.effect,
            action: spec.action.clone(),
            resource: spec.resource.clone(),
            condition: spec.condition.clone(),
        }
    }
}

/// A permissions policy document (used for inline policies)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RoleDocument {
    /// Policy language version
    #[serde(default)]
    pub version: String,
    /// The policy statements
    #[serde(default)]
    pub statement: Vec<RoleStatement>,
}

impl RoleDocument {
    /// Serializes the document to its canonical JSON form
    pub fn policy_document(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An IAM role as observed from the cloud account or desired from an IRSA.
///
/// Two inline policies are equal iff their canonical JSON is equal, managed
/// policy sets iff they are identical as multisets, and tag maps iff identical
/// as mappings; [`diff`] relies on these semantics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IamRole {
    /// ARN of the role, empty when the role has not been created
    pub role_arn: String,
    /// Name of the role, empty when `role_arn` is empty
    pub role_name: String,
    /// The single operator-managed inline policy, if any
    pub inline_policy: Option<RoleDocument>,
    /// ARNs of attached managed policies
    pub managed_policies: Vec<String>,
    /// Trust relationship of the role
    pub assume_role_policy: Option<AssumeRoleDocument>,
    /// Role tags
    pub tags: BTreeMap<String, String>,
}

impl IamRole {
    /// Builds the desired role for a self-managed IRSA.
    ///
    /// Tags are merged from `extra_tags` (operator-wide) and the IRSA spec,
    /// with the fixed ownership tag always winning.
    pub fn desired(
        oidc_provider_arn: &str,
        irsa: &IamRoleServiceAccount,
        extra_tags: &BTreeMap<String, String>,
    ) -> Self {
        let namespace = irsa.metadata.namespace.as_deref().unwrap_or_default();
        let name = irsa.metadata.name.as_deref().unwrap_or_default();

        let mut role = Self {
            role_arn: irsa.role_arn().to_string(),
            role_name: role_name_by_arn(irsa.role_arn()).to_string(),
            ..Default::default()
        };

        if let Some(policy) = &irsa.spec.policy {
            role.managed_policies = policy.managed_policies.clone();
            role.inline_policy = policy.inline_policy.as_ref().map(|inline| RoleDocument {
                version: inline.version.clone(),
                statement: inline.statement.iter().map(RoleStatement::from).collect(),
            });
        }

        role.assume_role_policy = Some(AssumeRoleDocument::new_for(
            oidc_provider_arn,
            namespace,
            name,
        ));

        role.tags = extra_tags.clone();
        role.tags.extend(irsa.spec.tags.clone());
        role.tags
            .insert(MANAGED_TAG_KEY.to_string(), MANAGED_TAG_VALUE.to_string());

        role
    }

    /// Returns true if the role carries the operator ownership tag
    pub fn is_managed_by_irsa_controller(&self) -> bool {
        self.tags.get(MANAGED_TAG_KEY).map(String::as_str) == Some(MANAGED_TAG_VALUE)
    }
}

/// A single mutation needed to move an observed role to its desired state.
///
/// Produced by [`diff`] in execution order; the reconciler maps each variant
/// onto one IAM port call.
#[derive(Clone, Debug, PartialEq)]
pub enum RoleUpdate {
    /// Attach the listed managed policies
    AttachManagedPolicies(Vec<String>),
    /// Detach the listed managed policies
    DetachManagedPolicies(Vec<String>),
    /// Write the inline policy under the fixed per-role name
    PutInlinePolicy(RoleDocument),
    /// Remove the fixed-name inline policy
    DeleteInlinePolicy,
    /// Replace the trust policy wholesale
    ReplaceAssumeRolePolicy(AssumeRoleDocument),
    /// Replace the role tags wholesale
    ReplaceTags(BTreeMap<String, String>),
}

/// Computes the ordered mutations that turn `observed` into `desired`.
///
/// Attachments are emitted before detachments so a transiently shrinking
/// policy set never leaves the role without its declared permissions; the
/// trust policy is replaced, not appended to, which heals external drift.
pub fn diff(observed: &IamRole, desired: &IamRole) -> Vec<RoleUpdate> {
    let mut updates = Vec::new();

    if !slices::unordered_eq(&observed.managed_policies, &desired.managed_policies) {
        let attach: Vec<String> = desired
            .managed_policies
            .iter()
            .filter(|arn| !slices::contains(&observed.managed_policies, arn))
            .cloned()
            .collect();
        let detach: Vec<String> = observed
            .managed_policies
            .iter()
            .filter(|arn| !slices::contains(&desired.managed_policies, arn))
            .cloned()
            .collect();
        if !attach.is_empty() {
            updates.push(RoleUpdate::AttachManagedPolicies(attach));
        }
        if !detach.is_empty() {
            updates.push(RoleUpdate::DetachManagedPolicies(detach));
        }
    }

    if observed.inline_policy != desired.inline_policy {
        match &desired.inline_policy {
            Some(document) => updates.push(RoleUpdate::PutInlinePolicy(document.clone())),
            None => updates.push(RoleUpdate::DeleteInlinePolicy),
        }
    }

    if observed.assume_role_policy != desired.assume_role_policy {
        if let Some(document) = &desired.assume_role_policy {
            updates.push(RoleUpdate::ReplaceAssumeRolePolicy(document.clone()));
        }
    }

    if observed.tags != desired.tags {
        updates.push(RoleUpdate::ReplaceTags(desired.tags.clone()));
    }

    updates
}
