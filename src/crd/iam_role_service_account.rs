//! IamRoleServiceAccount Custom Resource Definition
//!
//! An `IamRoleServiceAccount` (IRSA) declares that the service account with
//! the same namespace and name should be bound to an AWS IAM role. The role is
//! either created and owned by the operator (when `policy` is declared) or a
//! pre-existing one referenced by `roleName`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{IrsaCondition, PolicySpec};

/// Specification for an IamRoleServiceAccount
///
/// `roleName` and `policy` are mutually exclusive: a resource either adopts an
/// externally managed role (read-only except for the trust binding) or
/// declares the permissions of a role the operator owns.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "irsa.dev",
    version = "v1alpha1",
    kind = "IamRoleServiceAccount",
    plural = "iamroleserviceaccounts",
    shortname = "irsa",
    status = "IamRoleServiceAccountStatus",
    namespaced,
    printcolumn = r#"{"name":"RoleArn","type":"string","jsonPath":".status.roleArn"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.condition"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IamRoleServiceAccountSpec {
    /// Name of a pre-existing IAM role to bind instead of creating one.
    ///
    /// When set, the operator never creates, deletes or edits the role's
    /// permissions; it only adds the trust-policy binding for this service
    /// account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,

    /// Permissions of the operator-owned role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicySpec>,

    /// Extra tags for the role, applied only when the operator owns it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Observed state of an IamRoleServiceAccount
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IamRoleServiceAccountStatus {
    /// ARN of the bound IAM role, empty until first successful provisioning
    #[serde(default)]
    pub role_arn: String,

    /// Current lifecycle condition
    #[serde(default)]
    pub condition: IrsaCondition,

    /// Brief description of the most recent failure, empty when healthy.
    ///
    /// Always serialized: the status is written as a merge patch, and an
    /// omitted key would leave a stale reason behind after recovery.
    #[serde(default)]
    pub reason: String,
}

impl IamRoleServiceAccount {
    /// Returns the deterministic name of the operator-owned IAM role:
    /// `[prefix-]cluster-namespace-name`, with the prefix segment omitted
    /// when `prefix` is empty.
    ///
    /// This is the only function used to locate self-managed roles.
    pub fn aws_iam_role_name(&self, prefix: &str, cluster_name: &str) -> String {
        let namespace = self.metadata.namespace.as_deref().unwrap_or_default();
        let name = self.metadata.name.as_deref().unwrap_or_default();
        if prefix.is_empty() {
            format!("{cluster_name}-{namespace}-{name}")
        } else {
            format!("{prefix}-{cluster_name}-{namespace}-{name}")
        }
    }

    /// Returns the current condition, `Submitted` when status is unset
    pub fn condition(&self) -> IrsaCondition {
        self.status
            .as_ref()
            .map(|status| status.condition)
            .unwrap_or_default()
    }

    /// Returns the recorded role ARN, empty until provisioning succeeded
    pub fn role_arn(&self) -> &str {
        self.status
            .as_ref()
            .map(|status| status.role_arn.as_str())
            .unwrap_or_default()
    }

    /// Returns the externally managed role name, if the spec declares one
    pub fn external_role_name(&self) -> Option<&str> {
        self.spec
            .role_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_irsa(namespace: &str, name: &str) -> IamRoleServiceAccount {
        IamRoleServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: IamRoleServiceAccountSpec::default(),
            status: None,
        }
    }

    #[test]
    fn role_name_includes_prefix_when_set() {
        let irsa = sample_irsa("default", "app");
        assert_eq!(irsa.aws_iam_role_name("pre", "cls"), "pre-cls-default-app");
    }

    #[test]
    fn role_name_omits_empty_prefix() {
        let irsa = sample_irsa("default", "app");
        assert_eq!(irsa.aws_iam_role_name("", "cls"), "cls-default-app");
    }

    #[test]
    fn condition_defaults_to_submitted_without_status() {
        let irsa = sample_irsa("default", "app");
        assert_eq!(irsa.condition(), IrsaCondition::Submitted);
        assert_eq!(irsa.role_arn(), "");
    }

    #[test]
    fn external_role_name_ignores_empty_string() {
        let mut irsa = sample_irsa("default", "app");
        irsa.spec.role_name = Some(String::new());
        assert_eq!(irsa.external_role_name(), None);

        irsa.spec.role_name = Some("ext".to_string());
        assert_eq!(irsa.external_role_name(), Some("ext"));
    }

    /// Story: the status subresource keeps its camelCase wire names so the
    /// printcolumns (`.status.roleArn`, `.status.condition`) resolve.
    #[test]
    fn status_serializes_with_camel_case_keys() {
        let status = IamRoleServiceAccountStatus {
            role_arn: "arn:aws:iam::000000000000:role/cls-default-app".to_string(),
            condition: IrsaCondition::Synced,
            reason: String::new(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json.get("roleArn").and_then(|v| v.as_str()),
            Some("arn:aws:iam::000000000000:role/cls-default-app")
        );
        assert_eq!(
            json.get("condition").and_then(|v| v.as_str()),
            Some("Synced")
        );
        // reason is always present so merge patches can clear it
        assert_eq!(json.get("reason").and_then(|v| v.as_str()), Some(""));
    }
}
