//! Supporting types for the IamRoleServiceAccount CRD

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Effect of a policy statement
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StatementEffect {
    /// The statement grants the listed actions
    #[default]
    Allow,
    /// The statement denies the listed actions
    Deny,
}

impl std::fmt::Display for StatementEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "Allow"),
            Self::Deny => write!(f, "Deny"),
        }
    }
}

/// Permissions requested for the IAM role owned by an IRSA
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// ARNs of managed policies to attach to the role
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies: Vec<String>,

    /// Inline policy embedded directly in the role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_policy: Option<InlinePolicySpec>,
}

/// Inline policy created within the IAM role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct InlinePolicySpec {
    /// Policy language version, normally "2012-10-17"
    pub version: String,

    /// The policy statements
    pub statement: Vec<StatementSpec>,
}

/// Condition block of a policy statement: operator -> key -> value
pub type StatementConditionSpec = BTreeMap<String, BTreeMap<String, String>>;

/// A single policy statement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StatementSpec {
    /// Resources the statement applies to
    pub resource: Vec<String>,

    /// Actions the statement allows or denies
    pub action: Vec<String>,

    /// Whether the statement allows or denies
    pub effect: StatementEffect,

    /// Optional condition narrowing when the statement applies
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub condition: StatementConditionSpec,
}

/// Observed lifecycle condition of an IRSA.
///
/// The value is persisted in the status subresource and shown by the Status
/// printcolumn, so the string representation is stable. A freshly created
/// object has no condition yet; that state serializes as the empty string.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum IrsaCondition {
    /// The object has been created but not yet picked up by the operator
    #[default]
    #[serde(rename = "")]
    Submitted,
    /// The operator has seen the object and will run prechecks next
    Pending,
    /// A service account or IAM role with a matching name exists but is not
    /// owned by this IRSA
    Conflict,
    /// Prechecks failed for a reason other than an ownership conflict
    Forbidden,
    /// A provisioning or sync step failed; it will be retried
    Failed,
    /// Prechecks passed; cloud-side provisioning is in progress
    Progressing,
    /// Role and service account match the declared spec
    Synced,
}

impl std::fmt::Display for IrsaCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "",
            Self::Pending => "Pending",
            Self::Conflict => "Conflict",
            Self::Forbidden => "Forbidden",
            Self::Failed => "Failed",
            Self::Progressing => "Progressing",
            Self::Synced => "Synced",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(IrsaCondition::Submitted, r#""""#)]
    #[case(IrsaCondition::Pending, r#""Pending""#)]
    #[case(IrsaCondition::Conflict, r#""Conflict""#)]
    #[case(IrsaCondition::Forbidden, r#""Forbidden""#)]
    #[case(IrsaCondition::Failed, r#""Failed""#)]
    #[case(IrsaCondition::Progressing, r#""Progressing""#)]
    #[case(IrsaCondition::Synced, r#""Synced""#)]
    fn condition_serialization_is_stable(#[case] condition: IrsaCondition, #[case] json: &str) {
        assert_eq!(serde_json::to_string(&condition).unwrap(), json);
        let parsed: IrsaCondition = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, condition);
    }

    #[test]
    fn display_matches_serialization() {
        for condition in [
            IrsaCondition::Submitted,
            IrsaCondition::Pending,
            IrsaCondition::Conflict,
            IrsaCondition::Forbidden,
            IrsaCondition::Failed,
            IrsaCondition::Progressing,
            IrsaCondition::Synced,
        ] {
            let json = serde_json::to_string(&condition).unwrap();
            assert_eq!(json, format!("\"{condition}\""), "mismatch for {condition:?}");
        }
    }

    #[test]
    fn fresh_objects_default_to_submitted() {
        assert_eq!(IrsaCondition::default(), IrsaCondition::Submitted);
    }

    #[test]
    fn statement_condition_round_trips() {
        let spec = StatementSpec {
            resource: vec!["*".into()],
            action: vec!["s3:GetObject".into()],
            effect: StatementEffect::Allow,
            condition: BTreeMap::from([(
                "StringEquals".to_string(),
                BTreeMap::from([("aws:SourceAccount".to_string(), "000000000000".to_string())]),
            )]),
        };
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: StatementSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, spec);
    }
}
