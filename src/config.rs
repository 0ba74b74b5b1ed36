//! Operator configuration
//!
//! The configuration is loaded once at boot from a YAML file and handed to
//! the reconciler as an immutable value; it is never mutated afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;
use crate::Result;

const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Process-wide operator configuration
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperatorConfig {
    /// Optional prefix for the names of operator-owned IAM roles
    #[serde(default)]
    pub iam_role_prefix: String,

    /// ARN of the cluster's OIDC identity provider (required)
    #[serde(default)]
    pub oidc_provider_arn: String,

    /// Name of the cluster, part of every owned role name (required)
    #[serde(default)]
    pub cluster_name: String,

    /// Extra `key=value` tags applied to every owned role
    #[serde(default)]
    pub additional_tags: Vec<String>,

    /// Optional AWS client overrides, mainly for non-default endpoints
    #[serde(default, rename = "awsConfig")]
    pub aws: Option<AwsConfig>,
}

/// Overrides for the AWS SDK client
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AwsConfig {
    /// Custom service endpoint, e.g. a localstack URL
    #[serde(default)]
    pub endpoint: String,

    /// AWS region; defaults to us-east-1 when left empty
    #[serde(default)]
    pub region: String,

    /// Static access key id; requires `secretAccessKey`
    #[serde(default, rename = "accessKeyID")]
    pub access_key_id: String,

    /// Static secret access key; requires `accessKeyID`
    #[serde(default)]
    pub secret_access_key: String,

    /// Use plain HTTP when the endpoint carries no scheme
    #[serde(default, rename = "disableSSL")]
    pub disable_ssl: bool,
}

impl OperatorConfig {
    /// Reads and parses the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| Error::config(format!("read {}: {err}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|err| Error::config(format!("parse {}: {err}", path.display())))
    }

    /// Validates the configuration; called once at boot
    pub fn validate(&self) -> Result<()> {
        if self.oidc_provider_arn.is_empty() {
            return Err(Error::config("oidcProviderArn is required"));
        }
        if self.cluster_name.is_empty() {
            return Err(Error::config("clusterName is required"));
        }
        if let Some(aws) = &self.aws {
            if aws.access_key_id.is_empty() != aws.secret_access_key.is_empty() {
                return Err(Error::config(
                    "accessKeyID and secretAccessKey must be set together",
                ));
            }
        }
        Ok(())
    }

    /// Parses `additionalTags` entries of the form `key=value`.
    ///
    /// Entries without a `=` are ignored; the first `=` splits key and value.
    pub fn parsed_additional_tags(&self) -> BTreeMap<String, String> {
        self.additional_tags
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }
}

impl AwsConfig {
    /// Returns the configured region, or the default when empty
    pub fn region_or_default(&self) -> String {
        if self.region.is_empty() {
            DEFAULT_AWS_REGION.to_string()
        } else {
            self.region.clone()
        }
    }

    /// Returns the endpoint as a URL, honoring `disableSSL` for scheme-less
    /// endpoints; `None` when no endpoint override is configured
    pub fn endpoint_url(&self) -> Option<String> {
        if self.endpoint.is_empty() {
            return None;
        }
        if self.endpoint.contains("://") {
            return Some(self.endpoint.clone());
        }
        let scheme = if self.disable_ssl { "http" } else { "https" };
        Some(format!("{scheme}://{}", self.endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> OperatorConfig {
        OperatorConfig {
            oidc_provider_arn: "arn:aws:iam::000000000000:oidc-provider/ISS".to_string(),
            cluster_name: "cls".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_config_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn missing_oidc_provider_is_rejected() {
        let mut config = valid_config();
        config.oidc_provider_arn.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("oidcProviderArn"));
    }

    #[test]
    fn missing_cluster_name_is_rejected() {
        let mut config = valid_config();
        config.cluster_name.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("clusterName"));
    }

    /// Story: static credentials must be both-or-neither; half a credential
    /// pair is always a mistake.
    #[test]
    fn partial_static_credentials_are_rejected() {
        let mut config = valid_config();
        config.aws = Some(AwsConfig {
            access_key_id: "AKIA...".to_string(),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.aws = Some(AwsConfig {
            access_key_id: "AKIA...".to_string(),
            secret_access_key: "secret".to_string(),
            ..Default::default()
        });
        assert!(config.validate().is_ok());

        // neither is fine too: the default credential chain applies
        config.aws = Some(AwsConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn additional_tags_parse_and_skip_malformed_entries() {
        let mut config = valid_config();
        config.additional_tags = vec![
            "team=storage".to_string(),
            "malformed".to_string(),
            "env=prod=eu".to_string(),
        ];
        let tags = config.parsed_additional_tags();
        assert_eq!(tags.get("team").unwrap(), "storage");
        assert_eq!(tags.get("env").unwrap(), "prod=eu");
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn region_defaults_when_empty() {
        assert_eq!(AwsConfig::default().region_or_default(), "us-east-1");
        let aws = AwsConfig {
            region: "eu-west-1".to_string(),
            ..Default::default()
        };
        assert_eq!(aws.region_or_default(), "eu-west-1");
    }

    #[test]
    fn endpoint_url_honors_disable_ssl() {
        let mut aws = AwsConfig::default();
        assert_eq!(aws.endpoint_url(), None);

        aws.endpoint = "localstack:4566".to_string();
        assert_eq!(aws.endpoint_url().unwrap(), "https://localstack:4566");

        aws.disable_ssl = true;
        assert_eq!(aws.endpoint_url().unwrap(), "http://localstack:4566");

        aws.endpoint = "http://localstack:4566".to_string();
        aws.disable_ssl = false;
        assert_eq!(aws.endpoint_url().unwrap(), "http://localstack:4566");
    }

    #[test]
    fn yaml_round_trip_uses_wire_field_names() {
        let yaml = r#"
iamRolePrefix: pre
oidcProviderArn: arn:aws:iam::000000000000:oidc-provider/ISS
clusterName: cls
additionalTags:
  - team=storage
awsConfig:
  endpoint: localstack:4566
  region: eu-west-1
  accessKeyID: AKIA
  secretAccessKey: secret
  disableSSL: true
"#;
        let config: OperatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.iam_role_prefix, "pre");
        assert_eq!(config.cluster_name, "cls");
        let aws = config.aws.as_ref().unwrap();
        assert_eq!(aws.access_key_id, "AKIA");
        assert!(aws.disable_ssl);
        assert!(config.validate().is_ok());
    }
}
