//! irsa-operator - Kubernetes operator binding service accounts to AWS IAM roles
//!
//! The operator materializes each `IamRoleServiceAccount` custom resource into
//! an AWS IAM role whose trust policy authorizes the matching cluster service
//! account through the cluster's OIDC provider, and into a `ServiceAccount`
//! annotated with the role ARN. A per-resource reconciliation loop keeps both
//! artifacts in sync through create, update and delete.
//!
//! # Modules
//!
//! - [`crd`] - the `IamRoleServiceAccount` Custom Resource Definition
//! - [`controller`] - reconciliation logic and the cluster-API port
//! - [`iam`] - IAM policy model and the IAM port (real SDK client + fake)
//! - [`config`] - operator configuration loaded at boot
//! - [`utils`] - small shared helpers
//! - [`error`] - error types for the operator

#![cfg_attr(not(test), deny(missing_docs))]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod iam;
pub mod utils;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Wire-format constants
// =============================================================================
// These values appear in persisted cluster objects and in AWS; changing any of
// them orphans resources written by earlier versions of the operator.

/// Annotation key on a `ServiceAccount` carrying the bound IAM role ARN.
///
/// This is the key the EKS pod identity webhook reads to inject credentials.
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

/// Tag key marking an IAM role as created and owned by this operator
pub const MANAGED_TAG_KEY: &str = "irsa-controller";

/// Tag value that, together with [`MANAGED_TAG_KEY`], marks operator ownership
pub const MANAGED_TAG_VALUE: &str = "y";

/// Finalizer sentinel blocking IRSA deletion until cloud-side cleanup is done
pub const FINALIZER: &str = "iamRole.finalizer.irsa.dev";
