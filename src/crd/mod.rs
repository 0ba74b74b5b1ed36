//! Custom Resource Definitions for the irsa-operator
//!
//! This module contains the `IamRoleServiceAccount` CRD and its supporting
//! spec/status types.

mod iam_role_service_account;
mod types;

pub use iam_role_service_account::{
    IamRoleServiceAccount, IamRoleServiceAccountSpec, IamRoleServiceAccountStatus,
};
pub use types::{
    InlinePolicySpec, IrsaCondition, PolicySpec, StatementConditionSpec, StatementEffect,
    StatementSpec,
};
