//! IamRoleServiceAccount reconciliation
//!
//! One reconcile invocation drives a single IRSA through
//! validation -> external-resource discovery -> cloud-side provisioning ->
//! service-account materialization -> steady-state drift correction ->
//! finalizer-gated deletion. The reconciler owns no mutable state of its own;
//! everything it needs lives in the cluster object, the cloud account and the
//! immutable [`Context`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::cluster::{ClusterClient, KubeClusterClient};
use crate::config::OperatorConfig;
use crate::crd::{IamRoleServiceAccount, IrsaCondition};
use crate::error::Error;
use crate::iam::{diff, role_name_by_arn, IamRole, RoleService, RoleUpdate};
use crate::utils::slices;
use crate::{Result, FINALIZER, ROLE_ARN_ANNOTATION};

/// Delay before a failed reconcile is retried
pub const REQUEUE_PERIOD: Duration = Duration::from_secs(180);

/// Controller context shared across all reconcile calls.
///
/// Configuration is copied in at construction and never mutated; different
/// IRSA keys may reconcile in parallel against the same context.
pub struct Context {
    /// Cluster-API port (trait object for testability)
    pub cluster: Arc<dyn ClusterClient>,
    /// IAM port
    pub iam: Arc<dyn RoleService>,
    /// ARN of the cluster's OIDC identity provider
    pub oidc_provider_arn: String,
    /// Operator-wide tags merged into every owned role
    pub additional_tags: BTreeMap<String, String>,
}

impl Context {
    /// Creates a context backed by the real cluster client
    pub fn new(client: kube::Client, iam: Arc<dyn RoleService>, config: &OperatorConfig) -> Self {
        Self::with_clients(
            Arc::new(KubeClusterClient::new(client)),
            iam,
            &config.oidc_provider_arn,
            config.parsed_additional_tags(),
        )
    }

    /// Creates a context with custom port implementations.
    ///
    /// This is primarily used for testing with fakes or mocks.
    pub fn with_clients(
        cluster: Arc<dyn ClusterClient>,
        iam: Arc<dyn RoleService>,
        oidc_provider_arn: &str,
        additional_tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            cluster,
            iam,
            oidc_provider_arn: oidc_provider_arn.to_string(),
            additional_tags,
        }
    }
}

/// Reconcile a single IamRoleServiceAccount.
///
/// Deletion is finalizer-driven: a vanished object needs no work, an object
/// with a deletion timestamp runs the cleanup path, and everything else steps
/// the condition state machine. At most one cluster mutation happens per
/// invocation before returning; status writes generate the watch events that
/// drive the next step.
#[instrument(skip(irsa, ctx), fields(irsa = %irsa.name_any(), namespace = %irsa.namespace().unwrap_or_default()))]
pub async fn reconcile(
    irsa: Arc<IamRoleServiceAccount>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, Error> {
    let namespace = irsa
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = irsa.name_any();

    let Some(mut irsa) = ctx.cluster.get_irsa(&namespace, &name).await? else {
        debug!("irsa is gone, deletion was finalizer-driven");
        return Ok(Action::await_change());
    };

    if irsa.metadata.deletion_timestamp.is_none() {
        // One mutation per reconcile: adding the finalizer ends this pass.
        if finalize(&ctx, &mut irsa, false).await? {
            debug!("added finalizer");
            return Ok(Action::await_change());
        }
        step(&ctx, &mut irsa).await
    } else {
        finalize(&ctx, &mut irsa, true).await?;
        info!("deleted irsa");
        Ok(Action::await_change())
    }
}

/// The controller triggers this on reconcile errors
pub fn error_policy(
    irsa: Arc<IamRoleServiceAccount>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(%error, irsa = %irsa.name_any(), "reconcile failed");
    Action::requeue(REQUEUE_PERIOD)
}

/// Handles the finalizer protocol. Returns true when it performed a mutation.
///
/// The finalizer is added before any cloud-side mutation and removed only
/// after cleanup succeeded, so the cloud role can never be orphaned by a
/// deletion racing the first provisioning pass.
async fn finalize(ctx: &Context, irsa: &mut IamRoleServiceAccount, deleted: bool) -> Result<bool> {
    let finalizers = irsa.metadata.finalizers.clone().unwrap_or_default();

    if deleted && slices::contains(&finalizers, FINALIZER) {
        info!("cleaning up service account and iam role");
        delete_service_account(ctx, irsa).await?;
        delete_external_resources(ctx, irsa).await?;
        irsa.metadata.finalizers =
            Some(slices::remove(&finalizers, FINALIZER)).filter(|rest| !rest.is_empty());
        ctx.cluster.update_irsa(irsa).await?;
        return Ok(true);
    }

    if !deleted && !slices::contains(&finalizers, FINALIZER) {
        let mut finalizers = finalizers;
        finalizers.push(FINALIZER.to_string());
        irsa.metadata.finalizers = Some(finalizers);
        ctx.cluster.update_irsa(irsa).await?;
        return Ok(true);
    }

    Ok(false)
}

/// Steps the condition state machine by one transition
async fn step(ctx: &Context, irsa: &mut IamRoleServiceAccount) -> Result<Action> {
    match irsa.condition() {
        IrsaCondition::Submitted => {
            info!("irsa submitted, beginning reconciliation");
            update_status(ctx, irsa, IrsaCondition::Pending, None).await?;
            Ok(Action::await_change())
        }
        IrsaCondition::Pending | IrsaCondition::Conflict | IrsaCondition::Forbidden => {
            precheck(ctx, irsa).await
        }
        IrsaCondition::Progressing => provision(ctx, irsa).await,
        IrsaCondition::Synced | IrsaCondition::Failed => sync(ctx, irsa).await,
    }
}

/// Precheck phase: detect ownership conflicts before provisioning anything.
///
/// The service account is reconciled in dry-run mode so conflicts surface
/// without mutating cluster state.
async fn precheck(ctx: &Context, irsa: &mut IamRoleServiceAccount) -> Result<Action> {
    debug!("checking cluster and cloud state before provisioning");

    if let Err(err) = reconcile_service_account(ctx, irsa, true).await {
        return match err {
            Error::ServiceAccountConflict => {
                update_status(ctx, irsa, IrsaCondition::Conflict, Some(&err)).await?;
                Ok(Action::await_change())
            }
            other => {
                update_status(ctx, irsa, IrsaCondition::Forbidden, Some(&other)).await?;
                Err(other)
            }
        };
    }

    match check_external_resources(ctx, irsa).await {
        Ok(()) => {
            update_status(ctx, irsa, IrsaCondition::Progressing, None).await?;
            Ok(Action::await_change())
        }
        Err(err @ Error::IamRoleConflict) => {
            update_status(ctx, irsa, IrsaCondition::Conflict, Some(&err)).await?;
            Ok(Action::await_change())
        }
        Err(err) => {
            update_status(ctx, irsa, IrsaCondition::Forbidden, Some(&err)).await?;
            Err(err)
        }
    }
}

/// Progressing phase: provision the cloud role
async fn provision(ctx: &Context, irsa: &mut IamRoleServiceAccount) -> Result<Action> {
    info!("creating iam role in cloud account");
    match create_external_resources(ctx, irsa).await {
        Ok(()) => {
            update_status(ctx, irsa, IrsaCondition::Synced, None).await?;
            Ok(Action::await_change())
        }
        Err(err) => {
            update_status(ctx, irsa, IrsaCondition::Failed, Some(&err)).await?;
            if err.is_conflict() {
                Ok(Action::await_change())
            } else {
                Err(err)
            }
        }
    }
}

/// Steady-state phase: self-heal drift in the role and the service account
async fn sync(ctx: &Context, irsa: &mut IamRoleServiceAccount) -> Result<Action> {
    if irsa.role_arn().is_empty() {
        info!("role arn missing, provisioning again");
        if let Err(err) = create_external_resources(ctx, irsa).await {
            update_status(ctx, irsa, IrsaCondition::Failed, Some(&err)).await?;
            return if err.is_conflict() {
                Ok(Action::await_change())
            } else {
                Err(err)
            };
        }
    } else if let Err(err) = update_external_resources(ctx, irsa).await {
        update_status(ctx, irsa, IrsaCondition::Failed, Some(&err)).await?;
        return Err(err);
    }

    match reconcile_service_account(ctx, irsa, false).await {
        Ok(()) => {}
        Err(err @ Error::ServiceAccountConflict) => {
            update_status(ctx, irsa, IrsaCondition::Conflict, Some(&err)).await?;
            return Ok(Action::await_change());
        }
        Err(err) => return Err(err),
    }

    update_status(ctx, irsa, IrsaCondition::Synced, None).await?;
    Ok(Action::await_change())
}

/// Classifies the pre-provisioning state of the cloud role.
///
/// Absence is fine (the create path will make it), an operator-owned role is
/// fine (idempotent re-entry), and a foreign role is only acceptable when the
/// spec explicitly opted into externally-referenced mode.
async fn check_external_resources(ctx: &Context, irsa: &IamRoleServiceAccount) -> Result<()> {
    let role_name = ctx.iam.role_name(irsa);
    match ctx.iam.get(&role_name).await {
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
        Ok(role) if role.is_managed_by_irsa_controller() => Ok(()),
        Ok(_) if irsa.external_role_name().is_some() => Ok(()),
        Ok(_) => Err(Error::IamRoleConflict),
    }
}

/// Create path: provision the role and record its ARN in the status.
///
/// For externally-referenced roles nothing is created or tagged; the role is
/// read and, if needed, its trust policy gains the binding for this service
/// account. For self-managed roles a name collision is adopted when the
/// existing role carries the ownership tag, and rejected otherwise.
async fn create_external_resources(ctx: &Context, irsa: &mut IamRoleServiceAccount) -> Result<()> {
    let namespace = irsa.namespace().unwrap_or_default();
    let name = irsa.name_any();

    if let Some(external) = irsa.external_role_name().map(str::to_string) {
        let role = ctx.iam.get(&external).await?;
        set_role_arn(irsa, role.role_arn.clone());
        if !trust_allows(&role, ctx, &namespace, &name) {
            ctx.iam
                .allow_service_account_access(&role, &ctx.oidc_provider_arn, &namespace, &name)
                .await?;
        }
        return Ok(());
    }

    match ctx.iam.create(&ctx.oidc_provider_arn, irsa).await {
        Ok(role_arn) => {
            // The create call wrote the full desired state including the
            // trust policy, so only the ARN remains to be recorded.
            info!(arn = %role_arn, "created iam role");
            set_role_arn(irsa, role_arn);
            Ok(())
        }
        Err(err) if err.is_already_exists() => {
            let role_name = ctx.iam.role_name(irsa);
            let role = ctx.iam.get(&role_name).await?;
            if !role.is_managed_by_irsa_controller() {
                return Err(Error::IamRoleConflict);
            }
            info!(role = %role_name, "adopted existing operator-owned role");
            set_role_arn(irsa, role.role_arn.clone());
            if !trust_allows(&role, ctx, &namespace, &name) {
                ctx.iam
                    .allow_service_account_access(&role, &ctx.oidc_provider_arn, &namespace, &name)
                    .await?;
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Three-way diff between declared policy, observed cloud state and the
/// recorded ARN; executes the resulting mutations in order
async fn update_external_resources(ctx: &Context, irsa: &IamRoleServiceAccount) -> Result<()> {
    if irsa.external_role_name().is_some() {
        return update_external_iam_role(ctx, irsa).await;
    }

    let role_arn = irsa.role_arn();
    if role_arn.is_empty() {
        return Err(Error::RoleNotCreated);
    }
    let role_name = role_name_by_arn(role_arn);

    let observed = ctx.iam.get(role_name).await?;
    let desired = IamRole::desired(&ctx.oidc_provider_arn, irsa, &ctx.additional_tags);

    for update in diff(&observed, &desired) {
        debug!(role = %role_name, ?update, "healing drift");
        match update {
            RoleUpdate::AttachManagedPolicies(arns) => {
                ctx.iam.attach_role_policy(role_name, &arns).await?
            }
            RoleUpdate::DetachManagedPolicies(arns) => {
                ctx.iam.detach_role_policy(role_name, &arns).await?
            }
            RoleUpdate::PutInlinePolicy(document) => {
                ctx.iam.update_inline_policy(role_name, &document).await?
            }
            RoleUpdate::DeleteInlinePolicy => ctx.iam.delete_inline_policy(role_name).await?,
            RoleUpdate::ReplaceAssumeRolePolicy(document) => {
                ctx.iam.update_assume_policy(role_name, &document).await?
            }
            RoleUpdate::ReplaceTags(tags) => ctx.iam.update_tags(role_name, &tags).await?,
        }
    }

    Ok(())
}

/// Externally-referenced roles are never mutated beyond ensuring the trust
/// policy carries the binding for this service account
async fn update_external_iam_role(ctx: &Context, irsa: &IamRoleServiceAccount) -> Result<()> {
    let Some(external) = irsa.external_role_name() else {
        return Ok(());
    };
    let namespace = irsa.namespace().unwrap_or_default();
    let name = irsa.name_any();

    let role = ctx.iam.get(external).await?;
    if !trust_allows(&role, ctx, &namespace, &name) {
        ctx.iam
            .allow_service_account_access(&role, &ctx.oidc_provider_arn, &namespace, &name)
            .await?;
    }
    Ok(())
}

/// Reconciles the service account named after the IRSA.
///
/// With `dry_run` set (precheck) conflict detection runs without mutating
/// cluster state. The annotation is only written once the role ARN is known
/// and the IRSA is Synced, so a half-provisioned role never leaks a stale
/// ARN into workloads.
async fn reconcile_service_account(
    ctx: &Context,
    irsa: &IamRoleServiceAccount,
    dry_run: bool,
) -> Result<()> {
    let namespace = irsa
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = irsa.name_any();

    match ctx.cluster.get_service_account(&namespace, &name).await? {
        None => {
            let sa = new_service_account(irsa)?;
            debug!(%namespace, %name, dry_run, "creating service account");
            ctx.cluster.create_service_account(&sa, dry_run).await
        }
        Some(mut sa) => {
            if !owned_by_irsa(&sa, irsa) {
                return Err(Error::ServiceAccountConflict);
            }
            if irsa.role_arn().is_empty() || irsa.condition() != IrsaCondition::Synced {
                return Ok(());
            }
            let annotations = sa.metadata.annotations.get_or_insert_with(BTreeMap::new);
            if annotations.get(ROLE_ARN_ANNOTATION).map(String::as_str) == Some(irsa.role_arn()) {
                return Ok(());
            }
            annotations.insert(ROLE_ARN_ANNOTATION.to_string(), irsa.role_arn().to_string());
            debug!(%namespace, %name, dry_run, "updating service account annotation");
            ctx.cluster.update_service_account(&sa, dry_run).await
        }
    }
}

/// Deletes the service account if this IRSA owns it; foreign service accounts
/// are left alone
async fn delete_service_account(ctx: &Context, irsa: &IamRoleServiceAccount) -> Result<()> {
    let namespace = irsa
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = irsa.name_any();

    match ctx.cluster.get_service_account(&namespace, &name).await? {
        None => Ok(()),
        Some(sa) if !owned_by_irsa(&sa, irsa) => {
            debug!(%namespace, %name, "service account not owned by irsa, leaving it");
            Ok(())
        }
        Some(_) => ctx.cluster.delete_service_account(&namespace, &name).await,
    }
}

/// Deletes the cloud role when the operator owns a cleanup obligation:
/// externally-referenced and never-provisioned roles are skipped
async fn delete_external_resources(ctx: &Context, irsa: &IamRoleServiceAccount) -> Result<()> {
    if irsa.external_role_name().is_some() {
        debug!("role name is declared in spec, user keeps the role");
        return Ok(());
    }
    let role_arn = irsa.role_arn();
    if role_arn.is_empty() {
        debug!("role was never provisioned, nothing to delete");
        return Ok(());
    }
    match ctx.iam.delete(role_arn).await {
        Err(err) if err.is_not_found() => Ok(()),
        result => result,
    }
}

/// Writes the status subresource, suppressing no-op writes.
///
/// Comparing `(condition, reason)` against the observed status keeps repeated
/// reconciles of an unchanged object from generating watch storms.
async fn update_status(
    ctx: &Context,
    irsa: &mut IamRoleServiceAccount,
    condition: IrsaCondition,
    error: Option<&Error>,
) -> Result<bool> {
    let reason = error.map(ToString::to_string).unwrap_or_default();
    let current = irsa.status.clone().unwrap_or_default();
    if current.condition == condition && current.reason == reason {
        return Ok(false);
    }
    let from = current.condition;

    let status = irsa.status.get_or_insert_with(Default::default);
    status.condition = condition;
    status.reason = reason;

    if let Err(err) = ctx.cluster.update_irsa_status(irsa).await {
        warn!(%from, to = %condition, %err, "status update failed");
        return Err(err);
    }
    debug!(%from, to = %condition, "updated status");
    Ok(true)
}

fn set_role_arn(irsa: &mut IamRoleServiceAccount, role_arn: String) {
    irsa.status.get_or_insert_with(Default::default).role_arn = role_arn;
}

fn trust_allows(role: &IamRole, ctx: &Context, namespace: &str, name: &str) -> bool {
    role.assume_role_policy
        .as_ref()
        .map(|document| document.is_allow_oidc(&ctx.oidc_provider_arn, namespace, name))
        .unwrap_or(false)
}

/// Builds a fresh service account owned by the IRSA, annotation included
/// (possibly still empty before provisioning)
fn new_service_account(irsa: &IamRoleServiceAccount) -> Result<ServiceAccount> {
    let owner = irsa
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    Ok(ServiceAccount {
        metadata: ObjectMeta {
            name: irsa.metadata.name.clone(),
            namespace: irsa.metadata.namespace.clone(),
            annotations: Some(BTreeMap::from([(
                ROLE_ARN_ANNOTATION.to_string(),
                irsa.role_arn().to_string(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        ..Default::default()
    })
}

fn owned_by_irsa(sa: &ServiceAccount, irsa: &IamRoleServiceAccount) -> bool {
    let Some(uid) = irsa.metadata.uid.as_deref() else {
        return false;
    };
    sa.metadata
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|reference| reference.uid == uid)
}
