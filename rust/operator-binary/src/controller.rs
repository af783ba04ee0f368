//! Ensures that the objects, policies and users of each [`RabbitmqCluster`] match its spec.

use std::{sync::Arc, time::Duration};

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::{
        api::{
            apps::v1::StatefulSet,
            core::v1::{ConfigMap, Secret, Service},
            policy::v1::PodDisruptionBudget,
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    },
    kube::{
        self,
        runtime::{
            controller::Action,
            finalizer::{self, finalizer, Event},
        },
        Api, ResourceExt,
    },
    kvp::{LabelError, Labels, ObjectLabels},
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    config_map::{self, build_config_map},
    converge::{self, converge},
    crd::{self, service_monitor::ServiceMonitor, RabbitmqCluster, APP_NAME, OPERATOR_NAME},
    finalizer::{self as pvc_finalizer, delete_dependent_pvcs, PVC_FINALIZER},
    management_api::{self, BasicAuthCredentials, ManagementClient},
    pdb::{self, build_pdb},
    policy::{self, sync_policies},
    readiness::{self, wait_for_endpoint},
    secret::{
        self, read_user_credentials, resolve_or_create_credentials_secret,
        resolve_or_create_service_account,
    },
    service::{
        self, build_discovery_service, build_management_service, build_prometheus_service,
        build_service_monitor,
    },
    statefulset::{self, build_statefulset},
    user::{self, sync_users},
};

pub const RABBITMQ_CONTROLLER_NAME: &str = "rabbitmqcluster";
pub const ROLE_NAME: &str = "server";
pub const ROLE_GROUP_NAME: &str = "default";

/// Remote policies and users are not watched, so clusters are revisited periodically.
const RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How the operator talks to the management API of the clusters it manages.
#[derive(Clone, Debug)]
pub struct ManagementApiConfig {
    /// Upper bound for the management endpoint to accept TCP connections.
    pub wait_timeout: Duration,
    pub retry_interval: Duration,
    /// Deadline for the policy and user synchronization together.
    pub sync_timeout: Duration,
    /// Tags given to managed users unless the cluster specifies its own.
    pub user_tags: String,
}

pub struct Ctx {
    pub client: kube::Client,
    pub http: reqwest::Client,
    pub management: ManagementApiConfig,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("invalid RabbitmqCluster"))]
    InvalidRabbitmqCluster { source: crd::Error },

    #[snafu(display("failed to get RabbitmqCluster {name}"))]
    GetRabbitmqCluster { source: kube::Error, name: String },

    #[snafu(display("failed to resolve service account Secret"))]
    ResolveServiceAccount { source: secret::Error },

    #[snafu(display("failed to resolve credentials Secret"))]
    ResolveCredentials { source: secret::Error },

    #[snafu(display("failed to read user credentials"))]
    ReadUserCredentials { source: secret::Error },

    #[snafu(display("failed to build StatefulSet"))]
    BuildStatefulSet { source: statefulset::Error },

    #[snafu(display("failed to apply StatefulSet"))]
    ApplyStatefulSet { source: converge::Error },

    #[snafu(display("failed to build Service"))]
    BuildService { source: service::Error },

    #[snafu(display("failed to apply Service"))]
    ApplyService { source: converge::Error },

    #[snafu(display("failed to build ConfigMap"))]
    BuildConfigMap { source: config_map::Error },

    #[snafu(display("failed to apply ConfigMap"))]
    ApplyConfigMap { source: converge::Error },

    #[snafu(display("failed to apply ServiceMonitor"))]
    ApplyServiceMonitor { source: converge::Error },

    #[snafu(display("failed to build PodDisruptionBudget"))]
    BuildPdb { source: pdb::Error },

    #[snafu(display("failed to apply PodDisruptionBudget"))]
    ApplyPdb { source: converge::Error },

    #[snafu(display("failed to build management API client"))]
    BuildManagementClient { source: management_api::Error },

    #[snafu(display("management API is not reachable"))]
    WaitForManagementApi { source: readiness::Error },

    #[snafu(display("failed to synchronize policies"))]
    SyncPolicies { source: policy::Error },

    #[snafu(display("failed to synchronize users"))]
    SyncUsers { source: user::Error },

    #[snafu(display("synchronization of policies and users did not finish within {timeout:?}"))]
    SyncTimedOut {
        source: tokio::time::error::Elapsed,
        timeout: Duration,
    },

    #[snafu(display("failed to delete PersistentVolumeClaims"))]
    DeletePvcs { source: pvc_finalizer::Error },

    #[snafu(display("failed to run finalizer"))]
    Finalizer {
        source: Box<finalizer::Error<Error>>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_rabbitmq(rabbitmq: Arc<RabbitmqCluster>, ctx: Arc<Ctx>) -> Result<Action> {
    tracing::info!("Starting reconcile");
    let namespace = rabbitmq
        .namespace_or_error()
        .context(InvalidRabbitmqClusterSnafu)?;
    let name = rabbitmq.name_any();
    let api: Api<RabbitmqCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    // The cached object may be stale, the pass works on the current one.
    let Some(rabbitmq) = api
        .get_opt(&name)
        .await
        .context(GetRabbitmqClusterSnafu { name: &name })?
    else {
        tracing::info!(rabbitmq.name = %name, "RabbitmqCluster no longer exists");
        return Ok(Action::await_change());
    };

    let ctx = &*ctx;
    let namespace = namespace.as_str();
    finalizer(&api, PVC_FINALIZER, Arc::new(rabbitmq), |event| async move {
        match event {
            Event::Apply(rabbitmq) => apply(&rabbitmq, namespace, ctx).await,
            Event::Cleanup(rabbitmq) => cleanup(&rabbitmq, namespace, ctx).await,
        }
    })
    .await
    .map_err(|source| Error::Finalizer {
        source: Box::new(source),
    })
}

async fn apply(rabbitmq: &RabbitmqCluster, namespace: &str, ctx: &Ctx) -> Result<Action> {
    rabbitmq.validate().context(InvalidRabbitmqClusterSnafu)?;
    let client = &ctx.client;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let (service_account_secret, service_account) =
        resolve_or_create_service_account(&secrets, rabbitmq)
            .await
            .context(ResolveServiceAccountSnafu)?;
    let credentials_secret = resolve_or_create_credentials_secret(&secrets, rabbitmq)
        .await
        .context(ResolveCredentialsSnafu)?;
    let declared_users =
        read_user_credentials(&credentials_secret).context(ReadUserCredentialsSnafu)?;

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let statefulset =
        build_statefulset(rabbitmq, &service_account_secret).context(BuildStatefulSetSnafu)?;
    converge(&statefulsets, &statefulset)
        .await
        .context(ApplyStatefulSetSnafu)?;

    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    for service in [
        build_discovery_service(rabbitmq).context(BuildServiceSnafu)?,
        build_management_service(rabbitmq).context(BuildServiceSnafu)?,
    ] {
        converge(&services, &service)
            .await
            .context(ApplyServiceSnafu)?;
    }

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let config_map =
        build_config_map(rabbitmq, &service_account).context(BuildConfigMapSnafu)?;
    converge(&config_maps, &config_map)
        .await
        .context(ApplyConfigMapSnafu)?;

    if rabbitmq.prometheus_exporter_enabled() {
        let prometheus_service =
            build_prometheus_service(rabbitmq).context(BuildServiceSnafu)?;
        converge(&services, &prometheus_service)
            .await
            .context(ApplyServiceSnafu)?;

        if rabbitmq.spec.use_service_monitor {
            let service_monitors: Api<ServiceMonitor> =
                Api::namespaced(client.clone(), namespace);
            let service_monitor = build_service_monitor(rabbitmq).context(BuildServiceSnafu)?;
            converge(&service_monitors, &service_monitor)
                .await
                .context(ApplyServiceMonitorSnafu)?;
        }
    }

    let management = ManagementClient::for_service(
        ctx.http.clone(),
        &rabbitmq.management_service_name(),
        namespace,
        BasicAuthCredentials {
            username: service_account.username.clone(),
            password: service_account.password.clone(),
        },
    )
    .context(BuildManagementClientSnafu)?;
    let endpoint = management.endpoint().context(BuildManagementClientSnafu)?;
    wait_for_endpoint(
        &endpoint,
        ctx.management.wait_timeout,
        ctx.management.retry_interval,
    )
    .await
    .context(WaitForManagementApiSnafu)?;

    let user_tags = rabbitmq
        .spec
        .management_user_tags
        .as_deref()
        .filter(|tags| !tags.is_empty())
        .unwrap_or(&ctx.management.user_tags);
    let sync = async {
        let policies = sync_policies(
            &management,
            rabbitmq.default_vhost(),
            &rabbitmq.spec.policies,
        )
        .await
        .context(SyncPoliciesSnafu)?;
        let users = sync_users(
            &management,
            &service_account.username,
            &declared_users,
            user_tags,
        )
        .await
        .context(SyncUsersSnafu)?;
        Ok::<_, Error>((policies, users))
    };
    let timeout = ctx.management.sync_timeout;
    let (policy_report, user_report) = tokio::time::timeout(timeout, sync)
        .await
        .context(SyncTimedOutSnafu { timeout })??;
    tracing::info!(
        policies.deleted = policy_report.deleted.len(),
        policies.applied = policy_report.applied.len(),
        users.deleted = user_report.deleted.len(),
        users.applied = user_report.applied.len(),
        "synchronized management API"
    );

    let pdbs: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), namespace);
    let pdb = build_pdb(rabbitmq).context(BuildPdbSnafu)?;
    converge(&pdbs, &pdb).await.context(ApplyPdbSnafu)?;

    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn cleanup(rabbitmq: &RabbitmqCluster, namespace: &str, ctx: &Ctx) -> Result<Action> {
    if rabbitmq.spec.purge_pvc_on_delete {
        let deleted = delete_dependent_pvcs(&ctx.client, namespace, rabbitmq)
            .await
            .context(DeletePvcsSnafu)?;
        tracing::info!(pvcs = ?deleted, "purged PersistentVolumeClaims");
    } else {
        tracing::info!("keeping PersistentVolumeClaims");
    }
    Ok(Action::await_change())
}

pub fn error_policy(_obj: Arc<RabbitmqCluster>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    tracing::warn!(category = error.category(), "reconcile failed, retrying");
    Action::requeue(Duration::from_secs(5))
}

pub fn build_recommended_labels(rabbitmq: &RabbitmqCluster) -> ObjectLabels<'_, RabbitmqCluster> {
    ObjectLabels {
        owner: rabbitmq,
        app_name: APP_NAME,
        app_version: &rabbitmq.spec.image.tag,
        operator_name: OPERATOR_NAME,
        controller_name: RABBITMQ_CONTROLLER_NAME,
        role: ROLE_NAME,
        role_group: ROLE_GROUP_NAME,
    }
}

/// Labels identifying the pods of a cluster.
pub fn selector_labels(rabbitmq: &RabbitmqCluster) -> Result<Labels, LabelError> {
    Labels::role_group_selector(rabbitmq, APP_NAME, ROLE_NAME, ROLE_GROUP_NAME)
}

/// Metadata for an object owned by `rabbitmq`.
pub fn build_object_meta(
    rabbitmq: &RabbitmqCluster,
    name: &str,
) -> Result<ObjectMeta, stackable_operator::builder::meta::Error> {
    Ok(ObjectMetaBuilder::new()
        .name_and_namespace(rabbitmq)
        .name(name)
        .ownerreference_from_resource(rabbitmq, None, Some(true))?
        .with_recommended_labels(build_recommended_labels(rabbitmq))?
        .build())
}
