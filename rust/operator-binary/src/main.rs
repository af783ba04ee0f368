use std::sync::Arc;

use clap::{crate_description, crate_version, Parser};
use futures::StreamExt;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    cli::Command,
    client::{self, Client},
    k8s_openapi::api::{
        apps::v1::StatefulSet,
        core::v1::{ConfigMap, Secret, Service},
        policy::v1::PodDisruptionBudget,
    },
    kube::{
        runtime::{
            events::{Recorder, Reporter},
            watcher, Controller,
        },
        Api, CustomResourceExt,
    },
    logging::controller::report_controller_reconciled,
    namespace::WatchNamespace,
    shared::yaml::SerializeOptions,
    time::Duration,
    YamlSchema,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    controller::{ManagementApiConfig, RABBITMQ_CONTROLLER_NAME},
    crd::{RabbitmqCluster, OPERATOR_NAME},
};

mod config_map;
mod controller;
mod converge;
mod crd;
mod finalizer;
mod management_api;
mod pdb;
mod policy;
mod quantity;
mod readiness;
mod secret;
mod service;
mod statefulset;
#[cfg(test)]
mod test_utils;
mod user;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET_PLATFORM: Option<&str> = option_env!("TARGET");
    pub const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
}

const LOG_ENV: &str = "RABBITMQ_OPERATOR_LOG";

#[derive(Snafu, Debug)]
enum StartupError {
    #[snafu(display("failed to print CustomResourceDefinition"))]
    PrintCrd {
        source: stackable_operator::shared::yaml::Error,
    },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateKubeClient { source: client::Error },

    #[snafu(display("failed to create HTTP client"))]
    CreateHttpClient { source: reqwest::Error },
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<RabbitmqRun>,
}

#[derive(clap::Parser)]
struct RabbitmqRun {
    /// Namespace to watch for RabbitmqClusters, all namespaces when empty.
    #[clap(long, env, default_value = "")]
    watch_namespace: WatchNamespace,

    /// How long to wait for the management API of a cluster to accept connections.
    #[clap(long, env, default_value = "30s")]
    management_api_wait_timeout: Duration,

    /// Pause between connection attempts to the management API.
    #[clap(long, env, default_value = "500ms")]
    management_api_retry_interval: Duration,

    /// Deadline for synchronizing the policies and users of a cluster.
    #[clap(long, env, default_value = "60s")]
    management_api_sync_timeout: Duration,

    /// Tags of the users managed through the credentials Secret, unless a cluster overrides them.
    #[clap(long, env, default_value = "administrator")]
    management_user_tags: String,
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            RabbitmqCluster::crd()
                .print_yaml_schema(built_info::CARGO_PKG_VERSION, SerializeOptions::default())
                .context(PrintCrdSnafu)?;
        }
        Command::Run(RabbitmqRun {
            watch_namespace,
            management_api_wait_timeout,
            management_api_retry_interval,
            management_api_sync_timeout,
            management_user_tags,
        }) => {
            tracing_subscriber::registry()
                .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")))
                .with(fmt::layer())
                .init();

            tracing::info!(
                version = crate_version!(),
                git = built_info::GIT_VERSION,
                target = built_info::TARGET_PLATFORM.unwrap_or("unknown target"),
                built = built_info::BUILT_TIME_UTC,
                rustc = built_info::RUSTC_VERSION,
                "Starting {}",
                crate_description!(),
            );

            let client = client::create_client(Some(OPERATOR_NAME.to_string()))
                .await
                .context(CreateKubeClientSnafu)?;
            let http = reqwest::Client::builder()
                .build()
                .context(CreateHttpClientSnafu)?;
            let management = ManagementApiConfig {
                wait_timeout: *management_api_wait_timeout,
                retry_interval: *management_api_retry_interval,
                sync_timeout: *management_api_sync_timeout,
                user_tags: management_user_tags,
            };

            create_controller(client, http, management, watch_namespace).await;
        }
    };

    Ok(())
}

/// Runs the [`Controller`] for [`RabbitmqCluster`]s until the watch streams end.
async fn create_controller(
    client: Client,
    http: reqwest::Client,
    management: ManagementApiConfig,
    watch_namespace: WatchNamespace,
) {
    let rabbitmq_api: Api<RabbitmqCluster> = watch_namespace.get_api(&client);
    let statefulsets_api: Api<StatefulSet> = watch_namespace.get_api(&client);
    let services_api: Api<Service> = watch_namespace.get_api(&client);
    let configmaps_api: Api<ConfigMap> = watch_namespace.get_api(&client);
    let secrets_api: Api<Secret> = watch_namespace.get_api(&client);
    let pdbs_api: Api<PodDisruptionBudget> = watch_namespace.get_api(&client);

    let full_controller_name = format!("{RABBITMQ_CONTROLLER_NAME}.{OPERATOR_NAME}");
    let event_recorder = Arc::new(Recorder::new(
        client.as_kube_client(),
        Reporter {
            controller: full_controller_name.clone(),
            instance: None,
        },
    ));

    Controller::new(rabbitmq_api, watcher::Config::default())
        .owns(statefulsets_api, watcher::Config::default())
        .owns(services_api, watcher::Config::default())
        .owns(configmaps_api, watcher::Config::default())
        .owns(secrets_api, watcher::Config::default())
        .owns(pdbs_api, watcher::Config::default())
        .run(
            controller::reconcile_rabbitmq,
            controller::error_policy,
            Arc::new(controller::Ctx {
                client: client.as_kube_client(),
                http,
                management,
            }),
        )
        // Events of one object are aggregated through the shared recorder.
        .for_each_concurrent(16, |result| {
            let event_recorder = event_recorder.clone();
            let full_controller_name = &full_controller_name;
            async move {
                report_controller_reconciled(&event_recorder, full_controller_name, &result).await;
            }
        })
        .await;
}
