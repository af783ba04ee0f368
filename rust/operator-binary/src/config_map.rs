//! Renders the RabbitMQ configuration files mounted into every node.

use std::collections::BTreeMap;

use indoc::indoc;
use snafu::{ResultExt, Snafu};
use stackable_operator::{k8s_openapi::api::core::v1::ConfigMap, kube::ResourceExt};

use crate::{
    controller::build_object_meta,
    crd::{RabbitmqCluster, AMQPS_PORT},
    quantity,
    secret::ServiceAccountCredentials,
};

pub const RABBITMQ_CONF: &str = "rabbitmq.conf";
pub const ENABLED_PLUGINS: &str = "enabled_plugins";
pub const ERLANG_COOKIE: &str = ".erlang.cookie";
pub const INIT_SCRIPT: &str = "init.sh";

/// Where the SSL secret is mounted in the RabbitMQ container.
pub const SSL_DIR: &str = "/etc/rabbitmq/ssl";

const BASELINE_PLUGINS: &[&str] = &[
    "rabbitmq_consistent_hash_exchange",
    "rabbitmq_federation",
    "rabbitmq_federation_management",
    "rabbitmq_management",
    "rabbitmq_peer_discovery_k8s",
    "rabbitmq_shovel",
    "rabbitmq_shovel_management",
];

const INIT_SH: &str = indoc! {r#"
    #!/bin/sh
    set -e
    rm -f /var/lib/rabbitmq/.erlang.cookie
    cp /rabbit-config/rabbitmq.conf /rabbit-config/enabled_plugins /etc/rabbitmq/
    cp /rabbit-config/.erlang.cookie /etc/rabbitmq/.erlang.cookie
    chmod 600 /etc/rabbitmq/.erlang.cookie
"#};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to build ConfigMap metadata"))]
    ObjectMeta {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to parse the memory limit"))]
    ParseMemoryLimit { source: quantity::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

pub fn build_config_map(
    rabbitmq: &RabbitmqCluster,
    service_account: &ServiceAccountCredentials,
) -> Result<ConfigMap> {
    let data = BTreeMap::from([
        (
            RABBITMQ_CONF.to_string(),
            render_rabbitmq_conf(rabbitmq, service_account)?,
        ),
        (
            ENABLED_PLUGINS.to_string(),
            render_enabled_plugins(&rabbitmq.spec.plugins),
        ),
        (ERLANG_COOKIE.to_string(), service_account.cookie.clone()),
        (INIT_SCRIPT.to_string(), INIT_SH.to_string()),
    ]);

    Ok(ConfigMap {
        metadata: build_object_meta(rabbitmq, &rabbitmq.name_any()).context(ObjectMetaSnafu)?,
        data: Some(data),
        ..ConfigMap::default()
    })
}

pub fn render_rabbitmq_conf(
    rabbitmq: &RabbitmqCluster,
    service_account: &ServiceAccountCredentials,
) -> Result<String> {
    let spec = &rabbitmq.spec;
    let formation = &spec.cluster_formation;

    let mut lines = vec![
        format!("default_user = {}", service_account.username),
        format!("default_pass = {}", service_account.password),
        format!("default_vhost = {}", rabbitmq.default_vhost()),
        format!(
            "cluster_formation.peer_discovery_backend = {}",
            non_empty_or(
                &formation.peer_discovery_backend,
                "rabbit_peer_discovery_k8s"
            )
        ),
        format!(
            "cluster_formation.k8s.host = {}",
            non_empty_or(&formation.k8s_host, "kubernetes.default.svc.cluster.local")
        ),
        format!(
            "cluster_formation.k8s.address_type = {}",
            non_empty_or(&formation.address_type, "hostname")
        ),
        format!(
            "cluster_formation.k8s.service_name = {}",
            rabbitmq.discovery_service_name()
        ),
        format!(
            "cluster_formation.node_cleanup.interval = {}",
            formation.node_cleanup_interval.unwrap_or(10)
        ),
        "cluster_formation.node_cleanup.only_log_warning = true".to_string(),
        format!(
            "cluster_partition_handling = {}",
            non_empty_or(&formation.partition_handling, "autoheal")
        ),
        "loopback_users.guest = false".to_string(),
        format!("hipe_compile = {}", spec.hipe_compile),
        format!(
            "vm_memory_high_watermark_paging_ratio = {}",
            non_empty_or(&spec.memory_high_watermark_paging_ratio, "0.8")
        ),
    ];

    if let Some(watermark) = memory_high_watermark(rabbitmq)? {
        lines.push(format!("vm_memory_high_watermark.absolute = {watermark}"));
    }

    if spec.ssl.enabled {
        lines.push(format!("listeners.ssl.default = {AMQPS_PORT}"));
        let files = [
            ("cacertfile", &spec.ssl.ca_cert_file, "ca.crt"),
            ("certfile", &spec.ssl.cert_file, "tls.crt"),
            ("keyfile", &spec.ssl.key_file, "tls.key"),
        ];
        for (option, file, default) in files {
            lines.push(format!(
                "ssl_options.{option} = {SSL_DIR}/{}",
                non_empty_or(file, default)
            ));
        }
        lines.push("ssl_options.verify = verify_peer".to_string());
        lines.push("ssl_options.fail_if_no_peer_cert = false".to_string());
    }

    if spec.auth.enabled {
        for (i, mechanism) in spec.auth.mechanisms.iter().enumerate() {
            lines.push(format!("auth_mechanisms.{} = {mechanism}", i + 1));
        }
    }

    let mut conf = lines.join("\n");
    conf.push('\n');
    Ok(conf)
}

/// Renders an Erlang list of the baseline plugins followed by the requested ones, without
/// duplicates.
pub fn render_enabled_plugins(plugins: &[String]) -> String {
    let mut enabled: Vec<&str> = Vec::with_capacity(BASELINE_PLUGINS.len() + plugins.len());
    for plugin in BASELINE_PLUGINS
        .iter()
        .copied()
        .chain(plugins.iter().map(|p| p.trim()))
    {
        if !plugin.is_empty() && !enabled.contains(&plugin) {
            enabled.push(plugin);
        }
    }
    format!("[{}].\n", enabled.join(","))
}

/// The explicit watermark if set, otherwise half of the memory limit. `None` when neither is
/// known, leaving RabbitMQ's relative default in place.
pub fn memory_high_watermark(rabbitmq: &RabbitmqCluster) -> Result<Option<String>> {
    if let Some(watermark) = rabbitmq
        .spec
        .memory_high_watermark
        .as_deref()
        .filter(|w| !w.is_empty())
    {
        return Ok(Some(watermark.to_string()));
    }
    match rabbitmq.spec.pod_limits.get("memory") {
        Some(limit) => {
            let bytes = quantity::parse_quantity(limit)
                .context(ParseMemoryLimitSnafu)?
                .ceil_units();
            Ok(Some((bytes / 2).to_string()))
        }
        None => Ok(None),
    }
}

fn non_empty_or<'a>(value: &'a Option<String>, default: &'a str) -> &'a str {
    match value.as_deref() {
        Some(value) if !value.is_empty() => value,
        _ => default,
    }
}
