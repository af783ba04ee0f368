use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{Affinity, EnvVar, Toleration},
        apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString},
    },
    kube::{CustomResource, ResourceExt},
    schemars::{self, JsonSchema},
};

pub mod service_monitor;

pub const APP_NAME: &str = "rabbitmq";
pub const OPERATOR_NAME: &str = "rabbitmq.stackable.tech";

/// The vhost RabbitMQ creates on boot when nothing else is configured.
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_APPLY_TO: &str = "all";

pub const AMQP_PORT: u16 = 5672;
pub const AMQP_PORT_NAME: &str = "amqp";
pub const AMQPS_PORT: u16 = 5671;
pub const EPMD_PORT: u16 = 4369;
pub const EPMD_PORT_NAME: &str = "epmd";
pub const MANAGEMENT_PORT: u16 = 15672;
pub const MANAGEMENT_PORT_NAME: &str = "http";
pub const DISTRIBUTION_PORT: u16 = 25672;
pub const DISTRIBUTION_PORT_NAME: &str = "dist";
pub const PROMETHEUS_PORT_NAME: &str = "prometheus";

pub const MIN_REPLICAS: u16 = 1;
pub const MAX_REPLICAS: u16 = 10;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display(
        "replica count {replicas} is outside of the supported range [{MIN_REPLICAS}, {MAX_REPLICAS}]"
    ))]
    InvalidReplicas { replicas: u16 },

    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,
}

/// A RabbitMQ cluster running as a StatefulSet, with its policies and management users kept in
/// sync with this declaration.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "rabbitmq.stackable.tech",
    version = "v1alpha1",
    kind = "RabbitmqCluster",
    plural = "rabbitmqclusters",
    shortname = "rmq",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqClusterSpec {
    /// Number of RabbitMQ nodes, between 1 and 10.
    #[schemars(range(min = 1, max = 10))]
    pub replicas: u16,

    /// The RabbitMQ image to run.
    pub image: RabbitmqImage,

    /// The vhost created on first boot. Policies without an explicit vhost are applied here.
    /// Defaults to `/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_vhost: Option<String>,

    /// Absolute memory high watermark in bytes. When unset, half of the pod memory limit is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_high_watermark: Option<String>,

    /// Fraction of the high watermark at which messages are paged to disk, `0.8` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_high_watermark_paging_ratio: Option<String>,

    #[serde(default)]
    pub hipe_compile: bool,

    #[serde(default)]
    pub ssl: RabbitmqSsl,

    #[serde(default)]
    pub auth: RabbitmqAuth,

    /// Additional environment variables for the RabbitMQ container.
    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub pod_requests: BTreeMap<String, Quantity>,

    #[serde(default)]
    pub pod_limits: BTreeMap<String, Quantity>,

    /// Size of the persistent data volume of every node.
    pub volume_size: Quantity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default)]
    pub cluster_formation: ClusterFormation,

    /// Plugins enabled in addition to the built-in set.
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Policies that must exist on the cluster. Policies not listed here are removed.
    #[serde(default)]
    pub policies: Vec<RabbitmqPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Port of the Prometheus exporter sidecar, `0` disables the exporter.
    #[serde(default)]
    pub prometheus_exporter_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_exporter_image: Option<RabbitmqImage>,

    /// Create a `ServiceMonitor` for the Prometheus exporter.
    #[serde(default)]
    pub use_service_monitor: bool,

    /// Name of an existing Secret mapping usernames to passwords. Defaults to
    /// `<cluster name>-credentials`, which is created empty if missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_credentials: Option<String>,

    /// Name of an existing Secret holding the operator's own credentials
    /// (`username`, `password` and `cookie`). Defaults to `<cluster name>-service-account`,
    /// which is generated if missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_service_account: Option<String>,

    /// Delete the PersistentVolumeClaims of the cluster when it is deleted.
    #[serde(default)]
    pub purge_pvc_on_delete: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetConfig>,

    /// Tags assigned to the users from the credentials Secret, e.g. `administrator` or
    /// `management`. Falls back to the operator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_user_tags: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqImage {
    pub name: String,
    pub tag: String,
}

impl RabbitmqImage {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqSsl {
    #[serde(default)]
    pub enabled: bool,
    /// Secret containing the certificate files, mounted to `/etc/rabbitmq/ssl`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqAuth {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mechanisms: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFormation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_discovery_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_type: Option<String>,
    /// Seconds between checks for unknown nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_cleanup_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_handling: Option<String>,
}

/// A RabbitMQ policy, identified by its vhost and name.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitmqPolicy {
    /// Defaults to the default vhost of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost: Option<String>,
    pub name: String,
    /// Regular expression matching the queue or exchange names the policy applies to.
    pub pattern: String,
    #[serde(default)]
    pub definition: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_apply_to")]
    pub apply_to: String,
}

fn default_apply_to() -> String {
    DEFAULT_APPLY_TO.to_string()
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

impl RabbitmqCluster {
    pub fn validate(&self) -> Result<(), Error> {
        let replicas = self.spec.replicas;
        ensure!(
            (MIN_REPLICAS..=MAX_REPLICAS).contains(&replicas),
            InvalidReplicasSnafu { replicas }
        );
        Ok(())
    }

    pub fn namespace_or_error(&self) -> Result<String, Error> {
        self.namespace().context(ObjectHasNoNamespaceSnafu)
    }

    /// The vhost policies fall back to, `/` unless configured otherwise.
    pub fn default_vhost(&self) -> &str {
        match self.spec.default_vhost.as_deref() {
            Some(vhost) if !vhost.is_empty() => vhost,
            _ => DEFAULT_VHOST,
        }
    }

    pub fn service_account_secret_name(&self) -> String {
        match &self.spec.secret_service_account {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}-service-account", self.name_any()),
        }
    }

    pub fn credentials_secret_name(&self) -> String {
        match &self.spec.secret_credentials {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{}-credentials", self.name_any()),
        }
    }

    /// Whether the service account Secret was named explicitly and is therefore managed
    /// outside of this cluster.
    pub fn service_account_secret_is_linked(&self) -> bool {
        self.spec
            .secret_service_account
            .as_deref()
            .is_some_and(|name| !name.is_empty())
    }

    pub fn credentials_secret_is_linked(&self) -> bool {
        self.spec
            .secret_credentials
            .as_deref()
            .is_some_and(|name| !name.is_empty())
    }

    /// The headless Service giving every node a stable DNS name.
    pub fn discovery_service_name(&self) -> String {
        format!("{}-discovery", self.name_any())
    }

    pub fn management_service_name(&self) -> String {
        format!("{}-api", self.name_any())
    }

    pub fn prometheus_service_name(&self) -> String {
        format!("{}-prometheus", self.name_any())
    }

    pub fn prometheus_exporter_enabled(&self) -> bool {
        self.spec.prometheus_exporter_port != 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    pub fn cluster_from_yaml(yaml: &str) -> RabbitmqCluster {
        serde_yaml::from_str(yaml).expect("invalid test input")
    }

    pub fn minimal_cluster() -> RabbitmqCluster {
        cluster_from_yaml(indoc! {r#"
            apiVersion: rabbitmq.stackable.tech/v1alpha1
            kind: RabbitmqCluster
            metadata:
              name: rmq-test
              namespace: default
              uid: 6e2a5f1c-5a1b-4d7e-9a63-0d4c2b3a9f10
            spec:
              replicas: 3
              image:
                name: rabbitmq
                tag: 3.13-management
              volumeSize: 1Gi
        "#})
    }

    #[test]
    fn test_minimal_cluster_defaults() {
        let rabbitmq = minimal_cluster();
        assert_eq!(rabbitmq.default_vhost(), "/");
        assert_eq!(
            rabbitmq.service_account_secret_name(),
            "rmq-test-service-account"
        );
        assert_eq!(rabbitmq.credentials_secret_name(), "rmq-test-credentials");
        assert!(!rabbitmq.service_account_secret_is_linked());
        assert!(!rabbitmq.credentials_secret_is_linked());
        assert!(!rabbitmq.prometheus_exporter_enabled());
        assert_eq!(rabbitmq.spec.image.reference(), "rabbitmq:3.13-management");
        rabbitmq.validate().unwrap();
    }

    #[test]
    fn test_linked_secret_names() {
        let mut rabbitmq = minimal_cluster();
        rabbitmq.spec.secret_service_account = Some("shared-sa".to_string());
        rabbitmq.spec.secret_credentials = Some(String::new());
        assert_eq!(rabbitmq.service_account_secret_name(), "shared-sa");
        assert!(rabbitmq.service_account_secret_is_linked());
        assert_eq!(rabbitmq.credentials_secret_name(), "rmq-test-credentials");
        assert!(!rabbitmq.credentials_secret_is_linked());
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(10, true)]
    #[case(11, false)]
    fn test_replica_bounds(#[case] replicas: u16, #[case] valid: bool) {
        let mut rabbitmq = minimal_cluster();
        rabbitmq.spec.replicas = replicas;
        assert_eq!(rabbitmq.validate().is_ok(), valid);
    }

    #[rstest]
    #[case(None, "/")]
    #[case(Some(""), "/")]
    #[case(Some("dts"), "dts")]
    fn test_default_vhost(#[case] configured: Option<&str>, #[case] expected: &str) {
        let mut rabbitmq = minimal_cluster();
        rabbitmq.spec.default_vhost = configured.map(str::to_string);
        assert_eq!(rabbitmq.default_vhost(), expected);
    }

    #[test]
    fn test_policy_definition_keeps_json_values() {
        let policy: RabbitmqPolicy = serde_yaml::from_str(indoc! {r#"
            name: ha-three
            pattern: ".*"
            definition:
              ha-mode: exactly
              ha-params: 3
        "#})
        .unwrap();
        assert_eq!(policy.apply_to, "all");
        assert_eq!(policy.priority, 0);
        assert_eq!(policy.vhost, None);
        assert_eq!(policy.definition["ha-params"], serde_json::json!(3));
    }
}
